//! # quic-egress
//!
//! The outbound half of a QUIC connection: decide whether to send, pack the
//! next datagram, encrypt it, batch it onto the wire and record what is now
//! in flight.
//!
//! Pure logic with no real sockets: the pipeline writes through the
//! [`batch::DatagramSocket`] trait; `quic-egress-net` provides the UDP
//! implementation.
//!
//! ## Crate structure
//!
//! - `types`: packet-number spaces, connection ids, packet events
//! - `codec`: QUIC variable-length integers
//! - `header`: long/short header encoding and packet-number truncation
//! - `frame`: write frames and their wire encoding
//! - `crypto`: AEAD and header-protection traits, ChaCha20 implementations
//! - `arena`: the reused send buffer and its obtain/release discipline
//! - `builder`: in-place and chained packet builders
//! - `stream`: per-stream send buffers (write / retransmission / loss)
//! - `state`: the connection aggregate the pipeline mutates
//! - `happy_eyeballs`: primary/secondary socket eligibility
//! - `congestion`: congestion controller, pacer and path-validation limiter seams
//! - `scheduler`: frame scheduler contract and scheduler factory
//! - `budget`: writable-bytes calculation
//! - `batch`: batch writers and the dual-socket flush
//! - `assembler`: build, schedule, encrypt and enqueue, two buffer strategies
//! - `ledger`: post-send connection and stream bookkeeping
//! - `transmit`: the transmit loop
//! - `writers`: per-space entry points and connection close
//! - `write_reason`: the "anything to write?" decision
//! - `stats`: observability callbacks and metrics sink
//! - `config`: transport settings and TOML loading
//! - `error`: connection, crypto and config errors

pub mod arena;
pub mod assembler;
pub mod batch;
pub mod budget;
pub mod builder;
pub mod codec;
pub mod config;
pub mod congestion;
pub mod crypto;
pub mod error;
pub mod frame;
pub mod happy_eyeballs;
pub mod header;
pub mod ledger;
pub mod scheduler;
pub mod state;
pub mod stats;
pub mod stream;
pub mod transmit;
pub mod types;
pub mod write_reason;
pub mod writers;

#[cfg(test)]
pub(crate) mod test_util;

pub use error::{ConnectionError, QuicErrorCode};
pub use state::ConnectionState;
pub use transmit::write_connection_data_to_socket;
pub use write_reason::{should_write_data, WriteDataReason};
