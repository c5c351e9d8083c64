//! # quic-egress-net
//!
//! Real I/O for `quic-egress`: a non-blocking UDP socket implementing
//! [`quic_egress::batch::DatagramSocket`] and the logging bootstrap.

pub mod logging;
pub mod udp;

pub use logging::init_tracing;
pub use udp::UdpDatagramSocket;
