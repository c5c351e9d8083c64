//! # Transmit loop
//!
//! [`write_connection_data_to_socket`] drives one pass: allocate a packet
//! number, build its header, assemble, record, repeat. The loop keeps going
//! while the scheduler has data and
//!
//! - fewer than `packet_limit` packets went out, and
//! - either fewer than one batch went out or the pass is still inside its
//!   share of the smoothed RTT.
//!
//! A build failure or a failed flush ends the pass. Every exit forces a final
//! flush so nothing is left in a deferred batch.

use bytes::Bytes;
use quanta::Instant;
use tracing::{debug, trace};

use crate::assembler::{DataPathResult, PacketAssembler, SealingParams};
use crate::batch::{FlushMode, IoBufBatch, SocketPair};
use crate::budget::WritableBytesFn;
use crate::config::DataPathType;
use crate::crypto::{Aead, PacketNumberCipher};
use crate::error::ConnectionError;
use crate::header::HeaderBuilder;
use crate::ledger::update_connection;
use crate::scheduler::PacketScheduler;
use crate::state::ConnectionState;
use crate::stats::{NoWriteReason, WritePhase};
use crate::types::{ConnectionId, PacketNumberSpace, QuicVersion};

/// Everything that stays fixed for the packets of one pass.
pub struct PacketContext<'a> {
    pub src_conn_id: ConnectionId,
    pub dst_conn_id: ConnectionId,
    pub header_builder: HeaderBuilder,
    pub aead: &'a dyn Aead,
    pub header_cipher: &'a dyn PacketNumberCipher,
    pub version: QuicVersion,
    /// Initial packets only.
    pub token: Bytes,
    /// Datagram size for this pass; larger than the connection's for PMTU probes.
    pub max_packet_len: usize,
}

impl<'a> PacketContext<'a> {
    pub fn new(
        conn: &ConnectionState,
        src_conn_id: ConnectionId,
        dst_conn_id: ConnectionId,
        header_builder: HeaderBuilder,
        aead: &'a dyn Aead,
        header_cipher: &'a dyn PacketNumberCipher,
    ) -> Self {
        PacketContext {
            src_conn_id,
            dst_conn_id,
            header_builder,
            aead,
            header_cipher,
            version: conn.version,
            token: Bytes::new(),
            max_packet_len: conn.udp_send_packet_len,
        }
    }

    pub fn with_token(mut self, token: Bytes) -> Self {
        self.token = token;
        self
    }

    pub fn with_max_packet_len(mut self, max_packet_len: usize) -> Self {
        self.max_packet_len = max_packet_len;
        self
    }

    pub fn space(&self) -> PacketNumberSpace {
        self.header_builder.packet_number_space()
    }
}

/// Past one batch, keep writing only within `srtt / write_limit_rtt_fraction`
/// of the start of the pass. No RTT sample means no time limit.
pub fn write_loop_time_limit(conn: &ConnectionState, begin: Instant) -> bool {
    let srtt = conn.loss_state.srtt;
    if srtt.is_zero() {
        return true;
    }
    let fraction = conn.settings.write_limit_rtt_fraction.max(1);
    Instant::now().saturating_duration_since(begin) < srtt / fraction
}

fn record_phase(conn: &ConnectionState, phase: WritePhase, started: Instant) {
    if let Some(metrics) = conn.metrics.as_ref() {
        metrics.record(phase, Instant::now().saturating_duration_since(started));
    }
}

/// Run one transmit pass and return the number of packets built.
///
/// `Err` means the connection must close; everything else, including a
/// retriable socket failure, is reported through the count.
pub fn write_connection_data_to_socket(
    sockets: SocketPair<'_>,
    conn: &mut ConnectionState,
    ctx: &PacketContext<'_>,
    scheduler: &mut dyn PacketScheduler,
    writable_bytes: WritableBytesFn,
    packet_limit: u64,
) -> Result<u64, ConnectionError> {
    let space = ctx.space();
    trace!(scheduler = scheduler.name(), node = %conn.node_type, %space, "writing data");

    let settings = conn.settings.clone();
    let mut batch = IoBufBatch::new(sockets, &settings);
    let assembler = PacketAssembler::from_settings(&settings);
    let keys = SealingParams {
        aead: ctx.aead,
        header_cipher: ctx.header_cipher,
        max_packet_len: ctx.max_packet_len,
    };

    if conn.loop_detector.is_some() {
        conn.write_debug_state.scheduler_name = scheduler.name().to_owned();
        conn.write_debug_state.no_write_reason = if scheduler.has_data(conn) {
            NoWriteReason::WriteOk
        } else {
            NoWriteReason::EmptyScheduler
        };
    }
    conn.write_count += 1;

    let begin = Instant::now();
    let batch_size = settings.batch_size();
    let overhead = ctx.aead.cipher_overhead() as u64;

    let result = loop {
        let pkt_sent = batch.pkt_sent();
        if !scheduler.has_data(conn)
            || pkt_sent >= packet_limit
            || (pkt_sent >= batch_size && !write_loop_time_limit(conn, begin))
        {
            break Ok(());
        }

        let packet_num = conn.next_packet_num(space);
        let header = ctx.header_builder.build(
            &ctx.src_conn_id,
            &ctx.dst_conn_id,
            packet_num,
            ctx.version,
            &ctx.token,
        );
        let packet_len = ctx.max_packet_len as u64;
        let budget = writable_bytes(conn).map_or(packet_len, |bytes| bytes.min(packet_len));
        let budget = budget.saturating_sub(overhead);

        let built = match assembler.build_schedule_encrypt(
            conn, &mut batch, scheduler, header, budget, &keys,
        ) {
            Ok(DataPathResult::Built(built)) => built,
            Ok(DataPathResult::BuildFailure) => break Ok(()),
            Err(err) => break Err(err),
        };

        // A built packet is recorded even if its flush failed; it counts as
        // lost in the network.
        let started = Instant::now();
        update_connection(
            conn,
            built.packet_event,
            built.packet,
            Instant::now(),
            built.encoded_size,
            false,
        );
        record_phase(conn, WritePhase::UpdateConnection, started);

        if !built.write_success {
            if conn.loop_detector.is_some() {
                conn.write_debug_state.no_write_reason = NoWriteReason::SocketFailure;
            }
            break Ok(());
        }
    };

    let started = Instant::now();
    let flushed = batch.flush(conn, FlushMode::Always);
    record_phase(conn, WritePhase::Flush, started);
    result?;
    flushed?;

    if settings.data_path_type == DataPathType::ContinuousMemory {
        assert!(conn.buf_accessor.owns_buffer(), "send buffer not released");
        assert!(conn.buf_accessor.is_empty(), "send buffer not drained");
    }

    let written = batch.pkt_sent();
    if written > 0 {
        debug!(
            written,
            scheduler = scheduler.name(),
            %space,
            "written {written} packets"
        );
    }
    Ok(written)
}
