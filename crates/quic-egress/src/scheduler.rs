//! # Frame scheduling
//!
//! A scheduler decides what goes into one packet. The transmit loop only
//! relies on [`PacketScheduler`]; this module also ships the schedulers the
//! higher-level writers use:
//!
//! - [`FrameScheduler`]: pending control frames, crypto and stream data,
//!   filtered by a [`FrameSelection`].
//! - [`CloningScheduler`]: defers to an inner scheduler, otherwise re-sends
//!   the content of an outstanding packet under its packet event (probes).
//! - [`PmtuProbeScheduler`]: one PING padded to the probe size.
//!
//! Schedulers read the connection; they never mutate it. Everything a sent
//! frame changes is applied afterwards by the ledger.

use std::time::Duration;

use bytes::Bytes;
use tracing::trace;

use crate::builder::{write_crypto_frame, write_frame, write_stream_frame, PacketBuilder};
use crate::frame::{
    DataBlockedFrame, MaxDataFrame, MaxStreamDataFrame, SimpleFrame, WriteAckFrame, WriteFrame,
};
use crate::header::PacketHeader;
use crate::state::{ConnectionState, OutstandingPacket};
use crate::stream::SendStreamBuffers;
use crate::types::{EncryptionLevel, PacketEvent, PacketNumberSpace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedulingResult {
    /// Set when the packet re-sends an earlier packet's content.
    pub packet_event: Option<PacketEvent>,
}

pub trait PacketScheduler {
    fn name(&self) -> &str;

    fn has_data(&self, conn: &ConnectionState) -> bool;

    /// Fill `builder` with at most `writable_bytes` of frames. `None` or an
    /// empty frame list means nothing fit.
    fn schedule_frames_for_packet(
        &mut self,
        conn: &ConnectionState,
        builder: &mut dyn PacketBuilder,
        writable_bytes: u64,
    ) -> Option<SchedulingResult>;
}

// ─── Budgeted Builder ───────────────────────────────────────────────────────

/// Caps a builder's remaining space at the writable budget.
struct BudgetedBuilder<'a> {
    inner: &'a mut dyn PacketBuilder,
    diff: usize,
}

impl<'a> BudgetedBuilder<'a> {
    fn new(inner: &'a mut dyn PacketBuilder, writable_bytes: u64) -> Self {
        let remaining = inner.remaining_space();
        let writable = usize::try_from(writable_bytes).unwrap_or(usize::MAX);
        BudgetedBuilder {
            inner,
            diff: remaining.saturating_sub(writable),
        }
    }
}

impl PacketBuilder for BudgetedBuilder<'_> {
    fn header(&self) -> &PacketHeader {
        self.inner.header()
    }

    fn remaining_space(&self) -> usize {
        self.inner.remaining_space().saturating_sub(self.diff)
    }

    fn write_bytes(&mut self, data: &[u8]) {
        self.inner.write_bytes(data)
    }

    fn insert_bytes(&mut self, data: Bytes) {
        self.inner.insert_bytes(data)
    }

    fn push_frame(&mut self, frame: WriteFrame) {
        self.inner.push_frame(frame)
    }

    fn frames(&self) -> &[WriteFrame] {
        self.inner.frames()
    }
}

// ─── Frame Selection ────────────────────────────────────────────────────────

/// Which frame kinds a [`FrameScheduler`] may emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSelection {
    pub name: &'static str,
    pub level: EncryptionLevel,
    pub space: PacketNumberSpace,
    pub stream: bool,
    pub crypto: bool,
    pub ack: bool,
    pub reset: bool,
    pub window_update: bool,
    pub blocked: bool,
    pub simple: bool,
    pub ping: bool,
}

impl FrameSelection {
    pub fn new(name: &'static str, level: EncryptionLevel, space: PacketNumberSpace) -> Self {
        FrameSelection {
            name,
            level,
            space,
            stream: false,
            crypto: false,
            ack: false,
            reset: false,
            window_update: false,
            blocked: false,
            simple: false,
            ping: false,
        }
    }

    pub fn stream_frames(mut self) -> Self {
        self.stream = true;
        self
    }

    pub fn crypto_frames(mut self) -> Self {
        self.crypto = true;
        self
    }

    pub fn ack_frames(mut self) -> Self {
        self.ack = true;
        self
    }

    pub fn reset_frames(mut self) -> Self {
        self.reset = true;
        self
    }

    pub fn window_update_frames(mut self) -> Self {
        self.window_update = true;
        self
    }

    pub fn blocked_frames(mut self) -> Self {
        self.blocked = true;
        self
    }

    pub fn simple_frames(mut self) -> Self {
        self.simple = true;
        self
    }

    pub fn ping_frames(mut self) -> Self {
        self.ping = true;
        self
    }
}

// ─── Frame Scheduler ────────────────────────────────────────────────────────

pub struct FrameScheduler {
    selection: FrameSelection,
}

impl FrameScheduler {
    pub fn new(selection: FrameSelection) -> Self {
        FrameScheduler { selection }
    }

    fn crypto_stream<'c>(&self, conn: &'c ConnectionState) -> Option<&'c SendStreamBuffers> {
        conn.crypto_streams.for_level(self.selection.level)
    }

    fn has_crypto_data(&self, conn: &ConnectionState) -> bool {
        self.crypto_stream(conn)
            .is_some_and(|s| !s.write_buffer.is_empty() || !s.loss_buffer.is_empty())
    }

    fn has_stream_data(conn: &ConnectionState) -> bool {
        conn.streams.has_loss()
            || (conn.streams.has_new_data_writable() && conn.flow_control.send_window_available() > 0)
    }

    fn write_crypto(&self, conn: &ConnectionState, builder: &mut dyn PacketBuilder) -> bool {
        let Some(stream) = self.crypto_stream(conn) else {
            return false;
        };
        let mut wrote = false;
        for lost in &stream.loss_buffer {
            let data = lost.data.peek(lost.data.len());
            match write_crypto_frame(builder, lost.offset, data) {
                Some(_) => wrote = true,
                None => return wrote,
            }
        }
        if !stream.write_buffer.is_empty() {
            let data = stream.write_buffer.peek(stream.write_buffer.len());
            wrote |= write_crypto_frame(builder, stream.current_write_offset, data).is_some();
        }
        wrote
    }

    fn write_acks(&self, conn: &ConnectionState, builder: &mut dyn PacketBuilder) {
        let ack_state = conn.ack_state(self.selection.space);
        if !ack_state.has_acks_to_schedule() {
            return;
        }
        let frame = WriteAckFrame {
            ack_blocks: ack_state.acks.clone(),
            ack_delay: Duration::ZERO,
        };
        if write_frame(WriteFrame::Ack(frame), builder) == 0 && ack_state.acks.len() > 1 {
            // Largest range only.
            let frame = WriteAckFrame {
                ack_blocks: ack_state.acks[..1].to_vec(),
                ack_delay: Duration::ZERO,
            };
            write_frame(WriteFrame::Ack(frame), builder);
        }
    }

    fn write_resets(conn: &ConnectionState, builder: &mut dyn PacketBuilder) {
        for reset in conn.pending_events.resets.values() {
            if write_frame(WriteFrame::RstStream(*reset), builder) == 0 {
                return;
            }
        }
    }

    fn write_window_updates(conn: &ConnectionState, builder: &mut dyn PacketBuilder) {
        if conn.pending_events.conn_window_update {
            let frame = MaxDataFrame {
                maximum_data: conn.flow_control.sum_cur_read_offset
                    + conn.flow_control.window_size,
            };
            if write_frame(WriteFrame::MaxData(frame), builder) == 0 {
                return;
            }
        }
        for id in conn.streams.window_updates() {
            let Some(stream) = conn.streams.get_stream(id) else {
                continue;
            };
            let frame = MaxStreamDataFrame {
                stream_id: id,
                maximum_data: stream.flow_control.max_stream_data_to_advertise(),
            };
            if write_frame(WriteFrame::MaxStreamData(frame), builder) == 0 {
                return;
            }
        }
    }

    fn write_blocked(conn: &ConnectionState, builder: &mut dyn PacketBuilder) {
        if conn.pending_events.send_data_blocked {
            let frame = DataBlockedFrame {
                data_limit: conn.flow_control.peer_advertised_max_offset,
            };
            if write_frame(WriteFrame::DataBlocked(frame), builder) == 0 {
                return;
            }
        }
        for blocked in conn.streams.blocked() {
            if write_frame(WriteFrame::StreamDataBlocked(*blocked), builder) == 0 {
                return;
            }
        }
    }

    fn write_simple(conn: &ConnectionState, builder: &mut dyn PacketBuilder) {
        if let Some(path_data) = conn.pending_events.path_challenge {
            let frame = SimpleFrame::PathChallenge { path_data };
            write_frame(WriteFrame::Simple(frame), builder);
        }
        for frame in &conn.pending_events.frames {
            if write_frame(WriteFrame::Simple(frame.clone()), builder) == 0 {
                return;
            }
        }
    }

    /// Lost ranges first, then new data within flow control. One frame per
    /// stream per packet.
    fn write_streams(conn: &ConnectionState, builder: &mut dyn PacketBuilder) {
        for id in conn.streams.loss_streams() {
            let Some(lost) = conn
                .streams
                .get_stream(id)
                .and_then(|s| s.send.loss_buffer.first())
            else {
                continue;
            };
            let data = lost.data.peek(lost.data.len());
            if write_stream_frame(builder, id, lost.offset, data, lost.eof).is_none() {
                return;
            }
        }

        let mut conn_window = conn.flow_control.send_window_available();
        for id in conn.streams.writable_streams() {
            let Some(stream) = conn.streams.get_stream(id) else {
                continue;
            };
            let allowed = stream.send_window_available().min(conn_window);
            let len = (stream.send.write_buffer.len() as u64).min(allowed) as usize;
            let offset = stream.send.current_write_offset;
            let fin = stream.send.final_write_offset == Some(offset + len as u64);
            if len == 0 && !fin {
                continue;
            }
            let data = stream.send.write_buffer.peek(len);
            match write_stream_frame(builder, id, offset, data, fin) {
                Some(frame) => conn_window -= frame.len,
                None => return,
            }
        }
    }
}

impl PacketScheduler for FrameScheduler {
    fn name(&self) -> &str {
        self.selection.name
    }

    fn has_data(&self, conn: &ConnectionState) -> bool {
        let sel = &self.selection;
        let pending = &conn.pending_events;
        (sel.crypto && self.has_crypto_data(conn))
            || (sel.ack && conn.ack_state(sel.space).has_acks_to_schedule())
            || (sel.reset && !pending.resets.is_empty())
            || (sel.window_update && (pending.conn_window_update || conn.streams.has_window_updates()))
            || (sel.blocked && (pending.send_data_blocked || conn.streams.has_blocked()))
            || (sel.simple && (pending.path_challenge.is_some() || !pending.frames.is_empty()))
            || (sel.ping && pending.send_ping)
            || (sel.stream && Self::has_stream_data(conn))
    }

    fn schedule_frames_for_packet(
        &mut self,
        conn: &ConnectionState,
        builder: &mut dyn PacketBuilder,
        writable_bytes: u64,
    ) -> Option<SchedulingResult> {
        let mut builder = BudgetedBuilder::new(builder, writable_bytes);
        let sel = self.selection.clone();

        if sel.crypto {
            self.write_crypto(conn, &mut builder);
        }
        if sel.ack {
            self.write_acks(conn, &mut builder);
        }
        if sel.reset {
            Self::write_resets(conn, &mut builder);
        }
        if sel.window_update {
            Self::write_window_updates(conn, &mut builder);
        }
        if sel.blocked {
            Self::write_blocked(conn, &mut builder);
        }
        if sel.simple {
            Self::write_simple(conn, &mut builder);
        }
        if sel.ping && conn.pending_events.send_ping {
            write_frame(WriteFrame::Ping, &mut builder);
        }
        if sel.stream {
            Self::write_streams(conn, &mut builder);
        }
        Some(SchedulingResult::default())
    }
}

// ─── Cloning Scheduler ──────────────────────────────────────────────────────

/// Probe scheduler: fresh data if the inner scheduler has any, otherwise a
/// copy of the oldest outstanding packet in the builder's space.
pub struct CloningScheduler {
    inner: Box<dyn PacketScheduler>,
    name: String,
}

impl CloningScheduler {
    pub fn new(inner: Box<dyn PacketScheduler>, name: impl Into<String>) -> Self {
        CloningScheduler {
            inner,
            name: name.into(),
        }
    }

    /// Re-write what is still in flight from `packet`. Acks and padding are
    /// never cloned; acked or lost stream ranges are skipped.
    fn rebuild(conn: &ConnectionState, packet: &OutstandingPacket, builder: &mut dyn PacketBuilder) -> bool {
        let level = packet.packet.header.protection_type().encryption_level();
        let mut wrote_any = false;
        for frame in &packet.packet.frames {
            let written = match frame {
                WriteFrame::Stream(f) => {
                    let Some(buf) = conn
                        .streams
                        .get_stream(f.stream_id)
                        .and_then(|s| s.send.retransmission_buffer.get(&f.offset))
                    else {
                        continue;
                    };
                    let data = buf.data.peek(f.len as usize);
                    write_stream_frame(builder, f.stream_id, f.offset, data, f.fin).is_some()
                }
                WriteFrame::Crypto(f) => {
                    let Some(buf) = conn
                        .crypto_streams
                        .for_level(level)
                        .and_then(|s| s.retransmission_buffer.get(&f.offset))
                    else {
                        continue;
                    };
                    let data = buf.data.peek(f.len as usize);
                    write_crypto_frame(builder, f.offset, data).is_some()
                }
                WriteFrame::Ack(_) | WriteFrame::Padding { .. } => continue,
                other => write_frame(other.clone(), builder) > 0,
            };
            if !written {
                break;
            }
            wrote_any = true;
        }
        wrote_any
    }
}

impl PacketScheduler for CloningScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_data(&self, conn: &ConnectionState) -> bool {
        self.inner.has_data(conn) || conn.outstandings.packets.iter().any(|p| !p.is_dsr)
    }

    fn schedule_frames_for_packet(
        &mut self,
        conn: &ConnectionState,
        builder: &mut dyn PacketBuilder,
        writable_bytes: u64,
    ) -> Option<SchedulingResult> {
        if self.inner.has_data(conn) {
            return self
                .inner
                .schedule_frames_for_packet(conn, builder, writable_bytes);
        }
        let space = builder.header().packet_number_space();
        let mut builder = BudgetedBuilder::new(builder, writable_bytes);
        for packet in conn.outstandings.in_space(space).filter(|p| !p.is_dsr) {
            let event = match packet.associated_event {
                Some(event) if !conn.outstandings.packet_events.contains(&event) => continue,
                Some(event) => event,
                None => PacketEvent::new(space, packet.packet_num()),
            };
            if Self::rebuild(conn, packet, &mut builder) {
                trace!(pn = packet.packet_num(), %space, "cloned outstanding packet");
                return Some(SchedulingResult {
                    packet_event: Some(event),
                });
            }
        }
        None
    }
}

// ─── PMTU Probe Scheduler ───────────────────────────────────────────────────

/// A single PING padded to fill the probe-sized packet.
pub struct PmtuProbeScheduler {
    probe_size: usize,
    probe_sent: bool,
}

impl PmtuProbeScheduler {
    pub fn new(probe_size: usize) -> Self {
        PmtuProbeScheduler {
            probe_size,
            probe_sent: false,
        }
    }
}

impl PacketScheduler for PmtuProbeScheduler {
    fn name(&self) -> &str {
        "PmtuProbeScheduler"
    }

    fn has_data(&self, _conn: &ConnectionState) -> bool {
        !self.probe_sent
    }

    fn schedule_frames_for_packet(
        &mut self,
        _conn: &ConnectionState,
        builder: &mut dyn PacketBuilder,
        writable_bytes: u64,
    ) -> Option<SchedulingResult> {
        if self.probe_sent {
            return None;
        }
        let mut builder = BudgetedBuilder::new(builder, writable_bytes);
        if write_frame(WriteFrame::Ping, &mut builder) == 0 {
            return None;
        }
        let padding = builder.remaining_space();
        if padding > 0 {
            write_frame(WriteFrame::Padding { len: padding }, &mut builder);
        }
        trace!(probe_size = self.probe_size, padding, "scheduled pmtu probe");
        self.probe_sent = true;
        Some(SchedulingResult::default())
    }
}

// ─── Factory ────────────────────────────────────────────────────────────────

/// Source of schedulers for the higher-level writers.
pub trait SchedulerFactory {
    fn frame_scheduler(&self, selection: FrameSelection) -> Box<dyn PacketScheduler>;

    fn cloning_scheduler(
        &self,
        inner: Box<dyn PacketScheduler>,
        name: &str,
    ) -> Box<dyn PacketScheduler> {
        Box::new(CloningScheduler::new(inner, name))
    }

    fn pmtu_probe_scheduler(&self, probe_size: usize) -> Box<dyn PacketScheduler> {
        Box::new(PmtuProbeScheduler::new(probe_size))
    }
}

/// Builds the schedulers in this module.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSchedulerFactory;

impl SchedulerFactory for DefaultSchedulerFactory {
    fn frame_scheduler(&self, selection: FrameSelection) -> Box<dyn PacketScheduler> {
        Box::new(FrameScheduler::new(selection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::RegularPacketBuilder;
    use crate::frame::AckBlock;
    use crate::test_util::{short_header, test_conn};
    use crate::stream::StreamState;

    fn app_selection() -> FrameSelection {
        FrameSelection::new("FrameScheduler", EncryptionLevel::AppData, PacketNumberSpace::AppData)
            .stream_frames()
            .ack_frames()
            .simple_frames()
            .ping_frames()
    }

    #[test]
    fn budget_caps_stream_frame() {
        let mut conn = test_conn();
        conn.flow_control.peer_advertised_max_offset = 1 << 20;
        let mut stream = StreamState::new(0, 1 << 20);
        stream.send.write(Bytes::from(vec![1u8; 2000]), false);
        conn.streams.insert(stream);
        conn.streams.update_writable_streams(0);

        let mut scheduler = FrameScheduler::new(app_selection());
        assert!(scheduler.has_data(&conn));
        let mut builder = RegularPacketBuilder::new(1252, short_header(0), None);
        builder.account_for_cipher_overhead(16);
        scheduler.schedule_frames_for_packet(&conn, &mut builder, 500).unwrap();
        match &builder.frames()[0] {
            WriteFrame::Stream(f) => assert!(f.len < 500 && f.len > 480),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn connection_window_limits_new_data() {
        let mut conn = test_conn();
        conn.flow_control.peer_advertised_max_offset = 10;
        let mut stream = StreamState::new(0, 1000);
        stream.send.write(Bytes::from(vec![1u8; 100]), false);
        conn.streams.insert(stream);
        conn.streams.update_writable_streams(0);

        let mut scheduler = FrameScheduler::new(app_selection());
        let mut builder = RegularPacketBuilder::new(1252, short_header(0), None);
        scheduler.schedule_frames_for_packet(&conn, &mut builder, 1200).unwrap();
        match &builder.frames()[0] {
            WriteFrame::Stream(f) => assert_eq!(f.len, 10),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn acks_then_ping() {
        let mut conn = test_conn();
        conn.ack_states.app_data.acks.push(AckBlock { start: 0, end: 3 });
        conn.pending_events.send_ping = true;
        let mut scheduler = FrameScheduler::new(app_selection());
        let mut builder = RegularPacketBuilder::new(1252, short_header(0), None);
        scheduler.schedule_frames_for_packet(&conn, &mut builder, 1200).unwrap();
        assert!(matches!(builder.frames()[0], WriteFrame::Ack(_)));
        assert_eq!(builder.frames()[1], WriteFrame::Ping);
    }

    #[test]
    fn selection_filters_has_data() {
        let mut conn = test_conn();
        conn.pending_events.send_ping = true;
        let no_ping = FrameScheduler::new(
            FrameSelection::new("acks", EncryptionLevel::AppData, PacketNumberSpace::AppData)
                .ack_frames(),
        );
        assert!(!no_ping.has_data(&conn));
    }

    #[test]
    fn pmtu_probe_fills_packet_once() {
        let conn = test_conn();
        let mut scheduler = PmtuProbeScheduler::new(1400);
        let mut builder = RegularPacketBuilder::new(1400, short_header(0), None);
        builder.account_for_cipher_overhead(16);
        scheduler.schedule_frames_for_packet(&conn, &mut builder, u64::MAX).unwrap();
        assert_eq!(builder.remaining_space(), 0);
        assert!(!scheduler.has_data(&conn));
        assert!(scheduler
            .schedule_frames_for_packet(&conn, &mut builder, u64::MAX)
            .is_none());
    }
}
