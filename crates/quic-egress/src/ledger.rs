//! # Post-send bookkeeping
//!
//! [`update_connection`] runs once for every packet that was built, whether
//! or not its flush reached the wire. A built packet whose write failed is
//! treated like a packet lost in the network.
//!
//! Per frame:
//!
//! | Frame                 | Effect                                                    |
//! |-----------------------|-----------------------------------------------------------|
//! | stream / crypto       | write → retransmission, or loss → retransmission, or clone |
//! | ack                   | ack-send state of the space (one per packet)              |
//! | reset / blocked       | pending entry cleared                                     |
//! | max-data / max-stream | advertised offset and time recorded                       |
//! | simple                | pending entry cleared (not for clones)                    |
//! | ping                  | `send_ping` cleared unless this is a PMTU probe           |
//! | padding               | nothing; never ack-eliciting                              |
//!
//! Ack-eliciting packets then get an outstanding record, inserted in packet
//! number order, and the congestion controller, pacer and path limiter are
//! told about the send.

use quanta::Instant;
use tracing::trace;

use crate::builder::RegularWritePacket;
use crate::frame::{SimpleFrame, WriteFrame};
use crate::state::{ConnectionState, OutstandingPacket, OutstandingPacketMetadata};
use crate::stream::{SendStreamBuffers, StreamBuffer};
use crate::types::{PacketEvent, PacketNum, PacketNumberSpace, StreamId};

/// Below this many writable bytes the connection counts as cwnd-blocked.
pub const BLOCKED_SIZE_BYTES: u64 = 20;

/// How a stream or crypto frame relates to the stream's buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamWriteKind {
    NewData,
    Retransmission,
    /// Re-send of a range still in flight; no buffer moves.
    Clone,
}

// ─── Stream Buffers ─────────────────────────────────────────────────────────

fn new_data_written(send: &mut SendStreamBuffers, offset: u64, len: u64, fin: bool) {
    let data = send.write_buffer.split_at_most(len as usize);
    debug_assert_eq!(data.len() as u64, len);
    send.current_write_offset += len + u64::from(fin);
    let previous = send
        .retransmission_buffer
        .insert(offset, StreamBuffer::new(data, offset, fin));
    assert!(previous.is_none(), "offset {offset} already in flight");
}

fn new_buf_meta_written(send: &mut SendStreamBuffers, offset: u64, len: u64, fin: bool) {
    let front = send.write_buf_meta.split(len);
    assert_eq!(front.offset, offset);
    if fin {
        assert_eq!(send.write_buf_meta.length, 0, "FIN sent with buffer meta left");
        send.write_buf_meta.offset += 1;
    }
    let previous = send.retransmission_buf_metas.insert(offset, front);
    assert!(previous.is_none(), "buffer meta at {offset} already in flight");
}

/// Returns true if the loss buffer held a range at `offset`.
fn retransmission_written(send: &mut SendStreamBuffers, offset: u64, len: u64, fin: bool) -> bool {
    let at = send.loss_buffer.partition_point(|b| b.offset < offset);
    let whole = match send.loss_buffer.get(at) {
        Some(lost) if lost.offset == offset => lost.len() == len && lost.eof == fin,
        _ => return false,
    };
    let data = if whole {
        send.loss_buffer.remove(at).data
    } else {
        let lost = &mut send.loss_buffer[at];
        assert!(lost.len() > len, "lost range shorter than the frame");
        lost.offset += len;
        lost.data.split_at_most(len as usize)
    };
    let previous = send
        .retransmission_buffer
        .insert(offset, StreamBuffer::new(data, offset, fin));
    assert!(previous.is_none(), "retransmitted offset {offset} already in flight");
    true
}

fn retransmission_buf_meta_written(
    send: &mut SendStreamBuffers,
    offset: u64,
    len: u64,
    fin: bool,
) -> bool {
    let at = send.loss_buf_metas.partition_point(|m| m.offset < offset);
    match send.loss_buf_metas.get_mut(at) {
        Some(lost) if lost.offset == offset => {
            if lost.length == len && lost.eof == fin {
                send.loss_buf_metas.remove(at);
            } else {
                assert!(lost.length > len, "lost buffer meta shorter than the frame");
                lost.length -= len;
                lost.offset += len;
            }
        }
        _ => return false,
    }
    let meta = crate::stream::WriteBufferMeta {
        offset,
        length: len,
        eof: fin,
    };
    let previous = send.retransmission_buf_metas.insert(offset, meta);
    assert!(previous.is_none(), "buffer meta at {offset} already in flight");
    true
}

/// Move the range a sent frame covers into the retransmission region.
pub fn handle_stream_written(
    send: &mut SendStreamBuffers,
    offset: u64,
    len: u64,
    fin: bool,
    from_buf_meta: bool,
) -> StreamWriteKind {
    let mut new_data = false;
    if !from_buf_meta && offset == send.current_write_offset {
        new_data_written(send, offset, len, fin);
        new_data = true;
    }
    if from_buf_meta && send.write_buf_meta.offset > 0 && offset == send.write_buf_meta.offset {
        new_buf_meta_written(send, offset, len, fin);
        new_data = true;
    }
    if new_data {
        // One stream frame per stream per packet.
        send.num_packets_tx_with_new_data += 1;
        return StreamWriteKind::NewData;
    }

    let retransmitted = if from_buf_meta {
        retransmission_buf_meta_written(send, offset, len, fin)
    } else {
        retransmission_written(send, offset, len, fin)
    };
    if retransmitted {
        StreamWriteKind::Retransmission
    } else {
        StreamWriteKind::Clone
    }
}

fn account_stream_write(conn: &mut ConnectionState, kind: StreamWriteKind, len: u64, pn: PacketNum) {
    match kind {
        StreamWriteKind::NewData => {}
        StreamWriteKind::Retransmission => {
            conn.loss_state.total_bytes_retransmitted += len;
            trace!(pn, len, "sent retransmission");
            if let Some(stats) = conn.stats() {
                stats.on_packet_retransmission();
            }
        }
        StreamWriteKind::Clone => conn.loss_state.total_stream_bytes_cloned += len,
    }
}

// ─── Flow Control ───────────────────────────────────────────────────────────

pub fn update_flow_control_on_write_to_socket(conn: &mut ConnectionState, len: u64) {
    conn.flow_control.sum_cur_write_offset += len;
}

/// Queue STREAM_DATA_BLOCKED if the stream ran out of window with data left.
pub fn maybe_write_block_after_socket_write(conn: &mut ConnectionState, id: StreamId) {
    let Some(stream) = conn.streams.get_stream(id) else {
        return;
    };
    if stream.send_window_available() == 0 && !stream.send.write_buffer.is_empty() {
        let limit = stream.flow_control.peer_advertised_max_offset;
        conn.streams.queue_blocked(id, limit);
    }
}

pub fn maybe_write_data_blocked_after_socket_write(conn: &mut ConnectionState) {
    if conn.flow_control.send_window_available() == 0 {
        conn.pending_events.send_data_blocked = true;
    }
}

pub fn on_conn_window_update_sent(conn: &mut ConnectionState, maximum_data: u64, sent_time: Instant) {
    conn.flow_control.advertised_max_offset = maximum_data;
    conn.flow_control.last_window_update_sent = Some(sent_time);
    conn.pending_events.conn_window_update = false;
}

pub fn on_stream_window_update_sent(
    conn: &mut ConnectionState,
    id: StreamId,
    maximum_data: u64,
    sent_time: Instant,
) {
    let Some(stream) = conn.streams.get_stream_mut(id) else {
        panic!("window update sent for unknown stream {id}");
    };
    stream.flow_control.advertised_max_offset = maximum_data;
    stream.flow_control.last_window_update_sent = Some(sent_time);
    conn.streams.remove_window_update(id);
}

/// Queue MAX_STREAMS frames for any stream-limit change not yet announced.
pub fn maybe_send_stream_limit_updates(conn: &mut ConnectionState) {
    let updates = conn.streams.take_stream_limit_updates();
    conn.pending_events.frames.extend(updates);
}

// ─── Acks And Simple Frames ─────────────────────────────────────────────────

pub fn update_ack_send_state_on_sent_packet_with_acks(
    conn: &mut ConnectionState,
    space: PacketNumberSpace,
    largest_ack_scheduled: PacketNum,
) {
    let ack_state = conn.ack_states.get_mut(space);
    ack_state.needs_to_send_ack_immediately = false;
    ack_state.num_rx_packets_recvd = 0;
    ack_state.num_non_rx_packets_recvd = 0;
    ack_state.largest_ack_scheduled = Some(largest_ack_scheduled);
    conn.pending_events.schedule_ack_timeout = false;
}

pub fn update_simple_frame_on_packet_sent(conn: &mut ConnectionState, frame: &SimpleFrame, now: Instant) {
    if let SimpleFrame::PathChallenge { .. } = frame {
        conn.outstanding_path_validation = conn.pending_events.path_challenge.take();
        conn.pending_events.schedule_path_validation_timeout = true;
        conn.path_challenge_start_time = Some(now);
        return;
    }
    let Some(at) = conn.pending_events.frames.iter().position(|f| f == frame) else {
        panic!("sent {frame:?} that was not pending");
    };
    conn.pending_events.frames.remove(at);
}

/// The first clone of a packet also tags the packet it was cloned from.
fn register_packet_event(conn: &mut ConnectionState, event: PacketEvent) {
    if !conn.outstandings.packet_events.insert(event) {
        return;
    }
    let source = conn
        .outstandings
        .packets
        .iter_mut()
        .find(|p| p.space() == event.space && p.packet_num() == event.packet_num);
    if let Some(source) = source {
        if source.associated_event.is_none() {
            source.associated_event = Some(event);
            conn.outstandings.cloned_packets_count += 1;
        }
    }
}

// ─── Update Connection ──────────────────────────────────────────────────────

/// Apply everything a sent packet changes.
pub fn update_connection(
    conn: &mut ConnectionState,
    packet_event: Option<PacketEvent>,
    packet: RegularWritePacket,
    sent_time: Instant,
    encoded_size: usize,
    is_dsr: bool,
) {
    let packet_num = packet.header.packet_num();
    let space = packet.header.packet_number_space();
    let protection = packet.header.protection_type();
    let is_pmtu_probe = conn.pmtu.is_probe(space, packet_num);
    let is_clone = packet_event.is_some();

    let mut retransmittable = false;
    let mut is_handshake = false;
    let mut is_ping = false;
    let mut ack_frames = 0;
    let mut conn_window_updates = 0;

    trace!(pn = packet_num, %space, size = encoded_size, "updating connection for sent packet");

    for frame in &packet.frames {
        match frame {
            WriteFrame::Stream(f) => {
                retransmittable = true;
                let Some(stream) = conn.streams.get_stream_mut(f.stream_id) else {
                    panic!("stream frame sent for unknown stream {}", f.stream_id);
                };
                let kind =
                    handle_stream_written(&mut stream.send, f.offset, f.len, f.fin, f.from_buf_meta);
                account_stream_write(conn, kind, f.len, packet_num);
                if kind == StreamWriteKind::NewData {
                    update_flow_control_on_write_to_socket(conn, f.len);
                    maybe_write_block_after_socket_write(conn, f.stream_id);
                    maybe_write_data_blocked_after_socket_write(conn);
                    conn.streams.add_tx(f.stream_id);
                }
                conn.streams.update_writable_streams(f.stream_id);
                conn.streams.update_loss_streams(f.stream_id);
            }
            WriteFrame::Crypto(f) => {
                retransmittable = true;
                // 1-RTT crypto (session tickets) is not handshake traffic.
                is_handshake = protection.is_handshake();
                let level = protection.encryption_level();
                let Some(crypto) = conn.crypto_streams.for_level_mut(level) else {
                    panic!("crypto frame sent at {level:?}");
                };
                let kind = handle_stream_written(crypto, f.offset, f.len, false, false);
                account_stream_write(conn, kind, f.len, packet_num);
            }
            WriteFrame::Ack(ack) => {
                ack_frames += 1;
                assert!(ack_frames == 1, "more than one ACK frame in packet {packet_num}");
                let Some(largest) = ack.largest_acked() else {
                    panic!("ACK frame without blocks in packet {packet_num}");
                };
                update_ack_send_state_on_sent_packet_with_acks(conn, space, largest);
            }
            WriteFrame::RstStream(f) => {
                retransmittable = true;
                if conn.pending_events.resets.remove(&f.stream_id).is_none() {
                    assert!(is_clone, "reset of stream {} was not pending", f.stream_id);
                }
            }
            WriteFrame::MaxData(f) => {
                conn_window_updates += 1;
                assert!(
                    conn_window_updates == 1,
                    "more than one MAX_DATA frame in packet {packet_num}"
                );
                retransmittable = true;
                on_conn_window_update_sent(conn, f.maximum_data, sent_time);
            }
            WriteFrame::DataBlocked(_) => {
                retransmittable = true;
                conn.pending_events.send_data_blocked = false;
            }
            WriteFrame::MaxStreamData(f) => {
                retransmittable = true;
                on_stream_window_update_sent(conn, f.stream_id, f.maximum_data, sent_time);
            }
            WriteFrame::StreamDataBlocked(f) => {
                retransmittable = true;
                conn.streams.remove_blocked(f.stream_id);
            }
            WriteFrame::Ping => {
                // The probe's own PING may be dropped with the oversized
                // packet; the application's ping request stays pending.
                if !is_pmtu_probe {
                    conn.pending_events.send_ping = false;
                }
                is_ping = true;
            }
            WriteFrame::Simple(f) => {
                retransmittable = true;
                if !is_clone {
                    update_simple_frame_on_packet_sent(conn, f, sent_time);
                }
            }
            WriteFrame::Padding { .. } => {}
            WriteFrame::ConnectionClose(_) => retransmittable = true,
        }
    }

    conn.increase_next_packet_num(space);
    conn.loss_state.largest_sent = Some(
        conn.loss_state
            .largest_sent
            .map_or(packet_num, |largest| largest.max(packet_num)),
    );
    conn.pending_events.set_loss_detection_alarm |= retransmittable;
    conn.loss_state.total_bytes_sent += encoded_size as u64;
    conn.loss_state.total_packets_sent += 1;

    if !retransmittable && !is_ping {
        debug_assert!(packet_event.is_none(), "cloned packet with nothing to clone");
        return;
    }
    conn.loss_state.total_ack_eliciting_packets_sent += 1;

    let metadata = OutstandingPacketMetadata {
        time: sent_time,
        encoded_size,
        is_handshake,
        is_pmtu_probe,
        total_bytes_sent: conn.loss_state.total_bytes_sent,
        inflight_bytes: conn.loss_state.inflight_bytes + encoded_size as u64,
        packets_inflight: conn.outstandings.num_outstanding() + 1,
        total_packets_sent: conn.loss_state.total_packets_sent,
        total_ack_eliciting_packets_sent: conn.loss_state.total_ack_eliciting_packets_sent,
        write_count: conn.write_count,
        is_app_limited: conn
            .congestion_controller
            .as_ref()
            .is_some_and(|cc| cc.is_app_limited()),
    };
    if let Some(event) = packet_event {
        register_packet_event(conn, event);
        conn.loss_state.total_bytes_cloned += encoded_size as u64;
    }
    let record = OutstandingPacket {
        packet,
        metadata,
        associated_event: packet_event,
        last_acked_packet_info: conn.loss_state.last_acked,
        is_dsr,
    };

    if is_pmtu_probe {
        conn.pmtu.outstanding_probes += 1;
        conn.pmtu.total_probes_sent += 1;
    }
    if let Some(cc) = conn.congestion_controller.as_mut() {
        cc.on_packet_sent(&record);
        let writable = cc.get_writable_bytes();
        if writable < BLOCKED_SIZE_BYTES {
            trace!(writable, cc = cc.name(), "congestion window may block");
        }
    }
    if let Some(pacer) = conn.pacer.as_mut() {
        pacer.on_packet_sent(sent_time, encoded_size);
    }
    if conn.path_validation_pending() {
        let rtt = conn.rtt_or_default();
        if let Some(limiter) = conn.path_validation_limiter.as_mut() {
            limiter.on_packet_sent(sent_time, rtt, encoded_size as u64);
        }
    }
    if is_handshake && !is_clone {
        match space {
            PacketNumberSpace::Initial => conn.outstandings.initial_packets_count += 1,
            PacketNumberSpace::Handshake => conn.outstandings.handshake_packets_count += 1,
            PacketNumberSpace::AppData => unreachable!("handshake packet in app-data space"),
        }
    }
    conn.loss_state.last_retransmittable_packet_sent_time = Some(sent_time);
    if is_clone {
        conn.outstandings.cloned_packets_count += 1;
        conn.loss_state.timeout_based_rtx_count += 1;
    }
    conn.loss_state.inflight_bytes += encoded_size as u64;

    let at = conn
        .outstandings
        .packets
        .iter()
        .rposition(|p| p.packet_num() < packet_num)
        .map_or(0, |i| i + 1);
    conn.outstandings.packets.insert(at, record);

    let outstanding = conn.outstandings.num_outstanding();
    debug_assert!(outstanding >= conn.outstandings.initial_packets_count);
    debug_assert!(outstanding >= conn.outstandings.handshake_packets_count);
    debug_assert!(outstanding >= conn.outstandings.cloned_packets_count);
}
