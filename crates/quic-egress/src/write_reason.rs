//! Whether a transmit pass has anything to do, and why.
//!
//! Pure reads of the connection. The only side effect is the cwnd-blocked
//! stats notification, which is observational.

use std::fmt;

use tracing::trace;

use crate::budget::congestion_control_writable_bytes;
use crate::state::ConnectionState;
use crate::stream::SendStreamBuffers;
use crate::types::{EncryptionLevel, PacketNumberSpace};

/// First matching reason, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDataReason {
    NoWrite,
    Probes,
    Ack,
    CryptoStream,
    Reset,
    StreamWindowUpdate,
    ConnWindowUpdate,
    Blocked,
    Stream,
    Simple,
    PathChallenge,
    Ping,
}

impl fmt::Display for WriteDataReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WriteDataReason::NoWrite => "no write",
            WriteDataReason::Probes => "probes",
            WriteDataReason::Ack => "ack",
            WriteDataReason::CryptoStream => "crypto stream",
            WriteDataReason::Reset => "reset",
            WriteDataReason::StreamWindowUpdate => "stream window update",
            WriteDataReason::ConnWindowUpdate => "conn window update",
            WriteDataReason::Blocked => "blocked",
            WriteDataReason::Stream => "stream",
            WriteDataReason::Simple => "simple",
            WriteDataReason::PathChallenge => "path challenge",
            WriteDataReason::Ping => "ping",
        };
        f.write_str(name)
    }
}

pub fn should_write_data(conn: &ConnectionState) -> WriteDataReason {
    if conn.pending_events.num_probe_packets > 0 {
        trace!(node = %conn.node_type, "needs write because of probes");
        return WriteDataReason::Probes;
    }
    if has_ack_data_to_write(conn) {
        trace!(node = %conn.node_type, "needs write because of acks");
        return WriteDataReason::Ack;
    }
    if congestion_control_writable_bytes(conn) == Some(0) {
        if let Some(stats) = conn.stats() {
            stats.on_cwnd_blocked();
        }
        return WriteDataReason::NoWrite;
    }
    has_non_ack_data_to_write(conn)
}

fn ack_due(conn: &ConnectionState, space: PacketNumberSpace) -> bool {
    let ack_state = conn.ack_state(space);
    conn.write_ciphers.for_space(space).is_some()
        && ack_state.has_acks_to_schedule()
        && ack_state.needs_to_send_ack_immediately
}

/// Acks count only once they must go out now and the space can be written.
pub fn has_ack_data_to_write(conn: &ConnectionState) -> bool {
    [
        PacketNumberSpace::Initial,
        PacketNumberSpace::Handshake,
        PacketNumberSpace::AppData,
    ]
    .into_iter()
    .any(|space| ack_due(conn, space))
}

fn crypto_writable(stream: &SendStreamBuffers) -> bool {
    !stream.write_buffer.is_empty() || !stream.loss_buffer.is_empty()
}

/// Crypto data pending at a level whose write cipher is installed.
pub fn crypto_has_writable_data(conn: &ConnectionState) -> bool {
    [
        EncryptionLevel::Initial,
        EncryptionLevel::Handshake,
        EncryptionLevel::AppData,
    ]
    .into_iter()
    .any(|level| {
        conn.write_ciphers.for_level(level).is_some()
            && conn
                .crypto_streams
                .for_level(level)
                .is_some_and(crypto_writable)
    })
}

pub fn has_non_ack_data_to_write(conn: &ConnectionState) -> WriteDataReason {
    if crypto_has_writable_data(conn) {
        return WriteDataReason::CryptoStream;
    }
    // Everything below needs 1-RTT or 0-RTT keys.
    if conn.write_ciphers.one_rtt.is_none() && conn.write_ciphers.zero_rtt.is_none() {
        return WriteDataReason::NoWrite;
    }
    let pending = &conn.pending_events;
    if !pending.resets.is_empty() {
        return WriteDataReason::Reset;
    }
    if conn.streams.has_window_updates() {
        return WriteDataReason::StreamWindowUpdate;
    }
    if pending.conn_window_update {
        return WriteDataReason::ConnWindowUpdate;
    }
    if conn.streams.has_blocked() {
        return WriteDataReason::Blocked;
    }
    if conn.flow_control.send_window_available() != 0 && conn.streams.has_writable() {
        return WriteDataReason::Stream;
    }
    if !pending.frames.is_empty() {
        return WriteDataReason::Simple;
    }
    if pending.path_challenge.is_some() {
        return WriteDataReason::PathChallenge;
    }
    if pending.send_ping {
        return WriteDataReason::Ping;
    }
    WriteDataReason::NoWrite
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::congestion::PendingPathRateLimiter;
    use crate::frame::{AckBlock, RstStreamFrame, SimpleFrame};
    use crate::stats::CountingStatsCallback;
    use crate::test_util::{cipher_pair, stream_conn, test_conn, FixedWindow};
    use bytes::Bytes;
    use std::sync::Arc;

    #[test]
    fn idle_connection_has_nothing() {
        let conn = test_conn();
        assert_eq!(should_write_data(&conn), WriteDataReason::NoWrite);
    }

    #[test]
    fn probes_beat_everything() {
        let mut conn = stream_conn(0, vec![1; 10]);
        conn.pending_events.num_probe_packets = 2;
        conn.congestion_controller = Some(Box::new(FixedWindow::new(0)));
        assert_eq!(should_write_data(&conn), WriteDataReason::Probes);
    }

    #[test]
    fn acks_need_cipher_and_urgency() {
        let mut conn = test_conn();
        conn.ack_states.handshake.acks = vec![AckBlock { start: 0, end: 3 }];
        assert!(!has_ack_data_to_write(&conn));
        conn.ack_states.handshake.needs_to_send_ack_immediately = true;
        assert!(!has_ack_data_to_write(&conn));
        conn.write_ciphers.handshake = Some(cipher_pair());
        assert_eq!(should_write_data(&conn), WriteDataReason::Ack);
        conn.ack_states.handshake.largest_ack_scheduled = Some(3);
        assert!(!has_ack_data_to_write(&conn));
    }

    #[test]
    fn zero_budget_is_cwnd_blocked() {
        let mut conn = stream_conn(0, vec![1; 10]);
        let stats = Arc::new(CountingStatsCallback::new());
        conn.stats_callback = Some(stats.clone());
        conn.congestion_controller = Some(Box::new(FixedWindow::new(0)));
        assert_eq!(should_write_data(&conn), WriteDataReason::NoWrite);
        assert_eq!(stats.snapshot().cwnd_blocked, 1);
    }

    #[test]
    fn crypto_before_one_rtt_keys() {
        let mut conn = test_conn();
        conn.crypto_streams.initial.write(Bytes::from_static(b"hello"), false);
        assert_eq!(should_write_data(&conn), WriteDataReason::NoWrite);
        conn.write_ciphers.initial = Some(cipher_pair());
        assert_eq!(should_write_data(&conn), WriteDataReason::CryptoStream);
    }

    #[test]
    fn no_app_keys_blocks_stream_data() {
        let mut conn = stream_conn(0, vec![1; 10]);
        conn.write_ciphers.one_rtt = None;
        assert_eq!(should_write_data(&conn), WriteDataReason::NoWrite);
        conn.write_ciphers.zero_rtt = Some(cipher_pair());
        assert_eq!(should_write_data(&conn), WriteDataReason::Stream);
    }

    #[test]
    fn control_frames_in_priority_order() {
        let mut conn = test_conn();
        conn.write_ciphers.one_rtt = Some(cipher_pair());
        conn.pending_events.send_ping = true;
        assert_eq!(should_write_data(&conn), WriteDataReason::Ping);
        conn.path_validation_limiter = Some(PendingPathRateLimiter::new(conn.udp_send_packet_len));
        conn.pending_events.path_challenge = Some(1);
        assert_eq!(should_write_data(&conn), WriteDataReason::PathChallenge);
        conn.pending_events.frames.push(SimpleFrame::HandshakeDone);
        assert_eq!(should_write_data(&conn), WriteDataReason::Simple);
        conn.pending_events.conn_window_update = true;
        assert_eq!(should_write_data(&conn), WriteDataReason::ConnWindowUpdate);
        conn.pending_events.resets.insert(
            4,
            RstStreamFrame {
                stream_id: 4,
                error_code: 0,
                final_size: 0,
            },
        );
        assert_eq!(should_write_data(&conn), WriteDataReason::Reset);
    }

    #[test]
    fn exhausted_conn_window_skips_streams() {
        let mut conn = stream_conn(0, vec![1; 10]);
        assert_eq!(should_write_data(&conn), WriteDataReason::Stream);
        conn.flow_control.sum_cur_write_offset = conn.flow_control.peer_advertised_max_offset;
        assert_eq!(should_write_data(&conn), WriteDataReason::NoWrite);
    }
}
