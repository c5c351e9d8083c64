//! Writable-bytes calculation for one transmit pass.
//!
//! `None` means no limit applies. A limited budget is rounded up to a whole
//! number of datagrams so a final partial packet is not starved.

use quanta::Instant;

use crate::state::ConnectionState;

/// Signature shared by the budget functions the transmit loop accepts.
pub type WritableBytesFn = fn(&ConnectionState) -> Option<u64>;

/// Combine the path-validation limiter, the byte cap and the congestion
/// window into one budget.
pub fn congestion_control_writable_bytes(conn: &ConnectionState) -> Option<u64> {
    let mut writable: Option<u64> = None;

    if conn.path_validation_pending() {
        assert!(
            conn.writable_bytes_limit.is_none(),
            "path validation and a byte cap cannot both limit writes"
        );
        let Some(limiter) = conn.path_validation_limiter.as_ref() else {
            panic!("path validation pending without a rate limiter");
        };
        writable = Some(limiter.current_credit(Instant::now(), conn.rtt_or_default()));
    } else if let Some(limit) = conn.writable_bytes_limit {
        if limit <= conn.loss_state.total_bytes_sent {
            return Some(0);
        }
        writable = Some(limit - conn.loss_state.total_bytes_sent);
    }

    if let Some(cc) = conn.congestion_controller.as_ref() {
        let cwnd = cc.get_writable_bytes();
        writable = Some(writable.map_or(cwnd, |w| w.min(cwnd)));
    }

    writable.map(|bytes| round_up_to_packets(bytes, conn.udp_send_packet_len as u64))
}

/// Budget for probes and close packets.
pub fn unlimited_writable_bytes(_conn: &ConnectionState) -> Option<u64> {
    None
}

pub fn round_up_to_packets(bytes: u64, packet_len: u64) -> u64 {
    bytes.div_ceil(packet_len).saturating_mul(packet_len)
}
