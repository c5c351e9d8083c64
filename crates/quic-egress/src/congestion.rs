//! # Send-rate collaborators
//!
//! The pipeline consults a congestion controller and a pacer but does not
//! implement either algorithm. It does own the path-validation limiter,
//! which caps what may be sent toward an unvalidated peer address.

use std::time::Duration;

use quanta::Instant;

use crate::state::OutstandingPacket;

/// Congestion window as seen by the sender.
pub trait CongestionController {
    /// Bytes that may be put in flight right now.
    fn get_writable_bytes(&self) -> u64;

    fn on_packet_sent(&mut self, packet: &OutstandingPacket);

    fn is_app_limited(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "cc"
    }
}

pub trait Pacer {
    fn on_packet_sent(&mut self, now: Instant, encoded_size: usize);
}

// ─── Path-Validation Limiter ────────────────────────────────────────────────

/// Credit granted per RTT window toward an unvalidated path.
pub const PATH_CREDIT_PACKETS: u64 = 3;

/// Limits bytes sent to a peer whose new address has not been validated:
/// `3 * udp_send_packet_len` per RTT.
#[derive(Debug, Clone)]
pub struct PendingPathRateLimiter {
    max_credit: u64,
    credit: u64,
    window_start: Option<Instant>,
}

impl PendingPathRateLimiter {
    pub fn new(udp_send_packet_len: usize) -> Self {
        let max_credit = PATH_CREDIT_PACKETS * udp_send_packet_len as u64;
        PendingPathRateLimiter {
            max_credit,
            credit: max_credit,
            window_start: None,
        }
    }

    fn window_expired(&self, now: Instant, rtt: Duration) -> bool {
        match self.window_start {
            Some(start) => now.saturating_duration_since(start) >= rtt,
            None => true,
        }
    }

    /// Credit available at `now`. Does not start a new window.
    pub fn current_credit(&self, now: Instant, rtt: Duration) -> u64 {
        if self.window_expired(now, rtt) {
            self.max_credit
        } else {
            self.credit
        }
    }

    pub fn on_packet_sent(&mut self, now: Instant, rtt: Duration, size: u64) {
        if self.window_expired(now, rtt) {
            self.credit = self.max_credit;
            self.window_start = Some(now);
        }
        self.credit = self.credit.saturating_sub(size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credit_refills_each_rtt() {
        let (clock, mock) = quanta::Clock::mock();
        let rtt = Duration::from_millis(50);
        let mut limiter = PendingPathRateLimiter::new(1200);

        let t0 = clock.now();
        assert_eq!(limiter.current_credit(t0, rtt), 3600);
        limiter.on_packet_sent(t0, rtt, 1200);
        limiter.on_packet_sent(t0, rtt, 1200);
        assert_eq!(limiter.current_credit(t0, rtt), 1200);

        mock.increment(Duration::from_millis(49));
        assert_eq!(limiter.current_credit(clock.now(), rtt), 1200);

        mock.increment(Duration::from_millis(1));
        assert_eq!(limiter.current_credit(clock.now(), rtt), 3600);
    }

    #[test]
    fn credit_never_underflows() {
        let (clock, _mock) = quanta::Clock::mock();
        let rtt = Duration::from_millis(10);
        let mut limiter = PendingPathRateLimiter::new(1200);
        limiter.on_packet_sent(clock.now(), rtt, 10_000);
        assert_eq!(limiter.current_credit(clock.now(), rtt), 0);
    }
}
