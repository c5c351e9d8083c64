//! # Dual-path connection racing
//!
//! A client may race two peer addresses (typically IPv6 then IPv4). The
//! primary starts immediately; the secondary starts when the connection
//! attempt delay expires, or at once if the primary fails a write first.
//! Each path stays eligible until it fails with a non-retriable error. When
//! both are ineligible the connection cannot send anything.

use std::net::SocketAddr;

use quanta::Instant;

#[derive(Debug, Clone)]
pub struct HappyEyeballsState {
    pub should_write_to_first_socket: bool,
    pub should_write_to_second_socket: bool,
    pub second_peer_address: Option<SocketAddr>,
    conn_attempt_delay: Option<Instant>,
    /// Set once one path has won; no more secondary starts after that.
    pub finished: bool,
}

impl Default for HappyEyeballsState {
    fn default() -> Self {
        HappyEyeballsState {
            should_write_to_first_socket: true,
            should_write_to_second_socket: false,
            second_peer_address: None,
            conn_attempt_delay: None,
            finished: false,
        }
    }
}

impl HappyEyeballsState {
    /// Primary path only; the race is already over.
    pub fn single_path() -> Self {
        HappyEyeballsState {
            finished: true,
            ..Self::default()
        }
    }

    /// Race `second_peer_address`, starting it at `start_at` unless the
    /// primary fails first.
    pub fn racing(second_peer_address: SocketAddr, start_at: Instant) -> Self {
        HappyEyeballsState {
            second_peer_address: Some(second_peer_address),
            conn_attempt_delay: Some(start_at),
            ..Self::default()
        }
    }

    pub fn is_conn_attempt_delay_scheduled(&self) -> bool {
        self.conn_attempt_delay.is_some()
    }

    pub fn conn_attempt_deadline(&self) -> Option<Instant> {
        self.conn_attempt_delay
    }

    pub fn cancel_conn_attempt_delay(&mut self) {
        self.conn_attempt_delay = None;
    }

    pub fn start_second_socket(&mut self) {
        assert!(!self.finished, "second socket started after the race finished");
        self.should_write_to_second_socket = true;
    }

    /// Start the secondary if its delay has expired. Returns true if it
    /// started on this call.
    pub fn poll_conn_attempt_delay(&mut self, now: Instant) -> bool {
        match self.conn_attempt_delay {
            Some(deadline) if deadline <= now => {
                self.conn_attempt_delay = None;
                self.start_second_socket();
                true
            }
            _ => false,
        }
    }

    /// Settle the race on one path.
    pub fn finish(&mut self, primary_won: bool) {
        self.conn_attempt_delay = None;
        self.should_write_to_first_socket = primary_won;
        self.should_write_to_second_socket = !primary_won;
        self.finished = true;
    }

    pub fn is_write_dead(&self) -> bool {
        !self.should_write_to_first_socket && !self.should_write_to_second_socket
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr() -> SocketAddr {
        "127.0.0.1:4433".parse().unwrap()
    }

    #[test]
    fn delay_starts_second_socket_once() {
        let (clock, mock) = quanta::Clock::mock();
        let start_at = clock.now() + Duration::from_millis(150);
        let mut he = HappyEyeballsState::racing(addr(), start_at);
        assert!(!he.poll_conn_attempt_delay(clock.now()));
        assert!(!he.should_write_to_second_socket);

        mock.increment(Duration::from_millis(150));
        assert!(he.poll_conn_attempt_delay(clock.now()));
        assert!(he.should_write_to_second_socket);
        assert!(!he.is_conn_attempt_delay_scheduled());
        assert!(!he.poll_conn_attempt_delay(clock.now()));
    }

    #[test]
    fn finish_settles_on_one_path() {
        let (clock, _mock) = quanta::Clock::mock();
        let mut he = HappyEyeballsState::racing(addr(), clock.now());
        he.start_second_socket();
        he.finish(false);
        assert!(!he.should_write_to_first_socket);
        assert!(he.should_write_to_second_socket);
        assert!(!he.is_write_dead());
    }

    #[test]
    #[should_panic(expected = "race finished")]
    fn no_second_start_after_finish() {
        HappyEyeballsState::single_path().start_second_socket();
    }
}
