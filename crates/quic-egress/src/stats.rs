//! # Observability hooks
//!
//! Everything here is observational: none of these callbacks can change what
//! the pipeline does next.
//!
//! - [`TransportStatsCallback`]: counters for writes, sends, retransmissions,
//!   cwnd-blocked passes and socket errors.
//! - [`LoopDetectorCallback`]: told why a pass produced nothing, so a stalled
//!   connection can be diagnosed.
//! - [`TransmitMetrics`]: time spent per phase of the transmit loop.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

// ─── Socket Errors ──────────────────────────────────────────────────────────

/// Errno category of a failed socket write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketErrorType {
    Again,
    Inval,
    MsgSize,
    NoBufs,
    NoMem,
    NetUnreach,
    Other,
}

impl SocketErrorType {
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            e if e == libc::EAGAIN || e == libc::EWOULDBLOCK => SocketErrorType::Again,
            libc::EINVAL => SocketErrorType::Inval,
            libc::EMSGSIZE => SocketErrorType::MsgSize,
            libc::ENOBUFS => SocketErrorType::NoBufs,
            libc::ENOMEM => SocketErrorType::NoMem,
            libc::ENETUNREACH | libc::EHOSTUNREACH => SocketErrorType::NetUnreach,
            _ => SocketErrorType::Other,
        }
    }

    pub fn from_io_error(err: &io::Error) -> Self {
        match err.raw_os_error() {
            Some(errno) => Self::from_errno(errno),
            None if err.kind() == io::ErrorKind::WouldBlock => SocketErrorType::Again,
            None => SocketErrorType::Other,
        }
    }
}

// ─── Stats Callback ─────────────────────────────────────────────────────────

pub trait TransportStatsCallback {
    fn on_write(&self, _size: usize) {}
    fn on_packet_sent(&self) {}
    fn on_packet_retransmission(&self) {}
    fn on_cwnd_blocked(&self) {}
    fn on_udp_socket_write_error(&self, _error: SocketErrorType) {}
}

/// Atomic counters. Take a [`StatsSnapshot`] to read or export them.
#[derive(Debug, Default)]
pub struct CountingStatsCallback {
    writes: AtomicU64,
    bytes_written: AtomicU64,
    packets_sent: AtomicU64,
    retransmissions: AtomicU64,
    cwnd_blocked: AtomicU64,
    socket_errors: AtomicU64,
    last_socket_error: std::sync::Mutex<Option<SocketErrorType>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub writes: u64,
    pub bytes_written: u64,
    pub packets_sent: u64,
    pub retransmissions: u64,
    pub cwnd_blocked: u64,
    pub socket_errors: u64,
    pub last_socket_error: Option<SocketErrorType>,
}

impl CountingStatsCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            writes: self.writes.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            retransmissions: self.retransmissions.load(Ordering::Relaxed),
            cwnd_blocked: self.cwnd_blocked.load(Ordering::Relaxed),
            socket_errors: self.socket_errors.load(Ordering::Relaxed),
            last_socket_error: self.last_socket_error.lock().ok().and_then(|e| *e),
        }
    }
}

impl TransportStatsCallback for CountingStatsCallback {
    fn on_write(&self, size: usize) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(size as u64, Ordering::Relaxed);
    }

    fn on_packet_sent(&self) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn on_packet_retransmission(&self) {
        self.retransmissions.fetch_add(1, Ordering::Relaxed);
    }

    fn on_cwnd_blocked(&self) {
        self.cwnd_blocked.fetch_add(1, Ordering::Relaxed);
    }

    fn on_udp_socket_write_error(&self, error: SocketErrorType) {
        self.socket_errors.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_socket_error.lock() {
            *last = Some(error);
        }
    }
}

// ─── Loop Detection ─────────────────────────────────────────────────────────

/// Why the last pass stopped producing packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoWriteReason {
    #[default]
    WriteOk,
    EmptyScheduler,
    NoFrame,
    NoBody,
    SocketFailure,
}

impl NoWriteReason {
    pub fn as_str(self) -> &'static str {
        match self {
            NoWriteReason::WriteOk => "write ok",
            NoWriteReason::EmptyScheduler => "empty scheduler",
            NoWriteReason::NoFrame => "no frame",
            NoWriteReason::NoBody => "no body",
            NoWriteReason::SocketFailure => "socket failure",
        }
    }
}

impl fmt::Display for NoWriteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait LoopDetectorCallback {
    fn on_suppress_write(&self, reason: NoWriteReason, scheduler_name: &str);
}

/// Last diagnostic state of the transmit loop, kept on the connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteDebugState {
    pub no_write_reason: NoWriteReason,
    pub scheduler_name: String,
}

// ─── Phase Metrics ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WritePhase {
    Assemble,
    UpdateConnection,
    Flush,
}

pub trait TransmitMetrics {
    fn record(&self, phase: WritePhase, elapsed: Duration);
}

/// Accumulated time and sample count per phase.
#[derive(Debug, Default)]
pub struct PhaseTotals {
    assemble_ns: AtomicU64,
    assemble_count: AtomicU64,
    update_ns: AtomicU64,
    update_count: AtomicU64,
    flush_ns: AtomicU64,
    flush_count: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PhaseTotal {
    pub total_ns: u64,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PhaseTotalsSnapshot {
    pub assemble: PhaseTotal,
    pub update_connection: PhaseTotal,
    pub flush: PhaseTotal,
}

impl PhaseTotals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> PhaseTotalsSnapshot {
        let read = |ns: &AtomicU64, count: &AtomicU64| PhaseTotal {
            total_ns: ns.load(Ordering::Relaxed),
            count: count.load(Ordering::Relaxed),
        };
        PhaseTotalsSnapshot {
            assemble: read(&self.assemble_ns, &self.assemble_count),
            update_connection: read(&self.update_ns, &self.update_count),
            flush: read(&self.flush_ns, &self.flush_count),
        }
    }
}

impl TransmitMetrics for PhaseTotals {
    fn record(&self, phase: WritePhase, elapsed: Duration) {
        let (ns, count) = match phase {
            WritePhase::Assemble => (&self.assemble_ns, &self.assemble_count),
            WritePhase::UpdateConnection => (&self.update_ns, &self.update_count),
            WritePhase::Flush => (&self.flush_ns, &self.flush_count),
        };
        ns.fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        count.fetch_add(1, Ordering::Relaxed);
    }
}
