//! # Batched socket writes
//!
//! Encrypted datagrams are collected by a [`BatchWriter`] and written in one
//! go by [`IoBufBatch`]. A flush walks the happy-eyeballs state: the batch
//! goes to every eligible socket, and success on either counts.
//!
//! ## Error policy
//!
//! | Outcome                              | Result                                   |
//! |--------------------------------------|------------------------------------------|
//! | any socket delivered                 | `Ok(true)`                               |
//! | retriable error, no delivery         | `Ok(false)`, path stays eligible         |
//! | retriable error, other path delivered| `Ok(true)`, failing path demoted         |
//! | non-retriable error                  | path demoted, read side paused           |
//! | both paths demoted                   | `Err(ConnectionError)`                   |
//!
//! Network-unreachable errors close the connection as abandoned; anything
//! else is a transport internal error.

use std::io;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use quanta::Instant;
use tracing::{debug, warn};

use crate::arena::SendBufAccessor;
use crate::config::{BatchingMode, DataPathType, TransportSettings};
use crate::error::{ConnectionError, LocalErrorCode, TransportErrorCode};
use crate::state::ConnectionState;
use crate::stats::SocketErrorType;

// ─── Socket Seam ────────────────────────────────────────────────────────────

/// A non-blocking datagram socket.
pub trait DatagramSocket {
    /// Send one datagram. Returns the bytes written.
    fn write(&mut self, peer: &SocketAddr, buf: &[u8]) -> io::Result<usize>;

    /// Send `buf` as consecutive datagrams of `segment_len` bytes; the last
    /// one may be shorter.
    fn write_segments(
        &mut self,
        peer: &SocketAddr,
        buf: &[u8],
        segment_len: usize,
    ) -> io::Result<usize> {
        let mut written = 0;
        for segment in buf.chunks(segment_len.max(1)) {
            written += self.write(peer, segment)?;
        }
        Ok(written)
    }

    /// Send each buffer as its own datagram.
    fn write_batch(&mut self, peer: &SocketAddr, bufs: &[Bytes]) -> io::Result<usize> {
        let mut written = 0;
        for buf in bufs {
            written += self.write(peer, buf)?;
        }
        Ok(written)
    }

    /// Stop reading: this path is no longer used.
    fn pause_read(&mut self);
}

/// The sockets a flush may use for this connection.
pub struct SocketPair<'a> {
    pub primary: &'a mut dyn DatagramSocket,
    pub secondary: Option<&'a mut dyn DatagramSocket>,
}

impl<'a> SocketPair<'a> {
    pub fn single(primary: &'a mut dyn DatagramSocket) -> Self {
        SocketPair {
            primary,
            secondary: None,
        }
    }

    /// Borrow the pair for one more pass.
    pub fn reborrow(&mut self) -> SocketPair<'_> {
        let primary: &mut dyn DatagramSocket = &mut *self.primary;
        let secondary = match self.secondary.as_mut() {
            Some(socket) => {
                let socket: &mut dyn DatagramSocket = &mut **socket;
                Some(socket)
            }
            None => None,
        };
        SocketPair { primary, secondary }
    }
}

pub fn is_retriable_error(err: &io::Error) -> bool {
    match err.raw_os_error() {
        Some(errno) => {
            errno == libc::EAGAIN
                || errno == libc::EWOULDBLOCK
                || errno == libc::ENOBUFS
                || errno == libc::EMSGSIZE
        }
        None => err.kind() == io::ErrorKind::WouldBlock,
    }
}

pub fn is_network_unreachable(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ENETUNREACH) | Some(libc::EHOSTUNREACH)
    )
}

// ─── Batch Writers ──────────────────────────────────────────────────────────

pub trait BatchWriter {
    fn is_empty(&self) -> bool;

    /// Bytes queued.
    fn size(&self) -> usize;

    /// True if the queued datagrams must go out before one of `size` joins.
    fn needs_flush(&self, _size: usize) -> bool {
        false
    }

    /// Queue a datagram. `buf` is `None` when the bytes already sit in the
    /// send arena. Returns true when the batch is full.
    fn append(&mut self, buf: Option<Bytes>, size: usize) -> bool;

    fn write(
        &self,
        socket: &mut dyn DatagramSocket,
        peer: &SocketAddr,
        arena: &SendBufAccessor,
    ) -> io::Result<usize>;

    /// Forget the queued datagrams after a flush, successful or not.
    fn reset(&mut self, arena: &mut SendBufAccessor);
}

/// One datagram per write.
#[derive(Debug, Default)]
pub struct SinglePacketBatchWriter {
    buf: Option<Bytes>,
}

impl BatchWriter for SinglePacketBatchWriter {
    fn is_empty(&self) -> bool {
        self.buf.is_none()
    }

    fn size(&self) -> usize {
        self.buf.as_ref().map_or(0, Bytes::len)
    }

    fn append(&mut self, buf: Option<Bytes>, _size: usize) -> bool {
        assert!(buf.is_some(), "chained batch writer given a datagram in the send arena");
        self.buf = buf;
        true
    }

    fn write(
        &self,
        socket: &mut dyn DatagramSocket,
        peer: &SocketAddr,
        _arena: &SendBufAccessor,
    ) -> io::Result<usize> {
        match &self.buf {
            Some(buf) => socket.write(peer, buf),
            None => Ok(0),
        }
    }

    fn reset(&mut self, _arena: &mut SendBufAccessor) {
        self.buf = None;
    }
}

/// Equal-size segments sent with one segmented write. A larger datagram
/// forces a flush first; a smaller one closes the batch.
#[derive(Debug)]
pub struct GsoBatchWriter {
    bufs: Vec<Bytes>,
    segment_len: usize,
    max_batch_size: usize,
    size: usize,
}

impl GsoBatchWriter {
    pub fn new(max_batch_size: usize) -> Self {
        GsoBatchWriter {
            bufs: Vec::with_capacity(max_batch_size),
            segment_len: 0,
            max_batch_size,
            size: 0,
        }
    }
}

impl BatchWriter for GsoBatchWriter {
    fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    fn size(&self) -> usize {
        self.size
    }

    fn needs_flush(&self, size: usize) -> bool {
        !self.bufs.is_empty() && size > self.segment_len
    }

    fn append(&mut self, buf: Option<Bytes>, size: usize) -> bool {
        let Some(buf) = buf else {
            panic!("chained batch writer given a datagram in the send arena");
        };
        if self.bufs.is_empty() {
            self.segment_len = size;
        }
        self.size += size;
        self.bufs.push(buf);
        self.bufs.len() >= self.max_batch_size || size < self.segment_len
    }

    fn write(
        &self,
        socket: &mut dyn DatagramSocket,
        peer: &SocketAddr,
        _arena: &SendBufAccessor,
    ) -> io::Result<usize> {
        if let [single] = self.bufs.as_slice() {
            return socket.write(peer, single);
        }
        let mut joined = BytesMut::with_capacity(self.size);
        for buf in &self.bufs {
            joined.extend_from_slice(buf);
        }
        socket.write_segments(peer, &joined, self.segment_len)
    }

    fn reset(&mut self, _arena: &mut SendBufAccessor) {
        self.bufs.clear();
        self.segment_len = 0;
        self.size = 0;
    }
}

/// Holds datagrams across flushes that allow delay, until the batch fills
/// or the oldest datagram has waited `delay`.
#[derive(Debug)]
pub struct ThreadLocalBatchWriter {
    bufs: Vec<Bytes>,
    first_append: Option<Instant>,
    delay: std::time::Duration,
    max_batch_size: usize,
    size: usize,
}

impl ThreadLocalBatchWriter {
    pub fn new(max_batch_size: usize, delay: std::time::Duration) -> Self {
        ThreadLocalBatchWriter {
            bufs: Vec::with_capacity(max_batch_size),
            first_append: None,
            delay,
            max_batch_size,
            size: 0,
        }
    }
}

impl BatchWriter for ThreadLocalBatchWriter {
    fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    fn size(&self) -> usize {
        self.size
    }

    fn needs_flush(&self, _size: usize) -> bool {
        self.first_append
            .is_some_and(|t| Instant::now().saturating_duration_since(t) >= self.delay)
    }

    fn append(&mut self, buf: Option<Bytes>, size: usize) -> bool {
        let Some(buf) = buf else {
            panic!("chained batch writer given a datagram in the send arena");
        };
        self.first_append.get_or_insert_with(Instant::now);
        self.size += size;
        self.bufs.push(buf);
        self.bufs.len() >= self.max_batch_size
    }

    fn write(
        &self,
        socket: &mut dyn DatagramSocket,
        peer: &SocketAddr,
        _arena: &SendBufAccessor,
    ) -> io::Result<usize> {
        socket.write_batch(peer, &self.bufs)
    }

    fn reset(&mut self, _arena: &mut SendBufAccessor) {
        self.bufs.clear();
        self.first_append = None;
        self.size = 0;
    }
}

/// Datagrams assembled back to back in the send arena. Only segment sizes
/// are tracked here; the bytes are read from the arena at write time and
/// dropped from it on reset.
#[derive(Debug)]
pub struct ContinuousMemoryBatchWriter {
    segments: Vec<usize>,
    max_batch_size: usize,
}

impl ContinuousMemoryBatchWriter {
    pub fn new(max_batch_size: usize) -> Self {
        ContinuousMemoryBatchWriter {
            segments: Vec::with_capacity(max_batch_size),
            max_batch_size,
        }
    }
}

impl BatchWriter for ContinuousMemoryBatchWriter {
    fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    fn size(&self) -> usize {
        self.segments.iter().sum()
    }

    fn needs_flush(&self, size: usize) -> bool {
        self.segments.first().is_some_and(|&first| size > first)
    }

    fn append(&mut self, buf: Option<Bytes>, size: usize) -> bool {
        assert!(buf.is_none(), "continuous batch writer given a chained datagram");
        let first = self.segments.first().copied().unwrap_or(size);
        self.segments.push(size);
        self.segments.len() >= self.max_batch_size || size < first
    }

    fn write(
        &self,
        socket: &mut dyn DatagramSocket,
        peer: &SocketAddr,
        arena: &SendBufAccessor,
    ) -> io::Result<usize> {
        let data = &arena.data()[..self.size()];
        match self.segments.as_slice() {
            [] => Ok(0),
            [_] => socket.write(peer, data),
            [first, ..] => socket.write_segments(peer, data, *first),
        }
    }

    fn reset(&mut self, arena: &mut SendBufAccessor) {
        arena.consume(self.size());
        self.segments.clear();
    }
}

/// Pick the writer for the configured data path and batching mode.
pub fn make_batch_writer(settings: &TransportSettings) -> Box<dyn BatchWriter> {
    let max = settings.max_batch_size.max(1);
    match (settings.data_path_type, settings.batching_mode) {
        (DataPathType::ContinuousMemory, BatchingMode::None) => {
            Box::new(ContinuousMemoryBatchWriter::new(1))
        }
        (DataPathType::ContinuousMemory, _) => Box::new(ContinuousMemoryBatchWriter::new(max)),
        (DataPathType::ChainedMemory, BatchingMode::None) => {
            Box::new(SinglePacketBatchWriter::default())
        }
        (DataPathType::ChainedMemory, BatchingMode::SizeBased) => {
            Box::new(GsoBatchWriter::new(max))
        }
        (DataPathType::ChainedMemory, BatchingMode::ThreadLocal) => {
            Box::new(ThreadLocalBatchWriter::new(max, settings.thread_local_delay))
        }
    }
}

// ─── IoBufBatch ─────────────────────────────────────────────────────────────

/// How hard a flush pushes.
///
/// `AllowThreadLocalDelay` is for flushes that are not the last of a pass,
/// such as the one after a failed packet build: a thread-local batch keeps
/// its datagrams until it fills, its delay expires or an `Always` flush
/// arrives. Other writers flush either way. The transmit loop ends every
/// pass with `Always`, and callers driving a batch by hand must do the same.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    AllowThreadLocalDelay,
    Always,
}

/// One transmit pass worth of batching over a socket pair.
pub struct IoBufBatch<'a> {
    writer: Box<dyn BatchWriter>,
    thread_local: bool,
    sockets: SocketPair<'a>,
    pkt_sent: u64,
}

enum PathOutcome {
    Skipped,
    Delivered,
    RetriableFailure,
    Failed,
}

impl<'a> IoBufBatch<'a> {
    pub fn new(sockets: SocketPair<'a>, settings: &TransportSettings) -> Self {
        // The arena path has no thread-local writer.
        let thread_local = settings.batching_mode == BatchingMode::ThreadLocal
            && settings.data_path_type == DataPathType::ChainedMemory;
        Self::with_writer(sockets, make_batch_writer(settings), thread_local)
    }

    pub fn with_writer(
        sockets: SocketPair<'a>,
        writer: Box<dyn BatchWriter>,
        thread_local: bool,
    ) -> Self {
        IoBufBatch {
            writer,
            thread_local,
            sockets,
            pkt_sent: 0,
        }
    }

    /// Datagrams handed to this batch so far.
    pub fn pkt_sent(&self) -> u64 {
        self.pkt_sent
    }

    pub fn is_empty(&self) -> bool {
        self.writer.is_empty()
    }

    /// Queue a datagram, flushing as the writer requires. `Ok(false)` means
    /// the flush this triggered delivered nothing.
    pub fn write(
        &mut self,
        conn: &mut ConnectionState,
        buf: Option<Bytes>,
        size: usize,
    ) -> Result<bool, ConnectionError> {
        self.pkt_sent += 1;
        if self.writer.needs_flush(size) {
            // A failed early flush only loses the earlier datagrams.
            self.flush(conn, FlushMode::Always)?;
        }
        if self.writer.append(buf, size) {
            return self.flush(conn, FlushMode::Always);
        }
        Ok(true)
    }

    /// Write out and reset the batch. The reset happens on every path.
    pub fn flush(
        &mut self,
        conn: &mut ConnectionState,
        mode: FlushMode,
    ) -> Result<bool, ConnectionError> {
        if self.thread_local && mode == FlushMode::AllowThreadLocalDelay {
            return Ok(true);
        }
        let result = self.flush_internal(conn);
        self.writer.reset(&mut conn.buf_accessor);
        result
    }

    fn write_path(
        writer: &dyn BatchWriter,
        socket: &mut dyn DatagramSocket,
        peer: &SocketAddr,
        arena: &SendBufAccessor,
        last_error: &mut Option<io::Error>,
    ) -> PathOutcome {
        match writer.write(socket, peer, arena) {
            Ok(_) => PathOutcome::Delivered,
            Err(err) => {
                warn!(%peer, error = %err, size = writer.size(), "socket write failed");
                let outcome = if is_retriable_error(&err) {
                    PathOutcome::RetriableFailure
                } else {
                    socket.pause_read();
                    PathOutcome::Failed
                };
                *last_error = Some(err);
                outcome
            }
        }
    }

    fn flush_internal(&mut self, conn: &mut ConnectionState) -> Result<bool, ConnectionError> {
        if self.writer.is_empty() {
            return Ok(true);
        }

        let mut last_error = None;
        let mut primary = PathOutcome::Skipped;
        if conn.happy_eyeballs.should_write_to_first_socket {
            primary = Self::write_path(
                self.writer.as_ref(),
                &mut *self.sockets.primary,
                &conn.peer_address,
                &conn.buf_accessor,
                &mut last_error,
            );
            if matches!(primary, PathOutcome::Failed) {
                conn.happy_eyeballs.should_write_to_first_socket = false;
            }
        }

        let primary_delivered = matches!(primary, PathOutcome::Delivered);
        if !primary_delivered && conn.happy_eyeballs.is_conn_attempt_delay_scheduled() {
            conn.happy_eyeballs.cancel_conn_attempt_delay();
            conn.happy_eyeballs.start_second_socket();
            debug!("primary write failed, starting second socket");
        }

        let mut secondary = PathOutcome::Skipped;
        if conn.happy_eyeballs.should_write_to_second_socket {
            match (
                self.sockets.secondary.as_deref_mut(),
                conn.happy_eyeballs.second_peer_address,
            ) {
                (Some(socket), Some(peer)) => {
                    secondary = Self::write_path(
                        self.writer.as_ref(),
                        socket,
                        &peer,
                        &conn.buf_accessor,
                        &mut last_error,
                    );
                    if matches!(secondary, PathOutcome::Failed) {
                        conn.happy_eyeballs.should_write_to_second_socket = false;
                    }
                }
                _ => debug!("second socket eligible but not bound"),
            }
        }
        let secondary_delivered = matches!(secondary, PathOutcome::Delivered);

        // A retriable failure only costs a path its eligibility when the
        // other path took the same batch.
        if matches!(primary, PathOutcome::RetriableFailure) && secondary_delivered {
            conn.happy_eyeballs.should_write_to_first_socket = false;
            self.sockets.primary.pause_read();
        }
        if matches!(secondary, PathOutcome::RetriableFailure) && primary_delivered {
            conn.happy_eyeballs.should_write_to_second_socket = false;
            if let Some(socket) = self.sockets.secondary.as_deref_mut() {
                socket.pause_read();
            }
        }

        let written = primary_delivered || secondary_delivered;
        if !written {
            if let Some(stats) = conn.stats() {
                let kind = last_error
                    .as_ref()
                    .map_or(SocketErrorType::Other, SocketErrorType::from_io_error);
                stats.on_udp_socket_write_error(kind);
            }
        }

        if conn.happy_eyeballs.is_write_dead() {
            return Err(self.fatal_error(last_error.as_ref()));
        }
        Ok(written)
    }

    fn fatal_error(&self, err: Option<&io::Error>) -> ConnectionError {
        let Some(err) = err else {
            return ConnectionError::transport(
                TransportErrorCode::InternalError,
                "Error on socket write: no eligible socket",
            );
        };
        let mut message = format!("Error on socket write {err}");
        if err.raw_os_error() == Some(libc::EMSGSIZE) {
            message.push_str(&format!(", pktSize={}", self.writer.size()));
        }
        if is_network_unreachable(err) {
            ConnectionError::local(LocalErrorCode::ConnectionAbandoned, message)
        } else {
            ConnectionError::transport(TransportErrorCode::InternalError, message)
        }
    }
}
