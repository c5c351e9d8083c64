//! # Stream send buffers
//!
//! Every stream (and every crypto level) tracks its outgoing bytes in four
//! disjoint regions keyed by stream offset:
//!
//! ```text
//!  acked (dropped) │ in flight (retransmission) │ lost │ unsent (write buffer)
//! ```
//!
//! Ranges move one way: write → retransmission on first send, retransmission
//! → loss when declared lost, loss → retransmission when resent, and out of
//! the picture when acknowledged. Every offset sits in exactly one region.
//!
//! Data sent through another data path (DSR) is tracked the same way with
//! [`WriteBufferMeta`] ranges that carry no bytes.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use bytes::{Bytes, BytesMut};

use crate::frame::{SimpleFrame, StreamDataBlockedFrame};
use crate::types::StreamId;

// ─── BufQueue ───────────────────────────────────────────────────────────────

/// A byte queue made of shared chunks. Splitting off the front never copies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufQueue {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl BufQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn append(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.len += data.len();
        self.chunks.push_back(data);
    }

    /// Remove and return up to `n` bytes from the front.
    pub fn split_at_most(&mut self, n: usize) -> BufQueue {
        let mut out = BufQueue::new();
        let mut want = n.min(self.len);
        while want > 0 {
            let Some(mut chunk) = self.chunks.pop_front() else {
                break;
            };
            if chunk.len() > want {
                let rest = chunk.split_off(want);
                self.chunks.push_front(rest);
            }
            want -= chunk.len();
            self.len -= chunk.len();
            out.append(chunk);
        }
        out
    }

    /// The first `n` bytes, without removing them. Copies only if they span
    /// more than one chunk.
    pub fn peek(&self, n: usize) -> Bytes {
        let n = n.min(self.len);
        match self.chunks.front() {
            Some(front) if front.len() >= n => front.slice(..n),
            _ => {
                let mut out = BytesMut::with_capacity(n);
                for chunk in &self.chunks {
                    let take = (n - out.len()).min(chunk.len());
                    out.extend_from_slice(&chunk[..take]);
                    if out.len() == n {
                        break;
                    }
                }
                out.freeze()
            }
        }
    }

    /// Take everything, leaving the queue empty.
    pub fn take(&mut self) -> BufQueue {
        std::mem::take(self)
    }
}

/// A range of stream bytes at a known offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamBuffer {
    pub data: BufQueue,
    pub offset: u64,
    pub eof: bool,
}

impl StreamBuffer {
    pub fn new(data: BufQueue, offset: u64, eof: bool) -> Self {
        StreamBuffer { data, offset, eof }
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A byte range whose payload lives outside this process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteBufferMeta {
    pub offset: u64,
    pub length: u64,
    pub eof: bool,
}

impl WriteBufferMeta {
    /// Split off the first `len` bytes. The returned meta keeps `eof` only if
    /// it takes everything.
    pub fn split(&mut self, len: u64) -> WriteBufferMeta {
        assert!(len <= self.length, "buffer meta split past its length");
        let front = WriteBufferMeta {
            offset: self.offset,
            length: len,
            eof: self.eof && len == self.length,
        };
        self.offset += len;
        self.length -= len;
        front
    }
}

// ─── Send Buffers ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct SendStreamBuffers {
    pub write_buffer: BufQueue,
    /// Next offset to be sent for the first time. Counts one extra once FIN
    /// has been sent.
    pub current_write_offset: u64,
    pub final_write_offset: Option<u64>,
    pub retransmission_buffer: BTreeMap<u64, StreamBuffer>,
    /// Sorted by offset, disjoint.
    pub loss_buffer: Vec<StreamBuffer>,
    pub write_buf_meta: WriteBufferMeta,
    pub retransmission_buf_metas: BTreeMap<u64, WriteBufferMeta>,
    /// Sorted by offset, disjoint.
    pub loss_buf_metas: Vec<WriteBufferMeta>,
    pub num_packets_tx_with_new_data: u64,
}

impl SendStreamBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue application bytes. `eof` fixes the final size.
    pub fn write(&mut self, data: Bytes, eof: bool) {
        assert!(
            self.final_write_offset.is_none(),
            "write after the stream was finished"
        );
        self.write_buffer.append(data);
        if eof {
            self.final_write_offset =
                Some(self.current_write_offset + self.write_buffer.len() as u64);
        }
    }

    /// FIN is owed when every byte is queued or sent and the FIN itself has
    /// not gone out yet.
    pub fn has_pending_fin(&self) -> bool {
        self.final_write_offset == Some(self.current_write_offset + self.write_buffer.len() as u64)
    }

    pub fn has_writable_data(&self) -> bool {
        !self.write_buffer.is_empty() || self.has_pending_fin()
    }

    pub fn has_lost_data(&self) -> bool {
        !self.loss_buffer.is_empty() || !self.loss_buf_metas.is_empty()
    }

    /// Move the in-flight range at `offset` to the loss buffer.
    pub fn mark_lost(&mut self, offset: u64) -> bool {
        let Some(buf) = self.retransmission_buffer.remove(&offset) else {
            return false;
        };
        let at = self.loss_buffer.partition_point(|b| b.offset < offset);
        self.loss_buffer.insert(at, buf);
        true
    }

    /// Drop the in-flight range at `offset`.
    pub fn on_acked(&mut self, offset: u64) -> bool {
        self.retransmission_buffer.remove(&offset).is_some()
    }

    /// Total bytes still owed to the peer across all regions.
    pub fn unacked_len(&self) -> u64 {
        let in_flight: u64 = self.retransmission_buffer.values().map(StreamBuffer::len).sum();
        let lost: u64 = self.loss_buffer.iter().map(StreamBuffer::len).sum();
        in_flight + lost + self.write_buffer.len() as u64
    }
}

// ─── Stream State ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct StreamFlowControl {
    /// Largest offset the peer lets us send up to.
    pub peer_advertised_max_offset: u64,
    /// Largest offset we have told the peer it may send.
    pub advertised_max_offset: u64,
    pub window_size: u64,
    pub current_read_offset: u64,
    pub last_window_update_sent: Option<quanta::Instant>,
}

impl StreamFlowControl {
    /// Offset to put in the next MAX_STREAM_DATA frame.
    pub fn max_stream_data_to_advertise(&self) -> u64 {
        self.current_read_offset + self.window_size
    }
}

#[derive(Debug, Clone)]
pub struct StreamState {
    pub id: StreamId,
    pub send: SendStreamBuffers,
    pub flow_control: StreamFlowControl,
}

impl StreamState {
    pub fn new(id: StreamId, peer_max_offset: u64) -> Self {
        StreamState {
            id,
            send: SendStreamBuffers::new(),
            flow_control: StreamFlowControl {
                peer_advertised_max_offset: peer_max_offset,
                ..StreamFlowControl::default()
            },
        }
    }

    /// Bytes the peer still allows on this stream.
    pub fn send_window_available(&self) -> u64 {
        self.flow_control
            .peer_advertised_max_offset
            .saturating_sub(self.send.current_write_offset)
    }
}

/// Crypto data for each encryption level that carries it.
#[derive(Debug, Clone, Default)]
pub struct CryptoStreams {
    pub initial: SendStreamBuffers,
    pub handshake: SendStreamBuffers,
    pub one_rtt: SendStreamBuffers,
}

impl CryptoStreams {
    /// 0-RTT carries no crypto frames.
    pub fn for_level_mut(
        &mut self,
        level: crate::types::EncryptionLevel,
    ) -> Option<&mut SendStreamBuffers> {
        use crate::types::EncryptionLevel;
        match level {
            EncryptionLevel::Initial => Some(&mut self.initial),
            EncryptionLevel::Handshake => Some(&mut self.handshake),
            EncryptionLevel::AppData => Some(&mut self.one_rtt),
            EncryptionLevel::EarlyData => None,
        }
    }

    pub fn for_level(&self, level: crate::types::EncryptionLevel) -> Option<&SendStreamBuffers> {
        use crate::types::EncryptionLevel;
        match level {
            EncryptionLevel::Initial => Some(&self.initial),
            EncryptionLevel::Handshake => Some(&self.handshake),
            EncryptionLevel::AppData => Some(&self.one_rtt),
            EncryptionLevel::EarlyData => None,
        }
    }
}

// ─── Stream Manager ─────────────────────────────────────────────────────────

/// Streams plus the sets the schedulers walk.
#[derive(Debug, Default)]
pub struct StreamManager {
    streams: HashMap<StreamId, StreamState>,
    writable: BTreeSet<StreamId>,
    loss: BTreeSet<StreamId>,
    window_updates: BTreeSet<StreamId>,
    blocked: BTreeMap<StreamId, StreamDataBlockedFrame>,
    tx: BTreeSet<StreamId>,
    remote_bidi_limit_update: Option<u64>,
    remote_uni_limit_update: Option<u64>,
}

impl StreamManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, stream: StreamState) {
        self.streams.insert(stream.id, stream);
    }

    pub fn get_stream(&self, id: StreamId) -> Option<&StreamState> {
        self.streams.get(&id)
    }

    pub fn get_stream_mut(&mut self, id: StreamId) -> Option<&mut StreamState> {
        self.streams.get_mut(&id)
    }

    pub fn streams(&self) -> impl Iterator<Item = &StreamState> {
        self.streams.values()
    }

    /// Recompute whether `id` has new data it may send now.
    pub fn update_writable_streams(&mut self, id: StreamId) {
        let Some(stream) = self.streams.get(&id) else {
            return;
        };
        let writable = (stream.send_window_available() > 0 && !stream.send.write_buffer.is_empty())
            || stream.send.has_pending_fin();
        if writable {
            self.writable.insert(id);
        } else {
            self.writable.remove(&id);
        }
    }

    pub fn update_loss_streams(&mut self, id: StreamId) {
        let Some(stream) = self.streams.get(&id) else {
            return;
        };
        if stream.send.has_lost_data() {
            self.loss.insert(id);
        } else {
            self.loss.remove(&id);
        }
    }

    /// Queue application bytes on `id` and refresh its writability.
    /// Returns false if the stream does not exist.
    pub fn write_to_stream(&mut self, id: StreamId, data: Bytes, eof: bool) -> bool {
        let Some(stream) = self.streams.get_mut(&id) else {
            return false;
        };
        stream.send.write(data, eof);
        self.update_writable_streams(id);
        true
    }

    pub fn has_writable(&self) -> bool {
        !self.writable.is_empty() || !self.loss.is_empty()
    }

    pub fn has_new_data_writable(&self) -> bool {
        !self.writable.is_empty()
    }

    pub fn has_loss(&self) -> bool {
        !self.loss.is_empty()
    }

    pub fn writable_streams(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.writable.iter().copied()
    }

    pub fn loss_streams(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.loss.iter().copied()
    }

    pub fn queue_window_update(&mut self, id: StreamId) {
        self.window_updates.insert(id);
    }

    pub fn remove_window_update(&mut self, id: StreamId) {
        self.window_updates.remove(&id);
    }

    pub fn has_window_updates(&self) -> bool {
        !self.window_updates.is_empty()
    }

    pub fn window_updates(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.window_updates.iter().copied()
    }

    pub fn queue_blocked(&mut self, id: StreamId, data_limit: u64) {
        self.blocked.insert(
            id,
            StreamDataBlockedFrame {
                stream_id: id,
                data_limit,
            },
        );
    }

    pub fn remove_blocked(&mut self, id: StreamId) {
        self.blocked.remove(&id);
    }

    pub fn has_blocked(&self) -> bool {
        !self.blocked.is_empty()
    }

    pub fn blocked(&self) -> impl Iterator<Item = &StreamDataBlockedFrame> {
        self.blocked.values()
    }

    /// Streams that have sent new data since the last `take_tx`.
    pub fn add_tx(&mut self, id: StreamId) {
        self.tx.insert(id);
    }

    pub fn take_tx(&mut self) -> BTreeSet<StreamId> {
        std::mem::take(&mut self.tx)
    }

    pub fn set_remote_stream_limit_update(&mut self, max_streams: u64, bidirectional: bool) {
        if bidirectional {
            self.remote_bidi_limit_update = Some(max_streams);
        } else {
            self.remote_uni_limit_update = Some(max_streams);
        }
    }

    /// Pending MAX_STREAMS frames to queue, consuming the updates.
    pub fn take_stream_limit_updates(&mut self) -> Vec<SimpleFrame> {
        let mut out = Vec::new();
        if let Some(max_streams) = self.remote_bidi_limit_update.take() {
            out.push(SimpleFrame::MaxStreams {
                max_streams,
                bidirectional: true,
            });
        }
        if let Some(max_streams) = self.remote_uni_limit_update.take() {
            out.push(SimpleFrame::MaxStreams {
                max_streams,
                bidirectional: false,
            });
        }
        out
    }
}
