//! # Packet builders
//!
//! A builder owns one packet under construction: the encoded header, the
//! body bytes written so far, and the list of frames that went in. The
//! scheduler only sees the [`PacketBuilder`] trait; the assembler owns the
//! concrete type and turns it into a [`BuiltPacket`].
//!
//! - [`InplacePacketBuilder`] writes straight into the connection's send
//!   arena, after whatever packets are already batched there.
//! - [`RegularPacketBuilder`] keeps a separate header buffer and a chain of
//!   body segments, so stream payload can be referenced rather than copied.
//!
//! Both pad short bodies so the header-protection sample always exists.

use bytes::{Bytes, BytesMut};

use crate::arena::SendBufAccessor;
use crate::codec::put_varint_fixed2;
use crate::crypto::SAMPLE_LEN;
use crate::frame::{frame_type, WriteCryptoFrame, WriteFrame, WriteStreamFrame};
use crate::header::{EncodedHeader, PacketHeader, MAX_PACKET_NUM_ENCODING_SIZE};
use crate::types::{PacketNum, StreamId};

/// What the scheduler sees while filling a packet.
pub trait PacketBuilder {
    fn header(&self) -> &PacketHeader;

    /// Body bytes still available, after header and cipher overhead.
    fn remaining_space(&self) -> usize;

    fn write_bytes(&mut self, data: &[u8]);

    /// Append payload the builder may keep by reference.
    fn insert_bytes(&mut self, data: Bytes) {
        self.write_bytes(&data);
    }

    /// Record a frame whose bytes have been written.
    fn push_frame(&mut self, frame: WriteFrame);

    fn frames(&self) -> &[WriteFrame];
}

/// The frame-level view of a sent packet, handed to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegularWritePacket {
    pub header: PacketHeader,
    pub frames: Vec<WriteFrame>,
}

/// A finished packet. Byte positions are relative to the packet start.
#[derive(Debug, Clone)]
pub struct BuiltPacket {
    pub packet: RegularWritePacket,
    pub header_len: usize,
    pub body_len: usize,
}

// ─── Frame Writers ──────────────────────────────────────────────────────────

/// Write a complete frame if it fits. Returns the bytes written, or 0.
pub fn write_frame(frame: WriteFrame, builder: &mut dyn PacketBuilder) -> usize {
    let len = frame.encoded_len();
    if len == 0 || len > builder.remaining_space() {
        return 0;
    }
    let mut encoded = Vec::with_capacity(len);
    frame.encode(&mut encoded);
    builder.write_bytes(&encoded);
    builder.push_frame(frame);
    len
}

/// Write as much of `data` as fits as a STREAM frame. `fin` is only set when
/// all of `data` fits. Returns the frame written, if any.
pub fn write_stream_frame(
    builder: &mut dyn PacketBuilder,
    stream_id: StreamId,
    offset: u64,
    data: Bytes,
    fin: bool,
) -> Option<WriteStreamFrame> {
    let mut frame = WriteStreamFrame {
        stream_id,
        offset,
        len: data.len() as u64,
        fin,
        from_buf_meta: false,
    };
    let header_len = WriteFrame::Stream(frame.clone()).encoded_len();
    let space = builder.remaining_space().checked_sub(header_len)?;
    let len = data.len().min(space);
    if len == 0 && !(fin && data.is_empty()) {
        return None;
    }
    frame.len = len as u64;
    frame.fin = fin && len == data.len();

    let mut encoded = Vec::with_capacity(header_len);
    WriteFrame::Stream(frame.clone()).encode(&mut encoded);
    builder.write_bytes(&encoded);
    builder.insert_bytes(data.slice(..len));
    builder.push_frame(WriteFrame::Stream(frame.clone()));
    Some(frame)
}

/// Write as much of `data` as fits as a CRYPTO frame.
pub fn write_crypto_frame(
    builder: &mut dyn PacketBuilder,
    offset: u64,
    data: Bytes,
) -> Option<WriteCryptoFrame> {
    let mut frame = WriteCryptoFrame {
        offset,
        len: data.len() as u64,
    };
    let header_len = WriteFrame::Crypto(frame).encoded_len();
    let space = builder.remaining_space().checked_sub(header_len)?;
    let len = data.len().min(space);
    if len == 0 {
        return None;
    }
    frame.len = len as u64;

    let mut encoded = Vec::with_capacity(header_len);
    WriteFrame::Crypto(frame).encode(&mut encoded);
    builder.write_bytes(&encoded);
    builder.insert_bytes(data.slice(..len));
    builder.push_frame(WriteFrame::Crypto(frame));
    Some(frame)
}

// ─── Shared State ───────────────────────────────────────────────────────────

#[derive(Debug)]
struct BuilderCore {
    header: PacketHeader,
    encoded: EncodedHeader,
    remaining: usize,
    cipher_overhead: usize,
    body_len: usize,
    frames: Vec<WriteFrame>,
}

impl BuilderCore {
    fn new(header: PacketHeader, encoded: EncodedHeader, remaining: usize) -> Self {
        BuilderCore {
            header,
            encoded,
            remaining: remaining.saturating_sub(encoded.header_len),
            cipher_overhead: 0,
            body_len: 0,
            frames: Vec::new(),
        }
    }

    fn account_for_cipher_overhead(&mut self, overhead: usize) {
        self.cipher_overhead = overhead;
        self.remaining = self.remaining.saturating_sub(overhead);
    }

    fn wrote(&mut self, n: usize) {
        debug_assert!(n <= self.remaining, "wrote past the end of the packet");
        self.remaining = self.remaining.saturating_sub(n);
        self.body_len += n;
    }

    /// Padding needed so body + tag covers the header-protection sample.
    fn padding_needed(&self) -> usize {
        if self.frames.is_empty() {
            return 0;
        }
        let min_body = MAX_PACKET_NUM_ENCODING_SIZE - self.encoded.packet_num_len + SAMPLE_LEN;
        let have = self.body_len + self.cipher_overhead;
        min_body.saturating_sub(have).min(self.remaining)
    }

    /// Value for the long-header Length field.
    fn length_field_value(&self) -> u64 {
        (self.encoded.packet_num_len + self.body_len + self.cipher_overhead) as u64
    }

    fn finish(self) -> BuiltPacket {
        BuiltPacket {
            packet: RegularWritePacket {
                header: self.header,
                frames: self.frames,
            },
            header_len: self.encoded.header_len,
            body_len: self.body_len,
        }
    }
}

// ─── In-place Builder ───────────────────────────────────────────────────────

/// Builds into the send arena. Holds the arena buffer from construction until
/// [`InplacePacketBuilder::build`] hands it back.
pub struct InplacePacketBuilder {
    buf: BytesMut,
    packet_start: usize,
    core: BuilderCore,
}

impl InplacePacketBuilder {
    pub fn new(
        accessor: &mut SendBufAccessor,
        remaining: usize,
        header: PacketHeader,
        largest_acked: Option<PacketNum>,
    ) -> Self {
        let mut buf = accessor.obtain();
        let packet_start = buf.len();
        let encoded = header.encode(&mut buf, largest_acked);
        InplacePacketBuilder {
            buf,
            packet_start,
            core: BuilderCore::new(header, encoded, remaining),
        }
    }

    pub fn account_for_cipher_overhead(&mut self, overhead: usize) {
        self.core.account_for_cipher_overhead(overhead);
    }

    /// Offset in the arena where this packet begins.
    pub fn packet_start(&self) -> usize {
        self.packet_start
    }

    /// Finish the packet and return the arena buffer to `accessor`.
    pub fn build(mut self, accessor: &mut SendBufAccessor) -> BuiltPacket {
        let pad = self.core.padding_needed();
        self.buf.resize(self.buf.len() + pad, frame_type::PADDING);
        self.core.wrote(pad);
        if let Some(offset) = self.core.encoded.length_field_offset {
            let at = self.packet_start + offset;
            put_varint_fixed2(&mut self.buf[at..at + 2], self.core.length_field_value());
        }
        accessor.release(self.buf);
        self.core.finish()
    }
}

impl PacketBuilder for InplacePacketBuilder {
    fn header(&self) -> &PacketHeader {
        &self.core.header
    }

    fn remaining_space(&self) -> usize {
        self.core.remaining
    }

    fn write_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        self.core.wrote(data.len());
    }

    fn push_frame(&mut self, frame: WriteFrame) {
        self.core.frames.push(frame);
    }

    fn frames(&self) -> &[WriteFrame] {
        &self.core.frames
    }
}

// ─── Chained Builder ────────────────────────────────────────────────────────

/// A packet whose body is a chain of segments.
#[derive(Debug)]
pub struct ChainedPacket {
    pub built: BuiltPacket,
    pub header: BytesMut,
    pub body: Vec<Bytes>,
}

pub struct RegularPacketBuilder {
    header_buf: BytesMut,
    body: Vec<Bytes>,
    tail: BytesMut,
    core: BuilderCore,
}

impl RegularPacketBuilder {
    pub fn new(remaining: usize, header: PacketHeader, largest_acked: Option<PacketNum>) -> Self {
        let mut header_buf = BytesMut::new();
        let encoded = header.encode(&mut header_buf, largest_acked);
        RegularPacketBuilder {
            header_buf,
            body: Vec::new(),
            tail: BytesMut::new(),
            core: BuilderCore::new(header, encoded, remaining),
        }
    }

    pub fn account_for_cipher_overhead(&mut self, overhead: usize) {
        self.core.account_for_cipher_overhead(overhead);
    }

    fn seal_tail(&mut self) {
        if !self.tail.is_empty() {
            self.body.push(self.tail.split().freeze());
        }
    }

    pub fn build(mut self) -> ChainedPacket {
        let pad = self.core.padding_needed();
        self.tail.resize(self.tail.len() + pad, frame_type::PADDING);
        self.core.wrote(pad);
        self.seal_tail();
        if let Some(offset) = self.core.encoded.length_field_offset {
            put_varint_fixed2(
                &mut self.header_buf[offset..offset + 2],
                self.core.length_field_value(),
            );
        }
        ChainedPacket {
            built: self.core.finish(),
            header: self.header_buf,
            body: self.body,
        }
    }
}

impl PacketBuilder for RegularPacketBuilder {
    fn header(&self) -> &PacketHeader {
        &self.core.header
    }

    fn remaining_space(&self) -> usize {
        self.core.remaining
    }

    fn write_bytes(&mut self, data: &[u8]) {
        self.tail.extend_from_slice(data);
        self.core.wrote(data.len());
    }

    fn insert_bytes(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.seal_tail();
        self.core.wrote(data.len());
        self.body.push(data);
    }

    fn push_frame(&mut self, frame: WriteFrame) {
        self.core.frames.push(frame);
    }

    fn frames(&self) -> &[WriteFrame] {
        &self.core.frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::HeaderBuilder;
    use crate::types::{ConnectionId, QuicVersion};

    fn short_header(pn: PacketNum) -> PacketHeader {
        let cid = ConnectionId::new(&[1, 2, 3, 4]).unwrap();
        HeaderBuilder::Short.build(&cid, &cid, pn, QuicVersion::V1, &Bytes::new())
    }

    #[test]
    fn regular_builder_keeps_payload_segments() {
        let mut builder = RegularPacketBuilder::new(1200, short_header(0), None);
        builder.account_for_cipher_overhead(16);
        let before = builder.remaining_space();
        let payload = Bytes::from(vec![7u8; 100]);
        let frame = write_stream_frame(&mut builder, 0, 0, payload, false).unwrap();
        assert_eq!(frame.len, 100);
        assert!(builder.remaining_space() < before - 100);

        let chained = builder.build();
        assert_eq!(chained.built.packet.frames.len(), 1);
        let body_len: usize = chained.body.iter().map(|b| b.len()).sum();
        assert_eq!(body_len, chained.built.body_len);
        assert_eq!(chained.header.len(), chained.built.header_len);
    }

    #[test]
    fn stream_frame_truncates_and_drops_fin() {
        let mut builder = RegularPacketBuilder::new(1200, short_header(0), None);
        builder.account_for_cipher_overhead(16);
        let space = builder.remaining_space();
        let frame =
            write_stream_frame(&mut builder, 4, 0, Bytes::from(vec![0u8; 5000]), true).unwrap();
        assert!(!frame.fin);
        assert!(frame.len < space as u64);
        assert_eq!(builder.remaining_space(), 0);
    }

    #[test]
    fn tiny_packets_are_padded_for_sampling() {
        let mut acc = SendBufAccessor::new(1500);
        let mut builder = InplacePacketBuilder::new(&mut acc, 1200, short_header(0), None);
        builder.account_for_cipher_overhead(16);
        assert_eq!(write_frame(WriteFrame::Ping, &mut builder), 1);
        let built = builder.build(&mut acc);
        // 1-byte pn: need 3 + 16 bytes of body+tag, so 3 body bytes.
        assert_eq!(built.body_len, 3);
        assert_eq!(acc.len(), built.header_len + built.body_len);
    }

    #[test]
    fn empty_packet_is_not_padded() {
        let mut acc = SendBufAccessor::new(1500);
        let builder = InplacePacketBuilder::new(&mut acc, 1200, short_header(0), None);
        let built = builder.build(&mut acc);
        assert!(built.packet.frames.is_empty());
        assert_eq!(built.body_len, 0);
    }

    #[test]
    fn long_header_length_is_patched() {
        use crate::codec::VarInt;
        use crate::header::LongHeaderType;

        let cid = ConnectionId::new(&[5; 8]).unwrap();
        let header = HeaderBuilder::Long(LongHeaderType::Handshake).build(
            &cid,
            &cid,
            3,
            QuicVersion::V1,
            &Bytes::new(),
        );
        let mut builder = RegularPacketBuilder::new(1200, header, None);
        builder.account_for_cipher_overhead(16);
        write_crypto_frame(&mut builder, 0, Bytes::from(vec![1u8; 40])).unwrap();
        let chained = builder.build();
        let offset = chained.built.header_len - 1 - 2;
        let len = VarInt::decode(&mut &chained.header[offset..]).unwrap().into_inner();
        assert_eq!(len as usize, 1 + chained.built.body_len + 16);
    }

    #[test]
    fn frame_that_does_not_fit_is_skipped() {
        let mut builder = RegularPacketBuilder::new(30, short_header(0), None);
        builder.account_for_cipher_overhead(16);
        let frame = WriteFrame::Simple(crate::frame::SimpleFrame::PathChallenge { path_data: 1 });
        assert_eq!(write_frame(frame, &mut builder), 0);
        assert!(builder.frames().is_empty());
    }
}
