//! # Write frames
//!
//! What a sent packet carried, as the ledger needs to see it, plus the
//! RFC 9000 §19 encoding used to serialize each frame into a packet body.
//!
//! Stream and crypto frames describe their payload by offset/length only;
//! the bytes themselves are appended by the packet builder after the frame
//! header.

use std::time::Duration;

use bytes::{BufMut, Bytes};

use crate::codec::{put_varint, varint_len};
use crate::error::QuicErrorCode;
use crate::types::{ConnectionId, PacketNum, StreamId};

pub mod frame_type {
    pub const PADDING: u8 = 0x00;
    pub const PING: u8 = 0x01;
    pub const ACK: u8 = 0x02;
    pub const RESET_STREAM: u8 = 0x04;
    pub const STOP_SENDING: u8 = 0x05;
    pub const CRYPTO: u8 = 0x06;
    /// STREAM with OFF and LEN bits set; FIN is bit 0.
    pub const STREAM_OFF_LEN: u8 = 0x0e;
    pub const MAX_DATA: u8 = 0x10;
    pub const MAX_STREAM_DATA: u8 = 0x11;
    pub const MAX_STREAMS_BIDI: u8 = 0x12;
    pub const MAX_STREAMS_UNI: u8 = 0x13;
    pub const DATA_BLOCKED: u8 = 0x14;
    pub const STREAM_DATA_BLOCKED: u8 = 0x15;
    pub const NEW_CONNECTION_ID: u8 = 0x18;
    pub const RETIRE_CONNECTION_ID: u8 = 0x19;
    pub const PATH_CHALLENGE: u8 = 0x1a;
    pub const PATH_RESPONSE: u8 = 0x1b;
    pub const CONNECTION_CLOSE: u8 = 0x1c;
    pub const CONNECTION_CLOSE_APP: u8 = 0x1d;
    pub const HANDSHAKE_DONE: u8 = 0x1e;
}

/// ACK delay is sent in units of 2^3 microseconds.
pub const ACK_DELAY_EXPONENT: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteStreamFrame {
    pub stream_id: StreamId,
    pub offset: u64,
    pub len: u64,
    pub fin: bool,
    /// Payload described by a buffer-meta (sent by another data path), not
    /// by bytes in this packet.
    pub from_buf_meta: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteCryptoFrame {
    pub offset: u64,
    pub len: u64,
}

/// An inclusive range of acknowledged packet numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckBlock {
    pub start: PacketNum,
    pub end: PacketNum,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAckFrame {
    /// Descending, non-overlapping; the front block holds the largest acked.
    pub ack_blocks: Vec<AckBlock>,
    pub ack_delay: Duration,
}

impl WriteAckFrame {
    pub fn largest_acked(&self) -> Option<PacketNum> {
        self.ack_blocks.first().map(|b| b.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RstStreamFrame {
    pub stream_id: StreamId,
    pub error_code: u64,
    pub final_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxDataFrame {
    pub maximum_data: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxStreamDataFrame {
    pub stream_id: StreamId,
    pub maximum_data: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataBlockedFrame {
    pub data_limit: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDataBlockedFrame {
    pub stream_id: StreamId,
    pub data_limit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCloseFrame {
    pub error_code: QuicErrorCode,
    pub reason_phrase: String,
}

/// Control frames tracked through the pending-events frame list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimpleFrame {
    PathChallenge {
        path_data: u64,
    },
    PathResponse {
        path_data: u64,
    },
    NewConnectionId {
        sequence_number: u64,
        retire_prior_to: u64,
        connection_id: ConnectionId,
        stateless_reset_token: [u8; 16],
    },
    RetireConnectionId {
        sequence_number: u64,
    },
    MaxStreams {
        max_streams: u64,
        bidirectional: bool,
    },
    StopSending {
        stream_id: StreamId,
        error_code: u64,
    },
    HandshakeDone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteFrame {
    Stream(WriteStreamFrame),
    Crypto(WriteCryptoFrame),
    Ack(WriteAckFrame),
    RstStream(RstStreamFrame),
    MaxData(MaxDataFrame),
    MaxStreamData(MaxStreamDataFrame),
    DataBlocked(DataBlockedFrame),
    StreamDataBlocked(StreamDataBlockedFrame),
    Ping,
    /// `len` consecutive PADDING bytes.
    Padding { len: usize },
    ConnectionClose(ConnectionCloseFrame),
    Simple(SimpleFrame),
}

// ─── Encoding ───────────────────────────────────────────────────────────────

fn ack_delay_units(delay: Duration) -> u64 {
    (delay.as_micros() as u64) >> ACK_DELAY_EXPONENT
}

/// Gap/length pairs following the first range, per RFC 9000 §19.3.1.
fn ack_ranges(blocks: &[AckBlock]) -> impl Iterator<Item = (u64, u64)> + '_ {
    blocks.windows(2).map(|pair| {
        let (prev, block) = (pair[0], pair[1]);
        (prev.start - block.end - 2, block.end - block.start)
    })
}

fn close_error_code(code: &QuicErrorCode) -> (u8, u64) {
    match code {
        QuicErrorCode::Application(code) => (frame_type::CONNECTION_CLOSE_APP, *code),
        QuicErrorCode::Transport(code) => (frame_type::CONNECTION_CLOSE, code.code()),
        // Local errors go out as INTERNAL_ERROR; callers normally map them first.
        QuicErrorCode::Local(_) => (frame_type::CONNECTION_CLOSE, 0x1),
    }
}

impl SimpleFrame {
    pub fn encoded_len(&self) -> usize {
        match self {
            SimpleFrame::PathChallenge { .. } | SimpleFrame::PathResponse { .. } => 1 + 8,
            SimpleFrame::NewConnectionId {
                sequence_number,
                retire_prior_to,
                connection_id,
                ..
            } => {
                1 + varint_len(*sequence_number)
                    + varint_len(*retire_prior_to)
                    + 1
                    + connection_id.len()
                    + 16
            }
            SimpleFrame::RetireConnectionId { sequence_number } => 1 + varint_len(*sequence_number),
            SimpleFrame::MaxStreams { max_streams, .. } => 1 + varint_len(*max_streams),
            SimpleFrame::StopSending {
                stream_id,
                error_code,
            } => 1 + varint_len(*stream_id) + varint_len(*error_code),
            SimpleFrame::HandshakeDone => 1,
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        match self {
            SimpleFrame::PathChallenge { path_data } => {
                buf.put_u8(frame_type::PATH_CHALLENGE);
                buf.put_u64(*path_data);
            }
            SimpleFrame::PathResponse { path_data } => {
                buf.put_u8(frame_type::PATH_RESPONSE);
                buf.put_u64(*path_data);
            }
            SimpleFrame::NewConnectionId {
                sequence_number,
                retire_prior_to,
                connection_id,
                stateless_reset_token,
            } => {
                buf.put_u8(frame_type::NEW_CONNECTION_ID);
                put_varint(buf, *sequence_number);
                put_varint(buf, *retire_prior_to);
                buf.put_u8(connection_id.len() as u8);
                buf.put_slice(connection_id.as_bytes());
                buf.put_slice(stateless_reset_token);
            }
            SimpleFrame::RetireConnectionId { sequence_number } => {
                buf.put_u8(frame_type::RETIRE_CONNECTION_ID);
                put_varint(buf, *sequence_number);
            }
            SimpleFrame::MaxStreams {
                max_streams,
                bidirectional,
            } => {
                buf.put_u8(if *bidirectional {
                    frame_type::MAX_STREAMS_BIDI
                } else {
                    frame_type::MAX_STREAMS_UNI
                });
                put_varint(buf, *max_streams);
            }
            SimpleFrame::StopSending {
                stream_id,
                error_code,
            } => {
                buf.put_u8(frame_type::STOP_SENDING);
                put_varint(buf, *stream_id);
                put_varint(buf, *error_code);
            }
            SimpleFrame::HandshakeDone => buf.put_u8(frame_type::HANDSHAKE_DONE),
        }
    }
}

impl WriteFrame {
    /// Size of the encoded frame, excluding stream/crypto payload bytes.
    pub fn encoded_len(&self) -> usize {
        match self {
            WriteFrame::Stream(f) => {
                1 + varint_len(f.stream_id) + varint_len(f.offset) + varint_len(f.len)
            }
            WriteFrame::Crypto(f) => 1 + varint_len(f.offset) + varint_len(f.len),
            WriteFrame::Ack(f) => {
                let Some(first) = f.ack_blocks.first() else {
                    return 0;
                };
                let ranges: usize = ack_ranges(&f.ack_blocks)
                    .map(|(gap, len)| varint_len(gap) + varint_len(len))
                    .sum();
                1 + varint_len(first.end)
                    + varint_len(ack_delay_units(f.ack_delay))
                    + varint_len(f.ack_blocks.len() as u64 - 1)
                    + varint_len(first.end - first.start)
                    + ranges
            }
            WriteFrame::RstStream(f) => {
                1 + varint_len(f.stream_id) + varint_len(f.error_code) + varint_len(f.final_size)
            }
            WriteFrame::MaxData(f) => 1 + varint_len(f.maximum_data),
            WriteFrame::MaxStreamData(f) => {
                1 + varint_len(f.stream_id) + varint_len(f.maximum_data)
            }
            WriteFrame::DataBlocked(f) => 1 + varint_len(f.data_limit),
            WriteFrame::StreamDataBlocked(f) => {
                1 + varint_len(f.stream_id) + varint_len(f.data_limit)
            }
            WriteFrame::Ping => 1,
            WriteFrame::Padding { len } => *len,
            WriteFrame::ConnectionClose(f) => {
                let (ty, code) = close_error_code(&f.error_code);
                let frame_type_len = if ty == frame_type::CONNECTION_CLOSE { 1 } else { 0 };
                1 + varint_len(code)
                    + frame_type_len
                    + varint_len(f.reason_phrase.len() as u64)
                    + f.reason_phrase.len()
            }
            WriteFrame::Simple(f) => f.encoded_len(),
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        match self {
            WriteFrame::Stream(f) => {
                let fin = if f.fin { 0x01 } else { 0x00 };
                buf.put_u8(frame_type::STREAM_OFF_LEN | fin);
                put_varint(buf, f.stream_id);
                put_varint(buf, f.offset);
                put_varint(buf, f.len);
            }
            WriteFrame::Crypto(f) => {
                buf.put_u8(frame_type::CRYPTO);
                put_varint(buf, f.offset);
                put_varint(buf, f.len);
            }
            WriteFrame::Ack(f) => {
                let Some(first) = f.ack_blocks.first() else {
                    return;
                };
                buf.put_u8(frame_type::ACK);
                put_varint(buf, first.end);
                put_varint(buf, ack_delay_units(f.ack_delay));
                put_varint(buf, f.ack_blocks.len() as u64 - 1);
                put_varint(buf, first.end - first.start);
                for (gap, len) in ack_ranges(&f.ack_blocks) {
                    put_varint(buf, gap);
                    put_varint(buf, len);
                }
            }
            WriteFrame::RstStream(f) => {
                buf.put_u8(frame_type::RESET_STREAM);
                put_varint(buf, f.stream_id);
                put_varint(buf, f.error_code);
                put_varint(buf, f.final_size);
            }
            WriteFrame::MaxData(f) => {
                buf.put_u8(frame_type::MAX_DATA);
                put_varint(buf, f.maximum_data);
            }
            WriteFrame::MaxStreamData(f) => {
                buf.put_u8(frame_type::MAX_STREAM_DATA);
                put_varint(buf, f.stream_id);
                put_varint(buf, f.maximum_data);
            }
            WriteFrame::DataBlocked(f) => {
                buf.put_u8(frame_type::DATA_BLOCKED);
                put_varint(buf, f.data_limit);
            }
            WriteFrame::StreamDataBlocked(f) => {
                buf.put_u8(frame_type::STREAM_DATA_BLOCKED);
                put_varint(buf, f.stream_id);
                put_varint(buf, f.data_limit);
            }
            WriteFrame::Ping => buf.put_u8(frame_type::PING),
            WriteFrame::Padding { len } => buf.put_bytes(frame_type::PADDING, *len),
            WriteFrame::ConnectionClose(f) => {
                let (ty, code) = close_error_code(&f.error_code);
                buf.put_u8(ty);
                put_varint(buf, code);
                if ty == frame_type::CONNECTION_CLOSE {
                    // Triggering frame type is not tracked on the send path.
                    buf.put_u8(0);
                }
                put_varint(buf, f.reason_phrase.len() as u64);
                buf.put_slice(f.reason_phrase.as_bytes());
            }
            WriteFrame::Simple(f) => f.encode(buf),
        }
    }

    /// Serialized header plus an optional payload, as one buffer. Used by
    /// tests and by callers that want to inspect a frame outside a builder.
    pub fn to_bytes(&self, payload: &[u8]) -> Bytes {
        let mut out = Vec::with_capacity(self.encoded_len() + payload.len());
        self.encode(&mut out);
        out.extend_from_slice(payload);
        Bytes::from(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::VarInt;
    use crate::error::TransportErrorCode;
    use bytes::Buf;

    fn roundtrip_len(frame: &WriteFrame) {
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        assert_eq!(buf.len(), frame.encoded_len(), "{frame:?}");
    }

    #[test]
    fn encoded_len_matches_encoding() {
        let frames = [
            WriteFrame::Stream(WriteStreamFrame {
                stream_id: 4,
                offset: 1 << 20,
                len: 1000,
                fin: true,
                from_buf_meta: false,
            }),
            WriteFrame::Crypto(WriteCryptoFrame { offset: 0, len: 300 }),
            WriteFrame::Ack(WriteAckFrame {
                ack_blocks: vec![
                    AckBlock { start: 90, end: 100 },
                    AckBlock { start: 10, end: 50 },
                    AckBlock { start: 0, end: 5 },
                ],
                ack_delay: Duration::from_millis(25),
            }),
            WriteFrame::RstStream(RstStreamFrame {
                stream_id: 8,
                error_code: 7,
                final_size: 70_000,
            }),
            WriteFrame::MaxData(MaxDataFrame { maximum_data: 1 << 30 }),
            WriteFrame::Padding { len: 17 },
            WriteFrame::ConnectionClose(ConnectionCloseFrame {
                error_code: QuicErrorCode::Transport(TransportErrorCode::NoError),
                reason_phrase: "bye".into(),
            }),
            WriteFrame::Simple(SimpleFrame::NewConnectionId {
                sequence_number: 1,
                retire_prior_to: 0,
                connection_id: ConnectionId::new(&[1, 2, 3, 4]).unwrap(),
                stateless_reset_token: [0xaa; 16],
            }),
            WriteFrame::Simple(SimpleFrame::PathChallenge { path_data: 42 }),
        ];
        for frame in &frames {
            roundtrip_len(frame);
        }
    }

    #[test]
    fn ack_ranges_encode_gaps() {
        let frame = WriteFrame::Ack(WriteAckFrame {
            ack_blocks: vec![AckBlock { start: 8, end: 10 }, AckBlock { start: 2, end: 4 }],
            ack_delay: Duration::ZERO,
        });
        let bytes = frame.to_bytes(&[]);
        let mut b = &bytes[..];
        assert_eq!(b.get_u8(), frame_type::ACK);
        let mut next = || VarInt::decode(&mut b).unwrap().into_inner();
        assert_eq!(next(), 10); // largest
        assert_eq!(next(), 0); // delay
        assert_eq!(next(), 1); // range count
        assert_eq!(next(), 2); // first range
        assert_eq!(next(), 8 - 4 - 2); // gap
        assert_eq!(next(), 2); // length
    }

    #[test]
    fn stream_frame_fin_bit() {
        let frame = WriteFrame::Stream(WriteStreamFrame {
            stream_id: 0,
            offset: 0,
            len: 3,
            fin: true,
            from_buf_meta: false,
        });
        let bytes = frame.to_bytes(b"abc");
        assert_eq!(bytes[0], 0x0f);
        assert_eq!(&bytes[bytes.len() - 3..], b"abc");
    }
}
