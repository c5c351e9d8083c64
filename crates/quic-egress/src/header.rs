//! # Packet headers
//!
//! ## Long header (Initial, 0-RTT, Handshake)
//!
//! ```text
//! +-+-+-+-+-+-+-+-+
//! |1|1|T T|R R|P P|   T = type, P = packet number length - 1
//! +-+-+-+-+-+-+-+-+
//! | Version (32) | DCID Len (8) | DCID | SCID Len (8) | SCID |
//! | [Initial only: Token Length (varint) | Token]            |
//! | Length (varint, always 2 bytes here) | Packet Number (8..32) |
//! ```
//!
//! ## Short header (1-RTT)
//!
//! ```text
//! +-+-+-+-+-+-+-+-+
//! |0|1|S|R|R|K|P P|   K = key phase
//! +-+-+-+-+-+-+-+-+
//! | DCID | Packet Number (8..32) |
//! ```
//!
//! The Length field is reserved at encode time and patched by the packet
//! builder once the body and cipher overhead are known.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::put_varint;
use crate::types::{
    ConnectionId, HeaderForm, PacketNum, PacketNumberSpace, ProtectionType, QuicVersion,
};

/// Packet numbers are never encoded in more than four bytes.
pub const MAX_PACKET_NUM_ENCODING_SIZE: usize = 4;

const HEADER_FORM_BIT: u8 = 0x80;
const FIXED_BIT: u8 = 0x40;
const KEY_PHASE_BIT: u8 = 0x04;
const PACKET_NUM_LEN_MASK: u8 = 0x03;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LongHeaderType {
    Initial,
    ZeroRtt,
    Handshake,
}

impl LongHeaderType {
    pub fn packet_number_space(self) -> PacketNumberSpace {
        match self {
            LongHeaderType::Initial => PacketNumberSpace::Initial,
            LongHeaderType::Handshake => PacketNumberSpace::Handshake,
            LongHeaderType::ZeroRtt => PacketNumberSpace::AppData,
        }
    }

    pub fn protection_type(self) -> ProtectionType {
        match self {
            LongHeaderType::Initial => ProtectionType::Initial,
            LongHeaderType::Handshake => ProtectionType::Handshake,
            LongHeaderType::ZeroRtt => ProtectionType::ZeroRtt,
        }
    }

    fn type_bits(self) -> u8 {
        match self {
            LongHeaderType::Initial => 0x00,
            LongHeaderType::ZeroRtt => 0x01,
            LongHeaderType::Handshake => 0x02,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongHeader {
    pub header_type: LongHeaderType,
    pub source_conn_id: ConnectionId,
    pub destination_conn_id: ConnectionId,
    pub packet_num: PacketNum,
    pub version: QuicVersion,
    /// Only encoded for Initial packets.
    pub token: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortHeader {
    pub protection_type: ProtectionType,
    pub destination_conn_id: ConnectionId,
    pub packet_num: PacketNum,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketHeader {
    Long(LongHeader),
    Short(ShortHeader),
}

/// Byte layout of an encoded header, relative to its first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedHeader {
    pub header_len: usize,
    pub packet_num_len: usize,
    pub length_field_offset: Option<usize>,
}

/// A packet number truncated for the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketNumEncoding {
    pub length: usize,
    pub truncated: u64,
}

/// Pick the shortest encoding that lets the peer recover `packet_num` given
/// the largest packet number it has acknowledged (RFC 9000 §17.1).
pub fn encode_packet_number(
    packet_num: PacketNum,
    largest_acked: Option<PacketNum>,
) -> PacketNumEncoding {
    let num_unacked = match largest_acked {
        Some(largest) => packet_num.saturating_sub(largest),
        None => packet_num.saturating_add(1),
    };
    let twice = num_unacked.saturating_mul(2);
    let length = (1..=MAX_PACKET_NUM_ENCODING_SIZE)
        .find(|len| twice < 1u64 << (8 * len))
        .unwrap_or(MAX_PACKET_NUM_ENCODING_SIZE);
    let mask = (1u64 << (8 * length)) - 1;
    PacketNumEncoding {
        length,
        truncated: packet_num & mask,
    }
}

/// Packet-number length from an unprotected first byte.
pub fn packet_number_length(first_byte: u8) -> usize {
    (first_byte & PACKET_NUM_LEN_MASK) as usize + 1
}

impl PacketHeader {
    pub fn packet_num(&self) -> PacketNum {
        match self {
            PacketHeader::Long(h) => h.packet_num,
            PacketHeader::Short(h) => h.packet_num,
        }
    }

    pub fn packet_number_space(&self) -> PacketNumberSpace {
        match self {
            PacketHeader::Long(h) => h.header_type.packet_number_space(),
            PacketHeader::Short(_) => PacketNumberSpace::AppData,
        }
    }

    pub fn header_form(&self) -> HeaderForm {
        match self {
            PacketHeader::Long(_) => HeaderForm::Long,
            PacketHeader::Short(_) => HeaderForm::Short,
        }
    }

    pub fn protection_type(&self) -> ProtectionType {
        match self {
            PacketHeader::Long(h) => h.header_type.protection_type(),
            PacketHeader::Short(h) => h.protection_type,
        }
    }

    /// Append the unprotected header to `buf`.
    pub fn encode(&self, buf: &mut BytesMut, largest_acked: Option<PacketNum>) -> EncodedHeader {
        let start = buf.len();
        let pn = encode_packet_number(self.packet_num(), largest_acked);
        let pn_bits = (pn.length - 1) as u8;

        let length_field_offset = match self {
            PacketHeader::Long(h) => {
                buf.put_u8(HEADER_FORM_BIT | FIXED_BIT | (h.header_type.type_bits() << 4) | pn_bits);
                buf.put_u32(h.version.0);
                buf.put_u8(h.destination_conn_id.len() as u8);
                buf.put_slice(h.destination_conn_id.as_bytes());
                buf.put_u8(h.source_conn_id.len() as u8);
                buf.put_slice(h.source_conn_id.as_bytes());
                if h.header_type == LongHeaderType::Initial {
                    put_varint(buf, h.token.len() as u64);
                    buf.put_slice(&h.token);
                }
                let offset = buf.len() - start;
                buf.put_u16(0x4000);
                Some(offset)
            }
            PacketHeader::Short(h) => {
                let key_phase = if h.protection_type == ProtectionType::KeyPhaseOne {
                    KEY_PHASE_BIT
                } else {
                    0
                };
                buf.put_u8(FIXED_BIT | key_phase | pn_bits);
                buf.put_slice(h.destination_conn_id.as_bytes());
                None
            }
        };

        let pn_bytes = pn.truncated.to_be_bytes();
        buf.put_slice(&pn_bytes[8 - pn.length..]);

        EncodedHeader {
            header_len: buf.len() - start,
            packet_num_len: pn.length,
            length_field_offset,
        }
    }
}

// ─── Header Builder ─────────────────────────────────────────────────────────

/// Produces the header for each packet of a transmit pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderBuilder {
    Long(LongHeaderType),
    Short,
}

impl HeaderBuilder {
    pub fn build(
        &self,
        src: &ConnectionId,
        dst: &ConnectionId,
        packet_num: PacketNum,
        version: QuicVersion,
        token: &Bytes,
    ) -> PacketHeader {
        match *self {
            HeaderBuilder::Long(header_type) => PacketHeader::Long(LongHeader {
                header_type,
                source_conn_id: *src,
                destination_conn_id: *dst,
                packet_num,
                version,
                token: token.clone(),
            }),
            HeaderBuilder::Short => PacketHeader::Short(ShortHeader {
                protection_type: ProtectionType::KeyPhaseZero,
                destination_conn_id: *dst,
                packet_num,
            }),
        }
    }

    pub fn packet_number_space(&self) -> PacketNumberSpace {
        match self {
            HeaderBuilder::Long(t) => t.packet_number_space(),
            HeaderBuilder::Short => PacketNumberSpace::AppData,
        }
    }
}
