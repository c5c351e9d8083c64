//! # Variable-length integers (RFC 9000 §16)
//!
//! Every length, offset and id in a QUIC frame is a varint. The packet
//! builders only ever encode; `decode` exists for tests that inspect output.

use bytes::{Buf, BufMut};
use std::fmt;

/// A 62-bit integer encoded in 1, 2, 4, or 8 bytes.
///
/// - `0x00..0x3F` → 1 byte, prefix `00`
/// - `0x40..0x3FFF` → 2 bytes, prefix `01`
/// - `0x4000..0x3FFF_FFFF` → 4 bytes, prefix `10`
/// - up to `2^62 - 1` → 8 bytes, prefix `11`
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarInt(u64);

impl VarInt {
    pub const MAX: u64 = 0x3FFF_FFFF_FFFF_FFFF;

    /// `None` if the value needs more than 62 bits.
    #[inline]
    pub fn new(val: u64) -> Option<Self> {
        (val <= Self::MAX).then_some(VarInt(val))
    }

    /// Panics past 62 bits. Offsets and lengths in this crate never get there.
    #[inline]
    pub fn from_u64(val: u64) -> Self {
        assert!(val <= Self::MAX, "varint value {val} exceeds 62 bits");
        VarInt(val)
    }

    #[inline]
    pub fn into_inner(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn encoded_len(self) -> usize {
        varint_len(self.0)
    }

    /// Big-endian, with the two-bit length tag in the top of the first byte.
    pub fn encode(self, buf: &mut impl BufMut) {
        let len = self.encoded_len();
        let tag = len.trailing_zeros() as u64;
        let wire = (tag << (len * 8 - 2)) | self.0;
        buf.put_slice(&wire.to_be_bytes()[8 - len..]);
    }

    /// `None` if the buffer is too short.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if !buf.has_remaining() {
            return None;
        }
        let first = buf.chunk()[0];
        let len = 1usize << (first >> 6);
        if buf.remaining() < len {
            return None;
        }
        let val = match len {
            1 => {
                buf.advance(1);
                (first & 0x3F) as u64
            }
            2 => (buf.get_u16() & 0x3FFF) as u64,
            4 => (buf.get_u32() & 0x3FFF_FFFF) as u64,
            _ => buf.get_u64() & 0x3FFF_FFFF_FFFF_FFFF,
        };
        Some(VarInt(val))
    }
}

impl fmt::Debug for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VarInt({})", self.0)
    }
}

/// Encoded size of `val` as a varint.
#[inline]
pub fn varint_len(val: u64) -> usize {
    if val < 0x40 {
        1
    } else if val < 0x4000 {
        2
    } else if val < 0x4000_0000 {
        4
    } else {
        8
    }
}

#[inline]
pub fn put_varint(buf: &mut impl BufMut, val: u64) {
    VarInt::from_u64(val).encode(buf)
}

/// Two-byte varint form used for the long-header Length field, which is
/// reserved before the body size is known and patched afterwards.
pub fn put_varint_fixed2(out: &mut [u8], val: u64) {
    assert!(val < 0x4000, "value {val} does not fit a 2-byte varint");
    out[..2].copy_from_slice(&(0x4000u16 | val as u16).to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn encoded_len_boundaries() {
        assert_eq!(varint_len(0x3F), 1);
        assert_eq!(varint_len(0x40), 2);
        assert_eq!(varint_len(0x3FFF), 2);
        assert_eq!(varint_len(0x4000), 4);
        assert_eq!(varint_len(0x4000_0000), 8);
    }

    #[test]
    fn rfc_example_encodings() {
        // RFC 9000 Appendix A.1
        let mut buf = BytesMut::new();
        put_varint(&mut buf, 15293);
        assert_eq!(&buf[..], &[0x7b, 0xbd]);

        let mut buf = BytesMut::new();
        put_varint(&mut buf, 494_878_333);
        assert_eq!(&buf[..], &[0x9d, 0x7f, 0x3e, 0x7d]);
        assert_eq!(VarInt::decode(&mut &buf[..]).unwrap().into_inner(), 494_878_333);
    }

    #[test]
    fn fixed2_patch() {
        let mut out = [0u8; 2];
        put_varint_fixed2(&mut out, 1200);
        assert_eq!(VarInt::decode(&mut &out[..]).unwrap().into_inner(), 1200);
    }

    #[test]
    #[should_panic]
    fn fixed2_overflow_panics() {
        let mut out = [0u8; 2];
        put_varint_fixed2(&mut out, 0x4000);
    }
}
