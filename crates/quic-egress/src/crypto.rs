//! # Packet protection
//!
//! Two layers, applied in order by the assembler:
//!
//! 1. **AEAD** over the body, with the packet number as nonce input and the
//!    unprotected header as associated data. The tag is appended in place.
//! 2. **Header protection**: a 5-byte mask derived from a 16-byte sample of
//!    the encrypted body hides the low bits of the first byte and the
//!    packet-number bytes (RFC 9001 §5.4).
//!
//! Key derivation belongs to the handshake; this module only consumes keys.
//! ChaCha20-based implementations are provided for both traits.

use bytes::BytesMut;
use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::ChaCha20;
use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

use crate::error::CryptoError;

pub const SAMPLE_LEN: usize = 16;
pub const HEADER_MASK_LEN: usize = 5;
pub const AEAD_TAG_LEN: usize = 16;

pub type Sample = [u8; SAMPLE_LEN];

const LONG_HEADER_MASK_BITS: u8 = 0x0f;
const SHORT_HEADER_MASK_BITS: u8 = 0x1f;

/// Body encryption.
pub trait Aead {
    /// Encrypt `body` in place and append the authentication tag.
    fn inplace_encrypt(
        &self,
        body: &mut BytesMut,
        associated_data: &[u8],
        seq_num: u64,
    ) -> Result<(), CryptoError>;

    /// Bytes added to every packet body.
    fn cipher_overhead(&self) -> usize;
}

/// Header protection.
pub trait PacketNumberCipher {
    fn mask(&self, sample: &Sample) -> [u8; HEADER_MASK_LEN];

    fn encrypt_long_header(&self, sample: &Sample, first_byte: &mut u8, packet_num_bytes: &mut [u8]) {
        apply_mask(&self.mask(sample), LONG_HEADER_MASK_BITS, first_byte, packet_num_bytes);
    }

    fn encrypt_short_header(&self, sample: &Sample, first_byte: &mut u8, packet_num_bytes: &mut [u8]) {
        apply_mask(&self.mask(sample), SHORT_HEADER_MASK_BITS, first_byte, packet_num_bytes);
    }
}

fn apply_mask(mask: &[u8; HEADER_MASK_LEN], first_bits: u8, first_byte: &mut u8, pn: &mut [u8]) {
    *first_byte ^= mask[0] & first_bits;
    for (b, m) in pn.iter_mut().zip(&mask[1..]) {
        *b ^= m;
    }
}

// ─── ChaCha20-Poly1305 ──────────────────────────────────────────────────────

/// Key and IV for one direction at one encryption level.
#[derive(Clone)]
pub struct TrafficKey {
    pub key: [u8; 32],
    pub iv: [u8; 12],
}

/// RFC 9001 §5.3: the nonce is the IV XOR the left-padded packet number.
pub struct ChaCha20Poly1305Aead {
    cipher: ChaCha20Poly1305,
    iv: [u8; 12],
}

impl ChaCha20Poly1305Aead {
    pub fn new(key: &TrafficKey) -> Self {
        ChaCha20Poly1305Aead {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key.key)),
            iv: key.iv,
        }
    }

    fn nonce(&self, seq_num: u64) -> [u8; 12] {
        let mut nonce = self.iv;
        for (n, p) in nonce[4..].iter_mut().zip(seq_num.to_be_bytes()) {
            *n ^= p;
        }
        nonce
    }
}

impl Aead for ChaCha20Poly1305Aead {
    fn inplace_encrypt(
        &self,
        body: &mut BytesMut,
        associated_data: &[u8],
        seq_num: u64,
    ) -> Result<(), CryptoError> {
        let nonce = self.nonce(seq_num);
        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), associated_data, &mut body[..])
            .map_err(|_| CryptoError::EncryptionFailed)?;
        body.extend_from_slice(&tag);
        Ok(())
    }

    fn cipher_overhead(&self) -> usize {
        AEAD_TAG_LEN
    }
}

/// RFC 9001 §5.4.4: counter from the first four sample bytes (little
/// endian), nonce from the remaining twelve, mask = keystream over zeros.
pub struct ChaCha20HeaderCipher {
    key: [u8; 32],
}

impl ChaCha20HeaderCipher {
    pub fn new(key: [u8; 32]) -> Self {
        ChaCha20HeaderCipher { key }
    }
}

impl PacketNumberCipher for ChaCha20HeaderCipher {
    fn mask(&self, sample: &Sample) -> [u8; HEADER_MASK_LEN] {
        let counter = u32::from_le_bytes([sample[0], sample[1], sample[2], sample[3]]);
        let mut cipher = ChaCha20::new(
            chacha20::Key::from_slice(&self.key),
            chacha20::Nonce::from_slice(&sample[4..]),
        );
        cipher.seek(u64::from(counter) * 64);
        let mut mask = [0u8; HEADER_MASK_LEN];
        cipher.apply_keystream(&mut mask);
        mask
    }
}
