//! Quick-xor content hash
//!
//! The remote store verifies file integrity with a 160-bit quick-xor digest:
//! each input byte is XORed into a circular 160-bit accumulator at a position
//! that advances 11 bits per byte, and the total input length is XORed into
//! the trailing 8 bytes before Base64 encoding.

use super::newtypes::QuickXorHash;

/// Digest width in bytes
pub const DIGEST_BYTES: usize = 20;

/// Accumulator width in bits
const WIDTH_BITS: usize = DIGEST_BYTES * 8;

/// Bit advance per input byte
const SHIFT_BITS: usize = 11;

/// Incremental quick-xor hasher
///
/// Feed bytes with [`update`](QuickXorHasher::update) in any chunking;
/// [`finalize`](QuickXorHasher::finalize) folds in the length and returns
/// the encoded digest.
#[derive(Debug, Clone)]
pub struct QuickXorHasher {
    data: [u8; DIGEST_BYTES],
    length: u64,
}

impl QuickXorHasher {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: [0u8; DIGEST_BYTES],
            length: 0,
        }
    }

    /// Absorbs a chunk of input
    pub fn update(&mut self, bytes: &[u8]) {
        for &b in bytes {
            let bit_pos = (self.length as usize).wrapping_mul(SHIFT_BITS) % WIDTH_BITS;
            let byte_pos = bit_pos / 8;
            let bit_off = bit_pos % 8;

            // A byte XORed at a non-aligned bit position straddles two cells.
            let widened = (b as u16) << bit_off;
            self.data[byte_pos] ^= widened as u8;
            self.data[(byte_pos + 1) % DIGEST_BYTES] ^= (widened >> 8) as u8;

            self.length += 1;
        }
    }

    /// Folds the total length into the tail and returns the encoded digest
    #[must_use]
    pub fn finalize(mut self) -> QuickXorHash {
        let length_bytes = self.length.to_le_bytes();
        for (i, b) in length_bytes.iter().enumerate() {
            self.data[DIGEST_BYTES - 8 + i] ^= b;
        }
        QuickXorHash::from_digest(&self.data)
    }
}

impl Default for QuickXorHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot hash of a byte slice
#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> QuickXorHash {
    let mut hasher = QuickXorHasher::new();
    hasher.update(bytes);
    hasher.finalize()
}
