//! 16-byte order-independent digest of a set of ids: `sha256((Σ ids mod
//! 2^256) ∥ varint(count))`, truncated to 16 bytes. The sum is a commutative
//! 256-bit wraparound addition, so the fingerprint of a set does not depend
//! on the order items were folded in.

use sha2::{Digest, Sha256};

use super::bound::ID_SIZE;
use super::varint;

pub const FINGERPRINT_SIZE: usize = 16;

/// Accumulates ids via wraparound 256-bit addition, lane by lane, so that
/// folding items in any order yields the same total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Accumulator {
    // four 64-bit little-endian lanes, least-significant first
    lanes: [u64; 4],
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: &[u8; ID_SIZE]) {
        let mut carry: u128 = 0;
        for (lane, chunk) in self.lanes.iter_mut().zip(id.chunks_exact(8)) {
            let word = u64::from_le_bytes(chunk.try_into().expect("8-byte chunk"));
            let sum = u128::from(*lane) + u128::from(word) + carry;
            *lane = sum as u64;
            carry = sum >> 64;
        }
        // any final carry wraps around mod 2^256 and is discarded
    }

    pub fn count(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, lane) in self.lanes.iter().enumerate() {
            out[i * 8..i * 8 + 8].copy_from_slice(&lane.to_le_bytes());
        }
        out
    }

    /// Finalizes the fingerprint for `count` items folded so far.
    pub fn fingerprint(&self, count: u64) -> [u8; FINGERPRINT_SIZE] {
        let mut buf = Vec::with_capacity(32 + 10);
        buf.extend_from_slice(&self.count());
        varint::encode(count, &mut buf);
        let digest = Sha256::digest(&buf);
        let mut out = [0u8; FINGERPRINT_SIZE];
        out.copy_from_slice(&digest[..FINGERPRINT_SIZE]);
        out
    }
}

/// `match?` — constant-time equality. Not security-critical, but no reason
/// to short-circuit.
pub fn fingerprints_match(a: &[u8; FINGERPRINT_SIZE], b: &[u8; FINGERPRINT_SIZE]) -> bool {
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> [u8; ID_SIZE] {
        let mut b = [0u8; ID_SIZE];
        b[0] = byte;
        b[31] = byte.wrapping_add(1);
        b
    }

    #[test]
    fn fingerprint_is_permutation_invariant() {
        let ids = [id(1), id(2), id(3)];

        let mut forward = Accumulator::new();
        forward.add(&ids[0]);
        forward.add(&ids[1]);
        forward.add(&ids[2]);

        let mut shuffled = Accumulator::new();
        shuffled.add(&ids[2]);
        shuffled.add(&ids[0]);
        shuffled.add(&ids[1]);

        assert_eq!(forward.fingerprint(3), shuffled.fingerprint(3));
    }

    #[test]
    fn empty_accumulator_is_deterministic() {
        let empty = Accumulator::new();
        assert_eq!(empty.fingerprint(0), empty.fingerprint(0));
    }

    #[test]
    fn different_counts_change_fingerprint() {
        let mut acc = Accumulator::new();
        acc.add(&id(7));
        assert_ne!(acc.fingerprint(1), acc.fingerprint(2));
    }

    #[test]
    fn match_detects_equality_and_difference() {
        let a = [1u8; FINGERPRINT_SIZE];
        let b = [1u8; FINGERPRINT_SIZE];
        let mut c = [1u8; FINGERPRINT_SIZE];
        c[0] = 2;
        assert!(fingerprints_match(&a, &b));
        assert!(!fingerprints_match(&a, &c));
    }
}
