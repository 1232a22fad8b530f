//! Sequencer positions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The total-order position of one opcode: op sequence number, transaction
/// index within the batch, opcode index within the transaction.
///
/// Compared lexicographically; this is the value stamped on inodes by the
/// replay guard.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct SeqPos {
    pub seq: u64,
    pub txn: u32,
    pub op: u32,
}

/// Byte length of the guard encoding: position plus the in-progress flag.
pub const GUARD_ENCODED_LEN: usize = 17;

impl SeqPos {
    #[must_use]
    pub fn new(seq: u64, txn: u32, op: u32) -> Self {
        Self { seq, txn, op }
    }

    /// Encode `(self, in_progress)` as the fixed 17-byte guard value.
    #[must_use]
    pub fn encode_guard(&self, in_progress: bool) -> [u8; GUARD_ENCODED_LEN] {
        let mut out = [0_u8; GUARD_ENCODED_LEN];
        out[0..8].copy_from_slice(&self.seq.to_le_bytes());
        out[8..12].copy_from_slice(&self.txn.to_le_bytes());
        out[12..16].copy_from_slice(&self.op.to_le_bytes());
        out[16] = u8::from(in_progress);
        out
    }

    /// Decode a guard value. Returns `None` if the buffer is the wrong size
    /// or the flag byte is not 0/1.
    #[must_use]
    pub fn decode_guard(buf: &[u8]) -> Option<(Self, bool)> {
        if buf.len() != GUARD_ENCODED_LEN {
            return None;
        }
        let seq = u64::from_le_bytes(buf[0..8].try_into().ok()?);
        let txn = u32::from_le_bytes(buf[8..12].try_into().ok()?);
        let op = u32::from_le_bytes(buf[12..16].try_into().ok()?);
        let in_progress = match buf[16] {
            0 => false,
            1 => true,
            _ => return None,
        };
        Some((Self { seq, txn, op }, in_progress))
    }
}

impl fmt::Display for SeqPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.seq, self.txn, self.op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lexicographic_order() {
        let a = SeqPos::new(1, 0, 5);
        let b = SeqPos::new(1, 1, 0);
        let c = SeqPos::new(2, 0, 0);
        assert!(a < b && b < c);
    }

    #[test]
    fn test_guard_round_trip() {
        let p = SeqPos::new(42, 3, 7);
        for flag in [false, true] {
            let enc = p.encode_guard(flag);
            assert_eq!(SeqPos::decode_guard(&enc), Some((p, flag)));
        }
    }

    #[test]
    fn test_guard_rejects_bad_input() {
        assert_eq!(SeqPos::decode_guard(&[0; 16]), None);
        let mut enc = SeqPos::new(1, 1, 1).encode_guard(false);
        enc[16] = 9;
        assert_eq!(SeqPos::decode_guard(&enc), None);
    }
}
