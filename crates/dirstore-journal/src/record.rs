//! On-disk journal framing.
//!
//! ```text
//! [header: 128 bytes]
//! [record: 24-byte frame + payload]*
//! ```
//!
//! Frame fields are little-endian. The payload checksum (xxh3-64) makes a
//! torn tail detectable: a record whose frame or checksum does not validate
//! ends the valid prefix.

use dirstore_error::{Result, StoreError};
use xxhash_rust::xxh3::xxh3_64;

/// Header magic: identifies a dirstore journal.
pub const JOURNAL_MAGIC: u64 = 0x6472_6a6e_6c31_7630; // "drjnl1v0"
/// Per-record frame magic.
pub const RECORD_MAGIC: u32 = 0x4a52_4543; // "JREC"
/// Journal format version; frozen within a major version.
pub const JOURNAL_VERSION: u32 = 1;

/// Fixed header size; the first record starts here.
pub const HEADER_LEN: usize = 128;
/// Fixed frame size preceding each payload.
pub const FRAME_LEN: usize = 24;

/// The journal file header: identity plus the commit watermark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalHeader {
    pub fsid: [u8; 36],
    pub committed_seq: u64,
}

impl JournalHeader {
    #[must_use]
    pub fn new(fsid: [u8; 36]) -> Self {
        Self {
            fsid,
            committed_seq: 0,
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0_u8; HEADER_LEN];
        out[0..8].copy_from_slice(&JOURNAL_MAGIC.to_le_bytes());
        out[8..12].copy_from_slice(&JOURNAL_VERSION.to_le_bytes());
        out[16..24].copy_from_slice(&self.committed_seq.to_le_bytes());
        out[24..60].copy_from_slice(&self.fsid);
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(StoreError::Corrupt {
                detail: format!("journal header short: {} < {HEADER_LEN}", buf.len()),
            });
        }
        let magic = u64::from_le_bytes(buf[0..8].try_into().expect("8 bytes"));
        if magic != JOURNAL_MAGIC {
            return Err(StoreError::Corrupt {
                detail: format!("journal magic mismatch: {magic:#018x}"),
            });
        }
        let version = u32::from_le_bytes(buf[8..12].try_into().expect("4 bytes"));
        if version != JOURNAL_VERSION {
            return Err(StoreError::Corrupt {
                detail: format!("journal version {version} != {JOURNAL_VERSION}"),
            });
        }
        let committed_seq = u64::from_le_bytes(buf[16..24].try_into().expect("8 bytes"));
        let mut fsid = [0_u8; 36];
        fsid.copy_from_slice(&buf[24..60]);
        Ok(Self {
            fsid,
            committed_seq,
        })
    }
}

/// One journaled submission: an op sequence number and the encoded batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
    pub seq: u64,
    pub payload: Vec<u8>,
}

impl JournalRecord {
    /// Serialize the frame + payload.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_LEN + self.payload.len());
        out.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
        out.extend_from_slice(
            &u32::try_from(self.payload.len())
                .expect("payload fits u32")
                .to_le_bytes(),
        );
        out.extend_from_slice(&self.seq.to_le_bytes());
        out.extend_from_slice(&xxh3_64(&self.payload).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse one record from the front of `buf`.
    ///
    /// `None` means the prefix is not a complete, valid record (torn tail);
    /// the caller stops scanning there.
    #[must_use]
    pub fn parse(buf: &[u8]) -> Option<(Self, usize)> {
        if buf.len() < FRAME_LEN {
            return None;
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().expect("4 bytes"));
        if magic != RECORD_MAGIC {
            return None;
        }
        let len = u32::from_le_bytes(buf[4..8].try_into().expect("4 bytes")) as usize;
        let seq = u64::from_le_bytes(buf[8..16].try_into().expect("8 bytes"));
        let checksum = u64::from_le_bytes(buf[16..24].try_into().expect("8 bytes"));
        let end = FRAME_LEN.checked_add(len)?;
        if buf.len() < end {
            return None;
        }
        let payload = &buf[FRAME_LEN..end];
        if xxh3_64(payload) != checksum {
            return None;
        }
        Some((
            Self {
                seq,
                payload: payload.to_vec(),
            },
            end,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let mut h = JournalHeader::new(*b"0123456789abcdef0123456789abcdef0123");
        h.committed_seq = 99;
        let bytes = h.to_bytes();
        assert_eq!(JournalHeader::from_bytes(&bytes).unwrap(), h);
    }

    #[test]
    fn test_header_bad_magic_is_corrupt() {
        let mut bytes = JournalHeader::new([b'x'; 36]).to_bytes();
        bytes[0] ^= 0xff;
        assert!(matches!(
            JournalHeader::from_bytes(&bytes),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_record_round_trip() {
        let r = JournalRecord {
            seq: 7,
            payload: b"encoded batch".to_vec(),
        };
        let bytes = r.to_bytes();
        let (back, consumed) = JournalRecord::parse(&bytes).unwrap();
        assert_eq!(back, r);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn test_torn_record_rejected() {
        let r = JournalRecord {
            seq: 7,
            payload: vec![0xaa; 100],
        };
        let bytes = r.to_bytes();
        for cut in [0, 3, FRAME_LEN - 1, FRAME_LEN + 10, bytes.len() - 1] {
            assert!(JournalRecord::parse(&bytes[..cut]).is_none(), "cut {cut}");
        }
    }

    #[test]
    fn test_corrupt_payload_rejected() {
        let r = JournalRecord {
            seq: 7,
            payload: vec![0xaa; 100],
        };
        let mut bytes = r.to_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(JournalRecord::parse(&bytes).is_none());
    }
}
