//! File-backed journal.
//!
//! A single append file: fixed header (identity + commit watermark) followed
//! by framed records. Submissions append and stay buffered in the page cache
//! until `flush`; the commit watermark is persisted by rewriting the header
//! in place. Once every record is covered by the watermark the file is
//! truncated back to the header, which keeps replay scans short without a
//! ring allocator.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use dirstore_error::{Result, StoreError};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::record::{JournalHeader, JournalRecord, HEADER_LEN};
use crate::Journal;

struct Inner {
    file: File,
    header: JournalHeader,
    /// Next append offset.
    write_off: u64,
    /// Highest seq appended (0 when empty).
    last_seq: u64,
}

/// Default [`Journal`] implementation over a plain file.
pub struct FileJournal {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl FileJournal {
    /// Create a fresh journal for the store identified by `fsid`.
    /// Overwrites any existing file.
    pub fn create(path: &Path, fsid: [u8; 36]) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)?;
        let header = JournalHeader::new(fsid);
        file.write_all_at(&header.to_bytes(), 0)?;
        file.sync_all()?;
        info!(path = %path.display(), "created journal");
        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(Inner {
                file,
                header,
                write_off: HEADER_LEN as u64,
                last_seq: 0,
            }),
        })
    }

    /// Open an existing journal, verify identity, and locate the valid
    /// record tail.
    pub fn open(path: &Path, fsid: [u8; 36]) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut head_buf = [0_u8; HEADER_LEN];
        let n = file.read_at(&mut head_buf, 0)?;
        if n < HEADER_LEN {
            return Err(StoreError::Corrupt {
                detail: format!("journal shorter than header: {n} bytes"),
            });
        }
        let header = JournalHeader::from_bytes(&head_buf)?;
        if header.fsid != fsid {
            return Err(StoreError::IdentityMismatch {
                found: String::from_utf8_lossy(&header.fsid).into_owned(),
                expected: String::from_utf8_lossy(&fsid).into_owned(),
            });
        }

        // Walk the valid record prefix to find the append point.
        let body = read_body(&file)?;
        let mut off = 0_usize;
        let mut last_seq = 0_u64;
        while let Some((rec, used)) = JournalRecord::parse(&body[off..]) {
            if rec.seq <= last_seq {
                warn!(seq = rec.seq, last_seq, "non-monotonic journal record, stopping scan");
                break;
            }
            last_seq = rec.seq;
            off += used;
        }
        let write_off = (HEADER_LEN + off) as u64;
        debug!(
            path = %path.display(),
            committed_seq = header.committed_seq,
            last_seq,
            write_off,
            "opened journal"
        );
        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(Inner {
                file,
                header,
                write_off,
                last_seq,
            }),
        })
    }

    /// Quick integrity check used by `mkjournal`: does the header parse and
    /// carry our identity?
    pub fn check(path: &Path, fsid: [u8; 36]) -> Result<()> {
        let _ = Self::open(path, fsid)?;
        Ok(())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_body(file: &File) -> Result<Vec<u8>> {
    let len = file.metadata()?.len();
    let body_len = usize::try_from(len.saturating_sub(HEADER_LEN as u64)).map_err(|_| {
        StoreError::Corrupt {
            detail: "journal larger than address space".to_owned(),
        }
    })?;
    let mut body = vec![0_u8; body_len];
    let mut read = 0_usize;
    while read < body_len {
        let n = file.read_at(&mut body[read..], HEADER_LEN as u64 + read as u64)?;
        if n == 0 {
            body.truncate(read);
            break;
        }
        read += n;
    }
    Ok(body)
}

impl Journal for FileJournal {
    fn submit_record(&self, seq: u64, payload: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        debug_assert!(seq > inner.last_seq, "journal seqs must be monotonic");
        let rec = JournalRecord {
            seq,
            payload: payload.to_vec(),
        };
        let bytes = rec.to_bytes();
        let off = inner.write_off;
        inner.file.write_all_at(&bytes, off)?;
        inner.write_off += bytes.len() as u64;
        inner.last_seq = seq;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let inner = self.inner.lock();
        inner.file.sync_data()?;
        Ok(())
    }

    fn replay(&self) -> Result<Vec<JournalRecord>> {
        let inner = self.inner.lock();
        let committed = inner.header.committed_seq;
        let body = read_body(&inner.file)?;
        let mut out = Vec::new();
        let mut off = 0_usize;
        let mut last_seq = 0_u64;
        while let Some((rec, used)) = JournalRecord::parse(&body[off..]) {
            if rec.seq <= last_seq {
                break;
            }
            last_seq = rec.seq;
            off += used;
            if rec.seq > committed {
                out.push(rec);
            }
        }
        if off < body.len() {
            debug!(
                valid = off,
                total = body.len(),
                "journal tail after valid prefix ignored"
            );
        }
        Ok(out)
    }

    fn committed_thru(&self, seq: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        if seq < inner.header.committed_seq {
            return Ok(());
        }
        inner.header.committed_seq = seq;
        let head = inner.header.to_bytes();
        inner.file.write_all_at(&head, 0)?;
        inner.file.sync_data()?;

        // Everything covered: drop the record tail.
        if inner.last_seq <= seq && inner.write_off > HEADER_LEN as u64 {
            inner.file.set_len(HEADER_LEN as u64)?;
            inner.file.sync_data()?;
            inner.write_off = HEADER_LEN as u64;
            debug!(seq, "journal trimmed");
        }
        Ok(())
    }

    fn committed_seq(&self) -> u64 {
        self.inner.lock().header.committed_seq
    }
}
