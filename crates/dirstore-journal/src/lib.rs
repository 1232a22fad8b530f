//! The write-ahead journal contract and its default file-backed
//! implementation.
//!
//! The core uses the journal through a deliberately small surface: submit an
//! encoded record under an op sequence number, flush to make submissions
//! durable, stream records back for replay, and advance the commit watermark
//! so the journal may trim. Anything fancier (ring preallocation, direct
//! I/O, a dedicated device) can live behind the same trait.

mod file;
mod record;

pub use file::FileJournal;
pub use record::{JournalHeader, JournalRecord};

use dirstore_error::Result;

/// Journal contract used by the transaction pipeline.
pub trait Journal: Send + Sync {
    /// Append an encoded transaction batch under `seq`. Not durable until
    /// [`Journal::flush`] returns.
    fn submit_record(&self, seq: u64, payload: &[u8]) -> Result<()>;

    /// Make every prior submission durable.
    fn flush(&self) -> Result<()>;

    /// Records strictly greater than the persisted commit watermark, in seq
    /// order. Scanning stops at the first torn or corrupt record (normal
    /// crash debris at the tail).
    fn replay(&self) -> Result<Vec<JournalRecord>>;

    /// Persist `seq` as the commit watermark and trim records it covers.
    fn committed_thru(&self, seq: u64) -> Result<()>;

    /// The persisted commit watermark.
    fn committed_seq(&self) -> u64;
}
