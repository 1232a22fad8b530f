//! The ancillary key/value store ("omap") contract and its file-backed
//! default.
//!
//! Each object owns a sorted key/value map, an opaque header blob, and a
//! spilled-xattr namespace. Mutations optionally carry a sequencer position;
//! a stored stamp at or past the incoming one turns the mutation into a
//! no-op, which is what makes journal replay idempotent on this store.

mod file;

pub use file::FileObjectMap;

use std::collections::{BTreeMap, BTreeSet};

use dirstore_error::Result;
use dirstore_types::{Oid, SeqPos};

/// Transactional surface the core uses. Values and headers are opaque byte
/// strings; keys are utf-8.
pub trait ObjectMap: Send + Sync {
    fn get_header(&self, oid: &Oid) -> Result<Vec<u8>>;

    fn get_keys(&self, oid: &Oid) -> Result<BTreeSet<String>>;

    fn get_values(&self, oid: &Oid, keys: &BTreeSet<String>)
        -> Result<BTreeMap<String, Vec<u8>>>;

    /// Header plus the full map.
    fn get(&self, oid: &Oid) -> Result<(Vec<u8>, BTreeMap<String, Vec<u8>>)>;

    /// Which of `keys` are present.
    fn check_keys(&self, oid: &Oid, keys: &BTreeSet<String>) -> Result<BTreeSet<String>>;

    /// Ordered `(key, value)` pairs starting at `after` (exclusive).
    fn iter_after(&self, oid: &Oid, after: Option<&str>) -> Result<Vec<(String, Vec<u8>)>>;

    fn set_keys(
        &self,
        oid: &Oid,
        keys: &BTreeMap<String, Vec<u8>>,
        spos: Option<&SeqPos>,
    ) -> Result<()>;

    fn rm_keys(&self, oid: &Oid, keys: &BTreeSet<String>, spos: Option<&SeqPos>) -> Result<()>;

    fn set_header(&self, oid: &Oid, header: &[u8], spos: Option<&SeqPos>) -> Result<()>;

    /// Drop the object's map, header, xattrs, and stamp.
    fn clear(&self, oid: &Oid, spos: Option<&SeqPos>) -> Result<()>;

    /// Copy everything (except the stamp) from `src` to `dst`.
    fn clone_object(&self, src: &Oid, dst: &Oid, spos: Option<&SeqPos>) -> Result<()>;

    // Spilled extended attributes live in their own namespace so user keys
    // can never collide with them.

    fn get_xattrs(
        &self,
        oid: &Oid,
        names: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, Vec<u8>>>;

    fn get_all_xattrs(&self, oid: &Oid) -> Result<BTreeSet<String>>;

    fn set_xattrs(
        &self,
        oid: &Oid,
        attrs: &BTreeMap<String, Vec<u8>>,
        spos: Option<&SeqPos>,
    ) -> Result<()>;

    fn remove_xattrs(
        &self,
        oid: &Oid,
        names: &BTreeSet<String>,
        spos: Option<&SeqPos>,
    ) -> Result<()>;

    /// Durably record `spos` as the object's stamp (called while a replay
    /// guard is being opened, so a crash cannot lose the stamp and redo a
    /// non-idempotent mutation).
    fn sync_object(&self, oid: &Oid, spos: &SeqPos) -> Result<()>;

    /// Flush and compact; part of the commit cycle's durability step.
    fn sync_all(&self) -> Result<()>;

    /// Integrity check run at mount.
    fn check(&self) -> Result<()>;
}
