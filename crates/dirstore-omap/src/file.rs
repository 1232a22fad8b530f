//! File-backed object map.
//!
//! State lives in memory and is persisted under the omap directory as a
//! snapshot plus a JSON-lines mutation log:
//!
//! ```text
//! omap/
//!   snapshot      full state at the last compaction (checksummed)
//!   log           one checksummed JSON record per mutation since
//! ```
//!
//! Open loads the snapshot and replays the log, stopping at the first torn
//! or corrupt line. `sync_all` writes a fresh snapshot (tmp + rename +
//! fsync) and truncates the log.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use dirstore_error::{Result, StoreError};
use dirstore_types::{Oid, SeqPos};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::ObjectMap;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct ObjectState {
    header: Vec<u8>,
    keys: BTreeMap<String, Vec<u8>>,
    xattrs: BTreeMap<String, Vec<u8>>,
    stamp: Option<SeqPos>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct State {
    objects: BTreeMap<String, ObjectState>,
}

/// One logged mutation. The oid key is the object's textual name.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum Mutation {
    SetKeys {
        oid: String,
        keys: BTreeMap<String, Vec<u8>>,
    },
    RmKeys {
        oid: String,
        keys: BTreeSet<String>,
    },
    SetHeader {
        oid: String,
        header: Vec<u8>,
    },
    Clear {
        oid: String,
    },
    CloneObject {
        src: String,
        dst: String,
    },
    SetXattrs {
        oid: String,
        attrs: BTreeMap<String, Vec<u8>>,
    },
    RmXattrs {
        oid: String,
        names: BTreeSet<String>,
    },
    Stamp {
        oid: String,
        spos: SeqPos,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct LogLine {
    checksum: u64,
    mutation: Mutation,
}

fn mutation_checksum(m: &Mutation) -> u64 {
    // Checksum the canonical JSON of the mutation alone.
    let body = serde_json::to_vec(m).unwrap_or_default();
    xxh3_64(&body)
}

struct Inner {
    state: State,
    log: File,
}

/// Default [`ObjectMap`] persisted under `current/omap/`.
pub struct FileObjectMap {
    dir: PathBuf,
    inner: Mutex<Inner>,
}

impl FileObjectMap {
    /// Open (creating if necessary) the omap under `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let snapshot_path = dir.join("snapshot");
        let log_path = dir.join("log");

        let mut state = if snapshot_path.exists() {
            let raw = std::fs::read(&snapshot_path)?;
            parse_snapshot(&raw)?
        } else {
            State::default()
        };

        if log_path.exists() {
            let file = File::open(&log_path)?;
            let reader = BufReader::new(file);
            let mut replayed = 0_u64;
            for line in reader.lines() {
                let Ok(line) = line else { break };
                if line.is_empty() {
                    continue;
                }
                let Ok(entry) = serde_json::from_str::<LogLine>(&line) else {
                    // Torn tail from a crash mid-append.
                    warn!("omap log parse stopped at a torn line");
                    break;
                };
                if mutation_checksum(&entry.mutation) != entry.checksum {
                    warn!("omap log checksum mismatch, stopping replay");
                    break;
                }
                apply_mutation(&mut state, &entry.mutation);
                replayed += 1;
            }
            debug!(replayed, "omap log replayed");
        }

        let log = OpenOptions::new().create(true).append(true).open(&log_path)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            inner: Mutex::new(Inner { state, log }),
        })
    }

    /// Stamp-gate: true when a strictly newer position already modified the
    /// object, so a replayed mutation must be skipped. Equal positions
    /// proceed: the primitive mutations are idempotent and an op may touch
    /// the same object more than once under one position.
    fn stamped(state: &State, oid: &Oid, spos: Option<&SeqPos>) -> bool {
        let Some(spos) = spos else { return false };
        state
            .objects
            .get(oid.name())
            .and_then(|o| o.stamp.as_ref())
            .is_some_and(|stored| stored > spos)
    }

    fn log_and_apply(
        &self,
        inner: &mut Inner,
        oid: Option<&Oid>,
        spos: Option<&SeqPos>,
        mutation: Mutation,
    ) -> Result<()> {
        apply_mutation(&mut inner.state, &mutation);
        if let (Some(oid), Some(spos)) = (oid, spos) {
            let stamp = Mutation::Stamp {
                oid: oid.name().to_owned(),
                spos: *spos,
            };
            apply_mutation(&mut inner.state, &stamp);
            append_line(&mut inner.log, &mutation)?;
            append_line(&mut inner.log, &stamp)?;
        } else {
            append_line(&mut inner.log, &mutation)?;
        }
        Ok(())
    }
}

fn append_line(log: &mut File, mutation: &Mutation) -> Result<()> {
    let line = LogLine {
        checksum: mutation_checksum(mutation),
        mutation: mutation.clone(),
    };
    let mut buf = serde_json::to_vec(&line).map_err(|e| StoreError::Corrupt {
        detail: format!("omap log serialize: {e}"),
    })?;
    buf.push(b'\n');
    log.write_all(&buf)?;
    Ok(())
}

fn apply_mutation(state: &mut State, m: &Mutation) {
    match m {
        Mutation::SetKeys { oid, keys } => {
            let obj = state.objects.entry(oid.clone()).or_default();
            for (k, v) in keys {
                obj.keys.insert(k.clone(), v.clone());
            }
        }
        Mutation::RmKeys { oid, keys } => {
            if let Some(obj) = state.objects.get_mut(oid) {
                for k in keys {
                    obj.keys.remove(k);
                }
            }
        }
        Mutation::SetHeader { oid, header } => {
            state.objects.entry(oid.clone()).or_default().header = header.clone();
        }
        Mutation::Clear { oid } => {
            state.objects.remove(oid);
        }
        Mutation::CloneObject { src, dst } => {
            if let Some(src_state) = state.objects.get(src).cloned() {
                let stamp = state.objects.get(dst).and_then(|o| o.stamp);
                state.objects.insert(
                    dst.clone(),
                    ObjectState {
                        stamp,
                        ..src_state
                    },
                );
            }
        }
        Mutation::SetXattrs { oid, attrs } => {
            let obj = state.objects.entry(oid.clone()).or_default();
            for (k, v) in attrs {
                obj.xattrs.insert(k.clone(), v.clone());
            }
        }
        Mutation::RmXattrs { oid, names } => {
            if let Some(obj) = state.objects.get_mut(oid) {
                for k in names {
                    obj.xattrs.remove(k);
                }
            }
        }
        Mutation::Stamp { oid, spos } => {
            let obj = state.objects.entry(oid.clone()).or_default();
            match obj.stamp {
                Some(existing) if existing >= *spos => {}
                _ => obj.stamp = Some(*spos),
            }
        }
    }
}

fn parse_snapshot(raw: &[u8]) -> Result<State> {
    // Layout: 8-byte LE checksum, then the JSON body.
    if raw.len() < 8 {
        return Err(StoreError::Corrupt {
            detail: "omap snapshot shorter than checksum".to_owned(),
        });
    }
    let checksum = u64::from_le_bytes(raw[0..8].try_into().expect("8 bytes"));
    let body = &raw[8..];
    if xxh3_64(body) != checksum {
        return Err(StoreError::Corrupt {
            detail: "omap snapshot checksum mismatch".to_owned(),
        });
    }
    serde_json::from_slice(body).map_err(|e| StoreError::Corrupt {
        detail: format!("omap snapshot decode: {e}"),
    })
}

impl ObjectMap for FileObjectMap {
    fn get_header(&self, oid: &Oid) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        Ok(inner
            .state
            .objects
            .get(oid.name())
            .map(|o| o.header.clone())
            .unwrap_or_default())
    }

    fn get_keys(&self, oid: &Oid) -> Result<BTreeSet<String>> {
        let inner = self.inner.lock();
        Ok(inner
            .state
            .objects
            .get(oid.name())
            .map(|o| o.keys.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn get_values(
        &self,
        oid: &Oid,
        keys: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, Vec<u8>>> {
        let inner = self.inner.lock();
        let mut out = BTreeMap::new();
        if let Some(obj) = inner.state.objects.get(oid.name()) {
            for k in keys {
                if let Some(v) = obj.keys.get(k) {
                    out.insert(k.clone(), v.clone());
                }
            }
        }
        Ok(out)
    }

    fn get(&self, oid: &Oid) -> Result<(Vec<u8>, BTreeMap<String, Vec<u8>>)> {
        let inner = self.inner.lock();
        Ok(inner
            .state
            .objects
            .get(oid.name())
            .map(|o| (o.header.clone(), o.keys.clone()))
            .unwrap_or_default())
    }

    fn check_keys(&self, oid: &Oid, keys: &BTreeSet<String>) -> Result<BTreeSet<String>> {
        let inner = self.inner.lock();
        let mut out = BTreeSet::new();
        if let Some(obj) = inner.state.objects.get(oid.name()) {
            for k in keys {
                if obj.keys.contains_key(k) {
                    out.insert(k.clone());
                }
            }
        }
        Ok(out)
    }

    fn iter_after(&self, oid: &Oid, after: Option<&str>) -> Result<Vec<(String, Vec<u8>)>> {
        let inner = self.inner.lock();
        let Some(obj) = inner.state.objects.get(oid.name()) else {
            return Ok(Vec::new());
        };
        let iter: Box<dyn Iterator<Item = (&String, &Vec<u8>)>> = match after {
            Some(a) => Box::new(
                obj.keys
                    .range::<str, _>((std::ops::Bound::Excluded(a), std::ops::Bound::Unbounded)),
            ),
            None => Box::new(obj.keys.iter()),
        };
        Ok(iter.map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    fn set_keys(
        &self,
        oid: &Oid,
        keys: &BTreeMap<String, Vec<u8>>,
        spos: Option<&SeqPos>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if Self::stamped(&inner.state, oid, spos) {
            return Ok(());
        }
        self.log_and_apply(
            &mut inner,
            Some(oid),
            spos,
            Mutation::SetKeys {
                oid: oid.name().to_owned(),
                keys: keys.clone(),
            },
        )
    }

    fn rm_keys(&self, oid: &Oid, keys: &BTreeSet<String>, spos: Option<&SeqPos>) -> Result<()> {
        let mut inner = self.inner.lock();
        if Self::stamped(&inner.state, oid, spos) {
            return Ok(());
        }
        self.log_and_apply(
            &mut inner,
            Some(oid),
            spos,
            Mutation::RmKeys {
                oid: oid.name().to_owned(),
                keys: keys.clone(),
            },
        )
    }

    fn set_header(&self, oid: &Oid, header: &[u8], spos: Option<&SeqPos>) -> Result<()> {
        let mut inner = self.inner.lock();
        if Self::stamped(&inner.state, oid, spos) {
            return Ok(());
        }
        self.log_and_apply(
            &mut inner,
            Some(oid),
            spos,
            Mutation::SetHeader {
                oid: oid.name().to_owned(),
                header: header.to_vec(),
            },
        )
    }

    fn clear(&self, oid: &Oid, spos: Option<&SeqPos>) -> Result<()> {
        let mut inner = self.inner.lock();
        if Self::stamped(&inner.state, oid, spos) {
            return Ok(());
        }
        // Clear drops the stamp too; do not restamp afterwards or a
        // re-created object would inherit it.
        let m = Mutation::Clear {
            oid: oid.name().to_owned(),
        };
        apply_mutation(&mut inner.state, &m);
        append_line(&mut inner.log, &m)
    }

    fn clone_object(&self, src: &Oid, dst: &Oid, spos: Option<&SeqPos>) -> Result<()> {
        let mut inner = self.inner.lock();
        if Self::stamped(&inner.state, dst, spos) {
            return Ok(());
        }
        if !inner.state.objects.contains_key(src.name()) {
            return Err(StoreError::NotFound {
                what: format!("omap object {src}"),
            });
        }
        self.log_and_apply(
            &mut inner,
            Some(dst),
            spos,
            Mutation::CloneObject {
                src: src.name().to_owned(),
                dst: dst.name().to_owned(),
            },
        )
    }

    fn get_xattrs(
        &self,
        oid: &Oid,
        names: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, Vec<u8>>> {
        let inner = self.inner.lock();
        let mut out = BTreeMap::new();
        if let Some(obj) = inner.state.objects.get(oid.name()) {
            for k in names {
                if let Some(v) = obj.xattrs.get(k) {
                    out.insert(k.clone(), v.clone());
                }
            }
        }
        Ok(out)
    }

    fn get_all_xattrs(&self, oid: &Oid) -> Result<BTreeSet<String>> {
        let inner = self.inner.lock();
        Ok(inner
            .state
            .objects
            .get(oid.name())
            .map(|o| o.xattrs.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn set_xattrs(
        &self,
        oid: &Oid,
        attrs: &BTreeMap<String, Vec<u8>>,
        spos: Option<&SeqPos>,
    ) -> Result<()> {
        if attrs.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        if Self::stamped(&inner.state, oid, spos) {
            return Ok(());
        }
        self.log_and_apply(
            &mut inner,
            Some(oid),
            spos,
            Mutation::SetXattrs {
                oid: oid.name().to_owned(),
                attrs: attrs.clone(),
            },
        )
    }

    fn remove_xattrs(
        &self,
        oid: &Oid,
        names: &BTreeSet<String>,
        spos: Option<&SeqPos>,
    ) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        if Self::stamped(&inner.state, oid, spos) {
            return Ok(());
        }
        self.log_and_apply(
            &mut inner,
            Some(oid),
            spos,
            Mutation::RmXattrs {
                oid: oid.name().to_owned(),
                names: names.clone(),
            },
        )
    }

    fn sync_object(&self, oid: &Oid, spos: &SeqPos) -> Result<()> {
        let mut inner = self.inner.lock();
        let m = Mutation::Stamp {
            oid: oid.name().to_owned(),
            spos: *spos,
        };
        apply_mutation(&mut inner.state, &m);
        append_line(&mut inner.log, &m)?;
        inner.log.sync_data()?;
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let body = serde_json::to_vec(&inner.state).map_err(|e| StoreError::Corrupt {
            detail: format!("omap snapshot serialize: {e}"),
        })?;
        let mut raw = Vec::with_capacity(body.len() + 8);
        raw.extend_from_slice(&xxh3_64(&body).to_le_bytes());
        raw.extend_from_slice(&body);

        let tmp = self.dir.join("snapshot.tmp");
        let dst = self.dir.join("snapshot");
        {
            let mut f = OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&tmp)?;
            f.write_all(&raw)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &dst)?;
        let dirf = File::open(&self.dir)?;
        dirf.sync_all()?;

        // The snapshot now covers everything; restart the log.
        inner.log.set_len(0)?;
        inner.log.sync_data()?;
        debug!(objects = inner.state.objects.len(), "omap compacted");
        Ok(())
    }

    fn check(&self) -> Result<()> {
        // State was validated on open (snapshot checksum + log scan); verify
        // the in-memory view is internally consistent.
        let inner = self.inner.lock();
        for (name, obj) in &inner.state.objects {
            if name.is_empty() {
                return Err(StoreError::Corrupt {
                    detail: "omap object with empty name".to_owned(),
                });
            }
            let _ = obj;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_map(dir: &Path) -> FileObjectMap {
        FileObjectMap::open(&dir.join("omap")).unwrap()
    }

    fn kv(pairs: &[(&str, &[u8])]) -> BTreeMap<String, Vec<u8>> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.to_vec()))
            .collect()
    }

    fn keyset(keys: &[&str]) -> BTreeSet<String> {
        keys.iter().map(|k| (*k).to_owned()).collect()
    }

    #[test]
    fn test_set_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let m = open_map(dir.path());
        let o = Oid::new("obj");
        m.set_keys(&o, &kv(&[("a", b"1"), ("b", b"2")]), None).unwrap();
        m.set_header(&o, b"hdr", None).unwrap();

        let (header, keys) = m.get(&o).unwrap();
        assert_eq!(header, b"hdr");
        assert_eq!(keys.len(), 2);
        assert_eq!(m.get_values(&o, &keyset(&["a"])).unwrap()["a"], b"1");
        assert_eq!(m.check_keys(&o, &keyset(&["a", "z"])).unwrap(), keyset(&["a"]));
    }

    #[test]
    fn test_persistence_via_log() {
        let dir = tempfile::tempdir().unwrap();
        let o = Oid::new("obj");
        {
            let m = open_map(dir.path());
            m.set_keys(&o, &kv(&[("k", b"v")]), None).unwrap();
            // No sync_all: state must come back from the log alone.
        }
        let m = open_map(dir.path());
        assert_eq!(m.get_values(&o, &keyset(&["k"])).unwrap()["k"], b"v");
    }

    #[test]
    fn test_persistence_via_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let o = Oid::new("obj");
        {
            let m = open_map(dir.path());
            m.set_keys(&o, &kv(&[("k", b"v")]), None).unwrap();
            m.sync_all().unwrap();
            m.rm_keys(&o, &keyset(&["k"]), None).unwrap();
        }
        let m = open_map(dir.path());
        // Snapshot + post-snapshot log both replayed.
        assert!(m.get_values(&o, &keyset(&["k"])).unwrap().is_empty());
    }

    #[test]
    fn test_stamp_makes_replay_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let m = open_map(dir.path());
        let o = Oid::new("obj");

        m.set_keys(&o, &kv(&[("k", b"current")]), Some(&SeqPos::new(5, 0, 0)))
            .unwrap();
        // A replayed mutation from an older position is a no-op.
        m.set_keys(&o, &kv(&[("k", b"stale")]), Some(&SeqPos::new(4, 2, 7)))
            .unwrap();
        assert_eq!(m.get_values(&o, &keyset(&["k"])).unwrap()["k"], b"current");

        // The same position proceeds (idempotent re-apply), and a later one
        // advances the stamp.
        m.set_keys(&o, &kv(&[("k", b"again")]), Some(&SeqPos::new(5, 0, 0)))
            .unwrap();
        assert_eq!(m.get_values(&o, &keyset(&["k"])).unwrap()["k"], b"again");
        m.set_keys(&o, &kv(&[("k", b"newer")]), Some(&SeqPos::new(6, 0, 0)))
            .unwrap();
        assert_eq!(m.get_values(&o, &keyset(&["k"])).unwrap()["k"], b"newer");
    }

    #[test]
    fn test_clear_drops_everything() {
        let dir = tempfile::tempdir().unwrap();
        let m = open_map(dir.path());
        let o = Oid::new("obj");
        m.set_keys(&o, &kv(&[("k", b"v")]), None).unwrap();
        m.set_header(&o, b"h", None).unwrap();
        m.clear(&o, None).unwrap();
        assert!(m.get_keys(&o).unwrap().is_empty());
        assert!(m.get_header(&o).unwrap().is_empty());
    }

    #[test]
    fn test_clone_object_copies_state_not_stamp() {
        let dir = tempfile::tempdir().unwrap();
        let m = open_map(dir.path());
        let src = Oid::new("src");
        let dst = Oid::new("dst");
        m.set_keys(&src, &kv(&[("k", b"v")]), None).unwrap();
        m.sync_object(&dst, &SeqPos::new(9, 0, 0)).unwrap();
        m.clone_object(&src, &dst, None).unwrap();
        assert_eq!(m.get_values(&dst, &keyset(&["k"])).unwrap()["k"], b"v");
        // dst keeps its own stamp: a replayed older op is still skipped.
        m.set_keys(&dst, &kv(&[("k", b"replay")]), Some(&SeqPos::new(8, 0, 0)))
            .unwrap();
        assert_eq!(m.get_values(&dst, &keyset(&["k"])).unwrap()["k"], b"v");
    }

    #[test]
    fn test_iter_after() {
        let dir = tempfile::tempdir().unwrap();
        let m = open_map(dir.path());
        let o = Oid::new("obj");
        m.set_keys(&o, &kv(&[("a", b"1"), ("b", b"2"), ("c", b"3")]), None)
            .unwrap();
        let all = m.iter_after(&o, None).unwrap();
        assert_eq!(all.len(), 3);
        let rest = m.iter_after(&o, Some("a")).unwrap();
        assert_eq!(rest[0].0, "b");
        assert_eq!(rest.len(), 2);
    }

    #[test]
    fn test_torn_log_line_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let o = Oid::new("obj");
        {
            let m = open_map(dir.path());
            m.set_keys(&o, &kv(&[("k", b"v")]), None).unwrap();
        }
        // Crash mid-append: half a JSON line.
        {
            use std::io::Write;
            let mut f = OpenOptions::new()
                .append(true)
                .open(dir.path().join("omap/log"))
                .unwrap();
            f.write_all(b"{\"checksum\":12,\"mutation\":{\"SetK").unwrap();
        }
        let m = open_map(dir.path());
        assert_eq!(m.get_values(&o, &keyset(&["k"])).unwrap()["k"], b"v");
    }

    #[test]
    fn test_spilled_xattrs_namespace_is_separate() {
        let dir = tempfile::tempdir().unwrap();
        let m = open_map(dir.path());
        let o = Oid::new("obj");
        m.set_xattrs(&o, &kv(&[("big", b"blob")]), None).unwrap();
        m.set_keys(&o, &kv(&[("big", b"user-key")]), None).unwrap();
        assert_eq!(m.get_xattrs(&o, &keyset(&["big"])).unwrap()["big"], b"blob");
        assert_eq!(m.get_values(&o, &keyset(&["big"])).unwrap()["big"], b"user-key");
        assert_eq!(m.get_all_xattrs(&o).unwrap(), keyset(&["big"]));
    }
}
