//! Per-inode replay guards.
//!
//! A guard is the `(SeqPos, in_progress)` pair stored under a reserved
//! xattr on the object file or collection directory that a non-idempotent
//! op is about to modify. During journal replay the stored position decides
//! whether the op already happened. Outside replay, and whenever snapshot
//! commits make replay start from a known-good snapshot, guards are inert.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use dirstore_error::Result;
use dirstore_fs::xattr;
use dirstore_omap::ObjectMap;
use dirstore_types::{CoreContext, Oid, SeqPos};
use tracing::debug;

/// Reserved xattr key holding the guard value.
pub(crate) const GUARD_XATTR: &str = "user.dirstore._guard";

/// Outcome of comparing the stored guard against an incoming position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardCheck {
    /// No newer guard: execute the op.
    Replay,
    /// A newer (or equal, completed) guard exists: the op is a no-op.
    Skip,
    /// The same position was mid-flight at the crash; the primitive form is
    /// idempotent, so execute it again.
    Conditional,
}

impl GuardCheck {
    #[must_use]
    pub fn should_apply(self) -> bool {
        !matches!(self, Self::Skip)
    }
}

pub(crate) struct ReplayGuard {
    cx: Arc<CoreContext>,
    omap: Arc<dyn ObjectMap>,
    /// Snapshot commits active: guards are unnecessary and skipped.
    stable_snapshots: bool,
}

impl ReplayGuard {
    pub fn new(cx: Arc<CoreContext>, omap: Arc<dyn ObjectMap>, stable_snapshots: bool) -> Self {
        Self {
            cx,
            omap,
            stable_snapshots,
        }
    }

    /// Record that a non-idempotent op at `spos` is starting against `file`.
    ///
    /// The target is fsynced first so the guard can never be durable while
    /// an older mutation is not, and fsynced after so the guard itself is
    /// durable before the mutation begins.
    pub fn open(&self, file: &File, oid: Option<&Oid>, spos: &SeqPos) -> Result<()> {
        self.set(file, oid, spos, true)
    }

    /// Record that the op at `spos` finished.
    pub fn close(&self, file: &File, spos: &SeqPos) -> Result<()> {
        self.set(file, None, spos, false)
    }

    /// Stamp a completed op in one step (open+close collapsed, used when the
    /// mutation itself was just made durable).
    pub fn seal(&self, file: &File, oid: Option<&Oid>, spos: &SeqPos) -> Result<()> {
        self.set(file, oid, spos, false)
    }

    fn set(&self, file: &File, oid: Option<&Oid>, spos: &SeqPos, in_progress: bool) -> Result<()> {
        if self.stable_snapshots {
            return Ok(());
        }
        debug!(%spos, in_progress, "set replay guard");
        self.cx.inject_failure("guard.set.pre");

        // Make the preceding mutation durable before the guard claims it
        // happened.
        file.sync_all()?;
        if let Some(oid) = oid {
            // The object map must not lose its stamp either: a crash after
            // the guard is durable but before the omap stamp would redo a
            // non-idempotent omap mutation.
            self.omap.sync_object(oid, spos)?;
        }

        self.cx.inject_failure("guard.set.mid");
        xattr::fset(file, GUARD_XATTR, &spos.encode_guard(in_progress))?;
        file.sync_all()?;
        self.cx.inject_failure("guard.set.post");
        Ok(())
    }

    /// Compare the guard on an open file against `spos`.
    pub fn check_file(&self, file: &File, spos: &SeqPos, replaying: bool) -> GuardCheck {
        if !replaying || self.stable_snapshots {
            return GuardCheck::Replay;
        }
        match xattr::fget(file, GUARD_XATTR) {
            Ok(raw) => Self::compare(&raw, spos),
            // No guard recorded: replay freely.
            Err(_) => GuardCheck::Replay,
        }
    }

    /// Compare the guard at `path` (file or collection directory). A missing
    /// target has no guard and replays freely.
    pub fn check_path(&self, path: &Path, spos: &SeqPos, replaying: bool) -> GuardCheck {
        if !replaying || self.stable_snapshots {
            return GuardCheck::Replay;
        }
        match xattr::get(path, GUARD_XATTR) {
            Ok(raw) => Self::compare(&raw, spos),
            Err(_) => GuardCheck::Replay,
        }
    }

    /// Guard a collection directory by path (directories have no fd-based
    /// xattr path here; the value is written through the path).
    pub fn set_path(&self, path: &Path, spos: &SeqPos, in_progress: bool) -> Result<()> {
        if self.stable_snapshots {
            return Ok(());
        }
        debug!(path = %path.display(), %spos, in_progress, "set replay guard (dir)");
        self.cx.inject_failure("guard.set_path.pre");
        let dir = File::open(path)?;
        dir.sync_all()?;
        xattr::set(path, GUARD_XATTR, &spos.encode_guard(in_progress))?;
        dir.sync_all()?;
        self.cx.inject_failure("guard.set_path.post");
        Ok(())
    }

    fn compare(raw: &[u8], spos: &SeqPos) -> GuardCheck {
        let Some((stored, in_progress)) = SeqPos::decode_guard(raw) else {
            // Unreadable guard value: treat as absent.
            return GuardCheck::Replay;
        };
        if stored > *spos {
            debug!(%stored, %spos, "guard newer, skipping replay");
            GuardCheck::Skip
        } else if stored == *spos {
            if in_progress {
                debug!(%stored, "guard equal and in-progress, conditional replay");
                GuardCheck::Conditional
            } else {
                debug!(%stored, "guard equal and complete, skipping replay");
                GuardCheck::Skip
            }
        } else {
            GuardCheck::Replay
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirstore_omap::FileObjectMap;
    use dirstore_types::StoreConfig;
    use std::fs::OpenOptions;

    fn setup(stable: bool) -> (tempfile::TempDir, ReplayGuard, File) {
        let dir = tempfile::tempdir().unwrap();
        let omap = Arc::new(FileObjectMap::open(&dir.path().join("omap")).unwrap());
        let cx = Arc::new(CoreContext::new(StoreConfig::default()));
        let guard = ReplayGuard::new(cx, omap, stable);
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(dir.path().join("obj"))
            .unwrap();
        (dir, guard, file)
    }

    #[test]
    fn test_missing_guard_replays() {
        let (_d, guard, file) = setup(false);
        let pos = SeqPos::new(3, 0, 0);
        assert_eq!(guard.check_file(&file, &pos, true), GuardCheck::Replay);
    }

    #[test]
    fn test_not_replaying_always_applies() {
        let (_d, guard, file) = setup(false);
        let pos = SeqPos::new(3, 0, 0);
        guard.seal(&file, None, &pos).unwrap();
        assert_eq!(guard.check_file(&file, &pos, false), GuardCheck::Replay);
    }

    #[test]
    fn test_newer_guard_skips() {
        let (_d, guard, file) = setup(false);
        guard.seal(&file, None, &SeqPos::new(5, 0, 0)).unwrap();
        assert_eq!(
            guard.check_file(&file, &SeqPos::new(4, 9, 9), true),
            GuardCheck::Skip
        );
    }

    #[test]
    fn test_equal_completed_skips_equal_inflight_conditional() {
        let (_d, guard, file) = setup(false);
        let pos = SeqPos::new(5, 1, 2);

        guard.open(&file, None, &pos).unwrap();
        assert_eq!(guard.check_file(&file, &pos, true), GuardCheck::Conditional);

        guard.close(&file, &pos).unwrap();
        assert_eq!(guard.check_file(&file, &pos, true), GuardCheck::Skip);
    }

    #[test]
    fn test_older_guard_replays() {
        let (_d, guard, file) = setup(false);
        guard.seal(&file, None, &SeqPos::new(5, 0, 0)).unwrap();
        assert_eq!(
            guard.check_file(&file, &SeqPos::new(6, 0, 0), true),
            GuardCheck::Replay
        );
    }

    #[test]
    fn test_stable_snapshots_disable_guards() {
        let (_d, guard, file) = setup(true);
        let pos = SeqPos::new(5, 0, 0);
        guard.seal(&file, None, &pos).unwrap();
        // Nothing was written and checks always replay.
        assert!(xattr::fget(&file, GUARD_XATTR).is_err());
        assert_eq!(guard.check_file(&file, &pos, true), GuardCheck::Replay);
    }

    #[test]
    fn test_guard_syncs_omap_stamp() {
        let dir = tempfile::tempdir().unwrap();
        let omap = Arc::new(FileObjectMap::open(&dir.path().join("omap")).unwrap());
        let cx = Arc::new(CoreContext::new(StoreConfig::default()));
        let guard = ReplayGuard::new(cx, Arc::clone(&omap) as Arc<dyn ObjectMap>, false);
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(dir.path().join("obj"))
            .unwrap();

        let oid = Oid::new("obj");
        let pos = SeqPos::new(7, 0, 0);
        guard.open(&file, Some(&oid), &pos).unwrap();

        // An omap mutation replayed from an older position is now a no-op.
        let mut keys = std::collections::BTreeMap::new();
        keys.insert("k".to_owned(), b"stale".to_vec());
        omap.set_keys(&oid, &keys, Some(&SeqPos::new(6, 0, 0))).unwrap();
        assert!(omap.get_keys(&oid).unwrap().is_empty());
    }
}
