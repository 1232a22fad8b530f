//! Filesystem capability detection.
//!
//! Mount probes the data directory once and records what the filesystem can
//! do; the portable operations consult the flags to pick a fast path. All
//! probes work by *trying* the operation on scratch files, never by matching
//! filesystem magic numbers.

use std::fs::OpenOptions;
use std::path::Path;

use dirstore_error::Result;
use tracing::debug;

use crate::{portable, xattr};

/// What the filesystem under the data directory supports.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsCapabilities {
    /// `fallocate(FALLOC_FL_PUNCH_HOLE)` works.
    pub punch_hole: bool,
    /// `ioctl(FICLONERANGE)` works (reflink-capable filesystem).
    pub clone_range: bool,
    /// Extended attributes can be written and read back.
    pub xattrs: bool,
    /// Inline xattr headroom in bytes observed by the probe.
    pub xattr_headroom: usize,
}

impl FsCapabilities {
    /// Probe the filesystem holding `dir`.
    pub fn detect(dir: &Path) -> Result<Self> {
        let mut caps = Self::default();

        let probe_a = dir.join(".dirstore_probe_a");
        let probe_b = dir.join(".dirstore_probe_b");
        let open = |p: &Path| {
            OpenOptions::new()
                .create(true)
                .truncate(true)
                .read(true)
                .write(true)
                .open(p)
        };
        let a = open(&probe_a)?;
        let b = open(&probe_b)?;
        a.set_len(8192)?;

        caps.punch_hole = portable::punch_hole(&a, 0, 4096).is_ok();
        caps.clone_range = portable::reflink_range(&a, &b, 0, 4096, 0).is_ok();

        // Try a modest inline value, then step up to find the headroom class.
        caps.xattrs = xattr::fset(&a, "user.dirstore._probe", b"x").is_ok();
        if caps.xattrs {
            caps.xattr_headroom = 0;
            for size in [1_usize << 10, 4 << 10, 16 << 10, 64 << 10] {
                let v = vec![0_u8; size];
                if xattr::fset(&a, "user.dirstore._probe", &v).is_err() {
                    break;
                }
                caps.xattr_headroom = size;
            }
            let _ = xattr::fremove(&a, "user.dirstore._probe");
        }

        drop(a);
        drop(b);
        let _ = std::fs::remove_file(&probe_a);
        let _ = std::fs::remove_file(&probe_b);

        debug!(
            punch_hole = caps.punch_hole,
            clone_range = caps.clone_range,
            xattrs = caps.xattrs,
            xattr_headroom = caps.xattr_headroom,
            "filesystem capabilities detected"
        );
        Ok(caps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_runs_and_cleans_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        let caps = FsCapabilities::detect(dir.path()).unwrap();
        // tmpfs/ext4/btrfs all support xattrs; the others vary.
        assert!(caps.xattrs);
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert!(leftovers.is_empty(), "probe files left behind: {leftovers:?}");
    }
}
