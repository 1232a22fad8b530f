//! Portable filesystem operations with fast paths.
//!
//! Each operation tries the capability-gated fast path and falls back to a
//! plain-POSIX equivalent: hole punching falls back to writing zeros, range
//! cloning to a read/write copy loop, snapshots to a recursive copy taken
//! while apply is quiesced.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::path::Path;

use dirstore_error::{Result, StoreError};
use tracing::debug;

use crate::xattr;

/// Copy-loop buffer: 32 pages, matching the classic copy-range chunk.
const COPY_BUF: usize = 4096 * 32;

// ---------------------------------------------------------------------------
// Hole punching
// ---------------------------------------------------------------------------

/// Punch a hole in `file`. Fails with `Unsupported` when the filesystem
/// cannot; callers fall back to [`zero_range`].
pub fn punch_hole(file: &File, offset: u64, len: u64) -> Result<()> {
    let mode = nix::fcntl::FallocateFlags::FALLOC_FL_PUNCH_HOLE
        | nix::fcntl::FallocateFlags::FALLOC_FL_KEEP_SIZE;
    let off = i64::try_from(offset).map_err(|_| StoreError::Unsupported)?;
    let l = i64::try_from(len).map_err(|_| StoreError::Unsupported)?;
    match nix::fcntl::fallocate(file.as_raw_fd(), mode, off, l) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EOPNOTSUPP | nix::errno::Errno::ENOSYS) => {
            Err(StoreError::Unsupported)
        }
        Err(e) => Err(StoreError::Io(e.into())),
    }
}

/// Overwrite a range with zeros (the universal hole-punch fallback).
pub fn zero_range(file: &File, offset: u64, len: u64) -> Result<()> {
    let mut remaining = len;
    let mut pos = offset;
    let zeros = vec![0_u8; COPY_BUF.min(usize::try_from(len).unwrap_or(COPY_BUF))];
    while remaining > 0 {
        let chunk = usize::try_from(remaining).unwrap_or(zeros.len()).min(zeros.len());
        file.write_all_at(&zeros[..chunk], pos)?;
        pos += chunk as u64;
        remaining -= chunk as u64;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Range cloning
// ---------------------------------------------------------------------------

#[repr(C)]
struct FileCloneRange {
    src_fd: i64,
    src_offset: u64,
    src_length: u64,
    dest_offset: u64,
}

/// Reflink a range via `ioctl(FICLONERANGE)`. `Unsupported` when the
/// filesystem cannot share extents (callers fall back to [`copy_range`]).
pub fn reflink_range(src: &File, dst: &File, src_off: u64, len: u64, dst_off: u64) -> Result<()> {
    let args = FileCloneRange {
        src_fd: i64::from(src.as_raw_fd()),
        src_offset: src_off,
        src_length: len,
        dest_offset: dst_off,
    };
    let r = unsafe { libc::ioctl(dst.as_raw_fd(), libc::FICLONERANGE, &args) };
    if r == 0 {
        return Ok(());
    }
    let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
    match errno {
        // EINVAL: unaligned or overlapping; EXDEV: cross-filesystem;
        // EOPNOTSUPP/ENOTTY: no reflink on this filesystem.
        libc::EINVAL | libc::EXDEV | libc::EOPNOTSUPP | libc::ENOTTY => {
            Err(StoreError::Unsupported)
        }
        e => Err(StoreError::Io(io::Error::from_raw_os_error(e))),
    }
}

/// Copy `len` bytes from `src@src_off` to `dst@dst_off` with a buffer loop.
///
/// A zero-length read before `len` is satisfied reports `Range` (short
/// source); replay tolerates it, live apply does not.
pub fn copy_range(src: &File, dst: &File, src_off: u64, len: u64, dst_off: u64) -> Result<u64> {
    let mut buf = vec![0_u8; COPY_BUF];
    let mut pos = 0_u64;
    while pos < len {
        let want = usize::try_from((len - pos).min(COPY_BUF as u64)).unwrap_or(COPY_BUF);
        let got = src.read_at(&mut buf[..want], src_off + pos)?;
        if got == 0 {
            return Err(StoreError::Range {
                offset: src_off + pos,
                wanted: want,
                got: 0,
            });
        }
        dst.write_all_at(&buf[..got], dst_off + pos)?;
        pos += got as u64;
    }
    Ok(pos)
}

/// Clone a range, preferring reflink when `can_reflink` and offsets are
/// block-aligned, copying otherwise.
pub fn clone_range(
    src: &File,
    dst: &File,
    src_off: u64,
    len: u64,
    dst_off: u64,
    can_reflink: bool,
) -> Result<u64> {
    if can_reflink && len > 0 {
        match reflink_range(src, dst, src_off, len, dst_off) {
            Ok(()) => return Ok(len),
            Err(StoreError::Unsupported) => {
                debug!(src_off, len, dst_off, "reflink declined, copying");
            }
            Err(e) => return Err(e),
        }
    }
    copy_range(src, dst, src_off, len, dst_off)
}

// ---------------------------------------------------------------------------
// Snapshots (recursive copy fallback)
// ---------------------------------------------------------------------------

/// Snapshot `src` into `dst` by recursive copy, carrying xattrs.
///
/// Only consistent when the caller has quiesced writers (the commit
/// coordinator holds the apply gate closed across this call). `dst` must not
/// exist; the copy lands under a temporary name and is renamed into place so
/// a crash mid-snapshot never leaves a plausible-looking partial snapshot.
pub fn snapshot_dir(src: &Path, dst: &Path) -> Result<()> {
    if dst.exists() {
        return Err(StoreError::AlreadyExists {
            what: dst.display().to_string(),
        });
    }
    let parent = dst.parent().ok_or_else(|| StoreError::NotFound {
        what: dst.display().to_string(),
    })?;
    let staging = parent.join(format!(
        ".{}.tmp",
        dst.file_name().and_then(|n| n.to_str()).unwrap_or("snap")
    ));
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    copy_tree(src, &staging)?;
    fs::rename(&staging, dst)?;
    fsync_dir(parent)?;
    Ok(())
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir(dst)?;
    copy_xattrs(src, dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let ty = entry.file_type()?;
        if ty.is_dir() {
            copy_tree(&from, &to)?;
        } else if ty.is_file() {
            fs::copy(&from, &to)?;
            copy_xattrs(&from, &to)?;
        }
        // Symlinks do not occur under current/; skip anything else.
    }
    Ok(())
}

fn copy_xattrs(from: &Path, to: &Path) -> Result<()> {
    let names = match xattr::list(from) {
        Ok(n) => n,
        // Filesystems without xattrs: nothing to carry.
        Err(StoreError::Unsupported) => return Ok(()),
        Err(e) => return Err(e),
    };
    for name in names {
        let value = xattr::get(from, &name)?;
        xattr::set(to, &name, &value)?;
    }
    Ok(())
}

/// Remove a snapshot directory.
pub fn destroy_dir(path: &Path) -> Result<()> {
    fs::remove_dir_all(path)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Durability helpers
// ---------------------------------------------------------------------------

/// Start write-out of a byte range without waiting (`SYNC_FILE_RANGE_WRITE`).
/// Used by the deferred flusher to smooth commit-time sync spikes.
pub fn sync_file_range_write(file: &File, offset: u64, len: u64) -> Result<()> {
    let off = i64::try_from(offset).map_err(|_| StoreError::Unsupported)?;
    let l = i64::try_from(len).map_err(|_| StoreError::Unsupported)?;
    let r = unsafe {
        libc::sync_file_range(file.as_raw_fd(), off, l, libc::SYNC_FILE_RANGE_WRITE)
    };
    if r < 0 {
        let errno = io::Error::last_os_error();
        if errno.raw_os_error() == Some(libc::ENOSYS) {
            return Err(StoreError::Unsupported);
        }
        return Err(StoreError::Io(errno));
    }
    Ok(())
}

/// fsync a directory so entry creation/removal survives a crash.
pub fn fsync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path)?;
    dir.sync_all()?;
    Ok(())
}

/// Flush every dirty page of the filesystem containing `path`.
pub fn sync_filesystem(path: &Path) -> Result<()> {
    let dir = File::open(path)?;
    let r = unsafe { libc::syncfs(dir.as_raw_fd()) };
    if r < 0 {
        return Err(StoreError::Io(io::Error::last_os_error()));
    }
    Ok(())
}

/// Overwrite `path` with `contents` and fsync file and directory.
pub fn write_file_durable(path: &Path, contents: &[u8]) -> Result<()> {
    use std::io::Write;
    let mut f = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(path)?;
    f.write_all(contents)?;
    f.sync_all()?;
    if let Some(parent) = path.parent() {
        fsync_dir(parent)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Advisory locking
// ---------------------------------------------------------------------------

/// Take a non-blocking exclusive fcntl lock over the whole file.
///
/// Held for the lifetime of the open descriptor; used to fence a second
/// instance off the data directory. Returns `Busy` when another process
/// holds it.
pub fn lock_file_exclusive(file: &File, path: &Path) -> Result<()> {
    let lock_type = i16::try_from(libc::F_WRLCK).expect("lock type fits i16");
    let whence = i16::try_from(libc::SEEK_SET).expect("SEEK_SET fits i16");
    let flock = libc::flock {
        l_type: lock_type,
        l_whence: whence,
        l_start: 0,
        l_len: 0,
        l_pid: 0,
    };
    match nix::fcntl::fcntl(file.as_raw_fd(), nix::fcntl::FcntlArg::F_SETLK(&flock)) {
        Ok(_) => Ok(()),
        Err(nix::errno::Errno::EACCES | nix::errno::Errno::EAGAIN) => Err(StoreError::Busy {
            path: path.to_path_buf(),
        }),
        Err(e) => Err(StoreError::Io(e.into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn scratch_file(dir: &Path, name: &str, contents: &[u8]) -> File {
        let mut f = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(dir.join(name))
            .expect("open");
        f.write_all(contents).expect("write");
        f
    }

    #[test]
    fn test_zero_range_matches_punch_semantics() {
        let dir = tempfile::tempdir().unwrap();
        let f = scratch_file(dir.path(), "z", b"AAAAAAAAAA");
        zero_range(&f, 2, 4).unwrap();
        let mut buf = [0_u8; 10];
        f.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"AA\0\0\0\0AAAA");
    }

    #[test]
    fn test_punch_hole_or_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let f = scratch_file(dir.path(), "p", &[0xff_u8; 8192]);
        match punch_hole(&f, 0, 4096) {
            Ok(()) => {
                let mut buf = [0_u8; 4];
                f.read_at(&mut buf, 0).unwrap();
                assert_eq!(buf, [0, 0, 0, 0]);
            }
            Err(StoreError::Unsupported) => {} // tmpfs on old kernels
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn test_copy_range_full() {
        let dir = tempfile::tempdir().unwrap();
        let a = scratch_file(dir.path(), "a", b"hello world");
        let b = scratch_file(dir.path(), "b", b"");
        let n = copy_range(&a, &b, 6, 5, 0).unwrap();
        assert_eq!(n, 5);
        let mut buf = [0_u8; 5];
        b.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn test_copy_range_short_source_is_range_error() {
        let dir = tempfile::tempdir().unwrap();
        let a = scratch_file(dir.path(), "a", b"abc");
        let b = scratch_file(dir.path(), "b", b"");
        let err = copy_range(&a, &b, 0, 10, 0).unwrap_err();
        assert!(err.is_range(), "got {err}");
    }

    #[test]
    fn test_clone_range_copy_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let a = scratch_file(dir.path(), "a", b"0123456789");
        let b = scratch_file(dir.path(), "b", b"");
        let n = clone_range(&a, &b, 0, 10, 0, false).unwrap();
        assert_eq!(n, 10);
    }

    #[test]
    fn test_snapshot_dir_copies_content_and_xattrs() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("current");
        fs::create_dir_all(src.join("coll")).unwrap();
        fs::write(src.join("coll/obj"), b"data").unwrap();
        xattr::set(&src.join("coll/obj"), "user.dirstore.a.k", b"v").unwrap();

        let dst = dir.path().join("snap_7");
        snapshot_dir(&src, &dst).unwrap();

        assert_eq!(fs::read(dst.join("coll/obj")).unwrap(), b"data");
        assert_eq!(
            xattr::get(&dst.join("coll/obj"), "user.dirstore.a.k").unwrap(),
            b"v"
        );

        // Second snapshot under the same name refuses.
        assert!(snapshot_dir(&src, &dst).unwrap_err().is_already_exists());
    }

    #[test]
    fn test_lock_file_exclusive_same_process_is_reentrant() {
        // fcntl locks are per-process: a second handle in this process
        // succeeds. Cross-process contention is what Busy guards against.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fsid");
        let a = scratch_file(dir.path(), "fsid", b"id\n");
        lock_file_exclusive(&a, &path).unwrap();
        let b = File::open(&path).unwrap();
        drop(b);
    }

    #[test]
    fn test_write_file_durable() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("commit_op_seq");
        write_file_durable(&p, b"42\n").unwrap();
        assert_eq!(fs::read(&p).unwrap(), b"42\n");
        write_file_durable(&p, b"43\n").unwrap();
        assert_eq!(fs::read(&p).unwrap(), b"43\n");
    }
}
