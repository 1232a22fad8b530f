//! Safe wrappers over the extended-attribute syscall family.
//!
//! `nix` does not cover xattrs, so these call `libc` directly and translate
//! errno into the store taxonomy (`ENODATA` and `ERANGE` matter to callers:
//! the attribute store retries `ERANGE` with a grown buffer and treats
//! `ENODATA` as the spill-to-omap signal).

use std::ffi::CString;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use dirstore_error::{Result, StoreError};

fn cstr(bytes: &[u8], what: &str) -> Result<CString> {
    CString::new(bytes).map_err(|_| StoreError::Decode {
        detail: format!("interior NUL in {what}"),
    })
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Read an xattr from an open file, growing the buffer on `ERANGE`.
pub fn fget(file: &File, name: &str) -> Result<Vec<u8>> {
    let cname = cstr(name.as_bytes(), "xattr name")?;
    let mut cap = 256_usize;
    loop {
        let mut buf = vec![0_u8; cap];
        let r = unsafe {
            libc::fgetxattr(
                file.as_raw_fd(),
                cname.as_ptr(),
                buf.as_mut_ptr().cast(),
                buf.len(),
            )
        };
        if r >= 0 {
            #[allow(clippy::cast_sign_loss)]
            buf.truncate(r as usize);
            return Ok(buf);
        }
        let errno = last_errno();
        if errno == libc::ERANGE {
            cap *= 4;
            continue;
        }
        return Err(StoreError::from_errno(errno, name));
    }
}

/// Write an xattr on an open file.
pub fn fset(file: &File, name: &str, value: &[u8]) -> Result<()> {
    let cname = cstr(name.as_bytes(), "xattr name")?;
    let r = unsafe {
        libc::fsetxattr(
            file.as_raw_fd(),
            cname.as_ptr(),
            value.as_ptr().cast(),
            value.len(),
            0,
        )
    };
    if r < 0 {
        return Err(StoreError::from_errno(last_errno(), name));
    }
    Ok(())
}

/// Remove an xattr from an open file.
pub fn fremove(file: &File, name: &str) -> Result<()> {
    let cname = cstr(name.as_bytes(), "xattr name")?;
    let r = unsafe { libc::fremovexattr(file.as_raw_fd(), cname.as_ptr()) };
    if r < 0 {
        return Err(StoreError::from_errno(last_errno(), name));
    }
    Ok(())
}

/// List xattr names on an open file.
pub fn flist(file: &File) -> Result<Vec<String>> {
    let mut cap = 1024_usize;
    loop {
        let mut buf = vec![0_u8; cap];
        let r =
            unsafe { libc::flistxattr(file.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        if r >= 0 {
            #[allow(clippy::cast_sign_loss)]
            buf.truncate(r as usize);
            return Ok(parse_name_list(&buf));
        }
        let errno = last_errno();
        if errno == libc::ERANGE {
            cap *= 4;
            continue;
        }
        return Err(StoreError::from_errno(errno, "listxattr"));
    }
}

fn path_cstr(path: &Path) -> Result<CString> {
    cstr(path.as_os_str().as_bytes(), "path")
}

/// Read an xattr by path.
pub fn get(path: &Path, name: &str) -> Result<Vec<u8>> {
    let cpath = path_cstr(path)?;
    let cname = cstr(name.as_bytes(), "xattr name")?;
    let mut cap = 256_usize;
    loop {
        let mut buf = vec![0_u8; cap];
        let r = unsafe {
            libc::getxattr(
                cpath.as_ptr(),
                cname.as_ptr(),
                buf.as_mut_ptr().cast(),
                buf.len(),
            )
        };
        if r >= 0 {
            #[allow(clippy::cast_sign_loss)]
            buf.truncate(r as usize);
            return Ok(buf);
        }
        let errno = last_errno();
        if errno == libc::ERANGE {
            cap *= 4;
            continue;
        }
        return Err(StoreError::from_errno(errno, name));
    }
}

/// Write an xattr by path.
pub fn set(path: &Path, name: &str, value: &[u8]) -> Result<()> {
    let cpath = path_cstr(path)?;
    let cname = cstr(name.as_bytes(), "xattr name")?;
    let r = unsafe {
        libc::setxattr(
            cpath.as_ptr(),
            cname.as_ptr(),
            value.as_ptr().cast(),
            value.len(),
            0,
        )
    };
    if r < 0 {
        return Err(StoreError::from_errno(last_errno(), name));
    }
    Ok(())
}

/// Remove an xattr by path.
pub fn remove(path: &Path, name: &str) -> Result<()> {
    let cpath = path_cstr(path)?;
    let cname = cstr(name.as_bytes(), "xattr name")?;
    let r = unsafe { libc::removexattr(cpath.as_ptr(), cname.as_ptr()) };
    if r < 0 {
        return Err(StoreError::from_errno(last_errno(), name));
    }
    Ok(())
}

/// List xattr names by path.
pub fn list(path: &Path) -> Result<Vec<String>> {
    let cpath = path_cstr(path)?;
    let mut cap = 1024_usize;
    loop {
        let mut buf = vec![0_u8; cap];
        let r = unsafe { libc::listxattr(cpath.as_ptr(), buf.as_mut_ptr().cast(), buf.len()) };
        if r >= 0 {
            #[allow(clippy::cast_sign_loss)]
            buf.truncate(r as usize);
            return Ok(parse_name_list(&buf));
        }
        let errno = last_errno();
        if errno == libc::ERANGE {
            cap *= 4;
            continue;
        }
        return Err(StoreError::from_errno(errno, "listxattr"));
    }
}

/// Split the NUL-separated name list returned by `listxattr`.
fn parse_name_list(buf: &[u8]) -> Vec<String> {
    buf.split(|&b| b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    fn scratch() -> (tempfile::TempDir, File, std::path::PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("obj");
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .read(true)
            .open(&path)
            .expect("open");
        (dir, file, path)
    }

    #[test]
    fn test_fset_fget_round_trip() {
        let (_dir, file, _path) = scratch();
        fset(&file, "user.test.k", b"value").unwrap();
        assert_eq!(fget(&file, "user.test.k").unwrap(), b"value");
    }

    #[test]
    fn test_missing_attr_is_no_data() {
        let (_dir, file, _path) = scratch();
        let err = fget(&file, "user.test.absent").unwrap_err();
        assert!(err.is_no_data(), "got {err}");
    }

    #[test]
    fn test_remove_and_list() {
        let (_dir, file, path) = scratch();
        fset(&file, "user.test.a", b"1").unwrap();
        fset(&file, "user.test.b", b"2").unwrap();
        let names = flist(&file).unwrap();
        assert!(names.contains(&"user.test.a".to_owned()));
        assert!(names.contains(&"user.test.b".to_owned()));

        remove(&path, "user.test.a").unwrap();
        let names = list(&path).unwrap();
        assert!(!names.contains(&"user.test.a".to_owned()));
    }

    #[test]
    fn test_large_value_round_trip() {
        let (_dir, file, _path) = scratch();
        // Bigger than the first-guess buffer so the ERANGE retry path runs.
        let v = vec![0xab_u8; 600];
        fset(&file, "user.test.big", &v).unwrap();
        assert_eq!(fget(&file, "user.test.big").unwrap(), v);
    }

    #[test]
    fn test_path_variants() {
        let (_dir, _file, path) = scratch();
        set(&path, "user.test.p", b"by-path").unwrap();
        assert_eq!(get(&path, "user.test.p").unwrap(), b"by-path");
        let err = get(&path, "user.test.nope").unwrap_err();
        assert!(err.is_no_data());
    }
}
