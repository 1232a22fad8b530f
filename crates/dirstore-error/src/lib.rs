use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for dirstore operations.
///
/// The variants mirror the errno classes the apply path cares about: the
/// interpreter tolerates some of them during replay (`NotFound`, `NoData`,
/// `AlreadyExists`, `Range`) and treats the rest as fatal.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Object, collection, or snapshot absent.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// Extended attribute or omap key absent.
    #[error("no data: {what}")]
    NoData { what: String },

    /// Target already exists (collection create, hard link).
    #[error("already exists: {what}")]
    AlreadyExists { what: String },

    /// The instance identity file is locked by another process.
    #[error("store is locked by another instance: '{path}'")]
    Busy { path: PathBuf },

    /// Underlying filesystem is out of space.
    #[error("no space left on device")]
    NoSpace,

    /// Directory expected to be empty is not.
    #[error("directory not empty: '{path}'")]
    NotEmpty { path: PathBuf },

    /// Short read on a clone-range source.
    #[error("short read: wanted {wanted} bytes at offset {offset}, got {got}")]
    Range {
        offset: u64,
        wanted: usize,
        got: usize,
    },

    /// Journal or omap record failed validation.
    #[error("corruption: {detail}")]
    Corrupt { detail: String },

    /// Transaction wire format could not be decoded.
    #[error("transaction decode failed: {detail}")]
    Decode { detail: String },

    /// On-disk version stamp does not match this build and upgrading was
    /// not requested.
    #[error("on-disk version {found} != supported {supported} (pass do_update to upgrade)")]
    VersionMismatch { found: u32, supported: u32 },

    /// Stored fsid does not match the identity the caller expected.
    #[error("fsid mismatch: on disk {found}, expected {expected}")]
    IdentityMismatch { found: String, expected: String },

    /// `current/nosnap` is present; rolling back to an older snapshot would
    /// discard data written since snapshots were disabled.
    #[error("refusing rollback to stale snapshot (current/nosnap present); set use_stale_snap to force")]
    StaleSnapshot,

    /// The commit watchdog fired.
    #[error("commit exceeded timeout")]
    CommitTimeout,

    /// Operation refused on submission (kept only for journal replay).
    #[error("operation {op} is deprecated and cannot be journaled")]
    DeprecatedOp { op: &'static str },

    /// Requested capability is not available on this filesystem.
    #[error("operation not supported by the underlying filesystem")]
    Unsupported,

    /// Store is not mounted (or already unmounted).
    #[error("store is not mounted")]
    NotMounted,

    /// Any other I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

impl StoreError {
    /// Classify a raw errno from a syscall wrapper into the taxonomy.
    #[must_use]
    pub fn from_errno(errno: i32, what: impl Into<String>) -> Self {
        match errno {
            libc_consts::ENOENT => Self::NotFound { what: what.into() },
            libc_consts::ENODATA => Self::NoData { what: what.into() },
            libc_consts::EEXIST => Self::AlreadyExists { what: what.into() },
            libc_consts::ENOSPC => Self::NoSpace,
            libc_consts::ENOTEMPTY => Self::NotEmpty {
                path: PathBuf::from(what.into()),
            },
            libc_consts::EOPNOTSUPP => Self::Unsupported,
            _ => Self::Io(std::io::Error::from_raw_os_error(errno)),
        }
    }

    /// True for the "object/collection absent" class.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// True for the "attribute/key absent" class.
    #[must_use]
    pub fn is_no_data(&self) -> bool {
        matches!(self, Self::NoData { .. })
    }

    /// True for the "target already exists" class.
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::AlreadyExists { .. } => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::AlreadyExists,
            _ => false,
        }
    }

    /// True for the short-read class tolerated on replayed clone ranges.
    #[must_use]
    pub fn is_range(&self) -> bool {
        matches!(self, Self::Range { .. })
    }

    /// Negative status code delivered on `on_applied` notifiers.
    ///
    /// The mapping is errno-shaped so submitters can switch on well-known
    /// values; errors without an errno analog map to `-EIO`.
    #[must_use]
    pub fn status(&self) -> i32 {
        match self {
            Self::NotFound { .. } => -libc_consts::ENOENT,
            Self::NoData { .. } => -libc_consts::ENODATA,
            Self::AlreadyExists { .. } => -libc_consts::EEXIST,
            Self::Busy { .. } => -libc_consts::EBUSY,
            Self::NoSpace => -libc_consts::ENOSPC,
            Self::NotEmpty { .. } => -libc_consts::ENOTEMPTY,
            Self::Range { .. } => -libc_consts::ERANGE,
            Self::Unsupported => -libc_consts::EOPNOTSUPP,
            Self::Io(e) => e.raw_os_error().map_or(-libc_consts::EIO, |r| -r),
            _ => -libc_consts::EIO,
        }
    }
}

/// The errno values the taxonomy distinguishes.
///
/// Kept as a local module instead of a libc dependency so the error crate
/// stays platform-independent; the numeric values are the Linux ones and only
/// travel through logs and completion statuses.
mod libc_consts {
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const EBUSY: i32 = 16;
    pub const EEXIST: i32 = 17;
    pub const ENOSPC: i32 = 28;
    pub const ERANGE: i32 = 34;
    pub const ENODATA: i32 = 61;
    pub const ENOTEMPTY: i32 = 39;
    pub const EOPNOTSUPP: i32 = 95;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_errno_classifies() {
        assert!(StoreError::from_errno(2, "x").is_not_found());
        assert!(StoreError::from_errno(61, "x").is_no_data());
        assert!(StoreError::from_errno(17, "x").is_already_exists());
        assert!(matches!(StoreError::from_errno(28, "x"), StoreError::NoSpace));
        assert!(matches!(
            StoreError::from_errno(95, "x"),
            StoreError::Unsupported
        ));
    }

    #[test]
    fn test_io_not_found_counts_as_not_found() {
        let e = StoreError::Io(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(e.is_not_found());
    }

    #[test]
    fn test_status_is_negative_errno() {
        assert_eq!(
            StoreError::NotFound {
                what: "obj".to_owned()
            }
            .status(),
            -2
        );
        assert_eq!(StoreError::NoSpace.status(), -28);
        assert_eq!(
            StoreError::Range {
                offset: 0,
                wanted: 8,
                got: 0
            }
            .status(),
            -34
        );
    }

    #[test]
    fn test_status_io_passthrough() {
        let e = StoreError::Io(std::io::Error::from_raw_os_error(13));
        assert_eq!(e.status(), -13);
    }
}
