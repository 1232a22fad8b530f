//! Filesystem capability layer for dirstore.
//!
//! Everything platform-specific lives here: the xattr syscall family, hole
//! punching, range cloning, directory snapshots, whole-filesystem sync, and
//! advisory locking. Higher layers see capability flags plus portable
//! operations that fall back gracefully when a fast path is missing.

pub mod caps;
pub mod portable;
pub mod xattr;

pub use caps::FsCapabilities;
