//! On-disk layout rooted at the store's base directory.
//!
//! ```text
//! <base>/fsid                    36-byte uuid + newline, exclusively locked
//! <base>/store_version           little-endian u32
//! <base>/journal                 default file journal
//! <base>/current/                working directory
//! <base>/current/commit_op_seq   ascii decimal committed seq + newline
//! <base>/current/nosnap          present iff snapshot commits are off
//! <base>/current/omap/           object map
//! <base>/current/<cid>/...       collection directories
//! <base>/snap_<N>                commit snapshots
//! <base>/clustersnap_<name>      operator snapshots
//! ```

use std::path::{Path, PathBuf};

use dirstore_types::oid::escape_name;
use dirstore_types::Cid;

/// On-disk store format version.
pub const STORE_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub(crate) struct Layout {
    base: PathBuf,
}

impl Layout {
    pub fn new(base: &Path) -> Self {
        Self {
            base: base.to_path_buf(),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn fsid_file(&self) -> PathBuf {
        self.base.join("fsid")
    }

    pub fn version_file(&self) -> PathBuf {
        self.base.join("store_version")
    }

    pub fn journal_file(&self) -> PathBuf {
        self.base.join("journal")
    }

    pub fn current(&self) -> PathBuf {
        self.base.join("current")
    }

    pub fn op_seq_file(&self) -> PathBuf {
        self.current().join("commit_op_seq")
    }

    pub fn nosnap_file(&self) -> PathBuf {
        self.current().join("nosnap")
    }

    pub fn omap_dir(&self) -> PathBuf {
        self.current().join("omap")
    }

    pub fn coll_dir(&self, cid: &Cid) -> PathBuf {
        self.current().join(escape_name(cid.as_str()))
    }

    pub fn snap_dir(&self, seq: u64) -> PathBuf {
        self.base.join(format!("snap_{seq}"))
    }

    pub fn cluster_snap_dir(&self, name: &str) -> PathBuf {
        self.base.join(format!("clustersnap_{}", escape_name(name)))
    }

    /// Parse a base-directory entry as a commit snapshot seq.
    pub fn parse_snap_name(name: &str) -> Option<u64> {
        name.strip_prefix("snap_")?.parse().ok()
    }

    /// Parse a base-directory entry as an operator snapshot name.
    pub fn parse_cluster_snap_name(name: &str) -> Option<String> {
        use dirstore_types::oid::unescape_name;
        unescape_name(name.strip_prefix("clustersnap_")?)
    }

    /// Decode a `current/` entry back into a collection id. Non-collection
    /// entries (omap, bookkeeping files) yield `None`.
    pub fn parse_coll_name(name: &str) -> Option<Cid> {
        use dirstore_types::oid::unescape_name;
        if name == "omap" || name == "commit_op_seq" || name == "nosnap" || name.starts_with('.') {
            return None;
        }
        unescape_name(name).map(Cid::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let l = Layout::new(Path::new("/data/osd0"));
        assert_eq!(l.op_seq_file(), Path::new("/data/osd0/current/commit_op_seq"));
        assert_eq!(l.snap_dir(9), Path::new("/data/osd0/snap_9"));
        assert_eq!(
            l.coll_dir(&Cid::new("pg 1.2")),
            Path::new("/data/osd0/current/pg%201.2")
        );
    }

    #[test]
    fn test_snap_name_parse() {
        assert_eq!(Layout::parse_snap_name("snap_42"), Some(42));
        assert_eq!(Layout::parse_snap_name("snap_x"), None);
        assert_eq!(Layout::parse_snap_name("current"), None);
        assert_eq!(
            Layout::parse_cluster_snap_name("clustersnap_weekly"),
            Some("weekly".to_owned())
        );
    }

    #[test]
    fn test_coll_name_filtering() {
        assert_eq!(Layout::parse_coll_name("omap"), None);
        assert_eq!(Layout::parse_coll_name("commit_op_seq"), None);
        assert_eq!(Layout::parse_coll_name("nosnap"), None);
        assert_eq!(Layout::parse_coll_name("meta"), Some(Cid::new("meta")));
        assert_eq!(
            Layout::parse_coll_name("pg%201.2"),
            Some(Cid::new("pg 1.2"))
        );
    }
}
