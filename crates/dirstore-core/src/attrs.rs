//! The attribute store: user attributes as chunked xattrs with transparent
//! spill to the object map.
//!
//! User attributes live under their own namespace prefix, apart from the
//! reserved internal keys (replay guard, long filename). Values larger than
//! one underlying xattr are split across `name`, `name@1`, `name@2`, …;
//! a literal `@` in a raw name is escaped by doubling it. When the
//! filesystem refuses an inline write for space, or the configured omap
//! preference applies, the value moves to the object map and reads fall
//! back there on *no data*.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use dirstore_error::{Result, StoreError};
use dirstore_fs::xattr;
use dirstore_omap::ObjectMap;
use dirstore_types::{CoreContext, Oid, SeqPos};
use tracing::{debug, warn};

/// Namespace prefix for user attributes.
pub(crate) const USER_PREFIX: &str = "user.dirstore.a.";

fn is_no_space(e: &StoreError) -> bool {
    match e {
        StoreError::NoSpace => true,
        StoreError::Io(io) => io.raw_os_error() == Some(libc_e2big()),
        _ => false,
    }
}

const fn libc_e2big() -> i32 {
    7 // E2BIG: value too large for an inline xattr
}

/// Build the raw xattr key for chunk `chunk` of attribute `name`.
fn raw_name(name: &str, chunk: u32) -> String {
    let mut out = String::with_capacity(USER_PREFIX.len() + name.len() + 4);
    out.push_str(USER_PREFIX);
    for c in name.chars() {
        if c == '@' {
            out.push_str("@@");
        } else {
            out.push(c);
        }
    }
    if chunk > 0 {
        out.push('@');
        out.push_str(&chunk.to_string());
    }
    out
}

/// Invert [`raw_name`]: the attribute name and chunk index.
fn parse_raw(raw: &str) -> Option<(String, u32)> {
    let rest = raw.strip_prefix(USER_PREFIX)?;
    let mut name = String::new();
    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '@' {
            if chars.peek() == Some(&'@') {
                chars.next();
                name.push('@');
            } else {
                // Unescaped '@': the rest is the chunk index.
                let idx: String = chars.collect();
                return idx.parse().ok().map(|i| (name, i));
            }
        } else {
            name.push(c);
        }
    }
    Some((name, 0))
}

pub(crate) struct AttrStore {
    cx: Arc<CoreContext>,
    omap: Arc<dyn ObjectMap>,
}

impl AttrStore {
    pub fn new(cx: Arc<CoreContext>, omap: Arc<dyn ObjectMap>) -> Self {
        Self { cx, omap }
    }

    /// Read one attribute. `oid` enables the object-map fallback; collection
    /// directories pass `None`.
    pub fn get(&self, path: &Path, oid: Option<&Oid>, name: &str) -> Result<Vec<u8>> {
        match self.get_inline(path, name) {
            Ok(v) => Ok(v),
            Err(e) if e.is_no_data() || e.is_not_found() => {
                let Some(oid) = oid else { return Err(e) };
                let mut want = BTreeSet::new();
                want.insert(name.to_owned());
                let mut got = self.omap.get_xattrs(oid, &want)?;
                got.remove(name).ok_or(e)
            }
            Err(e) => Err(e),
        }
    }

    fn get_inline(&self, path: &Path, name: &str) -> Result<Vec<u8>> {
        let mut value = xattr::get(path, &raw_name(name, 0))?;
        for chunk in 1.. {
            match xattr::get(path, &raw_name(name, chunk)) {
                Ok(mut more) => value.append(&mut more),
                Err(e) if e.is_no_data() => break,
                Err(e) => return Err(e),
            }
        }
        Ok(value)
    }

    /// Write one attribute, spilling to the object map when the inline
    /// store refuses or the configured preference applies.
    pub fn set(
        &self,
        path: &Path,
        oid: Option<&Oid>,
        name: &str,
        value: &[u8],
        spos: Option<&SeqPos>,
    ) -> Result<()> {
        let cfg = self.cx.config();
        if let Some(oid) = oid {
            if cfg.prefer_omap {
                let inline = self.inline_names(path)?;
                let over_size = value.len() > cfg.max_inline_xattr_size;
                let over_count =
                    !inline.contains(name) && inline.len() >= cfg.max_inline_xattrs;
                if over_size || over_count {
                    debug!(name, len = value.len(), "attribute routed to object map");
                    return self.spill(path, oid, name, value, spos);
                }
            }
        }

        match self.set_inline(path, name, value) {
            Ok(()) => {
                // Drop any stale spilled copy so reads stay unambiguous.
                if let Some(oid) = oid {
                    let mut names = BTreeSet::new();
                    names.insert(name.to_owned());
                    self.omap.remove_xattrs(oid, &names, spos)?;
                }
                Ok(())
            }
            Err(e) if is_no_space(&e) => {
                let Some(oid) = oid else { return Err(e) };
                warn!(name, "inline xattr store full, migrating value to object map");
                self.remove_inline(path, name)?;
                self.spill(path, oid, name, value, spos)
            }
            Err(e) => Err(e),
        }
    }

    fn spill(
        &self,
        path: &Path,
        oid: &Oid,
        name: &str,
        value: &[u8],
        spos: Option<&SeqPos>,
    ) -> Result<()> {
        let mut attrs = BTreeMap::new();
        attrs.insert(name.to_owned(), value.to_vec());
        self.omap.set_xattrs(oid, &attrs, spos)?;
        // Inline copy, if any, is stale now.
        self.remove_inline(path, name)?;
        Ok(())
    }

    fn set_inline(&self, path: &Path, name: &str, value: &[u8]) -> Result<()> {
        let chunk_size = self.cx.config().xattr_chunk_size.max(1);
        let mut chunk = 0_u32;
        let mut offset = 0_usize;
        loop {
            let end = (offset + chunk_size).min(value.len());
            if let Err(e) = xattr::set(path, &raw_name(name, chunk), &value[offset..end]) {
                // Remove the partial chunks we managed to write.
                for c in 0..=chunk {
                    let _ = xattr::remove(path, &raw_name(name, c));
                }
                return Err(e);
            }
            chunk += 1;
            offset = end;
            if offset >= value.len() {
                break;
            }
        }
        // A shorter rewrite leaves stale tail chunks behind; clear them.
        loop {
            match xattr::remove(path, &raw_name(name, chunk)) {
                Ok(()) => chunk += 1,
                Err(e) if e.is_no_data() => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Remove inline chunks. Returns whether anything was present.
    fn remove_inline(&self, path: &Path, name: &str) -> Result<bool> {
        let mut chunk = 0_u32;
        loop {
            match xattr::remove(path, &raw_name(name, chunk)) {
                Ok(()) => chunk += 1,
                Err(e) if e.is_no_data() => break,
                Err(e) if e.is_not_found() && chunk == 0 => break,
                Err(e) => return Err(e),
            }
        }
        Ok(chunk > 0)
    }

    /// Remove one attribute from both stores. *No data* when neither had it.
    pub fn remove(
        &self,
        path: &Path,
        oid: Option<&Oid>,
        name: &str,
        spos: Option<&SeqPos>,
    ) -> Result<()> {
        let had_inline = self.remove_inline(path, name)?;
        let mut had_spilled = false;
        if let Some(oid) = oid {
            let mut names = BTreeSet::new();
            names.insert(name.to_owned());
            had_spilled = self.omap.get_all_xattrs(oid)?.contains(name);
            self.omap.remove_xattrs(oid, &names, spos)?;
        }
        if had_inline || had_spilled {
            Ok(())
        } else {
            Err(StoreError::NoData {
                what: name.to_owned(),
            })
        }
    }

    /// Remove every user attribute.
    pub fn remove_all(&self, path: &Path, oid: Option<&Oid>, spos: Option<&SeqPos>) -> Result<()> {
        for name in self.list(path, None)? {
            self.remove_inline(path, &name)?;
        }
        if let Some(oid) = oid {
            let spilled = self.omap.get_all_xattrs(oid)?;
            self.omap.remove_xattrs(oid, &spilled, spos)?;
        }
        Ok(())
    }

    /// All user attribute names (inline and spilled).
    pub fn list(&self, path: &Path, oid: Option<&Oid>) -> Result<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        for raw in xattr::list(path)? {
            if let Some((name, chunk)) = parse_raw(&raw) {
                if chunk == 0 {
                    names.insert(name);
                }
            }
        }
        if let Some(oid) = oid {
            names.extend(self.omap.get_all_xattrs(oid)?);
        }
        Ok(names)
    }

    fn inline_names(&self, path: &Path) -> Result<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        for raw in xattr::list(path)? {
            if let Some((name, 0)) = parse_raw(&raw) {
                names.insert(name);
            }
        }
        Ok(names)
    }

    /// Read every user attribute.
    pub fn get_all(&self, path: &Path, oid: Option<&Oid>) -> Result<BTreeMap<String, Vec<u8>>> {
        let mut out = BTreeMap::new();
        for name in self.list(path, oid)? {
            out.insert(name.clone(), self.get(path, oid, &name)?);
        }
        Ok(out)
    }

    /// Write a batch of attributes.
    pub fn set_many(
        &self,
        path: &Path,
        oid: Option<&Oid>,
        attrs: &BTreeMap<String, Vec<u8>>,
        spos: Option<&SeqPos>,
    ) -> Result<()> {
        for (name, value) in attrs {
            self.set(path, oid, name, value, spos)?;
        }
        Ok(())
    }
}
