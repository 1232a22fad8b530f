//! Object and collection identifiers.
//!
//! Both are opaque byte strings with a textual form. Objects additionally
//! carry a 32-bit hash used for directory placement and for the stable
//! enumeration order of collection listings.

use std::fmt;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

/// An object identifier.
///
/// Total order is `(hash, name)`: the hash orders objects across the split
/// directory tree, the name breaks ties within a hash bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Oid {
    name: String,
    hash: u32,
}

impl Oid {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        #[allow(clippy::cast_possible_truncation)]
        let hash = xxh3_64(name.as_bytes()) as u32;
        Self { name, hash }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The 32-bit placement hash.
    #[must_use]
    pub fn hash(&self) -> u32 {
        self.hash
    }

    /// Hash nibbles, most significant first, used for directory descent.
    #[must_use]
    pub fn hash_nibbles(&self) -> [u8; 8] {
        let mut out = [0_u8; 8];
        for (i, n) in out.iter_mut().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            {
                *n = ((self.hash >> (28 - 4 * i)) & 0xf) as u8;
            }
        }
        out
    }
}

impl PartialOrd for Oid {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Oid {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.hash
            .cmp(&other.hash)
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:08x})", self.name, self.hash)
    }
}

/// A collection identifier, mapped one-to-one to `<base>/current/<cid>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cid(String);

impl Cid {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Escape an arbitrary byte string into a filesystem-safe name component.
///
/// Bytes outside `[A-Za-z0-9._-]` become `%XX`. The encoding is prefix-free
/// per byte, so escaped names compare the same as raw names and any byte
/// string round-trips.
#[must_use]
pub fn escape_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for &b in raw.as_bytes() {
        if b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-' {
            out.push(char::from(b));
        } else {
            out.push('%');
            out.push_str(&format!("{b:02X}"));
        }
    }
    out
}

/// Invert [`escape_name`]. Returns `None` on malformed input.
#[must_use]
pub fn unescape_name(escaped: &str) -> Option<String> {
    let bytes = escaped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3)?;
            let hi = char::from(hex[0]).to_digit(16)?;
            let lo = char::from(hex[1]).to_digit(16)?;
            #[allow(clippy::cast_possible_truncation)]
            out.push((hi * 16 + lo) as u8);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oid_order_is_hash_then_name() {
        let a = Oid::new("alpha");
        let b = Oid::new("beta");
        if a.hash() == b.hash() {
            assert_eq!(a.cmp(&b), a.name().cmp(b.name()));
        } else {
            assert_eq!(a.cmp(&b), a.hash().cmp(&b.hash()));
        }
    }

    #[test]
    fn test_hash_nibbles_reassemble() {
        let o = Oid::new("some-object");
        let mut h: u32 = 0;
        for n in o.hash_nibbles() {
            h = (h << 4) | u32::from(n);
        }
        assert_eq!(h, o.hash());
    }

    #[test]
    fn test_escape_round_trip() {
        for raw in ["plain", "with space", "sl/ash", "pct%sign", "uni\u{e9}", ""] {
            let esc = escape_name(raw);
            assert!(!esc.contains('/'), "escaped form must be path safe: {esc}");
            assert_eq!(unescape_name(&esc).as_deref(), Some(raw));
        }
    }

    #[test]
    fn test_unescape_rejects_malformed() {
        assert_eq!(unescape_name("%"), None);
        assert_eq!(unescape_name("%zz"), None);
    }

    #[test]
    fn test_same_name_same_hash() {
        assert_eq!(Oid::new("x").hash(), Oid::new("x").hash());
    }
}
