//! Transactions: an ordered opcode stream with a frozen binary wire format.
//!
//! The on-wire layout is little-endian throughout:
//!
//! ```text
//! transaction := op_count:u32 op*
//! op          := tag:u32 fields
//! bytes       := len:u32 byte*          (strings are utf-8 bytes)
//! map         := count:u32 (key:bytes value:bytes)*
//! set         := count:u32 key:bytes*
//! ```
//!
//! Decoding is strict: unknown tags, truncated fields, and trailing garbage
//! all fail with an explicit error (the mount path treats that as journal
//! corruption). The format is frozen within a major version.

use std::collections::{BTreeMap, BTreeSet};

use dirstore_error::{Result, StoreError};
use serde::{Deserialize, Serialize};

use crate::oid::{Cid, Oid};

/// One opcode with its inline arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Nop,
    Touch {
        cid: Cid,
        oid: Oid,
    },
    Write {
        cid: Cid,
        oid: Oid,
        offset: u64,
        data: Vec<u8>,
    },
    Zero {
        cid: Cid,
        oid: Oid,
        offset: u64,
        len: u64,
    },
    Truncate {
        cid: Cid,
        oid: Oid,
        size: u64,
    },
    Remove {
        cid: Cid,
        oid: Oid,
    },
    SetAttr {
        cid: Cid,
        oid: Oid,
        name: String,
        value: Vec<u8>,
    },
    SetAttrs {
        cid: Cid,
        oid: Oid,
        attrs: BTreeMap<String, Vec<u8>>,
    },
    RmAttr {
        cid: Cid,
        oid: Oid,
        name: String,
    },
    RmAttrs {
        cid: Cid,
        oid: Oid,
    },
    Clone {
        cid: Cid,
        src: Oid,
        dst: Oid,
    },
    CloneRange {
        cid: Cid,
        src: Oid,
        dst: Oid,
        src_off: u64,
        len: u64,
        dst_off: u64,
    },
    CreateCollection {
        cid: Cid,
    },
    DestroyCollection {
        cid: Cid,
    },
    CollAdd {
        new_cid: Cid,
        old_cid: Cid,
        oid: Oid,
    },
    CollRemove {
        cid: Cid,
        oid: Oid,
    },
    /// Deprecated: accepted on decode so old journals replay, refused on
    /// submission.
    CollMove {
        old_cid: Cid,
        new_cid: Cid,
        oid: Oid,
    },
    CollRename {
        old_cid: Cid,
        new_cid: Cid,
    },
    CollSetAttr {
        cid: Cid,
        name: String,
        value: Vec<u8>,
    },
    CollRmAttr {
        cid: Cid,
        name: String,
    },
    OmapClear {
        cid: Cid,
        oid: Oid,
    },
    OmapSetKeys {
        cid: Cid,
        oid: Oid,
        keys: BTreeMap<String, Vec<u8>>,
    },
    OmapRmKeys {
        cid: Cid,
        oid: Oid,
        keys: BTreeSet<String>,
    },
    OmapSetHeader {
        cid: Cid,
        oid: Oid,
        header: Vec<u8>,
    },
    StartSync,
}

// Wire tags. Frozen; append only.
const TAG_NOP: u32 = 0;
const TAG_TOUCH: u32 = 1;
const TAG_WRITE: u32 = 2;
const TAG_ZERO: u32 = 3;
const TAG_TRUNCATE: u32 = 4;
const TAG_REMOVE: u32 = 5;
const TAG_SETATTR: u32 = 6;
const TAG_SETATTRS: u32 = 7;
const TAG_RMATTR: u32 = 8;
const TAG_RMATTRS: u32 = 9;
const TAG_CLONE: u32 = 10;
const TAG_CLONE_RANGE: u32 = 11;
const TAG_MKCOLL: u32 = 12;
const TAG_RMCOLL: u32 = 13;
const TAG_COLL_ADD: u32 = 14;
const TAG_COLL_REMOVE: u32 = 15;
const TAG_COLL_MOVE: u32 = 16;
const TAG_COLL_RENAME: u32 = 17;
const TAG_COLL_SETATTR: u32 = 18;
const TAG_COLL_RMATTR: u32 = 19;
const TAG_OMAP_CLEAR: u32 = 20;
const TAG_OMAP_SETKEYS: u32 = 21;
const TAG_OMAP_RMKEYS: u32 = 22;
const TAG_OMAP_SETHEADER: u32 = 23;
const TAG_STARTSYNC: u32 = 24;

impl Op {
    /// Short name for logs and the fatal-dump path.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Nop => "nop",
            Self::Touch { .. } => "touch",
            Self::Write { .. } => "write",
            Self::Zero { .. } => "zero",
            Self::Truncate { .. } => "truncate",
            Self::Remove { .. } => "remove",
            Self::SetAttr { .. } => "setattr",
            Self::SetAttrs { .. } => "setattrs",
            Self::RmAttr { .. } => "rmattr",
            Self::RmAttrs { .. } => "rmattrs",
            Self::Clone { .. } => "clone",
            Self::CloneRange { .. } => "clone_range",
            Self::CreateCollection { .. } => "create_collection",
            Self::DestroyCollection { .. } => "destroy_collection",
            Self::CollAdd { .. } => "coll_add",
            Self::CollRemove { .. } => "coll_remove",
            Self::CollMove { .. } => "coll_move",
            Self::CollRename { .. } => "coll_rename",
            Self::CollSetAttr { .. } => "coll_setattr",
            Self::CollRmAttr { .. } => "coll_rmattr",
            Self::OmapClear { .. } => "omap_clear",
            Self::OmapSetKeys { .. } => "omap_setkeys",
            Self::OmapRmKeys { .. } => "omap_rmkeys",
            Self::OmapSetHeader { .. } => "omap_setheader",
            Self::StartSync => "startsync",
        }
    }

    /// Payload bytes carried by this op, for throttle accounting.
    #[must_use]
    pub fn payload_bytes(&self) -> u64 {
        match self {
            Self::Write { data, .. } => data.len() as u64,
            Self::SetAttr { value, .. } | Self::CollSetAttr { value, .. } => value.len() as u64,
            Self::SetAttrs { attrs, .. } => {
                attrs.values().map(|v| v.len() as u64).sum()
            }
            Self::OmapSetKeys { keys, .. } => keys.values().map(|v| v.len() as u64).sum(),
            Self::OmapSetHeader { header, .. } => header.len() as u64,
            _ => 0,
        }
    }
}

/// An ordered sequence of opcodes applied atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    ops: Vec<Op>,
}

impl Transaction {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    #[must_use]
    pub fn num_ops(&self) -> u64 {
        self.ops.len() as u64
    }

    #[must_use]
    pub fn num_bytes(&self) -> u64 {
        self.ops.iter().map(Op::payload_bytes).sum()
    }

    /// True if the transaction carries an op that may no longer be journaled.
    #[must_use]
    pub fn has_deprecated_op(&self) -> bool {
        self.ops.iter().any(|op| matches!(op, Op::CollMove { .. }))
    }

    pub fn push(&mut self, op: Op) {
        self.ops.push(op);
    }

    // --- builder conveniences -------------------------------------------

    pub fn nop(&mut self) {
        self.push(Op::Nop);
    }

    pub fn touch(&mut self, cid: Cid, oid: Oid) {
        self.push(Op::Touch { cid, oid });
    }

    pub fn write(&mut self, cid: Cid, oid: Oid, offset: u64, data: Vec<u8>) {
        self.push(Op::Write {
            cid,
            oid,
            offset,
            data,
        });
    }

    pub fn zero(&mut self, cid: Cid, oid: Oid, offset: u64, len: u64) {
        self.push(Op::Zero {
            cid,
            oid,
            offset,
            len,
        });
    }

    pub fn truncate(&mut self, cid: Cid, oid: Oid, size: u64) {
        self.push(Op::Truncate { cid, oid, size });
    }

    pub fn remove(&mut self, cid: Cid, oid: Oid) {
        self.push(Op::Remove { cid, oid });
    }

    pub fn setattr(&mut self, cid: Cid, oid: Oid, name: impl Into<String>, value: Vec<u8>) {
        self.push(Op::SetAttr {
            cid,
            oid,
            name: name.into(),
            value,
        });
    }

    pub fn setattrs(&mut self, cid: Cid, oid: Oid, attrs: BTreeMap<String, Vec<u8>>) {
        self.push(Op::SetAttrs { cid, oid, attrs });
    }

    pub fn rmattr(&mut self, cid: Cid, oid: Oid, name: impl Into<String>) {
        self.push(Op::RmAttr {
            cid,
            oid,
            name: name.into(),
        });
    }

    pub fn rmattrs(&mut self, cid: Cid, oid: Oid) {
        self.push(Op::RmAttrs { cid, oid });
    }

    pub fn clone_object(&mut self, cid: Cid, src: Oid, dst: Oid) {
        self.push(Op::Clone { cid, src, dst });
    }

    pub fn clone_range(
        &mut self,
        cid: Cid,
        src: Oid,
        dst: Oid,
        src_off: u64,
        len: u64,
        dst_off: u64,
    ) {
        self.push(Op::CloneRange {
            cid,
            src,
            dst,
            src_off,
            len,
            dst_off,
        });
    }

    pub fn create_collection(&mut self, cid: Cid) {
        self.push(Op::CreateCollection { cid });
    }

    pub fn destroy_collection(&mut self, cid: Cid) {
        self.push(Op::DestroyCollection { cid });
    }

    pub fn coll_add(&mut self, new_cid: Cid, old_cid: Cid, oid: Oid) {
        self.push(Op::CollAdd {
            new_cid,
            old_cid,
            oid,
        });
    }

    pub fn coll_remove(&mut self, cid: Cid, oid: Oid) {
        self.push(Op::CollRemove { cid, oid });
    }

    pub fn coll_rename(&mut self, old_cid: Cid, new_cid: Cid) {
        self.push(Op::CollRename { old_cid, new_cid });
    }

    pub fn omap_clear(&mut self, cid: Cid, oid: Oid) {
        self.push(Op::OmapClear { cid, oid });
    }

    pub fn omap_setkeys(&mut self, cid: Cid, oid: Oid, keys: BTreeMap<String, Vec<u8>>) {
        self.push(Op::OmapSetKeys { cid, oid, keys });
    }

    pub fn omap_rmkeys(&mut self, cid: Cid, oid: Oid, keys: BTreeSet<String>) {
        self.push(Op::OmapRmKeys { cid, oid, keys });
    }

    pub fn omap_setheader(&mut self, cid: Cid, oid: Oid, header: Vec<u8>) {
        self.push(Op::OmapSetHeader { cid, oid, header });
    }

    pub fn start_sync(&mut self) {
        self.push(Op::StartSync);
    }

    // --- wire format ----------------------------------------------------

    /// Append the wire encoding of this transaction to `buf`.
    #[allow(clippy::too_many_lines)]
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_u32(buf, u32::try_from(self.ops.len()).unwrap_or(u32::MAX));
        for op in &self.ops {
            match op {
                Op::Nop => put_u32(buf, TAG_NOP),
                Op::Touch { cid, oid } => {
                    put_u32(buf, TAG_TOUCH);
                    put_cid(buf, cid);
                    put_oid(buf, oid);
                }
                Op::Write {
                    cid,
                    oid,
                    offset,
                    data,
                } => {
                    put_u32(buf, TAG_WRITE);
                    put_cid(buf, cid);
                    put_oid(buf, oid);
                    put_u64(buf, *offset);
                    put_bytes(buf, data);
                }
                Op::Zero {
                    cid,
                    oid,
                    offset,
                    len,
                } => {
                    put_u32(buf, TAG_ZERO);
                    put_cid(buf, cid);
                    put_oid(buf, oid);
                    put_u64(buf, *offset);
                    put_u64(buf, *len);
                }
                Op::Truncate { cid, oid, size } => {
                    put_u32(buf, TAG_TRUNCATE);
                    put_cid(buf, cid);
                    put_oid(buf, oid);
                    put_u64(buf, *size);
                }
                Op::Remove { cid, oid } => {
                    put_u32(buf, TAG_REMOVE);
                    put_cid(buf, cid);
                    put_oid(buf, oid);
                }
                Op::SetAttr {
                    cid,
                    oid,
                    name,
                    value,
                } => {
                    put_u32(buf, TAG_SETATTR);
                    put_cid(buf, cid);
                    put_oid(buf, oid);
                    put_str(buf, name);
                    put_bytes(buf, value);
                }
                Op::SetAttrs { cid, oid, attrs } => {
                    put_u32(buf, TAG_SETATTRS);
                    put_cid(buf, cid);
                    put_oid(buf, oid);
                    put_map(buf, attrs);
                }
                Op::RmAttr { cid, oid, name } => {
                    put_u32(buf, TAG_RMATTR);
                    put_cid(buf, cid);
                    put_oid(buf, oid);
                    put_str(buf, name);
                }
                Op::RmAttrs { cid, oid } => {
                    put_u32(buf, TAG_RMATTRS);
                    put_cid(buf, cid);
                    put_oid(buf, oid);
                }
                Op::Clone { cid, src, dst } => {
                    put_u32(buf, TAG_CLONE);
                    put_cid(buf, cid);
                    put_oid(buf, src);
                    put_oid(buf, dst);
                }
                Op::CloneRange {
                    cid,
                    src,
                    dst,
                    src_off,
                    len,
                    dst_off,
                } => {
                    put_u32(buf, TAG_CLONE_RANGE);
                    put_cid(buf, cid);
                    put_oid(buf, src);
                    put_oid(buf, dst);
                    put_u64(buf, *src_off);
                    put_u64(buf, *len);
                    put_u64(buf, *dst_off);
                }
                Op::CreateCollection { cid } => {
                    put_u32(buf, TAG_MKCOLL);
                    put_cid(buf, cid);
                }
                Op::DestroyCollection { cid } => {
                    put_u32(buf, TAG_RMCOLL);
                    put_cid(buf, cid);
                }
                Op::CollAdd {
                    new_cid,
                    old_cid,
                    oid,
                } => {
                    put_u32(buf, TAG_COLL_ADD);
                    put_cid(buf, new_cid);
                    put_cid(buf, old_cid);
                    put_oid(buf, oid);
                }
                Op::CollRemove { cid, oid } => {
                    put_u32(buf, TAG_COLL_REMOVE);
                    put_cid(buf, cid);
                    put_oid(buf, oid);
                }
                Op::CollMove {
                    old_cid,
                    new_cid,
                    oid,
                } => {
                    put_u32(buf, TAG_COLL_MOVE);
                    put_cid(buf, old_cid);
                    put_cid(buf, new_cid);
                    put_oid(buf, oid);
                }
                Op::CollRename { old_cid, new_cid } => {
                    put_u32(buf, TAG_COLL_RENAME);
                    put_cid(buf, old_cid);
                    put_cid(buf, new_cid);
                }
                Op::CollSetAttr { cid, name, value } => {
                    put_u32(buf, TAG_COLL_SETATTR);
                    put_cid(buf, cid);
                    put_str(buf, name);
                    put_bytes(buf, value);
                }
                Op::CollRmAttr { cid, name } => {
                    put_u32(buf, TAG_COLL_RMATTR);
                    put_cid(buf, cid);
                    put_str(buf, name);
                }
                Op::OmapClear { cid, oid } => {
                    put_u32(buf, TAG_OMAP_CLEAR);
                    put_cid(buf, cid);
                    put_oid(buf, oid);
                }
                Op::OmapSetKeys { cid, oid, keys } => {
                    put_u32(buf, TAG_OMAP_SETKEYS);
                    put_cid(buf, cid);
                    put_oid(buf, oid);
                    put_map(buf, keys);
                }
                Op::OmapRmKeys { cid, oid, keys } => {
                    put_u32(buf, TAG_OMAP_RMKEYS);
                    put_cid(buf, cid);
                    put_oid(buf, oid);
                    put_set(buf, keys);
                }
                Op::OmapSetHeader { cid, oid, header } => {
                    put_u32(buf, TAG_OMAP_SETHEADER);
                    put_cid(buf, cid);
                    put_oid(buf, oid);
                    put_bytes(buf, header);
                }
                Op::StartSync => put_u32(buf, TAG_STARTSYNC),
            }
        }
    }

    /// Encoded form as a fresh buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        self.encode(&mut buf);
        buf
    }

    /// Decode one transaction from the front of `cur`.
    #[allow(clippy::too_many_lines)]
    pub fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        let op_count = cur.u32()?;
        let mut ops = Vec::new();
        for _ in 0..op_count {
            let tag = cur.u32()?;
            let op = match tag {
                TAG_NOP => Op::Nop,
                TAG_TOUCH => Op::Touch {
                    cid: cur.cid()?,
                    oid: cur.oid()?,
                },
                TAG_WRITE => Op::Write {
                    cid: cur.cid()?,
                    oid: cur.oid()?,
                    offset: cur.u64()?,
                    data: cur.bytes()?,
                },
                TAG_ZERO => Op::Zero {
                    cid: cur.cid()?,
                    oid: cur.oid()?,
                    offset: cur.u64()?,
                    len: cur.u64()?,
                },
                TAG_TRUNCATE => Op::Truncate {
                    cid: cur.cid()?,
                    oid: cur.oid()?,
                    size: cur.u64()?,
                },
                TAG_REMOVE => Op::Remove {
                    cid: cur.cid()?,
                    oid: cur.oid()?,
                },
                TAG_SETATTR => Op::SetAttr {
                    cid: cur.cid()?,
                    oid: cur.oid()?,
                    name: cur.string()?,
                    value: cur.bytes()?,
                },
                TAG_SETATTRS => Op::SetAttrs {
                    cid: cur.cid()?,
                    oid: cur.oid()?,
                    attrs: cur.map()?,
                },
                TAG_RMATTR => Op::RmAttr {
                    cid: cur.cid()?,
                    oid: cur.oid()?,
                    name: cur.string()?,
                },
                TAG_RMATTRS => Op::RmAttrs {
                    cid: cur.cid()?,
                    oid: cur.oid()?,
                },
                TAG_CLONE => Op::Clone {
                    cid: cur.cid()?,
                    src: cur.oid()?,
                    dst: cur.oid()?,
                },
                TAG_CLONE_RANGE => Op::CloneRange {
                    cid: cur.cid()?,
                    src: cur.oid()?,
                    dst: cur.oid()?,
                    src_off: cur.u64()?,
                    len: cur.u64()?,
                    dst_off: cur.u64()?,
                },
                TAG_MKCOLL => Op::CreateCollection { cid: cur.cid()? },
                TAG_RMCOLL => Op::DestroyCollection { cid: cur.cid()? },
                TAG_COLL_ADD => Op::CollAdd {
                    new_cid: cur.cid()?,
                    old_cid: cur.cid()?,
                    oid: cur.oid()?,
                },
                TAG_COLL_REMOVE => Op::CollRemove {
                    cid: cur.cid()?,
                    oid: cur.oid()?,
                },
                TAG_COLL_MOVE => Op::CollMove {
                    old_cid: cur.cid()?,
                    new_cid: cur.cid()?,
                    oid: cur.oid()?,
                },
                TAG_COLL_RENAME => Op::CollRename {
                    old_cid: cur.cid()?,
                    new_cid: cur.cid()?,
                },
                TAG_COLL_SETATTR => Op::CollSetAttr {
                    cid: cur.cid()?,
                    name: cur.string()?,
                    value: cur.bytes()?,
                },
                TAG_COLL_RMATTR => Op::CollRmAttr {
                    cid: cur.cid()?,
                    name: cur.string()?,
                },
                TAG_OMAP_CLEAR => Op::OmapClear {
                    cid: cur.cid()?,
                    oid: cur.oid()?,
                },
                TAG_OMAP_SETKEYS => Op::OmapSetKeys {
                    cid: cur.cid()?,
                    oid: cur.oid()?,
                    keys: cur.map()?,
                },
                TAG_OMAP_RMKEYS => Op::OmapRmKeys {
                    cid: cur.cid()?,
                    oid: cur.oid()?,
                    keys: cur.set()?,
                },
                TAG_OMAP_SETHEADER => Op::OmapSetHeader {
                    cid: cur.cid()?,
                    oid: cur.oid()?,
                    header: cur.bytes()?,
                },
                TAG_STARTSYNC => Op::StartSync,
                other => {
                    return Err(StoreError::Decode {
                        detail: format!("unknown opcode tag {other}"),
                    });
                }
            };
            ops.push(op);
        }
        Ok(Self { ops })
    }

    /// Decode a transaction that must occupy the whole buffer.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(buf);
        let txn = Self::decode(&mut cur)?;
        if !cur.is_empty() {
            return Err(StoreError::Decode {
                detail: format!("{} trailing bytes after transaction", cur.remaining()),
            });
        }
        Ok(txn)
    }
}

/// Encode a submitted batch (the unit a journal record holds).
#[must_use]
pub fn encode_batch(txns: &[Transaction]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(128);
    put_u32(&mut buf, u32::try_from(txns.len()).unwrap_or(u32::MAX));
    for t in txns {
        t.encode(&mut buf);
    }
    buf
}

/// Decode a submitted batch; the buffer must be fully consumed.
pub fn decode_batch(buf: &[u8]) -> Result<Vec<Transaction>> {
    let mut cur = Cursor::new(buf);
    let count = cur.u32()?;
    let mut out = Vec::new();
    for _ in 0..count {
        out.push(Transaction::decode(&mut cur)?);
    }
    if !cur.is_empty() {
        return Err(StoreError::Decode {
            detail: format!("{} trailing bytes after batch", cur.remaining()),
        });
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Primitive encoding helpers
// ---------------------------------------------------------------------------

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_bytes(buf: &mut Vec<u8>, b: &[u8]) {
    put_u32(buf, u32::try_from(b.len()).unwrap_or(u32::MAX));
    buf.extend_from_slice(b);
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    put_bytes(buf, s.as_bytes());
}

fn put_cid(buf: &mut Vec<u8>, cid: &Cid) {
    put_str(buf, cid.as_str());
}

fn put_oid(buf: &mut Vec<u8>, oid: &Oid) {
    put_str(buf, oid.name());
}

fn put_map(buf: &mut Vec<u8>, m: &BTreeMap<String, Vec<u8>>) {
    put_u32(buf, u32::try_from(m.len()).unwrap_or(u32::MAX));
    for (k, v) in m {
        put_str(buf, k);
        put_bytes(buf, v);
    }
}

fn put_set(buf: &mut Vec<u8>, s: &BTreeSet<String>) {
    put_u32(buf, u32::try_from(s.len()).unwrap_or(u32::MAX));
    for k in s {
        put_str(buf, k);
    }
}

/// Bounds-checked reader over an encoded buffer.
#[derive(Debug)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or_else(|| StoreError::Decode {
            detail: "length overflow".to_owned(),
        })?;
        if end > self.buf.len() {
            return Err(StoreError::Decode {
                detail: format!(
                    "truncated record: need {n} bytes at offset {}, have {}",
                    self.pos,
                    self.remaining()
                ),
            });
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes(b.try_into().expect("4-byte slice")))
    }

    pub fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes(b.try_into().expect("8-byte slice")))
    }

    pub fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn string(&mut self) -> Result<String> {
        let raw = self.bytes()?;
        String::from_utf8(raw).map_err(|_| StoreError::Decode {
            detail: "non-utf8 string field".to_owned(),
        })
    }

    pub fn cid(&mut self) -> Result<Cid> {
        Ok(Cid::new(self.string()?))
    }

    pub fn oid(&mut self) -> Result<Oid> {
        Ok(Oid::new(self.string()?))
    }

    pub fn map(&mut self) -> Result<BTreeMap<String, Vec<u8>>> {
        let count = self.u32()?;
        let mut out = BTreeMap::new();
        for _ in 0..count {
            let k = self.string()?;
            let v = self.bytes()?;
            out.insert(k, v);
        }
        Ok(out)
    }

    pub fn set(&mut self) -> Result<BTreeSet<String>> {
        let count = self.u32()?;
        let mut out = BTreeSet::new();
        for _ in 0..count {
            out.insert(self.string()?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_txn() -> Transaction {
        let mut t = Transaction::new();
        let c = Cid::new("coll");
        t.create_collection(c.clone());
        t.touch(c.clone(), Oid::new("a"));
        t.write(c.clone(), Oid::new("a"), 8, b"payload".to_vec());
        t.zero(c.clone(), Oid::new("a"), 0, 4);
        t.setattr(c.clone(), Oid::new("a"), "k", vec![1, 2, 3]);
        t.clone_range(c.clone(), Oid::new("a"), Oid::new("b"), 0, 7, 0);
        let mut keys = BTreeMap::new();
        keys.insert("x".to_owned(), vec![9]);
        t.omap_setkeys(c.clone(), Oid::new("a"), keys);
        let mut rm = BTreeSet::new();
        rm.insert("y".to_owned());
        t.omap_rmkeys(c, Oid::new("a"), rm);
        t.start_sync();
        t
    }

    #[test]
    fn test_wire_round_trip() {
        let t = sample_txn();
        let buf = t.to_bytes();
        let back = Transaction::from_bytes(&buf).unwrap();
        assert_eq!(t, back);
    }

    #[test]
    fn test_batch_round_trip() {
        let batch = vec![sample_txn(), Transaction::new(), sample_txn()];
        let buf = encode_batch(&batch);
        let back = decode_batch(&buf).unwrap();
        assert_eq!(batch, back);
    }

    #[test]
    fn test_truncated_decode_fails() {
        let buf = sample_txn().to_bytes();
        for cut in [1, buf.len() / 2, buf.len() - 1] {
            let err = Transaction::from_bytes(&buf[..cut]).unwrap_err();
            assert!(matches!(err, StoreError::Decode { .. }), "cut at {cut}");
        }
    }

    #[test]
    fn test_unknown_tag_fails() {
        let mut buf = Vec::new();
        put_u32(&mut buf, 1);
        put_u32(&mut buf, 0xdead_beef);
        assert!(matches!(
            Transaction::from_bytes(&buf),
            Err(StoreError::Decode { .. })
        ));
    }

    #[test]
    fn test_trailing_garbage_fails() {
        let mut buf = sample_txn().to_bytes();
        buf.push(0);
        assert!(matches!(
            Transaction::from_bytes(&buf),
            Err(StoreError::Decode { .. })
        ));
    }

    #[test]
    fn test_accounting() {
        let mut t = Transaction::new();
        t.write(Cid::new("c"), Oid::new("o"), 0, vec![0; 10]);
        t.setattr(Cid::new("c"), Oid::new("o"), "k", vec![0; 5]);
        t.nop();
        assert_eq!(t.num_ops(), 3);
        assert_eq!(t.num_bytes(), 15);
    }

    #[test]
    fn test_coll_move_flagged_deprecated() {
        let mut t = Transaction::new();
        t.push(Op::CollMove {
            old_cid: Cid::new("a"),
            new_cid: Cid::new("b"),
            oid: Oid::new("o"),
        });
        assert!(t.has_deprecated_op());
        // It still round-trips so old journals replay.
        let back = Transaction::from_bytes(&t.to_bytes()).unwrap();
        assert_eq!(t, back);
    }

    proptest! {
        #[test]
        fn prop_write_round_trips(name in "[a-z]{1,12}", off in 0_u64..1 << 40, data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let mut t = Transaction::new();
            t.write(Cid::new("c"), Oid::new(name), off, data);
            let back = Transaction::from_bytes(&t.to_bytes()).unwrap();
            prop_assert_eq!(t, back);
        }
    }
}
