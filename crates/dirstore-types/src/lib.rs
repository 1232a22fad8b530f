//! Core types shared across the dirstore workspace: object and collection
//! names, sequencer positions, the transaction opcode set with its frozen
//! wire format, configuration, and the per-instance context.

pub mod config;
pub mod context;
pub mod oid;
pub mod spos;
pub mod txn;

pub use config::{JournalMode, StoreConfig};
pub use context::{CoreContext, Metrics};
pub use oid::{Cid, Oid};
pub use spos::SeqPos;
pub use txn::{Op, Transaction};
