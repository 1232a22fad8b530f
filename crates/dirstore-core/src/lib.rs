//! dirstore: a local object-store engine over a POSIX directory tree.
//!
//! Objects, grouped into collections, are stored as files in hash-indexed
//! directories under `<base>/current/`. Multi-operation transactions are
//! journaled ahead of apply, ordered per sequencer stream, and made durable
//! by a periodic commit cycle; crash recovery replays the journal from the
//! committed watermark with per-inode replay guards keeping non-idempotent
//! ops from running twice.
//!
//! ```no_run
//! use dirstore_core::{DirStore, Sequencer, Cid, Oid, StoreConfig, Transaction};
//!
//! let mut store = DirStore::new("/var/lib/dirstore".as_ref(), StoreConfig::default());
//! store.mkfs()?;
//! store.mount()?;
//!
//! let coll = Cid::new("objects");
//! let obj = Oid::new("greeting");
//! let mut txn = Transaction::new();
//! txn.create_collection(coll.clone());
//! txn.touch(coll.clone(), obj.clone());
//! txn.write(coll.clone(), obj.clone(), 0, b"hello".to_vec());
//! store.apply_transaction(txn)?;
//!
//! assert_eq!(store.read(&coll, &obj, 0, 5)?, b"hello");
//! store.umount()?;
//! # Ok::<(), dirstore_core::StoreError>(())
//! ```

mod attrs;
mod committer;
pub mod completion;
mod exec;
mod flusher;
mod guard;
mod index;
mod layout;
mod sequencer;
mod store;
mod throttle;

pub use completion::{pair, Done, Wait};
pub use layout::STORE_VERSION;
pub use sequencer::Sequencer;
pub use store::{DirStore, Stat};

pub use dirstore_error::{Result, StoreError};
pub use dirstore_types::{
    Cid, CoreContext, JournalMode, Oid, Op, SeqPos, StoreConfig, Transaction,
};
