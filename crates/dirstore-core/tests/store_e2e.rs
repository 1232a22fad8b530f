//! End-to-end exercises of the transaction pipeline: round trips, crash
//! replay, guard-protected non-idempotent ops, attribute spill, and
//! collection moves.
//!
//! Crash points are simulated by leaking a mounted store (threads parked,
//! no umount, journal left un-trimmed) and mounting a fresh instance over
//! the same directory, exactly what a process kill leaves behind.

use std::collections::BTreeMap;
use std::time::Duration;

use dirstore_core::{
    Cid, DirStore, JournalMode, Oid, Sequencer, StoreConfig, StoreError, Transaction,
};

fn crash_test_config() -> StoreConfig {
    StoreConfig {
        // Keep the background committer out of the way; tests drive commits
        // explicitly via sync().
        max_sync_interval: Duration::from_secs(3600),
        min_sync_interval: Duration::from_millis(1),
        ..StoreConfig::default()
    }
}

/// Drop a store the way a crash would: no drain, no final sync, no joins.
fn crash(store: DirStore) {
    std::mem::forget(store);
}

fn mounted(dir: &std::path::Path, cfg: StoreConfig) -> DirStore {
    let mut store = DirStore::new(dir, cfg);
    store.mkfs().expect("mkfs");
    store.mount().expect("mount");
    store
}

#[test]
fn test_write_read_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = mounted(dir.path(), StoreConfig::default());

    let c = Cid::new("coll");
    let o = Oid::new("obj");
    let mut t = Transaction::new();
    t.create_collection(c.clone());
    t.touch(c.clone(), o.clone());
    t.write(c.clone(), o.clone(), 0, b"hello".to_vec());
    assert_eq!(store.apply_transaction(t).unwrap(), 0);

    store.flush().unwrap();
    assert_eq!(store.read(&c, &o, 0, 5).unwrap(), b"hello");
    assert_eq!(store.stat(&c, &o).unwrap().size, 5);
    store.umount().unwrap();
}

#[test]
fn test_zero_length_write_and_empty_transaction() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = mounted(dir.path(), StoreConfig::default());

    let c = Cid::new("coll");
    let o = Oid::new("obj");
    let mut t = Transaction::new();
    t.create_collection(c.clone());
    t.write(c.clone(), o.clone(), 0, Vec::new());
    assert_eq!(store.apply_transaction(t).unwrap(), 0);
    assert_eq!(store.stat(&c, &o).unwrap().size, 0);

    // Empty transaction is a no-op that still completes.
    assert_eq!(store.apply_transaction(Transaction::new()).unwrap(), 0);
    store.umount().unwrap();
}

#[test]
fn test_zero_punches_or_writes_zeros_identically() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = mounted(dir.path(), StoreConfig::default());

    let c = Cid::new("coll");
    let o = Oid::new("obj");
    let mut t = Transaction::new();
    t.create_collection(c.clone());
    t.write(c.clone(), o.clone(), 0, vec![0xff; 8192]);
    t.zero(c.clone(), o.clone(), 1024, 4096);
    store.apply_transaction(t).unwrap();

    let data = store.read(&c, &o, 0, 8192).unwrap();
    assert!(data[..1024].iter().all(|&b| b == 0xff));
    assert!(data[1024..5120].iter().all(|&b| b == 0));
    assert!(data[5120..].iter().all(|&b| b == 0xff));
    store.umount().unwrap();
}

#[test]
fn test_crash_before_apply_replays_from_journal() {
    // Simulates a kill between the journal ack and apply: the record exists
    // only in the journal. Mount must replay it.
    use dirstore_journal::{FileJournal, Journal};
    use dirstore_types::txn::encode_batch;

    let dir = tempfile::tempdir().unwrap();
    {
        let store = DirStore::new(dir.path(), crash_test_config());
        store.mkfs().unwrap();
    }

    let c = Cid::new("coll");
    let o = Oid::new("obj");
    {
        let fsid_raw = std::fs::read(dir.path().join("fsid")).unwrap();
        let mut fsid = [0_u8; 36];
        fsid.copy_from_slice(&fsid_raw[..36]);

        let mut t = Transaction::new();
        t.create_collection(c.clone());
        t.touch(c.clone(), o.clone());
        t.write(c.clone(), o.clone(), 0, b"ABCD".to_vec());

        let journal = FileJournal::open(&dir.path().join("journal"), fsid).unwrap();
        journal.submit_record(2, &encode_batch(&[t])).unwrap();
        journal.flush().unwrap();
    }

    let mut store = mounted(dir.path(), crash_test_config());
    assert_eq!(store.read(&c, &o, 0, 4).unwrap(), b"ABCD");
    assert_eq!(store.committed_seq(), 1, "nothing committed yet");

    store.sync().unwrap();
    assert!(store.committed_seq() >= 2, "commit must advance past the op");
    store.umount().unwrap();
}

#[test]
fn test_crash_after_apply_replay_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let c = Cid::new("coll");
    let o = Oid::new("obj");

    {
        let store = mounted(dir.path(), crash_test_config());
        let mut t = Transaction::new();
        t.create_collection(c.clone());
        t.touch(c.clone(), o.clone());
        t.write(c.clone(), o.clone(), 0, b"ABCD".to_vec());
        assert_eq!(store.apply_transaction(t).unwrap(), 0);
        // Applied but never committed: journal still holds the record.
        assert_eq!(store.committed_seq(), 1);
        crash(store);
    }

    let mut store = mounted(dir.path(), crash_test_config());
    // Replay re-issued the idempotent ops; state is unchanged.
    assert_eq!(store.read(&c, &o, 0, 4).unwrap(), b"ABCD");
    store.sync().unwrap();
    assert!(store.committed_seq() >= 2);
    store.umount().unwrap();
}

#[test]
fn test_clone_replay_skipped_by_guard() {
    let dir = tempfile::tempdir().unwrap();
    let c = Cid::new("coll");
    let a = Oid::new("a");
    let b = Oid::new("b");

    {
        let store = mounted(dir.path(), crash_test_config());
        let mut t = Transaction::new();
        t.create_collection(c.clone());
        t.write(c.clone(), a.clone(), 0, b"AAAA".to_vec());
        store.apply_transaction(t).unwrap();

        let mut t = Transaction::new();
        t.clone_object(c.clone(), a.clone(), b.clone());
        store.apply_transaction(t).unwrap();

        // A later op changes the clone source.
        let mut t = Transaction::new();
        t.write(c.clone(), a.clone(), 0, b"ZZZZ".to_vec());
        store.apply_transaction(t).unwrap();

        assert_eq!(store.read(&c, &b, 0, 4).unwrap(), b"AAAA");
        crash(store);
    }

    // Replay re-runs the writes (idempotent) but must *skip* the clone: its
    // replay guard records it already happened. If the clone re-ran it
    // would now copy "ZZZZ".
    let mut store = mounted(dir.path(), crash_test_config());
    assert_eq!(store.read(&c, &a, 0, 4).unwrap(), b"ZZZZ");
    assert_eq!(
        store.read(&c, &b, 0, 4).unwrap(),
        b"AAAA",
        "guarded clone must not re-run during replay"
    );
    store.umount().unwrap();
}

#[test]
fn test_double_replay_yields_identical_state() {
    let dir = tempfile::tempdir().unwrap();
    let c = Cid::new("coll");
    let o = Oid::new("obj");

    {
        let store = mounted(dir.path(), crash_test_config());
        let mut t = Transaction::new();
        t.create_collection(c.clone());
        t.write(c.clone(), o.clone(), 0, b"stable".to_vec());
        t.setattr(c.clone(), o.clone(), "k", b"v".to_vec());
        store.apply_transaction(t).unwrap();
        crash(store);
    }

    // First replay (uncommitted journal tail), crash again, second replay.
    {
        let store = mounted(dir.path(), crash_test_config());
        assert_eq!(store.read(&c, &o, 0, 6).unwrap(), b"stable");
        crash(store);
    }
    let mut store = mounted(dir.path(), crash_test_config());
    assert_eq!(store.read(&c, &o, 0, 6).unwrap(), b"stable");
    assert_eq!(store.getattr(&c, &o, "k").unwrap(), b"v");
    store.umount().unwrap();
}

#[test]
fn test_large_attribute_spills_to_omap() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = StoreConfig {
        prefer_omap: true,
        max_inline_xattr_size: 1024,
        ..StoreConfig::default()
    };
    let mut store = mounted(dir.path(), cfg);

    let c = Cid::new("coll");
    let o = Oid::new("obj");
    let blob: Vec<u8> = (0..65 * 1024_u32).map(|i| (i % 251) as u8).collect();

    let mut t = Transaction::new();
    t.create_collection(c.clone());
    t.touch(c.clone(), o.clone());
    t.setattr(c.clone(), o.clone(), "k", blob.clone());
    assert_eq!(store.apply_transaction(t).unwrap(), 0);

    assert_eq!(store.getattr(&c, &o, "k").unwrap(), blob);

    // The value must not sit in inline xattrs (the object file carries no
    // user-attribute chunks for it).
    let obj_path = dir.path().join("current/coll/obj");
    let raws = dirstore_fs::xattr::list(&obj_path).unwrap();
    assert!(
        !raws.iter().any(|r| r.starts_with("user.dirstore.a.k")),
        "value should live in the object map, found inline: {raws:?}"
    );
    store.umount().unwrap();
}

#[test]
fn test_collection_move_via_add_remove() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = mounted(dir.path(), StoreConfig::default());

    let c1 = Cid::new("c1");
    let c2 = Cid::new("c2");
    let o = Oid::new("obj");

    let mut t = Transaction::new();
    t.create_collection(c1.clone());
    t.create_collection(c2.clone());
    t.write(c1.clone(), o.clone(), 0, b"payload".to_vec());
    store.apply_transaction(t).unwrap();

    let mut t = Transaction::new();
    t.coll_add(c2.clone(), c1.clone(), o.clone());
    t.coll_remove(c1.clone(), o.clone());
    assert_eq!(store.apply_transaction(t).unwrap(), 0);

    assert_eq!(store.collection_list(&c2).unwrap(), vec![o.clone()]);
    assert!(store.collection_list(&c1).unwrap().is_empty());
    assert!(store.collection_empty(&c1).unwrap());
    let st = store.stat(&c2, &o).unwrap();
    assert_eq!(st.nlink, 1, "file must have a single link after the move");
    assert_eq!(store.read(&c2, &o, 0, 7).unwrap(), b"payload");
    store.umount().unwrap();
}

#[test]
fn test_sequencer_orders_applies_and_completions() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = mounted(dir.path(), StoreConfig::default());

    let c = Cid::new("coll");
    let mut t = Transaction::new();
    t.create_collection(c.clone());
    store.apply_transaction(t).unwrap();

    let stream = Sequencer::new("pg-1");
    let o = Oid::new("obj");
    let mut waits = Vec::new();
    for i in 0..20_u8 {
        let mut t = Transaction::new();
        // Each write lands at its index; the final content encodes order.
        t.write(c.clone(), o.clone(), u64::from(i), vec![i]);
        let (applied, committed) = store.queue_with_waiters(&stream, vec![t]).unwrap();
        waits.push((applied, committed));
    }
    for (applied, committed) in waits {
        assert_eq!(applied.wait(), 0);
        assert_eq!(committed.wait(), 0);
    }
    let data = store.read(&c, &o, 0, 20).unwrap();
    let expected: Vec<u8> = (0..20).collect();
    assert_eq!(data, expected);
    store.umount().unwrap();
}

#[test]
fn test_umount_covers_everything_committed() {
    let dir = tempfile::tempdir().unwrap();
    let c = Cid::new("coll");
    let o = Oid::new("obj");

    {
        let mut store = mounted(dir.path(), StoreConfig::default());
        let mut t = Transaction::new();
        t.create_collection(c.clone());
        t.write(c.clone(), o.clone(), 0, b"durable".to_vec());
        store.apply_transaction(t).unwrap();
        store.umount().unwrap();
    }

    // Clean shutdown: journal fully trimmed, nothing to replay, data there.
    let mut store = mounted(dir.path(), crash_test_config());
    assert_eq!(store.read(&c, &o, 0, 7).unwrap(), b"durable");
    store.umount().unwrap();
}

#[test]
fn test_trailing_mode_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = StoreConfig {
        journal_mode: JournalMode::Trailing,
        ..StoreConfig::default()
    };
    let mut store = mounted(dir.path(), cfg);

    let c = Cid::new("coll");
    let o = Oid::new("obj");
    let mut t = Transaction::new();
    t.create_collection(c.clone());
    t.write(c.clone(), o.clone(), 0, b"trailing".to_vec());
    assert_eq!(store.apply_transaction(t).unwrap(), 0);
    assert_eq!(store.read(&c, &o, 0, 8).unwrap(), b"trailing");
    store.umount().unwrap();
}

#[test]
fn test_snapshot_commits_mount_and_recover() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = StoreConfig {
        snapshot_commits: true,
        max_sync_interval: Duration::from_secs(3600),
        min_sync_interval: Duration::from_millis(1),
        ..StoreConfig::default()
    };
    let c = Cid::new("coll");
    let o = Oid::new("obj");

    {
        let mut store = mounted(dir.path(), cfg.clone());
        let mut t = Transaction::new();
        t.create_collection(c.clone());
        t.write(c.clone(), o.clone(), 0, b"snapped".to_vec());
        store.apply_transaction(t).unwrap();
        store.sync().unwrap();
        let committed = store.committed_seq();
        assert!(
            dir.path().join(format!("snap_{committed}")).is_dir(),
            "commit must leave a snapshot of current/"
        );
        store.umount().unwrap();
    }

    // Remount rolls current/ back to the newest snapshot; the committed
    // data must be there.
    let mut store = mounted(dir.path(), cfg);
    assert_eq!(store.read(&c, &o, 0, 7).unwrap(), b"snapped");
    store.umount().unwrap();
}

#[test]
fn test_nosnap_refuses_stale_rollback() {
    let dir = tempfile::tempdir().unwrap();
    let snap_cfg = StoreConfig {
        snapshot_commits: true,
        ..crash_test_config()
    };

    // Era one: snapshot commits on, baseline snapshot exists.
    {
        let mut store = DirStore::new(dir.path(), snap_cfg.clone());
        store.mkfs().unwrap();
        store.mount().unwrap();
        store.umount().unwrap();
    }

    // Era two: snapshots off; new data lands, current/ is marked nosnap.
    let c = Cid::new("coll");
    {
        let mut store = DirStore::new(dir.path(), crash_test_config());
        store.mount().unwrap();
        let mut t = Transaction::new();
        t.create_collection(c.clone());
        store.apply_transaction(t).unwrap();
        store.umount().unwrap();
    }

    // Era three: snapshots on again. Rolling back to the old snapshot would
    // discard era-two data: refuse without the override.
    {
        let mut store = DirStore::new(dir.path(), snap_cfg.clone());
        assert!(matches!(store.mount(), Err(StoreError::StaleSnapshot)));
    }

    // Operator override: rollback proceeds and era-two data is gone.
    let forced = StoreConfig {
        use_stale_snap: true,
        ..snap_cfg
    };
    let mut store = DirStore::new(dir.path(), forced);
    store.mount().unwrap();
    assert!(!store.collection_exists(&c), "rollback must discard unsnapshotted data");
    store.umount().unwrap();
}

#[test]
fn test_coll_move_refused_on_submit() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = mounted(dir.path(), StoreConfig::default());

    let mut t = Transaction::new();
    t.push(dirstore_core::Op::CollMove {
        old_cid: Cid::new("a"),
        new_cid: Cid::new("b"),
        oid: Oid::new("o"),
    });
    let err = store
        .queue_transactions(&Sequencer::default(), vec![t], None, None)
        .unwrap_err();
    assert!(matches!(err, StoreError::DeprecatedOp { .. }));
    store.umount().unwrap();
}

#[test]
fn test_paginated_collection_listing() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = mounted(dir.path(), StoreConfig::default());

    let c = Cid::new("coll");
    let mut t = Transaction::new();
    t.create_collection(c.clone());
    for i in 0..30 {
        t.touch(c.clone(), Oid::new(format!("obj-{i}")));
    }
    store.apply_transaction(t).unwrap();

    let mut seen = Vec::new();
    let mut cursor: Option<Oid> = None;
    loop {
        let (page, next) = store
            .collection_list_partial(&c, cursor.as_ref(), 1, 8)
            .unwrap();
        assert!(page.len() <= 8);
        seen.extend(page);
        match next {
            Some(n) => cursor = Some(n),
            None => break,
        }
    }
    assert_eq!(seen.len(), 30);
    let mut sorted = seen.clone();
    sorted.sort_unstable();
    assert_eq!(seen, sorted, "pages must arrive in enumeration order");
    store.umount().unwrap();
}

#[test]
fn test_omap_round_trip_and_iterator() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = mounted(dir.path(), StoreConfig::default());

    let c = Cid::new("coll");
    let o = Oid::new("obj");
    let mut keys = BTreeMap::new();
    keys.insert("alpha".to_owned(), b"1".to_vec());
    keys.insert("beta".to_owned(), b"2".to_vec());

    let mut t = Transaction::new();
    t.create_collection(c.clone());
    t.touch(c.clone(), o.clone());
    t.omap_setheader(c.clone(), o.clone(), b"hdr".to_vec());
    t.omap_setkeys(c.clone(), o.clone(), keys);
    store.apply_transaction(t).unwrap();

    let (header, all) = store.omap_get(&c, &o).unwrap();
    assert_eq!(header, b"hdr");
    assert_eq!(all.len(), 2);

    let rest = store.omap_iter(&c, &o, Some("alpha")).unwrap();
    assert_eq!(rest, vec![("beta".to_owned(), b"2".to_vec())]);

    let mut rm = std::collections::BTreeSet::new();
    rm.insert("alpha".to_owned());
    let mut t = Transaction::new();
    t.omap_rmkeys(c.clone(), o.clone(), rm);
    store.apply_transaction(t).unwrap();
    assert_eq!(store.omap_get_keys(&c, &o).unwrap().len(), 1);

    // Remove drops the omap with the last link.
    let mut t = Transaction::new();
    t.remove(c.clone(), o.clone());
    store.apply_transaction(t).unwrap();
    assert!(!store.exists(&c, &o));
    store.umount().unwrap();
}

#[test]
fn test_second_mount_instance_is_fenced() {
    // fcntl locks are per-process, so same-process double mount cannot see
    // Busy; what we can check is that a second mount of the *same handle*
    // is a no-op and the identity survives remounts.
    let dir = tempfile::tempdir().unwrap();
    let mut store = mounted(dir.path(), StoreConfig::default());
    store.mount().unwrap();
    store.umount().unwrap();

    let fsid_a = std::fs::read(dir.path().join("fsid")).unwrap();
    let mut store = mounted(dir.path(), StoreConfig::default());
    store.umount().unwrap();
    let fsid_b = std::fs::read(dir.path().join("fsid")).unwrap();
    assert_eq!(fsid_a, fsid_b);
}
