//! Commit and abort scenarios driven through the in-memory collaborators.

use std::sync::Arc;

use tidelog_error::{EnvFailureReason, TideError};
use tidelog_txn::{
    DatabaseOp, EnvConfig, Environment, Locker, LockType, MemoryLogManager, MemoryRecordStore,
    ObsoleteCounting, TxnConfig, TxnHooks, TxnManager, TxnState,
};
use tidelog_types::{DatabaseId, Durability, Lsn, SyncPolicy, TxnEndKind};

const DB: DatabaseId = DatabaseId(7);

struct World {
    log: Arc<MemoryLogManager>,
    store: Arc<MemoryRecordStore>,
    mgr: Arc<TxnManager>,
}

fn world_with(config: EnvConfig) -> World {
    let log = Arc::new(MemoryLogManager::new());
    let store = Arc::new(MemoryRecordStore::new());
    let env = Environment::new(
        config,
        Arc::clone(&log) as Arc<dyn tidelog_txn::LogManager>,
        Arc::clone(&store) as Arc<dyn tidelog_txn::RecordStore>,
    );
    World {
        log,
        store,
        mgr: TxnManager::new(env),
    }
}

fn world() -> World {
    world_with(EnvConfig::default())
}

impl World {
    /// Commit `keys` with value "v0" and return their positions.
    fn seed(&self, keys: &[&[u8]]) -> Vec<Lsn> {
        let txn = self.mgr.txn_begin(None, TxnConfig::default()).unwrap();
        let lsns = keys
            .iter()
            .map(|k| self.store.write(&txn, DB, k, Some(b"v0")).unwrap())
            .collect();
        txn.commit().unwrap();
        lsns
    }
}

#[test]
fn read_only_commit_writes_nothing_and_releases_everything() {
    let w = world();
    let seeded = w.seed(&[b"a", b"b"]);
    let records_before = w.log.len();

    let txn = w.mgr.txn_begin(None, TxnConfig::default()).unwrap();
    assert_eq!(w.store.read(&txn, DB, b"a").unwrap(), Some(b"v0".to_vec()));
    assert_eq!(w.store.read(&txn, DB, b"b").unwrap(), Some(b"v0".to_vec()));
    assert_eq!(txn.n_read_locks(), 2);
    assert!(w.mgr.env().locks().is_owner(seeded[0], txn.id(), LockType::Read));

    assert_eq!(txn.commit().unwrap(), None);
    assert_eq!(w.log.len(), records_before);
    assert_eq!(w.mgr.env().locks().lock_count(), 0);
    assert_eq!(w.mgr.n_active_txns(), 0);
    assert!(matches!(txn.state(), TxnState::Committed));
    assert_eq!(w.mgr.metrics().snapshot().elided_commits, 1);
}

#[test]
fn commit_counts_each_superseded_version_once() {
    let w = world();
    let seeded = w.seed(&[b"a", b"b", b"c"]);

    let txn = w.mgr.txn_begin(None, TxnConfig::default()).unwrap();
    w.store.write(&txn, DB, b"a", Some(b"v1")).unwrap();
    w.store.write(&txn, DB, b"b", Some(b"v1")).unwrap();
    w.store.write(&txn, DB, b"c", Some(b"v1")).unwrap();
    // A second write to "a" supersedes this transaction's own version.
    let intermediate = w.store.slot_lsn(DB, b"a").unwrap();
    w.store.write(&txn, DB, b"a", Some(b"v2")).unwrap();

    let before = w.log.obsolete_counts().len();
    let commit_lsn = txn.commit().unwrap().unwrap();
    let counted: Vec<Lsn> = w.log.obsolete_counts()[before..]
        .iter()
        .map(|(lsn, how)| {
            assert_eq!(*how, ObsoleteCounting::Exact);
            *lsn
        })
        .collect();
    let mut expected = seeded.clone();
    expected.sort();
    assert_eq!(counted, expected);
    assert!(
        w.log
            .obsolete_counts()
            .contains(&(intermediate, ObsoleteCounting::Exact))
    );

    let end = w.log.txn_ends().unwrap().pop().unwrap();
    assert_eq!(end.kind, TxnEndKind::Commit);
    assert_eq!(end.txn_id, txn.id());
    assert_eq!(Some(end.last_lsn.unwrap()), txn.last_lsn());
    assert!(end.last_lsn.unwrap() < commit_lsn);
    assert_eq!(w.mgr.env().locks().lock_count(), 0);
}

#[test]
fn commit_record_follows_chain_and_honours_durability() {
    let w = world();
    let txn = w
        .mgr
        .txn_begin(
            None,
            TxnConfig::default().with_durability(Durability::COMMIT_NO_SYNC),
        )
        .unwrap();
    let first = w.store.write(&txn, DB, b"x", Some(b"1")).unwrap();
    let second = w.store.write(&txn, DB, b"y", Some(b"2")).unwrap();
    assert_eq!(txn.first_lsn(), Some(first));

    let entries = w.log.data_entries();
    assert_eq!(entries[1].prev_lsn, Some(first));
    assert_eq!(entries[0].prev_lsn, None);

    let commit = txn.commit().unwrap().unwrap();
    assert!(commit > second);
    assert_eq!(w.log.fsync_count(), 0);

    let synced = w.mgr.txn_begin(None, TxnConfig::default()).unwrap();
    w.store.write(&synced, DB, b"z", Some(b"3")).unwrap();
    let commit = synced
        .commit_with(Durability::COMMIT_NO_SYNC.with_local_sync(SyncPolicy::Sync))
        .unwrap();
    assert_eq!(w.log.durable_lsn(), commit);
    assert_eq!(w.log.fsync_count(), 1);
}

#[test]
fn abort_of_insert_then_delete_leaves_no_trace() {
    let w = world();
    w.seed(&[b"other"]);

    let txn = w.mgr.txn_begin(None, TxnConfig::default()).unwrap();
    let insert = w.store.write(&txn, DB, b"k", Some(b"new")).unwrap();
    let delete = w.store.write(&txn, DB, b"k", None).unwrap();
    assert_eq!(w.store.get(DB, b"k"), None);
    assert_eq!(w.store.slot_lsn(DB, b"k"), Some(delete));

    let before = w.log.obsolete_counts().len();
    txn.abort(false).unwrap();

    assert_eq!(w.store.slot_lsn(DB, b"k"), None);
    assert_eq!(w.store.get(DB, b"other"), Some(b"v0".to_vec()));

    let rollback: Vec<(Lsn, ObsoleteCounting)> = w.log.obsolete_counts()[before..].to_vec();
    assert_eq!(
        rollback,
        vec![
            (delete, ObsoleteCounting::DupAllowed),
            (insert, ObsoleteCounting::DupAllowed),
        ]
    );
    let undone = w.store.undone();
    assert_eq!(undone.len(), 1);
    assert_eq!(undone[0].lsn, delete);
    assert!(undone[0].restores_absence());

    let end = w.log.txn_ends().unwrap().pop().unwrap();
    assert_eq!(end.kind, TxnEndKind::Abort);
    assert_eq!(end.last_lsn, Some(delete));
    assert!(w.store.reclaim_queue().is_empty());
    assert_eq!(w.mgr.env().locks().lock_count(), 0);
}

#[test]
fn abort_restores_updated_and_deleted_slots() {
    let w = world();
    w.seed(&[b"a", b"b"]);

    let txn = w.mgr.txn_begin(None, TxnConfig::default()).unwrap();
    w.store.write(&txn, DB, b"a", Some(b"changed")).unwrap();
    w.store.write(&txn, DB, b"b", None).unwrap();
    let fsyncs = w.log.fsync_count();
    txn.abort(true).unwrap();

    assert_eq!(w.store.get(DB, b"a"), Some(b"v0".to_vec()));
    assert_eq!(w.store.get(DB, b"b"), Some(b"v0".to_vec()));
    assert_eq!(w.log.fsync_count(), fsyncs + 1);
    assert_eq!(w.mgr.metrics().snapshot().aborts, 1);
}

#[test]
fn committed_deletions_are_queued_for_reclamation() {
    let w = world();
    w.seed(&[b"gone"]);
    let txn = w.mgr.txn_begin(None, TxnConfig::default()).unwrap();
    let marker = w.store.write(&txn, DB, b"gone", None).unwrap();
    txn.add_database_op(DatabaseOp::Truncate { db: DatabaseId(9) })
        .unwrap();
    txn.commit().unwrap();

    let queued = w.store.reclaim_queue();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].lsn, marker);
    assert_eq!(queued[0].key, b"gone".to_vec());
    assert_eq!(
        w.store.finished_ops(),
        vec![(DatabaseOp::Truncate { db: DatabaseId(9) }, true)]
    );
}

#[test]
fn failed_data_record_makes_txn_abort_only() {
    let w = world();
    let txn = w.mgr.txn_begin(None, TxnConfig::default()).unwrap();
    w.store.write(&txn, DB, b"a", Some(b"1")).unwrap();

    w.log.set_fail_data(true);
    let err = w.store.write(&txn, DB, b"b", Some(b"2")).unwrap_err();
    assert!(matches!(err, TideError::MustAbort { .. }));
    w.log.set_fail_data(false);

    let err = txn.commit().unwrap_err();
    assert!(matches!(err.root_cause(), TideError::LogWrite { .. }));
    let err = w.store.write(&txn, DB, b"c", Some(b"3")).unwrap_err();
    assert!(matches!(err, TideError::MustAbort { .. }));

    txn.abort(false).unwrap();
    assert_eq!(w.store.slot_lsn(DB, b"a"), None);
}

#[test]
fn failed_commit_record_falls_back_to_abort() {
    let w = world();
    w.seed(&[b"a"]);
    let txn = w.mgr.txn_begin(None, TxnConfig::default()).unwrap();
    w.store.write(&txn, DB, b"a", Some(b"1")).unwrap();

    w.log.set_fail_commit(true);
    let err = txn.commit().unwrap_err();
    assert!(matches!(err, TideError::LogWrite { .. }));
    assert!(w.mgr.env().is_valid());
    assert!(matches!(txn.state(), TxnState::Aborted));
    assert_eq!(w.store.get(DB, b"a"), Some(b"v0".to_vec()));
    assert_eq!(w.mgr.env().locks().lock_count(), 0);
}

#[test]
fn neither_commit_nor_abort_record_invalidates_environment() {
    let w = world();
    let txn = w.mgr.txn_begin(None, TxnConfig::default()).unwrap();
    let lsn = w.store.write(&txn, DB, b"a", Some(b"1")).unwrap();

    w.log.set_fail_commit(true);
    w.log.set_fail_abort(true);
    let err = txn.commit().unwrap_err();
    assert!(matches!(
        err,
        TideError::EnvironmentFailure {
            reason: EnvFailureReason::LogWrite,
            ..
        }
    ));
    assert!(!w.mgr.env().is_valid());
    // Locks stay with the abort-only transaction.
    assert!(w.mgr.env().locks().is_owner(lsn, txn.id(), LockType::Write));
    assert!(txn.must_abort_cause().is_some());
    assert_eq!(w.mgr.metrics().snapshot().abort_record_failures, 1);

    let err = w.mgr.txn_begin(None, TxnConfig::default()).unwrap_err();
    assert!(matches!(err, TideError::EnvironmentInvalid { .. }));
}

#[test]
fn failed_abort_record_keeps_locks_until_retry() {
    let w = world();
    let txn = w.mgr.txn_begin(None, TxnConfig::default()).unwrap();
    let lsn = w.store.write(&txn, DB, b"a", Some(b"1")).unwrap();

    w.log.set_fail_abort(true);
    let err = txn.abort(false).unwrap_err();
    assert!(matches!(err, TideError::MustAbort { .. }));
    assert!(w.mgr.env().is_valid());
    assert!(w.mgr.env().locks().is_locked(lsn));
    assert_eq!(w.store.slot_lsn(DB, b"a"), Some(lsn));

    w.log.set_fail_abort(false);
    txn.abort(false).unwrap();
    assert!(!w.mgr.env().locks().is_locked(lsn));
    assert_eq!(w.store.slot_lsn(DB, b"a"), None);
}

#[test]
fn undo_failure_invalidates_environment() {
    let w = world();
    let txn = w.mgr.txn_begin(None, TxnConfig::default()).unwrap();
    w.store.write(&txn, DB, b"a", Some(b"1")).unwrap();
    w.store.set_fail_undo(true);
    let err = txn.abort(false).unwrap_err();
    assert!(matches!(
        err,
        TideError::EnvironmentFailure {
            reason: EnvFailureReason::UndoFailed,
            ..
        }
    ));
    assert!(!w.mgr.env().is_valid());
}

struct Veto;

impl TxnHooks for Veto {
    fn pre_log_commit(
        &self,
        _txn: &tidelog_txn::Txn,
        _durability: &mut Durability,
    ) -> tidelog_error::Result<()> {
        Err(TideError::NotPrimary {
            detail: "demoted".to_owned(),
        })
    }
}

#[test]
fn pre_commit_veto_aborts_and_surfaces_original_error() {
    let w = world();
    w.seed(&[b"a"]);
    let txn = w
        .mgr
        .txn_begin_with_hooks(None, TxnConfig::default(), Arc::new(Veto))
        .unwrap();
    w.store.write(&txn, DB, b"a", Some(b"1")).unwrap();
    let records = w.log.len();

    let err = txn.commit().unwrap_err();
    assert!(matches!(err, TideError::NotPrimary { .. }));
    assert!(matches!(txn.state(), TxnState::Aborted));
    assert_eq!(w.log.len(), records + 1);
    assert_eq!(
        w.log.txn_ends().unwrap().pop().unwrap().kind,
        TxnEndKind::Abort
    );
    assert_eq!(w.store.get(DB, b"a"), Some(b"v0".to_vec()));
    assert!(w.mgr.env().is_valid());
}

#[test]
fn memory_footprint_is_released_on_end() {
    let w = world();
    let keys: Vec<Vec<u8>> = (0..64u32).map(|i| i.to_be_bytes().to_vec()).collect();
    let txn = w.mgr.txn_begin(None, TxnConfig::default()).unwrap();
    for key in &keys {
        w.store.write(&txn, DB, key, Some(b"v")).unwrap();
    }
    assert!(w.mgr.memory_usage() > 0);
    txn.commit().unwrap();
    assert_eq!(w.mgr.memory_usage(), 0);
}

#[test]
fn writers_on_one_key_serialize() {
    let w = Arc::new(world_with(EnvConfig {
        lock_timeout_ms: 5_000,
        ..EnvConfig::default()
    }));
    w.seed(&[b"counter"]);
    let decode = |v: Vec<u8>| -> u32 {
        if v == b"v0" {
            0
        } else {
            u32::from_be_bytes(v.try_into().unwrap())
        }
    };

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let w = Arc::clone(&w);
            std::thread::spawn(move || {
                for _ in 0..10 {
                    let txn = w.mgr.txn_begin(None, TxnConfig::default()).unwrap();
                    // Write-lock the current version before reading it.
                    loop {
                        let slot = w.store.slot_lsn(DB, b"counter").unwrap();
                        txn.lock(slot, LockType::Write, false, Some(DB)).unwrap();
                        if w.store.slot_lsn(DB, b"counter") == Some(slot) {
                            break;
                        }
                    }
                    let n = decode(w.store.get(DB, b"counter").unwrap());
                    w.store
                        .write(&txn, DB, b"counter", Some(&(n + 1).to_be_bytes()))
                        .unwrap();
                    txn.commit().unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(decode(w.store.get(DB, b"counter").unwrap()), 40);
    assert_eq!(w.mgr.env().locks().lock_count(), 0);
}
