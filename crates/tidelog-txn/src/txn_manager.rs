//! Registry of live transactions.
//!
//! The manager allocates ids from two disjoint sequences (positive for local
//! transactions, negative for replayed ones), tracks every live transaction
//! under one latch, and owns the environment's active group-commit strategy.
//!
//! Lock order: `all_txns` before any transaction's own mutex.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tidelog_error::{Result, TideError};
use tidelog_types::{Lsn, TxnId};
use tracing::{debug, info};

use crate::config::TxnConfig;
use crate::env::Environment;
use crate::group_commit::{
    AckTxn, AckTxnSource, GroupCommit, MasterGroupCommit, ReplicaAckQueue, ReplicaGroupCommit,
};
use crate::hooks::{NoopHooks, TxnHooks};
use crate::lock_manager::LockGrant;
use crate::lock_type::LockType;
use crate::locker::BasicLocker;
use crate::metrics::TxnMetrics;
use crate::txn::Txn;

/// Point-in-time description of one live transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveTxn {
    pub id: TxnId,
    pub state: &'static str,
    pub first_lsn: Option<Lsn>,
    pub last_lsn: Option<Lsn>,
    pub read_locks: usize,
    pub write_locks: usize,
}

/// Per-environment transaction registry.
pub struct TxnManager {
    env: Arc<Environment>,
    all_txns: Mutex<HashMap<TxnId, Arc<Txn>>>,
    last_local_id: AtomicI64,
    last_replicated_id: AtomicI64,
    group_commit: RwLock<Option<Arc<GroupCommit>>>,
    metrics: TxnMetrics,
    memory_usage: AtomicI64,
}

impl TxnManager {
    #[must_use]
    pub fn new(env: Arc<Environment>) -> Arc<Self> {
        let offset = env.config().replicated_txn_id_offset;
        Arc::new(Self {
            env,
            all_txns: Mutex::new(HashMap::new()),
            last_local_id: AtomicI64::new(0),
            last_replicated_id: AtomicI64::new(-offset),
            group_commit: RwLock::new(None),
            metrics: TxnMetrics::new(),
            memory_usage: AtomicI64::new(0),
        })
    }

    #[must_use]
    pub fn env(&self) -> &Arc<Environment> {
        &self.env
    }

    #[must_use]
    pub const fn metrics(&self) -> &TxnMetrics {
        &self.metrics
    }

    // -- ids ---------------------------------------------------------------

    fn next_local_id(&self) -> Result<TxnId> {
        let raw = self.last_local_id.fetch_add(1, Ordering::AcqRel) + 1;
        TxnId::new(raw).ok_or_else(|| TideError::internal("local txn id sequence wrapped"))
    }

    fn next_replicated_id(&self) -> Result<TxnId> {
        let raw = self.last_replicated_id.fetch_sub(1, Ordering::AcqRel) - 1;
        TxnId::new(raw).ok_or_else(|| TideError::internal("replicated txn id sequence wrapped"))
    }

    /// Highest local id handed out so far.
    #[must_use]
    pub fn last_local_id(&self) -> i64 {
        self.last_local_id.load(Ordering::Acquire)
    }

    /// Lowest replicated id handed out so far.
    #[must_use]
    pub fn last_replicated_id(&self) -> i64 {
        self.last_replicated_id.load(Ordering::Acquire)
    }

    // -- begin -------------------------------------------------------------

    /// Begin a local transaction. Nested transactions are rejected.
    pub fn txn_begin(self: &Arc<Self>, parent: Option<&Txn>, config: TxnConfig) -> Result<Arc<Txn>> {
        self.txn_begin_with_hooks(parent, config, Arc::new(NoopHooks))
    }

    /// Begin a local transaction with replication hooks.
    pub fn txn_begin_with_hooks(
        self: &Arc<Self>,
        parent: Option<&Txn>,
        config: TxnConfig,
        hooks: Arc<dyn TxnHooks>,
    ) -> Result<Arc<Txn>> {
        if parent.is_some() {
            return Err(TideError::NestedTransaction);
        }
        self.env.check_valid()?;
        let id = self.next_local_id()?;
        Ok(self.start(id, config, hooks))
    }

    /// Begin a transaction replayed from the replication stream; its id comes
    /// from the negative sequence.
    pub fn txn_begin_replay(
        self: &Arc<Self>,
        config: TxnConfig,
        hooks: Arc<dyn TxnHooks>,
    ) -> Result<Arc<Txn>> {
        self.env.check_valid()?;
        let id = self.next_replicated_id()?;
        Ok(self.start(id, config, hooks))
    }

    fn start(self: &Arc<Self>, id: TxnId, config: TxnConfig, hooks: Arc<dyn TxnHooks>) -> Arc<Txn> {
        let txn = Arc::new(Txn::new(id, config, Arc::clone(self), hooks));
        self.register_txn(&txn);
        txn
    }

    /// A non-transactional locker drawing its id from the local sequence.
    pub fn new_basic_locker(&self, locking_required: bool) -> Result<BasicLocker> {
        let id = self.next_local_id()?;
        Ok(BasicLocker::new(id, Arc::clone(&self.env), locking_required))
    }

    // -- registry ----------------------------------------------------------

    pub fn register_txn(&self, txn: &Arc<Txn>) {
        self.all_txns.lock().insert(txn.id(), Arc::clone(txn));
        self.metrics.begins.fetch_add(1, Ordering::Relaxed);
        debug!(target: "tidelog_txn::txn", txn_id = %txn.id(), "registered");
    }

    /// Remove `txn`, count its outcome and give back its reported footprint.
    pub(crate) fn unregister_txn(&self, txn: &Txn, committed: bool) {
        let flushed = {
            let mut all = self.all_txns.lock();
            let flushed = txn.take_flushed_memory();
            if all.remove(&txn.id()).is_none() {
                debug!(target: "tidelog_txn::txn", txn_id = %txn.id(), "unregister of unknown txn");
                return;
            }
            flushed
        };
        self.memory_usage.fetch_sub(flushed, Ordering::AcqRel);
        let counter = if committed {
            &self.metrics.commits
        } else {
            &self.metrics.aborts
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn lookup(&self, id: TxnId) -> Option<Arc<Txn>> {
        self.all_txns.lock().get(&id).cloned()
    }

    #[must_use]
    pub fn n_active_txns(&self) -> usize {
        self.all_txns.lock().len()
    }

    /// Earliest first data record of any live transaction.
    ///
    /// The registry latch is held for the whole scan, so a transaction that
    /// is unregistering is either seen with its chain or already gone.
    #[must_use]
    pub fn get_first_active_lsn(&self) -> Option<Lsn> {
        let all = self.all_txns.lock();
        all.values().filter_map(|txn| txn.first_lsn()).min()
    }

    #[must_use]
    pub fn active_txns(&self) -> Vec<ActiveTxn> {
        let all = self.all_txns.lock();
        let mut out: Vec<ActiveTxn> = all
            .values()
            .map(|txn| ActiveTxn {
                id: txn.id(),
                state: txn.state().name(),
                first_lsn: txn.first_lsn(),
                last_lsn: txn.last_lsn(),
                read_locks: txn.n_read_locks(),
                write_locks: txn.n_write_locks(),
            })
            .collect();
        out.sort_by_key(|a| a.id);
        out
    }

    /// Reassign `lsn` to `txn`, marking every displaced transaction
    /// abort-only.
    pub fn steal_lock(&self, lsn: Lsn, txn: &Txn, lock_type: LockType) -> Result<()> {
        let displaced = self.env.locks().steal_lock(lsn, txn.id(), lock_type)?;
        for owner in displaced {
            if owner.locker == txn.id() {
                continue;
            }
            if let Some(victim) = self.lookup(owner.locker) {
                victim.preempt(lsn);
            }
        }
        txn.record_lock(lsn, lock_type, LockGrant::New);
        Ok(())
    }

    // -- memory ------------------------------------------------------------

    /// Estimated bytes held by live transactions, as last reported.
    #[must_use]
    pub fn memory_usage(&self) -> i64 {
        self.memory_usage.load(Ordering::Acquire)
    }

    pub(crate) fn update_memory_usage(&self, delta: i64) {
        self.memory_usage.fetch_add(delta, Ordering::AcqRel);
    }

    // -- group commit ------------------------------------------------------

    #[must_use]
    pub fn get_group_commit(&self) -> Option<Arc<GroupCommit>> {
        self.group_commit.read().clone()
    }

    /// Install (or clear) the active strategy. Returns the previous one.
    pub fn set_group_commit(&self, group: Option<GroupCommit>) -> Option<Arc<GroupCommit>> {
        let next = group.map(Arc::new);
        let to = next.as_ref().map_or("none", |g| g.role());
        let prev = std::mem::replace(&mut *self.group_commit.write(), next);
        let from = prev.as_ref().map_or("none", |g| g.role());
        info!(target: "tidelog_txn::group_commit", from, to, "group commit swapped");
        prev
    }

    /// Switch to the primary strategy. Returns false (and clears any active
    /// strategy) when master group commit is not configured.
    pub fn start_master_group_commit(self: &Arc<Self>) -> bool {
        let config = self.env.config().master_group_commit;
        if !config.is_enabled() {
            self.set_group_commit(None);
            return false;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let source: Weak<dyn AckTxnSource> = weak;
        let master = MasterGroupCommit::new(config, Arc::clone(&self.env), source);
        self.set_group_commit(Some(GroupCommit::Master(master)));
        true
    }

    /// Switch to the replay strategy. Returns false (and clears any active
    /// strategy) when replica group commit is not configured.
    pub fn start_replica_group_commit(&self, apply: Arc<dyn ReplicaAckQueue>) -> bool {
        let config = self.env.config().replica_group_commit;
        if !config.is_enabled() {
            self.set_group_commit(None);
            return false;
        }
        let replica = ReplicaGroupCommit::new(config, Arc::clone(&self.env), apply);
        self.set_group_commit(Some(GroupCommit::Replica(replica)));
        true
    }
}

impl AckTxnSource for TxnManager {
    fn get_ack_txn(&self, id: TxnId) -> Option<Arc<dyn AckTxn>> {
        self.lookup(id).map(|txn| txn as Arc<dyn AckTxn>)
    }
}

impl std::fmt::Debug for TxnManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnManager")
            .field("active", &self.n_active_txns())
            .field("last_local_id", &self.last_local_id())
            .field("last_replicated_id", &self.last_replicated_id())
            .field("group_commit", &self.get_group_commit())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnvConfig, MasterGroupCommitConfig, ReplicaGroupCommitConfig};
    use crate::locker::Locker;
    use crate::memory::{MemoryLogManager, MemoryRecordStore};
    use tidelog_types::DatabaseId;

    fn manager(config: EnvConfig) -> (Arc<MemoryRecordStore>, Arc<TxnManager>) {
        let store = Arc::new(MemoryRecordStore::new());
        let env = Environment::new(
            config,
            Arc::new(MemoryLogManager::new()),
            Arc::clone(&store) as _,
        );
        (store, TxnManager::new(env))
    }

    #[test]
    fn id_sequences_are_disjoint() {
        let (_, mgr) = manager(EnvConfig {
            replicated_txn_id_offset: 1_000,
            ..EnvConfig::default()
        });
        let a = mgr.txn_begin(None, TxnConfig::default()).unwrap();
        let b = mgr.txn_begin(None, TxnConfig::default()).unwrap();
        let r = mgr
            .txn_begin_replay(TxnConfig::default(), Arc::new(NoopHooks))
            .unwrap();
        assert_eq!((a.id().get(), b.id().get()), (1, 2));
        assert_eq!(r.id().get(), -1_001);
        assert!(r.id().is_replicated());
        assert_eq!(mgr.n_active_txns(), 3);
    }

    #[test]
    fn nested_begin_is_rejected() {
        let (_, mgr) = manager(EnvConfig::default());
        let parent = mgr.txn_begin(None, TxnConfig::default()).unwrap();
        let err = mgr.txn_begin(Some(&parent), TxnConfig::default()).unwrap_err();
        assert!(matches!(err, TideError::NestedTransaction));
        assert_eq!(mgr.n_active_txns(), 1);
    }

    #[test]
    fn first_active_lsn_tracks_live_writers() {
        let (store, mgr) = manager(EnvConfig::default());
        let db = DatabaseId(3);
        assert_eq!(mgr.get_first_active_lsn(), None);

        let t1 = mgr.txn_begin(None, TxnConfig::default()).unwrap();
        let t2 = mgr.txn_begin(None, TxnConfig::default()).unwrap();
        let first = store.write(&t1, db, b"a", Some(b"1")).unwrap();
        let second = store.write(&t2, db, b"b", Some(b"2")).unwrap();
        assert_eq!(mgr.get_first_active_lsn(), Some(first));

        t1.commit().unwrap();
        assert_eq!(mgr.get_first_active_lsn(), Some(second));
        t2.abort(false).unwrap();
        assert_eq!(mgr.get_first_active_lsn(), None);

        let snap = mgr.metrics().snapshot();
        assert_eq!((snap.begins, snap.commits, snap.aborts), (2, 1, 1));
        assert_eq!(snap.active(), 0);
    }

    #[test]
    fn steal_lock_preempts_owner() {
        let (_, mgr) = manager(EnvConfig::default());
        let lsn = Lsn::new(40).unwrap();
        let owner = mgr.txn_begin(None, TxnConfig::default()).unwrap();
        let thief = mgr.txn_begin(None, TxnConfig::default()).unwrap();
        owner.lock(lsn, LockType::Write, false, None).unwrap();

        mgr.steal_lock(lsn, &thief, LockType::Write).unwrap();
        assert_eq!(owner.held_lock(lsn), None);
        assert_eq!(thief.held_lock(lsn), Some(LockType::Write));
        assert!(matches!(
            owner.commit().unwrap_err().root_cause(),
            TideError::LockPreempted { lsn: 40, .. }
        ));
        owner.abort(false).unwrap();
        assert!(mgr.env().locks().is_owner(lsn, thief.id(), LockType::Write));
        thief.commit().unwrap();
        assert_eq!(mgr.env().locks().lock_count(), 0);
    }

    #[test]
    fn group_commit_needs_configuration() {
        let (_, mgr) = manager(EnvConfig::default());
        assert!(!mgr.start_master_group_commit());
        assert!(mgr.get_group_commit().is_none());

        let (_, mgr) = manager(EnvConfig {
            master_group_commit: MasterGroupCommitConfig {
                max_group_size: 4,
                interval_us: 1_000,
                fsync_timeout_ms: 100,
            },
            ..EnvConfig::default()
        });
        assert!(mgr.start_master_group_commit());
        let gc = mgr.get_group_commit().unwrap();
        assert_eq!(gc.role(), "master");
        assert!(gc.as_master().is_some());
    }

    #[test]
    fn concurrent_swaps_each_see_their_predecessor() {
        struct AcceptAcks;

        impl ReplicaAckQueue for AcceptAcks {
            fn queue_ack(&self, _id: TxnId) -> bool {
                true
            }
        }

        let (_, mgr) = manager(EnvConfig::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mgr = Arc::clone(&mgr);
                std::thread::spawn(move || {
                    let replica = ReplicaGroupCommit::new(
                        ReplicaGroupCommitConfig {
                            max_group_size: 4,
                            interval_us: 1_000,
                        },
                        Arc::clone(mgr.env()),
                        Arc::new(AcceptAcks),
                    );
                    mgr.set_group_commit(Some(GroupCommit::Replica(replica)))
                })
            })
            .collect();
        let prevs: Vec<Option<Arc<GroupCommit>>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(prevs.iter().filter(|p| p.is_none()).count(), 1);
        let current = mgr.get_group_commit().unwrap();
        let mut seen: Vec<*const GroupCommit> = prevs.iter().flatten().map(Arc::as_ptr).collect();
        seen.push(Arc::as_ptr(&current));
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 8);
    }

    #[test]
    fn basic_lockers_draw_local_ids() {
        let (_, mgr) = manager(EnvConfig::default());
        let txn = mgr.txn_begin(None, TxnConfig::default()).unwrap();
        let locker = mgr.new_basic_locker(false).unwrap();
        assert_eq!(locker.id().get(), txn.id().get() + 1);
    }
}
