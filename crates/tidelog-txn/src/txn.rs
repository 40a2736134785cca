//! Transactions.
//!
//! A [`Txn`] owns its read and write locks, the backward chain of the data
//! records it logged, and the prior ("abort") version of every slot it
//! changed. Commit and abort each run a fixed sequence of stages with
//! [`TxnHooks`] extension points in between.
//!
//! Lock order: the transaction registry latch is always taken before a
//! transaction's `inner` mutex, never the other way round.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use smallvec::SmallVec;
use tidelog_error::{EnvFailureReason, Result, TideError};
use tidelog_types::{
    DatabaseId, Durability, LnLogEntry, LogEntry, Lsn, SyncPolicy, TxnEnd, TxnEndKind, TxnId,
};
use tracing::{debug, trace, warn};

use crate::ack::AckLatch;
use crate::config::TxnConfig;
use crate::env::{
    DatabaseOp, DeletedSlot, Environment, LogParams, ObsoleteCounting, UndoRecord,
};
use crate::group_commit::AckTxn;
use crate::hooks::TxnHooks;
use crate::lock_manager::{LockGrant, LockRequest};
use crate::lock_type::LockType;
use crate::locker::Locker;
use crate::txn_manager::TxnManager;

/// Estimated bytes per read lock held.
pub const READ_LOCK_OVERHEAD: i64 = 48;
/// Estimated bytes per write lock held, including its undo information.
pub const WRITE_LOCK_OVERHEAD: i64 = 96;
/// Accumulated delta at which a transaction reports its footprint.
pub const MEMORY_FLUSH_THRESHOLD: i64 = 1024;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle of a transaction.
#[derive(Debug, Clone)]
pub enum TxnState {
    Open,
    /// Only abort is allowed; every other operation re-raises the cause.
    MustAbort(Arc<TideError>),
    /// A commit or abort has claimed the transaction and is running.
    Ending,
    Committed,
    Aborted,
}

impl TxnState {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::MustAbort(_) => "MUST_ABORT",
            Self::Ending => "ENDING",
            Self::Committed => "COMMITTED",
            Self::Aborted => "ABORTED",
        }
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

/// Undo information for one write-locked position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteLockInfo {
    /// Version to restore if the transaction aborts; `None` for a slot that
    /// did not exist.
    pub abort_lsn: Option<Lsn>,
    pub abort_known_deleted: bool,
    /// Taken as WRITE_RMW.
    pub rmw: bool,
    /// The position was written by this transaction.
    pub created: bool,
}

impl WriteLockInfo {
    const LOCKED: Self = Self {
        abort_lsn: None,
        abort_known_deleted: false,
        rmw: false,
        created: false,
    };
}

/// One record change to log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub db: DatabaseId,
    pub key: Vec<u8>,
    /// `None` deletes the record.
    pub data: Option<Vec<u8>>,
    /// Position of the version being superseded. Must be write-locked by the
    /// transaction.
    pub prior: Option<Lsn>,
    /// The superseded version is a deletion marker.
    pub prior_known_deleted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommitRecord {
    NotAttempted,
    Failed,
    Written,
}

/// Why an abort did not complete.
#[derive(Debug)]
enum AbortFailure {
    /// The abort record could not be written; the transaction stays abort-only
    /// and keeps its locks.
    Record(Arc<TideError>),
    Other(TideError),
}

impl AbortFailure {
    fn into_error(self, txn_id: TxnId) -> TideError {
        match self {
            Self::Record(cause) => TideError::must_abort(txn_id.get(), cause),
            Self::Other(err) => err,
        }
    }
}

#[derive(Debug)]
struct TxnInner {
    state: TxnState,
    read_locks: HashSet<Lsn>,
    write_info: HashMap<Lsn, WriteLockInfo>,
    first_lsn: Option<Lsn>,
    last_lsn: Option<Lsn>,
    open_cursors: u32,
    db_ops: SmallVec<[DatabaseOp; 2]>,
    deleted_slots: Vec<DeletedSlot>,
    memory_delta: i64,
    memory_flushed: i64,
}

impl TxnInner {
    fn new() -> Self {
        Self {
            state: TxnState::Open,
            read_locks: HashSet::new(),
            write_info: HashMap::new(),
            first_lsn: None,
            last_lsn: None,
            open_cursors: 0,
            db_ops: SmallVec::new(),
            deleted_slots: Vec::new(),
            memory_delta: 0,
            memory_flushed: 0,
        }
    }

    fn check_usable(&self, txn_id: TxnId, operation: &'static str) -> Result<()> {
        match &self.state {
            TxnState::Open => Ok(()),
            TxnState::MustAbort(cause) => {
                Err(TideError::must_abort(txn_id.get(), Arc::clone(cause)))
            }
            state => Err(TideError::IllegalTxnState {
                txn_id: txn_id.get(),
                state: state.name(),
                operation,
            }),
        }
    }

    fn check_no_cursors(&self, txn_id: TxnId) -> Result<()> {
        if self.open_cursors == 0 {
            return Ok(());
        }
        Err(TideError::OpenCursors {
            txn_id: txn_id.get(),
            count: self.open_cursors,
        })
    }

    /// Distinct prior versions that committing makes obsolete.
    ///
    /// Keyed by the prior version's position only, so two slots that happen
    /// to share one abort position count once. RMW entries and deletion
    /// markers are skipped.
    fn obsolete_abort_lsns(&self) -> BTreeSet<Lsn> {
        self.write_info
            .values()
            .filter(|info| info.created && !info.rmw && !info.abort_known_deleted)
            .filter_map(|info| info.abort_lsn)
            .collect()
    }

    /// Track a newly recorded lock and return the footprint change.
    fn record_lock(&mut self, lsn: Lsn, lock_type: LockType) -> i64 {
        if lock_type.is_write_lock() {
            let mut delta = 0;
            if self.read_locks.remove(&lsn) {
                delta -= READ_LOCK_OVERHEAD;
            }
            match self.write_info.get_mut(&lsn) {
                Some(info) => info.rmw |= lock_type.is_rmw(),
                None => {
                    self.write_info.insert(
                        lsn,
                        WriteLockInfo {
                            rmw: lock_type.is_rmw(),
                            ..WriteLockInfo::LOCKED
                        },
                    );
                    delta += WRITE_LOCK_OVERHEAD;
                }
            }
            delta
        } else if !self.write_info.contains_key(&lsn) && self.read_locks.insert(lsn) {
            READ_LOCK_OVERHEAD
        } else {
            0
        }
    }

    fn held_lock(&self, lsn: Lsn) -> Option<LockType> {
        if let Some(info) = self.write_info.get(&lsn) {
            return Some(if info.rmw { LockType::WriteRmw } else { LockType::Write });
        }
        self.read_locks.contains(&lsn).then_some(LockType::Read)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Rebuild a lock timeout so it can be both recorded and returned.
fn copy_lock_timeout(err: &TideError) -> Option<TideError> {
    match err {
        TideError::LockTimeout {
            lsn,
            locker,
            timeout_ms,
            owners,
        } => Some(TideError::LockTimeout {
            lsn: *lsn,
            locker: *locker,
            timeout_ms: *timeout_ms,
            owners: owners.clone(),
        }),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Txn
// ---------------------------------------------------------------------------

/// A transaction.
pub struct Txn {
    id: TxnId,
    config: TxnConfig,
    manager: Arc<TxnManager>,
    hooks: Arc<dyn TxnHooks>,
    lock_timeout: Duration,
    durability: Durability,
    frozen: AtomicBool,
    group_committed: AtomicBool,
    acks: AckLatch,
    inner: Mutex<TxnInner>,
}

impl Txn {
    pub(crate) fn new(
        id: TxnId,
        config: TxnConfig,
        manager: Arc<TxnManager>,
        hooks: Arc<dyn TxnHooks>,
    ) -> Self {
        let env_config = manager.env().config();
        let lock_timeout = config
            .lock_timeout_ms
            .map_or_else(|| env_config.lock_timeout(), Duration::from_millis);
        let durability = config.durability.unwrap_or(env_config.default_durability);
        Self {
            id,
            config,
            manager,
            hooks,
            lock_timeout,
            durability,
            frozen: AtomicBool::new(false),
            group_committed: AtomicBool::new(false),
            acks: AckLatch::new(),
            inner: Mutex::new(TxnInner::new()),
        }
    }

    #[must_use]
    pub const fn id(&self) -> TxnId {
        self.id
    }

    #[must_use]
    pub const fn config(&self) -> &TxnConfig {
        &self.config
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<TxnManager> {
        &self.manager
    }

    #[must_use]
    pub fn env(&self) -> &Arc<Environment> {
        self.manager.env()
    }

    /// Durability requested at creation.
    #[must_use]
    pub const fn durability(&self) -> Durability {
        self.durability
    }

    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    #[must_use]
    pub fn state(&self) -> TxnState {
        self.inner.lock().state.clone()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self.inner.lock().state, TxnState::Open)
    }

    /// The recorded cause when the transaction is abort-only.
    #[must_use]
    pub fn must_abort_cause(&self) -> Option<Arc<TideError>> {
        match &self.inner.lock().state {
            TxnState::MustAbort(cause) => Some(Arc::clone(cause)),
            _ => None,
        }
    }

    /// First data record this transaction logged.
    #[must_use]
    pub fn first_lsn(&self) -> Option<Lsn> {
        self.inner.lock().first_lsn
    }

    /// Head of the backward chain of this transaction's data records.
    #[must_use]
    pub fn last_lsn(&self) -> Option<Lsn> {
        self.inner.lock().last_lsn
    }

    #[must_use]
    pub fn n_read_locks(&self) -> usize {
        self.inner.lock().read_locks.len()
    }

    #[must_use]
    pub fn n_write_locks(&self) -> usize {
        self.inner.lock().write_info.len()
    }

    #[must_use]
    pub fn write_lock_info(&self, lsn: Lsn) -> Option<WriteLockInfo> {
        self.inner.lock().write_info.get(&lsn).copied()
    }

    #[must_use]
    pub fn n_open_cursors(&self) -> u32 {
        self.inner.lock().open_cursors
    }

    #[must_use]
    pub const fn ack_latch(&self) -> &AckLatch {
        &self.acks
    }

    // -- cursors, database ops ---------------------------------------------

    pub fn register_cursor(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_usable(self.id, "open a cursor")?;
        inner.open_cursors += 1;
        Ok(())
    }

    pub fn unregister_cursor(&self) {
        let mut inner = self.inner.lock();
        inner.open_cursors = inner.open_cursors.saturating_sub(1);
    }

    /// Queue a structural database change to finish (or roll back) when the
    /// transaction ends.
    pub fn add_database_op(&self, op: DatabaseOp) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_usable(self.id, "change a database")?;
        inner.db_ops.push(op);
        Ok(())
    }

    // -- freeze, abort-only ------------------------------------------------

    /// Stop commit and abort from touching shared state during a role
    /// transition.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
        debug!(target: "tidelog_txn::txn", txn_id = %self.id, "frozen");
    }

    pub fn unfreeze(&self) {
        self.frozen.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub(crate) fn set_group_committed(&self, on: bool) {
        self.group_committed.store(on, Ordering::Release);
    }

    /// The commit is waiting on a group flush for local durability.
    #[must_use]
    pub fn is_group_committed(&self) -> bool {
        self.group_committed.load(Ordering::Acquire)
    }

    /// Make the transaction abort-only. The first cause wins. An ending
    /// transaction whose commit or abort stopped short is handed back this way.
    pub fn set_only_abortable(&self, cause: Arc<TideError>) {
        let mut inner = self.inner.lock();
        if matches!(inner.state, TxnState::Open | TxnState::Ending) {
            debug!(target: "tidelog_txn::txn", txn_id = %self.id, cause = %cause, "marked abort-only");
            inner.state = TxnState::MustAbort(cause);
        }
    }

    /// Hand an ending transaction back as abort-only after its commit or
    /// abort stopped before closing.
    fn release_to_abort_only(&self, cause: &TideError) {
        let mut inner = self.inner.lock();
        if matches!(inner.state, TxnState::Ending) {
            inner.state = TxnState::MustAbort(Arc::new(TideError::internal(format!(
                "txn {} did not finish ending: {cause}",
                self.id
            ))));
        }
    }

    /// A lock on `lsn` was stolen from this transaction.
    pub(crate) fn preempt(&self, lsn: Lsn) {
        let mut inner = self.inner.lock();
        let mut delta = 0;
        if inner.read_locks.remove(&lsn) {
            delta -= READ_LOCK_OVERHEAD;
        }
        if inner.write_info.remove(&lsn).is_some() {
            delta -= WRITE_LOCK_OVERHEAD;
        }
        self.note_memory(&mut inner, delta);
        if matches!(inner.state, TxnState::Open) {
            inner.state = TxnState::MustAbort(Arc::new(TideError::LockPreempted {
                lsn: lsn.get(),
                locker: self.id.get(),
            }));
        }
        debug!(target: "tidelog_txn::lock", txn_id = %self.id, %lsn, "lock preempted");
    }

    // -- memory ------------------------------------------------------------

    fn note_memory(&self, inner: &mut TxnInner, delta: i64) {
        inner.memory_delta += delta;
        if inner.memory_delta.abs() >= MEMORY_FLUSH_THRESHOLD {
            self.manager.update_memory_usage(inner.memory_delta);
            inner.memory_flushed += inner.memory_delta;
            inner.memory_delta = 0;
        }
    }

    /// Footprint already reported to the manager; zeroed by the call.
    pub(crate) fn take_flushed_memory(&self) -> i64 {
        let mut inner = self.inner.lock();
        inner.memory_delta = 0;
        std::mem::take(&mut inner.memory_flushed)
    }

    // -- locks -------------------------------------------------------------

    /// Record a granted lock in the transaction's collections.
    pub(crate) fn record_lock(&self, lsn: Lsn, lock_type: LockType, grant: LockGrant) {
        if !grant.is_held() {
            return;
        }
        let mut inner = self.inner.lock();
        let delta = inner.record_lock(lsn, lock_type);
        self.note_memory(&mut inner, delta);
    }

    fn release_all_locks(&self, read: Vec<Lsn>, write: Vec<Lsn>) {
        let locks = self.env().locks();
        for lsn in read.iter().chain(&write) {
            locks.release(*lsn, self.id);
        }
        trace!(
            target: "tidelog_txn::lock",
            txn_id = %self.id,
            read = read.len(),
            write = write.len(),
            "locks released"
        );
    }

    // -- logging -----------------------------------------------------------

    /// Log one record change and move the write lock to its new position.
    ///
    /// The new record is chained to the previous one, inherits the undo
    /// information of the version it supersedes, and is write-locked without
    /// waiting. A superseded version this transaction wrote itself is counted
    /// obsolete right away.
    pub fn log_change(&self, change: Change) -> Result<Lsn> {
        let env = Arc::clone(self.env());
        let mut inner = self.inner.lock();
        inner.check_usable(self.id, "log a change")?;

        let (abort_lsn, abort_known_deleted, rmw, own_prior) = match change.prior {
            Some(prior) => {
                let info = inner.write_info.get(&prior).copied().ok_or_else(|| {
                    TideError::internal(format!(
                        "txn {} logs over {prior} without a write lock",
                        self.id
                    ))
                })?;
                if info.created {
                    (info.abort_lsn, info.abort_known_deleted, info.rmw, Some(prior))
                } else {
                    (Some(prior), change.prior_known_deleted, info.rmw, None)
                }
            }
            None => (None, false, false, None),
        };

        let deletion = change.data.is_none();
        let entry = LnLogEntry {
            txn_id: self.id,
            prev_lsn: inner.last_lsn,
            db: change.db,
            key: change.key,
            data: change.data,
            abort_lsn,
            abort_known_deleted,
        };
        let key = deletion.then(|| entry.key.clone());

        let new_lsn = match env.log().log(LogEntry::Ln(entry), &LogParams::new(SyncPolicy::NoSync)) {
            Ok(lsn) => lsn,
            Err(err) => {
                let cause = Arc::new(err);
                if matches!(inner.state, TxnState::Open) {
                    inner.state = TxnState::MustAbort(Arc::clone(&cause));
                }
                return Err(TideError::must_abort(self.id.get(), cause));
            }
        };

        let req = LockRequest::new(new_lsn, self.id, LockType::Write, Duration::ZERO)
            .no_wait(true)
            .in_database(change.db);
        if let Err(err) = env.locks().lock(&req) {
            let cause = Arc::new(err);
            inner.state = TxnState::MustAbort(Arc::clone(&cause));
            return Err(TideError::must_abort(self.id.get(), cause));
        }

        inner.write_info.insert(
            new_lsn,
            WriteLockInfo {
                abort_lsn,
                abort_known_deleted,
                rmw,
                created: true,
            },
        );
        if inner.first_lsn.is_none() {
            inner.first_lsn = Some(new_lsn);
        }
        inner.last_lsn = Some(new_lsn);
        if let Some(key) = key {
            inner.deleted_slots.push(DeletedSlot {
                db: change.db,
                key,
                lsn: new_lsn,
            });
        }
        self.note_memory(&mut inner, WRITE_LOCK_OVERHEAD);
        drop(inner);

        if let Some(prior) = own_prior {
            env.log().count_obsolete_node(prior, ObsoleteCounting::Exact);
        }
        trace!(target: "tidelog_txn::txn", txn_id = %self.id, lsn = %new_lsn, deletion, "logged change");
        Ok(new_lsn)
    }

    // -- commit ------------------------------------------------------------

    /// Commit with the transaction's configured durability.
    ///
    /// Returns the position of the commit record, `None` when nothing was
    /// logged (or the transaction is frozen).
    pub fn commit(&self) -> Result<Option<Lsn>> {
        self.commit_with(self.durability)
    }

    /// Commit with an explicit durability.
    pub fn commit_with(&self, durability: Durability) -> Result<Option<Lsn>> {
        if self.is_frozen() {
            debug!(target: "tidelog_txn::txn", txn_id = %self.id, "commit of frozen txn ignored");
            return Ok(None);
        }
        let env = Arc::clone(self.env());
        env.check_valid()?;
        {
            let mut inner = self.inner.lock();
            inner.check_usable(self.id, "commit")?;
            inner.check_no_cursors(self.id)?;
            inner.state = TxnState::Ending;
        }

        let mut durability = durability;
        if let Err(err) = self.hooks.pre_log_commit(self, &mut durability) {
            return Err(self.abort_after_failed_commit(err, CommitRecord::NotAttempted));
        }

        let (last_lsn, obsolete) = {
            let mut inner = self.inner.lock();
            let reads: Vec<Lsn> = inner.read_locks.drain().collect();
            let freed = READ_LOCK_OVERHEAD * i64::try_from(reads.len()).unwrap_or_default();
            self.note_memory(&mut inner, -freed);
            self.release_all_locks(reads, Vec::new());
            if let Some(last) = inner.last_lsn {
                if !inner.write_info.contains_key(&last) {
                    drop(inner);
                    let err = env.invalidate(
                        EnvFailureReason::UnexpectedState,
                        format!("txn {} lost its write lock on last logged {last}", self.id),
                    );
                    self.release_to_abort_only(&err);
                    return Err(err);
                }
            }
            (inner.last_lsn, inner.obsolete_abort_lsns())
        };

        let commit_lsn = match last_lsn {
            Some(last) => {
                let mut end = TxnEnd::new(TxnEndKind::Commit, self.id, now_ms(), Some(last));
                self.hooks.fill_end_record(self, &mut end);
                let params = LogParams {
                    sync: durability.local_sync,
                    obsolete: obsolete.into_iter().collect(),
                };
                match env.log().log(LogEntry::TxnEnd(end), &params) {
                    Ok(lsn) => Some(lsn),
                    Err(err) => {
                        return Err(self.abort_after_failed_commit(err, CommitRecord::Failed));
                    }
                }
            }
            None => {
                self.manager
                    .metrics()
                    .elided_commits
                    .fetch_add(1, Ordering::Relaxed);
                None
            }
        };

        let mut deferred = None;
        if let Err(err) = self.hooks.post_log_commit(self, commit_lsn) {
            if err.is_deferred_after_commit() {
                deferred = Some(err);
            } else {
                self.hooks.post_log_commit_abort(self);
                return Err(self.abort_after_failed_commit(err, CommitRecord::Written));
            }
        }

        if let Some(err) = self.close(TxnState::Committed) {
            deferred.get_or_insert(err);
        }
        debug!(
            target: "tidelog_txn::txn",
            txn_id = %self.id,
            commit_lsn = ?commit_lsn,
            sync = %durability.local_sync,
            "committed"
        );
        match deferred {
            Some(err) => Err(err),
            None => Ok(commit_lsn),
        }
    }

    /// Try to abort after `primary` broke a commit, and pick the error the
    /// caller sees.
    fn abort_after_failed_commit(&self, primary: TideError, record: CommitRecord) -> TideError {
        let env = self.env();
        if !env.is_valid() {
            self.release_to_abort_only(&primary);
            return primary;
        }
        match self.abort_internal(false) {
            Ok(()) => primary,
            Err(AbortFailure::Record(secondary)) if record == CommitRecord::Failed => env
                .invalidate(
                    EnvFailureReason::LogWrite,
                    format!(
                        "txn {}: commit record failed ({primary}) and abort record failed ({secondary})",
                        self.id
                    ),
                ),
            Err(failure) => {
                let secondary = failure.into_error(self.id);
                if secondary.invalidates_environment() {
                    return secondary;
                }
                warn!(
                    target: "tidelog_txn::txn",
                    txn_id = %self.id,
                    primary = %primary,
                    secondary = %secondary,
                    "abort after failed commit also failed"
                );
                primary
            }
        }
    }

    // -- abort -------------------------------------------------------------

    /// Roll back. `force_flush` makes the abort record durable before undo.
    pub fn abort(&self, force_flush: bool) -> Result<()> {
        if self.is_frozen() {
            debug!(target: "tidelog_txn::txn", txn_id = %self.id, "abort of frozen txn ignored");
            return Ok(());
        }
        {
            let mut inner = self.inner.lock();
            if inner.state.is_closed() || matches!(inner.state, TxnState::Ending) {
                return Err(TideError::IllegalTxnState {
                    txn_id: self.id.get(),
                    state: inner.state.name(),
                    operation: "abort",
                });
            }
            inner.check_no_cursors(self.id)?;
            inner.state = TxnState::Ending;
        }
        self.abort_internal(force_flush)
            .map_err(|f| f.into_error(self.id))
    }

    fn abort_internal(&self, force_flush: bool) -> std::result::Result<(), AbortFailure> {
        let env = Arc::clone(self.env());
        if let Err(err) = self.hooks.pre_log_abort(self) {
            self.release_to_abort_only(&err);
            return Err(AbortFailure::Other(err));
        }

        let last_lsn = self.inner.lock().last_lsn;
        if let Some(last) = last_lsn {
            let mut end = TxnEnd::new(TxnEndKind::Abort, self.id, now_ms(), Some(last));
            self.hooks.fill_end_record(self, &mut end);
            let sync = if force_flush {
                SyncPolicy::Sync
            } else {
                SyncPolicy::NoSync
            };
            if let Err(err) = env.log().log(LogEntry::TxnEnd(end), &LogParams::new(sync)) {
                let cause = Arc::new(err);
                self.set_only_abortable(Arc::clone(&cause));
                self.manager
                    .metrics()
                    .abort_record_failures
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "tidelog_txn::txn",
                    txn_id = %self.id,
                    error = %cause,
                    "abort record not written; locks kept"
                );
                return Err(AbortFailure::Record(cause));
            }
        }

        let deferred = self.hooks.post_log_abort(self).err();

        if let Some(last) = last_lsn {
            if let Err(err) = self.undo(last) {
                let err = env.invalidate(
                    EnvFailureReason::UndoFailed,
                    format!("undo of txn {} failed: {err}", self.id),
                );
                self.release_to_abort_only(&err);
                return Err(AbortFailure::Other(err));
            }
        }

        let cleanup = self.close(TxnState::Aborted);
        debug!(target: "tidelog_txn::txn", txn_id = %self.id, "aborted");
        match deferred.or(cleanup) {
            Some(err) => Err(AbortFailure::Other(err)),
            None => Ok(()),
        }
    }

    /// Walk the chain from `last` backwards, restoring each slot once.
    ///
    /// The newest change to a slot carries the slot's pre-transaction
    /// version, so later (older) entries for the same slot are skipped. Every
    /// entry is counted obsolete.
    fn undo(&self, last: Lsn) -> Result<()> {
        let env = self.env();
        let mut seen_versions: HashSet<Lsn> = HashSet::new();
        let mut seen_absent: BTreeSet<(DatabaseId, Vec<u8>)> = BTreeSet::new();
        let mut next = Some(last);
        let mut undone = 0usize;

        while let Some(lsn) = next {
            let ln = match env.log().read_entry(lsn)? {
                LogEntry::Ln(ln) => ln,
                LogEntry::TxnEnd(end) => {
                    return Err(TideError::internal(format!(
                        "{} record at {lsn} in undo chain of txn {}",
                        end.kind.as_str(),
                        self.id
                    )));
                }
            };
            if ln.txn_id != self.id {
                return Err(TideError::internal(format!(
                    "record at {lsn} belongs to txn {}, not {}",
                    ln.txn_id, self.id
                )));
            }

            let first_visit = match ln.abort_lsn {
                Some(abort) => seen_versions.insert(abort),
                None => seen_absent.insert((ln.db, ln.key.clone())),
            };
            if first_visit {
                env.store().undo(&UndoRecord {
                    txn_id: self.id,
                    lsn,
                    db: ln.db,
                    key: ln.key,
                    abort_lsn: ln.abort_lsn,
                    abort_known_deleted: ln.abort_known_deleted,
                })?;
                undone += 1;
            }
            env.log().count_obsolete_node(lsn, ObsoleteCounting::DupAllowed);
            next = ln.prev_lsn;
        }
        trace!(target: "tidelog_txn::txn", txn_id = %self.id, undone, "undo complete");
        Ok(())
    }

    /// Final stage of commit and abort: release every lock, finish database
    /// operations, hand deletions to reclamation, and unregister.
    fn close(&self, outcome: TxnState) -> Option<TideError> {
        let committed = matches!(outcome, TxnState::Committed);
        let (reads, writes, ops, deleted) = {
            let mut inner = self.inner.lock();
            inner.state = outcome;
            let reads: Vec<Lsn> = inner.read_locks.drain().collect();
            let writes: Vec<Lsn> = inner.write_info.drain().map(|(lsn, _)| lsn).collect();
            inner.open_cursors = 0;
            (
                reads,
                writes,
                std::mem::take(&mut inner.db_ops),
                std::mem::take(&mut inner.deleted_slots),
            )
        };
        self.release_all_locks(reads, writes);

        let env = self.env();
        let mut failure = None;
        if !ops.is_empty() {
            if let Err(err) = env.store().finish_database_ops(&ops, committed) {
                warn!(target: "tidelog_txn::txn", txn_id = %self.id, error = %err, "database ops not finished");
                failure = Some(err);
            }
        }
        if committed && !deleted.is_empty() {
            env.store().queue_deleted_slots(deleted);
        }
        self.manager.unregister_txn(self, committed);
        failure
    }

    // -- operation end -----------------------------------------------------

    /// End of a user operation: auto-commit transactions commit when `ok`
    /// and abort otherwise. Explicit transactions are left alone.
    pub fn operation_end(&self, ok: bool) -> Result<()> {
        if !self.config.auto_commit {
            return Ok(());
        }
        if ok {
            self.commit().map(|_| ())
        } else {
            self.abort(false)
        }
    }
}

impl Locker for Txn {
    fn id(&self) -> TxnId {
        self.id
    }

    fn locking_required(&self) -> bool {
        false
    }

    fn lock(
        &self,
        lsn: Lsn,
        lock_type: LockType,
        no_wait: bool,
        db: Option<DatabaseId>,
    ) -> Result<LockGrant> {
        self.inner.lock().check_usable(self.id, "lock")?;
        let mut req = LockRequest::new(lsn, self.id, lock_type, self.lock_timeout)
            .no_wait(no_wait || self.config.no_wait);
        req.database = db;
        match self.env().locks().lock(&req) {
            Ok(grant) => {
                self.record_lock(lsn, lock_type, grant);
                Ok(grant)
            }
            Err(err) => {
                if let Some(copy) = copy_lock_timeout(&err) {
                    self.set_only_abortable(Arc::new(copy));
                }
                Err(err)
            }
        }
    }

    /// Only read locks can be given back before the transaction ends.
    fn release_lock(&self, lsn: Lsn) -> bool {
        let mut inner = self.inner.lock();
        if !inner.read_locks.remove(&lsn) {
            return false;
        }
        self.note_memory(&mut inner, -READ_LOCK_OVERHEAD);
        drop(inner);
        self.env().locks().release(lsn, self.id);
        true
    }

    fn held_lock(&self, lsn: Lsn) -> Option<LockType> {
        self.inner.lock().held_lock(lsn)
    }

    fn operation_end(&self, ok: bool) -> Result<()> {
        Self::operation_end(self, ok)
    }
}

impl AckTxn for Txn {
    fn ack_txn_id(&self) -> TxnId {
        self.id
    }

    fn countdown_ack(&self) {
        self.acks.countdown();
    }

    fn is_frozen(&self) -> bool {
        Self::is_frozen(self)
    }
}

impl std::fmt::Debug for Txn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Txn")
            .field("id", &self.id)
            .field("state", &inner.state.name())
            .field("read_locks", &inner.read_locks.len())
            .field("write_locks", &inner.write_info.len())
            .field("last_lsn", &inner.last_lsn)
            .field("durability", &self.durability)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvConfig;
    use crate::memory::{MemoryLogManager, MemoryRecordStore};

    fn lsn(n: u64) -> Lsn {
        Lsn::new(n).unwrap()
    }

    struct Fixture {
        log: Arc<MemoryLogManager>,
        store: Arc<MemoryRecordStore>,
        mgr: Arc<TxnManager>,
    }

    fn fixture() -> Fixture {
        let log = Arc::new(MemoryLogManager::new());
        let store = Arc::new(MemoryRecordStore::new());
        let env = Environment::new(
            EnvConfig {
                lock_timeout_ms: 20,
                ..EnvConfig::default()
            },
            Arc::clone(&log) as _,
            Arc::clone(&store) as _,
        );
        Fixture {
            log,
            store,
            mgr: TxnManager::new(env),
        }
    }

    #[test]
    fn record_lock_upgrades_read_to_write() {
        let mut inner = TxnInner::new();
        assert_eq!(inner.record_lock(lsn(1), LockType::Read), READ_LOCK_OVERHEAD);
        assert_eq!(inner.record_lock(lsn(1), LockType::Read), 0);
        assert_eq!(
            inner.record_lock(lsn(1), LockType::Write),
            WRITE_LOCK_OVERHEAD - READ_LOCK_OVERHEAD
        );
        assert!(inner.read_locks.is_empty());
        assert_eq!(inner.held_lock(lsn(1)), Some(LockType::Write));
        assert_eq!(inner.record_lock(lsn(1), LockType::Read), 0);
        assert_eq!(inner.held_lock(lsn(1)), Some(LockType::Write));
        inner.record_lock(lsn(1), LockType::WriteRmw);
        assert_eq!(inner.held_lock(lsn(1)), Some(LockType::WriteRmw));
    }

    #[test]
    fn obsolete_set_dedups_by_abort_position() {
        let mut inner = TxnInner::new();
        let created = |abort: u64| WriteLockInfo {
            abort_lsn: Some(lsn(abort)),
            created: true,
            ..WriteLockInfo::LOCKED
        };
        inner.write_info.insert(lsn(10), created(1));
        inner.write_info.insert(lsn(11), created(1));
        inner.write_info.insert(lsn(12), created(2));
        inner.write_info.insert(
            lsn(13),
            WriteLockInfo {
                rmw: true,
                ..created(3)
            },
        );
        inner.write_info.insert(
            lsn(14),
            WriteLockInfo {
                abort_known_deleted: true,
                ..created(4)
            },
        );
        inner.write_info.insert(lsn(5), WriteLockInfo::LOCKED);
        let got: Vec<u64> = inner.obsolete_abort_lsns().into_iter().map(Lsn::get).collect();
        assert_eq!(got, vec![1, 2]);
    }

    #[test]
    fn states_reject_illegal_operations() {
        let fx = fixture();
        let txn = fx.mgr.txn_begin(None, TxnConfig::default()).unwrap();
        txn.commit().unwrap();
        let err = txn.commit().unwrap_err();
        assert!(matches!(
            err,
            TideError::IllegalTxnState {
                state: "COMMITTED",
                operation: "commit",
                ..
            }
        ));
        assert!(txn.abort(false).is_err());
        assert!(txn.register_cursor().is_err());
    }

    #[test]
    fn abort_during_commit_is_rejected() {
        struct AbortFromHook(parking_lot::Mutex<Option<TideError>>);

        impl TxnHooks for AbortFromHook {
            fn pre_log_commit(&self, txn: &Txn, _durability: &mut Durability) -> Result<()> {
                if let Err(err) = txn.abort(false) {
                    *self.0.lock() = Some(err);
                }
                Ok(())
            }
        }

        let fx = fixture();
        let hooks = Arc::new(AbortFromHook(parking_lot::Mutex::new(None)));
        let txn = fx
            .mgr
            .txn_begin_with_hooks(None, TxnConfig::default(), Arc::clone(&hooks) as _)
            .unwrap();
        fx.store.write(&txn, DatabaseId(1), b"k", Some(b"v")).unwrap();
        assert!(txn.commit().unwrap().is_some());

        assert!(matches!(
            hooks.0.lock().take(),
            Some(TideError::IllegalTxnState {
                state: "ENDING",
                operation: "abort",
                ..
            })
        ));
        assert!(matches!(txn.state(), TxnState::Committed));
        let kinds: Vec<TxnEndKind> = fx.log.txn_ends().unwrap().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![TxnEndKind::Commit]);
        assert!(fx.store.undone().is_empty());
    }

    #[test]
    fn racing_commit_and_abort_end_the_txn_once() {
        let fx = fixture();
        for _ in 0..200 {
            let txn = fx.mgr.txn_begin(None, TxnConfig::default()).unwrap();
            fx.store.write(&txn, DatabaseId(1), b"k", Some(b"v")).unwrap();
            let barrier = Arc::new(std::sync::Barrier::new(2));

            let committer = {
                let txn = Arc::clone(&txn);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    txn.commit().is_ok()
                })
            };
            barrier.wait();
            let aborted = txn.abort(false).is_ok();
            let committed = committer.join().unwrap();

            assert!(committed ^ aborted, "committed={committed} aborted={aborted}");
            let ends = fx
                .log
                .txn_ends()
                .unwrap()
                .into_iter()
                .filter(|e| e.txn_id == txn.id())
                .count();
            assert_eq!(ends, 1);
            assert!(txn.state().is_closed());
        }
        assert!(fx.mgr.active_txns().is_empty());
    }

    #[test]
    fn failed_pre_abort_hook_leaves_txn_abortable() {
        struct RefuseOnce(AtomicBool);

        impl TxnHooks for RefuseOnce {
            fn pre_log_abort(&self, _txn: &Txn) -> Result<()> {
                if self.0.swap(false, Ordering::SeqCst) {
                    return Err(TideError::internal("replica not ready"));
                }
                Ok(())
            }
        }

        let fx = fixture();
        let txn = fx
            .mgr
            .txn_begin_with_hooks(None, TxnConfig::default(), Arc::new(RefuseOnce(AtomicBool::new(true))))
            .unwrap();
        fx.store.write(&txn, DatabaseId(1), b"k", Some(b"v")).unwrap();
        assert!(txn.abort(false).is_err());
        assert!(txn.must_abort_cause().is_some());
        txn.abort(false).unwrap();
        assert!(matches!(txn.state(), TxnState::Aborted));
    }

    #[test]
    fn open_cursor_blocks_commit_and_abort() {
        let fx = fixture();
        let txn = fx.mgr.txn_begin(None, TxnConfig::default()).unwrap();
        txn.register_cursor().unwrap();
        assert!(matches!(
            txn.commit(),
            Err(TideError::OpenCursors { count: 1, .. })
        ));
        assert!(matches!(txn.abort(false), Err(TideError::OpenCursors { .. })));
        txn.unregister_cursor();
        txn.commit().unwrap();
    }

    #[test]
    fn lock_timeout_marks_abort_only() {
        let fx = fixture();
        let holder = fx.mgr.txn_begin(None, TxnConfig::default()).unwrap();
        let waiter = fx.mgr.txn_begin(None, TxnConfig::default()).unwrap();
        holder.lock(lsn(7), LockType::Write, false, None).unwrap();

        let err = waiter.lock(lsn(7), LockType::Read, true, None).unwrap_err();
        assert!(matches!(err, TideError::LockNotAvailable { .. }));
        assert!(waiter.is_open());

        let err = waiter.lock(lsn(7), LockType::Read, false, None).unwrap_err();
        assert!(matches!(err, TideError::LockTimeout { .. }));
        let err = waiter.commit().unwrap_err();
        assert!(matches!(
            err.root_cause(),
            TideError::LockTimeout { lsn: 7, .. }
        ));
        waiter.abort(false).unwrap();
        holder.commit().unwrap();
        assert_eq!(fx.mgr.n_active_txns(), 0);
    }

    #[test]
    fn rewrite_carries_original_abort_version() {
        let fx = fixture();
        let db = DatabaseId(1);
        let seed = fx.mgr.txn_begin(None, TxnConfig::default()).unwrap();
        let v1 = fx.store.write(&seed, db, b"k", Some(b"one")).unwrap();
        seed.commit().unwrap();

        let txn = fx.mgr.txn_begin(None, TxnConfig::default()).unwrap();
        let v2 = fx.store.write(&txn, db, b"k", Some(b"two")).unwrap();
        let v3 = fx.store.write(&txn, db, b"k", Some(b"three")).unwrap();
        let info = txn.write_lock_info(v3).unwrap();
        assert_eq!(info.abort_lsn, Some(v1));
        assert!(info.created);
        assert_eq!(txn.last_lsn(), Some(v3));
        assert_eq!(txn.first_lsn(), Some(v2));
        assert!(
            fx.log
                .obsolete_counts()
                .contains(&(v2, ObsoleteCounting::Exact))
        );

        txn.abort(false).unwrap();
        assert_eq!(fx.store.get(db, b"k"), Some(b"one".to_vec()));
        assert_eq!(fx.store.undone().len(), 1);
    }

    #[test]
    fn frozen_txn_commit_and_abort_are_noops() {
        let fx = fixture();
        let txn = fx.mgr.txn_begin(None, TxnConfig::default()).unwrap();
        fx.store.write(&txn, DatabaseId(1), b"k", Some(b"v")).unwrap();
        txn.freeze();
        assert_eq!(txn.commit().unwrap(), None);
        txn.abort(false).unwrap();
        assert!(txn.is_open());
        assert_eq!(fx.mgr.n_active_txns(), 1);
        txn.unfreeze();
        assert!(txn.commit().unwrap().is_some());
    }

    #[test]
    fn auto_commit_operation_end() {
        let fx = fixture();
        let txn = fx.mgr.txn_begin(None, TxnConfig::auto_commit()).unwrap();
        fx.store.write(&txn, DatabaseId(1), b"a", Some(b"v")).unwrap();
        Locker::operation_end(txn.as_ref(), true).unwrap();
        assert!(matches!(txn.state(), TxnState::Committed));

        let explicit = fx.mgr.txn_begin(None, TxnConfig::default()).unwrap();
        explicit.operation_end(false).unwrap();
        assert!(explicit.is_open());
        explicit.abort(false).unwrap();
    }
}
