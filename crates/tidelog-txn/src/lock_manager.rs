//! Record lock table.
//!
//! A lock is keyed by the record's current log position. Each lock has a set of
//! owners (any number of READ owners or exactly one write owner) and a FIFO
//! queue of waiters. The table is split into power-of-two shards, each a
//! `parking_lot::Mutex<HashMap>` paired with a `Condvar` that blocked requests
//! wait on.
//!
//! Waiters are granted in queue order on release, demotion and timeout: a run
//! of compatible READ waiters together, or a single write waiter alone.
//! Promotion requests and jump-ahead requests enter at the front of the queue.

use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use tidelog_error::{Result, TideError};
use tidelog_types::{DatabaseId, LockerId, Lsn};
use tracing::{debug, trace};

use crate::env::{EnvState, InvalidationListener};
use crate::lock_type::{LockConflict, LockType, LockUpgrade, conflict, upgrade_for};
use crate::metrics::LockMetrics;

// ---------------------------------------------------------------------------
// Requests and grants
// ---------------------------------------------------------------------------

/// One lock request.
#[derive(Debug, Clone)]
pub struct LockRequest {
    pub lsn: Lsn,
    pub locker: LockerId,
    pub lock_type: LockType,
    /// Bound on the wait. Zero never waits.
    pub timeout: Duration,
    /// Refuse instead of waiting on conflict.
    pub no_wait: bool,
    /// Enter at the head of the waiter queue and ignore queued waiters when
    /// checking for an immediate grant. Reserved for internal lockers.
    pub jump_ahead_of_waiters: bool,
    /// Database the record belongs to, carried for diagnostics.
    pub database: Option<DatabaseId>,
    /// The locker needs a real lock even when locking is disabled.
    pub locking_required: bool,
}

impl LockRequest {
    #[must_use]
    pub const fn new(lsn: Lsn, locker: LockerId, lock_type: LockType, timeout: Duration) -> Self {
        Self {
            lsn,
            locker,
            lock_type,
            timeout,
            no_wait: false,
            jump_ahead_of_waiters: false,
            database: None,
            locking_required: false,
        }
    }

    #[must_use]
    pub const fn no_wait(mut self, no_wait: bool) -> Self {
        self.no_wait = no_wait;
        self
    }

    #[must_use]
    pub const fn jump_ahead(mut self) -> Self {
        self.jump_ahead_of_waiters = true;
        self
    }

    #[must_use]
    pub const fn in_database(mut self, db: DatabaseId) -> Self {
        self.database = Some(db);
        self
    }

    #[must_use]
    pub const fn required(mut self, required: bool) -> Self {
        self.locking_required = required;
        self
    }
}

/// How a successful request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockGrant {
    /// Granted immediately.
    New,
    /// Granted after waiting.
    WaitNew,
    /// Held READ promoted immediately.
    Promotion,
    /// Held READ promoted after waiting.
    WaitPromotion,
    /// Already held in a covering mode.
    Existing,
    /// NONE requested; nothing was locked.
    NoneNeeded,
}

impl LockGrant {
    /// Whether the lock is now recorded in the table on behalf of the locker.
    #[must_use]
    pub const fn is_held(self) -> bool {
        !matches!(self, Self::NoneNeeded)
    }
}

/// An owner or waiter of one lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOwner {
    pub locker: LockerId,
    pub lock_type: LockType,
}

// ---------------------------------------------------------------------------
// Lock service
// ---------------------------------------------------------------------------

/// Locking policy of an environment.
pub trait LockService: Send + Sync {
    /// Acquire (or upgrade to) `req.lock_type` on `req.lsn`.
    fn lock(&self, req: &LockRequest) -> Result<LockGrant>;

    /// Drop `locker`'s ownership. Returns whether it owned the lock.
    fn release(&self, lsn: Lsn, locker: LockerId) -> bool;

    /// Downgrade `locker`'s write lock to READ. Returns whether a write lock
    /// was held.
    fn demote(&self, lsn: Lsn, locker: LockerId) -> bool;

    /// Make `locker` the sole owner of `lsn` in `lock_type` mode, returning the
    /// owners it displaced.
    fn steal_lock(&self, lsn: Lsn, locker: LockerId, lock_type: LockType) -> Result<Vec<LockOwner>>;

    fn is_locked(&self, lsn: Lsn) -> bool;

    /// Whether `locker` owns `lsn` in a mode covering `lock_type`.
    fn is_owner(&self, lsn: Lsn, locker: LockerId, lock_type: LockType) -> bool;

    fn n_owners(&self, lsn: Lsn) -> usize;

    fn n_waiters(&self, lsn: Lsn) -> usize;

    fn owners(&self, lsn: Lsn) -> Vec<LockOwner>;

    fn waiters(&self, lsn: Lsn) -> Vec<LockOwner>;

    /// Number of locks with at least one owner or waiter.
    fn lock_count(&self) -> usize;

    /// Wake every blocked request so it re-checks its state.
    fn wake_all(&self);
}

// ---------------------------------------------------------------------------
// Lock entry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Waiter {
    locker: LockerId,
    lock_type: LockType,
    promotion: bool,
}

#[derive(Debug, Default)]
struct LockEntry {
    owners: SmallVec<[LockOwner; 2]>,
    waiters: VecDeque<Waiter>,
}

impl LockEntry {
    fn owner_type(&self, locker: LockerId) -> Option<LockType> {
        self.owners
            .iter()
            .find(|o| o.locker == locker)
            .map(|o| o.lock_type)
    }

    /// Whether an owner other than `locker` blocks `lock_type`.
    fn blocked(&self, locker: LockerId, lock_type: LockType) -> bool {
        self.owners
            .iter()
            .any(|o| o.locker != locker && conflict(o.lock_type, lock_type) == LockConflict::Block)
    }

    fn holds_covering(&self, locker: LockerId, lock_type: LockType) -> bool {
        self.owner_type(locker).is_some_and(|held| held.covers(lock_type))
    }

    fn add_owner(&mut self, locker: LockerId, lock_type: LockType) {
        if let Some(owner) = self.owners.iter_mut().find(|o| o.locker == locker) {
            owner.lock_type = lock_type;
        } else {
            self.owners.push(LockOwner { locker, lock_type });
        }
    }

    fn remove_owner(&mut self, locker: LockerId) -> bool {
        match self.owners.iter().position(|o| o.locker == locker) {
            Some(idx) => {
                self.owners.remove(idx);
                true
            }
            None => false,
        }
    }

    fn remove_waiter(&mut self, locker: LockerId) {
        self.waiters.retain(|w| w.locker != locker);
    }

    /// Grant queued waiters in order until one is blocked.
    fn grant_waiters(&mut self) -> usize {
        let mut granted = 0;
        while let Some(&w) = self.waiters.front() {
            if self.blocked(w.locker, w.lock_type) {
                break;
            }
            self.waiters.pop_front();
            self.add_owner(w.locker, w.lock_type);
            granted += 1;
        }
        granted
    }

    fn is_empty(&self) -> bool {
        self.owners.is_empty() && self.waiters.is_empty()
    }

    fn describe_owners(&self) -> String {
        let mut out = String::new();
        for (i, o) in self.owners.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            let _ = write!(out, "{}:{}", o.locker, o.lock_type);
        }
        out
    }
}

// ---------------------------------------------------------------------------
// LockManager
// ---------------------------------------------------------------------------

struct LockShard {
    table: Mutex<HashMap<Lsn, LockEntry>>,
    waiters: Condvar,
}

impl LockShard {
    fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            waiters: Condvar::new(),
        }
    }
}

/// The real lock table.
pub struct LockManager {
    shards: Box<[LockShard]>,
    state: Arc<EnvState>,
    metrics: Arc<LockMetrics>,
}

impl LockManager {
    /// Create a table with `shards` shards (rounded up to a power of two).
    #[must_use]
    pub fn new(shards: usize, state: Arc<EnvState>, metrics: Arc<LockMetrics>) -> Self {
        let n = shards.max(1).next_power_of_two();
        Self {
            shards: (0..n).map(|_| LockShard::new()).collect(),
            state,
            metrics,
        }
    }

    #[must_use]
    pub fn metrics(&self) -> &LockMetrics {
        &self.metrics
    }

    #[allow(clippy::cast_possible_truncation)]
    fn shard(&self, lsn: Lsn) -> &LockShard {
        &self.shards[(lsn.get() as usize) & (self.shards.len() - 1)]
    }

    fn granted(promotion: bool, waited: bool) -> LockGrant {
        match (promotion, waited) {
            (false, false) => LockGrant::New,
            (false, true) => LockGrant::WaitNew,
            (true, false) => LockGrant::Promotion,
            (true, true) => LockGrant::WaitPromotion,
        }
    }
}

impl LockService for LockManager {
    fn lock(&self, req: &LockRequest) -> Result<LockGrant> {
        if req.lock_type == LockType::None {
            return Ok(LockGrant::NoneNeeded);
        }
        self.state.check_valid()?;
        self.metrics.requests.fetch_add(1, Ordering::Relaxed);

        let shard = self.shard(req.lsn);
        let mut table = shard.table.lock();
        let entry = table.entry(req.lsn).or_default();

        let mut promotion = false;
        if let Some(held) = entry.owner_type(req.locker) {
            match upgrade_for(held, req.lock_type)? {
                LockUpgrade::Existing => return Ok(LockGrant::Existing),
                LockUpgrade::Promote => {
                    promotion = true;
                    if !entry.blocked(req.locker, req.lock_type) {
                        entry.add_owner(req.locker, req.lock_type);
                        self.metrics.promotions.fetch_add(1, Ordering::Relaxed);
                        trace!(target: "tidelog_txn::lock", lsn = %req.lsn, locker = %req.locker, "promoted");
                        return Ok(LockGrant::Promotion);
                    }
                }
                LockUpgrade::Illegal => {
                    return Err(TideError::internal("illegal lock upgrade"));
                }
            }
        } else if !entry.blocked(req.locker, req.lock_type)
            && (entry.waiters.is_empty() || req.jump_ahead_of_waiters)
        {
            entry.add_owner(req.locker, req.lock_type);
            return Ok(LockGrant::New);
        }

        if req.no_wait || req.timeout.is_zero() {
            let owners = entry.describe_owners();
            if entry.is_empty() {
                table.remove(&req.lsn);
            }
            self.metrics.denials.fetch_add(1, Ordering::Relaxed);
            return Err(TideError::LockNotAvailable {
                lsn: req.lsn.get(),
                locker: req.locker.get(),
                owners,
            });
        }

        let waiter = Waiter {
            locker: req.locker,
            lock_type: req.lock_type,
            promotion,
        };
        if promotion || req.jump_ahead_of_waiters {
            entry.waiters.push_front(waiter);
        } else {
            entry.waiters.push_back(waiter);
        }
        self.metrics.waits.fetch_add(1, Ordering::Relaxed);
        debug!(
            target: "tidelog_txn::lock",
            lsn = %req.lsn,
            locker = %req.locker,
            lock_type = %req.lock_type,
            owners = %entry.describe_owners(),
            "waiting for lock"
        );

        let deadline = Instant::now() + req.timeout;
        loop {
            let timed_out = shard.waiters.wait_until(&mut table, deadline).timed_out();
            let Some(entry) = table.get_mut(&req.lsn) else {
                return Err(TideError::internal(format!(
                    "lock entry for {} vanished while locker {} was queued",
                    req.lsn, req.locker
                )));
            };

            if entry.holds_covering(req.locker, req.lock_type) {
                if promotion {
                    self.metrics.promotions.fetch_add(1, Ordering::Relaxed);
                }
                return Ok(Self::granted(promotion, true));
            }

            let invalid = !self.state.is_valid();
            if !invalid && !timed_out {
                continue;
            }

            entry.remove_waiter(req.locker);
            let regranted = entry.grant_waiters();
            let owners = entry.describe_owners();
            if entry.is_empty() {
                table.remove(&req.lsn);
            }
            drop(table);
            if regranted > 0 {
                shard.waiters.notify_all();
            }

            if invalid {
                self.state.check_valid()?;
            }
            self.metrics.timeouts.fetch_add(1, Ordering::Relaxed);
            debug!(
                target: "tidelog_txn::lock",
                lsn = %req.lsn,
                locker = %req.locker,
                owners = %owners,
                "lock wait timed out"
            );
            #[allow(clippy::cast_possible_truncation)]
            let timeout_ms = req.timeout.as_millis() as u64;
            return Err(TideError::LockTimeout {
                lsn: req.lsn.get(),
                locker: req.locker.get(),
                timeout_ms,
                owners,
            });
        }
    }

    fn release(&self, lsn: Lsn, locker: LockerId) -> bool {
        let shard = self.shard(lsn);
        let mut table = shard.table.lock();
        let Some(entry) = table.get_mut(&lsn) else {
            return false;
        };
        if !entry.remove_owner(locker) {
            return false;
        }
        entry.grant_waiters();
        if entry.is_empty() {
            table.remove(&lsn);
        }
        drop(table);
        shard.waiters.notify_all();
        true
    }

    fn demote(&self, lsn: Lsn, locker: LockerId) -> bool {
        let shard = self.shard(lsn);
        let mut table = shard.table.lock();
        let Some(entry) = table.get_mut(&lsn) else {
            return false;
        };
        if !entry.owner_type(locker).is_some_and(LockType::is_write_lock) {
            return false;
        }
        entry.add_owner(locker, LockType::Read);
        let granted = entry.grant_waiters();
        drop(table);
        if granted > 0 {
            shard.waiters.notify_all();
        }
        true
    }

    fn steal_lock(&self, lsn: Lsn, locker: LockerId, lock_type: LockType) -> Result<Vec<LockOwner>> {
        if lock_type == LockType::None {
            return Err(TideError::internal("cannot steal a NONE lock"));
        }
        let shard = self.shard(lsn);
        let mut table = shard.table.lock();
        let entry = table.entry(lsn).or_default();
        let displaced: Vec<LockOwner> = entry
            .owners
            .iter()
            .filter(|o| o.locker != locker)
            .copied()
            .collect();
        entry.owners.clear();
        entry.owners.push(LockOwner { locker, lock_type });
        entry.remove_waiter(locker);
        drop(table);
        shard.waiters.notify_all();

        self.metrics.steals.fetch_add(1, Ordering::Relaxed);
        debug!(
            target: "tidelog_txn::lock",
            %lsn,
            %locker,
            displaced = displaced.len(),
            "lock stolen"
        );
        Ok(displaced)
    }

    fn is_locked(&self, lsn: Lsn) -> bool {
        self.shard(lsn)
            .table
            .lock()
            .get(&lsn)
            .is_some_and(|e| !e.owners.is_empty())
    }

    fn is_owner(&self, lsn: Lsn, locker: LockerId, lock_type: LockType) -> bool {
        self.shard(lsn)
            .table
            .lock()
            .get(&lsn)
            .is_some_and(|e| e.holds_covering(locker, lock_type))
    }

    fn n_owners(&self, lsn: Lsn) -> usize {
        self.shard(lsn).table.lock().get(&lsn).map_or(0, |e| e.owners.len())
    }

    fn n_waiters(&self, lsn: Lsn) -> usize {
        self.shard(lsn).table.lock().get(&lsn).map_or(0, |e| e.waiters.len())
    }

    fn owners(&self, lsn: Lsn) -> Vec<LockOwner> {
        self.shard(lsn)
            .table
            .lock()
            .get(&lsn)
            .map(|e| e.owners.to_vec())
            .unwrap_or_default()
    }

    fn waiters(&self, lsn: Lsn) -> Vec<LockOwner> {
        self.shard(lsn)
            .table
            .lock()
            .get(&lsn)
            .map(|e| {
                e.waiters
                    .iter()
                    .map(|w| LockOwner {
                        locker: w.locker,
                        lock_type: w.lock_type,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn lock_count(&self) -> usize {
        self.shards.iter().map(|s| s.table.lock().len()).sum()
    }

    fn wake_all(&self) {
        for shard in &self.shards {
            // Taking the mutex orders the wakeup after any waiter's state check.
            let _guard = shard.table.lock();
            shard.waiters.notify_all();
        }
    }
}

impl InvalidationListener for LockManager {
    fn on_invalidate(&self) {
        self.wake_all();
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("shards", &self.shards.len())
            .field("lock_count", &self.lock_count())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// DummyLockManager
// ---------------------------------------------------------------------------

/// Lock service for environments running with locking disabled.
///
/// Requests from ordinary lockers are granted without being recorded. Requests
/// marked `locking_required` (handle and internal locks) are forwarded to the
/// superior table, as are releases and queries.
pub struct DummyLockManager {
    superior: Arc<LockManager>,
}

impl DummyLockManager {
    #[must_use]
    pub const fn new(superior: Arc<LockManager>) -> Self {
        Self { superior }
    }

    #[must_use]
    pub fn superior(&self) -> &Arc<LockManager> {
        &self.superior
    }
}

impl LockService for DummyLockManager {
    fn lock(&self, req: &LockRequest) -> Result<LockGrant> {
        if req.lock_type == LockType::None {
            return Ok(LockGrant::NoneNeeded);
        }
        if req.locking_required {
            return self.superior.lock(req);
        }
        Ok(LockGrant::New)
    }

    fn release(&self, lsn: Lsn, locker: LockerId) -> bool {
        self.superior.release(lsn, locker)
    }

    fn demote(&self, lsn: Lsn, locker: LockerId) -> bool {
        self.superior.demote(lsn, locker)
    }

    fn steal_lock(&self, lsn: Lsn, locker: LockerId, lock_type: LockType) -> Result<Vec<LockOwner>> {
        self.superior.steal_lock(lsn, locker, lock_type)
    }

    fn is_locked(&self, lsn: Lsn) -> bool {
        self.superior.is_locked(lsn)
    }

    fn is_owner(&self, lsn: Lsn, locker: LockerId, lock_type: LockType) -> bool {
        self.superior.is_owner(lsn, locker, lock_type)
    }

    fn n_owners(&self, lsn: Lsn) -> usize {
        self.superior.n_owners(lsn)
    }

    fn n_waiters(&self, lsn: Lsn) -> usize {
        self.superior.n_waiters(lsn)
    }

    fn owners(&self, lsn: Lsn) -> Vec<LockOwner> {
        self.superior.owners(lsn)
    }

    fn waiters(&self, lsn: Lsn) -> Vec<LockOwner> {
        self.superior.waiters(lsn)
    }

    fn lock_count(&self) -> usize {
        self.superior.lock_count()
    }

    fn wake_all(&self) {
        self.superior.wake_all();
    }
}
