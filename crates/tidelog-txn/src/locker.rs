//! Lock owners.
//!
//! A [`Locker`] is anything that can own record locks: transactions, and the
//! non-transactional [`BasicLocker`] used for handle and internal locks whose
//! lifetime is a single operation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tidelog_error::Result;
use tidelog_types::{DatabaseId, LockerId, Lsn};
use tracing::trace;

use crate::env::Environment;
use crate::lock_manager::{LockGrant, LockRequest};
use crate::lock_type::LockType;

/// Common surface of every lock owner.
pub trait Locker: Send + Sync {
    fn id(&self) -> LockerId;

    /// Whether this locker must take real locks even when the environment
    /// runs with locking disabled.
    fn locking_required(&self) -> bool;

    /// Acquire `lock_type` on `lsn` for this locker.
    fn lock(
        &self,
        lsn: Lsn,
        lock_type: LockType,
        no_wait: bool,
        db: Option<DatabaseId>,
    ) -> Result<LockGrant>;

    /// Release one lock early. Returns whether it was held.
    fn release_lock(&self, lsn: Lsn) -> bool;

    /// Mode this locker holds `lsn` in, as recorded by the locker itself.
    fn held_lock(&self, lsn: Lsn) -> Option<LockType>;

    /// End of one user operation.
    fn operation_end(&self, ok: bool) -> Result<()>;
}

/// Keep the stronger of two held modes.
pub(crate) fn stronger(a: LockType, b: LockType) -> LockType {
    if a.covers(b) { a } else { b }
}

/// Non-transactional locker: locks live until [`Locker::operation_end`] (or
/// drop).
pub struct BasicLocker {
    id: LockerId,
    env: Arc<Environment>,
    timeout: Duration,
    locking_required: bool,
    held: Mutex<HashMap<Lsn, LockType>>,
}

impl BasicLocker {
    /// `locking_required` lockers reach the real lock table even when locking
    /// is disabled.
    #[must_use]
    pub fn new(id: LockerId, env: Arc<Environment>, locking_required: bool) -> Self {
        let timeout = env.config().lock_timeout();
        Self {
            id,
            env,
            timeout,
            locking_required,
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Number of locks currently held.
    #[must_use]
    pub fn n_locks(&self) -> usize {
        self.held.lock().len()
    }

    fn release_all(&self) {
        let held: Vec<Lsn> = self.held.lock().drain().map(|(lsn, _)| lsn).collect();
        if held.is_empty() {
            return;
        }
        for lsn in &held {
            self.env.locks().release(*lsn, self.id);
        }
        trace!(target: "tidelog_txn::lock", locker = %self.id, released = held.len(), "basic locker released");
    }
}

impl Locker for BasicLocker {
    fn id(&self) -> LockerId {
        self.id
    }

    fn locking_required(&self) -> bool {
        self.locking_required
    }

    fn lock(
        &self,
        lsn: Lsn,
        lock_type: LockType,
        no_wait: bool,
        db: Option<DatabaseId>,
    ) -> Result<LockGrant> {
        let mut req = LockRequest::new(lsn, self.id, lock_type, self.timeout)
            .no_wait(no_wait)
            .required(self.locking_required);
        req.database = db;
        let grant = self.env.locks().lock(&req)?;
        if grant.is_held() {
            let mut held = self.held.lock();
            let entry = held.entry(lsn).or_insert(lock_type);
            *entry = stronger(*entry, lock_type);
        }
        Ok(grant)
    }

    fn release_lock(&self, lsn: Lsn) -> bool {
        if self.held.lock().remove(&lsn).is_none() {
            return false;
        }
        self.env.locks().release(lsn, self.id);
        true
    }

    fn held_lock(&self, lsn: Lsn) -> Option<LockType> {
        self.held.lock().get(&lsn).copied()
    }

    fn operation_end(&self, _ok: bool) -> Result<()> {
        self.release_all();
        Ok(())
    }
}

impl Drop for BasicLocker {
    fn drop(&mut self) {
        self.release_all();
    }
}

impl std::fmt::Debug for BasicLocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicLocker")
            .field("id", &self.id)
            .field("locking_required", &self.locking_required)
            .field("n_locks", &self.n_locks())
            .finish()
    }
}
