//! Environment state and the collaborators the transaction core drives.
//!
//! The log manager and the record store are external services consumed through
//! [`LogManager`] and [`RecordStore`]. [`Environment`] bundles them with the
//! configuration, the lock service and the validity flag every blocking wait
//! observes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tidelog_error::{EnvFailureReason, Result, TideError};
use tidelog_types::{DatabaseId, LogEntry, Lsn, SyncPolicy, TxnId};
use tracing::{debug, error};

use crate::config::EnvConfig;
use crate::lock_manager::{DummyLockManager, LockManager, LockService};
use crate::metrics::LockMetrics;

// ---------------------------------------------------------------------------
// Log manager
// ---------------------------------------------------------------------------

/// How an obsolete version should be counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObsoleteCounting {
    /// The version is counted once and only once.
    Exact,
    /// The version may already have been counted (rollback paths).
    DupAllowed,
}

/// Parameters for one append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogParams {
    pub sync: SyncPolicy,
    /// Versions made obsolete by this record, deduplicated by position.
    pub obsolete: Vec<Lsn>,
}

impl LogParams {
    #[must_use]
    pub const fn new(sync: SyncPolicy) -> Self {
        Self {
            sync,
            obsolete: Vec::new(),
        }
    }
}

/// Write-ahead log.
pub trait LogManager: Send + Sync {
    /// Append `entry`, flushing per `params.sync`, and return its position.
    fn log(&self, entry: LogEntry, params: &LogParams) -> Result<Lsn>;

    /// Read back a previously appended entry.
    fn read_entry(&self, lsn: Lsn) -> Result<LogEntry>;

    /// Flush everything buffered and fsync. Returns the highest durable
    /// position, `None` if nothing was ever written.
    fn flush_sync(&self) -> Result<Option<Lsn>>;

    /// Record that the version at `lsn` no longer needs to be kept.
    fn count_obsolete_node(&self, lsn: Lsn, counting: ObsoleteCounting);
}

// ---------------------------------------------------------------------------
// Record store
// ---------------------------------------------------------------------------

/// Restore instruction for one slot during rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoRecord {
    pub txn_id: TxnId,
    /// The data record being undone.
    pub lsn: Lsn,
    pub db: DatabaseId,
    pub key: Vec<u8>,
    /// Version to restore; `None` means the slot did not exist.
    pub abort_lsn: Option<Lsn>,
    pub abort_known_deleted: bool,
}

impl UndoRecord {
    /// Whether undo leaves the slot empty.
    #[must_use]
    pub const fn restores_absence(&self) -> bool {
        self.abort_lsn.is_none() || self.abort_known_deleted
    }
}

/// Structural database change performed inside a transaction, finished
/// (or rolled back) when the transaction ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseOp {
    Remove { db: DatabaseId },
    Truncate { db: DatabaseId },
    Rename { db: DatabaseId, new_name: String },
}

/// A committed deletion whose slot can be reclaimed in the background.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeletedSlot {
    pub db: DatabaseId,
    pub key: Vec<u8>,
    pub lsn: Lsn,
}

/// Record storage layer.
pub trait RecordStore: Send + Sync {
    /// Put a slot back to the state described by `record`.
    fn undo(&self, record: &UndoRecord) -> Result<()>;

    /// Complete (`committed`) or roll back database operations.
    fn finish_database_ops(&self, ops: &[DatabaseOp], committed: bool) -> Result<()>;

    /// Hand committed deletions to background reclamation.
    fn queue_deleted_slots(&self, slots: Vec<DeletedSlot>);
}

// ---------------------------------------------------------------------------
// Environment state
// ---------------------------------------------------------------------------

/// Woken when the environment is invalidated so blocked threads notice.
pub trait InvalidationListener: Send + Sync {
    fn on_invalidate(&self);
}

#[derive(Debug, Clone)]
struct FirstFailure {
    reason: EnvFailureReason,
    detail: String,
}

/// Validity flag shared by everything that can block.
#[derive(Default)]
pub struct EnvState {
    invalid: AtomicBool,
    first_failure: Mutex<Option<FirstFailure>>,
    listeners: Mutex<Vec<Weak<dyn InvalidationListener>>>,
}

impl EnvState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        !self.invalid.load(Ordering::Acquire)
    }

    /// `Ok` while valid, otherwise an error naming the first failure.
    pub fn check_valid(&self) -> Result<()> {
        if self.is_valid() {
            return Ok(());
        }
        let detail = self.first_failure.lock().as_ref().map_or_else(
            || "invalidated".to_owned(),
            |f| format!("{}: {}", f.reason, f.detail),
        );
        Err(TideError::EnvironmentInvalid { detail })
    }

    /// Mark the environment unusable and wake every listener.
    ///
    /// Only the first cause is remembered; the returned error always describes
    /// this call.
    pub fn invalidate(&self, reason: EnvFailureReason, detail: impl Into<String>) -> TideError {
        let detail = detail.into();
        {
            let mut first = self.first_failure.lock();
            if first.is_none() {
                error!(
                    target: "tidelog_txn::env",
                    %reason,
                    detail = %detail,
                    "environment invalidated"
                );
                *first = Some(FirstFailure {
                    reason,
                    detail: detail.clone(),
                });
            } else {
                debug!(
                    target: "tidelog_txn::env",
                    %reason,
                    detail = %detail,
                    "environment already invalid"
                );
            }
            self.invalid.store(true, Ordering::Release);
        }

        let listeners: Vec<Arc<dyn InvalidationListener>> = {
            let mut list = self.listeners.lock();
            list.retain(|l| l.strong_count() > 0);
            list.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in listeners {
            listener.on_invalidate();
        }

        TideError::EnvironmentFailure { reason, detail }
    }

    /// Register a listener; dropped listeners are pruned lazily.
    pub fn add_listener(&self, listener: Weak<dyn InvalidationListener>) {
        self.listeners.lock().push(listener);
    }
}

impl std::fmt::Debug for EnvState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvState")
            .field("valid", &self.is_valid())
            .field("listeners", &self.listeners.lock().len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// One storage environment as seen by the transaction core.
pub struct Environment {
    config: EnvConfig,
    state: Arc<EnvState>,
    log: Arc<dyn LogManager>,
    store: Arc<dyn RecordStore>,
    locks: Arc<dyn LockService>,
    lock_metrics: Arc<LockMetrics>,
}

impl Environment {
    /// Build an environment around the given collaborators.
    ///
    /// With locking disabled, the lock service is a [`DummyLockManager`]
    /// chained to a real table for lockers that still require locks.
    pub fn new(
        config: EnvConfig,
        log: Arc<dyn LogManager>,
        store: Arc<dyn RecordStore>,
    ) -> Arc<Self> {
        let config = config.validated();
        let state = Arc::new(EnvState::new());
        let lock_metrics = Arc::new(LockMetrics::new());
        let table = Arc::new(LockManager::new(
            config.lock_table_shards,
            Arc::clone(&state),
            Arc::clone(&lock_metrics),
        ));
        let weak: Weak<LockManager> = Arc::downgrade(&table);
        state.add_listener(weak);

        let locks: Arc<dyn LockService> = if config.locking_enabled {
            table
        } else {
            Arc::new(DummyLockManager::new(table))
        };

        debug!(
            target: "tidelog_txn::env",
            locking_enabled = config.locking_enabled,
            shards = config.lock_table_shards,
            "environment opened"
        );

        Arc::new(Self {
            config,
            state,
            log,
            store,
            locks,
            lock_metrics,
        })
    }

    #[must_use]
    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> &Arc<EnvState> {
        &self.state
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.state.is_valid()
    }

    pub fn check_valid(&self) -> Result<()> {
        self.state.check_valid()
    }

    pub fn invalidate(&self, reason: EnvFailureReason, detail: impl Into<String>) -> TideError {
        self.state.invalidate(reason, detail)
    }

    #[must_use]
    pub fn log(&self) -> &dyn LogManager {
        self.log.as_ref()
    }

    #[must_use]
    pub fn store(&self) -> &dyn RecordStore {
        self.store.as_ref()
    }

    #[must_use]
    pub fn locks(&self) -> &dyn LockService {
        self.locks.as_ref()
    }

    #[must_use]
    pub fn lock_metrics(&self) -> &LockMetrics {
        &self.lock_metrics
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("config", &self.config)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
