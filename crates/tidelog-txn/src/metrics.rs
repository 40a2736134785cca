//! Transaction-core statistics.
//!
//! Atomic counters owned by one environment (lock table, transaction manager)
//! or one group-commit instance. Thread-safe and lock-free; read them through
//! `snapshot()` and clear them with `reset()`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

// ---------------------------------------------------------------------------
// Lock metrics
// ---------------------------------------------------------------------------

/// Counters for the record lock table.
#[derive(Debug)]
pub struct LockMetrics {
    /// Lock requests that reached the lock table (NONE requests excluded).
    pub requests: AtomicU64,
    /// Requests that had to queue behind a conflicting owner.
    pub waits: AtomicU64,
    /// Queued requests that gave up after their timeout.
    pub timeouts: AtomicU64,
    /// No-wait (or zero-timeout) requests refused on conflict.
    pub denials: AtomicU64,
    /// READ owners promoted to a write lock.
    pub promotions: AtomicU64,
    /// Ownership reassignments by lock stealing.
    pub steals: AtomicU64,
}

impl LockMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            waits: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            denials: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
            steals: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> LockMetricsSnapshot {
        LockMetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            denials: self.denials.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            steals: self.steals.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.requests.store(0, Ordering::Relaxed);
        self.waits.store(0, Ordering::Relaxed);
        self.timeouts.store(0, Ordering::Relaxed);
        self.denials.store(0, Ordering::Relaxed);
        self.promotions.store(0, Ordering::Relaxed);
        self.steals.store(0, Ordering::Relaxed);
    }
}

impl Default for LockMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`LockMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct LockMetricsSnapshot {
    pub requests: u64,
    pub waits: u64,
    pub timeouts: u64,
    pub denials: u64,
    pub promotions: u64,
    pub steals: u64,
}

impl fmt::Display for LockMetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lock_requests={} lock_waits={} lock_timeouts={} lock_denials={} \
             lock_promotions={} lock_steals={}",
            self.requests, self.waits, self.timeouts, self.denials, self.promotions, self.steals,
        )
    }
}

// ---------------------------------------------------------------------------
// Transaction metrics
// ---------------------------------------------------------------------------

/// Counters for the transaction manager.
#[derive(Debug)]
pub struct TxnMetrics {
    pub begins: AtomicU64,
    pub commits: AtomicU64,
    pub aborts: AtomicU64,
    /// Commits of transactions that logged nothing (no record written).
    pub elided_commits: AtomicU64,
    /// Abort records that could not be written.
    pub abort_record_failures: AtomicU64,
}

impl TxnMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            begins: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            aborts: AtomicU64::new(0),
            elided_commits: AtomicU64::new(0),
            abort_record_failures: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> TxnMetricsSnapshot {
        TxnMetricsSnapshot {
            begins: self.begins.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
            elided_commits: self.elided_commits.load(Ordering::Relaxed),
            abort_record_failures: self.abort_record_failures.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.begins.store(0, Ordering::Relaxed);
        self.commits.store(0, Ordering::Relaxed);
        self.aborts.store(0, Ordering::Relaxed);
        self.elided_commits.store(0, Ordering::Relaxed);
        self.abort_record_failures.store(0, Ordering::Relaxed);
    }
}

impl Default for TxnMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`TxnMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct TxnMetricsSnapshot {
    pub begins: u64,
    pub commits: u64,
    pub aborts: u64,
    pub elided_commits: u64,
    pub abort_record_failures: u64,
}

impl TxnMetricsSnapshot {
    /// Transactions begun but not yet ended.
    #[must_use]
    pub const fn active(&self) -> u64 {
        self.begins.saturating_sub(self.commits + self.aborts)
    }
}

impl fmt::Display for TxnMetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "txn_begins={} txn_commits={} txn_aborts={} txn_elided_commits={} \
             txn_abort_record_failures={}",
            self.begins,
            self.commits,
            self.aborts,
            self.elided_commits,
            self.abort_record_failures,
        )
    }
}

// ---------------------------------------------------------------------------
// Group commit metrics
// ---------------------------------------------------------------------------

/// Counters for one group-commit instance (master or replica side).
#[derive(Debug)]
pub struct GroupCommitMetrics {
    /// Physical flushes that acknowledged a batch.
    pub group_commits: AtomicU64,
    /// Transactions acknowledged by those flushes.
    pub txns_covered: AtomicU64,
    /// Flushes started because the interval elapsed.
    pub timeout_triggered: AtomicU64,
    /// Flushes started because the batch reached its maximum size.
    pub size_triggered: AtomicU64,
    /// Flushes whose fsync failed.
    pub flush_failures: AtomicU64,
}

impl GroupCommitMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            group_commits: AtomicU64::new(0),
            txns_covered: AtomicU64::new(0),
            timeout_triggered: AtomicU64::new(0),
            size_triggered: AtomicU64::new(0),
            flush_failures: AtomicU64::new(0),
        }
    }

    /// Record a completed group flush covering `txns` transactions.
    pub fn record_group_commit(&self, txns: u64) {
        self.group_commits.fetch_add(1, Ordering::Relaxed);
        self.txns_covered.fetch_add(txns, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> GroupCommitMetricsSnapshot {
        GroupCommitMetricsSnapshot {
            group_commits: self.group_commits.load(Ordering::Relaxed),
            txns_covered: self.txns_covered.load(Ordering::Relaxed),
            timeout_triggered: self.timeout_triggered.load(Ordering::Relaxed),
            size_triggered: self.size_triggered.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.group_commits.store(0, Ordering::Relaxed);
        self.txns_covered.store(0, Ordering::Relaxed);
        self.timeout_triggered.store(0, Ordering::Relaxed);
        self.size_triggered.store(0, Ordering::Relaxed);
        self.flush_failures.store(0, Ordering::Relaxed);
    }
}

impl Default for GroupCommitMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`GroupCommitMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct GroupCommitMetricsSnapshot {
    pub group_commits: u64,
    pub txns_covered: u64,
    pub timeout_triggered: u64,
    pub size_triggered: u64,
    pub flush_failures: u64,
}

impl GroupCommitMetricsSnapshot {
    /// Mean batch size, or 0.0 before the first flush.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn avg_group_size(&self) -> f64 {
        if self.group_commits == 0 {
            0.0
        } else {
            self.txns_covered as f64 / self.group_commits as f64
        }
    }
}

impl fmt::Display for GroupCommitMetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "group_commits={} txns_covered={} timeout_triggered={} size_triggered={} \
             flush_failures={}",
            self.group_commits,
            self.txns_covered,
            self.timeout_triggered,
            self.size_triggered,
            self.flush_failures,
        )
    }
}
