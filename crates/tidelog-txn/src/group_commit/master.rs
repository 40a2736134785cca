//! Primary-side group commit.
//!
//! Committing threads whose commit record was written without fsync call
//! [`MasterGroupCommit::buffer_commit`]. One of them becomes leader and sleeps
//! for the configured interval before flushing; any thread that finds the
//! pending queue at its size limit flushes immediately. A single
//! compare-and-set on the in-progress flag decides who actually flushes, and
//! every flush acknowledges all pending transactions its fsync covered.
//!
//! Lock order: `pending` and `round` are never held together.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tidelog_error::Result;
use tidelog_types::{Lsn, TxnId};
use tracing::{debug, trace, warn};

use super::{AckTxn, AckTxnSource};
use crate::config::MasterGroupCommitConfig;
use crate::env::{Environment, InvalidationListener};
use crate::metrics::GroupCommitMetrics;

const NO_LEADER: i64 = 0;

#[derive(Debug, Clone, Copy)]
struct PendingAck {
    txn_id: TxnId,
    commit_lsn: Lsn,
}

/// Leader-election group commit for the primary.
pub struct MasterGroupCommit {
    config: MasterGroupCommitConfig,
    env: Arc<Environment>,
    acks: Weak<dyn AckTxnSource>,
    metrics: GroupCommitMetrics,
    fsync_in_progress: AtomicBool,
    /// Id of the leader transaction, [`NO_LEADER`] when the slot is free.
    leader: AtomicI64,
    /// Highest log position known durable.
    max_durable: AtomicU64,
    pending: Mutex<VecDeque<PendingAck>>,
    /// Flush epoch; bumped when a flush starts so a sleeping leader wakes.
    round: Mutex<u64>,
    leader_wake: Condvar,
    fsync_done: Condvar,
}

impl MasterGroupCommit {
    /// Create the group commit and register it for invalidation wakeups.
    pub fn new(
        config: MasterGroupCommitConfig,
        env: Arc<Environment>,
        acks: Weak<dyn AckTxnSource>,
    ) -> Arc<Self> {
        let gc = Arc::new(Self {
            config: config.validated(),
            env,
            acks,
            metrics: GroupCommitMetrics::new(),
            fsync_in_progress: AtomicBool::new(false),
            leader: AtomicI64::new(NO_LEADER),
            max_durable: AtomicU64::new(0),
            pending: Mutex::new(VecDeque::new()),
            round: Mutex::new(0),
            leader_wake: Condvar::new(),
            fsync_done: Condvar::new(),
        });
        let weak: Weak<Self> = Arc::downgrade(&gc);
        gc.env.state().add_listener(weak);
        gc
    }

    #[must_use]
    pub const fn config(&self) -> &MasterGroupCommitConfig {
        &self.config
    }

    #[must_use]
    pub const fn metrics(&self) -> &GroupCommitMetrics {
        &self.metrics
    }

    /// Acknowledgments waiting for a flush.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    #[must_use]
    pub fn max_durable_lsn(&self) -> Option<Lsn> {
        Lsn::new(self.max_durable.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_fsync_in_progress(&self) -> bool {
        self.fsync_in_progress.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn leader(&self) -> Option<TxnId> {
        TxnId::new(self.leader.load(Ordering::Acquire))
    }

    fn is_covered(&self, lsn: Lsn) -> bool {
        self.max_durable.load(Ordering::Acquire) >= lsn.get()
    }

    /// Make `txn`'s commit at `commit_lsn` durable, sharing the fsync with
    /// concurrent committers.
    ///
    /// Returns once the commit is covered (and acknowledged) or another flush
    /// is guaranteed to cover it.
    pub fn buffer_commit(&self, now: Instant, txn: &dyn AckTxn, commit_lsn: Lsn) -> Result<()> {
        let txn_id = txn.ack_txn_id();
        let mut now = now;
        let mut enqueued = false;

        loop {
            if self.is_covered(commit_lsn) {
                // A flush that drained our entry already counted it down.
                if !enqueued || self.remove_pending(txn_id) {
                    txn.countdown_ack();
                }
                return Ok(());
            }

            if !enqueued {
                self.pending.lock().push_back(PendingAck { txn_id, commit_lsn });
                enqueued = true;
            }

            if self.is_fsync_in_progress() {
                self.wait_for_fsync();
                if !self.env.is_valid() {
                    self.remove_pending(txn_id);
                    return self.env.check_valid();
                }
                if txn.is_frozen() {
                    self.remove_pending(txn_id);
                    debug!(target: "tidelog_txn::group_commit", %txn_id, "frozen while waiting for fsync");
                    return Ok(());
                }
                now = Instant::now();
                continue;
            }

            if self.try_claim_leader(txn_id) {
                self.lead(now, txn_id, commit_lsn)?;
                now = Instant::now();
                continue;
            }

            if self.pending() >= self.config.max_group_size {
                if self.begin_flush() {
                    self.metrics.size_triggered.fetch_add(1, Ordering::Relaxed);
                    self.flush_pending_acks(now)?;
                }
                continue;
            }

            trace!(target: "tidelog_txn::group_commit", %txn_id, lsn = %commit_lsn, "buffered behind leader");
            return Ok(());
        }
    }

    /// Flush now unless another thread already is.
    pub fn try_flush(&self, now: Instant) -> Result<()> {
        if self.pending() == 0 || !self.begin_flush() {
            return Ok(());
        }
        self.flush_pending_acks(now)
    }

    fn try_claim_leader(&self, txn_id: TxnId) -> bool {
        self.leader
            .compare_exchange(NO_LEADER, txn_id.get(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release_leader(&self, txn_id: TxnId) {
        let _ = self.leader.compare_exchange(
            txn_id.get(),
            NO_LEADER,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn begin_flush(&self) -> bool {
        self.fsync_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn remove_pending(&self, txn_id: TxnId) -> bool {
        let mut pending = self.pending.lock();
        match pending.iter().position(|p| p.txn_id == txn_id) {
            Some(idx) => {
                pending.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Sleep as leader until the interval elapses or another flush starts,
    /// then flush if the commit is still uncovered.
    fn lead(&self, now: Instant, txn_id: TxnId, commit_lsn: Lsn) -> Result<()> {
        let deadline = now + self.config.interval();
        trace!(target: "tidelog_txn::group_commit", %txn_id, "became leader");
        {
            let mut round = self.round.lock();
            let start = *round;
            while *round == start && self.env.is_valid() && !self.is_covered(commit_lsn) {
                if self.leader_wake.wait_until(&mut round, deadline).timed_out() {
                    break;
                }
            }
        }

        let result = if !self.env.is_valid() {
            self.env.check_valid()
        } else if !self.is_covered(commit_lsn) && self.begin_flush() {
            self.metrics.timeout_triggered.fetch_add(1, Ordering::Relaxed);
            self.flush_pending_acks(Instant::now())
        } else {
            Ok(())
        };
        self.release_leader(txn_id);
        result
    }

    fn wait_for_fsync(&self) {
        let deadline = Instant::now() + self.config.fsync_timeout();
        let mut round = self.round.lock();
        while self.is_fsync_in_progress() && self.env.is_valid() {
            if self.fsync_done.wait_until(&mut round, deadline).timed_out() {
                debug!(target: "tidelog_txn::group_commit", "fsync wait timed out");
                break;
            }
        }
    }

    /// Flush and fsync, then acknowledge every pending commit now durable.
    ///
    /// The caller must have won `begin_flush`. On failure the queue is kept and
    /// waiters are released so they can observe the error.
    fn flush_pending_acks(&self, now: Instant) -> Result<()> {
        let pending = self.pending();
        let span = tracing::info_span!(
            target: "tidelog_txn::group_commit",
            "master_group_flush",
            pending,
        );
        let _guard = span.enter();

        {
            let mut round = self.round.lock();
            *round += 1;
            self.leader_wake.notify_all();
        }

        let durable = match self.env.log().flush_sync() {
            Ok(durable) => durable,
            Err(err) => {
                self.leader.store(NO_LEADER, Ordering::Release);
                self.metrics.flush_failures.fetch_add(1, Ordering::Relaxed);
                self.finish_flush();
                warn!(
                    target: "tidelog_txn::group_commit",
                    error = %err,
                    pending,
                    "group fsync failed"
                );
                return Err(err);
            }
        };

        if let Some(lsn) = durable {
            self.max_durable.fetch_max(lsn.get(), Ordering::AcqRel);
        }
        self.leader.store(NO_LEADER, Ordering::Release);

        let max_durable = self.max_durable.load(Ordering::Acquire);
        let mut covered = Vec::new();
        self.pending.lock().retain(|p| {
            if p.commit_lsn.get() <= max_durable {
                covered.push(p.txn_id);
                false
            } else {
                true
            }
        });

        if let Some(source) = self.acks.upgrade() {
            for txn_id in &covered {
                if let Some(txn) = source.get_ack_txn(*txn_id) {
                    txn.countdown_ack();
                }
            }
        }
        self.metrics.record_group_commit(covered.len() as u64);
        self.finish_flush();

        debug!(
            target: "tidelog_txn::group_commit",
            covered = covered.len(),
            max_durable,
            elapsed_us = u64::try_from(now.elapsed().as_micros()).unwrap_or(u64::MAX),
            "group flush complete"
        );
        Ok(())
    }

    fn finish_flush(&self) {
        self.fsync_in_progress.store(false, Ordering::Release);
        let _round = self.round.lock();
        self.fsync_done.notify_all();
    }
}

impl InvalidationListener for MasterGroupCommit {
    fn on_invalidate(&self) {
        let _round = self.round.lock();
        self.leader_wake.notify_all();
        self.fsync_done.notify_all();
    }
}

impl std::fmt::Debug for MasterGroupCommit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterGroupCommit")
            .field("config", &self.config)
            .field("pending", &self.pending())
            .field("fsync_in_progress", &self.is_fsync_in_progress())
            .field("leader", &self.leader())
            .field("max_durable", &self.max_durable_lsn())
            .finish_non_exhaustive()
    }
}
