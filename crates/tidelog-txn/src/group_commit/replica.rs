//! Replica-side group commit.
//!
//! The replication apply path is single threaded, so the pending window only
//! needs a mutex to guard against a concurrent shutdown flush. Acknowledgments
//! leave in exactly the order their commits were buffered.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use parking_lot::Mutex;
use tidelog_error::{EnvFailureReason, Result};
use tidelog_types::{SyncPolicy, TxnId};
use tracing::{debug, warn};

use super::ReplicaAckQueue;
use crate::config::ReplicaGroupCommitConfig;
use crate::env::Environment;
use crate::metrics::GroupCommitMetrics;

#[derive(Debug, Default)]
struct PendingWindow {
    ids: Vec<TxnId>,
    /// Set by the first entry of a group.
    deadline: Option<Instant>,
}

/// Fixed-window group commit for the replay side.
pub struct ReplicaGroupCommit {
    config: ReplicaGroupCommitConfig,
    env: Arc<Environment>,
    apply: Arc<dyn ReplicaAckQueue>,
    metrics: GroupCommitMetrics,
    window: Mutex<PendingWindow>,
}

impl ReplicaGroupCommit {
    #[must_use]
    pub fn new(
        config: ReplicaGroupCommitConfig,
        env: Arc<Environment>,
        apply: Arc<dyn ReplicaAckQueue>,
    ) -> Self {
        let config = config.validated();
        Self {
            window: Mutex::new(PendingWindow {
                ids: Vec::with_capacity(config.max_group_size),
                deadline: None,
            }),
            config,
            env,
            apply,
            metrics: GroupCommitMetrics::new(),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &ReplicaGroupCommitConfig {
        &self.config
    }

    #[must_use]
    pub const fn metrics(&self) -> &GroupCommitMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.window.lock().ids.len()
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.window.lock().deadline
    }

    /// Whether the acknowledgment for a commit with `sync` may be sent right
    /// away instead of going through the window.
    #[must_use]
    pub fn queue_ack(&self, sync: SyncPolicy) -> bool {
        !(sync == SyncPolicy::Sync || self.pending() > 0)
    }

    /// Add `txn_id` to the window. The first entry opens the window; later
    /// entries try to drain it.
    ///
    /// The window never holds more than `max_group_size` ids. A full window
    /// left behind by a failed fsync is flushed before the new id goes in,
    /// and the id is rejected if that flush fails again.
    pub fn buffer_commit(&self, now: Instant, txn_id: TxnId) -> Result<()> {
        let first = loop {
            {
                let mut window = self.window.lock();
                if window.ids.len() < self.config.max_group_size {
                    window.ids.push(txn_id);
                    if window.ids.len() == 1 {
                        window.deadline = Some(now + self.config.interval());
                        break true;
                    }
                    break false;
                }
            }
            self.flush_pending_acks(now)?;
        };
        if first && self.config.max_group_size > 1 {
            return Ok(());
        }
        self.flush_pending_acks(now)
    }

    /// Flush and acknowledge the window if it is full or its deadline has
    /// passed; otherwise do nothing.
    pub fn flush_pending_acks(&self, now: Instant) -> Result<()> {
        let mut window = self.window.lock();
        let full = window.ids.len() >= self.config.max_group_size;
        let expired = window.deadline.is_some_and(|d| now >= d);
        if window.ids.is_empty() || !(full || expired) {
            return Ok(());
        }

        let span = tracing::info_span!(
            target: "tidelog_txn::group_commit",
            "replica_group_flush",
            pending = window.ids.len(),
        );
        let _guard = span.enter();

        if let Err(err) = self.env.log().flush_sync() {
            self.metrics.flush_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                target: "tidelog_txn::group_commit",
                error = %err,
                pending = window.ids.len(),
                "replica group fsync failed"
            );
            return Err(err);
        }

        let ids = std::mem::take(&mut window.ids);
        window.deadline = None;
        for txn_id in &ids {
            if !self.apply.queue_ack(*txn_id) {
                return Err(self.env.invalidate(
                    EnvFailureReason::AckQueueShutdown,
                    format!("ack for txn {txn_id} dropped with {} pending", ids.len()),
                ));
            }
        }

        let covered = ids.len() as u64;
        if full {
            self.metrics.size_triggered.fetch_add(1, Ordering::Relaxed);
        } else {
            self.metrics.timeout_triggered.fetch_add(1, Ordering::Relaxed);
        }
        self.metrics.record_group_commit(covered);
        window.ids = ids;
        window.ids.clear();
        debug!(target: "tidelog_txn::group_commit", covered, full, "replica acks queued");
        Ok(())
    }
}

impl std::fmt::Debug for ReplicaGroupCommit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaGroupCommit")
            .field("config", &self.config)
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}
