//! Extension points a transaction calls at fixed commit/abort stages.
//!
//! Plain local transactions use [`NoopHooks`]. Replicated environments inject
//! [`MasterTxnHooks`] (write-accepting primary) or [`ReplicaTxnHooks`]
//! (transactions replayed from the replication stream).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tidelog_error::{EnvFailureReason, Result, TideError};
use tidelog_types::{Durability, Lsn, MasterTerm, ReplicaAckPolicy, SyncPolicy, TxnEnd, Vlsn};
use tracing::debug;

use crate::group_commit::{AckTxn, ReplicaAckQueue};
use crate::txn::Txn;

/// Stage hooks. Every method defaults to doing nothing.
pub trait TxnHooks: Send + Sync {
    /// Before the commit record is written. May weaken `durability` or veto
    /// the commit.
    fn pre_log_commit(&self, _txn: &Txn, _durability: &mut Durability) -> Result<()> {
        Ok(())
    }

    /// After the commit record was appended (`None` when the commit wrote no
    /// record).
    fn post_log_commit(&self, _txn: &Txn, _commit_lsn: Option<Lsn>) -> Result<()> {
        Ok(())
    }

    /// `post_log_commit` failed and the transaction is about to be aborted.
    fn post_log_commit_abort(&self, _txn: &Txn) {}

    fn pre_log_abort(&self, _txn: &Txn) -> Result<()> {
        Ok(())
    }

    fn post_log_abort(&self, _txn: &Txn) -> Result<()> {
        Ok(())
    }

    /// Fill replication metadata into an end record before it is logged.
    fn fill_end_record(&self, _txn: &Txn, _end: &mut TxnEnd) {}
}

/// Hooks of a non-replicated transaction.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl TxnHooks for NoopHooks {}

// ---------------------------------------------------------------------------
// Primary
// ---------------------------------------------------------------------------

/// The replication node as seen by a committing primary transaction.
pub trait MasterNode: Send + Sync {
    fn node_id(&self) -> i32;

    fn master_term(&self) -> MasterTerm;

    /// Durable-VLSN watermark to stamp into end records.
    fn dtvlsn(&self) -> Vlsn;

    /// Fails with `NotPrimary`/`UnknownPrimary` when this node may not
    /// accept writes.
    fn check_primary(&self) -> Result<()>;

    /// Replica acknowledgments `policy` requires right now.
    fn replica_acks_required(&self, policy: ReplicaAckPolicy) -> u32;
}

/// Commit hooks of a transaction on the primary.
///
/// A SYNC commit is enrolled in the master group commit: the record is written
/// without fsync and the transaction waits for the group flush to count down
/// its local acknowledgment, together with any replica acknowledgments.
pub struct MasterTxnHooks {
    node: Arc<dyn MasterNode>,
    ack_timeout: Duration,
}

impl MasterTxnHooks {
    #[must_use]
    pub fn new(node: Arc<dyn MasterNode>, ack_timeout: Duration) -> Self {
        Self { node, ack_timeout }
    }

    /// Flush and acknowledge locally when the group commit went away between
    /// enrollment and the commit record.
    fn flush_alone(txn: &Txn) -> Result<()> {
        txn.env().log().flush_sync()?;
        txn.countdown_ack();
        Ok(())
    }
}

impl TxnHooks for MasterTxnHooks {
    fn pre_log_commit(&self, txn: &Txn, durability: &mut Durability) -> Result<()> {
        self.node.check_primary()?;
        let mut required = self.node.replica_acks_required(durability.replica_ack);
        let group = txn.manager().get_group_commit();
        let enrolled = durability.local_sync == SyncPolicy::Sync
            && group.as_ref().is_some_and(|g| g.as_master().is_some());
        if enrolled {
            durability.local_sync = SyncPolicy::WriteNoSync;
            txn.set_group_committed(true);
            required += 1;
        }
        txn.ack_latch().arm(required);
        Ok(())
    }

    fn post_log_commit(&self, txn: &Txn, commit_lsn: Option<Lsn>) -> Result<()> {
        let Some(commit_lsn) = commit_lsn else {
            return Ok(());
        };
        if txn.is_group_committed() {
            let group = txn.manager().get_group_commit();
            match group.as_ref().and_then(|g| g.as_master()) {
                Some(master) => master.buffer_commit(Instant::now(), txn, commit_lsn)?,
                None => Self::flush_alone(txn)?,
            }
        }

        let latch = txn.ack_latch();
        if latch.wait(self.ack_timeout) {
            return Ok(());
        }
        let required = latch.required();
        Err(TideError::InsufficientAcks {
            txn_id: txn.id().get(),
            required,
            received: required.saturating_sub(latch.remaining()),
            timeout_ms: u64::try_from(self.ack_timeout.as_millis()).unwrap_or(u64::MAX),
        })
    }

    fn fill_end_record(&self, _txn: &Txn, end: &mut TxnEnd) {
        end.master_id = self.node.node_id();
        end.master_term = self.node.master_term();
        end.dtvlsn = self.node.dtvlsn();
    }
}

impl std::fmt::Debug for MasterTxnHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterTxnHooks")
            .field("node_id", &self.node.node_id())
            .field("ack_timeout", &self.ack_timeout)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Replica
// ---------------------------------------------------------------------------

/// Commit hooks of a transaction replayed from the replication stream.
///
/// When the primary asked for an acknowledgment, the ack is either queued
/// straight away or routed through the replica group commit so it leaves only
/// after the group fsync, in buffering order.
pub struct ReplicaTxnHooks {
    apply: Arc<dyn ReplicaAckQueue>,
    needs_ack: bool,
    master_id: i32,
    master_term: MasterTerm,
    dtvlsn: Vlsn,
    enrolled: AtomicBool,
}

impl ReplicaTxnHooks {
    /// End records of the replayed transaction carry the primary's metadata.
    #[must_use]
    pub fn new(
        apply: Arc<dyn ReplicaAckQueue>,
        needs_ack: bool,
        master_id: i32,
        master_term: MasterTerm,
        dtvlsn: Vlsn,
    ) -> Self {
        Self {
            apply,
            needs_ack,
            master_id,
            master_term,
            dtvlsn,
            enrolled: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn is_enrolled(&self) -> bool {
        self.enrolled.load(Ordering::Acquire)
    }

    fn queue_now(&self, txn: &Txn) -> Result<()> {
        if self.apply.queue_ack(txn.id()) {
            return Ok(());
        }
        Err(txn.env().invalidate(
            EnvFailureReason::AckQueueShutdown,
            format!("ack for replayed txn {} dropped", txn.id()),
        ))
    }
}

impl TxnHooks for ReplicaTxnHooks {
    fn pre_log_commit(&self, txn: &Txn, durability: &mut Durability) -> Result<()> {
        if !self.needs_ack {
            return Ok(());
        }
        let group = txn.manager().get_group_commit();
        let Some(replica) = group.as_ref().and_then(|g| g.as_replica()) else {
            return Ok(());
        };
        if replica.queue_ack(durability.local_sync) {
            return Ok(());
        }
        self.enrolled.store(true, Ordering::Release);
        txn.set_group_committed(true);
        if durability.local_sync == SyncPolicy::Sync {
            durability.local_sync = SyncPolicy::WriteNoSync;
        }
        debug!(target: "tidelog_txn::txn", txn_id = %txn.id(), "replica ack deferred to group commit");
        Ok(())
    }

    fn post_log_commit(&self, txn: &Txn, _commit_lsn: Option<Lsn>) -> Result<()> {
        if !self.needs_ack {
            return Ok(());
        }
        if !self.is_enrolled() {
            return self.queue_now(txn);
        }
        let group = txn.manager().get_group_commit();
        match group.as_ref().and_then(|g| g.as_replica()) {
            Some(replica) => replica.buffer_commit(Instant::now(), txn.id()),
            None => {
                txn.env().log().flush_sync()?;
                self.queue_now(txn)
            }
        }
    }

    fn fill_end_record(&self, _txn: &Txn, end: &mut TxnEnd) {
        end.master_id = self.master_id;
        end.master_term = self.master_term;
        end.dtvlsn = self.dtvlsn;
    }
}

impl std::fmt::Debug for ReplicaTxnHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaTxnHooks")
            .field("needs_ack", &self.needs_ack)
            .field("master_id", &self.master_id)
            .field("enrolled", &self.is_enrolled())
            .finish_non_exhaustive()
    }
}
