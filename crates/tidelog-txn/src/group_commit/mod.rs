//! Group commit: one fsync covering many transactions' commit records.
//!
//! Exactly one strategy is active per environment, chosen by replication role:
//! [`MasterGroupCommit`] on the primary (leader election with size and time
//! triggers) and [`ReplicaGroupCommit`] while applying the replication stream
//! (fixed window). The transaction manager swaps them on role changes.

mod master;
mod replica;

pub use master::MasterGroupCommit;
pub use replica::ReplicaGroupCommit;

use std::sync::Arc;
use std::time::Instant;

use tidelog_error::Result;
use tidelog_types::TxnId;

use crate::metrics::GroupCommitMetrics;

/// A transaction as seen by the acknowledgment machinery.
pub trait AckTxn: Send + Sync {
    fn ack_txn_id(&self) -> TxnId;

    /// One more required acknowledgment is satisfied.
    fn countdown_ack(&self);

    /// The transaction was frozen by a role transition.
    fn is_frozen(&self) -> bool;
}

/// Looks up live transactions awaiting acknowledgment.
pub trait AckTxnSource: Send + Sync {
    fn get_ack_txn(&self, id: TxnId) -> Option<Arc<dyn AckTxn>>;
}

/// Replication apply layer: sends a commit acknowledgment to the primary.
pub trait ReplicaAckQueue: Send + Sync {
    /// Queue the acknowledgment for `id`. False means the apply layer is
    /// shutting down.
    fn queue_ack(&self, id: TxnId) -> bool;
}

/// The active group-commit strategy.
pub enum GroupCommit {
    Master(Arc<MasterGroupCommit>),
    Replica(ReplicaGroupCommit),
}

impl GroupCommit {
    #[must_use]
    pub const fn role(&self) -> &'static str {
        match self {
            Self::Master(_) => "master",
            Self::Replica(_) => "replica",
        }
    }

    #[must_use]
    pub fn metrics(&self) -> &GroupCommitMetrics {
        match self {
            Self::Master(m) => m.metrics(),
            Self::Replica(r) => r.metrics(),
        }
    }

    #[must_use]
    pub fn as_master(&self) -> Option<&Arc<MasterGroupCommit>> {
        match self {
            Self::Master(m) => Some(m),
            Self::Replica(_) => None,
        }
    }

    #[must_use]
    pub fn as_replica(&self) -> Option<&ReplicaGroupCommit> {
        match self {
            Self::Master(_) => None,
            Self::Replica(r) => Some(r),
        }
    }

    /// Number of acknowledgments waiting for a flush.
    #[must_use]
    pub fn pending(&self) -> usize {
        match self {
            Self::Master(m) => m.pending(),
            Self::Replica(r) => r.pending(),
        }
    }

    /// Run the variant's flush step. The master flushes whatever is pending
    /// unless an fsync is already in flight; the replica honours its window.
    pub fn flush_pending_acks(&self, now: Instant) -> Result<()> {
        match self {
            Self::Master(m) => m.try_flush(now),
            Self::Replica(r) => r.flush_pending_acks(now),
        }
    }
}

impl std::fmt::Debug for GroupCommit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupCommit")
            .field("role", &self.role())
            .field("pending", &self.pending())
            .finish()
    }
}
