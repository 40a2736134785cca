use std::sync::Arc;

use thiserror::Error;

/// Primary error type for tidelog transaction and locking operations.
///
/// Variants are grouped by the recovery contract the caller has to honour
/// (see [`ErrorClass`]). Identifiers are carried as raw integers so this crate
/// stays at the bottom of the dependency graph.
#[derive(Error, Debug)]
pub enum TideError {
    // === Lock Errors ===
    /// A blocking lock request waited out its timeout.
    #[error(
        "lock timeout on lsn {lsn} after {timeout_ms}ms: locker {locker} blocked by owners [{owners}]"
    )]
    LockTimeout {
        lsn: u64,
        locker: i64,
        timeout_ms: u64,
        owners: String,
    },

    /// A no-wait lock request found a conflicting owner.
    #[error("lock not available on lsn {lsn} for locker {locker}: held by [{owners}]")]
    LockNotAvailable {
        lsn: u64,
        locker: i64,
        owners: String,
    },

    /// A lock held by this locker was stolen by an internal recovery operation.
    #[error("lock on lsn {lsn} held by locker {locker} was preempted")]
    LockPreempted { lsn: u64, locker: i64 },

    // === Transaction Errors ===
    /// Commit or abort was attempted while cursors are still open.
    #[error("transaction {txn_id} has {count} open cursor(s)")]
    OpenCursors { txn_id: i64, count: u32 },

    /// The requested operation is not legal in the transaction's current state.
    #[error("transaction {txn_id} is {state}: cannot {operation}")]
    IllegalTxnState {
        txn_id: i64,
        state: &'static str,
        operation: &'static str,
    },

    /// The transaction was flagged abort-only; carries the original cause.
    #[error("transaction {txn_id} must be aborted: {cause}")]
    MustAbort {
        txn_id: i64,
        #[source]
        cause: Arc<TideError>,
    },

    /// Nested (parent/child) transactions are not supported.
    #[error("nested transactions are not supported")]
    NestedTransaction,

    // === Replication Errors ===
    /// This node is not currently the functioning primary.
    #[error("not the functioning primary: {detail}")]
    NotPrimary { detail: String },

    /// The current primary is not known to this node.
    #[error("unknown primary: {detail}")]
    UnknownPrimary { detail: String },

    /// A commit did not receive the acknowledgments its durability required.
    #[error("transaction {txn_id} received {received} of {required} acks within {timeout_ms}ms")]
    InsufficientAcks {
        txn_id: i64,
        required: u32,
        received: u32,
        timeout_ms: u64,
    },

    // === Log Errors ===
    /// File I/O error surfaced by the log layer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The log manager could not append or flush a record.
    #[error("log write failed: {detail}")]
    LogWrite { detail: String },

    /// A log record could not be read back or decoded.
    #[error("malformed log record: {detail}")]
    MalformedRecord { detail: String },

    // === Environment Errors ===
    /// The environment has been invalidated and must be reopened.
    #[error("environment failure ({reason}): {detail}")]
    EnvironmentFailure {
        reason: EnvFailureReason,
        detail: String,
    },

    /// An operation was attempted after the environment was invalidated.
    #[error("environment is invalid: {detail}")]
    EnvironmentInvalid { detail: String },

    /// The environment is shutting down.
    #[error("environment is shutting down")]
    ShuttingDown,

    // === Internal Errors ===
    /// Internal invariant breach (should never happen).
    #[error("internal error: {0}")]
    Internal(String),

    /// Operation is not supported by the current configuration.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

/// Why an environment was invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvFailureReason {
    /// Neither a commit nor an abort record could be written.
    LogWrite,
    /// Undo of an aborted transaction failed.
    UndoFailed,
    /// An internal invariant was violated.
    UnexpectedState,
    /// A replication acknowledgment could not be queued.
    AckQueueShutdown,
    /// The environment was shut down explicitly.
    Shutdown,
}

impl std::fmt::Display for EnvFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::LogWrite => "LOG_WRITE",
            Self::UndoFailed => "UNDO_FAILED",
            Self::UnexpectedState => "UNEXPECTED_STATE",
            Self::AckQueueShutdown => "ACK_QUEUE_SHUTDOWN",
            Self::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

/// Recovery contract attached to each error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Surfaced synchronously; the transaction is usually still abortable.
    CallerRecoverable,
    /// The transaction is abort-only; every operation but abort re-raises.
    MustAbort,
    /// The environment is (or must become) unusable.
    Fatal,
    /// Normal cluster-role churn; propagated without invalidating anything.
    ReplicationExpected,
}

impl TideError {
    /// Map this error to its recovery contract.
    #[allow(clippy::match_same_arms)]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::LockTimeout { .. }
            | Self::LockNotAvailable { .. }
            | Self::LockPreempted { .. }
            | Self::OpenCursors { .. }
            | Self::IllegalTxnState { .. }
            | Self::NestedTransaction
            | Self::Unsupported(_)
            | Self::LogWrite { .. }
            | Self::Io(_) => ErrorClass::CallerRecoverable,
            Self::MustAbort { .. } => ErrorClass::MustAbort,
            Self::NotPrimary { .. } | Self::UnknownPrimary { .. } | Self::InsufficientAcks { .. } => {
                ErrorClass::ReplicationExpected
            }
            Self::MalformedRecord { .. }
            | Self::EnvironmentFailure { .. }
            | Self::EnvironmentInvalid { .. }
            | Self::ShuttingDown
            | Self::Internal(_) => ErrorClass::Fatal,
        }
    }

    /// Whether this is a transient error that may succeed on retry of the
    /// whole transaction.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. } | Self::LockNotAvailable { .. } | Self::LockPreempted { .. }
        )
    }

    /// Whether this error means the environment can no longer be used.
    pub const fn invalidates_environment(&self) -> bool {
        matches!(self.class(), ErrorClass::Fatal)
    }

    /// Whether a failure raised after the commit record was logged should be
    /// held back until locks are released and the transaction is unregistered.
    pub const fn is_deferred_after_commit(&self) -> bool {
        matches!(self.class(), ErrorClass::ReplicationExpected)
    }

    /// Human-friendly suggestion for handling this error.
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::LockTimeout { .. } | Self::LockNotAvailable { .. } | Self::LockPreempted { .. } => {
                Some("Abort the transaction and retry it")
            }
            Self::OpenCursors { .. } => Some("Close all cursors before ending the transaction"),
            Self::MustAbort { .. } => Some("Abort the transaction; it cannot be committed"),
            Self::NotPrimary { .. } | Self::UnknownPrimary { .. } => {
                Some("Retry against the current primary once the group has elected one")
            }
            Self::InsufficientAcks { .. } => {
                Some("The commit is durable locally; check replica connectivity")
            }
            Self::EnvironmentFailure { .. } | Self::EnvironmentInvalid { .. } => {
                Some("Close and reopen the environment")
            }
            _ => None,
        }
    }

    /// The root cause when this error wraps a must-abort cause.
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::MustAbort { cause, .. } => cause.root_cause(),
            other => other,
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an unsupported-operation error.
    pub fn unsupported(what: impl Into<String>) -> Self {
        Self::Unsupported(what.into())
    }

    /// Create a log-write error.
    pub fn log_write(detail: impl Into<String>) -> Self {
        Self::LogWrite {
            detail: detail.into(),
        }
    }

    /// Create a malformed-record error.
    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::MalformedRecord {
            detail: detail.into(),
        }
    }

    /// Wrap `cause` as the abort-only reason of transaction `txn_id`.
    pub fn must_abort(txn_id: i64, cause: Arc<Self>) -> Self {
        Self::MustAbort { txn_id, cause }
    }
}

/// Result type alias using `TideError`.
pub type Result<T> = std::result::Result<T, TideError>;
