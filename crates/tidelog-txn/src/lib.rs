//! Transaction commit and record locking core for the tidelog write-ahead log.
//!
//! Lockers take record locks through the environment's [`LockService`];
//! transactions log changes through a [`LogManager`], commit or roll back in
//! fixed stages with replication [`TxnHooks`], and share fsyncs through the
//! active [`GroupCommit`] strategy owned by the [`TxnManager`].

pub mod ack;
pub mod config;
pub mod env;
pub mod group_commit;
pub mod hooks;
pub mod lock_manager;
pub mod lock_type;
pub mod locker;
pub mod memory;
pub mod metrics;
pub mod txn;
pub mod txn_manager;

pub use ack::AckLatch;
pub use config::{EnvConfig, MasterGroupCommitConfig, ReplicaGroupCommitConfig, TxnConfig};
pub use env::{
    DatabaseOp, DeletedSlot, EnvState, Environment, InvalidationListener, LogManager, LogParams,
    ObsoleteCounting, RecordStore, UndoRecord,
};
pub use group_commit::{
    AckTxn, AckTxnSource, GroupCommit, MasterGroupCommit, ReplicaAckQueue, ReplicaGroupCommit,
};
pub use hooks::{MasterNode, MasterTxnHooks, NoopHooks, ReplicaTxnHooks, TxnHooks};
pub use lock_manager::{
    DummyLockManager, LockGrant, LockManager, LockOwner, LockRequest, LockService,
};
pub use lock_type::{LockConflict, LockType, LockUpgrade, conflict, upgrade, upgrade_for};
pub use locker::{BasicLocker, Locker};
pub use memory::{MemoryLogManager, MemoryRecordStore};
pub use metrics::{
    GroupCommitMetrics, GroupCommitMetricsSnapshot, LockMetrics, LockMetricsSnapshot, TxnMetrics,
    TxnMetricsSnapshot,
};
pub use txn::{Change, Txn, TxnState, WriteLockInfo};
pub use txn_manager::{ActiveTxn, TxnManager};
