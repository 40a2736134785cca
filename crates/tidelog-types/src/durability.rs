//! Commit durability: how hard to flush locally and how many replicas must
//! acknowledge.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Local flush policy applied when a commit record is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncPolicy {
    /// Write and fsync before the commit returns.
    Sync,
    /// Write to the OS before the commit returns, without fsync.
    WriteNoSync,
    /// Leave the record in the log buffer.
    NoSync,
}

impl SyncPolicy {
    /// Whether the commit record must reach stable storage before returning.
    #[inline]
    pub const fn requires_fsync(self) -> bool {
        matches!(self, Self::Sync)
    }

    /// Whether the commit record must at least leave the log buffer.
    #[inline]
    pub const fn requires_write(self) -> bool {
        matches!(self, Self::Sync | Self::WriteNoSync)
    }
}

impl fmt::Display for SyncPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sync => "SYNC",
            Self::WriteNoSync => "WRITE_NO_SYNC",
            Self::NoSync => "NO_SYNC",
        })
    }
}

/// How many replicas must acknowledge a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicaAckPolicy {
    All,
    SimpleMajority,
    None,
}

/// Durability requested for (or applied to) a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Durability {
    pub local_sync: SyncPolicy,
    pub replica_sync: SyncPolicy,
    pub replica_ack: ReplicaAckPolicy,
}

impl Durability {
    pub const COMMIT_SYNC: Self =
        Self::new(SyncPolicy::Sync, SyncPolicy::NoSync, ReplicaAckPolicy::SimpleMajority);
    pub const COMMIT_WRITE_NO_SYNC: Self =
        Self::new(SyncPolicy::WriteNoSync, SyncPolicy::NoSync, ReplicaAckPolicy::SimpleMajority);
    pub const COMMIT_NO_SYNC: Self =
        Self::new(SyncPolicy::NoSync, SyncPolicy::NoSync, ReplicaAckPolicy::SimpleMajority);

    #[must_use]
    pub const fn new(
        local_sync: SyncPolicy,
        replica_sync: SyncPolicy,
        replica_ack: ReplicaAckPolicy,
    ) -> Self {
        Self {
            local_sync,
            replica_sync,
            replica_ack,
        }
    }

    /// Same durability with a different local policy.
    #[must_use]
    pub const fn with_local_sync(self, local_sync: SyncPolicy) -> Self {
        Self { local_sync, ..self }
    }
}

impl Default for Durability {
    fn default() -> Self {
        Self::COMMIT_SYNC
    }
}

impl fmt::Display for Durability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{:?}",
            self.local_sync, self.replica_sync, self.replica_ack
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_predicates() {
        assert!(SyncPolicy::Sync.requires_fsync());
        assert!(SyncPolicy::Sync.requires_write());
        assert!(!SyncPolicy::WriteNoSync.requires_fsync());
        assert!(SyncPolicy::WriteNoSync.requires_write());
        assert!(!SyncPolicy::NoSync.requires_write());
    }

    #[test]
    fn weakening_keeps_replica_policy() {
        let weakened = Durability::COMMIT_SYNC.with_local_sync(SyncPolicy::WriteNoSync);
        assert_eq!(weakened.local_sync, SyncPolicy::WriteNoSync);
        assert_eq!(weakened.replica_ack, ReplicaAckPolicy::SimpleMajority);
        assert_eq!(weakened.to_string(), "WRITE_NO_SYNC,NO_SYNC,SimpleMajority");
    }
}
