//! Environment, transaction and group-commit configuration.
//!
//! Every struct is `serde`-friendly with `#[serde(default)]` so a host can embed
//! only the fields it cares about. Durations are integer milli/microseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tidelog_types::Durability;

/// Largest lock table fan-out accepted by [`EnvConfig::validated`].
pub const MAX_LOCK_TABLE_SHARDS: usize = 4096;
/// Largest batch either group-commit flavour will accumulate.
pub const MAX_GROUP_SIZE: usize = 1 << 16;

// ---------------------------------------------------------------------------
// Group commit
// ---------------------------------------------------------------------------

/// Leader-election group commit used on the primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterGroupCommitConfig {
    /// Pending acknowledgments that force an immediate flush. 0 disables.
    pub max_group_size: usize,
    /// How long a leader waits before flushing on its own. 0 disables.
    pub interval_us: u64,
    /// Bound on a wait for another thread's in-flight fsync.
    pub fsync_timeout_ms: u64,
}

impl Default for MasterGroupCommitConfig {
    fn default() -> Self {
        Self {
            max_group_size: 0,
            interval_us: 0,
            fsync_timeout_ms: 500,
        }
    }
}

impl MasterGroupCommitConfig {
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.max_group_size > 0 && self.interval_us > 0
    }

    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_micros(self.interval_us)
    }

    #[must_use]
    pub const fn fsync_timeout(&self) -> Duration {
        Duration::from_millis(self.fsync_timeout_ms)
    }

    /// Clamp to usable values.
    #[must_use]
    pub fn validated(self) -> Self {
        Self {
            max_group_size: self.max_group_size.min(MAX_GROUP_SIZE),
            interval_us: self.interval_us,
            fsync_timeout_ms: self.fsync_timeout_ms.max(1),
        }
    }
}

/// Fixed-window group commit used while applying the replication stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaGroupCommitConfig {
    /// Capacity of the pending acknowledgment array. 0 disables.
    pub max_group_size: usize,
    /// Window opened by the first buffered acknowledgment. 0 disables.
    pub interval_us: u64,
}

impl ReplicaGroupCommitConfig {
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.max_group_size > 0 && self.interval_us > 0
    }

    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_micros(self.interval_us)
    }

    #[must_use]
    pub fn validated(self) -> Self {
        Self {
            max_group_size: self.max_group_size.min(MAX_GROUP_SIZE),
            interval_us: self.interval_us,
        }
    }
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// Environment-wide settings for the transaction core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    /// When false, application lockers share a no-op lock manager; only
    /// lockers that require locking reach the real table.
    pub locking_enabled: bool,
    /// Default bound on a blocking lock wait. 0 means never wait.
    pub lock_timeout_ms: u64,
    /// Lock table shard count, rounded up to a power of two.
    pub lock_table_shards: usize,
    /// Durability of a commit that does not ask for one.
    pub default_durability: Durability,
    /// Magnitude of the first replicated transaction id.
    pub replicated_txn_id_offset: i64,
    /// How long a primary commit waits for its required acknowledgments.
    pub ack_timeout_ms: u64,
    pub master_group_commit: MasterGroupCommitConfig,
    pub replica_group_commit: ReplicaGroupCommitConfig,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            locking_enabled: true,
            lock_timeout_ms: 500,
            lock_table_shards: 64,
            default_durability: Durability::COMMIT_SYNC,
            replicated_txn_id_offset: 0,
            ack_timeout_ms: 5_000,
            master_group_commit: MasterGroupCommitConfig::default(),
            replica_group_commit: ReplicaGroupCommitConfig::default(),
        }
    }
}

impl EnvConfig {
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    #[must_use]
    pub const fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Clamp to usable values.
    #[must_use]
    pub fn validated(self) -> Self {
        Self {
            lock_table_shards: self
                .lock_table_shards
                .clamp(1, MAX_LOCK_TABLE_SHARDS)
                .next_power_of_two(),
            replicated_txn_id_offset: self.replicated_txn_id_offset.saturating_abs(),
            master_group_commit: self.master_group_commit.validated(),
            replica_group_commit: self.replica_group_commit.validated(),
            ..self
        }
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// Per-transaction settings; unset fields fall back to [`EnvConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TxnConfig {
    pub durability: Option<Durability>,
    pub lock_timeout_ms: Option<u64>,
    /// Refuse rather than wait on every lock conflict.
    pub no_wait: bool,
    /// A single-operation transaction ended by `operation_end`.
    pub auto_commit: bool,
}

impl TxnConfig {
    #[must_use]
    pub const fn auto_commit() -> Self {
        Self {
            durability: None,
            lock_timeout_ms: None,
            no_wait: false,
            auto_commit: true,
        }
    }

    #[must_use]
    pub const fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = Some(durability);
        self
    }

    #[must_use]
    pub const fn with_lock_timeout_ms(mut self, ms: u64) -> Self {
        self.lock_timeout_ms = Some(ms);
        self
    }

    #[must_use]
    pub const fn with_no_wait(mut self, no_wait: bool) -> Self {
        self.no_wait = no_wait;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidelog_types::SyncPolicy;

    #[test]
    fn group_commit_disabled_by_default() {
        let cfg = EnvConfig::default();
        assert!(!cfg.master_group_commit.is_enabled());
        assert!(!cfg.replica_group_commit.is_enabled());
    }

    #[test]
    fn zero_interval_disables() {
        let cfg = MasterGroupCommitConfig {
            max_group_size: 8,
            interval_us: 0,
            fsync_timeout_ms: 10,
        };
        assert!(!cfg.is_enabled());
        let replica = ReplicaGroupCommitConfig {
            max_group_size: 0,
            interval_us: 100,
        };
        assert!(!replica.is_enabled());
    }

    #[test]
    fn validated_rounds_shards_and_clamps() {
        let cfg = EnvConfig {
            lock_table_shards: 0,
            replicated_txn_id_offset: -100,
            master_group_commit: MasterGroupCommitConfig {
                max_group_size: usize::MAX,
                interval_us: 10,
                fsync_timeout_ms: 0,
            },
            ..EnvConfig::default()
        }
        .validated();
        assert_eq!(cfg.lock_table_shards, 1);
        assert_eq!(cfg.replicated_txn_id_offset, 100);
        assert_eq!(cfg.master_group_commit.max_group_size, MAX_GROUP_SIZE);
        assert_eq!(cfg.master_group_commit.fsync_timeout_ms, 1);

        let cfg = EnvConfig {
            lock_table_shards: 50,
            ..EnvConfig::default()
        }
        .validated();
        assert_eq!(cfg.lock_table_shards, 64);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: EnvConfig = serde_json::from_str(
            r#"{"lock_timeout_ms": 25, "master_group_commit": {"max_group_size": 4, "interval_us": 2000}}"#,
        )
        .unwrap();
        assert_eq!(cfg.lock_timeout(), Duration::from_millis(25));
        assert!(cfg.locking_enabled);
        assert!(cfg.master_group_commit.is_enabled());
        assert_eq!(cfg.master_group_commit.fsync_timeout_ms, 500);
        assert_eq!(cfg.default_durability.local_sync, SyncPolicy::Sync);
    }

    #[test]
    fn config_json_reads_back() {
        let cfg = EnvConfig {
            locking_enabled: false,
            replica_group_commit: ReplicaGroupCommitConfig {
                max_group_size: 3,
                interval_us: 750,
            },
            ..EnvConfig::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: EnvConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn txn_config_builders() {
        let cfg = TxnConfig::auto_commit()
            .with_lock_timeout_ms(0)
            .with_no_wait(true)
            .with_durability(Durability::COMMIT_NO_SYNC);
        assert!(cfg.auto_commit);
        assert!(cfg.no_wait);
        assert_eq!(cfg.lock_timeout_ms, Some(0));
        assert_eq!(cfg.durability, Some(Durability::COMMIT_NO_SYNC));
    }
}
