//! Store configuration
//!
//! Plain knobs are serde-deserializable so they can come from a
//! configuration file; runtime-only options (loader filters) are skipped
//! during (de)serialization and set programmatically.

use crate::types::ShardId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Predicate deciding whether a database should be loaded.
pub type DatabaseFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Predicate deciding whether a retention policy should be loaded.
pub type RetentionPolicyFilter = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Predicate deciding whether a shard should be loaded.
pub type ShardFilter = Arc<dyn Fn(&str, &str, ShardId) -> bool + Send + Sync>;

/// Configuration for a [`Store`](crate::store::Store).
#[derive(Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding write-ahead logs, laid out as
    /// `<wal_dir>/<database>/<rp>/<shard_id>`.
    pub wal_dir: PathBuf,

    /// Maximum number of compactions running at once across all shards.
    /// Zero means max(1, cores / 2), capped at the core count.
    #[serde(default)]
    pub max_concurrent_compactions: usize,

    /// Compaction throughput limit in bytes per second. Zero means
    /// unlimited.
    #[serde(default)]
    pub compact_throughput: u64,

    /// Burst allowance for the compaction throughput limit, in bytes.
    /// Raised to `compact_throughput` when set lower.
    #[serde(default)]
    pub compact_throughput_burst: u64,

    /// Disable the background loop that frees idle shard resources.
    #[serde(default)]
    pub monitor_disabled: bool,

    /// Open shards with compactions disabled.
    #[serde(default)]
    pub compactions_disabled: bool,

    /// Maximum concurrent snapshot compactions inside each database's
    /// series file.
    #[serde(default = "default_series_file_compactions")]
    pub series_file_max_compaction_concurrency: usize,

    /// Restrict loading to databases matching this predicate.
    #[serde(skip)]
    pub database_filter: Option<DatabaseFilter>,

    /// Restrict loading to retention policies matching this predicate.
    #[serde(skip)]
    pub retention_policy_filter: Option<RetentionPolicyFilter>,

    /// Restrict loading to shards matching this predicate.
    #[serde(skip)]
    pub shard_filter: Option<ShardFilter>,
}

fn default_series_file_compactions() -> usize {
    1
}

impl StoreConfig {
    /// Configuration with the WAL directory rooted at `wal_dir` and every
    /// other knob at its default.
    pub fn new(wal_dir: impl Into<PathBuf>) -> Self {
        Self {
            wal_dir: wal_dir.into(),
            max_concurrent_compactions: 0,
            compact_throughput: 0,
            compact_throughput_burst: 0,
            monitor_disabled: false,
            compactions_disabled: false,
            series_file_max_compaction_concurrency: default_series_file_compactions(),
            database_filter: None,
            retention_policy_filter: None,
            shard_filter: None,
        }
    }

    /// Resolved compaction limit: max(1, cores / 2) when unset, never more
    /// than the core count.
    pub fn compaction_limit(&self) -> usize {
        let cores = num_cpus::get();
        let mut lim = self.max_concurrent_compactions;
        if lim == 0 {
            lim = (cores / 2).max(1);
        }
        lim.min(cores)
    }

    /// Resolved throughput burst: never below the sustained rate.
    pub fn throughput_burst(&self) -> u64 {
        self.compact_throughput_burst.max(self.compact_throughput)
    }
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("wal_dir", &self.wal_dir)
            .field("max_concurrent_compactions", &self.max_concurrent_compactions)
            .field("compact_throughput", &self.compact_throughput)
            .field("compact_throughput_burst", &self.compact_throughput_burst)
            .field("monitor_disabled", &self.monitor_disabled)
            .field("compactions_disabled", &self.compactions_disabled)
            .field(
                "series_file_max_compaction_concurrency",
                &self.series_file_max_compaction_concurrency,
            )
            .field("database_filter", &self.database_filter.is_some())
            .field(
                "retention_policy_filter",
                &self.retention_policy_filter.is_some(),
            )
            .field("shard_filter", &self.shard_filter.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compaction_limit_defaults_to_half_cores() {
        let cfg = StoreConfig::new("/tmp/wal");
        let cores = num_cpus::get();
        assert_eq!(cfg.compaction_limit(), (cores / 2).max(1).min(cores));
    }

    #[test]
    fn compaction_limit_capped_at_cores() {
        let mut cfg = StoreConfig::new("/tmp/wal");
        cfg.max_concurrent_compactions = 10_000;
        assert_eq!(cfg.compaction_limit(), num_cpus::get());
    }

    #[test]
    fn burst_never_below_rate() {
        let mut cfg = StoreConfig::new("/tmp/wal");
        cfg.compact_throughput = 1024;
        cfg.compact_throughput_burst = 16;
        assert_eq!(cfg.throughput_burst(), 1024);
    }
}
