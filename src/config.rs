//! Runtime configuration.

use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The cluster tag of this node.
    pub node_tag: String,

    /// The path to the database on disk.
    #[serde(default = "crate::database::default_data_path")]
    pub storage_data_path: String,
    /// The folder used for backups which are not kept in a local destination.
    #[serde(default = "crate::config::default_backup_temp_path")]
    pub backup_temp_path: String,
    /// A mounted folder receiving remote backup uploads, one subfolder per destination kind.
    #[serde(default)]
    pub upload_mount_path: Option<String>,
    /// Start as the leader of a single node cluster.
    #[serde(default = "crate::config::default_true")]
    pub bootstrap_single_node: bool,

    /// The period of the cluster observer's sampling loop.
    #[serde(default = "crate::config::default_supervisor_sample_period_ms")]
    pub supervisor_sample_period_ms: u64,
    /// The wait before the first observation round, also the topology-change grace period.
    #[serde(default = "crate::config::default_stabilization_time_ms")]
    pub stabilization_time_ms: u64,
    /// How long a node may be unresponsive before it is moved to rehab.
    #[serde(default = "crate::config::default_move_to_rehab_grace_time_ms")]
    pub move_to_rehab_grace_time_ms: u64,
    /// How long a preferred node may be unresponsive before it is rotated to the end.
    #[serde(default = "crate::config::default_rotate_preferred_node_grace_time_ms")]
    pub rotate_preferred_node_grace_time_ms: u64,
    /// The maximum etag distance tolerated between two members.
    #[serde(default = "crate::config::default_max_change_vector_distance")]
    pub max_change_vector_distance: i64,
    /// The time after which a node is considered broken for a database.
    #[serde(default = "crate::config::default_add_replica_timeout_ms")]
    pub add_replica_timeout_ms: u64,
    /// Whether deletions issued when replacing nodes are hard deletes.
    #[serde(default = "crate::config::default_true")]
    pub hard_delete_on_replacement: bool,
    /// The interval of the unused auto index sweep.
    #[serde(default = "crate::config::default_index_cleanup_interval_ms")]
    pub index_cleanup_interval_ms: u64,
    /// The interval of the compare exchange tombstone sweep.
    #[serde(default = "crate::config::default_compare_exchange_tombstones_cleanup_interval_ms")]
    pub compare_exchange_tombstones_cleanup_interval_ms: u64,
    /// The interval of the expired compare exchange sweep.
    #[serde(default = "crate::config::default_compare_exchange_expired_cleanup_interval_ms")]
    pub compare_exchange_expired_cleanup_interval_ms: u64,
    /// How long an auto index may go unqueried before it is marked idle.
    #[serde(default = "crate::config::default_auto_index_idle_after_ms")]
    pub auto_index_idle_after_ms: u64,
    /// How long an idle auto index may go unqueried before it is deleted.
    #[serde(default = "crate::config::default_auto_index_delete_after_ms")]
    pub auto_index_delete_after_ms: u64,

    /// The maximum number of backups running concurrently on this node.
    #[serde(default = "crate::config::default_max_concurrent_backups")]
    pub max_concurrent_backups: usize,
    /// The delay before retrying a backup which could not be started.
    #[serde(default = "crate::config::default_backup_retry_delay_ms")]
    pub backup_retry_delay_ms: u64,
    /// The delay before re-checking a backup task while the cluster is unreachable.
    #[serde(default = "crate::config::default_cluster_down_retry_ms")]
    pub cluster_down_retry_ms: u64,
    /// The longest single wait of a backup timer.
    #[serde(default = "crate::config::default_max_timer_timeout_ms")]
    pub max_timer_timeout_ms: u64,
    /// The period at which this node publishes its own status report.
    #[serde(default = "crate::config::default_report_period_ms")]
    pub report_period_ms: u64,
    /// The interval at which document tombstones are purged.
    #[serde(default = "crate::config::default_tombstone_cleanup_interval_ms")]
    pub tombstone_cleanup_interval_ms: u64,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the relationships between config values.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.node_tag.is_empty(), "NODE_TAG must not be empty");
        ensure!(self.supervisor_sample_period_ms > 0, "SUPERVISOR_SAMPLE_PERIOD_MS must be greater than 0");
        ensure!(self.max_concurrent_backups > 0, "MAX_CONCURRENT_BACKUPS must be greater than 0");
        ensure!(self.max_timer_timeout_ms > 0, "MAX_TIMER_TIMEOUT_MS must be greater than 0");
        Ok(())
    }

    pub fn supervisor_sample_period(&self) -> Duration {
        Duration::from_millis(self.supervisor_sample_period_ms)
    }

    pub fn stabilization_time(&self) -> Duration {
        Duration::from_millis(self.stabilization_time_ms)
    }

    pub fn move_to_rehab_grace_time(&self) -> Duration {
        Duration::from_millis(self.move_to_rehab_grace_time_ms)
    }

    pub fn rotate_preferred_node_grace_time(&self) -> Duration {
        Duration::from_millis(self.rotate_preferred_node_grace_time_ms)
    }

    pub fn breakdown_timeout(&self) -> Duration {
        Duration::from_millis(self.add_replica_timeout_ms)
    }

    pub fn index_cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.index_cleanup_interval_ms)
    }

    pub fn compare_exchange_tombstones_cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.compare_exchange_tombstones_cleanup_interval_ms)
    }

    pub fn compare_exchange_expired_cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.compare_exchange_expired_cleanup_interval_ms)
    }

    pub fn auto_index_idle_after(&self) -> Duration {
        Duration::from_millis(self.auto_index_idle_after_ms)
    }

    pub fn auto_index_delete_after(&self) -> Duration {
        Duration::from_millis(self.auto_index_delete_after_ms)
    }

    pub fn backup_retry_delay(&self) -> Duration {
        Duration::from_millis(self.backup_retry_delay_ms)
    }

    pub fn cluster_down_retry(&self) -> Duration {
        Duration::from_millis(self.cluster_down_retry_ms)
    }

    pub fn max_timer_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timer_timeout_ms)
    }

    pub fn report_period(&self) -> Duration {
        Duration::from_millis(self.report_period_ms)
    }

    pub fn tombstone_cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.tombstone_cleanup_interval_ms)
    }

    /// Create a config suitable for tests, rooted in a fresh temp dir.
    #[cfg(test)]
    pub fn new_test() -> Result<(std::sync::Arc<Self>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir in /tmp")?;
        let config = Self {
            rust_log: "error".into(),
            node_tag: "A".into(),
            storage_data_path: tmpdir.path().join("db").to_string_lossy().to_string(),
            backup_temp_path: tmpdir.path().join("backup-temp").to_string_lossy().to_string(),
            upload_mount_path: None,
            bootstrap_single_node: true,
            supervisor_sample_period_ms: 50,
            stabilization_time_ms: 0,
            move_to_rehab_grace_time_ms: default_move_to_rehab_grace_time_ms(),
            rotate_preferred_node_grace_time_ms: default_rotate_preferred_node_grace_time_ms(),
            max_change_vector_distance: default_max_change_vector_distance(),
            add_replica_timeout_ms: default_add_replica_timeout_ms(),
            hard_delete_on_replacement: true,
            index_cleanup_interval_ms: default_index_cleanup_interval_ms(),
            compare_exchange_tombstones_cleanup_interval_ms: default_compare_exchange_tombstones_cleanup_interval_ms(),
            compare_exchange_expired_cleanup_interval_ms: default_compare_exchange_expired_cleanup_interval_ms(),
            auto_index_idle_after_ms: default_auto_index_idle_after_ms(),
            auto_index_delete_after_ms: default_auto_index_delete_after_ms(),
            max_concurrent_backups: default_max_concurrent_backups(),
            backup_retry_delay_ms: 200,
            cluster_down_retry_ms: 200,
            max_timer_timeout_ms: default_max_timer_timeout_ms(),
            report_period_ms: 100,
            tombstone_cleanup_interval_ms: default_tombstone_cleanup_interval_ms(),
        };
        Ok((std::sync::Arc::new(config), tmpdir))
    }
}

//////////////////////////////////////////////////////////////////////////////
// Defaults //////////////////////////////////////////////////////////////////

/// The default folder for temporary backup artifacts.
pub const DEFAULT_BACKUP_TEMP_PATH: &str = "/usr/local/warden/backup-temp";

pub fn default_backup_temp_path() -> String {
    DEFAULT_BACKUP_TEMP_PATH.to_string()
}

pub fn default_true() -> bool {
    true
}

pub fn default_supervisor_sample_period_ms() -> u64 {
    500
}

pub fn default_stabilization_time_ms() -> u64 {
    30_000
}

pub fn default_move_to_rehab_grace_time_ms() -> u64 {
    60_000
}

pub fn default_rotate_preferred_node_grace_time_ms() -> u64 {
    5_000
}

pub fn default_max_change_vector_distance() -> i64 {
    65_536
}

pub fn default_add_replica_timeout_ms() -> u64 {
    15 * 60 * 1000
}

pub fn default_index_cleanup_interval_ms() -> u64 {
    10 * 60 * 1000
}

pub fn default_compare_exchange_tombstones_cleanup_interval_ms() -> u64 {
    10 * 60 * 1000
}

pub fn default_compare_exchange_expired_cleanup_interval_ms() -> u64 {
    60 * 1000
}

pub fn default_auto_index_idle_after_ms() -> u64 {
    30 * 60 * 1000
}

pub fn default_auto_index_delete_after_ms() -> u64 {
    72 * 60 * 60 * 1000
}

pub fn default_max_concurrent_backups() -> usize {
    4
}

pub fn default_backup_retry_delay_ms() -> u64 {
    60_000
}

pub fn default_cluster_down_retry_ms() -> u64 {
    60_000
}

/// The largest wait a single timer arm may use, `2^32 - 2` milliseconds.
pub fn default_max_timer_timeout_ms() -> u64 {
    u32::MAX as u64 - 1
}

pub fn default_report_period_ms() -> u64 {
    1_000
}

pub fn default_tombstone_cleanup_interval_ms() -> u64 {
    5 * 60 * 1000
}
