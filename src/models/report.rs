//! Node and database status reports gathered by the maintenance supervisor.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The outcome of the last attempt to collect a node's report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportStatus {
    WaitingForResponse,
    Timeout,
    OutOfCredits,
    EarlyOutOfMemory,
    HighDirtyMemory,
    Error,
    Ok,
}

/// The state of a database instance on a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatabaseStatus {
    None,
    Loaded,
    Loading,
    Faulted,
    Unloaded,
    Shutdown,
    NoChange,
}

impl DatabaseStatus {
    /// Statuses which count as a living instance.
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Loaded | Self::Unloaded | Self::NoChange)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexState {
    Normal,
    Disabled,
    Idle,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexType {
    Map,
    MapReduce,
    AutoMap,
    AutoMapReduce,
}

/// The name prefix of side-by-side replacement indexes.
pub const SIDE_BY_SIDE_INDEX_PREFIX: &str = "ReplacementOf/";
/// The name prefix of auto indexes.
pub const AUTO_INDEX_PREFIX: &str = "Auto/";
/// The `last_indexed_etag` reported by a faulty index.
pub const FAULTY_INDEX_ETAG: i64 = -1;

/// A single index as observed on a node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObservedIndexStatus {
    pub is_stale: bool,
    pub state: IndexState,
    pub index_type: IndexType,
    pub last_indexed_etag: i64,
    /// Time elapsed since the index was last queried.
    #[serde(default)]
    pub last_queried: Option<Duration>,
    #[serde(default)]
    pub is_side_by_side: bool,
    #[serde(default)]
    pub last_indexed_compare_exchange_reference_tombstone_etag: Option<i64>,
}

/// A node's view of one database.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatabaseStatusReport {
    pub name: String,
    pub node_name: String,
    pub status: DatabaseStatus,
    #[serde(default)]
    pub error: Option<String>,
    pub last_etag: i64,
    #[serde(default)]
    pub last_tombstone_etag: i64,
    #[serde(default)]
    pub database_change_vector: Option<String>,
    #[serde(default)]
    pub number_of_documents: i64,
    #[serde(default)]
    pub last_completed_cluster_transaction: i64,
    /// How long the database instance has been loaded; `None` when it is not loaded.
    #[serde(default)]
    pub up_time: Option<Duration>,
    /// The last etag replicated to each peer, keyed by peer tag.
    #[serde(default)]
    pub last_sent_etag: HashMap<String, i64>,
    #[serde(default)]
    pub last_index_stats: HashMap<String, ObservedIndexStatus>,
}

impl DatabaseStatusReport {
    pub fn new(name: impl Into<String>, node: impl Into<String>, status: DatabaseStatus) -> Self {
        Self {
            name: name.into(),
            node_name: node.into(),
            status,
            error: None,
            last_etag: 0,
            last_tombstone_etag: 0,
            database_change_vector: None,
            number_of_documents: 0,
            last_completed_cluster_transaction: 0,
            up_time: None,
            last_sent_etag: HashMap::new(),
            last_index_stats: HashMap::new(),
        }
    }
}

/// Server-level resource signals carried alongside each node report.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerReport {
    #[serde(default)]
    pub out_of_cpu_credits: bool,
    #[serde(default)]
    pub early_out_of_memory: bool,
    #[serde(default)]
    pub high_dirty_memory: bool,
}

/// Everything the leader knows about one node as of the latest sampling round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterNodeStatusReport {
    pub report: HashMap<String, DatabaseStatusReport>,
    pub status: ReportStatus,
    #[serde(default)]
    pub error: Option<String>,
    pub update_date_time: DateTime<Utc>,
    /// `None` when the node never delivered a good report.
    #[serde(default)]
    pub last_successful_update_date_time: Option<DateTime<Utc>>,
    /// The last time each database was seen in a healthy state on this node.
    #[serde(default)]
    pub last_good_database_status: HashMap<String, DateTime<Utc>>,
    #[serde(default)]
    pub server_report: ServerReport,
}

impl ClusterNodeStatusReport {
    /// Build a successful report at the given time.
    pub fn ok(report: HashMap<String, DatabaseStatusReport>, now: DateTime<Utc>) -> Self {
        let last_good_database_status = report
            .iter()
            .filter(|(_, db)| db.status.is_healthy())
            .map(|(name, _)| (name.clone(), now))
            .collect();
        Self {
            report,
            status: ReportStatus::Ok,
            error: None,
            update_date_time: now,
            last_successful_update_date_time: Some(now),
            last_good_database_status,
            server_report: ServerReport::default(),
        }
    }

    /// Build a failed report which carries forward the last good data of `previous`.
    pub fn failed(status: ReportStatus, error: Option<String>, previous: Option<&ClusterNodeStatusReport>, now: DateTime<Utc>) -> Self {
        Self {
            report: previous.map(|p| p.report.clone()).unwrap_or_default(),
            status,
            error,
            update_date_time: now,
            last_successful_update_date_time: previous.and_then(|p| p.last_successful_update_date_time),
            last_good_database_status: previous.map(|p| p.last_good_database_status.clone()).unwrap_or_default(),
            server_report: previous.map(|p| p.server_report.clone()).unwrap_or_default(),
        }
    }
}
