//! Commands submitted to the consensus log.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::backup::PeriodicBackupStatus;
use crate::models::report::IndexState;
use crate::models::topology::{ClusterTopology, DatabaseRecord, DatabaseTopology};

/// Generate a fresh unique raft command id.
pub fn new_command_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateTopologyCommand {
    pub database_name: String,
    pub topology: DatabaseTopology,
    /// The record etag the topology was computed from.
    pub raft_command_index: u64,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeleteDatabaseCommand {
    pub database_name: String,
    pub from_nodes: Vec<String>,
    pub hard_delete: bool,
    pub error_on_database_does_not_exists: bool,
    pub update_replication_factor: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SetIndexStateCommand {
    pub index_name: String,
    pub state: IndexState,
    pub database_name: String,
    /// The record etag the change was computed from, checked when set.
    #[serde(default)]
    pub raft_command_index: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeleteIndexCommand {
    pub index_name: String,
    pub database_name: String,
    #[serde(default)]
    pub raft_command_index: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CleanCompareExchangeTombstonesCommand {
    pub database_name: String,
    pub max_etag: u64,
    pub batch_size: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeleteExpiredCompareExchangeCommand {
    pub now: DateTime<Utc>,
    pub batch_size: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CleanUpClusterStateCommand {
    /// The completed cluster transaction count per database.
    pub cluster_transactions_cleanup: BTreeMap<String, i64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdatePeriodicBackupStatusCommand {
    pub database_name: String,
    pub status: PeriodicBackupStatus,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PutCompareExchangeCommand {
    pub database_name: String,
    pub key: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoveCompareExchangeCommand {
    pub database_name: String,
    pub key: String,
}

/// Every command understood by the cluster state machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClusterCommand {
    PutDatabaseRecord(DatabaseRecord),
    PutClusterTopology(ClusterTopology),
    UpdateTopology(UpdateTopologyCommand),
    DeleteDatabase(DeleteDatabaseCommand),
    SetIndexState(SetIndexStateCommand),
    DeleteIndex(DeleteIndexCommand),
    CleanCompareExchangeTombstones(CleanCompareExchangeTombstonesCommand),
    DeleteExpiredCompareExchange(DeleteExpiredCompareExchangeCommand),
    CleanUpClusterState(CleanUpClusterStateCommand),
    UpdatePeriodicBackupStatus(UpdatePeriodicBackupStatusCommand),
    PutCompareExchange(PutCompareExchangeCommand),
    RemoveCompareExchange(RemoveCompareExchangeCommand),
}

impl ClusterCommand {
    /// The name of this command, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PutDatabaseRecord(_) => "PutDatabaseRecord",
            Self::PutClusterTopology(_) => "PutClusterTopology",
            Self::UpdateTopology(_) => "UpdateTopology",
            Self::DeleteDatabase(_) => "DeleteDatabase",
            Self::SetIndexState(_) => "SetIndexState",
            Self::DeleteIndex(_) => "DeleteIndex",
            Self::CleanCompareExchangeTombstones(_) => "CleanCompareExchangeTombstones",
            Self::DeleteExpiredCompareExchange(_) => "DeleteExpiredCompareExchange",
            Self::CleanUpClusterState(_) => "CleanUpClusterState",
            Self::UpdatePeriodicBackupStatus(_) => "UpdatePeriodicBackupStatus",
            Self::PutCompareExchange(_) => "PutCompareExchange",
            Self::RemoveCompareExchange(_) => "RemoveCompareExchange",
        }
    }

    /// The database this command modifies, if it is database scoped.
    pub fn database_name(&self) -> Option<&str> {
        match self {
            Self::PutDatabaseRecord(record) => Some(&record.database_name),
            Self::UpdateTopology(cmd) => Some(&cmd.database_name),
            Self::DeleteDatabase(cmd) => Some(&cmd.database_name),
            Self::SetIndexState(cmd) => Some(&cmd.database_name),
            Self::DeleteIndex(cmd) => Some(&cmd.database_name),
            Self::CleanCompareExchangeTombstones(cmd) => Some(&cmd.database_name),
            Self::UpdatePeriodicBackupStatus(cmd) => Some(&cmd.database_name),
            Self::PutCompareExchange(cmd) => Some(&cmd.database_name),
            Self::RemoveCompareExchange(cmd) => Some(&cmd.database_name),
            Self::PutClusterTopology(_) | Self::DeleteExpiredCompareExchange(_) | Self::CleanUpClusterState(_) => None,
        }
    }
}

/// The value produced by applying a command.
#[derive(Clone, Debug, PartialEq)]
pub enum CommandResult {
    None,
    /// More items remain to be processed by a subsequent command.
    HasMore(bool),
}

impl CommandResult {
    pub fn has_more(&self) -> bool {
        matches!(self, Self::HasMore(true))
    }
}
