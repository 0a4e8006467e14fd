//! Persistence of periodic backup statuses through the cluster.

use std::time::Duration;

use anyhow::{Context, Result};

use crate::cluster::Cluster;
use crate::models::backup::PeriodicBackupStatus;
use crate::models::commands::{new_command_id, ClusterCommand, UpdatePeriodicBackupStatusCommand};

/// The time to wait for a saved status to be applied locally.
const STATUS_COMMIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Read and write access to backup statuses.
#[async_trait::async_trait]
pub trait BackupStatusStore: Send + Sync {
    /// The last status committed for the task, if any.
    fn read_status(&self, database: &str, task_id: u64) -> Result<Option<PeriodicBackupStatus>>;

    /// Persist a status, returning once it is committed.
    async fn save_status(&self, database: &str, status: PeriodicBackupStatus) -> Result<u64>;
}

/// A status store backed by the replicated cluster state.
#[derive(Clone)]
pub struct ClusterStatusStore {
    cluster: Cluster,
}

impl ClusterStatusStore {
    pub fn new(cluster: Cluster) -> Self {
        Self { cluster }
    }
}

#[async_trait::async_trait]
impl BackupStatusStore for ClusterStatusStore {
    fn read_status(&self, database: &str, task_id: u64) -> Result<Option<PeriodicBackupStatus>> {
        self.cluster.read_backup_status(database, task_id)
    }

    #[tracing::instrument(level = "debug", skip(self, status), fields(task_id = status.task_id, version = status.version))]
    async fn save_status(&self, database: &str, status: PeriodicBackupStatus) -> Result<u64> {
        let cmd = ClusterCommand::UpdatePeriodicBackupStatus(UpdatePeriodicBackupStatusCommand {
            database_name: database.to_string(),
            status,
        });
        let (index, _) = self
            .cluster
            .send_to_leader(new_command_id(), cmd)
            .await
            .context("error submitting periodic backup status")?;
        self.cluster
            .wait_for_index(index, STATUS_COMMIT_TIMEOUT)
            .await
            .context("error waiting for periodic backup status to be committed")?;
        Ok(index)
    }
}

/// Pick the most recent of the committed and in-memory statuses of a task.
///
/// The higher version wins. On a tie the committed status wins.
pub fn compare_periodic_backup_status(
    task_id: u64, from_cluster: Option<PeriodicBackupStatus>, in_memory: Option<PeriodicBackupStatus>,
) -> PeriodicBackupStatus {
    match (from_cluster, in_memory) {
        (None, None) => PeriodicBackupStatus::new(task_id),
        (Some(status), None) | (None, Some(status)) => status,
        (Some(committed), Some(local)) if local.version > committed.version => local,
        (Some(committed), Some(_)) => committed,
    }
}
