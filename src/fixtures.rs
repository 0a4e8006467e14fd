use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::cluster::{Cluster, MaintenanceStats};
use crate::config::Config;
use crate::database::Database;
use crate::instance::DatabaseInstance;
use crate::models::backup::{LocalSettings, PeriodicBackupConfiguration};
use crate::models::commands::{new_command_id, ClusterCommand};
use crate::models::report::{ClusterNodeStatusReport, DatabaseStatus, DatabaseStatusReport, ReportStatus};
use crate::models::topology::{ClusterTopology, DatabaseRecord, DatabaseTopology};
use crate::notifications::NotificationCenter;
use crate::storage::DocumentStore;

/// Everything a test needs to exercise the cluster-facing components on node `A`.
pub struct TestEnv {
    pub config: Arc<Config>,
    pub db: Database,
    pub cluster: Cluster,
    pub stats: MaintenanceStats,
    pub notifications: NotificationCenter,
    pub _tmpdir: tempfile::TempDir,
}

impl TestEnv {
    /// Build an environment where node `A` leads term 1.
    pub async fn new() -> Result<Self> {
        Self::with_config(|_| ()).await
    }

    /// Build an environment with a customized config.
    pub async fn with_config(f: impl FnOnce(&mut Config)) -> Result<Self> {
        let (config, tmpdir) = Config::new_test()?;
        let mut config = Config::clone(&config);
        f(&mut config);
        let config = Arc::new(config);
        let db = Database::new(config.clone()).await?;
        let cluster = Cluster::new(&db, config.node_tag.clone()).await?;
        cluster.become_leader(1);
        Ok(Self {
            config,
            db,
            cluster,
            stats: MaintenanceStats::new(),
            notifications: NotificationCenter::new(),
            _tmpdir: tmpdir,
        })
    }

    /// Submit a command, returning its raft index.
    pub async fn put(&self, cmd: ClusterCommand) -> Result<u64> {
        let (index, _) = self.cluster.put(new_command_id(), cmd).await?;
        Ok(index)
    }

    /// Write a database record and a cluster topology holding the given nodes.
    pub async fn setup_database(&self, record: DatabaseRecord, cluster_nodes: &[&str]) -> Result<u64> {
        self.put(ClusterCommand::PutClusterTopology(cluster_topology(cluster_nodes))).await?;
        self.put(ClusterCommand::PutDatabaseRecord(record)).await
    }

    /// Open a loaded instance of the given database on this node.
    pub async fn instance(&self, name: &str, master_key: Option<[u8; 32]>) -> Result<Arc<DatabaseInstance>> {
        let store = DocumentStore::open(&self.db, name, &self.config.node_tag).await?;
        Ok(Arc::new(DatabaseInstance::new(
            name,
            self.config.clone(),
            self.cluster.clone(),
            store,
            self.notifications.clone(),
            master_key,
        )))
    }
}

pub fn strings(vals: &[&str]) -> Vec<String> {
    vals.iter().map(|s| s.to_string()).collect()
}

/// A topology with dynamic distribution enabled, last modified an hour ago.
pub fn topology(members: &[&str], promotables: &[&str], rehabs: &[&str], replication_factor: usize) -> DatabaseTopology {
    DatabaseTopology {
        members: strings(members),
        promotables: strings(promotables),
        rehabs: strings(rehabs),
        replication_factor,
        dynamic_nodes_distribution: true,
        nodes_modified_at: Some(Utc::now() - ChronoDuration::hours(1)),
        ..Default::default()
    }
}

pub fn cluster_topology(nodes: &[&str]) -> ClusterTopology {
    ClusterTopology {
        members: nodes.iter().map(|n| (n.to_string(), format!("http://{}.warden:8080", n.to_lowercase()))).collect(),
        ..Default::default()
    }
}

/// A loaded database report which has been up for an hour.
pub fn db_report(database: &str, node: &str, last_etag: i64, change_vector: Option<&str>) -> DatabaseStatusReport {
    let mut report = DatabaseStatusReport::new(database, node, DatabaseStatus::Loaded);
    report.last_etag = last_etag;
    report.database_change_vector = change_vector.map(String::from);
    report.up_time = Some(std::time::Duration::from_secs(3600));
    report
}

/// A successful node report carrying the given database reports.
pub fn node_ok(reports: Vec<DatabaseStatusReport>, now: DateTime<Utc>) -> Arc<ClusterNodeStatusReport> {
    let report: HashMap<String, DatabaseStatusReport> = reports.into_iter().map(|r| (r.name.clone(), r)).collect();
    Arc::new(ClusterNodeStatusReport::ok(report, now))
}

/// A node report which timed out, last succeeding at `last_success`.
pub fn node_timeout(last_success: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Arc<ClusterNodeStatusReport> {
    Arc::new(ClusterNodeStatusReport {
        report: HashMap::new(),
        status: ReportStatus::Timeout,
        error: None,
        update_date_time: now,
        last_successful_update_date_time: last_success,
        last_good_database_status: HashMap::new(),
        server_report: Default::default(),
    })
}

/// A backup task writing to the given local folder with the given cron frequencies.
pub fn backup_config(task_id: u64, folder: &Path, full: Option<&str>, incremental: Option<&str>) -> PeriodicBackupConfiguration {
    PeriodicBackupConfiguration {
        task_id,
        name: Some(format!("backup-{}", task_id)),
        full_backup_frequency: full.map(String::from),
        incremental_backup_frequency: incremental.map(String::from),
        local_settings: Some(LocalSettings {
            disabled: false,
            folder_path: Some(folder.to_string_lossy().to_string()),
            get_backup_configuration_script: None,
        }),
        ..Default::default()
    }
}
