//! The owner of every database loaded on this node.
//!
//! The landlord keeps one `DatabaseInstance` and one `PeriodicBackupRunner` per database whose
//! topology lists this node. Record changes are reconciled as they are applied, and this node's
//! status report is published for the observer at a fixed period.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use crate::backup::{ClusterStatusStore, ConcurrentBackupsCounter, LocalRetentionPolicyRunner, PeriodicBackupRunner, RunnerParams, UploaderRegistry};
use crate::cluster::{Cluster, MaintenanceStats, RecordChanged};
use crate::config::Config;
use crate::database::Database;
use crate::instance::DatabaseInstance;
use crate::models::report::{ClusterNodeStatusReport, DatabaseStatus, DatabaseStatusReport};
use crate::models::topology::{DatabaseRecord, DeletionInProgressStatus};
use crate::notifications::NotificationCenter;
use crate::storage::DocumentStore;

const METRIC_LOADED_DATABASES: &str = "warden_loaded_databases";

/// A database loaded on this node.
struct LoadedDatabase {
    instance: Arc<DatabaseInstance>,
    runner: PeriodicBackupRunner,
}

/// Loads, reconfigures and unloads the databases of this node.
pub struct Landlord {
    config: Arc<Config>,
    db: Database,
    cluster: Cluster,
    stats: MaintenanceStats,
    notifications: NotificationCenter,
    counter: ConcurrentBackupsCounter,
    uploaders: Arc<UploaderRegistry>,
    databases: HashMap<String, LoadedDatabase>,

    changes_rx: BroadcastStream<RecordChanged>,
    shutdown_rx: BroadcastStream<()>,
}

impl Landlord {
    pub fn new(
        config: Arc<Config>, db: Database, cluster: Cluster, stats: MaintenanceStats, notifications: NotificationCenter,
        uploaders: Arc<UploaderRegistry>, shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        metrics::register_gauge!(METRIC_LOADED_DATABASES, metrics::Unit::Count, "the number of databases loaded on this node");
        let counter = ConcurrentBackupsCounter::new(config.max_concurrent_backups, config.backup_retry_delay());
        let changes_rx = BroadcastStream::new(cluster.subscribe_changes());
        Self {
            config,
            db,
            cluster,
            stats,
            notifications,
            counter,
            uploaders,
            databases: HashMap::new(),
            changes_rx,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!(node = %self.cluster.node_tag(), "landlord has started");
        if let Err(err) = self.reconcile_all().await {
            tracing::error!(error = ?err, "error loading databases");
        }

        let mut report_interval = tokio::time::interval(self.config.report_period());
        report_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cleanup_interval = tokio::time::interval(self.config.tombstone_cleanup_interval());
        cleanup_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                Some(change) = self.changes_rx.next() => self.handle_change(change).await,
                _ = report_interval.tick() => self.publish_report(Utc::now()),
                _ = cleanup_interval.tick() => self.cleanup_tombstones().await,
                _ = self.shutdown_rx.next() => break,
            }
        }

        self.unload_all().await;
        tracing::debug!("landlord has shutdown");
        Ok(())
    }

    async fn handle_change(&mut self, change: Result<RecordChanged, BroadcastStreamRecvError>) {
        let res = match change {
            Ok(change) => self.reconcile(&change.database).await,
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                tracing::warn!(missed, "landlord lagged behind record changes, reconciling every database");
                self.reconcile_all().await
            }
        };
        if let Err(err) = res {
            tracing::error!(error = ?err, "error reconciling databases");
        }
    }

    /// The names of the databases loaded on this node, sorted.
    pub fn loaded(&self) -> Vec<String> {
        let mut names: Vec<String> = self.databases.keys().cloned().collect();
        names.sort();
        names
    }

    /// The backup runner of a loaded database.
    pub fn runner(&self, database: &str) -> Option<&PeriodicBackupRunner> {
        self.databases.get(database).map(|loaded| &loaded.runner)
    }

    /// Reconcile every database of the cluster, unloading those which no longer exist.
    pub async fn reconcile_all(&mut self) -> Result<()> {
        let names = self.cluster.database_names()?;
        for name in names.iter() {
            if let Err(err) = self.reconcile(name).await {
                tracing::error!(error = ?err, database = %name, "error reconciling database");
            }
        }
        let gone: Vec<String> = self.databases.keys().filter(|name| !names.contains(name)).cloned().collect();
        for name in gone {
            self.unload(&name).await;
        }
        Ok(())
    }

    /// Load, reconfigure or unload the given database according to its current record.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn reconcile(&mut self, database: &str) -> Result<()> {
        let record = self.cluster.read_database_record(database)?.map(|(record, _)| record);
        let record = match record {
            Some(record) if self.is_relevant(&record) => record,
            record => {
                self.unload(database).await;
                let hard_delete = record
                    .and_then(|record| record.deletion_in_progress.get(self.cluster.node_tag()).copied())
                    .map(|status| status == DeletionInProgressStatus::HardDelete)
                    .unwrap_or(false);
                if hard_delete && self.db.drop_documents_tree(database).await? {
                    tracing::info!(database, "database hard deleted from this node, dropped its documents");
                }
                return Ok(());
            }
        };
        if !self.databases.contains_key(database) {
            self.load(database).await?;
        }
        if let Some(loaded) = self.databases.get(database) {
            loaded.runner.update_configurations(&record);
        }
        Ok(())
    }

    fn is_relevant(&self, record: &DatabaseRecord) -> bool {
        let node = self.cluster.node_tag();
        let in_topology = record.topology.as_ref().map(|topology| topology.relevant_for(node)).unwrap_or(false);
        in_topology && !record.disabled && !record.deletion_in_progress.contains_key(node)
    }

    async fn load(&mut self, database: &str) -> Result<()> {
        let store = DocumentStore::open(&self.db, database, self.cluster.node_tag())
            .await
            .with_context(|| format!("error opening document store of {}", database))?;
        let instance = Arc::new(DatabaseInstance::new(
            database,
            self.config.clone(),
            self.cluster.clone(),
            store,
            self.notifications.clone(),
            None,
        ));
        let runner = PeriodicBackupRunner::new(RunnerParams {
            instance: instance.clone(),
            status_store: Arc::new(ClusterStatusStore::new(self.cluster.clone())),
            counter: self.counter.clone(),
            uploaders: self.uploaders.clone(),
            retention: Arc::new(LocalRetentionPolicyRunner),
            wake_up: None,
        });
        self.databases.insert(database.to_string(), LoadedDatabase { instance, runner });
        metrics::gauge!(METRIC_LOADED_DATABASES, self.databases.len() as f64);
        tracing::info!(database, "database loaded");
        Ok(())
    }

    async fn unload(&mut self, database: &str) {
        let loaded = match self.databases.remove(database) {
            Some(loaded) => loaded,
            None => return,
        };
        if !loaded.instance.can_unload() {
            tracing::debug!(database, "waiting for running operations before unloading");
        }
        loaded.runner.dispose().await;
        loaded.instance.shutdown();
        metrics::gauge!(METRIC_LOADED_DATABASES, self.databases.len() as f64);
        tracing::info!(database, "database unloaded");
    }

    async fn unload_all(&mut self) {
        let names: Vec<String> = self.databases.keys().cloned().collect();
        for name in names {
            self.unload(&name).await;
        }
    }

    /// Publish this node's report of every loaded database.
    pub fn publish_report(&self, now: DateTime<Utc>) {
        let node = self.cluster.node_tag();
        let mut reports = HashMap::new();
        for (name, loaded) in self.databases.iter() {
            let report = loaded.instance.status_report(now).unwrap_or_else(|err| {
                tracing::error!(error = ?err, database = %name, "error building database status report");
                let mut report = DatabaseStatusReport::new(name, node, DatabaseStatus::Faulted);
                report.error = Some(format!("{:#}", err));
                report
            });
            reports.insert(name.clone(), report);
        }
        self.stats.update_node(node, ClusterNodeStatusReport::ok(reports, now));
    }

    /// Purge the tombstones of every loaded database, as far as their participants allow.
    pub async fn cleanup_tombstones(&self) {
        for (name, loaded) in self.databases.iter() {
            if let Err(err) = loaded.instance.cleanup_tombstones().await {
                tracing::error!(error = ?err, database = %name, "error cleaning up tombstones");
            }
        }
    }
}
