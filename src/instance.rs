//! A database instance loaded on this node.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::cluster::Cluster;
use crate::config::Config;
use crate::models::report::{DatabaseStatus, DatabaseStatusReport, IndexState, IndexType, ObservedIndexStatus};
use crate::models::topology::DatabaseRecord;
use crate::notifications::NotificationCenter;
use crate::storage::{DocumentStore, TombstoneCleanerParticipant};
use crate::utils;

/// The length of a database master key.
pub const MASTER_KEY_LEN: usize = 32;

/// One loaded database along with its collaborators.
pub struct DatabaseInstance {
    name: String,
    config: Arc<Config>,
    cluster: Cluster,
    store: DocumentStore,
    notifications: NotificationCenter,
    master_key: Option<[u8; MASTER_KEY_LEN]>,
    /// Cancelled when the database shuts down.
    shutdown: CancellationToken,
    started_at: DateTime<Utc>,
    idle_guards: Arc<AtomicUsize>,
    next_operation_id: AtomicU64,
    tombstone_participants: parking_lot::Mutex<Vec<Arc<dyn TombstoneCleanerParticipant>>>,
}

/// Keeps a database from being unloaded as idle while held.
pub struct IdleGuard {
    guards: Arc<AtomicUsize>,
}

impl Drop for IdleGuard {
    fn drop(&mut self) {
        self.guards.fetch_sub(1, Ordering::SeqCst);
    }
}

impl DatabaseInstance {
    pub fn new(
        name: impl Into<String>, config: Arc<Config>, cluster: Cluster, store: DocumentStore, notifications: NotificationCenter,
        master_key: Option<[u8; MASTER_KEY_LEN]>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            cluster,
            store,
            notifications,
            master_key,
            shutdown: CancellationToken::new(),
            started_at: Utc::now(),
            idle_guards: Arc::new(AtomicUsize::new(0)),
            next_operation_id: AtomicU64::new(1),
            tombstone_participants: parking_lot::Mutex::new(vec![]),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    pub fn notifications(&self) -> &NotificationCenter {
        &self.notifications
    }

    pub fn master_key(&self) -> Option<&[u8; MASTER_KEY_LEN]> {
        self.master_key.as_ref()
    }

    /// The token cancelled when this database shuts down.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Allocate the id of a new long running operation.
    pub fn next_operation_id(&self) -> u64 {
        self.next_operation_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Keep this database loaded until the returned guard is dropped.
    pub fn prevent_unloading(&self) -> IdleGuard {
        self.idle_guards.fetch_add(1, Ordering::SeqCst);
        IdleGuard {
            guards: self.idle_guards.clone(),
        }
    }

    /// Whether this database may be unloaded as idle.
    pub fn can_unload(&self) -> bool {
        self.idle_guards.load(Ordering::SeqCst) == 0
    }

    /// Read this database's record from the cluster.
    pub fn read_record(&self) -> Result<Option<(DatabaseRecord, u64)>> {
        self.cluster.read_database_record(&self.name)
    }

    /// Register a component which must process tombstones before they are purged.
    pub fn subscribe_tombstone_cleaner(&self, participant: Arc<dyn TombstoneCleanerParticipant>) {
        self.tombstone_participants.lock().push(participant);
    }

    /// Remove a tombstone participant by its identifier.
    pub fn unsubscribe_tombstone_cleaner(&self, identifier: &str) {
        self.tombstone_participants.lock().retain(|p| p.identifier() != identifier);
    }

    /// Purge the tombstones every participant has processed.
    pub async fn cleanup_tombstones(&self) -> Result<usize> {
        let participants = self.tombstone_participants.lock().clone();
        let purged = self.store.cleanup_tombstones(participants).await?;
        if purged > 0 {
            tracing::debug!(database = %self.name, purged, "purged tombstones");
        }
        Ok(purged)
    }

    /// Build this node's status report of the database.
    pub fn status_report(&self, now: DateTime<Utc>) -> Result<DatabaseStatusReport> {
        let mut report = DatabaseStatusReport::new(&self.name, self.cluster.node_tag(), DatabaseStatus::Loaded);
        let (last_etag, change_vector) = self.store.read_last_etag_and_change_vector()?;
        report.last_etag = last_etag;
        report.database_change_vector = change_vector;
        report.last_tombstone_etag = self.store.last_tombstone_etag()?;
        report.number_of_documents = self.store.count_documents()?;
        report.up_time = Some(utils::elapsed_since(now, self.started_at));

        if let Some((record, _)) = self.read_record()? {
            report.last_completed_cluster_transaction = record.truncated_cluster_transaction_commands_count;
            // Auto indexes are maintained synchronously with writes here, so they are never stale.
            let indexes: HashMap<String, ObservedIndexStatus> = record
                .auto_indexes
                .values()
                .map(|def| {
                    let status = ObservedIndexStatus {
                        is_stale: false,
                        state: def.state.unwrap_or(IndexState::Normal),
                        index_type: IndexType::AutoMap,
                        last_indexed_etag: last_etag,
                        last_queried: None,
                        is_side_by_side: false,
                        last_indexed_compare_exchange_reference_tombstone_etag: None,
                    };
                    (def.name.clone(), status)
                })
                .collect();
            report.last_index_stats = indexes;
        }
        Ok(report)
    }

    /// Begin shutting down, cancelling every operation of this database.
    pub fn shutdown(&self) {
        tracing::debug!(database = %self.name, "shutting down database instance");
        self.shutdown.cancel();
    }
}
