//! The replicated cluster state and its consensus command surface.
//!
//! The consensus engine itself (elections, log replication) lives outside of this crate. This
//! module holds the committed state machine: it applies commands in raft index order, publishes
//! the commit index for waiters, and exposes the leader/term state which the engine drives via
//! `become_leader`, `become_follower` and `set_state`.

mod maintenance;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::Tree;
use tokio::sync::{broadcast, watch, Mutex};

use crate::database::Database;
use crate::error::{AppError, ERR_DB_FLUSH, ERR_DECODE_RECORD, ERR_DECODE_STATUS, ERR_ITER_FAILURE};
use crate::models::backup::PeriodicBackupStatus;
use crate::models::commands::{ClusterCommand, CommandResult, DeleteDatabaseCommand, UpdateTopologyCommand};
use crate::models::topology::{ClusterTopology, DatabaseRecord, DeletionInProgressStatus};
use crate::utils;

pub use maintenance::{MaintenanceStats, NodeReports};

/// The key holding the last applied raft index.
const KEY_LAST_INDEX: &[u8] = b"raft/last_index";
/// The key holding the cluster topology.
const KEY_CLUSTER_TOPOLOGY: &[u8] = b"raft/topology";
const PREFIX_RECORD: &str = "db/";
const PREFIX_COMMAND_ID: &str = "cmd/";
const PREFIX_COMPARE_EXCHANGE: &str = "cmpxchg/";
const PREFIX_COMPARE_EXCHANGE_TOMBSTONE: &str = "cmpxchg-tomb/";

const BATCH_RETRY_ATTEMPTS: u32 = 5;
const BATCH_RETRY_BASE_DELAY: Duration = Duration::from_millis(50);
const BATCH_RETRY_MAX_DELAY: Duration = Duration::from_secs(2);

const METRIC_COMMANDS_APPLIED: &str = "warden_cluster_commands_applied";
const METRIC_LAST_INDEX: &str = "warden_cluster_last_index";

/// The role of this node in the consensus protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RaftState {
    /// Not part of a cluster, or removed from it.
    Passive,
    Candidate,
    Follower,
    Leader,
}

/// A snapshot of this node's consensus state.
#[derive(Clone, Debug, PartialEq)]
pub struct RaftStatus {
    pub state: RaftState,
    pub term: u64,
    /// The tag of the current leader, if one is known.
    pub leader: Option<String>,
    /// When this node's current leadership began.
    pub leadership_started: Option<DateTime<Utc>>,
}

/// Emitted whenever a database record or one of its values changes.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordChanged {
    pub database: String,
    pub index: u64,
}

/// A compare exchange value as stored in the cluster state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompareExchangeValue {
    pub value: serde_json::Value,
    pub index: u64,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize)]
struct StoredRecord {
    record: DatabaseRecord,
    etag: u64,
}

/// A handle to the replicated cluster state.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

struct ClusterInner {
    node_tag: String,
    tree: Tree,
    /// Serializes every state change.
    apply_lock: Mutex<()>,
    status_tx: watch::Sender<RaftStatus>,
    index_tx: watch::Sender<u64>,
    changes_tx: broadcast::Sender<RecordChanged>,
}

impl Cluster {
    /// Open the cluster state held in the given database.
    pub async fn new(db: &Database, node_tag: impl Into<String>) -> Result<Self> {
        let tree = db.get_cluster_tree().await?;
        let last_index = read_last_index(&tree)?;
        metrics::register_counter!(METRIC_COMMANDS_APPLIED, metrics::Unit::Count, "the number of cluster commands applied");
        metrics::register_gauge!(METRIC_LAST_INDEX, metrics::Unit::Count, "the last applied raft index");
        metrics::gauge!(METRIC_LAST_INDEX, last_index as f64);

        let (status_tx, _) = watch::channel(RaftStatus {
            state: RaftState::Passive,
            term: 0,
            leader: None,
            leadership_started: None,
        });
        let (index_tx, _) = watch::channel(last_index);
        let (changes_tx, _) = broadcast::channel(1000);
        Ok(Self {
            inner: Arc::new(ClusterInner {
                node_tag: node_tag.into(),
                tree,
                apply_lock: Mutex::new(()),
                status_tx,
                index_tx,
                changes_tx,
            }),
        })
    }

    //////////////////////////////////////////////////////////////////////////
    // Consensus State ///////////////////////////////////////////////////////

    /// The tag of this node.
    pub fn node_tag(&self) -> &str {
        &self.inner.node_tag
    }

    /// The current consensus status of this node.
    pub fn status(&self) -> RaftStatus {
        self.inner.status_tx.borrow().clone()
    }

    /// Subscribe to consensus status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<RaftStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Subscribe to database record changes.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<RecordChanged> {
        self.inner.changes_tx.subscribe()
    }

    pub fn current_term(&self) -> u64 {
        self.inner.status_tx.borrow().term
    }

    pub fn leader_tag(&self) -> Option<String> {
        self.inner.status_tx.borrow().leader.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.inner.status_tx.borrow().state == RaftState::Leader
    }

    /// How long this node has been the leader of the current term.
    pub fn leadership_duration(&self, now: DateTime<Utc>) -> Option<Duration> {
        let status = self.inner.status_tx.borrow();
        match (status.state, status.leadership_started) {
            (RaftState::Leader, Some(started)) => Some(utils::elapsed_since(now, started)),
            _ => None,
        }
    }

    /// Record that this node won the election of the given term.
    pub fn become_leader(&self, term: u64) {
        tracing::info!(term, node = %self.inner.node_tag, "node became the cluster leader");
        let _ = self.inner.status_tx.send(RaftStatus {
            state: RaftState::Leader,
            term,
            leader: Some(self.inner.node_tag.clone()),
            leadership_started: Some(Utc::now()),
        });
    }

    /// Record that another node leads the given term.
    pub fn become_follower(&self, term: u64, leader: impl Into<String>) {
        let leader = leader.into();
        tracing::info!(term, %leader, "node is following");
        let _ = self.inner.status_tx.send(RaftStatus {
            state: RaftState::Follower,
            term,
            leader: Some(leader),
            leadership_started: None,
        });
    }

    /// Move to a leaderless state such as `Candidate` or `Passive`.
    pub fn set_state(&self, state: RaftState) {
        self.inner.status_tx.send_modify(|status| {
            status.state = state;
            if !matches!(state, RaftState::Leader | RaftState::Follower) {
                status.leader = None;
                status.leadership_started = None;
            }
        });
    }

    /// The last applied raft index.
    pub fn last_index(&self) -> u64 {
        *self.inner.index_tx.borrow()
    }

    //////////////////////////////////////////////////////////////////////////
    // Command Submission ////////////////////////////////////////////////////

    /// Submit a command as the leader, returning its raft index and result.
    #[tracing::instrument(level = "debug", skip(self, cmd), fields(cmd = cmd.name()))]
    pub async fn put(&self, id: String, cmd: ClusterCommand) -> Result<(u64, CommandResult)> {
        let _guard = self.inner.apply_lock.lock().await;
        self.ensure_leader(cmd.name())?;
        self.apply_locked(id, cmd).await
    }

    /// Submit a command through whichever node currently leads.
    #[tracing::instrument(level = "debug", skip(self, cmd), fields(cmd = cmd.name()))]
    pub async fn send_to_leader(&self, id: String, cmd: ClusterCommand) -> Result<(u64, CommandResult)> {
        let _guard = self.inner.apply_lock.lock().await;
        let status = self.status();
        if matches!(status.state, RaftState::Candidate | RaftState::Passive) || status.leader.is_none() {
            return Err(AppError::ClusterDown(format!("no leader is known to node {} for command {}", self.inner.node_tag, cmd.name())).into());
        }
        self.apply_locked(id, cmd).await
    }

    /// Submit a batch of commands in order as the leader.
    ///
    /// Once a command fails, it and every command after it are retried one by one with capped
    /// exponential backoff. Each command gets its own result.
    pub async fn put_batch(&self, commands: Vec<(String, ClusterCommand)>) -> Vec<Result<(u64, CommandResult)>> {
        let mut results = Vec::with_capacity(commands.len());
        let mut iter = commands.into_iter();
        let mut failed = None;
        {
            let _guard = self.inner.apply_lock.lock().await;
            for (id, cmd) in iter.by_ref() {
                let res = match self.ensure_leader(cmd.name()) {
                    Ok(()) => self.apply_locked(id.clone(), cmd.clone()).await,
                    Err(err) => Err(err),
                };
                match res {
                    Ok(res) => results.push(Ok(res)),
                    Err(err) => {
                        tracing::warn!(error = ?err, cmd = cmd.name(), "batch command failed, retrying remaining commands one by one");
                        failed = Some((id, cmd));
                        break;
                    }
                }
            }
        }
        if let Some((id, cmd)) = failed {
            results.push(self.put_with_retry(id, cmd).await);
            for (id, cmd) in iter {
                results.push(self.put_with_retry(id, cmd).await);
            }
        }
        results
    }

    async fn put_with_retry(&self, id: String, cmd: ClusterCommand) -> Result<(u64, CommandResult)> {
        let mut delay = BATCH_RETRY_BASE_DELAY;
        let mut attempt = 1;
        loop {
            match self.put(id.clone(), cmd.clone()).await {
                Ok(res) => return Ok(res),
                Err(err) if attempt >= BATCH_RETRY_ATTEMPTS || crate::error::is_not_leading(&err) || crate::error::is_concurrency(&err) => {
                    return Err(err);
                }
                Err(err) => {
                    tracing::debug!(error = ?err, attempt, cmd = cmd.name(), "retrying cluster command");
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, BATCH_RETRY_MAX_DELAY);
                    attempt += 1;
                }
            }
        }
    }

    /// Wait until the given raft index has been applied locally.
    pub async fn wait_for_index(&self, index: u64, timeout: Duration) -> Result<()> {
        let mut rx = self.inner.index_tx.subscribe();
        let wait = async move {
            loop {
                if *rx.borrow_and_update() >= index {
                    return Ok(());
                }
                rx.changed().await.context("cluster index channel closed")?;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .with_context(|| format!("timed out waiting for raft index {}", index))?
    }

    fn ensure_leader(&self, name: &str) -> Result<()> {
        if !self.is_leader() {
            return Err(AppError::NotLeading(format!("node {} is not the leader, so command {} is rejected", self.inner.node_tag, name)).into());
        }
        Ok(())
    }

    /// Apply a command. The apply lock must be held.
    async fn apply_locked(&self, id: String, cmd: ClusterCommand) -> Result<(u64, CommandResult)> {
        let (tree, term, name) = (self.inner.tree.clone(), self.current_term(), cmd.name());
        let applied = Database::spawn_blocking(move || apply_command(&tree, term, &id, cmd)).await??;
        match applied {
            Applied::Duplicate(index) => Ok((index, CommandResult::None)),
            Applied::New { index, result, database } => {
                tracing::debug!(index, cmd = name, "cluster command applied");
                metrics::increment_counter!(METRIC_COMMANDS_APPLIED);
                metrics::gauge!(METRIC_LAST_INDEX, index as f64);
                let _ = self.inner.index_tx.send(index);
                if let Some(database) = database {
                    let _ = self.inner.changes_tx.send(RecordChanged { database, index });
                }
                Ok((index, result))
            }
        }
    }

    //////////////////////////////////////////////////////////////////////////
    // Reads /////////////////////////////////////////////////////////////////

    /// Check whether a command with the given id was already applied.
    pub fn contains_command_id(&self, id: &str) -> Result<bool> {
        Ok(self.inner.tree.contains_key(command_key(id)).context(ERR_ITER_FAILURE)?)
    }

    /// The names of every database in the cluster.
    pub fn database_names(&self) -> Result<Vec<String>> {
        let mut names = vec![];
        for kv in self.inner.tree.scan_prefix(PREFIX_RECORD) {
            let (_, val) = kv.context(ERR_ITER_FAILURE)?;
            let stored: StoredRecord = utils::decode_model(&val).context(ERR_DECODE_RECORD)?;
            names.push(stored.record.database_name);
        }
        Ok(names)
    }

    /// Read a database record along with its etag.
    pub fn read_database_record(&self, database: &str) -> Result<Option<(DatabaseRecord, u64)>> {
        read_record(&self.inner.tree, database).map(|opt| opt.map(|stored| (stored.record, stored.etag)))
    }

    pub fn read_cluster_topology(&self) -> Result<ClusterTopology> {
        match self.inner.tree.get(KEY_CLUSTER_TOPOLOGY).context(ERR_ITER_FAILURE)? {
            Some(val) => utils::decode_model(&val),
            None => Ok(ClusterTopology::default()),
        }
    }

    /// Read the persisted status of a periodic backup task.
    pub fn read_backup_status(&self, database: &str, task_id: u64) -> Result<Option<PeriodicBackupStatus>> {
        let key = PeriodicBackupStatus::generate_item_name(database, task_id);
        match self.inner.tree.get(key.as_bytes()).context(ERR_ITER_FAILURE)? {
            Some(val) => Ok(Some(utils::decode_model(&val).context(ERR_DECODE_STATUS)?)),
            None => Ok(None),
        }
    }

    /// Read every cluster value of a database as raw JSON, keyed by item name.
    pub fn read_database_values(&self, database: &str) -> Result<Vec<(String, serde_json::Value)>> {
        let prefix = PeriodicBackupStatus::values_prefix(database);
        let mut values = vec![];
        for kv in self.inner.tree.scan_prefix(prefix.as_bytes()) {
            let (key, val) = kv.context(ERR_ITER_FAILURE)?;
            values.push((String::from_utf8_lossy(&key).to_string(), utils::decode_model(&val)?));
        }
        Ok(values)
    }

    pub fn read_compare_exchange(&self, database: &str, key: &str) -> Result<Option<CompareExchangeValue>> {
        match self.inner.tree.get(compare_exchange_key(database, key)).context(ERR_ITER_FAILURE)? {
            Some(val) => Ok(Some(utils::decode_model(&val)?)),
            None => Ok(None),
        }
    }

    /// Every compare exchange value of a database, keyed by its user key.
    pub fn compare_exchange_values(&self, database: &str) -> Result<Vec<(String, CompareExchangeValue)>> {
        let prefix = compare_exchange_key(database, "");
        let mut values = vec![];
        for kv in self.inner.tree.scan_prefix(prefix.as_bytes()) {
            let (key, val) = kv.context(ERR_ITER_FAILURE)?;
            let key = String::from_utf8_lossy(&key[prefix.len()..]).to_string();
            values.push((key, utils::decode_model(&val)?));
        }
        Ok(values)
    }

    pub fn compare_exchange_tombstone_count(&self, database: &str) -> usize {
        self.inner.tree.scan_prefix(compare_exchange_tombstone_key(database, "").as_bytes()).count()
    }

    pub fn has_compare_exchange_tombstones(&self, database: &str) -> Result<bool> {
        Ok(self
            .inner
            .tree
            .scan_prefix(compare_exchange_tombstone_key(database, "").as_bytes())
            .next()
            .transpose()
            .context(ERR_ITER_FAILURE)?
            .is_some())
    }

    /// Check whether any compare exchange value expired as of `now`.
    pub fn has_expired_compare_exchange(&self, now: DateTime<Utc>) -> Result<bool> {
        for kv in self.inner.tree.scan_prefix(PREFIX_COMPARE_EXCHANGE) {
            let (_, val) = kv.context(ERR_ITER_FAILURE)?;
            let value: CompareExchangeValue = utils::decode_model(&val)?;
            if value.expires.map(|at| at <= now).unwrap_or(false) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

//////////////////////////////////////////////////////////////////////////////
// State Machine /////////////////////////////////////////////////////////////

enum Applied {
    /// The command id was seen before at the given index.
    Duplicate(u64),
    New { index: u64, result: CommandResult, database: Option<String> },
}

fn record_key(database: &str) -> String {
    format!("{}{}", PREFIX_RECORD, database.to_lowercase())
}

fn command_key(id: &str) -> String {
    format!("{}{}", PREFIX_COMMAND_ID, id)
}

fn compare_exchange_key(database: &str, key: &str) -> String {
    format!("{}{}/{}", PREFIX_COMPARE_EXCHANGE, database.to_lowercase(), key)
}

fn compare_exchange_tombstone_key(database: &str, key: &str) -> String {
    format!("{}{}/{}", PREFIX_COMPARE_EXCHANGE_TOMBSTONE, database.to_lowercase(), key)
}

fn read_last_index(tree: &Tree) -> Result<u64> {
    match tree.get(KEY_LAST_INDEX).context(ERR_ITER_FAILURE)? {
        Some(val) => utils::decode_u64(&val),
        None => Ok(0),
    }
}

fn read_record(tree: &Tree, database: &str) -> Result<Option<StoredRecord>> {
    match tree.get(record_key(database)).context(ERR_ITER_FAILURE)? {
        Some(val) => Ok(Some(utils::decode_model(&val).context(ERR_DECODE_RECORD)?)),
        None => Ok(None),
    }
}

fn require_record(tree: &Tree, database: &str) -> Result<StoredRecord> {
    read_record(tree, database)?.ok_or_else(|| AppError::ResourceNotFound(format!("database '{}' does not exist", database)).into())
}

fn check_record_etag(stored: &StoredRecord, expected: Option<u64>, database: &str) -> Result<()> {
    match expected {
        Some(expected) if expected != stored.etag => Err(AppError::Concurrency(format!(
            "database '{}' record etag is {} but the change was computed from {}",
            database, stored.etag, expected
        ))
        .into()),
        _ => Ok(()),
    }
}

fn put_record(batch: &mut sled::Batch, record: DatabaseRecord, etag: u64) -> Result<()> {
    let key = record_key(&record.database_name);
    batch.insert(key.as_bytes(), utils::encode_model(&StoredRecord { record, etag })?);
    Ok(())
}

/// Apply a single command to the tree. Rejected commands leave the tree untouched.
fn apply_command(tree: &Tree, term: u64, id: &str, cmd: ClusterCommand) -> Result<Applied> {
    if let Some(index) = tree.get(command_key(id)).context(ERR_ITER_FAILURE)? {
        return Ok(Applied::Duplicate(utils::decode_u64(&index)?));
    }
    let index = read_last_index(tree)? + 1;
    let database = cmd.database_name().map(String::from);
    let mut batch = sled::Batch::default();

    let result = match cmd {
        ClusterCommand::PutDatabaseRecord(mut record) => {
            if let Some(topology) = record.topology.as_mut() {
                topology.stamp.term = term;
                topology.stamp.index = index;
            }
            put_record(&mut batch, record, index)?;
            CommandResult::None
        }
        ClusterCommand::PutClusterTopology(topology) => {
            batch.insert(KEY_CLUSTER_TOPOLOGY, utils::encode_model(&topology)?);
            CommandResult::None
        }
        ClusterCommand::UpdateTopology(cmd) => apply_update_topology(tree, &mut batch, term, index, cmd)?,
        ClusterCommand::DeleteDatabase(cmd) => apply_delete_database(tree, &mut batch, index, cmd)?,
        ClusterCommand::SetIndexState(cmd) => {
            let mut stored = require_record(tree, &cmd.database_name)?;
            check_record_etag(&stored, cmd.raft_command_index, &cmd.database_name)?;
            match stored.record.auto_indexes.get_mut(&cmd.index_name) {
                Some(def) => def.state = Some(cmd.state),
                None => return Err(AppError::ResourceNotFound(format!("index '{}' does not exist", cmd.index_name)).into()),
            }
            put_record(&mut batch, stored.record, index)?;
            CommandResult::None
        }
        ClusterCommand::DeleteIndex(cmd) => {
            let mut stored = require_record(tree, &cmd.database_name)?;
            check_record_etag(&stored, cmd.raft_command_index, &cmd.database_name)?;
            stored.record.auto_indexes.remove(&cmd.index_name);
            put_record(&mut batch, stored.record, index)?;
            CommandResult::None
        }
        ClusterCommand::CleanCompareExchangeTombstones(cmd) => {
            let prefix = compare_exchange_tombstone_key(&cmd.database_name, "");
            let mut eligible = 0usize;
            for kv in tree.scan_prefix(prefix.as_bytes()) {
                let (key, val) = kv.context(ERR_ITER_FAILURE)?;
                if utils::decode_u64(&val)? > cmd.max_etag {
                    continue;
                }
                if eligible < cmd.batch_size {
                    batch.remove(key);
                }
                eligible += 1;
            }
            CommandResult::HasMore(eligible > cmd.batch_size)
        }
        ClusterCommand::DeleteExpiredCompareExchange(cmd) => {
            let mut expired = 0usize;
            for kv in tree.scan_prefix(PREFIX_COMPARE_EXCHANGE) {
                let (key, val) = kv.context(ERR_ITER_FAILURE)?;
                let value: CompareExchangeValue = utils::decode_model(&val)?;
                if !value.expires.map(|at| at <= cmd.now).unwrap_or(false) {
                    continue;
                }
                if expired < cmd.batch_size {
                    batch.remove(key);
                }
                expired += 1;
            }
            CommandResult::HasMore(expired > cmd.batch_size)
        }
        ClusterCommand::CleanUpClusterState(cmd) => {
            for (name, count) in cmd.cluster_transactions_cleanup {
                if let Some(mut stored) = read_record(tree, &name)? {
                    if stored.record.truncated_cluster_transaction_commands_count < count {
                        stored.record.truncated_cluster_transaction_commands_count = count;
                        put_record(&mut batch, stored.record, index)?;
                    }
                }
            }
            CommandResult::None
        }
        ClusterCommand::UpdatePeriodicBackupStatus(cmd) => {
            let key = PeriodicBackupStatus::generate_item_name(&cmd.database_name, cmd.status.task_id);
            batch.insert(key.as_bytes(), utils::encode_model(&cmd.status)?);
            CommandResult::None
        }
        ClusterCommand::PutCompareExchange(cmd) => {
            let value = CompareExchangeValue {
                value: cmd.value,
                index,
                expires: cmd.expires,
            };
            batch.insert(compare_exchange_key(&cmd.database_name, &cmd.key).as_bytes(), utils::encode_model(&value)?);
            batch.remove(compare_exchange_tombstone_key(&cmd.database_name, &cmd.key).as_bytes());
            bump_etag_for_backup(tree, &mut batch, &cmd.database_name, index)?;
            CommandResult::None
        }
        ClusterCommand::RemoveCompareExchange(cmd) => {
            batch.remove(compare_exchange_key(&cmd.database_name, &cmd.key).as_bytes());
            batch.insert(compare_exchange_tombstone_key(&cmd.database_name, &cmd.key).as_bytes(), &utils::encode_u64(index));
            bump_etag_for_backup(tree, &mut batch, &cmd.database_name, index)?;
            CommandResult::None
        }
    };

    batch.insert(KEY_LAST_INDEX, &utils::encode_u64(index));
    batch.insert(command_key(id).as_bytes(), &utils::encode_u64(index));
    tree.apply_batch(batch).context("error applying cluster command batch")?;
    tree.flush().context(ERR_DB_FLUSH)?;
    Ok(Applied::New { index, result, database })
}

/// Record that the database's cluster-level data changed at `index`, without changing the record etag.
fn bump_etag_for_backup(tree: &Tree, batch: &mut sled::Batch, database: &str, index: u64) -> Result<()> {
    if let Some(mut stored) = read_record(tree, database)? {
        stored.record.etag_for_backup = index;
        put_record(batch, stored.record, stored.etag)?;
    }
    Ok(())
}

fn apply_update_topology(tree: &Tree, batch: &mut sled::Batch, term: u64, index: u64, cmd: UpdateTopologyCommand) -> Result<CommandResult> {
    let mut stored = require_record(tree, &cmd.database_name)?;
    if stored.etag != cmd.raft_command_index {
        return Err(AppError::Concurrency(format!(
            "database '{}' record etag is {} but the topology update was computed from {}",
            cmd.database_name, stored.etag, cmd.raft_command_index
        ))
        .into());
    }
    let mut topology = cmd.topology;
    topology.stamp.term = term;
    topology.stamp.index = index;
    topology.nodes_modified_at = Some(cmd.at);
    stored.record.topology = Some(topology);
    put_record(batch, stored.record, index)?;
    Ok(CommandResult::None)
}

fn apply_delete_database(tree: &Tree, batch: &mut sled::Batch, index: u64, cmd: DeleteDatabaseCommand) -> Result<CommandResult> {
    let mut stored = match read_record(tree, &cmd.database_name)? {
        Some(stored) => stored,
        None if cmd.error_on_database_does_not_exists => {
            return Err(AppError::ResourceNotFound(format!("database '{}' does not exist", cmd.database_name)).into());
        }
        None => return Ok(CommandResult::None),
    };
    let status = if cmd.hard_delete {
        DeletionInProgressStatus::HardDelete
    } else {
        DeletionInProgressStatus::SoftDelete
    };
    if let Some(topology) = stored.record.topology.as_mut() {
        for node in cmd.from_nodes.iter() {
            if !topology.relevant_for(node) {
                continue;
            }
            topology.remove_from_topology(node);
            stored.record.deletion_in_progress.insert(node.clone(), status);
            if cmd.update_replication_factor {
                topology.replication_factor = topology.replication_factor.saturating_sub(1);
            }
        }
    }
    put_record(batch, stored.record, index)?;
    Ok(CommandResult::None)
}
