//! The cluster observer.
//!
//! While this node leads, the observer samples the reports of every node at a fixed period and
//! rebalances the topology of every database: failing members are moved to rehab, caught up
//! promotables and rehabs are promoted, and bad nodes are replaced. It also drives a few cluster
//! wide cleanups which only the leader may decide on.

mod cleanup;
mod health;
mod topology;

#[cfg(test)]
mod mod_test;
#[cfg(test)]
mod topology_test;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_util::sync::CancellationToken;

use crate::cluster::{Cluster, MaintenanceStats, NodeReports, RaftState, RaftStatus};
use crate::config::Config;
use crate::error::{self, AppError};
use crate::models::commands::{
    new_command_id, CleanCompareExchangeTombstonesCommand, CleanUpClusterStateCommand, ClusterCommand, DeleteDatabaseCommand,
    DeleteExpiredCompareExchangeCommand, UpdateTopologyCommand,
};
use crate::notifications::{Alert, AlertType, NotificationCenter, Severity};
use crate::utils;

pub use cleanup::CompareExchangeTombstonesState;
pub use health::{DatabaseHealth, DatabaseObservation, Observation};

/// The number of entries retained by the decision log.
const DECISION_LOG_SIZE: usize = 100;
/// Identical log messages are recorded at most once per this many iterations.
const LOG_THROTTLE_ITERATIONS: u64 = 60;
/// The throttle table is reset every this many iterations.
const LOG_THROTTLE_RESET_ITERATIONS: u64 = 10_000;
/// The time to wait for a submitted cleanup command to be applied locally.
const COMMAND_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

const METRIC_ITERATIONS: &str = "warden_observer_iterations";
const METRIC_TOPOLOGY_UPDATES: &str = "warden_observer_topology_updates";

/// An entry of the observer's decision log.
#[derive(Clone, Debug, PartialEq)]
pub struct ObserverLogEntry {
    pub database: Option<String>,
    pub iteration: u64,
    pub message: String,
    pub date: DateTime<Utc>,
}

/// State shared between the observer, its supervisor and any handles.
#[derive(Default)]
struct ObserverShared {
    decisions: Mutex<VecDeque<ObserverLogEntry>>,
    iteration: AtomicU64,
    suspended: AtomicBool,
}

/// A handle to the observer, valid across leadership terms.
#[derive(Clone)]
pub struct ObserverHandle {
    shared: Arc<ObserverShared>,
}

impl ObserverHandle {
    /// The latest decisions along with the current iteration.
    pub fn read_decisions(&self) -> (Vec<ObserverLogEntry>, u64) {
        let entries = self.shared.decisions.lock().iter().cloned().collect();
        (entries, self.shared.iteration.load(Ordering::SeqCst))
    }

    /// Pause analysis. The sampling loop keeps running.
    pub fn suspend(&self) {
        self.shared.suspended.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.shared.suspended.store(false, Ordering::SeqCst);
    }
}

//////////////////////////////////////////////////////////////////////////////
// ObserverCtl ///////////////////////////////////////////////////////////////

/// The observer of a single leadership term.
pub struct ObserverCtl {
    config: Arc<Config>,
    cluster: Cluster,
    stats: MaintenanceStats,
    notifications: NotificationCenter,
    node_tag: String,
    /// The term this observer was started for; it exits once the term changes.
    term: u64,
    start_time: DateTime<Utc>,
    iteration: u64,
    /// The iteration at which each message was last logged.
    last_logs: HashMap<String, u64>,
    shared: Arc<ObserverShared>,

    last_index_cleanup: Option<DateTime<Utc>>,
    last_tombstones_cleanup: Option<DateTime<Utc>>,
    last_expired_cleanup: Option<DateTime<Utc>>,
    has_more_tombstones: bool,

    shutdown: CancellationToken,
}

impl ObserverCtl {
    fn new(
        config: Arc<Config>, cluster: Cluster, stats: MaintenanceStats, notifications: NotificationCenter, shared: Arc<ObserverShared>, term: u64,
        shutdown: CancellationToken,
    ) -> Self {
        metrics::register_counter!(METRIC_ITERATIONS, metrics::Unit::Count, "the number of observer iterations");
        metrics::register_counter!(METRIC_TOPOLOGY_UPDATES, metrics::Unit::Count, "the number of database topology updates issued by the observer");
        let node_tag = cluster.node_tag().to_string();
        Self {
            config,
            cluster,
            stats,
            notifications,
            node_tag,
            term,
            start_time: Utc::now(),
            iteration: 0,
            last_logs: HashMap::new(),
            shared,
            last_index_cleanup: None,
            last_tombstones_cleanup: None,
            last_expired_cleanup: None,
            has_more_tombstones: false,
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!(term = self.term, node = %self.node_tag, "cluster observer has started");
        if self.wait(self.config.stabilization_time()).await {
            return Ok(());
        }
        let mut previous = self.stats.get_stats();
        if self.wait(self.config.supervisor_sample_period()).await {
            return Ok(());
        }

        while self.cluster.current_term() == self.term && !self.shutdown.is_cancelled() {
            if !self.shared.suspended.load(Ordering::SeqCst) {
                self.iteration += 1;
                self.shared.iteration.store(self.iteration, Ordering::SeqCst);
                metrics::increment_counter!(METRIC_ITERATIONS);
                let current = self.stats.get_stats();
                match self.analyze_latest_stats(current.clone(), previous.clone(), Utc::now()).await {
                    Ok(()) => previous = current,
                    Err(err) if error::is_cancellation(&err) => (),
                    Err(err) => {
                        let msg = format!("An error occurred while analyzing maintenance stats on node {}.", self.node_tag);
                        self.log_error(msg, None, &err);
                    }
                }
            }
            if self.wait(self.config.supervisor_sample_period()).await {
                break;
            }
        }

        tracing::debug!(term = self.term, node = %self.node_tag, "cluster observer has shutdown");
        Ok(())
    }

    /// Sleep for the given duration, returning true if the observer was cancelled meanwhile.
    async fn wait(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.shutdown.cancelled() => true,
        }
    }

    /// Run one observation round over every database.
    #[tracing::instrument(level = "debug", skip(self, current, previous, now), fields(iteration = self.iteration))]
    pub(crate) async fn analyze_latest_stats(&mut self, current: Arc<NodeReports>, previous: Arc<NodeReports>, now: DateTime<Utc>) -> Result<()> {
        if !self.cluster.is_leader() {
            return Ok(());
        }

        let clean_unused_indexes = is_due(self.last_index_cleanup, now, self.config.index_cleanup_interval());
        let clean_tombstones = self.has_more_tombstones || is_due(self.last_tombstones_cleanup, now, self.config.compare_exchange_tombstones_cleanup_interval());
        if clean_tombstones {
            self.has_more_tombstones = false;
        }

        let cluster_topology = Arc::new(self.cluster.read_cluster_topology()?);
        let leadership_duration = self.cluster.leadership_duration(now);
        let stabilization = self.config.stabilization_time();

        let mut updates: Vec<(String, UpdateTopologyCommand)> = vec![];
        let mut deletions: Vec<DeleteDatabaseCommand> = vec![];
        let mut index_commands: Vec<(String, String, ClusterCommand)> = vec![];
        let mut tombstone_commands: Vec<CleanCompareExchangeTombstonesCommand> = vec![];
        let mut cleanup_state: BTreeMap<String, i64> = BTreeMap::new();

        for name in self.cluster.database_names()? {
            if self.shutdown.is_cancelled() {
                return Err(AppError::Cancelled.into());
            }

            let (record, etag) = match self.cluster.read_database_record(&name)? {
                Some(found) => found,
                None => {
                    self.log_message(format!("Can't analyze the stats of database the {}, because the database record is null.", name), Some(name.as_str()));
                    continue;
                }
            };
            let topology = match record.topology.as_ref() {
                Some(topology) => topology,
                None => {
                    self.log_message(format!("Can't analyze the stats of database the {}, because the database topology is null.", name), Some(name.as_str()));
                    continue;
                }
            };
            if topology.count() == 0 {
                self.log_message(format!("Skip analyze the stats of database the {}, because it being deleted", name), Some(name.as_str()));
                continue;
            }

            let modified_at = match topology.nodes_modified_at {
                Some(modified_at) => modified_at,
                None => {
                    // Topologies written before the modification time was tracked.
                    let cmd = UpdateTopologyCommand {
                        database_name: name.clone(),
                        topology: topology.clone(),
                        raft_command_index: etag,
                        at: now,
                    };
                    updates.push(("Updating ModifiedAt".into(), cmd));
                    continue;
                }
            };

            let needs_more_time = if self.term > topology.stamp.term {
                leadership_duration.map(|duration| duration < stabilization).unwrap_or(true)
            } else {
                self.term == topology.stamp.term && utils::elapsed_since(now, modified_at) < stabilization
            };
            if needs_more_time {
                self.log_message(
                    format!("We give more time for the '{}' stats to become stable, so we skip analyzing it for now.", name),
                    Some(name.as_str()),
                );
                continue;
            }
            if record.disabled {
                continue;
            }

            let mut state = match DatabaseObservation::new(record, etag, cluster_topology.clone(), current.clone(), previous.clone()) {
                Some(state) => state,
                None => continue,
            };
            if let Some(reason) = self.update_database_topology(&mut state, &mut deletions, now) {
                updates.push((
                    reason,
                    UpdateTopologyCommand {
                        database_name: name.clone(),
                        topology: state.topology.clone(),
                        raft_command_index: etag,
                        at: now,
                    },
                ));
            }

            if let Some(completed) = cleanup::clean_up_database_values(&state) {
                cleanup_state.insert(name.clone(), completed);
            }
            if clean_unused_indexes {
                for (reason, cmd) in cleanup::get_unused_auto_indexes(&self.config, &state) {
                    index_commands.push((name.clone(), reason, cmd));
                }
            }
            if clean_tombstones {
                match cleanup::get_compare_exchange_tombstones_state(&self.cluster, &state)? {
                    CompareExchangeTombstonesState::HasMore(max_etag) => tombstone_commands.push(CleanCompareExchangeTombstonesCommand {
                        database_name: name.clone(),
                        max_etag,
                        batch_size: cleanup::COMPARE_EXCHANGE_TOMBSTONES_BATCH,
                    }),
                    CompareExchangeTombstonesState::InvalidDatabaseObservationState => self.has_more_tombstones = true,
                    CompareExchangeTombstonesState::InvalidPeriodicBackupStatus | CompareExchangeTombstonesState::NoMoreTombstones => (),
                }
            }
        }

        if clean_unused_indexes {
            // A conflicting index change is retried on the next iteration instead of the next interval.
            let mut all_applied = true;
            for (database, reason, cmd) in index_commands {
                if self.put_cleanup(Some(database.as_str()), new_command_id(), cmd).await? {
                    self.add_to_decision_log(Some(database.as_str()), reason);
                } else {
                    all_applied = false;
                }
            }
            if all_applied {
                self.last_index_cleanup = Some(now);
            }
        }

        if clean_tombstones {
            for cmd in tombstone_commands {
                let (index, result) = self
                    .cluster
                    .send_to_leader(new_command_id(), ClusterCommand::CleanCompareExchangeTombstones(cmd))
                    .await?;
                self.cluster.wait_for_index(index, COMMAND_WAIT_TIMEOUT).await?;
                self.has_more_tombstones |= result.has_more();
            }
            if !self.has_more_tombstones {
                self.last_tombstones_cleanup = Some(now);
            }
        }

        if is_due(self.last_expired_cleanup, now, self.config.compare_exchange_expired_cleanup_interval()) && !self.remove_expired_compare_exchange(now).await? {
            self.last_expired_cleanup = Some(now);
        }

        for (reason, cmd) in updates {
            let database = cmd.database_name.clone();
            self.add_to_decision_log(Some(database.as_str()), reason.clone());
            if !self.update_topology(cmd).await? {
                continue;
            }
            metrics::increment_counter!(METRIC_TOPOLOGY_UPDATES);
            let alert = Alert::new(
                Some(database.as_str()),
                format!("Topology of database '{}' was changed", database),
                reason,
                AlertType::DatabaseTopologyWarning,
                Severity::Warning,
            );
            self.notifications.add(alert, false);
        }

        for cmd in deletions {
            self.add_to_decision_log(
                Some(cmd.database_name.as_str()),
                format!(
                    "We reached the replication factor on '{}', so we try to remove promotables/rehabs from: {}",
                    cmd.database_name,
                    cmd.from_nodes.join(", ")
                ),
            );
            self.ensure_leading("deleting the database from redundant nodes")?;
            let database = cmd.database_name.clone();
            self.put_cleanup(Some(database.as_str()), new_command_id(), ClusterCommand::DeleteDatabase(cmd)).await?;
        }

        if !cleanup_state.is_empty() {
            let id = cleanup::cleanup_command_id(cleanup_state.iter());
            if !self.cluster.contains_command_id(&id)? {
                for (database, completed) in cleanup_state.iter() {
                    self.add_to_decision_log(Some(database.as_str()), format!("Should clean up values up to raft index {}.", completed));
                }
                self.ensure_leading("cleaning up the cluster state")?;
                let cmd = CleanUpClusterStateCommand {
                    cluster_transactions_cleanup: cleanup_state,
                };
                self.put_cleanup(None, id, ClusterCommand::CleanUpClusterState(cmd)).await?;
            }
        }

        Ok(())
    }

    /// Remove one batch of expired compare exchange values, returning true if more remain.
    async fn remove_expired_compare_exchange(&self, now: DateTime<Utc>) -> Result<bool> {
        if !self.cluster.has_expired_compare_exchange(now)? {
            return Ok(false);
        }
        let cmd = DeleteExpiredCompareExchangeCommand {
            now,
            batch_size: cleanup::EXPIRED_COMPARE_EXCHANGE_BATCH,
        };
        let (index, result) = self
            .cluster
            .send_to_leader(new_command_id(), ClusterCommand::DeleteExpiredCompareExchange(cmd))
            .await?;
        self.cluster.wait_for_index(index, COMMAND_WAIT_TIMEOUT).await?;
        Ok(result.has_more())
    }

    /// Submit a topology update, returning false if it lost an optimistic concurrency race.
    async fn update_topology(&mut self, cmd: UpdateTopologyCommand) -> Result<bool> {
        self.ensure_leading("updating the database databaseTopology")?;
        let database = cmd.database_name.clone();
        match self.cluster.put(new_command_id(), ClusterCommand::UpdateTopology(cmd)).await {
            Ok(_) => Ok(true),
            Err(err) if error::is_concurrency(&err) => {
                self.add_to_decision_log(
                    Some(database.as_str()),
                    format!("Topology of database '{}' was not changed, reason: ConcurrencyException", database),
                );
                Ok(false)
            }
            Err(err) => Err(err).context("error updating database topology"),
        }
    }

    /// Submit a cleanup command, returning false if it lost an optimistic concurrency race.
    async fn put_cleanup(&self, database: Option<&str>, id: String, cmd: ClusterCommand) -> Result<bool> {
        let name = cmd.name();
        match self.cluster.put(id, cmd).await {
            Ok(_) => Ok(true),
            Err(err) if error::is_concurrency(&err) => {
                self.add_to_decision_log(database, format!("Command {} was not applied, reason: ConcurrencyException", name));
                Ok(false)
            }
            Err(err) => Err(err).with_context(|| format!("error submitting {} command", name)),
        }
    }

    fn ensure_leading(&self, action: &str) -> Result<()> {
        if self.cluster.leader_tag().as_deref() != Some(self.node_tag.as_str()) {
            return Err(AppError::NotLeading(format!("This node is no longer the leader, so we abort {}", action)).into());
        }
        Ok(())
    }

    //////////////////////////////////////////////////////////////////////////
    // Decision Log //////////////////////////////////////////////////////////

    /// Record a message, throttling identical messages.
    pub(crate) fn log_message(&mut self, msg: String, database: Option<&str>) {
        if self.iteration % LOG_THROTTLE_RESET_ITERATIONS == 0 {
            self.last_logs.clear();
        }
        if let Some(last) = self.last_logs.get(&msg) {
            if last + LOG_THROTTLE_ITERATIONS > self.iteration {
                return;
            }
        }
        self.last_logs.insert(msg.clone(), self.iteration);
        self.add_to_decision_log(database, msg);
    }

    fn log_error(&mut self, msg: String, database: Option<&str>, err: &anyhow::Error) {
        tracing::error!(error = ?err, database = ?database, "{}", msg);
        self.log_message(format!("{}\nError: {:#}", msg, err), database);
    }

    fn add_to_decision_log(&self, database: Option<&str>, msg: String) {
        tracing::info!(database = ?database, iteration = self.iteration, "{}", msg);
        let mut decisions = self.shared.decisions.lock();
        if decisions.len() >= DECISION_LOG_SIZE {
            decisions.pop_front();
        }
        decisions.push_back(ObserverLogEntry {
            database: database.map(String::from),
            iteration: self.iteration,
            message: msg,
            date: Utc::now(),
        });
    }
}

#[cfg(test)]
impl ObserverCtl {
    /// An observer of the test environment's current term, started an hour ago.
    pub(crate) fn new_test(env: &crate::fixtures::TestEnv) -> Self {
        let mut ctl = Self::new(
            env.config.clone(),
            env.cluster.clone(),
            env.stats.clone(),
            env.notifications.clone(),
            Arc::new(ObserverShared::default()),
            env.cluster.current_term(),
            CancellationToken::new(),
        );
        ctl.start_time = Utc::now() - chrono::Duration::hours(1);
        ctl
    }

    pub(crate) fn decisions(&self) -> Vec<ObserverLogEntry> {
        self.shared.decisions.lock().iter().cloned().collect()
    }
}

/// Whether a periodic sweep last run at `last` is due again.
fn is_due(last: Option<DateTime<Utc>>, now: DateTime<Utc>, interval: Duration) -> bool {
    match last {
        Some(last) => utils::elapsed_since(now, last) >= interval,
        None => true,
    }
}

//////////////////////////////////////////////////////////////////////////////
// ObserverSupervisor ////////////////////////////////////////////////////////

/// Runs an observer for as long as this node leads, replacing it on every new term.
pub struct ObserverSupervisor {
    config: Arc<Config>,
    cluster: Cluster,
    stats: MaintenanceStats,
    notifications: NotificationCenter,
    shared: Arc<ObserverShared>,
    status_rx: WatchStream<RaftStatus>,
    /// The term, cancellation token and task of the running observer.
    active: Option<(u64, CancellationToken, JoinHandle<Result<()>>)>,
    shutdown_rx: BroadcastStream<()>,
}

impl ObserverSupervisor {
    pub fn new(
        config: Arc<Config>, cluster: Cluster, stats: MaintenanceStats, notifications: NotificationCenter, shutdown_tx: broadcast::Sender<()>,
    ) -> (Self, ObserverHandle) {
        let shared = Arc::new(ObserverShared::default());
        let status_rx = WatchStream::new(cluster.subscribe_status());
        let handle = ObserverHandle { shared: shared.clone() };
        let this = Self {
            config,
            cluster,
            stats,
            notifications,
            shared,
            status_rx,
            active: None,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
        };
        (this, handle)
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!("observer supervisor has started");
        loop {
            tokio::select! {
                Some(status) = self.status_rx.next() => self.handle_status(status).await,
                _ = self.shutdown_rx.next() => break,
            }
        }
        self.stop_observer().await;
        tracing::debug!("observer supervisor has shutdown");
        Ok(())
    }

    async fn handle_status(&mut self, status: RaftStatus) {
        let running_term = self.active.as_ref().map(|(term, _, _)| *term);
        if status.state != RaftState::Leader {
            self.stop_observer().await;
            return;
        }
        if running_term == Some(status.term) {
            return;
        }
        self.stop_observer().await;
        tracing::info!(term = status.term, "starting cluster observer for new leadership term");
        let token = CancellationToken::new();
        let ctl = ObserverCtl::new(
            self.config.clone(),
            self.cluster.clone(),
            self.stats.clone(),
            self.notifications.clone(),
            self.shared.clone(),
            status.term,
            token.clone(),
        );
        self.active = Some((status.term, token, ctl.spawn()));
    }

    async fn stop_observer(&mut self) {
        let (term, token, handle) = match self.active.take() {
            Some(active) => active,
            None => return,
        };
        token.cancel();
        match handle.await {
            Ok(Ok(())) => (),
            Ok(Err(err)) => tracing::error!(error = ?err, term, "cluster observer exited with an error"),
            Err(err) => tracing::error!(error = ?err, term, "error joining cluster observer task"),
        }
    }
}
