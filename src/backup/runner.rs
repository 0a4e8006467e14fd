//! The per-database owner of every periodic backup task.
//!
//! The runner keeps one timer per configured task. When a timer fires, responsibility for the
//! task is re-validated against the current topology before a run is spawned. Runs execute on
//! their own tokio task, so the timers are never blocked by a backup in progress.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backup::counter::{BackupPermit, ConcurrentBackupsCounter};
use crate::backup::files;
use crate::backup::next_backup::{get_next_backup_details, get_next_backup_occurrence, is_full_backup_forced, NextBackup, NextBackupParams};
use crate::backup::retention::RetentionStrategy;
use crate::backup::status::{compare_periodic_backup_status, BackupStatusStore};
use crate::backup::task::{backup_description, operation_notification_id, BackupParameters, BackupTask};
use crate::backup::timer::BackupTimer;
use crate::backup::upload::UploaderRegistry;
use crate::change_vector;
use crate::error::{backup_delay, is_cancellation};
use crate::instance::DatabaseInstance;
use crate::models::backup::{BackupError, BackupType, PeriodicBackupConfiguration, PeriodicBackupStatus};
use crate::models::topology::{DatabaseRecord, DatabaseTopology};
use crate::notifications::{Alert, AlertType, Severity};
use crate::storage::{TombstoneCleanerParticipant, TombstoneType, ALL_COUNTERS, ALL_DOCUMENTS_COLLECTION, ALL_TIME_SERIES};

/// The identifier used when taking part in tombstone cleanup.
pub const TOMBSTONE_CLEANER_IDENTIFIER: &str = "Periodic Backup";

/// A database woken up for a backup runs it right away rather than on the next occurrence.
const WAKE_UP_LEEWAY_MINUTES: i64 = 1;

/// Where a task stands with regard to this node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    Disabled,
    ActiveByCurrentNode,
    ActiveByOtherNode,
    ClusterDown,
}

/// A backup run in progress.
#[derive(Clone, Debug, PartialEq)]
pub struct RunningBackup {
    pub start_time: DateTime<Utc>,
    pub is_full: bool,
    pub running_backup_task_id: u64,
}

/// A summary of the backups of a database.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BackupInfo {
    /// The most recent successful backup of any task.
    pub last_backup: Option<DateTime<Utc>>,
    /// The nearest upcoming backup of a task this node is responsible for.
    pub next_backup: Option<NextBackup>,
    pub backup_task_type: Option<BackupType>,
    /// The display names of the tasks which are not disabled.
    pub tasks: Vec<String>,
}

/// The collaborators a runner is built from.
pub struct RunnerParams {
    pub instance: Arc<DatabaseInstance>,
    pub status_store: Arc<dyn BackupStatusStore>,
    pub counter: ConcurrentBackupsCounter,
    pub uploaders: Arc<UploaderRegistry>,
    pub retention: Arc<dyn RetentionStrategy>,
    /// The instant the database was woken up for a backup, if it was.
    pub wake_up: Option<DateTime<Utc>>,
}

/// The state of one configured task.
struct PeriodicBackup {
    configuration: PeriodicBackupConfiguration,
    /// The status as last seen by this node, possibly newer than the committed one.
    backup_status: Option<PeriodicBackupStatus>,
    running: Option<RunningTask>,
    timer: Option<BackupTimer>,
}

struct RunningTask {
    id: u64,
    start_time: DateTime<Utc>,
    is_full: bool,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicBackup {
    fn new(configuration: PeriodicBackupConfiguration) -> Self {
        Self {
            configuration,
            backup_status: None,
            running: None,
            timer: None,
        }
    }

    fn has_scheduled_backup(&self) -> bool {
        self.timer.is_some()
    }

    fn disable_future_backups(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }

    /// Stop future runs, handing back a run in progress so that it may finish.
    fn dispose(&mut self) -> Option<JoinHandle<()>> {
        self.disable_future_backups();
        self.running.as_mut().and_then(|running| running.handle.take())
    }
}

/// Owns the timers and runs of every periodic backup task of one database.
#[derive(Clone)]
pub struct PeriodicBackupRunner {
    inner: Arc<RunnerInner>,
}

struct RunnerInner {
    instance: Arc<DatabaseInstance>,
    status_store: Arc<dyn BackupStatusStore>,
    counter: ConcurrentBackupsCounter,
    uploaders: Arc<UploaderRegistry>,
    retention: Arc<dyn RetentionStrategy>,
    temp_path: PathBuf,
    wake_up: Option<DateTime<Utc>>,
    /// Cancelled when the runner is disposed or the database shuts down.
    token: CancellationToken,
    disposed: AtomicBool,
    tasks: Mutex<HashMap<u64, PeriodicBackup>>,
    /// Runs of removed tasks, awaited on dispose.
    inactive: Mutex<Vec<JoinHandle<()>>>,
}

impl PeriodicBackupRunner {
    /// Create a new runner and subscribe it to tombstone cleanup of its database.
    pub fn new(params: RunnerParams) -> Self {
        let RunnerParams {
            instance,
            status_store,
            counter,
            uploaders,
            retention,
            wake_up,
        } = params;
        let temp_path = PathBuf::from(&instance.config().backup_temp_path).join(instance.name());
        if let Err(err) = std::fs::remove_dir_all(&temp_path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(error = ?err, path = %temp_path.display(), "error clearing backup temp folder");
            }
        }
        if let Err(err) = std::fs::create_dir_all(&temp_path) {
            tracing::warn!(error = ?err, path = %temp_path.display(), "error creating backup temp folder");
        }
        let token = instance.shutdown_token().child_token();
        let runner = Self {
            inner: Arc::new(RunnerInner {
                instance,
                status_store,
                counter,
                uploaders,
                retention,
                temp_path,
                wake_up: wake_up.map(|at| at - ChronoDuration::minutes(WAKE_UP_LEEWAY_MINUTES)),
                token,
                disposed: AtomicBool::new(false),
                tasks: Mutex::new(HashMap::new()),
                inactive: Mutex::new(vec![]),
            }),
        };
        runner.inner.instance.subscribe_tombstone_cleaner(Arc::new(runner.clone()));
        runner
    }

    fn database(&self) -> &str {
        self.inner.instance.name()
    }

    fn node_tag(&self) -> &str {
        self.inner.instance.cluster().node_tag()
    }

    //////////////////////////////////////////////////////////////////////////
    // Configuration /////////////////////////////////////////////////////////

    /// Reconcile the tasks of this runner with the given database record.
    ///
    /// New tasks are armed from their committed status, changed tasks are re-armed when their
    /// frequency or responsibility changed and removed tasks stop firing. Runs in progress of
    /// removed tasks finish on their own.
    #[tracing::instrument(level = "debug", skip(self, record), fields(database = %self.database()))]
    pub fn update_configurations(&self, record: &DatabaseRecord) {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return;
        }
        let mut all_task_ids = HashSet::new();
        for configuration in record.periodic_backups.iter() {
            all_task_ids.insert(configuration.task_id);
            let task_status = self.get_task_status(record.topology.as_ref(), configuration, false);
            self.update_periodic_backup(configuration.clone(), task_status);
        }

        let mut removed = vec![];
        {
            let mut tasks = self.inner.tasks.lock();
            let deleted: Vec<u64> = tasks.keys().filter(|id| !all_task_ids.contains(id)).copied().collect();
            for task_id in deleted {
                if let Some(mut task) = tasks.remove(&task_id) {
                    tracing::info!(database = %self.database(), task_id, "backup task was removed, stopping future backups");
                    removed.extend(task.dispose());
                }
            }
        }
        self.inner.inactive.lock().extend(removed);
    }

    fn update_periodic_backup(&self, configuration: PeriodicBackupConfiguration, task_status: TaskStatus) {
        let task_id = configuration.task_id;
        let is_new = !self.inner.tasks.lock().contains_key(&task_id);
        if is_new {
            // Read before locking, the committed status decides the first occurrence.
            let next = match task_status {
                TaskStatus::ActiveByCurrentNode => self.next_from_committed_status(&configuration),
                _ => None,
            };
            let mut tasks = self.inner.tasks.lock();
            let task = tasks.entry(task_id).or_insert_with(|| PeriodicBackup::new(configuration));
            if let Some(next) = next {
                tracing::info!(database = %self.database(), task_id, "new backup task, arranging a backup timer");
                task.timer = Some(self.arm(next));
            }
            return;
        }

        let (previous, running, has_scheduled_backup) = {
            let mut tasks = self.inner.tasks.lock();
            let task = match tasks.get_mut(&task_id) {
                Some(task) => task,
                None => return,
            };
            let previous = std::mem::replace(&mut task.configuration, configuration.clone());
            if previous.backup_type != configuration.backup_type {
                task.backup_status = None;
            }
            match task_status {
                TaskStatus::Disabled => {
                    task.disable_future_backups();
                    tracing::info!(database = %self.database(), task_id, "backup task is disabled, cancelling its backups");
                    return;
                }
                TaskStatus::ActiveByOtherNode => {
                    tracing::debug!(database = %self.database(), task_id, "backup task is active on another node, keeping its timer");
                    return;
                }
                TaskStatus::ClusterDown => {
                    tracing::info!(database = %self.database(), task_id, "cluster is down, backup task continues on this node");
                    return;
                }
                TaskStatus::ActiveByCurrentNode => (),
            }
            (previous, task.running.as_ref().map(|running| running.start_time), task.has_scheduled_backup())
        };

        if let Some(since) = running {
            tracing::debug!(database = %self.database(), task_id, %since, "backup task is running, it reschedules itself once done");
            return;
        }
        if !previous.has_backup_frequency_changed(&configuration) && has_scheduled_backup {
            return;
        }
        tracing::info!(database = %self.database(), task_id, "backup frequency changed or no backup is scheduled, re-arranging the timer");
        let next = self.next_from_committed_status(&configuration);
        let mut tasks = self.inner.tasks.lock();
        if let Some(task) = tasks.get_mut(&task_id) {
            match next {
                Some(next) => task.timer = Some(self.arm(next)),
                None => task.disable_future_backups(),
            }
        }
    }

    fn next_from_committed_status(&self, configuration: &PeriodicBackupConfiguration) -> Option<NextBackup> {
        let status = match self.inner.status_store.read_status(self.database(), configuration.task_id) {
            Ok(status) => compare_periodic_backup_status(configuration.task_id, status, None),
            Err(err) => {
                tracing::error!(error = ?err, database = %self.database(), task_id = configuration.task_id, "error reading backup status");
                PeriodicBackupStatus::new(configuration.task_id)
            }
        };
        self.next_backup_details(configuration, &status, Utc::now())
    }

    //////////////////////////////////////////////////////////////////////////
    // Responsibility ////////////////////////////////////////////////////////

    fn get_task_status(&self, topology: Option<&DatabaseTopology>, configuration: &PeriodicBackupConfiguration, disable_log: bool) -> TaskStatus {
        if configuration.disabled {
            return TaskStatus::Disabled;
        }
        if !configuration.has_backup() {
            if !disable_log {
                self.inner.instance.notifications().add(
                    Alert::new(
                        Some(self.database()),
                        "Periodic Backup",
                        format!("All backup destinations are disabled for backup task id: {}", configuration.task_id),
                        AlertType::PeriodicBackup,
                        Severity::Info,
                    ),
                    true,
                );
            }
            return TaskStatus::Disabled;
        }
        let topology = match topology {
            Some(topology) => topology,
            None => return TaskStatus::Disabled,
        };

        let status = self.backup_status_or_default(configuration.task_id);
        let state = self.inner.instance.cluster().status().state;
        match topology.whose_task_is_it(state, configuration, status.node_tag.as_deref()) {
            None => TaskStatus::ClusterDown,
            Some(node) if node == self.node_tag() => TaskStatus::ActiveByCurrentNode,
            Some(node) => {
                if !disable_log {
                    tracing::debug!(database = %self.database(), task_id = configuration.task_id, responsible = %node, "backup is managed by another node");
                }
                TaskStatus::ActiveByOtherNode
            }
        }
    }

    /// The node responsible for the given task, `None` while the cluster is down.
    pub fn whose_task_is_it(&self, task_id: u64) -> Result<Option<String>> {
        let configuration = self.configuration(task_id)?;
        if configuration.disabled {
            bail!("Backup task id: {} is disabled", task_id);
        }
        if !configuration.has_backup() {
            bail!("All backup destinations are disabled for backup task id: {}", task_id);
        }
        let topology = match self.inner.instance.read_record()? {
            Some((record, _)) => record.topology,
            None => None,
        };
        let topology = match topology {
            Some(topology) => topology,
            None => return Ok(None),
        };
        let status = self.get_backup_status(task_id)?;
        let state = self.inner.instance.cluster().status().state;
        Ok(topology.whose_task_is_it(state, &configuration, status.node_tag.as_deref()))
    }

    fn configuration(&self, task_id: u64) -> Result<PeriodicBackupConfiguration> {
        self.inner
            .tasks
            .lock()
            .get(&task_id)
            .map(|task| task.configuration.clone())
            .ok_or_else(|| anyhow!("Backup task id: {} doesn't exist", task_id))
    }

    //////////////////////////////////////////////////////////////////////////
    // Status ////////////////////////////////////////////////////////////////

    /// The most recent status of the task, from the cluster or from this node's memory.
    pub fn get_backup_status(&self, task_id: u64) -> Result<PeriodicBackupStatus> {
        let in_memory = self.inner.tasks.lock().get(&task_id).and_then(|task| task.backup_status.clone());
        let committed = self.inner.status_store.read_status(self.database(), task_id)?;
        Ok(compare_periodic_backup_status(task_id, committed, in_memory))
    }

    fn backup_status_or_default(&self, task_id: u64) -> PeriodicBackupStatus {
        self.get_backup_status(task_id).unwrap_or_else(|err| {
            tracing::error!(error = ?err, database = %self.database(), task_id, "error reading backup status");
            PeriodicBackupStatus::new(task_id)
        })
    }

    /// The run in progress of the given task, if any.
    pub fn on_going_backup(&self, task_id: u64) -> Option<RunningBackup> {
        let tasks = self.inner.tasks.lock();
        let running = tasks.get(&task_id)?.running.as_ref()?;
        Some(RunningBackup {
            start_time: running.start_time,
            is_full: running.is_full,
            running_backup_task_id: running.id,
        })
    }

    pub fn has_running_backups(&self) -> bool {
        self.inner.tasks.lock().values().any(|task| task.running.is_some())
    }

    /// The ids of the configured tasks.
    pub fn task_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.inner.tasks.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// A summary of the last and next backups of this database.
    pub fn backup_info(&self) -> Result<BackupInfo> {
        let configurations: Vec<PeriodicBackupConfiguration> =
            self.inner.tasks.lock().values().map(|task| task.configuration.clone()).collect();
        let topology = self.inner.instance.read_record()?.and_then(|(record, _)| record.topology);
        let now = Utc::now();
        let mut info = BackupInfo::default();
        for configuration in configurations.iter().filter(|cfg| !cfg.disabled) {
            info.tasks.push(configuration.display_name());
            let status = self.get_backup_status(configuration.task_id)?;
            let last = status.last_full_backup.max(status.last_incremental_backup);
            if last > info.last_backup {
                info.last_backup = last;
            }
            if self.get_task_status(topology.as_ref(), configuration, true) != TaskStatus::ActiveByCurrentNode {
                continue;
            }
            let params = NextBackupParams {
                configuration,
                status: &status,
                responsible_node: self.node_tag(),
                wake_up: self.inner.wake_up,
                now,
            };
            if let Some(next) = get_next_backup_details(&params, |_, _| ()) {
                if info.next_backup.as_ref().map(|current| next.date_time < current.date_time).unwrap_or(true) {
                    info.backup_task_type = Some(configuration.backup_type);
                    info.next_backup = Some(next);
                }
            }
        }
        Ok(info)
    }

    /// The next instant at which the database must be awake for a backup to run.
    pub fn get_wake_database_time(&self) -> Result<Option<DateTime<Utc>>> {
        let configurations: Vec<PeriodicBackupConfiguration> =
            self.inner.tasks.lock().values().map(|task| task.configuration.clone()).collect();
        if configurations.is_empty() {
            return Ok(None);
        }
        let last_etag = self.inner.instance.store().read_last_etag()?;
        let topology = self.inner.instance.read_record()?.and_then(|(record, _)| record.topology);
        let mut wake_up: Option<DateTime<Utc>> = None;
        for configuration in configurations.iter() {
            if let Some(next) = self.next_wake_up_time(last_etag, configuration, topology.as_ref())? {
                wake_up = Some(wake_up.map(|current| current.min(next)).unwrap_or(next));
            }
        }
        Ok(wake_up)
    }

    /// Full backups always wake the database, incrementals only when there were changes.
    fn next_wake_up_time(
        &self, last_etag: i64, configuration: &PeriodicBackupConfiguration, topology: Option<&DatabaseTopology>,
    ) -> Result<Option<DateTime<Utc>>> {
        if configuration.disabled || !configuration.has_backup_frequency() || !configuration.has_backup() {
            return Ok(None);
        }
        let now = Utc::now();
        let status = match self.inner.status_store.read_status(self.database(), configuration.task_id)? {
            Some(status) => status,
            None => {
                tracing::info!(database = %self.database(), task_id = configuration.task_id, "backup task was never backed up");
                return Ok(Some(now));
            }
        };
        let state = self.inner.instance.cluster().status().state;
        let responsible = topology.and_then(|topology| topology.whose_task_is_it(state, configuration, status.node_tag.as_deref()));
        match responsible.as_deref() {
            None => return Ok(Some(now)),
            Some(node) if node != self.node_tag() => return Ok(None),
            Some(_) => (),
        }

        let next = match self.next_backup_details(configuration, &status, now) {
            Some(next) => next,
            None => return Ok(None),
        };
        if next.date_time < now {
            return Ok(Some(now));
        }
        if status.last_etag != Some(last_etag) || next.is_full {
            return Ok(Some(next.date_time));
        }

        // No changes and the next backup is incremental, so only the next full one matters.
        let last_full = status.last_full_backup_internal.unwrap_or(now);
        let next_full = match get_next_backup_occurrence(configuration.full_backup_frequency.as_deref(), last_full) {
            Ok(next_full) => next_full,
            Err(err) => {
                self.on_parsing_error(configuration, configuration.full_backup_frequency.as_deref().unwrap_or_default(), &err);
                None
            }
        };
        Ok(next_full.map(|next_full| if next_full < now { now } else { next_full }))
    }

    //////////////////////////////////////////////////////////////////////////
    // Scheduling ////////////////////////////////////////////////////////////

    fn next_backup_details(&self, configuration: &PeriodicBackupConfiguration, status: &PeriodicBackupStatus, now: DateTime<Utc>) -> Option<NextBackup> {
        let params = NextBackupParams {
            configuration,
            status,
            responsible_node: self.node_tag(),
            wake_up: self.inner.wake_up,
            now,
        };
        let next = get_next_backup_details(&params, |frequency, err| self.on_parsing_error(configuration, frequency, err));
        if next.is_none() {
            self.on_missing_next_backup_info(configuration);
        }
        next
    }

    fn on_parsing_error(&self, configuration: &PeriodicBackupConfiguration, frequency: &str, err: &anyhow::Error) {
        let mut message = format!("Couldn't parse periodic backup frequency {}, task id: {}", frequency, configuration.task_id);
        if let Some(name) = configuration.name.as_deref().filter(|name| !name.trim().is_empty()) {
            message.push_str(&format!(", backup name: {}", name));
        }
        message.push_str(&format!(", error: {}", err));
        tracing::error!(database = %self.database(), "{}", message);
        self.inner.instance.notifications().add(
            Alert::new(Some(self.database()), "Backup frequency parsing error", message, AlertType::PeriodicBackup, Severity::Error)
                .with_details(format!("{:?}", err)),
            true,
        );
    }

    fn on_missing_next_backup_info(&self, configuration: &PeriodicBackupConfiguration) {
        let mut message = format!(
            "Couldn't schedule next backup full backup frequency: {}, incremental backup frequency: {}",
            configuration.full_backup_frequency.as_deref().unwrap_or_default(),
            configuration.incremental_backup_frequency.as_deref().unwrap_or_default()
        );
        if let Some(name) = configuration.name.as_deref().filter(|name| !name.trim().is_empty()) {
            message.push_str(&format!(", backup name: {}", name));
        }
        self.inner.instance.notifications().add(
            Alert::new(
                Some(self.database()),
                "Couldn't schedule next backup, this shouldn't happen",
                message,
                AlertType::PeriodicBackup,
                Severity::Warning,
            ),
            true,
        );
    }

    /// Arm a timer which calls back into this runner, without keeping the runner alive.
    fn arm(&self, next: NextBackup) -> BackupTimer {
        tracing::debug!(database = %self.database(), task_id = next.task_id, is_full = next.is_full, at = %next.date_time, "backup timer armed");
        let weak: Weak<RunnerInner> = Arc::downgrade(&self.inner);
        let max = self.inner.instance.config().max_timer_timeout();
        BackupTimer::arm(next, max, move |next| match weak.upgrade() {
            Some(inner) => PeriodicBackupRunner { inner }.fire(next),
            None => futures::future::ready(()).boxed(),
        })
    }

    fn fire(self, next: NextBackup) -> BoxFuture<'static, ()> {
        async move { self.on_timer(next).await }.boxed()
    }

    #[tracing::instrument(level = "debug", skip(self, next), fields(database = %self.database(), task_id = next.task_id, is_full = next.is_full))]
    async fn on_timer(&self, next: NextBackup) {
        let task_id = next.task_id;
        if self.inner.token.is_cancelled() {
            tracing::debug!(database = %self.database(), task_id, "runner is shutting down, backup cancelled");
            return;
        }
        let configuration = match self.inner.tasks.lock().get(&task_id) {
            Some(task) => task.configuration.clone(),
            None => {
                tracing::debug!(database = %self.database(), task_id, "backup task doesn't exist anymore");
                return;
            }
        };
        let topology = match self.inner.instance.read_record() {
            Ok(Some((record, _))) => record.topology,
            Ok(None) => {
                tracing::info!(database = %self.database(), task_id, "database record is missing, backup not started");
                return;
            }
            Err(err) => {
                tracing::error!(error = ?err, database = %self.database(), task_id, "error reading database record in backup timer");
                return;
            }
        };

        let task_status = self.get_task_status(topology.as_ref(), &configuration, false);
        match task_status {
            TaskStatus::ActiveByCurrentNode => {
                tracing::info!(database = %self.database(), task_id, "backup will be executed on this node");
            }
            TaskStatus::ClusterDown => {
                tracing::info!(database = %self.database(), task_id, "cluster is down, backup rescheduled on this node");
                let retry = NextBackup::after(task_id, next.is_full, self.inner.instance.config().cluster_down_retry(), Utc::now());
                if let Some(task) = self.inner.tasks.lock().get_mut(&task_id) {
                    task.timer = Some(self.arm(retry));
                }
                return;
            }
            TaskStatus::Disabled | TaskStatus::ActiveByOtherNode => {
                tracing::info!(database = %self.database(), task_id, status = ?task_status, "backup cancelled on this node");
                if let Some(task) = self.inner.tasks.lock().get_mut(&task_id) {
                    task.disable_future_backups();
                }
                return;
            }
        }

        if let Err(err) = self.create_backup_task(task_id, next.is_full, next.date_time).await {
            match backup_delay(&err) {
                Some(delay) => {
                    tracing::info!(database = %self.database(), task_id, delay_secs = delay.as_secs(), reason = %err, "backup will be retried");
                    let retry = NextBackup::after(task_id, next.is_full, delay, Utc::now());
                    if let Some(task) = self.inner.tasks.lock().get_mut(&task_id) {
                        task.timer = Some(self.arm(retry));
                    }
                }
                None => tracing::error!(error = ?err, database = %self.database(), task_id, "error during backup timer callback"),
            }
        }
    }

    /// Compute and arm the next backup of the task after a run. Releases the run slot.
    fn schedule_next_backup(&self, task_id: u64, status: Option<PeriodicBackupStatus>) {
        let mut tasks = self.inner.tasks.lock();
        let task = match tasks.get_mut(&task_id) {
            Some(task) => task,
            None => return,
        };
        if let Some(status) = status {
            task.backup_status = Some(status);
        }
        task.running = None;
        if !task.has_scheduled_backup() || self.inner.token.is_cancelled() {
            return;
        }
        let status = task.backup_status.clone().unwrap_or_else(|| PeriodicBackupStatus::new(task_id));
        let configuration = task.configuration.clone();
        match self.next_backup_details(&configuration, &status, Utc::now()) {
            Some(next) => task.timer = Some(self.arm(next)),
            None => {
                let message = format!("Failed to schedule next backup for task: '{}'", configuration.display_name());
                tracing::warn!(database = %self.database(), task_id, "{}", message);
                task.disable_future_backups();
                self.inner.instance.notifications().add(
                    Alert::new(Some(self.database()), "Couldn't schedule next backup", message, AlertType::PeriodicBackup, Severity::Warning),
                    true,
                );
            }
        }
    }

    //////////////////////////////////////////////////////////////////////////
    // Runs //////////////////////////////////////////////////////////////////

    /// Start a run of the task now, returning the id of its operation.
    pub async fn start_backup_task(&self, task_id: u64, is_full: bool) -> Result<u64> {
        self.configuration(task_id)?;
        self.create_backup_task(task_id, is_full, Utc::now()).await
    }

    /// Spawn a run of the task, or return the operation id of the run in progress.
    async fn create_backup_task(&self, task_id: u64, is_full: bool, start_time: DateTime<Utc>) -> Result<u64> {
        let (name, permit) = {
            let tasks = self.inner.tasks.lock();
            let task = tasks.get(&task_id).ok_or_else(|| anyhow!("Backup task was already disposed"))?;
            if let Some(running) = task.running.as_ref() {
                tracing::info!(database = %self.database(), task_id, running = running.id, "could not start backup task, there is already a running backup");
                return Ok(running.id);
            }
            let name = task.configuration.display_name();
            let permit = self.inner.counter.start_backup(&name)?;
            (name, permit)
        };

        match self.spawn_backup(task_id, is_full, start_time, permit) {
            Ok(operation_id) => Ok(operation_id),
            Err(err) => {
                self.on_start_failure(task_id, &name, is_full, start_time, &err).await;
                Err(err)
            }
        }
    }

    fn spawn_backup(&self, task_id: u64, mut is_full: bool, start_time: DateTime<Utc>, permit: BackupPermit) -> Result<u64> {
        let committed = self.inner.status_store.read_status(self.database(), task_id)?;
        let mut tasks = self.inner.tasks.lock();
        let task = tasks.get_mut(&task_id).ok_or_else(|| anyhow!("Backup task was already disposed"))?;
        if let Some(running) = task.running.as_ref() {
            return Ok(running.id);
        }
        let status = compare_periodic_backup_status(task_id, committed, task.backup_status.take());
        task.backup_status = Some(status.clone());
        let configuration = task.configuration.clone();
        let backup_to_local_folder = configuration.backup_to_local_folder();

        let local_backup_missing = match status.local_backup.as_ref().and_then(|local| local.backup_directory.as_deref()) {
            Some(directory) if backup_to_local_folder => {
                !files::directory_contains_backup_files(Path::new(directory), files::is_full_backup_or_snapshot)?
            }
            _ => backup_to_local_folder,
        };
        if local_backup_missing || is_full_backup_forced(&status, &configuration, self.node_tag()) {
            is_full = true;
        }

        let operation_id = self.inner.instance.next_operation_id();
        let token = self.inner.token.child_token();
        let params = BackupParameters {
            name: configuration.display_name(),
            operation_id,
            previous_status: status.clone(),
            start_time,
            is_full,
            backup_to_local_folder,
            temp_path: self.inner.temp_path.clone(),
        };
        let running_status = PeriodicBackupStatus {
            task_id,
            backup_type: configuration.backup_type,
            last_etag: status.last_etag,
            last_raft_index: status.last_raft_index.clone(),
            last_full_backup: status.last_full_backup,
            last_incremental_backup: status.last_incremental_backup,
            last_full_backup_internal: status.last_full_backup_internal,
            last_incremental_backup_internal: status.last_incremental_backup_internal,
            is_full,
            local_backup: status.local_backup.clone(),
            last_operation_id: status.last_operation_id,
            folder_name: status.folder_name.clone(),
            last_database_change_vector: status.last_database_change_vector.clone(),
            ..Default::default()
        };
        let description = format!(
            "{} backup task: '{}'. Database: '{}'",
            backup_description(configuration.backup_type, is_full),
            configuration.display_name(),
            self.database()
        );
        let backup_task = BackupTask::new(
            self.inner.instance.clone(),
            configuration,
            params,
            self.inner.status_store.clone(),
            self.inner.uploaders.clone(),
            self.inner.retention.clone(),
            token.clone(),
        );

        let handle = tokio::spawn(self.clone().run_backup(task_id, operation_id, description, backup_task, running_status, permit));
        task.running = Some(RunningTask {
            id: operation_id,
            start_time,
            is_full,
            token,
            handle: Some(handle),
        });
        Ok(operation_id)
    }

    async fn run_backup(
        self, task_id: u64, operation_id: u64, description: String, backup_task: BackupTask, mut running_status: PeriodicBackupStatus,
        permit: BackupPermit,
    ) {
        let res = {
            let _guard = self.inner.instance.prevent_unloading();
            backup_task.run(&mut running_status).await
        };
        let (message, severity) = match &res {
            Ok(result) if result.skipped => ("Backup skipped, no changes were made".to_string(), Severity::Info),
            Ok(_) => ("Backup completed".to_string(), Severity::Info),
            Err(err) if is_cancellation(err) => {
                tracing::info!(database = %self.database(), task_id, "cancelled the backup run");
                ("Backup cancelled".to_string(), Severity::Info)
            }
            Err(err) => {
                tracing::error!(error = ?err, database = %self.database(), task_id, "failed to run the backup");
                (format!("Backup failed: {:#}", err), Severity::Error)
            }
        };
        self.inner.instance.notifications().add(
            Alert::new(Some(self.database()), description, message, AlertType::Operation, severity).with_id(operation_notification_id(operation_id)),
            true,
        );
        drop(permit);
        self.schedule_next_backup(task_id, Some(running_status));
    }

    /// Record a failed start in the task's status and arm its next backup.
    async fn on_start_failure(&self, task_id: u64, name: &str, is_full: bool, start_time: DateTime<Utc>, err: &anyhow::Error) {
        let committed = match self.inner.status_store.read_status(self.database(), task_id) {
            Ok(committed) => committed,
            Err(read_err) => {
                tracing::warn!(error = ?read_err, database = %self.database(), task_id, "error reading the periodic backup status");
                None
            }
        };
        let status = {
            let mut tasks = self.inner.tasks.lock();
            let task = match tasks.get_mut(&task_id) {
                Some(task) => task,
                None => return,
            };
            let merged = compare_periodic_backup_status(task_id, committed, task.backup_status.take());
            let status = task.backup_status.insert(merged);
            status.version += 1;
            status.error = Some(BackupError {
                exception: format!("{:?}", err),
                at: Utc::now(),
            });
            if is_full {
                status.last_full_backup_internal = Some(start_time);
            } else {
                status.last_incremental_backup_internal = Some(start_time);
            }
            status.clone()
        };
        if let Err(err) = self.inner.status_store.save_status(self.database(), status).await {
            tracing::error!(error = ?err, database = %self.database(), task_id, "error saving the periodic backup status");
        }

        let message = format!("Failed to start the backup task: '{}'", name);
        tracing::error!(error = ?err, database = %self.database(), task_id, "{}", message);
        self.schedule_next_backup(task_id, None);
        self.inner.instance.notifications().add(
            Alert::new(Some(self.database()), message, "The next backup will be rescheduled", AlertType::PeriodicBackup, Severity::Error)
                .with_details(format!("{:?}", err)),
            true,
        );
    }

    //////////////////////////////////////////////////////////////////////////
    // Tombstones ////////////////////////////////////////////////////////////

    /// The lowest etag every incremental task has backed up, `i64::MAX` when unconstrained.
    ///
    /// A task which was never backed up holds every tombstone back.
    fn get_min_last_etag(&self) -> Result<i64> {
        let record = match self.inner.instance.read_record()? {
            Some((record, _)) => record,
            None => return Ok(i64::MAX),
        };
        let database_id = self.inner.instance.store().database_id();
        let mut min = i64::MAX;
        for configuration in record.periodic_backups.iter() {
            if configuration.incremental_backup_frequency.is_none() {
                // Always full, tombstones are never backed up.
                continue;
            }
            let status = match self.inner.status_store.read_status(self.database(), configuration.task_id)? {
                Some(status) => status,
                None => return Ok(0),
            };
            let etag = change_vector::etag_by_id(status.last_database_change_vector.as_deref(), database_id);
            min = min.min(etag);
        }
        Ok(min)
    }

    //////////////////////////////////////////////////////////////////////////
    // Disposal //////////////////////////////////////////////////////////////

    /// Stop every timer, cancel and await runs in progress and remove the temp folder.
    #[tracing::instrument(level = "debug", skip(self), fields(database = %self.database()))]
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.instance.unsubscribe_tombstone_cleaner(TOMBSTONE_CLEANER_IDENTIFIER);
        self.inner.token.cancel();

        let mut handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.inactive.lock());
        {
            let mut tasks = self.inner.tasks.lock();
            for task in tasks.values_mut() {
                if let Some(running) = task.running.as_ref() {
                    running.token.cancel();
                }
                handles.extend(task.dispose());
            }
        }
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::error!(error = ?err, database = %self.database(), "error when disposing periodic backup runner task");
            }
        }
        self.inner.tasks.lock().clear();

        match tokio::fs::remove_dir_all(&self.inner.temp_path).await {
            Ok(()) => (),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
            Err(err) => tracing::warn!(error = ?err, path = %self.inner.temp_path.display(), "error removing backup temp folder"),
        }
        tracing::debug!(database = %self.database(), "periodic backup runner disposed");
    }
}

impl TombstoneCleanerParticipant for PeriodicBackupRunner {
    fn identifier(&self) -> &str {
        TOMBSTONE_CLEANER_IDENTIFIER
    }

    fn last_processed_tombstones_per_collection(&self, tombstone_type: TombstoneType) -> Result<Option<HashMap<String, i64>>> {
        let min_last_etag = self.get_min_last_etag()?;
        if min_last_etag == i64::MAX {
            return Ok(None);
        }
        let collection = match tombstone_type {
            TombstoneType::Documents => ALL_DOCUMENTS_COLLECTION,
            TombstoneType::TimeSeries => ALL_TIME_SERIES,
            TombstoneType::Counters => ALL_COUNTERS,
        };
        Ok(Some(HashMap::from([(collection.to_string(), min_last_etag)])))
    }
}
