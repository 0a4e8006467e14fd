//! A single run of a periodic backup task.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::backup::encryption;
use crate::backup::export::{self, ExportRequest, ExportSummary, OutputSink};
use crate::backup::files;
use crate::backup::retention::{RetentionParameters, RetentionStrategy};
use crate::backup::script::get_backup_configuration_from_script;
use crate::backup::snapshot::{self, SnapshotRequest};
use crate::backup::status::BackupStatusStore;
use crate::backup::upload::{DestinationSettings, UploadRequest, UploaderRegistry};
use crate::database::Database;
use crate::error::{is_cancellation, AppError};
use crate::instance::DatabaseInstance;
use crate::models::backup::{BackupError, BackupType, LastRaftIndex, LocalBackup, PeriodicBackupConfiguration, PeriodicBackupStatus};
use crate::notifications::{Alert, AlertType, Severity};

const METRIC_BACKUPS_COMPLETED: &str = "warden_backups_completed";
const METRIC_BACKUPS_FAILED: &str = "warden_backups_failed";

/// The wait before a new backup folder or file name is generated.
const NAME_COLLISION_DELAY: Duration = Duration::from_millis(100);

/// The notification id of a backup operation.
pub fn operation_notification_id(operation_id: u64) -> String {
    format!("OperationChanged/{}", operation_id)
}

/// The inputs of a single backup run.
#[derive(Clone, Debug)]
pub struct BackupParameters {
    pub name: String,
    pub operation_id: u64,
    /// The status before this run.
    pub previous_status: PeriodicBackupStatus,
    pub start_time: DateTime<Utc>,
    pub is_full: bool,
    pub backup_to_local_folder: bool,
    /// Where artifacts are written when there is no local destination.
    pub temp_path: PathBuf,
}

/// The outcome of a backup run.
#[derive(Clone, Debug, Default)]
pub struct BackupResult {
    /// Progress messages, in order.
    pub messages: Vec<String>,
    /// Errors which did not fail the run.
    pub errors: Vec<String>,
    /// Set when an incremental run found nothing to back up.
    pub skipped: bool,
    pub summary: Option<ExportSummary>,
    pub folder_name: Option<String>,
    pub file_name: Option<String>,
    pub elapsed: Duration,
}

impl BackupResult {
    fn add_info(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(%message, "backup progress");
        self.messages.push(message);
    }
}

/// Executes one run of a backup task. A new task is built for every run.
pub struct BackupTask {
    instance: Arc<DatabaseInstance>,
    configuration: PeriodicBackupConfiguration,
    params: BackupParameters,
    status_store: Arc<dyn BackupStatusStore>,
    uploaders: Arc<UploaderRegistry>,
    retention: Arc<dyn RetentionStrategy>,
    token: CancellationToken,
}

impl BackupTask {
    pub fn new(
        instance: Arc<DatabaseInstance>, configuration: PeriodicBackupConfiguration, params: BackupParameters,
        status_store: Arc<dyn BackupStatusStore>, uploaders: Arc<UploaderRegistry>, retention: Arc<dyn RetentionStrategy>,
        token: CancellationToken,
    ) -> Self {
        metrics::register_counter!(METRIC_BACKUPS_COMPLETED, metrics::Unit::Count, "the number of completed backup runs");
        metrics::register_counter!(METRIC_BACKUPS_FAILED, metrics::Unit::Count, "the number of failed backup runs");
        Self {
            instance,
            configuration,
            params,
            status_store,
            uploaders,
            retention,
            token,
        }
    }

    /// The token cancelling this run.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_full(&self) -> bool {
        self.params.is_full
    }

    /// Run the backup, updating `running` along the way.
    ///
    /// Unless the run was cancelled, the status is persisted before returning, whatever the
    /// outcome.
    #[tracing::instrument(level = "debug", skip(self, running), fields(database = %self.instance.name(), task = %self.params.name, is_full = self.params.is_full))]
    pub async fn run(&self, running: &mut PeriodicBackupStatus) -> Result<BackupResult> {
        let started = Instant::now();
        let mut result = BackupResult::default();
        result.add_info(format!("Started task: '{}'", self.params.name));

        let res = self.run_backup(running, &mut result).await;
        let cancelled = matches!(&res, Err(err) if is_cancellation(err));
        match &res {
            Ok(()) => {
                metrics::increment_counter!(METRIC_BACKUPS_COMPLETED);
                tracing::info!(
                    database = %self.instance.name(),
                    task = %self.params.name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "{}",
                    if result.skipped { "skipped backup" } else { "backup completed" }
                );
            }
            Err(_) if cancelled => {
                tracing::info!(database = %self.instance.name(), task = %self.params.name, "backup was cancelled");
            }
            Err(err) => {
                const MESSAGE: &str = "Error when performing periodic backup";
                metrics::increment_counter!(METRIC_BACKUPS_FAILED);
                tracing::error!(error = ?err, database = %self.instance.name(), task = %self.params.name, "{}", MESSAGE);
                running.error = Some(BackupError {
                    exception: format!("{:?}", err),
                    at: Utc::now(),
                });
                self.instance.notifications().add(
                    Alert::new(
                        Some(self.instance.name()),
                        format!("Periodic Backup task: '{}'", self.params.name),
                        MESSAGE,
                        AlertType::PeriodicBackup,
                        Severity::Error,
                    )
                    .with_details(format!("{:?}", err)),
                    true,
                );
            }
        }

        if !cancelled {
            // Advanced on failures as well, so a failing task is not retried in a tight loop.
            if self.params.is_full {
                running.last_full_backup_internal = Some(self.params.start_time);
            } else {
                running.last_incremental_backup_internal = Some(self.params.start_time);
            }
            running.node_tag = Some(self.instance.cluster().node_tag().to_string());
            running.duration_in_ms = Some(started.elapsed().as_millis() as u64);
            self.update_operation_id(running);
            running.version = self.params.previous_status.version + 1;

            result.add_info("Saving backup status");
            if let Err(err) = self.status_store.save_status(self.instance.name(), running.clone()).await {
                const MESSAGE: &str = "Error saving the periodic backup status";
                tracing::error!(error = ?err, database = %self.instance.name(), task_id = running.task_id, "{}", MESSAGE);
                result.errors.push(format!("{}: {:#}", MESSAGE, err));
                self.instance.notifications().add(
                    Alert::new(
                        Some(self.instance.name()),
                        format!("Failed to save the status of backup task: '{}'", self.params.name),
                        MESSAGE,
                        AlertType::PeriodicBackup,
                        Severity::Error,
                    )
                    .with_id(format!("AlertRaised/BackupStatus/{}/{}", self.instance.name(), running.task_id))
                    .with_details(format!("{:?}", err)),
                    true,
                );
            }
        }

        result.elapsed = started.elapsed();
        res.map(|_| result)
    }

    async fn run_backup(&self, running: &mut PeriodicBackupStatus, result: &mut BackupResult) -> Result<()> {
        let (cfg, params) = (&self.configuration, &self.params);
        let previous = &params.previous_status;
        running.local_backup.get_or_insert_with(LocalBackup::default);
        running.last_raft_index.get_or_insert_with(LastRaftIndex::default);
        running.is_full = params.is_full;
        running.backup_type = cfg.backup_type;

        let key = encryption::resolve_backup_key(self.instance.master_key(), cfg, params.is_full)?;

        if !params.is_full {
            let (current_etag, current_change_vector) = self.instance.store().read_last_etag_and_change_vector()?;
            let current_raft_index = self.read_etag_for_backup()?;
            let previous_raft_index = previous.last_raft_index.as_ref().and_then(|index| index.last_etag);
            if previous.last_etag == Some(current_etag)
                && previous.last_database_change_vector == current_change_vector
                && previous_raft_index == Some(current_raft_index)
            {
                let message = format!(
                    "Skipping incremental backup because no changes were made from last full backup on {}.",
                    previous
                        .last_full_backup
                        .map(|at| at.to_rfc3339())
                        .unwrap_or_else(|| "an unknown date".into())
                );
                running.last_incremental_backup = Some(params.start_time);
                if let Some(local) = running.local_backup.as_mut() {
                    local.last_incremental_backup = Some(params.start_time);
                    local.incremental_backup_duration_ms = Some(0);
                }
                result.skipped = true;
                result.add_info(message);
                return Ok(());
            }
        }

        let local_settings = get_backup_configuration_from_script(cfg.local_settings.clone()).await?;
        let local_folder = match local_settings.as_ref().and_then(|settings| settings.folder_path.clone()) {
            Some(folder) if params.backup_to_local_folder => Some(PathBuf::from(folder)),
            _ if params.backup_to_local_folder => bail!(AppError::InvalidConfig("the local destination has no folder path".into())),
            _ => None,
        };
        let (now_as_string, folder_name, backup_directory) = self.generate_folder_name_and_directory(local_folder.as_deref()).await?;
        let (start_etag, start_raft_index) = match params.is_full {
            true => (None, None),
            false => (previous.last_etag, previous.last_raft_index.as_ref().and_then(|index| index.last_etag)),
        };

        let (file_name, backup_file_path) = self.file_name(&backup_directory, now_as_string, key.is_some()).await?;
        let summary = self
            .create_local_backup(running, result, &backup_file_path, key, start_etag, start_raft_index, local_folder.as_deref())
            .await?;

        if let Some(local) = running.local_backup.as_mut() {
            local.backup_directory = local_folder.as_ref().map(|_| backup_directory.to_string_lossy().to_string());
            local.temp_folder_used = local_folder.is_none();
        }
        running.is_encrypted = key.is_some();

        let upload = self.upload(running, &backup_file_path, &folder_name, &file_name).await;
        if local_folder.is_none() {
            delete_file(&backup_file_path).await;
        }
        upload?;

        running.last_etag = Some(summary.last_etag);
        running.last_database_change_vector = summary.last_change_vector.clone();
        running.last_raft_index = Some(LastRaftIndex {
            last_etag: Some(summary.last_raft_index),
        });
        running.folder_name = Some(folder_name.clone());
        if params.is_full {
            running.last_full_backup = Some(params.start_time);
        } else {
            running.last_incremental_backup = Some(params.start_time);
        }
        result.folder_name = Some(folder_name);
        result.file_name = Some(file_name);
        result.summary = Some(summary);
        Ok(())
    }

    fn read_etag_for_backup(&self) -> Result<u64> {
        Ok(self.instance.read_record()?.map(|(record, _)| record.etag_for_backup).unwrap_or_default())
    }

    /// Pick the folder of this run and the directory its artifact is written to.
    async fn generate_folder_name_and_directory(&self, local_folder: Option<&Path>) -> Result<(String, String, PathBuf)> {
        let (cfg, params) = (&self.configuration, &self.params);
        let previous = &params.previous_status;
        if !params.is_full {
            let folder_name = previous
                .folder_name
                .clone()
                .ok_or_else(|| anyhow!("an incremental backup requires the folder of the previous backup"))?;
            let directory = match local_folder {
                Some(_) => previous
                    .local_backup
                    .as_ref()
                    .and_then(|local| local.backup_directory.clone())
                    .map(PathBuf::from)
                    .ok_or_else(|| anyhow!("an incremental backup requires the directory of the previous backup"))?,
                None => params.temp_path.clone(),
            };
            tokio::fs::create_dir_all(&directory)
                .await
                .with_context(|| format!("error creating backup directory {}", directory.display()))?;
            return Ok((files::format_date(params.start_time), folder_name, directory));
        }

        let mut now = params.start_time;
        loop {
            let now_as_string = files::format_date(now);
            let folder_name = files::folder_name(&now_as_string, self.instance.name(), self.instance.cluster().node_tag(), cfg.backup_type);
            let directory = match local_folder {
                Some(local_folder) => local_folder.join(&folder_name),
                None => params.temp_path.clone(),
            };
            let occupied = match local_folder {
                Some(_) => files::directory_contains_backup_files(&directory, files::is_any_backup_file)?,
                None => false,
            };
            if !occupied {
                tokio::fs::create_dir_all(&directory)
                    .await
                    .with_context(|| format!("error creating backup directory {}", directory.display()))?;
                return Ok((now_as_string, folder_name, directory));
            }
            tokio::time::sleep(NAME_COLLISION_DELAY).await;
            now = Utc::now();
        }
    }

    /// Pick the file name of the artifact. Full backups never overwrite an existing file.
    async fn file_name(&self, directory: &Path, now_as_string: String, encrypted: bool) -> Result<(String, PathBuf)> {
        let extension = files::backup_extension(self.configuration.backup_type, self.params.is_full, encrypted);
        let mut file_name = format!("{}.{}", now_as_string, extension);
        let mut path = directory.join(&file_name);
        if !path.exists() {
            return Ok((file_name, path));
        }
        if self.params.is_full {
            bail!("File '{}' already exists!", path.display());
        }
        while path.exists() {
            tokio::time::sleep(NAME_COLLISION_DELAY).await;
            file_name = format!("{}.{}", files::format_date(Utc::now()), extension);
            path = directory.join(&file_name);
        }
        Ok((file_name, path))
    }

    /// Write the artifact next to its final path and move it in place once complete.
    #[allow(clippy::too_many_arguments)]
    async fn create_local_backup(
        &self, running: &mut PeriodicBackupStatus, result: &mut BackupResult, backup_file_path: &Path, key: Option<[u8; 32]>,
        start_etag: Option<i64>, start_raft_index: Option<u64>, local_folder: Option<&Path>,
    ) -> Result<ExportSummary> {
        let (cfg, params) = (&self.configuration, &self.params);
        let temp_file_path = PathBuf::from(format!("{}.{}", backup_file_path.display(), files::IN_PROGRESS_EXTENSION));
        let started = Instant::now();
        result.add_info(format!("Started {}", backup_description(cfg.backup_type, params.is_full)));

        let written = self.write_artifact(temp_file_path.clone(), key, start_etag, start_raft_index).await;
        let renamed = match written {
            Ok(summary) => tokio::fs::rename(&temp_file_path, backup_file_path)
                .await
                .with_context(|| format!("error renaming {} to {}", temp_file_path.display(), backup_file_path.display()))
                .map(|_| summary),
            Err(err) => Err(err),
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let local = running.local_backup.get_or_insert_with(LocalBackup::default);
        if params.is_full {
            local.last_full_backup = Some(params.start_time);
            local.full_backup_duration_ms = Some(elapsed_ms);
        } else {
            local.last_incremental_backup = Some(params.start_time);
            local.incremental_backup_duration_ms = Some(elapsed_ms);
        }
        let summary = match renamed {
            Ok(summary) => {
                local.exception = None;
                summary
            }
            Err(err) => {
                local.exception = Some(format!("{:?}", err));
                delete_file(&temp_file_path).await;
                return Err(err);
            }
        };
        result.add_info(format!(
            "Backed up {} documents, {} tombstones and {} compare exchange values",
            summary.documents, summary.tombstones, summary.compare_exchange
        ));

        if let Some(local_folder) = local_folder {
            let retention_started = Instant::now();
            let retention = self.retention.clone();
            let retention_params = RetentionParameters {
                retention_policy: cfg.retention_policy.clone(),
                folder_path: local_folder.to_path_buf(),
                database: self.instance.name().to_string(),
                is_full: params.is_full,
                now: Utc::now(),
                token: self.token.clone(),
            };
            match Database::spawn_blocking(move || retention.execute(&retention_params)).await? {
                Ok(deleted) if !deleted.is_empty() => result.add_info(format!("Retention policy deleted {} backup folders", deleted.len())),
                Ok(_) => (),
                Err(err) if is_cancellation(&err) => return Err(err),
                Err(err) => {
                    tracing::error!(error = ?err, database = %self.instance.name(), "error applying local retention policy");
                    result.errors.push(format!("Failed to execute the local retention policy: {:#}", err));
                }
            }
            running.local_retention_duration_in_ms = Some(retention_started.elapsed().as_millis() as u64);
        }
        Ok(summary)
    }

    async fn write_artifact(
        &self, path: PathBuf, key: Option<[u8; 32]>, start_etag: Option<i64>, start_raft_index: Option<u64>,
    ) -> Result<ExportSummary> {
        let (cfg, params) = (&self.configuration, &self.params);
        let (database, store, cluster, token) = (
            self.instance.name().to_string(),
            self.instance.store().clone(),
            self.instance.cluster().clone(),
            self.token.clone(),
        );
        // Incremental runs of snapshot tasks are exported like regular backups.
        if cfg.backup_type == BackupType::Snapshot && params.is_full {
            let req = SnapshotRequest {
                database,
                store,
                cluster,
                settings: cfg.snapshot_settings.clone().unwrap_or_default(),
                token,
                staging_dir: path.parent().map(Path::to_path_buf).unwrap_or_default(),
            };
            return Database::spawn_blocking(move || {
                let sink = OutputSink::create(&path, key.as_ref())?;
                snapshot::snapshot_database(&req, sink)
            })
            .await?;
        }
        let req = ExportRequest {
            database,
            store,
            cluster,
            is_full: params.is_full,
            start_etag,
            start_raft_index,
            token,
        };
        Database::spawn_blocking(move || {
            let sink = OutputSink::create(&path, key.as_ref())?;
            export::export_database(&req, sink)
        })
        .await?
    }

    /// Upload the artifact to every remote destination, recording each outcome.
    async fn upload(&self, running: &mut PeriodicBackupStatus, file_path: &Path, folder_name: &str, file_name: &str) -> Result<()> {
        let cfg = &self.configuration;
        let mut destinations = vec![];
        if let Some(settings) = get_backup_configuration_from_script(cfg.s3_settings.clone()).await? {
            destinations.push(DestinationSettings::S3(settings));
        }
        if let Some(settings) = get_backup_configuration_from_script(cfg.glacier_settings.clone()).await? {
            destinations.push(DestinationSettings::Glacier(settings));
        }
        if let Some(settings) = get_backup_configuration_from_script(cfg.azure_settings.clone()).await? {
            destinations.push(DestinationSettings::Azure(settings));
        }
        if let Some(settings) = get_backup_configuration_from_script(cfg.google_cloud_settings.clone()).await? {
            destinations.push(DestinationSettings::GoogleCloud(settings));
        }
        if let Some(settings) = get_backup_configuration_from_script(cfg.ftp_settings.clone()).await? {
            destinations.push(DestinationSettings::Ftp(settings));
        }
        if self.token.is_cancelled() {
            return Err(AppError::Cancelled.into());
        }

        running.upload_statuses.clear();
        if destinations.is_empty() {
            return Ok(());
        }
        let req = UploadRequest {
            file_path: file_path.to_path_buf(),
            folder_name: folder_name.to_string(),
            file_name: file_name.to_string(),
            database: self.instance.name().to_string(),
            task_name: self.params.name.clone(),
        };
        let (statuses, res) = self
            .uploaders
            .upload_all(destinations, &req, self.params.is_full, self.params.start_time, &self.token)
            .await;
        running.upload_statuses.extend(statuses);
        res
    }

    /// Record this run's operation, dismissing the notification of the previous one when it
    /// succeeded on this node.
    fn update_operation_id(&self, running: &mut PeriodicBackupStatus) {
        running.last_operation_id = Some(self.params.operation_id);
        let previous = &self.params.previous_status;
        let previous_id = match previous.last_operation_id {
            Some(id) => id,
            None => return,
        };
        if previous.node_tag.as_deref() != Some(self.instance.cluster().node_tag()) || previous.error.is_some() {
            return;
        }
        self.instance.notifications().dismiss(&operation_notification_id(previous_id));
    }
}

/// A human readable description of a backup flavor.
pub fn backup_description(backup_type: BackupType, is_full: bool) -> String {
    let full = if is_full { "a full" } else { "an incremental" };
    let kind = match backup_type {
        BackupType::Snapshot => "snapshot backup",
        BackupType::Backup => "backup",
    };
    format!("{} {}", full, kind)
}

async fn delete_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => (),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
        Err(err) => tracing::warn!(error = ?err, path = %path.display(), "failed to delete file"),
    }
}
