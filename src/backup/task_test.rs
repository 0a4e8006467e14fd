use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use flate2::read::GzDecoder;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::backup::encryption::decrypt;
use crate::backup::export::ExportRecord;
use crate::backup::files;
use crate::backup::retention::{LocalRetentionPolicyRunner, RetentionParameters, RetentionStrategy};
use crate::backup::status::{BackupStatusStore, ClusterStatusStore};
use crate::backup::task::{BackupParameters, BackupResult, BackupTask};
use crate::backup::upload::{DirectoryUploader, UploaderRegistry};
use crate::error::{is_cancellation, AppError};
use crate::fixtures::{backup_config, topology, TestEnv};
use crate::instance::DatabaseInstance;
use crate::models::backup::{
    BackupEncryptionSettings, BackupType, DestinationKind, EncryptionMode, PeriodicBackupConfiguration, PeriodicBackupStatus, S3Settings,
};
use crate::models::topology::DatabaseRecord;
use crate::storage::PREFIX_ITEM;
use crate::utils;

const MASTER_KEY: [u8; 32] = [3; 32];

struct Fixture {
    env: TestEnv,
    instance: Arc<DatabaseInstance>,
    root: tempfile::TempDir,
    uploaders: Arc<UploaderRegistry>,
    retention: Arc<dyn RetentionStrategy>,
    status_store: Arc<dyn BackupStatusStore>,
}

impl Fixture {
    async fn new(master_key: Option<[u8; 32]>) -> Result<Self> {
        let env = TestEnv::new().await?;
        env.setup_database(DatabaseRecord::new("db", topology(&["A"], &[], &[], 1)), &["A"]).await?;
        let instance = env.instance("db", master_key).await?;
        Ok(Self {
            instance,
            root: tempfile::tempdir()?,
            uploaders: Arc::new(UploaderRegistry::new()),
            retention: Arc::new(LocalRetentionPolicyRunner),
            status_store: Arc::new(ClusterStatusStore::new(env.cluster.clone())),
            env,
        })
    }

    fn backups(&self) -> PathBuf {
        self.root.path().join("backups")
    }

    fn temp_path(&self) -> PathBuf {
        self.root.path().join("temp")
    }

    fn config(&self) -> PeriodicBackupConfiguration {
        backup_config(1, &self.backups(), Some("0 0 * * *"), Some("0 * * * *"))
    }

    fn task(&self, cfg: PeriodicBackupConfiguration, previous: PeriodicBackupStatus, is_full: bool, token: CancellationToken) -> BackupTask {
        let params = BackupParameters {
            name: cfg.display_name(),
            operation_id: self.instance.next_operation_id(),
            previous_status: previous,
            start_time: Utc::now(),
            is_full,
            backup_to_local_folder: cfg.backup_to_local_folder(),
            temp_path: self.temp_path(),
        };
        BackupTask::new(
            self.instance.clone(),
            cfg,
            params,
            self.status_store.clone(),
            self.uploaders.clone(),
            self.retention.clone(),
            token,
        )
    }

    /// Run a backup to completion, returning its result and resulting status.
    async fn run(&self, cfg: PeriodicBackupConfiguration, previous: PeriodicBackupStatus, is_full: bool) -> Result<(BackupResult, PeriodicBackupStatus)> {
        let mut running = previous.clone();
        let task = self.task(cfg, previous, is_full, CancellationToken::new());
        let result = task.run(&mut running).await?;
        Ok((result, running))
    }

    async fn put_docs(&self, ids: &[&str]) -> Result<()> {
        for id in ids {
            self.instance.store().put(id, "users", json!({ "name": id })).await?;
        }
        Ok(())
    }
}

fn artifact_path(status: &PeriodicBackupStatus, result: &BackupResult) -> Result<PathBuf> {
    let directory = status
        .local_backup
        .as_ref()
        .and_then(|local| local.backup_directory.clone())
        .context("expected a local backup directory")?;
    let file_name = result.file_name.clone().context("expected an artifact file name")?;
    Ok(Path::new(&directory).join(file_name))
}

fn read_export(path: &Path, key: Option<&[u8; 32]>) -> Result<Vec<ExportRecord>> {
    let mut bytes = std::fs::read(path)?;
    if let Some(key) = key {
        bytes = decrypt(&bytes, key)?;
    }
    let mut records = vec![];
    for line in BufReader::new(GzDecoder::new(&bytes[..])).lines() {
        records.push(serde_json::from_str(&line?)?);
    }
    Ok(records)
}

fn files_in(dir: &Path) -> Result<Vec<String>> {
    if !dir.exists() {
        return Ok(vec![]);
    }
    let mut names = vec![];
    for entry in walk(dir)? {
        names.push(entry.file_name().map(|name| name.to_string_lossy().to_string()).unwrap_or_default());
    }
    Ok(names)
}

fn walk(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = vec![];
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            out.extend(walk(&path)?);
        } else {
            out.push(path);
        }
    }
    Ok(out)
}

#[tokio::test]
async fn full_backup_writes_the_artifact_and_persists_the_status() -> Result<()> {
    let fixture = Fixture::new(None).await?;
    fixture.put_docs(&["users/1", "users/2", "users/3"]).await?;

    let (result, status) = fixture.run(fixture.config(), PeriodicBackupStatus::new(1), true).await?;

    let path = artifact_path(&status, &result)?;
    let file_name = result.file_name.clone().unwrap_or_default();
    assert!(file_name.ends_with(files::FULL_BACKUP_EXTENSION), "expected a full backup file, got {}", file_name);
    let records = read_export(&path, None)?;
    let documents = records.iter().filter(|record| matches!(record, ExportRecord::Document(_))).count();
    assert!(documents == 3, "expected 3 exported documents, got {}", documents);
    assert!(matches!(records.last(), Some(ExportRecord::Footer(_))), "expected the export to end with a footer");

    assert!(status.last_etag == Some(3), "expected last etag 3, got {:?}", status.last_etag);
    assert!(status.last_full_backup.is_some() && status.last_full_backup_internal.is_some(), "expected the full backup to be recorded");
    assert!(status.node_tag.as_deref() == Some("A"), "expected node A to own the status, got {:?}", status.node_tag);
    assert!(status.version == 1, "expected version 1, got {}", status.version);
    assert!(status.error.is_none(), "expected no error, got {:?}", status.error);

    let saved = ClusterStatusStore::new(fixture.env.cluster.clone())
        .read_status("db", 1)?
        .context("expected a persisted status")?;
    assert!(saved == status, "expected the persisted status to match the run, got {:?}", saved);
    let leftovers: Vec<_> = files_in(&fixture.backups())?
        .into_iter()
        .filter(|name| name.ends_with(files::IN_PROGRESS_EXTENSION))
        .collect();
    assert!(leftovers.is_empty(), "expected no in-progress files, got {:?}", leftovers);
    Ok(())
}

#[tokio::test]
async fn incremental_backup_resumes_after_the_last_etag() -> Result<()> {
    let fixture = Fixture::new(None).await?;
    fixture.put_docs(&["users/1", "users/2", "users/3"]).await?;
    let (_, full) = fixture.run(fixture.config(), PeriodicBackupStatus::new(1), true).await?;
    let last_etag = full.last_etag.unwrap_or_default();

    fixture.put_docs(&["users/4", "users/5"]).await?;
    fixture.instance.store().delete("users/1").await?;
    let (result, status) = fixture.run(fixture.config(), full.clone(), false).await?;

    assert!(!result.skipped, "expected the incremental backup to run");
    assert!(status.folder_name == full.folder_name, "expected the incremental to join the full backup's folder");
    let records = read_export(&artifact_path(&status, &result)?, None)?;
    let mut documents = vec![];
    let mut tombstones = vec![];
    for record in records {
        match record {
            ExportRecord::Document(item) => documents.push(item),
            ExportRecord::Tombstone(item) => tombstones.push(item),
            _ => (),
        }
    }
    assert!(documents.iter().all(|item| item.etag > last_etag), "expected only items after etag {}", last_etag);
    assert!(documents.len() == 2, "expected the 2 new documents, got {}", documents.len());
    assert!(tombstones.len() == 1 && tombstones[0].id == "users/1", "expected the deletion as a tombstone, got {:?}", tombstones);
    assert!(status.last_etag == Some(6), "expected last etag 6, got {:?}", status.last_etag);
    assert!(status.version == full.version + 1, "expected the version to advance, got {}", status.version);
    Ok(())
}

#[tokio::test]
async fn unchanged_incremental_backup_is_skipped() -> Result<()> {
    let fixture = Fixture::new(None).await?;
    fixture.put_docs(&["users/1"]).await?;
    let (_, full) = fixture.run(fixture.config(), PeriodicBackupStatus::new(1), true).await?;
    let before = files_in(&fixture.backups())?;

    let (result, status) = fixture.run(fixture.config(), full.clone(), false).await?;

    assert!(result.skipped, "expected the incremental backup to be skipped");
    assert!(
        result.messages.iter().any(|message| message.starts_with("Skipping incremental backup because no changes were made")),
        "expected the skip message, got {:?}",
        result.messages
    );
    assert!(files_in(&fixture.backups())? == before, "expected no new artifact to be written");
    assert!(status.last_incremental_backup.is_some(), "expected the skipped run to count as an incremental backup");
    assert!(status.last_etag == full.last_etag, "expected the position to be unchanged");
    Ok(())
}

#[tokio::test]
async fn encrypted_backup_uses_the_database_key() -> Result<()> {
    let fixture = Fixture::new(Some(MASTER_KEY)).await?;
    fixture.put_docs(&["users/1", "users/2"]).await?;

    let (result, status) = fixture.run(fixture.config(), PeriodicBackupStatus::new(1), true).await?;

    assert!(status.is_encrypted, "expected the status to record encryption");
    let path = artifact_path(&status, &result)?;
    let file_name = result.file_name.clone().unwrap_or_default();
    assert!(file_name.ends_with(files::ENCRYPTED_FULL_BACKUP_EXTENSION), "expected an encrypted extension, got {}", file_name);
    assert!(read_export(&path, None).is_err(), "expected the artifact not to be readable without the key");
    let records = read_export(&path, Some(&MASTER_KEY))?;
    let documents = records.iter().filter(|record| matches!(record, ExportRecord::Document(_))).count();
    assert!(documents == 2, "expected 2 documents after decryption, got {}", documents);
    Ok(())
}

#[tokio::test]
async fn invalid_encryption_fails_before_writing_anything() -> Result<()> {
    let fixture = Fixture::new(None).await?;
    fixture.put_docs(&["users/1"]).await?;
    let mut cfg = fixture.config();
    cfg.backup_encryption_settings = Some(BackupEncryptionSettings {
        encryption_mode: EncryptionMode::UseProvidedKey,
        key: Some("not a key".into()),
    });
    let mut running = PeriodicBackupStatus::new(1);
    let task = fixture.task(cfg, PeriodicBackupStatus::new(1), true, CancellationToken::new());

    let err = task.run(&mut running).await.expect_err("expected the invalid key to fail the backup");

    assert!(matches!(err.downcast_ref::<AppError>(), Some(AppError::InvalidConfig(_))), "expected InvalidConfig, got {:?}", err);
    assert!(files_in(&fixture.backups())?.is_empty(), "expected no file to be written");
    assert!(running.error.is_some(), "expected the error to be recorded");
    assert!(running.last_full_backup.is_none(), "expected no successful full backup");
    assert!(running.last_full_backup_internal.is_some(), "expected the attempt to be recorded");
    let saved = ClusterStatusStore::new(fixture.env.cluster.clone())
        .read_status("db", 1)?
        .context("expected the failed status to be persisted")?;
    assert!(saved.error.is_some(), "expected the persisted status to carry the error");
    let alerts = fixture.env.notifications.alerts_for("db");
    assert!(
        alerts.iter().any(|alert| alert.title == "Periodic Backup task: 'backup-1'"),
        "expected a backup failure alert, got {:?}",
        alerts
    );
    Ok(())
}

#[tokio::test]
async fn cancelled_backup_leaves_no_partial_artifact() -> Result<()> {
    let fixture = Fixture::new(None).await?;
    fixture.put_docs(&["users/1", "users/2"]).await?;
    let token = CancellationToken::new();
    token.cancel();
    let mut running = PeriodicBackupStatus::new(1);
    let task = fixture.task(fixture.config(), PeriodicBackupStatus::new(1), true, token);

    let err = task.run(&mut running).await.expect_err("expected the cancelled backup to fail");

    assert!(is_cancellation(&err), "expected a cancellation, got {:?}", err);
    let written = files_in(&fixture.backups())?;
    assert!(written.is_empty(), "expected neither a partial nor a final artifact, got {:?}", written);
    let saved = ClusterStatusStore::new(fixture.env.cluster.clone()).read_status("db", 1)?;
    assert!(saved.is_none(), "expected a cancelled run not to persist a status, got {:?}", saved);
    Ok(())
}

#[tokio::test]
async fn failure_midway_removes_the_partial_artifact_and_records_the_error() -> Result<()> {
    for backup_type in [BackupType::Backup, BackupType::Snapshot] {
        let fixture = Fixture::new(None).await?;
        // Enough incompressible data to reach the disk before the unreadable item.
        for i in 0..4 {
            let filler: String = rand::thread_rng().sample_iter(&Alphanumeric).take(64 * 1024).map(char::from).collect();
            fixture.instance.store().put(&format!("users/{}", i), "users", json!({ "filler": filler })).await?;
        }
        let (last_etag, _) = fixture.instance.store().read_last_etag_and_change_vector()?;
        let tree = fixture.env.db.get_documents_tree("db").await?;
        tree.insert(utils::encode_byte_prefix(PREFIX_ITEM, last_etag as u64 + 1), b"not an item".to_vec())?;
        let mut cfg = fixture.config();
        cfg.backup_type = backup_type;
        let mut running = PeriodicBackupStatus::new(1);
        let task = fixture.task(cfg, PeriodicBackupStatus::new(1), true, CancellationToken::new());

        let res = task.run(&mut running).await;

        assert!(res.is_err(), "expected the unreadable item to fail the {:?} run", backup_type);
        let written = files_in(&fixture.backups())?;
        assert!(written.is_empty(), "expected neither a partial nor a final {:?} artifact, got {:?}", backup_type, written);
        assert!(running.error.is_some(), "expected the {:?} run error to be recorded", backup_type);
        let local = running.local_backup.clone().context("expected a local backup status")?;
        assert!(local.exception.is_some(), "expected the local failure to be recorded, got {:?}", local);
        let saved = ClusterStatusStore::new(fixture.env.cluster.clone())
            .read_status("db", 1)?
            .context("expected the failed status to be persisted")?;
        assert!(saved.error.is_some(), "expected the persisted {:?} status to carry the error", backup_type);
    }
    Ok(())
}

/// A status store which accepts reads but rejects every save.
struct ReadOnlyStatusStore(ClusterStatusStore);

#[async_trait::async_trait]
impl BackupStatusStore for ReadOnlyStatusStore {
    fn read_status(&self, database: &str, task_id: u64) -> Result<Option<PeriodicBackupStatus>> {
        self.0.read_status(database, task_id)
    }

    async fn save_status(&self, _: &str, _: PeriodicBackupStatus) -> Result<u64> {
        Err(anyhow!("cluster storage is read only"))
    }
}

#[tokio::test]
async fn status_save_failures_are_reported() -> Result<()> {
    let mut fixture = Fixture::new(None).await?;
    fixture.status_store = Arc::new(ReadOnlyStatusStore(ClusterStatusStore::new(fixture.env.cluster.clone())));
    fixture.put_docs(&["users/1"]).await?;

    let (result, status) = fixture.run(fixture.config(), PeriodicBackupStatus::new(1), true).await?;

    assert!(status.last_full_backup.is_some(), "expected the backup itself to succeed, got {:?}", status);
    assert!(
        result.errors.iter().any(|err| err.starts_with("Error saving the periodic backup status")),
        "expected the save error to be reported, got {:?}",
        result.errors
    );
    let alerts = fixture.env.notifications.alerts_for("db");
    let alert = alerts
        .iter()
        .find(|alert| alert.title == "Failed to save the status of backup task: 'backup-1'")
        .context("expected a status save alert")?;
    assert!(
        alert.details.as_deref().unwrap_or_default().contains("cluster storage is read only"),
        "expected the cause in the alert details, got {:?}",
        alert
    );
    Ok(())
}

struct FailingRetention;

impl RetentionStrategy for FailingRetention {
    fn execute(&self, _: &RetentionParameters) -> Result<Vec<String>> {
        Err(anyhow!("permission denied"))
    }
}

#[tokio::test]
async fn retention_failures_do_not_fail_the_backup() -> Result<()> {
    let mut fixture = Fixture::new(None).await?;
    fixture.retention = Arc::new(FailingRetention);
    fixture.put_docs(&["users/1"]).await?;

    let (result, status) = fixture.run(fixture.config(), PeriodicBackupStatus::new(1), true).await?;

    assert!(
        result.errors.iter().any(|err| err.starts_with("Failed to execute the local retention policy")),
        "expected the retention error to be reported, got {:?}",
        result.errors
    );
    assert!(status.error.is_none() && status.last_full_backup.is_some(), "expected the backup to succeed, got {:?}", status);
    assert!(artifact_path(&status, &result)?.exists(), "expected the artifact to be kept");
    Ok(())
}

#[tokio::test]
async fn remote_only_backup_is_staged_in_the_temp_folder() -> Result<()> {
    let mut fixture = Fixture::new(None).await?;
    let remote = fixture.root.path().join("remote");
    let mut registry = UploaderRegistry::new();
    registry.register(Arc::new(DirectoryUploader::new(DestinationKind::S3, &remote)));
    fixture.uploaders = Arc::new(registry);
    fixture.put_docs(&["users/1"]).await?;
    let mut cfg = fixture.config();
    cfg.local_settings = None;
    cfg.s3_settings = Some(S3Settings {
        bucket_name: Some("bucket".into()),
        ..Default::default()
    });

    let (result, status) = fixture.run(cfg, PeriodicBackupStatus::new(1), true).await?;

    let local = status.local_backup.clone().context("expected a local backup status")?;
    assert!(local.temp_folder_used && local.backup_directory.is_none(), "expected the temp folder to be used, got {:?}", local);
    let uploaded = remote
        .join("bucket")
        .join(status.folder_name.clone().unwrap_or_default())
        .join(result.file_name.clone().unwrap_or_default());
    assert!(uploaded.exists(), "expected the artifact at {}", uploaded.display());
    assert!(files_in(&fixture.temp_path())?.is_empty(), "expected the staged artifact to be deleted");
    let s3 = status.upload_statuses.get(&DestinationKind::S3).context("expected an s3 upload status")?;
    assert!(s3.last_full_backup.is_some() && s3.exception.is_none(), "expected a successful upload, got {:?}", s3);
    Ok(())
}

#[tokio::test]
async fn upload_failures_fail_the_run_but_keep_the_local_artifact() -> Result<()> {
    let fixture = Fixture::new(None).await?;
    fixture.put_docs(&["users/1"]).await?;
    let mut cfg = fixture.config();
    cfg.s3_settings = Some(S3Settings {
        bucket_name: Some("bucket".into()),
        ..Default::default()
    });
    let mut running = PeriodicBackupStatus::new(1);
    let task = fixture.task(cfg, PeriodicBackupStatus::new(1), true, CancellationToken::new());

    let res = task.run(&mut running).await;

    assert!(res.is_err(), "expected the missing uploader to fail the run");
    let written: Vec<_> = files_in(&fixture.backups())?
        .into_iter()
        .filter(|name| name.ends_with(files::FULL_BACKUP_EXTENSION))
        .collect();
    assert!(written.len() == 1, "expected the local artifact to be kept, got {:?}", written);
    let s3 = running.upload_statuses.get(&DestinationKind::S3).context("expected an s3 upload status")?;
    assert!(s3.exception.is_some(), "expected the upload failure to be recorded, got {:?}", s3);
    assert!(running.error.is_some(), "expected the run error to be recorded");
    Ok(())
}
