//! Uploads of backup artifacts to remote destinations.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::models::backup::{
    AzureSettings, BackupSettings, DestinationKind, FtpSettings, GlacierSettings, GoogleCloudSettings, S3Settings, UploadStatus,
};

const METRIC_UPLOAD_FAILURES: &str = "warden_backup_upload_failures";

/// The resolved settings of one remote destination.
#[derive(Clone, Debug)]
pub enum DestinationSettings {
    S3(S3Settings),
    Glacier(GlacierSettings),
    Azure(AzureSettings),
    GoogleCloud(GoogleCloudSettings),
    Ftp(FtpSettings),
}

impl DestinationSettings {
    pub fn kind(&self) -> DestinationKind {
        match self {
            Self::S3(_) => DestinationKind::S3,
            Self::Glacier(_) => DestinationKind::Glacier,
            Self::Azure(_) => DestinationKind::Azure,
            Self::GoogleCloud(_) => DestinationKind::GoogleCloud,
            Self::Ftp(_) => DestinationKind::Ftp,
        }
    }

    fn settings(&self) -> &dyn BackupSettings {
        match self {
            Self::S3(settings) => settings,
            Self::Glacier(settings) => settings,
            Self::Azure(settings) => settings,
            Self::GoogleCloud(settings) => settings,
            Self::Ftp(settings) => settings,
        }
    }

    /// Whether this destination takes part in backups.
    pub fn enabled(&self) -> bool {
        self.settings().can_backup_using()
    }

    /// The bucket, vault, container or server the artifact goes to.
    pub fn container(&self) -> Option<&str> {
        match self {
            Self::S3(settings) => settings.bucket_name.as_deref(),
            Self::Glacier(settings) => settings.vault_name.as_deref(),
            Self::Azure(settings) => settings.storage_container.as_deref(),
            Self::GoogleCloud(settings) => settings.bucket_name.as_deref(),
            Self::Ftp(settings) => settings.url.as_deref(),
        }
    }

    /// The folder inside the container under which backups are kept.
    pub fn remote_folder_name(&self) -> Option<&str> {
        match self {
            Self::S3(settings) => settings.remote_folder_name.as_deref(),
            Self::Glacier(settings) => settings.remote_folder_name.as_deref(),
            Self::Azure(settings) => settings.remote_folder_name.as_deref(),
            Self::GoogleCloud(settings) => settings.remote_folder_name.as_deref(),
            Self::Ftp(_) => None,
        }
    }
}

/// A single artifact to upload.
#[derive(Clone, Debug)]
pub struct UploadRequest {
    pub file_path: PathBuf,
    pub folder_name: String,
    pub file_name: String,
    pub database: String,
    pub task_name: String,
}

/// Uploads artifacts to one kind of destination.
#[async_trait::async_trait]
pub trait DestinationUploader: Send + Sync {
    fn kind(&self) -> DestinationKind;

    async fn upload(&self, settings: &DestinationSettings, req: &UploadRequest, token: &CancellationToken) -> Result<()>;
}

/// The uploaders available on this node, by destination kind.
#[derive(Clone, Default)]
pub struct UploaderRegistry {
    uploaders: HashMap<DestinationKind, Arc<dyn DestinationUploader>>,
}

impl UploaderRegistry {
    pub fn new() -> Self {
        metrics::register_counter!(METRIC_UPLOAD_FAILURES, metrics::Unit::Count, "the number of failed backup uploads");
        Self::default()
    }

    /// Register an uploader, replacing any uploader of the same kind.
    pub fn register(&mut self, uploader: Arc<dyn DestinationUploader>) {
        self.uploaders.insert(uploader.kind(), uploader);
    }

    pub fn get(&self, kind: DestinationKind) -> Option<&Arc<dyn DestinationUploader>> {
        self.uploaders.get(&kind)
    }

    /// Upload the artifact to every enabled destination.
    ///
    /// Every destination is attempted and its outcome recorded in the returned statuses. The
    /// error, if any, lists every failed destination.
    pub async fn upload_all(
        &self, destinations: Vec<DestinationSettings>, req: &UploadRequest, is_full: bool, now: DateTime<Utc>, token: &CancellationToken,
    ) -> (Vec<(DestinationKind, UploadStatus)>, Result<()>) {
        let mut statuses = vec![];
        let mut failures = vec![];
        for destination in destinations {
            let kind = destination.kind();
            if !destination.enabled() {
                statuses.push((kind, UploadStatus { skipped: true, ..Default::default() }));
                continue;
            }
            if token.is_cancelled() {
                return (statuses, Err(AppError::Cancelled.into()));
            }

            let started = Instant::now();
            let res = match self.get(kind) {
                Some(uploader) => uploader.upload(&destination, req, token).await,
                None => Err(anyhow!("no uploader is registered for {:?} destinations", kind)),
            };
            let mut status = UploadStatus {
                upload_duration_ms: Some(started.elapsed().as_millis() as u64),
                ..Default::default()
            };
            match res {
                Ok(()) => {
                    if is_full {
                        status.last_full_backup = Some(now);
                    } else {
                        status.last_incremental_backup = Some(now);
                    }
                    tracing::info!(database = %req.database, destination = ?kind, file = %req.file_name, "backup uploaded");
                }
                Err(err) if crate::error::is_cancellation(&err) => return (statuses, Err(err)),
                Err(err) => {
                    tracing::error!(error = ?err, database = %req.database, destination = ?kind, "error uploading backup");
                    metrics::increment_counter!(METRIC_UPLOAD_FAILURES);
                    status.exception = Some(format!("{:#}", err));
                    failures.push(format!("{:?}: {:#}", kind, err));
                }
            }
            statuses.push((kind, status));
        }
        if failures.is_empty() {
            (statuses, Ok(()))
        } else {
            (statuses, Err(anyhow!("error uploading backup of task '{}': {}", req.task_name, failures.join("; "))))
        }
    }
}

/// Uploads artifacts by copying them into a mounted directory.
///
/// Artifacts land in `<root>/<container>/<remote folder>/<backup folder>/<file>`.
pub struct DirectoryUploader {
    kind: DestinationKind,
    root: PathBuf,
}

impl DirectoryUploader {
    pub fn new(kind: DestinationKind, root: impl Into<PathBuf>) -> Self {
        Self { kind, root: root.into() }
    }

    /// The path an artifact is copied to.
    pub fn target_path(&self, settings: &DestinationSettings, req: &UploadRequest) -> PathBuf {
        let mut target = self.root.clone();
        if let Some(container) = settings.container() {
            target.push(sanitize(container));
        }
        if let Some(remote) = settings.remote_folder_name().filter(|remote| !remote.is_empty()) {
            target.push(remote.trim_matches('/'));
        }
        target.push(&req.folder_name);
        target.push(&req.file_name);
        target
    }
}

/// Make a container name usable as a single path segment.
fn sanitize(name: &str) -> String {
    name.chars().map(|c| if c.is_ascii_alphanumeric() || "-_.".contains(c) { c } else { '_' }).collect()
}

#[async_trait::async_trait]
impl DestinationUploader for DirectoryUploader {
    fn kind(&self) -> DestinationKind {
        self.kind
    }

    async fn upload(&self, settings: &DestinationSettings, req: &UploadRequest, token: &CancellationToken) -> Result<()> {
        let target = self.target_path(settings, req);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("error creating upload folder {}", parent.display()))?;
        }
        tokio::select! {
            res = copy(&req.file_path, &target) => res,
            _ = token.cancelled() => Err(AppError::Cancelled.into()),
        }
    }
}

async fn copy(from: &Path, to: &Path) -> Result<()> {
    tokio::fs::copy(from, to)
        .await
        .with_context(|| format!("error copying backup {} to {}", from.display(), to.display()))?;
    Ok(())
}
