//! Retention of local backups.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::backup::files;
use crate::error::AppError;
use crate::models::backup::RetentionPolicy;
use crate::utils;

/// The inputs of a retention run.
#[derive(Clone, Debug)]
pub struct RetentionParameters {
    pub retention_policy: Option<RetentionPolicy>,
    /// The local destination holding one folder per backup chain.
    pub folder_path: PathBuf,
    pub database: String,
    pub is_full: bool,
    pub now: DateTime<Utc>,
    pub token: CancellationToken,
}

/// A strategy deleting old backups once a new one was written.
pub trait RetentionStrategy: Send + Sync {
    /// Apply the policy, returning the names of the deleted backup folders.
    fn execute(&self, params: &RetentionParameters) -> Result<Vec<String>>;
}

/// Applies the retention policy to the backup folders of a local destination.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalRetentionPolicyRunner;

impl LocalRetentionPolicyRunner {
    /// The backup folders of the database, newest first.
    fn list_backup_folders(folder_path: &Path, database: &str) -> Result<Vec<(String, DateTime<Utc>)>> {
        if !folder_path.is_dir() {
            return Ok(vec![]);
        }
        let entries = std::fs::read_dir(folder_path).with_context(|| format!("error listing backup folder {}", folder_path.display()))?;
        let mut folders = vec![];
        for entry in entries {
            let entry = entry.context("error reading backup folder entry")?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(date) = files::parse_folder_date(&name, database) {
                folders.push((name, date));
            }
        }
        folders.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
        Ok(folders)
    }
}

impl RetentionStrategy for LocalRetentionPolicyRunner {
    fn execute(&self, params: &RetentionParameters) -> Result<Vec<String>> {
        let policy = match params.retention_policy.as_ref() {
            Some(policy) if !policy.disabled && params.is_full => policy,
            _ => return Ok(vec![]),
        };
        let minimum_age = effective_minimum_age(policy);
        if policy.max_backups_to_keep.is_none() && minimum_age.is_none() {
            return Ok(vec![]);
        }

        let folders = Self::list_backup_folders(&params.folder_path, &params.database)?;
        let mut deleted = vec![];
        // The newest backup is never deleted.
        for (idx, (name, date)) in folders.into_iter().enumerate().skip(1) {
            if params.token.is_cancelled() {
                return Err(AppError::Cancelled.into());
            }
            let over_count = policy.max_backups_to_keep.map(|max| idx >= max).unwrap_or(false);
            let too_old = minimum_age
                .map(|min_age| utils::elapsed_since(params.now, date) > min_age)
                .unwrap_or(false);
            if !(over_count || too_old) {
                continue;
            }
            let path = params.folder_path.join(&name);
            std::fs::remove_dir_all(&path).with_context(|| format!("error deleting backup folder {}", path.display()))?;
            tracing::info!(database = %params.database, folder = %name, "deleted backup folder per retention policy");
            deleted.push(name);
        }
        Ok(deleted)
    }
}

/// A zero minimum age places no constraint.
fn effective_minimum_age(policy: &RetentionPolicy) -> Option<Duration> {
    policy.minimum_backup_age_to_keep.filter(|age| !age.is_zero())
}
