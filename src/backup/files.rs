//! Naming of backup folders and artifacts.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

use crate::models::backup::BackupType;

/// The date format of backup folders and files.
pub const DATE_TIME_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";
/// The date format used by folders written before seconds were recorded.
pub const LEGACY_DATE_TIME_FORMAT: &str = "%Y-%m-%d-%H-%M";
const LEGACY_DATE_TIME_LEN: usize = 16;

pub const FULL_BACKUP_EXTENSION: &str = "ravendb-full-backup";
pub const INCREMENTAL_BACKUP_EXTENSION: &str = "ravendb-incremental-backup";
pub const SNAPSHOT_EXTENSION: &str = "ravendb-snapshot";
pub const ENCRYPTED_FULL_BACKUP_EXTENSION: &str = "ravendb-encrypted-full-backup";
pub const ENCRYPTED_INCREMENTAL_BACKUP_EXTENSION: &str = "ravendb-encrypted-incremental-backup";
pub const ENCRYPTED_SNAPSHOT_EXTENSION: &str = "ravendb-encrypted-snapshot";
/// Appended to an artifact while it is being written.
pub const IN_PROGRESS_EXTENSION: &str = "in-progress";

/// The extension, without the leading dot, of an artifact of the given kind.
pub fn backup_extension(backup_type: BackupType, is_full: bool, encrypted: bool) -> &'static str {
    match (is_full, backup_type, encrypted) {
        (false, _, false) => INCREMENTAL_BACKUP_EXTENSION,
        (false, _, true) => ENCRYPTED_INCREMENTAL_BACKUP_EXTENSION,
        (true, BackupType::Backup, false) => FULL_BACKUP_EXTENSION,
        (true, BackupType::Backup, true) => ENCRYPTED_FULL_BACKUP_EXTENSION,
        (true, BackupType::Snapshot, false) => SNAPSHOT_EXTENSION,
        (true, BackupType::Snapshot, true) => ENCRYPTED_SNAPSHOT_EXTENSION,
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension().map(|ext| ext.to_string_lossy().to_lowercase())
}

/// Whether the given file is a full backup or a snapshot.
pub fn is_full_backup_or_snapshot(path: &Path) -> bool {
    matches!(
        extension_of(path).as_deref(),
        Some(FULL_BACKUP_EXTENSION | SNAPSHOT_EXTENSION | ENCRYPTED_FULL_BACKUP_EXTENSION | ENCRYPTED_SNAPSHOT_EXTENSION)
    )
}

/// Whether the given file is any backup artifact, including one still in progress.
pub fn is_any_backup_file(path: &Path) -> bool {
    is_full_backup_or_snapshot(path)
        || matches!(
            extension_of(path).as_deref(),
            Some(INCREMENTAL_BACKUP_EXTENSION | ENCRYPTED_INCREMENTAL_BACKUP_EXTENSION | IN_PROGRESS_EXTENSION)
        )
}

/// Check whether the directory holds a file matching the predicate. A missing directory holds nothing.
pub fn directory_contains_backup_files(dir: &Path, is_backup_file: impl Fn(&Path) -> bool) -> Result<bool> {
    if !dir.is_dir() {
        return Ok(false);
    }
    let entries = std::fs::read_dir(dir).with_context(|| format!("error listing backup directory {}", dir.display()))?;
    for entry in entries {
        let path = entry.with_context(|| format!("error reading entry of backup directory {}", dir.display()))?.path();
        if path.is_file() && is_backup_file(&path) {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn format_date(date: DateTime<Utc>) -> String {
    date.format(DATE_TIME_FORMAT).to_string()
}

/// The folder holding a full backup and the incrementals which follow it.
pub fn folder_name(date: &str, database: &str, node_tag: &str, backup_type: BackupType) -> String {
    let kind = match backup_type {
        BackupType::Backup => "backup",
        BackupType::Snapshot => "snapshot",
    };
    format!("{}.ravendb-{}-{}-{}", date, database, node_tag, kind)
}

/// The date format matching a date prefix of the given length.
pub fn date_time_format(date: &str) -> &'static str {
    if date.len() == LEGACY_DATE_TIME_LEN {
        LEGACY_DATE_TIME_FORMAT
    } else {
        DATE_TIME_FORMAT
    }
}

/// Parse the date of a backup folder of the given database, `None` if the folder is not one.
pub fn parse_folder_date(folder: &str, database: &str) -> Option<DateTime<Utc>> {
    let (date, rest) = folder.split_once('.')?;
    let rest = rest.to_lowercase();
    let owner = rest.strip_prefix(&format!("ravendb-{}-", database.to_lowercase()))?;
    if !(owner.ends_with("-backup") || owner.ends_with("-snapshot")) {
        return None;
    }
    let naive = NaiveDateTime::parse_from_str(date, date_time_format(date)).ok()?;
    Some(Utc.from_utc_datetime(&naive))
}
