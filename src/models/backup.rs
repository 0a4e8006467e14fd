//! Periodic backup configuration and status models.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::topology::ReplicatedTask;
use crate::utils;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupType {
    /// A logical export of the database contents.
    Backup,
    /// A physical copy of the storage environments.
    Snapshot,
}

impl Default for BackupType {
    fn default() -> Self {
        Self::Backup
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionMode {
    None,
    UseDatabaseKey,
    UseProvidedKey,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackupEncryptionSettings {
    pub encryption_mode: EncryptionMode,
    /// Base64 encoded 256-bit key, used with `UseProvidedKey`.
    #[serde(default)]
    pub key: Option<String>,
}

/// An external executable which prints destination settings as JSON on stdout.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetBackupConfigurationScript {
    pub exec: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default = "crate::models::backup::default_script_timeout_ms")]
    pub timeout_in_ms: u64,
}

pub fn default_script_timeout_ms() -> u64 {
    10_000
}

/// Common behavior of every backup destination.
pub trait BackupSettings {
    fn disabled(&self) -> bool;
    fn script(&self) -> Option<&GetBackupConfigurationScript>;
    /// Whether enough settings are present to use this destination.
    fn has_settings(&self) -> bool;

    /// Whether this destination takes part in backups.
    fn can_backup_using(&self) -> bool {
        !self.disabled() && (self.has_settings() || self.script().map(|s| !s.exec.is_empty()).unwrap_or(false))
    }
}

macro_rules! impl_backup_settings {
    ($ty:ty, $($field:ident),+) => {
        impl BackupSettings for $ty {
            fn disabled(&self) -> bool {
                self.disabled
            }
            fn script(&self) -> Option<&GetBackupConfigurationScript> {
                self.get_backup_configuration_script.as_ref()
            }
            fn has_settings(&self) -> bool {
                $(self.$field.as_deref().map(|v| !v.is_empty()).unwrap_or(false))&&+
            }
        }
    };
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalSettings {
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub folder_path: Option<String>,
    #[serde(default)]
    pub get_backup_configuration_script: Option<GetBackupConfigurationScript>,
}
impl_backup_settings!(LocalSettings, folder_path);

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct S3Settings {
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub bucket_name: Option<String>,
    #[serde(default)]
    pub remote_folder_name: Option<String>,
    #[serde(default)]
    pub aws_region_name: Option<String>,
    #[serde(default)]
    pub aws_access_key: Option<String>,
    #[serde(default)]
    pub aws_secret_key: Option<String>,
    #[serde(default)]
    pub custom_server_url: Option<String>,
    #[serde(default)]
    pub get_backup_configuration_script: Option<GetBackupConfigurationScript>,
}
impl_backup_settings!(S3Settings, bucket_name);

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GlacierSettings {
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub vault_name: Option<String>,
    #[serde(default)]
    pub remote_folder_name: Option<String>,
    #[serde(default)]
    pub aws_region_name: Option<String>,
    #[serde(default)]
    pub aws_access_key: Option<String>,
    #[serde(default)]
    pub aws_secret_key: Option<String>,
    #[serde(default)]
    pub get_backup_configuration_script: Option<GetBackupConfigurationScript>,
}
impl_backup_settings!(GlacierSettings, vault_name);

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AzureSettings {
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub storage_container: Option<String>,
    #[serde(default)]
    pub remote_folder_name: Option<String>,
    #[serde(default)]
    pub account_name: Option<String>,
    #[serde(default)]
    pub account_key: Option<String>,
    #[serde(default)]
    pub get_backup_configuration_script: Option<GetBackupConfigurationScript>,
}
impl_backup_settings!(AzureSettings, storage_container, account_name);

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GoogleCloudSettings {
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub bucket_name: Option<String>,
    #[serde(default)]
    pub remote_folder_name: Option<String>,
    #[serde(default)]
    pub google_credentials_json: Option<String>,
    #[serde(default)]
    pub get_backup_configuration_script: Option<GetBackupConfigurationScript>,
}
impl_backup_settings!(GoogleCloudSettings, bucket_name, google_credentials_json);

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FtpSettings {
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub certificate_as_base64: Option<String>,
    #[serde(default)]
    pub get_backup_configuration_script: Option<GetBackupConfigurationScript>,
}
impl_backup_settings!(FtpSettings, url);

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    #[serde(default)]
    pub disabled: bool,
    /// Backups older than this are deleted.
    #[serde(default)]
    pub minimum_backup_age_to_keep: Option<Duration>,
    /// At most this many backup folders are kept.
    #[serde(default)]
    pub max_backups_to_keep: Option<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotCompressionLevel {
    Optimal,
    Fastest,
    NoCompression,
}

impl Default for SnapshotCompressionLevel {
    fn default() -> Self {
        Self::Optimal
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSettings {
    #[serde(default)]
    pub compression_level: SnapshotCompressionLevel,
    #[serde(default)]
    pub exclude_indexes: bool,
}

/// A periodic backup task as stored in the database record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PeriodicBackupConfiguration {
    pub task_id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub backup_type: BackupType,
    /// Cron expression of full backups.
    #[serde(default)]
    pub full_backup_frequency: Option<String>,
    /// Cron expression of incremental backups.
    #[serde(default)]
    pub incremental_backup_frequency: Option<String>,
    #[serde(default)]
    pub mentor_node: Option<String>,
    #[serde(default)]
    pub pin_to_mentor_node: bool,
    #[serde(default)]
    pub local_settings: Option<LocalSettings>,
    #[serde(default)]
    pub s3_settings: Option<S3Settings>,
    #[serde(default)]
    pub glacier_settings: Option<GlacierSettings>,
    #[serde(default)]
    pub azure_settings: Option<AzureSettings>,
    #[serde(default)]
    pub google_cloud_settings: Option<GoogleCloudSettings>,
    #[serde(default)]
    pub ftp_settings: Option<FtpSettings>,
    #[serde(default)]
    pub retention_policy: Option<RetentionPolicy>,
    #[serde(default)]
    pub backup_encryption_settings: Option<BackupEncryptionSettings>,
    #[serde(default)]
    pub snapshot_settings: Option<SnapshotSettings>,
}

fn usable<T: BackupSettings>(settings: &Option<T>) -> bool {
    settings.as_ref().map(|s| s.can_backup_using()).unwrap_or(false)
}

impl PeriodicBackupConfiguration {
    /// The display name of this task.
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| format!("Backup #{}", self.task_id))
    }

    /// Whether a local destination is configured and enabled.
    pub fn backup_to_local_folder(&self) -> bool {
        usable(&self.local_settings)
    }

    /// Whether any destination is configured and enabled.
    pub fn has_backup(&self) -> bool {
        self.backup_to_local_folder()
            || usable(&self.s3_settings)
            || usable(&self.glacier_settings)
            || usable(&self.azure_settings)
            || usable(&self.google_cloud_settings)
            || usable(&self.ftp_settings)
    }

    /// Whether any frequency is configured.
    pub fn has_backup_frequency(&self) -> bool {
        let set = |f: &Option<String>| f.as_deref().map(|v| !v.trim().is_empty()).unwrap_or(false);
        set(&self.full_backup_frequency) || set(&self.incremental_backup_frequency)
    }

    /// Check whether the schedule differs from `other`.
    pub fn has_backup_frequency_changed(&self, other: &PeriodicBackupConfiguration) -> bool {
        self.full_backup_frequency != other.full_backup_frequency || self.incremental_backup_frequency != other.incremental_backup_frequency
    }

    /// Check whether the encryption requested for this task differs from none.
    pub fn encryption_mode(&self) -> Option<EncryptionMode> {
        self.backup_encryption_settings.as_ref().map(|s| s.encryption_mode)
    }
}

impl ReplicatedTask for PeriodicBackupConfiguration {
    fn task_key(&self) -> u64 {
        utils::stable_hash(&self.task_id.to_be_bytes())
    }

    fn mentor_node(&self) -> Option<&str> {
        self.mentor_node.as_deref()
    }

    fn pinned_to_mentor(&self) -> bool {
        self.pin_to_mentor_node
    }
}

/// The raft index captured by the last backup.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LastRaftIndex {
    pub last_etag: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackupError {
    pub exception: String,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalBackup {
    #[serde(default)]
    pub backup_directory: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub temp_folder_used: bool,
    #[serde(default)]
    pub exception: Option<String>,
    #[serde(default)]
    pub last_full_backup: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_incremental_backup: Option<DateTime<Utc>>,
    #[serde(default)]
    pub full_backup_duration_ms: Option<u64>,
    #[serde(default)]
    pub incremental_backup_duration_ms: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadStatus {
    #[serde(default)]
    pub skipped: bool,
    #[serde(default)]
    pub exception: Option<String>,
    #[serde(default)]
    pub last_full_backup: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_incremental_backup: Option<DateTime<Utc>>,
    #[serde(default)]
    pub upload_duration_ms: Option<u64>,
}

/// The kinds of remote destination a backup may be uploaded to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DestinationKind {
    S3,
    Glacier,
    Azure,
    GoogleCloud,
    Ftp,
}

/// The persisted state of a periodic backup task.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PeriodicBackupStatus {
    pub task_id: u64,
    #[serde(default)]
    pub backup_type: BackupType,
    #[serde(default)]
    pub is_full: bool,
    /// The node which ran the last backup.
    #[serde(default)]
    pub node_tag: Option<String>,
    #[serde(default)]
    pub last_full_backup: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_incremental_backup: Option<DateTime<Utc>>,
    /// Last attempted full backup, advanced on failures as well.
    #[serde(default)]
    pub last_full_backup_internal: Option<DateTime<Utc>>,
    /// Last attempted incremental backup, advanced on failures as well.
    #[serde(default)]
    pub last_incremental_backup_internal: Option<DateTime<Utc>>,
    #[serde(default)]
    pub local_backup: Option<LocalBackup>,
    #[serde(default)]
    pub upload_statuses: BTreeMap<DestinationKind, UploadStatus>,
    #[serde(default)]
    pub last_etag: Option<i64>,
    #[serde(default)]
    pub last_database_change_vector: Option<String>,
    #[serde(default)]
    pub last_raft_index: Option<LastRaftIndex>,
    #[serde(default)]
    pub folder_name: Option<String>,
    #[serde(default)]
    pub duration_in_ms: Option<u64>,
    #[serde(default)]
    pub local_retention_duration_in_ms: Option<u64>,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub error: Option<BackupError>,
    #[serde(default)]
    pub last_operation_id: Option<u64>,
    #[serde(default)]
    pub is_encrypted: bool,
}

impl PeriodicBackupStatus {
    pub fn new(task_id: u64) -> Self {
        Self { task_id, ..Default::default() }
    }

    /// The key under which a task's status is stored in the cluster state.
    pub fn generate_item_name(database: &str, task_id: u64) -> String {
        format!("values/{}/periodic-backups/{}", database.to_lowercase(), task_id)
    }

    /// The key prefix of every cluster value belonging to the given database.
    pub fn values_prefix(database: &str) -> String {
        format!("values/{}/", database.to_lowercase())
    }
}
