//! Periodic backups.
//!
//! Each database owns a `PeriodicBackupRunner` which keeps one timer per configured task and
//! spawns a `BackupTask` whenever a backup this node is responsible for is due. Statuses are
//! persisted through the cluster so that any node may pick a task up where another left it.

mod counter;
mod encryption;
mod export;
mod files;
mod next_backup;
mod retention;
mod runner;
mod script;
mod snapshot;
mod status;
mod task;
mod timer;
mod upload;

#[cfg(test)]
mod counter_test;
#[cfg(test)]
mod encryption_test;
#[cfg(test)]
mod retention_test;
#[cfg(test)]
mod task_test;
#[cfg(test)]
mod timer_test;

pub use counter::ConcurrentBackupsCounter;
pub use retention::{LocalRetentionPolicyRunner, RetentionStrategy};
pub use runner::{PeriodicBackupRunner, RunnerParams, TOMBSTONE_CLEANER_IDENTIFIER};
pub use status::{BackupStatusStore, ClusterStatusStore};
pub use upload::{DirectoryUploader, UploaderRegistry};
