//! Node wide limit on concurrently running backups.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;

use crate::error::AppError;

const METRIC_BACKUPS_RUNNING: &str = "warden_backups_running";

/// Counts the backups running on this node across every database.
#[derive(Clone)]
pub struct ConcurrentBackupsCounter {
    inner: Arc<CounterInner>,
}

struct CounterInner {
    max: usize,
    retry_delay: Duration,
    running: Mutex<usize>,
}

/// A slot of the counter, released on drop.
pub struct BackupPermit {
    inner: Arc<CounterInner>,
    name: String,
}

impl ConcurrentBackupsCounter {
    pub fn new(max: usize, retry_delay: Duration) -> Self {
        metrics::register_gauge!(METRIC_BACKUPS_RUNNING, metrics::Unit::Count, "the number of backups currently running on this node");
        Self {
            inner: Arc::new(CounterInner {
                max,
                retry_delay,
                running: Mutex::new(0),
            }),
        }
    }

    /// Take a slot for the named backup task, failing with `BackupDelay` when every slot is taken.
    pub fn start_backup(&self, name: &str) -> Result<BackupPermit> {
        let mut running = self.inner.running.lock();
        if *running >= self.inner.max {
            return Err(AppError::BackupDelay {
                delay: self.inner.retry_delay,
                reason: format!(
                    "Failed to start Backup Task: '{}'. The task exceeds the maximum number of concurrent backup tasks configured. \
                     Current value of Backup.MaxNumberOfConcurrentBackups is: {}",
                    name, self.inner.max
                ),
            }
            .into());
        }
        *running += 1;
        metrics::gauge!(METRIC_BACKUPS_RUNNING, *running as f64);
        tracing::debug!(task = name, running = *running, "backup slot taken");
        Ok(BackupPermit {
            inner: self.inner.clone(),
            name: name.to_string(),
        })
    }

    /// The number of backups currently running.
    pub fn running(&self) -> usize {
        *self.inner.running.lock()
    }
}

impl Drop for BackupPermit {
    fn drop(&mut self) {
        let mut running = self.inner.running.lock();
        *running = running.saturating_sub(1);
        metrics::gauge!(METRIC_BACKUPS_RUNNING, *running as f64);
        tracing::debug!(task = %self.name, running = *running, "backup slot released");
    }
}
