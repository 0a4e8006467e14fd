//! Timers of scheduled backups.
//!
//! A single wait never exceeds the configured maximum. Longer waits are split into repeated
//! maximum waits, recomputing the remaining time against the clock after each of them.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backup::next_backup::NextBackup;
use crate::utils;

/// The next step of a timer with the given time remaining.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerStep {
    /// Wait this long, then fire.
    Fire(Duration),
    /// Wait the maximum, then recompute.
    Rearm(Duration),
}

pub fn next_step(remaining: Duration, max: Duration) -> TimerStep {
    if remaining <= max {
        TimerStep::Fire(remaining)
    } else {
        TimerStep::Rearm(max)
    }
}

/// An armed timer which runs its callback once the scheduled backup is due.
pub struct BackupTimer {
    next: NextBackup,
    token: CancellationToken,
    _handle: JoinHandle<()>,
}

impl BackupTimer {
    /// Arm a timer for the given backup.
    pub fn arm<F, Fut>(next: NextBackup, max: Duration, on_fire: F) -> Self
    where
        F: FnOnce(NextBackup) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let handle = tokio::spawn(Self::run(next.clone(), max, token.clone(), on_fire));
        Self { next, token, _handle: handle }
    }

    async fn run<F, Fut>(next: NextBackup, max: Duration, token: CancellationToken, on_fire: F)
    where
        F: FnOnce(NextBackup) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        loop {
            let remaining = utils::to_std_duration(next.date_time - Utc::now());
            let step = next_step(remaining, max);
            let wait = match step {
                TimerStep::Fire(wait) | TimerStep::Rearm(wait) => wait,
            };
            tokio::select! {
                _ = tokio::time::sleep(wait) => (),
                _ = token.cancelled() => return,
            }
            if let TimerStep::Fire(_) = step {
                break;
            }
            tracing::trace!(task_id = next.task_id, "long backup timer re-armed");
        }
        on_fire(next).await
    }

    /// The backup this timer is armed for.
    pub fn next(&self) -> &NextBackup {
        &self.next
    }

    /// Stop the timer. A callback already running is not interrupted.
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Drop for BackupTimer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
