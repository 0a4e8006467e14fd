//! User facing alerts.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// The maximum number of alerts retained in memory.
const MAX_ALERTS: usize = 1024;

const METRIC_ALERTS_RAISED: &str = "warden_alerts_raised";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertType {
    DatabaseTopologyWarning,
    PeriodicBackup,
    ClusterTransactionFailure,
    RecoverableStorageError,
    NonDurableFileSystem,
    Operation,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// A structured alert raised for operators.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub database: Option<String>,
    pub title: String,
    pub message: String,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(database: Option<&str>, title: impl Into<String>, message: impl Into<String>, alert_type: AlertType, severity: Severity) -> Self {
        let title = title.into();
        Self {
            id: format!("AlertRaised/{:?}/{}", alert_type, database.unwrap_or("")),
            database: database.map(String::from),
            title,
            message: message.into(),
            alert_type,
            severity,
            details: None,
            created_at: Utc::now(),
        }
    }

    /// Attach details, typically an error chain.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Give the alert an explicit id, used for later dismissal.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// The sink for alerts raised by the observer and the backup subsystem.
#[derive(Clone)]
pub struct NotificationCenter {
    inner: Arc<NotificationCenterInner>,
}

struct NotificationCenterInner {
    alerts: Mutex<VecDeque<Alert>>,
    tx: broadcast::Sender<Alert>,
}

impl Default for NotificationCenter {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationCenter {
    pub fn new() -> Self {
        metrics::register_counter!(METRIC_ALERTS_RAISED, metrics::Unit::Count, "the number of alerts raised");
        let (tx, _) = broadcast::channel(100);
        Self {
            inner: Arc::new(NotificationCenterInner {
                alerts: Mutex::new(VecDeque::new()),
                tx,
            }),
        }
    }

    /// Add an alert, replacing an existing alert with the same id when `update_existing`.
    pub fn add(&self, alert: Alert, update_existing: bool) {
        tracing::debug!(
            id = %alert.id,
            database = ?alert.database,
            title = %alert.title,
            severity = ?alert.severity,
            "alert raised"
        );
        metrics::increment_counter!(METRIC_ALERTS_RAISED);
        {
            let mut alerts = self.inner.alerts.lock();
            if update_existing {
                alerts.retain(|existing| existing.id != alert.id);
            }
            if alerts.len() >= MAX_ALERTS {
                alerts.pop_front();
            }
            alerts.push_back(alert.clone());
        }
        let _ = self.inner.tx.send(alert);
    }

    /// Remove every alert with the given id, returning true if any was removed.
    pub fn dismiss(&self, id: &str) -> bool {
        let mut alerts = self.inner.alerts.lock();
        let before = alerts.len();
        alerts.retain(|alert| alert.id != id);
        before != alerts.len()
    }

    /// All retained alerts, oldest first.
    pub fn alerts(&self) -> Vec<Alert> {
        self.inner.alerts.lock().iter().cloned().collect()
    }

    /// All retained alerts of the given database.
    pub fn alerts_for(&self, database: &str) -> Vec<Alert> {
        self.inner
            .alerts
            .lock()
            .iter()
            .filter(|alert| alert.database.as_deref() == Some(database))
            .cloned()
            .collect()
    }

    /// Subscribe to alerts raised from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.inner.tx.subscribe()
    }
}
