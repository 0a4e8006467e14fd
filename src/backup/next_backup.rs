//! Computation of the next backup occurrence of a task.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::models::backup::{PeriodicBackupConfiguration, PeriodicBackupStatus};
use crate::utils;

/// The next scheduled run of a backup task.
#[derive(Clone, Debug, PartialEq)]
pub struct NextBackup {
    pub task_id: u64,
    pub is_full: bool,
    /// The instant at which the backup should start.
    pub date_time: DateTime<Utc>,
    /// The wait from the time of computation until `date_time`.
    pub time_span: Duration,
}

impl NextBackup {
    /// A run of the given flavor after the given delay.
    ///
    /// Delays reaching past the representable range are clamped to its end.
    pub fn after(task_id: u64, is_full: bool, delay: Duration, now: DateTime<Utc>) -> Self {
        let date_time = now
            .checked_add_signed(utils::to_chrono_duration(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            task_id,
            is_full,
            date_time,
            time_span: delay,
        }
    }
}

/// The inputs of a next backup computation.
pub struct NextBackupParams<'a> {
    pub configuration: &'a PeriodicBackupConfiguration,
    pub status: &'a PeriodicBackupStatus,
    /// The node responsible for the task.
    pub responsible_node: &'a str,
    /// The instant the database was woken up for a backup, if it was.
    pub wake_up: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

/// Parse a backup frequency.
///
/// Standard five field crontab expressions are accepted along with the six and seven field
/// forms which carry seconds. Five field expressions use `0-7` days of the week with Sunday
/// as `0` or `7`.
pub fn parse_frequency(frequency: &str) -> Result<Schedule> {
    let fields: Vec<&str> = frequency.split_whitespace().collect();
    let expr = match fields.len() {
        5 => {
            let dow = map_day_of_week(fields[4]);
            format!("0 {} {} {} {} {}", fields[0], fields[1], fields[2], fields[3], dow)
        }
        6 | 7 => fields.join(" "),
        count => return Err(anyhow!("expected 5, 6 or 7 fields in '{}', found {}", frequency, count)),
    };
    Schedule::from_str(&expr).map_err(|err| anyhow!("invalid backup frequency '{}': {}", frequency, err))
}

fn map_day_of_week(field: &str) -> String {
    field.split(',').map(map_day_of_week_item).collect::<Vec<_>>().join(",")
}

/// Map one list item from `0-7` (Sunday is `0` or `7`) to the `1-7` form (Sunday is `1`).
fn map_day_of_week_item(item: &str) -> String {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => (range, format!("/{}", step)),
        None => (item, String::new()),
    };
    let day = |val: &str| val.parse::<u32>().ok().filter(|d| *d <= 7).map(|d| d % 7 + 1);
    match range.split_once('-') {
        Some((start, end)) => match (day(start), day(end)) {
            // `1-7` ends on Sunday, which now sorts first.
            (Some(start), Some(end)) if start > end && end == 1 => format!("{}-7{},1", start, step),
            (Some(start), Some(end)) => format!("{}-{}{}", start, end, step),
            _ => item.to_string(),
        },
        None => match day(range) {
            Some(day) => format!("{}{}", day, step),
            None => item.to_string(),
        },
    }
}

/// The first occurrence of the frequency strictly after `last_backup`.
///
/// Returns `Ok(None)` when no frequency is configured.
pub fn get_next_backup_occurrence(frequency: Option<&str>, last_backup: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    let frequency = match frequency.map(str::trim).filter(|f| !f.is_empty()) {
        Some(frequency) => frequency,
        None => return Ok(None),
    };
    let schedule = parse_frequency(frequency)?;
    Ok(schedule.after(&last_backup).next())
}

/// Whether the next run must be a full backup regardless of the schedule.
pub fn is_full_backup_forced(status: &PeriodicBackupStatus, configuration: &PeriodicBackupConfiguration, responsible_node: &str) -> bool {
    status.last_full_backup.is_none()
        || status.node_tag.as_deref() != Some(responsible_node)
        || status.backup_type != configuration.backup_type
        || status.last_etag.is_none()
}

/// Compute the next backup of a task.
///
/// `on_parsing_error` is invoked with the offending frequency for each frequency which fails to
/// parse. Returns `None` when no occurrence could be computed.
pub fn get_next_backup_details(params: &NextBackupParams<'_>, mut on_parsing_error: impl FnMut(&str, &anyhow::Error)) -> Option<NextBackup> {
    let (cfg, status, now) = (params.configuration, params.status, params.now);
    let last_full = status.last_full_backup_internal.or(params.wake_up).unwrap_or(now);
    let last_incremental = status
        .last_incremental_backup_internal
        .or(status.last_full_backup_internal)
        .or(params.wake_up)
        .unwrap_or(now);

    let mut occurrence = |frequency: Option<&String>, last: DateTime<Utc>| match get_next_backup_occurrence(frequency.map(String::as_str), last) {
        Ok(next) => next,
        Err(err) => {
            on_parsing_error(frequency.map(String::as_str).unwrap_or_default(), &err);
            None
        }
    };
    let next_full = occurrence(cfg.full_backup_frequency.as_ref(), last_full);
    let next_incremental = occurrence(cfg.incremental_backup_frequency.as_ref(), last_incremental);

    let forced = is_full_backup_forced(status, cfg, params.responsible_node);
    let (is_full, mut date_time) = match (next_full, next_incremental) {
        (None, None) => return None,
        (Some(full), None) => (true, full),
        (None, Some(incremental)) => (forced, incremental),
        (Some(full), Some(incremental)) if forced => (true, full.min(incremental)),
        (Some(full), Some(incremental)) if full <= incremental => (true, full),
        (Some(_), Some(incremental)) => (false, incremental),
    };

    // A task which never ran fires right away.
    if status.last_full_backup_internal.is_none() && params.wake_up.is_none() {
        date_time = now;
    }
    let time_span = if date_time <= now {
        date_time = now;
        Duration::ZERO
    } else {
        utils::to_std_duration(date_time - now)
    };
    Some(NextBackup {
        task_id: cfg.task_id,
        is_full,
        date_time,
        time_span,
    })
}
