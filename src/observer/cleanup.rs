//! Cluster wide cleanup sweeps piggybacked on the observer: unused auto indexes, compare exchange
//! tombstones and completed cluster transactions.

use std::time::Duration;

use anyhow::Result;

use crate::cluster::Cluster;
use crate::config::Config;
use crate::models::commands::{ClusterCommand, DeleteIndexCommand, SetIndexStateCommand};
use crate::models::report::{IndexState, AUTO_INDEX_PREFIX};
use crate::observer::health::DatabaseObservation;

/// The number of compare exchange tombstones removed by a single command.
pub const COMPARE_EXCHANGE_TOMBSTONES_BATCH: usize = 8192;
/// The number of expired compare exchange values removed by a single command.
pub const EXPIRED_COMPARE_EXCHANGE_BATCH: usize = 1024;

const SETTING_IDLE_AFTER: &str = "Indexing.TimeToWaitBeforeMarkingAutoIndexAsIdleInMs";
const SETTING_DELETE_AFTER: &str = "Indexing.TimeToWaitBeforeDeletingAutoIndexMarkedAsIdleInMs";

/// The outcome of inspecting a database's compare exchange tombstones.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareExchangeTombstonesState {
    /// Tombstones up to the given raft index may be removed.
    HasMore(u64),
    NoMoreTombstones,
    /// A backup task carries an error but no raft index; nothing is safe to remove.
    InvalidPeriodicBackupStatus,
    /// Not every node of the database reported; retry on the next sweep.
    InvalidDatabaseObservationState,
}

/// Find auto indexes which went unqueried long enough to be idled, revived or deleted.
///
/// Nothing is decided unless every node of the database reported and knows the database. The
/// time since the last query is taken as the minimum across nodes, relative to the youngest
/// node: a node which restarted after the last query cannot tell how long the index was idle.
pub fn get_unused_auto_indexes(config: &Config, state: &DatabaseObservation) -> Vec<(String, ClusterCommand)> {
    let mut commands = vec![];
    if !state.all_database_nodes_have_report() {
        return commands;
    }

    let mut index_last_queried: Vec<(String, Duration)> = vec![];
    let mut lowest_up_time: Option<Duration> = None;
    let mut newest_query: Option<Duration> = None;
    for node in state.topology.all_nodes() {
        let report = match state.current_database_report(&node) {
            Some(report) => report,
            None => return commands,
        };
        if let Some(up_time) = report.up_time {
            lowest_up_time = Some(lowest_up_time.map_or(up_time, |lowest| lowest.min(up_time)));
        }
        for (name, stats) in report.last_index_stats.iter() {
            if !name.to_lowercase().starts_with(&AUTO_INDEX_PREFIX.to_lowercase()) {
                continue;
            }
            let last_queried = match stats.last_queried {
                Some(last_queried) => last_queried,
                None => continue,
            };
            newest_query = Some(newest_query.map_or(last_queried, |newest| newest.min(last_queried)));
            match index_last_queried.iter_mut().find(|(existing, _)| existing == name) {
                Some((_, value)) => *value = (*value).min(last_queried),
                None => index_last_queried.push((name.clone(), last_queried)),
            }
        }
    }
    let (lowest_up_time, newest_query) = match (lowest_up_time, newest_query) {
        (Some(lowest), Some(newest)) => (lowest, newest),
        _ => return commands,
    };

    let idle_after = state.record.duration_setting_ms(SETTING_IDLE_AFTER).unwrap_or_else(|| config.auto_index_idle_after());
    let delete_after = state.record.duration_setting_ms(SETTING_DELETE_AFTER).unwrap_or_else(|| config.auto_index_delete_after());

    for (name, last_queried) in index_last_queried {
        let state_of = state
            .record
            .auto_indexes
            .get(&name)
            .map(|def| def.state.unwrap_or(IndexState::Normal));
        let index_state = match state_of {
            Some(index_state) => index_state,
            None => continue,
        };
        let difference = if lowest_up_time > last_queried {
            last_queried
        } else {
            last_queried.saturating_sub(newest_query)
        };

        match index_state {
            IndexState::Idle if difference >= delete_after => {
                commands.push((
                    format!("Deleting idle auto-index '{}' because last query time value is '{:?}' and threshold is set to '{:?}'.", name, difference, delete_after),
                    ClusterCommand::DeleteIndex(DeleteIndexCommand {
                        index_name: name,
                        database_name: state.name.clone(),
                        raft_command_index: Some(state.record_etag),
                    }),
                ));
            }
            IndexState::Normal if difference >= idle_after => {
                commands.push((
                    format!("Marking auto-index '{}' as idle because last query time value is '{:?}' and threshold is set to '{:?}'.", name, difference, idle_after),
                    ClusterCommand::SetIndexState(SetIndexStateCommand {
                        index_name: name,
                        state: IndexState::Idle,
                        database_name: state.name.clone(),
                        raft_command_index: Some(state.record_etag),
                    }),
                ));
            }
            IndexState::Idle if difference < idle_after => {
                commands.push((
                    format!("Marking idle auto-index '{}' as normal because last query time value is '{:?}' and threshold is set to '{:?}'.", name, difference, idle_after),
                    ClusterCommand::SetIndexState(SetIndexStateCommand {
                        index_name: name,
                        state: IndexState::Normal,
                        database_name: state.name.clone(),
                        raft_command_index: Some(state.record_etag),
                    }),
                ));
            }
            _ => (),
        }
    }
    commands
}

/// Compute how far the compare exchange tombstones of a database may be purged.
///
/// Tombstones are kept until every backup task has captured them and every index which
/// references compare exchange values has processed them.
pub fn get_compare_exchange_tombstones_state(cluster: &Cluster, state: &DatabaseObservation) -> Result<CompareExchangeTombstonesState> {
    if !cluster.has_compare_exchange_tombstones(&state.name)? {
        return Ok(CompareExchangeTombstonesState::NoMoreTombstones);
    }

    let mut max_etag = u64::MAX;
    for config in state.record.periodic_backups.iter() {
        let status = match cluster.read_backup_status(&state.name, config.task_id)? {
            Some(status) => status,
            None => continue,
        };
        if status.last_full_backup_internal.is_none() && status.last_incremental_backup_internal.is_none() {
            continue;
        }
        let last_raft_index = match status.last_raft_index.as_ref() {
            Some(last_raft_index) => last_raft_index,
            None if status.error.is_some() => return Ok(CompareExchangeTombstonesState::InvalidPeriodicBackupStatus),
            None => continue,
        };
        let last_etag = match last_raft_index.last_etag {
            Some(last_etag) => last_etag,
            None => continue,
        };
        max_etag = max_etag.min(last_etag);
        if max_etag == 0 {
            return Ok(CompareExchangeTombstonesState::NoMoreTombstones);
        }
    }

    if state.topology.count() != state.current.len() {
        return Ok(CompareExchangeTombstonesState::InvalidDatabaseObservationState);
    }
    for node in state.topology.all_nodes() {
        let report = match state.current_database_report(&node) {
            Some(report) => report,
            None => return Ok(CompareExchangeTombstonesState::InvalidDatabaseObservationState),
        };
        for stats in report.last_index_stats.values() {
            if let Some(etag) = stats.last_indexed_compare_exchange_reference_tombstone_etag {
                max_etag = max_etag.min(etag.max(0) as u64);
            }
        }
    }
    if max_etag == 0 {
        return Ok(CompareExchangeTombstonesState::NoMoreTombstones);
    }
    Ok(CompareExchangeTombstonesState::HasMore(max_etag))
}

/// The completed cluster transaction count every node of the database agrees on, if it moved
/// past what was already truncated.
pub fn clean_up_database_values(state: &DatabaseObservation) -> Option<i64> {
    if !state.all_database_nodes_have_report() {
        return None;
    }
    let mut min_completed: Option<i64> = None;
    for node in state.topology.all_nodes() {
        let report = state.current_database_report(&node)?;
        let completed = report.last_completed_cluster_transaction;
        min_completed = Some(min_completed.map_or(completed, |min| min.min(completed)));
    }
    min_completed.filter(|completed| *completed > state.record.truncated_cluster_transaction_commands_count)
}

/// The idempotency id of a cluster state cleanup, derived from the per database counts.
pub fn cleanup_command_id<'a>(entries: impl Iterator<Item = (&'a String, &'a i64)>) -> String {
    let mut hash = 0u64;
    for (name, count) in entries {
        let mut data = name.to_lowercase().into_bytes();
        data.extend_from_slice(&count.to_be_bytes());
        hash ^= crate::utils::stable_hash(&data);
    }
    format!("cleanup/{:x}", hash)
}
