//! Health classification of database instances from consecutive node reports.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::cluster::NodeReports;
use crate::models::report::{ClusterNodeStatusReport, DatabaseStatus, DatabaseStatusReport, ReportStatus};
use crate::models::topology::{ClusterTopology, DatabasePromotionStatus, DatabaseRecord, DatabaseTopology, PromotableTask};
use crate::observer::ObserverCtl;
use crate::utils;

/// What the latest round of reports says about one node and one database.
#[derive(Clone, Copy, Debug)]
pub enum Observation<'a> {
    /// The node delivered no report at all.
    NoReport,
    /// The node reported, but knows nothing about the database.
    NoDatabase(&'a ClusterNodeStatusReport),
    Reported(&'a ClusterNodeStatusReport, &'a DatabaseStatusReport),
}

impl<'a> Observation<'a> {
    pub fn new(reports: &'a NodeReports, node: &str, database: &str) -> Self {
        match reports.get(node) {
            None => Self::NoReport,
            Some(node_report) => match node_report.report.get(database) {
                Some(db_report) => Self::Reported(node_report, db_report),
                None => Self::NoDatabase(node_report),
            },
        }
    }

    pub fn node(&self) -> Option<&'a ClusterNodeStatusReport> {
        match self {
            Self::NoReport => None,
            Self::NoDatabase(node) | Self::Reported(node, _) => Some(node),
        }
    }

    pub fn database(&self) -> Option<&'a DatabaseStatusReport> {
        match self {
            Self::Reported(_, db) => Some(db),
            _ => None,
        }
    }
}

/// The verdict on whether a database instance on a node is usable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatabaseHealth {
    NotEnoughInfo,
    Bad,
    Good,
}

/// Everything the observer looks at while deciding on one database in one round.
pub struct DatabaseObservation {
    pub name: String,
    /// The working copy of the topology, mutated by the decision functions.
    pub topology: DatabaseTopology,
    /// The rest of the record. Its `topology` field is empty.
    pub record: DatabaseRecord,
    /// The etag of the record the topology was read from.
    pub record_etag: u64,
    pub cluster_topology: Arc<ClusterTopology>,
    pub current: Arc<NodeReports>,
    pub previous: Arc<NodeReports>,
}

impl DatabaseObservation {
    pub fn new(
        mut record: DatabaseRecord, record_etag: u64, cluster_topology: Arc<ClusterTopology>, current: Arc<NodeReports>, previous: Arc<NodeReports>,
    ) -> Option<Self> {
        let topology = record.topology.take()?;
        Some(Self {
            name: record.database_name.clone(),
            topology,
            record,
            record_etag,
            cluster_topology,
            current,
            previous,
        })
    }

    pub fn current_database_report(&self, node: &str) -> Option<&DatabaseStatusReport> {
        Observation::new(&self.current, node, &self.name).database()
    }

    pub fn previous_database_report(&self, node: &str) -> Option<&DatabaseStatusReport> {
        Observation::new(&self.previous, node, &self.name).database()
    }

    /// Check whether every node of the group delivered a report this round.
    pub fn all_database_nodes_have_report(&self) -> bool {
        if self.topology.count() == 0 {
            return false;
        }
        self.topology.all_nodes().iter().all(|node| self.current.contains_key(node))
    }
}

//////////////////////////////////////////////////////////////////////////////
// Grace Windows /////////////////////////////////////////////////////////////

/// Whether a node deserves more time before the given grace window is considered elapsed.
///
/// A node that never delivered a good report is only given time while the observer itself is
/// younger than the window. An unloaded database is judged by the observer's age alone.
pub fn should_give_more_grace(
    now: DateTime<Utc>, observer_started: DateTime<Utc>, last_successful_update: Option<DateTime<Utc>>, database_up_time: Option<Duration>,
    grace: Duration,
) -> bool {
    let grace_start = now - utils::to_chrono_duration(grace);
    if last_successful_update.is_none() && grace_start < observer_started {
        return true;
    }
    let up_time = match database_up_time {
        Some(up_time) => up_time,
        None => return grace_start < observer_started,
    };
    match last_successful_update {
        Some(last) => grace_start < last && grace > up_time,
        None => false,
    }
}

/// Whether a failing member should stay a member for now instead of moving to rehab.
pub fn should_give_more_time_before_moving_to_rehab(
    now: DateTime<Utc>, observer_started: DateTime<Utc>, last_successful_update: Option<DateTime<Utc>>, database_up_time: Option<Duration>,
    rehab_grace: Duration,
) -> bool {
    if matches!(database_up_time, Some(up_time) if up_time < rehab_grace) {
        return true;
    }
    should_give_more_grace(now, observer_started, last_successful_update, database_up_time, rehab_grace)
}

/// Whether a failing preferred member should keep its place at the head of the member list.
pub fn should_give_more_time_before_rotating(
    now: DateTime<Utc>, observer_started: DateTime<Utc>, last_successful_update: Option<DateTime<Utc>>, database_up_time: Option<Duration>,
    rotate_grace: Duration,
) -> bool {
    if matches!(database_up_time, Some(up_time) if up_time > rotate_grace) {
        return false;
    }
    should_give_more_grace(now, observer_started, last_successful_update, database_up_time, rotate_grace)
}

/// Build the demotion reason for a member which is not healthy, or `None` if it is healthy.
pub fn rehab_reason(observation: Observation<'_>) -> Option<String> {
    let (node, db) = match observation {
        Observation::NoReport => return Some("Node in rehabilitation due to no status report in the latest cluster stats".into()),
        Observation::NoDatabase(node) => (node, None),
        Observation::Reported(node, db) => (node, Some(db)),
    };
    let db = db.filter(|_| node.status == ReportStatus::Ok);
    if let Some(db) = db {
        if matches!(db.status, DatabaseStatus::Loaded | DatabaseStatus::Unloaded | DatabaseStatus::Shutdown | DatabaseStatus::NoChange) {
            return None;
        }
    }

    let mut reason = match node.status {
        ReportStatus::Ok => match db.map(|db| db.status) {
            Some(DatabaseStatus::Faulted) => "In rehabilitation because the DatabaseStatus for this node is Faulted.\n".to_string(),
            status => format!(
                "In rehabilitation because the node is reachable but had no report about the database (Status: {}).\n",
                status.map(|s| format!("{:?}", s)).unwrap_or_default()
            ),
        },
        ReportStatus::Timeout => "Node in rehabilitation due to timeout reached trying to get stats from node.\n".to_string(),
        ReportStatus::OutOfCredits => "Node in rehabilitation because it run out of CPU credits.\n".to_string(),
        ReportStatus::EarlyOutOfMemory => "Node in rehabilitation because of early out of memory.\n".to_string(),
        ReportStatus::HighDirtyMemory => "Node in rehabilitation because of high dirty memory.\n".to_string(),
        status => format!("Node in rehabilitation due to last report status being '{:?}'.\n", status),
    };
    if let Some(err) = node.error.as_deref() {
        reason.push_str(&format!(". {}", err));
    }
    if let Some(err) = db.and_then(|db| db.error.as_deref()) {
        reason.push_str(&format!(". {}", err));
    }
    Some(reason)
}

/// The promotion status surfacing why a node was demoted.
pub fn demotion_status(node: Option<&ClusterNodeStatusReport>) -> DatabasePromotionStatus {
    match node.map(|n| &n.server_report) {
        Some(server) if server.out_of_cpu_credits => DatabasePromotionStatus::OutOfCpuCredits,
        Some(server) if server.early_out_of_memory => DatabasePromotionStatus::EarlyOutOfMemory,
        Some(server) if server.high_dirty_memory => DatabasePromotionStatus::HighDirtyMemory,
        _ => DatabasePromotionStatus::NotResponding,
    }
}

//////////////////////////////////////////////////////////////////////////////
// Observer Health Checks ////////////////////////////////////////////////////

impl ObserverCtl {
    pub(super) fn should_give_more_time_before_moving_to_rehab(&self, now: DateTime<Utc>, last: Option<DateTime<Utc>>, up_time: Option<Duration>) -> bool {
        should_give_more_time_before_moving_to_rehab(now, self.start_time, last, up_time, self.config.move_to_rehab_grace_time())
    }

    pub(super) fn should_give_more_time_before_rotating(&self, now: DateTime<Utc>, last: Option<DateTime<Utc>>, up_time: Option<Duration>) -> bool {
        should_give_more_time_before_rotating(now, self.start_time, last, up_time, self.config.rotate_preferred_node_grace_time())
    }

    /// Classify the database instance on `node`.
    pub(super) fn failed_database_instance_or_node(&self, node: &str, state: &DatabaseObservation, now: DateTime<Utc>) -> DatabaseHealth {
        if !state.cluster_topology.contains(node) {
            return DatabaseHealth::Bad;
        }
        let stats = match state.current.get(node) {
            Some(stats) => stats,
            None => return DatabaseHealth::NotEnoughInfo,
        };

        let breakdown = self.config.breakdown_timeout();
        let unresponsive = match stats.last_successful_update_date_time {
            Some(last) => utils::elapsed_since(now, last) > breakdown,
            None => true,
        };
        if unresponsive {
            if utils::elapsed_since(now, self.start_time) < breakdown {
                return DatabaseHealth::NotEnoughInfo;
            }
            return DatabaseHealth::Bad;
        }

        match stats.last_good_database_status.get(&state.name) {
            None => DatabaseHealth::NotEnoughInfo,
            Some(last_good) if utils::elapsed_since(now, *last_good) > breakdown => DatabaseHealth::Bad,
            Some(_) => DatabaseHealth::Good,
        }
    }

    /// Members plus every promotable and rehab which is not known to be bad.
    pub(super) fn number_of_responding_nodes(&self, state: &DatabaseObservation, now: DateTime<Utc>) -> usize {
        let others = state
            .topology
            .promotables
            .iter()
            .chain(state.topology.rehabs.iter())
            .filter(|node| self.failed_database_instance_or_node(node, state, now) != DatabaseHealth::Bad)
            .count();
        state.topology.members.len() + others
    }

    /// Move `member` to rehab unless its latest report is healthy, returning true if it was moved.
    ///
    /// A node already in rehab is not added twice; its reason and status are refreshed.
    pub(super) fn try_move_to_rehab(&mut self, database: &str, topology: &mut DatabaseTopology, current: &NodeReports, member: &str) -> bool {
        let observation = Observation::new(current, member, database);
        let reason = match rehab_reason(observation) {
            Some(reason) => reason,
            None => return false,
        };

        if !topology.rehabs.iter().any(|n| n == member) {
            topology.members.retain(|n| n != member);
            topology.rehabs.push(member.to_string());
        }
        topology.demotion_reasons.insert(member.to_string(), reason.clone());
        topology.promotables_status.insert(member.to_string(), demotion_status(observation.node()));

        self.log_message(format!("Node {} of database '{}': {}", member, database, reason), Some(database));
        true
    }

    /// The member responsible for replicating to the given promotable or rehab.
    pub(super) fn try_get_mentor_node(&self, database: &str, topology: &DatabaseTopology, promotable: &str) -> Option<String> {
        let task = PromotableTask {
            node: promotable,
            database,
            mentor: topology.predefined_mentors.get(promotable).map(String::as_str),
        };
        topology.whose_task_is_it(self.cluster.status().state, &task, None)
    }
}
