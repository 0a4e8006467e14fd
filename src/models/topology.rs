//! Database and cluster topology models.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cluster::RaftState;
use crate::models::backup::PeriodicBackupConfiguration;
use crate::models::report::IndexState;
use crate::utils;

/// Why a node is not (yet) a full member of a database group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatabasePromotionStatus {
    WaitingForFirstPromotion,
    NotResponding,
    IndexNotUpToDate,
    ChangeVectorNotMerged,
    WaitingForResponse,
    Ok,
    OutOfCpuCredits,
    EarlyOutOfMemory,
    HighDirtyMemory,
}

impl DatabasePromotionStatus {
    /// Statuses for which a node keeps the tasks it is already responsible for.
    pub fn is_resource_pressure(&self) -> bool {
        matches!(self, Self::OutOfCpuCredits | Self::EarlyOutOfMemory | Self::HighDirtyMemory)
    }
}

/// The term and index at which a topology was last written.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderStamp {
    pub term: u64,
    pub index: u64,
}

/// The replication group of a single database.
///
/// Each node appears in at most one of `members`, `promotables` or `rehabs`. The first member is
/// the preferred node for clients.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseTopology {
    pub members: Vec<String>,
    pub promotables: Vec<String>,
    pub rehabs: Vec<String>,
    /// Explicit mentor choices for promotables, keyed by the promotable's tag.
    #[serde(default)]
    pub predefined_mentors: BTreeMap<String, String>,
    #[serde(default)]
    pub demotion_reasons: BTreeMap<String, String>,
    #[serde(default)]
    pub promotables_status: BTreeMap<String, DatabasePromotionStatus>,
    pub replication_factor: usize,
    #[serde(default)]
    pub dynamic_nodes_distribution: bool,
    #[serde(default)]
    pub priority_order: Vec<String>,
    #[serde(default)]
    pub stamp: LeaderStamp,
    /// `None` marks a legacy topology written before modification times were tracked.
    #[serde(default)]
    pub nodes_modified_at: Option<DateTime<Utc>>,
}

/// A task which is assigned to exactly one node of a database group.
pub trait ReplicatedTask {
    /// A stable key identifying the task across the cluster.
    fn task_key(&self) -> u64;

    /// The node explicitly requested to run this task.
    fn mentor_node(&self) -> Option<&str>;

    /// Whether the task must stay on its mentor even when the mentor is not a member.
    fn pinned_to_mentor(&self) -> bool {
        false
    }
}

/// The implicit task of mentoring a promotable or rehab node.
pub struct PromotableTask<'a> {
    pub node: &'a str,
    pub database: &'a str,
    pub mentor: Option<&'a str>,
}

impl<'a> ReplicatedTask for PromotableTask<'a> {
    fn task_key(&self) -> u64 {
        utils::stable_hash(format!("{}/{}", self.database, self.node).as_bytes())
    }

    fn mentor_node(&self) -> Option<&str> {
        self.mentor
    }
}

impl DatabaseTopology {
    /// All nodes of the group: members first, then promotables, then rehabs.
    pub fn all_nodes(&self) -> Vec<String> {
        self.members.iter().chain(self.promotables.iter()).chain(self.rehabs.iter()).cloned().collect()
    }

    /// The number of nodes in this group.
    pub fn count(&self) -> usize {
        self.members.len() + self.promotables.len() + self.rehabs.len()
    }

    /// Check whether the given node is part of this group in any role.
    pub fn relevant_for(&self, node: &str) -> bool {
        self.members.iter().chain(self.promotables.iter()).chain(self.rehabs.iter()).any(|n| n == node)
    }

    /// Remove a node from every role of the group, along with its annotations.
    pub fn remove_from_topology(&mut self, node: &str) {
        self.members.retain(|n| n != node);
        self.promotables.retain(|n| n != node);
        self.rehabs.retain(|n| n != node);
        self.demotion_reasons.remove(node);
        self.promotables_status.remove(node);
        self.predefined_mentors.remove(node);
    }

    /// Reorder members to follow the priority order, returning true if anything moved.
    ///
    /// Members listed in `priority_order` come first in that order; the rest keep their
    /// relative order.
    pub fn try_update_by_priority_order(&mut self) -> bool {
        if self.priority_order.is_empty() {
            return false;
        }
        let mut ordered: Vec<String> = self.priority_order.iter().filter(|n| self.members.contains(n)).cloned().collect();
        ordered.extend(self.members.iter().filter(|n| !self.priority_order.contains(n)).cloned());
        if ordered == self.members {
            return false;
        }
        self.members = ordered;
        true
    }

    /// Reapply the priority order after members were added.
    pub fn reorder_members(&mut self) {
        let _ = self.try_update_by_priority_order();
    }

    /// Check whether every node of this group is being deleted.
    pub fn entire_database_pending_deletion(&self, deletion_in_progress: &BTreeMap<String, DeletionInProgressStatus>) -> bool {
        self.all_nodes().iter().all(|node| deletion_in_progress.contains_key(node))
    }

    /// The node which should keep a task it already runs, if any.
    ///
    /// A member keeps its tasks. A node in rehab only because of resource pressure also keeps
    /// them, so that a struggling cluster does not shuffle every task at once.
    pub fn sticky_node(&self, last_responsible: Option<&str>) -> Option<String> {
        let last = last_responsible?;
        if self.members.iter().any(|n| n == last) {
            return Some(last.to_string());
        }
        if self.rehabs.iter().any(|n| n == last) {
            if let Some(status) = self.promotables_status.get(last) {
                if status.is_resource_pressure() {
                    return Some(last.to_string());
                }
            }
        }
        None
    }

    /// Determine which node is responsible for the given task.
    ///
    /// Returns `None` while this node has no say in the cluster (candidate or passive) or when
    /// the group has no member to run the task.
    pub fn whose_task_is_it(&self, state: RaftState, task: &impl ReplicatedTask, last_responsible: Option<&str>) -> Option<String> {
        if matches!(state, RaftState::Candidate | RaftState::Passive) {
            return None;
        }

        if let Some(mentor) = task.mentor_node().filter(|m| !m.is_empty()) {
            if self.members.iter().any(|n| n == mentor) {
                return Some(mentor.to_string());
            }
            if task.pinned_to_mentor() && self.relevant_for(mentor) {
                return Some(mentor.to_string());
            }
        }

        if let Some(node) = self.sticky_node(last_responsible) {
            return Some(node);
        }

        let mut candidates = self.all_nodes();
        candidates.sort();
        let mut key = task.task_key();
        while !candidates.is_empty() {
            let idx = utils::jump_consistent_hash(key, candidates.len());
            if self.members.contains(&candidates[idx]) {
                return Some(candidates.swap_remove(idx));
            }
            candidates.remove(idx);
            key = utils::mix_hash(key);
        }
        None
    }
}

/// Deletion progress of a database on a single node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletionInProgressStatus {
    No,
    SoftDelete,
    HardDelete,
}

/// The cluster-wide definition of an auto index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AutoIndexDefinition {
    pub name: String,
    #[serde(default)]
    pub collections: Vec<String>,
    /// `None` means the index was never explicitly transitioned, which reads as `Normal`.
    #[serde(default)]
    pub state: Option<IndexState>,
}

/// The replicated record describing a database.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseRecord {
    pub database_name: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub topology: Option<DatabaseTopology>,
    #[serde(default)]
    pub deletion_in_progress: BTreeMap<String, DeletionInProgressStatus>,
    #[serde(default)]
    pub auto_indexes: BTreeMap<String, AutoIndexDefinition>,
    #[serde(default)]
    pub periodic_backups: Vec<PeriodicBackupConfiguration>,
    #[serde(default)]
    pub truncated_cluster_transaction_commands_count: i64,
    /// Raft index of the last cluster-level change which a backup must capture.
    #[serde(default)]
    pub etag_for_backup: u64,
    /// Per-database configuration overrides.
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

impl DatabaseRecord {
    pub fn new(name: impl Into<String>, topology: DatabaseTopology) -> Self {
        Self {
            database_name: name.into(),
            topology: Some(topology),
            ..Default::default()
        }
    }

    /// Read a millisecond duration setting override.
    pub fn duration_setting_ms(&self, key: &str) -> Option<std::time::Duration> {
        self.settings.get(key).and_then(|val| val.parse::<u64>().ok()).map(std::time::Duration::from_millis)
    }
}

/// The membership of the cluster itself, mapping node tags to their URLs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterTopology {
    #[serde(default)]
    pub members: BTreeMap<String, String>,
    #[serde(default)]
    pub promotables: BTreeMap<String, String>,
    #[serde(default)]
    pub watchers: BTreeMap<String, String>,
}

impl ClusterTopology {
    /// Check whether the given node is part of the cluster in any role.
    pub fn contains(&self, node: &str) -> bool {
        self.members.contains_key(node) || self.promotables.contains_key(node) || self.watchers.contains_key(node)
    }

    /// All node tags of the cluster in sorted order.
    pub fn all_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self
            .members
            .keys()
            .chain(self.promotables.keys())
            .chain(self.watchers.keys())
            .cloned()
            .collect();
        nodes.sort();
        nodes.dedup();
        nodes
    }
}
