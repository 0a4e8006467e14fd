//! Topology decisions: rehab, rotation, promotion and replica replacement.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::change_vector::{self, ConflictStatus};
use crate::models::commands::DeleteDatabaseCommand;
use crate::models::report::{DatabaseStatus, IndexState, ObservedIndexStatus, ReportStatus, FAULTY_INDEX_ETAG, SIDE_BY_SIDE_INDEX_PREFIX};
use crate::models::topology::DatabasePromotionStatus;
use crate::observer::health::{DatabaseHealth, DatabaseObservation};
use crate::observer::ObserverCtl;
use crate::utils;

const THINGS_TO_CHECK: &str = "Things you may check: verify node is working, check for ports being blocked by firewall or similar software.";

/// The outcome of evaluating a promotable for promotion.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PromoteDecision {
    pub promote: bool,
    /// A topology status change which should be persisted even without promotion.
    pub update_reason: Option<String>,
}

impl PromoteDecision {
    fn hold() -> Self {
        Self::default()
    }

    fn hold_with(reason: String) -> Self {
        Self {
            promote: false,
            update_reason: Some(reason),
        }
    }
}

impl ObserverCtl {
    /// Evaluate the topology of one database, mutating `state.topology` in place.
    ///
    /// Returns the reason of the first change made, or `None` when the topology is unchanged.
    /// Nodes which should be removed from the group are appended to `deletions`.
    #[tracing::instrument(level = "debug", skip(self, state, deletions, now), fields(database = %state.name))]
    pub(super) fn update_database_topology(&mut self, state: &mut DatabaseObservation, deletions: &mut Vec<DeleteDatabaseCommand>, now: DateTime<Utc>) -> Option<String> {
        let (current, previous) = (state.current.clone(), state.previous.clone());
        let name = state.name.clone();
        let mut has_living_nodes = false;
        let mut some_nodes_require_more_time = false;
        let mut rotate_preferred_node = false;

        for member in state.topology.members.clone() {
            let node_stats = match current.get(&member) {
                Some(stats) => stats.clone(),
                None => {
                    // Wait for the next round if the node was seen in the previous one.
                    if previous.contains_key(&member) {
                        continue;
                    }
                    let msg = format!(
                        "The member node {} was not found in both current and previous reports of the cluster observer. If this error continue to raise, check the latency between the cluster nodes.",
                        member
                    );
                    self.log_message(msg.clone(), Some(name.as_str()));
                    self.raise_node_not_found_alert(&msg, &member);
                    continue;
                }
            };

            let db_stats = if node_stats.status == ReportStatus::Ok { node_stats.report.get(&name) } else { None };
            let status = db_stats.map(|db| db.status).unwrap_or(DatabaseStatus::None);
            if status.is_healthy() {
                has_living_nodes = true;
                let topology = &mut state.topology;
                if topology.promotables_status.contains_key(&member) || topology.demotion_reasons.contains_key(&member) {
                    topology.demotion_reasons.remove(&member);
                    topology.promotables_status.remove(&member);
                    return Some(format!("Node {} is online", member));
                }
                continue;
            }

            let (last_success, up_time) = (node_stats.last_successful_update_date_time, db_stats.and_then(|db| db.up_time));
            if self.should_give_more_time_before_moving_to_rehab(now, last_success, up_time) {
                if !self.should_give_more_time_before_rotating(now, last_success, up_time)
                    && state.topology.members.len() > 1
                    && state.topology.members[0] == member
                {
                    rotate_preferred_node = true;
                }
                some_nodes_require_more_time = true;
                continue;
            }

            // Without dynamic distribution the node stays a member, flagged as not responding.
            if state.topology.dynamic_nodes_distribution {
                if self.try_move_to_rehab(&name, &mut state.topology, &current, &member) {
                    let elapsed = last_success
                        .map(|at| format!("{:?}", utils::elapsed_since(now, at)))
                        .unwrap_or_else(|| "no successful report".into());
                    return Some(format!(
                        "Node {} is currently not responding (with status: {:?}) and moved to rehab ({})",
                        member, status, elapsed
                    ));
                }
            } else if state.topology.promotables_status.get(&member) != Some(&DatabasePromotionStatus::NotResponding) {
                state.topology.demotion_reasons.insert(member.clone(), "Not responding".into());
                state.topology.promotables_status.insert(member.clone(), DatabasePromotionStatus::NotResponding);
                return Some(format!("Node {} is currently not responding with the status '{:?}'", member, status));
            }
        }

        if has_living_nodes && rotate_preferred_node {
            let member = state.topology.members.remove(0);
            state.topology.members.push(member.clone());
            return Some(format!("The preferred Node {} is currently not responding and moved to the end of the list", member));
        }

        if !has_living_nodes {
            let mut recoverable: Vec<String> = state
                .topology
                .rehabs
                .iter()
                .filter(|rehab| self.failed_database_instance_or_node(rehab, state, now) == DatabaseHealth::Good)
                .cloned()
                .collect();
            if state.topology.members.is_empty() {
                // As a last resort, a promotable is promoted.
                recoverable.extend(
                    state
                        .topology
                        .promotables
                        .iter()
                        .filter(|promotable| self.failed_database_instance_or_node(promotable, state, now) == DatabaseHealth::Good)
                        .cloned(),
                );
            }

            if let Some(node) = find_most_up_to_date_node(&recoverable, state) {
                state.topology.rehabs.retain(|n| n != &node);
                state.topology.promotables.retain(|n| n != &node);
                state.topology.members.push(node.clone());
                self.raise_no_living_nodes_alert(
                    &format!(
                        "None of '{}' database nodes are responding to the supervisor, promoting {} to avoid making the database completely unreachable.",
                        name, node
                    ),
                    &name,
                );
                return Some(format!("None of '{}' nodes are responding, promoting {}", name, node));
            }

            if state.topology.entire_database_pending_deletion(&state.record.deletion_in_progress) {
                return None;
            }
            self.raise_no_living_nodes_alert(
                &format!("None of '{}' database nodes are responding to the supervisor, the database is unreachable.", name),
                &name,
            );
        }

        if !some_nodes_require_more_time {
            if let Some(reason) = self.check_members_distance(state) {
                return Some(reason);
            }
            if state.topology.try_update_by_priority_order() {
                return Some("Reordering the member nodes to ensure the priority order.".into());
            }
        }

        let mut update_reasons: Vec<String> = vec![];

        for promotable in state.topology.promotables.clone() {
            if self.failed_database_instance_or_node(&promotable, state, now) == DatabaseHealth::Bad {
                let replacement = if state.topology.dynamic_nodes_distribution {
                    self.try_find_fit_node(&promotable, state, now)
                } else {
                    None
                };
                let node = match replacement {
                    Some(node) => node,
                    None => {
                        if state.topology.promotables_status.get(&promotable) != Some(&DatabasePromotionStatus::NotResponding) {
                            state.topology.demotion_reasons.insert(promotable.clone(), "Not responding".into());
                            state.topology.promotables_status.insert(promotable.clone(), DatabasePromotionStatus::NotResponding);
                            return Some(format!("Node {} is currently not responding", promotable));
                        }
                        continue;
                    }
                };

                // Replace the bad promotable, otherwise more and more nodes would be added.
                state.topology.promotables.push(node.clone());
                state
                    .topology
                    .demotion_reasons
                    .insert(node.clone(), format!("Just replaced the promotable node {}", promotable));
                state
                    .topology
                    .promotables_status
                    .insert(node.clone(), DatabasePromotionStatus::WaitingForFirstPromotion);
                deletions.push(DeleteDatabaseCommand {
                    database_name: name.clone(),
                    from_nodes: vec![promotable.clone()],
                    hard_delete: self.config.hard_delete_on_replacement,
                    error_on_database_does_not_exists: false,
                    update_replication_factor: false,
                });
                return Some(format!("The promotable {} is not responsive, replace it with a node {}", promotable, node));
            }

            let mentor = match self.try_get_mentor_node(&name, &state.topology, &promotable) {
                Some(mentor) => mentor,
                None => continue,
            };
            let decision = self.try_promote(state, &mentor, &promotable);
            if decision.promote {
                state.topology.promotables.retain(|n| n != &promotable);
                state.topology.members.push(promotable.clone());
                state.topology.predefined_mentors.remove(&promotable);
                self.remove_other_nodes_if_needed(state, deletions);
                state.topology.reorder_members();
                return Some(format!("Promoting node {} to member", promotable));
            }
            update_reasons.extend(decision.update_reason);
        }

        let good_members = self.number_of_responding_nodes(state, now);
        for rehab in state.topology.rehabs.clone() {
            match self.failed_database_instance_or_node(&rehab, state, now) {
                DatabaseHealth::Bad => {
                    if !state.topology.dynamic_nodes_distribution {
                        continue;
                    }
                    if good_members < state.topology.replication_factor {
                        if let Some(node) = self.try_find_fit_node(&rehab, state, now) {
                            state.topology.promotables.push(node.clone());
                            state.topology.demotion_reasons.insert(
                                node.clone(),
                                format!("Maintain the replication factor and create new replica instead of node {}", rehab),
                            );
                            state
                                .topology
                                .promotables_status
                                .insert(node.clone(), DatabasePromotionStatus::WaitingForFirstPromotion);
                            return Some(format!("The rehab node {} was too long in rehabilitation, create node {} to replace it", rehab, node));
                        }
                    }
                    // It was already back online, but the connection was lost again.
                    if state.topology.promotables_status.get(&rehab) != Some(&DatabasePromotionStatus::NotResponding)
                        && self.try_move_to_rehab(&name, &mut state.topology, &current, &rehab)
                    {
                        return Some(format!("Node {} is currently not responding", rehab));
                    }
                }
                DatabaseHealth::Good => {
                    // A promotion of this node was already attempted.
                    if state.record.deletion_in_progress.contains_key(&rehab) && !state.topology.promotables_status.contains_key(&rehab) {
                        continue;
                    }
                    let mentor = match self.try_get_mentor_node(&name, &state.topology, &rehab) {
                        Some(mentor) => mentor,
                        None => continue,
                    };
                    let decision = self.try_promote(state, &mentor, &rehab);
                    if decision.promote {
                        self.log_message(
                            format!("The database {} on {} is reachable and up to date, so we promote it back to member.", name, rehab),
                            Some(name.as_str()),
                        );
                        state.topology.members.push(rehab.clone());
                        state.topology.rehabs.retain(|n| n != &rehab);
                        self.remove_other_nodes_if_needed(state, deletions);
                        state.topology.reorder_members();
                        return Some(format!("Node {} was recovered from rehabilitation and promoted back to member", rehab));
                    }
                    update_reasons.extend(decision.update_reason);
                }
                DatabaseHealth::NotEnoughInfo => (),
            }
        }
        self.remove_other_nodes_if_needed(state, deletions);

        if update_reasons.is_empty() {
            return None;
        }
        Some(update_reasons.iter().map(|reason| format!("{}\n", reason)).collect())
    }

    /// Move a member which lags behind another member to rehab.
    ///
    /// A member is lagging only if both the etag it sent and the change vector distance exceed the
    /// threshold in the current and previous rounds, and both rounds agree on which node lags.
    pub(super) fn check_members_distance(&self, state: &mut DatabaseObservation) -> Option<String> {
        let max_distance = self.config.max_change_vector_distance;
        let members = state.topology.members.clone();
        for (i, member1) in members.iter().enumerate() {
            let (current1, prev1) = match (state.current_database_report(member1), state.previous_database_report(member1)) {
                (Some(current), Some(prev)) => (current, prev),
                _ => continue,
            };
            for (j, member2) in members.iter().enumerate() {
                if i == j {
                    continue;
                }
                let (current2, prev2) = match (state.current_database_report(member2), state.previous_database_report(member2)) {
                    (Some(current), Some(prev)) => (current, prev),
                    _ => continue,
                };
                let (current_sent, prev_sent) = match (current1.last_sent_etag.get(member2), prev1.last_sent_etag.get(member2)) {
                    (Some(current), Some(prev)) => (*current, *prev),
                    _ => continue,
                };
                let current_etag_distance = current1.last_etag - current_sent;
                let prev_etag_distance = prev1.last_etag - prev_sent;
                if current_etag_distance.abs() <= max_distance || prev_etag_distance.abs() <= max_distance {
                    continue;
                }

                // The data may reach a node by another path even when the direct link is broken.
                let current_cv_distance =
                    change_vector::distance(current1.database_change_vector.as_deref(), current2.database_change_vector.as_deref());
                let prev_cv_distance = change_vector::distance(prev1.database_change_vector.as_deref(), prev2.database_change_vector.as_deref());
                if current_cv_distance.abs() <= max_distance || prev_cv_distance.abs() <= max_distance {
                    continue;
                }

                let rehab = if current_cv_distance > 0 { member2 } else { member1 };
                let rehab_check = if prev_cv_distance > 0 { member2 } else { member1 };
                if rehab != rehab_check {
                    continue;
                }

                let rehab = rehab.clone();
                state.topology.members.retain(|n| n != &rehab);
                state.topology.rehabs.push(rehab.clone());
                state.topology.demotion_reasons.insert(
                    rehab.clone(),
                    format!("distance between {} and {} is {}", member1, member2, current_cv_distance),
                );
                return Some(format!(
                    "Node {} for database '{}' moved to rehab, because he is lagging behind. (distance between {} and {} is {})",
                    rehab, state.name, member1, member2, current_cv_distance
                ));
            }
        }
        None
    }

    /// Decide whether `promotable` has caught up with its mentor.
    pub(super) fn try_promote(&mut self, state: &mut DatabaseObservation, mentor: &str, promotable: &str) -> PromoteDecision {
        let name = state.name.clone();
        let (current, previous) = (state.current.clone(), state.previous.clone());
        let lookup = |reports: &crate::cluster::NodeReports, node: &str| {
            reports.get(node).and_then(|node_report| node_report.report.get(&name).map(|db| (node_report.clone(), db.clone())))
        };

        let (mentor_prev_node, mentor_prev_db) = match lookup(&*previous, mentor) {
            Some(found) => found,
            None => {
                self.log_message(format!("Can't find previous mentor {} stats for node {}", mentor, promotable), Some(name.as_str()));
                return PromoteDecision::hold();
            }
        };
        let (_, promotable_prev_db) = match lookup(&*previous, promotable) {
            Some(found) => found,
            None => {
                self.log_message(format!("Can't find previous stats for node {}", promotable), Some(name.as_str()));
                return PromoteDecision::hold();
            }
        };
        let (mentor_node, mentor_db) = match lookup(&*current, mentor) {
            Some(found) => found,
            None => {
                self.log_message(format!("Can't find current mentor {} stats for node {}", mentor, promotable), Some(name.as_str()));
                return PromoteDecision::hold();
            }
        };
        let (promotable_node, promotable_db) = match lookup(&*current, promotable) {
            Some(found) => found,
            None => {
                self.log_message(format!("Can't find current stats for node {}", promotable), Some(name.as_str()));
                return PromoteDecision::hold();
            }
        };

        let server = &promotable_node.server_report;
        let pressure = if server.out_of_cpu_credits {
            Some("it doesn't have enough CPU credits")
        } else if server.early_out_of_memory {
            Some("it's in an early out of memory state")
        } else if server.high_dirty_memory {
            Some("it's in high dirty memory state")
        } else {
            None
        };
        if let Some(pressure) = pressure {
            self.log_message(format!("Can't promote node {}, {}", promotable, pressure), Some(name.as_str()));
            return PromoteDecision::hold();
        }

        if state.topology.members.len() == state.topology.replication_factor {
            self.log_message("Replication factor is reached".into(), Some(name.as_str()));
            return PromoteDecision::hold();
        }

        let mentors_etag = mentor_prev_db.last_etag;
        let last_sent_etag = match mentor_db.last_sent_etag.get(promotable) {
            Some(etag) => *etag,
            None => {
                self.log_message(format!("Can't find last sent etag of mentor {} for {}", mentor, promotable), Some(name.as_str()));
                return PromoteDecision::hold();
            }
        };

        let max_report_gap = utils::to_chrono_duration(self.config.supervisor_sample_period() * 3);
        let time_diff = match (mentor_node.last_successful_update_date_time, mentor_prev_node.last_successful_update_date_time) {
            (Some(curr), Some(prev)) => curr - prev > max_report_gap,
            (Some(_), None) => true,
            _ => false,
        };

        if last_sent_etag < mentors_etag || time_diff {
            let msg = format!(
                "The database '{}' on {} not ready to be promoted, because the mentor hasn't sent all of the documents yet.\nLast sent Etag: {}\nMentor's Etag: {}",
                name, promotable, last_sent_etag, mentors_etag
            );
            self.log_message(
                format!(
                    "Mentor {} hasn't sent all of the documents yet to {} (time diff: {}, sent etag: {}/{})",
                    mentor, promotable, time_diff, last_sent_etag, mentors_etag
                ),
                Some(name.as_str()),
            );
            if state.topology.demotion_reasons.get(promotable) != Some(&msg) {
                state.topology.demotion_reasons.insert(promotable.to_string(), msg.clone());
                state
                    .topology
                    .promotables_status
                    .insert(promotable.to_string(), DatabasePromotionStatus::ChangeVectorNotMerged);
                return PromoteDecision::hold_with(msg);
            }
            return PromoteDecision::hold();
        }

        match check_index_progress(
            promotable_prev_db.last_etag,
            &promotable_prev_db.last_index_stats,
            &promotable_db.last_index_stats,
            &mentor_db.last_index_stats,
        ) {
            Ok(()) => {
                self.log_message(format!("We try to promote the database '{}' on {} to be a full member", name, promotable), Some(name.as_str()));
                state.topology.promotables_status.remove(promotable);
                state.topology.demotion_reasons.remove(promotable);
                PromoteDecision {
                    promote: true,
                    update_reason: Some(format!("Node {} is up-to-date so promoting it to be member", promotable)),
                }
            }
            Err(reason) => {
                self.log_message(
                    format!("The database '{}' on {} is not ready to be promoted, because {}\n", name, promotable, reason),
                    Some(name.as_str()),
                );
                if state.topology.promotables_status.get(promotable) != Some(&DatabasePromotionStatus::IndexNotUpToDate) {
                    let msg = format!("Node {} not ready to be a member, because the indexes are not up-to-date", promotable);
                    state
                        .topology
                        .promotables_status
                        .insert(promotable.to_string(), DatabasePromotionStatus::IndexNotUpToDate);
                    state.topology.demotion_reasons.insert(promotable.to_string(), msg.clone());
                    return PromoteDecision::hold_with(msg);
                }
                PromoteDecision::hold()
            }
        }
    }

    /// Once the replication factor is reached, schedule the deletion of surplus promotables and
    /// rehabs which have a reporting mentor.
    pub(super) fn remove_other_nodes_if_needed(&mut self, state: &DatabaseObservation, deletions: &mut Vec<DeleteDatabaseCommand>) {
        let topology = &state.topology;
        if topology.members.len() < topology.replication_factor {
            return;
        }
        if topology.promotables.is_empty() && topology.rehabs.is_empty() {
            return;
        }

        let mut nodes_to_delete = vec![];
        for node in topology.promotables.iter().chain(topology.rehabs.iter()) {
            let mentor = match self.try_get_mentor_node(&state.name, topology, node) {
                Some(mentor) => mentor,
                None => continue,
            };
            if state.current_database_report(&mentor).is_none() {
                continue;
            }
            if state.record.deletion_in_progress.contains_key(node) {
                continue;
            }
            nodes_to_delete.push(node.clone());
        }
        if nodes_to_delete.is_empty() {
            return;
        }

        self.log_message(
            format!(
                "We reached the replication factor on database '{}', so we try to remove redundant nodes from {}.",
                state.name,
                nodes_to_delete.join(", ")
            ),
            Some(state.name.as_str()),
        );
        deletions.push(DeleteDatabaseCommand {
            database_name: state.name.clone(),
            from_nodes: nodes_to_delete,
            hard_delete: self.config.hard_delete_on_replacement,
            error_on_database_does_not_exists: false,
            update_replication_factor: false,
        });
    }

    /// Find the least loaded healthy cluster node which does not yet host the database.
    pub(super) fn try_find_fit_node(&mut self, bad_node: &str, state: &DatabaseObservation, now: DateTime<Utc>) -> Option<String> {
        // Without a member nobody can mentor the new node.
        if state.topology.members.is_empty() {
            return None;
        }
        let database_nodes = state.topology.all_nodes();
        let mut best: Option<String> = None;
        let mut db_count = usize::MAX;
        for node in state.cluster_topology.all_nodes() {
            if database_nodes.contains(&node) {
                continue;
            }
            if self.failed_database_instance_or_node(&node, state, now) == DatabaseHealth::Bad {
                continue;
            }
            match state.current.get(&node) {
                None => {
                    if best.is_none() {
                        best = Some(node);
                    }
                }
                Some(report) if report.report.len() < db_count => {
                    db_count = report.report.len();
                    best = Some(node);
                }
                Some(_) => (),
            }
        }

        match best {
            Some(node) => {
                self.log_message(
                    format!("The database '{}' on {} has not responded for a long time, so we reassign it to {}.", state.name, bad_node, node),
                    Some(state.name.as_str()),
                );
                Some(node)
            }
            None => {
                self.log_message(
                    format!("The database '{}' on {} has not responded for a long time, but there is no free node to reassign it.", state.name, bad_node),
                    Some(state.name.as_str()),
                );
                None
            }
        }
    }

    fn raise_no_living_nodes_alert(&mut self, msg: &str, database: &str) {
        let alert = crate::notifications::Alert::new(
            Some(database),
            format!("Could not reach any node of '{}' database", database),
            format!("{}. {}", msg, THINGS_TO_CHECK),
            crate::notifications::AlertType::DatabaseTopologyWarning,
            crate::notifications::Severity::Warning,
        );
        self.notifications.add(alert, false);
        self.log_message(msg.to_string(), Some(database));
    }

    fn raise_node_not_found_alert(&mut self, msg: &str, node: &str) {
        let alert = crate::notifications::Alert::new(
            None,
            format!("Node {} not found.", node),
            msg,
            crate::notifications::AlertType::DatabaseTopologyWarning,
            crate::notifications::Severity::Warning,
        )
        .with_id(format!("AlertRaised/NodeNotFound/{}", node));
        self.notifications.add(alert, false);
        self.log_message(msg.to_string(), None);
    }
}

/// Pick the node with the most advanced change vector, breaking conflicts by document count.
///
/// Nodes without a current report of the database are ignored.
pub fn find_most_up_to_date_node(nodes: &[String], state: &DatabaseObservation) -> Option<String> {
    let mut candidates = nodes.iter().filter_map(|node| state.current_database_report(node).map(|report| (node, report)));
    let (first, first_report) = candidates.next()?;
    let mut updated = first.clone();
    let mut highest = first_report.database_change_vector.clone();
    let mut max_docs = first_report.number_of_documents;
    for (node, report) in candidates {
        match change_vector::conflict_status(report.database_change_vector.as_deref(), highest.as_deref()) {
            ConflictStatus::Update => {
                highest = report.database_change_vector.clone();
                updated = node.clone();
            }
            // Between two diverged nodes the one holding more documents wins.
            ConflictStatus::Conflict if report.number_of_documents > max_docs => {
                highest = report.database_change_vector.clone();
                max_docs = report.number_of_documents;
                updated = node.clone();
            }
            _ => (),
        }
    }
    Some(updated)
}

/// Check that every index of the mentor has caught up on the promotable.
///
/// An index counts as caught up when it is not stale, or when it is stale only with data newer
/// than the promotable's etag of the previous round. Returns the reason when an index lags.
pub fn check_index_progress(
    last_prev_etag: i64, previous: &HashMap<String, ObservedIndexStatus>, current: &HashMap<String, ObservedIndexStatus>,
    mentor: &HashMap<String, ObservedIndexStatus>,
) -> std::result::Result<(), String> {
    for (name, mentor_index) in mentor.iter() {
        // Side-by-side definitions are not replicated, so the promotable does not have them.
        if mentor_index.is_side_by_side || mentor_index.state == IndexState::Idle {
            continue;
        }
        let mentor_stats = mentor.get(&format!("{}{}", SIDE_BY_SIDE_INDEX_PREFIX, name)).unwrap_or(mentor_index);

        if !previous.contains_key(name) {
            return Err(format!("Index '{}' is missing", name));
        }
        let current_stats = match current.get(name) {
            Some(stats) => stats,
            None => return Err(format!("Index '{}' is missing", name)),
        };

        if current_stats.state == IndexState::Error {
            if mentor_stats.state == IndexState::Error {
                continue;
            }
            return Err(format!("Index '{}' is in state '{:?}'", name, current_stats.state));
        }
        if !current_stats.is_stale || mentor_stats.last_indexed_etag == FAULTY_INDEX_ETAG || current_stats.state == IndexState::Disabled {
            continue;
        }
        if last_prev_etag > current_stats.last_indexed_etag {
            return Err(format!(
                "Index '{}' is in state '{:?}' and not up-to-date (prev: {}, current: {}).",
                name, current_stats.state, last_prev_etag, current_stats.last_indexed_etag
            ));
        }
    }
    Ok(())
}
