use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::cluster::NodeReports;
use crate::fixtures::{cluster_topology, db_report, node_ok, node_timeout, topology, TestEnv};
use crate::models::report::{IndexState, IndexType, ObservedIndexStatus};
use crate::models::topology::{DatabasePromotionStatus, DatabaseRecord, DatabaseTopology};
use crate::observer::health::DatabaseObservation;
use crate::observer::topology::{check_index_progress, find_most_up_to_date_node};
use crate::observer::ObserverCtl;

fn observe(topology: DatabaseTopology, nodes: &[&str], current: NodeReports, previous: NodeReports) -> Result<DatabaseObservation> {
    let record = DatabaseRecord::new("db", topology);
    DatabaseObservation::new(record, 1, Arc::new(cluster_topology(nodes)), Arc::new(current), Arc::new(previous))
        .context("expected an observation for a record with a topology")
}

fn index(last_indexed_etag: i64, is_stale: bool) -> ObservedIndexStatus {
    ObservedIndexStatus {
        is_stale,
        state: IndexState::Normal,
        index_type: IndexType::Map,
        last_indexed_etag,
        last_queried: None,
        is_side_by_side: false,
        last_indexed_compare_exchange_reference_tombstone_etag: None,
    }
}

/// Reports of members `A` and `B` and promotable `C`, where `A` sent `sent_to_c` to `C`.
fn promotion_reports(sent_to_c: i64, now: DateTime<Utc>) -> NodeReports {
    let mut a = db_report("db", "A", 100, Some("A:100-dbA"));
    a.last_sent_etag.insert("C".into(), sent_to_c);
    let mut reports = NodeReports::new();
    reports.insert("A".into(), node_ok(vec![a], now));
    reports.insert("B".into(), node_ok(vec![db_report("db", "B", 100, Some("A:100-dbA"))], now));
    reports.insert("C".into(), node_ok(vec![db_report("db", "C", sent_to_c, Some("A:100-dbA"))], now));
    reports
}

#[tokio::test]
async fn promotable_waits_for_mentor_then_gets_promoted() -> Result<()> {
    let env = TestEnv::new().await?;
    let mut ctl = ObserverCtl::new_test(&env);
    let now = Utc::now();
    let before = now - ChronoDuration::milliseconds(50);
    let mut topo = topology(&["A", "B"], &["C"], &[], 3);
    topo.predefined_mentors.insert("C".into(), "A".into());

    // The mentor has not sent everything yet.
    let mut state = observe(topo.clone(), &["A", "B", "C"], promotion_reports(50, now), promotion_reports(50, before))?;
    let mut deletions = vec![];
    let reason = ctl.update_database_topology(&mut state, &mut deletions, now).unwrap_or_default();
    assert!(reason.contains("hasn't sent all of the documents"), "expected a lagging mentor reason, got {:?}", reason);
    let status = state.topology.promotables_status.get("C");
    assert!(
        status == Some(&DatabasePromotionStatus::ChangeVectorNotMerged),
        "expected C to be ChangeVectorNotMerged, got {:?}",
        status
    );
    assert!(state.topology.promotables == vec!["C"], "expected C to remain a promotable, got {:?}", state.topology.promotables);

    // The same observation again does not produce another update.
    let mut again = observe(state.topology.clone(), &["A", "B", "C"], promotion_reports(50, now), promotion_reports(50, before))?;
    let reason = ctl.update_database_topology(&mut again, &mut deletions, now);
    assert!(reason.is_none(), "expected no further update while still lagging, got {:?}", reason);

    // Once caught up, C is promoted.
    let mut state = observe(state.topology, &["A", "B", "C"], promotion_reports(100, now), promotion_reports(100, before))?;
    let reason = ctl.update_database_topology(&mut state, &mut deletions, now).unwrap_or_default();
    assert!(reason == "Promoting node C to member", "expected promotion of C, got {:?}", reason);
    assert!(state.topology.members.contains(&"C".to_string()), "expected C to be a member, got {:?}", state.topology.members);
    assert!(state.topology.promotables.is_empty(), "expected no promotables, got {:?}", state.topology.promotables);
    assert!(!state.topology.promotables_status.contains_key("C"), "expected the promotion status of C to be cleared");
    assert!(deletions.is_empty(), "expected no deletions, got {:?}", deletions);
    Ok(())
}

#[tokio::test]
async fn promotion_blocked_by_resource_pressure() -> Result<()> {
    let env = TestEnv::new().await?;
    let mut ctl = ObserverCtl::new_test(&env);
    let now = Utc::now();
    let before = now - ChronoDuration::milliseconds(50);
    let mut topo = topology(&["A", "B"], &["C"], &[], 3);
    topo.predefined_mentors.insert("C".into(), "A".into());

    let mut current = promotion_reports(100, now);
    let mut stressed = current.get("C").map(|r| (**r).clone()).context("expected a report of C")?;
    stressed.server_report.out_of_cpu_credits = true;
    current.insert("C".into(), Arc::new(stressed));
    let mut state = observe(topo, &["A", "B", "C"], current, promotion_reports(100, before))?;

    let reason = ctl.update_database_topology(&mut state, &mut vec![], now);
    assert!(reason.is_none(), "expected no topology change, got {:?}", reason);
    assert!(state.topology.promotables == vec!["C"], "expected C to remain a promotable, got {:?}", state.topology.promotables);
    let logged = ctl.decisions().iter().any(|e| e.message.contains("doesn't have enough CPU credits"));
    assert!(logged, "expected the CPU credits decision to be logged");
    Ok(())
}

#[tokio::test]
async fn unresponsive_member_moves_to_rehab_once() -> Result<()> {
    let env = TestEnv::new().await?;
    let mut ctl = ObserverCtl::new_test(&env);
    let now = Utc::now();

    let reports = |now: DateTime<Utc>| {
        let mut reports = NodeReports::new();
        reports.insert("A".into(), node_ok(vec![db_report("db", "A", 10, None)], now));
        reports.insert("B".into(), node_ok(vec![db_report("db", "B", 10, None)], now));
        reports.insert("C".into(), node_timeout(Some(now - ChronoDuration::minutes(20)), now));
        reports
    };

    let mut state = observe(topology(&["A", "B", "C"], &[], &[], 3), &["A", "B", "C"], reports(now), reports(now))?;
    let reason = ctl.update_database_topology(&mut state, &mut vec![], now).unwrap_or_default();
    assert!(reason.contains("Node C is currently not responding"), "expected C to be demoted, got {:?}", reason);
    assert!(state.topology.rehabs == vec!["C"], "expected C in rehab, got {:?}", state.topology.rehabs);
    assert!(state.topology.members == vec!["A", "B"], "expected A and B to stay members, got {:?}", state.topology.members);
    let status = state.topology.promotables_status.get("C");
    assert!(status == Some(&DatabasePromotionStatus::NotResponding), "expected C NotResponding, got {:?}", status);

    let mut state = observe(state.topology, &["A", "B", "C"], reports(now), reports(now))?;
    let reason = ctl.update_database_topology(&mut state, &mut vec![], now);
    assert!(reason.is_none(), "expected no second change for C, got {:?}", reason);
    assert!(state.topology.rehabs == vec!["C"], "expected C to stay in rehab once, got {:?}", state.topology.rehabs);
    Ok(())
}

#[tokio::test]
async fn static_distribution_flags_member_instead_of_rehab() -> Result<()> {
    let env = TestEnv::new().await?;
    let mut ctl = ObserverCtl::new_test(&env);
    let now = Utc::now();
    let mut reports = NodeReports::new();
    reports.insert("A".into(), node_ok(vec![db_report("db", "A", 10, None)], now));
    reports.insert("B".into(), node_timeout(Some(now - ChronoDuration::minutes(20)), now));
    let mut topo = topology(&["A", "B"], &[], &[], 2);
    topo.dynamic_nodes_distribution = false;

    let mut state = observe(topo, &["A", "B"], reports.clone(), reports)?;
    let reason = ctl.update_database_topology(&mut state, &mut vec![], now).unwrap_or_default();
    assert!(reason.contains("Node B is currently not responding with the status"), "expected B to be flagged, got {:?}", reason);
    assert!(state.topology.members == vec!["A", "B"], "expected B to remain a member, got {:?}", state.topology.members);
    let status = state.topology.promotables_status.get("B");
    assert!(status == Some(&DatabasePromotionStatus::NotResponding), "expected B NotResponding, got {:?}", status);
    Ok(())
}

#[tokio::test]
async fn missing_member_raises_node_not_found_alert() -> Result<()> {
    let env = TestEnv::new().await?;
    let mut ctl = ObserverCtl::new_test(&env);
    let now = Utc::now();
    let mut reports = NodeReports::new();
    reports.insert("A".into(), node_ok(vec![db_report("db", "A", 10, None)], now));

    let mut state = observe(topology(&["A", "B"], &[], &[], 2), &["A", "B"], reports.clone(), reports)?;
    let reason = ctl.update_database_topology(&mut state, &mut vec![], now);
    assert!(reason.is_none(), "expected no topology change, got {:?}", reason);
    let alerts = env.notifications.alerts();
    assert!(alerts.iter().any(|a| a.title == "Node B not found."), "expected a node not found alert, got {:?}", alerts);
    Ok(())
}

#[tokio::test]
async fn no_living_members_promotes_most_up_to_date_rehab() -> Result<()> {
    let env = TestEnv::new().await?;
    let mut ctl = ObserverCtl::new_test(&env);
    let now = Utc::now();
    let mut reports = NodeReports::new();
    reports.insert("B".into(), node_ok(vec![db_report("db", "B", 10, Some("A:10-dbA"))], now));
    reports.insert("C".into(), node_ok(vec![db_report("db", "C", 20, Some("A:20-dbA"))], now));

    let mut state = observe(topology(&[], &[], &["B", "C"], 2), &["B", "C"], reports.clone(), reports)?;
    let reason = ctl.update_database_topology(&mut state, &mut vec![], now).unwrap_or_default();
    assert!(reason.contains("promoting C"), "expected C to be promoted, got {:?}", reason);
    assert!(state.topology.members == vec!["C"], "expected C as the only member, got {:?}", state.topology.members);
    let alerts = env.notifications.alerts();
    assert!(
        alerts.iter().any(|a| a.title == "Could not reach any node of 'db' database"),
        "expected an unreachable database alert, got {:?}",
        alerts
    );
    Ok(())
}

#[tokio::test]
async fn lagging_member_moves_to_rehab() -> Result<()> {
    let env = TestEnv::new().await?;
    let mut ctl = ObserverCtl::new_test(&env);
    let now = Utc::now();
    let reports = |now: DateTime<Utc>| {
        let mut a = db_report("db", "A", 200_000, Some("A:200000-dbA"));
        a.last_sent_etag.insert("B".into(), 10);
        let mut reports = NodeReports::new();
        reports.insert("A".into(), node_ok(vec![a], now));
        reports.insert("B".into(), node_ok(vec![db_report("db", "B", 10, Some("A:10-dbA"))], now));
        reports
    };

    let mut state = observe(topology(&["A", "B"], &[], &[], 2), &["A", "B"], reports(now), reports(now))?;
    let reason = ctl.update_database_topology(&mut state, &mut vec![], now).unwrap_or_default();
    assert!(reason.contains("Node B for database 'db' moved to rehab"), "expected B to be demoted, got {:?}", reason);
    assert!(state.topology.rehabs == vec!["B"], "expected B in rehab, got {:?}", state.topology.rehabs);
    Ok(())
}

#[test]
fn most_up_to_date_node_prefers_newer_change_vector() -> Result<()> {
    let now = Utc::now();
    let mut reports = NodeReports::new();
    let mut b = db_report("db", "B", 10, Some("A:10-dbA, B:5-dbB"));
    b.number_of_documents = 10;
    let mut c = db_report("db", "C", 10, Some("A:5-dbA, B:10-dbB"));
    c.number_of_documents = 50;
    reports.insert("B".into(), node_ok(vec![b], now));
    reports.insert("C".into(), node_ok(vec![c], now));
    reports.insert("D".into(), node_ok(vec![db_report("db", "D", 1, Some("A:1-dbA"))], now));
    let state = observe(topology(&[], &[], &["B", "C", "D"], 3), &["B", "C", "D"], reports, NodeReports::new())?;

    let nodes = vec!["D".to_string(), "B".to_string(), "C".to_string(), "E".to_string()];
    let node = find_most_up_to_date_node(&nodes, &state);
    assert!(node.as_deref() == Some("C"), "expected C to win the conflict by document count, got {:?}", node);
    Ok(())
}

#[test]
fn index_progress_gates_promotion() {
    let mut mentor: HashMap<String, ObservedIndexStatus> = HashMap::new();
    mentor.insert("Orders".into(), index(100, false));
    let mut side_by_side = index(100, true);
    side_by_side.is_side_by_side = true;
    mentor.insert("ReplacementOf/Users".into(), side_by_side);

    let empty = HashMap::new();
    let res = check_index_progress(50, &empty, &empty, &mentor);
    assert!(res == Err("Index 'Orders' is missing".to_string()), "expected a missing index, got {:?}", res);

    let mut behind = HashMap::new();
    behind.insert("Orders".to_string(), index(40, true));
    let res = check_index_progress(50, &behind, &behind, &mentor);
    assert!(
        matches!(&res, Err(reason) if reason.contains("not up-to-date (prev: 50, current: 40)")),
        "expected a stale index, got {:?}",
        res
    );

    let mut caught_up = HashMap::new();
    caught_up.insert("Orders".to_string(), index(60, true));
    let res = check_index_progress(50, &caught_up, &caught_up, &mentor);
    assert!(res.is_ok(), "expected a stale index past the previous etag to pass, got {:?}", res);

    let mut errored = HashMap::new();
    let mut status = index(100, false);
    status.state = IndexState::Error;
    errored.insert("Orders".to_string(), status);
    let res = check_index_progress(50, &errored, &errored, &mentor);
    assert!(res == Err("Index 'Orders' is in state 'Error'".to_string()), "expected an errored index, got {:?}", res);
}
