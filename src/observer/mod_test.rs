use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::broadcast;

use crate::cluster::NodeReports;
use crate::fixtures::{db_report, node_ok, node_timeout, topology, TestEnv};
use crate::models::commands::{ClusterCommand, PutCompareExchangeCommand};
use crate::models::report::{IndexState, IndexType, ObservedIndexStatus};
use crate::models::topology::{AutoIndexDefinition, DatabasePromotionStatus, DatabaseRecord};
use crate::observer::{ObserverCtl, ObserverSupervisor};

fn three_node_reports(now: chrono::DateTime<Utc>) -> NodeReports {
    let mut reports = NodeReports::new();
    reports.insert("A".into(), node_ok(vec![db_report("db", "A", 10, None)], now));
    reports.insert("B".into(), node_ok(vec![db_report("db", "B", 10, None)], now));
    reports.insert("C".into(), node_timeout(Some(now - ChronoDuration::minutes(20)), now));
    reports
}

#[tokio::test]
async fn analyze_moves_unresponsive_node_to_rehab_and_alerts() -> Result<()> {
    let env = TestEnv::new().await?;
    env.setup_database(DatabaseRecord::new("db", topology(&["A", "B", "C"], &[], &[], 3)), &["A", "B", "C"])
        .await?;
    let mut ctl = ObserverCtl::new_test(&env);
    let now = Utc::now();
    let reports = std::sync::Arc::new(three_node_reports(now));

    ctl.analyze_latest_stats(reports.clone(), reports.clone(), now).await?;

    let (record, _) = env.cluster.read_database_record("db")?.context("expected the database record")?;
    let topo = record.topology.context("expected a topology")?;
    assert!(topo.rehabs == vec!["C"], "expected C in rehab, got {:?}", topo.rehabs);
    let status = topo.promotables_status.get("C");
    assert!(status == Some(&DatabasePromotionStatus::NotResponding), "expected C NotResponding, got {:?}", status);

    let alerts = env.notifications.alerts_for("db");
    let changed: Vec<_> = alerts.iter().filter(|a| a.title == "Topology of database 'db' was changed").collect();
    assert!(changed.len() == 1, "expected one topology change alert, got {:?}", alerts);
    assert!(changed[0].message.contains("not responding"), "expected the reason in the alert, got {}", changed[0].message);
    let logged = ctl.decisions().iter().any(|e| e.message.contains("Node C is currently not responding"));
    assert!(logged, "expected the decision to be logged");

    // A second round over the same reports leaves the topology alone.
    let later = now + ChronoDuration::milliseconds(50);
    ctl.analyze_latest_stats(reports.clone(), reports, later).await?;
    let alerts = env.notifications.alerts_for("db");
    let count = alerts.iter().filter(|a| a.title == "Topology of database 'db' was changed").count();
    assert!(count == 1, "expected no duplicate topology change, got {} alerts", count);
    Ok(())
}

#[tokio::test]
async fn analyze_stamps_legacy_topology() -> Result<()> {
    let env = TestEnv::new().await?;
    let mut topo = topology(&["A"], &[], &[], 1);
    topo.nodes_modified_at = None;
    env.setup_database(DatabaseRecord::new("db", topo), &["A"]).await?;
    let mut ctl = ObserverCtl::new_test(&env);
    let now = Utc::now();
    let reports = std::sync::Arc::new(NodeReports::new());

    ctl.analyze_latest_stats(reports.clone(), reports, now).await?;

    let (record, _) = env.cluster.read_database_record("db")?.context("expected the database record")?;
    let modified_at = record.topology.and_then(|t| t.nodes_modified_at);
    assert!(modified_at == Some(now), "expected the topology to be stamped at {}, got {:?}", now, modified_at);
    let logged = ctl.decisions().iter().any(|e| e.message == "Updating ModifiedAt");
    assert!(logged, "expected the stamping to be logged");
    Ok(())
}

#[tokio::test]
async fn index_cleanup_conflicts_do_not_block_topology_updates() -> Result<()> {
    let env = TestEnv::new().await?;
    env.setup_database(DatabaseRecord::new("db", topology(&["A", "B", "C"], &[], &[], 3)), &["A", "B", "C"])
        .await?;
    let mut record = DatabaseRecord::new("idx", topology(&["A"], &[], &[], 1));
    let unused = ["Auto/Users/ByName", "Auto/Orders/ByDate"];
    for name in unused {
        record.auto_indexes.insert(
            name.into(),
            AutoIndexDefinition {
                name: name.into(),
                collections: vec![],
                state: None,
            },
        );
    }
    env.setup_database(record, &["A", "B", "C"]).await?;
    let mut ctl = ObserverCtl::new_test(&env);
    let now = Utc::now();
    let mut idx = db_report("idx", "A", 10, None);
    for name in unused {
        idx.last_index_stats.insert(
            name.into(),
            ObservedIndexStatus {
                is_stale: false,
                state: IndexState::Normal,
                index_type: IndexType::Map,
                last_indexed_etag: 10,
                last_queried: Some(Duration::from_secs(40 * 60)),
                is_side_by_side: false,
                last_indexed_compare_exchange_reference_tombstone_etag: None,
            },
        );
    }
    let mut reports = three_node_reports(now);
    reports.insert("A".into(), node_ok(vec![db_report("db", "A", 10, None), idx], now));
    let reports = std::sync::Arc::new(reports);

    // Both index changes are computed from the same record etag, so the second one is stale.
    ctl.analyze_latest_stats(reports.clone(), reports.clone(), now).await?;

    let (record, _) = env.cluster.read_database_record("db")?.context("expected the database record")?;
    let rehabs = record.topology.map(|t| t.rehabs).unwrap_or_default();
    assert!(rehabs == vec!["C"], "expected the topology update to commit, got rehabs {:?}", rehabs);
    let idle_count = |env: &TestEnv| -> Result<usize> {
        let (record, _) = env.cluster.read_database_record("idx")?.context("expected the idx record")?;
        Ok(record.auto_indexes.values().filter(|def| def.state == Some(IndexState::Idle)).count())
    };
    let idle = idle_count(&env)?;
    assert!(idle == 1, "expected exactly one index to be marked idle, got {}", idle);
    let logged = ctl
        .decisions()
        .iter()
        .any(|e| e.database.as_deref() == Some("idx") && e.message.contains("was not applied, reason: ConcurrencyException"));
    assert!(logged, "expected the conflict to be logged, got {:?}", ctl.decisions());

    // The conflicting change is retried on the next iteration.
    ctl.analyze_latest_stats(reports.clone(), reports, now + ChronoDuration::milliseconds(50)).await?;
    let idle = idle_count(&env)?;
    assert!(idle == 2, "expected both indexes to be idle after the retry, got {}", idle);
    Ok(())
}

#[tokio::test]
async fn analyze_skips_disabled_databases() -> Result<()> {
    let env = TestEnv::new().await?;
    let mut record = DatabaseRecord::new("db", topology(&["A", "B", "C"], &[], &[], 3));
    record.disabled = true;
    env.setup_database(record, &["A", "B", "C"]).await?;
    let mut ctl = ObserverCtl::new_test(&env);
    let now = Utc::now();
    let reports = std::sync::Arc::new(three_node_reports(now));

    ctl.analyze_latest_stats(reports.clone(), reports, now).await?;

    let (record, _) = env.cluster.read_database_record("db")?.context("expected the database record")?;
    let rehabs = record.topology.map(|t| t.rehabs).unwrap_or_default();
    assert!(rehabs.is_empty(), "expected a disabled database to be left alone, got rehabs {:?}", rehabs);
    Ok(())
}

#[tokio::test]
async fn analyze_cleans_up_completed_cluster_transactions_once() -> Result<()> {
    let env = TestEnv::new().await?;
    env.setup_database(DatabaseRecord::new("db", topology(&["A", "B"], &[], &[], 2)), &["A", "B"])
        .await?;
    let mut ctl = ObserverCtl::new_test(&env);
    let now = Utc::now();
    let mut reports = NodeReports::new();
    for (node, completed) in [("A", 7), ("B", 5)] {
        let mut report = db_report("db", node, 10, None);
        report.last_completed_cluster_transaction = completed;
        reports.insert(node.into(), node_ok(vec![report], now));
    }
    let reports = std::sync::Arc::new(reports);

    ctl.analyze_latest_stats(reports.clone(), reports.clone(), now).await?;
    let (record, _) = env.cluster.read_database_record("db")?.context("expected the database record")?;
    assert!(
        record.truncated_cluster_transaction_commands_count == 5,
        "expected truncation up to 5, got {}",
        record.truncated_cluster_transaction_commands_count
    );

    let index = env.cluster.last_index();
    ctl.analyze_latest_stats(reports.clone(), reports, now).await?;
    assert!(env.cluster.last_index() == index, "expected no further cleanup command, index moved from {} to {}", index, env.cluster.last_index());
    Ok(())
}

#[tokio::test]
async fn analyze_removes_expired_compare_exchange_values() -> Result<()> {
    let env = TestEnv::new().await?;
    env.setup_database(DatabaseRecord::new("db", topology(&["A"], &[], &[], 1)), &["A"]).await?;
    let now = Utc::now();
    env.put(ClusterCommand::PutCompareExchange(PutCompareExchangeCommand {
        database_name: "db".into(),
        key: "locks/1".into(),
        value: serde_json::json!({"owner": "A"}),
        expires: Some(now - ChronoDuration::seconds(1)),
    }))
    .await?;
    env.put(ClusterCommand::PutCompareExchange(PutCompareExchangeCommand {
        database_name: "db".into(),
        key: "locks/2".into(),
        value: serde_json::json!({"owner": "A"}),
        expires: None,
    }))
    .await?;
    let mut ctl = ObserverCtl::new_test(&env);
    let mut reports = NodeReports::new();
    reports.insert("A".into(), node_ok(vec![db_report("db", "A", 10, None)], now));
    let reports = std::sync::Arc::new(reports);

    ctl.analyze_latest_stats(reports.clone(), reports, now).await?;

    let expired = env.cluster.read_compare_exchange("db", "locks/1")?;
    assert!(expired.is_none(), "expected the expired value to be removed, got {:?}", expired);
    let kept = env.cluster.read_compare_exchange("db", "locks/2")?;
    assert!(kept.is_some(), "expected the value without expiry to be kept");
    Ok(())
}

#[tokio::test]
async fn analyze_is_noop_on_follower() -> Result<()> {
    let env = TestEnv::new().await?;
    env.setup_database(DatabaseRecord::new("db", topology(&["A", "B", "C"], &[], &[], 3)), &["A", "B", "C"])
        .await?;
    let mut ctl = ObserverCtl::new_test(&env);
    env.cluster.become_follower(2, "B");
    let now = Utc::now();
    let reports = std::sync::Arc::new(three_node_reports(now));

    ctl.analyze_latest_stats(reports.clone(), reports, now).await?;

    assert!(env.notifications.alerts().is_empty(), "expected no alerts from a follower");
    Ok(())
}

#[tokio::test]
async fn supervisor_runs_observer_while_leading_and_honors_suspend() -> Result<()> {
    let env = TestEnv::new().await?;
    let (shutdown_tx, _) = broadcast::channel(1);
    let mut reports = NodeReports::new();
    reports.insert("A".into(), node_ok(vec![], Utc::now()));
    env.stats.replace(reports);
    let (supervisor, handle) = ObserverSupervisor::new(
        env.config.clone(),
        env.cluster.clone(),
        env.stats.clone(),
        env.notifications.clone(),
        shutdown_tx.clone(),
    );
    let supervisor = supervisor.spawn();

    tokio::time::sleep(Duration::from_millis(400)).await;
    let (_, iterations) = handle.read_decisions();
    assert!(iterations > 0, "expected the observer to have run, got {} iterations", iterations);

    handle.suspend();
    tokio::time::sleep(Duration::from_millis(150)).await;
    let (_, suspended_at) = handle.read_decisions();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let (_, still) = handle.read_decisions();
    assert!(suspended_at == still, "expected no iterations while suspended, got {} then {}", suspended_at, still);

    handle.resume();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let (_, resumed) = handle.read_decisions();
    assert!(resumed > still, "expected iterations to resume, got {} then {}", still, resumed);

    let _ = shutdown_tx.send(());
    supervisor.await??;
    Ok(())
}
