//! The latest health reports gathered from every node of the cluster.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::models::report::ClusterNodeStatusReport;

/// A point in time view of the reports of every node, keyed by node tag.
pub type NodeReports = HashMap<String, Arc<ClusterNodeStatusReport>>;

/// The shared store of node reports.
///
/// Reporters swap in fresh reports while the observer takes cheap snapshots of the full map.
#[derive(Clone, Default)]
pub struct MaintenanceStats {
    inner: Arc<ArcSwap<NodeReports>>,
}

impl MaintenanceStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// A snapshot of the latest report of every node.
    pub fn get_stats(&self) -> Arc<NodeReports> {
        self.inner.load_full()
    }

    /// Record a node's latest report.
    pub fn update_node(&self, node: &str, report: ClusterNodeStatusReport) {
        self.inner.rcu(|current| {
            let mut updated = NodeReports::clone(current);
            updated.insert(node.to_string(), Arc::new(report.clone()));
            updated
        });
    }

    /// Replace every report at once.
    pub fn replace(&self, reports: NodeReports) {
        self.inner.store(Arc::new(reports));
    }
}
