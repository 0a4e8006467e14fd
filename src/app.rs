use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::backup::{DirectoryUploader, UploaderRegistry};
use crate::cluster::{Cluster, MaintenanceStats};
use crate::config::Config;
use crate::database::Database;
use crate::landlord::Landlord;
use crate::models::backup::DestinationKind;
use crate::models::commands::{new_command_id, ClusterCommand};
use crate::notifications::NotificationCenter;
use crate::observer::{ObserverHandle, ObserverSupervisor};

/// The application object for when Warden is running as a server.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,
    /// The application's database system.
    _db: Database,
    /// A handle to the cluster observer's decision log.
    _observer: ObserverHandle,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the landlord.
    landlord_handle: JoinHandle<Result<()>>,
    /// The join handle of the observer supervisor.
    observer_handle: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);

        // Initialize this node's storage & cluster state.
        let db = Database::new(config.clone()).await.context("error opening database")?;
        let cluster = Cluster::new(&db, config.node_tag.clone()).await.context("error opening cluster state")?;
        if config.bootstrap_single_node {
            bootstrap_single_node(&cluster).await.context("error bootstrapping single node cluster")?;
        }

        let stats = MaintenanceStats::new();
        let notifications = NotificationCenter::new();
        let uploaders = Arc::new(build_uploaders(config.upload_mount_path.as_deref()));

        // Spawn various core tasks.
        let landlord_handle = Landlord::new(
            config.clone(),
            db.clone(),
            cluster.clone(),
            stats.clone(),
            notifications.clone(),
            uploaders,
            shutdown_tx.clone(),
        )
        .spawn();
        let (supervisor, observer) = ObserverSupervisor::new(config.clone(), cluster, stats, notifications, shutdown_tx.clone());
        let observer_handle = supervisor.spawn();

        Ok(Self {
            _config: config,
            _db: db,
            _observer: observer,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            landlord_handle,
            observer_handle,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("Warden is shutting down");
        if let Err(err) = self.observer_handle.await.context("error joining observer supervisor handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down observer supervisor");
        }
        if let Err(err) = self.landlord_handle.await.context("error joining landlord handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down landlord");
        }

        tracing::debug!("Warden shutdown complete");
        Ok(())
    }
}

/// Make this node the leader of a cluster of its own, registering it in the cluster topology.
async fn bootstrap_single_node(cluster: &Cluster) -> Result<()> {
    cluster.become_leader(cluster.current_term() + 1);
    let mut topology = cluster.read_cluster_topology()?;
    if topology.contains(cluster.node_tag()) {
        return Ok(());
    }
    let node = cluster.node_tag().to_string();
    topology.members.insert(node.clone(), format!("local://{}", node));
    cluster.put(new_command_id(), ClusterCommand::PutClusterTopology(topology)).await?;
    tracing::info!(node = %node, "bootstrapped single node cluster");
    Ok(())
}

/// Register a directory uploader for every remote destination kind under the given mount.
fn build_uploaders(mount: Option<&str>) -> UploaderRegistry {
    let mut registry = UploaderRegistry::new();
    let mount = match mount {
        Some(mount) => Path::new(mount),
        None => return registry,
    };
    for kind in [DestinationKind::S3, DestinationKind::Glacier, DestinationKind::Azure, DestinationKind::GoogleCloud, DestinationKind::Ftp] {
        let root = mount.join(format!("{:?}", kind).to_lowercase());
        registry.register(Arc::new(DirectoryUploader::new(kind, root)));
    }
    registry
}
