//! Database management.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use sled::{Config as SledConfig, Db, IVec};

use crate::config::Config;
use crate::error::{ShutdownError, ShutdownResult};

pub type Tree = sled::Tree;

/// The default path to use for data storage.
pub const DEFAULT_DATA_PATH: &str = "/usr/local/warden/db";
/// The DB tree used for the replicated cluster state.
const TREE_CLUSTER: &str = "cluster";
/// The DB tree prefix used for per-database document storage.
const TREE_DOCUMENTS_PREFIX: &str = "documents";

/// The default path to use for data storage.
pub fn default_data_path() -> String {
    DEFAULT_DATA_PATH.to_string()
}

/// An abstraction over the Warden database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    /// The underlying DB handle.
    db: Db,
}

impl Database {
    /// Open the database for usage.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        // Determine the database path, and ensure it exists.
        let dbpath = PathBuf::from(&config.storage_data_path).join(config.node_tag.as_str());
        tokio::fs::create_dir_all(&dbpath)
            .await
            .context("error creating dir for warden database")?;

        Self::spawn_blocking(move || -> Result<Self> {
            let db = SledConfig::new().path(dbpath).mode(sled::Mode::HighThroughput).open()?;
            let inner = Arc::new(DatabaseInner { db });
            Ok(Self { inner })
        })
        .await?
    }

    /// Spawn a blocking database-related function, returning a ShutdownError if anything goes
    /// wrong related to spawning & joining.
    #[tracing::instrument(level = "trace", skip(f), err)]
    pub async fn spawn_blocking<F, R>(f: F) -> ShutdownResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|err| ShutdownError::from(anyhow::Error::from(err)))
    }

    /// Get a handle to the DB tree holding the replicated cluster state.
    pub async fn get_cluster_tree(&self) -> ShutdownResult<Tree> {
        self.open_tree(TREE_CLUSTER.to_string()).await
    }

    /// Get a handle to the DB tree holding the documents of the given database.
    pub async fn get_documents_tree(&self, database: &str) -> ShutdownResult<Tree> {
        self.open_tree(format!("{}/{}", TREE_DOCUMENTS_PREFIX, database)).await
    }

    /// Drop the DB tree holding the documents of the given database.
    pub async fn drop_documents_tree(&self, database: &str) -> ShutdownResult<bool> {
        let name = format!("{}/{}", TREE_DOCUMENTS_PREFIX, database);
        let (db, ivname) = (self.inner.db.clone(), IVec::from(name.as_str()));
        Self::spawn_blocking(move || -> Result<bool> { Ok(db.drop_tree(ivname)?) })
            .await
            .and_then(|res| res.map_err(|err| ShutdownError(anyhow!("could not drop DB tree {} {}", &name, err))))
    }

    async fn open_tree(&self, name: String) -> ShutdownResult<Tree> {
        let (db, ivname) = (self.inner.db.clone(), IVec::from(name.as_str()));
        let tree = Self::spawn_blocking(move || -> Result<Tree> { Ok(db.open_tree(ivname)?) })
            .await
            .and_then(|res| res.map_err(|err| ShutdownError(anyhow!("could not open DB tree {} {}", &name, err))))?;
        Ok(tree)
    }
}
