//! The Warden cluster maintenance node.

mod app;
mod backup;
mod change_vector;
#[cfg(test)]
mod change_vector_test;
mod cluster;
mod config;
mod database;
mod error;
#[cfg(test)]
mod fixtures;
mod instance;
mod landlord;
mod models;
mod notifications;
mod observer;
mod storage;
mod utils;
#[cfg(test)]
mod utils_test;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::prelude::*;

use crate::app::App;
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(true)
        )
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let cfg = Arc::new(Config::new()?);
    tracing::info!(
        node_tag = %cfg.node_tag,
        storage_data_path = %cfg.storage_data_path,
        backup_temp_path = %cfg.backup_temp_path,
        bootstrap_single_node = cfg.bootstrap_single_node,
        "starting Warden node",
    );
    match App::new(cfg).await?.spawn().await {
        Ok(Err(err)) => tracing::error!(error = ?err),
        Err(err) => tracing::error!(error = ?err, "error joining application task"),
        Ok(Ok(())) => (),
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    Ok(())
}
