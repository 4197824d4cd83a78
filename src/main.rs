// raft-core standalone node
//
// Starts a single cluster member: loads configuration, opens disk storage,
// spawns the worker, and blocks until interrupted. Stands in for the host
// database process for manual multi-process testing.

use raft_core::config::Config;
use raft_core::storage::disk::DiskStorage;
use raft_core::worker::Worker;
use raft_core::{RaftControl, Result};
use std::path::PathBuf;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    print_banner();

    let install_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let config_file = install_dir.join("raft-core.toml");

    let config = if config_file.exists() {
        tracing::info!(path = %config_file.display(), "loading configuration");
        Config::from_toml_file(&config_file)?
    } else {
        tracing::info!("no raft-core.toml found, using environment and defaults");
        Config::from_env_and_defaults()?
    };

    std::fs::create_dir_all(&config.data_dir)?;

    tracing::info!(
        node_id = config.node_id,
        cluster = %config.cluster_name,
        bind = %config.bind_addr,
        peers = config.peers.len(),
        "starting raft-core node"
    );

    let storage = Arc::new(DiskStorage::open(&config.data_dir)?);
    let (handle, _shutdown_tx) = Worker::spawn(config, storage).await?;
    let control = RaftControl::new(handle);
    control.init()?;

    tracing::info!("node running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutdown signal received");

    Ok(())
}

fn print_banner() {
    println!(
        r#"
  ____        __ _        ____
 |  _ \ __ _ / _| |_     / ___|___  _ __ ___
 | |_) / _` | |_| __|   | |   / _ \| '__/ _ \
 |  _ < (_| |  _| |_    | |__| (_) | | |  __/
 |_| \_\__,_|_|  \__|    \____\___/|_|  \___|

 embeddable consensus engine v{}
"#,
        env!("CARGO_PKG_VERSION")
    );
}
