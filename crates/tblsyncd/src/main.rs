//! tblsyncd: host table sync daemon.
//!
//! Replicates a versioned host table between peers over UDP gossip and
//! mirrors its table membership into pf.

use anyhow::{Context, Result};

use tblsync_core::config::TblSyncConfig;
use tblsync_services::{Controller, FirewallExporter, TableError, VersionedTable};

mod os;
mod sync;

use sync::SyncDriver;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = TblSyncConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = TblSyncConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        TblSyncConfig::default()
    });
    tracing::info!(
        port = config.network.port,
        peers = ?config.network.peers,
        firewall = config.firewall.enabled,
        "tblsyncd starting"
    );

    // Host table
    let db_path = config.storage.db_path.clone();
    let table = match VersionedTable::open(&db_path) {
        Ok(table) => {
            tracing::info!(path = %db_path.display(), entries = table.len(), db_version = table.db_version(), "host table loaded");
            table
        }
        Err(TableError::ReadFailed(_, e)) if e.kind() == std::io::ErrorKind::NotFound => {
            let table = VersionedTable::with_path(&db_path);
            table.commit().context("failed to create host table")?;
            tracing::info!(path = %db_path.display(), "created empty host table");
            table
        }
        Err(e) => {
            return Err(e).with_context(|| format!("failed to load host table {}", db_path.display()))
        }
    };

    // Controller
    let peers = config.network.peer_spec();
    let dynamic = peers.is_dynamic();
    let mut controller = Controller::bind(config.network.port, peers, &config.timers)?;
    if dynamic {
        controller = controller.with_discovery(Box::new(os::OspfNeighbors::default()));
    }

    // ── Shutdown ─────────────────────────────────────────────────────────────
    {
        let stop = controller.stop_handle();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            stop.stop();
        });
    }

    let firewall = FirewallExporter::new(config.firewall.enabled).with_debug(config.firewall.debug);
    let mut driver = SyncDriver::new(
        table,
        Box::new(os::ArpNdpNeighbors::default()),
        firewall,
        Box::new(os::PfctlSink::new(config.firewall.pfctl.clone())),
    );

    controller.run(&mut driver).await?;

    driver
        .persist()
        .context("failed to commit host table on shutdown")?;
    tracing::info!(entries = driver.table().len(), "tblsyncd stopped");
    Ok(())
}
