//! tblsync integration test harness.
//!
//! Tests in this crate run controllers over real UDP sockets on loopback.
//! Every socket binds port 0, so tests can run in parallel:
//!
//!   cargo test --test integration
//!
//! Every wait is wrapped in a timeout so a lost datagram fails the test
//! instead of hanging it.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};

use tblsync_core::config::TimerConfig;
use tblsync_core::PeerSpec;
use tblsync_services::{Controller, UdpTransport};

mod gossip;
mod replication;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Upper bound on any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(5);

/// Timers short enough for a test but far enough apart to tell apart.
pub fn test_timers() -> TimerConfig {
    TimerConfig {
        poll_timeout_secs: 1,
        ..TimerConfig::default()
    }
}

/// A controller on an OS-chosen loopback port with a static peer list.
pub fn node(peers: &[String]) -> Result<Controller> {
    let transport = UdpTransport::bind(0).context("bind test node")?;
    let port = transport.local_addr()?.port();
    Ok(Controller::new(
        transport,
        tblsync_services::SystemClock,
        port,
        PeerSpec::Static(peers.to_vec()),
        &test_timers(),
    ))
}

/// `127.0.0.1:<port>` for a node.
pub fn addr_of(controller: &Controller) -> String {
    format!("127.0.0.1:{}", controller.port())
}

/// Await `fut`, failing the test after [`WAIT`].
pub async fn within<F: Future>(fut: F) -> Result<F::Output> {
    tokio::time::timeout(WAIT, fut)
        .await
        .context("timed out waiting on loopback")
}
