//! Narrow interfaces to the operating system.
//!
//! The sync engine reads neighbor tables, discovers peers and programs the
//! packet filter only through these traits. The daemon supplies thin
//! adapters that shell out to the platform tools.
//!
//! Every call is async so a slow tool can be bounded with a timeout
//! instead of stalling the controller loop.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} exited with {status}")]
    Status { program: String, status: String },
    #[error("i/o with {program} failed: {source}")]
    Io {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} did not finish within {after:?}")]
    Timeout { program: String, after: Duration },
    #[error("{0}")]
    Other(String),
}

/// One row of an address-resolution cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborMapping {
    pub ip_address: String,
    pub physical_address: String,
    pub interface: String,
    pub expiration: String,
}

/// Source of `(ip, physical address, interface, expiration)` rows.
#[async_trait]
pub trait NeighborTableProvider: Send {
    async fn neighbors(&mut self) -> Result<Vec<NeighborMapping>, CollaboratorError>;
}

/// Source of peer host addresses, e.g. a routing protocol's neighbor list.
#[async_trait]
pub trait PeerDiscoverySource: Send + Sync {
    async fn discover(&mut self) -> Result<Vec<String>, CollaboratorError>;
}

/// Packet-filter tables. `replace_table` sets the full membership of one
/// table, so calling it twice with the same set is harmless.
#[async_trait]
pub trait FirewallTableSink: Send {
    async fn replace_table(
        &mut self,
        table: &str,
        addresses: &BTreeSet<String>,
    ) -> Result<(), CollaboratorError>;

    /// Current membership, if the sink can report it.
    async fn current_table(&mut self, _table: &str) -> Option<BTreeSet<String>> {
        None
    }
}
