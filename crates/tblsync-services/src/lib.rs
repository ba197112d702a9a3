//! tblsync-services: the replicated host table, the gossip controller and
//! the seams to the operating system (neighbor cache, peer discovery,
//! packet filter).

pub mod collaborators;
pub mod controller;
pub mod firewall;
pub mod neighbors;
pub mod table;

pub use collaborators::{
    CollaboratorError, FirewallTableSink, NeighborMapping, NeighborTableProvider,
    PeerDiscoverySource,
};
pub use controller::{
    Clock, Controller, ManualClock, MessageHandler, StopHandle, SystemClock, Timer, Transport,
    UdpTransport,
};
pub use firewall::{ExportStats, FirewallExporter};
pub use neighbors::NeighborTable;
pub use table::{TableError, TableMembership, VersionedTable};
