//! tblsync-core: host entries, gossip messages, peer specs and configuration.
//! All other tblsync crates depend on this one.

pub mod config;
pub mod entry;
pub mod message;
pub mod peers;

pub use entry::{EntryError, HostEntry, HostRecord, PLACEHOLDER_ADDRESS, SYNC_MARKER_ADDRESS};
pub use message::{Message, MessageError, SyncMessage};
pub use peers::PeerSpec;
