//! Sync driver: turns controller messages into host table changes.
//!
//! - `update`   merge; if accepted bump the sync marker, gossip onward to
//!              one peer, re-export the firewall tables and commit.
//! - `request`  answer the sender with one `update` per entry.
//! - `refresh`  re-read the neighbor cache and fold newly seen IPs into
//!              the entries that own those physical addresses.
//! - `resync`   purge expired entries, re-export, commit if anything is
//!              unsaved, then ask one random peer for its whole table.

use std::net::SocketAddr;

use anyhow::Result;
use async_trait::async_trait;

use tblsync_core::message::{Message, SyncMessage};
use tblsync_core::HostEntry;
use tblsync_services::{
    Clock, Controller, FirewallExporter, FirewallTableSink, MessageHandler, NeighborTable,
    NeighborTableProvider, TableError, Transport, VersionedTable,
};

pub struct SyncDriver {
    table: VersionedTable,
    neighbors: NeighborTable,
    neighbor_source: Box<dyn NeighborTableProvider>,
    firewall: FirewallExporter,
    sink: Box<dyn FirewallTableSink>,
    /// Changes not yet on disk.
    dirty: bool,
}

impl SyncDriver {
    pub fn new(
        table: VersionedTable,
        neighbor_source: Box<dyn NeighborTableProvider>,
        firewall: FirewallExporter,
        sink: Box<dyn FirewallTableSink>,
    ) -> Self {
        Self {
            table,
            neighbors: NeighborTable::new(),
            neighbor_source,
            firewall,
            sink,
            dirty: false,
        }
    }

    pub fn table(&self) -> &VersionedTable {
        &self.table
    }

    /// Write the table to disk now.
    pub fn persist(&mut self) -> Result<(), TableError> {
        self.table.commit()?;
        self.dirty = false;
        Ok(())
    }

    // ── Message handlers ─────────────────────────────────────────────────────

    async fn on_update<T: Transport, C: Clock>(
        &mut self,
        controller: &mut Controller<T, C>,
        entry: HostEntry,
    ) {
        if self.accept(controller, entry).await {
            self.export().await;
            self.commit();
        }
    }

    async fn on_request<T: Transport, C: Clock>(
        &mut self,
        controller: &mut Controller<T, C>,
        sender: Option<SocketAddr>,
    ) {
        let Some(sender) = sender else {
            tracing::debug!("request without a sender, ignoring");
            return;
        };
        let replies: Vec<Message> = self
            .table
            .entries()
            .map(|entry| SyncMessage::Update(entry.clone()).to_message())
            .collect();

        let peer = sender.to_string();
        let mut sent = 0;
        for reply in &replies {
            if controller.send_to(&peer, reply).await {
                sent += 1;
            }
        }
        tracing::debug!(peer = %peer, entries = replies.len(), sent, "answered table request");
    }

    async fn on_refresh<T: Transport, C: Clock>(&mut self, controller: &mut Controller<T, C>) {
        if let Err(e) = self.neighbors.refresh(self.neighbor_source.as_mut()).await {
            tracing::warn!(error = %e, "neighbor table refresh failed");
            return;
        }

        let learned: Vec<HostEntry> = self
            .table
            .entries()
            .filter_map(|entry| {
                let seen = self.neighbors.phys_to_ip(&entry.physical_address);
                if seen.is_subset(&entry.ip_addresses) {
                    return None;
                }
                let mut next = entry.clone();
                next.ip_addresses.extend(seen);
                next.version += 1;
                Some(next)
            })
            .collect();

        let mut changed = 0;
        for entry in learned {
            tracing::info!(host = %entry, "learned new addresses");
            if self.accept(controller, entry).await {
                changed += 1;
            }
        }
        if changed > 0 {
            self.export().await;
            self.commit();
        }
    }

    async fn on_resync<T: Transport, C: Clock>(&mut self, controller: &mut Controller<T, C>) {
        if self.table.purge() {
            self.dirty = true;
        }
        self.export().await;
        if self.dirty {
            self.commit();
        }
        match controller.gossip_to_one(&SyncMessage::Request.to_message()).await {
            Some(peer) => tracing::debug!(peer = %peer, db_version = self.table.db_version(), "requested full table"),
            None => tracing::trace!("resync with no peers"),
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    /// Merge `entry`; if it is new state, bump the marker and pass it on.
    async fn accept<T: Transport, C: Clock>(
        &mut self,
        controller: &mut Controller<T, C>,
        entry: HostEntry,
    ) -> bool {
        let outgoing = SyncMessage::Update(entry.clone()).to_message();
        if !self.table.update(entry) {
            return false;
        }
        self.dirty = true;
        let db_version = self.table.bump_sync_marker();
        let peer = controller.gossip_to_one(&outgoing).await;
        tracing::debug!(db_version, peer = ?peer, "update accepted");
        true
    }

    async fn export(&mut self) {
        let membership = self.table.by_table();
        let stats = self.firewall.export(&membership, self.sink.as_mut()).await;
        if stats.failed > 0 {
            tracing::warn!(failed = stats.failed, tables = stats.tables, "firewall export incomplete");
        }
    }

    fn commit(&mut self) {
        if let Err(e) = self.persist() {
            tracing::error!(error = %e, "failed to commit host table");
        }
    }
}

#[async_trait]
impl<T: Transport, C: Clock> MessageHandler<T, C> for SyncDriver {
    async fn handle(
        &mut self,
        controller: &mut Controller<T, C>,
        message: Message,
        sender: Option<SocketAddr>,
    ) -> Result<()> {
        let parsed = match SyncMessage::try_from(&message) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!(kind = %message.kind, sender = ?sender, error = %e, "ignoring message");
                return Ok(());
            }
        };

        match parsed {
            SyncMessage::Update(entry) => self.on_update(controller, entry).await,
            SyncMessage::Request => self.on_request(controller, sender).await,
            SyncMessage::Refresh => self.on_refresh(controller).await,
            SyncMessage::Resync => self.on_resync(controller).await,
        }
        Ok(())
    }
}
