//! Local neighbor table: what this node currently sees on its links.
//!
//! An owned snapshot of the OS address-resolution caches, refreshed on
//! demand from a [`NeighborTableProvider`]. Incomplete resolutions are
//! dropped, IPv6 scope suffixes (`%em0`) are stripped and physical
//! addresses are normalized so they match host table keys.

use std::collections::BTreeSet;

use tblsync_core::entry::normalize_physical_address;

use crate::collaborators::{CollaboratorError, NeighborMapping, NeighborTableProvider};

/// Physical-address column value for unresolved neighbors.
const INCOMPLETE: &str = "(incomplete)";

#[derive(Debug, Default, Clone)]
pub struct NeighborTable {
    mappings: Vec<NeighborMapping>,
}

impl NeighborTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot with fresh rows from `provider`.
    ///
    /// On error the previous snapshot is kept.
    pub async fn refresh(
        &mut self,
        provider: &mut dyn NeighborTableProvider,
    ) -> Result<usize, CollaboratorError> {
        let rows = provider.neighbors().await?;
        self.mappings = rows
            .into_iter()
            .filter(|m| m.physical_address != INCOMPLETE)
            .map(|mut m| {
                if let Some(idx) = m.ip_address.find('%') {
                    m.ip_address.truncate(idx);
                }
                if let Ok(normalized) = normalize_physical_address(&m.physical_address) {
                    m.physical_address = normalized;
                }
                m
            })
            .collect();
        tracing::trace!(count = self.mappings.len(), "neighbor table refreshed");
        Ok(self.mappings.len())
    }

    pub fn entries(&self) -> &[NeighborMapping] {
        &self.mappings
    }

    /// IPs currently resolving to `physical_address`.
    pub fn phys_to_ip(&self, physical_address: &str) -> BTreeSet<String> {
        self.mappings
            .iter()
            .filter(|m| m.physical_address == physical_address)
            .map(|m| m.ip_address.clone())
            .collect()
    }

    /// Physical addresses currently answering for `ip_address`.
    pub fn ip_to_phys(&self, ip_address: &str) -> BTreeSet<String> {
        self.mappings
            .iter()
            .filter(|m| m.ip_address == ip_address)
            .map(|m| m.physical_address.clone())
            .collect()
    }
}
