//! Peer specifications.
//!
//! Peers are kept as `host:port` strings and resolved at send time, so
//! hostnames work as well as literal addresses.

use std::net::{IpAddr, SocketAddr};

/// Peer list value that selects routing-protocol neighbor discovery.
pub const DYNAMIC_PEERS: &str = "OSPF-PEERS";

/// Where the peer list comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerSpec {
    /// Fixed list of `host:port` peers.
    Static(Vec<String>),
    /// Peers are re-derived from the discovery source on a timer.
    Dynamic,
}

impl PeerSpec {
    /// Parse configured peer strings.
    ///
    /// Each string may hold several comma-separated peers. Entries without
    /// a port get `default_port`. A lone [`DYNAMIC_PEERS`] selects discovery.
    pub fn parse<S: AsRef<str>>(peers: &[S], default_port: u16) -> Self {
        let entries: Vec<&str> = peers
            .iter()
            .flat_map(|p| p.as_ref().split(','))
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();

        if entries == [DYNAMIC_PEERS] {
            return PeerSpec::Dynamic;
        }
        PeerSpec::Static(
            entries
                .into_iter()
                .map(|p| with_default_port(p, default_port))
                .collect(),
        )
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, PeerSpec::Dynamic)
    }
}

/// Append `default_port` to a peer that has none.
///
/// `10.0.0.1` → `10.0.0.1:8484`, `fe80::1` → `[fe80::1]:8484`,
/// `host:9000` is left alone.
pub fn with_default_port(peer: &str, default_port: u16) -> String {
    let peer = peer.trim();
    if peer.parse::<SocketAddr>().is_ok() {
        return peer.to_string();
    }
    if let Ok(ip) = peer.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        return SocketAddr::new(ip, default_port).to_string();
    }
    match peer.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => peer.to_string(),
        _ => format!("{peer}:{default_port}"),
    }
}
