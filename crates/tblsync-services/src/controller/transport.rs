//! Datagram transport under the controller.
//!
//! The controller needs two things from the network: a receive that gives
//! up after a bounded wait, and a fire-and-forget send to a `host:port`.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

/// Kernel receive buffer requested for the gossip socket.
pub const RECV_BUFFER_BYTES: usize = 65535;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Wait up to `wait` for one datagram. `Ok(None)` means the wait
    /// elapsed with nothing received.
    async fn recv_timeout(
        &self,
        buf: &mut [u8],
        wait: Duration,
    ) -> io::Result<Option<(usize, SocketAddr)>>;

    /// Send one datagram to `peer` (`host:port`).
    async fn send_to(&self, payload: &[u8], peer: &str) -> io::Result<usize>;
}

/// UDP socket bound on all IPv4 interfaces.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind `0.0.0.0:port`. Port 0 lets the OS choose.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(port: u16) -> Result<Self> {
        let socket = make_gossip_socket(port)
            .with_context(|| format!("failed to create gossip socket on port {port}"))?;
        let socket = UdpSocket::from_std(socket).context("failed to convert to tokio UdpSocket")?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn recv_timeout(
        &self,
        buf: &mut [u8],
        wait: Duration,
    ) -> io::Result<Option<(usize, SocketAddr)>> {
        match tokio::time::timeout(wait, self.socket.recv_from(buf)).await {
            Ok(Ok(received)) => Ok(Some(received)),
            Ok(Err(e)) => Err(e),
            Err(_elapsed) => Ok(None),
        }
    }

    async fn send_to(&self, payload: &[u8], peer: &str) -> io::Result<usize> {
        self.socket.send_to(payload, peer).await
    }
}

fn make_gossip_socket(port: u16) -> Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;

    socket
        .set_recv_buffer_size(RECV_BUFFER_BYTES)
        .context("SO_RCVBUF")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&bind_addr.into()).context("bind()")?;

    Ok(socket.into())
}
