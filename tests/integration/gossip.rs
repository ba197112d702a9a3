use std::time::Duration;

use tblsync_core::message::Message;
use tblsync_services::Transport;

use crate::*;

/// A datagram sent by one node comes out of the other's receive_next,
/// tagged with the sender's address.
#[tokio::test]
async fn test_send_reaches_peer_with_sender() -> Result<()> {
    let a = node(&[])?;
    let mut b = node(&[])?;

    let msg = Message::new("update").with_field("entry", serde_json::json!({"physical_address": "aa:bb:cc:dd:ee:ff"}));
    assert!(a.send_to(&addr_of(&b), &msg).await);

    let (received, sender) = within(b.receive_next()).await?;
    assert_eq!(received.kind, "update");
    assert_eq!(received.get("entry"), msg.get("entry"));
    assert_eq!(sender.context("datagram has a sender")?.port(), a.port());
    Ok(())
}

/// Garbage on the wire is dropped and the next good datagram is returned.
#[tokio::test]
async fn test_malformed_datagram_is_skipped() -> Result<()> {
    let mut b = node(&[])?;
    let raw = std::net::UdpSocket::bind("127.0.0.1:0")?;

    raw.send_to(b"not json at all", addr_of(&b))?;
    raw.send_to(br#"{"missing":"type"}"#, addr_of(&b))?;
    raw.send_to(br#"{"type":"request"}"#, addr_of(&b))?;

    let (received, sender) = within(b.receive_next()).await?;
    assert_eq!(received.kind, "request");
    assert_eq!(sender.map(|s| s.port()), Some(raw.local_addr()?.port()));
    Ok(())
}

/// With no traffic, the first thing out of receive_next is the
/// full-resync timer message.
#[tokio::test]
async fn test_idle_node_emits_resync_first() -> Result<()> {
    let mut a = node(&[])?;
    let (first, sender) = within(a.receive_next()).await?;
    assert_eq!(first.kind, "resync");
    assert!(sender.is_none());

    let (second, _) = within(a.receive_next()).await?;
    assert_eq!(second.kind, "refresh");
    Ok(())
}

/// One unreachable peer does not stop the broadcast reaching the rest.
#[tokio::test]
async fn test_broadcast_tolerates_unreachable_peer() -> Result<()> {
    let b = node(&[])?;
    let mut a = node(&["[::1]:9".to_string(), addr_of(&b)])?;

    let delivered = a.broadcast_to_all(&Message::new("request")).await;
    assert_eq!(delivered, 1);

    let mut buf = [0u8; 1500];
    let (len, _) = b
        .transport()
        .recv_timeout(&mut buf, WAIT)
        .await?
        .context("broadcast should reach the live peer")?;
    assert_eq!(Message::from_bytes(&buf[..len])?.kind, "request");
    Ok(())
}

/// Gossip to one goes to the only peer, and nowhere when there is none.
#[tokio::test]
async fn test_gossip_to_one() -> Result<()> {
    let b = node(&[])?;
    let mut a = node(&[addr_of(&b)])?;
    let mut lonely = node(&[])?;

    assert_eq!(lonely.gossip_to_one(&Message::new("request")).await, None);
    assert_eq!(a.gossip_to_one(&Message::new("request")).await, Some(addr_of(&b)));

    let mut buf = [0u8; 1500];
    let got = b.transport().recv_timeout(&mut buf, WAIT).await?;
    assert!(got.is_some());
    let nothing = b
        .transport()
        .recv_timeout(&mut buf, Duration::from_millis(200))
        .await?;
    assert!(nothing.is_none());
    Ok(())
}
