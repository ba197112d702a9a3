use std::net::SocketAddr;

use async_trait::async_trait;
use tblsync_core::message::{Message, SyncMessage};
use tblsync_core::HostEntry;
use tblsync_services::{Clock, MessageHandler, SystemClock, Transport, UdpTransport, VersionedTable};

use crate::*;

/// Merges updates into a table and gossips accepted ones onward. Stops
/// after `limit` updates.
struct Replica {
    table: VersionedTable,
    outcomes: Vec<bool>,
    limit: usize,
}

#[async_trait]
impl<T: Transport, C: Clock> MessageHandler<T, C> for Replica {
    async fn handle(
        &mut self,
        controller: &mut Controller<T, C>,
        message: Message,
        _sender: Option<SocketAddr>,
    ) -> Result<()> {
        if let Ok(SyncMessage::Update(entry)) = SyncMessage::try_from(&message) {
            let accepted = self.table.update(entry.clone());
            if accepted {
                self.table.bump_sync_marker();
                controller
                    .gossip_to_one(&SyncMessage::Update(entry).to_message())
                    .await;
            }
            self.outcomes.push(accepted);
            if self.outcomes.len() == self.limit {
                controller.stop();
            }
        }
        Ok(())
    }
}

fn printer(version: i64) -> Result<HostEntry> {
    let mut entry = HostEntry::new("00-0d-b9-41-2a-10")?;
    entry.name = "printer".to_string();
    entry.ip_addresses.insert("10.0.0.7".to_string());
    entry.tables.insert("office".to_string());
    entry.version = version;
    Ok(entry)
}

/// An update applied twice over the wire is accepted once, and only the
/// accepted copy is gossiped onward.
#[tokio::test]
async fn test_update_over_the_wire_is_idempotent() -> Result<()> {
    let mut a = node(&[])?;
    let mut b: Controller<UdpTransport, SystemClock> = node(&[addr_of(&a)])?;
    let b_addr = addr_of(&b);
    let b_port = b.port();

    let replica = Replica {
        table: VersionedTable::new(),
        outcomes: Vec::new(),
        limit: 2,
    };
    let runner = tokio::spawn(async move {
        let mut replica = replica;
        let result = b.run(&mut replica).await;
        (result, replica)
    });

    let update = SyncMessage::Update(printer(1)?).to_message();
    assert!(a.send_to(&b_addr, &update).await);

    let (echo, sender) = within(a.receive_next()).await?;
    assert_eq!(echo.kind, "update");
    assert_eq!(sender.map(|s| s.port()), Some(b_port));

    assert!(a.send_to(&b_addr, &update).await);

    let (result, replica) = within(runner).await??;
    result?;
    assert_eq!(replica.outcomes, vec![true, false]);
    assert_eq!(replica.table.len(), 1);
    assert_eq!(replica.table.db_version(), 0);

    let stored = replica
        .table
        .find_by_physical_address("00:0d:b9:41:2a:10")
        .context("entry replicated")?;
    assert_eq!(stored.version, 1);
    assert_eq!(stored.name, "printer");

    let mut buf = [0u8; 1500];
    let extra = a
        .transport()
        .recv_timeout(&mut buf, std::time::Duration::from_millis(300))
        .await?;
    assert!(extra.is_none(), "rejected update must not be gossiped");
    Ok(())
}

/// A newer version overwrites, an older one does not.
#[tokio::test]
async fn test_newer_version_wins_over_the_wire() -> Result<()> {
    let a = node(&[])?;
    let mut b = node(&[])?;
    let b_addr = addr_of(&b);

    let replica = Replica {
        table: VersionedTable::new(),
        outcomes: Vec::new(),
        limit: 3,
    };
    let runner = tokio::spawn(async move {
        let mut replica = replica;
        let result = b.run(&mut replica).await;
        (result, replica)
    });

    let mut newer = printer(5)?;
    newer.ip_addresses.insert("10.0.0.8".to_string());
    for entry in [printer(1)?, newer, printer(3)?] {
        assert!(a.send_to(&b_addr, &SyncMessage::Update(entry).to_message()).await);
    }

    let (result, replica) = within(runner).await??;
    result?;
    assert_eq!(replica.outcomes, vec![true, true, false]);
    let stored = replica
        .table
        .find_by_physical_address("00:0d:b9:41:2a:10")
        .context("entry replicated")?;
    assert_eq!(stored.version, 5);
    assert!(stored.ip_addresses.contains("10.0.0.8"));
    assert_eq!(replica.table.by_table()["office"].len(), 2);
    Ok(())
}
