//! Gossip controller: one UDP socket, the peer list, and the event loop.
//!
//! `receive_next` is the only blocking call. It waits a bounded time for a
//! datagram; when the wait elapses empty it checks the timers and may hand
//! back a synthetic `resync` or `refresh` message instead. A datagram that
//! has already arrived always wins over a due timer.
//!
//! The controller never interprets messages beyond decoding the `type`
//! tag. What to do with them is up to the [`MessageHandler`].
//!
//! Peer discovery runs inside the loop, so each attempt is cut off after
//! one poll timeout and the previous list is kept.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rand::seq::SliceRandom;

use tblsync_core::config::TimerConfig;
use tblsync_core::message::{Message, MAX_DATAGRAM};
use tblsync_core::peers::{with_default_port, PeerSpec};

use crate::collaborators::PeerDiscoverySource;

pub mod clock;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock, Timer};
pub use transport::{Transport, UdpTransport};

/// Receives every message the controller delivers.
#[async_trait]
pub trait MessageHandler<T: Transport, C: Clock>: Send {
    /// `sender` is `None` for synthetic timer messages.
    async fn handle(
        &mut self,
        controller: &mut Controller<T, C>,
        message: Message,
        sender: Option<SocketAddr>,
    ) -> Result<()>;
}

/// Cooperative stop flag. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Controller<T = UdpTransport, C = SystemClock> {
    transport: T,
    clock: C,
    port: u16,
    poll_timeout: Duration,
    peers: Vec<String>,
    discovery: Option<Box<dyn PeerDiscoverySource>>,
    /// Only present for dynamic peer specs.
    peer_refresh: Option<Timer>,
    full_resync: Timer,
    local_refresh: Timer,
    stop: StopHandle,
}

impl Controller<UdpTransport, SystemClock> {
    /// Bind the gossip socket on `0.0.0.0:port`.
    pub fn bind(port: u16, peers: PeerSpec, timers: &TimerConfig) -> Result<Self> {
        let transport = UdpTransport::bind(port)?;
        let bound = transport.local_addr()?.port();
        tracing::info!(port = bound, dynamic_peers = peers.is_dynamic(), "gossip socket bound");
        Ok(Self::new(transport, SystemClock, bound, peers, timers))
    }
}

impl<T: Transport, C: Clock> Controller<T, C> {
    pub fn new(transport: T, clock: C, port: u16, peers: PeerSpec, timers: &TimerConfig) -> Self {
        let (peers, peer_refresh) = match peers {
            PeerSpec::Static(list) => (list, None),
            PeerSpec::Dynamic => (Vec::new(), Some(Timer::new(timers.peer_refresh()))),
        };
        Self {
            transport,
            clock,
            port,
            poll_timeout: timers.poll_timeout(),
            peers,
            discovery: None,
            peer_refresh,
            full_resync: Timer::new(timers.full_resync()),
            local_refresh: Timer::new(timers.local_refresh()),
            stop: StopHandle::default(),
        }
    }

    /// Source consulted when the peer spec is dynamic.
    pub fn with_discovery(mut self, source: Box<dyn PeerDiscoverySource>) -> Self {
        self.discovery = Some(source);
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Stop after the current iteration. An in-flight wait completes first.
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    /// Current peers, re-discovered first if that is due.
    pub async fn peer_list(&mut self) -> &[String] {
        self.refresh_peers_if_due().await;
        &self.peers
    }

    /// Next message: a decoded datagram with its sender, or a synthetic
    /// timer message with no sender.
    pub async fn receive_next(&mut self) -> (Message, Option<SocketAddr>) {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            match self.transport.recv_timeout(&mut buf, self.poll_timeout).await {
                Ok(Some((len, from))) => match Message::from_bytes(&buf[..len]) {
                    Ok(message) => {
                        tracing::trace!(%from, kind = %message.kind, "datagram received");
                        return (message, Some(from));
                    }
                    Err(e) => {
                        tracing::debug!(%from, bytes = len, error = %e, "discarding malformed datagram");
                        continue;
                    }
                },
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "recv_from failed"),
            }

            if let Some(message) = self.due_timer_message().await {
                tracing::trace!(kind = %message.kind, "timer fired");
                return (message, None);
            }
        }
    }

    /// Deliver messages to `handler` until stopped or the handler fails.
    pub async fn run<H: MessageHandler<T, C>>(&mut self, handler: &mut H) -> Result<()> {
        while !self.is_stopped() {
            let (message, sender) = self.receive_next().await;
            handler.handle(self, message, sender).await?;
        }
        tracing::info!("controller loop stopped");
        Ok(())
    }

    /// Send to every current peer. Returns how many sends succeeded.
    pub async fn broadcast_to_all(&mut self, message: &Message) -> usize {
        let Some(payload) = encode(message) else {
            return 0;
        };
        let peers = self.peer_list().await.to_vec();
        let mut delivered = 0;
        for peer in &peers {
            if self.send_payload(peer, &payload).await {
                delivered += 1;
            }
        }
        delivered
    }

    /// Send to one peer picked uniformly at random.
    ///
    /// Returns the chosen peer, or `None` (sending nothing) when the peer
    /// list is empty.
    pub async fn gossip_to_one(&mut self, message: &Message) -> Option<String> {
        let Some(peer) = self.pick_peer().await else {
            tracing::debug!(kind = %message.kind, "no peers to gossip to");
            return None;
        };
        self.send_to(&peer, message).await;
        Some(peer)
    }

    /// Send to one peer. Failures are logged, never returned.
    pub async fn send_to(&self, peer: &str, message: &Message) -> bool {
        match encode(message) {
            Some(payload) => self.send_payload(peer, &payload).await,
            None => false,
        }
    }

    async fn send_payload(&self, peer: &str, payload: &[u8]) -> bool {
        match self.transport.send_to(payload, peer).await {
            Ok(n) => {
                tracing::trace!(peer, bytes = n, "gossip sent");
                true
            }
            Err(e) => {
                tracing::warn!(peer, error = %e, "gossip send failed");
                false
            }
        }
    }

    async fn pick_peer(&mut self) -> Option<String> {
        self.refresh_peers_if_due().await;
        // ThreadRng is not Send; keep it out of any await.
        self.peers.choose(&mut rand::thread_rng()).cloned()
    }

    async fn due_timer_message(&mut self) -> Option<Message> {
        self.refresh_peers_if_due().await;

        let now = self.clock.now();
        if self.full_resync.poll(now) {
            return Some(Message::resync());
        }
        if self.local_refresh.poll(now) {
            return Some(Message::refresh());
        }
        None
    }

    async fn refresh_peers_if_due(&mut self) {
        let now = self.clock.now();
        let Some(timer) = self.peer_refresh.as_mut() else {
            return;
        };
        if !timer.poll(now) {
            return;
        }
        let Some(source) = self.discovery.as_mut() else {
            tracing::warn!("dynamic peers configured without a discovery source");
            return;
        };

        let outcome = tokio::time::timeout(self.poll_timeout, source.discover()).await;
        match outcome {
            Ok(Ok(hosts)) => {
                let port = self.port;
                let mut peers: Vec<String> =
                    hosts.iter().map(|h| with_default_port(h, port)).collect();
                peers.sort();
                peers.dedup();
                tracing::debug!(count = peers.len(), "peer list refreshed");
                self.peers = peers;
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, peers = self.peers.len(), "peer discovery failed, keeping previous list");
            }
            Err(_) => {
                tracing::warn!(
                    after = ?self.poll_timeout,
                    peers = self.peers.len(),
                    "peer discovery timed out, keeping previous list"
                );
            }
        }
    }
}

fn encode(message: &Message) -> Option<Vec<u8>> {
    match message.to_bytes() {
        Ok(payload) => Some(payload),
        Err(e) => {
            tracing::error!(kind = %message.kind, error = %e, "failed to encode message");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::CollaboratorError;
    use std::collections::{HashSet, VecDeque};
    use std::io;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    const SENDER: &str = "10.0.0.50:8484";

    /// In-memory transport. An empty inbox behaves like a full poll
    /// timeout: the shared clock advances by the wait.
    struct ScriptedTransport {
        inbox: Mutex<VecDeque<Vec<u8>>>,
        clock: ManualClock,
        sent: Mutex<Vec<(String, Vec<u8>)>>,
        unreachable: HashSet<String>,
    }

    impl ScriptedTransport {
        fn new(clock: ManualClock) -> Self {
            Self {
                inbox: Mutex::new(VecDeque::new()),
                clock,
                sent: Mutex::new(Vec::new()),
                unreachable: HashSet::new(),
            }
        }

        fn push(&self, datagram: &[u8]) {
            self.inbox.lock().unwrap().push_back(datagram.to_vec());
        }

        fn sent_to(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|(p, _)| p.clone()).collect()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn recv_timeout(
            &self,
            buf: &mut [u8],
            wait: Duration,
        ) -> io::Result<Option<(usize, SocketAddr)>> {
            match self.inbox.lock().unwrap().pop_front() {
                Some(datagram) => {
                    buf[..datagram.len()].copy_from_slice(&datagram);
                    Ok(Some((datagram.len(), SENDER.parse().unwrap())))
                }
                None => {
                    self.clock.advance(wait);
                    Ok(None)
                }
            }
        }

        async fn send_to(&self, payload: &[u8], peer: &str) -> io::Result<usize> {
            if self.unreachable.contains(peer) {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "no route to host"));
            }
            self.sent
                .lock()
                .unwrap()
                .push((peer.to_string(), payload.to_vec()));
            Ok(payload.len())
        }
    }

    struct ScriptedDiscovery {
        calls: Arc<AtomicUsize>,
        results: Arc<Mutex<VecDeque<std::result::Result<Vec<String>, String>>>>,
    }

    #[async_trait]
    impl PeerDiscoverySource for ScriptedDiscovery {
        async fn discover(&mut self) -> std::result::Result<Vec<String>, CollaboratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err("exhausted".into()))
                .map_err(CollaboratorError::Other)
        }
    }

    /// Never answers, like a routing daemon that stopped responding.
    struct HungDiscovery {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PeerDiscoverySource for HungDiscovery {
        async fn discover(&mut self) -> std::result::Result<Vec<String>, CollaboratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    fn controller(peers: PeerSpec) -> (Controller<ScriptedTransport, ManualClock>, ManualClock) {
        let clock = ManualClock::new();
        let transport = ScriptedTransport::new(clock.clone());
        let ctl = Controller::new(transport, clock.clone(), 8484, peers, &TimerConfig::default());
        (ctl, clock)
    }

    fn static_peers(peers: &[&str]) -> PeerSpec {
        PeerSpec::Static(peers.iter().map(|p| p.to_string()).collect())
    }

    #[tokio::test]
    async fn timers_fire_once_per_elapsed_interval_in_order() {
        let (mut ctl, clock) = controller(static_peers(&[]));

        let mut fired = Vec::new();
        while clock.elapsed() < Duration::from_secs(130) {
            let (message, sender) = ctl.receive_next().await;
            assert!(sender.is_none());
            fired.push((message.kind, clock.elapsed().as_secs()));
        }

        let expected: Vec<(String, u64)> = [
            ("resync", 5),
            ("refresh", 10),
            ("refresh", 20),
            ("refresh", 30),
            ("refresh", 40),
            ("refresh", 50),
            ("refresh", 60),
            ("resync", 65),
            ("refresh", 70),
            ("refresh", 80),
            ("refresh", 90),
            ("refresh", 100),
            ("refresh", 110),
            ("refresh", 120),
            ("resync", 125),
            ("refresh", 130),
        ]
        .into_iter()
        .map(|(k, t)| (k.to_string(), t))
        .collect();
        assert_eq!(fired, expected);
    }

    #[tokio::test]
    async fn pending_datagram_wins_over_due_timer() {
        let (mut ctl, clock) = controller(static_peers(&[]));
        ctl.transport().push(br#"{"type":"update","entry":{}}"#);

        let (first, sender) = ctl.receive_next().await;
        assert_eq!(first.kind, "update");
        assert_eq!(sender, Some(SENDER.parse().unwrap()));
        assert_eq!(clock.elapsed(), Duration::ZERO);

        let (second, sender) = ctl.receive_next().await;
        assert_eq!(second.kind, "resync");
        assert!(sender.is_none());
    }

    #[tokio::test]
    async fn queued_datagrams_are_delivered_in_arrival_order() {
        let (mut ctl, clock) = controller(static_peers(&[]));
        ctl.transport().push(br#"{"type":"update","seq":1}"#);
        ctl.transport().push(br#"{"type":"request","seq":2}"#);
        ctl.transport().push(br#"{"type":"update","seq":3}"#);

        let mut delivered = Vec::new();
        for _ in 0..3 {
            let (message, sender) = ctl.receive_next().await;
            assert!(sender.is_some());
            let seq = message.get("seq").and_then(serde_json::Value::as_u64);
            delivered.push((message.kind, seq));
        }
        assert_eq!(
            delivered,
            vec![
                ("update".to_string(), Some(1)),
                ("request".to_string(), Some(2)),
                ("update".to_string(), Some(3)),
            ]
        );
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn malformed_datagrams_are_skipped() {
        let (mut ctl, clock) = controller(static_peers(&[]));
        ctl.transport().push(b"\x00\x01garbage");
        ctl.transport().push(br#"{"no":"type"}"#);
        ctl.transport().push(br#"{"type":"request"}"#);

        let (message, sender) = ctl.receive_next().await;
        assert_eq!(message.kind, "request");
        assert!(sender.is_some());
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    struct StopAfter {
        limit: usize,
        seen: Vec<String>,
    }

    #[async_trait]
    impl MessageHandler<ScriptedTransport, ManualClock> for StopAfter {
        async fn handle(
            &mut self,
            controller: &mut Controller<ScriptedTransport, ManualClock>,
            message: Message,
            _sender: Option<SocketAddr>,
        ) -> Result<()> {
            self.seen.push(message.kind);
            if self.seen.len() == self.limit {
                controller.stop();
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn run_stops_cooperatively() {
        let (mut ctl, _clock) = controller(static_peers(&[]));
        let mut handler = StopAfter { limit: 3, seen: Vec::new() };

        ctl.run(&mut handler).await.unwrap();
        assert_eq!(handler.seen, vec!["resync", "refresh", "refresh"]);
    }

    #[tokio::test]
    async fn stop_before_run_delivers_nothing() {
        let (mut ctl, _clock) = controller(static_peers(&[]));
        ctl.stop_handle().stop();
        let mut handler = StopAfter { limit: 1, seen: Vec::new() };

        ctl.run(&mut handler).await.unwrap();
        assert!(handler.seen.is_empty());
    }

    #[tokio::test]
    async fn gossip_with_no_peers_is_a_no_op() {
        let (mut ctl, _clock) = controller(static_peers(&[]));
        assert_eq!(ctl.gossip_to_one(&Message::new("update")).await, None);
        assert!(ctl.transport().sent_to().is_empty());
    }

    #[tokio::test]
    async fn gossip_picks_from_current_peers() {
        let peers = ["10.0.0.1:8484", "10.0.0.2:8484", "10.0.0.3:8484"];
        let (mut ctl, _clock) = controller(static_peers(&peers));

        let mut chosen = HashSet::new();
        for _ in 0..200 {
            let peer = ctl.gossip_to_one(&Message::new("update")).await.unwrap();
            assert!(peers.contains(&peer.as_str()));
            chosen.insert(peer);
        }
        assert_eq!(ctl.transport().sent_to().len(), 200);
        assert_eq!(chosen.len(), 3, "uniform choice should hit every peer in 200 draws");
    }

    #[tokio::test]
    async fn broadcast_survives_unreachable_peer() {
        let clock = ManualClock::new();
        let mut transport = ScriptedTransport::new(clock.clone());
        transport.unreachable.insert("10.0.0.2:8484".into());
        let mut ctl = Controller::new(
            transport,
            clock,
            8484,
            static_peers(&["10.0.0.1:8484", "10.0.0.2:8484", "10.0.0.3:8484"]),
            &TimerConfig::default(),
        );

        let delivered = ctl.broadcast_to_all(&Message::new("update")).await;
        assert_eq!(delivered, 2);
        assert_eq!(ctl.transport().sent_to(), vec!["10.0.0.1:8484", "10.0.0.3:8484"]);
        assert!(!ctl.send_to("10.0.0.2:8484", &Message::new("update")).await);
    }

    #[tokio::test]
    async fn dynamic_peers_refresh_on_their_own_interval() {
        let calls = Arc::new(AtomicUsize::new(0));
        let results = Arc::new(Mutex::new(VecDeque::from([
            Ok(vec!["10.0.0.9".to_string(), "10.0.0.3".to_string()]),
            Err("ospfd not running".to_string()),
            Ok(vec!["10.0.0.4".to_string()]),
        ])));
        let (ctl, clock) = controller(PeerSpec::Dynamic);
        let mut ctl = ctl.with_discovery(Box::new(ScriptedDiscovery {
            calls: calls.clone(),
            results,
        }));

        assert_eq!(ctl.peer_list().await, ["10.0.0.3:8484", "10.0.0.9:8484"]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_secs(29));
        ctl.peer_list().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_secs(1));
        assert_eq!(ctl.peer_list().await, ["10.0.0.3:8484", "10.0.0.9:8484"], "stale list kept on failure");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        clock.advance(Duration::from_secs(30));
        assert_eq!(ctl.peer_list().await, ["10.0.0.4:8484"]);
    }

    #[tokio::test]
    async fn hung_discovery_cannot_stall_receive() {
        let clock = ManualClock::new();
        let timers = TimerConfig {
            poll_timeout_secs: 1,
            ..TimerConfig::default()
        };
        let calls = Arc::new(AtomicUsize::new(0));
        let mut ctl = Controller::new(
            ScriptedTransport::new(clock.clone()),
            clock,
            8484,
            PeerSpec::Dynamic,
            &timers,
        )
        .with_discovery(Box::new(HungDiscovery { calls: calls.clone() }));

        let (message, sender) = tokio::time::timeout(Duration::from_secs(3), ctl.receive_next())
            .await
            .expect("receive_next stalled behind discovery");
        assert_eq!(message.kind, "resync");
        assert!(sender.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(ctl.peers.is_empty());
    }

    #[tokio::test]
    async fn dynamic_peers_start_empty_without_a_source() {
        let (mut ctl, _clock) = controller(PeerSpec::Dynamic);
        assert!(ctl.peer_list().await.is_empty());
        assert_eq!(ctl.gossip_to_one(&Message::new("update")).await, None);
    }
}
