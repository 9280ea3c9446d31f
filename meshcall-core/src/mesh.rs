//! Mesh relay: floods signaling messages across a short-range radio mesh.
//!
//! Split in two layers. `FloodRouter` is host-driven and does no I/O: it takes outbound
//! messages and inbound datagrams and returns `RelayAction`s (deliver locally, transmit bytes).
//! `MeshRelay` is the `Channel`: one actor task per relay that owns the router and the link
//! table and drives a `PacketTransport` (advertise, scan, link, write, notify).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{Channel, ChannelEvents, ChannelState};
use crate::config::MeshConfig;
use crate::protocol::{MeshPacket, PacketKind, SignalingMessage};
use crate::wire;

const EVENT_BUFFER: usize = 256;
/// Packets queued per link before a slow link starts losing them.
const LINK_QUEUE: usize = 64;
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Handle of a directly reachable neighbor, as named by the packet transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NeighborId(pub String);

impl std::fmt::Display for NeighborId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bytes that arrived on an accepted link (a neighbor wrote to us).
#[derive(Debug, Clone)]
pub struct Inbound {
    pub from: NeighborId,
    pub bytes: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("radio unavailable: {0}")]
    Unavailable(String),
    #[error("link to {neighbor} failed: {reason}")]
    Link { neighbor: NeighborId, reason: String },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Raw packet primitive under the relay: each node both advertises (peripheral role) and
/// scans/links (central role).
#[async_trait]
pub trait PacketTransport: Send + Sync {
    async fn advertise(&self, service_id: &str) -> Result<(), TransportError>;

    async fn stop_advertising(&self);

    /// Stream of bytes written to us by neighbors that linked to us.
    async fn listen(&self) -> Result<mpsc::Receiver<Inbound>, TransportError>;

    /// Neighbors advertising `service_id`. The stream ends when the scan window closes.
    async fn scan(&self, service_id: &str) -> Result<mpsc::Receiver<NeighborId>, TransportError>;

    /// Link to a neighbor and subscribe to its notifications.
    async fn connect(&self, neighbor: &NeighborId) -> Result<mpsc::Receiver<Vec<u8>>, TransportError>;

    async fn write(&self, neighbor: &NeighborId, bytes: &[u8]) -> Result<(), TransportError>;

    /// Publish on our own notification surface, reaching every neighbor linked to us.
    async fn notify(&self, bytes: &[u8]) -> Result<(), TransportError>;
}

/// Packet ids already handled, bounded by age and by count (oldest evicted first).
pub struct SeenCache {
    capacity: usize,
    window: Duration,
    ids: HashSet<Uuid>,
    order: VecDeque<(Uuid, Instant)>,
}

impl SeenCache {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            window,
            ids: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Record `id`. Returns false if it was already known.
    pub fn insert(&mut self, id: Uuid, now: Instant) -> bool {
        self.expire(now);
        if self.ids.contains(&id) {
            return false;
        }
        while self.ids.len() >= self.capacity {
            match self.order.pop_front() {
                Some((old, _)) => {
                    self.ids.remove(&old);
                }
                None => break,
            }
        }
        self.ids.insert(id);
        self.order.push_back((id, now));
        true
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.ids.contains(id)
    }

    /// Forget ids older than the window.
    pub fn expire(&mut self, now: Instant) {
        while let Some(&(id, at)) = self.order.front() {
            if now.saturating_duration_since(at) < self.window {
                break;
            }
            self.order.pop_front();
            self.ids.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// What the host must do after feeding the router.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayAction {
    /// Hand a signaling message to the application, once per packet id.
    Deliver(SignalingMessage),
    /// Push encoded packet bytes to every linked neighbor and the notification surface.
    Transmit(Vec<u8>),
}

/// Flooding logic with duplicate suppression. No I/O.
pub struct FloodRouter {
    node_id: String,
    ttl: u8,
    seen: SeenCache,
}

impl FloodRouter {
    pub fn new(node_id: impl Into<String>, config: &MeshConfig) -> Self {
        Self {
            node_id: node_id.into(),
            ttl: config.default_ttl,
            seen: SeenCache::new(config.seen_capacity, config.seen_window()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Wrap an outbound message in a fresh broadcast packet and flood it.
    pub fn originate(&mut self, msg: &SignalingMessage, now: Instant) -> Vec<RelayAction> {
        let payload = match msg.to_json() {
            Ok(json) => json.into_bytes(),
            Err(e) => {
                warn!(error = %e, "cannot encode signaling message for mesh");
                return vec![];
            }
        };
        let packet = MeshPacket::broadcast(self.node_id.clone(), PacketKind::Signaling, payload, self.ttl);
        self.broadcast_packet(packet, now)
    }

    /// Flood a packet unless its id was already handled.
    pub fn broadcast_packet(&mut self, packet: MeshPacket, now: Instant) -> Vec<RelayAction> {
        if !self.seen.insert(packet.id, now) {
            debug!(id = %packet.id, "packet already seen, not rebroadcasting");
            return vec![];
        }
        self.transmit(&packet)
    }

    /// Handle a datagram from any neighbor: deliver once, relay while ttl remains.
    /// Undecodable datagrams are dropped.
    pub fn on_bytes(&mut self, bytes: &[u8], now: Instant) -> Vec<RelayAction> {
        let packet = match wire::decode_packet(bytes) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, len = bytes.len(), "dropping corrupt mesh packet");
                return vec![];
            }
        };
        if !self.seen.insert(packet.id, now) {
            return vec![];
        }
        let mut actions = Vec::new();
        if packet.kind == PacketKind::Signaling && (packet.is_broadcast() || packet.target_id == self.node_id) {
            let decoded = std::str::from_utf8(&packet.payload)
                .map_err(|e| e.to_string())
                .and_then(|text| SignalingMessage::from_json(text).map_err(|e| e.to_string()));
            match decoded {
                Ok(msg) => actions.push(RelayAction::Deliver(msg)),
                Err(e) => debug!(id = %packet.id, error = %e, "undecodable signaling payload"),
            }
        }
        if let Some(next) = packet.relayed() {
            debug!(id = %packet.id, ttl = next.ttl, hop = next.hop_count, "relaying");
            actions.extend(self.transmit(&next));
        }
        actions
    }

    pub fn sweep(&mut self, now: Instant) {
        self.seen.expire(now);
    }

    pub fn seen_len(&self) -> usize {
        self.seen.len()
    }

    fn transmit(&self, packet: &MeshPacket) -> Vec<RelayAction> {
        match wire::encode_packet(packet) {
            Ok(bytes) => vec![RelayAction::Transmit(bytes)],
            Err(e) => {
                warn!(id = %packet.id, error = %e, "cannot encode mesh packet");
                vec![]
            }
        }
    }
}

enum RelayEvent {
    Outbound(SignalingMessage),
    Inbound(Inbound),
    Discovered(NeighborId),
    Linked(NeighborId),
    LinkFailed(NeighborId, String),
    LinkClosed(NeighborId),
    ScanEnded,
}

struct Running {
    tx: mpsc::Sender<RelayEvent>,
    task: JoinHandle<()>,
}

/// Flooding `Channel` over a `PacketTransport`.
pub struct MeshRelay {
    node_id: String,
    transport: Arc<dyn PacketTransport>,
    config: MeshConfig,
    events: ChannelEvents,
    running: Mutex<Option<Running>>,
}

impl MeshRelay {
    pub fn new(node_id: impl Into<String>, transport: Arc<dyn PacketTransport>, config: MeshConfig) -> Self {
        Self {
            node_id: node_id.into(),
            transport,
            config,
            events: ChannelEvents::new(),
            running: Mutex::new(None),
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<RelayEvent>> {
        let running = self.running.lock().ok()?;
        running
            .as_ref()
            .filter(|r| !r.task.is_finished())
            .map(|r| r.tx.clone())
    }
}

#[async_trait]
impl Channel for MeshRelay {
    async fn connect(&self) {
        let Ok(mut running) = self.running.lock() else {
            return;
        };
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return;
        }
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let actor = RelayActor {
            router: FloodRouter::new(self.node_id.clone(), &self.config),
            transport: self.transport.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
            tx: tx.clone(),
            links: HashMap::new(),
            notifier: None,
            pending: HashSet::new(),
            accepted: HashMap::new(),
            scanning: false,
            tasks: Vec::new(),
        };
        self.events.set_state(ChannelState::Connecting);
        info!(node = %self.node_id, service = %self.config.service_id, "mesh relay starting");
        let task = tokio::spawn(actor.run(rx));
        *running = Some(Running { tx, task });
    }

    async fn disconnect(&self) {
        let previous = self.running.lock().ok().and_then(|mut r| r.take());
        if let Some(running) = previous {
            running.task.abort();
            self.transport.stop_advertising().await;
            info!(node = %self.node_id, "mesh relay stopped");
        }
        if self.events.current() != ChannelState::Idle {
            self.events.set_state(ChannelState::Disconnected);
        }
    }

    fn state(&self) -> watch::Receiver<ChannelState> {
        self.events.subscribe_state()
    }

    fn messages(&self) -> broadcast::Receiver<SignalingMessage> {
        self.events.subscribe()
    }

    async fn send_message(&self, msg: SignalingMessage) {
        let Some(tx) = self.sender() else {
            debug!(kind = %msg.kind(), "mesh relay not running, dropping");
            return;
        };
        if tx.send(RelayEvent::Outbound(msg)).await.is_err() {
            debug!("mesh relay stopped while sending");
        }
    }
}

struct RelayActor {
    router: FloodRouter,
    transport: Arc<dyn PacketTransport>,
    config: MeshConfig,
    events: ChannelEvents,
    tx: mpsc::Sender<RelayEvent>,
    /// Neighbors we linked to, each with its own write queue.
    links: HashMap<NeighborId, mpsc::Sender<Arc<Vec<u8>>>>,
    /// Write queue for notifications to neighbors linked to us.
    notifier: Option<mpsc::Sender<Arc<Vec<u8>>>>,
    pending: HashSet<NeighborId>,
    /// Neighbors that linked to us, by last time they wrote.
    accepted: HashMap<NeighborId, Instant>,
    scanning: bool,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for RelayActor {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl RelayActor {
    async fn run(mut self, mut rx: mpsc::Receiver<RelayEvent>) {
        if let Err(e) = self.start().await {
            warn!(error = %e, "mesh relay could not start");
            self.events.set_state(ChannelState::Error);
            return;
        }
        let mut rescan = tokio::time::interval(self.config.rescan_interval());
        let mut sweep = tokio::time::interval(self.config.sweep_interval());
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
                _ = rescan.tick() => self.rediscover().await,
                _ = sweep.tick() => self.sweep(),
            }
        }
    }

    async fn start(&mut self) -> Result<(), TransportError> {
        self.transport.advertise(&self.config.service_id).await?;
        let mut inbound = self.transport.listen().await?;
        self.notifier = Some(self.spawn_writer(None));
        let tx = self.tx.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(data) = inbound.recv().await {
                if tx.send(RelayEvent::Inbound(data)).await.is_err() {
                    break;
                }
            }
        }));
        Ok(())
    }

    async fn handle(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Outbound(msg) => {
                let actions = self.router.originate(&msg, Instant::now());
                self.apply(actions);
            }
            RelayEvent::Inbound(Inbound { from, bytes }) => {
                if !self.links.contains_key(&from) {
                    self.accepted.insert(from, Instant::now());
                    self.update_state();
                }
                let actions = self.router.on_bytes(&bytes, Instant::now());
                self.apply(actions);
            }
            RelayEvent::Discovered(neighbor) => self.link(neighbor),
            RelayEvent::Linked(neighbor) => {
                info!(%neighbor, "mesh neighbor linked");
                self.pending.remove(&neighbor);
                let queue = self.spawn_writer(Some(neighbor.clone()));
                self.links.insert(neighbor, queue);
                self.update_state();
            }
            RelayEvent::LinkFailed(neighbor, reason) => {
                debug!(%neighbor, %reason, "mesh link failed");
                self.pending.remove(&neighbor);
            }
            RelayEvent::LinkClosed(neighbor) => {
                info!(%neighbor, "mesh neighbor lost");
                self.links.remove(&neighbor);
                self.update_state();
            }
            RelayEvent::ScanEnded => self.scanning = false,
        }
    }

    fn apply(&mut self, actions: Vec<RelayAction>) {
        for action in actions {
            match action {
                RelayAction::Deliver(msg) => self.events.deliver(msg),
                RelayAction::Transmit(bytes) => {
                    let bytes = Arc::new(bytes);
                    for (neighbor, queue) in &self.links {
                        if queue.try_send(bytes.clone()).is_err() {
                            debug!(%neighbor, "mesh link backed up, dropping packet");
                        }
                    }
                    if let Some(notifier) = &self.notifier {
                        if notifier.try_send(bytes).is_err() {
                            debug!("mesh notify backed up, dropping packet");
                        }
                    }
                }
            }
        }
    }

    /// Writes to one neighbor (or notifies subscribers, for `None`) in order, off the actor.
    /// The task ends when its queue is dropped.
    fn spawn_writer(&mut self, neighbor: Option<NeighborId>) -> mpsc::Sender<Arc<Vec<u8>>> {
        let (queue, mut rx) = mpsc::channel::<Arc<Vec<u8>>>(LINK_QUEUE);
        let transport = self.transport.clone();
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                let write = async {
                    match &neighbor {
                        Some(n) => transport.write(n, &bytes).await,
                        None => transport.notify(&bytes).await,
                    }
                };
                match tokio::time::timeout(WRITE_TIMEOUT, write).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!(neighbor = ?neighbor, error = %e, "mesh write failed"),
                    Err(_) => debug!(neighbor = ?neighbor, "mesh write timed out"),
                }
            }
        }));
        queue
    }

    fn link(&mut self, neighbor: NeighborId) {
        if self.links.contains_key(&neighbor) || !self.pending.insert(neighbor.clone()) {
            return;
        }
        let transport = self.transport.clone();
        let tx = self.tx.clone();
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(tokio::spawn(async move {
            let mut notifications = match transport.connect(&neighbor).await {
                Ok(rx) => rx,
                Err(e) => {
                    let _ = tx.send(RelayEvent::LinkFailed(neighbor, e.to_string())).await;
                    return;
                }
            };
            if tx.send(RelayEvent::Linked(neighbor.clone())).await.is_err() {
                return;
            }
            while let Some(bytes) = notifications.recv().await {
                let inbound = Inbound {
                    from: neighbor.clone(),
                    bytes,
                };
                if tx.send(RelayEvent::Inbound(inbound)).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(RelayEvent::LinkClosed(neighbor)).await;
        }));
    }

    async fn rediscover(&mut self) {
        if let Err(e) = self.transport.advertise(&self.config.service_id).await {
            debug!(error = %e, "re-advertise failed");
        }
        if self.scanning {
            return;
        }
        let mut found = match self.transport.scan(&self.config.service_id).await {
            Ok(rx) => rx,
            Err(e) => {
                debug!(error = %e, "scan failed");
                return;
            }
        };
        self.scanning = true;
        let tx = self.tx.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(neighbor) = found.recv().await {
                if tx.send(RelayEvent::Discovered(neighbor)).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(RelayEvent::ScanEnded).await;
        }));
    }

    fn sweep(&mut self) {
        let now = Instant::now();
        self.router.sweep(now);
        let stale = self.config.rescan_interval() * 3;
        let before = self.accepted.len();
        self.accepted
            .retain(|_, last| now.saturating_duration_since(*last) < stale);
        if self.accepted.len() != before {
            self.update_state();
        }
        self.tasks.retain(|t| !t.is_finished());
    }

    fn update_state(&self) {
        let state = if self.links.is_empty() && self.accepted.is_empty() {
            ChannelState::Connecting
        } else {
            ChannelState::Connected
        };
        self.events.set_state(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Signal, DEFAULT_TTL};
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(ttl: u8) -> MeshConfig {
        MeshConfig {
            default_ttl: ttl,
            ..MeshConfig::default()
        }
    }

    fn join_from(sender: &str) -> SignalingMessage {
        SignalingMessage::new(sender, Signal::Join)
    }

    fn transmitted(actions: &[RelayAction]) -> Vec<Vec<u8>> {
        actions
            .iter()
            .filter_map(|a| match a {
                RelayAction::Transmit(b) => Some(b.clone()),
                _ => None,
            })
            .collect()
    }

    fn delivered(actions: &[RelayAction]) -> Vec<SignalingMessage> {
        actions
            .iter()
            .filter_map(|a| match a {
                RelayAction::Deliver(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn seen_cache_bounds_by_capacity_and_age() {
        let start = Instant::now();
        let mut seen = SeenCache::new(2, Duration::from_secs(10));
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        assert!(seen.insert(a, start));
        assert!(!seen.insert(a, start));
        assert!(seen.insert(b, start));
        assert!(seen.insert(c, start));
        assert_eq!(seen.len(), 2);
        assert!(!seen.contains(&a));

        seen.expire(start + Duration::from_secs(10));
        assert!(seen.is_empty());
        assert!(seen.insert(b, start + Duration::from_secs(11)));
    }

    #[test]
    fn originate_marks_seen_and_ignores_own_echo() {
        let now = Instant::now();
        let mut router = FloodRouter::new("n0", &config(DEFAULT_TTL));
        let actions = router.originate(&join_from("n0"), now);
        let frames = transmitted(&actions);
        assert_eq!(frames.len(), 1);
        assert!(router.on_bytes(&frames[0], now).is_empty());
    }

    #[test]
    fn ttl_decrements_along_a_chain() {
        let now = Instant::now();
        let mut origin = FloodRouter::new("n0", &config(DEFAULT_TTL));
        let mut frame = transmitted(&origin.originate(&join_from("n0"), now)).remove(0);
        let first = wire::decode_packet(&frame).unwrap();

        let mut relays = 0u8;
        for hop in 1..=10 {
            let mut router = FloodRouter::new(format!("n{hop}"), &config(DEFAULT_TTL));
            let actions = router.on_bytes(&frame, now);
            assert_eq!(delivered(&actions).len(), 1);
            let out = transmitted(&actions);
            if out.is_empty() {
                break;
            }
            relays += 1;
            let p = wire::decode_packet(&out[0]).unwrap();
            assert_eq!(p.id, first.id);
            assert_eq!(p.ttl, first.ttl - relays);
            assert_eq!(p.hop_count, first.hop_count + relays);
            frame = out[0].clone();
        }
        assert_eq!(relays, DEFAULT_TTL);
    }

    #[test]
    fn duplicate_arrivals_deliver_once() {
        let now = Instant::now();
        let mut origin = FloodRouter::new("n0", &config(DEFAULT_TTL));
        let frame = transmitted(&origin.originate(&join_from("n0"), now)).remove(0);

        let mut router = FloodRouter::new("n1", &config(DEFAULT_TTL));
        let first = router.on_bytes(&frame, now);
        assert_eq!(delivered(&first).len(), 1);
        assert_eq!(transmitted(&first).len(), 1);

        // Same packet again via another neighbor, and its relayed copy bounced back.
        assert!(router.on_bytes(&frame, now).is_empty());
        let bounced = transmitted(&first).remove(0);
        assert!(router.on_bytes(&bounced, now).is_empty());
    }

    #[test]
    fn ttl_zero_is_delivered_but_not_relayed() {
        let now = Instant::now();
        let mut origin = FloodRouter::new("n0", &config(0));
        let frame = transmitted(&origin.originate(&join_from("n0"), now)).remove(0);
        let mut router = FloodRouter::new("n1", &config(DEFAULT_TTL));
        let actions = router.on_bytes(&frame, now);
        assert_eq!(delivered(&actions).len(), 1);
        assert!(transmitted(&actions).is_empty());
        assert!(router.on_bytes(&frame, now).is_empty());
    }

    #[test]
    fn corrupt_and_non_signaling_packets() {
        let now = Instant::now();
        let mut router = FloodRouter::new("n1", &config(DEFAULT_TTL));
        assert!(router.on_bytes(b"\x03\x00\x00\x00abc", now).is_empty());
        assert!(router.on_bytes(b"", now).is_empty());

        let hello = MeshPacket::broadcast("n0", PacketKind::Hello, vec![], 2);
        let actions = router.on_bytes(&wire::encode_packet(&hello).unwrap(), now);
        assert!(delivered(&actions).is_empty());
        assert_eq!(transmitted(&actions).len(), 1);

        let garbage = MeshPacket::broadcast("n0", PacketKind::Signaling, b"not json".to_vec(), 2);
        let actions = router.on_bytes(&wire::encode_packet(&garbage).unwrap(), now);
        assert!(delivered(&actions).is_empty());
        assert_eq!(transmitted(&actions).len(), 1);
    }

    /// Simulated radio: nodes in a shared medium, adjacency given by `edges`.
    #[derive(Default)]
    struct Medium {
        edges: HashSet<(String, String)>,
        state: Mutex<MediumState>,
    }

    #[derive(Default)]
    struct MediumState {
        advertising: BTreeSet<String>,
        inbound: HashMap<String, mpsc::Sender<Inbound>>,
        subscribers: HashMap<String, Vec<mpsc::Sender<Vec<u8>>>>,
        /// (from, to) pairs whose writes never complete.
        stalled: HashSet<(String, String)>,
    }

    impl Medium {
        fn new(edges: &[(&str, &str)]) -> Arc<Self> {
            let mut set = HashSet::new();
            for (a, b) in edges {
                set.insert((a.to_string(), b.to_string()));
                set.insert((b.to_string(), a.to_string()));
            }
            Arc::new(Self {
                edges: set,
                state: Mutex::new(MediumState::default()),
            })
        }

        fn adjacent(&self, a: &str, b: &str) -> bool {
            self.edges.contains(&(a.to_string(), b.to_string()))
        }
    }

    struct SimRadio {
        name: String,
        medium: Arc<Medium>,
        transmissions: AtomicUsize,
    }

    impl SimRadio {
        fn new(name: &str, medium: &Arc<Medium>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                medium: medium.clone(),
                transmissions: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PacketTransport for SimRadio {
        async fn advertise(&self, _service_id: &str) -> Result<(), TransportError> {
            self.medium.state.lock().unwrap().advertising.insert(self.name.clone());
            Ok(())
        }

        async fn stop_advertising(&self) {
            self.medium.state.lock().unwrap().advertising.remove(&self.name);
        }

        async fn listen(&self) -> Result<mpsc::Receiver<Inbound>, TransportError> {
            let (tx, rx) = mpsc::channel(64);
            self.medium.state.lock().unwrap().inbound.insert(self.name.clone(), tx);
            Ok(rx)
        }

        async fn scan(&self, _service_id: &str) -> Result<mpsc::Receiver<NeighborId>, TransportError> {
            let (tx, rx) = mpsc::channel(64);
            let visible: Vec<String> = {
                let state = self.medium.state.lock().unwrap();
                state
                    .advertising
                    .iter()
                    .filter(|n| self.medium.adjacent(&self.name, n))
                    .cloned()
                    .collect()
            };
            for n in visible {
                let _ = tx.try_send(NeighborId(n));
            }
            Ok(rx)
        }

        async fn connect(&self, neighbor: &NeighborId) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
            if !self.medium.adjacent(&self.name, &neighbor.0) {
                return Err(TransportError::Link {
                    neighbor: neighbor.clone(),
                    reason: "out of range".into(),
                });
            }
            let (tx, rx) = mpsc::channel(64);
            self.medium
                .state
                .lock()
                .unwrap()
                .subscribers
                .entry(neighbor.0.clone())
                .or_default()
                .push(tx);
            Ok(rx)
        }

        async fn write(&self, neighbor: &NeighborId, bytes: &[u8]) -> Result<(), TransportError> {
            self.transmissions.fetch_add(1, Ordering::SeqCst);
            let (tx, stalled) = {
                let state = self.medium.state.lock().unwrap();
                let stalled = state.stalled.contains(&(self.name.clone(), neighbor.0.clone()));
                (state.inbound.get(&neighbor.0).cloned(), stalled)
            };
            if stalled {
                std::future::pending::<()>().await;
            }
            if let Some(tx) = tx {
                let _ = tx
                    .send(Inbound {
                        from: NeighborId(self.name.clone()),
                        bytes: bytes.to_vec(),
                    })
                    .await;
            }
            Ok(())
        }

        async fn notify(&self, bytes: &[u8]) -> Result<(), TransportError> {
            self.transmissions.fetch_add(1, Ordering::SeqCst);
            let subs = self
                .medium
                .state
                .lock()
                .unwrap()
                .subscribers
                .get(&self.name)
                .cloned()
                .unwrap_or_default();
            for tx in subs {
                let _ = tx.send(bytes.to_vec()).await;
            }
            Ok(())
        }
    }

    async fn start_mesh(medium: &Arc<Medium>, names: &[&str], ttl: u8) -> Vec<Arc<MeshRelay>> {
        let mut relays = Vec::new();
        for name in names {
            let radio = SimRadio::new(name, medium);
            let relay = Arc::new(MeshRelay::new(*name, radio, config(ttl)));
            relay.connect().await;
            relays.push(relay);
        }
        // Let every node rescan after all are advertising.
        tokio::time::sleep(Duration::from_secs(25)).await;
        for relay in &relays {
            let mut state = relay.state();
            tokio::time::timeout(Duration::from_secs(60), state.wait_for(|s| *s == ChannelState::Connected))
                .await
                .expect("relay never linked")
                .unwrap();
        }
        relays
    }

    #[tokio::test(start_paused = true)]
    async fn flood_reaches_non_adjacent_node_exactly_once() {
        let medium = Medium::new(&[("a", "b"), ("b", "c")]);
        let relays = start_mesh(&medium, &["a", "b", "c"], DEFAULT_TTL).await;
        let mut at_b = relays[1].messages();
        let mut at_c = relays[2].messages();

        relays[0].send_message(join_from("a")).await;

        let got = tokio::time::timeout(Duration::from_secs(5), at_c.recv()).await.unwrap().unwrap();
        assert_eq!(got, join_from("a"));
        let got = tokio::time::timeout(Duration::from_secs(5), at_b.recv()).await.unwrap().unwrap();
        assert_eq!(got, join_from("a"));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(at_b.try_recv().is_err());
        assert!(at_c.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn flood_stops_when_ttl_is_spent() {
        let names = ["n0", "n1", "n2", "n3", "n4"];
        let medium = Medium::new(&[("n0", "n1"), ("n1", "n2"), ("n2", "n3"), ("n3", "n4")]);
        let relays = start_mesh(&medium, &names, 2).await;
        let mut inboxes: Vec<_> = relays.iter().map(|r| r.messages()).collect();

        relays[0].send_message(join_from("n0")).await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        // ttl 2: n1 gets ttl 2, n2 gets ttl 1, n3 gets ttl 0 and stops.
        for inbox in &mut inboxes[1..4] {
            assert_eq!(inbox.try_recv().unwrap(), join_from("n0"));
        }
        assert!(inboxes[4].try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn corrupt_datagram_does_not_stop_the_relay() {
        let medium = Medium::new(&[("a", "b")]);
        let relays = start_mesh(&medium, &["a", "b"], DEFAULT_TTL).await;
        let mut at_b = relays[1].messages();

        let tx = medium.state.lock().unwrap().inbound.get("b").cloned().unwrap();
        tx.send(Inbound {
            from: NeighborId("a".into()),
            bytes: vec![0xde, 0xad],
        })
        .await
        .unwrap();

        relays[0].send_message(join_from("a")).await;
        let got = tokio::time::timeout(Duration::from_secs(5), at_b.recv()).await.unwrap().unwrap();
        assert_eq!(got, join_from("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_stops_advertising_and_drops_sends() {
        let medium = Medium::new(&[("a", "b")]);
        let relays = start_mesh(&medium, &["a", "b"], DEFAULT_TTL).await;
        relays[0].disconnect().await;
        relays[0].disconnect().await;
        assert_eq!(*relays[0].state().borrow(), ChannelState::Disconnected);
        assert!(!medium.state.lock().unwrap().advertising.contains("a"));
        relays[0].send_message(join_from("a")).await;
    }

    #[tokio::test]
    async fn send_before_connect_is_dropped() {
        let medium = Medium::new(&[]);
        let radio = SimRadio::new("solo", &medium);
        let relay = MeshRelay::new("solo", radio.clone(), MeshConfig::default());
        relay.send_message(join_from("solo")).await;
        assert_eq!(radio.transmissions.load(Ordering::SeqCst), 0);
        assert_eq!(*relay.state().borrow(), ChannelState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_link_does_not_hold_up_the_others() {
        let medium = Medium::new(&[("a", "b"), ("a", "c")]);
        let relays = start_mesh(&medium, &["a", "b", "c"], DEFAULT_TTL).await;
        let mut at_c = relays[2].messages();
        medium
            .state
            .lock()
            .unwrap()
            .stalled
            .insert(("a".to_string(), "b".to_string()));

        let chat = SignalingMessage::new("a", Signal::Chat { text: "still here".into() });
        relays[0].send_message(join_from("a")).await;
        relays[0].send_message(chat.clone()).await;

        let got = tokio::time::timeout(Duration::from_secs(5), at_c.recv()).await.unwrap().unwrap();
        assert_eq!(got, join_from("a"));
        let got = tokio::time::timeout(Duration::from_secs(5), at_c.recv()).await.unwrap().unwrap();
        assert_eq!(got, chat);
    }
}
