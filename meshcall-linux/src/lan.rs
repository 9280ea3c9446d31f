//! LAN channel: TCP links to discovered peers, key-exchange handshake, encrypted frames.
//! Every linked peer in the room receives every message.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use meshcall_core::identity::{decrypt_wire, derive_session_key, encrypt_wire};
use meshcall_core::wire::{decode_frame, encode_frame, LEN_SIZE, MAX_FRAME_LEN};
use meshcall_core::{Channel, ChannelEvents, ChannelState, DeviceId, Keypair, PublicKey, SignalingMessage, PROTOCOL_VERSION};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::discovery::{self, Discovered};

const HANDSHAKE_SIZE: usize = 1 + 16 + 32; // version + device_id + public_key
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Linked peers and their outbound frame queues.
#[derive(Default)]
struct Links {
    peers: HashMap<DeviceId, mpsc::UnboundedSender<Vec<u8>>>,
    dialing: HashSet<DeviceId>,
}

struct Shared {
    keypair: Arc<Keypair>,
    events: ChannelEvents,
    links: Mutex<Links>,
}

impl Shared {
    fn refresh_state(&self) {
        let linked = self.links.lock().map(|l| !l.peers.is_empty()).unwrap_or(false);
        let next = if linked {
            ChannelState::Connected
        } else {
            ChannelState::Connecting
        };
        if self.events.set_state(next) {
            info!(state = ?next, "lan channel");
        }
    }
}

struct Running {
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct LanChannel {
    shared: Arc<Shared>,
    room: String,
    discovery_port: u16,
    transport_port: u16,
    running: Mutex<Option<Running>>,
}

impl LanChannel {
    pub fn new(keypair: Arc<Keypair>, room: impl Into<String>, discovery_port: u16, transport_port: u16) -> Self {
        Self {
            shared: Arc::new(Shared {
                keypair,
                events: ChannelEvents::new(),
                links: Mutex::new(Links::default()),
            }),
            room: room.into(),
            discovery_port,
            transport_port,
            running: Mutex::new(None),
        }
    }

    /// Accept on `listener` and dial what arrives on `found_rx`.
    fn run_links(&self, listener: TcpListener, found_rx: mpsc::UnboundedReceiver<Discovered>, mut tasks: Vec<JoinHandle<()>>) {
        let (stop, stop_rx) = watch::channel(false);
        tasks.push(tokio::spawn(accept_loop(listener, self.shared.clone(), stop_rx.clone())));
        tasks.push(tokio::spawn(dial_loop(found_rx, self.shared.clone(), stop_rx)));
        if let Ok(mut running) = self.running.lock() {
            *running = Some(Running { stop, tasks });
        }
    }

    fn is_running(&self) -> bool {
        self.running.lock().map(|r| r.is_some()).unwrap_or(false)
    }
}

#[async_trait]
impl Channel for LanChannel {
    async fn connect(&self) {
        if self.is_running() {
            return;
        }
        self.shared.events.set_state(ChannelState::Connecting);
        let listener = match TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.transport_port)).await {
            Ok(l) => l,
            Err(e) => {
                warn!(port = self.transport_port, error = %e, "lan listen failed");
                self.shared.events.set_state(ChannelState::Error);
                return;
            }
        };
        let (found_tx, found_rx) = mpsc::unbounded_channel();
        let keypair = self.shared.keypair.clone();
        let room = self.room.clone();
        let (discovery_port, transport_port) = (self.discovery_port, self.transport_port);
        let events = self.shared.events.clone();
        let discovery = tokio::spawn(async move {
            if let Err(e) = discovery::run_discovery(keypair, room, discovery_port, transport_port, found_tx).await {
                warn!(error = %e, "lan discovery stopped");
                events.set_state(ChannelState::Error);
            }
        });
        info!(port = self.transport_port, room = %self.room, "lan channel listening");
        self.run_links(listener, found_rx, vec![discovery]);
    }

    async fn disconnect(&self) {
        let running = self.running.lock().ok().and_then(|mut r| r.take());
        let Some(running) = running else {
            return;
        };
        let _ = running.stop.send(true);
        for task in running.tasks {
            task.abort();
        }
        if let Ok(mut links) = self.shared.links.lock() {
            links.peers.clear();
            links.dialing.clear();
        }
        self.shared.events.set_state(ChannelState::Disconnected);
    }

    fn state(&self) -> watch::Receiver<ChannelState> {
        self.shared.events.subscribe_state()
    }

    fn messages(&self) -> broadcast::Receiver<SignalingMessage> {
        self.shared.events.subscribe()
    }

    async fn send_message(&self, msg: SignalingMessage) {
        let frame = match encode_frame(&msg) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "cannot encode lan message");
                return;
            }
        };
        let Ok(links) = self.shared.links.lock() else {
            return;
        };
        if links.peers.is_empty() {
            debug!(kind = %msg.kind(), "no lan peers, dropping");
            return;
        }
        for tx in links.peers.values() {
            let _ = tx.send(frame.clone());
        }
    }
}

impl Drop for LanChannel {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            if let Some(running) = running.take() {
                for task in running.tasks {
                    task.abort();
                }
            }
        }
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, stop: watch::Receiver<bool>) {
    loop {
        let (mut stream, from) = match listener.accept().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "lan accept failed");
                break;
            }
        };
        let shared = shared.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake_accept(&mut stream, &shared.keypair)).await {
                Ok(Ok((peer_id, session_key))) => {
                    run_connection(stream, peer_id, session_key, false, shared, stop).await;
                }
                Ok(Err(e)) => debug!(%from, error = %e, "lan handshake rejected"),
                Err(_) => debug!(%from, "lan handshake timed out"),
            }
        });
    }
}

/// The lower device id dials, so each pair ends up with one link.
async fn dial_loop(mut found_rx: mpsc::UnboundedReceiver<Discovered>, shared: Arc<Shared>, stop: watch::Receiver<bool>) {
    let own = shared.keypair.device_id();
    while let Some(peer) = found_rx.recv().await {
        if own >= peer.device_id {
            continue;
        }
        let claimed = shared
            .links
            .lock()
            .map(|mut l| !l.peers.contains_key(&peer.device_id) && l.dialing.insert(peer.device_id))
            .unwrap_or(false);
        if !claimed {
            continue;
        }
        let shared = shared.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            let linked = dial(peer.addr, &shared.keypair).await;
            if let Ok(mut l) = shared.links.lock() {
                l.dialing.remove(&peer.device_id);
            }
            match linked {
                Ok((stream, peer_id, session_key)) => {
                    run_connection(stream, peer_id, session_key, true, shared, stop).await;
                }
                Err(e) => debug!(peer = %peer.device_id, addr = %peer.addr, error = %e, "lan dial failed"),
            }
        });
    }
}

async fn dial(addr: SocketAddr, keypair: &Keypair) -> std::io::Result<(TcpStream, DeviceId, [u8; 32])> {
    let mut stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;
    let (peer_id, session_key) = tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake_connect(&mut stream, keypair))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "handshake timed out"))??;
    Ok((stream, peer_id, session_key))
}

async fn handshake_accept(stream: &mut TcpStream, keypair: &Keypair) -> std::io::Result<(DeviceId, [u8; 32])> {
    let mut buf = [0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut buf).await?;
    let peer = parse_handshake(&buf, keypair)?;
    stream.write_all(&handshake_bytes(keypair)).await?;
    stream.flush().await?;
    Ok(peer)
}

async fn handshake_connect(stream: &mut TcpStream, keypair: &Keypair) -> std::io::Result<(DeviceId, [u8; 32])> {
    stream.write_all(&handshake_bytes(keypair)).await?;
    stream.flush().await?;
    let mut buf = [0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut buf).await?;
    parse_handshake(&buf, keypair)
}

fn handshake_bytes(keypair: &Keypair) -> [u8; HANDSHAKE_SIZE] {
    let mut out = [0u8; HANDSHAKE_SIZE];
    out[0] = PROTOCOL_VERSION;
    out[1..17].copy_from_slice(keypair.device_id().as_bytes());
    out[17..49].copy_from_slice(keypair.public_key().as_bytes());
    out
}

/// Check version and that the claimed device id matches the key, then derive the link key.
fn parse_handshake(buf: &[u8; HANDSHAKE_SIZE], keypair: &Keypair) -> std::io::Result<(DeviceId, [u8; 32])> {
    if buf[0] != PROTOCOL_VERSION {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "unsupported protocol version",
        ));
    }
    let mut device_id = [0u8; 16];
    device_id.copy_from_slice(&buf[1..17]);
    let mut public_key = [0u8; 32];
    public_key.copy_from_slice(&buf[17..49]);
    let peer_id = DeviceId::from_bytes(device_id);
    if peer_id != DeviceId::from_public_key(&public_key) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "device id does not match public key",
        ));
    }
    if peer_id == keypair.device_id() {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "connected to self"));
    }
    let secret = keypair.shared_secret(&PublicKey::from_bytes(public_key));
    Ok((peer_id, derive_session_key(&secret)))
}

/// (write, read) nonce starts. Both directions share one key: the dialer writes even nonces,
/// the acceptor odd ones.
fn nonce_start(dialer: bool) -> (u64, u64) {
    if dialer {
        (0, 1)
    } else {
        (1, 0)
    }
}

async fn run_connection(
    stream: TcpStream,
    peer_id: DeviceId,
    session_key: [u8; 32],
    dialer: bool,
    shared: Arc<Shared>,
    mut stop: watch::Receiver<bool>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let duplicate = match shared.links.lock() {
        Ok(mut links) if !links.peers.contains_key(&peer_id) => {
            links.peers.insert(peer_id, tx.clone());
            false
        }
        _ => true,
    };
    if duplicate {
        debug!(peer = %peer_id, "already linked, dropping connection");
        return;
    }
    info!(peer = %peer_id, dialer, "lan link up");
    shared.refresh_state();

    let (write_start, read_start) = nonce_start(dialer);
    let (mut reader, mut writer) = stream.into_split();
    let writer_task = tokio::spawn(async move {
        let mut write_nonce = write_start;
        while let Some(plain) = rx.recv().await {
            let cipher = match encrypt_wire(&session_key, write_nonce, &plain) {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "lan encrypt failed");
                    break;
                }
            };
            write_nonce = write_nonce.saturating_add(2);
            let len = cipher.len() as u32;
            if writer.write_all(&len.to_le_bytes()).await.is_err()
                || writer.write_all(&cipher).await.is_err()
                || writer.flush().await.is_err()
            {
                break;
            }
        }
    });

    let mut read_nonce = read_start;
    loop {
        let mut len_buf = [0u8; LEN_SIZE];
        tokio::select! {
            read = reader.read_exact(&mut len_buf) => {
                if read.is_err() {
                    break;
                }
            }
            _ = stop.changed() => break,
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN as usize {
            warn!(peer = %peer_id, len, "oversized lan frame");
            break;
        }
        let mut cipher = vec![0u8; len];
        if reader.read_exact(&mut cipher).await.is_err() {
            break;
        }
        let plain = match decrypt_wire(&session_key, read_nonce, &cipher) {
            Ok(p) => p,
            Err(e) => {
                warn!(peer = %peer_id, error = %e, "lan frame rejected");
                break;
            }
        };
        read_nonce = read_nonce.saturating_add(2);
        match decode_frame::<SignalingMessage>(&plain) {
            Ok((msg, _)) => shared.events.deliver(msg),
            Err(e) => debug!(peer = %peer_id, error = %e, "undecodable lan message"),
        }
    }

    writer_task.abort();
    if let Ok(mut links) = shared.links.lock() {
        if links.peers.get(&peer_id).is_some_and(|t| t.same_channel(&tx)) {
            links.peers.remove(&peer_id);
        }
    }
    info!(peer = %peer_id, "lan link down");
    if !*stop.borrow() {
        shared.refresh_state();
    }
}
