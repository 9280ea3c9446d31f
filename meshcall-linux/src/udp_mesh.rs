//! UDP stand-in for the short-range radio under the mesh relay.
//!
//! Advertisements go to a multicast group on the beacon port; a neighbor is named by the
//! address of its data socket. Linking to a neighbor subscribes to its notifications; a
//! neighbor that stops advertising has its link closed.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use meshcall_core::wire::{decode_frame, encode_frame};
use meshcall_core::{Inbound, NeighborId, PacketTransport, TransportError};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const MESH_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 62);
const ADVERT_INTERVAL: Duration = Duration::from_secs(2);
const SCAN_WINDOW: Duration = Duration::from_secs(5);
const NEIGHBOR_TIMEOUT: Duration = Duration::from_secs(15);
const STREAM_BUFFER: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Advert {
    service_id: String,
    node: String,
    data_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Datagram {
    Subscribe,
    Write(Vec<u8>),
    Notify(Vec<u8>),
}

#[derive(Default)]
struct Tables {
    /// Neighbors we linked to: their notifications go here.
    links: HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>,
    /// Neighbors linked to us: our notifications go to them.
    subscribers: HashSet<SocketAddr>,
    /// Last advertisement heard per neighbor data address.
    heard: HashMap<SocketAddr, Instant>,
    listener: Option<mpsc::Sender<Inbound>>,
}

pub struct UdpPacketTransport {
    node: String,
    data: Arc<UdpSocket>,
    beacon: Option<Arc<UdpSocket>>,
    beacon_port: u16,
    tables: Arc<Mutex<Tables>>,
    adverts: broadcast::Sender<(Advert, SocketAddr)>,
    advertiser: Mutex<Option<JoinHandle<()>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl UdpPacketTransport {
    /// Bind the data port and join the advertisement group. `node` must be unique per process
    /// (the sender id is used); it filters out our own adverts.
    pub fn bind(node: impl Into<String>, mesh_port: u16, beacon_port: u16) -> std::io::Result<Self> {
        let data = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, mesh_port))?;
        data.set_nonblocking(true)?;
        let beacon = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, beacon_port))?;
        beacon.join_multicast_v4(&MESH_GROUP, &Ipv4Addr::UNSPECIFIED)?;
        beacon.set_multicast_ttl_v4(1)?;
        beacon.set_nonblocking(true)?;
        Ok(Self::from_sockets(
            node.into(),
            UdpSocket::from_std(data)?,
            Some(UdpSocket::from_std(beacon)?),
            beacon_port,
        ))
    }

    fn from_sockets(node: String, data: UdpSocket, beacon: Option<UdpSocket>, beacon_port: u16) -> Self {
        let data = Arc::new(data);
        let beacon = beacon.map(Arc::new);
        let tables = Arc::new(Mutex::new(Tables::default()));
        let (adverts, _) = broadcast::channel(STREAM_BUFFER);
        let mut tasks = vec![
            tokio::spawn(data_loop(data.clone(), tables.clone())),
            tokio::spawn(prune_loop(tables.clone())),
        ];
        if let Some(beacon) = &beacon {
            tasks.push(tokio::spawn(advert_loop(
                beacon.clone(),
                node.clone(),
                tables.clone(),
                adverts.clone(),
            )));
        }
        Self {
            node,
            data,
            beacon,
            beacon_port,
            tables,
            adverts,
            advertiser: Mutex::new(None),
            tasks,
        }
    }

    async fn send(&self, to: SocketAddr, datagram: &Datagram) -> Result<(), TransportError> {
        let frame = encode_frame(datagram).map_err(|e| TransportError::Link {
            neighbor: NeighborId(to.to_string()),
            reason: e.to_string(),
        })?;
        self.data.send_to(&frame, to).await?;
        Ok(())
    }
}

fn neighbor_addr(neighbor: &NeighborId) -> Result<SocketAddr, TransportError> {
    neighbor.0.parse().map_err(|_| TransportError::Link {
        neighbor: neighbor.clone(),
        reason: "not a socket address".into(),
    })
}

#[async_trait]
impl PacketTransport for UdpPacketTransport {
    async fn advertise(&self, service_id: &str) -> Result<(), TransportError> {
        let Some(beacon) = &self.beacon else {
            return Err(TransportError::Unavailable("no advertisement socket".into()));
        };
        let Ok(mut advertiser) = self.advertiser.lock() else {
            return Err(TransportError::Unavailable("advertiser poisoned".into()));
        };
        if advertiser.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }
        let advert = Advert {
            service_id: service_id.to_string(),
            node: self.node.clone(),
            data_port: self.data.local_addr()?.port(),
        };
        let frame = encode_frame(&advert).map_err(|e| TransportError::Unavailable(e.to_string()))?;
        let dest = SocketAddrV4::new(MESH_GROUP, self.beacon_port);
        let beacon = beacon.clone();
        *advertiser = Some(tokio::spawn(async move {
            loop {
                if let Err(e) = beacon.send_to(&frame, dest).await {
                    debug!(error = %e, "mesh advert send failed");
                }
                tokio::time::sleep(ADVERT_INTERVAL).await;
            }
        }));
        Ok(())
    }

    async fn stop_advertising(&self) {
        if let Ok(mut advertiser) = self.advertiser.lock() {
            if let Some(task) = advertiser.take() {
                task.abort();
            }
        }
    }

    async fn listen(&self) -> Result<mpsc::Receiver<Inbound>, TransportError> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        if let Ok(mut tables) = self.tables.lock() {
            tables.listener = Some(tx);
        }
        Ok(rx)
    }

    async fn scan(&self, service_id: &str) -> Result<mpsc::Receiver<NeighborId>, TransportError> {
        if self.beacon.is_none() {
            return Err(TransportError::Unavailable("no advertisement socket".into()));
        }
        let mut adverts = self.adverts.subscribe();
        let service_id = service_id.to_string();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            let deadline = Instant::now() + SCAN_WINDOW;
            let mut reported = HashSet::new();
            loop {
                let advert = tokio::select! {
                    a = adverts.recv() => a,
                    _ = tokio::time::sleep_until(deadline) => break,
                };
                match advert {
                    Ok((advert, addr)) if advert.service_id == service_id => {
                        if reported.insert(addr) && tx.send(NeighborId(addr.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }

    async fn connect(&self, neighbor: &NeighborId) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        let addr = neighbor_addr(neighbor)?;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        if let Ok(mut tables) = self.tables.lock() {
            tables.links.insert(addr, tx);
            tables.heard.entry(addr).or_insert_with(Instant::now);
        }
        self.send(addr, &Datagram::Subscribe).await?;
        Ok(rx)
    }

    async fn write(&self, neighbor: &NeighborId, bytes: &[u8]) -> Result<(), TransportError> {
        let addr = neighbor_addr(neighbor)?;
        self.send(addr, &Datagram::Write(bytes.to_vec())).await
    }

    async fn notify(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let subscribers: Vec<SocketAddr> = match self.tables.lock() {
            Ok(tables) => tables.subscribers.iter().copied().collect(),
            Err(_) => return Ok(()),
        };
        let datagram = Datagram::Notify(bytes.to_vec());
        for addr in subscribers {
            if let Err(e) = self.send(addr, &datagram).await {
                debug!(%addr, error = %e, "mesh notify failed");
            }
        }
        Ok(())
    }
}

impl Drop for UdpPacketTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        if let Ok(mut advertiser) = self.advertiser.lock() {
            if let Some(task) = advertiser.take() {
                task.abort();
            }
        }
    }
}

async fn data_loop(socket: Arc<UdpSocket>, tables: Arc<Mutex<Tables>>) {
    let mut buf = vec![0u8; 65536];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "mesh data socket failed");
                return;
            }
        };
        let Ok((datagram, _)) = decode_frame::<Datagram>(&buf[..n]) else {
            debug!(%from, "undecodable mesh datagram");
            continue;
        };
        let target = {
            let Ok(mut guard) = tables.lock() else {
                return;
            };
            match datagram {
                Datagram::Subscribe => {
                    if guard.subscribers.insert(from) {
                        debug!(%from, "mesh neighbor subscribed");
                    }
                    guard.heard.insert(from, Instant::now());
                    None
                }
                Datagram::Write(bytes) => guard.listener.clone().map(|tx| {
                    Delivery::Inbound(
                        tx,
                        Inbound {
                            from: NeighborId(from.to_string()),
                            bytes,
                        },
                    )
                }),
                Datagram::Notify(bytes) => guard.links.get(&from).cloned().map(|tx| Delivery::Notification(tx, bytes)),
            }
        };
        match target {
            Some(Delivery::Inbound(tx, inbound)) => {
                let _ = tx.send(inbound).await;
            }
            Some(Delivery::Notification(tx, bytes)) => {
                let _ = tx.send(bytes).await;
            }
            None => {}
        }
    }
}

enum Delivery {
    Inbound(mpsc::Sender<Inbound>, Inbound),
    Notification(mpsc::Sender<Vec<u8>>, Vec<u8>),
}

async fn advert_loop(
    socket: Arc<UdpSocket>,
    node: String,
    tables: Arc<Mutex<Tables>>,
    adverts: broadcast::Sender<(Advert, SocketAddr)>,
) {
    let mut buf = vec![0u8; 2048];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "mesh advert socket failed");
                return;
            }
        };
        let Some((advert, addr)) = parse_advert(&buf[..n], from, &node) else {
            continue;
        };
        if let Ok(mut tables) = tables.lock() {
            tables.heard.insert(addr, Instant::now());
        }
        let _ = adverts.send((advert, addr));
    }
}

/// Decode an advert from `from` into the neighbor's data address. Our own adverts are None.
fn parse_advert(bytes: &[u8], from: SocketAddr, node: &str) -> Option<(Advert, SocketAddr)> {
    let (advert, _) = decode_frame::<Advert>(bytes).ok()?;
    if advert.node == node {
        return None;
    }
    let addr = SocketAddr::new(from.ip(), advert.data_port);
    Some((advert, addr))
}

/// Close links and drop subscribers that went quiet.
async fn prune_loop(tables: Arc<Mutex<Tables>>) {
    loop {
        tokio::time::sleep(NEIGHBOR_TIMEOUT / 3).await;
        let now = Instant::now();
        let Ok(mut guard) = tables.lock() else {
            return;
        };
        let stale: Vec<SocketAddr> = guard
            .heard
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) >= NEIGHBOR_TIMEOUT)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in stale {
            guard.heard.remove(&addr);
            guard.subscribers.remove(&addr);
            if guard.links.remove(&addr).is_some() {
                debug!(%addr, "mesh neighbor went quiet, link closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn local(node: &str) -> (UdpPacketTransport, NeighborId) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let id = NeighborId(socket.local_addr().unwrap().to_string());
        (UdpPacketTransport::from_sockets(node.to_string(), socket, None, 0), id)
    }

    async fn recv<T>(rx: &mut mpsc::Receiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn writes_reach_the_listener_and_notifications_reach_linked_neighbors() {
        let (a, _a_id) = local("a").await;
        let (b, b_id) = local("b").await;
        let mut b_inbound = b.listen().await.unwrap();
        let mut from_b = a.connect(&b_id).await.unwrap();

        a.write(&b_id, b"hello").await.unwrap();
        let got = recv(&mut b_inbound).await;
        assert_eq!(got.bytes, b"hello");

        // The Subscribe datagram was sent before the write, so b knows a by now.
        b.notify(b"to everyone").await.unwrap();
        assert_eq!(recv(&mut from_b).await, b"to everyone");
    }

    #[tokio::test]
    async fn bad_neighbor_names_and_missing_radio_are_errors() {
        let (a, _) = local("a").await;
        let bogus = NeighborId("nowhere".into());
        assert!(matches!(a.write(&bogus, b"x").await, Err(TransportError::Link { .. })));
        assert!(matches!(a.advertise("meshcall").await, Err(TransportError::Unavailable(_))));
        assert!(a.scan("meshcall").await.is_err());
        a.notify(b"nobody listening").await.unwrap();
    }

    #[test]
    fn own_adverts_are_filtered() {
        let frame = encode_frame(&Advert {
            service_id: "meshcall".into(),
            node: "me".into(),
            data_port: 4000,
        })
        .unwrap();
        let from: SocketAddr = "192.168.1.7:45683".parse().unwrap();
        assert!(parse_advert(&frame, from, "me").is_none());
        let (advert, addr) = parse_advert(&frame, from, "other").unwrap();
        assert_eq!(advert.service_id, "meshcall");
        assert_eq!(addr, "192.168.1.7:4000".parse::<SocketAddr>().unwrap());
        assert!(parse_advert(b"junk", from, "other").is_none());
    }
}
