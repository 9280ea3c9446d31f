//! LAN discovery: UDP multicast beacon, parse beacons/responses, report peers in our room.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use meshcall_core::wire::{decode_frame, encode_frame};
use meshcall_core::{DeviceId, Keypair, PublicKey, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);
const BEACON_INTERVAL: Duration = Duration::from_secs(4);
const PEER_TIMEOUT: Duration = Duration::from_secs(16);

/// What a node announces on the discovery group.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum Announcement {
    Beacon(Presence),
    Response(Presence),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Presence {
    protocol_version: u8,
    room: String,
    device_id: DeviceId,
    public_key: PublicKey,
    listen_port: u16,
}

/// A peer in our room, reachable for a LAN link at `addr`. Reported on every beacon; the link
/// layer skips peers it is already linked to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovered {
    pub device_id: DeviceId,
    pub addr: SocketAddr,
}

struct PeerState {
    last_seen: Instant,
}

pub async fn run_discovery(
    keypair: Arc<Keypair>,
    room: String,
    discovery_port: u16,
    transport_port: u16,
    found_tx: mpsc::UnboundedSender<Discovered>,
) -> std::io::Result<()> {
    let socket = Arc::new(make_multicast_socket(discovery_port)?);
    let peers: Arc<Mutex<HashMap<DeviceId, PeerState>>> = Arc::new(Mutex::new(HashMap::new()));
    let presence = Presence {
        protocol_version: PROTOCOL_VERSION,
        room,
        device_id: keypair.device_id(),
        public_key: keypair.public_key().clone(),
        listen_port: transport_port,
    };

    let beacon_task = tokio::spawn(beacon_loop(socket.clone(), presence.clone(), discovery_port));
    let recv_task = tokio::spawn(recv_loop(socket, peers.clone(), presence, found_tx));
    let timeout_task = tokio::spawn(peer_timeout_loop(peers));

    let _ = tokio::try_join!(beacon_task, recv_task, timeout_task);
    Ok(())
}

fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

async fn beacon_loop(socket: Arc<UdpSocket>, presence: Presence, discovery_port: u16) -> std::io::Result<()> {
    let frame = encode_frame(&Announcement::Beacon(presence))
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let dest = SocketAddrV4::new(MULTICAST_GROUP, discovery_port);
    loop {
        if let Err(e) = socket.send_to(&frame, dest).await {
            debug!(error = %e, "beacon send failed");
        }
        tokio::time::sleep(BEACON_INTERVAL).await;
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    peers: Arc<Mutex<HashMap<DeviceId, PeerState>>>,
    presence: Presence,
    found_tx: mpsc::UnboundedSender<Discovered>,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; 65536];
    let response_frame = encode_frame(&Announcement::Response(presence.clone()))
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        let Ok((msg, _)) = decode_frame::<Announcement>(&buf[..n]) else {
            continue;
        };
        let (peer, is_beacon) = match msg {
            Announcement::Beacon(p) => (p, true),
            Announcement::Response(p) => (p, false),
        };
        if !accepts(&presence, &peer) {
            continue;
        }
        let is_new = peers
            .lock()
            .await
            .insert(
                peer.device_id,
                PeerState {
                    last_seen: Instant::now(),
                },
            )
            .is_none();
        if is_new {
            info!(peer = %peer.device_id, %from, "lan peer discovered");
        }
        let addr = SocketAddr::new(from.ip(), peer.listen_port);
        if found_tx
            .send(Discovered {
                device_id: peer.device_id,
                addr,
            })
            .is_err()
        {
            return Ok(());
        }
        if is_beacon {
            let _ = socket.send_to(&response_frame, from).await;
        }
    }
}

/// Same protocol, same room, not ourselves.
fn accepts(own: &Presence, peer: &Presence) -> bool {
    peer.protocol_version == PROTOCOL_VERSION && peer.device_id != own.device_id && peer.room == own.room
}

async fn peer_timeout_loop(peers: Arc<Mutex<HashMap<DeviceId, PeerState>>>) -> std::io::Result<()> {
    loop {
        tokio::time::sleep(BEACON_INTERVAL).await;
        let now = Instant::now();
        let mut p = peers.lock().await;
        p.retain(|id, s| {
            let alive = now.duration_since(s.last_seen) < PEER_TIMEOUT;
            if !alive {
                info!(peer = %id, "lan peer timed out");
            }
            alive
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presence(kp: &Keypair, room: &str) -> Presence {
        Presence {
            protocol_version: PROTOCOL_VERSION,
            room: room.to_string(),
            device_id: kp.device_id(),
            public_key: kp.public_key().clone(),
            listen_port: 45681,
        }
    }

    #[test]
    fn only_same_room_peers_are_accepted() {
        let me = Keypair::generate();
        let other = Keypair::generate();
        let own = presence(&me, "lobby");
        assert!(accepts(&own, &presence(&other, "lobby")));
        assert!(!accepts(&own, &presence(&other, "attic")));
        assert!(!accepts(&own, &presence(&me, "lobby")));
        let mut old = presence(&other, "lobby");
        old.protocol_version = PROTOCOL_VERSION + 1;
        assert!(!accepts(&own, &old));
    }

    #[test]
    fn announcement_frames_decode() {
        let kp = Keypair::generate();
        let frame = encode_frame(&Announcement::Response(presence(&kp, "lobby"))).unwrap();
        let (msg, used) = decode_frame::<Announcement>(&frame).unwrap();
        assert_eq!(used, frame.len());
        match msg {
            Announcement::Response(p) => {
                assert_eq!(p.device_id, kp.device_id());
                assert_eq!(p.room, "lobby");
            }
            Announcement::Beacon(_) => panic!("wrong variant"),
        }
    }
}
