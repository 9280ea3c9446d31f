//! Probe media engine: negotiates with synthetic SDP and no capture devices. Lets the daemon
//! exercise signaling end to end; it reports Connected once both descriptions are in place.

use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use meshcall_core::{EngineState, IceCandidate, MediaEngine, MediaError, SdpKind};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

const CANDIDATE_BUFFER: usize = 32;
const PROBE_PORT: u16 = 9;

#[derive(Default)]
struct Session {
    video: bool,
    id: u64,
    /// Bumped on every description we generate.
    version: u64,
    /// Bumped on ICE restart.
    ice_generation: u32,
    local: Option<SdpKind>,
    remote: Option<SdpKind>,
    remote_candidates: usize,
    bitrate_kbps: Option<u32>,
}

pub struct ProbeEngine {
    host: IpAddr,
    session: Mutex<Option<Session>>,
    state: watch::Sender<EngineState>,
    candidates: broadcast::Sender<IceCandidate>,
}

impl ProbeEngine {
    /// `host` is the address advertised in the single host candidate.
    pub fn new(host: IpAddr) -> Self {
        let (state, _) = watch::channel(EngineState::Idle);
        let (candidates, _) = broadcast::channel(CANDIDATE_BUFFER);
        Self {
            host,
            session: Mutex::new(None),
            state,
            candidates,
        }
    }

    pub fn remote_candidates(&self) -> usize {
        self.with_session(|s| Ok(s.remote_candidates)).unwrap_or(0)
    }

    pub fn bitrate_ceiling(&self) -> Option<u32> {
        self.with_session(|s| Ok(s.bitrate_kbps)).ok().flatten()
    }

    fn with_session<T>(&self, f: impl FnOnce(&mut Session) -> Result<T, MediaError>) -> Result<T, MediaError> {
        let mut guard = self.session.lock().map_err(|_| MediaError::Closed)?;
        match guard.as_mut() {
            Some(session) => f(session),
            None => Err(MediaError::NoSession),
        }
    }

    fn set_state(&self, next: EngineState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            info!(state = ?next, "probe engine");
        }
    }

    /// Connected once a local and a remote description pair up.
    fn settle(&self, paired: bool) {
        self.set_state(if paired {
            EngineState::Connected
        } else {
            EngineState::Connecting
        });
    }

    fn describe(&self, kind: SdpKind) -> Result<String, MediaError> {
        let (sdp, paired) = self.with_session(|s| {
            if kind == SdpKind::Answer && s.remote != Some(SdpKind::Offer) {
                return Err(MediaError::Negotiation("no remote offer to answer".into()));
            }
            s.version += 1;
            s.local = Some(kind);
            if kind == SdpKind::Offer {
                s.remote = None;
            }
            Ok((render_sdp(s, kind), s.remote.is_some()))
        })?;
        let _ = self.candidates.send(self.host_candidate());
        self.settle(paired);
        Ok(sdp)
    }

    fn host_candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:1 1 udp 2122260223 {} {} typ host", self.host, PROBE_PORT),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }
}

fn session_id() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(1)
}

fn render_sdp(s: &Session, kind: SdpKind) -> String {
    let setup = match kind {
        SdpKind::Offer => "actpass",
        SdpKind::Answer => "active",
    };
    let ufrag = format!("{:08x}", (s.id as u32).wrapping_add(s.ice_generation));
    let pwd = format!("{:016x}{:08x}", s.id, s.ice_generation);
    let mut media = vec![(
        "audio",
        "111 0 8",
        vec!["111 opus/48000/2", "0 PCMU/8000", "8 PCMA/8000"],
    )];
    if s.video {
        media.push(("video", "96 97 102", vec!["96 VP8/90000", "97 rtx/90000", "102 H264/90000"]));
    }
    let mids: Vec<String> = (0..media.len()).map(|i| i.to_string()).collect();
    let mut out = format!(
        "v=0\r\no=- {} {} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=group:BUNDLE {}\r\n",
        s.id,
        s.version,
        mids.join(" ")
    );
    for (mid, (name, payloads, rtpmaps)) in media.into_iter().enumerate() {
        out.push_str(&format!("m={name} 9 UDP/TLS/RTP/SAVPF {payloads}\r\n"));
        out.push_str("c=IN IP4 0.0.0.0\r\n");
        out.push_str(&format!("a=mid:{mid}\r\n"));
        out.push_str(&format!("a=ice-ufrag:{ufrag}\r\na=ice-pwd:{pwd}\r\n"));
        out.push_str(&format!("a=fingerprint:sha-256 {}\r\n", fingerprint(s.id)));
        out.push_str(&format!("a=setup:{setup}\r\na=sendrecv\r\na=rtcp-mux\r\n"));
        for rtpmap in rtpmaps {
            out.push_str(&format!("a=rtpmap:{rtpmap}\r\n"));
        }
    }
    out
}

fn fingerprint(id: u64) -> String {
    id.to_be_bytes()
        .iter()
        .chain(id.to_le_bytes().iter())
        .cycle()
        .take(32)
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[async_trait]
impl MediaEngine for ProbeEngine {
    async fn initialize(&self, video: bool) -> Result<(), MediaError> {
        let mut guard = self.session.lock().map_err(|_| MediaError::Closed)?;
        match guard.as_mut() {
            Some(s) if s.video == video => return Ok(()),
            Some(s) => {
                debug!(video, "probe engine switching mode");
                s.video = video;
                return Ok(());
            }
            None => {
                *guard = Some(Session {
                    video,
                    id: session_id(),
                    ..Session::default()
                });
            }
        }
        drop(guard);
        self.set_state(EngineState::Ready);
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, MediaError> {
        self.describe(SdpKind::Offer)
    }

    async fn create_answer(&self) -> Result<String, MediaError> {
        self.describe(SdpKind::Answer)
    }

    async fn set_remote_description(&self, sdp: &str, kind: SdpKind) -> Result<(), MediaError> {
        if !sdp.starts_with("v=0") {
            return Err(MediaError::Negotiation(format!("malformed remote {kind}")));
        }
        let paired = self.with_session(|s| {
            if kind == SdpKind::Answer && s.local != Some(SdpKind::Offer) {
                return Err(MediaError::Negotiation("answer without a local offer".into()));
            }
            s.remote = Some(kind);
            Ok(kind == SdpKind::Answer)
        })?;
        self.settle(paired);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError> {
        self.with_session(|s| {
            s.remote_candidates += 1;
            Ok(())
        })?;
        debug!(candidate = %candidate.candidate, "probe engine got candidate");
        Ok(())
    }

    fn connection_state(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    fn local_candidates(&self) -> broadcast::Receiver<IceCandidate> {
        self.candidates.subscribe()
    }

    async fn close(&self) {
        if let Ok(mut guard) = self.session.lock() {
            *guard = None;
        }
        self.set_state(EngineState::Closed);
    }

    fn has_session(&self) -> bool {
        self.session.lock().map(|s| s.is_some()).unwrap_or(false)
    }

    async fn restart_ice(&self) -> Result<String, MediaError> {
        self.with_session(|s| {
            s.ice_generation += 1;
            Ok(())
        })?;
        self.describe(SdpKind::Offer)
    }

    async fn set_bitrate_ceiling(&self, kbps: u32) {
        if self
            .with_session(|s| {
                s.bitrate_kbps = Some(kbps);
                Ok(())
            })
            .is_ok()
        {
            info!(kbps, "probe engine bitrate ceiling");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshcall_core::CompactCodec;
    use std::net::Ipv4Addr;

    fn engine() -> ProbeEngine {
        ProbeEngine::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    #[tokio::test]
    async fn offer_answer_connects_both_sides() {
        let host = engine();
        let joiner = engine();
        let mut host_candidates = host.local_candidates();
        assert!(matches!(host.create_offer().await, Err(MediaError::NoSession)));

        host.initialize(true).await.unwrap();
        joiner.initialize(true).await.unwrap();
        assert_eq!(*host.connection_state().borrow(), EngineState::Ready);

        let offer = host.create_offer().await.unwrap();
        assert!(offer.contains("m=video 9 UDP/TLS/RTP/SAVPF 96 97 102"));
        assert_eq!(*host.connection_state().borrow(), EngineState::Connecting);
        let candidate = host_candidates.recv().await.unwrap();
        assert!(candidate.candidate.contains("127.0.0.1 9 typ host"));

        assert!(joiner.create_answer().await.is_err());
        joiner.set_remote_description(&offer, SdpKind::Offer).await.unwrap();
        joiner.add_ice_candidate(&candidate).await.unwrap();
        let answer = joiner.create_answer().await.unwrap();
        assert_eq!(*joiner.connection_state().borrow(), EngineState::Connected);
        assert_eq!(joiner.remote_candidates(), 1);

        host.set_remote_description(&answer, SdpKind::Answer).await.unwrap();
        assert_eq!(*host.connection_state().borrow(), EngineState::Connected);

        host.close().await;
        assert!(!host.has_session());
        assert_eq!(*host.connection_state().borrow(), EngineState::Closed);
    }

    #[tokio::test]
    async fn voice_mode_has_no_video_and_survives_the_codec() {
        let e = engine();
        e.initialize(false).await.unwrap();
        let offer = e.create_offer().await.unwrap();
        assert!(!offer.contains("m=video"));
        let codec = CompactCodec::default();
        let decoded = codec.decode(&codec.encode(SdpKind::Offer, &offer)).unwrap();
        assert_eq!(decoded.kind, SdpKind::Offer);
        assert!(decoded.sdp.contains("m=audio 9 UDP/TLS/RTP/SAVPF 111 0 8"));
    }

    #[tokio::test]
    async fn restart_ice_changes_credentials_and_needs_a_new_answer() {
        let host = engine();
        let joiner = engine();
        host.initialize(true).await.unwrap();
        joiner.initialize(true).await.unwrap();
        let offer = host.create_offer().await.unwrap();
        joiner.set_remote_description(&offer, SdpKind::Offer).await.unwrap();
        let answer = joiner.create_answer().await.unwrap();
        host.set_remote_description(&answer, SdpKind::Answer).await.unwrap();

        let restarted = host.restart_ice().await.unwrap();
        let ufrag = |sdp: &str| sdp.lines().find(|l| l.starts_with("a=ice-ufrag:")).map(str::to_string);
        assert_ne!(ufrag(&offer), ufrag(&restarted));
        assert_eq!(*host.connection_state().borrow(), EngineState::Connecting);

        host.set_bitrate_ceiling(200).await;
        assert_eq!(host.bitrate_ceiling(), Some(200));
    }

    #[tokio::test]
    async fn garbage_remote_description_is_a_negotiation_error() {
        let e = engine();
        e.initialize(true).await.unwrap();
        assert!(matches!(
            e.set_remote_description("hello", SdpKind::Offer).await,
            Err(MediaError::Negotiation(_))
        ));
        assert!(matches!(
            e.set_remote_description("v=0\r\n", SdpKind::Answer).await,
            Err(MediaError::Negotiation(_))
        ));
    }
}
