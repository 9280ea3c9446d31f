//! Media engine seam: the narrow interface the handshake drives. Capture, codecs and ICE
//! gathering live behind it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::protocol::IceCandidate;

/// Connection state reported by a media engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    Idle,
    /// Initialized, no negotiation yet.
    Ready,
    Connecting,
    Connected,
    Failed,
    Closed,
}

/// Which side of the offer/answer exchange a description belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        }
    }
}

impl std::fmt::Display for SdpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("media hardware unavailable: {0}")]
    Hardware(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("no media session")]
    NoSession,
    #[error("media engine closed")]
    Closed,
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Acquire capture devices and create a session. Safe to call again to switch modes.
    async fn initialize(&self, video: bool) -> Result<(), MediaError>;

    async fn create_offer(&self) -> Result<String, MediaError>;

    async fn create_answer(&self) -> Result<String, MediaError>;

    async fn set_remote_description(&self, sdp: &str, kind: SdpKind) -> Result<(), MediaError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError>;

    fn connection_state(&self) -> watch::Receiver<EngineState>;

    /// Candidates gathered locally, to be sent to the peer.
    fn local_candidates(&self) -> broadcast::Receiver<IceCandidate>;

    async fn close(&self);

    fn has_session(&self) -> bool;

    /// Offer with fresh ICE credentials on the existing session.
    async fn restart_ice(&self) -> Result<String, MediaError> {
        self.create_offer().await
    }

    /// Cap the outgoing media bitrate, in kbps.
    async fn set_bitrate_ceiling(&self, _kbps: u32) {}
}
