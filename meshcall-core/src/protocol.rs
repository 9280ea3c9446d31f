//! MeshCall signaling vocabulary: signaling messages, their JSON wire form, and mesh packets.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::PublicKey;

/// Current protocol version. Used in discovery beacons and the LAN link handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Target id for packets addressed to every node in the mesh.
pub const BROADCAST: &str = "BROADCAST";

/// Relay budget for freshly originated mesh packets.
pub const DEFAULT_TTL: u8 = 5;

/// Which media the host wants for the call. Sent as VOICE_CALL / VIDEO_CALL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallMode {
    Voice,
    Video,
}

impl CallMode {
    pub fn video_enabled(self) -> bool {
        matches!(self, CallMode::Video)
    }
}

/// One ICE candidate as exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

/// Payload of a signaling message. Exactly one semantic payload per variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    /// Presence announcement.
    Join,
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate(IceCandidate),
    /// Hang up.
    Bye,
    /// Free-text chat; travels in the `sdp` field on the wire.
    Chat { text: String },
    /// Sender's long-term public key, used to address envelopes to it.
    Identity { public_key: PublicKey },
    /// Sealed envelope around another signaling message (see `identity::seal`).
    Encrypted {
        ephemeral_key: PublicKey,
        payload: Vec<u8>,
    },
    /// Host's mode select (VOICE_CALL / VIDEO_CALL).
    SelectMode(CallMode),
    /// Tag not understood by this build, or a tag whose payload was missing.
    Unknown,
}

impl Signal {
    pub fn kind(&self) -> MessageKind {
        match self {
            Signal::Join => MessageKind::Join,
            Signal::Offer { .. } => MessageKind::Offer,
            Signal::Answer { .. } => MessageKind::Answer,
            Signal::IceCandidate(_) => MessageKind::IceCandidate,
            Signal::Bye => MessageKind::Bye,
            Signal::Chat { .. } => MessageKind::Message,
            Signal::Identity { .. } => MessageKind::Identity,
            Signal::Encrypted { .. } => MessageKind::Encrypted,
            Signal::SelectMode(CallMode::Voice) => MessageKind::VoiceCall,
            Signal::SelectMode(CallMode::Video) => MessageKind::VideoCall,
            Signal::Unknown => MessageKind::Unknown,
        }
    }
}

/// A signaling message: who sent it and what it carries. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingMessage {
    pub sender_id: String,
    pub signal: Signal,
}

impl SignalingMessage {
    pub fn new(sender_id: impl Into<String>, signal: Signal) -> Self {
        Self {
            sender_id: sender_id.into(),
            signal,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.signal.kind()
    }

    /// Encode as the JSON wire form used by the cloud relay and mesh payloads.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&WireMessage::from(self))
    }

    /// Parse the JSON wire form.
    pub fn from_json(text: &str) -> Result<Self, WireMessageError> {
        let wire: WireMessage = serde_json::from_str(text)?;
        SignalingMessage::try_from(wire)
    }
}

/// Wire tag of a signaling message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    Join,
    Offer,
    Answer,
    IceCandidate,
    Bye,
    Message,
    Identity,
    Encrypted,
    VoiceCall,
    VideoCall,
    Unknown,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Join => "JOIN",
            MessageKind::Offer => "OFFER",
            MessageKind::Answer => "ANSWER",
            MessageKind::IceCandidate => "ICE_CANDIDATE",
            MessageKind::Bye => "BYE",
            MessageKind::Message => "MESSAGE",
            MessageKind::Identity => "IDENTITY",
            MessageKind::Encrypted => "ENCRYPTED",
            MessageKind::VoiceCall => "VOICE_CALL",
            MessageKind::VideoCall => "VIDEO_CALL",
            MessageKind::Unknown => "UNKNOWN",
        }
    }
}

impl From<String> for MessageKind {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "JOIN" => MessageKind::Join,
            "OFFER" => MessageKind::Offer,
            "ANSWER" => MessageKind::Answer,
            "ICE_CANDIDATE" => MessageKind::IceCandidate,
            "BYE" => MessageKind::Bye,
            "MESSAGE" => MessageKind::Message,
            "IDENTITY" => MessageKind::Identity,
            "ENCRYPTED" => MessageKind::Encrypted,
            "VOICE_CALL" => MessageKind::VoiceCall,
            "VIDEO_CALL" => MessageKind::VideoCall,
            _ => MessageKind::Unknown,
        }
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flat JSON form of a signaling message, as relayed by the cloud server.
/// Keys are hex; encrypted payloads are standard base64.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: Option<MessageKind>,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice_candidate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_payload: Option<String>,
}

impl From<&SignalingMessage> for WireMessage {
    fn from(msg: &SignalingMessage) -> Self {
        let mut wire = WireMessage {
            kind: Some(msg.kind()),
            sender_id: msg.sender_id.clone(),
            ..WireMessage::default()
        };
        match &msg.signal {
            Signal::Offer { sdp } | Signal::Answer { sdp } => wire.sdp = Some(sdp.clone()),
            Signal::Chat { text } => wire.sdp = Some(text.clone()),
            Signal::IceCandidate(c) => {
                wire.ice_candidate = Some(c.candidate.clone());
                wire.sdp_mid = c.sdp_mid.clone();
                wire.sdp_m_line_index = c.sdp_mline_index;
            }
            Signal::Identity { public_key } => {
                wire.ephemeral_key = Some(hex::encode(public_key.as_bytes()));
            }
            Signal::Encrypted {
                ephemeral_key,
                payload,
            } => {
                wire.ephemeral_key = Some(hex::encode(ephemeral_key.as_bytes()));
                wire.encrypted_payload =
                    Some(base64::engine::general_purpose::STANDARD.encode(payload));
            }
            Signal::Join | Signal::Bye | Signal::SelectMode(_) | Signal::Unknown => {}
        }
        wire
    }
}

impl TryFrom<WireMessage> for SignalingMessage {
    type Error = WireMessageError;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        if wire.sender_id.is_empty() {
            return Err(WireMessageError::MissingSender);
        }
        let signal = match wire.kind.unwrap_or(MessageKind::Unknown) {
            MessageKind::Join => Signal::Join,
            MessageKind::Bye => Signal::Bye,
            MessageKind::VoiceCall => Signal::SelectMode(CallMode::Voice),
            MessageKind::VideoCall => Signal::SelectMode(CallMode::Video),
            MessageKind::Offer => match wire.sdp {
                Some(sdp) => Signal::Offer { sdp },
                None => Signal::Unknown,
            },
            MessageKind::Answer => match wire.sdp {
                Some(sdp) => Signal::Answer { sdp },
                None => Signal::Unknown,
            },
            MessageKind::Message => match wire.sdp {
                Some(text) => Signal::Chat { text },
                None => Signal::Unknown,
            },
            MessageKind::IceCandidate => match wire.ice_candidate {
                Some(candidate) => Signal::IceCandidate(IceCandidate {
                    candidate,
                    sdp_mid: wire.sdp_mid,
                    sdp_mline_index: wire.sdp_m_line_index,
                }),
                None => Signal::Unknown,
            },
            MessageKind::Identity => match wire.ephemeral_key {
                Some(key) => Signal::Identity {
                    public_key: parse_key(&key)?,
                },
                None => Signal::Unknown,
            },
            MessageKind::Encrypted => match (wire.ephemeral_key, wire.encrypted_payload) {
                (Some(key), Some(payload)) => Signal::Encrypted {
                    ephemeral_key: parse_key(&key)?,
                    payload: base64::engine::general_purpose::STANDARD
                        .decode(payload)
                        .map_err(|_| WireMessageError::InvalidPayload)?,
                },
                _ => Signal::Unknown,
            },
            MessageKind::Unknown => Signal::Unknown,
        };
        Ok(SignalingMessage {
            sender_id: wire.sender_id,
            signal,
        })
    }
}

fn parse_key(text: &str) -> Result<PublicKey, WireMessageError> {
    let bytes = hex::decode(text).map_err(|_| WireMessageError::InvalidKey)?;
    let arr: [u8; 32] = bytes.try_into().map_err(|_| WireMessageError::InvalidKey)?;
    Ok(PublicKey::from_bytes(arr))
}

/// Error mapping a JSON wire message into a `SignalingMessage`.
#[derive(Debug, thiserror::Error)]
pub enum WireMessageError {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message has no sender id")]
    MissingSender,
    #[error("invalid public key")]
    InvalidKey,
    #[error("invalid encrypted payload")]
    InvalidPayload,
}

/// Kind of a mesh packet. Only SIGNALING packets are delivered to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketKind {
    Signaling,
    Data,
    Hello,
    Ack,
}

/// Unit of flooding in the mesh relay.
/// `hop_count + ttl` stays equal to the originating ttl for the packet's whole life.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshPacket {
    pub id: Uuid,
    pub sender_id: String,
    pub target_id: String,
    pub kind: PacketKind,
    pub payload: Vec<u8>,
    pub hop_count: u8,
    pub ttl: u8,
    /// Milliseconds since the Unix epoch at origin.
    pub timestamp: u64,
}

impl MeshPacket {
    /// Fresh broadcast packet originated by `sender_id`.
    pub fn broadcast(sender_id: impl Into<String>, kind: PacketKind, payload: Vec<u8>, ttl: u8) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender_id: sender_id.into(),
            target_id: BROADCAST.to_string(),
            kind,
            payload,
            hop_count: 0,
            ttl,
            timestamp: now_millis(),
        }
    }

    /// Copy for the next hop, or `None` once the relay budget is spent.
    pub fn relayed(&self) -> Option<Self> {
        if self.ttl == 0 {
            return None;
        }
        Some(Self {
            ttl: self.ttl - 1,
            hop_count: self.hop_count.saturating_add(1),
            ..self.clone()
        })
    }

    pub fn is_broadcast(&self) -> bool {
        self.target_id == BROADCAST
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[test]
    fn offer_json_uses_flat_wire_keys() {
        let msg = SignalingMessage::new(
            "host",
            Signal::Offer {
                sdp: "v=0\r\n".into(),
            },
        );
        let json = msg.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "OFFER");
        assert_eq!(value["senderId"], "host");
        assert_eq!(value["sdp"], "v=0\r\n");
        assert!(value.get("iceCandidate").is_none());
        assert_eq!(SignalingMessage::from_json(&json).unwrap(), msg);
    }

    #[test]
    fn ice_candidate_carries_the_triple() {
        let msg = SignalingMessage::new(
            "peer-1",
            Signal::IceCandidate(IceCandidate {
                candidate: "candidate:1 1 udp 2122260223 192.168.1.4 50000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            }),
        );
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"sdpMLineIndex\":0"));
        assert!(json.contains("\"sdpMid\":\"0\""));
        assert_eq!(SignalingMessage::from_json(&json).unwrap(), msg);
    }

    #[test]
    fn unknown_tag_maps_to_unknown() {
        let msg = SignalingMessage::from_json(r#"{"type":"RING","senderId":"x"}"#).unwrap();
        assert_eq!(msg.signal, Signal::Unknown);
        assert_eq!(msg.sender_id, "x");
    }

    #[test]
    fn offer_without_sdp_maps_to_unknown() {
        let msg = SignalingMessage::from_json(r#"{"type":"OFFER","senderId":"x"}"#).unwrap();
        assert_eq!(msg.signal, Signal::Unknown);
    }

    #[test]
    fn missing_sender_is_rejected() {
        assert!(matches!(
            SignalingMessage::from_json(r#"{"type":"JOIN","senderId":""}"#),
            Err(WireMessageError::MissingSender)
        ));
    }

    #[test]
    fn mode_select_and_identity_map_both_ways() {
        let kp = Keypair::generate();
        for signal in [
            Signal::SelectMode(CallMode::Video),
            Signal::SelectMode(CallMode::Voice),
            Signal::Identity {
                public_key: kp.public_key().clone(),
            },
            Signal::Encrypted {
                ephemeral_key: kp.public_key().clone(),
                payload: vec![1, 2, 3, 250],
            },
        ] {
            let msg = SignalingMessage::new("a", signal);
            let back = SignalingMessage::from_json(&msg.to_json().unwrap()).unwrap();
            assert_eq!(back, msg);
        }
        let voice = SignalingMessage::new("a", Signal::SelectMode(CallMode::Voice));
        assert!(voice.to_json().unwrap().contains("\"VOICE_CALL\""));
    }

    #[test]
    fn bad_identity_key_is_an_error() {
        let r = SignalingMessage::from_json(r#"{"type":"IDENTITY","senderId":"x","ephemeralKey":"abcd"}"#);
        assert!(matches!(r, Err(WireMessageError::InvalidKey)));
    }

    #[test]
    fn relay_copies_keep_hop_plus_ttl_constant() {
        let original = MeshPacket::broadcast("n1", PacketKind::Signaling, vec![7], DEFAULT_TTL);
        assert!(original.is_broadcast());
        let mut current = original.clone();
        let mut relays = 0;
        while let Some(next) = current.relayed() {
            relays += 1;
            assert_eq!(next.id, original.id);
            assert_eq!(next.ttl, original.ttl - relays);
            assert_eq!(next.hop_count, relays);
            assert_eq!(next.hop_count + next.ttl, original.ttl);
            current = next;
        }
        assert_eq!(relays, DEFAULT_TTL);
        assert_eq!(current.ttl, 0);
    }
}
