//! MeshCall core: signaling over whichever transport works.
//! Channels, the mesh relay, the transport aggregator, the call handshake and out-of-band codes.
//! No sockets or radios here; hosts plug them in through `Channel`, `PacketTransport` and
//! `MediaEngine`.

pub mod aggregator;
pub mod backoff;
pub mod channel;
pub mod codec;
pub mod config;
pub mod ffi;
pub mod handshake;
pub mod identity;
pub mod media;
pub mod mesh;
pub mod protocol;
pub mod wire;

pub use aggregator::{TransportAggregator, TransportChanged, TransportPriority};
pub use backoff::Backoff;
pub use channel::{Channel, ChannelEvents, ChannelState, LoopbackChannel};
pub use codec::{CompactCodec, DecodeError, DecodedCode};
pub use config::{CodecConfig, Config, HandshakeConfig, MeshConfig};
pub use handshake::{CallHandshake, HandshakeEvent, HandshakeStage, Role};
pub use identity::{DeviceId, Keypair, PublicKey};
pub use media::{EngineState, MediaEngine, MediaError, SdpKind};
pub use mesh::{Inbound, MeshRelay, NeighborId, PacketTransport, TransportError};
pub use protocol::{CallMode, IceCandidate, MeshPacket, MessageKind, Signal, SignalingMessage, PROTOCOL_VERSION};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
