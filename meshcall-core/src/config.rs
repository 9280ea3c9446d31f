//! Tunables for the relay, the handshake and the out-of-band codec.
//! Every field has a default so hosts can deserialize partial tables.

use std::time::Duration;

use serde::Deserialize;

use crate::protocol::DEFAULT_TTL;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub mesh: MeshConfig,
    pub handshake: HandshakeConfig,
    pub codec: CodecConfig,
}

/// Mesh relay settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MeshConfig {
    /// Service id advertised and scanned for on the radio.
    pub service_id: String,
    /// Relay budget of packets this node originates.
    pub default_ttl: u8,
    /// Max packet ids remembered for duplicate suppression.
    pub seen_capacity: usize,
    /// How long a packet id is remembered.
    pub seen_window_secs: u64,
    pub rescan_interval_secs: u64,
    pub sweep_interval_secs: u64,
}

impl MeshConfig {
    pub fn seen_window(&self) -> Duration {
        Duration::from_secs(self.seen_window_secs)
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_secs(self.rescan_interval_secs.max(1))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            service_id: "meshcall".to_string(),
            default_ttl: DEFAULT_TTL,
            seen_capacity: 4096,
            seen_window_secs: 600,
            rescan_interval_secs: 10,
            sweep_interval_secs: 30,
        }
    }
}

/// Call handshake settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HandshakeConfig {
    /// Grace period after a media failure before the host hands over.
    pub watchdog_grace_ms: u64,
    /// Minimum gap between a joiner's JOIN re-announcements.
    pub rejoin_interval_ms: u64,
    /// Seal OFFER/ANSWER/ICE/chat to the peer's IDENTITY key once known.
    pub encrypt_signaling: bool,
    /// Chat text sent right after JOIN, if any.
    pub ready_message: Option<String>,
    /// Host's call mode: video when true, voice otherwise.
    pub video: bool,
}

impl HandshakeConfig {
    pub fn watchdog_grace(&self) -> Duration {
        Duration::from_millis(self.watchdog_grace_ms)
    }

    pub fn rejoin_interval(&self) -> Duration {
        Duration::from_millis(self.rejoin_interval_ms)
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            watchdog_grace_ms: 5_000,
            rejoin_interval_ms: 1_000,
            encrypt_signaling: false,
            ready_message: None,
            video: true,
        }
    }
}

/// Out-of-band code settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CodecConfig {
    /// ICE candidates kept when minifying.
    pub max_candidates: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self { max_candidates: 3 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.mesh.default_ttl, 5);
        assert_eq!(c.handshake.watchdog_grace(), Duration::from_secs(5));
        assert_eq!(c.codec.max_candidates, 3);
        assert!(!c.handshake.encrypt_signaling);
    }

    #[test]
    fn partial_tables_keep_defaults() {
        let c: Config = serde_json::from_str(r#"{"mesh":{"default_ttl":3},"handshake":{"video":false}}"#).unwrap();
        assert_eq!(c.mesh.default_ttl, 3);
        assert_eq!(c.mesh.seen_capacity, 4096);
        assert!(!c.handshake.video);
        assert_eq!(c.handshake.rejoin_interval_ms, 1_000);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(serde_json::from_str::<MeshConfig>(r#"{"ttl":3}"#).is_err());
    }
}
