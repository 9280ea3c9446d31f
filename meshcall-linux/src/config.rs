//! Load config from file and environment.

use std::path::{Path, PathBuf};

use meshcall_core::Role;
use serde::Deserialize;
use tracing::{info, warn};

/// Daemon configuration. File: ~/.config/meshcall/config.toml or /etc/meshcall/config.toml.
/// Env overrides: MESHCALL_ROLE, MESHCALL_ROOM, MESHCALL_SIGNALING_URL, MESHCALL_DISCOVERY_PORT,
/// MESHCALL_TRANSPORT_PORT, MESHCALL_MESH_PORT.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// "host" or "joiner" (default host).
    pub role: RoleSetting,
    /// Room name; only peers in the same room pair up.
    pub room: String,
    /// WebSocket signaling server. The cloud transport is off when unset.
    pub signaling_url: Option<String>,
    /// LAN discovery UDP port (default 45680).
    pub discovery_port: u16,
    /// LAN link TCP port (default 45681).
    pub transport_port: u16,
    /// Mesh data UDP port (default 45682).
    pub mesh_port: u16,
    /// Mesh advertisement UDP port (default 45683).
    pub mesh_beacon_port: u16,
    /// Relay, handshake and codec tunables.
    pub core: meshcall_core::Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleSetting {
    Host,
    Joiner,
}

impl RoleSetting {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "host" => Some(RoleSetting::Host),
            "joiner" | "join" => Some(RoleSetting::Joiner),
            _ => None,
        }
    }
}

impl From<RoleSetting> for Role {
    fn from(r: RoleSetting) -> Self {
        match r {
            RoleSetting::Host => Role::Host,
            RoleSetting::Joiner => Role::Joiner,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: RoleSetting::Host,
            room: "lobby".to_string(),
            signaling_url: None,
            discovery_port: 45680,
            transport_port: 45681,
            mesh_port: 45682,
            mesh_beacon_port: 45683,
            core: meshcall_core::Config::default(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("MESHCALL_ROLE") {
        match RoleSetting::parse(&s) {
            Some(role) => c.role = role,
            None => warn!(value = %s, "ignoring MESHCALL_ROLE"),
        }
    }
    if let Some(s) = var("MESHCALL_ROOM") {
        if !s.is_empty() {
            c.room = s;
        }
    }
    if let Some(s) = var("MESHCALL_SIGNALING_URL") {
        c.signaling_url = if s.is_empty() { None } else { Some(s) };
    }
    if let Some(p) = var("MESHCALL_DISCOVERY_PORT").and_then(|s| s.parse().ok()) {
        c.discovery_port = p;
    }
    if let Some(p) = var("MESHCALL_TRANSPORT_PORT").and_then(|s| s.parse().ok()) {
        c.transport_port = p;
    }
    if let Some(p) = var("MESHCALL_MESH_PORT").and_then(|s| s.parse().ok()) {
        c.mesh_port = p;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/meshcall/config.toml"));
    }
    out.push(PathBuf::from("/etc/meshcall/config.toml"));
    out
}

/// First existing config file wins; a broken one is reported and defaults are used.
fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    parse_file(&path)
}

fn parse_file(path: &Path) -> Option<Config> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read config, using defaults");
            return None;
        }
    };
    match toml::from_str::<Config>(&text) {
        Ok(c) => {
            info!(path = %path.display(), "loaded config");
            Some(c)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "invalid config, using defaults");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn file_overrides_defaults_and_nests_core_tables() {
        let c: Config = toml::from_str(
            r#"
role = "joiner"
room = "kitchen"
mesh_port = 50000

[core.mesh]
default_ttl = 3

[core.handshake]
encrypt_signaling = true
"#,
        )
        .unwrap();
        assert_eq!(c.role, RoleSetting::Joiner);
        assert_eq!(c.room, "kitchen");
        assert_eq!(c.mesh_port, 50000);
        assert_eq!(c.discovery_port, 45680);
        assert_eq!(c.core.mesh.default_ttl, 3);
        assert_eq!(c.core.mesh.seen_capacity, 4096);
        assert!(c.core.handshake.encrypt_signaling);
        assert!(c.signaling_url.is_none());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let env: HashMap<&str, &str> = [
            ("MESHCALL_ROLE", "Joiner"),
            ("MESHCALL_ROOM", "attic"),
            ("MESHCALL_SIGNALING_URL", "ws://127.0.0.1:9000"),
            ("MESHCALL_TRANSPORT_PORT", "41000"),
            ("MESHCALL_MESH_PORT", "not-a-port"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        apply_env(&mut c, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.role, RoleSetting::Joiner);
        assert_eq!(c.room, "attic");
        assert_eq!(c.signaling_url.as_deref(), Some("ws://127.0.0.1:9000"));
        assert_eq!(c.transport_port, 41000);
        assert_eq!(c.mesh_port, 45682);
    }

    #[test]
    fn bad_role_keeps_previous() {
        let mut c = Config::default();
        apply_env(&mut c, |k| (k == "MESHCALL_ROLE").then(|| "spectator".to_string()));
        assert_eq!(c.role, RoleSetting::Host);
    }

    #[test]
    fn broken_file_falls_back() {
        let dir = std::env::temp_dir().join(format!("meshcall-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "role = [").unwrap();
        assert!(parse_file(&path).is_none());
        std::fs::write(&path, "room = \"den\"").unwrap();
        assert_eq!(parse_file(&path).unwrap().room, "den");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
