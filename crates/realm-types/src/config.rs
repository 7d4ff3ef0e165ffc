//! Realm configuration, loaded once at startup from a TOML file.
//!
//! Every field has a default so a minimal file only needs `call_sign` and
//! `discovery_url`. There is no hot reload.

use crate::error::{RealmError, RealmResult};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Default local listen port for direct-socket connections.
pub const DEFAULT_LISTEN_PORT: u16 = 4000;

/// A TURN relay entry for negotiated channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServer {
    /// TURN URLs (e.g. `turn:turn.example.com:3478`).
    pub urls: Vec<String>,
    /// Username for the relay.
    #[serde(default)]
    pub username: String,
    /// Credential for the relay.
    #[serde(default)]
    pub credential: String,
}

/// Configuration for a Realm instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealmConfig {
    /// Unique human-chosen name of this instance.
    pub call_sign: String,
    /// WebSocket URL of the rendezvous service.
    pub discovery_url: String,
    /// Local address for the direct-socket listener.
    pub listen_addr: SocketAddr,
    /// Fixed host to advertise instead of resolving the public address.
    pub advertise_host: Option<String>,
    /// HTTP endpoint returning this host's public IP as plain text.
    /// `None` disables public address lookup.
    pub public_address_url: Option<String>,
    /// Interval between heartbeats to the rendezvous service.
    pub heartbeat_interval_ms: u64,
    /// Fixed delay between rendezvous reconnect attempts.
    pub discovery_retry_ms: u64,
    /// How long to wait for a `peerInfo` answer before treating the peer as offline.
    pub peer_lookup_timeout_ms: u64,
    /// Timeout for the direct-socket connect + hello handshake.
    pub direct_connect_timeout_ms: u64,
    /// Timeout for a negotiated channel to open.
    pub negotiation_timeout_ms: u64,
    /// Query timeout used when the caller does not pass one.
    pub default_query_timeout_ms: u64,
    /// Maximum frames queued per peer while no transport is open.
    pub max_queued_frames: usize,
    /// Maximum outstanding queries per instance.
    pub max_pending_queries: usize,
    /// STUN server URLs for negotiated channels.
    pub stun_servers: Vec<String>,
    /// TURN relays for negotiated channels.
    pub turn_servers: Vec<TurnServer>,
    /// Optional token presented on registration.
    pub auth_token: Option<String>,
}

impl Default for RealmConfig {
    fn default() -> Self {
        Self {
            call_sign: String::new(),
            discovery_url: "ws://127.0.0.1:8787".to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_LISTEN_PORT)),
            advertise_host: None,
            public_address_url: Some("https://api.ipify.org".to_string()),
            heartbeat_interval_ms: 30_000,
            discovery_retry_ms: 5_000,
            peer_lookup_timeout_ms: 5_000,
            direct_connect_timeout_ms: 5_000,
            negotiation_timeout_ms: 15_000,
            default_query_timeout_ms: 30_000,
            max_queued_frames: 1024,
            max_pending_queries: 4096,
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            auth_token: None,
        }
    }
}

impl RealmConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(contents: &str) -> RealmResult<Self> {
        let config: RealmConfig =
            toml::from_str(contents).map_err(|e| RealmError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration is usable.
    pub fn validate(&self) -> RealmResult<()> {
        if self.call_sign.trim().is_empty() {
            return Err(RealmError::Config("call_sign must not be empty".into()));
        }
        let url = url::Url::parse(&self.discovery_url)
            .map_err(|e| RealmError::Config(format!("invalid discovery_url: {e}")))?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(RealmError::Config(format!(
                "discovery_url must use ws:// or wss://, got {}",
                url.scheme()
            )));
        }
        for (name, value) in [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("discovery_retry_ms", self.discovery_retry_ms),
            ("peer_lookup_timeout_ms", self.peer_lookup_timeout_ms),
            ("direct_connect_timeout_ms", self.direct_connect_timeout_ms),
            ("negotiation_timeout_ms", self.negotiation_timeout_ms),
            ("default_query_timeout_ms", self.default_query_timeout_ms),
        ] {
            if value == 0 {
                return Err(RealmError::Config(format!("{name} must be non-zero")));
            }
        }
        if self.max_queued_frames == 0 || self.max_pending_queries == 0 {
            return Err(RealmError::Config(
                "queue and pending-query limits must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn discovery_retry(&self) -> Duration {
        Duration::from_millis(self.discovery_retry_ms)
    }

    pub fn peer_lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_lookup_timeout_ms)
    }

    pub fn direct_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.direct_connect_timeout_ms)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    pub fn default_query_timeout(&self) -> Duration {
        Duration::from_millis(self.default_query_timeout_ms)
    }
}

/// Load a configuration file.
///
/// Unlike most settings files, a Realm config cannot fall back to defaults:
/// an instance without a call sign has no identity on the rendezvous service.
pub fn load_config(path: &Path) -> RealmResult<RealmConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        RealmError::Config(format!("failed to read {}: {e}", path.display()))
    })?;
    let config = RealmConfig::from_toml_str(&contents)?;
    info!(
        path = %path.display(),
        call_sign = %config.call_sign,
        "Loaded realm configuration"
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = RealmConfig::default();
        assert_eq!(config.listen_addr.port(), DEFAULT_LISTEN_PORT);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.discovery_retry(), Duration::from_secs(5));
        assert_eq!(config.peer_lookup_timeout(), Duration::from_secs(5));
        assert!(config.auth_token.is_none());
    }

    #[test]
    fn test_minimal_toml() {
        let config = RealmConfig::from_toml_str(
            r#"
            call_sign = "alpha"
            discovery_url = "wss://realm.example.com/ws"
            "#,
        )
        .unwrap();
        assert_eq!(config.call_sign, "alpha");
        assert_eq!(config.max_queued_frames, 1024);
        assert_eq!(config.stun_servers.len(), 1);
    }

    #[test]
    fn test_full_toml() {
        let config = RealmConfig::from_toml_str(
            r#"
            call_sign = "bravo"
            discovery_url = "ws://10.0.0.1:8787"
            listen_addr = "127.0.0.1:4100"
            heartbeat_interval_ms = 1000
            auth_token = "s3cret"
            stun_servers = []

            [[turn_servers]]
            urls = ["turn:turn.example.com:3478"]
            username = "user"
            credential = "pass"
            "#,
        )
        .unwrap();
        assert_eq!(config.listen_addr.port(), 4100);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(1));
        assert_eq!(config.auth_token.as_deref(), Some("s3cret"));
        assert!(config.stun_servers.is_empty());
        assert_eq!(config.turn_servers[0].username, "user");
    }

    #[test]
    fn test_missing_call_sign_rejected() {
        let err = RealmConfig::from_toml_str(r#"discovery_url = "ws://localhost:1""#).unwrap_err();
        assert!(matches!(err, RealmError::Config(ref m) if m.contains("call_sign")));
    }

    #[test]
    fn test_bad_scheme_rejected() {
        let err = RealmConfig::from_toml_str(
            r#"
            call_sign = "alpha"
            discovery_url = "http://localhost:8787"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, RealmError::Config(_)));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let err = RealmConfig::from_toml_str(
            r#"
            call_sign = "alpha"
            heartbeat_interval_ms = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, RealmError::Config(ref m) if m.contains("heartbeat")));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "call_sign = \"charlie\"").unwrap();
        writeln!(file, "heartbeat_interval_ms = 2500").unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.call_sign, "charlie");
        assert_eq!(config.heartbeat_interval_ms, 2500);
    }

    #[test]
    fn test_load_config_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, RealmError::Config(_)));
    }
}
