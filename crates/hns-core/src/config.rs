//! Configuration system for HNS.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $HNS_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/hns/config.toml
//!   3. ~/.config/hns/config.toml
//!
//! Textual relay endpoints are turned into validated `RelayEndpoint`s by
//! `RelayEndpointConfig::validate`. Validation failures are reported to the
//! caller and never reach the network.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::SecretKey;
use crate::wire::{DEFAULT_RELAY_PORT, MAX_ID_LEN, MAX_MESSAGE_PAYLOAD};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HnsConfig {
    pub relay: RelayServiceConfig,
    pub switch: SwitchConfig,
}

/// Settings for running a relay service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayServiceConfig {
    /// UDP address to bind.
    pub bind: SocketAddr,
    /// Passphrase hashed into the pre-shared key clients encrypt
    /// InitializeSession with.
    pub secret: String,
    /// Hex-encoded RSA modulus of the relay key. Size-checked only.
    pub public_key: String,
    /// Evict sessions idle for this long. 0 = never.
    pub session_ttl_secs: u64,
    /// Largest message payload forwarded between clients.
    pub max_payload: usize,
    /// If true, admit every client that is not explicitly blocked.
    pub auto_trust: bool,
    /// Client ids admitted when auto_trust is off.
    pub trusted_clients: Vec<String>,
    /// Client ids always refused.
    pub blocked_clients: Vec<String>,
    /// Client ids allowed to broadcast. Broadcast is denied for everyone else.
    pub broadcast_clients: Vec<String>,
}

/// Settings for a switch (client side).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchConfig {
    /// This host's id. Also the client id presented to relays.
    pub host_id: String,
    /// Opaque credential presented to relays.
    pub certificate: String,
    /// Local UDP port. 0 = OS-assigned.
    pub bind_port: u16,
    pub connection_timeout_ms: u64,
    pub keep_alive_interval_ms: u64,
    pub maintenance_interval_ms: u64,
    /// Largest application payload accepted by `send_message`.
    pub max_payload: usize,
    /// Port-prediction window growth per keep-alive interval.
    pub port_sweep_step: u16,
    /// Port-prediction window cap.
    pub port_sweep_max_offset: u16,
    /// Send subnet-broadcast pings to find hosts on the same LAN.
    pub lan_broadcast: bool,
    pub relays: Vec<RelayEndpointConfig>,
    /// Hosts of interest registered at startup.
    pub hosts: Vec<String>,
}

/// One relay as written in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEndpointConfig {
    /// Relay identifier. Empty = use the address.
    #[serde(default)]
    pub id: String,
    pub address: String,
    pub public_key: String,
    pub secret: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for RelayServiceConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_RELAY_PORT)),
            secret: String::new(),
            public_key: String::new(),
            session_ttl_secs: 3600,
            max_payload: MAX_MESSAGE_PAYLOAD,
            auto_trust: true,
            trusted_clients: Vec::new(),
            blocked_clients: Vec::new(),
            broadcast_clients: Vec::new(),
        }
    }
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            host_id: String::new(),
            certificate: String::new(),
            bind_port: 0,
            connection_timeout_ms: 15_000,
            keep_alive_interval_ms: 5_000,
            maintenance_interval_ms: 250,
            max_payload: 1024,
            port_sweep_step: 2,
            port_sweep_max_offset: 32,
            lan_broadcast: true,
            relays: Vec::new(),
            hosts: Vec::new(),
        }
    }
}

impl SwitchConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    /// Check the fields a running switch depends on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_id(&self.host_id)?;
        if self.connection_timeout_ms == 0 {
            return Err(ConfigError::BadInterval("connection_timeout_ms"));
        }
        if self.keep_alive_interval_ms == 0 {
            return Err(ConfigError::BadInterval("keep_alive_interval_ms"));
        }
        if self.maintenance_interval_ms == 0 {
            return Err(ConfigError::BadInterval("maintenance_interval_ms"));
        }
        if self.max_payload == 0 || self.max_payload > MAX_MESSAGE_PAYLOAD {
            return Err(ConfigError::BadPayloadLimit(self.max_payload));
        }
        for relay in &self.relays {
            relay.validate()?;
        }
        Ok(())
    }
}

impl RelayServiceConfig {
    pub fn session_ttl(&self) -> Option<Duration> {
        match self.session_ttl_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.secret.is_empty() {
            return Err(ConfigError::MissingSecret);
        }
        RelayPublicKey::from_hex(&self.public_key)?;
        if self.max_payload == 0 || self.max_payload > MAX_MESSAGE_PAYLOAD {
            return Err(ConfigError::BadPayloadLimit(self.max_payload));
        }
        Ok(())
    }

    pub fn pre_shared_key(&self) -> SecretKey {
        SecretKey::from_passphrase(&self.secret)
    }
}

fn validate_id(id: &str) -> Result<(), ConfigError> {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(ConfigError::BadId(id.to_string()));
    }
    Ok(())
}

// ── Relay endpoints ───────────────────────────────────────────────────────────

/// Smallest accepted relay key, in bits.
pub const MIN_KEY_BITS: usize = 1024;
/// Largest accepted relay key, in bits.
pub const MAX_KEY_BITS: usize = 4096;

/// A relay's RSA public modulus. Only its size is checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayPublicKey {
    modulus: Vec<u8>,
}

impl RelayPublicKey {
    /// Parse a big-endian hex modulus and check 1024 ≤ bits ≤ 4096.
    pub fn from_hex(text: &str) -> Result<Self, ConfigError> {
        let modulus = hex::decode(text.trim()).map_err(|_| ConfigError::BadKeyEncoding)?;
        Self::from_modulus(modulus)
    }

    pub fn from_modulus(modulus: Vec<u8>) -> Result<Self, ConfigError> {
        let key = Self { modulus };
        let bits = key.bits();
        if !(MIN_KEY_BITS..=MAX_KEY_BITS).contains(&bits) {
            return Err(ConfigError::KeySize(bits));
        }
        Ok(key)
    }

    /// Significant bits of the modulus.
    pub fn bits(&self) -> usize {
        match self.modulus.iter().position(|b| *b != 0) {
            None => 0,
            Some(first) => {
                let lead = self.modulus[first];
                (self.modulus.len() - first - 1) * 8 + (8 - lead.leading_zeros() as usize)
            }
        }
    }
}

/// A validated relay endpoint, ready to hand to a relay client.
#[derive(Debug, Clone)]
pub struct RelayEndpoint {
    pub id: String,
    pub address: SocketAddr,
    pub public_key: RelayPublicKey,
    pub pre_shared_key: SecretKey,
}

impl RelayEndpointConfig {
    pub fn validate(&self) -> Result<RelayEndpoint, ConfigError> {
        let address: SocketAddr = self
            .address
            .parse()
            .map_err(|_| ConfigError::BadAddress(self.address.clone()))?;
        let public_key = RelayPublicKey::from_hex(&self.public_key)?;
        if self.secret.is_empty() {
            return Err(ConfigError::MissingSecret);
        }
        let id = if self.id.is_empty() {
            address.to_string()
        } else {
            self.id.clone()
        };
        Ok(RelayEndpoint {
            id,
            address,
            public_key,
            pre_shared_key: SecretKey::from_passphrase(&self.secret),
        })
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("hns")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid socket address: {0:?}")]
    BadAddress(String),
    #[error("relay public key is not valid hex")]
    BadKeyEncoding,
    #[error("relay public key has {0} bits, expected {MIN_KEY_BITS}..={MAX_KEY_BITS}")]
    KeySize(usize),
    #[error("relay secret is empty")]
    MissingSecret,
    #[error("invalid id {0:?}: must be 1..={MAX_ID_LEN} bytes")]
    BadId(String),
    #[error("{0} must be greater than zero")]
    BadInterval(&'static str),
    #[error("max_payload {0} outside 1..={MAX_MESSAGE_PAYLOAD}")]
    BadPayloadLimit(usize),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl HnsConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            HnsConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse a specific file without env overrides.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("HNS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&HnsConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply HNS_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("HNS_RELAY__BIND") {
            match v.parse() {
                Ok(addr) => self.relay.bind = addr,
                Err(_) => tracing::warn!(value = %v, "ignoring invalid HNS_RELAY__BIND"),
            }
        }
        if let Ok(v) = std::env::var("HNS_RELAY__SECRET") {
            self.relay.secret = v;
        }
        if let Ok(v) = std::env::var("HNS_SWITCH__HOST_ID") {
            self.switch.host_id = v;
        }
        if let Ok(v) = std::env::var("HNS_SWITCH__BIND_PORT") {
            if let Ok(p) = v.parse() {
                self.switch.bind_port = p;
            }
        }
        if let Ok(v) = std::env::var("HNS_SWITCH__CONNECTION_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.switch.connection_timeout_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("HNS_SWITCH__KEEP_ALIVE_INTERVAL_MS") {
            if let Ok(ms) = v.parse() {
                self.switch.keep_alive_interval_ms = ms;
            }
        }
    }
}
