//! Configuration for the supernode daemon.
//!
//! Resolution order: environment variables → config file → defaults.
//! The daemon consumes this resolved struct; flag parsing and session
//! management stay outside the core.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::community::HeaderEncryption;
use crate::wire::VERSION_STR_MAX;

/// Default main UDP/TCP port.
pub const DEFAULT_PORT: u16 = 7654;

/// Default management HTTP port.
pub const DEFAULT_MGMT_PORT: u16 = 5644;

/// Default federation name (without the `*` prefix).
pub const DEFAULT_FEDERATION_NAME: &str = "Federation";

/// Default management password. Meant to be overridden.
pub const DEFAULT_MGMT_PASSWORD: &str = "meshgate";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupernodeConfig {
    pub network: NetworkConfig,
    pub federation: FederationConfig,
    pub overlay: OverlayConfig,
    pub management: ManagementConfig,
    /// Fixed MAC for this supernode, `aa:bb:cc:dd:ee:ff`. Random otherwise.
    pub mac: Option<String>,
    /// Version string advertised to peers, at most 19 bytes.
    pub version_string: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Bind address for the main UDP socket and the aux TCP listener.
    pub bind: IpAddr,
    pub port: u16,
    /// Whether to offer the aux TCP transport.
    pub tcp_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    /// Federation name; the community is named `*<name>` on the wire.
    pub name: String,
    /// Statically-configured supernode anchors, `host:port` each.
    pub anchors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Community ACL file. Absent = open mode.
    pub community_file: Option<PathBuf>,
    pub auto_ip_min: Ipv4Addr,
    pub auto_ip_max: Ipv4Addr,
    pub auto_ip_bits: u8,
    /// Edge registration TTL, seconds.
    pub registration_ttl: u64,
    pub spoofing_protection: bool,
    /// Header encryption for communities the ACL does not specialize.
    pub header_encryption: HeaderEncryption,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagementConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub password: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for SupernodeConfig {
    fn default() -> Self {
        SupernodeConfig {
            network: NetworkConfig::default(),
            federation: FederationConfig::default(),
            overlay: OverlayConfig::default(),
            management: ManagementConfig::default(),
            mac: None,
            version_string: concat!("meshgate-", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            tcp_enabled: true,
        }
    }
}

impl Default for FederationConfig {
    fn default() -> Self {
        FederationConfig {
            name: DEFAULT_FEDERATION_NAME.to_string(),
            anchors: Vec::new(),
        }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        OverlayConfig {
            community_file: None,
            auto_ip_min: Ipv4Addr::new(10, 128, 255, 0),
            auto_ip_max: Ipv4Addr::new(10, 255, 255, 0),
            auto_ip_bits: 24,
            registration_ttl: 60,
            spoofing_protection: true,
            header_encryption: HeaderEncryption::None,
        }
    }
}

impl Default for ManagementConfig {
    fn default() -> Self {
        ManagementConfig {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_MGMT_PORT,
            password: DEFAULT_MGMT_PASSWORD.to_string(),
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),

    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl SupernodeConfig {
    /// Load config: env vars → file → defaults.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
                toml::from_str(&text)
                    .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
            }
            None => SupernodeConfig::default(),
        };
        config.apply_env_overrides();
        config.clamp();
        Ok(config)
    }

    pub fn registration_ttl(&self) -> Duration {
        Duration::from_secs(self.overlay.registration_ttl)
    }

    /// Maintenance tick period: a quarter of the TTL, never below 10s.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs((self.overlay.registration_ttl / 4).max(10))
    }

    /// Federated supernodes expire later than edges; anchors never do.
    pub fn federation_ttl(&self) -> Duration {
        Duration::from_secs(self.overlay.registration_ttl * 2)
    }

    /// Apply MESHGATE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("MESHGATE_NETWORK__BIND") {
            if let Ok(ip) = v.parse() {
                self.network.bind = ip;
            }
        }
        if let Ok(v) = std::env::var("MESHGATE_NETWORK__PORT") {
            if let Ok(p) = v.parse() {
                self.network.port = p;
            }
        }
        if let Ok(v) = std::env::var("MESHGATE_FEDERATION__NAME") {
            self.federation.name = v;
        }
        if let Ok(v) = std::env::var("MESHGATE_OVERLAY__COMMUNITY_FILE") {
            self.overlay.community_file = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("MESHGATE_OVERLAY__REGISTRATION_TTL") {
            if let Ok(ttl) = v.parse() {
                self.overlay.registration_ttl = ttl;
            }
        }
        if let Ok(v) = std::env::var("MESHGATE_MANAGEMENT__PORT") {
            if let Ok(p) = v.parse() {
                self.management.port = p;
            }
        }
        if let Ok(v) = std::env::var("MESHGATE_MANAGEMENT__PASSWORD") {
            self.management.password = v;
        }
    }

    fn clamp(&mut self) {
        if self.version_string.len() > VERSION_STR_MAX {
            self.version_string.truncate(VERSION_STR_MAX);
        }
        if self.overlay.registration_ttl == 0 {
            self.overlay.registration_ttl = OverlayConfig::default().registration_ttl;
        }
    }
}
