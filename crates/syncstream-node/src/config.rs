//! Configuration types for syncstream-node.
//! Parsed from ~/.syncstream/config.toml.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use syncstream_protocol::{DEFAULT_CHUNK_SIZE, DEFAULT_PORT, MAX_CHUNK_SIZE};
use syncstream_transfer::{EngineConfig, DEFAULT_MAX_RETRIES};

use crate::link::LinkConfig;
use crate::reconnect::ReconnectPolicy;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub transfer: TransferSection,
    #[serde(default)]
    pub peers: Vec<PeerProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Name announced as `sender` in offers.
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_save_dir")]
    pub save_dir: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            name: default_name(),
            save_dir: default_save_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Port dialed when a peer address carries none.
    #[serde(default = "default_peer_port")]
    pub peer_port: u16,
    #[serde(default = "default_10")]
    pub connect_timeout_secs: u64,
    /// Peer dialed at startup: a profile name or an address.
    pub peer: Option<String>,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_PORT,
            peer_port: DEFAULT_PORT,
            connect_timeout_secs: 10,
            peer: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_180")]
    pub timeout_secs: u64,
    #[serde(default = "default_3")]
    pub max_attempts_before_backoff: u32,
    #[serde(default = "default_30")]
    pub backoff_secs: u64,
    #[serde(default = "default_10")]
    pub retry_interval_secs: u64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: 180,
            max_attempts_before_backoff: 3,
            backoff_secs: 30,
            retry_interval_secs: 10,
        }
    }
}

impl ReconnectSection {
    pub fn to_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            enabled: self.enabled,
            timeout: Duration::from_secs(self.timeout_secs),
            max_attempts_before_backoff: self.max_attempts_before_backoff,
            backoff: Duration::from_secs(self.backoff_secs),
            retry_interval: Duration::from_secs(self.retry_interval_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSection {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Seconds a sender waits for the peer to accept an offer.
    #[serde(default = "default_30")]
    pub accept_timeout_secs: u64,
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            accept_timeout_secs: 30,
        }
    }
}

/// A named peer, so `--peer laptop` can stand in for an address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerProfile {
    pub name: String,
    pub addr: String,
    #[serde(default = "default_peer_port")]
    pub port: u16,
    #[serde(default)]
    pub description: String,
}

impl PeerProfile {
    pub fn address(&self) -> String {
        crate::join_address(&self.addr, self.port)
    }
}

// Default value functions
fn default_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "syncstream".into())
}
fn default_save_dir() -> String {
    "~/Downloads/syncstream".into()
}
fn default_listen_port() -> u16 {
    DEFAULT_PORT
}
fn default_peer_port() -> u16 {
    DEFAULT_PORT
}
fn default_true() -> bool {
    true
}
fn default_3() -> u32 {
    3
}
fn default_10() -> u64 {
    10
}
fn default_30() -> u64 {
    30
}
fn default_180() -> u64 {
    180
}
fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl NodeConfig {
    /// Load config from file, or fall back to defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str::<NodeConfig>(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.transfer.chunk_size == 0 || self.transfer.chunk_size > MAX_CHUNK_SIZE {
            anyhow::bail!(
                "transfer.chunk_size must be between 1 and {MAX_CHUNK_SIZE}, got {}",
                self.transfer.chunk_size
            );
        }
        if self.network.peer_port == 0 {
            anyhow::bail!("network.peer_port must be a real port");
        }
        if self.transfer.accept_timeout_secs == 0 {
            anyhow::bail!("transfer.accept_timeout_secs must be positive");
        }
        if self.network.connect_timeout_secs == 0 {
            anyhow::bail!("network.connect_timeout_secs must be positive");
        }
        if self.reconnect.enabled && self.reconnect.timeout_secs == 0 {
            anyhow::bail!("reconnect.timeout_secs must be positive when reconnect is enabled");
        }
        let mut names: Vec<&str> = self.peers.iter().map(|p| p.name.as_str()).collect();
        names.sort_unstable();
        if let Some(w) = names.windows(2).find(|w| w[0] == w[1]) {
            anyhow::bail!("duplicate peer profile '{}'", w[0]);
        }
        Ok(())
    }

    pub fn find_peer(&self, name: &str) -> Option<&PeerProfile> {
        self.peers.iter().find(|p| p.name == name)
    }

    /// Map a profile name or a literal address to `(display name, address)`.
    pub fn resolve_peer(&self, name_or_addr: &str) -> (String, String) {
        match self.find_peer(name_or_addr) {
            Some(profile) => (profile.name.clone(), profile.address()),
            None => (name_or_addr.to_string(), name_or_addr.to_string()),
        }
    }

    pub fn save_dir(&self) -> PathBuf {
        crate::expand_tilde(&self.node.save_dir)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            chunk_size: self.transfer.chunk_size,
            max_retries: self.transfer.max_retries,
            save_dir: self.save_dir(),
            local_name: self.node.name.clone(),
            accept_timeout: Duration::from_secs(self.transfer.accept_timeout_secs),
        }
    }

    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            connect_timeout: Duration::from_secs(self.network.connect_timeout_secs),
            default_peer_port: self.network.peer_port,
            reconnect: self.reconnect.to_policy(),
        }
    }
}
