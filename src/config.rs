//! Engine configuration
//!
//! This module contains all configuration options for the scheduling and
//! connection core. The config is shared read-only as `Arc<EngineConfig>`.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the engine core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum concurrent active download groups
    pub max_concurrent_downloads: usize,

    /// URI selection strategy for groups with several mirrors
    #[serde(default)]
    pub uri_selector: UriSelectorKind,

    /// Number of mirrors the adaptive selector evaluates per group
    #[serde(default = "default_metalink_servers")]
    pub metalink_servers: usize,

    /// Lowest acceptable download speed (bytes/sec, 0 = disabled)
    #[serde(default)]
    pub lowest_speed_limit: u64,

    /// Overall download speed limit (bytes/sec, None = unlimited)
    pub max_overall_download_limit: Option<u64>,

    /// Overall upload speed limit (bytes/sec, None = unlimited)
    pub max_overall_upload_limit: Option<u64>,

    /// Interval between full passes over the task queue
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,

    /// Server statistics older than this are dropped
    #[serde(default = "default_server_stat_timeout_secs")]
    pub server_stat_timeout_secs: u64,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// TLS configuration
    #[serde(default)]
    pub tls: TlsConfig,
}

/// URI selection strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UriSelectorKind {
    /// Use URIs in the order they were given
    InOrder,
    /// Prefer the fastest known host
    #[default]
    Feedback,
    /// Evaluate mirrors and favor the fastest ones
    Adaptive,
}

impl std::fmt::Display for UriSelectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InOrder => write!(f, "inorder"),
            Self::Feedback => write!(f, "feedback"),
            Self::Adaptive => write!(f, "adaptive"),
        }
    }
}

impl std::str::FromStr for UriSelectorKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "inorder" => Ok(Self::InOrder),
            "feedback" => Ok(Self::Feedback),
            "adaptive" => Ok(Self::Adaptive),
            _ => Err(EngineError::invalid_input(
                "uri_selector",
                format!("Unknown selector: {}", s),
            )),
        }
    }
}

/// Connection establishment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Per-attempt connect timeout in seconds
    pub connect_timeout_secs: u64,

    /// Timeout for name resolution and TLS handshakes in seconds
    pub timeout_secs: u64,

    /// Delay before a backup connection to the other address family starts
    #[serde(default = "default_backup_connect_delay_ms")]
    pub backup_connect_delay_ms: u64,

    /// How long a failed address stays marked bad
    #[serde(default = "default_bad_address_cooldown_secs")]
    pub bad_address_cooldown_secs: u64,

    /// Never resolve or connect over IPv6
    #[serde(default)]
    pub disable_ipv6: bool,

    /// Never resolve or connect over IPv4
    #[serde(default)]
    pub disable_ipv4: bool,

    /// Size of the helper thread pool used for blocking lookups
    #[serde(default = "default_async_dns_threads")]
    pub async_dns_threads: usize,
}

/// TLS client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Verify the peer certificate chain and hostname
    #[serde(default = "default_true")]
    pub verify_peer: bool,

    /// Extra CA certificates (PEM) trusted in addition to the bundled roots
    #[serde(default)]
    pub ca_certificate: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_metalink_servers() -> usize {
    5
}

fn default_refresh_interval_ms() -> u64 {
    1000
}

fn default_server_stat_timeout_secs() -> u64 {
    24 * 60 * 60
}

fn default_backup_connect_delay_ms() -> u64 {
    300
}

fn default_bad_address_cooldown_secs() -> u64 {
    300
}

fn default_async_dns_threads() -> usize {
    4
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 5,
            uri_selector: UriSelectorKind::Feedback,
            metalink_servers: 5,
            lowest_speed_limit: 0,
            max_overall_download_limit: None,
            max_overall_upload_limit: None,
            refresh_interval_ms: 1000,
            server_stat_timeout_secs: default_server_stat_timeout_secs(),
            network: NetworkConfig::default(),
            tls: TlsConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 60,
            timeout_secs: 60,
            backup_connect_delay_ms: 300,
            bad_address_cooldown_secs: 300,
            disable_ipv6: false,
            disable_ipv4: false,
            async_dns_threads: 4,
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            verify_peer: true,
            ca_certificate: None,
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backup_connect_delay(&self) -> Duration {
        Duration::from_millis(self.backup_connect_delay_ms)
    }

    pub fn bad_address_cooldown(&self) -> Duration {
        Duration::from_secs(self.bad_address_cooldown_secs)
    }
}

impl EngineConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum concurrent downloads
    pub fn max_concurrent_downloads(mut self, max: usize) -> Self {
        self.max_concurrent_downloads = max;
        self
    }

    /// Set the URI selection strategy
    pub fn uri_selector(mut self, kind: UriSelectorKind) -> Self {
        self.uri_selector = kind;
        self
    }

    /// Set the number of mirrors evaluated by the adaptive selector
    pub fn metalink_servers(mut self, servers: usize) -> Self {
        self.metalink_servers = servers;
        self
    }

    /// Set the lowest acceptable download speed
    pub fn lowest_speed_limit(mut self, limit: u64) -> Self {
        self.lowest_speed_limit = limit;
        self
    }

    /// Set overall download speed limit
    pub fn download_limit(mut self, limit: Option<u64>) -> Self {
        self.max_overall_download_limit = limit;
        self
    }

    /// Set overall upload speed limit
    pub fn upload_limit(mut self, limit: Option<u64>) -> Self {
        self.max_overall_upload_limit = limit;
        self
    }

    /// Set the refresh interval in milliseconds
    pub fn refresh_interval_ms(mut self, ms: u64) -> Self {
        self.refresh_interval_ms = ms;
        self
    }

    /// Set the per-attempt connect timeout
    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.network.connect_timeout_secs = secs;
        self
    }

    /// Set the backup connection delay
    pub fn backup_connect_delay_ms(mut self, ms: u64) -> Self {
        self.network.backup_connect_delay_ms = ms;
        self
    }

    /// Disable IPv6 resolution and connections
    pub fn disable_ipv6(mut self, disable: bool) -> Self {
        self.network.disable_ipv6 = disable;
        self
    }

    /// Disable IPv4 resolution and connections
    pub fn disable_ipv4(mut self, disable: bool) -> Self {
        self.network.disable_ipv4 = disable;
        self
    }

    /// Enable or disable peer verification
    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.tls.verify_peer = verify;
        self
    }

    /// Trust an extra CA certificate file
    pub fn ca_certificate(mut self, path: impl Into<PathBuf>) -> Self {
        self.tls.ca_certificate = Some(path.into());
        self
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn server_stat_timeout(&self) -> Duration {
        Duration::from_secs(self.server_stat_timeout_secs)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_downloads == 0 {
            return Err(EngineError::invalid_input(
                "max_concurrent_downloads",
                "Must be at least 1",
            ));
        }

        if self.network.async_dns_threads == 0 {
            return Err(EngineError::invalid_input(
                "network.async_dns_threads",
                "Must be at least 1",
            ));
        }

        if self.network.connect_timeout_secs == 0 {
            return Err(EngineError::invalid_input(
                "network.connect_timeout_secs",
                "Must be at least 1",
            ));
        }

        if self.network.timeout_secs == 0 {
            return Err(EngineError::invalid_input(
                "network.timeout_secs",
                "Must be at least 1",
            ));
        }

        if let Some(path) = &self.tls.ca_certificate {
            if !path.is_file() {
                return Err(EngineError::invalid_input(
                    "tls.ca_certificate",
                    format!("File does not exist: {:?}", path),
                ));
            }
        }

        Ok(())
    }
}
