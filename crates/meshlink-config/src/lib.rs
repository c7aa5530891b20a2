//! Shared configuration for meshlink peers
//!
//! Reads from ~/.meshlink/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Default STUN servers used for ICE gathering
pub const DEFAULT_ICE_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun.cloudflare.com:3478",
];

/// Top-level config structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub chunk: ChunkConfig,
    #[serde(default)]
    pub rtc: RtcConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub connector: ConnectorConfig,
}

/// Admission caps and field limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_number_of_peers")]
    pub max_number_of_peers: usize,
    #[serde(default = "default_max_number_of_outgoing_connections")]
    pub max_number_of_outgoing_connections: usize,
    /// Nicknames longer than this (in chars) are truncated
    #[serde(default = "default_max_name_length")]
    pub max_name_length: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_number_of_peers: default_max_number_of_peers(),
            max_number_of_outgoing_connections: default_max_number_of_outgoing_connections(),
            max_name_length: default_max_name_length(),
        }
    }
}

fn default_max_number_of_peers() -> usize {
    32
}

fn default_max_number_of_outgoing_connections() -> usize {
    16
}

fn default_max_name_length() -> usize {
    32
}

/// Hard deadlines of the connection lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_connecting_timeout_ms")]
    pub connecting_timeout_ms: u64,
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            connecting_timeout_ms: default_connecting_timeout_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
        }
    }
}

impl TimeoutsConfig {
    pub fn connecting_timeout(&self) -> Duration {
        Duration::from_millis(self.connecting_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

fn default_connecting_timeout_ms() -> u64 {
    30_000
}

fn default_ping_timeout_ms() -> u64 {
    5_000
}

/// Binary frame sizes on the unordered channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Total frame size (header + payload)
    #[serde(default = "default_whole_size")]
    pub whole_size: usize,
    /// Zero-padded JSON header size
    #[serde(default = "default_metadata_size")]
    pub metadata_size: usize,
    /// bufferedAmountLowThreshold of the unordered channel
    #[serde(default = "default_unordered_low_threshold")]
    pub unordered_low_threshold: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            whole_size: default_whole_size(),
            metadata_size: default_metadata_size(),
            unordered_low_threshold: default_unordered_low_threshold(),
        }
    }
}

impl ChunkConfig {
    /// Payload bytes available in one frame
    pub fn data_chunk_size(&self) -> usize {
        self.whole_size.saturating_sub(self.metadata_size)
    }
}

fn default_whole_size() -> usize {
    16 * 1024
}

fn default_metadata_size() -> usize {
    100
}

fn default_unordered_low_threshold() -> usize {
    1024 * 1024
}

/// ICE server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtcConfig {
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,
    #[serde(default)]
    pub turn: Option<TurnConfig>,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            turn: None,
        }
    }
}

fn default_ice_servers() -> Vec<String> {
    DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect()
}

/// Relay (TURN) server with credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

/// Gossip timing and sampling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Upper bound of the random delay added to each interval
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    #[serde(default = "default_max_age_ms")]
    pub max_age_ms: u64,
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_interval_ms(),
            jitter_ms: default_jitter_ms(),
            max_age_ms: default_max_age_ms(),
            sample_size: default_sample_size(),
        }
    }
}

fn default_interval_ms() -> u64 {
    10_000
}

fn default_jitter_ms() -> u64 {
    5_000
}

fn default_max_age_ms() -> u64 {
    60_000
}

fn default_sample_size() -> usize {
    3
}

/// Connector policy switches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    #[serde(default = "default_true")]
    pub autoconnect: bool,
    #[serde(default = "default_true")]
    pub autoreconnect: bool,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            autoconnect: true,
            autoreconnect: true,
        }
    }
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load config from file, or create default if doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = get_config_path();

        if config_path.exists() {
            let content = fs::read_to_string(&config_path)
                .context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Load config, returning default on any error (no panic)
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        let config_path = get_config_path();

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&config_path, content)?;

        Ok(())
    }
}

/// Get the meshlink directory (~/.meshlink)
pub fn get_meshlink_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("MESHLINK_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".meshlink")
}

/// Get the config file path (~/.meshlink/config.toml)
pub fn get_config_path() -> PathBuf {
    get_meshlink_dir().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.limits.max_number_of_peers, 32);
        assert_eq!(config.chunk.whole_size, 16384);
        assert_eq!(config.chunk.metadata_size, 100);
        assert!(!config.rtc.ice_servers.is_empty());
        assert!(config.connector.autoconnect);
    }

    #[test]
    fn test_data_chunk_size() {
        let config = ChunkConfig::default();
        assert_eq!(config.data_chunk_size(), 16284);
    }

    #[test]
    fn test_parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.timeouts.ping_timeout_ms, 5000);
        assert_eq!(config.discovery.sample_size, 3);
    }

    #[test]
    fn test_parse_partial_config() {
        let toml = r#"
[limits]
max_number_of_peers = 1

[connector]
autoreconnect = false
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.limits.max_number_of_peers, 1);
        assert_eq!(config.limits.max_number_of_outgoing_connections, 16);
        assert!(config.connector.autoconnect);
        assert!(!config.connector.autoreconnect);
    }

    #[test]
    fn test_parse_turn_server() {
        let toml = r#"
[rtc.turn]
urls = ["turn:turn.example.org:3478"]
username = "user"
credential = "secret"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let turn = config.rtc.turn.unwrap();
        assert_eq!(turn.urls, vec!["turn:turn.example.org:3478"]);
        assert!(!config.rtc.ice_servers.is_empty());
    }

    #[test]
    fn test_timeouts_as_durations() {
        let config = TimeoutsConfig {
            connecting_timeout_ms: 1500,
            ping_timeout_ms: 250,
        };
        assert_eq!(config.connecting_timeout(), Duration::from_millis(1500));
        assert_eq!(config.ping_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_roundtrip_toml() {
        let mut config = Config::default();
        config.limits.max_name_length = 12;
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.limits.max_name_length, 12);
    }
}
