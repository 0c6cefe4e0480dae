//! Server configuration: an optional TOML file layered with CLI overrides
//! (spec §4.11, §6).

use serde::Deserialize;

fn default_port() -> u16 {
    5555
}

fn default_executor_threads() -> usize {
    2
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_packet_size() -> usize {
    32768
}

fn default_transport_size() -> usize {
    4096
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    #[serde(default = "default_executor_threads")]
    pub threads: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            threads: default_executor_threads(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_packet_size")]
    pub packet_size: usize,
    #[serde(default = "default_transport_size")]
    pub transport_size: usize,
    #[serde(default = "default_false")]
    pub allow_inbound_rle: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            packet_size: default_packet_size(),
            transport_size: default_transport_size(),
            allow_inbound_rle: default_false(),
        }
    }
}

/// Top-level configuration, loaded from an optional TOML file and overridden
/// by CLI flags. `Config::default()` is always a complete, working
/// configuration; no file is required.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default = "default_true")]
    pub ack_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: ListenConfig::default(),
            executor: ExecutorConfig::default(),
            transport: TransportConfig::default(),
            ack_mode: default_true(),
        }
    }
}

impl Config {
    /// Parses a TOML document, falling back to field defaults for anything
    /// it omits.
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.transport.timeout_ms)
    }
}
