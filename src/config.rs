// src/config.rs
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;
use anyhow::{Context, Result};

use crate::tls::MAX_RECORD_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Relay,
    Mutator,
    Both,
}

impl Mode {
    pub fn runs_relay(self) -> bool {
        matches!(self, Mode::Relay | Mode::Both)
    }

    pub fn runs_mutator(self) -> bool {
        matches!(self, Mode::Mutator | Mode::Both)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mode: Mode,
    pub relay: RelayConfig,
    pub mutator: MutatorConfig,
    pub obfuscation: ObfuscationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub upstream_port: u16,
    pub first_record_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub max_record_len: usize,
    pub fallback: FallbackPolicy,
}

/// What to do with a connection whose first record is not a ClientHello.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "lowercase")]
pub enum FallbackPolicy {
    Drop,
    Relay { address: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MutatorConfig {
    pub device: DeviceConfig,
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub max_flows: usize,
    pub max_pending: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DeviceConfig {
    Tun { name: String },
    Nfqueue { queue_num: u16 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObfuscationConfig {
    pub remove_sni: bool,
    pub padding: PaddingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PaddingConfig {
    None,
    Fixed { size: u16 },
    Random { min: u16, max: u16 },
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let PaddingConfig::Random { min, max } = self.obfuscation.padding {
            anyhow::ensure!(min <= max, "padding range {}..={} is empty", min, max);
        }
        anyhow::ensure!(self.relay.first_record_timeout_secs > 0, "first_record_timeout_secs must be positive");
        anyhow::ensure!(self.mutator.max_flows > 0, "max_flows must be positive");
        Ok(())
    }
}

impl RelayConfig {
    pub fn first_record_timeout(&self) -> Duration {
        Duration::from_secs(self.first_record_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl MutatorConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mode: Mode::Relay,
            relay: RelayConfig::default(),
            mutator: MutatorConfig::default(),
            obfuscation: ObfuscationConfig::default(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8001)),
            upstream_port: 443,
            first_record_timeout_secs: 10,
            connect_timeout_secs: 10,
            max_record_len: MAX_RECORD_LEN,
            fallback: FallbackPolicy::Drop,
        }
    }
}

impl Default for MutatorConfig {
    fn default() -> Self {
        MutatorConfig {
            device: DeviceConfig::Tun { name: "tun0".to_string() },
            idle_timeout_secs: 120,
            sweep_interval_secs: 10,
            max_flows: 65536,
            max_pending: MAX_RECORD_LEN,
        }
    }
}

impl Default for ObfuscationConfig {
    fn default() -> Self {
        ObfuscationConfig {
            remove_sni: true,
            padding: PaddingConfig::Fixed { size: 256 },
        }
    }
}
