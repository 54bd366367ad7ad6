// src/config.rs
use crate::modules::listener::{validate_key, ConfigPath};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "registry-watcher.toml";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub trigger: TriggerConfig,
    #[serde(default = "default_false")]
    pub one_shot: bool,
    #[serde(default)]
    pub kv_watches: Vec<KvWatchConfig>,
    #[serde(default)]
    pub service_watches: Vec<ServiceWatchConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Turns KV reads into blocking queries that wait up to this long for a change.
    #[serde(default)]
    pub blocking_wait_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TriggerConfig {
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    #[serde(default = "default_log_interval_secs")]
    pub log_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KvWatchConfig {
    pub project: String,
    #[serde(default = "default_env")]
    pub env: String,
    pub feature: String,
    pub service: String,
    #[serde(default = "default_detail")]
    pub detail: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceWatchConfig {
    pub service_key: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

fn default_false() -> bool {
    false
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8500
}

fn default_api_version() -> String {
    "v1".to_string()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_stop_timeout_ms() -> u64 {
    5_000
}

fn default_log_interval_secs() -> u64 {
    60
}

fn default_env() -> String {
    "dev".to_string()
}

fn default_detail() -> String {
    "config".to_string()
}

fn default_interval_secs() -> u64 {
    10
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            host: default_host(),
            port: default_port(),
            api_version: default_api_version(),
            token: None,
            request_timeout_ms: default_request_timeout_ms(),
            blocking_wait_secs: None,
        }
    }
}

impl RegistryConfig {
    pub fn base_url(&self) -> String {
        format!(
            "{}://{}:{}/{}",
            self.scheme,
            self.host,
            self.port,
            self.api_version.trim_matches('/')
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn blocking_wait(&self) -> Option<Duration> {
        self.blocking_wait_secs.map(Duration::from_secs)
    }
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: default_stop_timeout_ms(),
            log_interval_secs: default_log_interval_secs(),
        }
    }
}

impl TriggerConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn log_interval(&self) -> Duration {
        Duration::from_secs(self.log_interval_secs)
    }
}

impl KvWatchConfig {
    pub fn config_path(&self) -> crate::error::Result<ConfigPath> {
        ConfigPath::new(&self.project, &self.feature, &self.service)?
            .with_env(&self.env)?
            .with_detail(&self.detail)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl ServiceWatchConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Config {
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let path = config_path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file: {:?}", path))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML from config file: {:?}", path))?;
        config
            .validate()
            .with_context(|| format!("Invalid configuration in {:?}", path))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.registry.host.is_empty() {
            bail!("registry.host must not be empty");
        }
        if !matches!(self.registry.scheme.as_str(), "http" | "https") {
            bail!("registry.scheme must be http or https, got {}", self.registry.scheme);
        }
        if self.registry.request_timeout_ms == 0 {
            bail!("registry.request_timeout_ms must be greater than zero");
        }
        for watch in &self.kv_watches {
            if watch.interval_secs == 0 {
                bail!("kv watch {}/{} has a zero interval", watch.project, watch.service);
            }
            watch.config_path()?;
        }
        for watch in &self.service_watches {
            if watch.interval_secs == 0 {
                bail!("service watch {} has a zero interval", watch.service_key);
            }
            validate_key(&watch.service_key)?;
        }
        Ok(())
    }
}
