use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hotkey::parse_hotkey;

pub const APP_DIR_NAME: &str = "searchy";
pub const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub hotkey: String,
    pub backend: BackendConfig,
    pub health: HealthConfig,
    pub search: SearchConfig,
    pub cache: CacheConfig,
    #[serde(skip)]
    pub config_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    pub program: String,
    /// Argument template; `{port}` and `{marker}` are substituted at spawn time.
    pub args: Vec<String>,
    pub role_marker: String,
    pub host: String,
    pub base_port: u16,
    pub port_retries: u16,
    pub stop_grace_ms: u64,
    pub startup_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    pub initial_delay_ms: u64,
    pub backoff_factor: u32,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    pub probe_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EmptyQueryPolicy {
    Recent,
    Clear,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SearchConfig {
    pub debounce_ms: u64,
    pub default_limit: u32,
    pub default_threshold: f32,
    pub request_timeout_ms: u64,
    pub recent_count: u32,
    pub empty_query: EmptyQueryPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub max_bytes: u64,
    pub canvas_width: u32,
    pub canvas_height: u32,
    pub failure_retry_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hotkey: "Ctrl+Shift+Space".to_string(),
            backend: BackendConfig::default(),
            health: HealthConfig::default(),
            search: SearchConfig::default(),
            cache: CacheConfig::default(),
            config_path: stable_app_data_dir().join(CONFIG_FILE_NAME),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec![
                "server.py".to_string(),
                "--port".to_string(),
                "{port}".to_string(),
                "--instance-marker={marker}".to_string(),
            ],
            role_marker: "searchy-backend".to_string(),
            host: "127.0.0.1".to_string(),
            base_port: 7860,
            port_retries: 20,
            stop_grace_ms: 2_000,
            startup_attempts: 3,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 250,
            backoff_factor: 2,
            max_delay_ms: 4_000,
            max_attempts: 10,
            probe_timeout_ms: 1_000,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 400,
            default_limit: 40,
            default_threshold: 0.0,
            request_timeout_ms: 10_000,
            recent_count: 40,
            empty_query: EmptyQueryPolicy::Recent,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 64 * 1024 * 1024,
            canvas_width: 256,
            canvas_height: 256,
            failure_retry_ms: 30_000,
        }
    }
}

impl BackendConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

impl HealthConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl SearchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl CacheConfig {
    pub fn failure_retry(&self) -> Duration {
        Duration::from_millis(self.failure_retry_ms)
    }
}

pub fn stable_app_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR_NAME)
}

pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let config_path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| stable_app_data_dir().join(CONFIG_FILE_NAME));

    let mut config = match fs::read_to_string(&config_path) {
        Ok(raw) => toml::from_str::<Config>(&raw)?,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Config::default(),
        Err(error) => return Err(error.into()),
    };
    config.config_path = config_path;

    validate(&config).map_err(ConfigError::Invalid)?;
    Ok(config)
}

pub fn save(config: &Config) -> Result<(), ConfigError> {
    validate(config).map_err(ConfigError::Invalid)?;
    let path = config_path_or_default(config);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let encoded = toml::to_string_pretty(config)?;
    fs::write(&path, encoded)?;
    Ok(())
}

fn config_path_or_default(config: &Config) -> PathBuf {
    if config.config_path.as_os_str().is_empty() {
        stable_app_data_dir().join(CONFIG_FILE_NAME)
    } else {
        config.config_path.clone()
    }
}

/// Ports are probed on IPv4 loopback, so the backend must be reached there too.
fn is_loopback_host(host: &str) -> bool {
    let host = host.trim();
    host.eq_ignore_ascii_case("localhost")
        || host.parse::<Ipv4Addr>().is_ok_and(|addr| addr.is_loopback())
}

pub fn validate(cfg: &Config) -> Result<(), String> {
    parse_hotkey(&cfg.hotkey).map_err(|error| format!("hotkey: {error}"))?;

    let backend = &cfg.backend;
    if backend.program.trim().is_empty() {
        return Err("backend.program is required".into());
    }
    if backend.role_marker.trim().is_empty() {
        return Err("backend.role_marker is required".into());
    }
    if backend.host.trim().is_empty() {
        return Err("backend.host is required".into());
    }
    if !is_loopback_host(&backend.host) {
        return Err(format!(
            "backend.host '{}' must be localhost or an IPv4 loopback address",
            backend.host
        ));
    }
    if backend.base_port == 0 {
        return Err("backend.base_port must be non-zero".into());
    }
    if backend.port_retries == 0 {
        return Err("backend.port_retries must be at least 1".into());
    }
    if u32::from(backend.base_port) + u32::from(backend.port_retries) - 1 > u32::from(u16::MAX) {
        return Err("backend port range exceeds 65535".into());
    }
    if backend.startup_attempts == 0 {
        return Err("backend.startup_attempts must be at least 1".into());
    }

    let health = &cfg.health;
    if health.max_attempts == 0 {
        return Err("health.max_attempts must be at least 1".into());
    }
    if health.backoff_factor == 0 {
        return Err("health.backoff_factor must be at least 1".into());
    }
    if health.probe_timeout_ms == 0 {
        return Err("health.probe_timeout_ms must be non-zero".into());
    }

    let search = &cfg.search;
    if search.debounce_ms > 2_000 {
        return Err("search.debounce_ms out of range".into());
    }
    if search.default_limit == 0 {
        return Err("search.default_limit must be at least 1".into());
    }
    if search.request_timeout_ms == 0 {
        return Err("search.request_timeout_ms must be non-zero".into());
    }

    let cache = &cfg.cache;
    if cache.max_bytes == 0 {
        return Err("cache.max_bytes must be non-zero".into());
    }
    if cache.canvas_width == 0 || cache.canvas_height == 0 {
        return Err("cache canvas must be non-empty".into());
    }

    Ok(())
}
