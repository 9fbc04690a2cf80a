use anyhow::{Context, Result};
use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CacheSettings;
use crate::constants::{
    DEFAULT_CHUNK_SIZE, DEFAULT_GATEWAY_HOST, DEFAULT_GATEWAY_PORT, DEFAULT_SIZE_LIMIT_BYTES,
    REGISTRY_SWEEP_INTERVAL_SECS, RETENTION_1_WEEK, RUNTIME_STARTUP_TIMEOUT_MS,
    RUNTIME_STOP_TIMEOUT_MS, TOKEN_IDLE_TIMEOUT_SECS,
};

const APP_NAME: &str = "shadow-stream";
const LOCAL_CONFIG: &str = ".shadow-stream/config.toml";
const ENV_PREFIX: &str = "SHADOW_STREAM_";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Local HTTP gateway
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// On-disk cache
    #[serde(default)]
    pub cache: CacheConfig,

    /// Worker runtime
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Media source
    #[serde(default)]
    pub backend: BackendConfig,
}

/// HTTP gateway configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Bind address, loopback by default
    pub host: String,
    /// Bind port, 0 picks an ephemeral port
    pub port: u16,
    /// Bytes per relayed chunk
    pub chunk_size: usize,
    /// Seconds a token may sit unused before it is dropped (0 = never)
    pub token_idle_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_GATEWAY_HOST.to_string(),
            port: DEFAULT_GATEWAY_PORT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            token_idle_timeout_secs: TOKEN_IDLE_TIMEOUT_SECS,
        }
    }
}

impl GatewayConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.token_idle_timeout_secs > 0).then(|| Duration::from_secs(self.token_idle_timeout_secs))
    }
}

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache root; defaults to the platform cache directory
    pub directory: Option<PathBuf>,
    pub size_limit_bytes: u64,
    /// -1 keeps entries forever
    pub retention_seconds: i64,
    pub auto_cleanup_enabled: bool,
    /// Tee complete remote responses into the cache
    pub persist_full_downloads: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: None,
            size_limit_bytes: DEFAULT_SIZE_LIMIT_BYTES,
            retention_seconds: RETENTION_1_WEEK,
            auto_cleanup_enabled: true,
            persist_full_downloads: true,
        }
    }
}

impl CacheConfig {
    pub fn settings(&self) -> CacheSettings {
        CacheSettings {
            size_limit_bytes: self.size_limit_bytes,
            retention_seconds: self.retention_seconds,
            auto_cleanup_enabled: self.auto_cleanup_enabled,
        }
    }

    /// Configured directory, or the platform cache directory
    pub fn resolve_directory(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.directory {
            return Ok(dir.clone());
        }
        if let Some(proj_dirs) = ProjectDirs::from("", "", APP_NAME) {
            return Ok(proj_dirs.cache_dir().to_path_buf());
        }
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .context("Could not determine home directory")?;
        Ok(PathBuf::from(home).join(".cache").join(APP_NAME))
    }
}

/// Worker runtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Upper bound on how long `stop()` waits for the loop thread
    pub stop_timeout_ms: u64,
    /// Upper bound on how long `start()` waits for connect and bind
    pub startup_timeout_ms: u64,
    /// Look for the MP4 metadata box when preparing a stream
    pub probe_container_layout: bool,
    /// How often idle tokens are swept
    pub sweep_interval_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: RUNTIME_STOP_TIMEOUT_MS,
            startup_timeout_ms: RUNTIME_STARTUP_TIMEOUT_MS,
            probe_container_layout: true,
            sweep_interval_secs: REGISTRY_SWEEP_INTERVAL_SECS,
        }
    }
}

impl RuntimeConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Media source configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Directory laid out as `<chat_id>/<message_id>.<ext>`
    pub media_root: PathBuf,
    /// Local session state, deleted when found corrupt
    pub session_path: Option<PathBuf>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            media_root: PathBuf::from("media"),
            session_path: None,
        }
    }
}

/// Load configuration from multiple sources.
/// An explicit path replaces the global file; the local file and the
/// environment still apply on top.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let global_config = match explicit {
        Some(path) => path.to_path_buf(),
        None => get_config_dir()?.join("config.toml"),
    };
    let local_config = PathBuf::from(LOCAL_CONFIG);

    let mut figment = Figment::from(Serialized::defaults(Config::default()));

    if global_config.exists() {
        figment = figment.merge(Toml::file(&global_config));
    } else if explicit.is_some() {
        anyhow::bail!("Config file not found: {}", global_config.display());
    }

    if local_config.exists() {
        figment = figment.merge(Toml::file(&local_config));
    }

    // SHADOW_STREAM_GATEWAY__PORT=9000 sets gateway.port
    figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

    figment
        .extract()
        .context("Failed to load configuration")
}

/// Get the configuration directory
pub fn get_config_dir() -> Result<PathBuf> {
    if let Some(proj_dirs) = ProjectDirs::from("", "", APP_NAME) {
        let config_dir = proj_dirs.config_dir();
        std::fs::create_dir_all(config_dir)?;
        Ok(config_dir.to_path_buf())
    } else {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .context("Could not determine home directory")?;
        let config_dir = PathBuf::from(home).join(".config").join(APP_NAME);
        std::fs::create_dir_all(&config_dir)?;
        Ok(config_dir)
    }
}

/// Save configuration to file
pub fn save_config(config: &Config, path: Option<PathBuf>) -> Result<()> {
    let path = match path {
        Some(p) => p,
        None => get_config_dir()?.join("config.toml"),
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let toml_string = toml::to_string_pretty(config)?;
    std::fs::write(&path, toml_string)
        .with_context(|| format!("Failed to write config to {}", path.display()))?;

    Ok(())
}

/// Create a default configuration file if it doesn't exist.
/// Returns the path and whether it was newly written.
pub fn init_config(path: Option<PathBuf>) -> Result<(PathBuf, bool)> {
    let config_file = match path {
        Some(p) => p,
        None => get_config_dir()?.join("config.toml"),
    };

    if config_file.exists() {
        return Ok((config_file, false));
    }
    save_config(&Config::default(), Some(config_file.clone()))?;
    Ok((config_file, true))
}
