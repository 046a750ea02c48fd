//! Configuration parsing and resolution for alyx

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Full configuration for alyx
#[derive(Debug, Clone, Deserialize)]
pub struct AlyxConfig {
    pub functions: FunctionsConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    pub server: Option<ServerConfig>,
    #[serde(default)]
    pub webhooks: WebhooksConfig,
    pub auth: Option<AuthConfig>,
}

/// Function discovery configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FunctionsConfig {
    /// Directory scanned for function subdirectories
    pub dir: PathBuf,
    /// Environment variables passed to every function (function env wins)
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Base URL functions use to call back into the host.
    /// Defaults to http://{server.host}:{server.port}.
    pub alyx_url: Option<String>,
}

/// SQLite database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("alyx.db")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Storage configuration: named backends plus bucket definitions
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// Directory where in-progress uploads are spooled
    #[serde(default = "default_spool_dir")]
    pub spool_dir: PathBuf,
    #[serde(default)]
    pub backends: HashMap<String, BackendConfig>,
    #[serde(default)]
    pub buckets: HashMap<String, BucketConfig>,
}

fn default_spool_dir() -> PathBuf {
    PathBuf::from("uploads")
}

/// One storage backend definition
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    Filesystem {
        base_path: PathBuf,
    },
    S3 {
        endpoint: Option<String>,
        #[serde(default = "default_region")]
        region: String,
        access_key: ConfigValue,
        secret_key: ConfigValue,
        bucket_prefix: Option<String>,
        #[serde(default)]
        force_path_style: bool,
    },
}

fn default_region() -> String {
    "auto".to_string()
}

/// Per-bucket policy
#[derive(Debug, Clone, Deserialize)]
pub struct BucketConfig {
    /// Name of the backend (key in `storage.backends`) serving this bucket
    pub backend: String,
    /// Maximum file size in bytes accepted at upload finalize
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Allowed MIME types; `type/*` wildcards supported. Empty = allow all.
    #[serde(default)]
    pub allowed_mime: Vec<String>,
    /// Transparent compression applied by the backend decorator
    pub compression: Option<CompressionType>,
}

fn default_max_file_size() -> u64 {
    // 50 MB
    50 * 1024 * 1024
}

/// Supported streaming compression codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    Gzip,
    Zstd,
}

impl CompressionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionType::Gzip => "gzip",
            CompressionType::Zstd => "zstd",
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
    #[serde(default)]
    pub behind_proxy: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8090
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: vec![],
            behind_proxy: false,
        }
    }
}

/// Webhook delivery and gateway configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WebhooksConfig {
    /// Maximum delivery attempts before a queued webhook moves to the DLQ
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base backoff delay in milliseconds (doubled per attempt)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Queue poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Maximum inbound webhook body size in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Allow outbound delivery to private/internal addresses
    /// (development only; the SSRF screen is on by default)
    #[serde(default)]
    pub allow_private_endpoints: bool,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

impl Default for WebhooksConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            max_body_bytes: default_max_body_bytes(),
            allow_private_endpoints: false,
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Admin API bearer token
    pub api_token: Option<ConfigValue>,
    /// HMAC secret for signed file URLs
    pub url_signing_secret: Option<ConfigValue>,
}

/// A config value that can be a literal or env var reference
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Literal(String),
}

impl ConfigValue {
    /// Resolve the value, reading from env if it starts with "env:"
    pub fn resolve(&self) -> Result<String> {
        match self {
            ConfigValue::Literal(s) => {
                if let Some(var_name) = s.strip_prefix("env:") {
                    std::env::var(var_name).map_err(|_| {
                        Error::Config(format!("Environment variable {} not set", var_name))
                    })
                } else {
                    Ok(s.clone())
                }
            }
        }
    }
}

/// Wrapper for loading config from file
pub struct Config;

impl Config {
    /// Load config from a specific path
    pub fn from_path(path: &Path) -> Result<AlyxConfig> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| Error::ConfigParse {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Resolve config file path using the resolution order:
/// 1. Explicit path if provided
/// 2. ALYX_CONFIG env var
/// 3. alyx.toml in current directory
/// 4. Walk up ancestors looking for alyx.toml
/// 5. ~/.config/alyx/config.toml (user default)
/// 6. /etc/alyx/config.toml (system default)
pub fn resolve_config(explicit_path: Option<&Path>) -> Result<AlyxConfig> {
    let mut searched = Vec::new();

    // 1. Explicit path
    if let Some(path) = explicit_path {
        if path.exists() {
            return Config::from_path(path);
        }
        searched.push(path.to_path_buf());
    }

    // 2. ALYX_CONFIG env var
    if let Ok(env_path) = std::env::var("ALYX_CONFIG") {
        let path = PathBuf::from(&env_path);
        if path.exists() {
            return Config::from_path(&path);
        }
        searched.push(path);
    }

    // 3 & 4. Current directory and ancestors
    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = Some(cwd.as_path());
        while let Some(d) = dir {
            let config_path = d.join("alyx.toml");
            if config_path.exists() {
                return Config::from_path(&config_path);
            }
            searched.push(config_path);
            dir = d.parent();
        }
    }

    // 5. User default (~/.config/alyx/config.toml)
    if let Some(config_dir) = dirs::config_dir() {
        let user_config = config_dir.join("alyx").join("config.toml");
        if user_config.exists() {
            return Config::from_path(&user_config);
        }
        searched.push(user_config);
    }

    // 6. System default (/etc/alyx/config.toml)
    let system_config = PathBuf::from("/etc/alyx/config.toml");
    if system_config.exists() {
        return Config::from_path(&system_config);
    }
    searched.push(system_config);

    Err(Error::ConfigNotFound { searched })
}
