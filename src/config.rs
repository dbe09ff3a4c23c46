//! Configuration loading and types for the gateway.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! system: networking, authentication, metadata persistence, blob
//! storage, quotas, multipart housekeeping, the RPC listener and logging.

use garde::Validate;
use serde::Deserialize;
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Validate, Default)]
pub struct Config {
    /// S3 HTTP listener settings.
    #[serde(default)]
    #[garde(dive)]
    pub server: ServerConfig,

    /// Authentication settings and the bootstrap credential.
    #[serde(default)]
    #[garde(dive)]
    pub auth: AuthConfig,

    /// Metadata repository settings.
    #[serde(default)]
    #[garde(dive)]
    pub metadata: MetadataConfig,

    /// Blob store settings.
    #[serde(default)]
    #[garde(dive)]
    pub storage: StorageConfig,

    /// Per-user storage quota defaults.
    #[serde(default)]
    #[garde(skip)]
    pub quota: QuotaConfig,

    /// Multipart upload limits and housekeeping.
    #[serde(default)]
    #[garde(dive)]
    pub multipart: MultipartConfig,

    /// RPC/JSON listener settings.
    #[serde(default)]
    #[garde(dive)]
    pub rpc: RpcConfig,

    /// Logging settings.
    #[serde(default)]
    #[garde(dive)]
    pub logging: LoggingConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    #[garde(length(min = 1))]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    #[garde(range(min = 1))]
    pub port: u16,

    /// AWS region to present (e.g. `us-east-1`).
    #[serde(default = "default_region")]
    #[garde(length(min = 1))]
    pub region: String,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    #[garde(skip)]
    pub shutdown_timeout: u64,

    /// Maximum object size in bytes (default 5 GiB).
    #[serde(default = "default_max_object_size")]
    #[garde(range(min = 1))]
    pub max_object_size: u64,

    /// Upper bound in seconds for one request, including body streaming.
    #[serde(default = "default_request_timeout")]
    #[garde(range(min = 1))]
    pub request_timeout: u64,

    /// Bodies larger than this are never buffered in memory.
    #[serde(default = "default_stream_threshold")]
    #[garde(range(min = 1))]
    pub stream_threshold: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            region: default_region(),
            shutdown_timeout: default_shutdown_timeout(),
            max_object_size: default_max_object_size(),
            request_timeout: default_request_timeout(),
            stream_threshold: default_stream_threshold(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    #[garde(length(min = 1))]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    #[garde(pattern(r"^(text|json)$"))]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Authentication settings.
///
/// The access/secret pair is seeded into the credential store on every
/// startup so a fresh deployment is immediately usable.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AuthConfig {
    /// When false every request runs as the bootstrap identity.
    #[serde(default = "default_true")]
    #[garde(skip)]
    pub enabled: bool,

    /// Access key (also accepts `access_key_id`).
    #[serde(alias = "access_key_id", default = "default_access_key")]
    #[garde(length(min = 1))]
    pub access_key: String,

    /// Secret access key (also accepts `secret_access_key`).
    #[serde(alias = "secret_access_key", default = "default_secret_key")]
    #[garde(length(min = 1))]
    pub secret_key: String,

    /// Owner identity the bootstrap credential belongs to.
    #[serde(default = "default_owner_id")]
    #[garde(length(min = 1))]
    pub owner_id: String,

    #[serde(default = "default_owner_id")]
    #[garde(skip)]
    pub display_name: String,

    /// Allowed distance between `x-amz-date` and the server clock, in seconds.
    #[serde(default = "default_clock_skew")]
    #[garde(range(min = 1))]
    pub clock_skew: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            access_key: default_access_key(),
            secret_key: default_secret_key(),
            owner_id: default_owner_id(),
            display_name: default_owner_id(),
            clock_skew: default_clock_skew(),
        }
    }
}

/// Metadata store configuration.
#[derive(Debug, Clone, Deserialize, Validate, Default)]
pub struct MetadataConfig {
    /// SQLite-specific configuration.
    #[serde(default)]
    #[garde(dive)]
    pub sqlite: SqliteConfig,
}

/// SQLite-specific metadata configuration.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SqliteConfig {
    /// Path to the SQLite database file, or `:memory:`.
    #[serde(default = "default_metadata_path")]
    #[garde(length(min = 1))]
    pub path: String,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: default_metadata_path(),
        }
    }
}

/// Blob storage configuration.
#[derive(Debug, Clone, Deserialize, Validate, Default)]
pub struct StorageConfig {
    /// Local storage configuration.
    #[serde(default)]
    #[garde(dive)]
    pub local: LocalStorageConfig,
}

/// Local filesystem storage configuration.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct LocalStorageConfig {
    /// Root directory holding bucket volumes, temp files and parts.
    #[serde(default = "default_storage_root")]
    #[garde(length(min = 1))]
    pub root_dir: String,
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            root_dir: default_storage_root(),
        }
    }
}

/// Storage quota defaults applied when a user is first seen.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct QuotaConfig {
    /// Bytes; absent means unlimited.
    #[serde(default)]
    pub default_user_quota: Option<i64>,
}

/// Multipart upload settings.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct MultipartConfig {
    /// Minimum size of every part except the last.
    #[serde(default = "default_min_part_size")]
    #[garde(skip)]
    pub min_part_size: u64,

    /// Uploads older than this many seconds are reaped at startup.
    #[serde(default = "default_upload_ttl")]
    #[garde(range(min = 1))]
    pub upload_ttl: u64,
}

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            min_part_size: default_min_part_size(),
            upload_ttl: default_upload_ttl(),
        }
    }
}

/// RPC/JSON listener configuration.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RpcConfig {
    #[serde(default = "default_true")]
    #[garde(skip)]
    pub enabled: bool,

    #[serde(default = "default_host")]
    #[garde(length(min = 1))]
    pub host: String,

    #[serde(default = "default_rpc_port")]
    #[garde(range(min = 1))]
    pub port: u16,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_rpc_port(),
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9012
}

fn default_rpc_port() -> u16 {
    9013
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_access_key() -> String {
    "gateway".to_string()
}

fn default_secret_key() -> String {
    "gateway-secret".to_string()
}

fn default_owner_id() -> String {
    "gateway".to_string()
}

fn default_clock_skew() -> i64 {
    900
}

fn default_metadata_path() -> String {
    "./data/metadata.db".to_string()
}

fn default_storage_root() -> String {
    "./data/objects".to_string()
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_max_object_size() -> u64 {
    5_368_709_120 // 5 GiB
}

fn default_request_timeout() -> u64 {
    300
}

fn default_stream_threshold() -> u64 {
    100 * 1024 * 1024
}

fn default_min_part_size() -> u64 {
    5 * 1024 * 1024
}

fn default_upload_ttl() -> u64 {
    7 * 24 * 3600
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load, parse and validate configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    parse_config(&contents)
}

/// Parse and validate configuration from YAML text.
pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
    let config: Config = if contents.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(contents)?
    };
    config
        .validate()
        .map_err(|report| anyhow::anyhow!("invalid configuration: {report}"))?;
    Ok(config)
}
