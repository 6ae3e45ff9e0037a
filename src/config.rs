//! Configuration loading and types for casgate.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! system: networking, client authentication, the backing store, upload
//! signing, bulk reconciliation, logging and observability.
//!
//! Secrets may be supplied through the environment instead of the file:
//! `CASGATE_CLIENT_SECRET`, `CASGATE_SIGNER_ACCESS_KEY_ID` and
//! `CASGATE_SIGNER_SECRET_ACCESS_KEY` override their YAML counterparts.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::Path;

/// Env var overriding `auth.client_secret`.
pub const ENV_CLIENT_SECRET: &str = "CASGATE_CLIENT_SECRET";
/// Env var overriding `signer.access_key_id`.
pub const ENV_SIGNER_ACCESS_KEY_ID: &str = "CASGATE_SIGNER_ACCESS_KEY_ID";
/// Env var overriding `signer.secret_access_key`.
pub const ENV_SIGNER_SECRET_ACCESS_KEY: &str = "CASGATE_SIGNER_SECRET_ACCESS_KEY";

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Client authentication settings.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Backing store settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Upload-authorization signing settings.
    #[serde(default)]
    pub signer: SignerConfig,

    /// Bulk query/sync settings.
    #[serde(default)]
    pub reconcile: ReconcileConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings (metrics + health probe).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,

    /// Maximum body size of a direct upload in bytes (default 100 MiB).
    #[serde(default = "default_max_object_size")]
    pub max_object_size: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout: default_shutdown_timeout(),
            max_object_size: default_max_object_size(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
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

/// Observability settings.
///
/// Controls Prometheus metrics collection and the `/health` probe.
/// Both are enabled by default.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,

    /// Enable the `/health` endpoint.
    #[serde(default = "default_true")]
    pub health_check: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics: true,
            health_check: true,
        }
    }
}

/// Client authentication settings.
#[derive(Clone, Deserialize, Default)]
pub struct AuthConfig {
    /// Shared secret expected in `x-client-secret`.  Empty rejects every
    /// mutating request.
    #[serde(default)]
    pub client_secret: String,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// Backing store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend type: `memory`, `local` or `aws`.
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Prefix every object key lives under.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Local storage configuration.
    #[serde(default)]
    pub local: LocalStorageConfig,

    /// Memory storage configuration.
    #[serde(default)]
    pub memory: MemoryStorageConfig,

    /// S3-compatible store configuration.
    #[serde(default)]
    pub aws: Option<AwsStorageConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            key_prefix: default_key_prefix(),
            local: LocalStorageConfig::default(),
            memory: MemoryStorageConfig::default(),
            aws: None,
        }
    }
}

/// Local filesystem storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalStorageConfig {
    /// Root directory for stored objects.
    #[serde(default = "default_storage_root")]
    pub root_dir: String,
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            root_dir: default_storage_root(),
        }
    }
}

/// Memory storage backend configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MemoryStorageConfig {
    /// Maximum total size in bytes (0 = unlimited).
    #[serde(default)]
    pub max_size_bytes: u64,
}

/// S3-compatible store configuration.
#[derive(Clone, Deserialize)]
pub struct AwsStorageConfig {
    /// Backing bucket name.
    pub bucket: String,
    /// Region.
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom S3-compatible endpoint (e.g. R2, MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: String,
    /// Force path-style URL addressing.
    #[serde(default)]
    pub use_path_style: bool,
    /// Explicit access key (falls back to env/credential chain).
    #[serde(default)]
    pub access_key_id: String,
    /// Explicit secret key (falls back to env/credential chain).
    #[serde(default)]
    pub secret_access_key: String,
}

impl std::fmt::Debug for AwsStorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsStorageConfig")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint_url", &self.endpoint_url)
            .field("use_path_style", &self.use_path_style)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Presigned upload signing configuration.
#[derive(Clone, Deserialize)]
pub struct SignerConfig {
    /// Store endpoint clients upload to (scheme + host[:port]).
    #[serde(default = "default_signer_endpoint")]
    pub endpoint: String,
    /// Bucket addressed path-style under the endpoint.
    #[serde(default)]
    pub bucket: String,
    /// Signing region.
    #[serde(default = "default_signer_region")]
    pub region: String,
    /// Access key ID embedded in presigned URLs.
    #[serde(default)]
    pub access_key_id: String,
    /// Secret used to sign.
    #[serde(default)]
    pub secret_access_key: String,
    /// Validity of an authorization in seconds.
    #[serde(default = "default_expires_seconds")]
    pub expires_seconds: u64,
    /// `If-Unmodified-Since` used for create-only authorizations.
    #[serde(default = "crate::presign::default_min_unmodified_since")]
    pub min_unmodified_since: DateTime<Utc>,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            endpoint: default_signer_endpoint(),
            bucket: String::new(),
            region: default_signer_region(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            expires_seconds: default_expires_seconds(),
            min_unmodified_since: crate::presign::default_min_unmodified_since(),
        }
    }
}

impl std::fmt::Debug for SignerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignerConfig")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("expires_seconds", &self.expires_seconds)
            .field("min_unmodified_since", &self.min_unmodified_since)
            .finish()
    }
}

/// Bulk query/sync configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    /// Largest accepted batch.
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
    /// Concurrent store probes per request.
    #[serde(default = "default_max_concurrent_probes")]
    pub max_concurrent_probes: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            max_batch: default_max_batch(),
            max_concurrent_probes: default_max_concurrent_probes(),
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

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_storage_backend() -> String {
    "memory".to_string()
}

fn default_key_prefix() -> String {
    crate::hash::OBJECT_KEY_PREFIX.to_string()
}

fn default_storage_root() -> String {
    "./data/objects".to_string()
}

fn default_signer_endpoint() -> String {
    "http://localhost:9000".to_string()
}

fn default_signer_region() -> String {
    "auto".to_string()
}

fn default_expires_seconds() -> u64 {
    crate::presign::DEFAULT_EXPIRES_SECONDS
}

fn default_max_batch() -> usize {
    crate::reconcile::MAX_BATCH
}

fn default_max_concurrent_probes() -> usize {
    crate::reconcile::DEFAULT_MAX_CONCURRENT_PROBES
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_max_object_size() -> u64 {
    104_857_600 // 100 MiB
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`, then apply
/// environment overrides.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let mut config = parse_config(&contents)?;
    config.apply_env_overrides(|name| std::env::var(name).ok());
    Ok(config)
}

/// Parse configuration from YAML text.
pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
    // An empty document deserializes to unit, not a mapping.
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
}

impl Config {
    /// Overwrite secrets with non-empty values returned by `lookup`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());
        if let Some(secret) = get(ENV_CLIENT_SECRET) {
            self.auth.client_secret = secret;
        }
        if let Some(key) = get(ENV_SIGNER_ACCESS_KEY_ID) {
            self.signer.access_key_id = key;
        }
        if let Some(secret) = get(ENV_SIGNER_SECRET_ACCESS_KEY) {
            self.signer.secret_access_key = secret;
        }
    }
}
