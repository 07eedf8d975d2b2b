//! SSL Cert Server configuration
//!
//! Loads the YAML configuration file, applies defaults and builds the
//! immutable values the certificate core is constructed from:
//!
//! - [`Config`] - the parsed document with defaults applied
//! - [`HostPolicy`] - the authorization predicate for automated issuance
//! - [`ManagedDomains`] - hostname to managed-certificate key table
//!
//! # Example
//!
//! ```yaml
//! storage:
//!   type: redis
//!   redis:
//!     addr: 127.0.0.1:6379
//!
//! managed:
//!   - pattern: '^(.+\.)?example\.com$'
//!     cert: example.com.cert
//!     priv_key: example.com.key
//!
//! lets_encrypt:
//!   email: admin@example.com
//!   domains: [www.example.org]
//!   re_patterns: ['^[a-z0-9-]+\.example\.org$']
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

mod error;
mod managed;
mod policy;

pub use error::ConfigError;
pub use managed::{ManagedDomain, ManagedDomains};
pub use policy::{
    build_host_policy, ComposedPolicy, ExactListPolicy, HostPolicy, PolicyError, RegexListPolicy,
};

/// Let's Encrypt production directory
pub const LETS_ENCRYPT_DIRECTORY_URL: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory
pub const LETS_ENCRYPT_STAGING_DIRECTORY_URL: &str =
    "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Environment variable consulted for the configuration path
pub const CONFIG_PATH_ENV: &str = "SSL_CERT_SERVER_CONFIG";

/// Configuration path used when neither flag nor environment provide one
pub const DEFAULT_CONFIG_PATH: &str = "./conf.yaml";

// ============================================================================
// Root Configuration
// ============================================================================

/// Root configuration document.
///
/// Unknown keys are rejected anywhere in the document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Listen address of the certificate service
    pub listen: String,

    /// PID file location
    pub pid_file: PathBuf,

    /// Blob storage backend
    pub storage: StorageConfig,

    /// Operator-managed certificates, matched in order
    pub managed: Vec<ManagedConfig>,

    /// Automated issuance settings
    pub lets_encrypt: LetsEncryptConfig,

    /// Self-signed fallback settings
    pub self_signed: SelfSignedConfig,

    /// Managed certificate cache tuning
    pub cache: CacheConfig,

    /// OCSP staple refresh tuning
    pub ocsp: OcspConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            pid_file: PathBuf::from(default_pid_file()),
            storage: StorageConfig::default(),
            managed: Vec::new(),
            lets_encrypt: LetsEncryptConfig::default(),
            self_signed: SelfSignedConfig::default(),
            cache: CacheConfig::default(),
            ocsp: OcspConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::from_yaml_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Parse configuration from a YAML document and apply defaults
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = if content.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(content)?
        };
        config.apply_defaults();

        debug!(
            storage = ?config.storage.kind,
            managed_count = config.managed.len(),
            domain_count = config.lets_encrypt.domains.len(),
            pattern_count = config.lets_encrypt.re_patterns.len(),
            "Parsed configuration"
        );
        Ok(config)
    }

    /// Replace empty and non-positive values with their defaults
    fn apply_defaults(&mut self) {
        if self.listen.is_empty() {
            self.listen = default_listen();
        }
        if self.pid_file.as_os_str().is_empty() {
            self.pid_file = PathBuf::from(default_pid_file());
        }
        if self.storage.dir_cache.as_os_str().is_empty() {
            self.storage.dir_cache = PathBuf::from(default_dir_cache());
        }
        if self.storage.redis.addr.is_empty() {
            self.storage.redis.addr = default_redis_addr();
        }
        if self.lets_encrypt.renew_before <= 0 {
            self.lets_encrypt.renew_before = default_renew_before();
        }
        if self.self_signed.valid_days <= 0 {
            self.self_signed.valid_days = default_valid_days();
        }
        if self.self_signed.organization.is_empty() {
            self.self_signed.organization = default_organization();
        }
        if self.self_signed.cert.is_empty() {
            self.self_signed.cert = default_self_signed_cert();
        }
        if self.self_signed.priv_key.is_empty() {
            self.self_signed.priv_key = default_self_signed_key();
        }
    }

    /// Check values that defaults cannot repair
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (index, managed) in self.managed.iter().enumerate() {
            if managed.pattern.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "managed[{}]: pattern must not be empty",
                    index
                )));
            }
            if managed.cert.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "managed[{}]: cert must not be empty",
                    index
                )));
            }
        }

        if self.cache.reload_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "cache.reload_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.cache.reload_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "cache.reload_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.ocsp.refresh_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "ocsp.refresh_interval_secs must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Build the host policy for automated issuance
    pub fn host_policy(&self) -> Result<ComposedPolicy, ConfigError> {
        build_host_policy(&self.lets_encrypt.domains, &self.lets_encrypt.re_patterns)
    }

    /// Compile the managed certificate table
    pub fn managed_domains(&self) -> Result<ManagedDomains, ConfigError> {
        ManagedDomains::from_config(&self.managed)
    }
}

// ============================================================================
// Storage
// ============================================================================

/// Blob storage backend kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    /// One file per key under a local directory
    #[default]
    DirCache,
    /// One Redis string per key
    Redis,
}

/// Blob storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Backend selection
    #[serde(rename = "type")]
    pub kind: StorageKind,

    /// Root directory for the `dir_cache` backend
    pub dir_cache: PathBuf,

    /// Connection settings for the `redis` backend
    pub redis: RedisConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::default(),
            dir_cache: PathBuf::from(default_dir_cache()),
            redis: RedisConfig::default(),
        }
    }
}

/// Redis connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RedisConfig {
    /// `host:port` or a full `redis://` URL
    pub addr: String,

    /// Prefix prepended to every blob key
    pub prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            addr: default_redis_addr(),
            prefix: String::new(),
        }
    }
}

impl RedisConfig {
    /// Connection URL understood by the redis client
    pub fn url(&self) -> String {
        if self.addr.starts_with("redis://") || self.addr.starts_with("rediss://") {
            self.addr.clone()
        } else {
            format!("redis://{}/", self.addr)
        }
    }
}

// ============================================================================
// Managed Certificates
// ============================================================================

/// A single operator-managed certificate entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManagedConfig {
    /// Hostname regex served by this certificate
    pub pattern: String,

    /// Blob key of the certificate chain
    pub cert: String,

    /// Blob key of the private key; the chain blob is used when empty
    #[serde(default)]
    pub priv_key: String,
}

// ============================================================================
// Let's Encrypt
// ============================================================================

/// Automated issuance settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LetsEncryptConfig {
    /// Use the staging directory
    pub staging: bool,

    /// Request RSA keys instead of ECDSA
    pub force_rsa: bool,

    /// Days before expiry at which renewal starts
    pub renew_before: i64,

    /// Account contact
    pub email: String,

    /// Exact hostnames allowed to trigger issuance
    pub domains: Vec<String>,

    /// Hostname patterns allowed to trigger issuance
    pub re_patterns: Vec<String>,
}

impl Default for LetsEncryptConfig {
    fn default() -> Self {
        Self {
            staging: false,
            force_rsa: false,
            renew_before: default_renew_before(),
            email: String::new(),
            domains: Vec::new(),
            re_patterns: Vec::new(),
        }
    }
}

impl LetsEncryptConfig {
    /// ACME directory selected by the `staging` flag
    pub fn directory_url(&self) -> &'static str {
        if self.staging {
            LETS_ENCRYPT_STAGING_DIRECTORY_URL
        } else {
            LETS_ENCRYPT_DIRECTORY_URL
        }
    }

    /// Renewal window as a duration
    pub fn renew_before(&self) -> Duration {
        Duration::from_secs(self.renew_before.max(0) as u64 * 86_400)
    }
}

// ============================================================================
// Self-Signed Fallback
// ============================================================================

/// Self-signed fallback certificate settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SelfSignedConfig {
    pub enable: bool,
    pub valid_days: i64,
    pub organization: Vec<String>,
    pub cert: String,
    pub priv_key: String,
}

impl Default for SelfSignedConfig {
    fn default() -> Self {
        Self {
            enable: false,
            valid_days: default_valid_days(),
            organization: default_organization(),
            cert: default_self_signed_cert(),
            priv_key: default_self_signed_key(),
        }
    }
}

// ============================================================================
// Cache and OCSP Tuning
// ============================================================================

/// Managed certificate cache tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Age after which a cached certificate is reloaded in the background
    pub reload_interval_secs: u64,

    /// Upper bound on a single background reload
    pub reload_timeout_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            reload_interval_secs: 300,
            reload_timeout_secs: 30,
        }
    }
}

impl CacheConfig {
    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_secs)
    }

    pub fn reload_timeout(&self) -> Duration {
        Duration::from_secs(self.reload_timeout_secs)
    }
}

/// OCSP staple refresh tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OcspConfig {
    pub refresh_interval_secs: u64,
}

impl Default for OcspConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 3600,
        }
    }
}

impl OcspConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

// ============================================================================
// Defaults
// ============================================================================

fn default_listen() -> String {
    "127.0.0.1:8999".to_string()
}

fn default_pid_file() -> &'static str {
    "ssl-cert-server.pid"
}

fn default_dir_cache() -> &'static str {
    "./secret-dir"
}

fn default_redis_addr() -> String {
    "127.0.0.1:6379".to_string()
}

fn default_renew_before() -> i64 {
    30
}

fn default_valid_days() -> i64 {
    365
}

fn default_organization() -> Vec<String> {
    vec!["SSL Cert Server Self-Signed".to_string()]
}

fn default_self_signed_cert() -> String {
    "self_signed.cert".to_string()
}

fn default_self_signed_key() -> String {
    "self_signed.key".to_string()
}
