//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to lowest):
//! 1. Environment variables (prefix: AUDIT_TRAIL_, nested keys separated by `__`)
//! 2. Current working directory: ./config.toml
//! 3. XDG config directory: ~/.config/audit-trail/{service_name}/config.toml
//! 4. System directory: /etc/audit-trail/{service_name}/config.toml
//! 5. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

const ENV_PREFIX: &str = "AUDIT_TRAIL_";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,

    /// Audit job queue and processor configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Request deduplication cache configuration
    #[serde(default)]
    pub dedup: DedupConfig,

    /// Integrity token signing configuration
    #[serde(default)]
    pub signing: SigningConfig,

    /// Storage failure alerting (optional)
    #[serde(default)]
    pub alerts: Option<AlertConfig>,

    /// Database configuration (optional, requires the `database` feature)
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name
    pub name: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Environment (dev, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Audit job queue configuration
///
/// # Example (config.toml)
///
/// ```toml
/// [queue]
/// enabled = true
/// processor_name = "audit-log"
/// workers = 2
/// max_attempts = 5
/// base_delay_ms = 1000
/// delay_multiplier = 2.0
/// max_delay_ms = 60000
/// compress = false
/// visibility_timeout_secs = 300
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Route listener writes through the queue (false = direct writes only)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Name the queue processor binds under
    #[serde(default = "default_processor_name")]
    pub processor_name: String,

    /// Number of concurrent worker loops
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// How long an idle worker waits before polling again
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Attempts before a job is parked as failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Multiplier for exponential backoff (delay = base * multiplier^(attempts-1))
    #[serde(default = "default_delay_multiplier")]
    pub delay_multiplier: f64,

    /// Cap on a single retry delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Maximum number of drafts carried by one batch job
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Gzip data snapshots of queued jobs before persisting (default: false)
    #[serde(default)]
    pub compress: bool,

    /// Seconds a dequeued job may stay in processing before another worker
    /// reclaims it
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
}

impl QueueConfig {
    /// Validate the configuration, returning an error message if invalid
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.processor_name.trim().is_empty() {
            return Err("processor_name must not be empty".to_string());
        }
        if self.workers == 0 {
            return Err("workers must be greater than 0".to_string());
        }
        if self.max_attempts == 0 {
            return Err("max_attempts must be greater than 0".to_string());
        }
        if self.base_delay_ms == 0 {
            return Err("base_delay_ms must be greater than 0".to_string());
        }
        if self.delay_multiplier <= 1.0 {
            return Err("delay_multiplier must be > 1.0".to_string());
        }
        if self.max_batch_size == 0 {
            return Err("max_batch_size must be greater than 0".to_string());
        }
        if self.visibility_timeout_secs == 0 {
            return Err("visibility_timeout_secs must be greater than 0".to_string());
        }
        // The last retry happens after attempt max_attempts - 1 fails
        if self.max_attempts > 1 {
            let last = self.base_delay_ms as f64
                * self.delay_multiplier.powi(self.max_attempts as i32 - 2);
            if last > self.max_delay_ms as f64 {
                return Err(format!(
                    "max_delay_ms ({}) is reached before max_attempts ({}); backoff would stop increasing",
                    self.max_delay_ms, self.max_attempts
                ));
            }
        }
        Ok(())
    }

    /// Poll interval as a `Duration`
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Processing lease as a `Duration`
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            processor_name: default_processor_name(),
            workers: default_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            delay_multiplier: default_delay_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            max_batch_size: default_max_batch_size(),
            compress: false,
            visibility_timeout_secs: default_visibility_timeout_secs(),
        }
    }
}

/// Request deduplication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Deduplicate capture-point emissions (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds an entry stays in the cache
    #[serde(default = "default_dedup_ttl_secs")]
    pub ttl_secs: u64,

    /// Seconds between cleanup sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl DedupConfig {
    /// Entry time-to-live
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Sweep interval
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_dedup_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// Integrity token signing configuration
///
/// `signing_key` should always be set in production. `app_secret` is only
/// used as a fallback, with a warning.
#[derive(Clone, Serialize, Deserialize)]
pub struct SigningConfig {
    /// Sign audit logs (default: true). With signing on, a missing key is a
    /// startup error; set this to false to run without integrity tokens.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Dedicated audit signing key
    #[serde(default)]
    pub signing_key: Option<String>,

    /// Shared application secret (fallback)
    #[serde(default)]
    pub app_secret: Option<String>,

    /// Issuer claim embedded in integrity tokens
    #[serde(default = "default_issuer")]
    pub issuer: String,
}

// Keep secrets out of debug output
impl std::fmt::Debug for SigningConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningConfig")
            .field("enabled", &self.enabled)
            .field("signing_key", &self.signing_key.as_ref().map(|_| "<redacted>"))
            .field("app_secret", &self.app_secret.as_ref().map(|_| "<redacted>"))
            .field("issuer", &self.issuer)
            .finish()
    }
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            signing_key: None,
            app_secret: None,
            issuer: default_issuer(),
        }
    }
}

/// Storage failure alert configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Enable alerting (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds of continuous storage failure before alerting
    #[serde(default = "default_alert_threshold_secs")]
    pub threshold_secs: u64,

    /// Minimum seconds between repeated alerts
    #[serde(default = "default_alert_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Emit a recovery alert when storage comes back
    #[serde(default = "default_true")]
    pub notify_recovery: bool,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_secs: default_alert_threshold_secs(),
            cooldown_secs: default_alert_cooldown_secs(),
            notify_recovery: true,
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database connection URL
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum idle connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Maximum retry attempts for establishing database connection
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_environment() -> String {
    "dev".to_string()
}

fn default_processor_name() -> String {
    "audit-log".to_string()
}

fn default_workers() -> usize {
    2
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1000 // 1 second
}

fn default_delay_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    60_000 // 1 minute
}

fn default_max_batch_size() -> usize {
    100
}

fn default_visibility_timeout_secs() -> u64 {
    300 // 5 minutes
}

fn default_dedup_ttl_secs() -> u64 {
    300 // 5 minutes
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_issuer() -> String {
    "audit-trail".to_string()
}

fn default_alert_threshold_secs() -> u64 {
    30
}

fn default_alert_cooldown_secs() -> u64 {
    300
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connection_timeout() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    2
}

impl Config {
    /// Load configuration from all sources
    ///
    /// Environment variables (AUDIT_TRAIL_ prefix) override all file-based configs.
    pub fn load() -> Result<Self> {
        // Try to infer service name from binary name or use default
        let service_name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "audit-trail".to_string());

        Self::load_for_service(&service_name)
    }

    /// Load configuration for a specific service name
    pub fn load_for_service(service_name: &str) -> Result<Self> {
        let config_paths = Self::find_config_paths(service_name);

        tracing::debug!("Searching for config files in order:");
        for path in &config_paths {
            tracing::debug!("  - {}", path.display());
        }

        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        // Merge config files lowest priority first so higher priority files win
        for path in config_paths.iter().rev() {
            if path.exists() {
                tracing::info!("Loading configuration from: {}", path.display());
                figment = figment.merge(Toml::file(path));
            }
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file
    ///
    /// This bypasses XDG directories and loads directly from the given path.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants that serde defaults cannot express
    pub fn validate(&self) -> Result<()> {
        self.queue
            .validate()
            .map_err(|e| Error::Configuration(format!("queue: {}", e)))?;

        if self.dedup.ttl_secs == 0 {
            return Err(Error::Configuration(
                "dedup: ttl_secs must be greater than 0".to_string(),
            ));
        }
        if self.dedup.sweep_interval_secs == 0 {
            return Err(Error::Configuration(
                "dedup: sweep_interval_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Find all possible config file paths for a service
    ///
    /// Returns paths in priority order (highest first)
    fn find_config_paths(service_name: &str) -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("config.toml")];

        let xdg_dirs = xdg::BaseDirectories::with_prefix("audit-trail");
        let config_file_path = Path::new(service_name).join("config.toml");
        if let Some(path) = xdg_dirs.find_config_file(&config_file_path) {
            paths.push(path);
        }

        paths.push(
            PathBuf::from("/etc/audit-trail")
                .join(service_name)
                .join("config.toml"),
        );

        paths
    }

    /// Get database URL
    pub fn database_url(&self) -> Option<&str> {
        self.database.as_ref().map(|db| db.url.as_str())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                name: "audit-trail".to_string(),
                log_level: default_log_level(),
                environment: default_environment(),
            },
            queue: QueueConfig::default(),
            dedup: DedupConfig::default(),
            signing: SigningConfig::default(),
            alerts: None,
            database: None,
        }
    }
}
