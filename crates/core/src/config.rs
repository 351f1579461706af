//! TOML-based configuration system for TaskSync.
//!
//! All sensitive values (encryption keys, webhook URLs) are stored as `_env`
//! fields that reference environment variable names. The actual secrets are
//! resolved at runtime via [`AppConfig::resolve_env_vars`] and never
//! serialized back out.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::errors::ConfigError;
use crate::remote::retry::RetryPolicy;
use crate::vault::keyring::{self, KeyRing, PRIMARY_KEY_ID};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Daemon / polling settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Credential encryption keys.
    #[serde(default)]
    pub vault: VaultConfig,

    /// Remote task provider settings.
    pub provider: ProviderConfig,

    /// Retry behaviour for remote fetches.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Notification settings.
    #[serde(default)]
    pub notifications: NotificationConfig,
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// Daemon / polling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Seconds between polling cycles (default 300).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for persistent data (the SQLite database).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_poll_interval() -> u64 {
    300
}
fn default_log_level() -> String {
    "info".into()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/tasksync")
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

impl DaemonConfig {
    /// Location of the SQLite database inside `data_dir`.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("tasksync.db")
    }
}

// ---------------------------------------------------------------------------
// Vault
// ---------------------------------------------------------------------------

/// A resolved secret. Zeroized on drop and never printed.
#[derive(Clone, Default)]
pub struct SecretString(Zeroizing<String>);

impl SecretString {
    pub fn new(value: String) -> Self {
        Self(Zeroizing::new(value))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretString([redacted])")
    }
}

/// Credential-encryption key configuration.
///
/// Keys are supplied through environment variables: a single primary key
/// (id `primary`) and/or a list of `keyId:hexKey` pairs for staged rotation.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VaultConfig {
    /// Environment variable holding a 64-hex-character key.
    #[serde(default)]
    pub primary_key_env: Option<String>,

    /// Environment variable holding `keyId:hexKey` pairs.
    #[serde(default)]
    pub rotation_keys_env: Option<String>,

    /// Key id used for new encryptions.
    #[serde(default)]
    pub current_key_id: Option<String>,

    /// Re-encrypt every stored credential under the current key at daemon start.
    #[serde(default)]
    pub rotate_on_start: bool,

    /// Resolved primary key.
    #[serde(skip)]
    pub primary_key: Option<SecretString>,

    /// Resolved rotation key list.
    #[serde(skip)]
    pub rotation_keys: Option<SecretString>,
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Remote task provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider name; namespaces credentials and the per-user lock.
    #[serde(default = "default_provider_name")]
    pub name: String,

    /// Base URL of the provider's REST API.
    pub api_url: String,

    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Check a token against the provider before storing it.
    #[serde(default = "default_true")]
    pub verify_on_connect: bool,
}

fn default_provider_name() -> String {
    "remote".into()
}
fn default_request_timeout() -> u64 {
    30
}
fn default_true() -> bool {
    true
}

impl ProviderConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Sync behaviour
// ---------------------------------------------------------------------------

/// Backoff settings applied to entity-type fetches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Retries after the first attempt for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry, doubled on each attempt.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Upper bound for a single delay.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// How long a user lease or an unrefreshed `syncing` state stays valid
    /// before another process may take it over.
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
}

fn default_max_retries() -> u32 {
    4
}
fn default_retry_base_delay_ms() -> u64 {
    500
}
fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_lease_ttl_secs() -> u64 {
    600
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            lease_ttl_secs: default_lease_ttl_secs(),
        }
    }
}

impl SyncConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Notification channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotificationConfig {
    /// Environment variable holding the Slack incoming-webhook URL.
    #[serde(default)]
    pub slack_webhook_url_env: Option<String>,

    /// Resolved Slack webhook URL.
    #[serde(skip)]
    pub slack_webhook_url: Option<String>,
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve all `*_env` fields from environment variables.
    ///
    /// Missing variables only log a warning here; [`validate`](Self::validate)
    /// decides whether enough key material is present.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        info!("resolving environment variable references in config");

        if let Some(ref env_name) = self.vault.primary_key_env {
            self.vault.primary_key =
                resolve_optional_env(env_name, "vault.primary_key_env").map(SecretString::new);
        }

        if let Some(ref env_name) = self.vault.rotation_keys_env {
            self.vault.rotation_keys =
                resolve_optional_env(env_name, "vault.rotation_keys_env").map(SecretString::new);
        }

        if let Some(ref env_name) = self.notifications.slack_webhook_url_env {
            self.notifications.slack_webhook_url =
                resolve_optional_env(env_name, "notifications.slack_webhook_url_env");
        }

        debug!("environment variable resolution complete");
        Ok(())
    }

    /// Validate that all required fields are present and sane, including
    /// the key ring.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.provider.api_url.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "provider.api_url".into(),
                detail: "provider API URL must not be empty".into(),
            });
        }
        if self.provider.name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "provider.name".into(),
                detail: "provider name must not be empty".into(),
            });
        }
        if self.daemon.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "daemon.poll_interval_secs".into(),
                detail: "poll interval must be > 0".into(),
            });
        }
        if self.sync.retry_base_delay_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sync.retry_base_delay_ms".into(),
                detail: "retry delay must be > 0".into(),
            });
        }
        if self.sync.retry_max_delay_ms < self.sync.retry_base_delay_ms {
            return Err(ConfigError::InvalidValue {
                field: "sync.retry_max_delay_ms".into(),
                detail: "maximum delay must be >= base delay".into(),
            });
        }
        if self.sync.lease_ttl_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sync.lease_ttl_secs".into(),
                detail: "lease TTL must be > 0".into(),
            });
        }

        self.key_ring()?;
        Ok(())
    }

    /// Build the validated [`KeyRing`] from the resolved key material.
    pub fn key_ring(&self) -> Result<KeyRing, ConfigError> {
        let mut keys: Vec<(String, [u8; 32])> = Vec::new();

        if let Some(ref primary) = self.vault.primary_key {
            let bytes = keyring::parse_hex_key(primary.expose()).map_err(|detail| {
                ConfigError::InvalidValue {
                    field: "vault.primary_key_env".into(),
                    detail,
                }
            })?;
            keys.push((PRIMARY_KEY_ID.to_string(), bytes));
        }

        if let Some(ref pairs) = self.vault.rotation_keys {
            let parsed = keyring::parse_key_pairs(pairs.expose()).map_err(|detail| {
                ConfigError::InvalidValue {
                    field: "vault.rotation_keys_env".into(),
                    detail,
                }
            })?;
            keys.extend(parsed);
        }

        let mut seen = HashSet::new();
        for (id, _) in &keys {
            if !seen.insert(id.as_str()) {
                return Err(ConfigError::InvalidValue {
                    field: "vault.rotation_keys_env".into(),
                    detail: format!("duplicate key id '{}'", id),
                });
            }
        }

        if keys.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "vault".into(),
                detail: "no encryption key configured (set primary_key_env or rotation_keys_env)"
                    .into(),
            });
        }

        let current = match self.vault.current_key_id {
            Some(ref id) => id.clone(),
            None if keys.len() == 1 => keys[0].0.clone(),
            None => {
                return Err(ConfigError::InvalidValue {
                    field: "vault.current_key_id".into(),
                    detail: "required when more than one key is configured".into(),
                })
            }
        };

        KeyRing::new(current, keys).map_err(|detail| ConfigError::InvalidValue {
            field: "vault.current_key_id".into(),
            detail,
        })
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs a warning and returns `None` if the variable is unset.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.trim().is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}
