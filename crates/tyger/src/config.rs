//! Configuration file support (`tyger.toml`).
//!
//! The control plane is configured by a TOML file with one section per
//! subsystem. Every section has defaults so a minimal deployment only needs
//! `[database]` and one storage account. Credentials can be supplied through
//! environment variables instead of the file.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::types::{deserialize_duration, serialize_duration};
use tyger_retry::{PerFailureConfig, RetryPolicy, RetryStrategyConfig, RetryStrategyType};

/// Database connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Connection string, e.g. `postgres://tyger@localhost/tyger`.
    /// Overridable via `TYGER_DATABASE_URL`.
    #[serde(default)]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://tyger@localhost/tyger".to_string(),
        }
    }
}

/// Buffer TTL and access-URL policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferLifetimeConfig {
    /// Lifetime of active buffers. Zero means buffers never expire while
    /// active.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    #[serde(default = "default_active_lifetime")]
    pub active_lifetime: Duration,

    /// Grace period between soft-delete and hard-delete eligibility.
    /// Must be non-zero.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    #[serde(default = "default_soft_deleted_lifetime")]
    pub soft_deleted_lifetime: Duration,

    /// Default validity of signed access URLs.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    #[serde(default = "default_access_ttl")]
    pub default_access_ttl: Duration,

    /// Smallest access-URL ttl a caller may request.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    #[serde(default = "default_min_access_ttl")]
    pub min_access_ttl: Duration,
}

fn default_active_lifetime() -> Duration {
    Duration::ZERO
}

fn default_soft_deleted_lifetime() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_access_ttl() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_min_access_ttl() -> Duration {
    Duration::from_secs(30)
}

impl Default for BufferLifetimeConfig {
    fn default() -> Self {
        Self {
            active_lifetime: default_active_lifetime(),
            soft_deleted_lifetime: default_soft_deleted_lifetime(),
            default_access_ttl: default_access_ttl(),
            min_access_ttl: default_min_access_ttl(),
        }
    }
}

impl BufferLifetimeConfig {
    /// The active TTL as an option; zero configures "never expires".
    pub fn active_lifetime_opt(&self) -> Option<Duration> {
        if self.active_lifetime.is_zero() {
            None
        } else {
            Some(self.active_lifetime)
        }
    }

    /// Clamp a caller-supplied access ttl into the configured band.
    /// The maximum allowed ttl equals the default.
    pub fn clamp_access_ttl(&self, requested: Option<Duration>) -> crate::error::Result<Duration> {
        match requested {
            None => Ok(self.default_access_ttl),
            Some(ttl) => {
                if ttl < self.min_access_ttl || ttl > self.default_access_ttl {
                    Err(crate::error::Error::validation(format!(
                        "access ttl {:?} is outside the allowed range [{:?}, {:?}]",
                        ttl, self.min_access_ttl, self.default_access_ttl
                    )))
                } else {
                    Ok(ttl)
                }
            }
        }
    }
}

/// One configured storage account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageAccountConfig {
    pub name: String,
    pub location: String,
    pub endpoint: String,
}

/// Which buffer provider variant runs, and its settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    #[default]
    Cloud,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub kind: StorageKind,

    /// Storage accounts buffers are placed on, round-robin per location.
    #[serde(default)]
    pub accounts: Vec<StorageAccountConfig>,

    /// Lifetime of user-delegation keys (cloud variant).
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    #[serde(default = "default_key_lifetime")]
    pub key_lifetime: Duration,

    /// Container image of the buffer copier used by export/import runs.
    #[serde(default = "default_copier_image")]
    pub copier_image: String,

    /// Local data-plane settings (local variant).
    #[serde(default)]
    pub local: LocalStorageConfig,
}

fn default_key_lifetime() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_copier_image() -> String {
    "tyger/buffer-copier:latest".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::default(),
            accounts: Vec::new(),
            key_lifetime: default_key_lifetime(),
            copier_image: default_copier_image(),
            local: LocalStorageConfig::default(),
        }
    }
}

/// Settings for the single-host data plane.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalStorageConfig {
    /// TCP endpoint of the data plane, e.g. `http://127.0.0.1:2778`.
    #[serde(default)]
    pub tcp_endpoint: Option<String>,
    /// Unix socket path of the data plane.
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
    /// Endpoint containers reach the data plane at when pipes cross the
    /// Docker network boundary.
    #[serde(default)]
    pub docker_endpoint: Option<String>,
    /// Base64 primary signing key. Overridable via `TYGER_SIGNING_KEY`.
    #[serde(default)]
    pub primary_key: Option<String>,
    /// Base64 secondary signing key accepted during rotation.
    /// Overridable via `TYGER_SECONDARY_SIGNING_KEY`.
    #[serde(default)]
    pub secondary_key: Option<String>,
}

/// Which execution backend runs the containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Docker,
    Kubernetes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,

    /// Root under which per-run pipes, access files, and tombstones live
    /// (single-host backend).
    #[serde(default = "default_run_secrets_path")]
    pub run_secrets_path: PathBuf,

    /// Image of the buffer sidecar launched next to each main container.
    #[serde(default = "default_sidecar_image")]
    pub sidecar_image: String,

    /// Image of the init container that waits for worker endpoints.
    #[serde(default = "default_worker_waiter_image")]
    pub worker_waiter_image: String,

    /// Namespace run objects are created in (cluster backend).
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Default cluster hint applied to runs that do not carry one.
    #[serde(default)]
    pub cluster: Option<String>,
}

fn default_run_secrets_path() -> PathBuf {
    PathBuf::from("/var/run/tyger/runs")
}

fn default_sidecar_image() -> String {
    "tyger/buffer-sidecar:latest".to_string()
}

fn default_worker_waiter_image() -> String {
    "tyger/worker-waiter:latest".to_string()
}

fn default_namespace() -> String {
    "tyger".to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            run_secrets_path: default_run_secrets_path(),
            sidecar_image: default_sidecar_image(),
            worker_waiter_image: default_worker_waiter_image(),
            namespace: default_namespace(),
            cluster: None,
        }
    }
}

/// Retry pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retry policy preset: default, database, data_plane, or custom.
    #[serde(default)]
    pub policy: RetryPolicy,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    #[serde(default = "default_base_delay")]
    pub base_delay: Duration,

    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    #[serde(default = "default_max_delay")]
    pub max_delay: Duration,

    #[serde(default)]
    pub strategy: RetryStrategyType,

    #[serde(default = "default_jitter")]
    pub jitter: f64,

    #[serde(default)]
    pub per_failure: PerFailureConfig,
}

fn default_max_attempts() -> u32 {
    6
}

fn default_base_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(120)
}

fn default_jitter() -> f64 {
    0.5
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::Default,
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            strategy: RetryStrategyType::Exponential,
            jitter: default_jitter(),
            per_failure: PerFailureConfig::default(),
        }
    }
}

impl RetryConfig {
    /// The effective strategy configuration: the preset unless the policy is
    /// custom, in which case the explicit fields apply.
    pub fn to_strategy(&self) -> RetryStrategyConfig {
        match self.policy {
            RetryPolicy::Custom => RetryStrategyConfig {
                strategy: self.strategy,
                max_attempts: self.max_attempts,
                base_delay: self.base_delay,
                max_delay: self.max_delay,
                jitter: self.jitter,
            },
            preset => preset.to_config(),
        }
    }
}

/// Where archived run logs go.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogArchiveConfig {
    /// Filesystem directory for archived logs. Used when no endpoint is set.
    #[serde(default = "default_log_archive_path")]
    pub path: PathBuf,
    /// Object-store endpoint for archived logs.
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn default_log_archive_path() -> PathBuf {
    PathBuf::from("/var/lib/tyger/log-archive")
}

impl Default for LogArchiveConfig {
    fn default() -> Self {
        Self {
            path: default_log_archive_path(),
            endpoint: None,
        }
    }
}

/// Background-loop cadence and run housekeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunsConfig {
    /// How long a run may sit with no backend resources before the sweeper
    /// reaps it.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    #[serde(default = "default_orphan_grace")]
    pub orphan_grace: Duration,

    /// Sweeper tick interval.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: Duration,

    /// Run-secret updater tick interval.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    #[serde(default = "default_secret_refresh_interval")]
    pub secret_refresh_interval: Duration,

    /// How long archived logs must age before a terminal run is finalized.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    #[serde(default = "default_finalize_grace")]
    pub finalize_grace: Duration,
}

fn default_orphan_grace() -> Duration {
    Duration::from_secs(120)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_secret_refresh_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_finalize_grace() -> Duration {
    Duration::from_secs(30)
}

impl Default for RunsConfig {
    fn default() -> Self {
        Self {
            orphan_grace: default_orphan_grace(),
            sweep_interval: default_sweep_interval(),
            secret_refresh_interval: default_secret_refresh_interval(),
            finalize_grace: default_finalize_grace(),
        }
    }
}

/// The whole `tyger.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TygerConfig {
    pub database: DatabaseConfig,
    pub buffers: BufferLifetimeConfig,
    pub storage: StorageConfig,
    pub backend: BackendConfig,
    pub retry: RetryConfig,
    pub logs: LogArchiveConfig,
    pub runs: RunsConfig,
}

impl TygerConfig {
    /// Load configuration from a TOML file, apply environment overrides, and
    /// validate.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config: TygerConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `TYGER_*` environment overrides for credentials and endpoints.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("TYGER_DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(key) = std::env::var("TYGER_SIGNING_KEY") {
            self.storage.local.primary_key = Some(key);
        }
        if let Ok(key) = std::env::var("TYGER_SECONDARY_SIGNING_KEY") {
            self.storage.local.secondary_key = Some(key);
        }
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.database.url.trim().is_empty() {
            bail!("database.url must be set");
        }
        if self.buffers.soft_deleted_lifetime.is_zero() {
            bail!("buffers.soft_deleted_lifetime must be non-zero");
        }
        if self.buffers.min_access_ttl > self.buffers.default_access_ttl {
            bail!("buffers.min_access_ttl exceeds buffers.default_access_ttl");
        }

        let mut names = BTreeSet::new();
        for account in &self.storage.accounts {
            if account.name.trim().is_empty() {
                bail!("storage account names must be non-empty");
            }
            if account.location.trim().is_empty() {
                bail!("storage account {} has an empty location", account.name);
            }
            if !names.insert(account.name.as_str()) {
                bail!("storage account {} is configured twice", account.name);
            }
        }

        match self.storage.kind {
            StorageKind::Cloud => {
                if self.storage.accounts.is_empty() {
                    bail!("cloud storage requires at least one storage account");
                }
            }
            StorageKind::Local => {
                if self.storage.local.tcp_endpoint.is_none()
                    && self.storage.local.socket_path.is_none()
                {
                    bail!("local storage requires a tcp_endpoint or a socket_path");
                }
                if self.storage.local.primary_key.is_none() {
                    bail!(
                        "local storage requires a primary signing key \
                         (storage.local.primary_key or TYGER_SIGNING_KEY)"
                    );
                }
            }
        }

        Ok(())
    }
}
