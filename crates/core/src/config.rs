//! Configuration loading
//!
//! # Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//! 1. Built-in defaults
//! 2. TOML file named by `ROLESYNC_CONFIG` (optional)
//! 3. Environment variables: `ROLESYNC_*`
//!
//! # Example Config
//!
//! ```toml
//! protected_roles = ["postgres", "rds_superuser"]
//!
//! [database]
//! host = "db.internal"
//! name = "postgres"
//!
//! [reconcile]
//! interval_secs = 30
//! dry_run = true
//!
//! [sources]
//! users_file = "/etc/rolesync/users.yaml"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;
use crate::result::Result;
use crate::types::Password;

/// Environment variable naming the TOML config file.
pub const CONFIG_PATH_ENV: &str = "ROLESYNC_CONFIG";

// ═══════════════════════════════════════════════════════════════════════════
// CONFIGURATION STRUCTURES
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub pool: PoolConfig,
    pub reconcile: ReconcileConfig,
    pub sources: SourcesConfig,
    pub metrics: MetricsConfig,
    /// Roles the engine never reads, alters or drops.
    pub protected_roles: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: Password,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PoolConfig {
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconcileConfig {
    pub interval_secs: u64,
    pub dry_run: bool,
    pub max_retries: u32,
    pub backoff_base: f64,
    pub backoff_unit_ms: u64,
    pub backoff_max_secs: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SourcesConfig {
    pub users_file: PathBuf,
    pub secrets_dir: PathBuf,
    pub state_file: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MetricsConfig {
    pub listen_addr: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════
// DEFAULT IMPLEMENTATIONS
// ═══════════════════════════════════════════════════════════════════════════

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            pool: PoolConfig::default(),
            reconcile: ReconcileConfig::default(),
            sources: SourcesConfig::default(),
            metrics: MetricsConfig::default(),
            protected_roles: default_protected_roles(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            name: "postgres".to_string(),
            user: "postgres".to_string(),
            password: Password::new("postgres"),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 5,
            acquire_timeout_secs: 10,
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            dry_run: false,
            max_retries: 5,
            backoff_base: 2.0,
            backoff_unit_ms: 1000,
            backoff_max_secs: 60,
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            users_file: PathBuf::from("/etc/rolesync/users.yaml"),
            secrets_dir: PathBuf::from("/etc/rolesync/secrets"),
            state_file: PathBuf::from("/tmp/users_state.json"),
        }
    }
}

fn default_protected_roles() -> Vec<String> {
    [
        "postgres",
        "pg_monitor",
        "pg_read_all_settings",
        "pg_read_all_stats",
        "pg_stat_scan_tables",
        "pg_read_server_files",
        "pg_write_server_files",
        "pg_execute_server_program",
        "pg_signal_backend",
        "rds_superuser",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

// ═══════════════════════════════════════════════════════════════════════════
// LOADING
// ═══════════════════════════════════════════════════════════════════════════

impl Config {
    /// Load configuration from `ROLESYNC_CONFIG` (if set) and the environment.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the file cannot be read or parsed, an
    /// environment override does not parse, or validation fails.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
        Self::load_from(path.as_deref(), |key| std::env::var(key).ok())
    }

    /// Load configuration from an optional file and an environment lookup.
    ///
    /// # Errors
    ///
    /// See [`Config::load`].
    pub fn load_from<F>(path: Option<&Path>, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match path {
            Some(path) => load_toml_file(path)?,
            None => Self::default(),
        };
        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `ROLESYNC_*` overrides.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if a numeric or boolean value does not parse.
    fn apply_env<F>(&mut self, env: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = env("ROLESYNC_DB_HOST") {
            self.database.host = value;
        }
        if let Some(value) = env("ROLESYNC_DB_PORT") {
            self.database.port = parse_env("ROLESYNC_DB_PORT", &value)?;
        }
        if let Some(value) = env("ROLESYNC_DB_NAME") {
            self.database.name = value;
        }
        if let Some(value) = env("ROLESYNC_DB_USER") {
            self.database.user = value;
        }
        if let Some(value) = env("ROLESYNC_DB_PASSWORD") {
            self.database.password = Password::new(value);
        }
        if let Some(value) = env("ROLESYNC_POOL_MIN_CONN") {
            self.pool.min_connections = parse_env("ROLESYNC_POOL_MIN_CONN", &value)?;
        }
        if let Some(value) = env("ROLESYNC_POOL_MAX_CONN") {
            self.pool.max_connections = parse_env("ROLESYNC_POOL_MAX_CONN", &value)?;
        }
        if let Some(value) = env("ROLESYNC_SYNC_INTERVAL") {
            self.reconcile.interval_secs = parse_env("ROLESYNC_SYNC_INTERVAL", &value)?;
        }
        if let Some(value) = env("ROLESYNC_DRY_RUN") {
            self.reconcile.dry_run = value.eq_ignore_ascii_case("true") || value == "1";
        }
        if let Some(value) = env("ROLESYNC_MAX_RETRIES") {
            self.reconcile.max_retries = parse_env("ROLESYNC_MAX_RETRIES", &value)?;
        }
        if let Some(value) = env("ROLESYNC_RETRY_BACKOFF_BASE") {
            self.reconcile.backoff_base = parse_env("ROLESYNC_RETRY_BACKOFF_BASE", &value)?;
        }
        if let Some(value) = env("ROLESYNC_USERS_FILE") {
            self.sources.users_file = PathBuf::from(value);
        }
        if let Some(value) = env("ROLESYNC_SECRETS_DIR") {
            self.sources.secrets_dir = PathBuf::from(value);
        }
        if let Some(value) = env("ROLESYNC_STATE_FILE") {
            self.sources.state_file = PathBuf::from(value);
        }
        if let Some(value) = env("ROLESYNC_METRICS_ADDR") {
            self.metrics.listen_addr = Some(value).filter(|addr| !addr.is_empty());
        }
        Ok(())
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if any value is out of range.
    fn validate(&self) -> Result<()> {
        if self.pool.max_connections == 0 {
            return Err(Error::invalid_config("pool.max_connections must be at least 1"));
        }
        if self.pool.min_connections > self.pool.max_connections {
            return Err(Error::invalid_config(
                "pool.min_connections must not exceed pool.max_connections",
            ));
        }
        if self.reconcile.interval_secs == 0 {
            return Err(Error::invalid_config("reconcile.interval_secs must be at least 1"));
        }
        if !self.reconcile.backoff_base.is_finite() || self.reconcile.backoff_base < 1.0 {
            return Err(Error::invalid_config("reconcile.backoff_base must be >= 1.0"));
        }
        if self.database.host.is_empty() || self.database.user.is_empty() {
            return Err(Error::invalid_config("database.host and database.user are required"));
        }
        Ok(())
    }

    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.reconcile.interval_secs)
    }

    #[must_use]
    pub const fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.pool.acquire_timeout_secs)
    }

    #[must_use]
    pub const fn backoff_unit(&self) -> Duration {
        Duration::from_millis(self.reconcile.backoff_unit_ms)
    }

    #[must_use]
    pub const fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.reconcile.backoff_max_secs)
    }
}

fn parse_env<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::invalid_config(format!("invalid {key} value '{value}': {e}")))
}

/// Load a TOML file into a Config.
///
/// # Errors
///
/// Returns error if:
/// - File cannot be read
/// - TOML is malformed
fn load_toml_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::invalid_config(format!("failed to read config file {}: {e}", path.display()))
    })?;

    toml::from_str(&content).map_err(|e| {
        Error::invalid_config(format!("failed to parse config {}: {e}", path.display()))
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════
