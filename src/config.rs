//! Configuration file loading and validation

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

const MIB: u64 = 1024 * 1024;

/// Top-level server configuration, read once at startup
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub ingest: IngestConfig,
    pub backup: BackupConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    pub api_key: SecretString,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Internal log file; rolled daily. Stdout only when unset.
    pub file: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file: None,
            json: true,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct IngestConfig {
    pub upload_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub max_file_size_mb: u64,
    #[serde(default = "empty_secret")]
    pub zip_password: SecretString,
}

impl IngestConfig {
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(MIB)
    }

    /// Password used to open device archives, if one is configured
    pub fn password(&self) -> Option<&str> {
        non_empty(&self.zip_password)
    }
}

#[derive(Debug, Deserialize)]
pub struct BackupConfig {
    #[serde(default)]
    pub enabled: bool,
    pub check_interval_minutes: u64,
    pub max_live_folder_size_mb: u64,
    pub backup_dir: PathBuf,
    pub max_backup_size_mb: u64,
    pub retention_days: u64,
    pub archive_password: Option<SecretString>,
}

#[derive(Debug, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub enabled: bool,
    pub url: Option<SecretString>,
    #[serde(default = "default_table")]
    pub table: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            table: default_table(),
        }
    }
}

/// Resolved parameters for the backup engine.
///
/// Built from the `[backup]` and `[ingest]` sections with sizes in bytes.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub check_interval: Duration,
    pub max_live_folder_size_bytes: u64,
    pub max_backup_size_bytes: u64,
    pub retention_days: u64,
    pub archive_password: Option<SecretString>,
    pub live_dir: PathBuf,
    pub backup_dir: PathBuf,
}

impl RetentionConfig {
    /// Archive password, `None` when unset or empty
    pub fn password(&self) -> Option<&str> {
        self.archive_password.as_ref().and_then(non_empty)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.check_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "backup check interval must be positive".into(),
            ));
        }
        for (name, value) in [
            ("max_live_folder_size", self.max_live_folder_size_bytes),
            ("max_backup_size", self.max_backup_size_bytes),
            ("retention_days", self.retention_days),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("backup {name} must be positive")));
            }
        }
        // Rotation clears the live dir, which would take every snapshot with it
        if nested_in(&self.backup_dir, &self.live_dir) {
            return Err(ConfigError::Invalid(format!(
                "backup.backup_dir {} must not be inside ingest.logs_dir {}",
                self.backup_dir.display(),
                self.live_dir.display()
            )));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    /// Parse and validate configuration from a TOML document
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.api_key.expose_secret().is_empty() {
            return Err(ConfigError::Invalid("server.api_key must not be empty".into()));
        }
        if self.ingest.max_file_size_mb == 0 {
            return Err(ConfigError::Invalid(
                "ingest.max_file_size_mb must be positive".into(),
            ));
        }
        if self.database.enabled && self.database.url.is_none() {
            return Err(ConfigError::Invalid(
                "database.url is required when the database is enabled".into(),
            ));
        }
        if self.backup.enabled {
            self.retention().validate()?;
        }
        Ok(())
    }

    /// Resolve the backup engine parameters
    pub fn retention(&self) -> RetentionConfig {
        let backup = &self.backup;
        RetentionConfig {
            check_interval: Duration::from_secs(backup.check_interval_minutes.saturating_mul(60)),
            max_live_folder_size_bytes: backup.max_live_folder_size_mb.saturating_mul(MIB),
            max_backup_size_bytes: backup.max_backup_size_mb.saturating_mul(MIB),
            retention_days: backup.retention_days,
            archive_password: backup
                .archive_password
                .clone()
                .or_else(|| Some(self.ingest.zip_password.clone())),
            live_dir: self.ingest.logs_dir.clone(),
            backup_dir: backup.backup_dir.clone(),
        }
    }
}

/// True when `inner` is `outer` or lies beneath it
fn nested_in(inner: &Path, outer: &Path) -> bool {
    let lexical = |p: &Path| -> PathBuf {
        p.components()
            .filter(|c| !matches!(c, Component::CurDir))
            .collect()
    };
    if lexical(inner).starts_with(lexical(outer)) {
        return true;
    }
    match (inner.canonicalize(), outer.canonicalize()) {
        (Ok(inner), Ok(outer)) => inner.starts_with(outer),
        _ => false,
    }
}

fn non_empty(secret: &SecretString) -> Option<&str> {
    let value = secret.expose_secret().as_str();
    (!value.is_empty()).then_some(value)
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_true() -> bool {
    true
}

fn default_table() -> String {
    "device_logs".to_string()
}

fn empty_secret() -> SecretString {
    SecretString::new(String::new())
}
