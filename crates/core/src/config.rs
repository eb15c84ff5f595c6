//! Configuration via `tessera.toml`
//!
//! A default `tessera.toml` is written to the data directory on first use.
//! Every section and field is optional; missing values fall back to the
//! defaults documented in [`TesseraConfig::default_toml`].

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Config file name placed in the data directory.
pub const CONFIG_FILE_NAME: &str = "tessera.toml";

/// Record cache settings (`[cache]`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Idle time after which an untouched item is evicted, in milliseconds
    pub ttl_ms: u64,
    /// Period of the GC tick, in milliseconds
    pub gc_interval_ms: u64,
    /// Maximum number of cached items; unbounded when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 600_000,
            gc_interval_ms: 1_000,
            capacity: None,
        }
    }
}

impl CacheConfig {
    /// Idle time as a `Duration`
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// GC tick period as a `Duration`
    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }
}

/// Lease mutex settings (`[mutex]`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MutexConfig {
    /// Lease lifetime, in milliseconds
    pub ttl_ms: u64,
    /// Period at which a held lease is extended, in milliseconds
    pub refresh_interval_ms: u64,
    /// Lower bound of the jittered retry delay while waiting, in milliseconds
    pub recheck_min_ms: u64,
    /// Upper bound of the jittered retry delay while waiting, in milliseconds
    pub recheck_max_ms: u64,
}

impl Default for MutexConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 10_000,
            refresh_interval_ms: 5_000,
            recheck_min_ms: 2_000,
            recheck_max_ms: 5_000,
        }
    }
}

/// Replication settings (`[replication]`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Number of ids reserved from the shared counter per allocation
    pub id_reservation_size: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            id_reservation_size: 100,
        }
    }
}

/// Configuration loaded from `tessera.toml`.
///
/// # Example
///
/// ```toml
/// [cache]
/// ttl_ms = 600000
/// gc_interval_ms = 1000
///
/// [mutex]
/// ttl_ms = 10000
/// refresh_interval_ms = 5000
///
/// [replication]
/// id_reservation_size = 100
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TesseraConfig {
    /// Record cache settings
    pub cache: CacheConfig,
    /// Lease mutex settings
    pub mutex: MutexConfig,
    /// Replication settings
    pub replication: ReplicationConfig,
}

impl TesseraConfig {
    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.cache.ttl_ms == 0 {
            return Err(Error::Config("cache.ttl_ms must be positive".into()));
        }
        if self.cache.gc_interval_ms == 0 {
            return Err(Error::Config(
                "cache.gc_interval_ms must be positive".into(),
            ));
        }
        if self.cache.capacity == Some(0) {
            return Err(Error::Config("cache.capacity must be positive".into()));
        }
        if self.mutex.refresh_interval_ms == 0
            || self.mutex.refresh_interval_ms >= self.mutex.ttl_ms
        {
            return Err(Error::Config(format!(
                "mutex.refresh_interval_ms ({}) must be positive and below mutex.ttl_ms ({})",
                self.mutex.refresh_interval_ms, self.mutex.ttl_ms
            )));
        }
        if self.mutex.recheck_min_ms > self.mutex.recheck_max_ms {
            return Err(Error::Config(format!(
                "mutex.recheck_min_ms ({}) exceeds mutex.recheck_max_ms ({})",
                self.mutex.recheck_min_ms, self.mutex.recheck_max_ms
            )));
        }
        if self.replication.id_reservation_size == 0 {
            return Err(Error::Config(
                "replication.id_reservation_size must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Tessera configuration

[cache]
# Idle time before an untouched cached record is evicted (default: 10 minutes)
ttl_ms = 600000
# GC tick period (default: 1s)
gc_interval_ms = 1000
# Maximum cached records, oldest evicted first (default: unbounded)
# capacity = 10000

[mutex]
# Lease lifetime (default: 10s)
ttl_ms = 10000
# Lease extension period while held, must be below ttl_ms (default: 5s)
refresh_interval_ms = 5000
# Jittered retry delay bounds while waiting for a busy lease
recheck_min_ms = 2000
recheck_max_ms = 5000

[replication]
# Ids reserved from the shared counter per allocation (default: 100)
id_reservation_size = 100
"#
    }

    /// Read, parse and validate config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TesseraConfig = toml::from_str(&content).map_err(|e| {
            Error::Config(format!(
                "failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load `tessera.toml` from `dir`, writing the default file first when
    /// none exists.
    pub fn open_dir(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE_NAME);
        Self::write_default_if_missing(&path)?;
        Self::from_file(&path)
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml())?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
