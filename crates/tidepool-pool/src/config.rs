//! Pool configuration.
//!
//! [`PoolConfig`] is the static description of a pool. The watcher never
//! reads it directly while growing; it goes through a [`ConfigSource`] so the
//! statement cache size can change at runtime (see [`SharedConfig`]).

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tidepool_core::{Error, Result};

/// Database credentials shared by every connection of a partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    /// Driver URL (e.g. `postgres://db.internal:5432/app`)
    pub url: String,
    /// Username for authentication
    pub username: String,
    /// Password for authentication
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the username.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    /// Set the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }
}

/// Connection pool configuration.
///
/// Connection bounds are per partition: a pool with `partition_count = 3`
/// and `max_connections = 10` holds at most 30 connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Credentials used for every new connection
    pub credentials: Credentials,
    /// Number of independent partitions
    pub partition_count: usize,
    /// Connections created per partition at startup
    pub min_connections: usize,
    /// Upper bound on live connections per partition
    pub max_connections: usize,
    /// Connections created per growth step
    pub acquire_increment: usize,
    /// Prepared statements cached per connection (0 disables the cache)
    pub statements_cache_size: usize,
    /// Pause after a failed creation batch, in milliseconds
    pub acquire_retry_delay_ms: u64,
    /// Maximum time to wait for a connection in milliseconds
    pub acquire_timeout_ms: u64,
    /// Only grow while the free share (percent of created) is at or below this
    pub pool_availability_threshold: Option<u8>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            credentials: Credentials::default(),
            partition_count: 1,
            min_connections: 1,
            max_connections: 10,
            acquire_increment: 2,
            statements_cache_size: 50,
            acquire_retry_delay_ms: 7_000,
            acquire_timeout_ms: 30_000, // 30 seconds
            pool_availability_threshold: None,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration for the given credentials.
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            ..Default::default()
        }
    }

    /// Set the number of partitions.
    pub fn partition_count(mut self, n: usize) -> Self {
        self.partition_count = n;
        self
    }

    /// Set minimum connections per partition.
    pub fn min_connections(mut self, n: usize) -> Self {
        self.min_connections = n;
        self
    }

    /// Set maximum connections per partition.
    pub fn max_connections(mut self, n: usize) -> Self {
        self.max_connections = n;
        self
    }

    /// Set the growth step.
    pub fn acquire_increment(mut self, n: usize) -> Self {
        self.acquire_increment = n;
        self
    }

    /// Set the per-connection statement cache size.
    pub fn statements_cache_size(mut self, n: usize) -> Self {
        self.statements_cache_size = n;
        self
    }

    /// Set the pause after a failed creation batch.
    pub fn acquire_retry_delay(mut self, ms: u64) -> Self {
        self.acquire_retry_delay_ms = ms;
        self
    }

    /// Set acquire timeout.
    pub fn acquire_timeout(mut self, ms: u64) -> Self {
        self.acquire_timeout_ms = ms;
        self
    }

    /// Enable threshold-based growth.
    pub fn pool_availability_threshold(mut self, percent: u8) -> Self {
        self.pool_availability_threshold = Some(percent);
        self
    }

    pub fn acquire_retry_delay_duration(&self) -> Duration {
        Duration::from_millis(self.acquire_retry_delay_ms)
    }

    pub fn acquire_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Check the connection bounds.
    pub fn validate(&self) -> Result<()> {
        if self.partition_count == 0 {
            return Err(Error::config("partition_count must be at least 1"));
        }
        if self.min_connections == 0 {
            return Err(Error::config("min_connections must be at least 1"));
        }
        if self.min_connections > self.max_connections {
            return Err(Error::config(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.acquire_increment == 0 {
            return Err(Error::config("acquire_increment must be at least 1"));
        }
        if let Some(threshold) = self.pool_availability_threshold {
            if threshold > 100 {
                return Err(Error::config(format!(
                    "pool_availability_threshold must be a percentage, got {threshold}"
                )));
            }
        }
        Ok(())
    }
}

/// Where the watcher reads configuration from while growing a partition.
///
/// Reads happen outside any partition lock and may fail.
pub trait ConfigSource: Send + Sync {
    /// Prepared statements to cache on each new connection. Read once per
    /// connection; a failed read fails that connection attempt.
    fn statements_cache_size(&self) -> Result<usize>;

    /// Growth step. Read before every batch; a failed read falls back to
    /// the step the partition was built with.
    fn acquire_increment(&self) -> Result<usize>;
}

impl ConfigSource for PoolConfig {
    fn statements_cache_size(&self) -> Result<usize> {
        Ok(self.statements_cache_size)
    }

    fn acquire_increment(&self) -> Result<usize> {
        Ok(self.acquire_increment)
    }
}

impl<T: ConfigSource + ?Sized> ConfigSource for Arc<T> {
    fn statements_cache_size(&self) -> Result<usize> {
        (**self).statements_cache_size()
    }

    fn acquire_increment(&self) -> Result<usize> {
        (**self).acquire_increment()
    }
}

/// A [`PoolConfig`] that can be updated while the pool runs.
#[derive(Debug, Default)]
pub struct SharedConfig {
    inner: RwLock<PoolConfig>,
}

impl SharedConfig {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: RwLock::new(config),
        }
    }

    /// Copy of the current configuration.
    pub fn snapshot(&self) -> Result<PoolConfig> {
        self.inner
            .read()
            .map(|cfg| cfg.clone())
            .map_err(|_| Error::config("shared pool configuration is poisoned"))
    }

    /// Apply a change. Later connections pick it up; existing ones keep
    /// their statement cache size. An update that fails validation is
    /// discarded.
    pub fn update(&self, apply: impl FnOnce(&mut PoolConfig)) -> Result<()> {
        let mut cfg = self
            .inner
            .write()
            .map_err(|_| Error::config("shared pool configuration is poisoned"))?;
        let mut next = cfg.clone();
        apply(&mut next);
        next.validate()?;
        *cfg = next;
        Ok(())
    }
}

impl ConfigSource for SharedConfig {
    fn statements_cache_size(&self) -> Result<usize> {
        self.snapshot().map(|cfg| cfg.statements_cache_size)
    }

    fn acquire_increment(&self) -> Result<usize> {
        self.snapshot().map(|cfg| cfg.acquire_increment)
    }
}
