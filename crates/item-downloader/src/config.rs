//! Queue and fetcher configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const DEFAULT_USER_AGENT: &str = concat!("item-downloader/", env!("CARGO_PKG_VERSION"));

/// Size of the buffer the streaming fetcher reads into.
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// Environment variable overriding [`QueueConfig::max_concurrent`].
pub const ENV_MAX_CONCURRENT: &str = "ITEMDL_MAX_CONCURRENT";
/// Environment variable overriding [`QueueConfig::poll_interval_ms`].
pub const ENV_POLL_INTERVAL_MS: &str = "ITEMDL_POLL_INTERVAL_MS";
/// Environment variable overriding [`FetcherConfig::connect_timeout_secs`].
pub const ENV_CONNECT_TIMEOUT_SECS: &str = "ITEMDL_CONNECT_TIMEOUT_SECS";

/// Options for the in-process streaming fetcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    /// Bytes read per chunk; progress is reported after every chunk.
    pub chunk_size: usize,
    /// Connection timeout in seconds.
    pub connect_timeout_secs: u64,
    /// User agent sent with every request.
    pub user_agent: String,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            connect_timeout_secs: 30,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
        }
    }
}

impl FetcherConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Configuration for the download queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum parts in flight across all items.
    pub max_concurrent: usize,
    /// Watch loop period in milliseconds.
    pub poll_interval_ms: u64,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
    pub fetch: FetcherConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            poll_interval_ms: 500,
            event_capacity: 256,
            fetch: FetcherConfig::default(),
        }
    }
}

impl QueueConfig {
    /// Defaults with any `ITEMDL_*` environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `ITEMDL_*` environment overrides on top of the current values.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub(crate) fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_MAX_CONCURRENT) {
            self.max_concurrent = parse_var(ENV_MAX_CONCURRENT, &v)?;
        }
        if let Some(v) = lookup(ENV_POLL_INTERVAL_MS) {
            self.poll_interval_ms = parse_var(ENV_POLL_INTERVAL_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_CONNECT_TIMEOUT_SECS) {
            self.fetch.connect_timeout_secs = parse_var(ENV_CONNECT_TIMEOUT_SECS, &v)?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(Error::config("max_concurrent must be at least 1"));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::config("poll_interval_ms must be at least 1"));
        }
        if self.fetch.chunk_size == 0 {
            return Err(Error::config("fetch.chunk_size must be at least 1"));
        }
        if self.event_capacity == 0 {
            return Err(Error::config("event_capacity must be at least 1"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis().max(1) as u64;
        self
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("invalid value for {key}: {value:?}")))
}
