//! Runtime configuration
//!
//! Settings come from the environment (optionally seeded from a `.env` file)
//! with defaults for everything; CLI flags override individual values before
//! [`IngestConfig::validate`] runs.

use crate::db::DbConfig;
use crate::error::{IngestError, Result};
use crate::framework::orchestrator::OrchestratorConfig;
use crate::framework::retry::RetryPolicy;
use crate::probe::DEFAULT_SOURCE_BASE_URL;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Ceiling applied to exponential backoff
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Shape of the delay between chunk attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Linear,
    Exponential,
}

impl FromStr for BackoffKind {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "fixed" => Ok(BackoffKind::Fixed),
            "linear" => Ok(BackoffKind::Linear),
            "exponential" => Ok(BackoffKind::Exponential),
            other => Err(IngestError::Config(format!(
                "unknown backoff policy '{}' (expected fixed, linear or exponential)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestConfig {
    pub database: DbConfig,
    /// Rows per chunk
    pub chunk_size: u64,
    /// Staged rows fetched per read while loading a chunk
    pub read_page_size: u64,
    /// Total attempts per chunk, the first one included
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    pub backoff_secs: u64,
    /// Wall-clock budget per partition; unset means unbounded
    pub partition_timeout_secs: Option<u64>,
    /// Partitions loaded at once by a backfill
    pub concurrency: usize,
    pub source_base_url: String,
    pub probe_timeout_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            database: DbConfig::default(),
            chunk_size: 1_000_000,
            read_page_size: 50_000,
            max_attempts: 3,
            backoff: BackoffKind::Fixed,
            backoff_secs: 5,
            partition_timeout_secs: None,
            concurrency: 1,
            source_base_url: DEFAULT_SOURCE_BASE_URL.to_string(),
            probe_timeout_secs: 30,
        }
    }
}

impl IngestConfig {
    /// Load `.env` if present, then read the process environment
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from any key lookup, starting from the defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("DATABASE_URL") {
            config.database.url = url;
        }
        if let Some(v) = parse_var(&lookup, "DATABASE_MAX_CONNECTIONS")? {
            config.database.max_connections = v;
        }
        if let Some(v) = parse_var(&lookup, "DATABASE_MIN_CONNECTIONS")? {
            config.database.min_connections = v;
        }
        if let Some(v) = parse_var(&lookup, "DATABASE_CONNECT_TIMEOUT")? {
            config.database.connect_timeout_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "INGEST_CHUNK_SIZE")? {
            config.chunk_size = v;
        }
        if let Some(v) = parse_var(&lookup, "INGEST_READ_PAGE_SIZE")? {
            config.read_page_size = v;
        }
        if let Some(v) = parse_var(&lookup, "INGEST_MAX_RETRIES")? {
            config.max_attempts = v;
        }
        if let Some(v) = parse_var(&lookup, "INGEST_BACKOFF_POLICY")? {
            config.backoff = v;
        }
        if let Some(v) = parse_var(&lookup, "INGEST_BACKOFF_SECS")? {
            config.backoff_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "INGEST_PARTITION_TIMEOUT_SECS")? {
            config.partition_timeout_secs = Some(v);
        }
        if let Some(v) = parse_var(&lookup, "INGEST_CONCURRENCY")? {
            config.concurrency = v;
        }
        if let Some(url) = lookup("INGEST_SOURCE_BASE_URL") {
            config.source_base_url = url;
        }
        if let Some(v) = parse_var(&lookup, "INGEST_PROBE_TIMEOUT_SECS")? {
            config.probe_timeout_secs = v;
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("INGEST_CHUNK_SIZE", self.chunk_size),
            ("INGEST_READ_PAGE_SIZE", self.read_page_size),
            ("INGEST_MAX_RETRIES", u64::from(self.max_attempts)),
            ("INGEST_BACKOFF_SECS", self.backoff_secs),
            ("INGEST_CONCURRENCY", self.concurrency as u64),
            ("INGEST_PROBE_TIMEOUT_SECS", self.probe_timeout_secs),
            ("DATABASE_MAX_CONNECTIONS", u64::from(self.database.max_connections)),
            ("DATABASE_CONNECT_TIMEOUT", self.database.connect_timeout_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(IngestError::Config(format!("{} must be greater than 0", name)));
            }
        }

        if self.partition_timeout_secs == Some(0) {
            return Err(IngestError::Config(
                "INGEST_PARTITION_TIMEOUT_SECS must be greater than 0".to_string(),
            ));
        }
        if self.database.min_connections > self.database.max_connections {
            return Err(IngestError::Config(format!(
                "DATABASE_MIN_CONNECTIONS ({}) exceeds DATABASE_MAX_CONNECTIONS ({})",
                self.database.min_connections, self.database.max_connections
            )));
        }
        // An in-flight partition holds its staging connection and a chunk
        // transaction at once; ledger appends need one more from the pool.
        if 2 * self.concurrency as u64 >= u64::from(self.database.max_connections) {
            return Err(IngestError::Config(format!(
                "INGEST_CONCURRENCY ({}) needs DATABASE_MAX_CONNECTIONS above {}, got {}",
                self.concurrency,
                2 * self.concurrency,
                self.database.max_connections
            )));
        }
        if !self.source_base_url.starts_with("http://")
            && !self.source_base_url.starts_with("https://")
        {
            return Err(IngestError::Config(format!(
                "INGEST_SOURCE_BASE_URL must be an http(s) URL, got '{}'",
                self.source_base_url
            )));
        }

        Ok(())
    }

    /// Retry policy applied to each chunk
    pub fn retry_policy(&self) -> RetryPolicy {
        let delay = Duration::from_secs(self.backoff_secs);
        match self.backoff {
            BackoffKind::Fixed => RetryPolicy::fixed(self.max_attempts, delay),
            BackoffKind::Linear => RetryPolicy::linear(self.max_attempts, delay),
            BackoffKind::Exponential => {
                RetryPolicy::exponential(self.max_attempts, delay, MAX_BACKOFF.max(delay))
            }
        }
    }

    /// Retry policy for remote existence probes; always linear
    pub fn probe_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::linear(self.max_attempts, Duration::from_secs(self.backoff_secs))
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            chunk_size: self.chunk_size,
            read_page_size: self.read_page_size,
            retry: self.retry_policy(),
        }
    }

    pub fn partition_timeout(&self) -> Option<Duration> {
        self.partition_timeout_secs.map(Duration::from_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| IngestError::Config(format!("invalid {} '{}': {}", key, raw, e))),
    }
}
