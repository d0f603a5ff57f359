//! Configuration loading and the process-wide pool name registry.
//!
//! Parsing any particular on-disk format (XML, YAML, ...) is the embedding application's job —
//! this module only defines the recognized options and accepts anything `serde` can deserialize
//! from. A `from_json_str` convenience is provided since it's the one concrete format this crate
//! ships a parser for.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::Deserialize;

use crate::error::Error;

/// Recognized pool configuration, deserializable from any `serde::Deserializer`.
///
/// Field names match the vocabulary used throughout the rest of this crate (and its
/// documentation) rather than any particular source format's naming convention.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Pool identifier. Required, and must be unique within the process — see
    /// [`PoolConfig::validate`].
    pub name: String,

    /// Connections pre-opened at init.
    #[serde(default)]
    pub core_pool_size: u32,

    /// Hard ceiling on live connections (idle + in-use).
    pub max_pool_size: u32,

    /// Batch size for growth on demand.
    #[serde(default = "default_acquire_increment")]
    pub acquire_increment: u32,

    /// Attempts before a connect failure is surfaced.
    #[serde(default = "default_acquire_retry_times")]
    pub acquire_retry_times: u32,

    /// When true, pool exhaustion fails fast; when false, `acquire` blocks until a connection
    /// becomes available (optionally bounded by `acquire_timeout_ms`).
    #[serde(default)]
    pub useless_connection_exception: bool,

    /// Bound on how long a blocking `acquire` waits, in milliseconds. Only meaningful when
    /// `useless_connection_exception` is `false`. `None` waits indefinitely.
    #[serde(default)]
    pub acquire_timeout_ms: Option<u64>,

    /// Liveness-probe statement text, used when `test_before_use` is set.
    #[serde(default)]
    pub test_query_sql: Option<String>,

    /// When true, validate proxies on acquire; unhealthy ones are destroyed and replaced.
    #[serde(default)]
    pub test_before_use: bool,

    /// Proxies idle longer than this are eligible for eviction down to `core_pool_size`.
    #[serde(default = "default_limit_idle_time_secs")]
    pub limit_idle_time_secs: u64,

    /// Cadence at which the maintenance scheduler sweeps this pool.
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,
}

fn default_acquire_increment() -> u32 {
    1
}

fn default_acquire_retry_times() -> u32 {
    3
}

fn default_limit_idle_time_secs() -> u64 {
    10 * 60
}

fn default_maintenance_interval_secs() -> u64 {
    60
}

impl PoolConfig {
    /// A minimal configuration suitable for tests: a single-connection, fail-fast pool.
    pub fn new(name: impl Into<String>, max_pool_size: u32) -> Self {
        Self {
            name: name.into(),
            core_pool_size: 0,
            max_pool_size,
            acquire_increment: default_acquire_increment(),
            acquire_retry_times: default_acquire_retry_times(),
            useless_connection_exception: true,
            acquire_timeout_ms: None,
            test_query_sql: None,
            test_before_use: false,
            limit_idle_time_secs: default_limit_idle_time_secs(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
        }
    }

    pub fn core_pool_size(mut self, n: u32) -> Self {
        self.core_pool_size = n;
        self
    }

    pub fn acquire_increment(mut self, n: u32) -> Self {
        self.acquire_increment = n;
        self
    }

    pub fn acquire_retry_times(mut self, n: u32) -> Self {
        self.acquire_retry_times = n;
        self
    }

    pub fn useless_connection_exception(mut self, v: bool) -> Self {
        self.useless_connection_exception = v;
        self
    }

    pub fn acquire_timeout_ms(mut self, v: Option<u64>) -> Self {
        self.acquire_timeout_ms = v;
        self
    }

    pub fn test_before_use(mut self, v: bool) -> Self {
        self.test_before_use = v;
        self
    }

    pub fn test_query_sql(mut self, sql: impl Into<String>) -> Self {
        self.test_query_sql = Some(sql.into());
        self
    }

    pub fn limit_idle_time(mut self, d: Duration) -> Self {
        self.limit_idle_time_secs = d.as_secs();
        self
    }

    pub fn maintenance_interval(mut self, d: Duration) -> Self {
        self.maintenance_interval_secs = d.as_secs().max(1);
        self
    }

    pub fn limit_idle_time_duration(&self) -> Duration {
        Duration::from_secs(self.limit_idle_time_secs)
    }

    pub fn maintenance_interval_duration(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }

    /// Parse from a JSON document. The one concrete source format shipped with the core; any
    /// other format is a `serde::Deserializer` away from working with [`PoolConfig`] directly.
    pub fn from_json_str(s: &str) -> Result<Self, Error> {
        let config: Self =
            serde_json::from_str(s).map_err(|e| Error::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the recognized options and claim this pool's name in the process-wide registry.
    ///
    /// Returns [`Error::Config`] if validation fails or the name is already taken. Call this
    /// exactly once per pool, at construction time.
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(Error::Config("pool name must not be empty".into()));
        }
        if self.max_pool_size < self.core_pool_size {
            return Err(Error::Config(format!(
                "max_pool_size ({}) must be >= core_pool_size ({})",
                self.max_pool_size, self.core_pool_size
            )));
        }
        if self.max_pool_size == 0 {
            return Err(Error::Config("max_pool_size must be >= 1".into()));
        }
        Ok(())
    }
}

/// Process-wide set of claimed pool names.
static POOL_NAMES: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Claim a pool name for the lifetime of the process, failing if it's already taken.
///
/// [`crate::Pool::connect`] (and [`crate::PoolOptions::connect`]) call this during construction.
/// There is deliberately no "release" —
/// pool names are a process-lifetime resource, matching the source system's requirement that a
/// configured pool name be unique within the process.
pub(crate) fn claim_pool_name(name: &str) -> Result<(), Error> {
    let mut names = POOL_NAMES.lock().unwrap();
    if !names.insert(name.to_owned()) {
        return Err(Error::Config(format!(
            "a pool named {name:?} already exists in this process"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_max_below_core() {
        let cfg = PoolConfig::new("t1", 1).core_pool_size(2);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_empty_name() {
        let cfg = PoolConfig::new("", 1);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn from_json_round_trip() {
        let json = r#"{"name": "json-pool", "max_pool_size": 4, "core_pool_size": 1}"#;
        let cfg = PoolConfig::from_json_str(json).unwrap();
        assert_eq!(cfg.name, "json-pool");
        assert_eq!(cfg.max_pool_size, 4);
        assert_eq!(cfg.core_pool_size, 1);
        assert_eq!(cfg.acquire_increment, 1);
    }
}
