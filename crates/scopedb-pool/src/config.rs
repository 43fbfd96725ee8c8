//! Pool configuration.

use scopedb_core::{Error, PoolError, PoolErrorKind};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection pool configuration.
///
/// Field names follow the conventional engine options so the struct can be
/// embedded directly in an application config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Steady-state number of pooled connections
    pub pool_size: usize,
    /// Extra connections allowed when the pool is exhausted; closed on release
    pub max_overflow: usize,
    /// Maximum time to wait for a connection in milliseconds
    pub pool_timeout_ms: u64,
    /// Probe reused connections before handing them out
    pub pool_pre_ping: bool,
    /// Idle age in milliseconds after which a pooled connection is replaced
    pub pool_recycle_ms: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 5,
            max_overflow: 10,
            pool_timeout_ms: 30_000, // 30 seconds
            pool_pre_ping: false,
            pool_recycle_ms: None,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with the given steady-state size.
    pub fn new(pool_size: usize) -> Self {
        Self {
            pool_size,
            ..Default::default()
        }
    }

    /// Set max overflow.
    pub fn max_overflow(mut self, n: usize) -> Self {
        self.max_overflow = n;
        self
    }

    /// Set acquire timeout.
    pub fn pool_timeout(mut self, ms: u64) -> Self {
        self.pool_timeout_ms = ms;
        self
    }

    /// Enable/disable the pre-ping liveness probe.
    pub fn pool_pre_ping(mut self, enabled: bool) -> Self {
        self.pool_pre_ping = enabled;
        self
    }

    /// Set the recycle age.
    pub fn pool_recycle(mut self, ms: u64) -> Self {
        self.pool_recycle_ms = Some(ms);
        self
    }

    /// Upper bound on concurrently checked-out connections.
    pub fn capacity(&self) -> usize {
        self.pool_size.saturating_add(self.max_overflow)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.pool_timeout_ms)
    }

    pub fn recycle_after(&self) -> Option<Duration> {
        self.pool_recycle_ms.map(Duration::from_millis)
    }

    /// Reject configurations the pool cannot honor.
    #[allow(clippy::result_large_err)]
    pub fn validate(&self) -> Result<(), Error> {
        if self.pool_size == 0 {
            return Err(Error::Pool(PoolError {
                kind: PoolErrorKind::Config,
                message: "pool_size must be at least 1".to_string(),
                source: None,
            }));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = PoolConfig::new(2)
            .max_overflow(0)
            .pool_timeout(1_000)
            .pool_pre_ping(true)
            .pool_recycle(3_600_000);
        assert_eq!(config.capacity(), 2);
        assert_eq!(config.timeout(), Duration::from_secs(1));
        assert_eq!(config.recycle_after(), Some(Duration::from_secs(3600)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_size_is_rejected() {
        let err = PoolConfig::new(0).validate().unwrap_err();
        assert!(matches!(err, Error::Pool(ref p) if p.kind == PoolErrorKind::Config));
    }

    #[test]
    fn deserializes_partial_config() {
        let config: PoolConfig =
            serde_json::from_str(r#"{"pool_size": 3, "pool_pre_ping": true}"#).unwrap();
        assert_eq!(config.pool_size, 3);
        assert!(config.pool_pre_ping);
        assert_eq!(config.max_overflow, 10);
        assert_eq!(config.pool_timeout_ms, 30_000);
        assert_eq!(config.pool_recycle_ms, None);
    }
}
