use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SqlCoordinatorError;

const DEFAULT_POOL_SIZE: usize = 5;
const DEFAULT_CHECKOUT_TIMEOUT_SECS: f64 = 5.0;
const DEFAULT_STATEMENT_LIMIT: usize = 1000;

/// Pool sizing and checkout behaviour.
///
/// Deserializes from the same shape database configs usually carry:
/// ```rust
/// use sql_coordinator::PoolConfig;
///
/// let cfg = PoolConfig::from_json(r#"{ "pool": 2, "checkout_timeout": 0.5 }"#).unwrap();
/// assert_eq!(cfg.max_size(), 2);
/// assert_eq!(cfg.checkout_timeout().as_millis(), 500);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of live connections.
    pub pool: usize,
    /// Seconds a caller waits in `checkout` before giving up.
    pub checkout_timeout: f64,
    /// Prepared statements kept per connection.
    pub statement_limit: usize,
    /// Probe idle connections for liveness before leasing them.
    pub verify_on_checkout: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool: DEFAULT_POOL_SIZE,
            checkout_timeout: DEFAULT_CHECKOUT_TIMEOUT_SECS,
            statement_limit: DEFAULT_STATEMENT_LIMIT,
            verify_on_checkout: true,
        }
    }
}

impl PoolConfig {
    #[must_use]
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::new()
    }

    /// Parse and validate a JSON pool configuration. Missing keys take their defaults.
    ///
    /// # Errors
    /// Returns [`SqlCoordinatorError::ConfigError`] for malformed JSON or invalid values.
    pub fn from_json(raw: &str) -> Result<Self, SqlCoordinatorError> {
        let cfg: PoolConfig = serde_json::from_str(raw)
            .map_err(|e| SqlCoordinatorError::ConfigError(format!("invalid pool config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// # Errors
    /// Returns [`SqlCoordinatorError::ConfigError`] when the pool size is zero or the
    /// checkout timeout is negative or not finite.
    pub fn validate(&self) -> Result<(), SqlCoordinatorError> {
        if self.pool == 0 {
            return Err(SqlCoordinatorError::ConfigError(
                "pool size must be at least 1".into(),
            ));
        }
        if !self.checkout_timeout.is_finite() || self.checkout_timeout < 0.0 {
            return Err(SqlCoordinatorError::ConfigError(format!(
                "checkout_timeout must be a non-negative number of seconds, got {}",
                self.checkout_timeout
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn max_size(&self) -> usize {
        self.pool
    }

    /// The checkout timeout as a [`Duration`]. Values too large to represent saturate to
    /// [`Duration::MAX`].
    #[must_use]
    pub fn checkout_timeout(&self) -> Duration {
        match Duration::try_from_secs_f64(self.checkout_timeout) {
            Ok(timeout) => timeout,
            Err(_) if self.checkout_timeout > 0.0 => Duration::MAX,
            Err(_) => Duration::ZERO,
        }
    }
}

/// Fluent builder for [`PoolConfig`].
#[derive(Debug, Clone, Default)]
pub struct PoolConfigBuilder {
    cfg: PoolConfig,
}

impl PoolConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cfg: PoolConfig::default(),
        }
    }

    #[must_use]
    pub fn max_size(mut self, size: usize) -> Self {
        self.cfg.pool = size;
        self
    }

    #[must_use]
    pub fn checkout_timeout(mut self, timeout: Duration) -> Self {
        self.cfg.checkout_timeout = timeout.as_secs_f64();
        self
    }

    #[must_use]
    pub fn statement_limit(mut self, limit: usize) -> Self {
        self.cfg.statement_limit = limit;
        self
    }

    #[must_use]
    pub fn verify_on_checkout(mut self, verify: bool) -> Self {
        self.cfg.verify_on_checkout = verify;
        self
    }

    /// # Errors
    /// Returns [`SqlCoordinatorError::ConfigError`] if the assembled config is invalid.
    pub fn build(self) -> Result<PoolConfig, SqlCoordinatorError> {
        self.cfg.validate()?;
        Ok(self.cfg)
    }
}
