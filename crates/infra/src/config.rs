//! Engine configuration.
//!
//! Every knob has a default; [`EngineConfig::from_env`] overrides them from
//! `KEELSON_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}'")]
    Invalid { var: String, value: String },
}

/// Projection daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProjectionDaemonConfig {
    /// Maximum events per batch transaction
    pub batch_size: usize,
    /// Sleep between cycles when nothing advanced
    pub polling_interval: Duration,
    /// Pause between batches of the same projection
    pub batch_delay: Duration,
    /// How long to wait for a projection lock before skipping it
    pub lock_timeout: Duration,
    /// Sleep after a cycle that faulted or errored
    pub error_backoff: Duration,
    /// Rebuild projections whose stored version differs from their code
    pub auto_rebuild_on_version_change: bool,
}

impl Default for ProjectionDaemonConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            polling_interval: Duration::from_secs(1),
            batch_delay: Duration::ZERO,
            lock_timeout: Duration::from_millis(100),
            error_backoff: Duration::from_secs(5),
            auto_rebuild_on_version_change: true,
        }
    }
}

impl ProjectionDaemonConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn with_auto_rebuild(mut self, enabled: bool) -> Self {
        self.auto_rebuild_on_version_change = enabled;
        self
    }
}

/// Subscription daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SubscriptionDaemonConfig {
    pub polling_interval: Duration,
    pub lock_timeout: Duration,
    /// Sleep when every subscription lock was held elsewhere
    pub lock_retry_delay: Duration,
    pub error_backoff: Duration,
}

impl Default for SubscriptionDaemonConfig {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_secs(1),
            lock_timeout: Duration::from_millis(100),
            lock_retry_delay: Duration::from_millis(250),
            error_backoff: Duration::from_secs(5),
        }
    }
}

impl SubscriptionDaemonConfig {
    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_lock_retry_delay(mut self, delay: Duration) -> Self {
        self.lock_retry_delay = delay;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub database_url: Option<String>,
    pub projections: ProjectionDaemonConfig,
    pub subscriptions: SubscriptionDaemonConfig,
    /// How long admin operations wait for a projection's lock
    pub admin_lock_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            projections: ProjectionDaemonConfig::default(),
            subscriptions: SubscriptionDaemonConfig::default(),
            admin_lock_timeout: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn with_projections(mut self, projections: ProjectionDaemonConfig) -> Self {
        self.projections = projections;
        self
    }

    pub fn with_subscriptions(mut self, subscriptions: SubscriptionDaemonConfig) -> Self {
        self.subscriptions = subscriptions;
        self
    }

    pub fn with_admin_lock_timeout(mut self, timeout: Duration) -> Self {
        self.admin_lock_timeout = timeout;
        self
    }

    /// Defaults overridden by whichever `KEELSON_*` variables are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let mut config = Self::default();

        if let Some(url) = env.get("KEELSON_DATABASE_URL") {
            config.database_url = Some(url);
        }

        let p = &mut config.projections;
        env.parse("KEELSON_PROJECTION_BATCH_SIZE", &mut p.batch_size)?;
        env.millis("KEELSON_PROJECTION_POLL_INTERVAL_MS", &mut p.polling_interval)?;
        env.millis("KEELSON_PROJECTION_BATCH_DELAY_MS", &mut p.batch_delay)?;
        env.millis("KEELSON_PROJECTION_LOCK_TIMEOUT_MS", &mut p.lock_timeout)?;
        env.millis("KEELSON_PROJECTION_ERROR_BACKOFF_MS", &mut p.error_backoff)?;
        env.parse("KEELSON_PROJECTION_AUTO_REBUILD", &mut p.auto_rebuild_on_version_change)?;

        let s = &mut config.subscriptions;
        env.millis("KEELSON_SUBSCRIPTION_POLL_INTERVAL_MS", &mut s.polling_interval)?;
        env.millis("KEELSON_SUBSCRIPTION_LOCK_TIMEOUT_MS", &mut s.lock_timeout)?;
        env.millis("KEELSON_SUBSCRIPTION_LOCK_RETRY_DELAY_MS", &mut s.lock_retry_delay)?;
        env.millis("KEELSON_SUBSCRIPTION_ERROR_BACKOFF_MS", &mut s.error_backoff)?;

        env.millis("KEELSON_ADMIN_LOCK_TIMEOUT_MS", &mut config.admin_lock_timeout)?;

        if config.projections.batch_size == 0 {
            return Err(ConfigError::Invalid {
                var: "KEELSON_PROJECTION_BATCH_SIZE".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(config)
    }
}

struct Lookup<F>(F);

impl<F: Fn(&str) -> Option<String>> Lookup<F> {
    fn get(&self, var: &str) -> Option<String> {
        (self.0)(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, var: &str, target: &mut T) -> Result<(), ConfigError> {
        if let Some(value) = self.get(var) {
            *target = value.parse().map_err(|_| ConfigError::Invalid {
                var: var.to_string(),
                value,
            })?;
        }
        Ok(())
    }

    fn millis(&self, var: &str, target: &mut Duration) -> Result<(), ConfigError> {
        let mut ms = target.as_millis() as u64;
        self.parse(var, &mut ms)?;
        *target = Duration::from_millis(ms);
        Ok(())
    }
}
