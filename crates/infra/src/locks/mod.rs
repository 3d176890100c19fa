//! Distributed lock providers.
//!
//! Locks are keyed by resource name (`projection:<name>` or a subscription
//! name) and keep two daemon instances from doing the same work. Failing to
//! get a lock is not an error: [`DistributedLockProvider::try_acquire`]
//! returns `Ok(None)` and the caller moves on.

pub mod in_memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

pub use in_memory::InMemoryLockProvider;
pub use postgres::PostgresLockProvider;

/// How often a contended lock is re-tried while waiting.
pub(crate) const RETRY_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {timeout:?} waiting for lock '{name}'")]
    Timeout { name: String, timeout: Duration },

    #[error("lock backend error: {0}")]
    Backend(String),
}

/// Backend-specific release action carried by a [`LockHandle`].
#[async_trait]
pub trait LockRelease: Send {
    async fn release(self: Box<Self>) -> Result<(), LockError>;
}

/// A held lock.
///
/// Release it explicitly with [`LockHandle::release`]; releasing twice is a
/// no-op. A handle dropped while still held is released on a background task.
pub struct LockHandle {
    name: String,
    release: Option<Box<dyn LockRelease>>,
}

impl LockHandle {
    pub fn new(name: impl Into<String>, release: Box<dyn LockRelease>) -> Self {
        Self {
            name: name.into(),
            release: Some(release),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_released(&self) -> bool {
        self.release.is_none()
    }

    pub async fn release(&mut self) -> Result<(), LockError> {
        match self.release.take() {
            Some(release) => release.release().await,
            None => Ok(()),
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        let Some(release) = self.release.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let name = self.name.clone();
                runtime.spawn(async move {
                    if let Err(err) = release.release().await {
                        warn!(lock = %name, error = %err, "failed to release dropped lock");
                    }
                });
            }
            Err(_) => warn!(lock = %self.name, "lock handle dropped outside a runtime"),
        }
    }
}

impl core::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LockHandle")
            .field("name", &self.name)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Cross-process mutual exclusion keyed by resource name.
#[async_trait]
pub trait DistributedLockProvider: Send + Sync + 'static {
    /// Wait up to `timeout` for the lock; `Ok(None)` if someone else kept it.
    async fn try_acquire(&self, name: &str, timeout: Duration) -> Result<Option<LockHandle>, LockError>;

    /// Like [`try_acquire`](Self::try_acquire) but treats contention as an error.
    async fn acquire(&self, name: &str, timeout: Duration) -> Result<LockHandle, LockError> {
        self.try_acquire(name, timeout)
            .await?
            .ok_or_else(|| LockError::Timeout {
                name: name.to_string(),
                timeout,
            })
    }
}
