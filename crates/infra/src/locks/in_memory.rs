//! Process-local lock provider for tests and single-instance deployments.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{DistributedLockProvider, LockError, LockHandle, LockRelease, RETRY_INTERVAL};

/// Lock table shared by every clone.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLockProvider {
    held: Arc<Mutex<HashSet<String>>>,
}

impl InMemoryLockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.held.lock().map(|held| held.contains(name)).unwrap_or(false)
    }

    fn try_take(&self, name: &str) -> Result<bool, LockError> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| LockError::Backend("lock poisoned".to_string()))?;
        Ok(held.insert(name.to_string()))
    }
}

struct InMemoryRelease {
    held: Arc<Mutex<HashSet<String>>>,
    name: String,
}

#[async_trait]
impl LockRelease for InMemoryRelease {
    async fn release(self: Box<Self>) -> Result<(), LockError> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| LockError::Backend("lock poisoned".to_string()))?;
        held.remove(&self.name);
        Ok(())
    }
}

#[async_trait]
impl DistributedLockProvider for InMemoryLockProvider {
    async fn try_acquire(&self, name: &str, timeout: Duration) -> Result<Option<LockHandle>, LockError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_take(name)? {
                let release = InMemoryRelease {
                    held: Arc::clone(&self.held),
                    name: name.to_string(),
                };
                return Ok(Some(LockHandle::new(name, Box::new(release))));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(RETRY_INTERVAL.min(deadline - now)).await;
        }
    }
}
