//! Session-level Postgres advisory locks.
//!
//! A held lock pins one pooled connection until release; the lock name is
//! hashed with `hashtextextended` into the advisory lock key space.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use tokio::time::Instant;
use tracing::warn;

use super::{DistributedLockProvider, LockError, LockHandle, LockRelease, RETRY_INTERVAL};

#[derive(Debug, Clone)]
pub struct PostgresLockProvider {
    pool: PgPool,
}

impl PostgresLockProvider {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

struct PostgresRelease {
    conn: PoolConnection<Postgres>,
    name: String,
}

#[async_trait]
impl LockRelease for PostgresRelease {
    async fn release(self: Box<Self>) -> Result<(), LockError> {
        let PostgresRelease { mut conn, name } = *self;
        let result = sqlx::query("SELECT pg_advisory_unlock(hashtextextended($1, 0))")
            .bind(&name)
            .execute(&mut *conn)
            .await;

        if let Err(err) = result {
            warn!(lock = %name, error = %err, "advisory unlock failed; closing connection");
            // The session still owns the lock; never hand it back to the pool.
            drop(conn.detach());
            return Err(LockError::Backend(format!("unlock '{name}': {err}")));
        }
        Ok(())
    }
}

#[async_trait]
impl DistributedLockProvider for PostgresLockProvider {
    async fn try_acquire(&self, name: &str, timeout: Duration) -> Result<Option<LockHandle>, LockError> {
        let deadline = Instant::now() + timeout;
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| LockError::Backend(format!("acquire connection: {e}")))?;

        loop {
            let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtextextended($1, 0))")
                .bind(name)
                .fetch_one(&mut *conn)
                .await
                .map_err(|e| LockError::Backend(format!("try lock '{name}': {e}")))?;

            if acquired {
                let release = PostgresRelease {
                    conn,
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
