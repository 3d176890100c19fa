//! Subscription daemon: single-event catch-up for every registered
//! subscription.
//!
//! One visit delivers at most one event: lock, read the checkpoint, hand the
//! next event to the handler, advance the checkpoint, commit. A failing
//! handler leaves the checkpoint where it was and the daemon backs off.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{RegisteredSubscription, SubscriptionRegistry};
use crate::config::SubscriptionDaemonConfig;
use crate::event_store::EventStore;
use crate::locks::{DistributedLockProvider, LockError};
use crate::storage::{Storage, StorageError, StorageTx, SubscriptionCheckpointRecord};
use crate::workers::{pause, DaemonHandle};

#[derive(Debug, Error)]
pub enum SubscriptionDaemonError {
    #[error("unknown subscription '{0}'")]
    UnknownSubscription(String),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Another instance holds the subscription's lock.
    Busy,
    /// Caught up with the log.
    Idle,
    /// The checkpoint moved to `sequence`.
    Delivered { sequence: u64 },
    /// The handler rejected `sequence`; it will be offered again.
    Failed { sequence: u64, error: String },
}

#[derive(Debug, Clone, Default)]
pub struct SubscriptionCycle {
    pub outcomes: Vec<(String, DeliveryOutcome)>,
    pub errors: Vec<(String, String)>,
}

impl SubscriptionCycle {
    pub fn outcome(&self, name: &str) -> Option<&DeliveryOutcome> {
        self.outcomes
            .iter()
            .find(|(subscription, _)| subscription == name)
            .map(|(_, outcome)| outcome)
    }

    pub fn delivered(&self) -> bool {
        self.outcomes
            .iter()
            .any(|(_, outcome)| matches!(outcome, DeliveryOutcome::Delivered { .. }))
    }

    /// Every subscription was locked by someone else.
    pub fn all_busy(&self) -> bool {
        !self.outcomes.is_empty()
            && self.errors.is_empty()
            && self
                .outcomes
                .iter()
                .all(|(_, outcome)| *outcome == DeliveryOutcome::Busy)
    }

    pub fn has_failures(&self) -> bool {
        !self.errors.is_empty()
            || self
                .outcomes
                .iter()
                .any(|(_, outcome)| matches!(outcome, DeliveryOutcome::Failed { .. }))
    }
}

pub struct SubscriptionDaemon<S: Storage, L> {
    store: EventStore<S>,
    subscriptions: Arc<SubscriptionRegistry<S::Tx>>,
    locks: Arc<L>,
    config: SubscriptionDaemonConfig,
}

impl<S, L> SubscriptionDaemon<S, L>
where
    S: Storage,
    L: DistributedLockProvider,
{
    pub fn new(
        store: EventStore<S>,
        subscriptions: Arc<SubscriptionRegistry<S::Tx>>,
        locks: Arc<L>,
        config: SubscriptionDaemonConfig,
    ) -> Self {
        Self {
            store,
            subscriptions,
            locks,
            config,
        }
    }

    pub fn config(&self) -> &SubscriptionDaemonConfig {
        &self.config
    }

    pub fn spawn(self) -> DaemonHandle {
        DaemonHandle::spawn(move |shutdown| async move { self.run(shutdown).await })
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(subscriptions = self.subscriptions.len(), "subscription daemon started");

        loop {
            let cycle = self.run_cycle().await;
            let delay = if cycle.has_failures() {
                self.config.error_backoff
            } else if cycle.delivered() {
                std::time::Duration::ZERO
            } else if cycle.all_busy() {
                self.config.lock_retry_delay
            } else {
                self.config.polling_interval
            };
            if pause(&mut shutdown, delay).await {
                break;
            }
        }

        info!("subscription daemon stopped");
    }

    /// Offer one event to every registered subscription.
    pub async fn run_cycle(&self) -> SubscriptionCycle {
        let mut cycle = SubscriptionCycle::default();

        for subscription in self.subscriptions.iter() {
            match self.visit(subscription).await {
                Ok(outcome) => cycle.outcomes.push((subscription.name().to_string(), outcome)),
                Err(err) => {
                    warn!(subscription = subscription.name(), error = %err, "subscription cycle failed");
                    cycle.errors.push((subscription.name().to_string(), err.to_string()));
                }
            }
        }

        cycle
    }

    /// Run cycles until nothing is delivered.
    pub async fn catch_up(&self) -> SubscriptionCycle {
        loop {
            let cycle = self.run_cycle().await;
            if !cycle.delivered() {
                return cycle;
            }
        }
    }

    /// Offer the next event to a single subscription.
    pub async fn deliver(&self, name: &str) -> Result<DeliveryOutcome, SubscriptionDaemonError> {
        let subscription = self
            .subscriptions
            .get(name)
            .ok_or_else(|| SubscriptionDaemonError::UnknownSubscription(name.to_string()))?;
        self.visit(subscription).await
    }

    async fn visit(
        &self,
        subscription: &RegisteredSubscription<S::Tx>,
    ) -> Result<DeliveryOutcome, SubscriptionDaemonError> {
        let name = subscription.name();
        let Some(mut lock) = self.locks.try_acquire(name, self.config.lock_timeout).await? else {
            debug!(subscription = name, "subscription locked elsewhere");
            return Ok(DeliveryOutcome::Busy);
        };

        let result = self.deliver_locked(subscription).await;

        if let Err(err) = lock.release().await {
            warn!(lock = name, error = %err, "failed to release subscription lock");
        }
        result
    }

    async fn deliver_locked(
        &self,
        subscription: &RegisteredSubscription<S::Tx>,
    ) -> Result<DeliveryOutcome, SubscriptionDaemonError> {
        let name = subscription.name();
        let mut tx = self.store.storage().begin().await?;
        let checkpoint = tx
            .load_checkpoint(name)
            .await?
            .map_or(0, |checkpoint| checkpoint.sequence);

        let Some(record) = tx.events_after(checkpoint, 1).await?.into_iter().next() else {
            tx.rollback().await?;
            return Ok(DeliveryOutcome::Idle);
        };
        let sequence = record.sequence;

        let handled = match self.store.registry().resolve(&record) {
            Ok(envelope) if subscription.handles(&envelope) => subscription.handle(&mut tx, &envelope).await,
            Ok(_) => Ok(()),
            Err(err) => Err(anyhow::Error::new(err)),
        };

        if let Err(err) = handled {
            tx.rollback().await?;
            let error = format!("{err:#}");
            warn!(subscription = name, sequence, error = %error, "subscription handler failed");
            return Ok(DeliveryOutcome::Failed { sequence, error });
        }

        tx.save_checkpoint(&SubscriptionCheckpointRecord {
            name: name.to_string(),
            sequence,
            updated_at: Utc::now(),
        })
        .await?;
        tx.commit().await?;
        debug!(subscription = name, sequence, "subscription checkpoint advanced");
        Ok(DeliveryOutcome::Delivered { sequence })
    }
}
