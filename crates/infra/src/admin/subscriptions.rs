use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use super::projections::release;
use super::{progress_percentage, AdminError};
use crate::event_store::EventStore;
use crate::locks::DistributedLockProvider;
use crate::storage::{Storage, StorageTx, SubscriptionCheckpointRecord};
use crate::subscriptions::SubscriptionRegistry;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStatusDto {
    pub name: String,
    pub position: u64,
    pub total_events: u64,
    pub progress_percentage: Option<f64>,
    pub last_processed_at: Option<DateTime<Utc>>,
}

impl SubscriptionStatusDto {
    fn new(name: &str, checkpoint: Option<&SubscriptionCheckpointRecord>, total_events: u64) -> Self {
        let position = checkpoint.map_or(0, |checkpoint| checkpoint.sequence);
        Self {
            name: name.to_string(),
            position,
            total_events,
            progress_percentage: progress_percentage(position, Some(total_events)),
            last_processed_at: checkpoint.map(|checkpoint| checkpoint.updated_at),
        }
    }
}

pub struct SubscriptionManager<S: Storage, L> {
    store: EventStore<S>,
    subscriptions: Arc<SubscriptionRegistry<S::Tx>>,
    locks: Arc<L>,
    lock_timeout: Duration,
}

impl<S, L> SubscriptionManager<S, L>
where
    S: Storage,
    L: DistributedLockProvider,
{
    pub fn new(
        store: EventStore<S>,
        subscriptions: Arc<SubscriptionRegistry<S::Tx>>,
        locks: Arc<L>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            store,
            subscriptions,
            locks,
            lock_timeout,
        }
    }

    pub async fn get_status(&self, name: &str) -> Result<Option<SubscriptionStatusDto>, AdminError> {
        let mut tx = self.store.storage().begin().await?;
        let checkpoint = tx.load_checkpoint(name).await?;
        let total = tx.count_events().await?;
        tx.rollback().await?;

        if checkpoint.is_none() && !self.subscriptions.contains(name) {
            return Ok(None);
        }
        Ok(Some(SubscriptionStatusDto::new(name, checkpoint.as_ref(), total)))
    }

    /// Registered subscriptions plus checkpoints left by unregistered ones,
    /// ordered by name.
    pub async fn get_all_statuses(&self) -> Result<Vec<SubscriptionStatusDto>, AdminError> {
        let mut tx = self.store.storage().begin().await?;
        let checkpoints = tx.list_checkpoints().await?;
        let total = tx.count_events().await?;
        tx.rollback().await?;

        let mut by_name: BTreeMap<String, Option<SubscriptionCheckpointRecord>> = checkpoints
            .into_iter()
            .map(|checkpoint| (checkpoint.name.clone(), Some(checkpoint)))
            .collect();
        for name in self.subscriptions.names() {
            by_name.entry(name.to_string()).or_insert(None);
        }
        Ok(by_name
            .iter()
            .map(|(name, checkpoint)| SubscriptionStatusDto::new(name, checkpoint.as_ref(), total))
            .collect())
    }

    /// Rewind (or fast-forward) a subscription's checkpoint.
    ///
    /// With `start_sequence` the next delivery is that sequence. With
    /// `from_timestamp` it is the first event recorded at or after that
    /// instant; when there is none the checkpoint moves to the end of the log.
    /// Without either the subscription replays from the beginning. Passing
    /// both is rejected.
    pub async fn replay(
        &self,
        name: &str,
        start_sequence: Option<u64>,
        from_timestamp: Option<DateTime<Utc>>,
    ) -> Result<SubscriptionStatusDto, AdminError> {
        if start_sequence.is_some() && from_timestamp.is_some() {
            return Err(AdminError::InvalidReplayRequest(
                "give a start sequence or a timestamp, not both".to_string(),
            ));
        }
        if !self.subscriptions.contains(name) {
            return Err(AdminError::UnknownSubscription(name.to_string()));
        }

        let mut lock = self.locks.acquire(name, self.lock_timeout).await?;
        let result = async {
            let mut tx = self.store.storage().begin().await?;
            let sequence = match (start_sequence, from_timestamp) {
                (Some(start), _) => start.saturating_sub(1),
                (None, Some(at)) => match tx.first_sequence_at_or_after(at).await? {
                    Some(first) => first.saturating_sub(1),
                    None => tx.max_sequence().await?,
                },
                (None, None) => 0,
            };
            let checkpoint = SubscriptionCheckpointRecord {
                name: name.to_string(),
                sequence,
                updated_at: Utc::now(),
            };
            tx.save_checkpoint(&checkpoint).await?;
            let total = tx.count_events().await?;
            tx.commit().await?;
            Ok::<_, AdminError>(SubscriptionStatusDto::new(name, Some(&checkpoint), total))
        }
        .await;

        release(&mut lock).await;
        let status = result?;
        info!(subscription = name, checkpoint = status.position, "subscription replay requested");
        Ok(status)
    }
}
