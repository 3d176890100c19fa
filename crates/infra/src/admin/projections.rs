use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use keelson_core::{EventId, StreamId, TenantId};

use super::{progress_percentage, AdminError};
use crate::event_store::EventStore;
use crate::locks::{DistributedLockProvider, LockHandle};
use crate::projections::registry::RegisteredProjection;
use crate::projections::status::start_rebuild;
use crate::projections::TransitionError;
use crate::storage::{ProjectionState, ProjectionStatusRecord, Storage, StorageTx};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionStatusDto {
    pub name: String,
    pub version: u32,
    pub state: ProjectionState,
    pub position: u64,
    pub total_events: Option<u64>,
    pub progress_percentage: Option<f64>,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub failed_event_sequence: Option<u64>,
    pub rebuild_started_at: Option<DateTime<Utc>>,
    pub rebuild_completed_at: Option<DateTime<Utc>>,
}

impl From<ProjectionStatusRecord> for ProjectionStatusDto {
    fn from(status: ProjectionStatusRecord) -> Self {
        Self {
            progress_percentage: progress_percentage(status.position, status.total_events),
            name: status.name,
            version: status.version,
            state: status.state,
            position: status.position,
            total_events: status.total_events,
            last_processed_at: status.last_processed_at,
            last_error: status.last_error,
            failed_event_sequence: status.failed_event_sequence,
            rebuild_started_at: status.rebuild_started_at,
            rebuild_completed_at: status.rebuild_completed_at,
        }
    }
}

/// The event a faulted projection is stuck on, with the error it raised.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedEventDto {
    pub event_id: EventId,
    pub tenant_id: TenantId,
    pub stream_type: String,
    pub stream_id: StreamId,
    pub version: u64,
    pub sequence: u64,
    pub event_type: String,
    pub payload: JsonValue,
    pub timestamp: DateTime<Utc>,
    pub error_message: Option<String>,
}

pub struct ProjectionManager<S: Storage, L> {
    store: EventStore<S>,
    locks: Arc<L>,
    lock_timeout: Duration,
}

impl<S, L> ProjectionManager<S, L>
where
    S: Storage,
    L: DistributedLockProvider,
{
    pub fn new(store: EventStore<S>, locks: Arc<L>, lock_timeout: Duration) -> Self {
        Self {
            store,
            locks,
            lock_timeout,
        }
    }

    /// Persisted status, or the never-run default for a registered projection.
    pub async fn get_status(&self, name: &str) -> Result<Option<ProjectionStatusDto>, AdminError> {
        let mut tx = self.store.storage().begin().await?;
        let stored = tx.load_projection_status(name).await?;
        tx.rollback().await?;

        let status = stored.or_else(|| {
            self.store
                .projections()
                .get(name)
                .map(|projection| ProjectionStatusRecord::new(name, projection.version()))
        });
        Ok(status.map(Into::into))
    }

    /// Every registered projection plus any persisted status left by one that
    /// is no longer registered, ordered by name.
    pub async fn get_all_statuses(&self) -> Result<Vec<ProjectionStatusDto>, AdminError> {
        let mut tx = self.store.storage().begin().await?;
        let stored = tx.list_projection_statuses().await?;
        tx.rollback().await?;

        let mut statuses: BTreeMap<String, ProjectionStatusRecord> = stored
            .into_iter()
            .map(|status| (status.name.clone(), status))
            .collect();
        for projection in self.store.projections().iter() {
            statuses
                .entry(projection.name().to_string())
                .or_insert_with(|| ProjectionStatusRecord::new(projection.name(), projection.version()));
        }
        Ok(statuses.into_values().map(Into::into).collect())
    }

    /// Clear the projection and replay it from the start of the log.
    pub async fn rebuild(&self, name: &str) -> Result<ProjectionStatusDto, AdminError> {
        let projection = self.registered(name)?;
        let mut lock = self.lock(name).await?;

        let result = async {
            let mut tx = self.store.storage().begin().await?;
            let mut status = self.load_or_default(&mut tx, projection).await?;
            start_rebuild(&mut tx, projection, &mut status)
                .await
                .map_err(|source| AdminError::Rebuild {
                    name: name.to_string(),
                    source,
                })?;
            tx.commit().await?;
            Ok::<_, AdminError>(status)
        }
        .await;

        release(&mut lock).await;
        let status = result?;
        info!(projection = name, total_events = ?status.total_events, "projection rebuild requested");
        Ok(status.into())
    }

    pub async fn pause(&self, name: &str) -> Result<ProjectionStatusDto, AdminError> {
        self.transition(name, ProjectionStatusRecord::pause).await
    }

    pub async fn resume(&self, name: &str) -> Result<ProjectionStatusDto, AdminError> {
        self.transition(name, ProjectionStatusRecord::resume).await
    }

    /// Reprocess the failed event on the daemon's next batch.
    pub async fn retry_failed_event(&self, name: &str) -> Result<ProjectionStatusDto, AdminError> {
        self.transition(name, ProjectionStatusRecord::retry).await
    }

    /// Move past the failed event without applying it.
    pub async fn skip_failed_event(&self, name: &str) -> Result<ProjectionStatusDto, AdminError> {
        self.transition(name, ProjectionStatusRecord::skip).await
    }

    /// The event a faulted projection failed on. `None` unless faulted.
    pub async fn get_failed_event(&self, name: &str) -> Result<Option<FailedEventDto>, AdminError> {
        let mut tx = self.store.storage().begin().await?;
        let Some(status) = tx.load_projection_status(name).await? else {
            tx.rollback().await?;
            return Ok(None);
        };
        let sequence = match (status.state, status.failed_event_sequence) {
            (ProjectionState::Faulted, Some(sequence)) => sequence,
            _ => {
                tx.rollback().await?;
                return Ok(None);
            }
        };
        let event = tx.event_at(sequence).await?;
        tx.rollback().await?;

        Ok(event.map(|event| FailedEventDto {
            event_type: event.event_type().to_string(),
            event_id: event.event_id,
            tenant_id: event.tenant_id,
            stream_type: event.stream_type,
            stream_id: event.stream_id,
            version: event.version,
            sequence: event.sequence,
            payload: event.payload,
            timestamp: event.timestamp,
            error_message: status.last_error,
        }))
    }

    async fn transition<F>(&self, name: &str, apply: F) -> Result<ProjectionStatusDto, AdminError>
    where
        F: FnOnce(&mut ProjectionStatusRecord) -> Result<(), TransitionError>,
    {
        let projection = self.registered(name)?;
        let mut lock = self.lock(name).await?;

        let result = async {
            let mut tx = self.store.storage().begin().await?;
            let mut status = self.load_or_default(&mut tx, projection).await?;
            if let Err(err) = apply(&mut status) {
                tx.rollback().await?;
                return Err(err.into());
            }
            tx.save_projection_status(&status).await?;
            tx.commit().await?;
            Ok::<_, AdminError>(status)
        }
        .await;

        release(&mut lock).await;
        let status = result?;
        info!(projection = name, state = %status.state, position = status.position, "projection status changed");
        Ok(status.into())
    }

    fn registered(&self, name: &str) -> Result<&RegisteredProjection<S::Tx>, AdminError> {
        self.store
            .projections()
            .get(name)
            .ok_or_else(|| AdminError::UnknownProjection(name.to_string()))
    }

    async fn lock(&self, name: &str) -> Result<LockHandle, AdminError> {
        Ok(self
            .locks
            .acquire(&format!("projection:{name}"), self.lock_timeout)
            .await?)
    }

    async fn load_or_default(
        &self,
        tx: &mut S::Tx,
        projection: &RegisteredProjection<S::Tx>,
    ) -> Result<ProjectionStatusRecord, AdminError> {
        Ok(tx
            .load_projection_status(projection.name())
            .await?
            .unwrap_or_else(|| ProjectionStatusRecord::new(projection.name(), projection.version())))
    }
}

pub(super) async fn release(lock: &mut LockHandle) {
    if let Err(err) = lock.release().await {
        warn!(lock = lock.name(), error = %err, "failed to release admin lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use serde::Deserialize;

    use keelson_core::ExpectedVersion;
    use keelson_events::{EventEnvelope, EventTypeRegistry, NewEvent};

    use crate::config::ProjectionDaemonConfig;
    use crate::locks::InMemoryLockProvider;
    use crate::projections::{
        BatchOutcome, Projection, ProjectionContext, ProjectionDaemon, ProjectionRegistry,
    };
    use crate::storage::{InMemoryStorage, InMemoryTx};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Tick {
        n: u32,
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Total {
        sum: u32,
    }

    struct Totals {
        fail_on: Option<u32>,
    }

    #[async_trait]
    impl Projection<InMemoryTx> for Totals {
        type Snapshot = Total;

        fn name(&self) -> &str {
            "totals"
        }

        async fn evolve(
            &self,
            snapshot: &mut Total,
            event: &EventEnvelope,
            _ctx: &mut ProjectionContext<'_, InMemoryTx>,
        ) -> anyhow::Result<()> {
            let tick = event.payload::<Tick>().ok_or_else(|| anyhow::anyhow!("not a tick"))?;
            if self.fail_on == Some(tick.n) {
                anyhow::bail!("tick {} rejected", tick.n);
            }
            snapshot.sum += tick.n;
            Ok(())
        }
    }

    struct Fixture {
        store: EventStore<InMemoryStorage>,
        manager: ProjectionManager<InMemoryStorage, InMemoryLockProvider>,
        daemon: ProjectionDaemon<InMemoryStorage, InMemoryLockProvider>,
    }

    fn fixture(fail_on: Option<u32>) -> Fixture {
        let events = EventTypeRegistry::builder().register::<Tick>().unwrap().build();
        let projections = ProjectionRegistry::builder()
            .eventual(Totals { fail_on })
            .unwrap()
            .build();
        let store = EventStore::new(InMemoryStorage::new(), events).with_projections(projections);
        let locks = Arc::new(InMemoryLockProvider::new());
        Fixture {
            manager: ProjectionManager::new(store.clone(), Arc::clone(&locks), Duration::from_millis(50)),
            daemon: ProjectionDaemon::new(store.clone(), locks, ProjectionDaemonConfig::default()),
            store,
        }
    }

    async fn ticks(store: &EventStore<InMemoryStorage>, values: &[u32]) {
        let events = values.iter().map(|&n| NewEvent::new(Tick { n }).unwrap()).collect();
        store
            .append_to(TenantId::new(), "clock", StreamId::new(), ExpectedVersion::NoStream, events)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn never_run_projection_reports_defaults() {
        let fx = fixture(None);
        let status = fx.manager.get_status("totals").await.unwrap().unwrap();
        assert_eq!(status.state, ProjectionState::Active);
        assert_eq!(status.position, 0);
        assert_eq!(status.progress_percentage, None);

        assert!(fx.manager.get_status("missing").await.unwrap().is_none());
        let all = fx.manager.get_all_statuses().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "totals");
    }

    #[tokio::test]
    async fn rebuild_reports_progress() {
        let fx = fixture(None);
        ticks(&fx.store, &[1, 2, 3]).await;

        let status = fx.manager.rebuild("totals").await.unwrap();
        assert_eq!(status.state, ProjectionState::Rebuilding);
        assert_eq!(status.total_events, Some(3));
        assert_eq!(status.progress_percentage, Some(0.0));

        let err = fx.manager.rebuild("missing").await.unwrap_err();
        assert!(matches!(err, AdminError::UnknownProjection(_)));
    }

    #[tokio::test]
    async fn retry_and_skip_a_failed_event() {
        let fx = fixture(Some(2));
        ticks(&fx.store, &[1, 2, 3]).await;

        let outcome = fx.daemon.process("totals").await.unwrap();
        assert!(matches!(outcome, BatchOutcome::Faulted { sequence: 2, .. }));

        let failed = fx.manager.get_failed_event("totals").await.unwrap().unwrap();
        assert_eq!(failed.sequence, 2);
        assert_eq!(failed.event_type, "tick");
        assert_eq!(failed.payload, serde_json::json!({ "n": 2 }));
        assert!(failed.error_message.unwrap().contains("tick 2 rejected"));

        let err = fx.manager.pause("totals").await.unwrap_err();
        assert!(matches!(err, AdminError::InvalidStateTransition { operation: "pause", .. }));

        let retried = fx.manager.retry_failed_event("totals").await.unwrap();
        assert_eq!(retried.state, ProjectionState::Active);
        assert_eq!(retried.position, 1);

        fx.daemon.process("totals").await.unwrap();
        let skipped = fx.manager.skip_failed_event("totals").await.unwrap();
        assert_eq!(skipped.position, 2);
        assert!(fx.manager.get_failed_event("totals").await.unwrap().is_none());

        fx.daemon.catch_up().await;
        let status = fx.manager.get_status("totals").await.unwrap().unwrap();
        assert_eq!(status.position, 3);
    }

    #[tokio::test]
    async fn pause_then_resume() {
        let fx = fixture(None);
        let paused = fx.manager.pause("totals").await.unwrap();
        assert_eq!(paused.state, ProjectionState::Paused);
        ticks(&fx.store, &[1]).await;
        assert_eq!(fx.daemon.process("totals").await.unwrap(), BatchOutcome::Inert);

        let resumed = fx.manager.resume("totals").await.unwrap();
        assert_eq!(resumed.state, ProjectionState::Active);
        let err = fx.manager.resume("totals").await.unwrap_err();
        assert!(matches!(err, AdminError::InvalidStateTransition { operation: "resume", .. }));
    }

    #[tokio::test]
    async fn admin_waits_for_the_projection_lock() {
        let fx = fixture(None);
        let locks = InMemoryLockProvider::new();
        let manager = ProjectionManager::new(fx.store.clone(), Arc::new(locks.clone()), Duration::from_millis(20));
        let _held = locks
            .try_acquire("projection:totals", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();

        let err = manager.pause("totals").await.unwrap_err();
        assert!(matches!(err, AdminError::Lock(_)));
    }

    #[test]
    fn status_serializes_camel_case() {
        let dto: ProjectionStatusDto = ProjectionStatusRecord::new("totals", 3).into();
        let json = serde_json::to_value(&dto).unwrap();
        assert_eq!(json["name"], "totals");
        assert_eq!(json["state"], "active");
        assert!(json.get("progressPercentage").is_some());
        assert!(json.get("failedEventSequence").is_some());
    }
}
