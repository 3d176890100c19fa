//! Projection daemon: drives eventual projections through the log and
//! rebuilds any projection whose status says so.
//!
//! Each cycle visits every registered projection once:
//! 1. take the `projection:<name>` lock, skipping the projection if it is busy
//! 2. start a rebuild if the stored version differs from the code version
//! 3. process one batch of events after the stored position, in its own
//!    transaction together with the new position
//! 4. on failure, roll the batch back, salvage the events before the failing
//!    one, and mark the projection Faulted at the failing sequence

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use keelson_events::StoredEvent;

use super::registry::RegisteredProjection;
use super::status::start_rebuild;
use super::ProjectionMode;
use crate::config::ProjectionDaemonConfig;
use crate::event_store::EventStore;
use crate::locks::{DistributedLockProvider, LockError};
use crate::storage::{ProjectionState, ProjectionStatusRecord, Storage, StorageError, StorageTx};
use crate::workers::{pause, DaemonHandle};

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("unknown projection '{0}'")]
    UnknownProjection(String),

    #[error("failed to start rebuild of '{name}': {source:#}")]
    Rebuild {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// What one visit to a projection did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Another instance holds the projection's lock.
    Busy,
    /// Paused, Faulted, or an inline projection that is not rebuilding.
    Inert,
    /// Caught up with the log.
    Idle,
    Advanced { events: usize, position: u64 },
    RebuildCompleted,
    Faulted { sequence: u64, error: String },
}

/// Outcomes of one daemon cycle, keyed by projection name.
#[derive(Debug, Clone, Default)]
pub struct CycleSummary {
    pub outcomes: Vec<(String, BatchOutcome)>,
    /// Projections whose visit failed outright (storage or lock errors).
    pub errors: Vec<(String, String)>,
}

impl CycleSummary {
    pub fn outcome(&self, name: &str) -> Option<&BatchOutcome> {
        self.outcomes
            .iter()
            .find(|(projection, _)| projection == name)
            .map(|(_, outcome)| outcome)
    }

    /// Some projection made progress and more work may be waiting.
    pub fn advanced(&self) -> bool {
        self.outcomes.iter().any(|(_, outcome)| {
            matches!(
                outcome,
                BatchOutcome::Advanced { .. } | BatchOutcome::RebuildCompleted
            )
        })
    }

    pub fn faulted(&self) -> impl Iterator<Item = (&str, u64)> {
        self.outcomes.iter().filter_map(|(name, outcome)| match outcome {
            BatchOutcome::Faulted { sequence, .. } => Some((name.as_str(), *sequence)),
            _ => None,
        })
    }

    pub fn has_failures(&self) -> bool {
        !self.errors.is_empty() || self.faulted().next().is_some()
    }
}

enum BatchResult {
    Applied {
        position: u64,
        applied: usize,
        skipped: usize,
    },
    Faulted {
        index: usize,
        sequence: u64,
        error: String,
    },
}

pub struct ProjectionDaemon<S: Storage, L> {
    store: EventStore<S>,
    locks: Arc<L>,
    config: ProjectionDaemonConfig,
}

impl<S, L> ProjectionDaemon<S, L>
where
    S: Storage,
    L: DistributedLockProvider,
{
    pub fn new(store: EventStore<S>, locks: Arc<L>, config: ProjectionDaemonConfig) -> Self {
        Self {
            store,
            locks,
            config,
        }
    }

    pub fn config(&self) -> &ProjectionDaemonConfig {
        &self.config
    }

    /// Run on a background task until the handle is shut down.
    pub fn spawn(self) -> DaemonHandle {
        DaemonHandle::spawn(move |shutdown| async move { self.run(shutdown).await })
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            projections = self.store.projections().len(),
            batch_size = self.config.batch_size,
            "projection daemon started"
        );

        loop {
            let summary = self.run_cycle().await;
            let delay = if summary.has_failures() {
                self.config.error_backoff
            } else if summary.advanced() {
                self.config.batch_delay
            } else {
                self.config.polling_interval
            };
            if pause(&mut shutdown, delay).await {
                break;
            }
        }

        info!("projection daemon stopped");
    }

    /// Visit every registered projection once.
    pub async fn run_cycle(&self) -> CycleSummary {
        let mut summary = CycleSummary::default();

        for projection in self.store.projections().iter() {
            match self.visit(projection).await {
                Ok(outcome) => summary.outcomes.push((projection.name().to_string(), outcome)),
                Err(err) => {
                    warn!(projection = projection.name(), error = %err, "projection cycle failed");
                    summary.errors.push((projection.name().to_string(), err.to_string()));
                }
            }
        }

        summary
    }

    /// Run cycles until none advances.
    pub async fn catch_up(&self) -> CycleSummary {
        loop {
            let summary = self.run_cycle().await;
            if !summary.advanced() {
                return summary;
            }
        }
    }

    /// Process one batch of a single projection.
    pub async fn process(&self, name: &str) -> Result<BatchOutcome, DaemonError> {
        let projection = self
            .store
            .projections()
            .get(name)
            .ok_or_else(|| DaemonError::UnknownProjection(name.to_string()))?;
        self.visit(projection).await
    }

    async fn visit(&self, projection: &RegisteredProjection<S::Tx>) -> Result<BatchOutcome, DaemonError> {
        let lock_name = format!("projection:{}", projection.name());
        let Some(mut lock) = self
            .locks
            .try_acquire(&lock_name, self.config.lock_timeout)
            .await?
        else {
            debug!(projection = projection.name(), "projection locked elsewhere");
            return Ok(BatchOutcome::Busy);
        };

        let result = self.visit_locked(projection).await;

        if let Err(err) = lock.release().await {
            warn!(lock = %lock_name, error = %err, "failed to release projection lock");
        }
        result
    }

    async fn visit_locked(
        &self,
        projection: &RegisteredProjection<S::Tx>,
    ) -> Result<BatchOutcome, DaemonError> {
        let name = projection.name();
        let mut tx = self.store.storage().begin().await?;
        let mut status = match tx.load_projection_status(name).await? {
            Some(status) => status,
            None => {
                let status = ProjectionStatusRecord::new(name, projection.version());
                tx.save_projection_status(&status).await?;
                tx.commit().await?;
                debug!(projection = name, "projection status created");
                tx = self.store.storage().begin().await?;
                status
            }
        };

        if status.version != projection.version() {
            let from = status.version;
            if !self.config.auto_rebuild_on_version_change {
                status.version = projection.version();
                tx.save_projection_status(&status).await?;
                tx.commit().await?;
                warn!(
                    projection = name,
                    from_version = from,
                    to_version = projection.version(),
                    "projection version changed, keeping existing state"
                );
                tx = self.store.storage().begin().await?;
            } else if status.state != ProjectionState::Paused {
                start_rebuild(&mut tx, projection, &mut status)
                    .await
                    .map_err(|source| DaemonError::Rebuild {
                        name: name.to_string(),
                        source,
                    })?;
                tx.commit().await?;
                info!(
                    projection = name,
                    from_version = from,
                    to_version = projection.version(),
                    "projection version changed, rebuilding"
                );
                tx = self.store.storage().begin().await?;
            }
        }

        let runnable = match status.state {
            ProjectionState::Paused | ProjectionState::Faulted => false,
            ProjectionState::Rebuilding => true,
            ProjectionState::Active => projection.mode() == ProjectionMode::Eventual,
        };
        if !runnable {
            tx.rollback().await?;
            return Ok(BatchOutcome::Inert);
        }

        let records = tx
            .events_after(status.position, self.config.batch_size.max(1))
            .await?;

        if records.is_empty() {
            return self.finish_idle(tx, status).await;
        }

        match self.apply_batch(&mut tx, projection, &records).await {
            BatchResult::Applied {
                position,
                applied,
                skipped,
            } => {
                status.advance(position, Utc::now());
                tx.save_projection_status(&status).await?;
                tx.commit().await?;
                debug!(projection = name, applied, skipped, position, "projection batch committed");
                Ok(BatchOutcome::Advanced {
                    events: records.len(),
                    position,
                })
            }
            BatchResult::Faulted {
                index,
                sequence,
                error,
            } => {
                tx.rollback().await?;
                self.record_fault(projection, status, &records[..index], sequence, &error)
                    .await?;
                Ok(BatchOutcome::Faulted { sequence, error })
            }
        }
    }

    /// Nothing after the position. A rebuild completes here, checked under the
    /// append lock so no commit can slip in between the check and the flip.
    async fn finish_idle(
        &self,
        mut tx: S::Tx,
        mut status: ProjectionStatusRecord,
    ) -> Result<BatchOutcome, DaemonError> {
        if status.state != ProjectionState::Rebuilding {
            tx.rollback().await?;
            return Ok(BatchOutcome::Idle);
        }

        tx.lock_appends().await?;
        if !tx.events_after(status.position, 1).await?.is_empty() {
            tx.rollback().await?;
            return Ok(BatchOutcome::Idle);
        }

        status.complete_rebuild(Utc::now());
        tx.save_projection_status(&status).await?;
        tx.commit().await?;
        info!(projection = %status.name, position = status.position, "projection rebuild completed");
        Ok(BatchOutcome::RebuildCompleted)
    }

    async fn apply_batch(
        &self,
        tx: &mut S::Tx,
        projection: &RegisteredProjection<S::Tx>,
        records: &[StoredEvent],
    ) -> BatchResult {
        let mut applied = 0;
        let mut skipped = 0;

        for (index, record) in records.iter().enumerate() {
            let envelope = match self.store.registry().resolve(record) {
                Ok(envelope) => envelope,
                Err(err) => {
                    return BatchResult::Faulted {
                        index,
                        sequence: record.sequence,
                        error: err.to_string(),
                    };
                }
            };

            if !projection.handles(envelope.type_id()) {
                skipped += 1;
                continue;
            }

            if let Err(err) = projection.apply(tx, &envelope).await {
                return BatchResult::Faulted {
                    index,
                    sequence: record.sequence,
                    error: format!("{err:#}"),
                };
            }
            applied += 1;
        }

        BatchResult::Applied {
            position: records.last().map_or(0, |record| record.sequence),
            applied,
            skipped,
        }
    }

    /// Persist the fault in a fresh transaction, keeping the work done on
    /// `prefix` (the events before the failing one) when it re-applies cleanly.
    async fn record_fault(
        &self,
        projection: &RegisteredProjection<S::Tx>,
        mut status: ProjectionStatusRecord,
        prefix: &[StoredEvent],
        sequence: u64,
        error: &str,
    ) -> Result<(), DaemonError> {
        let mut tx = self.store.storage().begin().await?;

        if !prefix.is_empty() {
            match self.apply_batch(&mut tx, projection, prefix).await {
                BatchResult::Applied { position, .. } => status.advance(position, Utc::now()),
                BatchResult::Faulted { .. } => {
                    tx.rollback().await?;
                    tx = self.store.storage().begin().await?;
                }
            }
        }

        status.fault(sequence, error);
        tx.save_projection_status(&status).await?;
        tx.commit().await?;

        warn!(
            projection = projection.name(),
            sequence,
            position = status.position,
            error,
            "projection faulted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    use keelson_core::{StreamId, TenantId};
    use keelson_events::{EventEnvelope, EventTypeRegistry, NewEvent};

    use crate::locks::InMemoryLockProvider;
    use crate::projections::{HandledEvents, Projection, ProjectionContext, ProjectionRegistry};
    use crate::storage::{InMemoryStorage, InMemoryTx};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Noted {
        text: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Ignored;

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Notes {
        texts: Vec<String>,
    }

    struct NoteLog {
        version: u32,
        poison: Option<&'static str>,
    }

    #[async_trait]
    impl Projection<InMemoryTx> for NoteLog {
        type Snapshot = Notes;

        fn name(&self) -> &str {
            "notes"
        }

        fn version(&self) -> u32 {
            self.version
        }

        fn handled_events(&self) -> HandledEvents {
            HandledEvents::only().with::<Noted>()
        }

        async fn evolve(
            &self,
            snapshot: &mut Notes,
            event: &EventEnvelope,
            _ctx: &mut ProjectionContext<'_, InMemoryTx>,
        ) -> anyhow::Result<()> {
            let noted = event.payload::<Noted>().ok_or_else(|| anyhow::anyhow!("not a note"))?;
            if self.poison == Some(noted.text.as_str()) {
                anyhow::bail!("cannot note '{}'", noted.text);
            }
            snapshot.texts.push(noted.text.clone());
            Ok(())
        }
    }

    struct Fixture {
        storage: InMemoryStorage,
        locks: Arc<InMemoryLockProvider>,
        tenant: TenantId,
        stream: StreamId,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                storage: InMemoryStorage::new(),
                locks: Arc::new(InMemoryLockProvider::new()),
                tenant: TenantId::new(),
                stream: StreamId::new(),
            }
        }

        fn store(&self, projection: NoteLog) -> EventStore<InMemoryStorage> {
            let events = EventTypeRegistry::builder()
                .register::<Noted>()
                .and_then(|b| b.register::<Ignored>())
                .unwrap()
                .build();
            let projections = ProjectionRegistry::builder().eventual(projection).unwrap().build();
            EventStore::new(self.storage.clone(), events).with_projections(projections)
        }

        fn daemon(&self, projection: NoteLog, batch_size: usize) -> ProjectionDaemon<InMemoryStorage, InMemoryLockProvider> {
            ProjectionDaemon::new(
                self.store(projection),
                Arc::clone(&self.locks),
                ProjectionDaemonConfig::default()
                    .with_batch_size(batch_size)
                    .with_lock_timeout(Duration::from_millis(10)),
            )
        }

        async fn append(&self, store: &EventStore<InMemoryStorage>, events: Vec<NewEvent>) {
            store
                .append_to(
                    self.tenant,
                    "notebook",
                    self.stream,
                    keelson_core::ExpectedVersion::Any,
                    events,
                )
                .await
                .unwrap();
        }

        async fn texts(&self, store: &EventStore<InMemoryStorage>) -> Vec<String> {
            store
                .load_snapshot::<Notes>("notes", self.tenant, &self.stream.to_string())
                .await
                .unwrap()
                .map(|notes| notes.texts)
                .unwrap_or_default()
        }

        async fn status(&self) -> ProjectionStatusRecord {
            let mut tx = self.storage.begin().await.unwrap();
            tx.load_projection_status("notes").await.unwrap().unwrap()
        }
    }

    fn note(text: &str) -> NewEvent {
        NewEvent::new(Noted { text: text.to_string() }).unwrap()
    }

    fn log(version: u32) -> NoteLog {
        NoteLog { version, poison: None }
    }

    #[tokio::test]
    async fn processes_in_batches_and_skips_unhandled_events() {
        let fx = Fixture::new();
        let daemon = fx.daemon(log(1), 2);
        let store = fx.store(log(1));
        fx.append(&store, vec![note("a"), NewEvent::new(Ignored).unwrap(), note("b")]).await;

        let first = daemon.process("notes").await.unwrap();
        assert_eq!(first, BatchOutcome::Advanced { events: 2, position: 2 });
        assert_eq!(fx.texts(&store).await, vec!["a"]);

        let second = daemon.process("notes").await.unwrap();
        assert_eq!(second, BatchOutcome::Advanced { events: 1, position: 3 });
        assert_eq!(daemon.process("notes").await.unwrap(), BatchOutcome::Idle);

        assert_eq!(fx.texts(&store).await, vec!["a", "b"]);
        let status = fx.status().await;
        assert_eq!(status.state, ProjectionState::Active);
        assert_eq!(status.position, 3);
        assert!(status.last_processed_at.is_some());
    }

    #[tokio::test]
    async fn fault_keeps_events_before_the_failing_one() {
        let fx = Fixture::new();
        let poisoned = NoteLog { version: 1, poison: Some("bad") };
        let daemon = fx.daemon(poisoned, 10);
        let store = fx.store(log(1));
        fx.append(&store, vec![note("a"), note("b"), note("bad"), note("c")]).await;

        let outcome = daemon.process("notes").await.unwrap();
        assert!(matches!(outcome, BatchOutcome::Faulted { sequence: 3, .. }));

        let status = fx.status().await;
        assert_eq!(status.state, ProjectionState::Faulted);
        assert_eq!(status.position, 2);
        assert_eq!(status.failed_event_sequence, Some(3));
        assert!(status.last_error.as_deref().unwrap().contains("cannot note 'bad'"));
        assert_eq!(fx.texts(&store).await, vec!["a", "b"]);

        assert_eq!(daemon.process("notes").await.unwrap(), BatchOutcome::Inert);
    }

    #[tokio::test]
    async fn version_change_rebuilds_from_scratch() {
        let fx = Fixture::new();
        let store = fx.store(log(1));
        fx.append(&store, vec![note("a"), note("b")]).await;
        fx.daemon(log(1), 10).catch_up().await;
        assert_eq!(fx.texts(&store).await, vec!["a", "b"]);

        let daemon = fx.daemon(log(2), 1);
        let first = daemon.process("notes").await.unwrap();
        assert_eq!(first, BatchOutcome::Advanced { events: 1, position: 1 });
        let status = fx.status().await;
        assert_eq!(status.state, ProjectionState::Rebuilding);
        assert_eq!(status.version, 2);
        assert_eq!(status.total_events, Some(2));
        assert_eq!(fx.texts(&store).await, vec!["a"]);

        let summary = daemon.catch_up().await;
        assert_eq!(summary.outcome("notes"), Some(&BatchOutcome::Idle));
        let status = fx.status().await;
        assert_eq!(status.state, ProjectionState::Active);
        assert!(status.rebuild_completed_at.is_some());
        assert_eq!(fx.texts(&store).await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn version_change_without_auto_rebuild_keeps_state() {
        let fx = Fixture::new();
        let store = fx.store(log(1));
        fx.append(&store, vec![note("a")]).await;
        fx.daemon(log(1), 10).catch_up().await;

        let daemon = ProjectionDaemon::new(
            fx.store(log(2)),
            Arc::clone(&fx.locks),
            ProjectionDaemonConfig::default()
                .with_auto_rebuild(false)
                .with_lock_timeout(Duration::from_millis(10)),
        );
        assert_eq!(daemon.process("notes").await.unwrap(), BatchOutcome::Idle);
        let status = fx.status().await;
        assert_eq!(status.version, 2);
        assert_eq!(status.state, ProjectionState::Active);
        assert_eq!(status.position, 1);
        assert!(status.rebuild_started_at.is_none());

        fx.append(&store, vec![note("b")]).await;
        daemon.catch_up().await;
        assert_eq!(fx.texts(&store).await, vec!["a", "b"]);
        assert_eq!(fx.status().await.position, 2);
    }

    #[tokio::test]
    async fn first_visit_persists_the_default_status() {
        let fx = Fixture::new();
        let outcome = fx.daemon(log(1), 10).process("notes").await.unwrap();
        assert_eq!(outcome, BatchOutcome::Idle);
        assert_eq!(fx.status().await, ProjectionStatusRecord::new("notes", 1));
    }

    #[tokio::test]
    async fn busy_lock_skips_the_projection() {
        let fx = Fixture::new();
        let daemon = fx.daemon(log(1), 10);
        let _held = fx
            .locks
            .try_acquire("projection:notes", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();

        let summary = daemon.run_cycle().await;
        assert_eq!(summary.outcome("notes"), Some(&BatchOutcome::Busy));
        assert!(!summary.has_failures());
    }

    #[tokio::test]
    async fn unknown_projection_is_an_error() {
        let fx = Fixture::new();
        let err = fx.daemon(log(1), 10).process("nope").await.unwrap_err();
        assert!(matches!(err, DaemonError::UnknownProjection(_)));
    }

    #[tokio::test]
    async fn spawned_daemon_shuts_down() {
        let fx = Fixture::new();
        let store = fx.store(log(1));
        fx.append(&store, vec![note("a")]).await;

        let daemon = ProjectionDaemon::new(
            fx.store(log(1)),
            Arc::clone(&fx.locks),
            ProjectionDaemonConfig::default().with_polling_interval(Duration::from_millis(5)),
        );
        let handle = daemon.spawn();

        let mut caught_up = false;
        for _ in 0..200 {
            if fx.texts(&store).await == vec!["a"] {
                caught_up = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.shutdown().await;
        assert!(caught_up);
    }
}
