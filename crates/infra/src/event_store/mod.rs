//! Append-only event store over a [`Storage`] backend.
//!
//! - Streams are identified by `(tenant, stream type, stream id)` and carry a
//!   contiguous version starting at 1.
//! - Every event gets a global sequence; sequence order is commit order.
//! - Writes go through a [`Session`], which commits appends, inline projection
//!   updates and application writes in one transaction.

mod session;
mod stream;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use thiserror::Error;

use keelson_core::{ExpectedVersion, StreamId, TenantId};
use keelson_events::{
    EventEnvelope, EventTypeRegistry, MaterializationError, NewEvent, StoredEvent, StreamState,
};

use crate::projections::{ProjectionMode, ProjectionRegistry};
use crate::storage::{Storage, StorageError, StorageTx, StreamKey};

pub use session::Session;
pub use stream::EventStream;

#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("stream {0} already exists")]
    StreamAlreadyExists(StreamKey),

    #[error("optimistic concurrency failure: {0}")]
    OptimisticConcurrency(String),

    #[error(transparent)]
    Materialization(#[from] MaterializationError),

    #[error("event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("inline projection '{name}' failed: {source:#}")]
    Projection {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result of a [`EventStore::backfill_type_names`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub updated: u64,
    /// Events whose descriptor matches no registered type; left untouched.
    pub unresolved: u64,
}

/// Entry point for reading and writing event streams.
///
/// Cheap to clone; clones share the backend and registries.
pub struct EventStore<S: Storage> {
    storage: Arc<S>,
    registry: Arc<EventTypeRegistry>,
    projections: Arc<ProjectionRegistry<S::Tx>>,
}

impl<S: Storage> Clone for EventStore<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            registry: Arc::clone(&self.registry),
            projections: Arc::clone(&self.projections),
        }
    }
}

impl<S: Storage> EventStore<S> {
    pub fn new(storage: S, registry: EventTypeRegistry) -> Self {
        Self {
            storage: Arc::new(storage),
            registry: Arc::new(registry),
            projections: Arc::new(ProjectionRegistry::default()),
        }
    }

    pub fn with_projections(mut self, projections: ProjectionRegistry<S::Tx>) -> Self {
        self.projections = Arc::new(projections);
        self
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn registry(&self) -> &EventTypeRegistry {
        &self.registry
    }

    pub fn projections(&self) -> &ProjectionRegistry<S::Tx> {
        &self.projections
    }

    pub async fn begin(&self) -> Result<Session<S>, EventStoreError> {
        let tx = self.storage.begin().await?;
        Ok(Session::new(self.clone(), tx))
    }

    /// Create a stream and commit it in one go.
    pub async fn start_stream(
        &self,
        tenant_id: TenantId,
        stream_type: impl Into<String>,
        stream_id: StreamId,
        events: Vec<NewEvent>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let mut session = self.begin().await?;
        session.start_stream(tenant_id, stream_type, stream_id, events).await?;
        session.commit().await
    }

    /// Append to a stream in one go, creating it when `expected` allows a
    /// missing stream.
    pub async fn append_to(
        &self,
        tenant_id: TenantId,
        stream_type: &str,
        stream_id: StreamId,
        expected: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let mut session = self.begin().await?;
        let stream = session.fetch_for_writing(tenant_id, stream_type, stream_id).await?;

        expected
            .check(stream.as_ref().map(EventStream::version))
            .map_err(|err| EventStoreError::OptimisticConcurrency(err.to_string()))?;

        match stream {
            Some(mut stream) => session.append(&mut stream, events)?,
            None => {
                session.start_stream(tenant_id, stream_type, stream_id, events).await?;
            }
        }
        session.commit().await
    }

    /// Read a stream's committed events, optionally bounded to a version (inclusive).
    pub async fn fetch_for_reading(
        &self,
        tenant_id: TenantId,
        stream_type: &str,
        stream_id: StreamId,
        up_to_version: Option<u64>,
    ) -> Result<Option<EventStream>, EventStoreError> {
        let key = StreamKey::new(tenant_id, stream_type, stream_id);
        let mut tx = self.storage.begin().await?;
        let Some(record) = tx.load_stream(&key).await? else {
            tx.rollback().await?;
            return Ok(None);
        };
        let records = tx.load_events(&key, up_to_version).await?;
        tx.rollback().await?;

        let version = match up_to_version {
            Some(bound) => bound.min(record.version),
            None => record.version,
        };
        let events = self.materialize(&records)?;
        Ok(Some(EventStream::new(key, version, events)))
    }

    /// Fold a stream into `T`. `None` if the stream does not exist.
    pub async fn aggregate_stream<T: StreamState>(
        &self,
        tenant_id: TenantId,
        stream_type: &str,
        stream_id: StreamId,
        up_to_version: Option<u64>,
    ) -> Result<Option<T>, EventStoreError> {
        let stream = self
            .fetch_for_reading(tenant_id, stream_type, stream_id, up_to_version)
            .await?;
        Ok(stream.map(|stream| stream.state()))
    }

    /// A projection's stored snapshot for `key` within a tenant.
    pub async fn load_snapshot<V: DeserializeOwned>(
        &self,
        projection: &str,
        tenant_id: TenantId,
        key: &str,
    ) -> Result<Option<V>, EventStoreError> {
        let mut tx = self.storage.begin().await?;
        let state = tx.load_snapshot(projection, tenant_id, key).await?;
        tx.rollback().await?;
        state.map(serde_json::from_value).transpose().map_err(Into::into)
    }

    /// Stamp logical type names onto events persisted without one.
    ///
    /// Walks the log in batches of `batch_size`, one transaction per batch.
    /// Events whose descriptor is not registered are counted and skipped.
    pub async fn backfill_type_names(&self, batch_size: usize) -> Result<BackfillReport, EventStoreError> {
        let mut report = BackfillReport::default();
        let mut cursor = 0;

        loop {
            let mut tx = self.storage.begin().await?;
            let batch = tx.events_missing_type_name(cursor, batch_size.max(1)).await?;
            let Some(last) = batch.last() else {
                tx.rollback().await?;
                break;
            };
            cursor = last.sequence;

            for event in &batch {
                match self.registry.name_for_descriptor(&event.type_descriptor) {
                    Some(name) => {
                        tx.set_event_type_name(event.sequence, name).await?;
                        report.updated += 1;
                    }
                    None => {
                        tracing::debug!(
                            sequence = event.sequence,
                            descriptor = %event.type_descriptor,
                            "no registered type for descriptor"
                        );
                        report.unresolved += 1;
                    }
                }
            }
            tx.commit().await?;
        }

        tracing::info!(
            updated = report.updated,
            unresolved = report.unresolved,
            "type name backfill finished"
        );
        Ok(report)
    }

    pub(crate) fn materialize(&self, records: &[StoredEvent]) -> Result<Vec<EventEnvelope>, EventStoreError> {
        records
            .iter()
            .map(|record| self.registry.resolve(record).map_err(Into::into))
            .collect()
    }

    /// Run inline projections over freshly inserted events.
    ///
    /// Returns `(name, version)` of every projection that ran, so progress can
    /// be recorded after commit. Projections the daemon currently owns
    /// (rebuilding, or faulted) are skipped; the daemon reaches these events
    /// itself once an operator lets it continue.
    async fn apply_inline(
        &self,
        tx: &mut S::Tx,
        events: &[EventEnvelope],
    ) -> Result<Vec<(String, u32)>, EventStoreError> {
        let mut applied = Vec::new();

        for projection in self.projections.iter().filter(|p| p.mode() == ProjectionMode::Inline) {
            let status = tx.load_projection_status(projection.name()).await?;
            if let Some(status) = status.filter(|s| !s.accepts_inline_updates()) {
                tracing::debug!(
                    projection = projection.name(),
                    state = %status.state,
                    "skipping inline update while the daemon owns the projection"
                );
                continue;
            }

            for event in events.iter().filter(|e| projection.handles(e.type_id())) {
                projection
                    .apply(tx, event)
                    .await
                    .map_err(|source| EventStoreError::Projection {
                        name: projection.name().to_string(),
                        source,
                    })?;
            }
            applied.push((projection.name().to_string(), projection.version()));
        }

        Ok(applied)
    }

    /// Best effort: the events are already committed, so failures here are
    /// logged and left for the daemon's next rebuild or the next append.
    async fn record_inline_progress(&self, applied: &[(String, u32)], sequence: u64, at: DateTime<Utc>) {
        if applied.is_empty() {
            return;
        }

        let result = async {
            let mut tx = self.storage.begin().await?;
            for (name, version) in applied {
                tx.record_inline_progress(name, *version, sequence, at).await?;
            }
            tx.commit().await
        }
        .await;

        if let Err(err) = result {
            tracing::warn!(error = %err, sequence, "failed to record inline projection progress");
        }
    }
}
