use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use keelson_core::{EventId, StreamId, TenantId};
use keelson_events::{EventEnvelope, NewEvent, StoredEvent, UncommittedEvent};

use super::{EventStore, EventStoreError, EventStream};
use crate::storage::{Storage, StorageError, StorageTx, StreamKey, StreamRecord};

struct PendingEvent {
    record: UncommittedEvent,
    type_id: TypeId,
    value: Arc<dyn Any + Send + Sync>,
}

struct PendingStream {
    /// Version the stream had when this session first touched it.
    expected_version: u64,
    version: u64,
    is_new: bool,
    created_at: DateTime<Utc>,
    events: Vec<PendingEvent>,
}

impl PendingStream {
    fn created(at: DateTime<Utc>) -> Self {
        Self {
            expected_version: 0,
            version: 0,
            is_new: true,
            created_at: at,
            events: Vec::new(),
        }
    }

    fn existing(version: u64, at: DateTime<Utc>) -> Self {
        Self {
            expected_version: version,
            version,
            is_new: false,
            created_at: at,
            events: Vec::new(),
        }
    }
}

/// A unit of work against the store.
///
/// Appends are buffered and written on [`commit`](Self::commit) together with
/// inline projection updates and anything written through [`tx`](Self::tx).
/// Dropping a session without committing discards everything.
pub struct Session<S: Storage> {
    store: EventStore<S>,
    tx: S::Tx,
    pending: BTreeMap<StreamKey, PendingStream>,
}

impl<S: Storage> Session<S> {
    pub(crate) fn new(store: EventStore<S>, tx: S::Tx) -> Self {
        Self {
            store,
            tx,
            pending: BTreeMap::new(),
        }
    }

    /// The underlying transaction, for application writes that must commit
    /// atomically with this session's events.
    pub fn tx(&mut self) -> &mut S::Tx {
        &mut self.tx
    }

    /// Create a stream with its initial events.
    ///
    /// Fails with [`EventStoreError::StreamAlreadyExists`] if the identity is
    /// already taken, either in the store or earlier in this session.
    pub async fn start_stream(
        &mut self,
        tenant_id: TenantId,
        stream_type: impl Into<String>,
        stream_id: StreamId,
        events: Vec<NewEvent>,
    ) -> Result<EventStream, EventStoreError> {
        let key = StreamKey::new(tenant_id, stream_type, stream_id);
        if self.pending.contains_key(&key) || self.tx.load_stream(&key).await?.is_some() {
            return Err(EventStoreError::StreamAlreadyExists(key));
        }

        self.pending.insert(key.clone(), PendingStream::created(Utc::now()));
        let mut stream = EventStream::new(key, 0, Vec::new());
        self.append(&mut stream, events)?;
        Ok(stream)
    }

    /// Load a stream for appending.
    ///
    /// If this session already appended to the stream, the handle carries the
    /// in-session version while `events` holds only what is committed.
    pub async fn fetch_for_writing(
        &mut self,
        tenant_id: TenantId,
        stream_type: &str,
        stream_id: StreamId,
    ) -> Result<Option<EventStream>, EventStoreError> {
        let key = StreamKey::new(tenant_id, stream_type, stream_id);
        let stored = self.tx.load_stream(&key).await?;
        let pending_version = self.pending.get(&key).map(|p| p.version);

        let version = match (stored.as_ref(), pending_version) {
            (_, Some(version)) => version,
            (Some(record), None) => record.version,
            (None, None) => return Ok(None),
        };

        let records = if stored.is_some() {
            self.tx.load_events(&key, None).await?
        } else {
            Vec::new()
        };
        let events = self.store.materialize(&records)?;
        Ok(Some(EventStream::new(key, version, events)))
    }

    /// Buffer events onto a stream.
    ///
    /// Versions continue from the handle's version. A handle that lags behind
    /// what this session already appended fails with
    /// [`EventStoreError::OptimisticConcurrency`].
    pub fn append(&mut self, stream: &mut EventStream, events: Vec<NewEvent>) -> Result<(), EventStoreError> {
        if events.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let pending = self
            .pending
            .entry(stream.key().clone())
            .or_insert_with(|| PendingStream::existing(stream.version(), now));

        if pending.version != stream.version() {
            return Err(EventStoreError::OptimisticConcurrency(format!(
                "stream {} handle is at version {} but this session is at version {}",
                stream.key(),
                stream.version(),
                pending.version
            )));
        }

        let mut version = stream.version();
        for event in events {
            version += 1;
            let record = UncommittedEvent {
                event_id: EventId::new(),
                tenant_id: stream.tenant_id(),
                stream_type: stream.stream_type().to_string(),
                stream_id: stream.stream_id(),
                version,
                type_name: Some(self.store.registry.name_for(event.type_id(), event.descriptor())),
                type_descriptor: event.descriptor().to_string(),
                payload: event.payload().clone(),
                timestamp: now,
            };
            pending.events.push(PendingEvent {
                record,
                type_id: event.type_id(),
                value: event.value(),
            });
        }

        pending.version = version;
        stream.set_version(version);
        Ok(())
    }

    /// Persist everything buffered in this session atomically.
    ///
    /// Stream rows are written in key order before any event, inline
    /// projections run against the same transaction, and their positions are
    /// advanced once the commit succeeded.
    pub async fn commit(self) -> Result<Vec<StoredEvent>, EventStoreError> {
        let Session {
            store,
            mut tx,
            pending,
        } = self;
        let now = Utc::now();

        if let Err(err) = write_streams(&mut tx, &pending, now).await {
            discard(tx).await;
            return Err(err);
        }

        let mut records = Vec::new();
        let mut values = Vec::new();
        for stream in pending.into_values() {
            for event in stream.events {
                records.push(event.record);
                values.push((event.type_id, event.value));
            }
        }

        if records.is_empty() {
            tx.commit().await.map_err(append_error)?;
            return Ok(Vec::new());
        }

        let stored = match tx.insert_events(records).await {
            Ok(stored) => stored,
            Err(err) => {
                discard(tx).await;
                return Err(append_error(err));
            }
        };

        let envelopes: Vec<EventEnvelope> = stored
            .iter()
            .cloned()
            .zip(values)
            .map(|(record, (type_id, value))| {
                let name = record.event_type().to_string();
                EventEnvelope::new(record, type_id, name, value)
            })
            .collect();

        let applied = match store.apply_inline(&mut tx, &envelopes).await {
            Ok(applied) => applied,
            Err(err) => {
                discard(tx).await;
                return Err(err);
            }
        };

        tx.commit().await.map_err(append_error)?;

        if let Some(last) = stored.last() {
            tracing::debug!(
                events = stored.len(),
                last_sequence = last.sequence,
                "appended events"
            );
            store.record_inline_progress(&applied, last.sequence, now).await;
        }

        Ok(stored)
    }

    /// Discard everything buffered in this session.
    pub async fn rollback(self) -> Result<(), EventStoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

async fn write_streams<T: StorageTx>(
    tx: &mut T,
    pending: &BTreeMap<StreamKey, PendingStream>,
    now: DateTime<Utc>,
) -> Result<(), EventStoreError> {
    for (key, stream) in pending {
        if stream.is_new {
            let mut record = StreamRecord::new(key.clone(), stream.created_at);
            record.version = stream.version;
            record.updated_at = now;
            tx.insert_stream(&record).await.map_err(append_error)?;
        } else if !stream.events.is_empty() {
            tx.update_stream_version(key, stream.expected_version, stream.version, now)
                .await
                .map_err(append_error)?;
        }
    }
    Ok(())
}

async fn discard<T: StorageTx>(tx: T) {
    if let Err(err) = tx.rollback().await {
        tracing::warn!(error = %err, "rollback after failed append");
    }
}

fn append_error(err: StorageError) -> EventStoreError {
    match err {
        StorageError::DuplicateStream(key) => EventStoreError::StreamAlreadyExists(key),
        StorageError::Concurrency(detail) | StorageError::Conflict(detail) => {
            EventStoreError::OptimisticConcurrency(detail)
        }
        other => EventStoreError::Storage(other),
    }
}
