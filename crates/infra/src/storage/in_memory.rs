//! In-memory storage backend.
//!
//! Transactions buffer their writes and validate stream versions when they
//! commit. Appenders are serialized by an async mutex held from the first
//! event insert until commit or rollback, mirroring the advisory lock the
//! Postgres backend takes.
//!
//! Intended for tests/dev. Not optimized for performance.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, OwnedMutexGuard};

use keelson_core::TenantId;
use keelson_events::{StoredEvent, UncommittedEvent};

use super::records::{ProjectionStatusRecord, StreamKey, StreamRecord, SubscriptionCheckpointRecord};
use super::{Storage, StorageError, StorageTx};

type SnapshotKey = (String, TenantId, String);

#[derive(Debug, Default)]
struct State {
    streams: HashMap<StreamKey, StreamRecord>,
    events: BTreeMap<u64, StoredEvent>,
    /// Sequences of each stream's events, in version order.
    stream_index: HashMap<StreamKey, Vec<u64>>,
    /// Last sequence handed out (reserved, not necessarily committed).
    last_sequence: u64,
    projections: BTreeMap<String, ProjectionStatusRecord>,
    checkpoints: BTreeMap<String, SubscriptionCheckpointRecord>,
    snapshots: HashMap<SnapshotKey, JsonValue>,
}

impl State {
    fn stream_len(&self, key: &StreamKey) -> u64 {
        self.stream_index.get(key).map(|s| s.len() as u64).unwrap_or(0)
    }
}

#[derive(Debug)]
struct InlineProgress {
    name: String,
    version: u32,
    sequence: u64,
    at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Pending {
    new_streams: BTreeMap<StreamKey, StreamRecord>,
    /// Updated stream record plus the committed version it was based on.
    stream_updates: BTreeMap<StreamKey, (u64, StreamRecord)>,
    events: Vec<StoredEvent>,
    type_names: BTreeMap<u64, String>,
    projections: BTreeMap<String, ProjectionStatusRecord>,
    inline_progress: Vec<InlineProgress>,
    checkpoints: BTreeMap<String, SubscriptionCheckpointRecord>,
    cleared_projections: HashSet<String>,
    snapshots: HashMap<SnapshotKey, JsonValue>,
}

/// In-memory backend. Cloning shares the underlying data.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    state: Arc<RwLock<State>>,
    appends: Arc<Mutex<()>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    type Tx = InMemoryTx;

    async fn begin(&self) -> Result<InMemoryTx, StorageError> {
        Ok(InMemoryTx {
            state: Arc::clone(&self.state),
            appends: Arc::clone(&self.appends),
            append_guard: None,
            pending: Pending::default(),
        })
    }
}

/// Transaction over [`InMemoryStorage`]. Dropping it discards its writes.
#[derive(Debug)]
pub struct InMemoryTx {
    state: Arc<RwLock<State>>,
    appends: Arc<Mutex<()>>,
    append_guard: Option<OwnedMutexGuard<()>>,
    pending: Pending,
}

impl InMemoryTx {
    fn read(&self) -> Result<RwLockReadGuard<'_, State>, StorageError> {
        self.state
            .read()
            .map_err(|_| StorageError::Backend("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, StorageError> {
        self.state
            .write()
            .map_err(|_| StorageError::Backend("lock poisoned".to_string()))
    }

    fn overlay_type_name(&self, mut event: StoredEvent) -> StoredEvent {
        if let Some(name) = self.pending.type_names.get(&event.sequence) {
            event.type_name = Some(name.clone());
        }
        event
    }
}

fn event_key_eq(event: &StoredEvent, key: &StreamKey) -> bool {
    event.tenant_id == key.tenant_id
        && event.stream_id == key.stream_id
        && event.stream_type == key.stream_type
}

fn apply_inline_progress(
    projections: &mut BTreeMap<String, ProjectionStatusRecord>,
    progress: InlineProgress,
) {
    let status = projections
        .entry(progress.name.clone())
        .or_insert_with(|| ProjectionStatusRecord::new(progress.name.clone(), progress.version));

    if !status.accepts_inline_updates() || status.version != progress.version {
        return;
    }
    status.position = status.position.max(progress.sequence);
    status.last_processed_at = Some(progress.at);
}

#[async_trait]
impl StorageTx for InMemoryTx {
    async fn load_stream(&mut self, key: &StreamKey) -> Result<Option<StreamRecord>, StorageError> {
        if let Some((_, record)) = self.pending.stream_updates.get(key) {
            return Ok(Some(record.clone()));
        }
        if let Some(record) = self.pending.new_streams.get(key) {
            return Ok(Some(record.clone()));
        }
        Ok(self.read()?.streams.get(key).cloned())
    }

    async fn insert_stream(&mut self, stream: &StreamRecord) -> Result<(), StorageError> {
        let exists = self.pending.new_streams.contains_key(&stream.key)
            || self.read()?.streams.contains_key(&stream.key);
        if exists {
            return Err(StorageError::DuplicateStream(stream.key.clone()));
        }
        self.pending.new_streams.insert(stream.key.clone(), stream.clone());
        Ok(())
    }

    async fn update_stream_version(
        &mut self,
        key: &StreamKey,
        expected: u64,
        version: u64,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        if let Some(record) = self.pending.new_streams.get_mut(key) {
            if record.version != expected {
                return Err(StorageError::Concurrency(format!(
                    "stream {key}: expected version {expected}, found {}",
                    record.version
                )));
            }
            record.version = version;
            record.updated_at = at;
            return Ok(());
        }

        if let Some((_, record)) = self.pending.stream_updates.get_mut(key) {
            if record.version != expected {
                return Err(StorageError::Concurrency(format!(
                    "stream {key}: expected version {expected}, found {}",
                    record.version
                )));
            }
            record.version = version;
            record.updated_at = at;
            return Ok(());
        }

        let mut record = self
            .read()?
            .streams
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::Concurrency(format!("stream {key} does not exist")))?;
        if record.version != expected {
            return Err(StorageError::Concurrency(format!(
                "stream {key}: expected version {expected}, found {}",
                record.version
            )));
        }
        record.version = version;
        record.updated_at = at;
        self.pending.stream_updates.insert(key.clone(), (expected, record));
        Ok(())
    }

    async fn lock_appends(&mut self) -> Result<(), StorageError> {
        if self.append_guard.is_none() {
            self.append_guard = Some(Arc::clone(&self.appends).lock_owned().await);
        }
        Ok(())
    }

    async fn insert_events(
        &mut self,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<StoredEvent>, StorageError> {
        if events.is_empty() {
            return Ok(vec![]);
        }
        self.lock_appends().await?;

        let mut stored = Vec::with_capacity(events.len());
        {
            let mut state = self.write()?;
            for event in events {
                let key = StreamKey::new(event.tenant_id, event.stream_type.clone(), event.stream_id);
                let taken = state.stream_len(&key)
                    + self.pending.events.iter().filter(|e| event_key_eq(e, &key)).count() as u64
                    + stored.iter().filter(|e: &&StoredEvent| event_key_eq(e, &key)).count() as u64;
                if event.version <= taken {
                    return Err(StorageError::Conflict(format!(
                        "stream {key}: version {} already exists",
                        event.version
                    )));
                }
                state.last_sequence += 1;
                stored.push(event.into_stored(state.last_sequence));
            }
        }

        self.pending.events.extend(stored.iter().cloned());
        Ok(stored)
    }

    async fn load_events(
        &mut self,
        key: &StreamKey,
        up_to_version: Option<u64>,
    ) -> Result<Vec<StoredEvent>, StorageError> {
        let bound = up_to_version.unwrap_or(u64::MAX);
        let mut events: Vec<StoredEvent> = {
            let state = self.read()?;
            state
                .stream_index
                .get(key)
                .into_iter()
                .flatten()
                .filter_map(|seq| state.events.get(seq))
                .filter(|e| e.version <= bound)
                .cloned()
                .collect()
        };
        events.extend(
            self.pending
                .events
                .iter()
                .filter(|e| event_key_eq(e, key) && e.version <= bound)
                .cloned(),
        );
        events.sort_by_key(|e| e.version);
        Ok(events.into_iter().map(|e| self.overlay_type_name(e)).collect())
    }

    async fn events_after(&mut self, after: u64, limit: usize) -> Result<Vec<StoredEvent>, StorageError> {
        let mut events: Vec<StoredEvent> = {
            let state = self.read()?;
            state
                .events
                .range(after.saturating_add(1)..)
                .take(limit)
                .map(|(_, e)| e.clone())
                .collect()
        };
        events.extend(self.pending.events.iter().filter(|e| e.sequence > after).cloned());
        events.sort_by_key(|e| e.sequence);
        events.truncate(limit);
        Ok(events.into_iter().map(|e| self.overlay_type_name(e)).collect())
    }

    async fn event_at(&mut self, sequence: u64) -> Result<Option<StoredEvent>, StorageError> {
        let pending = self.pending.events.iter().find(|e| e.sequence == sequence).cloned();
        let event = match pending {
            Some(event) => Some(event),
            None => self.read()?.events.get(&sequence).cloned(),
        };
        Ok(event.map(|e| self.overlay_type_name(e)))
    }

    async fn first_sequence_at_or_after(&mut self, at: DateTime<Utc>) -> Result<Option<u64>, StorageError> {
        let state = self.read()?;
        Ok(state
            .events
            .values()
            .find(|e| e.timestamp >= at)
            .map(|e| e.sequence))
    }

    async fn count_events(&mut self) -> Result<u64, StorageError> {
        Ok(self.read()?.events.len() as u64 + self.pending.events.len() as u64)
    }

    async fn max_sequence(&mut self) -> Result<u64, StorageError> {
        let committed = self.read()?.events.keys().next_back().copied().unwrap_or(0);
        let pending = self.pending.events.iter().map(|e| e.sequence).max().unwrap_or(0);
        Ok(committed.max(pending))
    }

    async fn events_missing_type_name(
        &mut self,
        after: u64,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, StorageError> {
        let state = self.read()?;
        Ok(state
            .events
            .range(after.saturating_add(1)..)
            .map(|(_, e)| e)
            .filter(|e| e.type_name.is_none() && !self.pending.type_names.contains_key(&e.sequence))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn set_event_type_name(&mut self, sequence: u64, type_name: &str) -> Result<(), StorageError> {
        self.pending.type_names.insert(sequence, type_name.to_string());
        Ok(())
    }

    async fn load_projection_status(
        &mut self,
        name: &str,
    ) -> Result<Option<ProjectionStatusRecord>, StorageError> {
        if let Some(status) = self.pending.projections.get(name) {
            return Ok(Some(status.clone()));
        }
        Ok(self.read()?.projections.get(name).cloned())
    }

    async fn list_projection_statuses(&mut self) -> Result<Vec<ProjectionStatusRecord>, StorageError> {
        let mut merged = self.read()?.projections.clone();
        for (name, status) in &self.pending.projections {
            merged.insert(name.clone(), status.clone());
        }
        Ok(merged.into_values().collect())
    }

    async fn save_projection_status(&mut self, status: &ProjectionStatusRecord) -> Result<(), StorageError> {
        self.pending.projections.insert(status.name.clone(), status.clone());
        Ok(())
    }

    async fn record_inline_progress(
        &mut self,
        name: &str,
        version: u32,
        sequence: u64,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.pending.inline_progress.push(InlineProgress {
            name: name.to_string(),
            version,
            sequence,
            at,
        });
        Ok(())
    }

    async fn load_checkpoint(
        &mut self,
        name: &str,
    ) -> Result<Option<SubscriptionCheckpointRecord>, StorageError> {
        if let Some(checkpoint) = self.pending.checkpoints.get(name) {
            return Ok(Some(checkpoint.clone()));
        }
        Ok(self.read()?.checkpoints.get(name).cloned())
    }

    async fn list_checkpoints(&mut self) -> Result<Vec<SubscriptionCheckpointRecord>, StorageError> {
        let mut merged = self.read()?.checkpoints.clone();
        for (name, checkpoint) in &self.pending.checkpoints {
            merged.insert(name.clone(), checkpoint.clone());
        }
        Ok(merged.into_values().collect())
    }

    async fn save_checkpoint(&mut self, checkpoint: &SubscriptionCheckpointRecord) -> Result<(), StorageError> {
        self.pending
            .checkpoints
            .insert(checkpoint.name.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load_snapshot(
        &mut self,
        projection: &str,
        tenant_id: TenantId,
        key: &str,
    ) -> Result<Option<JsonValue>, StorageError> {
        let snapshot_key = (projection.to_string(), tenant_id, key.to_string());
        if let Some(state) = self.pending.snapshots.get(&snapshot_key) {
            return Ok(Some(state.clone()));
        }
        if self.pending.cleared_projections.contains(projection) {
            return Ok(None);
        }
        Ok(self.read()?.snapshots.get(&snapshot_key).cloned())
    }

    async fn save_snapshot(
        &mut self,
        projection: &str,
        tenant_id: TenantId,
        key: &str,
        state: &JsonValue,
    ) -> Result<(), StorageError> {
        self.pending
            .snapshots
            .insert((projection.to_string(), tenant_id, key.to_string()), state.clone());
        Ok(())
    }

    async fn clear_snapshots(&mut self, projection: &str) -> Result<(), StorageError> {
        self.pending.cleared_projections.insert(projection.to_string());
        self.pending.snapshots.retain(|(owner, _, _), _| owner != projection);
        Ok(())
    }

    async fn commit(self) -> Result<(), StorageError> {
        let InMemoryTx {
            state,
            append_guard,
            pending,
            ..
        } = self;

        {
            let mut state = state
                .write()
                .map_err(|_| StorageError::Backend("lock poisoned".to_string()))?;

            for key in pending.new_streams.keys() {
                if state.streams.contains_key(key) {
                    return Err(StorageError::DuplicateStream(key.clone()));
                }
            }
            for (key, (expected, _)) in &pending.stream_updates {
                let actual = state.streams.get(key).map(|s| s.version);
                if actual != Some(*expected) {
                    return Err(StorageError::Concurrency(format!(
                        "stream {key}: expected version {expected}, found {actual:?}"
                    )));
                }
            }
            for event in &pending.events {
                let key = StreamKey::new(event.tenant_id, event.stream_type.clone(), event.stream_id);
                if event.version <= state.stream_len(&key) {
                    return Err(StorageError::Conflict(format!(
                        "stream {key}: version {} already exists",
                        event.version
                    )));
                }
            }

            for (key, record) in pending.new_streams {
                state.streams.insert(key, record);
            }
            for (key, (_, record)) in pending.stream_updates {
                state.streams.insert(key, record);
            }
            for event in pending.events {
                let key = StreamKey::new(event.tenant_id, event.stream_type.clone(), event.stream_id);
                state.stream_index.entry(key).or_default().push(event.sequence);
                state.events.insert(event.sequence, event);
            }
            for (sequence, name) in pending.type_names {
                if let Some(event) = state.events.get_mut(&sequence) {
                    event.type_name = Some(name);
                }
            }
            for (name, status) in pending.projections {
                state.projections.insert(name, status);
            }
            for progress in pending.inline_progress {
                apply_inline_progress(&mut state.projections, progress);
            }
            for (name, checkpoint) in pending.checkpoints {
                state.checkpoints.insert(name, checkpoint);
            }
            if !pending.cleared_projections.is_empty() {
                state
                    .snapshots
                    .retain(|(owner, _, _), _| !pending.cleared_projections.contains(owner));
            }
            state.snapshots.extend(pending.snapshots);
        }

        drop(append_guard);
        Ok(())
    }

    async fn rollback(self) -> Result<(), StorageError> {
        Ok(())
    }
}
