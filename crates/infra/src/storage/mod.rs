//! Durable storage boundary.
//!
//! Every mutation the engine performs happens inside exactly one [`StorageTx`]:
//! an append session, a projection batch, a single subscription delivery, an
//! administrative transition, or a fault record. Backends must make a
//! transaction's writes visible atomically on `commit` and discard them on
//! `rollback` or drop.
//!
//! Two backends ship with the crate:
//! - [`InMemoryStorage`] for tests and embedding
//! - [`PostgresStorage`] for production

pub mod in_memory;
pub mod postgres;
pub mod records;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use keelson_core::TenantId;
use keelson_events::{StoredEvent, UncommittedEvent};

pub use in_memory::{InMemoryStorage, InMemoryTx};
pub use postgres::{PostgresStorage, PostgresTx};
pub use records::{
    ProjectionState, ProjectionStatusRecord, StreamKey, StreamRecord, SubscriptionCheckpointRecord,
};

/// Storage operation error.
///
/// - **DuplicateStream**: the stream identity is already taken
/// - **Conflict**: any other uniqueness constraint (e.g. a version slot)
/// - **Concurrency**: a compare-and-set on a stream version failed
/// - **Backend**: anything else (IO, driver, poisoned locks)
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("stream {0} already exists")]
    DuplicateStream(StreamKey),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("concurrency check failed: {0}")]
    Concurrency(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Entry point to a backend: opens transactions.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    type Tx: StorageTx;

    async fn begin(&self) -> Result<Self::Tx, StorageError>;
}

/// One unit of work against the backend.
///
/// Reads observe committed data plus this transaction's own writes.
#[async_trait]
pub trait StorageTx: Send + 'static {
    async fn load_stream(&mut self, key: &StreamKey) -> Result<Option<StreamRecord>, StorageError>;

    /// Fails with [`StorageError::DuplicateStream`] if the stream already exists.
    async fn insert_stream(&mut self, stream: &StreamRecord) -> Result<(), StorageError>;

    /// Compare-and-set of a stream's version.
    ///
    /// Fails with [`StorageError::Concurrency`] if the stored version is not `expected`.
    async fn update_stream_version(
        &mut self,
        key: &StreamKey,
        expected: u64,
        version: u64,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Serialize appenders until this transaction ends.
    ///
    /// Holding this lock while sequences are assigned is what makes global
    /// sequence order equal commit order. [`insert_events`](Self::insert_events)
    /// takes it implicitly.
    async fn lock_appends(&mut self) -> Result<(), StorageError>;

    /// Insert events, assigning global sequences in input order.
    ///
    /// Fails with [`StorageError::Conflict`] if a `(stream, version)` slot is taken.
    async fn insert_events(
        &mut self,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<StoredEvent>, StorageError>;

    /// A stream's events ordered by version, optionally bounded (inclusive).
    async fn load_events(
        &mut self,
        key: &StreamKey,
        up_to_version: Option<u64>,
    ) -> Result<Vec<StoredEvent>, StorageError>;

    /// Up to `limit` events with `sequence > after`, ordered by sequence.
    async fn events_after(&mut self, after: u64, limit: usize) -> Result<Vec<StoredEvent>, StorageError>;

    async fn event_at(&mut self, sequence: u64) -> Result<Option<StoredEvent>, StorageError>;

    /// Sequence of the first event whose timestamp is at or after `at`.
    async fn first_sequence_at_or_after(&mut self, at: DateTime<Utc>) -> Result<Option<u64>, StorageError>;

    async fn count_events(&mut self) -> Result<u64, StorageError>;

    /// Highest committed sequence, 0 for an empty log.
    async fn max_sequence(&mut self) -> Result<u64, StorageError>;

    /// Events persisted without a logical type name, ordered by sequence.
    async fn events_missing_type_name(
        &mut self,
        after: u64,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, StorageError>;

    async fn set_event_type_name(&mut self, sequence: u64, type_name: &str) -> Result<(), StorageError>;

    async fn load_projection_status(
        &mut self,
        name: &str,
    ) -> Result<Option<ProjectionStatusRecord>, StorageError>;

    async fn list_projection_statuses(&mut self) -> Result<Vec<ProjectionStatusRecord>, StorageError>;

    /// Upsert.
    async fn save_projection_status(&mut self, status: &ProjectionStatusRecord) -> Result<(), StorageError>;

    /// Advance an inline projection after its triggering append committed.
    ///
    /// Atomically sets `position = max(position, sequence)` and stamps
    /// `last_processed_at`. Creates the record if missing. No-op when the
    /// stored version differs from `version`, or while the daemon owns the
    /// projection (see [`ProjectionStatusRecord::accepts_inline_updates`]).
    async fn record_inline_progress(
        &mut self,
        name: &str,
        version: u32,
        sequence: u64,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    async fn load_checkpoint(
        &mut self,
        name: &str,
    ) -> Result<Option<SubscriptionCheckpointRecord>, StorageError>;

    async fn list_checkpoints(&mut self) -> Result<Vec<SubscriptionCheckpointRecord>, StorageError>;

    /// Upsert.
    async fn save_checkpoint(&mut self, checkpoint: &SubscriptionCheckpointRecord) -> Result<(), StorageError>;

    async fn load_snapshot(
        &mut self,
        projection: &str,
        tenant_id: TenantId,
        key: &str,
    ) -> Result<Option<JsonValue>, StorageError>;

    /// Upsert.
    async fn save_snapshot(
        &mut self,
        projection: &str,
        tenant_id: TenantId,
        key: &str,
        state: &JsonValue,
    ) -> Result<(), StorageError>;

    /// Delete every snapshot owned by `projection`, across all tenants.
    async fn clear_snapshots(&mut self, projection: &str) -> Result<(), StorageError>;

    async fn commit(self) -> Result<(), StorageError>;

    async fn rollback(self) -> Result<(), StorageError>;
}
