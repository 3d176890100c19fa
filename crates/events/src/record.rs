//! Persisted event record shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use keelson_core::{EventId, StreamId, TenantId};

/// An event about to be inserted: its stream version is fixed, its global
/// sequence is not (the store assigns it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: EventId,
    pub tenant_id: TenantId,
    pub stream_type: String,
    pub stream_id: StreamId,
    pub version: u64,
    /// Logical name. `None` only for records written before a name existed.
    pub type_name: Option<String>,
    pub type_descriptor: String,
    pub payload: JsonValue,
    pub timestamp: DateTime<Utc>,
}

impl UncommittedEvent {
    pub fn into_stored(self, sequence: u64) -> StoredEvent {
        StoredEvent {
            event_id: self.event_id,
            tenant_id: self.tenant_id,
            stream_type: self.stream_type,
            stream_id: self.stream_id,
            version: self.version,
            sequence,
            type_name: self.type_name,
            type_descriptor: self.type_descriptor,
            payload: self.payload,
            timestamp: self.timestamp,
        }
    }
}

/// A committed event.
///
/// ## Ordering
///
/// - `version` is the 1-based position within the stream; a stream's versions
///   are exactly `1..=current_version`.
/// - `sequence` is the global position across all streams and strictly
///   increases in commit order. Rolled-back appends may leave gaps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: EventId,
    pub tenant_id: TenantId,
    pub stream_type: String,
    pub stream_id: StreamId,
    pub version: u64,
    pub sequence: u64,
    pub type_name: Option<String>,
    pub type_descriptor: String,
    pub payload: JsonValue,
    pub timestamp: DateTime<Utc>,
}

impl StoredEvent {
    /// Best available type label: the logical name, else the descriptor.
    pub fn event_type(&self) -> &str {
        self.type_name.as_deref().unwrap_or(&self.type_descriptor)
    }
}
