use std::any::{Any, TypeId};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use keelson_core::{EventId, StreamId, TenantId};

use crate::event::Event;
use crate::record::StoredEvent;

/// A committed event with its payload materialized as the registered Rust type.
///
/// This is what projections, subscriptions and state folds consume. Use
/// [`EventEnvelope::payload`] to downcast to a concrete event.
#[derive(Clone)]
pub struct EventEnvelope {
    record: StoredEvent,
    type_id: TypeId,
    type_name: String,
    payload: Arc<dyn Any + Send + Sync>,
}

impl EventEnvelope {
    pub fn new(
        record: StoredEvent,
        type_id: TypeId,
        type_name: impl Into<String>,
        payload: Arc<dyn Any + Send + Sync>,
    ) -> Self {
        Self {
            record,
            type_id,
            type_name: type_name.into(),
            payload,
        }
    }

    pub fn event_id(&self) -> EventId {
        self.record.event_id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.record.tenant_id
    }

    pub fn stream_type(&self) -> &str {
        &self.record.stream_type
    }

    pub fn stream_id(&self) -> StreamId {
        self.record.stream_id
    }

    pub fn version(&self) -> u64 {
        self.record.version
    }

    pub fn sequence(&self) -> u64 {
        self.record.sequence
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.record.timestamp
    }

    /// Logical name the payload type resolved to.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn is<E: Event>(&self) -> bool {
        self.type_id == TypeId::of::<E>()
    }

    /// Downcast the payload; `None` if it is not an `E`.
    pub fn payload<E: Event>(&self) -> Option<&E> {
        (*self.payload).downcast_ref::<E>()
    }

    pub fn raw_payload(&self) -> &JsonValue {
        &self.record.payload
    }

    pub fn record(&self) -> &StoredEvent {
        &self.record
    }

    pub fn into_record(self) -> StoredEvent {
        self.record
    }
}

impl core::fmt::Debug for EventEnvelope {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventEnvelope")
            .field("type_name", &self.type_name)
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}
