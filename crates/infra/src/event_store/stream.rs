use keelson_core::{StreamId, TenantId};
use keelson_events::{EventEnvelope, StreamState};

use crate::storage::StreamKey;

/// A stream's materialized events plus the version they were read at.
///
/// Handles returned by [`Session::fetch_for_writing`](super::Session::fetch_for_writing)
/// are also the token for appending: the session compares the handle's
/// version against what it expects when [`append`](super::Session::append)
/// is called, and the store compares again on commit.
#[derive(Debug, Clone)]
pub struct EventStream {
    key: StreamKey,
    version: u64,
    events: Vec<EventEnvelope>,
}

impl EventStream {
    pub(crate) fn new(key: StreamKey, version: u64, events: Vec<EventEnvelope>) -> Self {
        Self {
            key,
            version,
            events,
        }
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn tenant_id(&self) -> TenantId {
        self.key.tenant_id
    }

    pub fn stream_type(&self) -> &str {
        &self.key.stream_type
    }

    pub fn stream_id(&self) -> StreamId {
        self.key.stream_id
    }

    /// Version the handle is at. Advances as events are appended through it.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Committed events, ordered by version.
    pub fn events(&self) -> &[EventEnvelope] {
        &self.events
    }

    pub fn into_events(self) -> Vec<EventEnvelope> {
        self.events
    }

    /// Fold the loaded events into `T`.
    pub fn state<T: StreamState>(&self) -> T {
        keelson_events::fold(&self.events)
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}
