//! Durable record shapes shared by every backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use keelson_core::{DomainError, StreamId, TenantId};

/// Composite stream identity. Unique across the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    pub tenant_id: TenantId,
    pub stream_type: String,
    pub stream_id: StreamId,
}

impl StreamKey {
    pub fn new(tenant_id: TenantId, stream_type: impl Into<String>, stream_id: StreamId) -> Self {
        Self {
            tenant_id,
            stream_type: stream_type.into(),
            stream_id,
        }
    }
}

impl core::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}/{}", self.tenant_id, self.stream_type, self.stream_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    pub key: StreamKey,
    /// Number of events in the stream; 0 right after creation.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StreamRecord {
    pub fn new(key: StreamKey, at: DateTime<Utc>) -> Self {
        Self {
            key,
            version: 0,
            created_at: at,
            updated_at: at,
        }
    }
}

/// Lifecycle state of a projection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionState {
    Active,
    Rebuilding,
    Paused,
    Faulted,
}

impl ProjectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProjectionState::Active => "active",
            ProjectionState::Rebuilding => "rebuilding",
            ProjectionState::Paused => "paused",
            ProjectionState::Faulted => "faulted",
        }
    }
}

impl core::fmt::Display for ProjectionState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for ProjectionState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ProjectionState::Active),
            "rebuilding" => Ok(ProjectionState::Rebuilding),
            "paused" => Ok(ProjectionState::Paused),
            "faulted" => Ok(ProjectionState::Faulted),
            other => Err(DomainError::validation(format!("unknown projection state '{other}'"))),
        }
    }
}

/// Persisted progress and health of one projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionStatusRecord {
    pub name: String,
    /// Version declared by the code that last wrote this record.
    pub version: u32,
    pub state: ProjectionState,
    /// Last global sequence fully applied.
    pub position: u64,
    /// Log size captured when the last rebuild started.
    pub total_events: Option<u64>,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Sequence of the first event that could not be applied.
    pub failed_event_sequence: Option<u64>,
    pub rebuild_started_at: Option<DateTime<Utc>>,
    pub rebuild_completed_at: Option<DateTime<Utc>>,
}

impl ProjectionStatusRecord {
    /// Status of a projection that has never run: active at position 0.
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
            state: ProjectionState::Active,
            position: 0,
            total_events: None,
            last_processed_at: None,
            last_error: None,
            failed_event_sequence: None,
            rebuild_started_at: None,
            rebuild_completed_at: None,
        }
    }
}

/// Single global cursor of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionCheckpointRecord {
    pub name: String,
    /// Last sequence handed to the handler and committed.
    pub sequence: u64,
    pub updated_at: DateTime<Utc>,
}
