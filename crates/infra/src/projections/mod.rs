//! Projections: read models derived from the event log.
//!
//! A projection folds events into per-key JSON snapshots and may also write
//! its own tables through the transaction exposed by [`ProjectionContext`].
//!
//! - **Inline** projections run inside the append transaction, so their
//!   snapshots are consistent with the events that produced them.
//! - **Eventual** projections are driven by the [`ProjectionDaemon`] in
//!   sequence order, one batch per transaction.
//!
//! Both kinds are rebuilt by the daemon when their version changes or when an
//! operator asks for it.

pub mod daemon;
pub mod registry;
pub mod status;

use std::any::TypeId;
use std::collections::HashSet;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use keelson_events::{Event, EventEnvelope};

use crate::storage::StorageTx;

pub use daemon::{BatchOutcome, CycleSummary, DaemonError, ProjectionDaemon};
pub use registry::{
    ProjectionRegistrationError, ProjectionRegistry, ProjectionRegistryBuilder, RegisteredProjection,
};
pub use status::TransitionError;

/// When a projection runs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ProjectionMode {
    Inline,
    Eventual,
}

/// Event filter of a projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandledEvents {
    All,
    Only(HashSet<TypeId>),
}

impl HandledEvents {
    /// Empty filter; chain [`with`](Self::with) to add types.
    pub fn only() -> Self {
        HandledEvents::Only(HashSet::new())
    }

    pub fn with<E: Event>(self) -> Self {
        match self {
            HandledEvents::All => HandledEvents::All,
            HandledEvents::Only(mut types) => {
                types.insert(TypeId::of::<E>());
                HandledEvents::Only(types)
            }
        }
    }

    pub fn contains(&self, type_id: TypeId) -> bool {
        match self {
            HandledEvents::All => true,
            HandledEvents::Only(types) => types.contains(&type_id),
        }
    }
}

/// What a projection sees besides the event: the enclosing transaction.
pub struct ProjectionContext<'a, T> {
    tx: &'a mut T,
    projection: &'a str,
}

impl<'a, T: StorageTx> ProjectionContext<'a, T> {
    pub(crate) fn new(tx: &'a mut T, projection: &'a str) -> Self {
        Self { tx, projection }
    }

    /// Writes made here commit or roll back with the projection's batch.
    pub fn tx(&mut self) -> &mut T {
        &mut *self.tx
    }

    pub fn projection_name(&self) -> &str {
        self.projection
    }
}

/// A read model built from events.
///
/// `evolve` must be deterministic: rebuilding from the start of the log has to
/// reproduce the same snapshots.
#[async_trait]
pub trait Projection<T: StorageTx>: Send + Sync + 'static {
    type Snapshot: Serialize + DeserializeOwned + Default + Send + Sync;

    /// Stable, unique name. Used as the status key and lock name.
    fn name(&self) -> &str;

    /// Bump to force a rebuild.
    fn version(&self) -> u32 {
        1
    }

    fn handled_events(&self) -> HandledEvents {
        HandledEvents::All
    }

    /// Snapshot key an event belongs to. Defaults to the stream id.
    fn key(&self, event: &EventEnvelope) -> String {
        event.stream_id().to_string()
    }

    async fn evolve(
        &self,
        snapshot: &mut Self::Snapshot,
        event: &EventEnvelope,
        ctx: &mut ProjectionContext<'_, T>,
    ) -> anyhow::Result<()>;

    /// Drop state kept outside snapshots. Called at the start of a rebuild,
    /// after the projection's snapshots were deleted.
    async fn clear(&self, _ctx: &mut ProjectionContext<'_, T>) -> anyhow::Result<()> {
        Ok(())
    }
}
