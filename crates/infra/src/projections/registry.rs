use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use thiserror::Error;

use keelson_events::EventEnvelope;

use super::{HandledEvents, Projection, ProjectionContext, ProjectionMode};
use crate::storage::StorageTx;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProjectionRegistrationError {
    #[error("projection name must not be empty")]
    EmptyName,

    #[error("projection '{0}' is registered twice")]
    Duplicate(String),
}

#[async_trait]
trait ErasedProjection<T>: Send + Sync {
    async fn apply(&self, tx: &mut T, event: &EventEnvelope) -> anyhow::Result<()>;

    async fn clear(&self, tx: &mut T) -> anyhow::Result<()>;
}

struct Erased<P> {
    projection: P,
}

#[async_trait]
impl<T, P> ErasedProjection<T> for Erased<P>
where
    T: StorageTx,
    P: Projection<T>,
{
    async fn apply(&self, tx: &mut T, event: &EventEnvelope) -> anyhow::Result<()> {
        let name = self.projection.name();
        let key = self.projection.key(event);

        let mut snapshot: P::Snapshot = match tx.load_snapshot(name, event.tenant_id(), &key).await? {
            Some(state) => serde_json::from_value(state)
                .with_context(|| format!("decoding snapshot '{key}'"))?,
            None => P::Snapshot::default(),
        };

        {
            let mut ctx = ProjectionContext::new(&mut *tx, name);
            self.projection
                .evolve(&mut snapshot, event, &mut ctx)
                .await
                .with_context(|| format!("applying {} at sequence {}", event.type_name(), event.sequence()))?;
        }

        let state = serde_json::to_value(&snapshot).context("encoding snapshot")?;
        tx.save_snapshot(name, event.tenant_id(), &key, &state).await?;
        Ok(())
    }

    async fn clear(&self, tx: &mut T) -> anyhow::Result<()> {
        let name = self.projection.name();
        tx.clear_snapshots(name).await?;
        let mut ctx = ProjectionContext::new(tx, name);
        self.projection.clear(&mut ctx).await
    }
}

/// A projection as the engine sees it: name, version, mode and filter frozen
/// at registration.
pub struct RegisteredProjection<T> {
    name: String,
    version: u32,
    mode: ProjectionMode,
    handled: HandledEvents,
    inner: Arc<dyn ErasedProjection<T>>,
}

impl<T: StorageTx> RegisteredProjection<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn mode(&self) -> ProjectionMode {
        self.mode
    }

    pub fn handles(&self, type_id: TypeId) -> bool {
        self.handled.contains(type_id)
    }

    /// Fold one event into its snapshot.
    pub(crate) async fn apply(&self, tx: &mut T, event: &EventEnvelope) -> anyhow::Result<()> {
        self.inner.apply(tx, event).await
    }

    /// Delete everything the projection owns.
    pub(crate) async fn clear(&self, tx: &mut T) -> anyhow::Result<()> {
        self.inner.clear(tx).await
    }
}

impl<T> core::fmt::Debug for RegisteredProjection<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RegisteredProjection")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

/// Every projection the engine knows about, in registration order.
pub struct ProjectionRegistry<T> {
    entries: Vec<RegisteredProjection<T>>,
    by_name: HashMap<String, usize>,
}

impl<T> Default for ProjectionRegistry<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            by_name: HashMap::new(),
        }
    }
}

impl<T: StorageTx> ProjectionRegistry<T> {
    pub fn builder() -> ProjectionRegistryBuilder<T> {
        ProjectionRegistryBuilder {
            registry: ProjectionRegistry::default(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredProjection<T>> {
        self.by_name.get(name).map(|&index| &self.entries[index])
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredProjection<T>> {
        self.entries.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.name())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> core::fmt::Debug for ProjectionRegistry<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.entries.iter()).finish()
    }
}

pub struct ProjectionRegistryBuilder<T> {
    registry: ProjectionRegistry<T>,
}

impl<T> core::fmt::Debug for ProjectionRegistryBuilder<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProjectionRegistryBuilder")
            .field("registry", &self.registry)
            .finish()
    }
}

impl<T: StorageTx> ProjectionRegistryBuilder<T> {
    pub fn inline<P: Projection<T>>(self, projection: P) -> Result<Self, ProjectionRegistrationError> {
        self.add(ProjectionMode::Inline, projection)
    }

    pub fn eventual<P: Projection<T>>(self, projection: P) -> Result<Self, ProjectionRegistrationError> {
        self.add(ProjectionMode::Eventual, projection)
    }

    pub fn build(self) -> ProjectionRegistry<T> {
        self.registry
    }

    fn add<P: Projection<T>>(
        mut self,
        mode: ProjectionMode,
        projection: P,
    ) -> Result<Self, ProjectionRegistrationError> {
        let name = projection.name().to_string();
        if name.trim().is_empty() {
            return Err(ProjectionRegistrationError::EmptyName);
        }
        if self.registry.by_name.contains_key(&name) {
            return Err(ProjectionRegistrationError::Duplicate(name));
        }

        let entry = RegisteredProjection {
            name: name.clone(),
            version: projection.version(),
            mode,
            handled: projection.handled_events(),
            inner: Arc::new(Erased { projection }),
        };
        self.registry.by_name.insert(name, self.registry.entries.len());
        self.registry.entries.push(entry);
        Ok(self)
    }
}
