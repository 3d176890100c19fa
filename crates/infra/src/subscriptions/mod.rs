//! Catch-up subscriptions.
//!
//! A subscription is a named cursor over the global log plus a handler. The
//! [`SubscriptionDaemon`] hands it one event at a time, in sequence order,
//! and advances its checkpoint in the same transaction the handler ran in.
//! Handlers that write through [`SubscriptionContext::tx`] therefore see each
//! event exactly once per checkpoint; side effects outside the transaction
//! are at-least-once.

pub mod daemon;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use keelson_events::EventEnvelope;

use crate::projections::HandledEvents;
use crate::storage::StorageTx;

pub use daemon::{DeliveryOutcome, SubscriptionCycle, SubscriptionDaemon, SubscriptionDaemonError};

/// What a handler sees besides the event.
pub struct SubscriptionContext<'a, T> {
    tx: &'a mut T,
    subscription: &'a str,
}

impl<'a, T: StorageTx> SubscriptionContext<'a, T> {
    pub(crate) fn new(tx: &'a mut T, subscription: &'a str) -> Self {
        Self { tx, subscription }
    }

    /// Writes made here commit together with the checkpoint.
    pub fn tx(&mut self) -> &mut T {
        &mut *self.tx
    }

    pub fn subscription_name(&self) -> &str {
        self.subscription
    }
}

#[async_trait]
pub trait SubscriptionHandler<T: StorageTx>: Send + Sync + 'static {
    /// Unique name; doubles as the checkpoint key and lock name.
    fn name(&self) -> &str;

    /// Events outside the filter advance the checkpoint without a call to
    /// [`handle`](Self::handle).
    fn handled_events(&self) -> HandledEvents {
        HandledEvents::All
    }

    /// An error rolls back the transaction; the same event is retried after
    /// the daemon's backoff.
    async fn handle(&self, event: &EventEnvelope, ctx: &mut SubscriptionContext<'_, T>) -> anyhow::Result<()>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscriptionRegistrationError {
    #[error("subscription name must not be empty")]
    EmptyName,

    #[error("subscription '{0}' is registered twice")]
    Duplicate(String),
}

pub struct RegisteredSubscription<T: StorageTx> {
    name: String,
    handled: HandledEvents,
    handler: Arc<dyn SubscriptionHandler<T>>,
}

impl<T: StorageTx> RegisteredSubscription<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn handles(&self, event: &EventEnvelope) -> bool {
        self.handled.contains(event.type_id())
    }

    pub(crate) async fn handle(&self, tx: &mut T, event: &EventEnvelope) -> anyhow::Result<()> {
        let mut ctx = SubscriptionContext::new(tx, &self.name);
        self.handler.handle(event, &mut ctx).await
    }
}

impl<T: StorageTx> core::fmt::Debug for RegisteredSubscription<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RegisteredSubscription")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Every subscription the engine knows about, in registration order.
pub struct SubscriptionRegistry<T: StorageTx> {
    entries: Vec<RegisteredSubscription<T>>,
    by_name: HashMap<String, usize>,
}

impl<T: StorageTx> Default for SubscriptionRegistry<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            by_name: HashMap::new(),
        }
    }
}

impl<T: StorageTx> SubscriptionRegistry<T> {
    pub fn builder() -> SubscriptionRegistryBuilder<T> {
        SubscriptionRegistryBuilder {
            registry: SubscriptionRegistry::default(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredSubscription<T>> {
        self.by_name.get(name).map(|&index| &self.entries[index])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredSubscription<T>> {
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

impl<T: StorageTx> core::fmt::Debug for SubscriptionRegistry<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.entries.iter()).finish()
    }
}

pub struct SubscriptionRegistryBuilder<T: StorageTx> {
    registry: SubscriptionRegistry<T>,
}

impl<T: StorageTx> core::fmt::Debug for SubscriptionRegistryBuilder<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SubscriptionRegistryBuilder")
            .field("registry", &self.registry)
            .finish()
    }
}

impl<T: StorageTx> SubscriptionRegistryBuilder<T> {
    pub fn register<H>(mut self, handler: H) -> Result<Self, SubscriptionRegistrationError>
    where
        H: SubscriptionHandler<T>,
    {
        let name = handler.name().to_string();
        if name.trim().is_empty() {
            return Err(SubscriptionRegistrationError::EmptyName);
        }
        if self.registry.by_name.contains_key(&name) {
            return Err(SubscriptionRegistrationError::Duplicate(name));
        }

        let entry = RegisteredSubscription {
            name: name.clone(),
            handled: handler.handled_events(),
            handler: Arc::new(handler),
        };
        self.registry.by_name.insert(name, self.registry.entries.len());
        self.registry.entries.push(entry);
        Ok(self)
    }

    pub fn build(self) -> SubscriptionRegistry<T> {
        self.registry
    }
}
