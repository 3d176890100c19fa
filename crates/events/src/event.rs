use std::any::{type_name, Any, TypeId};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;

/// A domain-agnostic event payload.
///
/// Events are facts: they are serialized once at append time and never
/// mutated afterwards. Any `serde` type that is `Send + Sync + 'static`
/// qualifies.
pub trait Event: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Event for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// An event value captured for appending.
///
/// Holds both the serialized payload (what gets persisted) and the typed value
/// (what inline projections see), so appending never round-trips through JSON.
#[derive(Clone)]
pub struct NewEvent {
    type_id: TypeId,
    descriptor: &'static str,
    payload: JsonValue,
    value: Arc<dyn Any + Send + Sync>,
}

impl NewEvent {
    pub fn new<E: Event>(event: E) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_value(&event)?;
        Ok(Self {
            type_id: TypeId::of::<E>(),
            descriptor: type_name::<E>(),
            payload,
            value: Arc::new(event),
        })
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Fully-qualified Rust type name, persisted as the fallback type descriptor.
    pub fn descriptor(&self) -> &'static str {
        self.descriptor
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn value(&self) -> Arc<dyn Any + Send + Sync> {
        Arc::clone(&self.value)
    }
}

impl core::fmt::Debug for NewEvent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NewEvent")
            .field("descriptor", &self.descriptor)
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}
