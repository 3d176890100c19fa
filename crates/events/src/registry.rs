//! Event type registry.
//!
//! Maps a stable logical name (e.g. `"user_created"`) to a Rust payload type
//! and back. A secondary index keyed by the fully-qualified Rust type name lets
//! records written before a name was registered still be read.
//!
//! The registry is built once at startup and is immutable afterwards; hand it
//! to the event store and daemons explicitly.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::envelope::EventEnvelope;
use crate::event::Event;
use crate::record::StoredEvent;

type DecodeFn = fn(&JsonValue) -> Result<Arc<dyn Any + Send + Sync>, serde_json::Error>;

fn decode<E: Event>(payload: &JsonValue) -> Result<Arc<dyn Any + Send + Sync>, serde_json::Error> {
    let event = E::deserialize(payload)?;
    Ok(Arc::new(event))
}

/// Registration was rejected. Raised at configuration time, never at runtime.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("event name must not be empty ({descriptor})")]
    EmptyName { descriptor: &'static str },

    #[error("{descriptor} is already registered as '{existing}', cannot register it as '{requested}'")]
    TypeAlreadyRegistered {
        descriptor: &'static str,
        existing: String,
        requested: String,
    },

    #[error("event name '{name}' is already bound to {existing}, cannot bind it to {requested}")]
    NameAlreadyBound {
        name: String,
        existing: &'static str,
        requested: &'static str,
    },
}

/// A stored record could not be turned into a typed event.
///
/// Always carries the offending record so callers can report or park it.
#[derive(Debug, Error)]
pub enum MaterializationError {
    #[error(
        "cannot resolve event type at sequence {} (name: {:?}, descriptor: {})",
        .record.sequence,
        .record.type_name,
        .record.type_descriptor
    )]
    UnknownType { record: Box<StoredEvent> },

    #[error("cannot deserialize '{type_name}' payload at sequence {}: {source}", .record.sequence)]
    Payload {
        record: Box<StoredEvent>,
        type_name: String,
        #[source]
        source: serde_json::Error,
    },
}

impl MaterializationError {
    pub fn record(&self) -> &StoredEvent {
        match self {
            MaterializationError::UnknownType { record } => record,
            MaterializationError::Payload { record, .. } => record,
        }
    }
}

#[derive(Clone)]
struct Registration {
    type_id: TypeId,
    name: String,
    descriptor: &'static str,
    decode: DecodeFn,
}

/// Immutable two-way map between logical event names and payload types.
#[derive(Clone, Default)]
pub struct EventTypeRegistry {
    by_type: HashMap<TypeId, Registration>,
    by_name: HashMap<String, TypeId>,
    by_descriptor: HashMap<&'static str, TypeId>,
}

impl EventTypeRegistry {
    pub fn builder() -> EventTypeRegistryBuilder {
        EventTypeRegistryBuilder::default()
    }

    /// The registered name of `E`, or the derived default if `E` is unregistered.
    pub fn resolve_name<E: Event>(&self) -> String {
        self.name_for(TypeId::of::<E>(), type_name::<E>())
    }

    /// Same as [`resolve_name`](Self::resolve_name) for an erased type.
    pub fn name_for(&self, type_id: TypeId, descriptor: &str) -> String {
        match self.by_type.get(&type_id) {
            Some(registration) => registration.name.clone(),
            None => default_event_name(descriptor),
        }
    }

    /// Registered name for a fully-qualified type descriptor.
    pub fn name_for_descriptor(&self, descriptor: &str) -> Option<&str> {
        self.by_descriptor
            .get(descriptor)
            .and_then(|type_id| self.by_type.get(type_id))
            .map(|registration| registration.name.as_str())
    }

    pub fn is_registered<E: Event>(&self) -> bool {
        self.by_type.contains_key(&TypeId::of::<E>())
    }

    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }

    /// Materialize a stored record.
    ///
    /// Looks up the logical name first, then falls back to the descriptor.
    pub fn resolve(&self, record: &StoredEvent) -> Result<EventEnvelope, MaterializationError> {
        let registration = record
            .type_name
            .as_deref()
            .and_then(|name| self.by_name.get(name))
            .or_else(|| self.by_descriptor.get(record.type_descriptor.as_str()))
            .and_then(|type_id| self.by_type.get(type_id))
            .ok_or_else(|| MaterializationError::UnknownType {
                record: Box::new(record.clone()),
            })?;

        let payload =
            (registration.decode)(&record.payload).map_err(|source| MaterializationError::Payload {
                record: Box::new(record.clone()),
                type_name: registration.name.clone(),
                source,
            })?;

        Ok(EventEnvelope::new(
            record.clone(),
            registration.type_id,
            registration.name.clone(),
            payload,
        ))
    }
}

impl core::fmt::Debug for EventTypeRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut names: Vec<&str> = self.by_name.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("EventTypeRegistry").field("names", &names).finish()
    }
}

/// Accumulates registrations, then freezes them into an [`EventTypeRegistry`].
#[derive(Default)]
pub struct EventTypeRegistryBuilder {
    inner: EventTypeRegistry,
}

impl EventTypeRegistryBuilder {
    /// Register `E` under its derived default name.
    pub fn register<E: Event>(self) -> Result<Self, RegistrationError> {
        let name = default_event_name(type_name::<E>());
        self.register_as::<E>(name)
    }

    /// Register `E` under an explicit name.
    ///
    /// Re-registering the same `(type, name)` pair is a no-op.
    pub fn register_as<E: Event>(mut self, name: impl Into<String>) -> Result<Self, RegistrationError> {
        let name = name.into();
        let type_id = TypeId::of::<E>();
        let descriptor = type_name::<E>();

        if name.trim().is_empty() {
            return Err(RegistrationError::EmptyName { descriptor });
        }

        if let Some(existing) = self.inner.by_type.get(&type_id) {
            if existing.name == name {
                return Ok(self);
            }
            return Err(RegistrationError::TypeAlreadyRegistered {
                descriptor,
                existing: existing.name.clone(),
                requested: name,
            });
        }

        if let Some(bound) = self
            .inner
            .by_name
            .get(&name)
            .and_then(|other| self.inner.by_type.get(other))
        {
            return Err(RegistrationError::NameAlreadyBound {
                name,
                existing: bound.descriptor,
                requested: descriptor,
            });
        }

        tracing::debug!(event_name = %name, descriptor, "registered event type");

        self.inner.by_name.insert(name.clone(), type_id);
        self.inner.by_descriptor.insert(descriptor, type_id);
        self.inner.by_type.insert(
            type_id,
            Registration {
                type_id,
                name,
                descriptor,
                decode: decode::<E>,
            },
        );
        Ok(self)
    }

    pub fn build(self) -> EventTypeRegistry {
        self.inner
    }
}

/// Derive the default logical name from a Rust type name.
///
/// Module path and generic arguments are dropped and the remaining identifier is
/// converted to snake_case: `app::events::HTTPRequestSent` → `http_request_sent`.
pub fn default_event_name(descriptor: &str) -> String {
    let base = descriptor.split('<').next().unwrap_or(descriptor);
    let short = base.rsplit("::").next().unwrap_or(base);
    let chars: Vec<char> = short.chars().collect();

    let mut out = String::with_capacity(short.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if !c.is_uppercase() {
            out.push(c);
            continue;
        }
        let prev = i.checked_sub(1).map(|p| chars[p]);
        let next = chars.get(i + 1).copied();
        let boundary = match prev {
            None | Some('_') => false,
            Some(p) if p.is_lowercase() || p.is_ascii_digit() => true,
            Some(p) if p.is_uppercase() => next.is_some_and(char::is_lowercase),
            _ => false,
        };
        if boundary {
            out.push('_');
        }
        out.extend(c.to_lowercase());
    }
    out
}
