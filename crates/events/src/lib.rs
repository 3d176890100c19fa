//! Event model: typed events, persisted records, and the type registry that
//! maps between them.

pub mod envelope;
pub mod event;
pub mod record;
pub mod registry;
pub mod state;

pub use envelope::EventEnvelope;
pub use event::{Event, NewEvent};
pub use record::{StoredEvent, UncommittedEvent};
pub use registry::{
    default_event_name, EventTypeRegistry, EventTypeRegistryBuilder, MaterializationError,
    RegistrationError,
};
pub use state::{fold, fold_with, StreamState};
