//! `keelson-core` — identity and versioning primitives shared by every layer.
//!
//! Nothing in here performs IO.

pub mod error;
pub mod id;
pub mod version;

pub use error::{DomainError, DomainResult};
pub use id::{EventId, StreamId, TenantId};
pub use version::ExpectedVersion;
