//! Operator surface over projection statuses and subscription checkpoints.
//!
//! Reads never lock. Every mutation takes the same named lock the daemons
//! use, waiting up to the configured admin timeout, so an operator action
//! never interleaves with a batch in flight.

pub mod projections;
pub mod subscriptions;

use thiserror::Error;

use crate::locks::LockError;
use crate::projections::TransitionError;
use crate::storage::{ProjectionState, StorageError};

pub use projections::{FailedEventDto, ProjectionManager, ProjectionStatusDto};
pub use subscriptions::{SubscriptionManager, SubscriptionStatusDto};

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("unknown projection '{0}'")]
    UnknownProjection(String),

    #[error("unknown subscription '{0}'")]
    UnknownSubscription(String),

    #[error("cannot {operation} projection '{name}' while it is {state}")]
    InvalidStateTransition {
        name: String,
        operation: &'static str,
        state: ProjectionState,
    },

    #[error("invalid replay request: {0}")]
    InvalidReplayRequest(String),

    #[error("failed to rebuild '{name}': {source:#}")]
    Rebuild {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<TransitionError> for AdminError {
    fn from(err: TransitionError) -> Self {
        AdminError::InvalidStateTransition {
            name: err.name,
            operation: err.operation,
            state: err.state,
        }
    }
}

/// `position / total` as a percentage rounded to two decimals; `None`
/// without a meaningful total.
pub fn progress_percentage(position: u64, total: Option<u64>) -> Option<f64> {
    match total {
        Some(total) if total > 0 => {
            let ratio = position as f64 / total as f64 * 100.0;
            Some((ratio * 100.0).round() / 100.0)
        }
        _ => None,
    }
}
