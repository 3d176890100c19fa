//! Projection lifecycle transitions.
//!
//! | operation          | from                   | to                      |
//! |--------------------|------------------------|-------------------------|
//! | `begin_rebuild`    | any                    | Rebuilding              |
//! | `complete_rebuild` | Rebuilding             | Active                  |
//! | `fault`            | Active, Rebuilding     | Faulted                 |
//! | `retry` / `skip`   | Faulted                | Active or Rebuilding    |
//! | `pause`            | anything but Faulted   | Paused                  |
//! | `resume`           | Paused                 | Active or Rebuilding    |
//!
//! Leaving Faulted or Paused returns to Rebuilding when a rebuild was
//! interrupted, and to Active otherwise.

use anyhow::Context;
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::registry::RegisteredProjection;
use crate::storage::{ProjectionState, ProjectionStatusRecord, StorageTx};

/// An operation is not allowed in the projection's current state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("cannot {operation} projection '{name}' while it is {state}")]
pub struct TransitionError {
    pub name: String,
    pub operation: &'static str,
    pub state: ProjectionState,
}

impl ProjectionStatusRecord {
    /// A rebuild was started and has not completed yet.
    pub fn has_unfinished_rebuild(&self) -> bool {
        self.rebuild_started_at.is_some() && self.rebuild_completed_at.is_none()
    }

    /// Whether appends may run the projection inline and advance its position.
    ///
    /// Not while the daemon owns it: rebuilding, faulted, or paused halfway
    /// through a rebuild.
    pub fn accepts_inline_updates(&self) -> bool {
        !matches!(self.state, ProjectionState::Rebuilding | ProjectionState::Faulted)
            && !self.has_unfinished_rebuild()
    }

    /// Restart from the beginning of the log at `version`.
    pub fn begin_rebuild(&mut self, version: u32, total_events: u64, at: DateTime<Utc>) {
        self.state = ProjectionState::Rebuilding;
        self.version = version;
        self.position = 0;
        self.total_events = Some(total_events);
        self.rebuild_started_at = Some(at);
        self.rebuild_completed_at = None;
        self.last_error = None;
        self.failed_event_sequence = None;
    }

    pub fn complete_rebuild(&mut self, at: DateTime<Utc>) {
        self.state = ProjectionState::Active;
        self.rebuild_completed_at = Some(at);
    }

    pub fn advance(&mut self, position: u64, at: DateTime<Utc>) {
        self.position = self.position.max(position);
        self.last_processed_at = Some(at);
    }

    pub fn fault(&mut self, sequence: u64, error: impl Into<String>) {
        self.state = ProjectionState::Faulted;
        self.failed_event_sequence = Some(sequence);
        self.last_error = Some(error.into());
    }

    /// Clear the fault and reprocess the failed event on the next batch.
    pub fn retry(&mut self) -> Result<(), TransitionError> {
        self.require(ProjectionState::Faulted, "retry")?;
        self.clear_fault();
        Ok(())
    }

    /// Clear the fault and move past the failed event.
    pub fn skip(&mut self) -> Result<(), TransitionError> {
        self.require(ProjectionState::Faulted, "skip")?;
        if let Some(sequence) = self.failed_event_sequence {
            self.position = self.position.max(sequence);
        }
        self.clear_fault();
        Ok(())
    }

    /// Stop daemon processing. A faulted projection must be retried or
    /// skipped first.
    pub fn pause(&mut self) -> Result<(), TransitionError> {
        if self.state == ProjectionState::Faulted {
            return Err(self.rejected("pause"));
        }
        self.state = ProjectionState::Paused;
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), TransitionError> {
        self.require(ProjectionState::Paused, "resume")?;
        self.state = self.running_state();
        Ok(())
    }

    fn clear_fault(&mut self) {
        self.last_error = None;
        self.failed_event_sequence = None;
        self.state = self.running_state();
    }

    fn running_state(&self) -> ProjectionState {
        if self.has_unfinished_rebuild() {
            ProjectionState::Rebuilding
        } else {
            ProjectionState::Active
        }
    }

    fn require(&self, state: ProjectionState, operation: &'static str) -> Result<(), TransitionError> {
        if self.state == state {
            Ok(())
        } else {
            Err(self.rejected(operation))
        }
    }

    fn rejected(&self, operation: &'static str) -> TransitionError {
        TransitionError {
            name: self.name.clone(),
            operation,
            state: self.state,
        }
    }
}

/// Clear a projection's data and put its status into Rebuilding at the
/// projection's current version.
///
/// Holds the append lock so no inline update lands between the clear and the
/// state change. Only touches `tx`; the caller commits.
pub(crate) async fn start_rebuild<T: StorageTx>(
    tx: &mut T,
    projection: &RegisteredProjection<T>,
    status: &mut ProjectionStatusRecord,
) -> anyhow::Result<()> {
    tx.lock_appends().await?;
    let total = tx.count_events().await?;
    projection
        .clear(tx)
        .await
        .with_context(|| format!("clearing projection '{}'", projection.name()))?;
    status.begin_rebuild(projection.version(), total, Utc::now());
    tx.save_projection_status(status).await?;
    Ok(())
}
