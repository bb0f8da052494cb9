//! Step State Machine
//!
//! Tracks the status of every step within a single run and enforces that a
//! step's status only moves forward.
//!
//! # Design Principles
//!
//! - **Validated Transitions**: only the edges below are accepted
//! - **No Global State**: a `RunLedger` is owned by one orchestrator run
//! - **Fail Fast**: invalid transitions return errors immediately
//!
//! # Status Flow
//!
//! ```text
//! Pending ──→ Running ──→ Success
//!    │           └──────→ Failed
//!    └──────→ Skipped
//! ```
//!
//! The persisted `StepRecord` is the durable copy of this state; the ledger is
//! the in-memory copy that still answers dependency questions when the store
//! cannot be read.

use crate::types::StepStatus;
use std::collections::HashMap;
use thiserror::Error;

/// Returns true if `to` is a legal next status after `from` within one run
pub const fn is_valid_transition(from: StepStatus, to: StepStatus) -> bool {
    matches!(
        (from, to),
        (StepStatus::Pending, StepStatus::Running)
            | (StepStatus::Pending, StepStatus::Skipped)
            | (StepStatus::Running, StepStatus::Success)
            | (StepStatus::Running, StepStatus::Failed)
    )
}

/// Errors that can occur during status transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepTransitionError {
    /// The step is not part of this run
    #[error("Step '{step}' is not part of this run")]
    UnknownStep { step: String },

    /// Attempted a transition outside the allowed edges
    #[error("Step '{step}' cannot move from {from} to {to}")]
    InvalidTransition {
        step: String,
        from: StepStatus,
        to: StepStatus,
    },

    /// Attempted to change a step that already finished in this run
    #[error("Step '{step}' already finished with status {status}")]
    AlreadyFinished { step: String, status: StepStatus },
}

/// Per-run status of every step, in pipeline order.
///
/// # Example
///
/// ```
/// use provisionctl::step_state::RunLedger;
/// use provisionctl::types::StepStatus;
///
/// let mut ledger = RunLedger::new(["InstallTool", "InstallApps"]);
/// ledger.transition("InstallTool", StepStatus::Running).unwrap();
/// ledger.transition("InstallTool", StepStatus::Failed).unwrap();
///
/// // Cannot go back to Running
/// assert!(ledger.transition("InstallTool", StepStatus::Running).is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct RunLedger {
    order: Vec<String>,
    statuses: HashMap<String, StepStatus>,
}

impl RunLedger {
    /// Create a ledger with every step `Pending`
    pub fn new<I, S>(steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let order: Vec<String> = steps.into_iter().map(Into::into).collect();
        let statuses = order
            .iter()
            .map(|name| (name.clone(), StepStatus::Pending))
            .collect();
        Self { order, statuses }
    }

    /// Current status of a step in this run
    pub fn status(&self, step: &str) -> Option<StepStatus> {
        self.statuses.get(step).copied()
    }

    /// Step names in pipeline order
    pub fn steps(&self) -> &[String] {
        &self.order
    }

    /// Move a step to `to`, validating the edge.
    ///
    /// # Errors
    ///
    /// - `UnknownStep` if the step was not declared
    /// - `AlreadyFinished` if the step already reached a terminal status
    /// - `InvalidTransition` for any other illegal edge
    pub fn transition(&mut self, step: &str, to: StepStatus) -> Result<(), StepTransitionError> {
        let current = self
            .statuses
            .get_mut(step)
            .ok_or_else(|| StepTransitionError::UnknownStep {
                step: step.to_string(),
            })?;

        if current.is_terminal() {
            return Err(StepTransitionError::AlreadyFinished {
                step: step.to_string(),
                status: *current,
            });
        }

        if !is_valid_transition(*current, to) {
            return Err(StepTransitionError::InvalidTransition {
                step: step.to_string(),
                from: *current,
                to,
            });
        }

        *current = to;
        Ok(())
    }

    /// Record a step as completed by an earlier run without executing it
    pub fn mark_resumed(&mut self, step: &str) -> Result<(), StepTransitionError> {
        self.transition(step, StepStatus::Running)?;
        self.transition(step, StepStatus::Success)
    }

    /// Number of steps currently at `status`
    pub fn count(&self, status: StepStatus) -> usize {
        self.statuses.values().filter(|s| **s == status).count()
    }
}
