//! End-of-run report
//!
//! Read-only view of what a run did. `Display` renders the operator-facing
//! summary; the binary derives its exit code from it.

use crate::exit_codes;
use crate::logic::dependencies::{Dependency, DependencyResult};
use crate::store::now_timestamp;
use crate::types::{StepStatus, ToolKind};
use std::fmt;

/// Outcome of one step (or dependency) in a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub name: String,
    pub status: StepStatus,
    pub timestamp: String,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
    /// Table that classifies `exit_code`
    pub tool_kind: Option<ToolKind>,
    /// Reused from an earlier run instead of executing
    pub resumed: bool,
    /// Runner invocations including retries
    pub attempts: u32,
}

impl StepOutcome {
    pub fn new(name: impl Into<String>, status: StepStatus) -> Self {
        Self {
            name: name.into(),
            status,
            timestamp: now_timestamp(),
            exit_code: None,
            message: None,
            tool_kind: None,
            resumed: false,
            attempts: 0,
        }
    }

    /// Outcome of the dependency phase for one dependency
    pub fn from_dependency(dependency: &Dependency, result: &DependencyResult) -> Self {
        Self {
            exit_code: result.exit_code,
            message: Some(result.message.clone()),
            tool_kind: result.tool_kind,
            attempts: result.attempts,
            ..Self::new(dependency.step_name(), result.status())
        }
    }

    /// Classified rendering of the exit code, e.g. `1603: ERROR_INSTALL_FAILURE - ...`
    pub fn exit_code_description(&self) -> Option<String> {
        self.exit_code
            .map(|code| exit_codes::describe(code, self.tool_kind))
    }
}

/// Everything a run did, in pipeline order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub outcomes: Vec<StepOutcome>,
    /// Critical step whose failure stopped the run
    pub aborted_by: Option<String>,
}

impl RunSummary {
    pub fn new(outcomes: Vec<StepOutcome>, aborted_by: Option<String>) -> Self {
        Self {
            outcomes,
            aborted_by,
        }
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(StepStatus::Success)
    }

    pub fn failed(&self) -> usize {
        self.count(StepStatus::Failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(StepStatus::Skipped)
    }

    pub fn failures(&self) -> impl Iterator<Item = &StepOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.status == StepStatus::Failed)
    }

    pub fn outcome(&self, name: &str) -> Option<&StepOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }

    /// True when every step ended in Success
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.status == StepStatus::Success)
    }

    /// Process exit code: 0 when everything succeeded, 1 otherwise
    pub fn exit_code(&self) -> i32 {
        if self.all_succeeded() { 0 } else { 1 }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Provisioning Summary ===")?;
        writeln!(
            f,
            "Success: {}  Failed: {}  Skipped: {}",
            self.succeeded(),
            self.failed(),
            self.skipped()
        )?;

        let resumed = self.outcomes.iter().filter(|o| o.resumed).count();
        if resumed > 0 {
            writeln!(f, "Resumed from earlier runs: {}", resumed)?;
        }

        if let Some(step) = &self.aborted_by {
            writeln!(f, "Run aborted by critical step '{}'", step)?;
        }

        if self.failed() > 0 {
            writeln!(f)?;
            writeln!(f, "Failed steps:")?;
            for outcome in self.failures() {
                writeln!(
                    f,
                    "  - {} [{}]: {}",
                    outcome.name,
                    outcome.timestamp,
                    outcome.message.as_deref().unwrap_or("no message")
                )?;
                if let Some(description) = outcome.exit_code_description() {
                    writeln!(f, "    Exit code {}", description)?;
                }
            }
        }

        let skipped: Vec<&StepOutcome> = self
            .outcomes
            .iter()
            .filter(|o| o.status == StepStatus::Skipped)
            .collect();
        if !skipped.is_empty() {
            writeln!(f)?;
            writeln!(f, "Skipped steps:")?;
            for outcome in skipped {
                writeln!(
                    f,
                    "  - {}: {}",
                    outcome.name,
                    outcome.message.as_deref().unwrap_or("skipped")
                )?;
            }
        }
        Ok(())
    }
}
