//! Step Pipeline Orchestrator
//!
//! Runs the configured steps one at a time, in declared order, and records
//! every outcome in the [`StatusStore`].
//!
//! # Per-step flow
//!
//! | Situation | Result |
//! |---|---|
//! | an earlier critical step failed | `Skipped`, not executed |
//! | stored `Success` and not forced | reused, not executed |
//! | a `depends_on` entry is Failed/Skipped | `Skipped`, not executed |
//! | otherwise | `Running`, then `Success` or `Failed` |
//!
//! # Design
//!
//! - **Validated up front**: [`Pipeline::new`] rejects duplicate names, self
//!   and forward references before anything runs
//! - **Isolation**: a step is a child process; whatever it does, the loop
//!   continues with the next step
//! - **Best-effort persistence**: store failures are logged and the run goes
//!   on. Dependency decisions use this run's ledger first, so a lost write
//!   never unblocks a dependent

use crate::command::StepCommand;
use crate::error::{ProvisionError, Result};
use crate::exit_codes::{Category, ExitCodeInfo};
use crate::retry::{NetworkUnavailable, RetryExecutor, RetryPolicy};
use crate::step_runner::{StepExecution, StepRunner};
use crate::step_state::RunLedger;
use crate::store::{backend, RecordDetails, StatusStore};
use crate::types::{StepStatus, ToolKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::summary::{RunSummary, StepOutcome};

/// `--force-rerun` value that forces every step
pub const FORCE_ALL: &str = "all";

// ============================================================================
// Pipeline definition
// ============================================================================

/// One unit of provisioning work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentStep {
    pub name: String,
    pub command: StepCommand,
    /// Failure aborts the rest of the run
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Exit code table for this step's tool
    #[serde(default)]
    pub exit_codes: Option<ToolKind>,
    /// Recorded on success, and in the AppRecord ledger
    #[serde(default)]
    pub version: Option<String>,
}

impl DeploymentStep {
    pub fn new(name: impl Into<String>, command: StepCommand) -> Self {
        Self {
            name: name.into(),
            command,
            critical: false,
            depends_on: BTreeSet::new(),
            retry: None,
            timeout_seconds: None,
            exit_codes: None,
            version: None,
        }
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn depends_on(mut self, step: impl Into<String>) -> Self {
        self.depends_on.insert(step.into());
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_exit_codes(mut self, kind: ToolKind) -> Self {
        self.exit_codes = Some(kind);
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }
}

/// Validated, ordered list of steps
#[derive(Debug, Clone)]
pub struct Pipeline {
    steps: Vec<DeploymentStep>,
    prerequisites: BTreeSet<String>,
}

impl Pipeline {
    /// Validate `steps`.
    ///
    /// `prerequisites` are names recorded before the pipeline starts (the
    /// `Dependency.<id>` records) that steps may depend on.
    ///
    /// # Errors
    ///
    /// `Configuration` for invalid or duplicate names, self-dependencies,
    /// dependencies on unknown or later steps, and zero timeouts.
    pub fn new<I, S>(steps: Vec<DeploymentStep>, prerequisites: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let prerequisites: BTreeSet<String> = prerequisites.into_iter().map(Into::into).collect();
        let mut seen: HashSet<&str> = HashSet::new();

        for step in &steps {
            backend::validate_component(&step.name).map_err(|e| {
                ProvisionError::configuration(format!("Invalid step name '{}': {}", step.name, e))
            })?;
            if prerequisites.contains(&step.name) {
                return Err(ProvisionError::configuration(format!(
                    "Step name '{}' collides with a dependency record",
                    step.name
                )));
            }
            if step.timeout_seconds == Some(0) {
                return Err(ProvisionError::configuration(format!(
                    "Step '{}' has a zero timeout",
                    step.name
                )));
            }

            for dep in &step.depends_on {
                if dep == &step.name {
                    return Err(ProvisionError::configuration(format!(
                        "Step '{}' depends on itself",
                        step.name
                    )));
                }
                if !seen.contains(dep.as_str()) && !prerequisites.contains(dep) {
                    let later = steps.iter().any(|s| &s.name == dep);
                    return Err(ProvisionError::configuration(if later {
                        format!(
                            "Step '{}' depends on '{}', which runs after it",
                            step.name, dep
                        )
                    } else {
                        format!("Step '{}' depends on unknown step '{}'", step.name, dep)
                    }));
                }
            }

            if !seen.insert(&step.name) {
                return Err(ProvisionError::configuration(format!(
                    "Duplicate step name '{}'",
                    step.name
                )));
            }
        }

        Ok(Self {
            steps,
            prerequisites,
        })
    }

    pub fn steps(&self) -> &[DeploymentStep] {
        &self.steps
    }

    /// Step names in run order
    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.name.clone()).collect()
    }

    /// Names a store export should list first: prerequisites, then steps
    pub fn record_order(&self) -> Vec<String> {
        self.prerequisites
            .iter()
            .cloned()
            .chain(self.step_names())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.steps.iter().any(|s| s.name == name)
    }
}

/// Which steps ignore a stored `Success`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ForceRerun {
    #[default]
    None,
    All,
    Steps(HashSet<String>),
}

impl ForceRerun {
    /// Build from `--force-rerun` values; `all` anywhere forces everything
    pub fn from_values<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut steps = HashSet::new();
        for value in values {
            let value = value.as_ref().trim();
            if value.eq_ignore_ascii_case(FORCE_ALL) {
                return Self::All;
            }
            if !value.is_empty() {
                steps.insert(value.to_string());
            }
        }
        if steps.is_empty() { Self::None } else { Self::Steps(steps) }
    }

    pub fn is_forced(&self, step: &str) -> bool {
        match self {
            Self::None => false,
            Self::All => true,
            Self::Steps(steps) => steps.contains(step),
        }
    }

    /// Named steps that are not part of `pipeline`
    pub fn unknown_steps(&self, pipeline: &Pipeline) -> Vec<String> {
        match self {
            Self::Steps(steps) => {
                let mut unknown: Vec<String> = steps
                    .iter()
                    .filter(|s| !pipeline.contains(s))
                    .cloned()
                    .collect();
                unknown.sort();
                unknown
            }
            _ => Vec::new(),
        }
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

#[derive(Debug, Error)]
enum AttemptError {
    #[error("{info}")]
    Failed {
        execution: StepExecution,
        info: ExitCodeInfo,
    },
    #[error(transparent)]
    Network(#[from] NetworkUnavailable),
}

/// Drives a [`Pipeline`] against a [`StatusStore`]
pub struct Orchestrator {
    pipeline: Pipeline,
    store: Arc<StatusStore>,
    runner: Arc<dyn StepRunner>,
    retry: RetryExecutor,
    force: ForceRerun,
    prerequisite_outcomes: Vec<StepOutcome>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("steps", &self.pipeline.step_names())
            .field("store", &self.store)
            .field("force", &self.force)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(
        pipeline: Pipeline,
        store: Arc<StatusStore>,
        runner: Arc<dyn StepRunner>,
        retry: RetryExecutor,
    ) -> Self {
        Self {
            pipeline,
            store,
            runner,
            retry,
            force: ForceRerun::None,
            prerequisite_outcomes: Vec::new(),
        }
    }

    pub fn with_force_rerun(mut self, force: ForceRerun) -> Self {
        self.force = force;
        self
    }

    /// Outcomes of the dependency phase: reported in the summary and used
    /// for dependency decisions when the store cannot be read
    pub fn with_prerequisite_outcomes(mut self, outcomes: Vec<StepOutcome>) -> Self {
        self.prerequisite_outcomes = outcomes;
        self
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Run every step once, in order
    pub fn run(&self) -> RunSummary {
        let mut ledger = RunLedger::new(self.pipeline.step_names());
        let prerequisites: HashMap<&str, StepStatus> = self
            .prerequisite_outcomes
            .iter()
            .map(|o| (o.name.as_str(), o.status))
            .collect();

        let mut outcomes = self.prerequisite_outcomes.clone();
        let mut aborted_by: Option<String> = None;

        tracing::info!(
            "Starting pipeline of {} step(s), store at {}",
            self.pipeline.steps().len(),
            self.store.location()
        );

        for step in self.pipeline.steps() {
            let outcome = if let Some(critical) = &aborted_by {
                let message = format!("Skipped: run aborted by critical step '{}'", critical);
                self.skip(step, message, &mut ledger)
            } else if let Some(outcome) = self.resume(step, &mut ledger) {
                outcome
            } else if let Some((dep, status)) = self.blocking_dependency(step, &ledger, &prerequisites) {
                let message = format!("Skipped: dependency '{}' {}", dep, status);
                self.skip(step, message, &mut ledger)
            } else {
                self.execute(step, &mut ledger)
            };

            if step.critical && outcome.status == StepStatus::Failed && aborted_by.is_none() {
                tracing::error!("Critical step '{}' failed, aborting the run", step.name);
                aborted_by = Some(step.name.clone());
            }
            outcomes.push(outcome);
        }

        let summary = RunSummary::new(outcomes, aborted_by);
        tracing::info!(
            "Pipeline finished: {} succeeded, {} failed, {} skipped",
            summary.succeeded(),
            summary.failed(),
            summary.skipped()
        );
        summary
    }

    fn persist(&self, step: &str, status: StepStatus, details: &RecordDetails) {
        if let Err(e) = self.store.write(step, status, details) {
            tracing::error!("Failed to persist {} = {}: {}", step, status, e);
        }
    }

    fn advance(&self, ledger: &mut RunLedger, step: &str, status: StepStatus) {
        if let Err(e) = ledger.transition(step, status) {
            tracing::error!("{}", e);
        }
    }

    /// Stored success from an earlier run, unless forced
    fn resume(&self, step: &DeploymentStep, ledger: &mut RunLedger) -> Option<StepOutcome> {
        if self.force.is_forced(&step.name) {
            return None;
        }
        let record = match self.store.read(&step.name) {
            Ok(Some(record)) if record.status == StepStatus::Success => record,
            Ok(_) => return None,
            Err(e) => {
                tracing::warn!("Cannot read stored status of {}: {}", step.name, e);
                return None;
            }
        };

        tracing::info!(
            "{} already succeeded at {}, not running it again",
            step.name,
            record.timestamp
        );
        if let Err(e) = ledger.mark_resumed(&step.name) {
            tracing::error!("{}", e);
        }
        Some(StepOutcome {
            timestamp: record.timestamp,
            exit_code: record.exit_code,
            tool_kind: step.exit_codes,
            resumed: true,
            ..StepOutcome::new(&step.name, StepStatus::Success)
        })
    }

    /// First dependency whose status blocks `step`.
    ///
    /// What this run decided wins over the store: a failed status write
    /// leaves `Running` on disk, which must not unblock dependents. The store
    /// is only consulted for dependencies this run knows nothing final about.
    fn blocking_dependency(
        &self,
        step: &DeploymentStep,
        ledger: &RunLedger,
        prerequisites: &HashMap<&str, StepStatus>,
    ) -> Option<(String, StepStatus)> {
        step.depends_on.iter().find_map(|dep| {
            let status = ledger
                .status(dep)
                .filter(|s| s.is_terminal())
                .or_else(|| prerequisites.get(dep.as_str()).copied())
                .or_else(|| match self.store.read(dep) {
                    Ok(record) => record.map(|r| r.status),
                    Err(e) => {
                        tracing::warn!("Cannot read status of {}: {}", dep, e);
                        None
                    }
                });
            status
                .filter(|s| s.blocks_dependents())
                .map(|s| (dep.clone(), s))
        })
    }

    fn skip(&self, step: &DeploymentStep, message: String, ledger: &mut RunLedger) -> StepOutcome {
        tracing::warn!("{}: {}", step.name, message);
        self.advance(ledger, &step.name, StepStatus::Skipped);
        self.persist(
            &step.name,
            StepStatus::Skipped,
            &RecordDetails::default().message(message.clone()),
        );
        StepOutcome {
            message: Some(message),
            ..StepOutcome::new(&step.name, StepStatus::Skipped)
        }
    }

    fn execute(&self, step: &DeploymentStep, ledger: &mut RunLedger) -> StepOutcome {
        self.advance(ledger, &step.name, StepStatus::Running);
        self.persist(&step.name, StepStatus::Running, &RecordDetails::default());

        let mut attempts = 0;
        let policy = step.retry.unwrap_or_else(RetryPolicy::once);
        let result = self.retry.execute(&policy, |attempt| {
            attempts = attempt;
            let execution = self.runner.run(&step.name, &step.command, step.timeout());
            let info = execution.classify(step.exit_codes);
            // Fatal outcomes are final; anything else may clear up on retry
            if info.is_success() || info.category == Category::Fatal {
                Ok((execution, info))
            } else {
                Err(AttemptError::Failed { execution, info })
            }
        });

        let (exit_code, message, info, tool_kind) = match result {
            Ok((execution, info)) if info.is_success() => {
                return self.succeed(step, ledger, execution.exit_code, attempts);
            }
            Ok((execution, info)) | Err(AttemptError::Failed { execution, info }) => {
                let tool_kind = execution.tool_kind(step.exit_codes);
                let message = execution
                    .message
                    .unwrap_or_else(|| info.description.to_string());
                (Some(execution.exit_code), message, Some(info), tool_kind)
            }
            Err(err @ AttemptError::Network(_)) => (None, err.to_string(), None, None),
        };

        match &info {
            Some(info) => tracing::error!("{} failed: {} ({})", step.name, message, info),
            None => tracing::error!("{} failed: {}", step.name, message),
        }

        self.advance(ledger, &step.name, StepStatus::Failed);
        let mut details = RecordDetails::default().message(message.clone());
        details.exit_code = exit_code;
        self.persist(&step.name, StepStatus::Failed, &details);

        StepOutcome {
            exit_code,
            message: Some(message),
            tool_kind,
            attempts,
            ..StepOutcome::new(&step.name, StepStatus::Failed)
        }
    }

    fn succeed(
        &self,
        step: &DeploymentStep,
        ledger: &mut RunLedger,
        exit_code: i32,
        attempts: u32,
    ) -> StepOutcome {
        self.advance(ledger, &step.name, StepStatus::Success);
        self.persist(
            &step.name,
            StepStatus::Success,
            &RecordDetails::default()
                .exit_code(exit_code)
                .version(step.version.clone()),
        );

        if let Some(version) = &step.version {
            if let Err(e) = self.store.record_app(&step.name, version) {
                tracing::error!("Failed to record version of {}: {}", step.name, e);
            }
        }

        StepOutcome {
            exit_code: Some(exit_code),
            tool_kind: step.exit_codes,
            attempts,
            ..StepOutcome::new(&step.name, StepStatus::Success)
        }
    }
}
