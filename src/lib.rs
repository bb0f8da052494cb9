//! provisionctl library
//!
//! Runs an ordered pipeline of provisioning steps on a device, records each
//! outcome in a crash-safe status store, and resumes from that record after a
//! reboot or crash.

pub mod cli;
pub mod command;
pub mod config_file;
pub mod engine;
pub mod error;
pub mod exit_codes;
pub mod logic;
pub mod network;
pub mod process_guard;
pub mod retry;
pub mod step_runner;
pub mod step_state;
pub mod store;
#[doc(hidden)]
pub mod test_fixtures;
pub mod types;

// Re-export main types for convenience
pub use command::StepCommand;
pub use config_file::ProvisionConfig;
pub use error::{ProvisionError, Result};
pub use exit_codes::{Category, ExitCodeInfo};
pub use process_guard::{ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use step_runner::{ProcessStepRunner, StepExecution, StepRunner};
pub use step_state::{RunLedger, StepTransitionError};
pub use types::{StepStatus, ToolKind};

// Network gating and retries
pub use network::{ConnectivityProbe, HttpProbe, NetworkState, NetworkStabilityChecker};
pub use retry::{RetryExecutor, RetryPolicy};

// Persistence
pub use store::{FsBackend, MemoryBackend, StateBackend, StatusStore, StepRecord};

// Dependency bootstrap
pub use logic::dependencies::{Dependency, DependencyInstaller, DependencyResult};

// Orchestration
pub use engine::orchestrator::{DeploymentStep, ForceRerun, Orchestrator, Pipeline};
pub use engine::summary::{RunSummary, StepOutcome};
