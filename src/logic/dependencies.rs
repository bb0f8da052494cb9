//! Dependency bootstrap
//!
//! Makes sure the tools the pipeline relies on are installed before any step
//! runs. Each dependency goes through the same ladder:
//!
//! 1. **Detect**: already registered? Done, nothing is invoked.
//! 2. **Sources**: try each package source in the configured order. Transient
//!    failures are retried against the same source; "not found on this
//!    source" moves on immediately; other failures move on after logging.
//! 3. **Fallback**: download the installer directly and run it once.
//! 4. **Exhausted**: report the dependency unsatisfied.
//!
//! Exactly one of those four ends the ladder, and the outcome is returned as
//! a [`DependencyResult`], never raised.

use crate::command::StepCommand;
use crate::exit_codes::ExitCodeInfo;
use crate::logic::download::ArtifactFetcher;
use crate::retry::{NetworkUnavailable, RetryExecutor, RetryPolicy};
use crate::step_runner::StepRunner;
use crate::store::{backend, RecordDetails, StatusStore};
use crate::types::{StepStatus, ToolKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Prefix of the step record written for each dependency
pub const DEPENDENCY_STEP_PREFIX: &str = "Dependency.";

/// Placeholder in a fallback install command replaced by the artifact path
pub const ARTIFACT_PLACEHOLDER: &str = "artifact";

fn default_source_kind() -> ToolKind {
    ToolKind::PackageManagerTool
}

fn default_fallback_kind() -> ToolKind {
    ToolKind::InstallerPackage
}

/// One package source able to install a dependency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateSource {
    /// Source label, e.g. `winget` or `msstore`
    pub source: String,
    pub invocation: StepCommand,
    #[serde(default = "default_source_kind")]
    pub tool_kind: ToolKind,
}

/// Last-resort installer fetched straight from a URI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectDownload {
    pub uri: String,
    /// File name inside the download directory
    pub file_name: String,
    /// Install command; `{artifact}` is replaced by the downloaded path
    pub install: StepCommand,
    #[serde(default = "default_fallback_kind")]
    pub tool_kind: ToolKind,
}

/// A tool that must be present before the pipeline runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    /// Registration lookup; exit 0 means installed
    #[serde(default)]
    pub detect: Option<StepCommand>,
    #[serde(default)]
    pub sources: Vec<CandidateSource>,
    #[serde(default)]
    pub fallback: Option<DirectDownload>,
    #[serde(default)]
    pub version: Option<String>,
}

impl Dependency {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: String::new(),
            detect: None,
            sources: Vec::new(),
            fallback: None,
            version: None,
        }
    }

    /// Name used in logs and the summary
    pub fn label(&self) -> &str {
        if self.display_name.trim().is_empty() {
            &self.id
        } else {
            &self.display_name
        }
    }

    /// Name of the step record that carries this dependency's outcome
    pub fn step_name(&self) -> String {
        format!("{}{}", DEPENDENCY_STEP_PREFIX, self.id)
    }

    /// Check ids, file names and that there is some way to install
    pub fn validate(&self) -> crate::error::Result<()> {
        backend::validate_component(&self.id)?;
        if self.sources.is_empty() && self.fallback.is_none() && self.detect.is_none() {
            return Err(crate::error::ProvisionError::configuration(format!(
                "Dependency '{}' has no detect command, sources or fallback",
                self.id
            )));
        }
        if let Some(fallback) = &self.fallback {
            backend::validate_component(&fallback.file_name)?;
            if !fallback.uri.starts_with("http://") && !fallback.uri.starts_with("https://") {
                return Err(crate::error::ProvisionError::configuration(format!(
                    "Dependency '{}' fallback URI must be http(s), got '{}'",
                    self.id, fallback.uri
                )));
            }
        }
        Ok(())
    }
}

/// Outcome of ensuring one dependency
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyResult {
    pub id: String,
    pub satisfied: bool,
    /// Something was installed by this run
    pub changed: bool,
    pub exit_code: Option<i32>,
    /// Table that classifies `exit_code`
    pub tool_kind: Option<ToolKind>,
    pub message: String,
    /// Installer invocations including retries and the fallback attempt
    pub attempts: u32,
}

impl DependencyResult {
    pub fn status(&self) -> StepStatus {
        if self.satisfied {
            StepStatus::Success
        } else {
            StepStatus::Failed
        }
    }
}

impl fmt::Display for DependencyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match (self.satisfied, self.changed) {
            (true, false) => "present",
            (true, true) => "installed",
            (false, _) => "unsatisfied",
        };
        write!(f, "{}: {} ({})", self.id, state, self.message)
    }
}

// ============================================================================
// Collaborators
// ============================================================================

/// Answers "is this dependency already installed?"
pub trait PackageProbe: Send + Sync {
    fn is_installed(&self, dependency: &Dependency) -> bool;
}

/// Runs the dependency's detect command; exit 0 means installed
pub struct CommandPackageProbe {
    runner: Arc<dyn StepRunner>,
    timeout: Option<Duration>,
}

impl CommandPackageProbe {
    pub fn new(runner: Arc<dyn StepRunner>, timeout: Option<Duration>) -> Self {
        Self { runner, timeout }
    }
}

impl PackageProbe for CommandPackageProbe {
    fn is_installed(&self, dependency: &Dependency) -> bool {
        let Some(detect) = &dependency.detect else {
            return false;
        };
        let label = format!("{}/detect", dependency.id);
        self.runner.run(&label, detect, self.timeout).succeeded()
    }
}

// ============================================================================
// Installer
// ============================================================================

#[derive(Debug, Error)]
enum SourceError {
    #[error("{info}")]
    Transient {
        info: ExitCodeInfo,
        message: Option<String>,
    },
    #[error(transparent)]
    Network(#[from] NetworkUnavailable),
}

#[derive(Debug, Error)]
enum DownloadError {
    #[error("{0:#}")]
    Fetch(anyhow::Error),
    #[error(transparent)]
    Network(#[from] NetworkUnavailable),
}

enum SourceOutcome {
    Installed(ExitCodeInfo),
    Missing(ExitCodeInfo),
    Failed {
        code: Option<i32>,
        kind: Option<ToolKind>,
        message: String,
    },
}

fn with_detail(info: &ExitCodeInfo, message: Option<&str>) -> String {
    match message {
        Some(msg) if !msg.is_empty() => format!("{} ({})", info.describe(), msg),
        _ => info.describe(),
    }
}

/// Walks the detect, sources, fallback ladder for each dependency
pub struct DependencyInstaller {
    runner: Arc<dyn StepRunner>,
    probe: Arc<dyn PackageProbe>,
    fetcher: Arc<dyn ArtifactFetcher>,
    retry: RetryExecutor,
    source_policy: RetryPolicy,
    download_policy: RetryPolicy,
    download_dir: PathBuf,
    install_timeout: Option<Duration>,
}

impl fmt::Debug for DependencyInstaller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyInstaller")
            .field("source_policy", &self.source_policy)
            .field("download_policy", &self.download_policy)
            .field("download_dir", &self.download_dir)
            .finish_non_exhaustive()
    }
}

impl DependencyInstaller {
    pub fn new(
        runner: Arc<dyn StepRunner>,
        probe: Arc<dyn PackageProbe>,
        fetcher: Arc<dyn ArtifactFetcher>,
        retry: RetryExecutor,
        download_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            probe,
            fetcher,
            retry,
            source_policy: RetryPolicy::once(),
            download_policy: RetryPolicy::once().with_network(true),
            download_dir: download_dir.into(),
            install_timeout: None,
        }
    }

    /// Policy for retrying one source while its failure is transient
    pub fn with_source_policy(mut self, policy: RetryPolicy) -> Self {
        self.source_policy = policy;
        self
    }

    /// Policy for the fallback download; always network gated
    pub fn with_download_policy(mut self, policy: RetryPolicy) -> Self {
        self.download_policy = policy.with_network(true);
        self
    }

    pub fn with_install_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.install_timeout = timeout;
        self
    }

    /// Ensure every dependency, in order
    pub fn ensure(&self, dependencies: &[Dependency]) -> Vec<DependencyResult> {
        dependencies.iter().map(|dep| self.ensure_one(dep)).collect()
    }

    /// Ensure a single dependency
    pub fn ensure_one(&self, dependency: &Dependency) -> DependencyResult {
        let id = dependency.id.clone();

        if self.probe.is_installed(dependency) {
            tracing::info!("{} already installed", dependency.label());
            return DependencyResult {
                id,
                satisfied: true,
                changed: false,
                exit_code: None,
                tool_kind: None,
                message: "Already installed".to_string(),
                attempts: 0,
            };
        }

        let mut attempts = 0;
        let mut last_code = None;
        let mut last_kind = None;
        let mut last_message = "No package sources configured".to_string();

        for source in &dependency.sources {
            match self.try_source(dependency, source, &mut attempts) {
                SourceOutcome::Installed(info) => {
                    tracing::info!("Installed {} from {}", dependency.label(), source.source);
                    return DependencyResult {
                        id,
                        satisfied: true,
                        changed: true,
                        exit_code: Some(info.code),
                        tool_kind: Some(source.tool_kind),
                        message: format!("Installed from {}: {}", source.source, info.describe()),
                        attempts,
                    };
                }
                SourceOutcome::Missing(info) => {
                    tracing::info!(
                        "{} not available from {}, trying next source",
                        dependency.label(),
                        source.source
                    );
                    last_code = Some(info.code);
                    last_kind = Some(source.tool_kind);
                    last_message = format!("{}: {}", source.source, info.describe());
                }
                SourceOutcome::Failed { code, kind, message } => {
                    tracing::warn!(
                        "{} failed from {}: {}",
                        dependency.label(),
                        source.source,
                        message
                    );
                    last_code = code;
                    last_kind = kind;
                    last_message = format!("{}: {}", source.source, message);
                }
            }
        }

        if let Some(fallback) = &dependency.fallback {
            return self.try_fallback(dependency, fallback, attempts);
        }

        tracing::error!("{} could not be installed from any source", dependency.label());
        DependencyResult {
            id,
            satisfied: false,
            changed: false,
            exit_code: last_code,
            tool_kind: last_kind,
            message: last_message,
            attempts,
        }
    }

    fn try_source(
        &self,
        dependency: &Dependency,
        source: &CandidateSource,
        attempts: &mut u32,
    ) -> SourceOutcome {
        let label = format!("{}/{}", dependency.id, source.source);

        let result = self.retry.execute(&self.source_policy, |_| {
            *attempts += 1;
            let exec = self.runner.run(&label, &source.invocation, self.install_timeout);
            let info = exec.classify(Some(source.tool_kind));
            if info.is_transient() {
                Err(SourceError::Transient {
                    info,
                    message: exec.message,
                })
            } else {
                let kind = exec.tool_kind(Some(source.tool_kind));
                Ok((info, kind, exec.message))
            }
        });

        match result {
            Ok((info, ..)) if info.is_success() => SourceOutcome::Installed(info),
            Ok((info, ..)) if info.is_source_miss() => SourceOutcome::Missing(info),
            Ok((info, kind, message)) => SourceOutcome::Failed {
                code: Some(info.code),
                kind,
                message: with_detail(&info, message.as_deref()),
            },
            Err(SourceError::Transient { info, message }) => SourceOutcome::Failed {
                code: Some(info.code),
                kind: Some(source.tool_kind),
                message: with_detail(&info, message.as_deref()),
            },
            Err(err @ SourceError::Network(_)) => SourceOutcome::Failed {
                code: None,
                kind: None,
                message: err.to_string(),
            },
        }
    }

    fn try_fallback(
        &self,
        dependency: &Dependency,
        fallback: &DirectDownload,
        mut attempts: u32,
    ) -> DependencyResult {
        attempts += 1;
        let unsatisfied = |exit_code: Option<i32>, tool_kind: Option<ToolKind>, message: String| {
            tracing::error!("{} fallback failed: {}", dependency.label(), message);
            DependencyResult {
                id: dependency.id.clone(),
                satisfied: false,
                changed: false,
                exit_code,
                tool_kind,
                message,
                attempts,
            }
        };

        let artifact = self.download_dir.join(&fallback.file_name);
        tracing::info!("Downloading {} from {}", dependency.label(), fallback.uri);

        let downloaded = self.retry.execute(&self.download_policy, |_| {
            self.fetcher
                .fetch(&fallback.uri, &artifact)
                .map_err(DownloadError::Fetch)
        });
        if let Err(err) = downloaded {
            return unsatisfied(None, None, format!("Download of {} failed: {}", fallback.uri, err));
        }

        let install = fallback
            .install
            .substitute(ARTIFACT_PLACEHOLDER, &artifact.to_string_lossy());
        let label = format!("{}/fallback", dependency.id);
        let exec = self.runner.run(&label, &install, self.install_timeout);
        let info = exec.classify(Some(fallback.tool_kind));

        if info.is_success() {
            tracing::info!("Installed {} from direct download", dependency.label());
            DependencyResult {
                id: dependency.id.clone(),
                satisfied: true,
                changed: true,
                exit_code: Some(info.code),
                tool_kind: Some(fallback.tool_kind),
                message: format!("Installed from direct download: {}", info.describe()),
                attempts,
            }
        } else {
            unsatisfied(
                Some(info.code),
                exec.tool_kind(Some(fallback.tool_kind)),
                with_detail(&info, exec.message.as_deref()),
            )
        }
    }
}

/// Persist dependency outcomes as `Dependency.<id>` step records and record
/// installed versions in the AppRecord ledger.
///
/// Persistence failures are logged, never raised.
pub fn record_results(store: &StatusStore, dependencies: &[Dependency], results: &[DependencyResult]) {
    for (dependency, result) in dependencies.iter().zip(results) {
        let mut details = RecordDetails::default().version(dependency.version.clone());
        details.exit_code = result.exit_code;
        if !result.satisfied {
            details.error_message = Some(result.message.clone());
        }

        if let Err(e) = store.write(&dependency.step_name(), result.status(), &details) {
            tracing::error!("Failed to record {}: {}", dependency.step_name(), e);
        }

        if let (true, Some(version)) = (result.satisfied, &dependency.version) {
            if let Err(e) = store.record_app(&dependency.id, version) {
                tracing::error!("Failed to record version of {}: {}", dependency.id, e);
            }
        }
    }
}
