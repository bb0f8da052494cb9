//! Pipeline configuration file
//!
//! One JSON document describes where state lives, how the network is probed,
//! which dependencies to bootstrap and which steps to run. Command-line flags
//! override the matching values after loading.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::command::StepCommand;
use crate::engine::orchestrator::{DeploymentStep, Pipeline};
use crate::logic::dependencies::{CandidateSource, Dependency, DirectDownload};
use crate::network::{DEFAULT_PROBE_TIMEOUT, DEFAULT_PROBE_URL};
use crate::retry::RetryPolicy;
use crate::types::ToolKind;

/// Default network retry count (`--network-retry-count`)
pub const DEFAULT_NETWORK_RETRY_COUNT: u32 = 5;

/// Default delay between network retries (`--network-retry-delay-seconds`)
pub const DEFAULT_NETWORK_RETRY_DELAY_SECONDS: u64 = 10;

fn default_status_root() -> PathBuf {
    PathBuf::from("/var/lib/provisionctl")
}

fn default_download_dir() -> PathBuf {
    std::env::temp_dir().join("provisionctl-downloads")
}

fn default_probe_url() -> String {
    DEFAULT_PROBE_URL.to_string()
}

fn default_probe_timeout_seconds() -> u64 {
    DEFAULT_PROBE_TIMEOUT.as_secs()
}

fn default_retry_count() -> u32 {
    DEFAULT_NETWORK_RETRY_COUNT
}

fn default_retry_delay_seconds() -> u64 {
    DEFAULT_NETWORK_RETRY_DELAY_SECONDS
}

fn default_download_timeout_seconds() -> u64 {
    crate::logic::download::DEFAULT_DOWNLOAD_TIMEOUT.as_secs()
}

fn default_dependency_retry() -> RetryPolicy {
    RetryPolicy::once()
}

/// Connectivity probing and the pre-run stability wait
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_probe_url")]
    pub probe_url: String,
    #[serde(default = "default_probe_timeout_seconds")]
    pub probe_timeout_seconds: u64,
    /// Require three confirming probes after the first success
    #[serde(default)]
    pub continuous_check: bool,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay_seconds")]
    pub retry_delay_seconds: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            probe_url: default_probe_url(),
            probe_timeout_seconds: default_probe_timeout_seconds(),
            continuous_check: false,
            retry_count: default_retry_count(),
            retry_delay_seconds: default_retry_delay_seconds(),
        }
    }
}

impl NetworkConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds)
    }
}

/// Direct-download fallback settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadConfig {
    #[serde(default = "default_download_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_download_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Network gating is always switched on for downloads
    #[serde(default = "default_dependency_retry")]
    pub retry: RetryPolicy,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            dir: default_download_dir(),
            timeout_seconds: default_download_timeout_seconds(),
            retry: default_dependency_retry(),
        }
    }
}

/// Top-level configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionConfig {
    /// Root of the persisted status tree
    #[serde(default = "default_status_root")]
    pub status_root: PathBuf,
    /// Used when `status_root` cannot be opened
    #[serde(default)]
    pub fallback_status_root: Option<PathBuf>,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub network: NetworkConfig,
    /// Policy for retrying one package source on transient failures
    #[serde(default = "default_dependency_retry")]
    pub dependency_retry: RetryPolicy,
    /// Time limit for detect and install commands
    #[serde(default)]
    pub dependency_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    pub steps: Vec<DeploymentStep>,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            status_root: default_status_root(),
            fallback_status_root: None,
            log_file: None,
            network: NetworkConfig::default(),
            dependency_retry: default_dependency_retry(),
            dependency_timeout_seconds: None,
            download: DownloadConfig::default(),
            dependencies: Vec::new(),
            steps: Vec::new(),
        }
    }
}

impl ProvisionConfig {
    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.network.retry_count == 0 {
            anyhow::bail!("Network retry count must be at least 1");
        }
        if self.network.probe_timeout_seconds == 0 {
            anyhow::bail!("Network probe timeout must be at least 1 second");
        }
        let url = self.network.probe_url.trim();
        if !url.starts_with("http://") && !url.starts_with("https://") {
            anyhow::bail!("Network probe URL must start with http:// or https://");
        }
        if self.dependency_timeout_seconds == Some(0) {
            anyhow::bail!("Dependency timeout must be at least 1 second");
        }

        let mut ids = HashSet::new();
        for dependency in &self.dependencies {
            dependency
                .validate()
                .with_context(|| format!("Invalid dependency '{}'", dependency.id))?;
            if !ids.insert(dependency.id.as_str()) {
                anyhow::bail!("Duplicate dependency id '{}'", dependency.id);
            }
        }

        if self.steps.is_empty() {
            anyhow::bail!("At least one step must be configured");
        }
        self.pipeline()?;

        Ok(())
    }

    /// Validated pipeline; dependency records are valid `depends_on` targets
    pub fn pipeline(&self) -> crate::error::Result<Pipeline> {
        Pipeline::new(
            self.steps.clone(),
            self.dependencies.iter().map(Dependency::step_name),
        )
    }

    pub fn dependency_timeout(&self) -> Option<Duration> {
        self.dependency_timeout_seconds.map(Duration::from_secs)
    }

    /// Annotated starting point for a new pipeline file
    pub fn example() -> Self {
        let tool = Dependency {
            id: "PackageTool".to_string(),
            display_name: "Package manager".to_string(),
            detect: Some(StepCommand::shell("command -v pkgtool")),
            sources: vec![CandidateSource {
                source: "default".to_string(),
                invocation: StepCommand::new("pkgtool-bootstrap").arg("--silent"),
                tool_kind: ToolKind::PackageManagerTool,
            }],
            fallback: Some(DirectDownload {
                uri: "https://example.com/pkgtool.msi".to_string(),
                file_name: "pkgtool.msi".to_string(),
                install: StepCommand::new("msiexec").args(["/i", "{artifact}", "/qn"]),
                tool_kind: ToolKind::InstallerPackage,
            }),
            version: Some("1.0.0".to_string()),
        };

        let install_apps = DeploymentStep::new(
            "InstallApps",
            StepCommand::new("pkgtool").args(["install", "--manifest", "apps.json"]),
        )
        .depends_on(tool.step_name())
        .with_exit_codes(ToolKind::PackageManagerTool)
        .with_retry(RetryPolicy::once().with_network(true))
        .with_timeout(3600);

        Self {
            dependencies: vec![tool],
            steps: vec![
                DeploymentStep::new("SetHostname", StepCommand::shell("hostnamectl set-hostname $HOSTNAME_VALUE"))
                    .critical(),
                install_apps,
            ],
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_test_config() -> ProvisionConfig {
        ProvisionConfig {
            steps: vec![
                DeploymentStep::new("InstallTool", StepCommand::new("true")),
                DeploymentStep::new("InstallApps", StepCommand::new("true")).depends_on("InstallTool"),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_minimal_json_uses_defaults() {
        let json = r#"{"steps": [{"name": "A", "command": {"program": "true"}}]}"#;
        let config: ProvisionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.network.retry_count, DEFAULT_NETWORK_RETRY_COUNT);
        assert_eq!(config.network.retry_delay_seconds, DEFAULT_NETWORK_RETRY_DELAY_SECONDS);
        assert_eq!(config.network.probe_url, DEFAULT_PROBE_URL);
        assert_eq!(config.dependency_retry, RetryPolicy::once());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let config = ProvisionConfig::example();
        let temp_file = NamedTempFile::new().unwrap();
        config.save_to_file(temp_file.path()).unwrap();

        let loaded = ProvisionConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(loaded, config);
        assert!(loaded.validate().is_ok());
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = ProvisionConfig::load_from_file(Path::new("/nonexistent/path"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_invalid_json() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"{ invalid json }").unwrap();
        temp_file.flush().unwrap();
        assert!(ProvisionConfig::load_from_file(temp_file.path()).is_err());
    }

    #[test]
    fn test_zero_attempt_policy_fails_at_load() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file
            .write_all(
                br#"{"steps": [{"name": "A", "command": {"program": "true"},
                    "retry": {"max_attempts": 0}}]}"#,
            )
            .unwrap();
        temp_file.flush().unwrap();
        assert!(ProvisionConfig::load_from_file(temp_file.path()).is_err());
    }

    #[test]
    fn test_tool_kind_spelling_in_json() {
        let json = r#"{"steps": [{"name": "A", "command": {"program": "x"},
                       "exit_codes": "installer_package"}]}"#;
        let config: ProvisionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.steps[0].exit_codes, Some(ToolKind::InstallerPackage));
    }

    #[test]
    fn test_validation_valid_config() {
        assert!(create_test_config().validate().is_ok());
    }

    #[test]
    fn test_validation_requires_steps() {
        let config = ProvisionConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_forward_dependency() {
        let mut config = create_test_config();
        config.steps.reverse();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("runs after it"));
    }

    #[test]
    fn test_validation_duplicate_dependency_ids() {
        let mut config = ProvisionConfig::example();
        let dup = config.dependencies[0].clone();
        config.dependencies.push(dup);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_zero_network_retries() {
        let mut config = create_test_config();
        config.network.retry_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_bad_probe_url() {
        let mut config = create_test_config();
        config.network.probe_url = "ftp://example.com".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_steps_may_depend_on_dependency_records() {
        let config = ProvisionConfig::example();
        let pipeline = config.pipeline().unwrap();
        assert_eq!(
            pipeline.record_order(),
            vec!["Dependency.PackageTool", "SetHostname", "InstallApps"]
        );
    }
}
