//! Shared enums for provisionctl
//!
//! These replace the stringly-typed values the status tree stores on disk with
//! proper Rust enums. The strum serializations are the on-disk spellings.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Persisted status of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
pub enum StepStatus {
    #[default]
    #[strum(serialize = "Pending")]
    Pending,
    #[strum(serialize = "Running")]
    Running,
    #[strum(serialize = "Success")]
    Success,
    #[strum(serialize = "Failed")]
    Failed,
    #[strum(serialize = "Skipped")]
    Skipped,
}

impl StepStatus {
    /// Success, Failed and Skipped end a step's lifecycle within a run
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Skipped)
    }

    /// Statuses that cause dependents to be skipped
    pub const fn blocks_dependents(self) -> bool {
        matches!(self, Self::Failed | Self::Skipped)
    }
}

/// Vendor tool family whose exit codes a table describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
pub enum ToolKind {
    /// Package manager CLI (winget-style HRESULT codes)
    #[serde(rename = "package_manager")]
    #[strum(serialize = "package_manager")]
    PackageManagerTool,
    /// Installer package engine (Windows Installer / MSI codes)
    #[serde(rename = "installer_package")]
    #[strum(serialize = "installer_package")]
    InstallerPackage,
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_status_roundtrip_through_disk_spelling() {
        for status in StepStatus::iter() {
            let parsed: StepStatus = status.to_string().parse().expect("should parse");
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_blocking_statuses() {
        assert!(StepStatus::Failed.blocks_dependents());
        assert!(StepStatus::Skipped.blocks_dependents());
        assert!(!StepStatus::Success.blocks_dependents());
        assert!(!StepStatus::Running.blocks_dependents());
        assert!(!StepStatus::Pending.blocks_dependents());
    }

    #[test]
    fn test_tool_kind_serde_matches_strum() {
        let json = serde_json::to_string(&ToolKind::PackageManagerTool).unwrap();
        assert_eq!(json, "\"package_manager\"");
        let kind: ToolKind = "installer_package".parse().unwrap();
        assert_eq!(kind, ToolKind::InstallerPackage);
    }
}
