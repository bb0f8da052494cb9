//! Exit Code Classification
//!
//! Maps the opaque numeric exit codes of the two vendor tool families the
//! provisioner drives onto actionable categories.
//!
//! # Tables
//!
//! | Tool family | Code space |
//! |---|---|
//! | `ToolKind::PackageManagerTool` | winget-style HRESULTs, `0x8A15xxxx` |
//! | `ToolKind::InstallerPackage` | Windows Installer (MSI) return codes |
//!
//! The tables are plain data. Classification is a lookup with an
//! `Unknown` default, never a chain of conditionals.
//!
//! # Success-equivalent codes
//!
//! Some non-zero codes mean the desired end state was reached ("already
//! installed", "reboot required"). Those are listed in
//! [`SUCCESS_EQUIVALENT_CODES`], which is the only thing that can turn a
//! non-zero code into `Category::Success`. Bump [`SUCCESS_EQUIVALENT_VERSION`]
//! whenever the list changes so logs show which revision made a decision.

use crate::types::ToolKind;
use std::fmt;
use strum::Display;

/// Actionable outcome of an exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Category {
    Success,
    Retryable,
    Fatal,
    Unknown,
}

/// One row of an exit code table
#[derive(Debug, Clone, Copy)]
pub struct ExitCodeEntry {
    pub code: i32,
    pub name: &'static str,
    pub description: &'static str,
    pub category: Category,
}

/// Result of classifying an exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodeInfo {
    pub code: i32,
    pub name: &'static str,
    pub description: &'static str,
    pub category: Category,
    source_miss: bool,
}

impl ExitCodeInfo {
    pub fn is_success(&self) -> bool {
        self.category == Category::Success
    }

    /// "Package not found on this source": try the next source instead of retrying
    pub fn is_source_miss(&self) -> bool {
        self.source_miss
    }

    /// Retryable outcome that a repeat against the same source may fix
    pub fn is_transient(&self) -> bool {
        self.category == Category::Retryable && !self.source_miss
    }

    /// Human-readable rendering used in summaries and logs
    pub fn describe(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ExitCodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.code < 0 {
            write!(
                f,
                "{} (0x{:08X}): {} - {}",
                self.code, self.code as u32, self.name, self.description
            )
        } else {
            write!(f, "{}: {} - {}", self.code, self.name, self.description)
        }
    }
}

/// Reinterpret an HRESULT as the signed exit code a process reports
const fn hresult(value: u32) -> i32 {
    value as i32
}

// ============================================================================
// Package manager codes
// ============================================================================

pub const PM_INTERNAL_ERROR: i32 = hresult(0x8A15_0001);
pub const PM_INVALID_ARGUMENTS: i32 = hresult(0x8A15_0002);
pub const PM_COMMAND_FAILED: i32 = hresult(0x8A15_0003);
pub const PM_MANIFEST_FAILED: i32 = hresult(0x8A15_0004);
pub const PM_CTRL_SIGNAL_RECEIVED: i32 = hresult(0x8A15_0005);
pub const PM_SHELLEXEC_INSTALL_FAILED: i32 = hresult(0x8A15_0006);
pub const PM_DOWNLOAD_FAILED: i32 = hresult(0x8A15_0008);
pub const PM_SOURCES_INVALID: i32 = hresult(0x8A15_000B);
pub const PM_SOURCE_DATA_MISSING: i32 = hresult(0x8A15_000F);
pub const PM_NO_APPLICABLE_INSTALLER: i32 = hresult(0x8A15_0010);
pub const PM_INSTALLER_HASH_MISMATCH: i32 = hresult(0x8A15_0011);
pub const PM_SOURCE_NAME_DOES_NOT_EXIST: i32 = hresult(0x8A15_0012);
pub const PM_NO_APPLICATIONS_FOUND: i32 = hresult(0x8A15_0014);
pub const PM_NO_SOURCES_DEFINED: i32 = hresult(0x8A15_0015);
pub const PM_MULTIPLE_APPLICATIONS_FOUND: i32 = hresult(0x8A15_0016);
pub const PM_NO_MANIFEST_FOUND: i32 = hresult(0x8A15_0017);
pub const PM_UPDATE_NOT_APPLICABLE: i32 = hresult(0x8A15_002B);
pub const PM_PACKAGE_ALREADY_INSTALLED: i32 = hresult(0x8A15_0061);
pub const PM_INSTALL_PACKAGE_IN_USE: i32 = hresult(0x8A15_0101);
pub const PM_INSTALL_IN_PROGRESS: i32 = hresult(0x8A15_0102);
pub const PM_INSTALL_FILE_IN_USE: i32 = hresult(0x8A15_0103);
pub const PM_INSTALL_MISSING_DEPENDENCY: i32 = hresult(0x8A15_0104);
pub const PM_INSTALL_DISK_FULL: i32 = hresult(0x8A15_0105);
pub const PM_INSTALL_INSUFFICIENT_MEMORY: i32 = hresult(0x8A15_0106);
pub const PM_INSTALL_NO_NETWORK: i32 = hresult(0x8A15_0107);
pub const PM_INSTALL_CONTACT_SUPPORT: i32 = hresult(0x8A15_0108);
pub const PM_INSTALL_REBOOT_REQUIRED_TO_FINISH: i32 = hresult(0x8A15_0109);
pub const PM_INSTALL_REBOOT_REQUIRED_TO_INSTALL: i32 = hresult(0x8A15_010A);
pub const PM_INSTALL_REBOOT_INITIATED: i32 = hresult(0x8A15_010B);
pub const PM_INSTALL_CANCELLED_BY_USER: i32 = hresult(0x8A15_010C);
pub const PM_INSTALL_ALREADY_INSTALLED: i32 = hresult(0x8A15_010D);
pub const PM_INSTALL_DOWNGRADE: i32 = hresult(0x8A15_010E);
pub const PM_INSTALL_BLOCKED_BY_POLICY: i32 = hresult(0x8A15_010F);
pub const PM_INSTALL_DEPENDENCIES: i32 = hresult(0x8A15_0110);

const fn entry(
    code: i32,
    name: &'static str,
    description: &'static str,
    category: Category,
) -> ExitCodeEntry {
    ExitCodeEntry {
        code,
        name,
        description,
        category,
    }
}

pub const PACKAGE_MANAGER_CODES: &[ExitCodeEntry] = &[
    entry(PM_INTERNAL_ERROR, "INTERNAL_ERROR", "Internal error", Category::Fatal),
    entry(PM_INVALID_ARGUMENTS, "INVALID_CL_ARGUMENTS", "Invalid command line arguments", Category::Fatal),
    entry(PM_COMMAND_FAILED, "COMMAND_FAILED", "Executing command failed", Category::Fatal),
    entry(PM_MANIFEST_FAILED, "MANIFEST_FAILED", "Opening manifest failed", Category::Fatal),
    entry(PM_CTRL_SIGNAL_RECEIVED, "CTRL_SIGNAL_RECEIVED", "Cancellation signal received", Category::Fatal),
    entry(PM_SHELLEXEC_INSTALL_FAILED, "SHELLEXEC_INSTALL_FAILED", "Running the installer failed", Category::Fatal),
    entry(PM_DOWNLOAD_FAILED, "DOWNLOAD_FAILED", "Downloading installer failed", Category::Retryable),
    entry(PM_SOURCES_INVALID, "SOURCES_INVALID", "The configured source information is corrupt", Category::Fatal),
    entry(PM_SOURCE_DATA_MISSING, "SOURCE_DATA_MISSING", "Data required by the source is missing", Category::Retryable),
    entry(PM_NO_APPLICABLE_INSTALLER, "NO_APPLICABLE_INSTALLER", "None of the installers are applicable for the current system", Category::Fatal),
    entry(PM_INSTALLER_HASH_MISMATCH, "INSTALLER_HASH_MISMATCH", "Installer hash does not match the manifest", Category::Retryable),
    entry(PM_SOURCE_NAME_DOES_NOT_EXIST, "SOURCE_NAME_DOES_NOT_EXIST", "The named source does not exist", Category::Retryable),
    entry(PM_NO_APPLICATIONS_FOUND, "NO_APPLICATIONS_FOUND", "No package found matching input criteria", Category::Retryable),
    entry(PM_NO_SOURCES_DEFINED, "NO_SOURCES_DEFINED", "No sources are configured", Category::Fatal),
    entry(PM_MULTIPLE_APPLICATIONS_FOUND, "MULTIPLE_APPLICATIONS_FOUND", "Multiple packages found matching input criteria", Category::Fatal),
    entry(PM_NO_MANIFEST_FOUND, "NO_MANIFEST_FOUND", "No manifest found matching input criteria", Category::Retryable),
    entry(PM_UPDATE_NOT_APPLICABLE, "UPDATE_NOT_APPLICABLE", "No applicable update found (already up to date)", Category::Success),
    entry(PM_PACKAGE_ALREADY_INSTALLED, "PACKAGE_ALREADY_INSTALLED", "Package is already installed", Category::Success),
    entry(PM_INSTALL_PACKAGE_IN_USE, "INSTALL_PACKAGE_IN_USE", "Application is currently running", Category::Retryable),
    entry(PM_INSTALL_IN_PROGRESS, "INSTALL_INSTALL_IN_PROGRESS", "Another installation is already in progress", Category::Retryable),
    entry(PM_INSTALL_FILE_IN_USE, "INSTALL_FILE_IN_USE", "One or more files are being used", Category::Retryable),
    entry(PM_INSTALL_MISSING_DEPENDENCY, "INSTALL_MISSING_DEPENDENCY", "Package has a dependency missing from the system", Category::Fatal),
    entry(PM_INSTALL_DISK_FULL, "INSTALL_DISK_FULL", "There is no more space on the disk", Category::Fatal),
    entry(PM_INSTALL_INSUFFICIENT_MEMORY, "INSTALL_INSUFFICIENT_MEMORY", "There is not enough memory available to install", Category::Fatal),
    entry(PM_INSTALL_NO_NETWORK, "INSTALL_NO_NETWORK", "This application requires internet connectivity", Category::Retryable),
    entry(PM_INSTALL_CONTACT_SUPPORT, "INSTALL_CONTACT_SUPPORT", "Installation encountered an error; contact support", Category::Fatal),
    entry(PM_INSTALL_REBOOT_REQUIRED_TO_FINISH, "INSTALL_REBOOT_REQUIRED_TO_FINISH", "Restart required to finish installation", Category::Success),
    entry(PM_INSTALL_REBOOT_REQUIRED_TO_INSTALL, "INSTALL_REBOOT_REQUIRED_TO_INSTALL", "Restart required before installation can start", Category::Fatal),
    entry(PM_INSTALL_REBOOT_INITIATED, "INSTALL_REBOOT_INITIATED", "Installation succeeded; restart initiated", Category::Success),
    entry(PM_INSTALL_CANCELLED_BY_USER, "INSTALL_CANCELLED_BY_USER", "Installation was cancelled", Category::Fatal),
    entry(PM_INSTALL_ALREADY_INSTALLED, "INSTALL_ALREADY_INSTALLED", "Another version of this application is already installed", Category::Fatal),
    entry(PM_INSTALL_DOWNGRADE, "INSTALL_DOWNGRADE", "A higher version of this application is already installed", Category::Fatal),
    entry(PM_INSTALL_BLOCKED_BY_POLICY, "INSTALL_BLOCKED_BY_POLICY", "Organization policies are preventing installation", Category::Fatal),
    entry(PM_INSTALL_DEPENDENCIES, "INSTALL_DEPENDENCIES", "Failed to install package dependencies", Category::Fatal),
];

// ============================================================================
// Installer package codes
// ============================================================================

pub const MSI_INVALID_DATA: i32 = 13;
pub const MSI_INVALID_PARAMETER: i32 = 87;
pub const MSI_SERVICE_FAILURE: i32 = 1601;
pub const MSI_USER_EXIT: i32 = 1602;
pub const MSI_INSTALL_FAILURE: i32 = 1603;
pub const MSI_INSTALL_SUSPEND: i32 = 1604;
pub const MSI_UNKNOWN_PRODUCT: i32 = 1605;
pub const MSI_SOURCE_ABSENT: i32 = 1612;
pub const MSI_ALREADY_RUNNING: i32 = 1618;
pub const MSI_PACKAGE_OPEN_FAILED: i32 = 1619;
pub const MSI_PACKAGE_INVALID: i32 = 1620;
pub const MSI_LOG_FAILURE: i32 = 1622;
pub const MSI_PACKAGE_REJECTED: i32 = 1625;
pub const MSI_PLATFORM_UNSUPPORTED: i32 = 1633;
pub const MSI_PRODUCT_VERSION: i32 = 1638;
pub const MSI_INVALID_COMMAND_LINE: i32 = 1639;
pub const MSI_SUCCESS_REBOOT_INITIATED: i32 = 1641;
pub const MSI_SUCCESS_REBOOT_REQUIRED: i32 = 3010;

pub const INSTALLER_PACKAGE_CODES: &[ExitCodeEntry] = &[
    entry(MSI_INVALID_DATA, "ERROR_INVALID_DATA", "The data is invalid", Category::Fatal),
    entry(MSI_INVALID_PARAMETER, "ERROR_INVALID_PARAMETER", "One of the parameters was invalid", Category::Fatal),
    entry(MSI_SERVICE_FAILURE, "ERROR_INSTALL_SERVICE_FAILURE", "The installer service could not be accessed", Category::Retryable),
    entry(MSI_USER_EXIT, "ERROR_INSTALL_USEREXIT", "The user cancelled installation", Category::Fatal),
    entry(MSI_INSTALL_FAILURE, "ERROR_INSTALL_FAILURE", "A fatal error occurred during installation", Category::Fatal),
    entry(MSI_INSTALL_SUSPEND, "ERROR_INSTALL_SUSPEND", "Installation suspended, incomplete", Category::Fatal),
    entry(MSI_UNKNOWN_PRODUCT, "ERROR_UNKNOWN_PRODUCT", "This action is only valid for products that are currently installed", Category::Fatal),
    entry(MSI_SOURCE_ABSENT, "ERROR_INSTALL_SOURCE_ABSENT", "The installation source for this product is not available", Category::Retryable),
    entry(MSI_ALREADY_RUNNING, "ERROR_INSTALL_ALREADY_RUNNING", "Another installation is already in progress", Category::Retryable),
    entry(MSI_PACKAGE_OPEN_FAILED, "ERROR_INSTALL_PACKAGE_OPEN_FAILED", "The installation package could not be opened", Category::Retryable),
    entry(MSI_PACKAGE_INVALID, "ERROR_INSTALL_PACKAGE_INVALID", "The installation package is not a valid package", Category::Fatal),
    entry(MSI_LOG_FAILURE, "ERROR_INSTALL_LOG_FAILURE", "There was an error opening the installation log file", Category::Fatal),
    entry(MSI_PACKAGE_REJECTED, "ERROR_INSTALL_PACKAGE_REJECTED", "The installation is forbidden by system policy", Category::Fatal),
    entry(MSI_PLATFORM_UNSUPPORTED, "ERROR_INSTALL_PLATFORM_UNSUPPORTED", "The installation package is not supported on this platform", Category::Fatal),
    entry(MSI_PRODUCT_VERSION, "ERROR_PRODUCT_VERSION", "Another version of this product is already installed", Category::Fatal),
    entry(MSI_INVALID_COMMAND_LINE, "ERROR_INVALID_COMMAND_LINE", "Invalid command line argument", Category::Fatal),
    entry(MSI_SUCCESS_REBOOT_INITIATED, "ERROR_SUCCESS_REBOOT_INITIATED", "Installation succeeded; restart initiated", Category::Success),
    entry(MSI_SUCCESS_REBOOT_REQUIRED, "ERROR_SUCCESS_REBOOT_REQUIRED", "Installation succeeded; restart required to complete", Category::Success),
];

// ============================================================================
// Allow-lists
// ============================================================================

/// Revision of [`SUCCESS_EQUIVALENT_CODES`]
pub const SUCCESS_EQUIVALENT_VERSION: u32 = 1;

/// Non-zero codes accepted as success. Reviewed by hand; never inferred.
pub const SUCCESS_EQUIVALENT_CODES: &[(ToolKind, i32)] = &[
    (ToolKind::PackageManagerTool, PM_UPDATE_NOT_APPLICABLE),
    (ToolKind::PackageManagerTool, PM_PACKAGE_ALREADY_INSTALLED),
    (ToolKind::PackageManagerTool, PM_INSTALL_REBOOT_REQUIRED_TO_FINISH),
    (ToolKind::PackageManagerTool, PM_INSTALL_REBOOT_INITIATED),
    (ToolKind::InstallerPackage, MSI_SUCCESS_REBOOT_INITIATED),
    (ToolKind::InstallerPackage, MSI_SUCCESS_REBOOT_REQUIRED),
];

/// Codes meaning "the package is not available from this source"
pub const SOURCE_MISS_CODES: &[(ToolKind, i32)] = &[
    (ToolKind::PackageManagerTool, PM_NO_APPLICATIONS_FOUND),
    (ToolKind::PackageManagerTool, PM_NO_MANIFEST_FOUND),
    (ToolKind::PackageManagerTool, PM_SOURCE_NAME_DOES_NOT_EXIST),
    (ToolKind::InstallerPackage, MSI_SOURCE_ABSENT),
];

// ============================================================================
// Synthetic codes produced by the step runner
// ============================================================================

/// Reported when a step exceeds its time limit and is killed
pub const TIMEOUT_EXIT_CODE: i32 = 1460;

/// Reported when a step's process could not be started
pub const SPAWN_FAILURE_EXIT_CODE: i32 = -1;

// ============================================================================
// Classification
// ============================================================================

/// Exit code table for a tool family
pub fn table(kind: ToolKind) -> &'static [ExitCodeEntry] {
    match kind {
        ToolKind::PackageManagerTool => PACKAGE_MANAGER_CODES,
        ToolKind::InstallerPackage => INSTALLER_PACKAGE_CODES,
    }
}

/// Returns true if `code` is on the success-equivalent allow-list for `kind`
pub fn is_success_equivalent(code: i32, kind: ToolKind) -> bool {
    SUCCESS_EQUIVALENT_CODES.contains(&(kind, code))
}

fn is_source_miss(code: i32, kind: ToolKind) -> bool {
    SOURCE_MISS_CODES.contains(&(kind, code))
}

/// Classify an exit code reported by a tool of the given family.
///
/// Zero is always `Success`. Unmapped codes are `Unknown` with the
/// description `"Unknown exit code"`. A non-zero code is `Success` only when
/// it appears on [`SUCCESS_EQUIVALENT_CODES`].
pub fn classify(code: i32, kind: ToolKind) -> ExitCodeInfo {
    if code == 0 {
        return ExitCodeInfo {
            code,
            name: "SUCCESS",
            description: "Operation completed successfully",
            category: Category::Success,
            source_miss: false,
        };
    }

    let Some(row) = table(kind).iter().find(|row| row.code == code) else {
        return unknown(code);
    };

    let category = if is_success_equivalent(code, kind) {
        Category::Success
    } else if row.category == Category::Success {
        // A table row cannot grant success on its own
        tracing::warn!(
            "Exit code {} ({}) is marked successful but is not on allow-list v{}",
            code,
            row.name,
            SUCCESS_EQUIVALENT_VERSION
        );
        Category::Unknown
    } else {
        row.category
    };

    ExitCodeInfo {
        code,
        name: row.name,
        description: row.description,
        category,
        source_miss: is_source_miss(code, kind),
    }
}

/// Classify the exit code of a pipeline step.
///
/// Handles the runner's synthetic codes first, then defers to the step's
/// declared table. Steps without a table only treat zero as success.
pub fn classify_step_exit(code: i32, kind: Option<ToolKind>) -> ExitCodeInfo {
    match code {
        TIMEOUT_EXIT_CODE => ExitCodeInfo {
            code,
            name: "STEP_TIMEOUT",
            description: "Step exceeded its time limit and was terminated",
            category: Category::Fatal,
            source_miss: false,
        },
        SPAWN_FAILURE_EXIT_CODE => ExitCodeInfo {
            code,
            name: "SPAWN_FAILURE",
            description: "Step process could not be started",
            category: Category::Fatal,
            source_miss: false,
        },
        _ => match kind {
            Some(kind) => classify(code, kind),
            None if code == 0 => classify(0, ToolKind::InstallerPackage),
            None if (129..=192).contains(&code) => killed_by_signal(code),
            None => unknown(code),
        },
    }
}

/// Classification of a process that died from a signal, reported as `code`
pub fn killed_by_signal(code: i32) -> ExitCodeInfo {
    ExitCodeInfo {
        code,
        name: "KILLED_BY_SIGNAL",
        description: "Step process was terminated by a signal",
        category: Category::Fatal,
        source_miss: false,
    }
}

/// Summary rendering of a step exit code, never a bare number
pub fn describe(code: i32, kind: Option<ToolKind>) -> String {
    classify_step_exit(code, kind).describe()
}

fn unknown(code: i32) -> ExitCodeInfo {
    ExitCodeInfo {
        code,
        name: "UNKNOWN",
        description: "Unknown exit code",
        category: Category::Unknown,
        source_miss: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use strum::IntoEnumIterator;

    #[test]
    fn test_zero_is_success_for_every_table() {
        for kind in ToolKind::iter() {
            let info = classify(0, kind);
            assert_eq!(info.category, Category::Success);
        }
    }

    #[test]
    fn test_unmapped_code_is_unknown() {
        for kind in ToolKind::iter() {
            let info = classify(424242, kind);
            assert_eq!(info.category, Category::Unknown);
            assert_eq!(info.description, "Unknown exit code");
        }
    }

    #[test]
    fn test_tables_have_unique_codes() {
        for kind in ToolKind::iter() {
            let mut seen = HashSet::new();
            for row in table(kind) {
                assert!(seen.insert(row.code), "duplicate code {} in {}", row.code, kind);
            }
        }
    }

    #[test]
    fn test_allow_list_matches_success_rows() {
        // Every row marked Success must be allow-listed, and vice versa
        for kind in ToolKind::iter() {
            for row in table(kind) {
                assert_eq!(
                    row.category == Category::Success,
                    is_success_equivalent(row.code, kind),
                    "{} in {} disagrees with the allow-list",
                    row.name,
                    kind
                );
            }
        }
        for (kind, code) in SUCCESS_EQUIVALENT_CODES {
            assert!(table(*kind).iter().any(|row| row.code == *code));
        }
    }

    #[test]
    fn test_reboot_required_is_success_equivalent() {
        let info = classify(MSI_SUCCESS_REBOOT_REQUIRED, ToolKind::InstallerPackage);
        assert!(info.is_success());
        assert_eq!(info.name, "ERROR_SUCCESS_REBOOT_REQUIRED");

        let info = classify(PM_UPDATE_NOT_APPLICABLE, ToolKind::PackageManagerTool);
        assert!(info.is_success());
    }

    #[test]
    fn test_allow_list_is_per_table() {
        // 3010 means nothing to the package manager table
        let info = classify(MSI_SUCCESS_REBOOT_REQUIRED, ToolKind::PackageManagerTool);
        assert_eq!(info.category, Category::Unknown);
    }

    #[test]
    fn test_package_manager_codes_are_negative_hresults() {
        assert_eq!(PM_NO_APPLICATIONS_FOUND, -1978335212);
        assert_eq!(PM_UPDATE_NOT_APPLICABLE, -1978335189);
        assert_eq!(PM_INSTALL_REBOOT_REQUIRED_TO_FINISH, -1978334967);
    }

    #[test]
    fn test_source_miss_is_retryable_subclass() {
        let info = classify(PM_NO_APPLICATIONS_FOUND, ToolKind::PackageManagerTool);
        assert_eq!(info.category, Category::Retryable);
        assert!(info.is_source_miss());
        assert!(!info.is_transient());

        let info = classify(PM_DOWNLOAD_FAILED, ToolKind::PackageManagerTool);
        assert!(!info.is_source_miss());
        assert!(info.is_transient());
    }

    #[test]
    fn test_source_miss_codes_are_retryable_rows() {
        for (kind, code) in SOURCE_MISS_CODES {
            let info = classify(*code, *kind);
            assert_eq!(info.category, Category::Retryable, "{}", info.name);
        }
    }

    #[test]
    fn test_fatal_code() {
        let info = classify(MSI_INSTALL_FAILURE, ToolKind::InstallerPackage);
        assert_eq!(info.category, Category::Fatal);
        assert_eq!(info.name, "ERROR_INSTALL_FAILURE");
    }

    #[test]
    fn test_describe_includes_hex_for_hresults() {
        let info = classify(PM_NO_APPLICATIONS_FOUND, ToolKind::PackageManagerTool);
        let text = info.describe();
        assert!(text.starts_with("-1978335212 (0x8A150014)"));
        assert!(text.contains("NO_APPLICATIONS_FOUND"));

        let info = classify(MSI_INSTALL_FAILURE, ToolKind::InstallerPackage);
        assert_eq!(
            info.describe(),
            "1603: ERROR_INSTALL_FAILURE - A fatal error occurred during installation"
        );
    }

    #[test]
    fn test_step_exit_synthetic_codes() {
        let info = classify_step_exit(TIMEOUT_EXIT_CODE, None);
        assert_eq!(info.category, Category::Fatal);
        assert_eq!(info.name, "STEP_TIMEOUT");

        let info = classify_step_exit(SPAWN_FAILURE_EXIT_CODE, Some(ToolKind::InstallerPackage));
        assert_eq!(info.name, "SPAWN_FAILURE");
    }

    #[test]
    fn test_step_exit_without_table() {
        assert!(classify_step_exit(0, None).is_success());
        assert_eq!(classify_step_exit(1, None).category, Category::Unknown);
        assert_eq!(classify_step_exit(137, None).name, "KILLED_BY_SIGNAL");
        assert!(classify_step_exit(3010, Some(ToolKind::InstallerPackage)).is_success());
    }
}
