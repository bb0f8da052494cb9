//! Dependency bootstrap feeding the step pipeline
//!
//! Installer commands are scripted; the status store is the real filesystem
//! backend so the `Dependency.<id>` records are read back the way a later run
//! would see them.

use std::sync::Arc;

use provisionctl::exit_codes::{MSI_INSTALL_FAILURE, PM_INSTALL_NO_NETWORK, PM_NO_APPLICATIONS_FOUND};
use provisionctl::logic::dependencies::{self, CandidateSource, DirectDownload};
use provisionctl::test_fixtures::{
    FakeFetcher, FixedPackageProbe, RecordingSleeper, ScriptedProbe, ScriptedRunner,
};
use provisionctl::{
    Dependency, DependencyInstaller, DeploymentStep, NetworkStabilityChecker, Orchestrator,
    Pipeline, RetryExecutor, RetryPolicy, StatusStore, StepCommand, StepOutcome, StepStatus,
    ToolKind,
};
use tempfile::TempDir;

fn retry() -> RetryExecutor {
    RetryExecutor::new(NetworkStabilityChecker::new(
        Arc::new(ScriptedProbe::always(true)),
        Arc::new(RecordingSleeper::default()),
    ))
}

fn package_tool() -> Dependency {
    Dependency {
        display_name: "Package manager".to_string(),
        sources: vec![
            CandidateSource {
                source: "winget".to_string(),
                invocation: StepCommand::new("pkg").args(["install", "tool", "--source", "winget"]),
                tool_kind: ToolKind::PackageManagerTool,
            },
            CandidateSource {
                source: "msstore".to_string(),
                invocation: StepCommand::new("pkg").args(["install", "tool", "--source", "msstore"]),
                tool_kind: ToolKind::PackageManagerTool,
            },
        ],
        fallback: Some(DirectDownload {
            uri: "https://example.com/tool.msi".to_string(),
            file_name: "tool.msi".to_string(),
            install: StepCommand::new("msiexec").args(["/i", "{artifact}", "/qn"]),
            tool_kind: ToolKind::InstallerPackage,
        }),
        version: Some("1.8.0".to_string()),
        ..Dependency::new("PackageTool")
    }
}

fn app_steps(dep: &Dependency) -> Vec<DeploymentStep> {
    vec![
        DeploymentStep::new("InstallApps", StepCommand::new("pkg").arg("import"))
            .depends_on(dep.step_name())
            .with_exit_codes(ToolKind::PackageManagerTool),
        DeploymentStep::new("SetWallpaper", StepCommand::new("wallpaper")),
    ]
}

/// Bootstrap `deps`, then run `steps`, the way the binary wires them
fn provision(
    store: Arc<StatusStore>,
    runner: Arc<ScriptedRunner>,
    fetcher: FakeFetcher,
    deps: &[Dependency],
    steps: Vec<DeploymentStep>,
) -> provisionctl::RunSummary {
    let download_dir = TempDir::new().unwrap();
    let installer = DependencyInstaller::new(
        runner.clone(),
        Arc::new(FixedPackageProbe::default()),
        Arc::new(fetcher),
        retry(),
        download_dir.path(),
    )
    .with_source_policy(RetryPolicy::new(2, 0, false, false).unwrap());

    let results = installer.ensure(deps);
    dependencies::record_results(&store, deps, &results);
    let prerequisites: Vec<StepOutcome> = deps
        .iter()
        .zip(&results)
        .map(|(dep, result)| StepOutcome::from_dependency(dep, result))
        .collect();

    let pipeline = Pipeline::new(steps, deps.iter().map(Dependency::step_name)).unwrap();
    Orchestrator::new(pipeline, store, runner, retry())
        .with_prerequisite_outcomes(prerequisites)
        .run()
}

#[test]
fn test_unsatisfied_dependency_skips_dependent_steps() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(StatusStore::open(dir.path()).unwrap());
    let dep = package_tool();
    let runner = Arc::new(
        ScriptedRunner::new()
            .script("PackageTool/winget", [PM_NO_APPLICATIONS_FOUND])
            .script("PackageTool/msstore", [PM_INSTALL_NO_NETWORK]),
    );

    let summary = provision(
        store.clone(),
        runner.clone(),
        FakeFetcher::failing(),
        &[dep.clone()],
        app_steps(&dep),
    );

    // Source miss moves on at once; the transient code is retried once
    assert_eq!(
        runner.invocations(),
        vec![
            "PackageTool/winget",
            "PackageTool/msstore",
            "PackageTool/msstore",
            "SetWallpaper",
        ]
    );

    let dep_outcome = summary.outcome("Dependency.PackageTool").unwrap();
    assert_eq!(dep_outcome.status, StepStatus::Failed);
    assert_eq!(summary.outcome("InstallApps").unwrap().status, StepStatus::Skipped);
    assert_eq!(summary.outcome("SetWallpaper").unwrap().status, StepStatus::Success);
    assert_eq!(summary.exit_code(), 1);

    let record = store.read("Dependency.PackageTool").unwrap().unwrap();
    assert_eq!(record.status, StepStatus::Failed);
    assert!(record.error_message.unwrap().contains("Download"));
    assert_eq!(store.app_version("PackageTool").unwrap(), None);
}

#[test]
fn test_fallback_install_failure_reports_installer_code() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(StatusStore::open(dir.path()).unwrap());
    let dep = package_tool();
    let runner = Arc::new(
        ScriptedRunner::new()
            .script("PackageTool/winget", [PM_NO_APPLICATIONS_FOUND])
            .script("PackageTool/msstore", [PM_NO_APPLICATIONS_FOUND])
            .script("PackageTool/fallback", [MSI_INSTALL_FAILURE]),
    );

    let summary = provision(
        store.clone(),
        runner,
        FakeFetcher::succeeding(),
        &[dep.clone()],
        app_steps(&dep),
    );

    let outcome = summary.outcome("Dependency.PackageTool").unwrap();
    assert_eq!(outcome.exit_code, Some(MSI_INSTALL_FAILURE));
    assert!(summary.to_string().contains("1603: ERROR_INSTALL_FAILURE"));
    assert_eq!(
        store.read("Dependency.PackageTool").unwrap().unwrap().exit_code,
        Some(MSI_INSTALL_FAILURE)
    );
}

#[test]
fn test_installed_dependency_unblocks_steps_and_records_version() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(StatusStore::open(dir.path()).unwrap());
    let dep = package_tool();
    let runner = Arc::new(ScriptedRunner::new());

    let summary = provision(
        store.clone(),
        runner.clone(),
        FakeFetcher::succeeding(),
        &[dep.clone()],
        app_steps(&dep),
    );

    assert!(summary.all_succeeded());
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(
        runner.invocations(),
        vec!["PackageTool/winget", "InstallApps", "SetWallpaper"]
    );
    assert_eq!(store.app_version("PackageTool").unwrap().as_deref(), Some("1.8.0"));

    let record = store.read("Dependency.PackageTool").unwrap().unwrap();
    assert_eq!(record.status, StepStatus::Success);
    assert_eq!(record.version.as_deref(), Some("1.8.0"));
}

#[test]
fn test_dependency_records_are_exported_first() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(StatusStore::open(dir.path()).unwrap());
    let dep = package_tool();
    let steps = app_steps(&dep);

    provision(
        store.clone(),
        Arc::new(ScriptedRunner::new()),
        FakeFetcher::succeeding(),
        &[dep.clone()],
        steps.clone(),
    );

    let order = Pipeline::new(steps, [dep.step_name()]).unwrap().record_order();
    let mut out = Vec::new();
    assert_eq!(store.export_csv(&order, &mut out).unwrap(), 3);
    let csv = String::from_utf8(out).unwrap();
    let names: Vec<&str> = csv
        .split("\r\n")
        .skip(1)
        .filter(|l| !l.is_empty())
        .filter_map(|l| l.split(',').next())
        .collect();
    assert_eq!(names, vec!["Dependency.PackageTool", "InstallApps", "SetWallpaper"]);
}
