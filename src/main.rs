//! provisionctl - Main entry point
//!
//! Loads the pipeline file, waits for the network, bootstraps dependencies,
//! runs the steps and prints the summary.
//!
//! Exit codes: `0` every step succeeded, `1` at least one step failed or was
//! skipped, `2` the run could not start (bad configuration, no usable store).

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use provisionctl::cli::{Action, Cli};
use provisionctl::config_file::ProvisionConfig;
use provisionctl::engine::orchestrator::{ForceRerun, Orchestrator};
use provisionctl::engine::summary::StepOutcome;
use provisionctl::error::ProvisionError;
use provisionctl::logic::dependencies::{self, CommandPackageProbe, DependencyInstaller};
use provisionctl::logic::download::HttpFetcher;
use provisionctl::network::{HttpProbe, NetworkStabilityChecker, ThreadSleeper};
use provisionctl::process_guard::{self, ProcessGuard};
use provisionctl::retry::RetryExecutor;
use provisionctl::step_runner::ProcessStepRunner;
use provisionctl::store::StatusStore;

/// The run could not start
const EXIT_FATAL: u8 = 2;

/// Initialize tracing: stderr always, plus an optional plain-text file
fn init_tracing(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, registry, EnvFilter};

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let stderr_layer = fmt::layer()
        .with_timer(fmt::time::ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_string()))
        .with_target(false)
        .with_writer(std::io::stderr);

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create log directory {:?}", parent))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {:?}", path))?;
            Some(
                fmt::layer()
                    .with_timer(fmt::time::ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_string()))
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse_args();

    let config = cli
        .config
        .as_ref()
        .map(ProvisionConfig::load_from_file)
        .transpose();

    let log_file = cli.log_file.clone().or_else(|| {
        config
            .as_ref()
            .ok()
            .and_then(|c| c.as_ref())
            .and_then(|c| c.log_file.clone())
    });
    if let Err(e) = init_tracing(cli.verbose, log_file.as_deref()) {
        eprintln!("Failed to initialize logging: {:#}", e);
    }
    info!("provisionctl {} starting", env!("CARGO_PKG_VERSION"));

    let result = config.and_then(|config| dispatch(&cli, config));
    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("✗ {:#}", e);
            ExitCode::from(EXIT_FATAL)
        }
    }
}

fn dispatch(cli: &Cli, config: Option<ProvisionConfig>) -> Result<u8> {
    match cli.action() {
        Action::InitConfig(path) => {
            ProvisionConfig::example().save_to_file(&path)?;
            println!("✓ Example configuration written to {:?}", path);
            Ok(0)
        }
        Action::CheckConfig => {
            let config = require_config(config)?;
            config.validate().context("Configuration validation failed")?;
            println!(
                "✓ Configuration is valid: {} dependencies, {} steps",
                config.dependencies.len(),
                config.steps.len()
            );
            Ok(0)
        }
        Action::ExportCsv(path) => {
            let config = config.unwrap_or_default();
            let store = open_store(cli, &config)?;
            let order = config
                .pipeline()
                .map(|p| p.record_order())
                .unwrap_or_default();
            export_csv(&store, &order, &path)?;
            Ok(0)
        }
        Action::ClearHistory { dry_run } => {
            let config = config.unwrap_or_default();
            let store = open_store(cli, &config)?;
            clear_history(&store, dry_run)?;
            Ok(0)
        }
        Action::Run => {
            let config = require_config(config)?;
            run_pipeline(cli, config)
        }
    }
}

fn require_config(config: Option<ProvisionConfig>) -> Result<ProvisionConfig> {
    config.ok_or_else(|| anyhow::anyhow!("--config <PATH> is required"))
}

/// Open the configured store, falling back to the secondary root
fn open_store(cli: &Cli, config: &ProvisionConfig) -> Result<StatusStore> {
    let primary: PathBuf = cli
        .status_root
        .clone()
        .unwrap_or_else(|| config.status_root.clone());

    match StatusStore::open(&primary) {
        Ok(store) => Ok(store),
        Err(primary_err) => {
            let Some(fallback) = &config.fallback_status_root else {
                return Err(primary_err)
                    .with_context(|| format!("Status store at {:?} is unavailable", primary));
            };
            warn!(
                "Status store at {:?} unavailable ({}), using fallback {:?}",
                primary, primary_err, fallback
            );
            StatusStore::open(fallback).with_context(|| {
                format!(
                    "Status store unavailable at {:?} and fallback {:?}",
                    primary, fallback
                )
            })
        }
    }
}

fn export_csv(store: &StatusStore, order: &[String], path: &Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
    let count = store
        .export_csv(order, BufWriter::new(file))
        .with_context(|| format!("Failed to export step records to {:?}", path))?;
    info!("Exported {} record(s) to {:?}", count, path);
    println!("✓ Exported {} step record(s) to {:?}", count, path);
    Ok(())
}

fn clear_history(store: &StatusStore, dry_run: bool) -> Result<()> {
    if dry_run {
        let names = store.step_names().context("Failed to list step records")?;
        println!(
            "Would remove {} step record(s) from {}:",
            names.len(),
            store.location()
        );
        for name in names {
            println!("  - {}", name);
        }
        return Ok(());
    }

    let removed = store.clear().context("Failed to clear step records")?;
    println!("✓ Removed {} step record(s)", removed);
    Ok(())
}

fn run_pipeline(cli: &Cli, config: ProvisionConfig) -> Result<u8> {
    config.validate().context("Configuration validation failed")?;
    let pipeline = config.pipeline()?;

    let store = Arc::new(open_store(cli, &config)?);
    info!("Status store: {}", store.location());

    // Children must not outlive us, whichever way we exit
    let _guard = ProcessGuard::new();
    if let Err(e) = process_guard::init_signal_handlers() {
        warn!("Failed to initialize signal handlers: {}", e);
    }

    let probe = HttpProbe::new(&config.network.probe_url, config.network.probe_timeout())?;
    let checker = NetworkStabilityChecker::new(Arc::new(probe), Arc::new(ThreadSleeper));

    if cli.skip_network_check {
        info!("Network check skipped");
    } else {
        let retries = cli
            .network_retry_count
            .unwrap_or(config.network.retry_count);
        let delay = cli
            .network_retry_delay_seconds
            .unwrap_or(config.network.retry_delay_seconds);
        if !checker.wait_for_stability(retries, delay, config.network.continuous_check)? {
            let err = ProvisionError::transient_network(format!(
                "Network not stable after {} attempts; network-dependent steps will retry",
                retries
            ));
            warn!("{}", err);
        }
    }

    let runner = Arc::new(ProcessStepRunner::new());
    let retry = RetryExecutor::new(checker);

    let prerequisites = if config.dependencies.is_empty() {
        Vec::new()
    } else {
        let fetcher = HttpFetcher::new(std::time::Duration::from_secs(
            config.download.timeout_seconds,
        ))?;
        let installer = DependencyInstaller::new(
            runner.clone(),
            Arc::new(CommandPackageProbe::new(
                runner.clone(),
                config.dependency_timeout(),
            )),
            Arc::new(fetcher),
            retry.clone(),
            config.download.dir.clone(),
        )
        .with_source_policy(config.dependency_retry)
        .with_download_policy(config.download.retry)
        .with_install_timeout(config.dependency_timeout());

        let results = installer.ensure(&config.dependencies);
        for result in results.iter().filter(|r| !r.satisfied) {
            error!("{}", ProvisionError::dependency_unsatisfied(result.to_string()));
        }
        dependencies::record_results(&store, &config.dependencies, &results);

        config
            .dependencies
            .iter()
            .zip(&results)
            .map(|(dep, result)| StepOutcome::from_dependency(dep, result))
            .collect()
    };

    let force = ForceRerun::from_values(&cli.force_rerun);
    for unknown in force.unknown_steps(&pipeline) {
        warn!("--force-rerun names unknown step '{}'", unknown);
    }
    debug!("Force rerun: {:?}", force);

    let orchestrator = Orchestrator::new(pipeline, store, runner, retry)
        .with_force_rerun(force)
        .with_prerequisite_outcomes(prerequisites);
    let summary = orchestrator.run();

    println!("{}", summary);
    Ok(summary.exit_code() as u8)
}
