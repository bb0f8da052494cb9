use clap::{ArgAction, Parser};
use std::path::PathBuf;

/// provisionctl - resumable device provisioning pipeline
#[derive(Parser, Debug)]
#[command(name = "provisionctl")]
#[command(about = "Runs provisioning steps in order, records every outcome, and resumes after reboots")]
#[command(version)]
pub struct Cli {
    /// Pipeline configuration file (JSON)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Network probes before the run starts [default: 5]
    #[arg(long, value_name = "COUNT", value_parser = clap::value_parser!(u32).range(1..))]
    pub network_retry_count: Option<u32>,

    /// Seconds between network probes [default: 10]
    #[arg(long, value_name = "SECONDS")]
    pub network_retry_delay_seconds: Option<u64>,

    /// Do not wait for the network before the run
    #[arg(long)]
    pub skip_network_check: bool,

    /// Run a step even if it already succeeded; `all` reruns every step
    #[arg(long, value_name = "STEP|all", action = ArgAction::Append)]
    pub force_rerun: Vec<String>,

    /// Write all step records to a CSV file and exit
    #[arg(long, value_name = "PATH", conflicts_with = "clear_history")]
    pub export_csv: Option<PathBuf>,

    /// Remove all step records and exit
    #[arg(long)]
    pub clear_history: bool,

    /// With --clear-history: list the records that would be removed
    #[arg(long, requires = "clear_history")]
    pub dry_run: bool,

    /// Validate the configuration file and exit
    #[arg(long, requires = "config", conflicts_with_all = ["export_csv", "clear_history"])]
    pub check_config: bool,

    /// Write an example configuration file and exit
    #[arg(long, value_name = "PATH", conflicts_with_all = ["export_csv", "clear_history", "check_config"])]
    pub init_config: Option<PathBuf>,

    /// Status store root (overrides the configuration file)
    #[arg(long, value_name = "DIR")]
    pub status_root: Option<PathBuf>,

    /// Also write logs to this file (overrides the configuration file)
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// What the invocation asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Run,
    ExportCsv(PathBuf),
    ClearHistory { dry_run: bool },
    CheckConfig,
    InitConfig(PathBuf),
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }

    pub fn action(&self) -> Action {
        if let Some(path) = &self.init_config {
            Action::InitConfig(path.clone())
        } else if let Some(path) = &self.export_csv {
            Action::ExportCsv(path.clone())
        } else if self.clear_history {
            Action::ClearHistory {
                dry_run: self.dry_run,
            }
        } else if self.check_config {
            Action::CheckConfig
        } else {
            Action::Run
        }
    }
}
