//! Test fixtures: scripted fakes for the collaborator traits.
//!
//! Unit tests and the integration tests under `tests/` drive the engine
//! through these instead of the network, the clock and real installers.
//! [`FailingBackend`] stands in for a status store that refuses access.
//!
//! # Usage
//!
//! ```ignore
//! use provisionctl::test_fixtures::{RecordingSleeper, ScriptedProbe, ScriptedRunner};
//!
//! let probe = Arc::new(ScriptedProbe::new([false, true]));
//! let sleeper = Arc::new(RecordingSleeper::default());
//! let runner = ScriptedRunner::new().script("InstallTool", [1603]);
//! ```

use crate::command::StepCommand;
use crate::error::{ProvisionError, Result};
use crate::logic::dependencies::{Dependency, PackageProbe};
use crate::logic::download::ArtifactFetcher;
use crate::network::{ConnectivityProbe, Sleeper};
use crate::step_runner::{StepExecution, StepRunner};
use crate::store::{FieldValue, MemoryBackend, StateBackend, FIELD_STATUS};
use crate::types::StepStatus;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Probe that answers from a script, then with a fixed default
#[derive(Debug)]
pub struct ScriptedProbe {
    script: Mutex<VecDeque<bool>>,
    exhausted: bool,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    /// Answers `script` in order, then `false` forever
    pub fn new<I: IntoIterator<Item = bool>>(script: I) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            exhausted: false,
            calls: AtomicUsize::new(0),
        }
    }

    /// Always answers `online`
    pub fn always(online: bool) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            exhausted: online,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ConnectivityProbe for ScriptedProbe {
    fn probe(&self) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front())
            .unwrap_or(self.exhausted)
    }
}

/// Sleeper that records requested durations and returns immediately
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        if let Ok(mut sleeps) = self.sleeps.lock() {
            sleeps.push(duration);
        }
    }
}

/// Runner that returns scripted exit codes per name; unscripted names exit 0
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    codes: Mutex<HashMap<String, VecDeque<i32>>>,
    messages: HashMap<String, String>,
    signaled: HashSet<String>,
    calls: Mutex<Vec<(String, StepCommand)>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exit codes for successive runs of `name`; the last one repeats
    pub fn script<I: IntoIterator<Item = i32>>(self, name: &str, codes: I) -> Self {
        if let Ok(mut map) = self.codes.lock() {
            map.insert(name.to_string(), codes.into_iter().collect());
        }
        self
    }

    /// Every run of `name` dies from `signal`, reported as `128 + signal`
    pub fn killed(self, name: &str, signal: i32) -> Self {
        let mut runner = self.script(name, [128 + signal]);
        runner.signaled.insert(name.to_string());
        runner
    }

    /// Failure message reported for `name`
    pub fn message(mut self, name: &str, message: &str) -> Self {
        self.messages.insert(name.to_string(), message.to_string());
        self
    }

    /// Names passed to `run`, in call order
    pub fn invocations(&self) -> Vec<String> {
        self.commands().into_iter().map(|(name, _)| name).collect()
    }

    /// Names and commands passed to `run`, in call order
    pub fn commands(&self) -> Vec<(String, StepCommand)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn next_code(&self, name: &str) -> i32 {
        let Ok(mut map) = self.codes.lock() else {
            return 0;
        };
        match map.get_mut(name) {
            Some(codes) if codes.len() > 1 => codes.pop_front().unwrap_or(0),
            Some(codes) => codes.front().copied().unwrap_or(0),
            None => 0,
        }
    }
}

impl StepRunner for ScriptedRunner {
    fn run(&self, name: &str, command: &StepCommand, _timeout: Option<Duration>) -> StepExecution {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((name.to_string(), command.clone()));
        }
        let code = self.next_code(name);
        let message = if code == 0 {
            None
        } else {
            Some(
                self.messages
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| format!("{} exited with {}", name, code)),
            )
        };
        let mut execution = StepExecution::from_code(code, message);
        if self.signaled.contains(name) {
            execution.signal = Some(code - 128);
        }
        execution
    }
}

/// Package probe with a fixed set of installed dependency ids
#[derive(Debug, Default)]
pub struct FixedPackageProbe {
    installed: HashSet<String>,
}

impl FixedPackageProbe {
    pub fn new<'a, I: IntoIterator<Item = &'a str>>(installed: I) -> Self {
        Self {
            installed: installed.into_iter().map(str::to_string).collect(),
        }
    }
}

impl PackageProbe for FixedPackageProbe {
    fn is_installed(&self, dependency: &Dependency) -> bool {
        self.installed.contains(&dependency.id)
    }
}

/// Fetcher that records requests without touching the network
#[derive(Debug)]
pub struct FakeFetcher {
    succeed: bool,
    fetched: Mutex<Vec<(String, PathBuf)>>,
}

impl FakeFetcher {
    pub fn succeeding() -> Self {
        Self {
            succeed: true,
            fetched: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            succeed: false,
            fetched: Mutex::new(Vec::new()),
        }
    }

    pub fn fetched(&self) -> Vec<(String, PathBuf)> {
        self.fetched.lock().map(|f| f.clone()).unwrap_or_default()
    }
}

impl ArtifactFetcher for FakeFetcher {
    fn fetch(&self, uri: &str, dest: &Path) -> anyhow::Result<u64> {
        if !self.succeed {
            anyhow::bail!("connection refused: {}", uri);
        }
        if let Ok(mut fetched) = self.fetched.lock() {
            fetched.push((uri.to_string(), dest.to_path_buf()));
        }
        Ok(0)
    }
}

/// Store backend that refuses chosen operations and keeps everything else in
/// memory. Refusals surface as `Persistence("access denied")`.
#[derive(Debug, Default)]
pub struct FailingBackend {
    inner: MemoryBackend,
    rejected_statuses: HashSet<String>,
    reject_writes: bool,
    reject_reads: bool,
}

impl FailingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse writes that would set a record's status to `status`
    pub fn reject_status(mut self, status: StepStatus) -> Self {
        self.rejected_statuses.insert(status.to_string());
        self
    }

    /// Refuse every write and removal
    pub fn reject_writes(mut self) -> Self {
        self.reject_writes = true;
        self
    }

    /// Refuse every read
    pub fn reject_reads(mut self) -> Self {
        self.reject_reads = true;
        self
    }

    fn denied() -> ProvisionError {
        ProvisionError::persistence("access denied")
    }

    fn check_write(&self) -> Result<()> {
        if self.reject_writes {
            return Err(Self::denied());
        }
        Ok(())
    }

    fn check_read(&self) -> Result<()> {
        if self.reject_reads {
            return Err(Self::denied());
        }
        Ok(())
    }
}

impl StateBackend for FailingBackend {
    fn set(&self, path: &[&str], field: &str, value: &FieldValue) -> Result<()> {
        self.check_write()?;
        if field == FIELD_STATUS && self.rejected_statuses.contains(&value.to_string()) {
            return Err(Self::denied());
        }
        self.inner.set(path, field, value)
    }

    fn get(&self, path: &[&str], field: &str) -> Result<Option<FieldValue>> {
        self.check_read()?;
        self.inner.get(path, field)
    }

    fn remove(&self, path: &[&str], field: &str) -> Result<()> {
        self.check_write()?;
        self.inner.remove(path, field)
    }

    fn children(&self, path: &[&str]) -> Result<Vec<String>> {
        self.check_read()?;
        self.inner.children(path)
    }

    fn remove_tree(&self, path: &[&str]) -> Result<()> {
        self.check_write()?;
        self.inner.remove_tree(path)
    }

    fn describe(&self) -> String {
        "failing backend".to_string()
    }
}
