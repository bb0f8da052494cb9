//! Isolated Step Execution
//!
//! This module is the ONLY place that spawns step processes. Every external
//! program the orchestrator or the dependency installer runs goes through a
//! [`StepRunner`], so that:
//!
//! - each step runs in its own process group that dies with the orchestrator
//! - the PID is registered for cleanup while the step runs
//! - a crash or hang in the step becomes an exit code, never a panic
//! - background processes a step leaves behind are killed when it exits
//!
//! # Exit code mapping
//!
//! | Outcome | `exit_code` |
//! |---|---|
//! | normal exit | the process exit code |
//! | killed by signal N | `128 + N`, with [`StepExecution::signal`] set |
//! | timed out | [`TIMEOUT_EXIT_CODE`] |
//! | could not spawn | [`SPAWN_FAILURE_EXIT_CODE`] |

use crate::command::StepCommand;
use crate::exit_codes::{self, ExitCodeInfo, SPAWN_FAILURE_EXIT_CODE, TIMEOUT_EXIT_CODE};
use crate::process_guard::{kill_leftover_group, terminate_group, ChildRegistry, CommandProcessGroup};
use crate::types::ToolKind;
use std::io::Read;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Time a timed-out step gets between SIGTERM and SIGKILL
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// Interval between exit checks while a step runs
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Outcome of one step invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepExecution {
    pub exit_code: i32,
    /// Short failure description for the status record
    pub message: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    /// Signal that ended the process; never set for a timeout
    pub signal: Option<i32>,
    pub duration: Duration,
}

impl StepExecution {
    /// Exit code 0
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    /// Execution result with only an exit code and message
    pub fn from_code(exit_code: i32, message: Option<String>) -> Self {
        Self {
            exit_code,
            message,
            stdout: String::new(),
            stderr: String::new(),
            timed_out: false,
            signal: None,
            duration: Duration::ZERO,
        }
    }

    /// Classify the exit code against the step's table.
    ///
    /// A signal death is Fatal before any table is consulted: `128 + N`
    /// is not a code the tool itself returned.
    pub fn classify(&self, kind: Option<ToolKind>) -> ExitCodeInfo {
        match self.signal {
            Some(_) => exit_codes::killed_by_signal(self.exit_code),
            None => exit_codes::classify_step_exit(self.exit_code, kind),
        }
    }

    /// Table that describes this execution's exit code
    pub fn tool_kind(&self, kind: Option<ToolKind>) -> Option<ToolKind> {
        kind.filter(|_| self.signal.is_none())
    }
}

/// Runs one external command to completion
pub trait StepRunner: Send + Sync {
    /// Run `command` on behalf of `name`.
    ///
    /// Never fails: spawn errors, crashes and timeouts are all reported
    /// through [`StepExecution::exit_code`].
    fn run(&self, name: &str, command: &StepCommand, timeout: Option<Duration>) -> StepExecution;
}

/// [`StepRunner`] backed by real child processes
#[derive(Debug, Clone)]
pub struct ProcessStepRunner {
    kill_grace: Duration,
    poll_interval: Duration,
}

impl Default for ProcessStepRunner {
    fn default() -> Self {
        Self {
            kill_grace: DEFAULT_KILL_GRACE,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl ProcessStepRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the SIGTERM to SIGKILL grace period
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    fn wait(
        &self,
        child: &mut std::process::Child,
        timeout: Option<Duration>,
        start: Instant,
    ) -> (Option<ExitStatus>, bool) {
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return (Some(status), false),
                Ok(None) => {
                    let expired = timeout.is_some_and(|limit| start.elapsed() >= limit);
                    if expired {
                        terminate_group(child.id(), self.kill_grace);
                        return (child.wait().ok(), true);
                    }
                    std::thread::sleep(self.poll_interval);
                }
                Err(e) => {
                    tracing::error!("Lost track of PID {}: {}", child.id(), e);
                    terminate_group(child.id(), self.kill_grace);
                    return (child.wait().ok(), false);
                }
            }
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

fn last_line(text: &str) -> Option<String> {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

/// Exit code for a finished process: its code, or 128 + signal
fn status_code(status: &ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(sig)) => 128 + sig,
        (None, None) => SPAWN_FAILURE_EXIT_CODE,
    }
}

impl StepRunner for ProcessStepRunner {
    fn run(&self, name: &str, command: &StepCommand, timeout: Option<Duration>) -> StepExecution {
        tracing::info!("Running {}: {}", name, command);

        let mut cmd = command.to_command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .in_new_process_group();

        let start = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!("{}: failed to start '{}': {}", name, command.program, e);
                let mut execution = StepExecution::from_code(
                    SPAWN_FAILURE_EXIT_CODE,
                    Some(format!("Failed to start '{}': {}", command.program, e)),
                );
                execution.duration = start.elapsed();
                return execution;
            }
        };

        let pid = child.id();
        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.register(pid);
        }

        let stdout_reader = drain(child.stdout.take());
        let stderr_reader = drain(child.stderr.take());

        let (status, timed_out) = self.wait(&mut child, timeout, start);
        kill_leftover_group(pid);

        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.unregister(pid);
        }

        let stdout = collect(stdout_reader);
        let stderr = collect(stderr_reader);
        let duration = start.elapsed();

        let signal = status
            .as_ref()
            .filter(|_| !timed_out)
            .and_then(|s| s.signal());

        let (exit_code, message) = if timed_out {
            let limit = timeout.unwrap_or_default().as_secs();
            (TIMEOUT_EXIT_CODE, Some(format!("Timed out after {}s", limit)))
        } else {
            match status {
                Some(status) => {
                    let code = status_code(&status);
                    let message = if code == 0 {
                        None
                    } else {
                        last_line(&stderr).or_else(|| last_line(&stdout)).or_else(|| {
                            status.signal().map(|sig| format!("Terminated by signal {}", sig))
                        })
                    };
                    (code, message)
                }
                None => (
                    SPAWN_FAILURE_EXIT_CODE,
                    Some("Exit status unavailable".to_string()),
                ),
            }
        };

        if exit_code == 0 {
            tracing::info!("{} finished in {:.1}s", name, duration.as_secs_f64());
        } else {
            tracing::warn!(
                "{} exited with {} after {:.1}s",
                name,
                exit_code,
                duration.as_secs_f64()
            );
        }

        StepExecution {
            exit_code,
            message,
            stdout,
            stderr,
            timed_out,
            signal,
            duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> ProcessStepRunner {
        ProcessStepRunner::new().with_kill_grace(Duration::from_millis(200))
    }

    #[test]
    fn test_success_captures_stdout() {
        let exec = runner().run("echo", &StepCommand::shell("echo hello"), None);
        assert!(exec.succeeded());
        assert_eq!(exec.stdout.trim(), "hello");
        assert!(exec.message.is_none());
    }

    #[test]
    fn test_failure_message_is_last_stderr_line() {
        let cmd = StepCommand::shell("echo first >&2; echo 'disk full' >&2; exit 7");
        let exec = runner().run("fail", &cmd, None);
        assert_eq!(exec.exit_code, 7);
        assert_eq!(exec.message.as_deref(), Some("disk full"));
    }

    #[test]
    fn test_failure_message_falls_back_to_stdout() {
        let exec = runner().run("fail", &StepCommand::shell("echo 'only stdout'; exit 2"), None);
        assert_eq!(exec.message.as_deref(), Some("only stdout"));
    }

    #[test]
    fn test_spawn_failure() {
        let exec = runner().run("missing", &StepCommand::new("/nonexistent/tool"), None);
        assert_eq!(exec.exit_code, SPAWN_FAILURE_EXIT_CODE);
        assert!(exec.message.unwrap().contains("/nonexistent/tool"));
    }

    #[test]
    fn test_signal_death_maps_to_128_plus_signo() {
        let exec = runner().run("crash", &StepCommand::shell("kill -KILL $$"), None);
        assert_eq!(exec.exit_code, 128 + 9);
        assert_eq!(exec.signal, Some(9));
        assert!(!exec.timed_out);
    }

    #[test]
    fn test_signal_death_ignores_the_step_table() {
        let exec = runner().run("crash", &StepCommand::shell("kill -KILL $$"), None);
        let info = exec.classify(Some(ToolKind::InstallerPackage));
        assert_eq!(info.name, "KILLED_BY_SIGNAL");
        assert_eq!(info.category, exit_codes::Category::Fatal);
        assert_eq!(exec.tool_kind(Some(ToolKind::InstallerPackage)), None);
    }

    #[test]
    fn test_exit_137_without_signal_uses_the_table() {
        let exec = runner().run("exit", &StepCommand::shell("exit 137"), None);
        assert_eq!(exec.exit_code, 137);
        assert_eq!(exec.signal, None);
        assert_eq!(
            exec.classify(Some(ToolKind::InstallerPackage)).category,
            exit_codes::Category::Unknown
        );
    }

    #[test]
    fn test_timeout_kills_process_group() {
        let cmd = StepCommand::shell("sleep 30 & sleep 30; wait");
        let exec = runner().run("hang", &cmd, Some(Duration::from_millis(300)));
        assert!(exec.timed_out);
        assert_eq!(exec.exit_code, TIMEOUT_EXIT_CODE);
        assert_eq!(exec.signal, None);
        assert!(exec.duration < Duration::from_secs(10));
    }

    #[test]
    fn test_background_leftovers_do_not_block() {
        let cmd = StepCommand::shell("sleep 30 & echo started");
        let exec = runner().run("leaky", &cmd, None);
        assert!(exec.succeeded());
        assert_eq!(exec.stdout.trim(), "started");
        assert!(exec.duration < Duration::from_secs(10));
    }

    #[test]
    fn test_env_is_passed() {
        let cmd = StepCommand::shell("test \"$STEP_FLAG\" = on").env("STEP_FLAG", "on");
        assert!(runner().run("env", &cmd, None).succeeded());
    }

    #[test]
    fn test_last_line() {
        assert_eq!(last_line("a\nb\n\n  \n"), Some("b".to_string()));
        assert_eq!(last_line("  \n"), None);
    }
}
