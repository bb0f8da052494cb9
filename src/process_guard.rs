//! Lifecycle management for step child processes
//!
//! Every step runs as a child process in its own process group. This module
//! guarantees that no step outlives the orchestrator and that a hung step can
//! be taken down together with everything it spawned.
//!
//! # Mechanics
//! - Children call `setpgid(0, 0)` before exec and request `SIGTERM` on parent
//!   death (`PR_SET_PDEATHSIG`)
//! - Running children are tracked in a process-wide registry
//! - On orchestrator exit (Drop, SIGTERM, SIGINT, SIGHUP) every tracked group
//!   gets SIGTERM, then SIGKILL after a grace period
//! - A timed-out step gets the same treatment for its group only

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

/// Grace period between SIGTERM and SIGKILL when the orchestrator shuts down
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Grace period used by the signal thread
pub const SIGNAL_GRACE: Duration = Duration::from_secs(3);

static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();

/// Process groups of steps that are currently running
#[derive(Debug, Default)]
pub struct ChildRegistry {
    pids: HashSet<u32>,
    /// Set once shutdown cleanup started
    cleanup_initiated: bool,
}

impl ChildRegistry {
    /// Process-wide registry shared by the runner and the signal thread
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    pub fn register(&mut self, pid: u32) {
        self.pids.insert(pid);
        tracing::debug!("Tracking step process group {}", pid);
    }

    pub fn unregister(&mut self, pid: u32) {
        self.pids.remove(&pid);
        tracing::debug!("Released step process group {}", pid);
    }

    pub fn count(&self) -> usize {
        self.pids.len()
    }

    /// Terminate every tracked group: SIGTERM, wait up to `grace_period`,
    /// then SIGKILL whatever is left. Runs at most once per registry.
    pub fn terminate_all(&mut self, grace_period: Duration) {
        if self.cleanup_initiated {
            tracing::debug!("Child cleanup already ran");
            return;
        }
        self.cleanup_initiated = true;

        if self.pids.is_empty() {
            return;
        }

        let pids: Vec<u32> = self.pids.drain().collect();
        tracing::info!("Terminating {} running step(s)", pids.len());

        for &pid in &pids {
            signal_group_or_process(pid, Signal::SIGTERM);
        }

        if wait_until_dead(&pids, grace_period) {
            tracing::info!("All step processes exited after SIGTERM");
            return;
        }

        for &pid in &pids {
            if is_process_alive(pid) {
                tracing::warn!("Step process group {} ignored SIGTERM, sending SIGKILL", pid);
                signal_group_or_process(pid, Signal::SIGKILL);
            }
        }
        tracing::info!("Step process cleanup complete");
    }
}

/// Take down one step's process group.
///
/// Sends SIGTERM to the group, waits up to `grace_period` for the leader to
/// exit, then sends SIGKILL. Returns true if SIGKILL was needed. The caller
/// still has to reap the leader.
pub fn terminate_group(pid: u32, grace_period: Duration) -> bool {
    signal_group_or_process(pid, Signal::SIGTERM);
    if wait_until_dead(&[pid], grace_period) {
        return false;
    }
    tracing::warn!("Process group {} survived SIGTERM, sending SIGKILL", pid);
    signal_group_or_process(pid, Signal::SIGKILL);
    true
}

/// SIGKILL whatever is still running in a finished step's process group.
///
/// Background processes a step leaves behind would otherwise hold its output
/// pipes open. Returns true if the group still had members.
pub fn kill_leftover_group(pgid: u32) -> bool {
    match send_signal_to_group(pgid, Signal::SIGKILL) {
        Ok(()) => {
            tracing::warn!("Step process group {} outlived its leader, killed it", pgid);
            true
        }
        Err(_) => false,
    }
}

fn signal_group_or_process(pid: u32, sig: Signal) {
    if let Err(e) = send_signal_to_group(pid, sig) {
        tracing::debug!("Signalling group {} with {} failed: {}", pid, sig, e);
        if let Err(e) = send_signal(pid, sig) {
            tracing::debug!("Signalling PID {} with {} failed: {}", pid, sig, e);
        }
    }
}

fn wait_until_dead(pids: &[u32], grace_period: Duration) -> bool {
    let start = Instant::now();
    loop {
        if pids.iter().all(|&pid| !is_process_alive(pid)) {
            return true;
        }
        if start.elapsed() >= grace_period {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn send_signal(pid: u32, sig: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(pid as i32), sig)
}

/// Negative PID addresses the whole group, so grandchildren are reached too
fn send_signal_to_group(pgid: u32, sig: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(-(pgid as i32)), sig)
}

/// True while the process exists and is not a zombie
fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }

    // Field 3 of /proc/<pid>/stat is the state letter
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        // comm may contain spaces; the state follows the closing paren
        if let Some(rest) = stat.rsplit_once(')').map(|(_, rest)| rest) {
            if let Some(state) = rest.split_whitespace().next() {
                return !matches!(state, "Z" | "X");
            }
        }
    }

    true
}

/// Terminates every registered step when dropped.
///
/// `main` holds one for the lifetime of the run so early returns and panics
/// unwinding through `main` still clean up.
pub struct ProcessGuard {
    registry: Arc<Mutex<ChildRegistry>>,
}

impl ProcessGuard {
    pub fn new() -> Self {
        Self {
            registry: ChildRegistry::global(),
        }
    }

    pub fn child_count(&self) -> usize {
        self.registry.lock().map(|r| r.count()).unwrap_or(0)
    }
}

impl Default for ProcessGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.terminate_all(SHUTDOWN_GRACE);
        }
    }
}

/// Install SIGINT/SIGTERM/SIGHUP handling.
///
/// A dedicated thread waits for the signal, terminates all registered step
/// groups, and exits with `128 + signo`. Call once at startup.
pub fn init_signal_handlers() -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    std::thread::Builder::new()
        .name("signal-watch".to_string())
        .spawn(move || {
            if let Some(sig) = signals.forever().next() {
                let name = match sig {
                    SIGINT => "SIGINT",
                    SIGTERM => "SIGTERM",
                    SIGHUP => "SIGHUP",
                    _ => "signal",
                };
                tracing::warn!("Received {}, stopping running steps", name);

                if let Ok(mut registry) = ChildRegistry::global().lock() {
                    registry.terminate_all(SIGNAL_GRACE);
                }
                std::process::exit(128 + sig);
            }
        })?;

    Ok(())
}

/// Extension for `std::process::Command`: run the child as leader of a new
/// process group that dies with the orchestrator
pub trait CommandProcessGroup {
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: the closure only calls async-signal-safe setpgid and prctl
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;

                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn reaped_within(child: &mut std::process::Child, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if let Ok(Some(_)) = child.try_wait() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_registry_register_unregister() {
        let mut registry = ChildRegistry::default();
        registry.register(1234);
        registry.register(5678);
        assert_eq!(registry.count(), 2);
        registry.unregister(1234);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_terminate_all_kills_group() {
        let mut child = Command::new("sh")
            .args(["-c", "sleep 60"])
            .in_new_process_group()
            .spawn()
            .expect("Failed to spawn sh");

        let mut registry = ChildRegistry::default();
        registry.register(child.id());
        registry.terminate_all(Duration::from_millis(500));

        assert!(reaped_within(&mut child, Duration::from_secs(3)));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_terminate_all_runs_once() {
        let mut registry = ChildRegistry::default();
        registry.terminate_all(Duration::from_millis(10));
        assert!(registry.cleanup_initiated);

        registry.register(999_999);
        registry.terminate_all(Duration::from_millis(10));
        // Second call is a no-op, the fake PID stays tracked
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_terminate_group_escalates_to_sigkill() {
        let mut child = Command::new("sh")
            .args(["-c", "trap '' TERM; while :; do sleep 1; done"])
            .in_new_process_group()
            .spawn()
            .expect("Failed to spawn sh");
        std::thread::sleep(Duration::from_millis(100));

        let killed = terminate_group(child.id(), Duration::from_millis(300));
        assert!(killed);
        assert!(reaped_within(&mut child, Duration::from_secs(3)));
    }

    #[test]
    fn test_terminate_group_graceful_exit() {
        let mut child = Command::new("sh")
            .args(["-c", "sleep 60"])
            .in_new_process_group()
            .spawn()
            .expect("Failed to spawn sh");

        let pid = child.id();
        // Reap concurrently so the zombie does not count as alive
        let handle = std::thread::spawn(move || child.wait());
        let killed = terminate_group(pid, Duration::from_secs(3));
        assert!(!killed);
        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn test_is_process_alive_nonexistent() {
        assert!(!is_process_alive(999_999));
    }
}
