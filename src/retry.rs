//! Retry primitives
//!
//! Every call site that needs "try again later" supplies a [`RetryPolicy`]
//! value and runs its operation through [`RetryExecutor::execute`]; nothing
//! else in the crate loops on failures.
//!
//! # Algorithm
//!
//! 1. Attempts are numbered from 1.
//! 2. For a network-gated policy, every attempt after the first is preceded
//!    by one probe. If it fails, wait 5 seconds and probe once more; a second
//!    failure returns [`NetworkUnavailable`] without running the operation.
//! 3. Success returns immediately.
//! 4. A failure with attempts remaining sleeps `delay_seconds`, or
//!    `delay_seconds * 2^(attempt-1)` with exponential backoff, and retries.
//! 5. The last failure is returned unchanged.

use crate::error::{ProvisionError, Result};
use crate::network::{NetworkStabilityChecker, Sleeper};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Wait between the two probes of a failed network gate
pub const NETWORK_GATE_RECHECK_DELAY: Duration = Duration::from_secs(5);

/// Immutable retry configuration.
///
/// Construct with [`RetryPolicy::new`]; deserialization goes through the same
/// validation, so an invalid policy in a config file fails at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRetryPolicy", into = "RawRetryPolicy")]
pub struct RetryPolicy {
    max_attempts: u32,
    delay_seconds: u64,
    exponential_backoff: bool,
    requires_network: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct RawRetryPolicy {
    max_attempts: u32,
    #[serde(default)]
    delay_seconds: u64,
    #[serde(default)]
    exponential_backoff: bool,
    #[serde(default)]
    requires_network: bool,
}

impl TryFrom<RawRetryPolicy> for RetryPolicy {
    type Error = ProvisionError;

    fn try_from(raw: RawRetryPolicy) -> Result<Self> {
        Self::new(
            raw.max_attempts,
            raw.delay_seconds,
            raw.exponential_backoff,
            raw.requires_network,
        )
    }
}

impl From<RetryPolicy> for RawRetryPolicy {
    fn from(policy: RetryPolicy) -> Self {
        Self {
            max_attempts: policy.max_attempts,
            delay_seconds: policy.delay_seconds,
            exponential_backoff: policy.exponential_backoff,
            requires_network: policy.requires_network,
        }
    }
}

impl RetryPolicy {
    /// # Errors
    ///
    /// `Configuration` if `max_attempts` is zero.
    pub fn new(
        max_attempts: u32,
        delay_seconds: u64,
        exponential_backoff: bool,
        requires_network: bool,
    ) -> Result<Self> {
        if max_attempts == 0 {
            return Err(ProvisionError::configuration(
                "Retry max_attempts must be at least 1",
            ));
        }
        Ok(Self {
            max_attempts,
            delay_seconds,
            exponential_backoff,
            requires_network,
        })
    }

    /// A policy that runs the operation exactly once
    pub const fn once() -> Self {
        Self {
            max_attempts: 1,
            delay_seconds: 0,
            exponential_backoff: false,
            requires_network: false,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay_seconds(&self) -> u64 {
        self.delay_seconds
    }

    pub fn exponential_backoff(&self) -> bool {
        self.exponential_backoff
    }

    pub fn requires_network(&self) -> bool {
        self.requires_network
    }

    /// Same policy with network gating switched on or off
    pub fn with_network(mut self, requires_network: bool) -> Self {
        self.requires_network = requires_network;
        self
    }

    /// Delay after failed attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let seconds = if self.exponential_backoff {
            let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
            self.delay_seconds.saturating_mul(factor)
        } else {
            self.delay_seconds
        };
        Duration::from_secs(seconds)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::once()
    }
}

/// The network gate in front of a retry attempt stayed closed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Network unavailable before attempt {attempt}")]
pub struct NetworkUnavailable {
    pub attempt: u32,
}

impl From<NetworkUnavailable> for ProvisionError {
    fn from(err: NetworkUnavailable) -> Self {
        ProvisionError::transient_network(err.to_string())
    }
}

/// Runs operations under a [`RetryPolicy`]
#[derive(Clone)]
pub struct RetryExecutor {
    network: NetworkStabilityChecker,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("network", &self.network)
            .finish_non_exhaustive()
    }
}

impl RetryExecutor {
    /// Executor that shares the checker's sleeper
    pub fn new(network: NetworkStabilityChecker) -> Self {
        let sleeper = network.sleeper().clone();
        Self { network, sleeper }
    }

    pub fn network(&self) -> &NetworkStabilityChecker {
        &self.network
    }

    /// Run `operation` until it succeeds or the policy is exhausted.
    ///
    /// `operation` receives the 1-based attempt number. The error returned
    /// after the last attempt is the operation's own error, untouched.
    pub fn execute<T, E, F>(&self, policy: &RetryPolicy, mut operation: F) -> std::result::Result<T, E>
    where
        F: FnMut(u32) -> std::result::Result<T, E>,
        E: From<NetworkUnavailable> + std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            if policy.requires_network && attempt > 1 && !self.network_gate_open() {
                tracing::warn!("Network unavailable, abandoning attempt {}", attempt);
                return Err(NetworkUnavailable { attempt }.into());
            }

            match operation(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if attempt < policy.max_attempts => {
                    let delay = policy.delay_for(attempt);
                    tracing::warn!(
                        "Attempt {}/{} failed: {} (retrying in {}s)",
                        attempt,
                        policy.max_attempts,
                        err,
                        delay.as_secs()
                    );
                    self.sleeper.sleep(delay);
                    attempt += 1;
                }
                Err(err) => {
                    if policy.max_attempts > 1 {
                        tracing::error!("All {} attempts failed: {}", policy.max_attempts, err);
                    }
                    return Err(err);
                }
            }
        }
    }

    fn network_gate_open(&self) -> bool {
        let state = self.network.state();
        if state.is_online() {
            return true;
        }
        tracing::debug!(
            "Network {}, checking again in {}s",
            state,
            NETWORK_GATE_RECHECK_DELAY.as_secs()
        );
        self.sleeper.sleep(NETWORK_GATE_RECHECK_DELAY);
        self.network.state().is_online()
    }
}
