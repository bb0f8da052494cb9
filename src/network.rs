//! Network stability detection
//!
//! Probes connectivity with a single lightweight request and decides whether
//! the network is stable enough to start network-dependent work.
//!
//! # Design
//!
//! - **One request per probe**: `ConnectivityProbe::probe()` is the only code
//!   path that touches the network
//! - **Blocking waits**: all delays go through a `Sleeper` on the single
//!   control thread, so tests can observe them without waiting
//! - **Fail Fast**: `max_retries == 0` is a configuration error, not `false`

use crate::error::{ProvisionError, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default endpoint for the reachability probe
pub const DEFAULT_PROBE_URL: &str = "https://www.msftconnecttest.com/connecttest.txt";

/// Default timeout for a single probe request
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive successes required after the first one in continuous mode
pub const CONFIRMATION_PROBES: u32 = 3;

/// Spacing between confirmation probes
pub const CONFIRMATION_INTERVAL: Duration = Duration::from_secs(2);

/// Network connectivity state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    /// Probe endpoint answered
    Online,
    /// Probe failed or timed out
    Offline,
}

impl NetworkState {
    /// Returns true if network connectivity is available.
    pub fn is_online(self) -> bool {
        matches!(self, Self::Online)
    }
}

impl From<bool> for NetworkState {
    fn from(online: bool) -> Self {
        if online { Self::Online } else { Self::Offline }
    }
}

impl fmt::Display for NetworkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => write!(f, "Online"),
            Self::Offline => write!(f, "Offline"),
        }
    }
}

/// A single reachability check
pub trait ConnectivityProbe: Send + Sync {
    /// Perform one probe. Must not panic; any failure is `false`.
    fn probe(&self) -> bool;
}

/// Blocking wait used by the retry primitives
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// `Sleeper` backed by `std::thread::sleep`
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Probe that issues an HTTP `HEAD` against a known-stable endpoint.
///
/// Any HTTP response counts as reachable: a captive portal or a 404 still
/// proves the route works. DNS failures, refused connections and timeouts
/// count as unreachable.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::blocking::Client,
    url: String,
}

impl HttpProbe {
    /// Build a probe for `url` with a per-request `timeout`.
    ///
    /// # Errors
    ///
    /// `Configuration` if the URL is not http(s) or the client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let url = url.into();
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ProvisionError::configuration(format!(
                "Probe URL must start with http:// or https://, got '{}'",
                url
            )));
        }

        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| {
                ProvisionError::configuration(format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self { client, url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl ConnectivityProbe for HttpProbe {
    fn probe(&self) -> bool {
        match self.client.head(&self.url).send() {
            Ok(response) => {
                tracing::debug!("Probe {} answered {}", self.url, response.status());
                true
            }
            Err(e) => {
                tracing::debug!("Probe {} failed: {}", self.url, e);
                false
            }
        }
    }
}

/// Decides whether the network is reachable and stable.
///
/// Cheap to clone; the probe and sleeper are shared.
#[derive(Clone)]
pub struct NetworkStabilityChecker {
    probe: Arc<dyn ConnectivityProbe>,
    sleeper: Arc<dyn Sleeper>,
}

impl fmt::Debug for NetworkStabilityChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkStabilityChecker").finish_non_exhaustive()
    }
}

impl NetworkStabilityChecker {
    pub fn new(probe: Arc<dyn ConnectivityProbe>, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { probe, sleeper }
    }

    /// One reachability check
    pub fn probe(&self) -> bool {
        self.probe.probe()
    }

    /// Current state as reported by a single probe
    pub fn state(&self) -> NetworkState {
        NetworkState::from(self.probe())
    }

    pub(crate) fn sleeper(&self) -> &Arc<dyn Sleeper> {
        &self.sleeper
    }

    /// Wait until the network is reachable.
    ///
    /// Makes up to `max_retries` attempts, sleeping `delay_seconds` between
    /// them. With `continuous_check`, an attempt only succeeds if the first
    /// successful probe is followed by [`CONFIRMATION_PROBES`] more, each
    /// [`CONFIRMATION_INTERVAL`] apart; a failure in that window makes the
    /// attempt unstable and the outer loop continues.
    ///
    /// # Errors
    ///
    /// `Configuration` if `max_retries` is zero.
    pub fn wait_for_stability(
        &self,
        max_retries: u32,
        delay_seconds: u64,
        continuous_check: bool,
    ) -> Result<bool> {
        if max_retries == 0 {
            return Err(ProvisionError::configuration(
                "Network max_retries must be at least 1",
            ));
        }

        let delay = Duration::from_secs(delay_seconds);

        for attempt in 1..=max_retries {
            if self.probe() {
                if !continuous_check {
                    tracing::info!("Network reachable (attempt {}/{})", attempt, max_retries);
                    return Ok(true);
                }
                if self.confirm_stability() {
                    tracing::info!(
                        "Network stable after {} consecutive probes (attempt {}/{})",
                        CONFIRMATION_PROBES + 1,
                        attempt,
                        max_retries
                    );
                    return Ok(true);
                }
                tracing::warn!(
                    "Network unstable during confirmation (attempt {}/{})",
                    attempt,
                    max_retries
                );
            } else {
                tracing::warn!("Network unreachable (attempt {}/{})", attempt, max_retries);
            }

            if attempt < max_retries {
                self.sleeper.sleep(delay);
            }
        }

        tracing::error!("Network not stable after {} attempts", max_retries);
        Ok(false)
    }

    fn confirm_stability(&self) -> bool {
        for check in 1..=CONFIRMATION_PROBES {
            self.sleeper.sleep(CONFIRMATION_INTERVAL);
            if !self.probe() {
                tracing::debug!("Confirmation probe {}/{} failed", check, CONFIRMATION_PROBES);
                return false;
            }
        }
        true
    }
}
