//! Durable per-step status records
//!
//! `StatusStore` is the single writer of the persisted status tree:
//!
//! ```text
//! Steps/<StepName>/{Status, Timestamp, ExitCode, ErrorMessage, Version}
//! AppRecord/<AppName> = <version>
//! ```
//!
//! A record always reflects the most recent `write` for that step: optional
//! fields that were not supplied are removed, and `Status` is written last.

pub mod backend;
mod export;

pub use backend::{FieldValue, FsBackend, MemoryBackend, StateBackend};
pub use export::{csv_escape, write_csv, CSV_HEADER};

use crate::error::{ProvisionError, Result};
use crate::types::StepStatus;
use std::collections::HashSet;
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

/// Subtree holding one node per step
pub const STEPS_KEY: &str = "Steps";
/// Subtree holding installed application versions
pub const APP_RECORD_KEY: &str = "AppRecord";

pub const FIELD_STATUS: &str = "Status";
pub const FIELD_TIMESTAMP: &str = "Timestamp";
pub const FIELD_EXIT_CODE: &str = "ExitCode";
pub const FIELD_ERROR_MESSAGE: &str = "ErrorMessage";
pub const FIELD_VERSION: &str = "Version";

/// Local wall-clock format of `Timestamp`
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Persisted outcome of one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub step_name: String,
    pub status: StepStatus,
    pub timestamp: String,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub version: Option<String>,
}

impl fmt::Display for StepRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] {}", self.step_name, self.status, self.timestamp)?;
        if let Some(code) = self.exit_code {
            write!(f, " exit={}", code)?;
        }
        if let Some(msg) = &self.error_message {
            write!(f, " {}", msg)?;
        }
        Ok(())
    }
}

/// Optional detail fields of a write
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordDetails {
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub version: Option<String>,
}

impl RecordDetails {
    pub fn exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn version(mut self, version: Option<String>) -> Self {
        self.version = version;
        self
    }
}

/// Current local time in [`TIMESTAMP_FORMAT`]
pub fn now_timestamp() -> String {
    chrono::Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Reads and writes step records through a [`StateBackend`]
pub struct StatusStore {
    backend: Box<dyn StateBackend>,
}

impl fmt::Debug for StatusStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusStore")
            .field("backend", &self.backend.describe())
            .finish()
    }
}

impl StatusStore {
    pub fn new(backend: Box<dyn StateBackend>) -> Self {
        Self { backend }
    }

    /// Store on the filesystem under `root`
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        Ok(Self::new(Box::new(FsBackend::open(root)?)))
    }

    /// Volatile store
    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryBackend::new()))
    }

    pub fn location(&self) -> String {
        self.backend.describe()
    }

    /// Persist the latest outcome of `step`.
    ///
    /// Detail fields not present in `details` are removed so the record
    /// never mixes the new status with details of an earlier write.
    pub fn write(&self, step: &str, status: StepStatus, details: &RecordDetails) -> Result<()> {
        backend::validate_component(step)?;
        let path = [STEPS_KEY, step];

        self.backend
            .set(&path, FIELD_TIMESTAMP, &FieldValue::from(now_timestamp()))?;

        match details.exit_code {
            Some(code) => self.backend.set(&path, FIELD_EXIT_CODE, &code.into())?,
            None => self.backend.remove(&path, FIELD_EXIT_CODE)?,
        }
        match &details.error_message {
            Some(msg) => self.backend.set(&path, FIELD_ERROR_MESSAGE, &msg.as_str().into())?,
            None => self.backend.remove(&path, FIELD_ERROR_MESSAGE)?,
        }
        match &details.version {
            Some(version) => self.backend.set(&path, FIELD_VERSION, &version.as_str().into())?,
            None => self.backend.remove(&path, FIELD_VERSION)?,
        }

        self.backend
            .set(&path, FIELD_STATUS, &FieldValue::from(status.to_string()))?;

        tracing::debug!("Recorded {} = {}", step, status);
        Ok(())
    }

    /// Latest record for `step`, or `None` if it never ran
    pub fn read(&self, step: &str) -> Result<Option<StepRecord>> {
        backend::validate_component(step)?;
        let path = [STEPS_KEY, step];

        let Some(raw_status) = self.backend.get(&path, FIELD_STATUS)? else {
            return Ok(None);
        };
        let raw_status = raw_status.into_string();
        let status = StepStatus::from_str(raw_status.trim()).map_err(|_| {
            ProvisionError::persistence(format!(
                "Step '{}' has unrecognised status '{}'",
                step, raw_status
            ))
        })?;

        let timestamp = self
            .backend
            .get(&path, FIELD_TIMESTAMP)?
            .map(FieldValue::into_string)
            .unwrap_or_default();
        let exit_code = self
            .backend
            .get(&path, FIELD_EXIT_CODE)?
            .and_then(|v| v.as_i32());
        let error_message = self
            .backend
            .get(&path, FIELD_ERROR_MESSAGE)?
            .map(FieldValue::into_string);
        let version = self
            .backend
            .get(&path, FIELD_VERSION)?
            .map(FieldValue::into_string);

        Ok(Some(StepRecord {
            step_name: step.to_string(),
            status,
            timestamp,
            exit_code,
            error_message,
            version,
        }))
    }

    /// Names of every step with a record, sorted
    pub fn step_names(&self) -> Result<Vec<String>> {
        self.backend.children(&[STEPS_KEY])
    }

    /// Every record: those named in `order` first, in that order, then the
    /// rest sorted by name.
    pub fn read_all(&self, order: &[String]) -> Result<Vec<StepRecord>> {
        let stored = self.step_names()?;
        let stored_set: HashSet<&str> = stored.iter().map(String::as_str).collect();
        let ordered: HashSet<&str> = order.iter().map(String::as_str).collect();

        let names = order
            .iter()
            .filter(|name| stored_set.contains(name.as_str()))
            .chain(stored.iter().filter(|name| !ordered.contains(name.as_str())));

        let mut records = Vec::new();
        let mut seen = HashSet::new();
        for name in names {
            if !seen.insert(name.as_str()) {
                continue;
            }
            if let Some(record) = self.read(name)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Remove every step record; returns how many were removed.
    ///
    /// The AppRecord ledger is kept.
    pub fn clear(&self) -> Result<usize> {
        let count = self.step_names()?.len();
        self.backend.remove_tree(&[STEPS_KEY])?;
        tracing::info!("Cleared {} step record(s) from {}", count, self.location());
        Ok(count)
    }

    /// Record that `app` is installed at `version`.
    ///
    /// Returns `false` without writing when the stored version already
    /// matches.
    pub fn record_app(&self, app: &str, version: &str) -> Result<bool> {
        if self.app_version(app)?.as_deref() == Some(version) {
            tracing::debug!("AppRecord {} already at {}", app, version);
            return Ok(false);
        }
        self.backend
            .set(&[APP_RECORD_KEY], app, &FieldValue::from(version))?;
        tracing::info!("AppRecord {} = {}", app, version);
        Ok(true)
    }

    pub fn app_version(&self, app: &str) -> Result<Option<String>> {
        Ok(self
            .backend
            .get(&[APP_RECORD_KEY], app)?
            .map(FieldValue::into_string))
    }

    /// Write every record as CSV, pipeline order first
    pub fn export_csv<W: Write>(&self, order: &[String], writer: W) -> Result<usize> {
        let records = self.read_all(order)?;
        write_csv(&records, writer)?;
        Ok(records.len())
    }
}
