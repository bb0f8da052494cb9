//! Typed external command contracts
//!
//! Steps, detection probes, package-source invocations and fallback installers
//! are all external programs. `StepCommand` is the one description of such a
//! program; the runner turns it into a `std::process::Command`.
//!
//! # Design Goals
//!
//! 1. **No shell by default**: `program` and `args` are passed to `exec`
//!    verbatim. A step that wants shell syntax names the shell explicitly.
//! 2. **Single Source of Truth**: the config file entry IS the contract.
//! 3. **Placeholders**: `{artifact}` and friends are substituted explicitly by
//!    the caller, never by a shell.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Command;

/// External program invocation
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StepCommand {
    /// Executable name or path
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

impl StepCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// `sh -c <script>`
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }

    /// Copy with every `{name}` in program and args replaced by `value`
    pub fn substitute(&self, name: &str, value: &str) -> Self {
        let token = format!("{{{}}}", name);
        let mut out = self.clone();
        out.program = out.program.replace(&token, value);
        for arg in &mut out.args {
            *arg = arg.replace(&token, value);
        }
        out
    }

    /// Build the process description; stdio is left to the caller
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

impl fmt::Display for StepCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.contains(char::is_whitespace) {
                write!(f, " {:?}", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}
