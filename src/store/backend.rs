//! Persistence backends for the status tree
//!
//! A backend stores typed field values under a hierarchical path, like a
//! registry key or a directory tree. [`StatusStore`](super::StatusStore) is
//! the only consumer; it decides which paths and fields exist.
//!
//! # Durability
//!
//! `FsBackend` makes every `set` durable before returning: the value is
//! written to a temp file, fsynced, renamed over the target, and the parent
//! directory is fsynced. A reader therefore sees either the old or the new
//! value of a field, never a torn one.

use crate::error::{ProvisionError, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Typed value stored in a field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Str(String),
    Int(i32),
}

impl FieldValue {
    /// Integer view; textual values are parsed
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Str(s) => s.trim().parse().ok(),
        }
    }

    pub fn into_string(self) -> String {
        match self {
            Self::Str(s) => s,
            Self::Int(v) => v.to_string(),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "{}", s),
            Self::Int(v) => write!(f, "{}", v),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

/// Typed hierarchical key/value storage
pub trait StateBackend: Send + Sync {
    /// Write a field, durably, before returning
    fn set(&self, path: &[&str], field: &str, value: &FieldValue) -> Result<()>;

    /// Read a field; `None` if the field or its path does not exist
    fn get(&self, path: &[&str], field: &str) -> Result<Option<FieldValue>>;

    /// Remove a field; missing fields are not an error
    fn remove(&self, path: &[&str], field: &str) -> Result<()>;

    /// Names of direct children (sub-paths and fields), sorted
    fn children(&self, path: &[&str]) -> Result<Vec<String>>;

    /// Remove a path and everything below it; missing paths are not an error
    fn remove_tree(&self, path: &[&str]) -> Result<()>;

    /// Human-readable location for logs
    fn describe(&self) -> String;
}

/// Returns an error unless `name` is usable as one path component
pub fn validate_component(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(ProvisionError::configuration("Name must not be empty"));
    }
    if name == "." || name == ".." || name.starts_with('.') {
        return Err(ProvisionError::configuration(format!(
            "Name '{}' must not start with '.'",
            name
        )));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(ProvisionError::configuration(format!(
            "Name '{}' must not contain '/', '\\' or NUL",
            name
        )));
    }
    Ok(())
}

// ============================================================================
// Filesystem backend
// ============================================================================

/// Status tree mapped onto directories, one file per field
#[derive(Debug, Clone)]
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    /// Open (creating if needed) a tree rooted at `root`.
    ///
    /// # Errors
    ///
    /// `Persistence` if the directory cannot be created or written, so callers
    /// can fall back before any step runs.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| {
            ProvisionError::persistence(format!("Cannot create status root {:?}: {}", root, e))
        })?;

        // Prove the medium is writable now rather than on the first step
        let probe = root.join(".write-probe");
        fs::write(&probe, b"ok")
            .and_then(|_| fs::remove_file(&probe))
            .map_err(|e| {
                ProvisionError::persistence(format!("Status root {:?} is not writable: {}", root, e))
            })?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self, path: &[&str]) -> Result<PathBuf> {
        let mut dir = self.root.clone();
        for component in path {
            validate_component(component)?;
            dir.push(component);
        }
        Ok(dir)
    }

    fn field_path(&self, path: &[&str], field: &str) -> Result<PathBuf> {
        validate_component(field)?;
        Ok(self.dir(path)?.join(field))
    }
}

fn persistence_err(action: &str, target: &Path, err: std::io::Error) -> ProvisionError {
    ProvisionError::persistence(format!("Failed to {} {:?}: {}", action, target, err))
}

fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| persistence_err("sync directory", dir, e))
}

impl StateBackend for FsBackend {
    fn set(&self, path: &[&str], field: &str, value: &FieldValue) -> Result<()> {
        let target = self.field_path(path, field)?;
        let dir = self.dir(path)?;
        fs::create_dir_all(&dir).map_err(|e| persistence_err("create", &dir, e))?;

        let tmp = dir.join(format!(".{}.tmp", field));
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)
                .map_err(|e| persistence_err("open", &tmp, e))?;
            file.write_all(value.to_string().as_bytes())
                .map_err(|e| persistence_err("write", &tmp, e))?;
            file.sync_all().map_err(|e| persistence_err("flush", &tmp, e))?;
        }
        fs::rename(&tmp, &target).map_err(|e| persistence_err("replace", &target, e))?;
        sync_dir(&dir)
    }

    fn get(&self, path: &[&str], field: &str) -> Result<Option<FieldValue>> {
        let target = self.field_path(path, field)?;
        match fs::read_to_string(&target) {
            Ok(content) => Ok(Some(FieldValue::Str(content))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(persistence_err("read", &target, e)),
        }
    }

    fn remove(&self, path: &[&str], field: &str) -> Result<()> {
        let target = self.field_path(path, field)?;
        match fs::remove_file(&target) {
            Ok(()) => sync_dir(&self.dir(path)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(persistence_err("remove", &target, e)),
        }
    }

    fn children(&self, path: &[&str]) -> Result<Vec<String>> {
        let dir = self.dir(path)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(persistence_err("list", &dir, e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| persistence_err("list", &dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn remove_tree(&self, path: &[&str]) -> Result<()> {
        let dir = self.dir(path)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => match dir.parent() {
                Some(parent) => sync_dir(parent),
                None => Ok(()),
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(persistence_err("remove", &dir, e)),
        }
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

// ============================================================================
// In-memory backend
// ============================================================================

/// Volatile backend: nothing survives the process
#[derive(Debug, Default)]
pub struct MemoryBackend {
    fields: Mutex<BTreeMap<Vec<String>, FieldValue>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(path: &[&str], field: &str) -> Vec<String> {
        path.iter()
            .map(|s| s.to_string())
            .chain(std::iter::once(field.to_string()))
            .collect()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<Vec<String>, FieldValue>>> {
        self.fields
            .lock()
            .map_err(|_| ProvisionError::persistence("Memory backend lock poisoned"))
    }
}

fn starts_with(key: &[String], path: &[&str]) -> bool {
    key.len() > path.len() && key.iter().zip(path).all(|(a, b)| a == b)
}

impl StateBackend for MemoryBackend {
    fn set(&self, path: &[&str], field: &str, value: &FieldValue) -> Result<()> {
        for component in path {
            validate_component(component)?;
        }
        validate_component(field)?;
        self.lock()?.insert(Self::key(path, field), value.clone());
        Ok(())
    }

    fn get(&self, path: &[&str], field: &str) -> Result<Option<FieldValue>> {
        Ok(self.lock()?.get(&Self::key(path, field)).cloned())
    }

    fn remove(&self, path: &[&str], field: &str) -> Result<()> {
        self.lock()?.remove(&Self::key(path, field));
        Ok(())
    }

    fn children(&self, path: &[&str]) -> Result<Vec<String>> {
        let fields = self.lock()?;
        let mut names: Vec<String> = fields
            .keys()
            .filter(|key| starts_with(key, path))
            .map(|key| key[path.len()].clone())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn remove_tree(&self, path: &[&str]) -> Result<()> {
        self.lock()?.retain(|key, _| !starts_with(key, path));
        Ok(())
    }

    fn describe(&self) -> String {
        "in-memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn backends() -> (TempDir, Vec<Box<dyn StateBackend>>) {
        let temp = TempDir::new().expect("Failed to create temp directory");
        let fs_backend = FsBackend::open(temp.path().join("state")).expect("open");
        (temp, vec![Box::new(fs_backend), Box::new(MemoryBackend::new())])
    }

    #[test]
    fn test_set_get_remove() {
        let (_temp, backends) = backends();
        for backend in backends {
            backend.set(&["Steps", "A"], "ExitCode", &FieldValue::Int(3010)).unwrap();
            let value = backend.get(&["Steps", "A"], "ExitCode").unwrap().unwrap();
            assert_eq!(value.as_i32(), Some(3010), "{}", backend.describe());

            backend.remove(&["Steps", "A"], "ExitCode").unwrap();
            assert!(backend.get(&["Steps", "A"], "ExitCode").unwrap().is_none());
            // Removing twice is fine
            backend.remove(&["Steps", "A"], "ExitCode").unwrap();
        }
    }

    #[test]
    fn test_children_are_sorted_and_unique() {
        let (_temp, backends) = backends();
        for backend in backends {
            backend.set(&["Steps", "b"], "Status", &"Success".into()).unwrap();
            backend.set(&["Steps", "a"], "Status", &"Failed".into()).unwrap();
            backend.set(&["Steps", "a"], "Timestamp", &"x".into()).unwrap();
            assert_eq!(backend.children(&["Steps"]).unwrap(), vec!["a", "b"]);
            assert!(backend.children(&["Missing"]).unwrap().is_empty());
        }
    }

    #[test]
    fn test_remove_tree() {
        let (_temp, backends) = backends();
        for backend in backends {
            backend.set(&["Steps", "a"], "Status", &"Success".into()).unwrap();
            backend.set(&["AppRecord"], "Tool", &"1.0".into()).unwrap();
            backend.remove_tree(&["Steps"]).unwrap();
            assert!(backend.children(&["Steps"]).unwrap().is_empty());
            assert!(backend.get(&["AppRecord"], "Tool").unwrap().is_some());
            backend.remove_tree(&["Steps"]).unwrap();
        }
    }

    #[test]
    fn test_invalid_components_rejected() {
        let (_temp, backends) = backends();
        for backend in backends {
            assert!(backend.set(&["Steps", "../escape"], "Status", &"x".into()).is_err());
            assert!(backend.set(&["Steps", "a"], ".hidden", &"x".into()).is_err());
        }
    }

    #[test]
    fn test_fs_backend_leaves_no_temp_files() {
        let temp = TempDir::new().unwrap();
        let backend = FsBackend::open(temp.path()).unwrap();
        backend.set(&["Steps", "a"], "Status", &"Running".into()).unwrap();
        let entries: Vec<_> = fs::read_dir(temp.path().join("Steps").join("a"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries, vec!["Status"]);
    }

    #[test]
    fn test_fs_backend_survives_reopen() {
        let temp = TempDir::new().unwrap();
        {
            let backend = FsBackend::open(temp.path()).unwrap();
            backend.set(&["Steps", "a"], "Status", &"Success".into()).unwrap();
        }
        let backend = FsBackend::open(temp.path()).unwrap();
        let value = backend.get(&["Steps", "a"], "Status").unwrap().unwrap();
        assert_eq!(value.into_string(), "Success");
    }

    #[test]
    fn test_fs_backend_open_fails_on_file_root() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("not-a-dir");
        fs::write(&file, b"x").unwrap();
        let err = FsBackend::open(&file).unwrap_err();
        assert!(matches!(err, ProvisionError::Persistence(_)));
    }
}
