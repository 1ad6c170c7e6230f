//! Persisted key-value state.
//!
//! The supervisor reads its switch, watch target and tracked pid from a
//! [`StateStore`] on every tick, so the values survive a restart of the
//! hosting process. Writes are last-write-wins.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, TailcontrolError};
use crate::procs::ProcessId;

pub trait StateStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn put(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.values).get(key).cloned()
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        lock(&self.values).insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        lock(&self.values).remove(key);
        Ok(())
    }
}

/// A JSON object on disk, rewritten in full on every mutation.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl JsonFileStore {
    /// Opens `path`, starting empty when the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(JsonFileStore {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, values: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(values)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

impl StateStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.values).get(key).cloned()
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut values = lock(&self.values);
        values.insert(key.to_string(), value.to_string());
        self.save(&values)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut values = lock(&self.values);
        if values.remove(key).is_some() {
            self.save(&values)?;
        }
        Ok(())
    }
}

/// What `tailscale file get` does when a received name already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictBehavior {
    #[default]
    Rename,
    Skip,
    Overwrite,
}

impl ConflictBehavior {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictBehavior::Rename => "rename",
            ConflictBehavior::Skip => "skip",
            ConflictBehavior::Overwrite => "overwrite",
        }
    }
}

impl fmt::Display for ConflictBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictBehavior {
    type Err = TailcontrolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "rename" => Ok(ConflictBehavior::Rename),
            "skip" => Ok(ConflictBehavior::Skip),
            "overwrite" => Ok(ConflictBehavior::Overwrite),
            other => Err(TailcontrolError::InvalidConflictBehavior(other.to_string())),
        }
    }
}

const KEY_ENABLED: &str = "drop_enabled";
const KEY_PATH: &str = "current_path";
const KEY_BEHAVIOR: &str = "current_behavior";
const KEY_PID: &str = "file_get_pid";

/// Typed view of the drop-protect keys.
#[derive(Clone)]
pub struct DropState {
    store: Arc<dyn StateStore>,
}

impl DropState {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        DropState { store }
    }

    pub fn enabled(&self) -> bool {
        self.store.get(KEY_ENABLED).is_some_and(|v| v == "true")
    }

    pub fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.store
            .put(KEY_ENABLED, if enabled { "true" } else { "false" })
    }

    pub fn current_path(&self) -> Option<String> {
        self.store.get(KEY_PATH)
    }

    /// Defaults to `rename`; an unreadable stored value also reads as `rename`.
    pub fn current_behavior(&self) -> ConflictBehavior {
        match self.store.get(KEY_BEHAVIOR).map(|v| v.parse::<ConflictBehavior>()) {
            Some(Ok(behavior)) => behavior,
            Some(Err(e)) => {
                warn!(error = %e, "ignoring stored conflict behavior");
                ConflictBehavior::default()
            }
            None => ConflictBehavior::default(),
        }
    }

    pub fn set_current(&self, path: &str, behavior: ConflictBehavior) -> Result<()> {
        self.store.put(KEY_PATH, path)?;
        self.store.put(KEY_BEHAVIOR, behavior.as_str())
    }

    /// `None` when nothing is tracked. A stored `-1` means the same.
    pub fn tracked_pid(&self) -> Option<ProcessId> {
        self.store
            .get(KEY_PID)
            .and_then(|v| v.trim().parse::<ProcessId>().ok())
            .filter(|pid| *pid > 0)
    }

    pub fn set_tracked_pid(&self, pid: ProcessId) -> Result<()> {
        if pid <= 0 {
            return Err(TailcontrolError::InvalidPid(pid.to_string()));
        }
        self.store.put(KEY_PID, &pid.to_string())
    }

    pub fn clear_tracked_pid(&self) -> Result<()> {
        self.store.remove(KEY_PID)
    }
}
