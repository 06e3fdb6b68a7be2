use crate::error::{ConvoyError, Result};
use crate::io;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppStatus {
    Running,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Success,
    Failed,
}

// ---------------------------------------------------------------------------
// TaskKey
// ---------------------------------------------------------------------------

/// Composite key for a task state: the owning app id plus the task id.
///
/// Equality and ordering are defined on the pair. The state file stores the
/// key as `"<app_id>_<task_id>"`; ids are validated to never contain an
/// underscore (see `paths::validate_id`), so the string form parses back
/// unambiguously at the first `_`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskKey {
    pub app_id: String,
    pub task_id: String,
}

impl TaskKey {
    pub fn new(app_id: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            task_id: task_id.into(),
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.app_id, self.task_id)
    }
}

impl FromStr for TaskKey {
    type Err = ConvoyError;

    fn from_str(s: &str) -> Result<Self> {
        let (app_id, task_id) = s
            .split_once('_')
            .ok_or_else(|| ConvoyError::Config(format!("malformed task key '{s}'")))?;
        if app_id.is_empty() || task_id.is_empty() {
            return Err(ConvoyError::Config(format!("malformed task key '{s}'")));
        }
        Ok(Self::new(app_id, task_id))
    }
}

impl Serialize for TaskKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TaskKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppState {
    pub id: String,
    pub path: String,
    pub status: AppStatus,
    pub last_reconcile: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub id: String,
    pub app_id: String,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    pub status: TaskStatus,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// The persisted actual-state snapshot.
///
/// Invariant: every task key's `app_id` has an entry in `apps`. The
/// reconciler restores it each pass by pruning orphaned task states.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub apps: BTreeMap<String, AppState>,
    #[serde(default)]
    pub tasks: BTreeMap<TaskKey, TaskState>,
}

impl State {
    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Load the snapshot, falling back to an empty state if the file is
    /// absent or unreadable. Corruption is logged, never raised.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        let data = match std::fs::read_to_string(path) {
            Ok(d) => d,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to read state file, starting empty");
                return Self::default();
            }
        };
        match serde_json::from_str(&data) {
            Ok(state) => state,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to parse state file, starting empty");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self)?;
        io::atomic_write(path, data.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    pub fn record_app(&mut self, id: &str, path: &str, status: AppStatus, now: DateTime<Utc>) {
        self.apps.insert(
            id.to_string(),
            AppState {
                id: id.to_string(),
                path: path.to_string(),
                status,
                last_reconcile: now,
            },
        );
    }

    pub fn remove_app(&mut self, id: &str) -> Option<AppState> {
        self.apps.remove(id)
    }

    /// Record a task's scheduling outcome. Any previous `last_run` survives.
    pub fn record_task_scheduled(&mut self, key: &TaskKey, status: TaskStatus) {
        self.tasks
            .entry(key.clone())
            .and_modify(|t| t.status = status)
            .or_insert_with(|| TaskState {
                id: key.task_id.clone(),
                app_id: key.app_id.clone(),
                last_run: None,
                status,
            });
    }

    /// Stamp a successful step: `last_run` moves to now, status to success.
    pub fn mark_step_success(&mut self, key: &TaskKey, now: DateTime<Utc>) {
        let entry = self.tasks.entry(key.clone()).or_insert_with(|| TaskState {
            id: key.task_id.clone(),
            app_id: key.app_id.clone(),
            last_run: None,
            status: TaskStatus::Success,
        });
        entry.last_run = Some(now);
        entry.status = TaskStatus::Success;
    }

    /// Mark a task failed; `last_run` keeps its last successful value.
    pub fn mark_task_failed(&mut self, key: &TaskKey) {
        self.tasks
            .entry(key.clone())
            .and_modify(|t| t.status = TaskStatus::Failed)
            .or_insert_with(|| TaskState {
                id: key.task_id.clone(),
                app_id: key.app_id.clone(),
                last_run: None,
                status: TaskStatus::Failed,
            });
    }

    /// Drop every task state whose app is no longer desired.
    pub fn prune_orphaned_tasks(&mut self, desired: &std::collections::HashSet<String>) {
        self.tasks.retain(|key, _| desired.contains(&key.app_id));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
