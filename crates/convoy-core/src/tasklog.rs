use crate::io;
use crate::paths;
use crate::state::TaskKey;
use std::path::{Path, PathBuf};

/// Per-task log files under `<state>/logs/<app>/tasks/<task>.log`.
///
/// One timestamped line per step outcome. Files grow without rotation;
/// pruning them is an operator concern.
#[derive(Debug, Clone)]
pub struct TaskLogs {
    state_dir: PathBuf,
}

impl TaskLogs {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    fn path_for(&self, key: &TaskKey) -> PathBuf {
        paths::task_log_path(&self.state_dir, &key.app_id, &key.task_id)
    }

    /// Append one line; failures are logged, never surfaced. A full disk
    /// must not fail a task whose steps succeeded.
    pub fn append(&self, key: &TaskKey, line: &str) {
        let path = self.path_for(key);
        if let Err(e) = io::append_line(&path, line) {
            tracing::warn!(task = %key, error = %e, "failed to write task log");
        }
    }

    /// The task's log contents, or an empty string if it never ran.
    pub fn read(&self, key: &TaskKey) -> String {
        read_or_empty(&self.path_for(key))
    }
}

fn read_or_empty(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}
