use crate::error::{ConvoyError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// File and directory constants
// ---------------------------------------------------------------------------

/// Desired-state config file, at the watched repository root.
pub const CONFIG_FILE: &str = ".convoy.yaml";

/// Default state directory, relative to the repository root.
pub const DEFAULT_STATE_DIR: &str = ".convoy-state";

pub const STATE_FILE: &str = "state.json";
pub const LOGS_DIR: &str = "logs";
pub const GITIGNORE_FILE: &str = ".gitignore";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn config_path(repo_root: &Path) -> PathBuf {
    repo_root.join(CONFIG_FILE)
}

pub fn state_file_path(state_dir: &Path) -> PathBuf {
    state_dir.join(STATE_FILE)
}

pub fn logs_dir(state_dir: &Path) -> PathBuf {
    state_dir.join(LOGS_DIR)
}

/// Log file for one task: `<state>/logs/<app>/tasks/<task>.log`.
pub fn task_log_path(state_dir: &Path, app_id: &str, task_id: &str) -> PathBuf {
    logs_dir(state_dir)
        .join(app_id)
        .join("tasks")
        .join(format!("{task_id}.log"))
}

// ---------------------------------------------------------------------------
// Id validation
// ---------------------------------------------------------------------------

static ID_RE: OnceLock<Regex> = OnceLock::new();

fn id_re() -> &'static Regex {
    ID_RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9\-]*[a-z0-9]$|^[a-z0-9]$").unwrap())
}

/// Validate an app or task id: lowercase alphanumeric with hyphens, max 64.
///
/// Underscores are rejected on purpose: the state file joins app and task
/// ids with `_`, and hyphen-only ids keep that form unambiguous.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > 64 || !id_re().is_match(id) {
        return Err(ConvoyError::Config(format!(
            "invalid id '{id}': must be lowercase alphanumeric with hyphens"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_ids() {
        for id in ["api", "a", "nightly-backup", "db-2"] {
            validate_id(id).unwrap_or_else(|_| panic!("expected valid: {id}"));
        }
    }

    #[test]
    fn invalid_ids() {
        for id in [
            "",
            "-leading-dash",
            "trailing-dash-",
            "has spaces",
            "UPPER",
            "app_task",
        ] {
            assert!(validate_id(id).is_err(), "expected invalid: {id}");
        }
    }

    #[test]
    fn path_helpers() {
        let repo = Path::new("/srv/repo");
        let state = Path::new("/srv/repo/.convoy-state");
        assert_eq!(config_path(repo), PathBuf::from("/srv/repo/.convoy.yaml"));
        assert_eq!(
            state_file_path(state),
            PathBuf::from("/srv/repo/.convoy-state/state.json")
        );
        assert_eq!(
            task_log_path(state, "api", "nightly-backup"),
            PathBuf::from("/srv/repo/.convoy-state/logs/api/tasks/nightly-backup.log")
        );
    }
}
