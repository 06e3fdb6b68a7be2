use crate::error::{ConvoyError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// StepConfig
// ---------------------------------------------------------------------------

/// One atomic action within a task.
///
/// Internally tagged, so a `compose_command` step without a `command` (or a
/// `rest_api` step without `endpoint`/`method`) is rejected at parse time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    /// Ephemeral one-shot run of a service (`run --rm`).
    ComposeRun { compose_service: String },
    /// Execute an argument vector inside a running service (`exec -T`).
    ComposeCommand {
        compose_service: String,
        command: Vec<String>,
    },
    /// HTTP request, either from the controller process or from inside a
    /// service container when `compose_service` is set.
    RestApi {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        compose_service: Option<String>,
        endpoint: String,
        method: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    ComposeRun,
    ComposeCommand,
    RestApi,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::ComposeRun => "compose_run",
            StepKind::ComposeCommand => "compose_command",
            StepKind::RestApi => "rest_api",
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl StepConfig {
    pub fn kind(&self) -> StepKind {
        match self {
            StepConfig::ComposeRun { .. } => StepKind::ComposeRun,
            StepConfig::ComposeCommand { .. } => StepKind::ComposeCommand,
            StepConfig::RestApi { .. } => StepKind::RestApi,
        }
    }
}

// ---------------------------------------------------------------------------
// TaskConfig / AppConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub id: String,
    /// 5-field cron expression: minute hour day-of-month month day-of-week.
    pub cron: String,
    pub steps: Vec<StepConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub id: String,
    /// Project directory, relative to the repository root.
    pub path: String,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

impl AppConfig {
    pub fn project_dir(&self, repo_root: &Path) -> PathBuf {
        repo_root.join(&self.path)
    }
}

// ---------------------------------------------------------------------------
// ConvoyConfig (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConvoyConfig {
    #[serde(default)]
    pub apps: Vec<AppConfig>,
}

impl ConvoyConfig {
    /// Load the desired set from `.convoy.yaml` at the repository root.
    ///
    /// A missing file is an empty desired set (every recorded app gets torn
    /// down on the next pass). A file that fails to parse or validate is a
    /// `Config` error, and the caller aborts the reconciliation pass.
    pub fn load(repo_root: &Path) -> Result<Self> {
        let path = paths::config_path(repo_root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        let config: ConvoyConfig = serde_yaml::from_str(&data)
            .map_err(|e| ConvoyError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject duplicate or malformed ids before any of them reach the state
    /// file or the job registry.
    pub fn validate(&self) -> Result<()> {
        let mut app_ids = HashSet::new();
        for app in &self.apps {
            paths::validate_id(&app.id)?;
            if !app_ids.insert(app.id.as_str()) {
                return Err(ConvoyError::Config(format!("duplicate app id '{}'", app.id)));
            }
            let mut task_ids = HashSet::new();
            for task in &app.tasks {
                paths::validate_id(&task.id)?;
                if !task_ids.insert(task.id.as_str()) {
                    return Err(ConvoyError::Config(format!(
                        "duplicate task id '{}' in app '{}'",
                        task.id, app.id
                    )));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
