//! End-to-end reconciliation scenarios against a recording fake backend.

use compose_runtime::{CommandOutput, ComposeBackend, Result as ComposeResult};
use convoy_core::config::{AppConfig, StepConfig, TaskConfig};
use convoy_core::controller::Controller;
use convoy_core::state::{AppStatus, TaskKey, TaskStatus};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// FakeBackend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Up(PathBuf),
    Down(PathBuf),
    Run(PathBuf, String),
    Exec(PathBuf, String, Vec<String>),
}

#[derive(Default)]
struct FakeBackend {
    calls: Mutex<Vec<Call>>,
    failing_ups: Mutex<HashSet<String>>,
    failing_runs: Mutex<HashSet<String>>,
}

impl FakeBackend {
    fn ok() -> CommandOutput {
        CommandOutput {
            code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    fn failure() -> CommandOutput {
        CommandOutput {
            code: Some(1),
            stdout: String::new(),
            stderr: "simulated failure".to_string(),
        }
    }

    fn fail_up_for(&self, app_dir_name: &str) {
        self.failing_ups
            .lock()
            .unwrap()
            .insert(app_dir_name.to_string());
    }

    fn fail_run_for(&self, service: &str) {
        self.failing_runs
            .lock()
            .unwrap()
            .insert(service.to_string());
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn downs_for(&self, dir_name: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Down(d) if d.ends_with(dir_name)))
            .count()
    }

    fn ups(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Up(_)))
            .count()
    }
}

impl ComposeBackend for FakeBackend {
    fn up(&self, project_dir: &Path) -> ComposeResult<CommandOutput> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Up(project_dir.to_path_buf()));
        let fail = self
            .failing_ups
            .lock()
            .unwrap()
            .iter()
            .any(|name| project_dir.ends_with(name));
        Ok(if fail { Self::failure() } else { Self::ok() })
    }

    fn down(&self, project_dir: &Path) -> ComposeResult<CommandOutput> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Down(project_dir.to_path_buf()));
        Ok(Self::ok())
    }

    fn run_service(&self, project_dir: &Path, service: &str) -> ComposeResult<CommandOutput> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Run(project_dir.to_path_buf(), service.to_string()));
        let fail = self.failing_runs.lock().unwrap().contains(service);
        Ok(if fail { Self::failure() } else { Self::ok() })
    }

    fn exec(&self, project_dir: &Path, service: &str, argv: &[String]) -> ComposeResult<CommandOutput> {
        self.calls.lock().unwrap().push(Call::Exec(
            project_dir.to_path_buf(),
            service.to_string(),
            argv.to_vec(),
        ));
        Ok(Self::ok())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    repo: TempDir,
    backend: Arc<FakeBackend>,
    controller: Arc<Controller>,
}

fn harness(config: &str, app_dirs: &[&str]) -> Harness {
    let repo = TempDir::new().unwrap();
    for dir in app_dirs {
        std::fs::create_dir_all(repo.path().join(dir)).unwrap();
    }
    std::fs::write(repo.path().join(".convoy.yaml"), config).unwrap();

    let backend = Arc::new(FakeBackend::default());
    let controller = Controller::new(
        repo.path(),
        repo.path().join(".convoy-state"),
        Arc::clone(&backend) as Arc<dyn ComposeBackend>,
    )
    .unwrap();

    Harness {
        repo,
        backend,
        controller,
    }
}

fn rewrite_config(h: &Harness, config: &str) {
    std::fs::write(h.repo.path().join(".convoy.yaml"), config).unwrap();
}

const TWO_APPS: &str = r#"
apps:
  - id: api
    path: api
    tasks:
      - id: nightly-backup
        cron: "0 2 * * *"
        steps:
          - type: compose_run
            compose_service: backup
  - id: web
    path: web
    tasks: []
"#;

const ONE_APP: &str = r#"
apps:
  - id: web
    path: web
    tasks: []
"#;

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[test]
fn convergence_all_desired_apps_running() {
    let h = harness(TWO_APPS, &["api", "web"]);
    h.controller.reconcile();

    let state = h.controller.state_snapshot();
    assert_eq!(state.apps.len(), 2);
    assert!(state.apps.values().all(|a| a.status == AppStatus::Running));
    assert_eq!(h.backend.ups(), 2);
}

#[test]
fn missing_directory_is_skipped_not_failed() {
    // only `api` exists on disk
    let h = harness(TWO_APPS, &["api"]);
    h.controller.reconcile();

    let state = h.controller.state_snapshot();
    assert_eq!(state.apps.len(), 1);
    assert!(state.apps.contains_key("api"));
    assert!(!state.apps.contains_key("web"));
    assert_eq!(h.backend.ups(), 1);
}

#[test]
fn failed_up_marks_app_failed_and_skips_its_tasks() {
    let h = harness(TWO_APPS, &["api", "web"]);
    h.backend.fail_up_for("api");
    h.controller.reconcile();

    let state = h.controller.state_snapshot();
    assert_eq!(state.apps["api"].status, AppStatus::Failed);
    assert_eq!(state.apps["web"].status, AppStatus::Running);
    assert!(h.controller.scheduled_job_ids().is_empty());
    assert!(!state
        .tasks
        .contains_key(&TaskKey::new("api", "nightly-backup")));
}

#[test]
fn teardown_removes_state_and_downs_exactly_once() {
    let h = harness(TWO_APPS, &["api", "web"]);
    h.controller.reconcile();
    assert_eq!(h.controller.state_snapshot().apps.len(), 2);

    rewrite_config(&h, ONE_APP);
    h.controller.reconcile();

    let state = h.controller.state_snapshot();
    assert!(!state.apps.contains_key("api"));
    assert!(state.apps.contains_key("web"));
    assert_eq!(h.backend.downs_for("api"), 1);
    // orphaned task states are pruned with their app
    assert!(state.tasks.keys().all(|k| k.app_id != "api"));
    assert!(h
        .controller
        .scheduled_job_ids()
        .iter()
        .all(|id| !id.starts_with("api_")));
}

#[test]
fn reconcile_is_idempotent() {
    let h = harness(TWO_APPS, &["api", "web"]);
    h.controller.reconcile();
    let first_jobs = h.controller.scheduled_job_ids();
    let first_state = h.controller.state_snapshot();

    h.controller.reconcile();
    let second_jobs = h.controller.scheduled_job_ids();
    let second_state = h.controller.state_snapshot();

    assert_eq!(first_jobs, second_jobs);
    assert_eq!(
        first_state.apps.keys().collect::<Vec<_>>(),
        second_state.apps.keys().collect::<Vec<_>>()
    );
    assert!(second_state.apps.values().all(|a| a.status == AppStatus::Running));
    assert_eq!(
        first_state.tasks.keys().collect::<Vec<_>>(),
        second_state.tasks.keys().collect::<Vec<_>>()
    );
}

#[test]
fn malformed_config_aborts_pass_without_touching_state() {
    let h = harness(TWO_APPS, &["api", "web"]);
    h.controller.reconcile();
    let before = h.controller.state_snapshot();

    rewrite_config(&h, "apps: [not: [valid");
    h.controller.reconcile();

    let after = h.controller.state_snapshot();
    assert_eq!(before, after);
    // no teardown happened either
    assert_eq!(h.backend.downs_for("api"), 0);
    assert_eq!(h.backend.downs_for("web"), 0);
}

#[test]
fn invalid_cron_marks_task_failed_and_pass_continues() {
    let config = r#"
apps:
  - id: api
    path: api
    tasks:
      - id: broken
        cron: "not a cron"
        steps:
          - type: compose_run
            compose_service: x
      - id: fine
        cron: "*/5 * * * *"
        steps:
          - type: compose_run
            compose_service: y
"#;
    let h = harness(config, &["api"]);
    h.controller.reconcile();

    let state = h.controller.state_snapshot();
    assert_eq!(
        state.tasks[&TaskKey::new("api", "broken")].status,
        TaskStatus::Failed
    );
    assert_eq!(
        state.tasks[&TaskKey::new("api", "fine")].status,
        TaskStatus::Success
    );
    assert_eq!(h.controller.scheduled_job_ids(), vec!["api_fine".to_string()]);
}

#[test]
fn state_survives_a_controller_restart() {
    let h = harness(TWO_APPS, &["api", "web"]);
    h.controller.reconcile();
    let before = h.controller.state_snapshot();
    h.controller.shutdown(None);

    let controller = Controller::new(
        h.repo.path(),
        h.repo.path().join(".convoy-state"),
        Arc::new(FakeBackend::default()) as Arc<dyn ComposeBackend>,
    )
    .unwrap();
    let after = controller.state_snapshot();

    assert_eq!(before.apps.keys().collect::<Vec<_>>(), after.apps.keys().collect::<Vec<_>>());
    assert_eq!(before.tasks, after.tasks);
}

#[test]
fn corrupt_state_file_resets_to_empty() {
    let repo = TempDir::new().unwrap();
    let state_dir = repo.path().join(".convoy-state");
    std::fs::create_dir_all(&state_dir).unwrap();
    std::fs::write(state_dir.join("state.json"), "{\"apps\": garbage").unwrap();

    let controller = Controller::new(
        repo.path(),
        &state_dir,
        Arc::new(FakeBackend::default()) as Arc<dyn ComposeBackend>,
    )
    .unwrap();
    let state = controller.state_snapshot();
    assert!(state.apps.is_empty() && state.tasks.is_empty());
}

// ---------------------------------------------------------------------------
// The api / nightly-backup scenario
// ---------------------------------------------------------------------------

const SCENARIO: &str = r#"
apps:
  - id: api
    path: ./api
    tasks:
      - id: nightly-backup
        cron: "0 2 * * *"
        steps:
          - type: compose_run
            compose_service: backup
"#;

#[test]
fn scheduled_backup_scenario() {
    let h = harness(SCENARIO, &["api"]);
    h.controller.reconcile();

    let key = TaskKey::new("api", "nightly-backup");
    let state = h.controller.state_snapshot();
    assert_eq!(
        h.controller.scheduled_job_ids(),
        vec!["api_nightly-backup".to_string()]
    );
    assert_eq!(state.apps["api"].status, AppStatus::Running);
    // scheduled, not yet run
    assert_eq!(state.tasks[&key].status, TaskStatus::Success);
    assert!(state.tasks[&key].last_run.is_none());

    // manual trigger: the ephemeral backup service runs once
    let config = h.controller.load_config().unwrap();
    let app = config.apps[0].clone();
    let task = app.tasks[0].clone();
    h.controller.execute_task(&app, &task).unwrap();

    assert!(h
        .backend
        .calls()
        .iter()
        .any(|c| matches!(c, Call::Run(_, service) if service == "backup")));
    let state = h.controller.state_snapshot();
    assert_eq!(state.tasks[&key].status, TaskStatus::Success);
    assert!(state.tasks[&key].last_run.is_some());
    assert!(!h.controller.task_log(&key).is_empty());

    // non-zero exit: the error surfaces and the task is marked failed
    h.backend.fail_run_for("backup");
    let err = h.controller.execute_task(&app, &task).unwrap_err();
    assert_eq!(err.index, 0);
    let state = h.controller.state_snapshot();
    assert_eq!(state.tasks[&key].status, TaskStatus::Failed);
}

#[test]
fn step_sequence_aborts_on_first_failure() {
    let config = r#"
apps:
  - id: api
    path: api
    tasks:
      - id: multi
        cron: "0 3 * * *"
        steps:
          - type: compose_run
            compose_service: first
          - type: compose_run
            compose_service: second
          - type: compose_run
            compose_service: third
"#;
    let h = harness(config, &["api"]);
    h.controller.reconcile();
    h.backend.fail_run_for("second");

    let loaded = h.controller.load_config().unwrap();
    let app: AppConfig = loaded.apps[0].clone();
    let task: TaskConfig = app.tasks[0].clone();
    assert!(matches!(task.steps[0], StepConfig::ComposeRun { .. }));

    let err = h.controller.execute_task(&app, &task).unwrap_err();
    assert_eq!(err.index, 1);

    let runs: Vec<String> = h
        .backend
        .calls()
        .iter()
        .filter_map(|c| match c {
            Call::Run(_, service) => Some(service.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(runs, vec!["first".to_string(), "second".to_string()]);

    let state = h.controller.state_snapshot();
    assert_eq!(
        state.tasks[&TaskKey::new("api", "multi")].status,
        TaskStatus::Failed
    );
}

#[test]
fn exec_steps_reach_the_named_service() {
    let config = r#"
apps:
  - id: api
    path: api
    tasks:
      - id: cleanup
        cron: "30 1 * * 0"
        steps:
          - type: compose_command
            compose_service: web
            command: ["sh", "-c", "rm -rf /tmp/cache"]
"#;
    let h = harness(config, &["api"]);
    h.controller.reconcile();

    let loaded = h.controller.load_config().unwrap();
    let app = loaded.apps[0].clone();
    let task = app.tasks[0].clone();
    h.controller.execute_task(&app, &task).unwrap();

    assert!(h.backend.calls().iter().any(|c| matches!(
        c,
        Call::Exec(_, service, argv) if service == "web" && argv[0] == "sh"
    )));
}
