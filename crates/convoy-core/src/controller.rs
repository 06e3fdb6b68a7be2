//! The reconciling controller: diffs the desired app set against recorded
//! state, drives the compose backend and the job scheduler, and owns the
//! persisted snapshot.
//!
//! Three triggers enter concurrently: startup, watcher events, cron fires.
//! State is only touched through the shared mutex, and whole passes are
//! serialized by the reconcile lock; a pass arriving while one is in flight
//! queues behind it.

use crate::config::{AppConfig, ConvoyConfig, TaskConfig};
use crate::error::Result;
use crate::executor::{StepError, StepExecutor};
use crate::paths;
use crate::schedule::{CronExpr, JobCallback, JobScheduler};
use crate::state::{AppStatus, State, TaskKey, TaskStatus};
use crate::tasklog::TaskLogs;
use crate::watcher::ConfigWatcher;
use chrono::Utc;
use compose_runtime::ComposeBackend;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

pub struct Controller {
    repo_root: PathBuf,
    state_dir: PathBuf,
    backend: Arc<dyn ComposeBackend>,
    state: Arc<Mutex<State>>,
    scheduler: JobScheduler,
    executor: StepExecutor,
    logs: TaskLogs,
    reconcile_lock: Mutex<()>,
}

impl Controller {
    pub fn new(
        repo_root: impl Into<PathBuf>,
        state_dir: impl Into<PathBuf>,
        backend: Arc<dyn ComposeBackend>,
    ) -> Result<Arc<Self>> {
        let repo_root = repo_root.into();
        let state_dir = state_dir.into();
        crate::io::ensure_dir(&state_dir)?;

        let state = Arc::new(Mutex::new(State::load_or_default(&paths::state_file_path(
            &state_dir,
        ))));
        let logs = TaskLogs::new(&state_dir);
        let executor = StepExecutor::new(Arc::clone(&backend), Arc::clone(&state), logs.clone());

        Ok(Arc::new(Self {
            repo_root,
            state_dir,
            backend,
            state,
            scheduler: JobScheduler::new(),
            executor,
            logs,
            reconcile_lock: Mutex::new(()),
        }))
    }

    // -----------------------------------------------------------------------
    // Collaborator surface (dashboard, manual triggers)
    // -----------------------------------------------------------------------

    pub fn load_config(&self) -> Result<ConvoyConfig> {
        ConvoyConfig::load(&self.repo_root)
    }

    pub fn state_snapshot(&self) -> State {
        self.state.lock().unwrap().clone()
    }

    pub fn task_log(&self, key: &TaskKey) -> String {
        self.logs.read(key)
    }

    /// Ids of the currently scheduled cron jobs, sorted.
    pub fn scheduled_job_ids(&self) -> Vec<String> {
        self.scheduler.job_ids()
    }

    /// Run a task's steps now, bypassing the schedule. Errors surface to
    /// the caller; state and task logs are updated either way.
    pub fn execute_task(&self, app: &AppConfig, task: &TaskConfig) -> std::result::Result<(), StepError> {
        self.executor
            .execute(&app.project_dir(&self.repo_root), app, task)
    }

    // -----------------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------------

    /// One full pass: converge every desired app, swap the job registry,
    /// tear down what is no longer desired, persist. Never propagates
    /// errors and is safe to invoke repeatedly; concurrent calls queue.
    pub fn reconcile(self: &Arc<Self>) {
        let _pass = self.reconcile_lock.lock().unwrap();
        tracing::info!("starting reconciliation");
        match self.load_config() {
            Ok(config) => self.apply(&config),
            Err(e) => tracing::error!(error = %e, "failed to load config, aborting pass"),
        }
        // The snapshot is written even when the pass aborted or individual
        // apps failed.
        self.persist();
    }

    fn apply(self: &Arc<Self>, config: &ConvoyConfig) {
        let desired: HashSet<String> = config.apps.iter().map(|a| a.id.clone()).collect();

        let mut jobs: Vec<(String, CronExpr, JobCallback)> = Vec::new();
        for app in &config.apps {
            self.reconcile_app(app, &mut jobs);
        }
        // One swap, so there is never a window with an empty registry.
        self.scheduler.replace_all(jobs);

        let stale: Vec<crate::state::AppState> = {
            let state = self.state.lock().unwrap();
            state
                .apps
                .values()
                .filter(|a| !desired.contains(&a.id))
                .cloned()
                .collect()
        };
        for app_state in stale {
            tracing::info!(app = %app_state.id, "tearing down removed app");
            let dir = self.repo_root.join(&app_state.path);
            match self.backend.down(&dir) {
                Ok(out) if out.success() => {}
                Ok(out) => {
                    tracing::error!(app = %app_state.id, stderr = %out.stderr, "compose down failed")
                }
                Err(e) => tracing::error!(app = %app_state.id, error = %e, "compose down failed"),
            }
            self.state.lock().unwrap().remove_app(&app_state.id);
        }

        self.state.lock().unwrap().prune_orphaned_tasks(&desired);
    }

    /// Converge one app. Failures are contained here: they mark state and
    /// log, never abort the pass.
    fn reconcile_app(
        self: &Arc<Self>,
        app: &AppConfig,
        jobs: &mut Vec<(String, CronExpr, JobCallback)>,
    ) {
        let dir = app.project_dir(&self.repo_root);
        if !dir.exists() {
            tracing::warn!(app = %app.id, path = %dir.display(), "app directory not found, skipping");
            return;
        }

        let now = Utc::now();
        match self.backend.up(&dir) {
            Ok(out) if out.success() => {
                tracing::info!(app = %app.id, "stack is up");
                self.state
                    .lock()
                    .unwrap()
                    .record_app(&app.id, &app.path, AppStatus::Running, now);
            }
            Ok(out) => {
                tracing::error!(app = %app.id, stderr = %out.stderr, "compose up failed");
                self.state
                    .lock()
                    .unwrap()
                    .record_app(&app.id, &app.path, AppStatus::Failed, now);
                return;
            }
            Err(e) => {
                tracing::error!(app = %app.id, error = %e, "compose up failed");
                self.state
                    .lock()
                    .unwrap()
                    .record_app(&app.id, &app.path, AppStatus::Failed, now);
                return;
            }
        }

        for task in &app.tasks {
            let key = TaskKey::new(&app.id, &task.id);
            match CronExpr::parse(&task.cron) {
                Ok(expr) => {
                    jobs.push((key.to_string(), expr, self.job_callback(app, task)));
                    // Success here records the scheduling outcome, not a run.
                    self.state
                        .lock()
                        .unwrap()
                        .record_task_scheduled(&key, TaskStatus::Success);
                }
                Err(e) => {
                    tracing::error!(task = %key, error = %e, "failed to schedule task");
                    self.state
                        .lock()
                        .unwrap()
                        .record_task_scheduled(&key, TaskStatus::Failed);
                }
            }
        }
    }

    fn job_callback(self: &Arc<Self>, app: &AppConfig, task: &TaskConfig) -> JobCallback {
        let controller = Arc::downgrade(self);
        let app = app.clone();
        let task = task.clone();
        Box::new(move || {
            if let Some(controller) = controller.upgrade() {
                controller.execute_task(&app, &task)?;
            }
            Ok(())
        })
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Watch the repository and reconcile on every qualifying change.
    pub fn start_watcher(self: &Arc<Self>) -> Result<ConfigWatcher> {
        let controller = Arc::downgrade(self);
        ConfigWatcher::start(&self.repo_root, &self.state_dir, move || {
            if let Some(controller) = controller.upgrade() {
                controller.reconcile();
            }
        })
    }

    /// Ordered shutdown: stop admitting cron fires (waiting out an
    /// in-flight one), quiesce the watcher, persist the final snapshot.
    pub fn shutdown(&self, watcher: Option<ConfigWatcher>) {
        self.scheduler.shutdown();
        if let Some(mut watcher) = watcher {
            watcher.stop();
        }
        self.persist();
        tracing::info!("controller stopped");
    }

    fn persist(&self) {
        let snapshot = self.state.lock().unwrap().clone();
        if let Err(e) = snapshot.save(&paths::state_file_path(&self.state_dir)) {
            tracing::error!(error = %e, "failed to persist state");
        }
    }
}
