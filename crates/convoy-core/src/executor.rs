//! Step execution: runs one task's ordered steps against a running stack.
//!
//! Failures come back as values, not unwinds: `execute` returns a
//! [`StepError`] naming the failing step's index, its kind, and a typed
//! cause, and remaining steps are not attempted. After every successful
//! step the owning task state is stamped (`last_run`, `status=success`);
//! the failing step stamps `status=failed`. `last_run` therefore records
//! the most recent successful *step*, not task completion.

use crate::config::{AppConfig, StepConfig, StepKind, TaskConfig};
use crate::state::{State, TaskKey};
use crate::tasklog::TaskLogs;
use chrono::Utc;
use compose_runtime::{CommandOutput, ComposeBackend, ComposeError};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// A task step failed; steps after `index` were not run.
#[derive(Debug, Error)]
#[error("step {index} ({kind}) failed: {cause}")]
pub struct StepError {
    /// Zero-based index of the failing step.
    pub index: usize,
    pub kind: StepKind,
    pub cause: StepCause,
}

#[derive(Debug, Error)]
pub enum StepCause {
    #[error("command exited with code {code:?}: {stderr}")]
    CommandFailed { code: Option<i32>, stderr: String },

    #[error(transparent)]
    Compose(#[from] ComposeError),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid http method '{0}'")]
    InvalidMethod(String),

    #[error("no http transport available in service '{service}'")]
    NoTransport { service: String },

    #[error("all http transports failed: {last_error}")]
    TransportsExhausted { last_error: String },
}

// ---------------------------------------------------------------------------
// HttpTransport
// ---------------------------------------------------------------------------

/// In-container HTTP transports, in priority order.
///
/// Each transport is probed (`command -v <tool>`) in its own exec
/// invocation; only when the probe succeeds is the request command run, so
/// a missing tool is never conflated with a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HttpTransport {
    Curl,
    Wget,
    Python,
}

impl HttpTransport {
    const ALL: [HttpTransport; 3] = [
        HttpTransport::Curl,
        HttpTransport::Wget,
        HttpTransport::Python,
    ];

    fn tool(&self) -> &'static str {
        match self {
            HttpTransport::Curl => "curl",
            HttpTransport::Wget => "wget",
            HttpTransport::Python => "python3",
        }
    }

    fn probe_command(&self) -> String {
        format!("command -v {}", self.tool())
    }

    fn request_command(&self, method: &str, endpoint: &str) -> String {
        match self {
            HttpTransport::Curl => format!("curl -X {method} '{endpoint}' -s -f"),
            HttpTransport::Wget => format!("wget -O - --method={method} '{endpoint}' -q"),
            HttpTransport::Python => format!(
                r#"python3 -c 'import urllib.request as r; req = r.Request("{endpoint}", method="{method}"); r.urlopen(req)'"#
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

pub struct StepExecutor {
    backend: Arc<dyn ComposeBackend>,
    http: reqwest::blocking::Client,
    state: Arc<Mutex<State>>,
    logs: TaskLogs,
}

impl StepExecutor {
    pub fn new(backend: Arc<dyn ComposeBackend>, state: Arc<Mutex<State>>, logs: TaskLogs) -> Self {
        Self {
            backend,
            http: reqwest::blocking::Client::new(),
            state,
            logs,
        }
    }

    /// Run `task`'s steps in declared order against `app`'s project
    /// directory, aborting at the first failure.
    pub fn execute(
        &self,
        project_dir: &Path,
        app: &AppConfig,
        task: &TaskConfig,
    ) -> Result<(), StepError> {
        let key = TaskKey::new(&app.id, &task.id);
        for (index, step) in task.steps.iter().enumerate() {
            let kind = step.kind();
            match self.run_step(project_dir, step) {
                Ok(()) => {
                    tracing::info!(task = %key, step = index, kind = %kind, "step succeeded");
                    self.logs.append(&key, &format!("step {index} ({kind}) succeeded"));
                    self.state.lock().unwrap().mark_step_success(&key, Utc::now());
                }
                Err(cause) => {
                    let err = StepError { index, kind, cause };
                    tracing::error!(task = %key, error = %err, "step failed, aborting task");
                    self.logs.append(&key, &format!("{err}"));
                    self.state.lock().unwrap().mark_task_failed(&key);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn run_step(&self, project_dir: &Path, step: &StepConfig) -> Result<(), StepCause> {
        match step {
            StepConfig::ComposeRun { compose_service } => {
                exit_ok(self.backend.run_service(project_dir, compose_service)?)
            }
            StepConfig::ComposeCommand {
                compose_service,
                command,
            } => exit_ok(self.backend.exec(project_dir, compose_service, command)?),
            StepConfig::RestApi {
                compose_service: None,
                endpoint,
                method,
            } => self.direct_request(method, endpoint),
            StepConfig::RestApi {
                compose_service: Some(service),
                endpoint,
                method,
            } => self.request_via_service(project_dir, service, method, endpoint),
        }
    }

    /// Issue the request from the controller process itself.
    fn direct_request(&self, method: &str, endpoint: &str) -> Result<(), StepCause> {
        let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
            .map_err(|_| StepCause::InvalidMethod(method.to_string()))?;
        self.http
            .request(method, endpoint)
            .send()?
            .error_for_status()?;
        Ok(())
    }

    /// Issue the request from inside `service`, walking the transport
    /// chain: probe for the tool, then run the request with it. The first
    /// transport whose request exits 0 wins; later transports are not
    /// attempted.
    fn request_via_service(
        &self,
        project_dir: &Path,
        service: &str,
        method: &str,
        endpoint: &str,
    ) -> Result<(), StepCause> {
        let mut last_error: Option<String> = None;

        for transport in HttpTransport::ALL {
            let probe = self.sh(project_dir, service, &transport.probe_command())?;
            if !probe.success() {
                tracing::debug!(service, tool = transport.tool(), "transport not available");
                continue;
            }

            let out = self.sh(project_dir, service, &transport.request_command(method, endpoint))?;
            if out.success() {
                return Ok(());
            }
            tracing::debug!(service, tool = transport.tool(), code = ?out.code, "transport request failed");
            last_error = Some(if out.stderr.trim().is_empty() {
                format!("{} exited with code {:?}", transport.tool(), out.code)
            } else {
                out.stderr
            });
        }

        Err(match last_error {
            Some(last_error) => StepCause::TransportsExhausted { last_error },
            None => StepCause::NoTransport {
                service: service.to_string(),
            },
        })
    }

    fn sh(
        &self,
        project_dir: &Path,
        service: &str,
        command: &str,
    ) -> Result<CommandOutput, ComposeError> {
        let argv = vec!["sh".to_string(), "-c".to_string(), command.to_string()];
        self.backend.exec(project_dir, service, &argv)
    }
}

fn exit_ok(out: CommandOutput) -> Result<(), StepCause> {
    if out.success() {
        Ok(())
    } else {
        Err(StepCause::CommandFailed {
            code: out.code,
            stderr: out.stderr,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
