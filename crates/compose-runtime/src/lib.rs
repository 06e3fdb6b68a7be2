//! Docker Compose lifecycle adapter.
//!
//! Everything convoy does to a stack goes through the [`ComposeBackend`]
//! trait: bring a project up, tear it down, run a one-shot service, or exec
//! inside a running one. The adapter reports the exit code and captured
//! output of each invocation; deciding what a non-zero exit *means* is the
//! caller's job. [`ComposeRuntime`] is the real subprocess-backed
//! implementation; tests substitute their own recording backends.

mod error;
mod runtime;

pub use error::{ComposeError, Result};
pub use runtime::{detect_compose_cli, ComposeCli, ComposeRuntime};

use std::path::Path;

/// Exit status and captured streams of one compose invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code, or `None` if the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Compose lifecycle operations against one project directory.
///
/// `Err` means the invocation itself could not happen (binary missing,
/// spawn failure). A command that ran and exited non-zero is `Ok` with a
/// non-success [`CommandOutput`].
pub trait ComposeBackend: Send + Sync {
    /// `up -d --build`: idempotent start/build of the whole stack.
    fn up(&self, project_dir: &Path) -> Result<CommandOutput>;

    /// `down`: stop and remove the stack's containers.
    fn down(&self, project_dir: &Path) -> Result<CommandOutput>;

    /// `run --rm <service>`: one-shot ephemeral run of a service.
    fn run_service(&self, project_dir: &Path, service: &str) -> Result<CommandOutput>;

    /// `exec -T <service> <argv...>`: run a command in a running service.
    fn exec(&self, project_dir: &Path, service: &str, argv: &[String]) -> Result<CommandOutput>;
}
