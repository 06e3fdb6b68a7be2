//! Compose binary detection and subprocess invocation.
//!
//! Two compose frontends exist in the wild: the `docker compose` plugin and
//! the standalone `docker-compose` binary. Detection probes for them in that
//! order; both speak the same command surface, so the rest of the adapter
//! only differs in the program name and leading arguments.

use std::path::Path;
use std::process::{Command, Stdio};

use crate::error::{ComposeError, Result};
use crate::CommandOutput;

/// The available compose frontends, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposeCli {
    /// `docker compose` (the CLI plugin).
    DockerPlugin,
    /// `docker-compose` (the standalone binary).
    Standalone,
}

impl ComposeCli {
    pub fn name(&self) -> &'static str {
        match self {
            ComposeCli::DockerPlugin => "docker compose",
            ComposeCli::Standalone => "docker-compose",
        }
    }

    /// Program to execute and the arguments that come before any
    /// compose subcommand.
    fn program(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            ComposeCli::DockerPlugin => ("docker", &["compose"]),
            ComposeCli::Standalone => ("docker-compose", &[]),
        }
    }
}

/// Detect the best available compose frontend.
/// Returns None if neither is on PATH.
pub fn detect_compose_cli() -> Option<ComposeCli> {
    if which::which("docker").is_ok() {
        return Some(ComposeCli::DockerPlugin);
    }
    if which::which("docker-compose").is_ok() {
        return Some(ComposeCli::Standalone);
    }
    None
}

/// Subprocess-backed [`crate::ComposeBackend`] implementation.
pub struct ComposeRuntime {
    cli: ComposeCli,
}

impl ComposeRuntime {
    /// Detect a compose frontend or fail with [`ComposeError::BinaryNotFound`].
    pub fn detect() -> Result<Self> {
        let cli = detect_compose_cli().ok_or(ComposeError::BinaryNotFound)?;
        tracing::debug!(cli = cli.name(), "detected compose frontend");
        Ok(Self { cli })
    }

    pub fn with_cli(cli: ComposeCli) -> Self {
        Self { cli }
    }

    fn invoke(&self, project_dir: &Path, tail: &[&str]) -> Result<CommandOutput> {
        let (program, args) = compose_argv(self.cli, project_dir, tail);
        tracing::debug!(command = %render(&program, &args), "invoking compose");

        let output = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| ComposeError::Spawn {
                command: render(&program, &args),
                source,
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl crate::ComposeBackend for ComposeRuntime {
    fn up(&self, project_dir: &Path) -> Result<CommandOutput> {
        self.invoke(project_dir, &["up", "-d", "--build"])
    }

    fn down(&self, project_dir: &Path) -> Result<CommandOutput> {
        self.invoke(project_dir, &["down"])
    }

    fn run_service(&self, project_dir: &Path, service: &str) -> Result<CommandOutput> {
        self.invoke(project_dir, &["run", "--rm", service])
    }

    fn exec(&self, project_dir: &Path, service: &str, argv: &[String]) -> Result<CommandOutput> {
        let mut tail = vec!["exec", "-T", service];
        tail.extend(argv.iter().map(String::as_str));
        self.invoke(project_dir, &tail)
    }
}

/// Build the full argument vector for one invocation.
/// Split out of `invoke` so it can be checked without a docker install.
fn compose_argv(cli: ComposeCli, project_dir: &Path, tail: &[&str]) -> (String, Vec<String>) {
    let (program, lead) = cli.program();
    let mut args: Vec<String> = lead.iter().map(|s| s.to_string()).collect();
    args.push("--project-directory".to_string());
    args.push(project_dir.display().to_string());
    args.extend(tail.iter().map(|s| s.to_string()));
    (program.to_string(), args)
}

fn render(program: &str, args: &[String]) -> String {
    let mut out = program.to_string();
    for a in args {
        out.push(' ');
        out.push_str(a);
    }
    out
}
