use anyhow::Context;
use clap::Parser;
use compose_runtime::ComposeRuntime;
use convoy_core::controller::Controller;
use convoy_core::paths::DEFAULT_STATE_DIR;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "convoy",
    about = "Keep the compose stacks declared in a repository running, with cron-scheduled maintenance tasks",
    version
)]
struct Cli {
    /// Repository containing .convoy.yaml and the app project directories
    #[arg(long, env = "CONVOY_REPO_PATH")]
    repo_path: PathBuf,

    /// Where state and task logs live (default: <repo>/.convoy-state)
    #[arg(long, env = "CONVOY_STATE_PATH")]
    state_path: Option<PathBuf>,

    /// Run a single reconciliation pass and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let state_path = cli
        .state_path
        .unwrap_or_else(|| cli.repo_path.join(DEFAULT_STATE_DIR));

    let backend = Arc::new(ComposeRuntime::detect().context("no compose frontend available")?);
    let controller = Controller::new(&cli.repo_path, &state_path, backend)
        .context("failed to initialize controller")?;

    controller.reconcile();

    if cli.once {
        controller.shutdown(None);
        return Ok(());
    }

    let watcher = controller
        .start_watcher()
        .context("failed to watch repository")?;
    tracing::info!(repo = %cli.repo_path.display(), "watching for changes");

    wait_for_shutdown_signal().await?;
    tracing::info!("shutting down");
    controller.shutdown(Some(watcher));
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
