use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConvoyError {
    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Cron(#[from] crate::schedule::CronParseError),

    #[error("app directory not found: {0}")]
    AppPathMissing(PathBuf),

    #[error(transparent)]
    Compose(#[from] compose_runtime::ComposeError),

    #[error(transparent)]
    Step(#[from] crate::executor::StepError),

    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConvoyError>;
