use thiserror::Error;

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("no compose binary found: install the docker compose plugin or docker-compose")]
    BinaryNotFound,

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ComposeError>;
