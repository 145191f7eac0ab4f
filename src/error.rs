use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("{} already exists - will not overwrite data!", .0.display())]
    ResultsExist(PathBuf),

    #[error("failed to create {}: {source}", .path.display())]
    ResultsDir {
        path: PathBuf,
        #[source]
        source: fs_extra::error::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid time format {0:?}")]
    InvalidTimeFormat(String),

    #[error("runner for `{0}` already started")]
    RunnerStarted(String),

    #[error("runner for `{0}` was never started")]
    RunnerNotStarted(String),

    #[error("collector already started")]
    CollectorStarted,

    #[error("runner task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl RecorderError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        RecorderError::Io {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, RecorderError>;
