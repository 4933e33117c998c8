//! Error types for benchsweep-core.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SweepError {
    #[error("Invalid configuration space: {0}")]
    InvalidSpace(String),

    #[error("Result store unavailable at {path}: {source}")]
    StorageUnavailable {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Result store error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Lost track of `{command}`: {source}")]
    Monitor {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed measurement before marker: {fragment:?}")]
    Parse { fragment: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid timestamp in result store: {0}")]
    Timestamp(#[from] chrono::ParseError),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid sweep configuration: {0}")]
    Config(String),

    #[error("A sweep is already running on this controller")]
    AlreadyRunning,

    #[error("Sweep worker panicked")]
    WorkerPanicked,
}

impl SweepError {
    /// Errors that only affect the configuration being measured.
    ///
    /// The controller logs these and moves on; anything else aborts the sweep.
    pub fn is_per_configuration(&self) -> bool {
        matches!(
            self,
            SweepError::Spawn { .. } | SweepError::Parse { .. } | SweepError::Monitor { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SweepError>;
