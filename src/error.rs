//! Error types for regret-guard.
//!
//! None of these reach the user of a messaging surface directly: classifier
//! failures are folded into a fail-open result, puzzle errors are rejections,
//! and config errors fall back to defaults inside the stores.

use std::path::PathBuf;

/// Failures of a single classification round-trip.
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("classifier did not answer within {0} ms")]
    Timeout(u64),

    #[error("classifier returned HTTP {status}")]
    Server { status: u16 },

    #[error("malformed classifier response: {0}")]
    Decode(String),

    #[error("request aborted")]
    Aborted,

    #[error("text exceeds maximum length of {max} characters ({len})")]
    TextTooLong { len: usize, max: usize },
}

impl From<reqwest::Error> for ClassifyError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ClassifyError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            ClassifyError::Server {
                status: status.as_u16(),
            }
        } else {
            ClassifyError::Transport(err.to_string())
        }
    }
}

/// A candidate answer that could not even be compared.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PuzzleError {
    #[error("expected a whole number, got {0:?}")]
    Malformed(String),
}

/// User actions the intervention controller refuses.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InterventionError {
    #[error("Solve the puzzle first to send this message.")]
    PuzzleRequired,

    #[error("no intervention is active")]
    NoEpisode,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config file malformed: {path}: {details}")]
    Parse { path: PathBuf, details: String },

    #[error("invalid classifier endpoint {endpoint:?}: {details}")]
    InvalidEndpoint { endpoint: String, details: String },

    #[error("regret threshold must be within 0..=100, got {0}")]
    InvalidThreshold(u8),

    #[error("request timeout must be positive")]
    InvalidTimeout,

    #[error("no config directory available on this platform")]
    NoConfigDir,
}
