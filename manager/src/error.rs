//! Error taxonomy
//!
//! Library-level error type shared by the build pipeline, the runtime
//! adapters, and the monitor. "Not found" is deliberately absent: absent
//! containers and images are normal negative results and are encoded in
//! return types (`Option`, `StopOutcome::NotFound`) instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The container engine could not be reached. Raised by pre-flight
    /// checks before any filesystem or engine mutation happens.
    #[error("container engine unavailable: {0}")]
    EngineUnavailable(String),

    /// The required package artifact could not be located after fetch.
    #[error("package artifact not found: {0}")]
    ArtifactNotFound(String),

    /// The engine build step failed. Carries the build log collected up to
    /// the point of failure.
    #[error("image build failed")]
    BuildFailed { log: Vec<String> },

    /// A container/pod or worker with this identity already exists.
    #[error("already running: {0}")]
    AlreadyRunning(String),

    /// Malformed identity or request inputs.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An exec-based operation kept failing in transport after the retry
    /// bound was exhausted.
    #[error("exec failed after retries: {output}")]
    TransientExecFailure { output: String },

    #[error(transparent)]
    Engine(#[from] bollard::errors::Error),

    #[error(transparent)]
    Cluster(#[from] kube::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
