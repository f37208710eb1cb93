use std::path::PathBuf;

use thiserror::Error;

/// Every way a generation request can fail.
#[derive(Debug, Error)]
pub enum PlumeError {
    /// Rejected before any model call: bad batch size, malformed dimensions and the like.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The sampler, decoder, text encoder or a tensor op failed. Aborts the request.
    #[error("generation failed: {0:#}")]
    Generation(anyhow::Error),

    /// An external collaborator broke its contract, e.g. a classifier returned the wrong number of flags.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    #[error("artifact missing: {0}")]
    ArtifactMissing(String),

    #[error("watermark error: {0}")]
    Watermark(String),

    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error("generation queue is full")]
    QueueFull,

    #[error("generation service is not running")]
    ServiceUnavailable,

    #[error("generation panicked: {0}")]
    Panicked(String),

    #[error("failed to spawn worker: {0}")]
    Worker(#[source] std::io::Error),
}

impl PlumeError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn generation(error: impl Into<anyhow::Error>) -> Self {
        Self::Generation(error.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<candle_core::Error> for PlumeError {
    fn from(error: candle_core::Error) -> Self {
        Self::Generation(error.into())
    }
}

pub type Result<T> = std::result::Result<T, PlumeError>;
