//! Error taxonomy for the explanation and scoring pipeline
//!
//! Errors local to one feature (data, sampling, generation, a single unit's
//! persistence) are caught by the batch executor and recorded against that
//! feature. Only setup failures abort a whole batch.

use std::path::PathBuf;

use thiserror::Error;

use crate::feature::Feature;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;

/// Malformed or insufficient activation data
#[derive(Debug, Error)]
pub enum DataError {
    #[error("{feature}: {available} examples available, at least {required} required")]
    InsufficientExamples {
        feature: Feature,
        available: usize,
        required: usize,
    },

    #[error("{tokens} tokens but {activations} activations")]
    LengthMismatch { tokens: usize, activations: usize },

    #[error("failed to decode token ids: {0}")]
    Decode(String),
}

/// Remote model call failures
#[derive(Debug, Error)]
pub enum ClientError {
    /// Retryable: timeouts, connection resets, rate limits, 5xx
    #[error("transient client error: {0}")]
    Transient(String),

    /// Non-retryable: bad request, auth, unknown model
    #[error("permanent client error: {0}")]
    Permanent(String),

    /// The model answered, but not in the requested shape
    #[error("malformed model response: {0}")]
    MalformedResponse(String),
}

/// Split sizes that the available examples cannot satisfy
#[derive(Debug, Error)]
pub enum SamplingError {
    #[error("n_quantiles must be at least 1")]
    NoQuantiles,

    #[error("need {needed} examples for the requested split, only {available} available")]
    InsufficientPool { needed: usize, available: usize },
}

/// Explanation generation failures
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("no training examples to explain")]
    EmptyTrainSet,

    #[error("explanation request for {feature} failed: {source}")]
    Model {
        feature: Feature,
        #[source]
        source: ClientError,
    },
}

/// Artifact read/write failures
#[derive(Debug, Error)]
#[error("{op} {}: {source}", .path.display())]
pub struct PersistenceError {
    pub op: &'static str,
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Top-level pipeline error
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Sampling(#[from] SamplingError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Client(ClientError::Transient(_) | ClientError::MalformedResponse(_))
        )
    }

    /// Whether this error means "skip the feature", not "the unit failed"
    pub fn is_insufficient_data(&self) -> bool {
        matches!(self, Error::Data(_) | Error::Sampling(_))
    }
}

impl From<candle_core::Error> for Error {
    fn from(err: candle_core::Error) -> Self {
        Error::Embedding(err.to_string())
    }
}
