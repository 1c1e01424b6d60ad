pub mod config;
pub mod download;
pub mod pipeline;
pub mod scheduler;
pub mod tokenization;

use std::time::Duration;
use text_reranker_backend::BackendError;
use thiserror::Error;

/// Public error taxonomy.
///
/// Clone is required: a failure on a combined batch is broadcast identically
/// to every request that was folded into it.
#[derive(Error, Debug, Clone)]
pub enum TextRerankerError {
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("Input validation error: {0}")]
    Validation(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Could not start worker pool: {0}")]
    Startup(String),
    #[error("{0} queue is full")]
    QueueFull(&'static str),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("worker error: {0}")]
    Worker(String),
    #[error("routing error: {0}")]
    Routing(String),
    #[error("Backend error: {0}")]
    Backend(BackendError),
}

impl From<tokenizers::Error> for TextRerankerError {
    fn from(err: tokenizers::Error) -> Self {
        Self::Tokenizer(err.to_string())
    }
}

impl From<BackendError> for TextRerankerError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Start(message) => Self::Startup(message),
            BackendError::QueueFull(stage) => Self::QueueFull(stage),
            BackendError::Routing(message) => Self::Routing(message),
            other => Self::Backend(other),
        }
    }
}
