//! Typed configuration consumed by the core.
//!
//! Parsing (files, CLI, env) is owned by the hosting service; the core only
//! validates the resulting structs at construction time.

use crate::TextRerankerError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use text_reranker_backend::{ModelPoolConfig, RoutingPolicy};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankerConfig {
    pub tokenizers: TokenizerPoolConfig,
    pub model_pool: ModelPoolConfig,
    pub batching: BatchingConfig,
    /// Upper bound on one request's end-to-end wait inside the pipeline
    pub request_timeout: Duration,
    /// Capacity of the queue between the tokenizer and model stages
    pub interstage_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenizerPoolConfig {
    pub workers: usize,
    /// Capacity of each worker's input queue
    pub queue_capacity: usize,
    /// Pairs longer than this are truncated, never rejected
    pub max_input_length: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    pub enabled: bool,
    /// Most requests folded into one combined batch
    pub max_batch_size: usize,
    /// How long the batch builder waits for more requests after the first
    pub window: Duration,
    /// Sort pairs by estimated token length before concatenation
    pub length_aware: bool,
    /// Capacity of the admission queue
    pub queue_capacity: usize,
}

impl Default for TokenizerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 8,
            max_input_length: 512,
        }
    }
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_batch_size: 8,
            window: Duration::from_millis(100),
            length_aware: false,
            queue_capacity: 64,
        }
    }
}

impl RerankerConfig {
    /// Fail fast on configurations that would start a broken service.
    pub fn validate(&self) -> Result<(), TextRerankerError> {
        if self.tokenizers.workers == 0 {
            return Err(TextRerankerError::Config(
                "tokenizer pool requires at least one worker".to_string(),
            ));
        }
        if self.tokenizers.queue_capacity == 0 {
            return Err(TextRerankerError::Config(
                "tokenizer queue capacity must be at least 1".to_string(),
            ));
        }
        if self.tokenizers.max_input_length == 0 {
            return Err(TextRerankerError::Config(
                "max input length must be at least 1".to_string(),
            ));
        }
        if self.model_pool.replicas == 0 {
            return Err(TextRerankerError::Config(
                "model pool requires at least one replica".to_string(),
            ));
        }
        if self.interstage_capacity == 0 {
            return Err(TextRerankerError::Config(
                "inter-stage queue capacity must be at least 1".to_string(),
            ));
        }
        if self.batching.enabled {
            if self.batching.max_batch_size == 0 {
                return Err(TextRerankerError::Config(
                    "max batch size must be at least 1".to_string(),
                ));
            }
            if self.batching.window.is_zero() {
                return Err(TextRerankerError::Config(
                    "batch window must be non-zero".to_string(),
                ));
            }
            if self.batching.queue_capacity == 0 {
                return Err(TextRerankerError::Config(
                    "admission queue capacity must be at least 1".to_string(),
                ));
            }
        }
        Ok(())
    }
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            tokenizers: TokenizerPoolConfig::default(),
            model_pool: ModelPoolConfig::default(),
            batching: BatchingConfig::default(),
            request_timeout: Duration::from_secs(30),
            interstage_capacity: 64,
        }
    }
}
