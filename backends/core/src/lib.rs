use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// A fixed-shape batch of tokenized (query, document) pairs.
///
/// Features are flattened row-major: row `i` occupies
/// `[i * max_length, (i + 1) * max_length)` in every feature vector. The
/// batch crosses the process boundary between the scheduling process and the
/// model worker processes, so it carries no references, only owned buffers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizedBatch {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    pub token_type_ids: Vec<u32>,
    pub batch_size: usize,
    pub max_length: usize,
    pub stats: PaddingStats,
    /// Time spent tokenizing this batch
    pub tokenization: Duration,
    /// Id of the tokenizer worker that produced this batch
    pub tokenizer_id: usize,
}

impl TokenizedBatch {
    pub fn len(&self) -> usize {
        self.batch_size
    }

    pub fn is_empty(&self) -> bool {
        self.batch_size == 0
    }

    /// Input ids and attention mask for row `i`
    pub fn sequence(&self, i: usize) -> (&[u32], &[u32]) {
        let start = i * self.max_length;
        let end = start + self.max_length;
        (
            &self.input_ids[start..end],
            &self.attention_mask[start..end],
        )
    }

    /// Batch of random full-length sequences used to warm a model up before
    /// it is marked ready.
    pub fn warmup(batch_size: usize, max_length: usize, max_token: u32) -> Self {
        let mut rng = rand::thread_rng();
        let elements = batch_size * max_length;
        let input_ids: Vec<u32> = (0..elements).map(|_| rng.gen_range(0..max_token)).collect();

        Self {
            input_ids,
            attention_mask: vec![1; elements],
            token_type_ids: vec![0; elements],
            batch_size,
            max_length,
            stats: PaddingStats {
                total_tokens: elements,
                real_tokens: elements,
                padded_tokens: 0,
                padding_ratio: 0.0,
                max_seq_length: max_length,
                avg_seq_length: max_length as f32,
            },
            tokenization: Duration::ZERO,
            tokenizer_id: 0,
        }
    }
}

/// How much of a batch's tensor is real content vs. padding.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PaddingStats {
    pub total_tokens: usize,
    pub real_tokens: usize,
    pub padded_tokens: usize,
    pub padding_ratio: f32,
    pub max_seq_length: usize,
    pub avg_seq_length: f32,
}

/// One model replica, owned by a single worker process.
///
/// Construction loads the model; `warmup` runs dummy forward passes so the
/// first real request does not pay one-time initialization costs.
/// Implementations are not required to be thread-safe: each replica lives in
/// its own process and all access is serialized through that process's input
/// channel.
pub trait ScoringModel {
    /// Run one forward pass, returning one relevance score per row.
    fn predict(&self, batch: &TokenizedBatch) -> Result<Vec<f32>, BackendError>;

    fn warmup(&self, iterations: usize) -> Result<(), BackendError> {
        for _ in 0..iterations {
            self.predict(&TokenizedBatch::warmup(2, 16, 1000))?;
        }
        Ok(())
    }

    /// Model memory footprint in MB, if the backend can report it.
    fn memory_usage_mb(&self) -> f32 {
        0.0
    }
}

/// Deterministic stand-in model used by tests, CI and latency benchmarks.
///
/// Scores depend only on the real (unmasked) token ids of a row, so a pair
/// scores identically whether it is batched alone or padded into a larger
/// batch, and identically across replicas. Scores are squashed into (0, 1)
/// like a real cross-encoder head.
#[derive(Debug, Default, Clone)]
pub struct MockModel;

impl MockModel {
    pub fn new() -> Self {
        Self
    }

    fn score_sequence(ids: &[u32], mask: &[u32]) -> f32 {
        // FNV-1a over the real token ids, folded into a logit in [-4, 4].
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for (id, m) in ids.iter().zip(mask) {
            if *m == 0 {
                continue;
            }
            hash ^= u64::from(*id);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        let unit = (hash >> 11) as f64 / (1u64 << 53) as f64;
        let logit = 8.0 * unit - 4.0;
        (1.0 / (1.0 + (-logit).exp())) as f32
    }
}

impl ScoringModel for MockModel {
    fn predict(&self, batch: &TokenizedBatch) -> Result<Vec<f32>, BackendError> {
        if batch.is_empty() {
            return Err(BackendError::Inference("empty batch".to_string()));
        }
        let mut scores = Vec::with_capacity(batch.batch_size);
        for i in 0..batch.batch_size {
            let (ids, mask) = batch.sequence(i);
            scores.push(Self::score_sequence(ids, mask));
        }
        Ok(scores)
    }
}

#[derive(Debug, Error, Clone)]
pub enum BackendError {
    #[error("Could not start backend: {0}")]
    Start(String),
    #[error("{0}")]
    Inference(String),
    #[error("Worker ipc error: {0}")]
    Ipc(String),
    #[error("{0} queue is full")]
    QueueFull(&'static str),
    #[error("Routing error: {0}")]
    Routing(String),
    #[error("Unsupported backend: {0}")]
    Unsupported(String),
}
