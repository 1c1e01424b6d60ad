//! Admission scheduler: the public entry point.
//!
//! Under light load requests pass straight through to the pipeline. With
//! batching enabled and callers already waiting, requests are folded into
//! combined batches: the batch builder opens a time window on the first
//! queued request and greedily drains more until the size cap or the window
//! is hit. One pipeline round-trip then answers every folded request, each
//! caller getting exactly its own score slice back, in its own input order.

use crate::pipeline::{InferenceResult, Pipeline};
use crate::TextRerankerError;
use crate::config::BatchingConfig;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::instrument;

/// Average characters per token for the cheap length estimate. English prose
/// sits around 4; the exact value only affects batch ordering, not results.
const CHARS_PER_TOKEN: usize = 4;

/// Special tokens added around a (query, document) pair: [CLS] q [SEP] d [SEP]
const PAIR_SPECIAL_TOKENS: usize = 3;

struct PendingRequest {
    pairs: Vec<(String, String)>,
    response_tx: oneshot::Sender<Result<InferenceResult, TextRerankerError>>,
    submitted: Instant,
}

#[derive(Debug)]
pub struct AdmissionScheduler {
    pipeline: Arc<Pipeline>,
    batcher: Option<async_channel::Sender<PendingRequest>>,
    batching: BatchingConfig,
}

impl AdmissionScheduler {
    /// Must be called from within a tokio runtime when batching is enabled:
    /// the batch builder runs as a background task.
    pub fn new(pipeline: Arc<Pipeline>, batching: BatchingConfig) -> Self {
        let batcher = if batching.enabled {
            let (tx, rx) = async_channel::bounded(batching.queue_capacity);
            tokio::spawn(batch_builder(rx, pipeline.clone(), batching.clone()));
            tracing::info!(
                "Batching enabled: max_batch_size={}, window={:?}, length_aware={}",
                batching.max_batch_size,
                batching.window,
                batching.length_aware
            );
            Some(tx)
        } else {
            None
        };

        Self {
            pipeline,
            batcher,
            batching,
        }
    }

    /// Score `pairs`, blocking the caller until done or timed out.
    #[instrument(skip_all)]
    pub async fn schedule(
        &self,
        pairs: Vec<(String, String)>,
    ) -> Result<InferenceResult, TextRerankerError> {
        if pairs.is_empty() {
            return Err(TextRerankerError::Validation(
                "`pairs` cannot be empty".to_string(),
            ));
        }

        match &self.batcher {
            // Fast path: batching disabled, or nobody else is waiting to be
            // admitted. Avoids imposing the batch window as a latency floor
            // under light load.
            None => self.pipeline.infer(pairs).await,
            Some(batcher) if batcher.is_empty() => self.pipeline.infer(pairs).await,
            Some(_) => self.enqueue(pairs)?.await.expect(
                "Batch builder dropped the completion sender without responding. This is a bug.",
            ),
        }
    }

    /// Queue a request for the batch builder.
    pub(crate) fn enqueue(
        &self,
        pairs: Vec<(String, String)>,
    ) -> Result<oneshot::Receiver<Result<InferenceResult, TextRerankerError>>, TextRerankerError>
    {
        let batcher = self
            .batcher
            .as_ref()
            .expect("enqueue is only reachable with batching enabled");
        let (response_tx, response_rx) = oneshot::channel();
        let request = PendingRequest {
            pairs,
            response_tx,
            submitted: Instant::now(),
        };
        match batcher.try_send(request) {
            Ok(()) => {
                let gauge = metrics::gauge!("tr_admission_queue_size");
                gauge.set(batcher.len() as f64);
                Ok(response_rx)
            }
            Err(async_channel::TrySendError::Full(_)) => {
                let counter = metrics::counter!("tr_request_failure", "err" => "overloaded");
                counter.increment(1);
                Err(TextRerankerError::QueueFull("admission"))
            }
            Err(async_channel::TrySendError::Closed(_)) => Err(TextRerankerError::Worker(
                "batch builder is not running".to_string(),
            )),
        }
    }

    pub fn batching(&self) -> &BatchingConfig {
        &self.batching
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }
}

/// Blocks until at least one request is queued, then drains more until the
/// size cap or the window expires, whichever comes first.
async fn batch_builder(
    queue: async_channel::Receiver<PendingRequest>,
    pipeline: Arc<Pipeline>,
    config: BatchingConfig,
) {
    loop {
        let first = match queue.recv().await {
            Ok(first) => first,
            Err(_) => break,
        };

        let mut batch = vec![first];
        let deadline = tokio::time::Instant::now() + config.window;
        while batch.len() < config.max_batch_size {
            match tokio::time::timeout_at(deadline, queue.recv()).await {
                Ok(Ok(request)) => batch.push(request),
                // Queue closed: process what we have, then stop.
                Ok(Err(_)) => break,
                // Window expired.
                Err(_) => break,
            }
        }

        let histogram = metrics::histogram!("tr_admission_batch_size");
        histogram.record(batch.len() as f64);

        process_batch(&pipeline, batch, config.length_aware).await;
    }
    tracing::debug!("Batch builder stopped");
}

/// Concatenate the folded requests, run one combined inference, then fan the
/// scores back out. Any failure is broadcast identically to every request.
async fn process_batch(pipeline: &Pipeline, batch: Vec<PendingRequest>, length_aware: bool) {
    let dispatch_time = Instant::now();

    let spans: Vec<usize> = batch.iter().map(|request| request.pairs.len()).collect();
    let mut all_pairs: Vec<(String, String)> = batch
        .iter()
        .flat_map(|request| request.pairs.iter().cloned())
        .collect();

    let order = if length_aware && all_pairs.len() > 1 {
        let order = length_sorted_order(&all_pairs);
        all_pairs = apply_order(all_pairs, &order);
        Some(order)
    } else {
        None
    };

    match pipeline.infer(all_pairs).await {
        Ok(combined) => {
            let scores = match &order {
                Some(order) => restore_order(combined.scores.clone(), order),
                None => combined.scores.clone(),
            };

            let mut offset = 0;
            for (request, span) in batch.into_iter().zip(spans) {
                let admission_wait = dispatch_time.duration_since(request.submitted);
                let mut metadata = combined.metadata.clone();
                metadata.queue += admission_wait;
                metadata.total = request.submitted.elapsed();

                let slice = InferenceResult {
                    scores: scores[offset..offset + span].to_vec(),
                    metadata,
                    stats: combined.stats,
                    batch_size: combined.batch_size,
                    model_worker_id: combined.model_worker_id,
                    tokenizer_worker_id: combined.tokenizer_worker_id,
                };
                offset += span;
                let _ = request.response_tx.send(Ok(slice));
            }
        }
        Err(err) => {
            tracing::error!("Combined batch failed: {err}");
            for request in batch {
                let _ = request.response_tx.send(Err(err.clone()));
            }
        }
    }
}

/// Estimate token count from character length. Fast and rough: real
/// tokenization is what the tokenizer stage is for.
fn estimate_token_length(text: &str) -> usize {
    (text.chars().count() / CHARS_PER_TOKEN).max(1)
}

fn estimate_pair_length(pair: &(String, String)) -> usize {
    estimate_token_length(&pair.0) + estimate_token_length(&pair.1) + PAIR_SPECIAL_TOKENS
}

/// Indices of `pairs` sorted by estimated length, shortest first.
fn length_sorted_order(pairs: &[(String, String)]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..pairs.len()).collect();
    order.sort_by_key(|&i| estimate_pair_length(&pairs[i]));
    order
}

fn apply_order<T>(items: Vec<T>, order: &[usize]) -> Vec<T> {
    let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
    order
        .iter()
        .map(|&i| slots[i].take().expect("order is a permutation"))
        .collect()
}

/// Inverse of `apply_order`: `sorted[k]` belongs at original index
/// `order[k]`.
fn restore_order(sorted: Vec<f32>, order: &[usize]) -> Vec<f32> {
    let mut restored = vec![0.0; sorted.len()];
    for (k, score) in sorted.into_iter().enumerate() {
        restored[order[k]] = score;
    }
    restored
}
