//! Tokenizer worker pool.
//!
//! N worker threads, each owning its own `Tokenizer` clone with truncation
//! and padding configured once at spawn. Dispatch is round-robin through an
//! atomic counter: tokenization cost is roughly uniform per pair, so no
//! affinity is needed. Each worker has its own bounded input queue that
//! fails fast when saturated; finished batches flow downstream on the shared
//! inter-stage queue, which applies backpressure to the worker threads.

use crate::TextRerankerError;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use text_reranker_backend::{PaddingStats, TokenizedBatch};
use tokenizers::tokenizer::Tokenizer;
use tokenizers::{PaddingParams, TruncationDirection, TruncationParams, TruncationStrategy};
use tracing::instrument;

/// One unit of tokenization work, tagged with the owning request id.
#[derive(Debug)]
pub struct TokenizeTask {
    pub id: u64,
    pub pairs: Vec<(String, String)>,
}

/// Tokenizer stage output. Per-item failures travel downstream so the
/// owning request can be completed with an error; the worker never dies.
#[derive(Debug)]
pub struct TokenizedItem {
    pub id: u64,
    pub result: Result<TokenizedBatch, TextRerankerError>,
}

#[derive(Debug, Clone, Default)]
pub struct TokenizerWorkerSnapshot {
    pub worker_id: usize,
    pub requests: u64,
    pub pairs: u64,
    pub cumulative: Duration,
}

#[derive(Debug, Default)]
struct WorkerCounters {
    requests: AtomicU64,
    pairs: AtomicU64,
    cumulative_nanos: AtomicU64,
}

#[derive(Debug)]
struct WorkerSlot {
    sender: async_channel::Sender<TokenizeTask>,
    counters: Arc<WorkerCounters>,
}

#[derive(Debug)]
pub struct TokenizerPool {
    workers: Vec<WorkerSlot>,
    next: AtomicUsize,
}

impl TokenizerPool {
    /// Spawn `workers` tokenizer threads feeding `output`.
    pub fn new(
        workers: usize,
        tokenizer: Tokenizer,
        max_input_length: usize,
        queue_capacity: usize,
        output: async_channel::Sender<TokenizedItem>,
    ) -> Result<Self, TextRerankerError> {
        if workers == 0 {
            return Err(TextRerankerError::Config(
                "tokenizer pool requires at least one worker".to_string(),
            ));
        }
        tracing::info!("Starting {workers} tokenization workers");

        let slots = (0..workers)
            .map(|worker_id| {
                let mut tokenizer = tokenizer.clone();
                tokenizer
                    .with_truncation(Some(TruncationParams {
                        direction: TruncationDirection::Right,
                        max_length: max_input_length,
                        strategy: TruncationStrategy::LongestFirst,
                        stride: 0,
                    }))
                    .map_err(TextRerankerError::from)?;
                tokenizer.with_padding(Some(PaddingParams::default()));

                let (sender, receiver) = async_channel::bounded(queue_capacity);
                let counters = Arc::new(WorkerCounters::default());
                let worker_counters = counters.clone();
                let worker_output = output.clone();
                std::thread::spawn(move || {
                    tokenizer_worker(worker_id, tokenizer, receiver, worker_output, worker_counters)
                });

                Ok(WorkerSlot { sender, counters })
            })
            .collect::<Result<Vec<_>, TextRerankerError>>()?;

        Ok(Self {
            workers: slots,
            next: AtomicUsize::new(0),
        })
    }

    /// Hand one task to the next worker, failing fast if its queue is full.
    #[instrument(skip_all)]
    pub fn submit(&self, task: TokenizeTask) -> Result<(), TextRerankerError> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        match self.workers[index].sender.try_send(task) {
            Ok(()) => Ok(()),
            Err(async_channel::TrySendError::Full(_)) => {
                let counter = metrics::counter!("tr_request_failure", "err" => "tokenizer_queue_full");
                counter.increment(1);
                Err(TextRerankerError::QueueFull("tokenizer worker"))
            }
            Err(async_channel::TrySendError::Closed(_)) => Err(TextRerankerError::Worker(
                "tokenizer worker queue is closed".to_string(),
            )),
        }
    }

    /// Per-worker request counts and cumulative latency.
    pub fn snapshots(&self) -> Vec<TokenizerWorkerSnapshot> {
        self.workers
            .iter()
            .enumerate()
            .map(|(worker_id, slot)| TokenizerWorkerSnapshot {
                worker_id,
                requests: slot.counters.requests.load(Ordering::Relaxed),
                pairs: slot.counters.pairs.load(Ordering::Relaxed),
                cumulative: Duration::from_nanos(
                    slot.counters.cumulative_nanos.load(Ordering::Relaxed),
                ),
            })
            .collect()
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }
}

fn tokenizer_worker(
    worker_id: usize,
    tokenizer: Tokenizer,
    receiver: async_channel::Receiver<TokenizeTask>,
    output: async_channel::Sender<TokenizedItem>,
    counters: Arc<WorkerCounters>,
) {
    while let Ok(task) = receiver.recv_blocking() {
        let start = Instant::now();
        let result = tokenize_pairs(&tokenizer, task.pairs, worker_id);
        let elapsed = start.elapsed();

        counters.requests.fetch_add(1, Ordering::Relaxed);
        if let Ok(batch) = &result {
            counters
                .pairs
                .fetch_add(batch.batch_size as u64, Ordering::Relaxed);
        }
        counters
            .cumulative_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        let histogram = metrics::histogram!("tr_tokenize_duration");
        histogram.record(elapsed.as_secs_f64());

        if output
            .send_blocking(TokenizedItem {
                id: task.id,
                result,
            })
            .is_err()
        {
            // Inter-stage queue closed: the pipeline is gone.
            break;
        }
    }
    tracing::debug!("Tokenizer worker {worker_id} stopped");
}

/// Encode (query, document) pairs into one fixed-shape batch and measure how
/// much of the resulting tensor is padding.
fn tokenize_pairs(
    tokenizer: &Tokenizer,
    pairs: Vec<(String, String)>,
    worker_id: usize,
) -> Result<TokenizedBatch, TextRerankerError> {
    if pairs.is_empty() {
        return Err(TextRerankerError::Validation(
            "`pairs` cannot be empty".to_string(),
        ));
    }

    let start = Instant::now();
    let batch_size = pairs.len();
    let encodings = tokenizer.encode_batch(pairs, true)?;

    let max_length = encodings.iter().map(|e| e.len()).max().unwrap_or(0);
    let mut input_ids = Vec::with_capacity(batch_size * max_length);
    let mut attention_mask = Vec::with_capacity(batch_size * max_length);
    let mut token_type_ids = Vec::with_capacity(batch_size * max_length);
    let mut real_tokens = 0usize;
    let mut max_seq_length = 0usize;

    for encoding in &encodings {
        let mask = encoding.get_attention_mask();
        let real: usize = mask.iter().map(|m| *m as usize).sum();
        real_tokens += real;
        max_seq_length = max_seq_length.max(real);

        input_ids.extend_from_slice(encoding.get_ids());
        attention_mask.extend_from_slice(mask);
        token_type_ids.extend_from_slice(encoding.get_type_ids());
    }

    let total_tokens = batch_size * max_length;
    let padded_tokens = total_tokens - real_tokens;
    let stats = PaddingStats {
        total_tokens,
        real_tokens,
        padded_tokens,
        padding_ratio: if total_tokens > 0 {
            padded_tokens as f32 / total_tokens as f32
        } else {
            0.0
        },
        max_seq_length,
        avg_seq_length: real_tokens as f32 / batch_size as f32,
    };

    Ok(TokenizedBatch {
        input_ids,
        attention_mask,
        token_type_ids,
        batch_size,
        max_length,
        stats,
        tokenization: start.elapsed(),
        tokenizer_id: worker_id,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokenizers::models::wordlevel::WordLevel;
    use tokenizers::pre_tokenizers::whitespace::Whitespace;

    /// Tiny whitespace tokenizer so tests need no model artifacts.
    pub(crate) fn test_tokenizer() -> Tokenizer {
        let vocab: HashMap<String, u32> = [
            ("[PAD]", 0),
            ("[UNK]", 1),
            ("what", 2),
            ("is", 3),
            ("rust", 4),
            ("a", 5),
            ("systems", 6),
            ("language", 7),
            ("fast", 8),
            ("crab", 9),
        ]
        .into_iter()
        .map(|(token, id)| (token.to_string(), id))
        .collect();

        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token("[UNK]".to_string())
            .build()
            .unwrap();
        let mut tokenizer = Tokenizer::new(model);
        tokenizer.with_pre_tokenizer(Whitespace {});
        tokenizer
    }

    fn pair(query: &str, doc: &str) -> (String, String) {
        (query.to_string(), doc.to_string())
    }

    fn pool_with_output(
        workers: usize,
        queue_capacity: usize,
        interstage_capacity: usize,
    ) -> (TokenizerPool, async_channel::Receiver<TokenizedItem>) {
        let (tx, rx) = async_channel::bounded(interstage_capacity);
        let pool =
            TokenizerPool::new(workers, test_tokenizer(), 16, queue_capacity, tx).unwrap();
        (pool, rx)
    }

    #[test]
    fn batch_shape_and_padding_stats() {
        let tokenizer = {
            let mut t = test_tokenizer();
            t.with_truncation(Some(TruncationParams {
                direction: TruncationDirection::Right,
                max_length: 16,
                strategy: TruncationStrategy::LongestFirst,
                stride: 0,
            }))
            .unwrap();
            t.with_padding(Some(PaddingParams::default()));
            t
        };

        let batch = tokenize_pairs(
            &tokenizer,
            vec![
                pair("what is rust", "a systems language"),
                pair("fast", "crab"),
            ],
            3,
        )
        .unwrap();

        assert_eq!(batch.batch_size, 2);
        assert_eq!(batch.tokenizer_id, 3);
        // Second row is shorter, so the batch must contain padding.
        assert!(batch.stats.padded_tokens > 0);
        assert_eq!(
            batch.stats.real_tokens + batch.stats.padded_tokens,
            batch.stats.total_tokens
        );
        assert_eq!(batch.input_ids.len(), batch.batch_size * batch.max_length);
        assert_eq!(batch.attention_mask.len(), batch.input_ids.len());

        // Row 1's real tokens: "fast" + "crab".
        let (ids, mask) = batch.sequence(1);
        let real: Vec<u32> = ids
            .iter()
            .zip(mask)
            .filter(|(_, m)| **m == 1)
            .map(|(id, _)| *id)
            .collect();
        assert_eq!(real, vec![8, 9]);
    }

    #[test]
    fn long_pairs_are_truncated_not_rejected() {
        let mut tokenizer = test_tokenizer();
        tokenizer
            .with_truncation(Some(TruncationParams {
                direction: TruncationDirection::Right,
                max_length: 4,
                strategy: TruncationStrategy::LongestFirst,
                stride: 0,
            }))
            .unwrap();
        tokenizer.with_padding(Some(PaddingParams::default()));

        let long_doc = "a systems language ".repeat(50);
        let batch = tokenize_pairs(&tokenizer, vec![pair("what is rust", &long_doc)], 0).unwrap();
        assert_eq!(batch.max_length, 4);
    }

    #[test]
    fn empty_task_is_a_validation_error() {
        let tokenizer = test_tokenizer();
        assert!(matches!(
            tokenize_pairs(&tokenizer, vec![], 0),
            Err(TextRerankerError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn round_robin_spreads_tasks_across_workers() {
        let (pool, rx) = pool_with_output(3, 8, 64);
        for id in 0..9 {
            pool.submit(TokenizeTask {
                id,
                pairs: vec![pair("fast", "crab")],
            })
            .unwrap();
        }
        for _ in 0..9 {
            let item = rx.recv().await.unwrap();
            assert!(item.result.is_ok());
        }

        let snapshots = pool.snapshots();
        let counts: Vec<u64> = snapshots.iter().map(|s| s.requests).collect();
        assert_eq!(counts, vec![3, 3, 3]);
    }

    #[tokio::test]
    async fn saturated_worker_queue_fails_fast() {
        // Inter-stage queue of 1 and a single worker: the worker blocks on
        // the full output, its own queue fills, further submissions fail.
        let (pool, rx) = pool_with_output(1, 2, 1);

        let mut accepted = 0;
        let mut rejected = 0;
        for id in 0..32 {
            match pool.submit(TokenizeTask {
                id,
                pairs: vec![pair("fast", "crab")],
            }) {
                Ok(()) => accepted += 1,
                Err(TextRerankerError::QueueFull(_)) => {
                    rejected += 1;
                    break;
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(accepted >= 2);
        assert_eq!(rejected, 1);

        // Drain so the worker thread can finish its backlog.
        for _ in 0..accepted {
            rx.recv().await.unwrap();
        }
    }

    #[tokio::test]
    async fn per_item_failure_flows_downstream() {
        let (pool, rx) = pool_with_output(1, 8, 8);
        pool.submit(TokenizeTask { id: 7, pairs: vec![] }).unwrap();
        let item = rx.recv().await.unwrap();
        assert_eq!(item.id, 7);
        assert!(matches!(
            item.result,
            Err(TextRerankerError::Validation(_))
        ));

        // The worker is still alive afterwards.
        pool.submit(TokenizeTask {
            id: 8,
            pairs: vec![pair("fast", "crab")],
        })
        .unwrap();
        assert!(rx.recv().await.unwrap().result.is_ok());
    }
}
