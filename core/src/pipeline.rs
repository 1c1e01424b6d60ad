//! Two-stage inference pipeline.
//!
//! Tokenization and model inference run fully overlapped: requests enter the
//! tokenizer pool, tokenized batches cross one bounded inter-stage queue,
//! and the model pool answers asynchronously on a shared result stream. The
//! in-flight table is the only state touched by more than one stage; every
//! read, write and remove holds its lock. Results rejoin their caller by
//! request id, never by position.

use crate::config::RerankerConfig;
use crate::tokenization::{TokenizeTask, TokenizedItem, TokenizerPool, TokenizerWorkerSnapshot};
use crate::TextRerankerError;
use nohash_hasher::IntMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use text_reranker_backend::protocol::{WorkItem, WorkResult};
use text_reranker_backend::{ModelPool, PaddingStats};
use tokenizers::tokenizer::Tokenizer;
use tokio::sync::oneshot;
use tracing::instrument;

/// Final answer for one request: one score per input pair, in input order.
#[derive(Debug, Clone)]
pub struct InferenceResult {
    pub scores: Vec<f32>,
    pub metadata: InferMetadata,
    pub stats: PaddingStats,
    /// Rows in the batch this request was scored in (may exceed the
    /// request's own pair count when requests were folded together)
    pub batch_size: usize,
    pub model_worker_id: usize,
    pub tokenizer_worker_id: usize,
}

#[derive(Debug, Clone)]
pub struct InferMetadata {
    pub tokenization: Duration,
    /// Time spent waiting in queues, admission included
    pub queue: Duration,
    pub inference: Duration,
    pub total: Duration,
}

/// A registered request waiting for its completion signal.
#[derive(Debug)]
struct PendingEntry {
    response_tx: oneshot::Sender<Result<InferenceResult, TextRerankerError>>,
    submitted: Instant,
}

type InflightTable = Arc<Mutex<IntMap<u64, PendingEntry>>>;

#[derive(Debug)]
pub struct Pipeline {
    inflight: InflightTable,
    next_id: AtomicU64,
    tokenizers: TokenizerPool,
    pool: Arc<ModelPool>,
    request_timeout: Duration,
}

impl Pipeline {
    /// Wire both pools together and start the stage loops. Must be called
    /// from within a tokio runtime.
    pub fn new(
        config: &RerankerConfig,
        tokenizer: Tokenizer,
        pool: Arc<ModelPool>,
    ) -> Result<Self, TextRerankerError> {
        let (interstage_tx, interstage_rx) = async_channel::bounded(config.interstage_capacity);

        let tokenizers = TokenizerPool::new(
            config.tokenizers.workers,
            tokenizer,
            config.tokenizers.max_input_length,
            config.tokenizers.queue_capacity,
            interstage_tx,
        )?;

        let inflight: InflightTable = Arc::new(Mutex::new(IntMap::default()));

        tokio::spawn(consumer_loop(
            interstage_rx,
            pool.clone(),
            inflight.clone(),
        ));
        tokio::spawn(drain_loop(pool.take_results(), inflight.clone()));

        Ok(Self {
            inflight,
            next_id: AtomicU64::new(0),
            tokenizers,
            pool,
            request_timeout: config.request_timeout,
        })
    }

    /// Register a request and dispatch it to the tokenizer stage. Returns
    /// the issued id and the completion signal.
    pub(crate) fn submit(
        &self,
        pairs: Vec<(String, String)>,
    ) -> Result<
        (
            u64,
            oneshot::Receiver<Result<InferenceResult, TextRerankerError>>,
        ),
        TextRerankerError,
    > {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (response_tx, response_rx) = oneshot::channel();

        {
            let mut inflight = self.inflight.lock().expect("in-flight table lock poisoned");
            inflight.insert(
                id,
                PendingEntry {
                    response_tx,
                    submitted: Instant::now(),
                },
            );
            let gauge = metrics::gauge!("tr_inflight_requests");
            gauge.set(inflight.len() as f64);
        }

        if let Err(err) = self.tokenizers.submit(TokenizeTask { id, pairs }) {
            self.remove(id);
            return Err(err);
        }
        Ok((id, response_rx))
    }

    /// Score one pair list, waiting at most `request_timeout`. A timed-out
    /// request is removed from the table so its late result, if any, is
    /// discarded instead of misattributed.
    #[instrument(skip_all)]
    pub async fn infer(
        &self,
        pairs: Vec<(String, String)>,
    ) -> Result<InferenceResult, TextRerankerError> {
        let (id, response_rx) = self.submit(pairs)?;

        match tokio::time::timeout(self.request_timeout, response_rx).await {
            Ok(response) => response.expect(
                "Pipeline dropped the completion sender without responding. This is a bug.",
            ),
            Err(_) => {
                self.remove(id);
                let counter = metrics::counter!("tr_request_failure", "err" => "timeout");
                counter.increment(1);
                Err(TextRerankerError::Timeout(self.request_timeout))
            }
        }
    }

    pub fn tokenizer_snapshots(&self) -> Vec<TokenizerWorkerSnapshot> {
        self.tokenizers.snapshots()
    }

    pub fn model_pool(&self) -> &Arc<ModelPool> {
        &self.pool
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Number of requests currently registered.
    pub fn inflight(&self) -> usize {
        self.inflight.lock().expect("in-flight table lock poisoned").len()
    }

    fn remove(&self, id: u64) {
        let mut inflight = self.inflight.lock().expect("in-flight table lock poisoned");
        inflight.remove(&id);
        let gauge = metrics::gauge!("tr_inflight_requests");
        gauge.set(inflight.len() as f64);
    }
}

/// Take one entry out of the table; `None` means the caller gave up and the
/// result should be discarded.
fn take_entry(inflight: &InflightTable, id: u64) -> Option<PendingEntry> {
    let mut inflight = inflight.lock().expect("in-flight table lock poisoned");
    let entry = inflight.remove(&id);
    let gauge = metrics::gauge!("tr_inflight_requests");
    gauge.set(inflight.len() as f64);
    entry
}

/// Stage one -> stage two: move tokenized batches into the model pool.
async fn consumer_loop(
    interstage: async_channel::Receiver<TokenizedItem>,
    pool: Arc<ModelPool>,
    inflight: InflightTable,
) {
    while let Ok(item) = interstage.recv().await {
        let gauge = metrics::gauge!("tr_interstage_queue_size");
        gauge.set(interstage.len() as f64);
        match item.result {
            Ok(batch) => {
                if let Err(err) = pool.submit(WorkItem {
                    id: item.id,
                    batch,
                }) {
                    complete_with_error(&inflight, item.id, err.into());
                }
            }
            Err(err) => complete_with_error(&inflight, item.id, err),
        }
    }
    tracing::debug!("Inter-stage consumer loop stopped");
}

/// Stage two -> caller: correlate pool results back to waiting requests.
async fn drain_loop(
    mut results: tokio::sync::mpsc::Receiver<WorkResult>,
    inflight: InflightTable,
) {
    while let Some(result) = results.recv().await {
        let Some(entry) = take_entry(&inflight, result.id) else {
            tracing::debug!("Discarding late result for request {}", result.id);
            continue;
        };

        let total = entry.submitted.elapsed();
        let response = match result.outcome {
            Ok(output) => {
                let histogram = metrics::histogram!("tr_inference_duration");
                histogram.record(output.inference.as_secs_f64());
                Ok(InferenceResult {
                    scores: output.scores,
                    metadata: InferMetadata {
                        tokenization: output.tokenization,
                        queue: total.saturating_sub(output.tokenization + output.inference),
                        inference: output.inference,
                        total,
                    },
                    stats: output.stats,
                    batch_size: output.batch_size,
                    model_worker_id: result.worker_id,
                    tokenizer_worker_id: output.tokenizer_id,
                })
            }
            Err(message) => {
                let counter = metrics::counter!("tr_request_failure", "err" => "inference");
                counter.increment(1);
                Err(TextRerankerError::Worker(message))
            }
        };

        // The caller may have timed out between lookup and send; either way
        // the entry is gone and a duplicate result cannot be misattributed.
        let _ = entry.response_tx.send(response);
    }
    tracing::debug!("Result drain loop stopped");
}

fn complete_with_error(inflight: &InflightTable, id: u64, err: TextRerankerError) {
    match take_entry(inflight, id) {
        Some(entry) => {
            let _ = entry.response_tx.send(Err(err));
        }
        None => tracing::debug!("Discarding orphaned error for request {id}: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RerankerConfig;
    use crate::tokenization::tests::test_tokenizer;
    use text_reranker_backend::{RoutingPolicy, StubOptions};

    fn stub_pipeline(replicas: usize, options: StubOptions) -> Pipeline {
        let pool = Arc::new(ModelPool::stub(
            replicas,
            RoutingPolicy::RoundRobin,
            options,
        ));
        Pipeline::new(&RerankerConfig::default(), test_tokenizer(), pool).unwrap()
    }

    fn pairs(n: usize) -> Vec<(String, String)> {
        let all = [
            ("what is rust", "a systems language"),
            ("fast", "crab"),
            ("language", "systems fast crab"),
        ];
        all[..n]
            .iter()
            .map(|(q, d)| (q.to_string(), d.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn scores_arrive_in_input_order() {
        let pipeline = stub_pipeline(2, StubOptions::default());

        let batch = pipeline.infer(pairs(3)).await.unwrap();
        assert_eq!(batch.scores.len(), 3);
        assert_eq!(batch.batch_size, 3);

        // Each pair scored alone must match its slot in the batch: the mock
        // model only looks at real tokens, so padding differences cannot
        // leak into scores.
        for (i, pair) in pairs(3).into_iter().enumerate() {
            let single = pipeline.infer(vec![pair]).await.unwrap();
            assert_eq!(single.scores[0], batch.scores[i]);
        }
        assert_eq!(pipeline.inflight(), 0);
    }

    #[tokio::test]
    async fn ids_increase_monotonically() {
        let pipeline = stub_pipeline(1, StubOptions::default());

        let (first, rx1) = pipeline.submit(pairs(1)).unwrap();
        let (second, rx2) = pipeline.submit(pairs(1)).unwrap();
        assert!(second > first);

        rx1.await.unwrap().unwrap();
        rx2.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn timeout_removes_entry_and_discards_late_result() {
        let mut config = RerankerConfig::default();
        config.request_timeout = Duration::from_millis(50);

        // Only single-pair batches are slow, so the follow-up request can
        // still complete within the timeout.
        let pool = Arc::new(ModelPool::stub(
            1,
            RoutingPolicy::RoundRobin,
            StubOptions {
                latency: Duration::from_millis(300),
                slow_batch_size: Some(1),
                ..Default::default()
            },
        ));
        let pipeline = Pipeline::new(&config, test_tokenizer(), pool).unwrap();

        let err = pipeline.infer(pairs(1)).await.unwrap_err();
        assert!(matches!(err, TextRerankerError::Timeout(_)));
        assert_eq!(pipeline.inflight(), 0);

        // Wait for the late result to arrive and be discarded, then verify
        // the pipeline still answers fresh requests correctly.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(pipeline.inflight(), 0);
        let result = pipeline.infer(pairs(2)).await.unwrap();
        assert_eq!(result.scores.len(), 2);
    }

    #[tokio::test]
    async fn worker_error_is_attached_to_the_request() {
        let pipeline = stub_pipeline(
            1,
            StubOptions {
                fail_on_batch_size: Some(2),
                ..Default::default()
            },
        );

        let err = pipeline.infer(pairs(2)).await.unwrap_err();
        match err {
            TextRerankerError::Worker(message) => {
                assert!(message.contains("injected batch failure"))
            }
            other => panic!("expected a worker error, got {other}"),
        }

        // The stub worker survives the failure.
        assert_eq!(pipeline.infer(pairs(1)).await.unwrap().scores.len(), 1);
    }

    #[tokio::test]
    async fn tokenizer_failure_completes_the_request() {
        let pipeline = stub_pipeline(1, StubOptions::default());
        let err = pipeline.infer(Vec::new()).await.unwrap_err();
        assert!(matches!(err, TextRerankerError::Validation(_)));
        assert_eq!(pipeline.inflight(), 0);
    }

    #[tokio::test]
    async fn timing_breakdown_is_populated() {
        let pipeline = stub_pipeline(1, StubOptions::default());
        let result = pipeline.infer(pairs(2)).await.unwrap();

        assert!(result.metadata.total >= result.metadata.inference);
        assert!(result.metadata.total >= result.metadata.tokenization);
        assert!(result.stats.total_tokens > 0);
        assert_eq!(
            result.stats.real_tokens + result.stats.padded_tokens,
            result.stats.total_tokens
        );
    }
}
