//! End-to-end tests of the process-based model pool: each replica is a real
//! OS process running the worker binary with the mock backend.

use std::path::PathBuf;
use std::time::Duration;
use text_reranker_backend::protocol::{WorkItem, WorkResult};
use text_reranker_backend::{
    BackendError, ModelPool, ModelPoolConfig, PaddingStats, RoutingPolicy, TokenizedBatch,
};

fn worker_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_text-reranker-model-worker"))
}

fn pool_config(replicas: usize) -> ModelPoolConfig {
    ModelPoolConfig {
        replicas,
        routing: RoutingPolicy::RoundRobin,
        worker_binary: Some(worker_binary()),
        warmup_iterations: 1,
        startup_timeout: Duration::from_secs(30),
        shutdown_timeout: Duration::from_secs(10),
        ..Default::default()
    }
}

/// Batch with one row per entry of `rows`, each row padded to `max_length`.
fn batch_of(rows: &[&[u32]], max_length: usize) -> TokenizedBatch {
    let batch_size = rows.len();
    let mut input_ids = Vec::new();
    let mut attention_mask = Vec::new();
    let mut real = 0;
    for row in rows {
        real += row.len();
        input_ids.extend_from_slice(row);
        input_ids.extend(std::iter::repeat(0).take(max_length - row.len()));
        attention_mask.extend(std::iter::repeat(1).take(row.len()));
        attention_mask.extend(std::iter::repeat(0).take(max_length - row.len()));
    }
    let total = batch_size * max_length;
    TokenizedBatch {
        input_ids,
        attention_mask,
        token_type_ids: vec![0; total],
        batch_size,
        max_length,
        stats: PaddingStats {
            total_tokens: total,
            real_tokens: real,
            padded_tokens: total - real,
            padding_ratio: if total > 0 {
                (total - real) as f32 / total as f32
            } else {
                0.0
            },
            max_seq_length: max_length,
            avg_seq_length: if batch_size > 0 {
                real as f32 / batch_size as f32
            } else {
                0.0
            },
        },
        tokenization: Duration::from_millis(1),
        tokenizer_id: 0,
    }
}

async fn drain_one(results: &mut tokio::sync::mpsc::Receiver<WorkResult>) -> WorkResult {
    tokio::time::timeout(Duration::from_secs(30), results.recv())
        .await
        .expect("timed out waiting for a work result")
        .expect("result channel closed")
}

#[tokio::test]
async fn pool_starts_scores_and_stops() {
    let pool = ModelPool::new(pool_config(2)).unwrap();
    assert_eq!(pool.replicas(), 2);

    let mut results = pool.take_results();
    for id in 0..4u64 {
        pool.submit(WorkItem {
            id,
            batch: batch_of(&[&[5, 9, 2], &[7, 1]], 4),
        })
        .unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..4 {
        let result = drain_one(&mut results).await;
        let output = result.outcome.expect("inference should succeed");
        assert_eq!(output.scores.len(), 2);
        assert!(output.scores.iter().all(|s| *s > 0.0 && *s < 1.0));
        seen.push(result.id);
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2, 3]);

    pool.shutdown();
    assert!(pool
        .submit(WorkItem {
            id: 99,
            batch: batch_of(&[&[1]], 2),
        })
        .is_err());
}

#[tokio::test]
async fn identical_rows_score_identically_across_replicas() {
    let pool = ModelPool::new(pool_config(2)).unwrap();
    let mut results = pool.take_results();

    // Enough submissions that both replicas handle the same batch.
    for id in 0..6u64 {
        pool.submit(WorkItem {
            id,
            batch: batch_of(&[&[11, 13, 17]], 8),
        })
        .unwrap();
    }

    let mut scores = Vec::new();
    let mut workers = Vec::new();
    for _ in 0..6 {
        let result = drain_one(&mut results).await;
        workers.push(result.worker_id);
        scores.push(result.outcome.unwrap().scores[0]);
    }
    assert!(scores.windows(2).all(|w| w[0] == w[1]));
    workers.sort_unstable();
    workers.dedup();
    assert_eq!(workers, vec![0, 1], "round robin should use both replicas");

    pool.shutdown();
}

#[tokio::test]
async fn per_item_failure_does_not_kill_the_worker() {
    let pool = ModelPool::new(pool_config(1)).unwrap();
    let mut results = pool.take_results();

    // The mock backend rejects empty batches.
    pool.submit(WorkItem {
        id: 1,
        batch: batch_of(&[], 4),
    })
    .unwrap();
    let failed = drain_one(&mut results).await;
    assert_eq!(failed.id, 1);
    assert!(failed.outcome.is_err());

    pool.submit(WorkItem {
        id: 2,
        batch: batch_of(&[&[3, 4]], 4),
    })
    .unwrap();
    let ok = drain_one(&mut results).await;
    assert_eq!(ok.id, 2);
    assert!(ok.outcome.is_ok());

    pool.shutdown();
}

#[tokio::test]
async fn control_queries_roundtrip_while_pool_runs() {
    let pool = ModelPool::new(pool_config(2)).unwrap();
    let mut results = pool.take_results();

    for id in 0..4u64 {
        pool.submit(WorkItem {
            id,
            batch: batch_of(&[&[2, 3]], 4),
        })
        .unwrap();
    }
    for _ in 0..4 {
        drain_one(&mut results).await;
    }

    let snapshots = pool.worker_metrics().await.unwrap();
    assert_eq!(snapshots.len(), 2);
    let total: u64 = snapshots.iter().map(|s| s.requests).sum();
    assert_eq!(total, 4);
    assert!(snapshots.iter().all(|s| s.failures == 0));

    let memory = pool.memory_usage().await.unwrap();
    assert_eq!(memory.len(), 2);
    assert!(memory.iter().all(|(_, mb)| *mb >= 0.0));

    let info = pool.info();
    assert_eq!(info.replicas, 2);
    assert_eq!(info.routing, "round_robin");
    assert_eq!(info.workers.iter().map(|w| w.served).sum::<u64>(), 4);

    pool.shutdown();
}

#[test]
fn missing_worker_binary_fails_startup() {
    let config = ModelPoolConfig {
        replicas: 1,
        worker_binary: Some(PathBuf::from("definitely-not-a-real-worker-binary")),
        startup_timeout: Duration::from_secs(5),
        ..Default::default()
    };
    match ModelPool::new(config) {
        Err(BackendError::Start(message)) => assert!(message.contains("not found")),
        other => panic!("expected a startup error, got {other:?}"),
    }
}

#[test]
fn zero_replicas_is_a_startup_error() {
    let config = ModelPoolConfig {
        replicas: 0,
        ..Default::default()
    };
    assert!(matches!(
        ModelPool::new(config),
        Err(BackendError::Start(_))
    ));
}
