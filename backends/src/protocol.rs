//! Wire protocol between the scheduling process and model worker processes.
//!
//! Frames are newline-delimited JSON over the worker's stdin/stdout. Every
//! frame is self-contained: request ids, features and timings are serialized
//! so nothing needs to be re-associated through shared memory.

use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::time::Duration;
use text_reranker_backend_core::{PaddingStats, TokenizedBatch};

/// One unit of inference work, tagged with the request id it belongs to.
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: u64,
    pub batch: TokenizedBatch,
}

/// Successful inference payload for one batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkOutput {
    /// One score per row, in row order
    pub scores: Vec<f32>,
    pub inference: Duration,
    /// Propagated from the tokenized batch
    pub tokenization: Duration,
    pub stats: PaddingStats,
    pub tokenizer_id: usize,
    pub batch_size: usize,
}

/// Result envelope for one `WorkItem`. A per-item failure travels the same
/// path as a success so the owning request can be completed either way.
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkResult {
    pub id: u64,
    pub worker_id: usize,
    pub outcome: Result<WorkOutput, String>,
}

/// Parent -> worker frames. Control queries share the inference channel: the
/// worker owns its model state and must serialize all access to it,
/// introspection included.
#[derive(Debug, Serialize, Deserialize)]
pub enum WorkerRequest {
    Infer(WorkItem),
    MemoryUsage { control_id: u64 },
    Metrics { control_id: u64 },
    Stop,
}

/// Worker -> parent frames.
#[derive(Debug, Serialize, Deserialize)]
pub enum WorkerResponse {
    /// Sent exactly once, after the model is loaded and warmed up
    Ready { worker_id: usize, startup: Duration },
    Result(WorkResult),
    MemoryUsage { control_id: u64, resident_mb: f32 },
    Metrics {
        control_id: u64,
        snapshot: WorkerMetricsSnapshot,
    },
}

/// Counters a worker keeps about itself, reported on demand.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerMetricsSnapshot {
    pub worker_id: usize,
    pub requests: u64,
    pub pairs: u64,
    pub failures: u64,
    pub cumulative_inference: Duration,
}

impl WorkerMetricsSnapshot {
    pub fn avg_inference(&self) -> Duration {
        if self.requests == 0 {
            Duration::ZERO
        } else {
            self.cumulative_inference / self.requests as u32
        }
    }
}

/// Serialize one frame and flush it. Used on both sides of the pipe.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, frame: &T) -> io::Result<()> {
    let line = serde_json::to_string(frame)?;
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()
}

/// Parse one frame from a line read off the pipe.
pub fn read_frame<T: for<'de> Deserialize<'de>>(line: &str) -> io::Result<T> {
    serde_json::from_str(line).map_err(io::Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_roundtrip() {
        let item = WorkItem {
            id: 42,
            batch: TokenizedBatch::warmup(2, 4, 100),
        };
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &WorkerRequest::Infer(item)).unwrap();
        let line = String::from_utf8(buffer).unwrap();
        assert!(line.ends_with('\n'));

        let parsed: WorkerRequest = read_frame(line.trim_end()).unwrap();
        match parsed {
            WorkerRequest::Infer(item) => {
                assert_eq!(item.id, 42);
                assert_eq!(item.batch.batch_size, 2);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn error_outcome_roundtrips() {
        let result = WorkResult {
            id: 7,
            worker_id: 1,
            outcome: Err("model exploded".to_string()),
        };
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &WorkerResponse::Result(result)).unwrap();
        let parsed: WorkerResponse =
            read_frame(String::from_utf8(buffer).unwrap().trim_end()).unwrap();
        match parsed {
            WorkerResponse::Result(r) => {
                assert_eq!(r.id, 7);
                assert_eq!(r.outcome.unwrap_err(), "model exploded");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
