//! Model worker process entry point.
//!
//! One instance of this binary runs per model replica, spawned by the model
//! pool with piped stdio. stdin carries request frames, stdout carries
//! response frames, stderr carries logs. The model is loaded and warmed up
//! before the `Ready` frame is written; after that the worker answers one
//! frame at a time, forever, until it reads a `Stop` frame or EOF.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::time::Instant;
use text_reranker_backend::protocol::{
    read_frame, write_frame, WorkOutput, WorkResult, WorkerMetricsSnapshot, WorkerRequest,
    WorkerResponse,
};
use text_reranker_backend::{MockModel, ScoringModel};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    /// Deterministic stand-in model, no accelerator required
    Mock,
}

#[derive(Parser, Debug)]
#[clap(author, version, about = "Model worker process for text-reranker-inference", long_about = None)]
struct Args {
    /// Id assigned by the pool, echoed in every response frame
    #[clap(long, env)]
    worker_id: usize,

    /// Which model backend to load
    #[clap(long, env, value_enum, default_value = "mock")]
    backend: BackendKind,

    /// Local directory with model weights, for backends that need one
    #[clap(long, env)]
    model_path: Option<PathBuf>,

    /// Dummy inferences to run before signalling ready
    #[clap(long, env, default_value = "3")]
    warmup: usize,

    /// Emit logs as JSON so the parent can re-emit them structurally
    #[clap(long, env)]
    json_output: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.json_output);

    let start = Instant::now();
    let model: Box<dyn ScoringModel> = match args.backend {
        BackendKind::Mock => Box::new(MockModel::new()),
    };
    model
        .warmup(args.warmup)
        .context("model warmup failed")?;
    tracing::info!(
        "Worker {} loaded {:?} backend in {:?}",
        args.worker_id,
        args.backend,
        start.elapsed()
    );

    let stdout = io::stdout();
    let mut writer = stdout.lock();
    write_frame(
        &mut writer,
        &WorkerResponse::Ready {
            worker_id: args.worker_id,
            startup: start.elapsed(),
        },
    )
    .context("could not write ready frame")?;

    let mut counters = WorkerMetricsSnapshot {
        worker_id: args.worker_id,
        ..Default::default()
    };

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("could not read request frame")?;
        if line.is_empty() {
            continue;
        }
        let request: WorkerRequest = match read_frame(&line) {
            Ok(request) => request,
            Err(err) => {
                tracing::error!("Discarding malformed request frame: {err}");
                continue;
            }
        };

        match request {
            WorkerRequest::Infer(item) => {
                let inference_start = Instant::now();
                let outcome = model
                    .predict(&item.batch)
                    .map(|scores| WorkOutput {
                        scores,
                        inference: inference_start.elapsed(),
                        tokenization: item.batch.tokenization,
                        stats: item.batch.stats,
                        tokenizer_id: item.batch.tokenizer_id,
                        batch_size: item.batch.batch_size,
                    })
                    .map_err(|err| err.to_string());

                counters.requests += 1;
                counters.pairs += item.batch.batch_size as u64;
                counters.cumulative_inference += inference_start.elapsed();
                if let Err(err) = &outcome {
                    counters.failures += 1;
                    tracing::warn!("Inference failed for request {}: {err}", item.id);
                }

                write_frame(
                    &mut writer,
                    &WorkerResponse::Result(WorkResult {
                        id: item.id,
                        worker_id: args.worker_id,
                        outcome,
                    }),
                )
                .context("could not write result frame")?;
            }
            WorkerRequest::MemoryUsage { control_id } => {
                let resident_mb = model.memory_usage_mb().max(resident_memory_mb());
                write_frame(
                    &mut writer,
                    &WorkerResponse::MemoryUsage {
                        control_id,
                        resident_mb,
                    },
                )
                .context("could not write memory frame")?;
            }
            WorkerRequest::Metrics { control_id } => {
                write_frame(
                    &mut writer,
                    &WorkerResponse::Metrics {
                        control_id,
                        snapshot: counters.clone(),
                    },
                )
                .context("could not write metrics frame")?;
            }
            WorkerRequest::Stop => break,
        }
    }

    tracing::info!("Worker {} shutting down", args.worker_id);
    Ok(())
}

/// Logs go to stderr: stdout is the protocol channel.
fn init_logging(json_output: bool) {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_file(true)
        .with_line_number(true);

    let fmt_layer = match json_output {
        true => fmt_layer.json().flatten_event(true).boxed(),
        false => fmt_layer.boxed(),
    };

    let env_filter =
        EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// Resident set size in MB, best effort.
fn resident_memory_mb() -> f32 {
    let statm = match std::fs::read_to_string("/proc/self/statm") {
        Ok(statm) => statm,
        Err(_) => return 0.0,
    };
    statm
        .split_whitespace()
        .nth(1)
        .and_then(|pages| pages.parse::<u64>().ok())
        .map(|pages| (pages * 4096) as f32 / (1024.0 * 1024.0))
        .unwrap_or(0.0)
}
