mod management;
pub mod protocol;
mod routing;

use crate::management::WorkerProcess;
use crate::protocol::{
    WorkItem, WorkResult, WorkerMetricsSnapshot, WorkerRequest, WorkerResponse,
};
use nohash_hasher::IntMap;
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

pub use crate::routing::RoutingPolicy;
use crate::routing::Router;
pub use text_reranker_backend_core::{
    BackendError, MockModel, PaddingStats, ScoringModel, TokenizedBatch,
};

/// Model pool configuration, owned by an external configuration layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelPoolConfig {
    /// Number of model replicas, one OS process each
    pub replicas: usize,
    pub routing: RoutingPolicy,
    /// Worker executable; resolved from PATH when unset
    pub worker_binary: Option<PathBuf>,
    /// Backend kind forwarded to the worker binary
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub warmup_iterations: usize,
    /// Capacity of each worker's input channel
    pub input_queue_capacity: usize,
    pub startup_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub control_timeout: Duration,
}

impl Default for ModelPoolConfig {
    fn default() -> Self {
        Self {
            replicas: 1,
            routing: RoutingPolicy::default(),
            worker_binary: None,
            backend: "mock".to_string(),
            model_path: None,
            warmup_iterations: 3,
            input_queue_capacity: 8,
            startup_timeout: Duration::from_secs(120),
            shutdown_timeout: Duration::from_secs(30),
            control_timeout: Duration::from_secs(5),
        }
    }
}

/// Parent-side handle to one model worker.
#[derive(Debug)]
pub struct WorkerHandle {
    pub(crate) id: usize,
    sender: mpsc::Sender<WorkerRequest>,
    outstanding: Arc<AtomicUsize>,
    served: Arc<AtomicU64>,
    pid: Option<u32>,
}

impl WorkerHandle {
    fn new(id: usize, sender: mpsc::Sender<WorkerRequest>, pid: Option<u32>) -> Self {
        Self {
            id,
            sender,
            outstanding: Arc::new(AtomicUsize::new(0)),
            served: Arc::new(AtomicU64::new(0)),
            pid,
        }
    }

    /// Items submitted to this worker and not yet answered.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    /// Handle with no worker behind it, for router tests.
    #[cfg(test)]
    pub(crate) fn detached(id: usize) -> Self {
        let (sender, _receiver) = mpsc::channel(1);
        Self::new(id, sender, None)
    }

    #[cfg(test)]
    pub(crate) fn bump_outstanding(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }
}

/// Correlates out-of-band control queries with their replies. Control
/// replies never enter the inference result stream.
#[derive(Debug, Default)]
struct ControlTable {
    next: AtomicU64,
    pending: Mutex<IntMap<u64, oneshot::Sender<ControlReply>>>,
}

#[derive(Debug)]
enum ControlReply {
    Memory(f32),
    Metrics(WorkerMetricsSnapshot),
}

impl ControlTable {
    fn register(&self) -> (u64, oneshot::Receiver<ControlReply>) {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("control table lock poisoned")
            .insert(id, tx);
        (id, rx)
    }

    fn complete(&self, id: u64, reply: ControlReply) {
        let sender = self
            .pending
            .lock()
            .expect("control table lock poisoned")
            .remove(&id);
        match sender {
            Some(sender) => {
                let _ = sender.send(reply);
            }
            None => tracing::debug!("Discarding orphaned control reply {id}"),
        }
    }

    fn forget(&self, id: u64) {
        self.pending
            .lock()
            .expect("control table lock poisoned")
            .remove(&id);
    }
}

/// Pool of model replicas, each isolated in its own OS process.
///
/// Work is routed to a replica's bounded input channel; results from all
/// replicas arrive on one shared output channel, tagged with the request id
/// they answer. The output receiver is taken exactly once by the pipeline's
/// result-drain loop.
#[derive(Debug)]
pub struct ModelPool {
    workers: Vec<WorkerHandle>,
    router: Router,
    results: Mutex<Option<mpsc::Receiver<WorkResult>>>,
    control: Arc<ControlTable>,
    children: Mutex<Vec<WorkerProcess>>,
    shutdown_timeout: Duration,
    control_timeout: Duration,
}

impl ModelPool {
    /// Spawn all worker processes and block until every one has signalled
    /// ready, or fail the whole pool. Call from a dedicated thread when a
    /// runtime is already running.
    pub fn new(config: ModelPoolConfig) -> Result<Self, BackendError> {
        if config.replicas == 0 {
            return Err(BackendError::Start(
                "model pool requires at least one replica".to_string(),
            ));
        }

        tracing::info!(
            "Starting {} model worker process(es), routing={}",
            config.replicas,
            config.routing
        );

        let control = Arc::new(ControlTable::default());
        let (output_tx, output_rx) = mpsc::channel(config.replicas * 4);

        let mut workers = Vec::with_capacity(config.replicas);
        let mut children = Vec::with_capacity(config.replicas);
        let mut ready_signals = Vec::with_capacity(config.replicas);

        for id in 0..config.replicas {
            let spawned =
                WorkerProcess::spawn(config.worker_binary.as_ref(), id, &worker_args(&config, id))?;
            let pid = spawned.process.pid();

            let (input_tx, input_rx) = mpsc::channel(config.input_queue_capacity);
            let handle = WorkerHandle::new(id, input_tx, Some(pid));

            let mut stdin = spawned.stdin;
            thread::spawn(move || writer_loop(id, &mut stdin, input_rx));

            let (ready_tx, ready_rx) = std::sync::mpsc::channel();
            let reader = ReaderContext {
                worker_id: id,
                output: output_tx.clone(),
                control: control.clone(),
                outstanding: handle.outstanding.clone(),
                served: handle.served.clone(),
                ready: ready_tx,
            };
            let stdout = spawned.stdout;
            thread::spawn(move || reader_loop(stdout, reader));

            tracing::info!("Spawned model worker {id} (pid {pid})");
            workers.push(handle);
            children.push(spawned.process);
            ready_signals.push(ready_rx);
        }

        let deadline = Instant::now() + config.startup_timeout;
        for (id, ready) in ready_signals.iter().enumerate() {
            loop {
                if ready.try_recv().is_ok() {
                    break;
                }
                if children[id].exited() {
                    return Err(BackendError::Start(format!(
                        "model worker {id} exited during startup:\n{}",
                        children[id].stderr_tail()
                    )));
                }
                if Instant::now() >= deadline {
                    return Err(BackendError::Start(format!(
                        "model worker {id} was not ready within {:?}",
                        config.startup_timeout
                    )));
                }
                thread::sleep(Duration::from_millis(5));
            }
        }

        tracing::info!("Model pool ready with {} worker(s)", config.replicas);

        Ok(Self {
            workers,
            router: Router::new(config.routing),
            results: Mutex::new(Some(output_rx)),
            control,
            children: Mutex::new(children),
            shutdown_timeout: config.shutdown_timeout,
            control_timeout: config.control_timeout,
        })
    }

    /// Route one work item to a worker. Fails fast when the chosen worker's
    /// input channel is saturated.
    pub fn submit(&self, item: WorkItem) -> Result<(), BackendError> {
        let worker = self.router.select(&self.workers)?;
        worker.outstanding.fetch_add(1, Ordering::AcqRel);
        match worker.sender.try_send(WorkerRequest::Infer(item)) {
            Ok(()) => Ok(()),
            Err(err) => {
                worker.outstanding.fetch_sub(1, Ordering::AcqRel);
                match err {
                    mpsc::error::TrySendError::Full(_) => {
                        Err(BackendError::QueueFull("model worker input"))
                    }
                    mpsc::error::TrySendError::Closed(_) => Err(BackendError::Ipc(format!(
                        "model worker {} input channel closed",
                        worker.id
                    ))),
                }
            }
        }
    }

    /// Take the shared inference result stream. Called exactly once.
    pub fn take_results(&self) -> mpsc::Receiver<WorkResult> {
        self.results
            .lock()
            .expect("results lock poisoned")
            .take()
            .expect("inference results receiver was already taken. This is a bug.")
    }

    pub fn replicas(&self) -> usize {
        self.workers.len()
    }

    /// Per-worker counters kept by the workers themselves.
    pub async fn worker_metrics(&self) -> Result<Vec<WorkerMetricsSnapshot>, BackendError> {
        let mut snapshots = Vec::with_capacity(self.workers.len());
        for worker in &self.workers {
            let reply = self
                .control_roundtrip(worker, |control_id| WorkerRequest::Metrics { control_id })
                .await?;
            match reply {
                ControlReply::Metrics(snapshot) => snapshots.push(snapshot),
                ControlReply::Memory(_) => {
                    return Err(BackendError::Ipc(
                        "worker answered a metrics query with a memory reply".to_string(),
                    ))
                }
            }
        }
        Ok(snapshots)
    }

    /// Resident memory per worker, in MB.
    pub async fn memory_usage(&self) -> Result<Vec<(usize, f32)>, BackendError> {
        let mut usage = Vec::with_capacity(self.workers.len());
        for worker in &self.workers {
            let reply = self
                .control_roundtrip(worker, |control_id| WorkerRequest::MemoryUsage { control_id })
                .await?;
            match reply {
                ControlReply::Memory(resident_mb) => usage.push((worker.id, resident_mb)),
                ControlReply::Metrics(_) => {
                    return Err(BackendError::Ipc(
                        "worker answered a memory query with a metrics reply".to_string(),
                    ))
                }
            }
        }
        Ok(usage)
    }

    async fn control_roundtrip(
        &self,
        worker: &WorkerHandle,
        request: impl FnOnce(u64) -> WorkerRequest,
    ) -> Result<ControlReply, BackendError> {
        let (control_id, reply_rx) = self.control.register();
        if worker.sender.send(request(control_id)).await.is_err() {
            self.control.forget(control_id);
            return Err(BackendError::Ipc(format!(
                "model worker {} input channel closed",
                worker.id
            )));
        }
        match tokio::time::timeout(self.control_timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(BackendError::Ipc(format!(
                "model worker {} dropped a control reply",
                worker.id
            ))),
            Err(_) => {
                self.control.forget(control_id);
                Err(BackendError::Ipc(format!(
                    "model worker {} did not answer a control query within {:?}",
                    worker.id, self.control_timeout
                )))
            }
        }
    }

    /// Pool summary for dashboards and logs.
    pub fn info(&self) -> PoolInfo {
        PoolInfo {
            replicas: self.workers.len(),
            routing: self.router.policy().to_string(),
            workers: self
                .workers
                .iter()
                .map(|w| WorkerInfo {
                    id: w.id,
                    pid: w.pid,
                    outstanding: w.outstanding(),
                    served: w.served(),
                })
                .collect(),
        }
    }

    /// Stop every worker: broadcast the stop sentinel, join with a bounded
    /// timeout, force-kill stragglers.
    pub fn shutdown(&self) {
        tracing::info!("Stopping model worker processes");
        for worker in &self.workers {
            let _ = worker.sender.try_send(WorkerRequest::Stop);
        }
        let deadline = Instant::now() + self.shutdown_timeout;
        let mut children = self.children.lock().expect("children lock poisoned");
        for child in children.iter_mut() {
            child.join_or_kill(deadline);
        }
        children.clear();
        tracing::info!("Model pool stopped");
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolInfo {
    pub replicas: usize,
    pub routing: String,
    pub workers: Vec<WorkerInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub id: usize,
    pub pid: Option<u32>,
    pub outstanding: usize,
    pub served: u64,
}

fn worker_args(config: &ModelPoolConfig, id: usize) -> Vec<String> {
    let mut args = vec![
        "--worker-id".to_string(),
        id.to_string(),
        "--backend".to_string(),
        config.backend.clone(),
        "--warmup".to_string(),
        config.warmup_iterations.to_string(),
        "--json-output".to_string(),
    ];
    if let Some(model_path) = &config.model_path {
        args.push("--model-path".to_string());
        args.push(model_path.display().to_string());
    }
    args
}

fn writer_loop(
    worker_id: usize,
    stdin: &mut std::process::ChildStdin,
    mut input: mpsc::Receiver<WorkerRequest>,
) {
    while let Some(request) = input.blocking_recv() {
        let stop = matches!(request, WorkerRequest::Stop);
        if let Err(err) = protocol::write_frame(stdin, &request) {
            tracing::error!("Could not write to model worker {worker_id}: {err}");
            break;
        }
        if stop {
            break;
        }
    }
    // Dropping stdin closes the worker's input stream; the worker treats
    // EOF as a stop sentinel.
}

struct ReaderContext {
    worker_id: usize,
    output: mpsc::Sender<WorkResult>,
    control: Arc<ControlTable>,
    outstanding: Arc<AtomicUsize>,
    served: Arc<AtomicU64>,
    ready: std::sync::mpsc::Sender<()>,
}

fn reader_loop(stdout: std::process::ChildStdout, ctx: ReaderContext) {
    let reader = std::io::BufReader::new(stdout);
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                tracing::error!("Could not read from model worker {}: {err}", ctx.worker_id);
                break;
            }
        };
        if line.is_empty() {
            continue;
        }
        match protocol::read_frame::<WorkerResponse>(&line) {
            Ok(WorkerResponse::Ready { worker_id, startup }) => {
                tracing::info!("Model worker {worker_id} ready in {startup:?}");
                let _ = ctx.ready.send(());
            }
            Ok(WorkerResponse::Result(result)) => deliver_result(&ctx, result),
            Ok(WorkerResponse::MemoryUsage {
                control_id,
                resident_mb,
            }) => ctx.control.complete(control_id, ControlReply::Memory(resident_mb)),
            Ok(WorkerResponse::Metrics {
                control_id,
                snapshot,
            }) => ctx
                .control
                .complete(control_id, ControlReply::Metrics(snapshot)),
            Err(err) => {
                tracing::error!(
                    "Malformed frame from model worker {}: {err}",
                    ctx.worker_id
                );
            }
        }
    }
    tracing::debug!("Model worker {} output stream closed", ctx.worker_id);
}

fn deliver_result(ctx: &ReaderContext, result: WorkResult) {
    ctx.outstanding.fetch_sub(1, Ordering::AcqRel);
    ctx.served.fetch_add(1, Ordering::Relaxed);
    if result.outcome.is_err() {
        let counter = metrics::counter!("tr_worker_failure");
        counter.increment(1);
    }
    if ctx.output.blocking_send(result).is_err() {
        tracing::debug!("Inference result receiver dropped; discarding result");
    }
}

#[cfg(feature = "stub-worker")]
pub use stub::StubOptions;

#[cfg(feature = "stub-worker")]
mod stub {
    use super::*;

    /// Behavior knobs for in-process stub workers.
    #[derive(Debug, Clone, Default)]
    pub struct StubOptions {
        /// Artificial per-item latency
        pub latency: Duration,
        /// Restrict `latency` to batches with exactly this many rows
        pub slow_batch_size: Option<usize>,
        /// Fail any batch with exactly this many rows
        pub fail_on_batch_size: Option<usize>,
        pub input_queue_capacity: Option<usize>,
    }

    impl ModelPool {
        /// Pool backed by in-process `MockModel` threads instead of worker
        /// processes. For tests and benchmarks of the layers above the pool;
        /// production pools always isolate replicas in OS processes.
        pub fn stub(replicas: usize, routing: RoutingPolicy, options: StubOptions) -> Self {
            assert!(replicas > 0, "stub pool requires at least one replica");

            let control = Arc::new(ControlTable::default());
            let (output_tx, output_rx) = mpsc::channel(replicas * 4);

            let workers = (0..replicas)
                .map(|id| {
                    let capacity = options.input_queue_capacity.unwrap_or(8);
                    let (input_tx, input_rx) = mpsc::channel(capacity);
                    let handle = WorkerHandle::new(id, input_tx, None);
                    let ctx = ReaderContext {
                        worker_id: id,
                        output: output_tx.clone(),
                        control: control.clone(),
                        outstanding: handle.outstanding.clone(),
                        served: handle.served.clone(),
                        ready: std::sync::mpsc::channel().0,
                    };
                    let options = options.clone();
                    thread::spawn(move || stub_worker_loop(input_rx, ctx, options));
                    handle
                })
                .collect();

            Self {
                workers,
                router: Router::new(routing),
                results: Mutex::new(Some(output_rx)),
                control,
                children: Mutex::new(Vec::new()),
                shutdown_timeout: Duration::from_secs(5),
                control_timeout: Duration::from_secs(5),
            }
        }
    }

    fn stub_worker_loop(
        mut input: mpsc::Receiver<WorkerRequest>,
        ctx: ReaderContext,
        options: StubOptions,
    ) {
        let model = MockModel::new();
        let mut snapshot = WorkerMetricsSnapshot {
            worker_id: ctx.worker_id,
            ..Default::default()
        };

        while let Some(request) = input.blocking_recv() {
            match request {
                WorkerRequest::Infer(item) => {
                    let slow = options
                        .slow_batch_size
                        .map_or(true, |n| n == item.batch.batch_size);
                    if slow && !options.latency.is_zero() {
                        thread::sleep(options.latency);
                    }
                    let inference_start = Instant::now();
                    let outcome = if options.fail_on_batch_size == Some(item.batch.batch_size) {
                        Err("injected batch failure".to_string())
                    } else {
                        model
                            .predict(&item.batch)
                            .map(|scores| protocol::WorkOutput {
                                scores,
                                inference: inference_start.elapsed(),
                                tokenization: item.batch.tokenization,
                                stats: item.batch.stats,
                                tokenizer_id: item.batch.tokenizer_id,
                                batch_size: item.batch.batch_size,
                            })
                            .map_err(|err| err.to_string())
                    };
                    snapshot.requests += 1;
                    snapshot.pairs += item.batch.batch_size as u64;
                    snapshot.cumulative_inference += inference_start.elapsed();
                    if outcome.is_err() {
                        snapshot.failures += 1;
                    }
                    deliver_result(
                        &ctx,
                        WorkResult {
                            id: item.id,
                            worker_id: ctx.worker_id,
                            outcome,
                        },
                    );
                }
                WorkerRequest::MemoryUsage { control_id } => {
                    ctx.control.complete(control_id, ControlReply::Memory(0.0));
                }
                WorkerRequest::Metrics { control_id } => {
                    ctx.control
                        .complete(control_id, ControlReply::Metrics(snapshot.clone()));
                }
                WorkerRequest::Stop => break,
            }
        }
    }
}
