//! Model worker process management.
//!
//! Each replica runs in its own OS process: the accelerator context is not
//! safe for concurrent submission from multiple threads in one process, and
//! a crashing worker must not take the scheduler down with it. Workers are
//! spawned with piped stdio; stdout carries protocol frames, stderr carries
//! the worker's logs and is streamed into the parent's tracing output.

use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use text_reranker_backend_core::BackendError;

pub(crate) const DEFAULT_WORKER_BINARY: &str = "text-reranker-model-worker";

/// How many recent stderr lines to keep for startup failure diagnostics
const STDERR_TAIL_LINES: usize = 32;

#[derive(Debug)]
pub(crate) struct WorkerProcess {
    pub id: usize,
    child: Child,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

pub(crate) struct SpawnedWorker {
    pub process: WorkerProcess,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

impl WorkerProcess {
    /// Spawn one worker process and start forwarding its stderr.
    pub fn spawn(
        binary: Option<&PathBuf>,
        id: usize,
        args: &[String],
    ) -> Result<SpawnedWorker, BackendError> {
        let program = binary
            .map(|p| p.as_os_str().to_owned())
            .unwrap_or_else(|| DEFAULT_WORKER_BINARY.into());

        let mut child = match Command::new(&program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                if err.kind() == io::ErrorKind::NotFound {
                    return Err(BackendError::Start(format!(
                        "`{}` not found in PATH",
                        program.to_string_lossy()
                    )));
                }
                return Err(BackendError::Start(err.to_string()));
            }
        };

        let stdin = child.stdin.take().expect("stdin was piped");
        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let tail = stderr_tail.clone();
        thread::spawn(move || {
            let _span = tracing::span!(tracing::Level::INFO, "model-worker", id).entered();
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                log_line(&line);
                let mut tail = tail.lock().expect("stderr tail lock poisoned");
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        });

        Ok(SpawnedWorker {
            process: WorkerProcess {
                id,
                child,
                stderr_tail,
            },
            stdin,
            stdout,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Has the process exited? Non-blocking.
    pub fn exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    /// Recent stderr output, for startup failure messages.
    pub fn stderr_tail(&self) -> String {
        let tail = self.stderr_tail.lock().expect("stderr tail lock poisoned");
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Wait for the process to exit until `deadline`, then force-kill it.
    pub fn join_or_kill(&mut self, deadline: Instant) {
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        tracing::warn!("Force killing model worker {} (pid {})", self.id, self.pid());
                        let _ = self.child.kill();
                        let _ = self.child.wait();
                        return;
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                Err(err) => {
                    tracing::warn!("Could not wait for model worker {}: {err}", self.id);
                    return;
                }
            }
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
            tracing::info!("Model worker {} process terminated", self.id);
        }
    }
}

/// Re-emit one worker log line. Workers log JSON when started with
/// `--json-output`; preserve the level and message fields in that case.
fn log_line(line: &str) {
    if line.is_empty() {
        return;
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
        let level = value
            .get("level")
            .and_then(|l| l.as_str())
            .unwrap_or("INFO")
            .to_uppercase();
        let message = value
            .get("fields")
            .and_then(|f| f.get("message"))
            .or_else(|| value.get("message"))
            .and_then(|m| m.as_str())
            .unwrap_or(line);
        match level.as_str() {
            "ERROR" => tracing::error!("{message}"),
            "WARN" => tracing::warn!("{message}"),
            "DEBUG" => tracing::debug!("{message}"),
            "TRACE" => tracing::trace!("{message}"),
            _ => tracing::info!("{message}"),
        }
    } else {
        tracing::info!("{line}");
    }
}
