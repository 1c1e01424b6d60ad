//! Request-level routing across model workers.
//!
//! The strategy set is a small closed enum: the name is resolved to a
//! variant once, when configuration is loaded, never per call. Selection
//! only reads per-worker atomics, so concurrent submitters cannot observe
//! torn state.

use crate::WorkerHandle;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use text_reranker_backend_core::BackendError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPolicy {
    /// Circular dispatch, preferring idle workers when any exist
    #[default]
    RoundRobin,
    /// Worker with the fewest outstanding items
    LeastBusy,
    /// First idle worker, else worker 0
    FirstAvailable,
}

impl FromStr for RoutingPolicy {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "round_robin" => Ok(Self::RoundRobin),
            "least_busy" => Ok(Self::LeastBusy),
            "first_available" => Ok(Self::FirstAvailable),
            _ => Err(BackendError::Routing(format!(
                "unknown routing strategy: {s}. Available: round_robin, least_busy, first_available"
            ))),
        }
    }
}

impl fmt::Display for RoutingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::RoundRobin => write!(f, "round_robin"),
            Self::LeastBusy => write!(f, "least_busy"),
            Self::FirstAvailable => write!(f, "first_available"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Router {
    policy: RoutingPolicy,
    next: AtomicUsize,
}

impl Router {
    pub fn new(policy: RoutingPolicy) -> Self {
        Self {
            policy,
            next: AtomicUsize::new(0),
        }
    }

    pub fn policy(&self) -> RoutingPolicy {
        self.policy
    }

    /// Pick the worker that should handle the next unit of work.
    pub fn select<'a>(
        &self,
        workers: &'a [WorkerHandle],
    ) -> Result<&'a WorkerHandle, BackendError> {
        if workers.is_empty() {
            return Err(BackendError::Routing(
                "no workers available".to_string(),
            ));
        }

        let selected = match self.policy {
            RoutingPolicy::RoundRobin => {
                let idle: Vec<&WorkerHandle> =
                    workers.iter().filter(|w| w.outstanding() == 0).collect();
                let slot = self.next.fetch_add(1, Ordering::Relaxed);
                if idle.is_empty() {
                    &workers[slot % workers.len()]
                } else {
                    idle[slot % idle.len()]
                }
            }
            RoutingPolicy::LeastBusy => workers
                .iter()
                .min_by_key(|w| w.outstanding())
                .expect("workers is non-empty"),
            RoutingPolicy::FirstAvailable => workers
                .iter()
                .find(|w| w.outstanding() == 0)
                .unwrap_or(&workers[0]),
        };
        Ok(selected)
    }
}
