// jobsentry: per-host job observability agent
//
// Samples a fixed set of externally-managed processes ("jobs") on a timer,
// fans the resulting records out to pluggable sinks, and runs file-lease
// hot-standby failover across a cooperating pair of processes on the same
// host.

// CRITICAL: Enforce proper error handling - no unwrap/expect in production code
// EXCEPTION: Mutex/Condvar poisoning expect() calls are acceptable (see
// timer.rs, job_registry.rs, orchestrator.rs, sink/mod.rs, failover.rs,
// job_starter.rs, collector/mod.rs, and RegistrySnapshotState below). Test
// modules are exempt crate-wide.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod cli;
pub mod collector;
pub mod config;
pub mod error;
pub mod failover;
pub mod job_commands;
pub mod job_registry;
pub mod job_starter;
pub mod model;
pub mod orchestrator;
pub mod sink;
pub mod stream_watcher;
pub mod timer;

pub use config::Config;
pub use error::{AgentError, AgentResult};
pub use job_registry::JobRegistry;
pub use model::{CollectorPayload, Job, JobEvent, Lease, SamplingRecord};
pub use orchestrator::SamplingOrchestrator;

use collector::proc::ProcCollector;
use collector::CollectorRegistry;
use failover::StateProvider;
use std::sync::Mutex;

/// Installs every built-in collector factory. Called once by the
/// composition root; collector auto-registration is explicit rather than
/// relying on static-initialization side effects.
pub fn register_builtin_collectors(registry: &CollectorRegistry) {
    registry.register("proc", || Box::new(ProcCollector::new()));
}

/// Bridges the job registry into the failover node's `StateProvider`
/// contract: a promoted node starts sampling with the jobs present in the
/// most recently observed snapshot; a demoted node keeps the registry
/// as-is but stops driving new ticks (the orchestrator is only ever
/// constructed on the master side in `run`).
pub struct RegistrySnapshotState {
    registry: JobRegistry,
    promoted: Mutex<bool>,
}

#[allow(clippy::expect_used)]
impl RegistrySnapshotState {
    pub fn new(registry: JobRegistry) -> Self {
        Self {
            registry,
            promoted: Mutex::new(false),
        }
    }

    pub fn is_promoted(&self) -> bool {
        *self.promoted.lock().expect("promoted flag mutex poisoned")
    }
}

#[allow(clippy::expect_used)]
impl StateProvider for RegistrySnapshotState {
    fn on_promote(&self) {
        *self.promoted.lock().expect("promoted flag mutex poisoned") = true;
        tracing::info!("node promoted to master");
    }

    fn on_demote(&self) {
        *self.promoted.lock().expect("promoted flag mutex poisoned") = false;
        tracing::info!("node demoted to follower");
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({ "jobs": self.registry.snapshot() })
    }

    fn load_snapshot(&self, snapshot: &serde_json::Value) {
        let Some(jobs) = snapshot.get("jobs").and_then(|v| v.as_array()) else {
            return;
        };
        for job_value in jobs {
            if let Ok(job) = serde_json::from_value::<Job>(job_value.clone()) {
                if self.registry.find(job.id).is_none() {
                    let _ = self.registry.add(job);
                }
            }
        }
    }
}
