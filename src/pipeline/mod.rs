//! Task orchestration: PENDING → PLANNING → WORKING → EVALUATING → terminal.
//!
//! A [`Pipeline`] owns the shared pools, sandbox manager and agent. Each
//! call to [`Pipeline::run`] drives one task through its phases, retrying
//! attempts within a phase and whole loops when the quality gate rejects a
//! verdict. Terminal results are cached per task id.

mod cancel;
mod gate;
mod result;
mod state;
mod task;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::info;

pub use cancel::CancelToken;
pub use gate::check_gate;
pub use result::{PhaseMetrics, TaskResult, Totals, Transition};
pub use state::{FailureClass, PhaseName, TaskState};

use crate::agent::Agent;
use crate::config::TaskConfig;
use crate::error::{PlatformError, PlatformResult};
use crate::events::{EventBus, TaskResultEvent};
use crate::pool::PoolManager;
use crate::sandbox::SandboxManager;
use crate::usage::UsageTracker;
use task::TaskRun;

/// Runs tasks against shared pools, sandboxes and an agent.
pub struct Pipeline {
    pools: Arc<PoolManager>,
    sandbox: Arc<SandboxManager>,
    agent: Arc<dyn Agent>,
    bus: Arc<EventBus>,
    usage: Arc<UsageTracker>,
    runs: Mutex<Runs>,
}

/// Finished and in-flight task ids, kept under one lock so a run moves
/// from in-flight to finished atomically.
#[derive(Default)]
struct Runs {
    results: HashMap<String, TaskResult>,
    in_flight: HashSet<String>,
}

/// Clears the in-flight marker however the run ends.
struct InFlight<'a> {
    runs: &'a Mutex<Runs>,
    task_id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .in_flight
            .remove(&self.task_id);
    }
}

impl Pipeline {
    pub fn new(
        pools: Arc<PoolManager>,
        sandbox: Arc<SandboxManager>,
        agent: Arc<dyn Agent>,
        bus: Arc<EventBus>,
        usage: Arc<UsageTracker>,
    ) -> Self {
        Self {
            pools,
            sandbox,
            agent,
            bus,
            usage,
            runs: Mutex::default(),
        }
    }

    pub fn agent_name(&self) -> &str {
        self.agent.name()
    }

    /// The cached terminal result for `task_id`, if it has run.
    pub fn result(&self, task_id: &str) -> Option<TaskResult> {
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .results
            .get(task_id)
            .cloned()
    }

    /// Runs a task to a terminal state.
    ///
    /// Phase failures, gate rejections, cancellation and bad task
    /// configuration all produce a `FAILED` result rather than an error.
    /// Running a task id that already finished returns the cached result
    /// without executing anything.
    ///
    /// # Errors
    ///
    /// [`PlatformError::AlreadyRunning`] when a run for the same task id is
    /// in progress.
    pub async fn run(&self, config: &TaskConfig, cancel: &CancelToken) -> PlatformResult<TaskResult> {
        let _in_flight = {
            let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(cached) = runs.results.get(&config.id) {
                info!(task_id = %config.id, status = %cached.status, "Returning cached result");
                return Ok(cached.clone());
            }
            if !runs.in_flight.insert(config.id.clone()) {
                return Err(PlatformError::AlreadyRunning {
                    task_id: config.id.clone(),
                });
            }
            InFlight {
                runs: &self.runs,
                task_id: config.id.clone(),
            }
        };

        let result = TaskRun::new(self, config, cancel).execute().await;

        self.bus.emit(
            &TaskResultEvent {
                status: result.status,
                classification: result.classification.map(|c| c.to_string()),
                partial: result.partial,
                duration_ms: result.totals.duration_ms,
            },
            Some(&result.task_id),
        );
        {
            let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
            runs.results.insert(result.task_id.clone(), result.clone());
            runs.in_flight.remove(&result.task_id);
        }
        Ok(result)
    }
}
