//! One execution of a task through the phase state machine.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use super::{
    check_gate, CancelToken, FailureClass, PhaseMetrics, PhaseName, Pipeline, TaskResult, TaskState,
    Totals, Transition,
};
use crate::agent::{PhaseContext, PhaseOutcome, PhaseSandbox, Verdict};
use crate::config::{PhaseConfig, RetryFrom, TaskConfig, WorkFailurePolicy};
use crate::error::{PlatformError, PlatformResult};
use crate::events::{PhaseEvent, StateSnapshot};
use crate::pool::PooledInstance;
use crate::workspace::{Checkpoint, Workspace};

/// Extra time an agent gets past its sandbox deadline to report.
const PHASE_GRACE: Duration = Duration::from_secs(5);

/// Risk label: the work phase failed and its changes were kept.
pub const RISK_WORK_FAILED: &str = "work_failed";
/// Risk label: a rollback was required but the workspace is not a git tree.
pub const RISK_ROLLBACK_UNAVAILABLE: &str = "rollback_unavailable";

struct Reply {
    outcome: PhaseOutcome,
    verdict: Option<Verdict>,
}

pub(super) struct TaskRun<'a> {
    pipeline: &'a Pipeline,
    config: &'a TaskConfig,
    cancel: &'a CancelToken,
    strategy: String,
    workspace: Workspace,
    state: TaskState,
    history: Vec<Transition>,
    phases: BTreeMap<PhaseName, PhaseMetrics>,
    retry_count: u32,
    risk_labels: Vec<String>,
    carried: Vec<PooledInstance>,
    plan: Option<String>,
    work_output: Option<String>,
    feedback: Option<String>,
    verdict: Option<Verdict>,
    artifacts: BTreeSet<String>,
    phases_completed: u32,
    started_at: chrono::DateTime<Utc>,
    started: Instant,
}

enum Step {
    Next(TaskState),
    Done(TaskState, Option<FailureClass>, Option<String>),
}

impl<'a> TaskRun<'a> {
    pub(super) fn new(pipeline: &'a Pipeline, config: &'a TaskConfig, cancel: &'a CancelToken) -> Self {
        let strategy = config
            .sandbox_strategy
            .clone()
            .unwrap_or_else(|| pipeline.sandbox.default_strategy().to_string());
        Self {
            pipeline,
            config,
            cancel,
            strategy,
            workspace: Workspace::new(PathBuf::from(&config.workspace)),
            state: TaskState::Pending,
            history: Vec::new(),
            phases: BTreeMap::new(),
            retry_count: 0,
            risk_labels: Vec::new(),
            carried: Vec::new(),
            plan: None,
            work_output: None,
            feedback: None,
            verdict: None,
            artifacts: BTreeSet::new(),
            phases_completed: 0,
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    fn task_id(&self) -> &str {
        &self.config.id
    }

    /// Resolves every reference the task makes before any phase runs.
    fn preflight(&self) -> PlatformResult<()> {
        self.pipeline.sandbox.strategy(&self.strategy)?;
        if !self.workspace.root().is_dir() {
            return Err(PlatformError::configuration(format!(
                "workspace '{}' is not a directory",
                self.workspace.root().display()
            )));
        }
        for (phase, config) in self.phase_configs() {
            if !config.enabled {
                if phase != PhaseName::Planning {
                    return Err(PlatformError::configuration(format!(
                        "the {phase} phase cannot be disabled"
                    )));
                }
                continue;
            }
            if config.max_attempts == 0 {
                return Err(PlatformError::configuration(format!(
                    "{phase}.max_attempts must be at least 1"
                )));
            }
            config.check_timeout(phase)?;
            for pool in &config.pools {
                self.pipeline.pools.pool(pool)?;
            }
        }
        Ok(())
    }

    fn phase_configs(&self) -> [(PhaseName, &'a PhaseConfig); 3] {
        [
            (PhaseName::Planning, &self.config.planning),
            (PhaseName::Working, &self.config.working),
            (PhaseName::Evaluating, &self.config.evaluating),
        ]
    }

    fn phase_config(&self, phase: PhaseName) -> &'a PhaseConfig {
        match phase {
            PhaseName::Planning => &self.config.planning,
            PhaseName::Working => &self.config.working,
            PhaseName::Evaluating => &self.config.evaluating,
        }
    }

    /// Drives the task to a terminal state. Every failure becomes a
    /// `FAILED` result; nothing is held once this returns.
    pub(super) async fn execute(mut self) -> TaskResult {
        info!(task_id = %self.task_id(), strategy = %self.strategy, "Task started");

        if let Err(e) = self.preflight() {
            return self
                .finish(TaskState::Failed, Some(FailureClass::ConfigurationError), Some(e.to_string()))
                .await;
        }

        let mut next = if self.config.planning.enabled {
            TaskState::Planning
        } else {
            TaskState::Working
        };
        loop {
            if let Err(e) = self.transition(next) {
                return self
                    .finish(TaskState::Failed, None, Some(e.to_string()))
                    .await;
            }
            if self.cancel.is_cancelled() {
                return self.cancelled().await;
            }
            let step = match self.state {
                TaskState::Planning => self.planning().await,
                TaskState::Working => self.working().await,
                TaskState::Evaluating => self.evaluating().await,
                other => Step::Done(
                    TaskState::Failed,
                    None,
                    Some(format!("no phase runs in state {other}")),
                ),
            };
            match step {
                Step::Next(state) => next = state,
                Step::Done(status, classification, reason) => {
                    return self.finish(status, classification, reason).await;
                }
            }
        }
    }

    async fn cancelled(self) -> TaskResult {
        self.finish(
            TaskState::Failed,
            Some(FailureClass::Cancelled),
            Some("task was cancelled".to_string()),
        )
        .await
    }

    fn failed(phase: PhaseName, error: &PlatformError) -> Step {
        let class = if matches!(error, PlatformError::Cancelled) {
            FailureClass::Cancelled
        } else if error.is_configuration() {
            FailureClass::ConfigurationError
        } else {
            phase.failure()
        };
        Step::Done(TaskState::Failed, Some(class), Some(error.to_string()))
    }

    async fn planning(&mut self) -> Step {
        match self.run_phase(PhaseName::Planning).await {
            Ok(reply) => {
                self.plan = Some(reply.outcome.output);
                Step::Next(TaskState::Working)
            }
            Err(e) => Self::failed(PhaseName::Planning, &e),
        }
    }

    async fn working(&mut self) -> Step {
        let checkpoint = match self.workspace.checkpoint().await {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                warn!(task_id = %self.task_id(), "Failed to checkpoint workspace: {:#}", e);
                Checkpoint::Unavailable
            }
        };

        match self.run_phase(PhaseName::Working).await {
            Ok(reply) => {
                let changed = self.workspace.changed_files(&checkpoint).await;
                self.artifacts.extend(reply.outcome.files_modified.iter().cloned());
                self.artifacts.extend(changed);
                self.work_output = Some(reply.outcome.output);
                Step::Next(TaskState::Evaluating)
            }
            Err(PlatformError::Cancelled) => Self::failed(PhaseName::Working, &PlatformError::Cancelled),
            Err(e) => match self.config.on_work_failure {
                WorkFailurePolicy::Rollback => {
                    match self.workspace.rollback(&checkpoint).await {
                        Ok(true) => {}
                        Ok(false) => self.label(RISK_ROLLBACK_UNAVAILABLE),
                        Err(rollback_err) => {
                            warn!(task_id = %self.task_id(), "Rollback failed: {:#}", rollback_err);
                            self.label(RISK_ROLLBACK_UNAVAILABLE);
                        }
                    }
                    Self::failed(PhaseName::Working, &e)
                }
                WorkFailurePolicy::ContinueWithRisk => {
                    warn!(task_id = %self.task_id(), error = %e, "Work failed; continuing to evaluation with risk label");
                    self.label(RISK_WORK_FAILED);
                    self.artifacts
                        .extend(self.workspace.changed_files(&checkpoint).await);
                    self.work_output = Some(format!("The work phase failed: {e}"));
                    Step::Next(TaskState::Evaluating)
                }
            },
        }
    }

    async fn evaluating(&mut self) -> Step {
        let reply = match self.run_phase(PhaseName::Evaluating).await {
            Ok(reply) => reply,
            Err(e) => return Self::failed(PhaseName::Evaluating, &e),
        };
        let verdict = reply.verdict.unwrap_or_default();
        let cost = self.phases.values().map(|m| m.cost_usd).sum();
        let gate = check_gate(&self.config.quality_gate, &verdict, cost);
        self.verdict = Some(verdict);

        match gate {
            Ok(()) => Step::Done(TaskState::Completed, None, None),
            Err(unmet) if self.retry_count < self.config.max_retries => {
                self.retry_count += 1;
                let feedback = unmet.join("; ");
                info!(
                    task_id = %self.task_id(),
                    retry = self.retry_count,
                    max_retries = self.config.max_retries,
                    %feedback,
                    "Quality gate not met; retrying"
                );
                self.feedback = Some(feedback);
                let back = match self.config.retry_from {
                    RetryFrom::Planning if self.config.planning.enabled => TaskState::Planning,
                    _ => TaskState::Working,
                };
                Step::Next(back)
            }
            Err(unmet) => {
                let error = PlatformError::evaluation_failed(unmet.join("; "));
                Step::Done(
                    TaskState::Failed,
                    Some(FailureClass::EvaluationFailed),
                    Some(error.to_string()),
                )
            }
        }
    }

    /// Runs every attempt of one phase. Returns the first success or the
    /// last failure.
    async fn run_phase(&mut self, phase: PhaseName) -> PlatformResult<Reply> {
        let config = self.phase_config(phase);
        let mut last_error = PlatformError::execution(format!("{phase} made no attempts"));

        for attempt in 1..=config.max_attempts {
            if attempt > 1 {
                let delay = config.backoff(attempt - 1);
                debug!(task_id = %self.task_id(), %phase, attempt, delay_ms = delay.as_millis() as u64, "Backing off before retry");
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = self.cancel.cancelled() => return Err(PlatformError::Cancelled),
                }
            }
            if self.cancel.is_cancelled() {
                return Err(PlatformError::Cancelled);
            }

            self.metrics(phase).attempts += 1;
            self.emit_phase(phase, attempt, "start", None);
            info!(event = "phase_start", task_id = %self.task_id(), %phase, attempt, "Phase attempt started");

            let started = Instant::now();
            let result = self.attempt(phase, attempt, config).await;
            let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            self.metrics(phase).duration_ms += elapsed;

            let result = result.and_then(|mut reply| {
                reply.outcome.cost_usd = self
                    .pipeline
                    .usage
                    .record(self.pipeline.agent.name(), &reply.outcome);
                self.metrics(phase).record(&reply.outcome);
                match config.max_turns {
                    Some(limit) if reply.outcome.turns > limit => Err(PlatformError::execution(format!(
                        "{phase} used {} turns, limit is {limit}",
                        reply.outcome.turns
                    ))),
                    _ => Ok(reply),
                }
            });

            match result {
                Ok(reply) => {
                    self.emit_phase(phase, attempt, "success", None);
                    info!(event = "phase_success", task_id = %self.task_id(), %phase, attempt, duration_ms = elapsed, "Phase attempt succeeded");
                    self.phases_completed += 1;
                    return Ok(reply);
                }
                Err(e) => {
                    self.emit_phase(phase, attempt, "failure", Some(e.to_string()));
                    warn!(event = "phase_failure", task_id = %self.task_id(), %phase, attempt, error = %e, "Phase attempt failed");
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// One attempt: acquire the phase's pools, call the agent, release.
    async fn attempt(
        &mut self,
        phase: PhaseName,
        attempt: u32,
        config: &PhaseConfig,
    ) -> PlatformResult<Reply> {
        let mut held = Vec::new();
        for pool in &config.pools {
            if self.carried.iter().any(|i| i.pool() == pool) {
                continue;
            }
            let acquired = tokio::select! {
                r = self.pipeline.pools.acquire(self.task_id(), pool, self.config.acquire_timeout()) => r,
                () = self.cancel.cancelled() => Err(PlatformError::Cancelled),
            };
            match acquired {
                Ok(instance) => held.push(instance),
                Err(e) => {
                    self.release(held).await;
                    return Err(e);
                }
            }
        }

        let ctx = PhaseContext {
            task_id: self.config.id.clone(),
            goal: self.config.goal.clone(),
            workspace: self.workspace.root().to_path_buf(),
            phase,
            attempt,
            retry: self.retry_count,
            plan: self.plan.clone(),
            work_output: self.work_output.clone(),
            feedback: self.feedback.clone(),
            resources: self
                .carried
                .iter()
                .chain(held.iter())
                .map(|i| (i.pool().to_string(), i.handle().clone()))
                .collect(),
            sandbox: PhaseSandbox::new(
                std::sync::Arc::clone(&self.pipeline.sandbox),
                &self.config.id,
                &self.strategy,
                self.workspace.root().to_path_buf(),
                config.timeout(),
                self.cancel.clone(),
            ),
        };

        let agent = &self.pipeline.agent;
        let call = async {
            match phase {
                PhaseName::Planning => agent.plan(&ctx, config).await.map(|outcome| Reply {
                    outcome,
                    verdict: None,
                }),
                PhaseName::Working => agent.work(&ctx, config).await.map(|outcome| Reply {
                    outcome,
                    verdict: None,
                }),
                PhaseName::Evaluating => agent.evaluate(&ctx, config).await.map(|e| Reply {
                    outcome: e.outcome,
                    verdict: Some(e.verdict),
                }),
            }
        };
        let limit = config.timeout().saturating_add(PHASE_GRACE);
        let result = tokio::select! {
            r = tokio::time::timeout(limit, call) => r.unwrap_or_else(|_| {
                Err(PlatformError::execution(format!(
                    "{phase} did not finish within {} s",
                    config.timeout_secs
                )))
            }),
            () = self.cancel.cancelled() => Err(PlatformError::Cancelled),
        };
        drop(ctx);

        if config.carry_forward && result.is_ok() {
            self.carried.extend(held);
        } else {
            self.release(held).await;
        }
        result
    }

    async fn release(&self, instances: Vec<PooledInstance>) {
        for instance in instances {
            if let Err(rejected) = self.pipeline.pools.release(self.task_id(), instance).await {
                warn!(task_id = %self.task_id(), "Pool release rejected: {}", rejected);
            }
        }
    }

    fn metrics(&mut self, phase: PhaseName) -> &mut PhaseMetrics {
        self.phases.entry(phase).or_default()
    }

    fn label(&mut self, label: &str) {
        if !self.risk_labels.iter().any(|l| l == label) {
            self.risk_labels.push(label.to_string());
        }
    }

    fn transition(&mut self, to: TaskState) -> PlatformResult<()> {
        let from = self.state;
        self.state = from.transition(to)?;
        self.history.push(Transition {
            from,
            to,
            at: Utc::now(),
        });
        let totals = Totals::from_phases(&self.phases, 0);
        debug!(task_id = %self.task_id(), %from, %to, "Task state transition");
        self.pipeline.bus.emit(
            &StateSnapshot {
                from,
                to,
                retry_count: self.retry_count,
                turns: totals.turns,
                cost_usd: totals.cost_usd,
                files_modified: totals.files_modified,
                commands_run: totals.commands_run,
            },
            Some(self.task_id()),
        );
        Ok(())
    }

    fn emit_phase(&mut self, phase: PhaseName, attempt: u32, action: &str, error: Option<String>) {
        let metrics = self.metrics(phase).clone();
        self.pipeline.bus.emit(
            &PhaseEvent {
                phase,
                attempt,
                action: action.to_string(),
                error,
                metrics,
            },
            Some(&self.config.id),
        );
    }

    async fn finish(
        mut self,
        status: TaskState,
        classification: Option<FailureClass>,
        reason: Option<String>,
    ) -> TaskResult {
        let carried = std::mem::take(&mut self.carried);
        self.release(carried).await;

        if let Err(e) = self.transition(status) {
            warn!(task_id = %self.task_id(), "Terminal transition rejected: {}", e);
        }
        let duration_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let partial = status == TaskState::Failed && self.phases_completed > 0;

        match (&classification, &reason) {
            (Some(class), Some(reason)) => {
                warn!(task_id = %self.task_id(), %class, partial, %reason, "Task failed");
            }
            _ => info!(task_id = %self.task_id(), %status, duration_ms, "Task finished"),
        }

        TaskResult {
            task_id: self.config.id.clone(),
            status,
            classification,
            reason,
            partial,
            risk_labels: self.risk_labels,
            totals: Totals::from_phases(&self.phases, duration_ms),
            phases: self.phases,
            retry_count: self.retry_count,
            history: self.history,
            verdict: self.verdict,
            artifacts: self.artifacts.into_iter().collect(),
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}
