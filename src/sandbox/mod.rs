//! Isolated command execution under enforced resource limits.
//!
//! Each named strategy from `[sandbox.strategies]` is either a local
//! subprocess group or a Docker container. A [`SandboxManager`] hands out
//! [`SandboxSession`]s bounded by the strategy's `max_concurrency`, runs one
//! command per session and reports every run on the event bus.

mod docker;
mod error;
mod limits;
mod network;
mod output;
mod sampler;
mod session;
mod subprocess;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

pub use network::NetworkPolicy;
pub use session::{SandboxCommand, SandboxResult, SandboxSession, SessionStatus};

use crate::config::{SandboxConfig, StrategyConfig, StrategyKind};
use crate::error::{PlatformError, PlatformResult};
use crate::events::{EventBus, SandboxExecutionEvent, SandboxViolationEvent};
use crate::pipeline::CancelToken;
use session::SessionBackend;

struct Strategy {
    config: Arc<StrategyConfig>,
    slots: Arc<Semaphore>,
}

/// Creates, runs and cleans up sandbox sessions.
pub struct SandboxManager {
    strategies: BTreeMap<String, Strategy>,
    default_strategy: String,
    bus: Arc<EventBus>,
}

impl SandboxManager {
    pub fn from_config(config: &SandboxConfig, bus: Arc<EventBus>) -> Self {
        let strategies = config
            .strategies
            .iter()
            .map(|(name, strategy)| {
                let slots = Arc::new(Semaphore::new(strategy.max_concurrency));
                (
                    name.clone(),
                    Strategy {
                        config: Arc::new(strategy.clone()),
                        slots,
                    },
                )
            })
            .collect();
        Self {
            strategies,
            default_strategy: config.default_strategy.clone(),
            bus,
        }
    }

    pub fn default_strategy(&self) -> &str {
        &self.default_strategy
    }

    pub fn strategy_names(&self) -> Vec<String> {
        self.strategies.keys().cloned().collect()
    }

    /// The configured limits of a strategy.
    pub fn strategy(&self, name: &str) -> PlatformResult<&StrategyConfig> {
        self.lookup(name).map(|s| s.config.as_ref())
    }

    /// Sessions currently holding a slot of `strategy`.
    pub fn active_sessions(&self, strategy: &str) -> usize {
        self.strategies.get(strategy).map_or(0, |s| {
            s.config
                .max_concurrency
                .saturating_sub(s.slots.available_permits())
        })
    }

    fn lookup(&self, name: &str) -> PlatformResult<&Strategy> {
        self.strategies.get(name).ok_or_else(|| {
            PlatformError::configuration(format!("unknown sandbox strategy '{name}'"))
        })
    }

    /// Opens a session without waiting for a slot.
    pub fn create_session(&self, owner: &str, strategy: &str) -> PlatformResult<SandboxSession> {
        let entry = self.lookup(strategy)?;
        let permit = Arc::clone(&entry.slots)
            .try_acquire_owned()
            .map_err(|_| PlatformError::ConcurrencyLimit {
                strategy: strategy.to_string(),
                limit: entry.config.max_concurrency,
            })?;
        self.open(owner, strategy, entry, permit)
    }

    /// Opens a session, waiting up to `timeout` for a slot.
    pub async fn create_session_wait(
        &self,
        owner: &str,
        strategy: &str,
        timeout: Duration,
    ) -> PlatformResult<SandboxSession> {
        let entry = self.lookup(strategy)?;
        let limit_error = || PlatformError::ConcurrencyLimit {
            strategy: strategy.to_string(),
            limit: entry.config.max_concurrency,
        };
        let permit = match tokio::time::timeout(timeout, Arc::clone(&entry.slots).acquire_owned())
            .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => return Err(limit_error()),
        };
        self.open(owner, strategy, entry, permit)
    }

    fn open(
        &self,
        owner: &str,
        strategy: &str,
        entry: &Strategy,
        permit: OwnedSemaphorePermit,
    ) -> PlatformResult<SandboxSession> {
        let backend = match entry.config.kind {
            StrategyKind::Subprocess => {
                let scratch = tempfile::Builder::new()
                    .prefix("phaserun-sbx-")
                    .tempdir()
                    .map_err(|e| {
                        PlatformError::sandbox(format!("failed to create scratch directory: {e}"))
                    })?;
                SessionBackend::Subprocess {
                    scratch: Some(scratch),
                }
            }
            StrategyKind::Container => SessionBackend::Container {
                docker: docker::connect()?,
                container: None,
            },
        };
        let session = SandboxSession::new(owner, strategy, Arc::clone(&entry.config), backend, permit);
        debug!(
            session = session.id(),
            owner,
            strategy,
            kind = %entry.config.kind,
            active = self.active_sessions(strategy),
            "Sandbox session created"
        );
        Ok(session)
    }

    /// Runs `command` to completion, timeout, cancellation or a limit breach.
    ///
    /// A session runs exactly one command; a second call fails with
    /// `InvalidTransition`.
    pub async fn run(
        &self,
        session: &mut SandboxSession,
        command: SandboxCommand,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> PlatformResult<SandboxResult> {
        session.set_status(SessionStatus::Running)?;
        let summary = command.summary();
        self.emit_exec(session, "start", &summary, None);

        let started = Instant::now();
        let report = match session.execute(&command, timeout, cancel).await {
            Ok(report) => report,
            Err(e) => {
                warn!(session = session.id(), error = %e, "Sandbox run failed");
                session.set_status(SessionStatus::Error)?;
                let result = SandboxResult {
                    session_id: session.id().to_string(),
                    outcome: SessionStatus::Error,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: e.to_string(),
                    stdout_dropped: 0,
                    stderr_dropped: 0,
                    duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    peak_cpu_pct: 0.0,
                    peak_memory_mb: 0.0,
                    cancelled: false,
                    violation: None,
                };
                self.emit_exec(session, "finish", &summary, Some(&result));
                return Err(e);
            }
        };

        let result = SandboxResult::from_report(session.id(), report, started.elapsed());
        session.set_status(result.outcome)?;
        self.emit_exec(session, "finish", &summary, Some(&result));
        if let Some(violation) = &result.violation {
            self.bus.emit(
                &SandboxViolationEvent {
                    session_id: session.id().to_string(),
                    owner: session.owner().to_string(),
                    strategy: session.strategy().to_string(),
                    limit: violation.limit.to_string(),
                    observed: violation.observed,
                    threshold: violation.threshold,
                },
                Some(session.owner()),
            );
        }
        debug!(
            session = session.id(),
            outcome = %result.outcome,
            exit_code = ?result.exit_code,
            duration_ms = result.duration_ms,
            "Sandbox run finished"
        );
        Ok(result)
    }

    /// Releases the session's processes, scratch state and slot.
    pub async fn cleanup(&self, mut session: SandboxSession) {
        session.cleanup().await;
    }

    /// Removes containers left over from an earlier process. A no-op when
    /// no container strategy is configured.
    pub async fn cleanup_orphaned(&self) -> PlatformResult<usize> {
        let uses_containers = self
            .strategies
            .values()
            .any(|s| s.config.kind == StrategyKind::Container);
        if !uses_containers {
            return Ok(0);
        }
        let client = docker::connect()?;
        let removed = docker::cleanup_orphaned(&client).await?;
        if removed > 0 {
            info!(removed, "Cleaned up orphaned sandbox containers");
        }
        Ok(removed)
    }

    fn emit_exec(
        &self,
        session: &SandboxSession,
        phase: &str,
        command: &str,
        result: Option<&SandboxResult>,
    ) {
        let event = SandboxExecutionEvent {
            session_id: session.id().to_string(),
            owner: session.owner().to_string(),
            strategy: session.strategy().to_string(),
            phase: phase.to_string(),
            command: command.to_string(),
            outcome: result.map(|r| r.outcome),
            exit_code: result.and_then(|r| r.exit_code),
            duration_ms: result.map(|r| r.duration_ms),
            peak_cpu_pct: result.map(|r| r.peak_cpu_pct),
            peak_memory_mb: result.map(|r| r.peak_memory_mb),
            cancelled: result.is_some_and(|r| r.cancelled),
        };
        self.bus.emit(&event, Some(session.owner()));
    }
}
