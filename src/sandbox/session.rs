//! Sandbox sessions and the values that flow through a run.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bollard::container::RemoveContainerOptions;
use bollard::Docker;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, warn};

use super::limits::Violation;
use super::{docker, subprocess};
use crate::config::StrategyConfig;
use crate::error::{PlatformError, PlatformResult};
use crate::pipeline::CancelToken;

/// Lifecycle of a session: one run, then cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Created,
    Running,
    Completed,
    TimedOut,
    Violation,
    Error,
    Cleaned,
}

impl SessionStatus {
    /// True for the outcomes a run can end in.
    pub fn is_outcome(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::TimedOut | Self::Violation | Self::Error
        )
    }

    /// Checks `self -> to` against the session state machine.
    pub fn transition(self, to: SessionStatus) -> PlatformResult<SessionStatus> {
        let allowed = match (self, to) {
            (Self::Cleaned, _) => false,
            (_, Self::Cleaned) => true,
            (Self::Created, Self::Running) => true,
            (Self::Running, outcome) => outcome.is_outcome(),
            _ => false,
        };
        if allowed {
            Ok(to)
        } else {
            Err(PlatformError::invalid_transition(self, to))
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "CREATED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::TimedOut => "TIMED_OUT",
            Self::Violation => "VIOLATION",
            Self::Error => "ERROR",
            Self::Cleaned => "CLEANED",
        };
        f.write_str(name)
    }
}

/// A shell script to run inside a session.
#[derive(Debug, Clone, Default)]
pub struct SandboxCommand {
    pub script: String,
    pub stdin: Option<String>,
    pub env: Vec<(String, String)>,
    /// Host directory the command runs in; defaults to the session scratch
    /// directory. Container sessions mount it at `/workspace`.
    pub workdir: Option<PathBuf>,
}

impl SandboxCommand {
    pub fn shell(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    #[must_use]
    pub fn with_env(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(env);
        self
    }

    #[must_use]
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    /// First line of the script, for events and logs.
    pub fn summary(&self) -> String {
        let first = self.script.lines().next().unwrap_or_default();
        if first.len() > 120 {
            let mut end = 120;
            while !first.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &first[..end])
        } else {
            first.to_string()
        }
    }
}

/// What a backend observed during one run.
#[derive(Debug)]
pub(crate) struct RunReport {
    pub outcome: SessionStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_dropped: u64,
    pub stderr_dropped: u64,
    pub peak_cpu_pct: f64,
    pub peak_memory_mb: f64,
    pub cancelled: bool,
    pub violation: Option<Violation>,
}

/// The result of one sandbox run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxResult {
    pub session_id: String,
    pub outcome: SessionStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Bytes discarded past the output limit.
    pub stdout_dropped: u64,
    pub stderr_dropped: u64,
    pub duration_ms: u64,
    pub peak_cpu_pct: f64,
    pub peak_memory_mb: f64,
    /// The run was stopped by task cancellation rather than its timeout.
    pub cancelled: bool,
    pub violation: Option<Violation>,
}

impl SandboxResult {
    pub(crate) fn from_report(session_id: &str, report: RunReport, duration: Duration) -> Self {
        Self {
            session_id: session_id.to_string(),
            outcome: report.outcome,
            exit_code: report.exit_code,
            stdout: report.stdout,
            stderr: report.stderr,
            stdout_dropped: report.stdout_dropped,
            stderr_dropped: report.stderr_dropped,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            peak_cpu_pct: report.peak_cpu_pct,
            peak_memory_mb: report.peak_memory_mb,
            cancelled: report.cancelled,
            violation: report.violation,
        }
    }

    /// Completed with exit code 0.
    pub fn success(&self) -> bool {
        self.outcome == SessionStatus::Completed && self.exit_code == Some(0)
    }

    /// Maps an abnormal outcome to the error the calling phase should see.
    /// A completed run is `Ok` whatever its exit code.
    pub fn check(&self) -> PlatformResult<&Self> {
        match self.outcome {
            SessionStatus::Completed => Ok(self),
            SessionStatus::TimedOut if self.cancelled => Err(PlatformError::Cancelled),
            SessionStatus::TimedOut => Err(PlatformError::execution(format!(
                "sandbox run timed out after {} ms",
                self.duration_ms
            ))),
            SessionStatus::Violation => Err(PlatformError::violation(
                self.violation
                    .as_ref()
                    .map_or_else(|| "resource limit exceeded".to_string(), ToString::to_string),
            )),
            other => Err(PlatformError::sandbox(format!(
                "sandbox run ended {other}: {}",
                self.stderr.trim()
            ))),
        }
    }
}

/// Strategy-specific session state.
pub(crate) enum SessionBackend {
    Subprocess {
        scratch: Option<TempDir>,
    },
    Container {
        docker: Docker,
        container: Option<String>,
    },
}

/// An isolated execution context owned by one task.
///
/// Dropping a session that was not cleaned up removes its scratch
/// directory, schedules container removal and frees its concurrency slot.
pub struct SandboxSession {
    id: String,
    owner: String,
    strategy: String,
    limits: Arc<StrategyConfig>,
    status: SessionStatus,
    pub(crate) backend: SessionBackend,
    permit: Option<OwnedSemaphorePermit>,
}

impl std::fmt::Debug for SandboxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = match &self.backend {
            SessionBackend::Subprocess { .. } => "subprocess",
            SessionBackend::Container { .. } => "container",
        };
        f.debug_struct("SandboxSession")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("strategy", &self.strategy)
            .field("status", &self.status)
            .field("backend", &backend)
            .finish_non_exhaustive()
    }
}

impl SandboxSession {
    pub(crate) fn new(
        owner: &str,
        strategy: &str,
        limits: Arc<StrategyConfig>,
        backend: SessionBackend,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        let short = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: format!("sbx-{}", &short[..12]),
            owner: owner.to_string(),
            strategy: strategy.to_string(),
            limits,
            status: SessionStatus::Created,
            backend,
            permit: Some(permit),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn strategy(&self) -> &str {
        &self.strategy
    }

    pub fn limits(&self) -> &StrategyConfig {
        &self.limits
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Scratch directory of a subprocess session.
    #[cfg(test)]
    pub fn scratch_dir(&self) -> Option<&std::path::Path> {
        match &self.backend {
            SessionBackend::Subprocess { scratch } => scratch.as_ref().map(TempDir::path),
            SessionBackend::Container { .. } => None,
        }
    }

    pub(crate) fn set_status(&mut self, to: SessionStatus) -> PlatformResult<()> {
        self.status = self.status.transition(to)?;
        Ok(())
    }

    /// Runs `command` on this session's backend.
    pub(crate) async fn execute(
        &mut self,
        command: &SandboxCommand,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> PlatformResult<RunReport> {
        match &mut self.backend {
            SessionBackend::Subprocess { scratch } => {
                let scratch = scratch
                    .as_ref()
                    .ok_or_else(|| PlatformError::sandbox("session scratch directory is gone"))?;
                subprocess::run(&self.id, &self.limits, scratch.path(), command, timeout, cancel)
                    .await
            }
            SessionBackend::Container {
                docker: client,
                container,
            } => {
                docker::run(client, container, &self.id, &self.limits, command, timeout, cancel)
                    .await
            }
        }
    }

    /// Releases every resource the session holds. Idempotent.
    pub async fn cleanup(&mut self) {
        if self.status == SessionStatus::Cleaned {
            return;
        }
        match &mut self.backend {
            SessionBackend::Subprocess { scratch } => {
                if let Some(dir) = scratch.take() {
                    if let Err(e) = dir.close() {
                        warn!(session = %self.id, "Failed to remove scratch directory: {}", e);
                    }
                }
            }
            SessionBackend::Container { docker, container } => {
                if let Some(name) = container.take() {
                    remove_container(docker, &name).await;
                }
            }
        }
        self.permit.take();
        self.status = SessionStatus::Cleaned;
        debug!(session = %self.id, strategy = %self.strategy, "Sandbox session cleaned up");
    }
}

impl Drop for SandboxSession {
    fn drop(&mut self) {
        if self.status == SessionStatus::Cleaned {
            return;
        }
        debug!(session = %self.id, status = %self.status, "Sandbox session dropped before cleanup");
        if let SessionBackend::Container { docker, container } = &mut self.backend {
            if let Some(name) = container.take() {
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        let docker = docker.clone();
                        runtime.spawn(async move { remove_container(&docker, &name).await });
                    }
                    Err(_) => warn!(container = %name, "No runtime to remove sandbox container"),
                }
            }
        }
    }
}

pub(crate) async fn remove_container(docker: &Docker, name: &str) {
    let removed = docker
        .remove_container(
            name,
            Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            }),
        )
        .await;
    match removed {
        Ok(()) => debug!(container = %name, "Removed sandbox container"),
        Err(e) => warn!(container = %name, "Failed to remove sandbox container: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_state_machine() {
        use SessionStatus::*;
        assert_eq!(Created.transition(Running).unwrap(), Running);
        assert_eq!(Running.transition(Violation).unwrap(), Violation);
        assert_eq!(TimedOut.transition(Cleaned).unwrap(), Cleaned);
        assert_eq!(Created.transition(Cleaned).unwrap(), Cleaned);
        assert!(Created.transition(Completed).is_err());
        assert!(Completed.transition(Running).is_err());
        assert!(Cleaned.transition(Running).is_err());
        assert!(Cleaned.transition(Cleaned).is_err());
    }

    #[test]
    fn test_status_serializes_screaming_case() {
        assert_eq!(
            serde_json::to_value(SessionStatus::TimedOut).unwrap(),
            "TIMED_OUT"
        );
        assert_eq!(SessionStatus::TimedOut.to_string(), "TIMED_OUT");
    }

    #[test]
    fn test_command_summary_truncates_first_line() {
        let cmd = SandboxCommand::shell(format!("{}\nsecond", "a".repeat(200)));
        assert_eq!(cmd.summary().len(), 123);
        assert_eq!(SandboxCommand::shell("make test\nmore").summary(), "make test");
    }

    fn result(outcome: SessionStatus, cancelled: bool) -> SandboxResult {
        SandboxResult {
            session_id: "s".to_string(),
            outcome,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            stdout_dropped: 0,
            stderr_dropped: 0,
            duration_ms: 5,
            peak_cpu_pct: 0.0,
            peak_memory_mb: 0.0,
            cancelled,
            violation: None,
        }
    }

    #[test]
    fn test_check_maps_outcomes_to_errors() {
        assert!(result(SessionStatus::Completed, false).check().is_ok());
        assert!(matches!(
            result(SessionStatus::TimedOut, true).check(),
            Err(PlatformError::Cancelled)
        ));
        assert!(matches!(
            result(SessionStatus::TimedOut, false).check(),
            Err(PlatformError::Execution { .. })
        ));
        assert!(matches!(
            result(SessionStatus::Violation, false).check(),
            Err(PlatformError::ResourceViolation { .. })
        ));
    }
}
