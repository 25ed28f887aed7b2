//! Phase executors.
//!
//! An [`Agent`] runs the plan, work and evaluate phases of a task. Every
//! agent executes inside the task's sandbox through [`PhaseSandbox`]:
//! - `command`: one configured shell script per phase
//! - `claude`: `claude -p --output-format json` with the prompt on stdin
//! - `cursor`: `agent -p "prompt" --output-format json`
//!
//! The agent is selected via `[agent].type` in phaserun.toml.

mod claude;
mod command;
mod cursor;
#[cfg(test)]
pub(crate) mod mock;
mod prompt;
mod report;

pub use claude::ClaudeAgent;
pub use command::CommandAgent;
pub use cursor::CursorAgent;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::{AgentConfig, PhaseConfig, MAX_TIMEOUT_SECS};
use crate::error::{PlatformError, PlatformResult};
use crate::pipeline::{CancelToken, PhaseName};
use crate::pool::ResourceHandle;
use crate::sandbox::{SandboxCommand, SandboxManager, SandboxResult};

/// What one phase attempt produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseOutcome {
    pub turns: u32,
    pub cost_usd: f64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub files_modified: Vec<String>,
    pub commands_run: Vec<String>,
    /// Text handed to the next phase.
    pub output: String,
}

/// The evaluate phase's judgement, checked against the quality gate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default)]
    pub checks: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Result of the evaluate phase.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub outcome: PhaseOutcome,
    pub verdict: Verdict,
}

/// Runs commands for one phase attempt inside the task's sandbox strategy.
///
/// Each command gets its own session, cleaned up before `run` returns.
/// Commands share the attempt's deadline and the task's cancellation.
pub struct PhaseSandbox {
    manager: Arc<SandboxManager>,
    owner: String,
    strategy: String,
    workspace: PathBuf,
    deadline: Instant,
    cancel: CancelToken,
}

impl PhaseSandbox {
    pub(crate) fn new(
        manager: Arc<SandboxManager>,
        owner: &str,
        strategy: &str,
        workspace: PathBuf,
        timeout: Duration,
        cancel: CancelToken,
    ) -> Self {
        Self {
            manager,
            owner: owner.to_string(),
            strategy: strategy.to_string(),
            workspace,
            deadline: Instant::now() + timeout.min(Duration::from_secs(MAX_TIMEOUT_SECS)),
            cancel,
        }
    }

    /// Time left in the attempt.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Runs `command` in a fresh session; defaults to the task workspace.
    pub async fn run(&self, mut command: SandboxCommand) -> PlatformResult<SandboxResult> {
        let remaining = self.remaining();
        if remaining.is_zero() {
            return Err(PlatformError::execution("phase time budget exhausted"));
        }
        if command.workdir.is_none() {
            command = command.in_dir(self.workspace.clone());
        }
        let mut session = self
            .manager
            .create_session_wait(&self.owner, &self.strategy, remaining)
            .await?;
        let result = self
            .manager
            .run(&mut session, command, self.remaining(), &self.cancel)
            .await;
        self.manager.cleanup(session).await;
        result
    }
}

/// Everything an agent sees for one phase attempt.
pub struct PhaseContext {
    pub task_id: String,
    pub goal: String,
    pub workspace: PathBuf,
    pub phase: PhaseName,
    /// 1-based attempt within this phase.
    pub attempt: u32,
    /// Evaluation retries consumed so far.
    pub retry: u32,
    pub plan: Option<String>,
    pub work_output: Option<String>,
    /// Unmet gate conditions from the previous evaluation.
    pub feedback: Option<String>,
    /// Pool instances held for this phase, by pool name.
    pub resources: Vec<(String, ResourceHandle)>,
    pub sandbox: PhaseSandbox,
}

impl PhaseContext {
    /// Environment exported to every phase command.
    pub fn env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("PHASERUN_TASK_ID".to_string(), self.task_id.clone()),
            ("PHASERUN_PHASE".to_string(), self.phase.to_string()),
            ("PHASERUN_ATTEMPT".to_string(), self.attempt.to_string()),
            ("PHASERUN_RETRY".to_string(), self.retry.to_string()),
            ("PHASERUN_GOAL".to_string(), self.goal.clone()),
        ];
        if let Some(feedback) = &self.feedback {
            env.push(("PHASERUN_FEEDBACK".to_string(), feedback.clone()));
        }
        if !self.resources.is_empty() {
            let resources: BTreeMap<&str, &ResourceHandle> = self
                .resources
                .iter()
                .map(|(pool, handle)| (pool.as_str(), handle))
                .collect();
            if let Ok(json) = serde_json::to_string(&resources) {
                env.push(("PHASERUN_RESOURCES".to_string(), json));
            }
        }
        env
    }

    /// Output of the phase before this one, fed to the command on stdin.
    pub fn previous_output(&self) -> Option<&str> {
        match self.phase {
            PhaseName::Planning => None,
            PhaseName::Working => self.plan.as_deref(),
            PhaseName::Evaluating => self.work_output.as_deref(),
        }
    }
}

/// A phase executor.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Name used in logs, events and usage reports.
    fn name(&self) -> &str;

    async fn plan(&self, ctx: &PhaseContext, config: &PhaseConfig) -> PlatformResult<PhaseOutcome>;

    async fn work(&self, ctx: &PhaseContext, config: &PhaseConfig) -> PlatformResult<PhaseOutcome>;

    async fn evaluate(&self, ctx: &PhaseContext, config: &PhaseConfig)
        -> PlatformResult<Evaluation>;
}

/// Supported agents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AgentKind {
    /// Configured shell commands.
    #[default]
    Command,
    /// Claude Code CLI.
    Claude,
    /// Cursor CLI agent.
    Cursor,
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Command => write!(f, "command"),
            Self::Claude => write!(f, "claude"),
            Self::Cursor => write!(f, "cursor"),
        }
    }
}

impl std::str::FromStr for AgentKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "command" => Ok(Self::Command),
            "claude" | "claude-code" => Ok(Self::Claude),
            "cursor" => Ok(Self::Cursor),
            _ => anyhow::bail!("Unknown agent type: '{s}'. Supported: command, claude, cursor"),
        }
    }
}

/// Constructs the configured agent.
pub fn build_agent(config: &AgentConfig) -> Result<Arc<dyn Agent>> {
    let agent: Arc<dyn Agent> = match config.agent_kind()? {
        AgentKind::Command => Arc::new(CommandAgent::new(config.command.clone())),
        AgentKind::Claude => Arc::new(ClaudeAgent::new(config.claude.clone())),
        AgentKind::Cursor => Arc::new(CursorAgent::new(config.cursor.clone())),
    };
    Ok(agent)
}

/// Fails the attempt with the tail of stderr when a command exits non-zero.
pub(crate) fn require_success(what: &str, result: &SandboxResult) -> PlatformResult<()> {
    result.check()?;
    if result.exit_code == Some(0) {
        return Ok(());
    }
    let stderr = result.stderr.trim();
    let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
    let tail: Vec<&str> = tail.into_iter().rev().collect();
    Err(PlatformError::execution(format!(
        "{what} exited with code {:?}{}{}",
        result.exit_code,
        if tail.is_empty() { "" } else { ": " },
        tail.join("\n")
    )))
}

/// Runs an agent CLI and parses its JSON reply.
async fn run_cli(
    ctx: &PhaseContext,
    name: &str,
    path: &str,
    install_hint: &str,
    command: SandboxCommand,
) -> PlatformResult<PhaseOutcome> {
    info!(task_id = %ctx.task_id, phase = %ctx.phase, "Running {} agent: {}", name, path);
    let result = ctx.sandbox.run(command).await?;
    result.check()?;

    match result.exit_code {
        Some(0) => {}
        Some(127) => {
            return Err(PlatformError::execution(format!(
                "{name} agent '{path}' not found. {install_hint}"
            )));
        }
        code => {
            warn!("Agent stderr: {}", result.stderr);
            return Err(PlatformError::execution(format!(
                "{name} agent failed with exit code {code:?}: {}",
                result.stderr.trim()
            )));
        }
    }

    let reply = report::CliReply::parse(&result.stdout);
    if reply.is_error {
        return Err(PlatformError::execution(format!(
            "{name} agent reported an error: {}",
            reply.result
        )));
    }
    let outcome = reply.outcome();
    info!(turns = outcome.turns, cost_usd = outcome.cost_usd, "{} agent completed", name);
    Ok(outcome)
}

/// Reads the verdict line a CLI agent was asked to end its reply with.
fn evaluation_from_text(outcome: PhaseOutcome) -> Evaluation {
    let verdict = report::find_verdict(&outcome.output).unwrap_or_else(|| Verdict {
        passed: false,
        summary: Some("agent reply carried no verdict".to_string()),
        ..Verdict::default()
    });
    Evaluation { outcome, verdict }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::config::{SandboxConfig, StrategyConfig};
    use crate::events::EventBus;

    /// A phase context backed by a local subprocess sandbox.
    pub(crate) fn context(phase: PhaseName, workspace: &std::path::Path) -> PhaseContext {
        let bus = Arc::new(EventBus::new(100));
        let config = SandboxConfig {
            default_strategy: "local".to_string(),
            strategies: BTreeMap::from([("local".to_string(), StrategyConfig::default())]),
        };
        let manager = Arc::new(SandboxManager::from_config(&config, bus));
        PhaseContext {
            task_id: "task-1".to_string(),
            goal: "make it work".to_string(),
            workspace: workspace.to_path_buf(),
            phase,
            attempt: 1,
            retry: 0,
            plan: Some("step one".to_string()),
            work_output: Some("did step one".to_string()),
            feedback: None,
            resources: Vec::new(),
            sandbox: PhaseSandbox::new(
                manager,
                "task-1",
                "local",
                workspace.to_path_buf(),
                Duration::from_secs(30),
                CancelToken::new(),
            ),
        }
    }
}
