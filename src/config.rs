use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::agent::AgentKind;
use crate::error::{PlatformError, PlatformResult};
use crate::pool::{PoolKind, PoolSettings};
use crate::sandbox::NetworkPolicy;

pub const CONFIG_FILE: &str = "phaserun.toml";

/// Upper bound for phase and acquire timeouts (one week).
pub const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub pools: BTreeMap<String, PoolConfig>,
    #[serde(default)]
    pub pool_maintenance: MaintenanceConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

/// Log output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level for the `phaserun` target; `RUST_LOG` overrides it
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "pretty" or "json"
    #[serde(default)]
    pub format: LogFormat,

    /// Optional log file; rolled daily
    #[serde(default)]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Event bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Number of recent events retained in memory
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Catch-all subscribers installed at startup
    #[serde(default)]
    pub exporters: Vec<ExporterConfig>,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            exporters: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExporterConfig {
    #[serde(rename = "type")]
    pub kind: ExporterKind,

    /// Output file for the jsonl exporter
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExporterKind {
    Log,
    Jsonl,
}

/// Sandbox strategies, selected per task by name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Strategy used by tasks that do not name one
    #[serde(default = "default_strategy_name")]
    pub default_strategy: String,

    #[serde(default = "default_strategies")]
    pub strategies: BTreeMap<String, StrategyConfig>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            default_strategy: default_strategy_name(),
            strategies: default_strategies(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Local child process in its own process group
    #[default]
    Subprocess,
    /// Docker container
    Container,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Subprocess => write!(f, "subprocess"),
            Self::Container => write!(f, "container"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    #[serde(default)]
    pub kind: StrategyKind,

    /// Sessions that may exist at once
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// CPU usage, in percent of total host CPU, that terminates a run
    #[serde(default = "default_cpu_limit")]
    pub hard_cpu_limit_pct: f64,

    /// Resident memory that terminates a run
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,

    #[serde(default)]
    pub max_open_files: Option<u64>,

    #[serde(default)]
    pub network: NetworkConfig,

    /// Additional volume mounts (container strategy)
    #[serde(default)]
    pub mounts: Vec<Mount>,

    /// How often resource usage is sampled
    #[serde(default = "default_sample_interval")]
    pub sample_interval_ms: u64,

    /// Docker image (container strategy)
    #[serde(default = "default_image")]
    pub image: String,

    /// Captured bytes kept per stream
    #[serde(default = "default_output_limit")]
    pub output_limit_bytes: usize,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            kind: StrategyKind::default(),
            max_concurrency: default_max_concurrency(),
            hard_cpu_limit_pct: default_cpu_limit(),
            memory_limit_mb: None,
            max_open_files: None,
            network: NetworkConfig::default(),
            mounts: Vec::new(),
            sample_interval_ms: default_sample_interval(),
            image: default_image(),
            output_limit_bytes: default_output_limit(),
        }
    }
}

impl StrategyConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    pub host: String,
    pub container: String,
    #[serde(default = "default_true")]
    pub readonly: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Network policy
    #[serde(default)]
    pub policy: NetworkPolicy,

    /// Allowed domains when policy = "allowlist"
    #[serde(default)]
    pub allowed: Vec<String>,

    /// Custom DNS servers (container strategy)
    #[serde(default = "default_dns")]
    pub dns: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            policy: NetworkPolicy::AllowAll,
            allowed: Vec::new(),
            dns: default_dns(),
        }
    }
}

/// A named dependency pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(rename = "type")]
    pub kind: PoolKind,

    #[serde(default = "default_max_instances")]
    pub max_instances: usize,

    /// Directories lent by a filesystem pool
    #[serde(default)]
    pub paths: Vec<String>,

    /// Executable lent by an agent-cli pool
    #[serde(default)]
    pub binary: Option<String>,

    /// Creation or validation failures tolerated per acquire
    #[serde(default = "default_max_replacements")]
    pub max_replacements: u32,

    /// Idle instances older than this are destroyed by maintenance
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,
}

impl PoolConfig {
    pub fn settings(&self) -> PoolSettings {
        PoolSettings {
            max_instances: self.max_instances,
            max_replacements: self.max_replacements,
            max_idle: Duration::from_secs(self.max_idle_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Seconds between idle sweeps; 0 disables them
    #[serde(default = "default_maintenance_interval")]
    pub interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_maintenance_interval(),
        }
    }
}

/// Agent configuration - selects and configures the phase executor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Which agent to use: "command", "claude" or "cursor"
    #[serde(rename = "type", default = "default_agent_type")]
    pub kind: String,

    /// Shell commands for the command agent
    #[serde(default)]
    pub command: CommandAgentConfig,

    /// Cursor-specific configuration
    #[serde(default)]
    pub cursor: CursorConfig,

    /// Claude-specific configuration
    #[serde(default)]
    pub claude: ClaudeConfig,

    /// Prices for agents that report tokens but not cost
    #[serde(default)]
    pub pricing: PricingConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            kind: default_agent_type(),
            command: CommandAgentConfig::default(),
            cursor: CursorConfig::default(),
            claude: ClaudeConfig::default(),
            pricing: PricingConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Parse the type tag into an AgentKind
    pub fn agent_kind(&self) -> Result<AgentKind> {
        self.kind.parse()
    }
}

/// One shell script per phase, run with `sh -c` inside the sandbox
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandAgentConfig {
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub work: Option<String>,
    #[serde(default)]
    pub evaluate: Option<String>,
}

/// Cursor CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorConfig {
    /// Path to the Cursor agent CLI
    /// - Default: "agent"
    /// - NixOS: "cursor-agent"
    #[serde(default = "default_cursor_path")]
    pub path: String,

    /// Model to use (optional, uses Cursor's default if not set)
    #[serde(default)]
    pub model: Option<String>,

    /// Output format for non-interactive mode
    #[serde(default = "default_output_format")]
    pub output_format: String,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            path: default_cursor_path(),
            model: None,
            output_format: default_output_format(),
        }
    }
}

/// Claude Code CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeConfig {
    /// Path to the Claude CLI
    #[serde(default = "default_claude_path")]
    pub path: String,

    /// Model to use (optional)
    /// - Examples: "opus", "sonnet"
    #[serde(default)]
    pub model: Option<String>,

    /// Skip permission prompts (required for autonomous operation)
    #[serde(default = "default_true")]
    pub skip_permissions: bool,

    /// Output format; "json" carries usage and cost
    #[serde(default = "default_output_format")]
    pub output_format: String,

    #[serde(default)]
    pub verbose: bool,
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            path: default_claude_path(),
            model: None,
            skip_permissions: true,
            output_format: default_output_format(),
            verbose: false,
        }
    }
}

/// USD per token
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PricingConfig {
    #[serde(default)]
    pub input_token_usd: f64,
    #[serde(default)]
    pub output_token_usd: f64,
}

/// Where terminal results go
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Directory for `<task_id>.json` and `<task_id>.events.jsonl`
    #[serde(default = "default_results_dir")]
    pub results_dir: String,

    /// Optional URL that receives each result as a JSON POST
    #[serde(default)]
    pub webhook: Option<String>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            results_dir: default_results_dir(),
            webhook: None,
        }
    }
}

/// Immutable configuration of one pipeline task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub id: String,

    /// Free-text objective handed to the agent
    #[serde(default)]
    pub goal: String,

    #[serde(default = "default_workspace")]
    pub workspace: String,

    /// Falls back to `[sandbox].default_strategy`
    #[serde(default)]
    pub sandbox_strategy: Option<String>,

    /// Upper bound on each pool acquire
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,

    /// Evaluation retries before the task fails
    #[serde(default)]
    pub max_retries: u32,

    /// Where a failed evaluation loops back to
    #[serde(default)]
    pub retry_from: RetryFrom,

    /// What a WORKING failure does; must be set explicitly
    pub on_work_failure: WorkFailurePolicy,

    #[serde(default)]
    pub planning: PhaseConfig,
    #[serde(default)]
    pub working: PhaseConfig,
    #[serde(default)]
    pub evaluating: PhaseConfig,

    #[serde(default)]
    pub quality_gate: QualityGate,
}

impl TaskConfig {
    /// A task with default phases and the given failure policy.
    pub fn new(id: impl Into<String>, on_work_failure: WorkFailurePolicy) -> Self {
        Self {
            id: id.into(),
            goal: String::new(),
            workspace: default_workspace(),
            sandbox_strategy: None,
            acquire_timeout_secs: default_acquire_timeout(),
            max_retries: 0,
            retry_from: RetryFrom::default(),
            on_work_failure,
            planning: PhaseConfig::default(),
            working: PhaseConfig::default(),
            evaluating: PhaseConfig::default(),
            quality_gate: QualityGate::default(),
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryFrom {
    /// Falls through to working when planning is disabled
    #[default]
    Planning,
    Working,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkFailurePolicy {
    /// Restore the workspace checkpoint and fail the task
    Rollback,
    /// Keep partial changes, label the task and evaluate anyway
    ContinueWithRisk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseConfig {
    /// Only planning may be disabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Attempts for this phase, counted per phase
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Turns above this count fail the attempt
    #[serde(default)]
    pub max_turns: Option<u32>,

    #[serde(default = "default_phase_timeout")]
    pub timeout_secs: u64,

    /// Pools acquired on phase entry
    #[serde(default)]
    pub pools: Vec<String>,

    /// Keep this phase's pool instances until the task ends
    #[serde(default)]
    pub carry_forward: bool,

    /// Base of the exponential backoff between attempts
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: default_max_attempts(),
            max_turns: None,
            timeout_secs: default_phase_timeout(),
            pools: Vec::new(),
            carry_forward: false,
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl PhaseConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Rejects a zero timeout or one above [`MAX_TIMEOUT_SECS`].
    pub fn check_timeout(&self, phase: impl std::fmt::Display) -> PlatformResult<()> {
        if self.timeout_secs == 0 || self.timeout_secs > MAX_TIMEOUT_SECS {
            return Err(PlatformError::configuration(format!(
                "{phase}.timeout_secs must be within 1..={MAX_TIMEOUT_SECS}"
            )));
        }
        Ok(())
    }

    /// Delay before attempt `attempt + 1`, doubling from `backoff_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}

/// Pass/fail conditions checked against the evaluation verdict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityGate {
    /// The verdict itself must pass
    #[serde(default = "default_true")]
    pub require_pass: bool,

    #[serde(default)]
    pub min_score: Option<f64>,

    /// Checks that must be present and passing
    #[serde(default)]
    pub required_checks: Vec<String>,

    /// Task cost ceiling
    #[serde(default)]
    pub max_cost_usd: Option<f64>,
}

impl Default for QualityGate {
    fn default() -> Self {
        Self {
            require_pass: true,
            min_score: None,
            required_checks: Vec::new(),
            max_cost_usd: None,
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_buffer_capacity() -> usize {
    10_000
}

fn default_strategy_name() -> String {
    "subprocess".to_string()
}

fn default_strategies() -> BTreeMap<String, StrategyConfig> {
    BTreeMap::from([(default_strategy_name(), StrategyConfig::default())])
}

fn default_max_concurrency() -> usize {
    8
}

fn default_cpu_limit() -> f64 {
    90.0
}

fn default_sample_interval() -> u64 {
    100
}

fn default_image() -> String {
    "phaserun-sandbox:latest".to_string()
}

fn default_output_limit() -> usize {
    1024 * 1024
}

fn default_dns() -> Vec<String> {
    vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()]
}

fn default_max_instances() -> usize {
    5
}

fn default_max_replacements() -> u32 {
    3
}

fn default_max_idle_secs() -> u64 {
    3600
}

fn default_maintenance_interval() -> u64 {
    300
}

fn default_agent_type() -> String {
    "command".to_string()
}

fn default_cursor_path() -> String {
    "agent".to_string()
}

fn default_claude_path() -> String {
    "claude".to_string()
}

fn default_output_format() -> String {
    "json".to_string()
}

fn default_results_dir() -> String {
    ".phaserun/results".to_string()
}

fn default_workspace() -> String {
    ".".to_string()
}

fn default_acquire_timeout() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    1
}

fn default_phase_timeout() -> u64 {
    600
}

fn default_backoff_ms() -> u64 {
    1000
}

impl Config {
    /// Load configuration from `path`, using defaults if it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parse TOML after expanding `${VAR}` references
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env(content);
        Ok(toml::from_str(&expanded)?)
    }

    /// The strategy a task runs under
    pub fn strategy_for<'a>(&'a self, task: &'a TaskConfig) -> &'a str {
        task.sandbox_strategy
            .as_deref()
            .unwrap_or(&self.sandbox.default_strategy)
    }

    /// Resolve every cross reference, failing on the first problem
    pub fn validate(&self) -> PlatformResult<()> {
        if self.events.buffer_capacity == 0 {
            return Err(PlatformError::configuration(
                "events.buffer_capacity must be at least 1",
            ));
        }
        for exporter in &self.events.exporters {
            if exporter.kind == ExporterKind::Jsonl && exporter.path.is_none() {
                return Err(PlatformError::configuration(
                    "jsonl event exporter requires a path",
                ));
            }
        }

        self.validate_sandbox()?;
        self.validate_pools()?;
        self.validate_agent()?;
        self.validate_tasks()
    }

    fn validate_sandbox(&self) -> PlatformResult<()> {
        if !self
            .sandbox
            .strategies
            .contains_key(&self.sandbox.default_strategy)
        {
            return Err(PlatformError::configuration(format!(
                "default sandbox strategy '{}' is not defined",
                self.sandbox.default_strategy
            )));
        }
        for (name, strategy) in &self.sandbox.strategies {
            if strategy.max_concurrency == 0 {
                return Err(PlatformError::configuration(format!(
                    "strategy '{name}': max_concurrency must be at least 1"
                )));
            }
            if strategy.hard_cpu_limit_pct <= 0.0 {
                return Err(PlatformError::configuration(format!(
                    "strategy '{name}': hard_cpu_limit_pct must be positive"
                )));
            }
            if strategy.sample_interval_ms == 0 {
                return Err(PlatformError::configuration(format!(
                    "strategy '{name}': sample_interval_ms must be at least 1"
                )));
            }
            if strategy.network.policy == NetworkPolicy::Allowlist
                && strategy.network.allowed.is_empty()
            {
                return Err(PlatformError::configuration(format!(
                    "strategy '{name}': allowlist network policy needs at least one allowed domain"
                )));
            }
            match strategy.kind {
                StrategyKind::Subprocess => {
                    if strategy.network.policy != NetworkPolicy::AllowAll {
                        return Err(PlatformError::configuration(format!(
                            "strategy '{name}': subprocess sandboxes cannot enforce network policy '{}'",
                            strategy.network.policy
                        )));
                    }
                }
                StrategyKind::Container => {
                    if strategy.image.trim().is_empty() {
                        return Err(PlatformError::configuration(format!(
                            "strategy '{name}': container strategy requires an image"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn validate_pools(&self) -> PlatformResult<()> {
        for (name, pool) in &self.pools {
            if pool.max_instances == 0 {
                return Err(PlatformError::configuration(format!(
                    "pool '{name}': max_instances must be at least 1"
                )));
            }
            match pool.kind {
                PoolKind::Filesystem if pool.paths.is_empty() => {
                    return Err(PlatformError::configuration(format!(
                        "pool '{name}': filesystem pools require at least one path"
                    )));
                }
                PoolKind::AgentCli if pool.binary.is_none() => {
                    return Err(PlatformError::configuration(format!(
                        "pool '{name}': agent-cli pools require 'binary'"
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn validate_agent(&self) -> PlatformResult<()> {
        let kind = self
            .agent
            .agent_kind()
            .map_err(|e| PlatformError::configuration(e.to_string()))?;
        if kind != AgentKind::Command {
            return Ok(());
        }
        let commands = &self.agent.command;
        if self.tasks.iter().any(|t| t.planning.enabled) && commands.plan.is_none() {
            return Err(PlatformError::configuration(
                "command agent needs [agent.command].plan when a task enables planning",
            ));
        }
        if !self.tasks.is_empty() && (commands.work.is_none() || commands.evaluate.is_none()) {
            return Err(PlatformError::configuration(
                "command agent needs [agent.command].work and .evaluate",
            ));
        }
        Ok(())
    }

    fn validate_tasks(&self) -> PlatformResult<()> {
        let mut seen = HashSet::new();
        for task in &self.tasks {
            if task.id.trim().is_empty() {
                return Err(PlatformError::configuration("task id must not be empty"));
            }
            if !seen.insert(task.id.as_str()) {
                return Err(PlatformError::configuration(format!(
                    "duplicate task id '{}'",
                    task.id
                )));
            }
            let strategy = self.strategy_for(task);
            if !self.sandbox.strategies.contains_key(strategy) {
                return Err(PlatformError::configuration(format!(
                    "task '{}': unknown sandbox strategy '{strategy}'",
                    task.id
                )));
            }
            if !task.working.enabled || !task.evaluating.enabled {
                return Err(PlatformError::configuration(format!(
                    "task '{}': only the planning phase may be disabled",
                    task.id
                )));
            }
            for (phase, config) in [
                ("planning", &task.planning),
                ("working", &task.working),
                ("evaluating", &task.evaluating),
            ] {
                if config.max_attempts == 0 {
                    return Err(PlatformError::configuration(format!(
                        "task '{}': {phase}.max_attempts must be at least 1",
                        task.id
                    )));
                }
                if config.timeout_secs == 0 || config.timeout_secs > MAX_TIMEOUT_SECS {
                    return Err(PlatformError::configuration(format!(
                        "task '{}': {phase}.timeout_secs must be within 1..={MAX_TIMEOUT_SECS}",
                        task.id
                    )));
                }
                if let Some(pool) = config.pools.iter().find(|p| !self.pools.contains_key(*p)) {
                    return Err(PlatformError::configuration(format!(
                        "task '{}': {phase} references unknown pool '{pool}'",
                        task.id
                    )));
                }
            }
            if task.acquire_timeout_secs > MAX_TIMEOUT_SECS {
                return Err(PlatformError::configuration(format!(
                    "task '{}': acquire_timeout_secs must be at most {MAX_TIMEOUT_SECS}",
                    task.id
                )));
            }
            if let Some(score) = task.quality_gate.min_score {
                if !(0.0..=1.0).contains(&score) {
                    return Err(PlatformError::configuration(format!(
                        "task '{}': quality_gate.min_score must be within 0..=1",
                        task.id
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Replace `${VAR}` with the variable's value; unknown variables stay verbatim
pub fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(value) if !name.is_empty() => out.push_str(&value),
                    _ => out.push_str(&rest[start..start + 2 + end + 1]),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
