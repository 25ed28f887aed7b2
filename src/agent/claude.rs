//! Claude Code agent
//!
//! Invokes the Claude CLI in print mode inside the sandbox:
//! ```bash
//! claude -p --dangerously-skip-permissions --model opus --output-format json
//! ```
//!
//! The prompt is piped via stdin. The JSON reply carries turn count,
//! cost and token usage.
//!
//! See: https://docs.anthropic.com/en/docs/claude-code

use async_trait::async_trait;
use tracing::debug;

use super::{prompt, run_cli, Agent, Evaluation, PhaseContext, PhaseOutcome};
use crate::config::{ClaudeConfig, PhaseConfig};
use crate::error::PlatformResult;
use crate::sandbox::SandboxCommand;

const INSTALL_HINT: &str = "Install Claude Code CLI with `npm install -g @anthropic-ai/claude-code` \
     or set [agent.claude].path in phaserun.toml";

/// Claude Code CLI agent
pub struct ClaudeAgent {
    config: ClaudeConfig,
}

impl ClaudeAgent {
    pub fn new(config: ClaudeConfig) -> Self {
        Self { config }
    }

    /// claude -p [--dangerously-skip-permissions] [--model m] [--max-turns n] --output-format f
    fn command_line(&self, max_turns: Option<u32>) -> String {
        let mut args = vec![self.config.path.clone(), "-p".to_string()];

        // Required for autonomous operation
        if self.config.skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        }

        if let Some(ref model) = self.config.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        if let Some(turns) = max_turns {
            args.push("--max-turns".to_string());
            args.push(turns.to_string());
        }

        args.push("--output-format".to_string());
        args.push(self.config.output_format.clone());

        if self.config.verbose {
            args.push("--verbose".to_string());
        }

        shell_words::join(args)
    }

    async fn invoke(&self, ctx: &PhaseContext, config: &PhaseConfig) -> PlatformResult<PhaseOutcome> {
        let line = self.command_line(config.max_turns);
        debug!("Claude command: {}", line);
        let command = SandboxCommand::shell(line)
            .with_stdin(prompt::render(ctx))
            .with_env(ctx.env());
        run_cli(ctx, "Claude", &self.config.path, INSTALL_HINT, command).await
    }
}

#[async_trait]
impl Agent for ClaudeAgent {
    fn name(&self) -> &str {
        "claude"
    }

    async fn plan(&self, ctx: &PhaseContext, config: &PhaseConfig) -> PlatformResult<PhaseOutcome> {
        self.invoke(ctx, config).await
    }

    async fn work(&self, ctx: &PhaseContext, config: &PhaseConfig) -> PlatformResult<PhaseOutcome> {
        self.invoke(ctx, config).await
    }

    async fn evaluate(&self, ctx: &PhaseContext, config: &PhaseConfig) -> PlatformResult<Evaluation> {
        let outcome = self.invoke(ctx, config).await?;
        Ok(super::evaluation_from_text(outcome))
    }
}
