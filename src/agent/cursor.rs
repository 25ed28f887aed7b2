//! Cursor agent
//!
//! Invokes the Cursor CLI agent in print mode inside the sandbox:
//! ```bash
//! agent -p "prompt" --output-format json
//! ```
//!
//! See: https://cursor.com/docs/cli/overview

use async_trait::async_trait;
use tracing::debug;

use super::{prompt, run_cli, Agent, Evaluation, PhaseContext, PhaseOutcome};
use crate::config::{CursorConfig, PhaseConfig};
use crate::error::PlatformResult;
use crate::sandbox::SandboxCommand;

const INSTALL_HINT: &str = "Install the Cursor CLI with `curl https://cursor.com/install -fsS | bash` \
     or set [agent.cursor].path in phaserun.toml (\"cursor-agent\" on NixOS)";

/// Cursor CLI agent
pub struct CursorAgent {
    config: CursorConfig,
}

impl CursorAgent {
    pub fn new(config: CursorConfig) -> Self {
        Self { config }
    }

    /// agent -p "prompt" [--model "model"] --output-format f
    fn command_line(&self, prompt: &str) -> String {
        let mut args = vec![self.config.path.clone(), "-p".to_string(), prompt.to_string()];

        if let Some(ref model) = self.config.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        args.push("--output-format".to_string());
        args.push(self.config.output_format.clone());

        shell_words::join(args)
    }

    async fn invoke(&self, ctx: &PhaseContext) -> PlatformResult<PhaseOutcome> {
        let line = self.command_line(&prompt::render(ctx));
        debug!("Cursor command: {} bytes", line.len());
        let command = SandboxCommand::shell(line).with_env(ctx.env());
        run_cli(ctx, "Cursor", &self.config.path, INSTALL_HINT, command).await
    }
}

#[async_trait]
impl Agent for CursorAgent {
    fn name(&self) -> &str {
        "cursor"
    }

    async fn plan(&self, ctx: &PhaseContext, _config: &PhaseConfig) -> PlatformResult<PhaseOutcome> {
        self.invoke(ctx).await
    }

    async fn work(&self, ctx: &PhaseContext, _config: &PhaseConfig) -> PlatformResult<PhaseOutcome> {
        self.invoke(ctx).await
    }

    async fn evaluate(&self, ctx: &PhaseContext, _config: &PhaseConfig) -> PlatformResult<Evaluation> {
        let outcome = self.invoke(ctx).await?;
        Ok(super::evaluation_from_text(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_agent_name() {
        let agent = CursorAgent::new(CursorConfig::default());
        assert_eq!(agent.name(), "cursor");
    }

    #[test]
    fn test_prompt_is_quoted() {
        let agent = CursorAgent::new(CursorConfig::default());
        let line = agent.command_line("fix the 'bug'");
        assert_eq!(shell_words::split(&line).unwrap()[2], "fix the 'bug'");
        assert!(line.ends_with("--output-format json"));
    }
}
