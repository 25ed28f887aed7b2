//! Command agent
//!
//! Runs one shell script per phase inside the sandbox:
//! ```toml
//! [agent.command]
//! plan = "./scripts/plan.sh"
//! work = "make fix"
//! evaluate = "cargo test"
//! ```
//!
//! The previous phase's output arrives on stdin and task metadata in
//! `PHASERUN_*` variables. A final stdout line holding a JSON object
//! reports turns, cost, tokens, modified files and, for evaluation, the
//! verdict fields. An evaluate script passes when it exits zero.

use async_trait::async_trait;
use tracing::{debug, info};

use super::report::{split_report, AgentReport};
use super::{require_success, Agent, Evaluation, PhaseContext, PhaseOutcome, Verdict};
use crate::config::{CommandAgentConfig, PhaseConfig};
use crate::error::{PlatformError, PlatformResult};
use crate::sandbox::{SandboxCommand, SandboxResult};

/// Shell commands as phase executors
pub struct CommandAgent {
    config: CommandAgentConfig,
}

impl CommandAgent {
    pub fn new(config: CommandAgentConfig) -> Self {
        Self { config }
    }

    async fn run_script(
        &self,
        ctx: &PhaseContext,
        script: Option<&String>,
    ) -> PlatformResult<(SandboxResult, String, Option<AgentReport>)> {
        let script = script.ok_or_else(|| {
            PlatformError::configuration(format!("[agent.command] has no {} command", ctx.phase))
        })?;
        info!(task_id = %ctx.task_id, phase = %ctx.phase, attempt = ctx.attempt, "Running phase command");

        let mut command = SandboxCommand::shell(script.clone()).with_env(ctx.env());
        if let Some(input) = ctx.previous_output() {
            command = command.with_stdin(input);
        }
        let result = ctx.sandbox.run(command).await?;
        let (body, report) = split_report(&result.stdout);
        debug!(
            exit_code = ?result.exit_code,
            output_bytes = body.len(),
            report = report.is_some(),
            "Phase command finished"
        );
        Ok((result, body, report))
    }

    fn outcome(script: &str, body: String, report: Option<&AgentReport>) -> PhaseOutcome {
        let mut outcome = PhaseOutcome {
            turns: 1,
            commands_run: vec![SandboxCommand::shell(script).summary()],
            output: body,
            ..PhaseOutcome::default()
        };
        if let Some(report) = report {
            report.apply(&mut outcome);
        }
        outcome
    }
}

#[async_trait]
impl Agent for CommandAgent {
    fn name(&self) -> &str {
        "command"
    }

    async fn plan(&self, ctx: &PhaseContext, _config: &PhaseConfig) -> PlatformResult<PhaseOutcome> {
        let (result, body, report) = self.run_script(ctx, self.config.plan.as_ref()).await?;
        require_success("plan command", &result)?;
        Ok(Self::outcome(
            self.config.plan.as_deref().unwrap_or_default(),
            body,
            report.as_ref(),
        ))
    }

    async fn work(&self, ctx: &PhaseContext, _config: &PhaseConfig) -> PlatformResult<PhaseOutcome> {
        let (result, body, report) = self.run_script(ctx, self.config.work.as_ref()).await?;
        require_success("work command", &result)?;
        Ok(Self::outcome(
            self.config.work.as_deref().unwrap_or_default(),
            body,
            report.as_ref(),
        ))
    }

    async fn evaluate(
        &self,
        ctx: &PhaseContext,
        _config: &PhaseConfig,
    ) -> PlatformResult<Evaluation> {
        let (result, body, report) = self.run_script(ctx, self.config.evaluate.as_ref()).await?;
        result.check()?;

        let exited_zero = result.exit_code == Some(0);
        let summary = report
            .as_ref()
            .and_then(|r| r.summary.clone())
            .or_else(|| {
                let stream = if exited_zero { &body } else { &result.stderr };
                stream.lines().rev().find(|l| !l.trim().is_empty()).map(str::to_string)
            });
        let verdict = Verdict {
            passed: exited_zero && report.as_ref().and_then(|r| r.passed).unwrap_or(true),
            score: report.as_ref().and_then(|r| r.score),
            checks: report.as_ref().map(|r| r.checks.clone()).unwrap_or_default(),
            summary,
        };
        Ok(Evaluation {
            outcome: Self::outcome(
                self.config.evaluate.as_deref().unwrap_or_default(),
                body,
                report.as_ref(),
            ),
            verdict,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::context;
    use crate::pipeline::PhaseName;

    fn agent(plan: &str, work: &str, evaluate: &str) -> CommandAgent {
        CommandAgent::new(CommandAgentConfig {
            plan: Some(plan.to_string()),
            work: Some(work.to_string()),
            evaluate: Some(evaluate.to_string()),
        })
    }

    #[tokio::test]
    async fn test_work_reads_plan_and_parses_report() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(PhaseName::Working, dir.path());
        let agent = agent(
            "true",
            "cat > plan.txt; echo working; echo '{\"turns\": 3, \"files_modified\": [\"plan.txt\"]}'",
            "true",
        );
        let outcome = agent.work(&ctx, &PhaseConfig::default()).await.unwrap();

        assert_eq!(std::fs::read_to_string(dir.path().join("plan.txt")).unwrap(), "step one");
        assert_eq!(outcome.output, "working");
        assert_eq!(outcome.turns, 3);
        assert_eq!(outcome.files_modified, vec!["plan.txt".to_string()]);
        assert_eq!(outcome.commands_run.len(), 1);
    }

    #[tokio::test]
    async fn test_failing_plan_is_execution_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(PhaseName::Planning, dir.path());
        let err = agent("echo no plan >&2; exit 1", "true", "true")
            .plan(&ctx, &PhaseConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Execution { .. }));
        assert!(err.to_string().contains("no plan"));
    }

    #[tokio::test]
    async fn test_evaluate_exit_code_is_verdict() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(PhaseName::Evaluating, dir.path());

        let pass = agent("true", "true", "echo all good")
            .evaluate(&ctx, &PhaseConfig::default())
            .await
            .unwrap();
        assert!(pass.verdict.passed);
        assert_eq!(pass.verdict.summary.as_deref(), Some("all good"));

        let fail = agent("true", "true", "echo '2 tests failed' >&2; exit 1")
            .evaluate(&ctx, &PhaseConfig::default())
            .await
            .unwrap();
        assert!(!fail.verdict.passed);
        assert_eq!(fail.verdict.summary.as_deref(), Some("2 tests failed"));
    }

    #[tokio::test]
    async fn test_evaluate_report_supplies_score_and_checks() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(PhaseName::Evaluating, dir.path());
        let eval = agent(
            "true",
            "true",
            "echo '{\"passed\": false, \"score\": 0.4, \"checks\": {\"lint\": false}}'",
        )
        .evaluate(&ctx, &PhaseConfig::default())
        .await
        .unwrap();
        assert!(!eval.verdict.passed);
        assert_eq!(eval.verdict.score, Some(0.4));
        assert_eq!(eval.verdict.checks.get("lint"), Some(&false));
    }

    #[tokio::test]
    async fn test_missing_command_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(PhaseName::Planning, dir.path());
        let err = CommandAgent::new(CommandAgentConfig::default())
            .plan(&ctx, &PhaseConfig::default())
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }
}
