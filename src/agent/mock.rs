//! Scripted agent for pipeline tests.
//!
//! Each phase replays its own list of responses, cycling when invoked
//! more times than responses, and counts its invocations.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{Agent, Evaluation, PhaseContext, PhaseOutcome, Verdict};
use crate::config::PhaseConfig;
use crate::error::{PlatformError, PlatformResult};
use crate::pipeline::PhaseName;
use crate::sandbox::SandboxCommand;

/// A single mock response.
#[derive(Debug, Clone)]
pub(crate) enum MockResponse {
    /// One turn, no cost.
    Success,
    /// Return this outcome.
    Outcome(PhaseOutcome),
    /// Fail with an execution error.
    Error(String),
    /// Evaluate only: return this verdict.
    Verdict(Verdict),
    /// Run the script in the sandbox; a non-zero exit fails the attempt.
    Script(String),
    /// Sleep, then succeed.
    Delay(Duration),
}

#[derive(Debug, Default)]
struct Script {
    responses: Vec<MockResponse>,
    calls: AtomicUsize,
}

impl Script {
    fn next(&self) -> MockResponse {
        let count = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.responses.is_empty() {
            MockResponse::Success
        } else {
            self.responses[count % self.responses.len()].clone()
        }
    }
}

/// Returns configured responses per phase and tracks invocations.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockAgent {
    plan: Arc<Script>,
    work: Arc<Script>,
    evaluate: Arc<Script>,
}

impl MockAgent {
    /// Every phase succeeds and every evaluation passes.
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_plan(mut self, responses: Vec<MockResponse>) -> Self {
        self.plan = Arc::new(Script {
            responses,
            calls: AtomicUsize::new(0),
        });
        self
    }

    #[must_use]
    pub fn with_work(mut self, responses: Vec<MockResponse>) -> Self {
        self.work = Arc::new(Script {
            responses,
            calls: AtomicUsize::new(0),
        });
        self
    }

    #[must_use]
    pub fn with_evaluate(mut self, responses: Vec<MockResponse>) -> Self {
        self.evaluate = Arc::new(Script {
            responses,
            calls: AtomicUsize::new(0),
        });
        self
    }

    /// Number of times `phase` was invoked.
    pub fn calls(&self, phase: PhaseName) -> usize {
        let script = match phase {
            PhaseName::Planning => &self.plan,
            PhaseName::Working => &self.work,
            PhaseName::Evaluating => &self.evaluate,
        };
        script.calls.load(Ordering::SeqCst)
    }

    async fn respond(
        response: MockResponse,
        ctx: &PhaseContext,
    ) -> PlatformResult<(PhaseOutcome, Option<Verdict>)> {
        let one_turn = PhaseOutcome {
            turns: 1,
            output: format!("{} output", ctx.phase),
            ..PhaseOutcome::default()
        };
        match response {
            MockResponse::Success => Ok((one_turn, None)),
            MockResponse::Outcome(outcome) => Ok((outcome, None)),
            MockResponse::Error(msg) => Err(PlatformError::execution(msg)),
            MockResponse::Verdict(verdict) => Ok((one_turn, Some(verdict))),
            MockResponse::Script(script) => {
                let result = ctx.sandbox.run(SandboxCommand::shell(script.clone())).await?;
                super::require_success("mock script", &result)?;
                Ok((
                    PhaseOutcome {
                        commands_run: vec![script],
                        output: result.stdout,
                        ..one_turn
                    },
                    None,
                ))
            }
            MockResponse::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok((one_turn, None))
            }
        }
    }
}

#[async_trait]
impl Agent for MockAgent {
    fn name(&self) -> &str {
        "mock"
    }

    async fn plan(&self, ctx: &PhaseContext, _config: &PhaseConfig) -> PlatformResult<PhaseOutcome> {
        Self::respond(self.plan.next(), ctx).await.map(|(o, _)| o)
    }

    async fn work(&self, ctx: &PhaseContext, _config: &PhaseConfig) -> PlatformResult<PhaseOutcome> {
        Self::respond(self.work.next(), ctx).await.map(|(o, _)| o)
    }

    async fn evaluate(&self, ctx: &PhaseContext, _config: &PhaseConfig) -> PlatformResult<Evaluation> {
        let (outcome, verdict) = Self::respond(self.evaluate.next(), ctx).await?;
        Ok(Evaluation {
            outcome,
            verdict: verdict.unwrap_or(Verdict {
                passed: true,
                ..Verdict::default()
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::context;

    #[tokio::test]
    async fn test_mock_cycles_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(PhaseName::Working, dir.path());
        let agent = MockAgent::new().with_work(vec![
            MockResponse::Error("boom".to_string()),
            MockResponse::Success,
        ]);
        let config = PhaseConfig::default();

        assert!(agent.work(&ctx, &config).await.is_err());
        assert!(agent.work(&ctx, &config).await.is_ok());
        assert!(agent.work(&ctx, &config).await.is_err());
        assert_eq!(agent.calls(PhaseName::Working), 3);
        assert_eq!(agent.calls(PhaseName::Planning), 0);
    }

    #[tokio::test]
    async fn test_mock_evaluate_defaults_to_pass() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(PhaseName::Evaluating, dir.path());
        let eval = MockAgent::new()
            .evaluate(&ctx, &PhaseConfig::default())
            .await
            .unwrap();
        assert!(eval.verdict.passed);
    }
}
