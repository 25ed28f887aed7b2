//! Phase prompts for the CLI agents.

use super::PhaseContext;
use crate::pipeline::PhaseName;
use crate::templates::{PROMPT_EVALUATE, PROMPT_PLAN, PROMPT_WORK};

/// Renders the prompt template for the context's phase.
pub(crate) fn render(ctx: &PhaseContext) -> String {
    let template = match ctx.phase {
        PhaseName::Planning => PROMPT_PLAN,
        PhaseName::Working => PROMPT_WORK,
        PhaseName::Evaluating => PROMPT_EVALUATE,
    };
    let feedback = ctx
        .feedback
        .as_deref()
        .map(|f| format!("## Previous evaluation\n\nThe last attempt did not pass:\n\n{f}\n"))
        .unwrap_or_default();

    template
        .replace("{{task_id}}", &ctx.task_id)
        .replace("{{attempt}}", &ctx.attempt.to_string())
        .replace("{{goal}}", ctx.goal.trim())
        .replace("{{plan}}", ctx.plan.as_deref().unwrap_or("(no plan; work from the goal)"))
        .replace("{{work}}", ctx.work_output.as_deref().unwrap_or("(no summary)"))
        .replace("{{feedback}}", &feedback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::context;

    #[test]
    fn test_render_fills_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(PhaseName::Working, dir.path());
        ctx.feedback = Some("tests failed".to_string());
        let prompt = render(&ctx);
        assert!(prompt.contains("make it work"));
        assert!(prompt.contains("step one"));
        assert!(prompt.contains("tests failed"));
        assert!(!prompt.contains("{{"));
    }

    #[test]
    fn test_evaluate_prompt_asks_for_verdict() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(PhaseName::Evaluating, dir.path());
        let prompt = render(&ctx);
        assert!(prompt.contains("\"passed\""));
        assert!(prompt.contains("did step one"));
    }
}
