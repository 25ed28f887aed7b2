//! Embedded templates: the default configuration and agent prompts.

/// Default `phaserun.toml` written by `phaserun init`.
pub(crate) const PHASERUN_TOML: &str = include_str!("phaserun.toml");

/// Planning phase prompt.
pub(crate) const PROMPT_PLAN: &str = include_str!("prompt_plan.md");

/// Working phase prompt.
pub(crate) const PROMPT_WORK: &str = include_str!("prompt_work.md");

/// Evaluating phase prompt. Asks for a JSON verdict line.
pub(crate) const PROMPT_EVALUATE: &str = include_str!("prompt_evaluate.md");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::parse(PHASERUN_TOML).unwrap();
        config.validate().unwrap();
        assert_eq!(config.tasks.len(), 1);
        assert_eq!(config.tasks[0].id, "example");
        assert!(config.pools.contains_key("workspace"));
    }

    #[test]
    fn test_prompts_have_placeholders() {
        for prompt in [PROMPT_PLAN, PROMPT_WORK, PROMPT_EVALUATE] {
            assert!(prompt.contains("{{goal}}"));
            assert!(prompt.contains("{{task_id}}"));
        }
        assert!(PROMPT_EVALUATE.contains("\"passed\""));
    }
}
