//! `phaserun check`: load, validate and summarize a configuration.

use std::path::Path;

use anyhow::Result;
use colored::Colorize;

use crate::config::Config;

pub(crate) fn run(config_path: &Path) -> Result<()> {
    let config = super::load_config(config_path)?;
    config.validate()?;
    print!("{}", summary(&config, config_path));
    Ok(())
}

fn summary(config: &Config, path: &Path) -> String {
    let mut lines = vec![
        String::new(),
        format!("{} {} is valid", "✓".green().bold(), path.display().to_string().cyan()),
        String::new(),
        format!("  Agent:      {}", config.agent.kind.cyan()),
        format!("  Default:    {}", config.sandbox.default_strategy.cyan()),
        "  Strategies:".to_string(),
    ];

    for (name, s) in &config.sandbox.strategies {
        let memory = s
            .memory_limit_mb
            .map_or_else(|| "unlimited".to_string(), |mb| format!("{mb} MB"));
        lines.push(format!(
            "    {:<14} {} x{}, cpu {}%, memory {}, network {}",
            name.cyan(),
            s.kind,
            s.max_concurrency,
            s.hard_cpu_limit_pct,
            memory,
            s.network.policy
        ));
    }

    lines.push("  Pools:".to_string());
    if config.pools.is_empty() {
        lines.push(format!("    {}", "none".dimmed()));
    }
    for (name, pool) in &config.pools {
        lines.push(format!(
            "    {:<14} {} (max {})",
            name.cyan(),
            pool.kind,
            pool.max_instances
        ));
    }

    lines.push("  Tasks:".to_string());
    if config.tasks.is_empty() {
        lines.push(format!("    {}", "none".dimmed()));
    }
    for task in &config.tasks {
        let phases: Vec<&str> = [
            ("plan", task.planning.enabled),
            ("work", true),
            ("evaluate", true),
        ]
        .into_iter()
        .filter_map(|(name, on)| on.then_some(name))
        .collect();
        lines.push(format!(
            "    {:<14} {} via {}, {} retries, on work failure: {}",
            task.id.cyan(),
            phases.join(" → "),
            config.strategy_for(task),
            task.max_retries,
            serde_json::to_value(task.on_work_failure)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default()
        ));
    }
    lines.push(String::new());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::PHASERUN_TOML;

    #[test]
    fn test_summary_lists_components() {
        colored::control::set_override(false);
        let config = Config::parse(PHASERUN_TOML).unwrap();
        let text = summary(&config, Path::new("phaserun.toml"));
        assert!(text.contains("phaserun.toml is valid"));
        assert!(text.contains("subprocess"));
        assert!(text.contains("workspace"));
        assert!(text.contains("example"));
        assert!(text.contains("plan → work → evaluate"));
        assert!(text.contains("on work failure: rollback"));
    }
}
