//! `phaserun run`: execute configured tasks concurrently.

use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;
use tracing::{error, warn};

use crate::config::Config;
use crate::error::PlatformResult;
use crate::pipeline::{CancelToken, PhaseName, TaskResult, TaskState};
use crate::platform::Platform;

/// Runs the selected tasks. Returns whether every task completed.
pub(crate) async fn run(config: Config, config_path: &Path, task_ids: &[String]) -> Result<bool> {
    let platform = Platform::init(config)
        .await
        .with_context(|| format!("Failed to initialize from {}", config_path.display()))?;

    let tasks = platform.select_tasks(task_ids)?;
    if tasks.is_empty() {
        println!(
            "\n{} No tasks configured in {}.",
            "ℹ".blue(),
            config_path.display()
        );
        platform.shutdown().await;
        return Ok(true);
    }

    let cancel = CancelToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted; cancelling in-flight tasks");
                eprintln!("\n{} Cancelling tasks...", "⚠".yellow());
                cancel.cancel();
            }
        })
    };

    println!(
        "\n{} Running {} task(s) with the {} agent\n",
        "▶".green().bold(),
        tasks.len(),
        platform.config().agent.kind.cyan()
    );
    let outcomes = platform.run_tasks(&tasks, &cancel).await;
    interrupt.abort();
    platform.shutdown().await;

    print!("{}", format_summary(&outcomes));
    Ok(outcomes
        .iter()
        .all(|o| o.as_ref().is_ok_and(TaskResult::succeeded)))
}

fn format_summary(outcomes: &[PlatformResult<TaskResult>]) -> String {
    let mut lines = vec![
        "━".repeat(60).dimmed().to_string(),
        "   Task summary".yellow().bold().to_string(),
        "━".repeat(60).dimmed().to_string(),
    ];

    for outcome in outcomes {
        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                error!("Task could not run: {}", e);
                lines.push(format!("  {} {}", "✗".red().bold(), e.to_string().red()));
                continue;
            }
        };

        let status = match result.status {
            TaskState::Completed => "COMPLETED".green().bold(),
            _ => "FAILED".red().bold(),
        };
        let class = result
            .classification
            .map(|c| format!(" ({c})"))
            .unwrap_or_default();
        lines.push(format!("  {} {}{}", result.task_id.cyan().bold(), status, class));

        let attempts: Vec<String> = [PhaseName::Planning, PhaseName::Working, PhaseName::Evaluating]
            .into_iter()
            .filter(|p| result.phases.contains_key(p))
            .map(|p| format!("{p} x{}", result.attempts(p)))
            .collect();
        lines.push(format!(
            "    phases: {}  retries: {}",
            attempts.join(", "),
            result.retry_count
        ));
        lines.push(format!(
            "    turns: {}  cost: ${:.4}  duration: {:.1}s",
            result.totals.turns,
            result.totals.cost_usd,
            result.totals.duration_ms as f64 / 1000.0
        ));
        if let Some(score) = result.verdict.as_ref().and_then(|v| v.score) {
            lines.push(format!("    score: {score:.2}"));
        }
        if !result.artifacts.is_empty() {
            lines.push(format!("    changed: {}", result.artifacts.join(", ")));
        }
        if !result.risk_labels.is_empty() {
            lines.push(format!("    risk: {}", result.risk_labels.join(", ").yellow()));
        }
        if result.partial {
            lines.push(format!("    {}", "partial: some phases completed".yellow()));
        }
        if let Some(reason) = &result.reason {
            lines.push(format!("    reason: {}", reason.dimmed()));
        }
    }

    lines.push("━".repeat(60).dimmed().to_string());
    lines.push(String::new());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PlatformError;
    use crate::pipeline::{FailureClass, PhaseMetrics, Totals};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn result(id: &str, status: TaskState) -> TaskResult {
        TaskResult {
            task_id: id.to_string(),
            status,
            classification: None,
            reason: None,
            partial: false,
            risk_labels: Vec::new(),
            phases: BTreeMap::from([(
                PhaseName::Working,
                PhaseMetrics {
                    attempts: 2,
                    ..PhaseMetrics::default()
                },
            )]),
            totals: Totals {
                turns: 4,
                cost_usd: 0.25,
                duration_ms: 1500,
                ..Totals::default()
            },
            retry_count: 1,
            history: Vec::new(),
            verdict: None,
            artifacts: vec!["src/main.rs".to_string()],
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_summary_reports_each_task() {
        colored::control::set_override(false);
        let mut failed = result("lint", TaskState::Failed);
        failed.classification = Some(FailureClass::WorkingFailed);
        failed.reason = Some("exit code 2".to_string());
        failed.risk_labels = vec!["rollback_unavailable".to_string()];
        failed.partial = true;

        let text = format_summary(&[
            Ok(result("build", TaskState::Completed)),
            Ok(failed),
            Err(PlatformError::AlreadyRunning {
                task_id: "dup".to_string(),
            }),
        ]);

        assert!(text.contains("build COMPLETED"));
        assert!(text.contains("working x2"));
        assert!(text.contains("cost: $0.2500"));
        assert!(text.contains("duration: 1.5s"));
        assert!(text.contains("changed: src/main.rs"));
        assert!(text.contains("lint FAILED (WORKING_FAILED)"));
        assert!(text.contains("risk: rollback_unavailable"));
        assert!(text.contains("reason: exit code 2"));
        assert!(text.contains("dup"));
    }
}
