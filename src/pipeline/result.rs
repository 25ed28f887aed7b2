//! Per-phase metrics and the terminal task artifact.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::{FailureClass, PhaseName, TaskState};
use crate::agent::{PhaseOutcome, Verdict};

/// Metrics accumulated over every attempt of one phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseMetrics {
    pub attempts: u32,
    pub turns: u32,
    pub cost_usd: f64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub files_modified: usize,
    pub commands_run: usize,
    pub duration_ms: u64,
}

impl PhaseMetrics {
    /// Adds what one attempt reported.
    pub fn record(&mut self, outcome: &PhaseOutcome) {
        self.turns += outcome.turns;
        self.cost_usd += outcome.cost_usd;
        self.tokens_in += outcome.tokens_in;
        self.tokens_out += outcome.tokens_out;
        self.files_modified += outcome.files_modified.len();
        self.commands_run += outcome.commands_run.len();
    }
}

/// Sums over every phase of a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    pub turns: u32,
    pub cost_usd: f64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub files_modified: usize,
    pub commands_run: usize,
    pub duration_ms: u64,
}

impl Totals {
    pub fn from_phases(phases: &BTreeMap<PhaseName, PhaseMetrics>, duration_ms: u64) -> Self {
        phases.values().fold(
            Self {
                duration_ms,
                ..Self::default()
            },
            |mut totals, m| {
                totals.turns += m.turns;
                totals.cost_usd += m.cost_usd;
                totals.tokens_in += m.tokens_in;
                totals.tokens_out += m.tokens_out;
                totals.files_modified += m.files_modified;
                totals.commands_run += m.commands_run;
                totals
            },
        )
    }
}

/// A recorded state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: TaskState,
    pub to: TaskState,
    pub at: DateTime<Utc>,
}

/// The terminal, immutable outcome of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<FailureClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Failed after at least one phase completed.
    pub partial: bool,
    pub risk_labels: Vec<String>,
    pub phases: BTreeMap<PhaseName, PhaseMetrics>,
    pub totals: Totals,
    /// Evaluation retries consumed.
    pub retry_count: u32,
    pub history: Vec<Transition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    /// Files written by the work phase, relative to the workspace.
    pub artifacts: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn succeeded(&self) -> bool {
        self.status == TaskState::Completed
    }

    /// Attempts made by `phase`, zero if it never ran.
    pub fn attempts(&self, phase: PhaseName) -> u32 {
        self.phases.get(&phase).map_or(0, |m| m.attempts)
    }

    /// States visited, in order, starting with `PENDING`.
    pub fn visited(&self) -> Vec<TaskState> {
        std::iter::once(TaskState::Pending)
            .chain(self.history.iter().map(|t| t.to))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_accumulates_outcomes() {
        let mut metrics = PhaseMetrics::default();
        let outcome = PhaseOutcome {
            turns: 3,
            cost_usd: 0.25,
            tokens_in: 100,
            tokens_out: 40,
            files_modified: vec!["a.rs".to_string(), "b.rs".to_string()],
            commands_run: vec!["make".to_string()],
            output: String::new(),
        };
        metrics.record(&outcome);
        metrics.record(&outcome);
        assert_eq!(metrics.turns, 6);
        assert!((metrics.cost_usd - 0.5).abs() < f64::EPSILON);
        assert_eq!(metrics.files_modified, 4);
        assert_eq!(metrics.commands_run, 2);
    }

    #[test]
    fn test_totals_sum_phases() {
        let phases = BTreeMap::from([
            (
                PhaseName::Planning,
                PhaseMetrics {
                    turns: 1,
                    cost_usd: 0.1,
                    ..PhaseMetrics::default()
                },
            ),
            (
                PhaseName::Working,
                PhaseMetrics {
                    turns: 4,
                    commands_run: 2,
                    ..PhaseMetrics::default()
                },
            ),
        ]);
        let totals = Totals::from_phases(&phases, 900);
        assert_eq!(totals.turns, 5);
        assert_eq!(totals.commands_run, 2);
        assert_eq!(totals.duration_ms, 900);
    }
}
