//! Parsing of structured reports embedded in agent output.

use std::collections::BTreeMap;

use serde::Deserialize;

use super::{PhaseOutcome, Verdict};

/// Optional last line of a phase command's stdout.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct AgentReport {
    pub turns: Option<u32>,
    pub cost_usd: Option<f64>,
    pub tokens_in: Option<u64>,
    pub tokens_out: Option<u64>,
    pub files_modified: Vec<String>,
    pub commands: Vec<String>,
    pub passed: Option<bool>,
    pub score: Option<f64>,
    pub checks: BTreeMap<String, bool>,
    pub summary: Option<String>,
}

impl AgentReport {
    pub fn apply(&self, outcome: &mut PhaseOutcome) {
        if let Some(turns) = self.turns {
            outcome.turns = turns;
        }
        if let Some(cost) = self.cost_usd {
            outcome.cost_usd = cost;
        }
        if let Some(tokens) = self.tokens_in {
            outcome.tokens_in = tokens;
        }
        if let Some(tokens) = self.tokens_out {
            outcome.tokens_out = tokens;
        }
        outcome.files_modified.extend(self.files_modified.iter().cloned());
        outcome.commands_run.extend(self.commands.iter().cloned());
    }
}

/// Splits a trailing JSON object line off `stdout`.
pub(crate) fn split_report(stdout: &str) -> (String, Option<AgentReport>) {
    let trimmed = stdout.trim_end();
    let (body, last) = match trimmed.rfind('\n') {
        Some(idx) => (&trimmed[..idx], &trimmed[idx + 1..]),
        None => ("", trimmed),
    };
    let last = last.trim();
    if last.starts_with('{') {
        if let Ok(report) = serde_json::from_str::<AgentReport>(last) {
            return (body.trim_end().to_string(), Some(report));
        }
    }
    (trimmed.to_string(), None)
}

/// Finds the last line of `text` that parses as a verdict.
pub(crate) fn find_verdict(text: &str) -> Option<Verdict> {
    text.lines()
        .rev()
        .map(|line| line.trim().trim_matches('`').trim())
        .filter(|line| line.starts_with('{') && line.contains("\"passed\""))
        .find_map(|line| serde_json::from_str::<Verdict>(line).ok())
}

/// `--output-format json` reply of the Claude and Cursor CLIs.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct CliReply {
    pub result: String,
    pub is_error: bool,
    pub num_turns: Option<u32>,
    pub total_cost_usd: Option<f64>,
    pub usage: Option<CliUsage>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct CliUsage {
    pub input_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub output_tokens: u64,
}

impl CliReply {
    /// Parses the JSON reply; plain text output becomes a one-turn reply.
    pub fn parse(stdout: &str) -> Self {
        let trimmed = stdout.trim();
        let json = trimmed
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| line.starts_with('{') && line.contains("\"result\""));
        match json.and_then(|line| serde_json::from_str::<CliReply>(line).ok()) {
            Some(reply) => reply,
            None => Self {
                result: trimmed.to_string(),
                num_turns: Some(1),
                ..Self::default()
            },
        }
    }

    pub fn outcome(&self) -> PhaseOutcome {
        let usage = self.usage.as_ref();
        PhaseOutcome {
            turns: self.num_turns.unwrap_or(1),
            cost_usd: self.total_cost_usd.unwrap_or(0.0),
            tokens_in: usage.map_or(0, |u| {
                u.input_tokens + u.cache_creation_input_tokens + u.cache_read_input_tokens
            }),
            tokens_out: usage.map_or(0, |u| u.output_tokens),
            output: self.result.clone(),
            ..PhaseOutcome::default()
        }
    }
}
