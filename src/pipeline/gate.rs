use crate::agent::Verdict;
use crate::config::QualityGate;

/// Checks a verdict against the gate. Returns every unmet condition.
pub fn check_gate(gate: &QualityGate, verdict: &Verdict, task_cost_usd: f64) -> Result<(), Vec<String>> {
    let mut unmet = Vec::new();

    if gate.require_pass && !verdict.passed {
        unmet.push(match verdict.summary.as_deref() {
            Some(summary) if !summary.is_empty() => format!("evaluation did not pass: {summary}"),
            _ => "evaluation did not pass".to_string(),
        });
    }

    if let Some(min) = gate.min_score {
        match verdict.score {
            Some(score) if score >= min => {}
            Some(score) => unmet.push(format!("score {score:.2} below minimum {min:.2}")),
            None => unmet.push(format!("no score reported (minimum {min:.2})")),
        }
    }

    for check in &gate.required_checks {
        match verdict.checks.get(check) {
            Some(true) => {}
            Some(false) => unmet.push(format!("check '{check}' failed")),
            None => unmet.push(format!("check '{check}' missing")),
        }
    }

    if let Some(max) = gate.max_cost_usd {
        if task_cost_usd > max {
            unmet.push(format!("cost ${task_cost_usd:.4} exceeds ${max:.4}"));
        }
    }

    if unmet.is_empty() {
        Ok(())
    } else {
        Err(unmet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn verdict(passed: bool, score: Option<f64>) -> Verdict {
        Verdict {
            passed,
            score,
            checks: BTreeMap::from([
                ("tests".to_string(), true),
                ("lint".to_string(), false),
            ]),
            summary: None,
        }
    }

    #[test]
    fn test_default_gate_requires_pass() {
        let gate = QualityGate::default();
        assert!(check_gate(&gate, &verdict(true, None), 0.0).is_ok());
        let unmet = check_gate(&gate, &verdict(false, None), 0.0).unwrap_err();
        assert_eq!(unmet, vec!["evaluation did not pass".to_string()]);
    }

    #[test]
    fn test_score_checks_and_cost() {
        let gate = QualityGate {
            require_pass: false,
            min_score: Some(0.8),
            required_checks: vec!["tests".to_string(), "lint".to_string(), "docs".to_string()],
            max_cost_usd: Some(1.0),
        };
        let unmet = check_gate(&gate, &verdict(false, Some(0.5)), 2.0).unwrap_err();
        assert_eq!(unmet.len(), 4);
        assert!(unmet[0].contains("score 0.50"));
        assert!(unmet.iter().any(|u| u == "check 'lint' failed"));
        assert!(unmet.iter().any(|u| u == "check 'docs' missing"));
        assert!(unmet.iter().any(|u| u.starts_with("cost")));
    }

    #[test]
    fn test_missing_score_fails_min_score() {
        let gate = QualityGate {
            min_score: Some(0.1),
            ..QualityGate::default()
        };
        assert!(check_gate(&gate, &verdict(true, None), 0.0).is_err());
        assert!(check_gate(&gate, &verdict(true, Some(0.1)), 0.0).is_ok());
    }
}
