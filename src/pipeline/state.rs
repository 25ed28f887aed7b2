//! Task states, phases and the transitions between them.

use serde::{Deserialize, Serialize};

use crate::error::{PlatformError, PlatformResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Planning,
    Working,
    Evaluating,
    Failed,
    Completed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Completed)
    }

    /// The phase executed while in this state.
    pub fn phase(self) -> Option<PhaseName> {
        match self {
            Self::Planning => Some(PhaseName::Planning),
            Self::Working => Some(PhaseName::Working),
            Self::Evaluating => Some(PhaseName::Evaluating),
            _ => None,
        }
    }

    /// Checks `self -> to` against the pipeline state machine.
    ///
    /// Any non-terminal state may fail. Evaluating loops back to planning
    /// or working on a retry.
    pub fn transition(self, to: TaskState) -> PlatformResult<TaskState> {
        use TaskState::{Completed, Evaluating, Failed, Pending, Planning, Working};
        let allowed = match (self, to) {
            (from, _) if from.is_terminal() => false,
            (_, Failed)
            | (Pending, Planning | Working)
            | (Planning, Working)
            | (Working, Evaluating)
            | (Evaluating, Completed | Planning | Working) => true,
            _ => false,
        };
        if allowed {
            Ok(to)
        } else {
            Err(PlatformError::invalid_transition(self, to))
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Planning => "PLANNING",
            Self::Working => "WORKING",
            Self::Evaluating => "EVALUATING",
            Self::Failed => "FAILED",
            Self::Completed => "COMPLETED",
        };
        f.write_str(name)
    }
}

/// One stage of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseName {
    Planning,
    Working,
    Evaluating,
}

impl PhaseName {
    pub fn state(self) -> TaskState {
        match self {
            Self::Planning => TaskState::Planning,
            Self::Working => TaskState::Working,
            Self::Evaluating => TaskState::Evaluating,
        }
    }

    /// Classification recorded when this phase exhausts its attempts.
    pub fn failure(self) -> FailureClass {
        match self {
            Self::Planning => FailureClass::PlanningFailed,
            Self::Working => FailureClass::WorkingFailed,
            Self::Evaluating => FailureClass::EvaluationFailed,
        }
    }
}

impl std::fmt::Display for PhaseName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Planning => write!(f, "planning"),
            Self::Working => write!(f, "working"),
            Self::Evaluating => write!(f, "evaluating"),
        }
    }
}

/// Why a task ended `FAILED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureClass {
    PlanningFailed,
    WorkingFailed,
    EvaluationFailed,
    Cancelled,
    ConfigurationError,
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::PlanningFailed => "PLANNING_FAILED",
            Self::WorkingFailed => "WORKING_FAILED",
            Self::EvaluationFailed => "EVALUATION_FAILED",
            Self::Cancelled => "CANCELLED",
            Self::ConfigurationError => "CONFIGURATION_ERROR",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        use TaskState::*;
        assert!(Pending.transition(Planning).is_ok());
        assert!(Pending.transition(Working).is_ok());
        assert!(Planning.transition(Working).is_ok());
        assert!(Working.transition(Evaluating).is_ok());
        assert!(Evaluating.transition(Completed).is_ok());
    }

    #[test]
    fn test_retry_loops_back_from_evaluating_only() {
        use TaskState::*;
        assert!(Evaluating.transition(Planning).is_ok());
        assert!(Evaluating.transition(Working).is_ok());
        assert!(Working.transition(Planning).is_err());
        assert!(Planning.transition(Evaluating).is_err());
        assert!(Pending.transition(Completed).is_err());
    }

    #[test]
    fn test_terminal_states_are_final() {
        use TaskState::*;
        for to in [Pending, Planning, Working, Evaluating, Failed, Completed] {
            assert!(Completed.transition(to).is_err());
            assert!(Failed.transition(to).is_err());
        }
        assert!(Working.transition(Failed).is_ok());
        assert!(Pending.transition(Failed).is_ok());
    }

    #[test]
    fn test_names_serialize_as_documented() {
        assert_eq!(serde_json::to_value(TaskState::Evaluating).unwrap(), "EVALUATING");
        assert_eq!(serde_json::to_value(PhaseName::Working).unwrap(), "working");
        assert_eq!(
            serde_json::to_value(FailureClass::WorkingFailed).unwrap(),
            "WORKING_FAILED"
        );
        assert_eq!(PhaseName::Planning.failure(), FailureClass::PlanningFailed);
    }
}
