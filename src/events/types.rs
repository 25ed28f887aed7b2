//! Event envelope and the typed payloads published by each component.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::pipeline::{PhaseMetrics, PhaseName, TaskState};
use crate::sandbox::SessionStatus;

/// An immutable, published event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Publish sequence number, assigned by the bus.
    pub seq: u64,
    /// Dotted type tag used for subscription matching.
    pub event_type: String,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
    /// Structured payload.
    pub payload: Value,
    /// Correlating task id, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Emitting component, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
}

impl Event {
    /// Creates an event with a raw JSON payload.
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            seq: 0,
            event_type: event_type.into(),
            timestamp: Utc::now(),
            payload,
            task_id: None,
            component: None,
        }
    }

    /// Creates an event from a typed payload.
    pub fn from_payload<P: EventPayload>(payload: &P) -> Self {
        let value = serde_json::to_value(payload)
            .unwrap_or_else(|e| json!({ "serialization_error": e.to_string() }));
        Self::new(payload.event_type(), value).with_component(payload.component())
    }

    /// Sets the correlating task id.
    #[must_use]
    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Sets the correlating task id if one is given.
    #[must_use]
    pub fn with_task_opt(self, task_id: Option<&str>) -> Self {
        match task_id {
            Some(task_id) => self.with_task(task_id),
            None => self,
        }
    }

    /// Sets the emitting component.
    #[must_use]
    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }
}

/// A typed payload that knows its event type tag.
pub trait EventPayload: Serialize {
    /// The dotted type tag.
    fn event_type(&self) -> &'static str;

    /// The component that emits this payload.
    fn component(&self) -> &'static str;
}

/// What happened inside a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolAction {
    Acquire,
    Release,
    /// A release by someone other than the instance's owner.
    ReleaseRejected,
    ValidationFailed,
    CreateFailed,
    Timeout,
    Cleanup,
    Shutdown,
}

/// Pool bookkeeping change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyPoolEvent {
    pub action: PoolAction,
    pub pool: String,
    pub resource_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<u64>,
    pub in_use: usize,
    pub available: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl EventPayload for DependencyPoolEvent {
    fn event_type(&self) -> &'static str {
        "dependency.pool"
    }

    fn component(&self) -> &'static str {
        "dependency_pool"
    }
}

/// Sandbox run start or termination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxExecutionEvent {
    pub session_id: String,
    pub owner: String,
    pub strategy: String,
    /// `start` or `finish`.
    pub phase: String,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<SessionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_cpu_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_memory_mb: Option<f64>,
    #[serde(default)]
    pub cancelled: bool,
}

impl EventPayload for SandboxExecutionEvent {
    fn event_type(&self) -> &'static str {
        "sandbox.exec"
    }

    fn component(&self) -> &'static str {
        "sandbox"
    }
}

/// A hard limit breach that terminated a sandbox run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxViolationEvent {
    pub session_id: String,
    pub owner: String,
    pub strategy: String,
    /// `cpu` or `memory`.
    pub limit: String,
    pub observed: f64,
    pub threshold: f64,
}

impl EventPayload for SandboxViolationEvent {
    fn event_type(&self) -> &'static str {
        "sandbox.violation"
    }

    fn component(&self) -> &'static str {
        "sandbox"
    }
}

/// One phase attempt starting or finishing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseEvent {
    pub phase: PhaseName,
    pub attempt: u32,
    /// `start`, `success` or `failure`.
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub metrics: PhaseMetrics,
}

impl EventPayload for PhaseEvent {
    fn event_type(&self) -> &'static str {
        "pipeline.phase"
    }

    fn component(&self) -> &'static str {
        "pipeline"
    }
}

/// A pipeline state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub from: TaskState,
    pub to: TaskState,
    pub retry_count: u32,
    pub turns: u32,
    pub cost_usd: f64,
    pub files_modified: usize,
    pub commands_run: usize,
}

impl EventPayload for StateSnapshot {
    fn event_type(&self) -> &'static str {
        "pipeline.state"
    }

    fn component(&self) -> &'static str {
        "pipeline"
    }
}

/// The terminal result of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResultEvent {
    pub status: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<String>,
    pub partial: bool,
    pub duration_ms: u64,
}

impl EventPayload for TaskResultEvent {
    fn event_type(&self) -> &'static str {
        "pipeline.result"
    }

    fn component(&self) -> &'static str {
        "pipeline"
    }
}

/// Aggregated model usage for one agent provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelUsageEvent {
    pub provider: String,
    pub requests_total: u64,
    pub tokens_in_total: u64,
    pub tokens_out_total: u64,
    pub cost_total_usd: f64,
}

impl EventPayload for ModelUsageEvent {
    fn event_type(&self) -> &'static str {
        "model.usage"
    }

    fn component(&self) -> &'static str {
        "usage_tracker"
    }
}

/// Platform lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SystemEvent {
    Init {
        agent: String,
        pools: Vec<String>,
        strategies: Vec<String>,
    },
    Shutdown {
        events_published: u64,
    },
}

impl EventPayload for SystemEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Init { .. } => "system.init",
            Self::Shutdown { .. } => "system.shutdown",
        }
    }

    fn component(&self) -> &'static str {
        "platform"
    }
}
