//! Fan-out event bus shared by the pool, the sandbox and the pipeline.
//!
//! Publishing is synchronous: every matching subscriber has seen the event
//! before `publish` returns, and subscribers see events in sequence order. A bounded ring buffer keeps
//! recent events for exporters and result sinks.

mod bus;
mod exporter;
mod types;

pub use bus::EventBus;
pub use exporter::{install_exporters, Exporters};
pub use types::{
    DependencyPoolEvent, Event, ModelUsageEvent, PhaseEvent, PoolAction,
    SandboxExecutionEvent, SandboxViolationEvent, StateSnapshot, SystemEvent, TaskResultEvent,
};
