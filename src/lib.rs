// Core infrastructure modules
pub mod core {
    pub mod errors;
}

// Two main concerns: the workflow graph and the scheduling engine
pub mod workflow; // graph model, validation, layout, definition loading
pub mod engine; // agent registry, scoring, dispatch, metrics

// Re-exports for convenience
pub use crate::core::errors::{LoomError, Result};
pub use engine::{
    find_best_agent, Agent, AgentRegistry, LoadSnapshot, LocalBackend, MetricsAggregator,
    Outcome, PerformanceRecord, Scheduler, SchedulerEvent, SchedulerHandle, WorkerBackend,
};
pub use workflow::{
    auto_layout, validate, LayoutConfig, Position, Priority, Task, TaskKind, TaskStatus,
    ValidationError, Workflow, WorkflowDefinition,
};

/// Install a global tracing subscriber honoring `RUST_LOG`.
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
