pub mod backend;
pub mod metrics;
pub mod registry;
pub mod scheduler;
pub mod scorer;

// Re-export the key structs and functions
pub use backend::{LocalBackend, SchedulerEvent, SchedulerHandle, WorkerBackend};
pub use metrics::{MetricsAggregator, Outcome, PerformanceRecord};
pub use registry::{Agent, AgentRegistry};
pub use scheduler::{Scheduler, TaskView, WorkflowSnapshot};
pub use scorer::{find_best_agent, score, LoadSnapshot};
