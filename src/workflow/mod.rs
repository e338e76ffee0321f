pub mod definition;
pub mod layout;
pub mod model;
pub mod validator;

// Re-export the key types and entry points
pub use definition::{TaskDefinition, WorkflowDefinition};
pub use layout::{auto_layout, auto_layout_with, LayoutConfig, Position};
pub use model::{AgentId, Priority, Task, TaskId, TaskKind, TaskStatus, Workflow, WorkflowId};
pub use validator::{validate, ValidationError};
