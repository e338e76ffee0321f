use thiserror::Error;

use crate::workflow::model::TaskStatus;
use crate::workflow::validator::ValidationError;

/// Unified error type for the taskloom engine
#[derive(Debug, Error)]
pub enum LoomError {
    /// Structural rejection at submit time; carries the full error list,
    /// never just the first problem found.
    #[error("Invalid workflow: {}", format_validation_errors(.0))]
    InvalidWorkflow(Vec<ValidationError>),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task already exists: {0}")]
    DuplicateTask(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// Deregistration refused: the agent still has in-flight work and
    /// `force` was not set.
    #[error("Agent {id} has {in_flight} in-flight task(s); use force to cancel them")]
    AgentBusy { id: String, in_flight: usize },

    #[error("Invalid status transition for task {task}: {from:?} -> {to:?}")]
    InvalidTransition {
        task: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Workflow definition error: {0}")]
    Definition(String),

    // Wrapped anyhow::Error from worker backends
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl LoomError {
    /// The validation errors behind an `InvalidWorkflow` rejection.
    pub fn validation_errors(&self) -> &[ValidationError] {
        match self {
            LoomError::InvalidWorkflow(errors) => errors,
            _ => &[],
        }
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, LoomError>;
