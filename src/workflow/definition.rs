use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::errors::{LoomError, Result};

use super::model::{Priority, Task, TaskKind, Workflow};

/// Declarative workflow description, loadable from YAML or JSON. Task
/// kinds deserialize into the closed `TaskKind` enum, so an unknown kind
/// fails loading instead of slipping through as an unmatched string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub tasks: Vec<TaskDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: String,
    pub kind: TaskKind,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub estimated_duration_ms: Option<u64>,
}

impl WorkflowDefinition {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        serde_yaml::from_str(s).map_err(|e| LoomError::Definition(e.to_string()))
    }

    pub fn from_json_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| LoomError::Definition(e.to_string()))
    }

    pub fn load_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| LoomError::Definition(format!("failed to read definition file: {e}")))?;
        Self::from_yaml_str(&content)
    }

    /// Build the in-memory workflow; all tasks start `Pending`. Structural
    /// validation is the submit path's job, not the loader's.
    pub fn into_workflow(self) -> Workflow {
        let mut workflow = Workflow::new(self.name);
        for def in self.tasks {
            let mut task = Task::new(def.id, def.kind)
                .with_priority(def.priority)
                .with_dependencies(def.dependencies)
                .with_input(def.input);
            task.estimated_duration_ms = def.estimated_duration_ms;
            workflow.add_task(task);
        }
        workflow
    }
}
