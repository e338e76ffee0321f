use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub type TaskId = String;
pub type AgentId = String;
pub type WorkflowId = String;

/// Closed set of task types. Capability matching goes through
/// `required_capability`, so adding a kind forces an explicit mapping
/// decision instead of a string silently falling through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    CodeGeneration,
    CodeReview,
    Testing,
    Documentation,
    Build,
    Deployment,
    Analysis,
    Coordination,
}

impl TaskKind {
    /// Capability an agent must declare to earn the match bonus for this
    /// kind. Kinds with no mapped capability get no bonus, not an error.
    pub fn required_capability(&self) -> Option<&'static str> {
        match self {
            TaskKind::CodeGeneration => Some("codegen"),
            TaskKind::CodeReview => Some("review"),
            TaskKind::Testing => Some("testing"),
            TaskKind::Documentation => Some("docs"),
            TaskKind::Build => Some("build"),
            TaskKind::Deployment => Some("deploy"),
            TaskKind::Analysis => Some("analysis"),
            TaskKind::Coordination => None,
        }
    }
}

/// Priority classes, ordered so `Critical > High > Medium > Low`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub priority: Priority,
    pub dependencies: Vec<TaskId>,
    pub status: TaskStatus,
    /// Set exactly once, when the task enters `Running`.
    pub assigned_agent: Option<AgentId>,
    /// Advisory duration hint for scheduling heuristics; never enforced.
    pub estimated_duration_ms: Option<u64>,
    pub input: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, kind: TaskKind) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            kind,
            priority: Priority::Medium,
            dependencies: Vec::new(),
            status: TaskStatus::Pending,
            assigned_agent: None,
            estimated_duration_ms: None,
            input: Value::Null,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependency(mut self, dep: impl Into<TaskId>) -> Self {
        self.dependencies.push(dep.into());
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_estimate_ms(mut self, ms: u64) -> Self {
        self.estimated_duration_ms = Some(ms);
        self
    }

    /// A source task declares no dependencies.
    pub fn is_source(&self) -> bool {
        self.dependencies.is_empty()
    }
}

/// A workflow is the set of tasks plus the dependency edges implied by
/// each task's dependency list. Edges are always derived from the lists,
/// never stored separately, so there is a single source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    tasks: Vec<Task>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            tasks: Vec::new(),
        }
    }

    pub fn from_tasks(id: impl Into<WorkflowId>, name: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tasks,
        }
    }

    pub fn with_task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn add_task(&mut self, task: Task) {
        self.tasks.push(task);
    }

    /// Tasks in submission order.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn into_tasks(self) -> Vec<Task> {
        self.tasks
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tasks.iter().any(|t| t.id == id)
    }

    /// Tasks with no dependencies, in submission order.
    pub fn source_ids(&self) -> impl Iterator<Item = &TaskId> {
        self.tasks.iter().filter(|t| t.is_source()).map(|t| &t.id)
    }

    /// Tasks whose dependency list names `id`, in submission order.
    pub fn dependents_of<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Task> {
        self.tasks
            .iter()
            .filter(move |t| t.dependencies.iter().any(|d| d == id))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
