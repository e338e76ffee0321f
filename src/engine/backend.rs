use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::workflow::model::{AgentId, Task, TaskId};

/// Worker callbacks delivered into the scheduler's single-writer loop.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    TaskCompleted { task_id: TaskId, result: Value },
    TaskFailed { task_id: TaskId, error: String },
    TaskCancelled { task_id: TaskId },
}

/// Clonable reporting surface handed to worker backends. However many
/// workers report concurrently, everything funnels through one channel
/// into the scheduler loop, so task state is never mutated concurrently.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedulerEvent>,
}

impl SchedulerHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        Self { tx }
    }

    pub fn task_completed(&self, task_id: impl Into<TaskId>, result: Value) {
        self.send(SchedulerEvent::TaskCompleted {
            task_id: task_id.into(),
            result,
        });
    }

    pub fn task_failed(&self, task_id: impl Into<TaskId>, error: impl Into<String>) {
        self.send(SchedulerEvent::TaskFailed {
            task_id: task_id.into(),
            error: error.into(),
        });
    }

    pub fn task_cancelled(&self, task_id: impl Into<TaskId>) {
        self.send(SchedulerEvent::TaskCancelled {
            task_id: task_id.into(),
        });
    }

    fn send(&self, event: SchedulerEvent) {
        if self.tx.send(event).is_err() {
            warn!("Scheduler event loop is gone; dropping worker report");
        }
    }
}

/// Capability contract for the external worker execution backend. The
/// engine only knows how to ask for a start or a cancellation; results
/// arrive asynchronously through the `SchedulerHandle`.
#[async_trait]
pub trait WorkerBackend: Send + Sync + 'static {
    /// Begin executing `task` on `agent_id`. Ack-or-error: an `Err` means
    /// the work never started; completion or failure of started work is
    /// reported later via the handle.
    async fn start_task(
        &self,
        agent_id: &AgentId,
        task: &Task,
        handle: SchedulerHandle,
    ) -> anyhow::Result<()>;

    /// Signal cancellation of in-progress work. The scheduler has already
    /// marked the task cancelled; the backend just has to stop the work.
    async fn cancel_task(&self, agent_id: &AgentId, task_id: &TaskId);
}

type TaskHandler =
    Arc<dyn Fn(AgentId, Task) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// In-process backend running each task as a spawned tokio task. Used by
/// the test suites and demos; a real deployment plugs in its own
/// `WorkerBackend`.
pub struct LocalBackend {
    handler: TaskHandler,
    running: Arc<DashMap<TaskId, tokio::task::JoinHandle<()>>>,
}

impl LocalBackend {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(AgentId, Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            handler: Arc::new(move |agent, task| {
                let fut: BoxFuture<'static, anyhow::Result<Value>> =
                    Box::pin(handler(agent, task));
                fut
            }),
            running: Arc::new(DashMap::new()),
        }
    }
}

#[async_trait]
impl WorkerBackend for LocalBackend {
    async fn start_task(
        &self,
        agent_id: &AgentId,
        task: &Task,
        handle: SchedulerHandle,
    ) -> anyhow::Result<()> {
        let task_id = task.id.clone();
        let fut = (self.handler)(agent_id.clone(), task.clone());
        let running = Arc::clone(&self.running);
        let id = task_id.clone();
        let join = tokio::spawn(async move {
            match fut.await {
                Ok(result) => handle.task_completed(id.clone(), result),
                Err(e) => handle.task_failed(id.clone(), e.to_string()),
            }
            running.remove(&id);
        });
        self.running.insert(task_id, join);
        Ok(())
    }

    async fn cancel_task(&self, _agent_id: &AgentId, task_id: &TaskId) {
        if let Some((_, join)) = self.running.remove(task_id) {
            join.abort();
        }
    }
}
