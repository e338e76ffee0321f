use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};

use crate::core::errors::{LoomError, Result};
use crate::engine::backend::{SchedulerEvent, SchedulerHandle, WorkerBackend};
use crate::engine::metrics::{MetricsAggregator, Outcome};
use crate::engine::registry::{Agent, AgentRegistry};
use crate::engine::scorer::{self, LoadSnapshot};
use crate::workflow::layout::{auto_layout, Position};
use crate::workflow::model::{
    AgentId, Priority, Task, TaskId, TaskKind, TaskStatus, Workflow, WorkflowId,
};
use crate::workflow::validator;

/// Book-keeping for one ingested task.
struct TaskEntry {
    task: Task,
    workflow_id: WorkflowId,
    /// Tie-break within a priority class: earliest submitted first.
    submit_seq: u64,
    started_at: Option<Instant>,
}

struct WorkflowMeta {
    name: String,
    task_ids: Vec<TaskId>,
}

/// All mutable scheduling state. Lives behind one mutex so every status
/// transition and assignment decision is serialized; two dispatch passes
/// can never double-assign a task or blow past an agent's capacity.
#[derive(Default)]
struct SchedulerState {
    tasks: HashMap<TaskId, TaskEntry>,
    /// Derived forward index: dependency -> dependents.
    dependents: HashMap<TaskId, Vec<TaskId>>,
    /// Tasks currently running, keyed to their assigned agent. The load
    /// snapshot is always recomputed from this map, never cached.
    in_flight: HashMap<TaskId, AgentId>,
    workflows: HashMap<WorkflowId, WorkflowMeta>,
    next_seq: u64,
}

impl SchedulerState {
    fn load_snapshot(&self) -> LoadSnapshot {
        let mut load = LoadSnapshot::new();
        for agent_id in self.in_flight.values() {
            *load.entry(agent_id.clone()).or_insert(0) += 1;
        }
        load
    }

    /// Structural view of a workflow, rebuilt for re-validation and layout.
    fn workflow_view(&self, workflow_id: &str) -> Option<Workflow> {
        let meta = self.workflows.get(workflow_id)?;
        let tasks = meta
            .task_ids
            .iter()
            .filter_map(|id| self.tasks.get(id).map(|e| e.task.clone()))
            .collect();
        Some(Workflow::from_tasks(workflow_id, meta.name.clone(), tasks))
    }
}

/// Read model for the presentation layer.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    pub id: TaskId,
    pub kind: TaskKind,
    pub priority: Priority,
    pub status: TaskStatus,
    pub assigned_agent: Option<AgentId>,
    pub dependencies: Vec<TaskId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSnapshot {
    pub id: WorkflowId,
    pub name: String,
    pub tasks: Vec<TaskView>,
}

/// The single dispatch authority. Owns every task status transition and
/// the in-flight map; agent records live in the registry and performance
/// records in the metrics aggregator, each owned by exactly one writer.
pub struct Scheduler {
    state: Mutex<SchedulerState>,
    registry: AgentRegistry,
    metrics: Arc<MetricsAggregator>,
    backend: Arc<dyn WorkerBackend>,
    events_tx: mpsc::UnboundedSender<SchedulerEvent>,
    inbox: Mutex<Option<(mpsc::UnboundedReceiver<SchedulerEvent>, oneshot::Receiver<()>)>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl Scheduler {
    pub fn new(
        registry: AgentRegistry,
        metrics: Arc<MetricsAggregator>,
        backend: Arc<dyn WorkerBackend>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        Arc::new(Self {
            state: Mutex::new(SchedulerState::default()),
            registry,
            metrics,
            backend,
            events_tx,
            inbox: Mutex::new(Some((events_rx, shutdown_rx))),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
        })
    }

    /// Reporting surface for worker backends. Clonable; every clone feeds
    /// the same single-consumer event loop.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle::new(self.events_tx.clone())
    }

    /// Drain worker callbacks into state transitions, one at a time, until
    /// `shutdown` is called. This is the only consumer of the event
    /// channel; however many workers report concurrently, transitions stay
    /// serialized.
    pub async fn run(self: Arc<Self>) {
        let Some((mut events_rx, mut shutdown_rx)) = self.inbox.lock().await.take() else {
            warn!("Scheduler event loop is already running");
            return;
        };
        info!("Scheduler event loop started");
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Scheduler event loop stopped");
                    break;
                }
                event = events_rx.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        SchedulerEvent::TaskCompleted { task_id, result } => {
                            self.report_completion(&task_id, result).await;
                        }
                        SchedulerEvent::TaskFailed { task_id, error } => {
                            self.report_failure(&task_id, error).await;
                        }
                        SchedulerEvent::TaskCancelled { task_id } => {
                            // Ack from the backend; a no-op when the
                            // scheduler initiated the cancellation.
                            if let Err(e) = self.cancel(&task_id).await {
                                debug!("Cancellation ack for {}: {}", task_id, e);
                            }
                        }
                    }
                }
            }
        }
    }

    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(());
        }
    }

    /// Submit a workflow. Structural errors reject it outright with the
    /// full error list; nothing from a rejected workflow enters the
    /// scheduler. Accepted tasks start `Pending`, sources are promoted to
    /// `Ready` immediately, and a dispatch pass runs.
    pub async fn submit(&self, workflow: Workflow) -> Result<WorkflowId> {
        validator::validate(&workflow).map_err(LoomError::InvalidWorkflow)?;

        let mut state = self.state.lock().await;
        for task in workflow.tasks() {
            if state.tasks.contains_key(&task.id) {
                return Err(LoomError::DuplicateTask(task.id.clone()));
            }
        }

        let workflow_id = workflow.id.clone();
        info!(
            "Accepted workflow {} ({}) with {} task(s)",
            workflow_id,
            workflow.name,
            workflow.len()
        );
        let meta = WorkflowMeta {
            name: workflow.name.clone(),
            task_ids: workflow.tasks().iter().map(|t| t.id.clone()).collect(),
        };
        state.workflows.insert(workflow_id.clone(), meta);

        for mut task in workflow.into_tasks() {
            let submit_seq = state.next_seq;
            state.next_seq += 1;
            for dep in &task.dependencies {
                state
                    .dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(task.id.clone());
            }
            task.status = if task.is_source() {
                TaskStatus::Ready
            } else {
                TaskStatus::Pending
            };
            task.updated_at = Utc::now();
            state.tasks.insert(
                task.id.clone(),
                TaskEntry {
                    workflow_id: workflow_id.clone(),
                    submit_seq,
                    started_at: None,
                    task,
                },
            );
        }

        self.dispatch_locked(&mut state).await;
        Ok(workflow_id)
    }

    /// Add a task to a running workflow. The merged graph is re-validated
    /// before the task is accepted.
    pub async fn add_task(&self, workflow_id: &str, task: Task) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.tasks.contains_key(&task.id) {
            return Err(LoomError::DuplicateTask(task.id));
        }
        let mut view = state
            .workflow_view(workflow_id)
            .ok_or_else(|| LoomError::WorkflowNotFound(workflow_id.to_string()))?;
        view.add_task(task.clone());
        validator::validate(&view).map_err(LoomError::InvalidWorkflow)?;

        let submit_seq = state.next_seq;
        state.next_seq += 1;
        for dep in &task.dependencies {
            state
                .dependents
                .entry(dep.clone())
                .or_default()
                .push(task.id.clone());
        }

        // A dependency may already be terminal: completed dependencies
        // count toward readiness, failed or cancelled ones cascade.
        let mut doomed = false;
        let mut all_completed = true;
        for dep in &task.dependencies {
            match state.tasks.get(dep).map(|e| e.task.status) {
                Some(TaskStatus::Completed) => {}
                Some(TaskStatus::Failed) | Some(TaskStatus::Cancelled) => {
                    doomed = true;
                    all_completed = false;
                }
                _ => all_completed = false,
            }
        }

        let mut task = task;
        task.status = if doomed {
            warn!(
                "Task {} added with an already-failed dependency; cancelled on arrival",
                task.id
            );
            TaskStatus::Cancelled
        } else if all_completed {
            TaskStatus::Ready
        } else {
            TaskStatus::Pending
        };
        task.updated_at = Utc::now();

        info!("Added task {} to workflow {}", task.id, workflow_id);
        if let Some(meta) = state.workflows.get_mut(workflow_id) {
            meta.task_ids.push(task.id.clone());
        }
        state.tasks.insert(
            task.id.clone(),
            TaskEntry {
                workflow_id: workflow_id.to_string(),
                submit_seq,
                started_at: None,
                task,
            },
        );

        self.dispatch_locked(&mut state).await;
        Ok(())
    }

    /// A completed task unblocks dependents whose dependencies are now all
    /// complete, then a dispatch pass runs. Late reports for unknown or
    /// already-terminal tasks are dropped with a warning; a cancelled
    /// task's backend may legitimately still report after the cascade.
    pub async fn report_completion(&self, task_id: &TaskId, result: Value) {
        let mut state = self.state.lock().await;
        let Some(entry) = state.tasks.get_mut(task_id) else {
            warn!("Completion report for unknown task {}", task_id);
            return;
        };
        if entry.task.status != TaskStatus::Running {
            warn!(
                "Completion report for task {} in state {:?} ignored",
                task_id, entry.task.status
            );
            return;
        }

        entry.task.status = TaskStatus::Completed;
        entry.task.result = Some(result);
        entry.task.updated_at = Utc::now();
        let agent_id = entry.task.assigned_agent.clone();
        let duration_ms = entry
            .started_at
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);
        state.in_flight.remove(task_id);

        if let Some(agent_id) = &agent_id {
            self.metrics.record(agent_id, Outcome::Completed, duration_ms);
        }
        info!("Task {} completed in {}ms", task_id, duration_ms);

        self.promote_dependents_locked(&mut state, task_id);
        self.dispatch_locked(&mut state).await;
    }

    /// A failed task cascades cancellation to every transitive dependent,
    /// regardless of their current status; running dependents are signaled
    /// to the backend. Unrelated branches keep executing.
    pub async fn report_failure(&self, task_id: &TaskId, error: String) {
        let mut state = self.state.lock().await;
        let Some(entry) = state.tasks.get_mut(task_id) else {
            warn!("Failure report for unknown task {}", task_id);
            return;
        };
        if entry.task.status != TaskStatus::Running {
            warn!(
                "Failure report for task {} in state {:?} ignored",
                task_id, entry.task.status
            );
            return;
        }

        warn!("Task {} failed: {}", task_id, error);
        entry.task.status = TaskStatus::Failed;
        entry.task.error = Some(error);
        entry.task.updated_at = Utc::now();
        let agent_id = entry.task.assigned_agent.clone();
        let duration_ms = entry
            .started_at
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);
        state.in_flight.remove(task_id);

        if let Some(agent_id) = &agent_id {
            self.metrics.record(agent_id, Outcome::Failed, duration_ms);
        }

        let signals = self.cascade_from_dependents_locked(&mut state, task_id);
        self.signal_cancellations(signals);
        self.dispatch_locked(&mut state).await;
    }

    /// Cancel a task and cascade to its transitive dependents. Idempotent:
    /// cancelling an already-terminal task is a no-op, not an error. No
    /// failure metric is recorded on this path.
    pub async fn cancel(&self, task_id: &TaskId) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.tasks.contains_key(task_id) {
            return Err(LoomError::TaskNotFound(task_id.clone()));
        }
        let signals = self.cascade_cancel_locked(&mut state, std::slice::from_ref(task_id));
        self.signal_cancellations(signals);
        self.dispatch_locked(&mut state).await;
        Ok(())
    }

    /// Register (or replace) an agent and immediately re-run dispatch;
    /// new capacity may unblock ready tasks.
    pub async fn register_agent(&self, agent: Agent) {
        self.registry.register(agent).await;
        let mut state = self.state.lock().await;
        self.dispatch_locked(&mut state).await;
    }

    /// Deregistering an agent with in-flight work fails loudly unless
    /// `force` is set, in which case that work is cancelled (cascading).
    pub async fn deregister_agent(&self, agent_id: &AgentId, force: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        if !self.registry.contains(agent_id).await {
            return Err(LoomError::AgentNotFound(agent_id.clone()));
        }
        let assigned: Vec<TaskId> = state
            .in_flight
            .iter()
            .filter(|(_, a)| *a == agent_id)
            .map(|(t, _)| t.clone())
            .collect();
        if !assigned.is_empty() && !force {
            return Err(LoomError::AgentBusy {
                id: agent_id.clone(),
                in_flight: assigned.len(),
            });
        }
        let signals = self.cascade_cancel_locked(&mut state, &assigned);
        self.registry.remove(agent_id).await;
        info!("Deregistered agent {}", agent_id);
        self.signal_cancellations(signals);
        self.dispatch_locked(&mut state).await;
        Ok(())
    }

    // ---- read models -------------------------------------------------

    pub async fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.state
            .lock()
            .await
            .tasks
            .get(task_id)
            .map(|e| e.task.status)
    }

    pub async fn task(&self, task_id: &str) -> Option<Task> {
        self.state
            .lock()
            .await
            .tasks
            .get(task_id)
            .map(|e| e.task.clone())
    }

    pub async fn task_workflow(&self, task_id: &str) -> Option<WorkflowId> {
        self.state
            .lock()
            .await
            .tasks
            .get(task_id)
            .map(|e| e.workflow_id.clone())
    }

    pub async fn workflow_snapshot(&self, workflow_id: &str) -> Option<WorkflowSnapshot> {
        let state = self.state.lock().await;
        let meta = state.workflows.get(workflow_id)?;
        let tasks = meta
            .task_ids
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .map(|e| TaskView {
                id: e.task.id.clone(),
                kind: e.task.kind,
                priority: e.task.priority,
                status: e.task.status,
                assigned_agent: e.task.assigned_agent.clone(),
                dependencies: e.task.dependencies.clone(),
            })
            .collect();
        Some(WorkflowSnapshot {
            id: workflow_id.to_string(),
            name: meta.name.clone(),
            tasks,
        })
    }

    /// Advisory render positions for a workflow's tasks.
    pub async fn workflow_layout(&self, workflow_id: &str) -> Option<HashMap<TaskId, Position>> {
        let view = self.state.lock().await.workflow_view(workflow_id)?;
        Some(auto_layout(&view))
    }

    pub async fn workflow_finished(&self, workflow_id: &str) -> bool {
        let state = self.state.lock().await;
        let Some(meta) = state.workflows.get(workflow_id) else {
            return false;
        };
        meta.task_ids.iter().all(|id| {
            state
                .tasks
                .get(id)
                .is_some_and(|e| e.task.status.is_terminal())
        })
    }

    /// Current running count per registered agent (zero included).
    pub async fn agent_loads(&self) -> LoadSnapshot {
        let mut load: LoadSnapshot = self
            .registry
            .list()
            .await
            .into_iter()
            .map(|a| (a.id, 0))
            .collect();
        let state = self.state.lock().await;
        for agent_id in state.in_flight.values() {
            *load.entry(agent_id.clone()).or_insert(0) += 1;
        }
        load
    }

    pub fn performance_scores(&self) -> HashMap<AgentId, f64> {
        self.metrics.scores()
    }

    pub async fn agents(&self) -> Vec<Agent> {
        self.registry.list().await
    }

    // ---- internals ---------------------------------------------------

    /// One dispatch pass: offer every ready task, critical first and
    /// earliest-submitted within a class, to the scorer under a fresh load
    /// snapshot. Unassignable tasks stay ready; that is backpressure, not
    /// an error, and the pass never waits for capacity. Backend starts are
    /// spawned so the state lock is not held across backend calls.
    async fn dispatch_locked(&self, state: &mut SchedulerState) {
        let agents = self.registry.list().await;
        if agents.is_empty() {
            debug!("Dispatch pass with no registered agents");
            return;
        }

        let mut ready: Vec<(Priority, u64, TaskId)> = state
            .tasks
            .values()
            .filter(|e| e.task.status == TaskStatus::Ready)
            .map(|e| (e.task.priority, e.submit_seq, e.task.id.clone()))
            .collect();
        ready.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut load = state.load_snapshot();
        let mut starts: Vec<(AgentId, Task)> = Vec::new();
        for (_, _, task_id) in ready {
            let Some(entry) = state.tasks.get_mut(&task_id) else {
                continue;
            };
            let chosen = scorer::find_best_agent(&entry.task, &agents, &load)
                .map(|agent| agent.id.clone());
            match chosen {
                Some(agent_id) => {
                    entry.task.status = TaskStatus::Running;
                    entry.task.assigned_agent = Some(agent_id.clone());
                    entry.task.updated_at = Utc::now();
                    entry.started_at = Some(Instant::now());
                    state.in_flight.insert(task_id.clone(), agent_id.clone());
                    *load.entry(agent_id.clone()).or_insert(0) += 1;
                    info!("Dispatched task {} to agent {}", task_id, agent_id);
                    starts.push((agent_id, entry.task.clone()));
                }
                None => {
                    debug!("No eligible agent for task {}; staying ready", task_id);
                }
            }
        }

        for (agent_id, task) in starts {
            let backend = Arc::clone(&self.backend);
            let handle = self.handle();
            tokio::spawn(async move {
                let task_id = task.id.clone();
                if let Err(e) = backend.start_task(&agent_id, &task, handle.clone()).await {
                    error!("Backend refused task {} on {}: {:#}", task_id, agent_id, e);
                    handle.task_failed(task_id, format!("backend start failed: {e}"));
                }
            });
        }
    }

    fn promote_dependents_locked(&self, state: &mut SchedulerState, completed: &TaskId) {
        let dependents = state.dependents.get(completed).cloned().unwrap_or_default();
        for dep_id in dependents {
            let now_ready = {
                let Some(entry) = state.tasks.get(&dep_id) else {
                    continue;
                };
                entry.task.status == TaskStatus::Pending
                    && entry.task.dependencies.iter().all(|d| {
                        state
                            .tasks
                            .get(d)
                            .is_some_and(|e| e.task.status == TaskStatus::Completed)
                    })
            };
            if now_ready {
                if let Some(entry) = state.tasks.get_mut(&dep_id) {
                    entry.task.status = TaskStatus::Ready;
                    entry.task.updated_at = Utc::now();
                    debug!("Task {} is ready; all dependencies completed", dep_id);
                }
            }
        }
    }

    /// Cascade starting from the dependents of `root` (used when `root`
    /// itself just failed and is already terminal).
    fn cascade_from_dependents_locked(
        &self,
        state: &mut SchedulerState,
        root: &TaskId,
    ) -> Vec<(AgentId, TaskId)> {
        let roots = state.dependents.get(root).cloned().unwrap_or_default();
        self.cascade_cancel_locked(state, &roots)
    }

    /// Depth-first cascade cancellation. Terminal tasks are skipped and
    /// not traversed through, which makes the cascade idempotent. Returns
    /// the running tasks whose backends must be told to stop; the
    /// scheduler itself does not know how to halt in-progress work.
    fn cascade_cancel_locked(
        &self,
        state: &mut SchedulerState,
        roots: &[TaskId],
    ) -> Vec<(AgentId, TaskId)> {
        let mut to_signal = Vec::new();
        let mut stack: Vec<TaskId> = roots.to_vec();
        let mut seen: HashSet<TaskId> = HashSet::new();

        while let Some(task_id) = stack.pop() {
            if !seen.insert(task_id.clone()) {
                continue;
            }
            let was_running = {
                let Some(entry) = state.tasks.get_mut(&task_id) else {
                    continue;
                };
                if entry.task.status.is_terminal() {
                    continue;
                }
                let was_running = entry.task.status == TaskStatus::Running;
                entry.task.status = TaskStatus::Cancelled;
                entry.task.updated_at = Utc::now();
                info!("Task {} cancelled", task_id);
                was_running
            };
            if was_running {
                if let Some(agent_id) = state.in_flight.remove(&task_id) {
                    to_signal.push((agent_id, task_id.clone()));
                }
            }
            if let Some(dependents) = state.dependents.get(&task_id) {
                stack.extend(dependents.iter().cloned());
            }
        }
        to_signal
    }

    fn signal_cancellations(&self, signals: Vec<(AgentId, TaskId)>) {
        for (agent_id, task_id) in signals {
            let backend = Arc::clone(&self.backend);
            tokio::spawn(async move {
                backend.cancel_task(&agent_id, &task_id).await;
            });
        }
    }
}
