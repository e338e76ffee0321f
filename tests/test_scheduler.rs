//! Scheduling behavior end to end: dependency ordering, capacity bounds,
//! failure cascades, cancellation idempotence and the read models.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::json;
use taskloom::{
    Agent, AgentRegistry, LocalBackend, LoomError, MetricsAggregator, Outcome, Priority,
    Scheduler, SchedulerHandle, Task, TaskKind, TaskStatus, Workflow, WorkerBackend,
};

/// Tracks momentary and peak concurrency across backend invocations.
#[derive(Default)]
struct Probe {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Probe {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

fn spawn_scheduler(backend: Arc<dyn WorkerBackend>) -> (Arc<Scheduler>, Arc<MetricsAggregator>) {
    let metrics = Arc::new(MetricsAggregator::new());
    let scheduler = Scheduler::new(AgentRegistry::new(), Arc::clone(&metrics), backend);
    tokio::spawn(Arc::clone(&scheduler).run());
    (scheduler, metrics)
}

/// Backend whose tasks never finish on their own; state transitions are
/// then driven entirely by explicit report calls or cancellation.
fn stalled_backend() -> Arc<LocalBackend> {
    Arc::new(LocalBackend::new(|_agent, _task| async {
        futures::future::pending::<()>().await;
        Ok(json!(null))
    }))
}

/// Backend that refuses every start; the scheduler has to turn the
/// refusal into a task failure on its own.
struct RefusingBackend;

#[async_trait]
impl WorkerBackend for RefusingBackend {
    async fn start_task(
        &self,
        _agent_id: &String,
        _task: &Task,
        _handle: SchedulerHandle,
    ) -> anyhow::Result<()> {
        Err(anyhow!("worker pool exhausted"))
    }

    async fn cancel_task(&self, _agent_id: &String, _task_id: &String) {}
}

async fn wait_finished(scheduler: &Scheduler, workflow_id: &str) {
    for _ in 0..300 {
        if scheduler.workflow_finished(workflow_id).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("workflow {workflow_id} did not finish in time");
}

async fn wait_for_status(scheduler: &Scheduler, task_id: &str, status: TaskStatus) {
    for _ in 0..300 {
        if scheduler.task_status(task_id).await == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {task_id} never reached {status:?}");
}

#[tokio::test]
async fn join_waits_for_both_dependencies_and_respects_capacity_one() {
    let probe = Arc::new(Probe::default());
    let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let (p, o) = (Arc::clone(&probe), Arc::clone(&order));
    let backend = Arc::new(LocalBackend::new(move |_agent, task: Task| {
        let (p, o) = (Arc::clone(&p), Arc::clone(&o));
        async move {
            p.enter();
            o.lock().unwrap().push(task.id.clone());
            tokio::time::sleep(Duration::from_millis(40)).await;
            p.exit();
            Ok(json!({ "task": task.id }))
        }
    }));
    let (scheduler, _) = spawn_scheduler(backend);
    scheduler
        .register_agent(Agent::new("solo", 1, 5).with_capability("analysis"))
        .await;

    let wf = Workflow::new("join")
        .with_task(Task::new("a", TaskKind::Analysis))
        .with_task(Task::new("b", TaskKind::Analysis))
        .with_task(Task::new("c", TaskKind::Analysis).with_dependencies(["a", "b"]));
    let wf_id = scheduler.submit(wf).await.unwrap();
    wait_finished(&scheduler, &wf_id).await;

    // Capacity 1: a and b never overlapped
    assert_eq!(probe.peak(), 1);
    for id in ["a", "b", "c"] {
        assert_eq!(scheduler.task_status(id).await, Some(TaskStatus::Completed));
    }
    // The join task only started once both of its dependencies finished
    let order = order.lock().unwrap();
    assert_eq!(order.last().map(String::as_str), Some("c"));
}

#[tokio::test]
async fn failure_cascades_to_all_dependents_before_they_run() {
    let started: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
    let s = Arc::clone(&started);
    let backend = Arc::new(LocalBackend::new(move |_agent, task: Task| {
        let s = Arc::clone(&s);
        async move {
            s.lock().unwrap().insert(task.id.clone());
            if task.id == "a" {
                Err(anyhow!("synthetic failure"))
            } else {
                Ok(json!(null))
            }
        }
    }));
    let (scheduler, _) = spawn_scheduler(backend);
    scheduler.register_agent(Agent::new("worker", 4, 5)).await;

    let wf = Workflow::new("cascade")
        .with_task(Task::new("a", TaskKind::Build))
        .with_task(Task::new("b", TaskKind::Testing).with_dependency("a"))
        .with_task(Task::new("c", TaskKind::Deployment).with_dependency("a"));
    let wf_id = scheduler.submit(wf).await.unwrap();
    wait_finished(&scheduler, &wf_id).await;

    assert_eq!(scheduler.task_status("a").await, Some(TaskStatus::Failed));
    assert_eq!(scheduler.task_status("b").await, Some(TaskStatus::Cancelled));
    assert_eq!(scheduler.task_status("c").await, Some(TaskStatus::Cancelled));
    // Neither dependent was ever handed to the backend
    assert_eq!(*started.lock().unwrap(), HashSet::from(["a".to_string()]));
}

#[tokio::test]
async fn refused_start_becomes_a_failure_and_cascades() {
    let (scheduler, metrics) = spawn_scheduler(Arc::new(RefusingBackend));
    scheduler.register_agent(Agent::new("worker", 2, 5)).await;

    let wf = Workflow::new("refused")
        .with_task(Task::new("a", TaskKind::Build))
        .with_task(Task::new("b", TaskKind::Testing).with_dependency("a"));
    let wf_id = scheduler.submit(wf).await.unwrap();
    wait_finished(&scheduler, &wf_id).await;

    let a = scheduler.task("a").await.unwrap();
    assert_eq!(a.status, TaskStatus::Failed);
    assert!(a.error.as_deref().unwrap_or("").contains("worker pool exhausted"));
    assert_eq!(scheduler.task_status("b").await, Some(TaskStatus::Cancelled));

    // The refusal counts against the assigned agent like any failure
    let record = metrics.get(&"worker".to_string()).unwrap();
    assert_eq!(record.failed, 1);
    // The slot was released again
    assert_eq!(scheduler.agent_loads().await.get("worker"), Some(&0));
}

#[tokio::test]
async fn task_added_after_a_failed_dependency_arrives_cancelled() {
    let (scheduler, _) = spawn_scheduler(stalled_backend());
    scheduler.register_agent(Agent::new("worker", 2, 5)).await;

    let wf = Workflow::new("doomed").with_task(Task::new("a", TaskKind::Build));
    let wf_id = scheduler.submit(wf).await.unwrap();
    wait_for_status(&scheduler, "a", TaskStatus::Running).await;
    scheduler
        .report_failure(&"a".to_string(), "broken".into())
        .await;

    // The graph is structurally fine, but the dependency already failed:
    // the new task is accepted and immediately cancelled, never ready
    scheduler
        .add_task(&wf_id, Task::new("b", TaskKind::Testing).with_dependency("a"))
        .await
        .unwrap();
    let b = scheduler.task("b").await.unwrap();
    assert_eq!(b.status, TaskStatus::Cancelled);
    assert!(b.assigned_agent.is_none());
}

#[tokio::test]
async fn capacity_bounds_hold_per_agent_and_overall() {
    let total = Arc::new(Probe::default());
    let big = Arc::new(Probe::default());
    let small = Arc::new(Probe::default());
    let big_count = Arc::new(AtomicUsize::new(0));
    let small_count = Arc::new(AtomicUsize::new(0));

    let (t, b, s) = (Arc::clone(&total), Arc::clone(&big), Arc::clone(&small));
    let (bc, sc) = (Arc::clone(&big_count), Arc::clone(&small_count));
    let backend = Arc::new(LocalBackend::new(move |agent: String, _task| {
        let (t, b, s) = (Arc::clone(&t), Arc::clone(&b), Arc::clone(&s));
        let (bc, sc) = (Arc::clone(&bc), Arc::clone(&sc));
        async move {
            let per_agent = if agent == "big" {
                bc.fetch_add(1, Ordering::SeqCst);
                b
            } else {
                sc.fetch_add(1, Ordering::SeqCst);
                s
            };
            t.enter();
            per_agent.enter();
            tokio::time::sleep(Duration::from_millis(50)).await;
            per_agent.exit();
            t.exit();
            Ok(json!(null))
        }
    }));
    let (scheduler, _) = spawn_scheduler(backend);
    scheduler.register_agent(Agent::new("big", 2, 5)).await;
    scheduler.register_agent(Agent::new("small", 1, 5)).await;

    let mut wf = Workflow::new("fanout");
    for i in 0..5 {
        wf.add_task(Task::new(format!("t{i}"), TaskKind::Analysis));
    }
    let wf_id = scheduler.submit(wf).await.unwrap();
    wait_finished(&scheduler, &wf_id).await;

    assert!(total.peak() <= 3, "ran {} tasks at once", total.peak());
    assert!(big.peak() <= 2);
    assert!(small.peak() <= 1);
    // Once the capacity-1 agent fills up it is excluded, so the larger
    // agent absorbs the remaining work
    assert!(big_count.load(Ordering::SeqCst) > small_count.load(Ordering::SeqCst));
    for i in 0..5 {
        assert_eq!(
            scheduler.task_status(&format!("t{i}")).await,
            Some(TaskStatus::Completed)
        );
    }
}

#[tokio::test]
async fn source_tasks_are_ready_immediately_even_without_agents() {
    let (scheduler, _) = spawn_scheduler(stalled_backend());
    let wf = Workflow::new("idle")
        .with_task(Task::new("a", TaskKind::Build))
        .with_task(Task::new("b", TaskKind::Build))
        .with_task(Task::new("c", TaskKind::Testing).with_dependency("a"));
    scheduler.submit(wf).await.unwrap();

    // No agents registered: sources sit ready (backpressure), never stuck pending
    assert_eq!(scheduler.task_status("a").await, Some(TaskStatus::Ready));
    assert_eq!(scheduler.task_status("b").await, Some(TaskStatus::Ready));
    assert_eq!(scheduler.task_status("c").await, Some(TaskStatus::Pending));
}

#[tokio::test]
async fn structural_rejection_returns_the_full_error_list() {
    let (scheduler, _) = spawn_scheduler(stalled_backend());
    let wf = Workflow::new("broken")
        .with_task(Task::new("a", TaskKind::Build).with_dependency("ghost"))
        .with_task(Task::new("b", TaskKind::Build).with_dependency("c"))
        .with_task(Task::new("c", TaskKind::Build).with_dependency("b"));
    let err = scheduler.submit(wf).await.unwrap_err();
    match err {
        LoomError::InvalidWorkflow(errors) => {
            // no source + dangling + cycle, all reported together
            assert!(errors.len() >= 3, "got {errors:?}");
        }
        other => panic!("expected InvalidWorkflow, got {other}"),
    }
    // Nothing from a rejected workflow enters the scheduler
    assert_eq!(scheduler.task_status("a").await, None);
}

#[tokio::test]
async fn cancellation_cascades_and_is_idempotent() {
    let (scheduler, _) = spawn_scheduler(stalled_backend());
    scheduler.register_agent(Agent::new("worker", 2, 5)).await;

    let wf = Workflow::new("cancel")
        .with_task(Task::new("a", TaskKind::Build))
        .with_task(Task::new("b", TaskKind::Testing).with_dependency("a"));
    scheduler.submit(wf).await.unwrap();
    wait_for_status(&scheduler, "a", TaskStatus::Running).await;

    scheduler.cancel(&"a".to_string()).await.unwrap();
    assert_eq!(scheduler.task_status("a").await, Some(TaskStatus::Cancelled));
    assert_eq!(scheduler.task_status("b").await, Some(TaskStatus::Cancelled));

    // Cancelling again is a no-op, not an error
    scheduler.cancel(&"a".to_string()).await.unwrap();
    assert_eq!(scheduler.task_status("a").await, Some(TaskStatus::Cancelled));

    // Unknown tasks are a real error
    let err = scheduler.cancel(&"nope".to_string()).await.unwrap_err();
    assert!(matches!(err, LoomError::TaskNotFound(_)));
}

#[tokio::test]
async fn deregistration_with_in_flight_work_requires_force() {
    let (scheduler, _) = spawn_scheduler(stalled_backend());
    scheduler.register_agent(Agent::new("worker", 1, 5)).await;

    let wf = Workflow::new("busy").with_task(Task::new("a", TaskKind::Build));
    scheduler.submit(wf).await.unwrap();
    wait_for_status(&scheduler, "a", TaskStatus::Running).await;

    let err = scheduler
        .deregister_agent(&"worker".to_string(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, LoomError::AgentBusy { in_flight: 1, .. }));

    scheduler
        .deregister_agent(&"worker".to_string(), true)
        .await
        .unwrap();
    assert_eq!(scheduler.task_status("a").await, Some(TaskStatus::Cancelled));
    assert!(scheduler.agents().await.is_empty());
}

#[tokio::test]
async fn completion_reports_promote_dependents_and_feed_metrics() {
    let (scheduler, metrics) = spawn_scheduler(stalled_backend());
    scheduler
        .register_agent(Agent::new("worker", 4, 5).with_capability("build"))
        .await;

    let wf = Workflow::new("chain")
        .with_task(Task::new("a", TaskKind::Build))
        .with_task(Task::new("b", TaskKind::Build).with_dependency("a"));
    scheduler.submit(wf).await.unwrap();
    wait_for_status(&scheduler, "a", TaskStatus::Running).await;
    assert_eq!(scheduler.task_status("b").await, Some(TaskStatus::Pending));

    scheduler
        .report_completion(&"a".to_string(), json!({"artifact": "out.tar"}))
        .await;
    let a = scheduler.task("a").await.unwrap();
    assert_eq!(a.status, TaskStatus::Completed);
    assert_eq!(a.result, Some(json!({"artifact": "out.tar"})));
    // b was promoted and immediately dispatched
    wait_for_status(&scheduler, "b", TaskStatus::Running).await;

    scheduler
        .report_failure(&"b".to_string(), "compiler exploded".into())
        .await;
    let b = scheduler.task("b").await.unwrap();
    assert_eq!(b.status, TaskStatus::Failed);
    assert_eq!(b.error.as_deref(), Some("compiler exploded"));

    let record = metrics.get(&"worker".to_string()).unwrap();
    assert_eq!(record.total, 2);
    assert_eq!(record.completed, 1);
    assert_eq!(record.failed, 1);

    // A late report for a terminal task is dropped, not applied
    scheduler.report_failure(&"a".to_string(), "late".into()).await;
    assert_eq!(scheduler.task_status("a").await, Some(TaskStatus::Completed));
    assert_eq!(metrics.get(&"worker".to_string()).unwrap().total, 2);
}

#[tokio::test]
async fn critical_tasks_dispatch_before_low_priority_ones() {
    let (scheduler, _) = spawn_scheduler(stalled_backend());
    scheduler.register_agent(Agent::new("worker", 1, 5)).await;

    let wf = Workflow::new("priorities")
        .with_task(Task::new("chore", TaskKind::Documentation).with_priority(Priority::Low))
        .with_task(Task::new("hotfix", TaskKind::Build).with_priority(Priority::Critical));
    scheduler.submit(wf).await.unwrap();

    wait_for_status(&scheduler, "hotfix", TaskStatus::Running).await;
    // The earlier-submitted low-priority task lost the only slot
    assert_eq!(scheduler.task_status("chore").await, Some(TaskStatus::Ready));
}

#[tokio::test]
async fn capability_match_steers_assignment() {
    let (scheduler, _) = spawn_scheduler(stalled_backend());
    scheduler.register_agent(Agent::new("generalist", 2, 5)).await;
    scheduler
        .register_agent(Agent::new("specialist", 2, 5).with_capability("testing"))
        .await;

    let wf = Workflow::new("match").with_task(Task::new("t", TaskKind::Testing));
    scheduler.submit(wf).await.unwrap();
    wait_for_status(&scheduler, "t", TaskStatus::Running).await;

    let task = scheduler.task("t").await.unwrap();
    // +3 capability bonus beats the first-registered generalist
    assert_eq!(task.assigned_agent.as_deref(), Some("specialist"));
}

#[tokio::test]
async fn dynamic_task_addition_is_revalidated() {
    let backend = Arc::new(LocalBackend::new(|_agent, _task| async {
        Ok(json!(null))
    }));
    let (scheduler, _) = spawn_scheduler(backend);
    scheduler.register_agent(Agent::new("worker", 2, 5)).await;

    let wf = Workflow::new("growing").with_task(Task::new("a", TaskKind::Build));
    let wf_id = scheduler.submit(wf).await.unwrap();
    wait_for_status(&scheduler, "a", TaskStatus::Completed).await;

    // Extending the finished graph: dependency already complete, so the
    // new task goes straight to ready and runs
    scheduler
        .add_task(&wf_id, Task::new("b", TaskKind::Testing).with_dependency("a"))
        .await
        .unwrap();
    wait_for_status(&scheduler, "b", TaskStatus::Completed).await;

    // A dangling dependency is caught by re-validation
    let err = scheduler
        .add_task(&wf_id, Task::new("c", TaskKind::Testing).with_dependency("ghost"))
        .await
        .unwrap_err();
    assert!(matches!(err, LoomError::InvalidWorkflow(_)));
    assert_eq!(scheduler.task_status("c").await, None);

    // Duplicate ids are rejected before validation even runs
    let err = scheduler
        .add_task(&wf_id, Task::new("a", TaskKind::Build))
        .await
        .unwrap_err();
    assert!(matches!(err, LoomError::DuplicateTask(_)));
}

#[tokio::test]
async fn read_models_expose_state_loads_and_layout() {
    let (scheduler, metrics) = spawn_scheduler(stalled_backend());
    scheduler.register_agent(Agent::new("worker", 2, 5)).await;
    metrics.record(&"worker".to_string(), Outcome::Completed, 120);

    let wf = Workflow::new("observed")
        .with_task(Task::new("a", TaskKind::Build))
        .with_task(Task::new("b", TaskKind::Testing).with_dependency("a"));
    let wf_id = scheduler.submit(wf).await.unwrap();
    wait_for_status(&scheduler, "a", TaskStatus::Running).await;

    let snapshot = scheduler.workflow_snapshot(&wf_id).await.unwrap();
    assert_eq!(snapshot.name, "observed");
    assert_eq!(snapshot.tasks.len(), 2);
    assert_eq!(snapshot.tasks[0].status, TaskStatus::Running);
    assert_eq!(snapshot.tasks[0].assigned_agent.as_deref(), Some("worker"));

    let loads = scheduler.agent_loads().await;
    assert_eq!(loads.get("worker"), Some(&1));

    let layout = scheduler.workflow_layout(&wf_id).await.unwrap();
    assert_eq!(layout.len(), 2);
    assert!(layout["a"].y < layout["b"].y);

    assert_eq!(scheduler.task_workflow("a").await, Some(wf_id.clone()));
    let scores = scheduler.performance_scores();
    assert!(scores.contains_key("worker"));
}

#[tokio::test]
async fn registering_an_agent_unblocks_waiting_tasks() {
    let backend = Arc::new(LocalBackend::new(|_agent, _task| async {
        Ok(json!(null))
    }));
    let (scheduler, _) = spawn_scheduler(backend);

    let wf = Workflow::new("starved").with_task(Task::new("a", TaskKind::Build));
    let wf_id = scheduler.submit(wf).await.unwrap();
    assert_eq!(scheduler.task_status("a").await, Some(TaskStatus::Ready));

    // Capacity arriving triggers a fresh dispatch pass
    scheduler.register_agent(Agent::new("late", 1, 5)).await;
    wait_finished(&scheduler, &wf_id).await;
    assert_eq!(scheduler.task_status("a").await, Some(TaskStatus::Completed));
}

#[tokio::test]
async fn duplicate_task_ids_across_workflows_are_rejected() {
    let (scheduler, _) = spawn_scheduler(stalled_backend());
    let first = Workflow::new("one").with_task(Task::new("shared", TaskKind::Build));
    scheduler.submit(first).await.unwrap();

    let second = Workflow::new("two").with_task(Task::new("shared", TaskKind::Build));
    let err = scheduler.submit(second).await.unwrap_err();
    assert!(matches!(err, LoomError::DuplicateTask(_)));
}
