//! Integration-style scenarios exercising `TaskQueue`, `AgentRegistry`,
//! `AgentFsm`, `Scheduler`, and `Reaper` together in-process, without a
//! real socket (the WebSocket layer is a thin frame-forwarding shim over
//! the same `AgentFsm`/`TaskQueue` calls these tests drive directly).

use crate::agents::{AgentFsm, AgentRegistry};
use crate::event_bus::EventBus;
use crate::models::{AgentRecord, Priority, Task, TaskStatus};
use crate::queue::TaskQueue;
use crate::rate_limit::AgentRateLimiter;
use crate::reaper::Reaper;
use crate::scheduler::Scheduler;
use crate::store::Store;
use chrono::Duration as ChronoDuration;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;

async fn make_queue() -> Arc<TaskQueue> {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(dir.path().join("tasks.redb")).unwrap());
    Arc::new(TaskQueue::new(store).await.unwrap())
}

fn make_agent(agent_id: &str, capabilities: &[&str]) -> (Arc<AgentFsm>, mpsc::Receiver<crate::ws::HubFrame>) {
    let (tx, rx) = mpsc::channel(16);
    let caps: HashSet<String> = capabilities.iter().map(|c| c.to_string()).collect();
    let record = AgentRecord::new(agent_id.to_string(), "worker".to_string(), caps);
    (Arc::new(AgentFsm::new(record, tx)), rx)
}

/// S1: a ready task with a matching idle agent is assigned within one
/// scheduler tick, with generation bumped to 1.
#[tokio::test]
async fn scenario_s1_assigns_matching_task_within_one_tick() {
    let queue = make_queue().await;
    let registry = Arc::new(AgentRegistry::new());
    let rate_limiter = Arc::new(AgentRateLimiter::new());
    let event_bus = Arc::new(EventBus::new());

    let mut task = Task::new("write code".to_string(), Priority::Normal);
    task.needed_capabilities.insert("code".to_string());
    queue.submit(task).await.unwrap();

    let (agent, _rx) = make_agent("agent-x", &["code"]);
    registry.register("agent-x".to_string(), agent).await;

    let scheduler = Scheduler::new(queue.clone(), registry.clone(), rate_limiter, event_bus);
    let assigned = scheduler.try_schedule_all().await;
    assert_eq!(assigned, 1);

    let tasks = queue.list().await;
    assert_eq!(tasks[0].status, TaskStatus::Assigned);
    assert_eq!(tasks[0].generation, 1);
    assert_eq!(tasks[0].assigned_to.as_deref(), Some("agent-x"));
}

/// S2: an agent that goes stale (no heartbeat) has its task reclaimed by
/// the reaper, bumping the generation; a frame citing the old generation
/// is then rejected by `TaskQueue::accept`.
#[tokio::test]
async fn scenario_s2_stale_agent_task_reclaimed_and_stale_generation_rejected() {
    let queue = make_queue().await;
    let registry = Arc::new(AgentRegistry::new());
    let rate_limiter = Arc::new(AgentRateLimiter::new());

    let mut task = Task::new("build it".to_string(), Priority::Normal);
    task.needed_capabilities.insert("code".to_string());
    let task_id = queue.submit(task).await.unwrap();

    let generation = queue.assign(task_id, &"agent-x".to_string()).await.unwrap();
    assert_eq!(generation, 1);

    // Construct the agent record directly with a backdated heartbeat and
    // the task already attached, simulating a connection that went dark
    // mid-assignment without ever hearing back from the reaper.
    let (tx, _rx) = mpsc::channel(8);
    let mut record = AgentRecord::new("agent-x".to_string(), "worker".to_string(), HashSet::new());
    record.current_task_id = Some(task_id);
    record.last_heartbeat = chrono::Utc::now() - ChronoDuration::seconds(3600);
    registry
        .register("agent-x".to_string(), Arc::new(AgentFsm::new(record, tx)))
        .await;

    let reaper = Reaper::new(queue.clone(), registry.clone(), rate_limiter);
    let report = reaper.sweep().await;
    assert_eq!(report.stale_agents_reclaimed, 1);

    let task = queue.get(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.generation, 2);

    // A late accept carrying the stale generation 1 must be rejected.
    let result = queue.accept(task_id, &"agent-x".to_string(), generation).await;
    assert!(result.is_err());
}

/// S3: a dependent task stays queued-but-not-ready until its dependency
/// completes, then becomes assignable on the next scheduling pass.
#[tokio::test]
async fn scenario_s3_dependent_task_waits_then_schedules_after_dependency_completes() {
    let queue = make_queue().await;
    let registry = Arc::new(AgentRegistry::new());
    let rate_limiter = Arc::new(AgentRateLimiter::new());
    let event_bus = Arc::new(EventBus::new());

    let task_a = Task::new("A".to_string(), Priority::Normal);
    let a_id = queue.submit(task_a).await.unwrap();

    let mut task_b = Task::new("B".to_string(), Priority::Normal);
    task_b.depends_on.insert(a_id);
    let b_id = queue.submit(task_b).await.unwrap();

    let ready = queue.ready_tasks().await;
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].id, a_id);

    let (agent, _rx) = make_agent("agent-x", &[]);
    registry.register("agent-x".to_string(), agent).await;

    let scheduler = Scheduler::new(queue.clone(), registry.clone(), rate_limiter, event_bus);
    scheduler.try_schedule_all().await;

    queue.accept(a_id, &"agent-x".to_string(), 1).await.unwrap();
    queue.complete(a_id, &"agent-x".to_string(), 1).await.unwrap();

    let ready = queue.ready_tasks().await;
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].id, b_id);
}

/// S4: a per-agent rate-limit bucket allows its configured burst, then
/// denies further checks until tokens refill.
#[tokio::test]
async fn scenario_s4_agent_rate_limit_allows_burst_then_denies() {
    let limiter = AgentRateLimiter::new();
    let agent_id = "agent-x".to_string();

    for _ in 0..2 {
        assert!(limiter
            .check(&agent_id, "tasks", "normal", 2.0, 1.0 / 60.0)
            .is_ok());
    }

    let result = limiter.check(&agent_id, "tasks", "normal", 2.0, 1.0 / 60.0);
    assert!(result.is_err());
}

/// S6: after a task is fully assigned and persisted, reopening the
/// store from disk reflects the post-assignment state exactly - there is
/// no window where the in-memory mirror and the durable store disagree.
#[tokio::test]
async fn scenario_s6_assignment_survives_store_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.redb");

    let task_id = {
        let store = Arc::new(Store::open(&path).unwrap());
        let queue = TaskQueue::new(store).await.unwrap();
        let task = Task::new("durable task".to_string(), Priority::Normal);
        let id = queue.submit(task).await.unwrap();
        queue.assign(id, &"agent-x".to_string()).await.unwrap();
        id
    };

    let store = Arc::new(Store::open(&path).unwrap());
    let reopened = TaskQueue::new(store).await.unwrap();
    let task = reopened.get(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Assigned);
    assert_eq!(task.generation, 1);
    assert_eq!(task.assigned_to.as_deref(), Some("agent-x"));
}
