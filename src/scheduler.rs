//! Matches ready tasks to idle agents.
//!
//! Grounded in the orchestrator's `process_tasks` poll loop, generalized
//! from "pop highest-priority task, find any idle agent" to capability-
//! superset matching with an LRU tie-break, dependency gating (handled
//! upstream by `TaskQueue::ready_tasks`), and rate-limit exclusion.
//! `try_schedule_all` borrows read-only snapshots from `TaskQueue` and
//! `AgentRegistry` and never holds a lock across the assignment hop -
//! `AgentFsm::assign` only touches an in-process channel.

use crate::agents::AgentRegistry;
use crate::event_bus::{Event, EventBus, Topic};
use crate::queue::TaskQueue;
use crate::rate_limit::{AgentRateLimiter, RateDecision};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct Scheduler {
    queue: Arc<TaskQueue>,
    registry: Arc<AgentRegistry>,
    rate_limiter: Arc<AgentRateLimiter>,
    event_bus: Arc<EventBus>,
}

impl Scheduler {
    pub fn new(
        queue: Arc<TaskQueue>,
        registry: Arc<AgentRegistry>,
        rate_limiter: Arc<AgentRateLimiter>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            queue,
            registry,
            rate_limiter,
            event_bus,
        }
    }

    /// One scheduling pass: walks ready tasks in priority/FIFO order
    /// and assigns each to the best idle candidate, skipping a task if
    /// no capable agent is free or the candidate is presently
    /// rate-limited on the `tasks` channel. Returns the number of tasks
    /// assigned.
    pub async fn try_schedule_all(&self) -> usize {
        let ready = self.queue.ready_tasks().await;
        let ready_count = ready.len();
        let mut assigned = 0;

        for task in ready {
            let candidates = self.registry.idle_candidates(&task.needed_capabilities).await;
            let Some(agent) = candidates.into_iter().next() else {
                continue;
            };

            let agent_id = agent.agent_id().await;
            match self.rate_limiter.check(&agent_id, "tasks", "standard", 10.0, 0.5) {
                Ok(RateDecision::Warn { remaining }) => {
                    if let Err(e) = agent.notify_rate_warning("tasks".to_string(), remaining).await {
                        warn!("failed to notify agent {} of rate warning: {}", agent_id, e);
                    }
                }
                Ok(_) => {}
                Err(_) => {
                    debug!("agent {} rate limited, skipping for now", agent_id);
                    continue;
                }
            }

            let generation = match self.queue.assign(task.id, &agent_id).await {
                Ok(g) => g,
                Err(e) => {
                    warn!("failed to assign task {}: {}", task.id, e);
                    continue;
                }
            };

            if let Err(e) = agent
                .assign(task.id, generation, task.description.clone(), task.success_criteria.clone())
                .await
            {
                warn!("agent {} refused assignment, reclaiming: {}", agent_id, e);
                let _ = self.queue.reclaim(task.id).await;
                continue;
            }

            self.event_bus
                .publish(Event::new(
                    Topic::Tasks,
                    "assigned",
                    serde_json::json!({ "task_id": task.id, "agent_id": agent_id, "generation": generation }),
                ))
                .await;
            assigned += 1;
        }

        self.event_bus
            .publish(Event::new(
                Topic::Tasks,
                "scheduler_attempt",
                serde_json::json!({ "ready": ready_count, "assigned": assigned }),
            ))
            .await;

        assigned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentFsm;
    use crate::models::{AgentRecord, Priority, Task};
    use crate::store::Store;
    use std::collections::HashSet;
    use tokio::sync::mpsc;

    async fn make_scheduler() -> (Scheduler, Arc<TaskQueue>, Arc<AgentRegistry>, Arc<EventBus>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("tasks.redb")).unwrap());
        let queue = Arc::new(TaskQueue::new(store).await.unwrap());
        let registry = Arc::new(AgentRegistry::new());
        let rate_limiter = Arc::new(AgentRateLimiter::new());
        let event_bus = Arc::new(EventBus::new());
        let scheduler = Scheduler::new(queue.clone(), registry.clone(), rate_limiter, event_bus.clone());
        (scheduler, queue, registry, event_bus)
    }

    #[tokio::test]
    async fn test_assigns_matching_task_to_idle_agent() {
        let (scheduler, queue, registry, _event_bus) = make_scheduler().await;

        let mut task = Task::new("write rust".to_string(), Priority::Normal);
        task.needed_capabilities.insert("rust".to_string());
        queue.submit(task).await.unwrap();

        let (tx, _rx) = mpsc::channel(8);
        let mut caps = HashSet::new();
        caps.insert("rust".to_string());
        let record = AgentRecord::new("agent-1".to_string(), "a".to_string(), caps);
        registry
            .register("agent-1".to_string(), Arc::new(AgentFsm::new(record, tx)))
            .await;

        let assigned = scheduler.try_schedule_all().await;
        assert_eq!(assigned, 1);
    }

    #[tokio::test]
    async fn test_skips_task_with_no_capable_agent() {
        let (scheduler, queue, _registry, _event_bus) = make_scheduler().await;
        let mut task = Task::new("write go".to_string(), Priority::Normal);
        task.needed_capabilities.insert("go".to_string());
        queue.submit(task).await.unwrap();

        let assigned = scheduler.try_schedule_all().await;
        assert_eq!(assigned, 0);
    }

    #[tokio::test]
    async fn test_emits_scheduler_attempt_event_even_with_no_ready_tasks() {
        let (scheduler, _queue, _registry, event_bus) = make_scheduler().await;
        let mut rx = event_bus.subscribe(Topic::Tasks).await;

        let assigned = scheduler.try_schedule_all().await;
        assert_eq!(assigned, 0);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, "scheduler_attempt");
    }
}
