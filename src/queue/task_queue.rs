use crate::constants::MAX_QUEUE_SIZE;
use crate::models::{AgentId, GoalId, Task, TaskId, TaskStatus};
use crate::store::Store;
use crate::{AgentComError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Durable, priority-ordered task queue.
///
/// `store` is the source of truth; `tasks` is an in-memory mirror kept
/// for fast scheduling queries. Every mutating method persists to
/// `store` before touching `tasks` - if persistence fails the in-memory
/// mirror is left untouched, and if the post-persist mirror update
/// somehow fails that's a bug, not a recoverable condition, so it's
/// logged rather than rolled back.
#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<Store<Task>>,
    tasks: Arc<Mutex<HashMap<TaskId, Task>>>,
}

#[derive(Debug, Default, serde::Serialize)]
pub struct TaskQueueStats {
    pub queued: usize,
    pub assigned: usize,
    pub working: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_letter: usize,
    pub cancelled: usize,
}

#[derive(Debug, Default, serde::Serialize)]
pub struct GoalProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub in_flight: usize,
}

impl TaskQueue {
    pub async fn new(store: Arc<Store<Task>>) -> Result<Self> {
        let existing = store.all().await?;
        let mut tasks = HashMap::with_capacity(existing.len());
        for task in existing {
            tasks.insert(task.id, task);
        }
        info!("task queue rebuilt from store: {} tasks", tasks.len());
        Ok(Self {
            store,
            tasks: Arc::new(Mutex::new(tasks)),
        })
    }

    pub async fn submit(&self, task: Task) -> Result<TaskId> {
        let mut tasks = self.tasks.lock().await;
        if tasks.len() >= MAX_QUEUE_SIZE {
            return Err(AgentComError::BusinessRuleRefusal(format!(
                "task queue full (max {MAX_QUEUE_SIZE})"
            )));
        }
        let id = task.id;
        self.store.insert(&id.to_string(), &task).await?;
        tasks.insert(id, task);
        debug!("task {} submitted", id);
        Ok(id)
    }

    pub async fn get(&self, id: TaskId) -> Option<Task> {
        self.tasks.lock().await.get(&id).cloned()
    }

    pub async fn list(&self) -> Vec<Task> {
        self.tasks.lock().await.values().cloned().collect()
    }

    pub async fn tasks_for_goal(&self, goal_id: GoalId) -> Vec<Task> {
        self.tasks
            .lock()
            .await
            .values()
            .filter(|t| t.goal_id == Some(goal_id))
            .cloned()
            .collect()
    }

    /// Returns ready tasks (queued, dependencies satisfied) ordered by
    /// priority descending, then creation time ascending (FIFO within
    /// a priority band).
    pub async fn ready_tasks(&self) -> Vec<Task> {
        let tasks = self.tasks.lock().await;
        let completed: std::collections::HashSet<TaskId> = tasks
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Completed))
            .map(|t| t.id)
            .collect();

        let mut ready: Vec<Task> = tasks
            .values()
            .filter(|t| t.is_ready(&completed))
            .cloned()
            .collect();

        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        ready
    }

    async fn persist_and_update(&self, task: Task) -> Result<Task> {
        self.store.insert(&task.id.to_string(), &task).await?;
        let mut tasks = self.tasks.lock().await;
        tasks.insert(task.id, task.clone());
        Ok(task)
    }

    /// Assigns a queued task to an agent, bumping its generation. The
    /// returned generation must be echoed back by the agent on every
    /// subsequent frame about this task; a stale generation means the
    /// assignment was already reclaimed.
    pub async fn assign(&self, task_id: TaskId, agent_id: &AgentId) -> Result<u64> {
        let mut task = self.require(task_id).await?;
        if !matches!(task.status, TaskStatus::Queued) {
            return Err(AgentComError::BusinessRuleRefusal(format!(
                "task {task_id} is not queued (status {:?})",
                task.status
            )));
        }
        task.generation += 1;
        task.assigned_to = Some(agent_id.clone());
        task.assigned_at = Some(chrono::Utc::now());
        task.touch(TaskStatus::Assigned, Some(format!("assigned to {agent_id}")));
        let generation = task.generation;
        self.persist_and_update(task).await?;
        Ok(generation)
    }

    pub async fn accept(&self, task_id: TaskId, agent_id: &AgentId, generation: u64) -> Result<()> {
        let mut task = self.authorized(task_id, agent_id, generation).await?;
        if !matches!(task.status, TaskStatus::Assigned) {
            return Err(AgentComError::BusinessRuleRefusal(format!(
                "task {task_id} is not in assigned state"
            )));
        }
        task.touch(TaskStatus::Working, Some("accepted".to_string()));
        self.persist_and_update(task).await?;
        Ok(())
    }

    pub async fn progress(
        &self,
        task_id: TaskId,
        agent_id: &AgentId,
        generation: u64,
        note: String,
    ) -> Result<()> {
        let mut task = self.authorized(task_id, agent_id, generation).await?;
        task.touch(TaskStatus::Working, Some(note));
        self.persist_and_update(task).await?;
        Ok(())
    }

    pub async fn complete(&self, task_id: TaskId, agent_id: &AgentId, generation: u64) -> Result<()> {
        let mut task = self.authorized(task_id, agent_id, generation).await?;
        task.assigned_to = None;
        task.assigned_at = None;
        task.touch(TaskStatus::Completed, Some("completed".to_string()));
        self.persist_and_update(task).await?;
        Ok(())
    }

    /// Records a failure. If retries remain the task is automatically
    /// requeued (stripped of its assignment); otherwise it moves to
    /// `DeadLetter`.
    pub async fn fail(
        &self,
        task_id: TaskId,
        agent_id: &AgentId,
        generation: u64,
        error: String,
    ) -> Result<TaskStatus> {
        let mut task = self.authorized(task_id, agent_id, generation).await?;
        task.last_error = Some(error.clone());
        task.retry_count += 1;
        task.assigned_to = None;
        task.assigned_at = None;

        let final_status = if task.retry_count >= task.max_retries {
            task.touch(TaskStatus::DeadLetter, Some(error));
            warn!(
                "task {} moved to dead letter after {} retries",
                task_id, task.retry_count
            );
            TaskStatus::DeadLetter
        } else {
            task.touch(TaskStatus::Queued, Some(error));
            TaskStatus::Queued
        };
        self.persist_and_update(task).await?;
        Ok(final_status)
    }

    /// Reclaims a task from a presumed-dead agent: bumps the generation
    /// (so any late frame from the old assignment is stale) and returns
    /// it to the queue.
    pub async fn reclaim(&self, task_id: TaskId) -> Result<()> {
        let mut task = self.require(task_id).await?;
        task.generation += 1;
        task.assigned_to = None;
        task.assigned_at = None;
        task.touch(TaskStatus::Queued, Some("reclaimed".to_string()));
        self.persist_and_update(task).await?;
        Ok(())
    }

    pub async fn dead_letter(&self, task_id: TaskId, reason: String) -> Result<()> {
        let mut task = self.require(task_id).await?;
        task.touch(TaskStatus::DeadLetter, Some(reason));
        self.persist_and_update(task).await?;
        Ok(())
    }

    /// Manually requeues a dead-lettered or failed task, resetting its
    /// retry count.
    pub async fn retry(&self, task_id: TaskId) -> Result<()> {
        let mut task = self.require(task_id).await?;
        if !matches!(task.status, TaskStatus::DeadLetter | TaskStatus::Failed) {
            return Err(AgentComError::BusinessRuleRefusal(format!(
                "task {task_id} is not retryable from status {:?}",
                task.status
            )));
        }
        task.retry_count = 0;
        task.last_error = None;
        task.touch(TaskStatus::Queued, Some("manual retry".to_string()));
        self.persist_and_update(task).await?;
        Ok(())
    }

    pub async fn cancel(&self, task_id: TaskId) -> Result<()> {
        let mut task = self.require(task_id).await?;
        if matches!(
            task.status,
            TaskStatus::Completed | TaskStatus::Cancelled
        ) {
            return Err(AgentComError::BusinessRuleRefusal(format!(
                "task {task_id} already in terminal state {:?}",
                task.status
            )));
        }
        task.generation += 1;
        task.touch(TaskStatus::Cancelled, Some("cancelled".to_string()));
        self.persist_and_update(task).await?;
        Ok(())
    }

    pub async fn stats(&self) -> TaskQueueStats {
        let tasks = self.tasks.lock().await;
        let mut stats = TaskQueueStats::default();
        for t in tasks.values() {
            match t.status {
                TaskStatus::Queued => stats.queued += 1,
                TaskStatus::Assigned => stats.assigned += 1,
                TaskStatus::Working => stats.working += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::DeadLetter => stats.dead_letter += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    pub async fn goal_progress(&self, goal_id: GoalId) -> GoalProgress {
        let children = self.tasks_for_goal(goal_id).await;
        let mut progress = GoalProgress {
            total: children.len(),
            ..Default::default()
        };
        for t in &children {
            match t.status {
                TaskStatus::Completed => progress.completed += 1,
                TaskStatus::Failed | TaskStatus::DeadLetter | TaskStatus::Cancelled => {
                    progress.failed += 1
                }
                _ => progress.in_flight += 1,
            }
        }
        progress
    }

    pub async fn compact(&self) -> Result<()> {
        self.store.compact().await
    }

    async fn require(&self, task_id: TaskId) -> Result<Task> {
        self.get(task_id)
            .await
            .ok_or_else(|| AgentComError::NotFound(format!("task {task_id} not found")))
    }

    async fn authorized(&self, task_id: TaskId, agent_id: &AgentId, generation: u64) -> Result<Task> {
        let task = self.require(task_id).await?;
        if task.generation != generation || task.assigned_to.as_ref() != Some(agent_id) {
            return Err(AgentComError::BusinessRuleRefusal(format!(
                "stale generation or assignment for task {task_id}"
            )));
        }
        Ok(task)
    }
}
