use crate::models::{Goal, GoalId, GoalStatus, TaskId};
use crate::store::Store;
use crate::{AgentComError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Durable backlog of goals, mirroring `TaskQueue`'s store-then-memory
/// discipline but over the simpler `GoalStatus` transition graph.
#[derive(Clone)]
pub struct GoalBacklog {
    store: Arc<Store<Goal>>,
    goals: Arc<Mutex<HashMap<GoalId, Goal>>>,
}

#[derive(Debug, Default, serde::Serialize)]
pub struct GoalBacklogStats {
    pub submitted: usize,
    pub decomposing: usize,
    pub executing: usize,
    pub verifying: usize,
    pub complete: usize,
    pub failed: usize,
}

fn valid_transition(from: GoalStatus, to: GoalStatus) -> bool {
    use GoalStatus::*;
    matches!(
        (from, to),
        (Submitted, Decomposing)
            | (Decomposing, Executing)
            | (Decomposing, Failed)
            | (Executing, Verifying)
            | (Executing, Failed)
            | (Verifying, Complete)
            | (Verifying, Executing)
            | (Verifying, Failed)
    )
}

impl GoalBacklog {
    pub async fn new(store: Arc<Store<Goal>>) -> Result<Self> {
        let existing = store.all().await?;
        let mut goals = HashMap::with_capacity(existing.len());
        for goal in existing {
            goals.insert(goal.id, goal);
        }
        info!("goal backlog rebuilt from store: {} goals", goals.len());
        Ok(Self {
            store,
            goals: Arc::new(Mutex::new(goals)),
        })
    }

    pub async fn submit(&self, goal: Goal) -> Result<GoalId> {
        let id = goal.id;
        self.store.insert(&id.to_string(), &goal).await?;
        self.goals.lock().await.insert(id, goal);
        debug!("goal {} submitted", id);
        Ok(id)
    }

    pub async fn get(&self, id: GoalId) -> Option<Goal> {
        self.goals.lock().await.get(&id).cloned()
    }

    pub async fn list(&self) -> Vec<Goal> {
        self.goals.lock().await.values().cloned().collect()
    }

    async fn persist_and_update(&self, goal: Goal) -> Result<()> {
        self.store.insert(&goal.id.to_string(), &goal).await?;
        self.goals.lock().await.insert(goal.id, goal);
        Ok(())
    }

    /// Moves a goal to any status reachable per `valid_transition` from
    /// its current one, for operator-driven overrides (`PATCH
    /// /api/goals/:id/transition`) in addition to the named convenience
    /// methods below.
    pub async fn transition(&self, id: GoalId, to: GoalStatus, note: Option<String>) -> Result<()> {
        let mut goal = self
            .get(id)
            .await
            .ok_or_else(|| AgentComError::NotFound(format!("goal {id} not found")))?;
        if !valid_transition(goal.status, to) {
            return Err(AgentComError::BusinessRuleRefusal(format!(
                "goal {id} cannot move from {:?} to {:?}",
                goal.status, to
            )));
        }
        goal.touch(to, note);
        self.persist_and_update(goal).await
    }

    pub async fn begin_decomposition(&self, id: GoalId) -> Result<()> {
        self.transition(id, GoalStatus::Decomposing, Some("decomposing".to_string()))
            .await
    }

    /// Attaches the child tasks produced by decomposition and moves the
    /// goal into `Executing`.
    pub async fn attach_children(&self, id: GoalId, child_task_ids: Vec<TaskId>) -> Result<()> {
        let mut goal = self
            .get(id)
            .await
            .ok_or_else(|| AgentComError::NotFound(format!("goal {id} not found")))?;
        if !valid_transition(goal.status, GoalStatus::Executing) {
            return Err(AgentComError::BusinessRuleRefusal(format!(
                "goal {id} cannot begin executing from {:?}",
                goal.status
            )));
        }
        goal.child_task_ids = child_task_ids;
        goal.touch(GoalStatus::Executing, Some("children attached".to_string()));
        self.persist_and_update(goal).await
    }

    pub async fn begin_verification(&self, id: GoalId) -> Result<()> {
        self.transition(id, GoalStatus::Verifying, Some("verifying".to_string()))
            .await
    }

    pub async fn complete(&self, id: GoalId) -> Result<()> {
        self.transition(id, GoalStatus::Complete, Some("complete".to_string()))
            .await
    }

    pub async fn fail(&self, id: GoalId, reason: String) -> Result<()> {
        self.transition(id, GoalStatus::Failed, Some(reason)).await
    }

    /// Returns verification back to execution, e.g. when follow-up tasks
    /// are needed to satisfy success criteria.
    pub async fn reopen_for_execution(&self, id: GoalId) -> Result<()> {
        self.transition(id, GoalStatus::Executing, Some("reopened".to_string()))
            .await
    }

    pub async fn compact(&self) -> Result<()> {
        self.store.compact().await
    }

    pub async fn stats(&self) -> GoalBacklogStats {
        let goals = self.goals.lock().await;
        let mut stats = GoalBacklogStats::default();
        for g in goals.values() {
            match g.status {
                GoalStatus::Submitted => stats.submitted += 1,
                GoalStatus::Decomposing => stats.decomposing += 1,
                GoalStatus::Executing => stats.executing += 1,
                GoalStatus::Verifying => stats.verifying += 1,
                GoalStatus::Complete => stats.complete += 1,
                GoalStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }
}
