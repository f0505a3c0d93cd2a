//! Request/response shapes for the HTTP surface. Kept separate from the
//! handlers so the wire format can be reviewed independent of routing.

use crate::models::{AgentId, GoalId, GoalSource, GoalStatus, HubFsmTransition, HubState, Priority, Task, TaskId, TaskStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub needed_capabilities: HashSet<String>,
    #[serde(default)]
    pub depends_on: HashSet<TaskId>,
    #[serde(default)]
    pub success_criteria: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub id: TaskId,
    pub description: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub assigned_to: Option<AgentId>,
    pub generation: u64,
    pub retry_count: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<Task> for TaskResponse {
    fn from(t: Task) -> Self {
        Self {
            id: t.id,
            description: t.description,
            priority: t.priority,
            status: t.status,
            assigned_to: t.assigned_to,
            generation: t.generation,
            retry_count: t.retry_count,
            created_at: t.created_at,
            updated_at: t.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateGoalRequest {
    pub description: String,
    #[serde(default)]
    pub success_criteria: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_source")]
    pub source: GoalSource,
}

fn default_source() -> GoalSource {
    GoalSource::Api
}

#[derive(Debug, Serialize)]
pub struct GoalResponse {
    pub id: GoalId,
    pub description: String,
    pub status: GoalStatus,
    pub child_task_ids: Vec<TaskId>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
pub struct HubStatusResponse {
    pub state: HubState,
}

#[derive(Debug, Deserialize)]
pub struct ForceTransitionRequest {
    pub to: HubState,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct OnboardRequest {
    pub name: String,
    #[serde(default)]
    pub capabilities: HashSet<String>,
    /// Caller-chosen id; a fresh one is minted if omitted. Re-registering
    /// an id that is already onboarded is a 409, not a silent reissue.
    #[serde(default)]
    pub agent_id: Option<AgentId>,
}

#[derive(Debug, Serialize)]
pub struct OnboardResponse {
    pub agent_id: AgentId,
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct TaskListQuery {
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub assigned_to: Option<AgentId>,
    pub goal_id: Option<GoalId>,
}

#[derive(Debug, Deserialize)]
pub struct GoalTransitionRequest {
    pub to: GoalStatus,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WhitelistReplaceRequest {
    pub agent_ids: Vec<AgentId>,
}

#[derive(Debug, Serialize)]
pub struct HubHistoryResponse {
    pub transitions: Vec<HubFsmTransition>,
}

#[derive(Debug, Serialize)]
pub struct BackupResult {
    pub table: String,
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub struct BackupSummaryResponse {
    pub results: Vec<BackupResult>,
}
