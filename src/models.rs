use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use uuid::Uuid;

use crate::constants::MAX_HISTORY_ENTRIES;

pub type TaskId = Uuid;
pub type GoalId = Uuid;
pub type AgentId = String;

/// A bounded ring of history entries kept on Task/Goal/HubFsm records.
/// Pushing past the cap silently drops the oldest entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct History<T> {
    entries: VecDeque<T>,
    cap: usize,
}

impl<T> History<T> {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(cap.min(64)),
            cap,
        }
    }

    pub fn push(&mut self, entry: T) {
        if self.entries.len() >= self.cap {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Relative priority used for scheduling order within a generation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Assigned,
    Working,
    Completed,
    Failed,
    DeadLetter,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHistoryEntry {
    pub at: chrono::DateTime<chrono::Utc>,
    pub status: TaskStatus,
    pub note: Option<String>,
}

/// A unit of work routed to exactly one agent at a time.
///
/// `generation` increments on every assignment; a frame or completion
/// report carrying a stale generation is silently dropped (the agent it
/// came from has already been reclaimed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub assigned_to: Option<AgentId>,
    pub assigned_at: Option<chrono::DateTime<chrono::Utc>>,
    pub generation: u64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub needed_capabilities: HashSet<String>,
    pub depends_on: HashSet<TaskId>,
    pub goal_id: Option<GoalId>,
    pub complete_by: Option<chrono::DateTime<chrono::Utc>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,

    // Enrichment fields carried from goal decomposition / routing.
    pub repo: Option<String>,
    pub branch: Option<String>,
    pub file_hints: Vec<String>,
    pub success_criteria: Vec<String>,
    pub verification_steps: Vec<String>,
    pub complexity: Option<String>,
    pub routing_decision: Option<String>,

    #[serde(skip)]
    pub history: History<TaskHistoryEntry>,
}

impl Task {
    pub fn new(description: String, priority: Priority) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4(),
            description,
            priority,
            status: TaskStatus::Queued,
            assigned_to: None,
            assigned_at: None,
            generation: 0,
            retry_count: 0,
            max_retries: crate::constants::DEFAULT_MAX_RETRIES,
            last_error: None,
            needed_capabilities: HashSet::new(),
            depends_on: HashSet::new(),
            goal_id: None,
            complete_by: None,
            created_at: now,
            updated_at: now,
            repo: None,
            branch: None,
            file_hints: Vec::new(),
            success_criteria: Vec::new(),
            verification_steps: Vec::new(),
            complexity: None,
            routing_decision: None,
            history: History::new(MAX_HISTORY_ENTRIES),
        }
    }

    pub fn touch(&mut self, status: TaskStatus, note: Option<String>) {
        self.status = status;
        self.updated_at = chrono::Utc::now();
        self.history.push(TaskHistoryEntry {
            at: self.updated_at,
            status,
            note,
        });
    }

    pub fn is_ready(&self, completed: &HashSet<TaskId>) -> bool {
        matches!(self.status, TaskStatus::Queued) && self.depends_on.iter().all(|d| completed.contains(d))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum GoalStatus {
    Submitted,
    Decomposing,
    Executing,
    Verifying,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum GoalSource {
    Api,
    Cli,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalHistoryEntry {
    pub at: chrono::DateTime<chrono::Utc>,
    pub status: GoalStatus,
    pub note: Option<String>,
}

/// A higher-level objective that decomposes into one or more Tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: GoalId,
    pub description: String,
    pub success_criteria: Vec<String>,
    pub priority: Priority,
    pub status: GoalStatus,
    pub child_task_ids: Vec<TaskId>,
    pub depends_on: HashSet<GoalId>,
    pub source: GoalSource,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,

    #[serde(skip)]
    pub history: History<GoalHistoryEntry>,
}

impl Goal {
    pub fn new(description: String, success_criteria: Vec<String>, priority: Priority, source: GoalSource) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4(),
            description,
            success_criteria,
            priority,
            status: GoalStatus::Submitted,
            child_task_ids: Vec::new(),
            depends_on: HashSet::new(),
            source,
            created_at: now,
            updated_at: now,
            history: History::new(MAX_HISTORY_ENTRIES),
        }
    }

    pub fn touch(&mut self, status: GoalStatus, note: Option<String>) {
        self.status = status;
        self.updated_at = chrono::Utc::now();
        self.history.push(GoalHistoryEntry {
            at: self.updated_at,
            status,
            note,
        });
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AgentFsmState {
    Idle,
    Assigned,
    Working,
    Blocked,
    Offline,
}

/// Durable record of a connected agent, independent of its live socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: AgentId,
    pub name: String,
    pub fsm_state: AgentFsmState,
    pub current_task_id: Option<TaskId>,
    pub capabilities: HashSet<String>,
    pub connected_at: chrono::DateTime<chrono::Utc>,
    pub last_heartbeat: chrono::DateTime<chrono::Utc>,
    /// Stamped on every successful `AgentFsm::assign`; the scheduler's
    /// LRU tie-break sorts idle candidates on this, not `last_heartbeat`
    /// (which updates on a fixed cadence regardless of assignment history).
    pub last_assigned_at: Option<chrono::DateTime<chrono::Utc>>,
    pub flags: HashSet<String>,
}

impl AgentRecord {
    pub fn new(agent_id: AgentId, name: String, capabilities: HashSet<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            agent_id,
            name,
            fsm_state: AgentFsmState::Idle,
            current_task_id: None,
            capabilities,
            connected_at: now,
            last_heartbeat: now,
            last_assigned_at: None,
            flags: HashSet::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub agent_id: AgentId,
    pub channel: String,
    pub occurred_at: chrono::DateTime<chrono::Utc>,
    pub backoff_secs: u64,
}

/// A single recorded invocation against the hourly cost ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetInvocation {
    pub hub_state: String,
    pub agent_id: Option<AgentId>,
    pub occurred_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum HubState {
    Resting,
    Executing,
    Improving,
    Contemplating,
    Healing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubFsmTransition {
    pub at: chrono::DateTime<chrono::Utc>,
    pub from: HubState,
    pub to: HubState,
    pub reason: String,
}
