//! WebSocket frame protocol between the hub and remote agent sidecars.
//!
//! Every frame that references a task carries the `generation` the
//! queue handed out at assignment time. A frame whose generation no
//! longer matches the task's current generation is stale - the
//! assignment it refers to was already reclaimed - and is silently
//! dropped rather than surfaced as an error.

use crate::models::{AgentId, TaskId};
use serde::{Deserialize, Serialize};

/// Frames sent from the hub down to a connected agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubFrame {
    TaskAssign {
        task_id: TaskId,
        generation: u64,
        description: String,
        success_criteria: Vec<String>,
    },
    TaskCancel {
        task_id: TaskId,
        generation: u64,
    },
    RateLimitWarning {
        channel: String,
        tokens_remaining: f64,
    },
    RateLimited {
        channel: String,
        retry_after_secs: u64,
    },
    Identified {
        agent_id: AgentId,
    },
    Error {
        error: String,
    },
}

/// Frames sent from an agent up to the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentFrame {
    Identify {
        agent_id: AgentId,
        name: String,
        capabilities: Vec<String>,
        token: String,
    },
    Ping,
    TaskAccepted {
        task_id: TaskId,
        generation: u64,
    },
    TaskProgress {
        task_id: TaskId,
        generation: u64,
        note: String,
    },
    TaskComplete {
        task_id: TaskId,
        generation: u64,
    },
    TaskFailed {
        task_id: TaskId,
        generation: u64,
        error: String,
    },
    StateReport {
        blocked: bool,
        reason: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_frame_round_trips_through_json() {
        let frame = AgentFrame::TaskFailed {
            task_id: TaskId::new_v4(),
            generation: 3,
            error: "timeout".to_string(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        let back: AgentFrame = serde_json::from_str(&json).unwrap();
        match back {
            AgentFrame::TaskFailed { generation, error, .. } => {
                assert_eq!(generation, 3);
                assert_eq!(error, "timeout");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_hub_frame_tag_is_snake_case() {
        let frame = HubFrame::RateLimited {
            channel: "default".to_string(),
            retry_after_secs: 5,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"rate_limited\""));
    }
}
