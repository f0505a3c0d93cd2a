pub mod registry;

pub use registry::AgentRegistry;

use crate::constants::DEFAULT_AGENT_HEARTBEAT_TIMEOUT_SECS;
use crate::models::{AgentFsmState, AgentId, AgentRecord, TaskId};
use crate::ws::HubFrame;
use crate::{AgentComError, Result};
use std::collections::HashSet;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Connection-scoped state machine for one remote agent.
///
/// Unlike the teacher's in-process `Agent` trait objects, an `AgentFsm`
/// never executes task code itself - it is a mailbox and a status
/// record for a sidecar reachable only through WebSocket frames. The
/// WebSocket handler task owns the other end of `outbound` and drains
/// it into the live socket, giving strict per-connection FIFO delivery.
pub struct AgentFsm {
    record: Mutex<AgentRecord>,
    outbound: mpsc::Sender<HubFrame>,
}

impl AgentFsm {
    pub fn new(record: AgentRecord, outbound: mpsc::Sender<HubFrame>) -> Self {
        Self {
            record: Mutex::new(record),
            outbound,
        }
    }

    pub async fn agent_id(&self) -> AgentId {
        self.record.lock().await.agent_id.clone()
    }

    pub async fn snapshot(&self) -> AgentRecord {
        self.record.lock().await.clone()
    }

    pub async fn state(&self) -> AgentFsmState {
        self.record.lock().await.fsm_state
    }

    pub async fn capabilities(&self) -> HashSet<String> {
        self.record.lock().await.capabilities.clone()
    }

    pub async fn is_idle(&self) -> bool {
        matches!(self.state().await, AgentFsmState::Idle)
    }

    pub async fn heartbeat(&self) {
        self.record.lock().await.last_heartbeat = chrono::Utc::now();
    }

    pub async fn is_stale(&self, timeout_secs: u64) -> bool {
        let record = self.record.lock().await;
        let timeout = timeout_secs.min(DEFAULT_AGENT_HEARTBEAT_TIMEOUT_SECS * 100) as i64;
        chrono::Utc::now()
            .signed_duration_since(record.last_heartbeat)
            .num_seconds()
            > timeout
    }

    /// Sends a task assignment down the agent's mailbox. Cheap and
    /// local - this never blocks on the network, only on the bounded
    /// in-process channel.
    pub async fn assign(&self, task_id: TaskId, generation: u64, description: String, success_criteria: Vec<String>) -> Result<()> {
        {
            let mut record = self.record.lock().await;
            if !matches!(record.fsm_state, AgentFsmState::Idle) {
                return Err(AgentComError::BusinessRuleRefusal(format!(
                    "agent {} is not idle",
                    record.agent_id
                )));
            }
            record.fsm_state = AgentFsmState::Assigned;
            record.current_task_id = Some(task_id);
            record.last_assigned_at = Some(chrono::Utc::now());
        }
        self.outbound
            .try_send(HubFrame::TaskAssign {
                task_id,
                generation,
                description,
                success_criteria,
            })
            .map_err(|e| AgentComError::TransientIo(std::io::Error::other(e.to_string())))?;
        Ok(())
    }

    pub async fn mark_working(&self) {
        self.record.lock().await.fsm_state = AgentFsmState::Working;
    }

    pub async fn mark_blocked(&self) {
        self.record.lock().await.fsm_state = AgentFsmState::Blocked;
    }

    /// Clears the current assignment and returns the agent to `Idle`,
    /// used on completion, failure, and reaper-driven reclaim.
    pub async fn release(&self) {
        let mut record = self.record.lock().await;
        record.fsm_state = AgentFsmState::Idle;
        record.current_task_id = None;
    }

    pub async fn mark_offline(&self) {
        let mut record = self.record.lock().await;
        record.fsm_state = AgentFsmState::Offline;
        record.current_task_id = None;
        debug!("agent {} marked offline", record.agent_id);
    }

    pub async fn cancel_current(&self, task_id: TaskId, generation: u64) -> Result<()> {
        self.outbound
            .try_send(HubFrame::TaskCancel { task_id, generation })
            .map_err(|e| AgentComError::TransientIo(std::io::Error::other(e.to_string())))?;
        Ok(())
    }

    pub async fn notify_rate_limited(&self, channel: String, retry_after_secs: u64) -> Result<()> {
        self.outbound
            .try_send(HubFrame::RateLimited {
                channel,
                retry_after_secs,
            })
            .map_err(|e| AgentComError::TransientIo(std::io::Error::other(e.to_string())))?;
        Ok(())
    }

    /// Sends a soft warning when a bucket crosses below 20% capacity,
    /// ahead of an outright deny.
    pub async fn notify_rate_warning(&self, channel: String, tokens_remaining: f64) -> Result<()> {
        self.outbound
            .try_send(HubFrame::RateLimitWarning {
                channel,
                tokens_remaining,
            })
            .map_err(|e| AgentComError::TransientIo(std::io::Error::other(e.to_string())))?;
        Ok(())
    }
}
