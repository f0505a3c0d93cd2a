//! Periodic maintenance sweep, same shape as the orchestrator's
//! `cleanup_loop`/`perform_cleanup`: a `tokio::spawn`ed loop on a fixed
//! interval running a handful of independent prune passes rather than
//! timer-per-concern.

use crate::agents::AgentRegistry;
use crate::constants::{DEFAULT_AGENT_HEARTBEAT_TIMEOUT_SECS, MAILBOX_MESSAGE_TTL_SECS};
use crate::models::TaskStatus;
use crate::queue::TaskQueue;
use crate::rate_limit::AgentRateLimiter;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Default, serde::Serialize)]
pub struct SweepReport {
    pub stale_agents_reclaimed: usize,
    pub stuck_assignments_reclaimed: usize,
    pub dormant_buckets_pruned: usize,
}

pub struct Reaper {
    queue: Arc<TaskQueue>,
    registry: Arc<AgentRegistry>,
    rate_limiter: Arc<AgentRateLimiter>,
}

impl Reaper {
    pub fn new(queue: Arc<TaskQueue>, registry: Arc<AgentRegistry>, rate_limiter: Arc<AgentRateLimiter>) -> Self {
        Self {
            queue,
            registry,
            rate_limiter,
        }
    }

    /// Runs one sweep: evicts agents with no heartbeat within the
    /// timeout window (reclaiming whatever task they held), reclaims
    /// assignments that were never accepted within the mailbox TTL, and
    /// prunes idle rate-limit buckets.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for agent in self.registry.stale(DEFAULT_AGENT_HEARTBEAT_TIMEOUT_SECS).await {
            let snapshot = agent.snapshot().await;
            if let Some(task_id) = snapshot.current_task_id {
                if let Err(e) = self.queue.reclaim(task_id).await {
                    warn!("reaper failed to reclaim task {}: {}", task_id, e);
                } else {
                    report.stale_agents_reclaimed += 1;
                }
            }
            agent.mark_offline().await;
            self.registry.unregister(&snapshot.agent_id).await;
            info!("reaper evicted stale agent {}", snapshot.agent_id);
        }

        let now = chrono::Utc::now();
        for task in self.queue.list().await {
            if !matches!(task.status, TaskStatus::Assigned) {
                continue;
            }
            let Some(assigned_at) = task.assigned_at else {
                continue;
            };
            if (now - assigned_at).num_seconds() as u64 > MAILBOX_MESSAGE_TTL_SECS {
                if let Err(e) = self.queue.reclaim(task.id).await {
                    warn!("reaper failed to reclaim stuck task {}: {}", task.id, e);
                } else {
                    report.stuck_assignments_reclaimed += 1;
                }
            }
        }

        report.dormant_buckets_pruned = self
            .rate_limiter
            .prune_dormant(MAILBOX_MESSAGE_TTL_SECS as i64);

        report
    }

    /// Runs `sweep` on `interval` forever. Intended to be driven by a
    /// single `tokio::spawn`ed task per hub instance.
    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let report = self.sweep().await;
            if report.stale_agents_reclaimed > 0 || report.stuck_assignments_reclaimed > 0 {
                info!("reaper sweep: {:?}", report);
            }
        }
    }
}
