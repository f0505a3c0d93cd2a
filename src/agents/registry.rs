use crate::agents::AgentFsm;
use crate::models::AgentId;
use crate::{AgentComError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Read-mostly directory of connected agents, keyed by the opaque
/// `AgentId` a sidecar presents on `identify` rather than a fixed
/// `AgentType` enum - any agent carrying the right capability set can
/// pick up any task.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<AgentId, Arc<AgentFsm>>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, agent_id: AgentId, fsm: Arc<AgentFsm>) {
        info!("agent {} registered", agent_id);
        self.agents.write().await.insert(agent_id, fsm);
    }

    pub async fn unregister(&self, agent_id: &str) -> Option<Arc<AgentFsm>> {
        let removed = self.agents.write().await.remove(agent_id);
        if removed.is_some() {
            info!("agent {} unregistered", agent_id);
        }
        removed
    }

    pub async fn get(&self, agent_id: &str) -> Option<Arc<AgentFsm>> {
        self.agents.read().await.get(agent_id).cloned()
    }

    pub async fn require(&self, agent_id: &str) -> Result<Arc<AgentFsm>> {
        self.get(agent_id)
            .await
            .ok_or_else(|| AgentComError::NotFound(format!("agent {agent_id} not registered")))
    }

    pub async fn all(&self) -> Vec<Arc<AgentFsm>> {
        self.agents.read().await.values().cloned().collect()
    }

    /// Idle agents whose capability set is a superset of `needed`,
    /// ordered least-recently-used first (LRU tie-break on `last_assigned_at`
    /// for the scheduler's matching pass - an agent never assigned sorts
    /// ahead of one that has, regardless of heartbeat recency).
    pub async fn idle_candidates(&self, needed: &std::collections::HashSet<String>) -> Vec<Arc<AgentFsm>> {
        let agents = self.agents.read().await;
        let mut candidates = Vec::new();
        for fsm in agents.values() {
            if !fsm.is_idle().await {
                continue;
            }
            let caps = fsm.capabilities().await;
            if needed.is_subset(&caps) {
                candidates.push(fsm.clone());
            }
        }

        let mut with_lru = Vec::with_capacity(candidates.len());
        for fsm in candidates {
            let last_assigned_at = fsm.snapshot().await.last_assigned_at;
            with_lru.push((last_assigned_at, fsm));
        }
        with_lru.sort_by_key(|(last_assigned_at, _)| *last_assigned_at);
        with_lru.into_iter().map(|(_, fsm)| fsm).collect()
    }

    pub async fn stale(&self, timeout_secs: u64) -> Vec<Arc<AgentFsm>> {
        let agents = self.agents.read().await;
        let mut stale = Vec::new();
        for fsm in agents.values() {
            if fsm.is_stale(timeout_secs).await {
                stale.push(fsm.clone());
            }
        }
        stale
    }

    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AgentRecord;
    use std::collections::HashSet;
    use tokio::sync::mpsc;

    fn make_fsm(agent_id: &str, caps: &[&str]) -> Arc<AgentFsm> {
        let (tx, _rx) = mpsc::channel(8);
        let record = AgentRecord::new(
            agent_id.to_string(),
            agent_id.to_string(),
            caps.iter().map(|c| c.to_string()).collect(),
        );
        Arc::new(AgentFsm::new(record, tx))
    }

    #[tokio::test]
    async fn test_idle_candidates_filters_by_capability_superset() {
        let registry = AgentRegistry::new();
        registry
            .register("a".to_string(), make_fsm("a", &["rust"]))
            .await;
        registry
            .register("b".to_string(), make_fsm("b", &["rust", "docs"]))
            .await;

        let needed: HashSet<String> = ["rust", "docs"].iter().map(|s| s.to_string()).collect();
        let candidates = registry.idle_candidates(&needed).await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].agent_id().await, "b");
    }

    #[tokio::test]
    async fn test_unregister_removes_agent() {
        let registry = AgentRegistry::new();
        registry
            .register("a".to_string(), make_fsm("a", &[]))
            .await;
        assert_eq!(registry.len().await, 1);
        registry.unregister("a").await;
        assert!(registry.is_empty().await);
    }
}
