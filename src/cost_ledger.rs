//! Hourly rolling-window invocation budget, gating how often the hub is
//! allowed to spend LLM calls while in a costly `HubState`.
//!
//! Same lock-free discipline as `rate_limit::AgentRateLimiter`:
//! `CheckBudget` only ever touches the in-memory `DashMap` counter.
//! `RecordInvocation` is the sole operation allowed to block on disk,
//! appending to a durable journal table so the ledger survives a
//! restart mid-hour.

use crate::constants::{
    DEFAULT_BUDGET_CONTEMPLATING_PER_HOUR, DEFAULT_BUDGET_EXECUTING_PER_HOUR,
    DEFAULT_BUDGET_IMPROVING_PER_HOUR,
};
use crate::models::{AgentId, BudgetInvocation, HubState};
use crate::store::Store;
use crate::{AgentComError, Result};
use dashmap::DashMap;
use std::sync::Arc;

fn default_budget_for(state: HubState) -> u32 {
    match state {
        HubState::Executing => DEFAULT_BUDGET_EXECUTING_PER_HOUR,
        HubState::Improving => DEFAULT_BUDGET_IMPROVING_PER_HOUR,
        HubState::Contemplating => DEFAULT_BUDGET_CONTEMPLATING_PER_HOUR,
        HubState::Resting | HubState::Healing => 0,
    }
}

struct Window {
    hour_start: chrono::DateTime<chrono::Utc>,
    count: u32,
}

#[derive(Clone, serde::Serialize)]
pub struct BudgetStats {
    pub hub_state: String,
    pub used: u32,
    pub limit: u32,
    pub window_started_at: chrono::DateTime<chrono::Utc>,
}

pub struct CostLedger {
    windows: DashMap<String, Window>,
    journal: Arc<Store<BudgetInvocation>>,
}

impl CostLedger {
    pub fn new(journal: Arc<Store<BudgetInvocation>>) -> Self {
        Self {
            windows: DashMap::new(),
            journal,
        }
    }

    fn hour_key(state: HubState) -> String {
        format!("{state:?}")
    }

    /// Returns `Ok(())` if another invocation may be made in `state`
    /// right now, rolling the window over if the hour has turned.
    pub fn check_budget(&self, state: HubState) -> Result<()> {
        let limit = default_budget_for(state);
        let now = chrono::Utc::now();
        let key = Self::hour_key(state);
        let mut window = self.windows.entry(key).or_insert_with(|| Window {
            hour_start: now,
            count: 0,
        });

        if (now - window.hour_start).num_seconds() >= 3600 {
            window.hour_start = now;
            window.count = 0;
        }

        if window.count >= limit {
            return Err(AgentComError::BudgetExhausted(format!(
                "{state:?} budget of {limit}/hour exhausted"
            )));
        }
        Ok(())
    }

    /// Records a spent invocation: increments the in-memory window and
    /// appends a durable journal entry. Must be preceded by a successful
    /// `check_budget` call for the same state.
    pub async fn record_invocation(&self, state: HubState, agent_id: Option<AgentId>) -> Result<()> {
        let key = Self::hour_key(state);
        {
            let mut window = self.windows.entry(key).or_insert_with(|| Window {
                hour_start: chrono::Utc::now(),
                count: 0,
            });
            window.count += 1;
        }

        let record = BudgetInvocation {
            hub_state: format!("{state:?}"),
            agent_id,
            occurred_at: chrono::Utc::now(),
        };
        let journal_key = format!("{}-{}", record.hub_state, uuid::Uuid::new_v4());
        self.journal.insert(&journal_key, &record).await
    }

    pub fn stats(&self, state: HubState) -> BudgetStats {
        let key = Self::hour_key(state);
        let limit = default_budget_for(state);
        match self.windows.get(&key) {
            Some(window) => BudgetStats {
                hub_state: key,
                used: window.count,
                limit,
                window_started_at: window.hour_start,
            },
            None => BudgetStats {
                hub_state: key,
                used: 0,
                limit,
                window_started_at: chrono::Utc::now(),
            },
        }
    }

    pub async fn history(&self) -> Result<Vec<BudgetInvocation>> {
        self.journal.all().await
    }

    pub async fn compact(&self) -> Result<()> {
        self.journal.compact().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn make_ledger() -> CostLedger {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("cost_ledger.redb")).unwrap());
        CostLedger::new(store)
    }

    #[tokio::test]
    async fn test_budget_exhausts_then_refuses() {
        let ledger = make_ledger().await;
        for _ in 0..DEFAULT_BUDGET_CONTEMPLATING_PER_HOUR {
            ledger.check_budget(HubState::Contemplating).unwrap();
            ledger
                .record_invocation(HubState::Contemplating, None)
                .await
                .unwrap();
        }
        assert!(ledger.check_budget(HubState::Contemplating).is_err());
    }

    #[tokio::test]
    async fn test_resting_state_has_zero_budget() {
        let ledger = make_ledger().await;
        assert!(ledger.check_budget(HubState::Resting).is_err());
    }

    #[tokio::test]
    async fn test_history_persists_recorded_invocations() {
        let ledger = make_ledger().await;
        ledger.check_budget(HubState::Executing).unwrap();
        ledger
            .record_invocation(HubState::Executing, Some("agent-1".to_string()))
            .await
            .unwrap();

        let history = ledger.history().await.unwrap();
        assert_eq!(history.len(), 1);
    }
}
