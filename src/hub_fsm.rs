//! The hub-wide state machine tracking overall system posture.
//!
//! Grounded in `CircuitBreaker`'s shape - an `RwLock`-guarded state plus
//! a logged, timed transition step - generalized from 3 states to 5 and
//! split into a pure `evaluate` function (decides *whether* to move) and
//! a `transition` commit step (decides *what happens* when it does:
//! history append, event publish, watchdog rearm). Only the `healing`
//! state is entered and exited automatically; `improving` and
//! `contemplating` are reachable only via `force_transition` (see
//! DESIGN.md).

use crate::constants::{DEFAULT_HUB_WATCHDOG_SECS, MAX_HUB_HISTORY_ENTRIES};
use crate::event_bus::{Event, EventBus, Topic};
use crate::models::{History, HubFsmTransition, HubState};
use crate::{AgentComError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Extension point for automatic remediation actions taken while
/// `healing`. No variants yet - see DESIGN.md Open Question 3.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum RemediationAction {}

#[derive(Debug, Clone, Copy, Default)]
pub struct HealthSignal {
    pub critical: bool,
    pub recovered: bool,
}

fn valid_transition(from: HubState, to: HubState) -> bool {
    use HubState::*;
    matches!(
        (from, to),
        (Resting, Executing)
            | (Executing, Resting)
            | (Executing, Healing)
            | (Executing, Improving)
            | (Executing, Contemplating)
            | (Healing, Resting)
            | (Healing, Executing)
            | (Improving, Resting)
            | (Improving, Executing)
            | (Contemplating, Resting)
            | (Contemplating, Executing)
    )
}

/// Pure decision function: given the current state and the latest
/// health signal, what (if anything) should the state move to. No side
/// effects - callers decide separately whether to commit the result.
pub fn evaluate(current: HubState, signal: HealthSignal, watchdog_expired: bool) -> Option<HubState> {
    if watchdog_expired && current != HubState::Resting {
        return Some(HubState::Resting);
    }
    match current {
        HubState::Executing if signal.critical => Some(HubState::Healing),
        HubState::Healing if signal.recovered => Some(HubState::Resting),
        _ => None,
    }
}

struct Inner {
    state: HubState,
    entered_at: chrono::DateTime<chrono::Utc>,
    history: History<HubFsmTransition>,
}

pub struct HubFsm {
    inner: RwLock<Inner>,
    event_bus: Arc<EventBus>,
    paused: AtomicBool,
}

impl HubFsm {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                state: HubState::Resting,
                entered_at: chrono::Utc::now(),
                history: History::new(MAX_HUB_HISTORY_ENTRIES),
            }),
            event_bus,
            paused: AtomicBool::new(false),
        }
    }

    pub async fn state(&self) -> HubState {
        self.inner.read().await.state
    }

    pub async fn is_watchdog_expired(&self) -> bool {
        let inner = self.inner.read().await;
        inner.state != HubState::Resting
            && (chrono::Utc::now() - inner.entered_at).num_seconds() >= DEFAULT_HUB_WATCHDOG_SECS as i64
    }

    /// Cancels the watchdog for the purposes of `tick`: the next and
    /// every subsequent `tick` call is a no-op until `resume`.
    /// `force_transition` is unaffected - pausing only freezes the
    /// automatic evaluate/commit path, not operator overrides.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("hub fsm paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!("hub fsm resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Runs `evaluate` against the current state and commits the result
    /// if it proposes a move. Intended to be called on a periodic tick
    /// and whenever `HealthAggregator` reports a status change. A no-op
    /// while paused.
    pub async fn tick(&self, signal: HealthSignal) -> Result<Option<HubState>> {
        if self.is_paused() {
            return Ok(None);
        }
        let watchdog_expired = self.is_watchdog_expired().await;
        let current = self.state().await;
        match evaluate(current, signal, watchdog_expired) {
            Some(next) => {
                let reason = if watchdog_expired {
                    "watchdog expired".to_string()
                } else {
                    format!("health signal: {signal:?}")
                };
                self.transition(next, reason).await?;
                Ok(Some(next))
            }
            None => Ok(None),
        }
    }

    /// Operator- or webhook-driven transition, bypassing `evaluate` but
    /// still constrained to the valid-transition graph.
    pub async fn force_transition(&self, to: HubState, reason: String) -> Result<()> {
        self.transition(to, reason).await
    }

    async fn transition(&self, to: HubState, reason: String) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !valid_transition(inner.state, to) {
            return Err(AgentComError::BusinessRuleRefusal(format!(
                "invalid hub transition {:?} -> {:?}",
                inner.state, to
            )));
        }
        let from = inner.state;
        let now = chrono::Utc::now();
        inner.state = to;
        inner.entered_at = now;
        inner.history.push(HubFsmTransition {
            at: now,
            from,
            to,
            reason: reason.clone(),
        });
        info!("hub fsm {:?} -> {:?} ({})", from, to, reason);
        drop(inner);

        self.event_bus
            .publish(Event::new(
                Topic::HubFsm,
                "transition",
                serde_json::json!({ "from": format!("{from:?}"), "to": format!("{to:?}"), "reason": reason }),
            ))
            .await;
        Ok(())
    }

    pub async fn history(&self) -> Vec<HubFsmTransition> {
        self.inner.read().await.history.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluate_enters_healing_on_critical_signal() {
        let next = evaluate(
            HubState::Executing,
            HealthSignal { critical: true, recovered: false },
            false,
        );
        assert_eq!(next, Some(HubState::Healing));
    }

    #[test]
    fn test_evaluate_never_proposes_improving_spontaneously() {
        let next = evaluate(HubState::Executing, HealthSignal::default(), false);
        assert_eq!(next, None);
    }

    #[test]
    fn test_watchdog_forces_resting() {
        let next = evaluate(HubState::Improving, HealthSignal::default(), true);
        assert_eq!(next, Some(HubState::Resting));
    }

    #[tokio::test]
    async fn test_force_transition_rejects_invalid_edge() {
        let fsm = HubFsm::new(Arc::new(EventBus::new()));
        let result = fsm.force_transition(HubState::Healing, "bad".to_string()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_force_transition_to_improving_then_back() {
        let fsm = HubFsm::new(Arc::new(EventBus::new()));
        fsm.force_transition(HubState::Executing, "start".to_string())
            .await
            .unwrap();
        fsm.force_transition(HubState::Improving, "webhook".to_string())
            .await
            .unwrap();
        assert_eq!(fsm.state().await, HubState::Improving);

        fsm.force_transition(HubState::Resting, "done".to_string())
            .await
            .unwrap();
        assert_eq!(fsm.state().await, HubState::Resting);
        assert_eq!(fsm.history().await.len(), 3);
    }

    #[tokio::test]
    async fn test_tick_commits_healing_on_critical_health() {
        let fsm = HubFsm::new(Arc::new(EventBus::new()));
        fsm.force_transition(HubState::Executing, "start".to_string())
            .await
            .unwrap();

        let moved = fsm
            .tick(HealthSignal { critical: true, recovered: false })
            .await
            .unwrap();
        assert_eq!(moved, Some(HubState::Healing));
    }

    #[tokio::test]
    async fn test_paused_tick_is_a_noop() {
        let fsm = HubFsm::new(Arc::new(EventBus::new()));
        fsm.force_transition(HubState::Executing, "start".to_string())
            .await
            .unwrap();

        fsm.pause();
        assert!(fsm.is_paused());

        let moved = fsm
            .tick(HealthSignal { critical: true, recovered: false })
            .await
            .unwrap();
        assert_eq!(moved, None);
        assert_eq!(fsm.state().await, HubState::Executing);

        fsm.resume();
        assert!(!fsm.is_paused());
        let moved = fsm
            .tick(HealthSignal { critical: true, recovered: false })
            .await
            .unwrap();
        assert_eq!(moved, Some(HubState::Healing));
    }
}
