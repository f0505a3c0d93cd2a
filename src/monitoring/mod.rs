//! System health aggregation: a `SystemMetrics` read-model exposed at
//! `GET /api/metrics`, and a small alert rule evaluator behind
//! `GET /api/alerts`.
//!
//! Grounded in the teacher's `SystemMonitor`/`HealthStatus`/`ResourceMetrics`
//! (four-level health scale, a `ResourceMetrics` shape pairing a current
//! reading with warning/critical thresholds), retargeted from CPU/memory/
//! disk sampling to the orchestration metrics this hub actually has:
//! dead-letter growth and budget utilization. `HealthAggregator::assess`
//! is the `HealthAggregator.Assess()` operation that feeds `HubFsm::tick`'s
//! critical-health signal.

use crate::cost_ledger::CostLedger;
use crate::hub_fsm::HealthSignal;
use crate::models::HubState;
use crate::queue::{GoalBacklog, TaskQueue};
use crate::agents::AgentRegistry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceMetrics {
    pub current: f64,
    pub threshold_warning: f64,
    pub threshold_critical: f64,
    pub status: HealthStatus,
}

impl ResourceMetrics {
    fn sample(current: f64, threshold_warning: f64, threshold_critical: f64) -> Self {
        let status = if current >= threshold_critical {
            HealthStatus::Critical
        } else if current >= threshold_warning {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        Self {
            current,
            threshold_warning,
            threshold_critical,
            status,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    pub dead_letter_warning_ratio: f64,
    pub dead_letter_critical_ratio: f64,
    pub budget_warning_ratio: f64,
    pub budget_critical_ratio: f64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            dead_letter_warning_ratio: 0.1,
            dead_letter_critical_ratio: 0.3,
            budget_warning_ratio: 0.8,
            budget_critical_ratio: 0.95,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub uptime_seconds: u64,
    pub health_status: HealthStatus,
    pub hub_state: String,

    pub queued_tasks: usize,
    pub working_tasks: usize,
    pub dead_letter_tasks: ResourceMetrics,

    pub goals_in_flight: usize,

    pub connected_agents: usize,

    pub budget_utilization: ResourceMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub rule: String,
    pub message: String,
    pub triggered_at: chrono::DateTime<chrono::Utc>,
    pub acknowledged: bool,
}

pub struct HealthAggregator {
    config: MonitoringConfig,
    start_time: Instant,
    current: RwLock<Option<SystemMetrics>>,
    alerts: RwLock<Vec<Alert>>,
}

impl HealthAggregator {
    pub fn new(config: MonitoringConfig) -> Self {
        Self {
            config,
            start_time: Instant::now(),
            current: RwLock::new(None),
            alerts: RwLock::new(Vec::new()),
        }
    }

    /// Samples the queue, goal backlog, agent registry, and cost ledger,
    /// derives an overall `HealthStatus`, raises alerts for any rule
    /// crossing warning/critical, and returns the `HealthSignal`
    /// `HubFsm::tick` should evaluate against.
    pub async fn assess(
        &self,
        queue: &TaskQueue,
        goals: &GoalBacklog,
        registry: &AgentRegistry,
        cost_ledger: &CostLedger,
        hub_state: HubState,
    ) -> (SystemMetrics, HealthSignal) {
        let stats = queue.stats().await;
        let total_tasks = stats.queued
            + stats.assigned
            + stats.working
            + stats.completed
            + stats.failed
            + stats.dead_letter
            + stats.cancelled;
        let dead_letter_ratio = if total_tasks == 0 {
            0.0
        } else {
            stats.dead_letter as f64 / total_tasks as f64
        };
        let dead_letter_tasks = ResourceMetrics::sample(
            dead_letter_ratio,
            self.config.dead_letter_warning_ratio,
            self.config.dead_letter_critical_ratio,
        );

        let budget = cost_ledger.stats(hub_state);
        let budget_ratio = if budget.limit == 0 {
            0.0
        } else {
            budget.used as f64 / budget.limit as f64
        };
        let budget_utilization = ResourceMetrics::sample(
            budget_ratio,
            self.config.budget_warning_ratio,
            self.config.budget_critical_ratio,
        );

        let health_status = [dead_letter_tasks.status, budget_utilization.status]
            .into_iter()
            .max_by_key(|s| match s {
                HealthStatus::Healthy => 0,
                HealthStatus::Degraded => 1,
                HealthStatus::Unhealthy => 2,
                HealthStatus::Critical => 3,
            })
            .unwrap_or(HealthStatus::Healthy);

        let goal_stats = goals.stats().await;

        let metrics = SystemMetrics {
            timestamp: chrono::Utc::now(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            health_status,
            hub_state: format!("{hub_state:?}"),
            queued_tasks: stats.queued,
            working_tasks: stats.working,
            dead_letter_tasks,
            goals_in_flight: goal_stats.decomposing + goal_stats.executing + goal_stats.verifying,
            connected_agents: registry.len().await,
            budget_utilization,
        };

        self.raise_alerts(&metrics).await;
        *self.current.write().await = Some(metrics.clone());

        let signal = HealthSignal {
            critical: matches!(health_status, HealthStatus::Critical),
            recovered: matches!(health_status, HealthStatus::Healthy),
        };
        (metrics, signal)
    }

    async fn raise_alerts(&self, metrics: &SystemMetrics) {
        let mut alerts = self.alerts.write().await;
        if matches!(
            metrics.dead_letter_tasks.status,
            HealthStatus::Unhealthy | HealthStatus::Critical
        ) {
            alerts.push(Alert {
                rule: "dead_letter_growth".to_string(),
                message: format!(
                    "dead letter ratio {:.2} exceeds threshold",
                    metrics.dead_letter_tasks.current
                ),
                triggered_at: chrono::Utc::now(),
                acknowledged: false,
            });
        }
        if matches!(
            metrics.budget_utilization.status,
            HealthStatus::Unhealthy | HealthStatus::Critical
        ) {
            alerts.push(Alert {
                rule: "budget_near_exhaustion".to_string(),
                message: format!(
                    "budget utilization {:.2} exceeds threshold",
                    metrics.budget_utilization.current
                ),
                triggered_at: chrono::Utc::now(),
                acknowledged: false,
            });
        }
    }

    pub async fn record_watchdog_forced_transition(&self) {
        self.alerts.write().await.push(Alert {
            rule: "watchdog_forced_transition".to_string(),
            message: "hub fsm watchdog forced a return to resting".to_string(),
            triggered_at: chrono::Utc::now(),
            acknowledged: false,
        });
    }

    pub async fn latest(&self) -> Option<SystemMetrics> {
        self.current.read().await.clone()
    }

    pub async fn alerts(&self) -> Vec<Alert> {
        self.alerts.read().await.clone()
    }

    pub async fn acknowledge(&self, rule: &str) -> usize {
        let mut alerts = self.alerts.write().await;
        let mut count = 0;
        for alert in alerts.iter_mut() {
            if alert.rule == rule && !alert.acknowledged {
                alert.acknowledged = true;
                count += 1;
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BudgetInvocation;
    use crate::store::Store;

    async fn make_aggregator() -> (
        HealthAggregator,
        Arc<TaskQueue>,
        Arc<GoalBacklog>,
        Arc<AgentRegistry>,
        Arc<CostLedger>,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let task_store = Arc::new(Store::open(dir.path().join("tasks.redb")).unwrap());
        let goal_store = Arc::new(Store::open(dir.path().join("goals.redb")).unwrap());
        let ledger_store: Arc<Store<BudgetInvocation>> =
            Arc::new(Store::open(dir.path().join("ledger.redb")).unwrap());
        let queue = Arc::new(TaskQueue::new(task_store).await.unwrap());
        let goals = Arc::new(GoalBacklog::new(goal_store).await.unwrap());
        let registry = Arc::new(AgentRegistry::new());
        let ledger = Arc::new(CostLedger::new(ledger_store));
        (
            HealthAggregator::new(MonitoringConfig::default()),
            queue,
            goals,
            registry,
            ledger,
        )
    }

    #[tokio::test]
    async fn test_assess_reports_healthy_with_no_tasks() {
        let (aggregator, queue, goals, registry, ledger) = make_aggregator().await;
        let (metrics, signal) = aggregator
            .assess(&queue, &goals, &registry, &ledger, HubState::Resting)
            .await;
        assert_eq!(metrics.health_status, HealthStatus::Healthy);
        assert!(!signal.critical);
    }

    #[tokio::test]
    async fn test_assess_raises_alert_on_high_dead_letter_ratio() {
        use crate::models::{Priority, Task};

        let (aggregator, queue, goals, registry, ledger) = make_aggregator().await;
        for _ in 0..4 {
            let mut task = Task::new("flaky".to_string(), Priority::Normal);
            task.max_retries = 0;
            let id = queue.submit(task).await.unwrap();
            let gen = queue.assign(id, &"a".to_string()).await.unwrap();
            queue
                .fail(id, &"a".to_string(), gen, "boom".to_string())
                .await
                .unwrap();
        }

        let (metrics, signal) = aggregator
            .assess(&queue, &goals, &registry, &ledger, HubState::Executing)
            .await;
        assert_eq!(metrics.health_status, HealthStatus::Critical);
        assert!(signal.critical);

        let alerts = aggregator.alerts().await;
        assert!(alerts.iter().any(|a| a.rule == "dead_letter_growth"));
    }

    #[tokio::test]
    async fn test_acknowledge_marks_alert() {
        use crate::models::{Priority, Task};

        let (aggregator, queue, goals, registry, ledger) = make_aggregator().await;
        let mut task = Task::new("flaky".to_string(), Priority::Normal);
        task.max_retries = 0;
        let id = queue.submit(task).await.unwrap();
        let gen = queue.assign(id, &"a".to_string()).await.unwrap();
        queue.fail(id, &"a".to_string(), gen, "boom".to_string()).await.unwrap();

        aggregator
            .assess(&queue, &goals, &registry, &ledger, HubState::Executing)
            .await;
        let acked = aggregator.acknowledge("dead_letter_growth").await;
        assert_eq!(acked, 1);
    }
}
