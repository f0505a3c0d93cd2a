use agentcom::agents::AgentRegistry;
use agentcom::api::{ApiServer, AppState};
use agentcom::config::Config;
use agentcom::constants::{
    DEFAULT_BACKUP_INTERVAL_SECS, DEFAULT_BACKUP_RETENTION_COUNT, DEFAULT_HUB_TICK_SECS,
    DEFAULT_SCHEDULER_TICK_SECS,
};
use agentcom::cost_ledger::CostLedger;
use agentcom::event_bus::EventBus;
use agentcom::hub_fsm::HubFsm;
use agentcom::models::{BudgetInvocation, Goal, Task};
use agentcom::monitoring::{HealthAggregator, MonitoringConfig};
use agentcom::queue::{GoalBacklog, TaskQueue};
use agentcom::rate_limit::AgentRateLimiter;
use agentcom::reaper::Reaper;
use agentcom::scheduler::Scheduler;
use agentcom::security;
use agentcom::store::backup::BackupMaintainer;
use agentcom::store::Store;
use agentcom::validation::TaskContentValidator;

use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("starting agentcom hub");

    let mut config = Config::load()?;
    std::fs::create_dir_all(&config.store.data_dir)
        .with_context(|| format!("creating data dir {}", config.store.data_dir))?;

    let bearer_token = security::ensure_bearer_token_exists(config.api.bearer_token.as_deref())?;
    config.api.bearer_token = Some(bearer_token);

    let data_dir = Path::new(&config.store.data_dir);
    let task_store = Arc::new(Store::<Task>::open(data_dir.join("tasks.redb"))?);
    let goal_store = Arc::new(Store::<Goal>::open(data_dir.join("goals.redb"))?);
    let ledger_store = Arc::new(Store::<BudgetInvocation>::open(data_dir.join("cost_ledger.redb"))?);

    let queue = Arc::new(TaskQueue::new(task_store).await?);
    let goals = Arc::new(GoalBacklog::new(goal_store).await?);
    let registry = Arc::new(AgentRegistry::new());
    let rate_limiter = Arc::new(AgentRateLimiter::new());
    let cost_ledger = Arc::new(CostLedger::new(ledger_store));
    let event_bus = Arc::new(EventBus::new());
    let hub_fsm = Arc::new(HubFsm::new(event_bus.clone()));
    let health = Arc::new(HealthAggregator::new(MonitoringConfig::default()));
    let validator = Arc::new(TaskContentValidator::new()?);

    let scheduler = Scheduler::new(
        queue.clone(),
        registry.clone(),
        rate_limiter.clone(),
        event_bus.clone(),
    );

    let reaper = Arc::new(Reaper::new(queue.clone(), registry.clone(), rate_limiter.clone()));
    tokio::spawn(reaper.run(Duration::from_secs(config.reaper.interval_secs)));

    let backup_maintainer = Arc::new(BackupMaintainer::new(data_dir, DEFAULT_BACKUP_RETENTION_COUNT));
    let store_paths: Arc<Vec<(String, std::path::PathBuf)>> = Arc::new(vec![
        ("tasks".to_string(), data_dir.join("tasks.redb")),
        ("goals".to_string(), data_dir.join("goals.redb")),
        ("cost_ledger".to_string(), data_dir.join("cost_ledger.redb")),
    ]);
    tokio::spawn(run_backup_loop(
        backup_maintainer.clone(),
        store_paths.iter().map(|(_, p)| p.clone()).collect(),
        Duration::from_secs(DEFAULT_BACKUP_INTERVAL_SECS),
    ));

    let scheduler_loop = tokio::spawn(run_scheduler_loop(scheduler));
    let hub_tick_loop = tokio::spawn(run_hub_tick_loop(
        hub_fsm.clone(),
        health.clone(),
        queue.clone(),
        goals.clone(),
        registry.clone(),
        cost_ledger.clone(),
    ));

    let state = AppState {
        config,
        queue,
        goals,
        registry,
        hub_fsm,
        rate_limiter,
        cost_ledger,
        event_bus,
        health,
        validator,
        agent_tokens: Arc::new(dashmap::DashMap::new()),
        backup_maintainer,
        store_paths,
    };
    let api_server = ApiServer::new(state);

    tokio::select! {
        result = api_server.run() => {
            if let Err(e) = result {
                error!("API server failed: {}", e);
            }
        }
        result = scheduler_loop => {
            if let Err(e) = result {
                error!("scheduler loop panicked: {}", e);
            }
        }
        result = hub_tick_loop => {
            if let Err(e) = result {
                error!("hub tick loop panicked: {}", e);
            }
        }
    }

    Ok(())
}

/// Runs forever at `DEFAULT_SCHEDULER_TICK_SECS` cadence, matching ready
/// tasks to idle agents each pass.
async fn run_scheduler_loop(scheduler: Scheduler) {
    let mut interval = tokio::time::interval(Duration::from_secs(DEFAULT_SCHEDULER_TICK_SECS));
    loop {
        interval.tick().await;
        let assigned = scheduler.try_schedule_all().await;
        if assigned > 0 {
            info!("scheduler assigned {} task(s)", assigned);
        }
    }
}

/// Runs forever at `DEFAULT_BACKUP_INTERVAL_SECS` cadence, archiving
/// each configured store file. Archival is blocking (tar + gzip), so
/// each one runs on a blocking-pool thread rather than the tick loop.
async fn run_backup_loop(maintainer: Arc<BackupMaintainer>, paths: Vec<std::path::PathBuf>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        for path in &paths {
            let maintainer = maintainer.clone();
            let path = path.clone();
            let result = tokio::task::spawn_blocking(move || maintainer.backup(&path)).await;
            match result {
                Ok(Ok(archive)) => info!("periodic backup wrote {:?}", archive),
                Ok(Err(e)) => error!("periodic backup failed: {}", e),
                Err(e) => error!("periodic backup task panicked: {}", e),
            }
        }
    }
}

/// Runs forever at `DEFAULT_HUB_TICK_SECS` cadence, sampling system
/// health and feeding the resulting signal into the hub's state machine.
async fn run_hub_tick_loop(
    hub_fsm: Arc<HubFsm>,
    health: Arc<HealthAggregator>,
    queue: Arc<TaskQueue>,
    goals: Arc<GoalBacklog>,
    registry: Arc<AgentRegistry>,
    cost_ledger: Arc<CostLedger>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(DEFAULT_HUB_TICK_SECS));
    loop {
        interval.tick().await;
        let current_state = hub_fsm.state().await;
        let (_metrics, signal) = health.assess(&queue, &goals, &registry, &cost_ledger, current_state).await;

        match hub_fsm.tick(signal).await {
            Ok(Some(new_state)) => info!("hub transitioned to {:?}", new_state),
            Ok(None) => {}
            Err(e) => error!("hub tick failed: {}", e),
        }
    }
}
