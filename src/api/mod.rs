pub mod dto;

use crate::agents::{AgentFsm, AgentRegistry};
use crate::auth::{auth_middleware, create_auth_state};
use crate::config::Config;
use crate::cost_ledger::CostLedger;
use crate::event_bus::EventBus;
use crate::hub_fsm::HubFsm;
use crate::models::{AgentRecord, Goal, GoalId, HubState, Priority, Task, TaskId};
use crate::monitoring::HealthAggregator;
use crate::queue::{GoalBacklog, TaskQueue};
use crate::rate_limit::{rate_limit_middleware, AgentRateLimiter, HttpRateLimitConfig, RateOverride};
use crate::security;
use crate::store::backup::BackupMaintainer;
use crate::validation::TaskContentValidator;
use crate::webhook;
use crate::ws::{AgentFrame, HubFrame};
use crate::{AgentComError, Result};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use dashmap::DashMap;
use dto::*;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

const SERVICE_NAME: &str = "agentcom";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything a handler needs, cloned cheaply per request (every field
/// is an `Arc` or small config struct).
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub queue: Arc<TaskQueue>,
    pub goals: Arc<GoalBacklog>,
    pub registry: Arc<AgentRegistry>,
    pub hub_fsm: Arc<HubFsm>,
    pub rate_limiter: Arc<AgentRateLimiter>,
    pub cost_ledger: Arc<CostLedger>,
    pub event_bus: Arc<EventBus>,
    pub health: Arc<HealthAggregator>,
    pub validator: Arc<TaskContentValidator>,
    /// agent_id -> onboarding token, populated by `onboard_register` and
    /// checked against the token an agent presents in `AgentFrame::Identify`.
    pub agent_tokens: Arc<DashMap<String, String>>,
    pub backup_maintainer: Arc<BackupMaintainer>,
    /// Table name -> store file path, for the admin backup/compact/restore
    /// surface. Compaction and live queries still go through `TaskQueue`/
    /// `GoalBacklog`/`CostLedger`; this list only drives file-level backup
    /// and restore, which `BackupMaintainer` operates on directly.
    pub store_paths: Arc<Vec<(String, std::path::PathBuf)>>,
}

pub struct ApiServer {
    state: AppState,
}

impl ApiServer {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub async fn run(&self) -> Result<()> {
        let app = self.build_router();
        let addr = format!("{}:{}", self.state.config.api.host, self.state.config.api.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(AgentComError::TransientIo)?;

        info!("API server listening on {}", addr);
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .await
        .map_err(AgentComError::TransientIo)?;
        Ok(())
    }

    /// Layering order matches the teacher's: rate limit, then auth,
    /// then trace, then CORS, then routes.
    pub fn build_router(&self) -> Router {
        let auth_state = create_auth_state(self.state.config.api.clone());
        let http_rate_limit = HttpRateLimitConfig::new();

        let cors_layer = CorsLayer::new()
            .allow_origin(
                self.state
                    .config
                    .api
                    .allowed_origins
                    .iter()
                    .filter_map(|origin| origin.parse().ok())
                    .collect::<Vec<_>>(),
            )
            .allow_methods([
                axum::http::Method::GET,
                axum::http::Method::POST,
                axum::http::Method::PUT,
                axum::http::Method::PATCH,
                axum::http::Method::DELETE,
            ])
            .allow_headers([
                axum::http::header::CONTENT_TYPE,
                axum::http::header::AUTHORIZATION,
                axum::http::HeaderName::from_static("x-api-key"),
            ])
            .max_age(std::time::Duration::from_secs(3600));

        Router::new()
            .route("/health", get(health_check))
            .route("/api/tasks", post(create_task).get(list_tasks))
            .route("/api/tasks/{task_id}", get(get_task))
            .route("/api/tasks/{task_id}/cancel", post(cancel_task))
            .route("/api/tasks/{task_id}/retry", post(retry_task))
            .route("/api/goals", post(create_goal).get(list_goals))
            .route("/api/goals/{goal_id}", get(get_goal))
            .route("/api/goals/{goal_id}/transition", axum::routing::patch(transition_goal))
            .route("/api/hub", get(get_hub_status))
            .route("/api/hub/force-transition", post(force_hub_transition))
            .route("/api/hub/pause", post(pause_hub))
            .route("/api/hub/resume", post(resume_hub))
            .route("/api/hub/history", get(get_hub_history))
            .route("/api/metrics", get(get_metrics))
            .route("/api/alerts", get(list_alerts))
            .route("/api/alerts/{rule}/acknowledge", post(acknowledge_alert))
            .route("/api/onboard/register", post(onboard_register))
            .route("/api/webhooks/github", post(github_webhook))
            .route(
                "/api/admin/rate-limits",
                get(system_rate_summary),
            )
            .route(
                "/api/admin/rate-limits/{agent_id}",
                get(agent_rate_status).put(set_rate_override).delete(remove_rate_override),
            )
            .route(
                "/api/admin/whitelist",
                put(replace_whitelist),
            )
            .route(
                "/api/admin/whitelist/{agent_id}",
                post(add_whitelist).delete(remove_whitelist),
            )
            .route("/api/admin/backup", post(trigger_backup))
            .route("/api/admin/compact/{table}", post(compact_table))
            .route("/api/admin/restore/{table}", post(restore_table))
            .route("/ws", get(ws_upgrade))
            .layer(
                ServiceBuilder::new()
                    .layer(middleware::from_fn_with_state(http_rate_limit, rate_limit_middleware))
                    .layer(middleware::from_fn_with_state(auth_state, auth_middleware))
                    .layer(TraceLayer::new_for_http())
                    .layer(cors_layer),
            )
            .with_state(self.state.clone())
    }
}

fn error_response(status: StatusCode, err: AgentComError) -> Response {
    (status, Json(ErrorResponse { error: err.to_string() })).into_response()
}

fn status_for(err: &AgentComError) -> StatusCode {
    match err {
        AgentComError::Validation(_) => StatusCode::BAD_REQUEST,
        AgentComError::Auth(_) => StatusCode::UNAUTHORIZED,
        AgentComError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        AgentComError::BudgetExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
        AgentComError::BusinessRuleRefusal(_) => StatusCode::CONFLICT,
        AgentComError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "service": SERVICE_NAME, "version": SERVICE_VERSION, "status": "ok" }))
}

async fn create_task(
    State(state): State<AppState>,
    Json(req): Json<CreateTaskRequest>,
) -> std::result::Result<Json<TaskResponse>, Response> {
    let description = state
        .validator
        .validate_and_sanitize_task_content(&req.description)
        .map_err(|e| error_response(status_for(&e), e))?;

    let mut task = Task::new(description, req.priority);
    task.needed_capabilities = req.needed_capabilities;
    task.depends_on = req.depends_on;
    task.success_criteria = req
        .success_criteria
        .iter()
        .map(|s| state.validator.validate_and_sanitize_task_content(s))
        .collect::<Result<Vec<_>>>()
        .map_err(|e| error_response(status_for(&e), e))?;

    let id = state
        .queue
        .submit(task)
        .await
        .map_err(|e| error_response(status_for(&e), e))?;
    let task = state.queue.get(id).await.expect("just submitted");
    Ok(Json(task.into()))
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(filter): Query<TaskListQuery>,
) -> Json<Vec<TaskResponse>> {
    let tasks = state.queue.list().await.into_iter().filter(|t| {
        filter.status.map(|s| s == t.status).unwrap_or(true)
            && filter.priority.map(|p| p == t.priority).unwrap_or(true)
            && filter
                .assigned_to
                .as_ref()
                .map(|a| t.assigned_to.as_ref() == Some(a))
                .unwrap_or(true)
            && filter.goal_id.map(|g| t.goal_id == Some(g)).unwrap_or(true)
    });
    Json(tasks.map(Into::into).collect())
}

async fn get_task(State(state): State<AppState>, Path(task_id): Path<TaskId>) -> std::result::Result<Json<TaskResponse>, Response> {
    state
        .queue
        .get(task_id)
        .await
        .map(|t| Json(t.into()))
        .ok_or_else(|| {
            let e = AgentComError::NotFound(format!("task {task_id} not found"));
            error_response(status_for(&e), e)
        })
}

async fn cancel_task(State(state): State<AppState>, Path(task_id): Path<TaskId>) -> std::result::Result<StatusCode, Response> {
    let task = state
        .queue
        .get(task_id)
        .await
        .ok_or_else(|| AgentComError::NotFound(format!("task {task_id} not found")))
        .map_err(|e| error_response(status_for(&e), e))?;
    let assignee = task.assigned_to.clone();
    let generation = task.generation;

    state
        .queue
        .cancel(task_id)
        .await
        .map_err(|e| error_response(status_for(&e), e))?;

    if let Some(agent_id) = assignee {
        if let Some(agent) = state.registry.get(&agent_id).await {
            if let Err(e) = agent.cancel_current(task_id, generation).await {
                warn!("failed to notify agent {} of task cancellation: {}", agent_id, e);
            }
        }
    }

    Ok(StatusCode::NO_CONTENT)
}

async fn retry_task(State(state): State<AppState>, Path(task_id): Path<TaskId>) -> std::result::Result<StatusCode, Response> {
    state
        .queue
        .retry(task_id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(|e| error_response(status_for(&e), e))
}

async fn create_goal(
    State(state): State<AppState>,
    Json(req): Json<CreateGoalRequest>,
) -> std::result::Result<Json<GoalResponse>, Response> {
    let description = state
        .validator
        .validate_and_sanitize_task_content(&req.description)
        .map_err(|e| error_response(status_for(&e), e))?;
    let success_criteria = state
        .validator
        .validate_success_criteria(&req.success_criteria)
        .map_err(|e| error_response(status_for(&e), e))?;

    let goal = Goal::new(description, success_criteria, req.priority, req.source);
    let id = state
        .goals
        .submit(goal)
        .await
        .map_err(|e| error_response(status_for(&e), e))?;
    let goal = state.goals.get(id).await.expect("just submitted");
    Ok(Json(goal_response(goal)))
}

async fn list_goals(State(state): State<AppState>) -> Json<Vec<GoalResponse>> {
    Json(state.goals.list().await.into_iter().map(goal_response).collect())
}

async fn get_goal(State(state): State<AppState>, Path(goal_id): Path<GoalId>) -> std::result::Result<Json<GoalResponse>, Response> {
    state
        .goals
        .get(goal_id)
        .await
        .map(|g| Json(goal_response(g)))
        .ok_or_else(|| {
            let e = AgentComError::NotFound(format!("goal {goal_id} not found"));
            error_response(status_for(&e), e)
        })
}

async fn transition_goal(
    State(state): State<AppState>,
    Path(goal_id): Path<GoalId>,
    Json(req): Json<GoalTransitionRequest>,
) -> std::result::Result<StatusCode, Response> {
    state
        .goals
        .transition(goal_id, req.to, req.note)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(|e| error_response(status_for(&e), e))
}

fn goal_response(g: Goal) -> GoalResponse {
    GoalResponse {
        id: g.id,
        description: g.description,
        status: g.status,
        child_task_ids: g.child_task_ids,
        created_at: g.created_at,
    }
}

async fn get_hub_status(State(state): State<AppState>) -> Json<HubStatusResponse> {
    Json(HubStatusResponse {
        state: state.hub_fsm.state().await,
    })
}

async fn force_hub_transition(
    State(state): State<AppState>,
    Json(req): Json<ForceTransitionRequest>,
) -> std::result::Result<StatusCode, Response> {
    state
        .hub_fsm
        .force_transition(req.to, req.reason)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(|e| error_response(status_for(&e), e))
}

async fn pause_hub(State(state): State<AppState>) -> StatusCode {
    state.hub_fsm.pause();
    StatusCode::NO_CONTENT
}

async fn resume_hub(State(state): State<AppState>) -> StatusCode {
    state.hub_fsm.resume();
    StatusCode::NO_CONTENT
}

async fn get_hub_history(State(state): State<AppState>) -> Json<HubHistoryResponse> {
    Json(HubHistoryResponse {
        transitions: state.hub_fsm.history().await,
    })
}

async fn get_metrics(State(state): State<AppState>) -> Json<crate::monitoring::SystemMetrics> {
    let hub_state = state.hub_fsm.state().await;
    let (metrics, _signal) = state
        .health
        .assess(&state.queue, &state.goals, &state.registry, &state.cost_ledger, hub_state)
        .await;
    Json(metrics)
}

async fn list_alerts(State(state): State<AppState>) -> Json<Vec<crate::monitoring::Alert>> {
    Json(state.health.alerts().await)
}

async fn acknowledge_alert(State(state): State<AppState>, Path(rule): Path<String>) -> StatusCode {
    state.health.acknowledge(&rule).await;
    StatusCode::NO_CONTENT
}

async fn onboard_register(
    State(state): State<AppState>,
    Json(req): Json<OnboardRequest>,
) -> std::result::Result<Json<OnboardResponse>, Response> {
    let agent_id = req.agent_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    if state.agent_tokens.contains_key(&agent_id) {
        let e = AgentComError::BusinessRuleRefusal(format!("agent {agent_id} already registered"));
        return Err(error_response(status_for(&e), e));
    }

    let token = security::generate_onboarding_token();
    state.agent_tokens.insert(agent_id.clone(), token.clone());
    info!("onboarded agent {} ({}) with capabilities {:?}", agent_id, req.name, req.capabilities);
    Ok(Json(OnboardResponse { agent_id, token }))
}

async fn github_webhook(State(state): State<AppState>, headers: HeaderMap, body: axum::body::Bytes) -> Response {
    let signature = match headers.get("x-hub-signature-256").and_then(|v| v.to_str().ok()) {
        Some(s) => s,
        None => return (StatusCode::UNAUTHORIZED, "missing signature").into_response(),
    };

    if let Err(e) = webhook::verify_signature(&state.config.webhook, &body, signature) {
        warn!("webhook signature verification failed: {}", e);
        return (StatusCode::UNAUTHORIZED, "invalid signature").into_response();
    }

    let event: webhook::PushEvent = match serde_json::from_slice(&body) {
        Ok(e) => e,
        Err(_) => return StatusCode::NO_CONTENT.into_response(),
    };

    if webhook::should_trigger_improving(&state.config.webhook, &event) {
        if let Err(e) = state
            .hub_fsm
            .force_transition(HubState::Improving, format!("push to {}", event.repository.full_name))
            .await
        {
            warn!("webhook-triggered transition failed: {}", e);
        }
    }

    StatusCode::NO_CONTENT.into_response()
}

async fn system_rate_summary(State(state): State<AppState>) -> Json<crate::rate_limit::SystemRateSummary> {
    Json(state.rate_limiter.system_rate_summary())
}

async fn agent_rate_status(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Json<crate::rate_limit::AgentRateStatus> {
    Json(state.rate_limiter.agent_rate_status(&agent_id))
}

async fn set_rate_override(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Json(req): Json<RateOverride>,
) -> StatusCode {
    state.rate_limiter.set_override(&agent_id, req);
    StatusCode::NO_CONTENT
}

async fn remove_rate_override(State(state): State<AppState>, Path(agent_id): Path<String>) -> StatusCode {
    state.rate_limiter.remove_override(&agent_id);
    StatusCode::NO_CONTENT
}

async fn replace_whitelist(State(state): State<AppState>, Json(req): Json<WhitelistReplaceRequest>) -> StatusCode {
    state.rate_limiter.update_whitelist(req.agent_ids);
    StatusCode::NO_CONTENT
}

async fn add_whitelist(State(state): State<AppState>, Path(agent_id): Path<String>) -> StatusCode {
    state.rate_limiter.add_to_whitelist(&agent_id);
    StatusCode::NO_CONTENT
}

async fn remove_whitelist(State(state): State<AppState>, Path(agent_id): Path<String>) -> StatusCode {
    state.rate_limiter.remove_from_whitelist(&agent_id);
    StatusCode::NO_CONTENT
}

/// Archives every configured store file, reporting per-table success so
/// one failing table doesn't hide whether the others backed up fine.
async fn trigger_backup(State(state): State<AppState>) -> Json<BackupSummaryResponse> {
    let mut results = Vec::with_capacity(state.store_paths.len());
    for (table, path) in state.store_paths.iter() {
        let maintainer = state.backup_maintainer.clone();
        let path = path.clone();
        let outcome = tokio::task::spawn_blocking(move || maintainer.backup(&path)).await;
        let (ok, detail) = match outcome {
            Ok(Ok(archive)) => (true, format!("{archive:?}")),
            Ok(Err(e)) => (false, e.to_string()),
            Err(e) => (false, format!("backup task panicked: {e}")),
        };
        results.push(BackupResult { table: table.clone(), ok, detail });
    }
    Json(BackupSummaryResponse { results })
}

async fn compact_table(State(state): State<AppState>, Path(table): Path<String>) -> std::result::Result<StatusCode, Response> {
    let result = match table.as_str() {
        "tasks" => state.queue.compact().await,
        "goals" => state.goals.compact().await,
        "cost_ledger" => state.cost_ledger.compact().await,
        _ => Err(AgentComError::NotFound(format!("no such table {table}"))),
    };
    result
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(|e| error_response(status_for(&e), e))
}

/// Restores `table`'s file from the most recent verified backup. The
/// store actor already has the old file open, so this takes effect on
/// the table's next process restart, not immediately in this one.
async fn restore_table(State(state): State<AppState>, Path(table): Path<String>) -> std::result::Result<StatusCode, Response> {
    let Some((_, path)) = state.store_paths.iter().find(|(name, _)| name == &table) else {
        let e = AgentComError::NotFound(format!("no such table {table}"));
        return Err(error_response(status_for(&e), e));
    };
    let maintainer = state.backup_maintainer.clone();
    let path = path.clone();
    let outcome = tokio::task::spawn_blocking(move || maintainer.restore(&path)).await;
    match outcome {
        Ok(Ok(())) => Ok(StatusCode::NO_CONTENT),
        Ok(Err(e)) => Err(error_response(status_for(&e), e)),
        Err(e) => {
            let e = AgentComError::Fatal(e.into());
            Err(error_response(status_for(&e), e))
        }
    }
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_agent_socket(socket, state))
}

async fn send_hub_frame(socket: &mut WebSocket, frame: HubFrame) {
    if let Ok(text) = serde_json::to_string(&frame) {
        let _ = socket.send(Message::Text(text.into())).await;
    }
}

/// One task per connection: reads `AgentFrame`s off the socket and
/// drives the `AgentFsm`/`TaskQueue`; drains the `AgentFsm`'s outbound
/// mailbox back into the same socket.
async fn handle_agent_socket(mut socket: WebSocket, state: AppState) {
    let identify = loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<AgentFrame>(&text) {
                Ok(AgentFrame::Identify { agent_id, name, capabilities, token }) => {
                    break (agent_id, name, capabilities, token)
                }
                _ => continue,
            },
            Some(Ok(_)) => continue,
            _ => return,
        }
    };

    let (agent_id, name, capabilities, token) = identify;

    let expected_token = state.agent_tokens.get(&agent_id).map(|t| t.clone());
    match expected_token {
        None => {
            warn!("identify rejected for unknown agent {}: invalid_token", agent_id);
            send_hub_frame(&mut socket, HubFrame::Error { error: "invalid_token".to_string() }).await;
            return;
        }
        Some(expected) if expected != token => {
            warn!("identify rejected for agent {}: token_agent_mismatch", agent_id);
            send_hub_frame(&mut socket, HubFrame::Error { error: "token_agent_mismatch".to_string() }).await;
            return;
        }
        Some(_) => {}
    }
    send_hub_frame(&mut socket, HubFrame::Identified { agent_id: agent_id.clone() }).await;

    let (tx, mut rx) = mpsc::channel::<HubFrame>(64);
    let record = AgentRecord::new(agent_id.clone(), name, capabilities.into_iter().collect());
    let fsm = Arc::new(AgentFsm::new(record, tx));
    state.registry.register(agent_id.clone(), fsm.clone()).await;

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(frame) => {
                        let Ok(text) = serde_json::to_string(&frame) else { continue };
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(frame) = serde_json::from_str::<AgentFrame>(&text) {
                            handle_agent_frame(&state, &fsm, frame).await;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => continue,
                }
            }
        }
    }

    fsm.mark_offline().await;
    state.registry.unregister(&agent_id).await;
}

async fn handle_agent_frame(state: &AppState, fsm: &Arc<AgentFsm>, frame: AgentFrame) {
    fsm.heartbeat().await;
    match frame {
        AgentFrame::Ping => {}
        AgentFrame::TaskAccepted { task_id, generation } => {
            let agent_id = fsm.agent_id().await;
            if let Err(e) = state.queue.accept(task_id, &agent_id, generation).await {
                warn!("accept rejected for task {}: {}", task_id, e);
            } else {
                fsm.mark_working().await;
            }
        }
        AgentFrame::TaskProgress { task_id, generation, note } => {
            let agent_id = fsm.agent_id().await;
            let _ = state.queue.progress(task_id, &agent_id, generation, note).await;
        }
        AgentFrame::TaskComplete { task_id, generation } => {
            let agent_id = fsm.agent_id().await;
            if state.queue.complete(task_id, &agent_id, generation).await.is_ok() {
                fsm.release().await;
            }
        }
        AgentFrame::TaskFailed { task_id, generation, error } => {
            let agent_id = fsm.agent_id().await;
            if state.queue.fail(task_id, &agent_id, generation, error).await.is_ok() {
                fsm.release().await;
            }
        }
        AgentFrame::StateReport { blocked, .. } => {
            if blocked {
                fsm.mark_blocked().await;
            }
        }
        AgentFrame::Identify { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BudgetInvocation, GoalSource};
    use crate::store::Store;

    async fn make_state() -> AppState {
        let dir = tempfile::tempdir().unwrap();
        let task_store = Arc::new(Store::open(dir.path().join("tasks.redb")).unwrap());
        let goal_store = Arc::new(Store::open(dir.path().join("goals.redb")).unwrap());
        let ledger_store: Arc<Store<BudgetInvocation>> =
            Arc::new(Store::open(dir.path().join("ledger.redb")).unwrap());

        let mut config = Config::load().unwrap_or_else(|_| panic!("test config"));
        config.api.enable_auth = false;

        AppState {
            config,
            queue: Arc::new(TaskQueue::new(task_store).await.unwrap()),
            goals: Arc::new(GoalBacklog::new(goal_store).await.unwrap()),
            registry: Arc::new(AgentRegistry::new()),
            hub_fsm: Arc::new(HubFsm::new(Arc::new(EventBus::new()))),
            rate_limiter: Arc::new(AgentRateLimiter::new()),
            cost_ledger: Arc::new(CostLedger::new(ledger_store)),
            event_bus: Arc::new(EventBus::new()),
            health: Arc::new(HealthAggregator::new(Default::default())),
            validator: Arc::new(TaskContentValidator::new().unwrap()),
            agent_tokens: Arc::new(DashMap::new()),
            backup_maintainer: Arc::new(BackupMaintainer::new(dir.path(), 7)),
            store_paths: Arc::new(vec![]),
        }
    }

    #[tokio::test]
    async fn test_create_and_get_task_round_trip() {
        let state = make_state().await;
        let req = CreateTaskRequest {
            description: "write a test".to_string(),
            priority: Priority::Normal,
            needed_capabilities: Default::default(),
            depends_on: Default::default(),
            success_criteria: vec![],
        };
        let Json(created) = create_task(State(state.clone()), Json(req)).await.unwrap();
        let Json(fetched) = get_task(State(state), Path(created.id)).await.unwrap();
        assert_eq!(fetched.id, created.id);
    }

    #[tokio::test]
    async fn test_create_goal_sanitizes_criteria() {
        let state = make_state().await;
        let req = CreateGoalRequest {
            description: "ship it".to_string(),
            success_criteria: vec!["tests pass".to_string()],
            priority: Priority::High,
            source: GoalSource::Api,
        };
        let Json(goal) = create_goal(State(state), Json(req)).await.unwrap();
        assert_eq!(goal.description, "ship it");
    }
}
