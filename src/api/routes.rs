//! HTTP route handlers.

use std::sync::Arc;
use std::time::Duration;

use axum::middleware;
use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router as AxumRouter,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::approval::ApprovalGate;
use crate::batch::BatchExecutor;
use crate::budget::BudgetEnforcer;
use crate::config::{CatalogStore, Config};
use crate::cost::CostEstimator;
use crate::error::ControlError;
use crate::notify::Notifier;
use crate::provider::ProviderRegistry;
use crate::router::Router;
use crate::scheduler::Scheduler;
use crate::secrets::SecretStore;
use crate::store::{ApprovalStatus, Store};
use crate::toggles::ToggleRegistry;

use super::types::*;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub store: Arc<Store>,
    pub catalog: Arc<CatalogStore>,
    pub estimator: CostEstimator,
    pub router: Arc<Router>,
    pub budget: Arc<BudgetEnforcer>,
    pub toggles: Arc<ToggleRegistry>,
    pub approvals: Arc<ApprovalGate>,
    pub scheduler: Arc<Scheduler>,
    pub batches: BatchExecutor,
}

/// Map a control-plane error to an HTTP response. Every rejection keeps
/// its specific reason in the body.
fn error_response(err: ControlError) -> (StatusCode, String) {
    let status = match &err {
        ControlError::UnknownOperation(_) | ControlError::NotFound { .. } => StatusCode::NOT_FOUND,
        ControlError::BudgetExceeded { .. } | ControlError::ScheduleCeilingExceeded { .. } => {
            StatusCode::PAYMENT_REQUIRED
        }
        ControlError::ToggleLocked { .. }
        | ControlError::OperationDisabled(_)
        | ControlError::ApprovalRejected { .. }
        | ControlError::ApprovalTimeout { .. } => StatusCode::FORBIDDEN,
        ControlError::AlreadyDecided { .. } | ControlError::BatchState { .. } => {
            StatusCode::CONFLICT
        }
        ControlError::SignatureVerificationFailed { .. } => StatusCode::UNAUTHORIZED,
        ControlError::Config(_) => StatusCode::BAD_REQUEST,
        ControlError::Provider { .. } | ControlError::CandidatesExhausted { .. } => {
            StatusCode::BAD_GATEWAY
        }
        ControlError::Secret { .. } | ControlError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

fn ok<T>(value: crate::error::Result<T>) -> ApiResult<T> {
    value.map(Json).map_err(error_response)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for i in 0..a.len() {
        diff |= a[i] ^ b[i];
    }
    diff == 0
}

/// Bearer-token gate for the admin surface. With no token configured the
/// process runs unauthenticated (local development).
pub async fn require_admin(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.config.admin_token.as_deref() else {
        return next.run(req).await;
    };
    let header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");
    let token = header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .unwrap_or("");
    if token.is_empty() {
        return (StatusCode::UNAUTHORIZED, "Missing Authorization header").into_response();
    }
    if !constant_time_eq(token, expected) {
        return (StatusCode::UNAUTHORIZED, "Invalid token").into_response();
    }
    next.run(req).await
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let store = Arc::new(Store::open(&config.db_path)?);
    let catalog = Arc::new(CatalogStore::load(config.catalog_path.clone())?);
    let secrets = Arc::new(SecretStore::new(config.secrets_dir.clone()));
    let notifier = Notifier::new(config.notify_url.clone());

    let snapshot = catalog.get().await;
    let registry = Arc::new(ProviderRegistry::from_defs(&snapshot.providers, &secrets)?);
    let estimator = CostEstimator::new(Arc::clone(&registry), config.cost_margin);

    let budget = Arc::new(BudgetEnforcer::new(Arc::clone(&store)));
    let toggles = Arc::new(ToggleRegistry::new(
        Arc::clone(&store),
        Duration::from_secs(config.toggle_cache_ttl_secs),
    ));
    toggles.seed(&snapshot.toggles)?;
    let approvals = Arc::new(ApprovalGate::new(
        Arc::clone(&store),
        notifier.clone(),
        config.approval_ttl_secs,
        Duration::from_secs(config.approval_wait_secs),
        Duration::from_millis(config.approval_poll_ms),
    ));
    let router = Arc::new(Router::new(
        Arc::clone(&catalog),
        Arc::clone(&registry),
        CostEstimator::new(Arc::clone(&registry), config.cost_margin),
        Arc::clone(&budget),
        Arc::clone(&toggles),
        Arc::clone(&approvals),
        Arc::clone(&store),
        Duration::from_secs(config.operation_cache_ttl_secs),
        config.approval_threshold_cents,
        config.max_provider_attempts,
    ));
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&router),
        Arc::clone(&catalog),
        CostEstimator::new(Arc::clone(&registry), config.cost_margin),
        secrets,
        notifier,
        Duration::from_secs(config.scheduler_tick_secs),
        config.running_stale_secs,
    ));
    scheduler.seed(&snapshot.schedules)?;
    let recovered = scheduler.recover()?;
    if recovered > 0 {
        tracing::info!(recovered, "recovered abandoned schedule executions");
    }
    tokio::spawn(Arc::clone(&scheduler).run_loop());

    let batches = BatchExecutor::new(
        Arc::clone(&store),
        Arc::clone(&router),
        Arc::clone(&catalog),
        CostEstimator::new(Arc::clone(&registry), config.cost_margin),
        config.batch_concurrency,
    );

    let state = Arc::new(AppState {
        config: config.clone(),
        store,
        catalog,
        estimator,
        router,
        budget,
        toggles,
        approvals,
        scheduler,
        batches,
    });

    let public_routes = AxumRouter::new()
        .route("/api/health", get(health))
        // Webhook triggers authenticate by HMAC signature, not by token.
        .route("/api/hooks/:name", post(webhook_trigger));

    let protected_routes = AxumRouter::new()
        .route("/api/invoke", post(invoke))
        .route("/api/estimate", post(estimate))
        .route("/api/executions", get(list_executions))
        .route("/api/budget", get(list_budget).post(upsert_budget))
        .route("/api/budget/:scope", get(get_budget))
        .route("/api/budget/:scope/anomalies", get(budget_anomalies))
        .route("/api/toggles", get(list_toggles))
        .route("/api/toggles/:name", post(write_toggle))
        .route("/api/approvals", get(list_approvals))
        .route("/api/approvals/:id", get(get_approval))
        .route("/api/approvals/:id/decide", post(decide_approval))
        .route("/api/schedules", get(list_schedules))
        .route("/api/schedules/:name", get(get_schedule))
        .route("/api/schedules/:name/trigger", post(manual_trigger))
        .route("/api/schedules/:name/pause", post(pause_schedule))
        .route("/api/schedules/:name/resume", post(resume_schedule))
        .route("/api/schedules/:name/executions", get(list_schedule_executions))
        .route("/api/scheduler/health", get(scheduler_health))
        .route("/api/batches", post(create_batch))
        .route("/api/batches/:id", get(get_batch))
        .route("/api/batches/:id/execute", post(execute_batch))
        .route("/api/batches/:id/cancel", post(cancel_batch))
        .route("/api/catalog", get(get_catalog))
        .route("/api/catalog/reload", post(reload_catalog))
        .route("/api/audit", get(list_audit))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_admin,
        ));

    let app = AxumRouter::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::clone(&state));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Wait for SIGINT/SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn invoke(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InvokeRequest>,
) -> ApiResult<crate::router::RouteResult> {
    ok(state
        .router
        .route(&req.operation_id, &req.scope, &req.params)
        .await)
}

async fn estimate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EstimateRequest>,
) -> ApiResult<crate::cost::CostRange> {
    let catalog = state.catalog.get().await;
    let op = catalog
        .operation(&req.operation_id)
        .ok_or_else(|| error_response(ControlError::UnknownOperation(req.operation_id.clone())))?;
    ok(state.estimator.estimate(op, &req.params))
}

#[derive(Debug, Deserialize)]
struct ExecutionsQuery {
    scope: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    50
}

async fn list_executions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ExecutionsQuery>,
) -> ApiResult<Vec<crate::store::ExecutionRecord>> {
    ok(state
        .store
        .list_execution_records(query.scope.as_deref(), query.limit))
}

async fn list_budget(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Vec<crate::store::BudgetScope>> {
    ok(state.store.list_budget_scopes())
}

async fn get_budget(
    State(state): State<Arc<AppState>>,
    Path(scope): Path<String>,
) -> ApiResult<crate::store::BudgetScope> {
    ok(state.store.get_budget_scope(&scope).and_then(|row| {
        row.ok_or(ControlError::NotFound {
            kind: "budget scope",
            id: scope.clone(),
        })
    }))
}

async fn upsert_budget(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BudgetUpsertRequest>,
) -> ApiResult<crate::store::BudgetScope> {
    ok(state
        .store
        .ensure_budget_scope(&req.scope, req.period, req.limit_cents, req.warn_ratio)
        .and_then(|_| state.store.get_budget_scope(&req.scope))
        .and_then(|row| {
            row.ok_or(ControlError::NotFound {
                kind: "budget scope",
                id: req.scope.clone(),
            })
        }))
}

async fn budget_anomalies(
    State(state): State<Arc<AppState>>,
    Path(scope): Path<String>,
) -> ApiResult<crate::budget::AnomalyReport> {
    ok(state.budget.detect_anomalies(&scope))
}

async fn list_toggles(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Vec<crate::store::FeatureToggle>> {
    ok(state.toggles.list())
}

async fn write_toggle(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<ToggleWriteRequest>,
) -> ApiResult<crate::store::FeatureToggle> {
    ok(state.toggles.set(&name, req.enabled, req.privileged))
}

#[derive(Debug, Deserialize)]
struct ApprovalsQuery {
    status: Option<ApprovalStatus>,
}

async fn list_approvals(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ApprovalsQuery>,
) -> ApiResult<Vec<crate::store::ApprovalRequest>> {
    ok(state.approvals.list(query.status))
}

async fn get_approval(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<crate::store::ApprovalRequest> {
    ok(state.approvals.get(id))
}

async fn decide_approval(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<DecideRequest>,
) -> ApiResult<crate::store::ApprovalRequest> {
    ok(state.approvals.decide(id, req.approve, &req.decided_by))
}

async fn list_schedules(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Vec<crate::store::Schedule>> {
    ok(state.store.list_schedules())
}

fn schedule_by_name(
    state: &AppState,
    name: &str,
) -> Result<crate::store::Schedule, (StatusCode, String)> {
    state
        .store
        .get_schedule_by_name(name)
        .map_err(error_response)?
        .ok_or_else(|| {
            error_response(ControlError::NotFound {
                kind: "schedule",
                id: name.to_string(),
            })
        })
}

async fn get_schedule(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<crate::store::Schedule> {
    schedule_by_name(&state, &name).map(Json)
}

async fn manual_trigger(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<crate::store::ScheduleExecution> {
    let schedule = schedule_by_name(&state, &name)?;
    ok(state.scheduler.fire(schedule.id, "manual").await)
}

async fn pause_schedule(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<crate::store::Schedule> {
    let schedule = schedule_by_name(&state, &name)?;
    state
        .store
        .set_schedule_enabled(schedule.id, false)
        .map_err(error_response)?;
    schedule_by_name(&state, &name).map(Json)
}

async fn resume_schedule(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<crate::store::Schedule> {
    let schedule = schedule_by_name(&state, &name)?;
    state
        .store
        .set_schedule_enabled(schedule.id, true)
        .map_err(error_response)?;
    schedule_by_name(&state, &name).map(Json)
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

async fn list_schedule_executions(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Vec<crate::store::ScheduleExecution>> {
    let schedule = schedule_by_name(&state, &name)?;
    ok(state.store.list_schedule_executions(schedule.id, query.limit))
}

async fn scheduler_health(
    State(state): State<Arc<AppState>>,
) -> ApiResult<crate::scheduler::SchedulerHealth> {
    ok(state.scheduler.health())
}

/// Inbound webhook: verify, enqueue, answer 202 before the run settles.
async fn webhook_trigger(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    req: Request<Body>,
) -> Result<(StatusCode, Json<EnqueuedResponse>), (StatusCode, String)> {
    let signature = req
        .headers()
        .get("x-opsgate-signature")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .to_string();
    let body: Bytes = axum::body::to_bytes(req.into_body(), 1024 * 1024)
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let execution_id = state
        .scheduler
        .trigger_webhook(&name, &body, &signature)
        .map_err(error_response)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueuedResponse {
            execution_id,
            status: "accepted",
        }),
    ))
}

async fn create_batch(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateBatchRequest>,
) -> ApiResult<crate::batch::BatchView> {
    ok(state.batches.create(req.mode, &req.scope, req.steps).await)
}

async fn get_batch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<crate::batch::BatchView> {
    ok(state.batches.view(id))
}

async fn execute_batch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<crate::batch::BatchView> {
    ok(state.batches.execute(id).await)
}

async fn cancel_batch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<CancelBatchRequest>,
) -> ApiResult<crate::batch::BatchView> {
    ok(state.batches.cancel(id, &req.reason))
}

async fn get_catalog(State(state): State<Arc<AppState>>) -> Json<crate::config::Catalog> {
    Json((*state.catalog.get().await).clone())
}

async fn reload_catalog(
    State(state): State<Arc<AppState>>,
) -> ApiResult<serde_json::Value> {
    state.catalog.reload().await.map_err(error_response)?;
    Ok(Json(serde_json::json!({
        "status": "reloaded",
        "version": state.catalog.version(),
    })))
}

async fn list_audit(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Vec<crate::store::AuditEvent>> {
    ok(state.store.list_audit(query.limit))
}
