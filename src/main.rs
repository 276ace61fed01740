mod approval;
mod catalog;
mod clock;
mod config;
mod enrichment;
mod http;
mod jobs;
mod llm;
mod metrics;
mod models;
mod pipeline;
mod ratelimit;
mod scheduler;
mod security;
mod store;
mod worker;

use approval::{ApprovalAction, ApprovalError, ApprovalOutcome};
use axum::{
    Json, Router,
    extract::{Extension, Path, Query, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use clock::SharedClock;
use config::AppConfig;
use enrichment::{
    breaker::CircuitBreakers,
    cache::{self, SharedCache},
    gatherer::Gatherer,
    generator::{Generator, RetryPolicy},
    search::{GoogleSearch, barcode_providers, text_providers},
};
use eyre::WrapErr;
use jobs::{JobInfo, JobQueue, JobRequest, QueueError};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, EnrichmentLog, EnrichmentRun, TenantSettings, TriggerKind};
use pipeline::{Pipeline, PipelineError, PipelineErrorKind};
use ratelimit::{AiCallBudget, RetryAfter, TriggerLimiter};
use scheduler::{ScheduleError, ScheduleRegistry};
use security::{AuthContext, AuthState, require_api_auth};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use store::{Store, StoreError};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use worker::{CatalogConnector, Worker, shopify_connector};

const RECENT_LOGS: i64 = 20;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "smartenrich.api", "server crashed: {err:?}");
    }
}

async fn run() -> eyre::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = AppConfig::from_env();
    let clock = clock::system();
    let store = Store::connect(&config.database_url)
        .await
        .wrap_err("opening database")?;
    seed_default_credential(&store, &config, &clock).await;

    let cache = cache::from_url(config.redis_url.as_deref());
    let google = GoogleSearch::from_env();
    let gatherer = Gatherer::new(
        text_providers(&config.search_providers, &google),
        Some(Arc::new(google)),
        cache.clone(),
        CircuitBreakers::new(clock.clone()),
    )
    .with_barcode_providers(barcode_providers());
    let generator = Generator::new(
        llm::from_env(),
        AiCallBudget::per_minute(config.ai_calls_per_minute, clock.clone()),
        RetryPolicy::default(),
    );
    let pipeline = Pipeline::new(store.clone(), gatherer, generator, clock.clone());
    let queue = JobQueue::new(&store, clock.clone(), config.queue.clone());

    let connect = shopify_connector();
    let workers = Worker::new(queue.clone(), pipeline, connect.clone(), config.worker.clone()).spawn_pool();
    info!(target = "smartenrich.worker", count = workers.len(), "worker_pool_started");

    let schedules = ScheduleRegistry::new(queue.clone())
        .await
        .wrap_err("creating scheduler")?;
    let registered = schedules
        .bootstrap(&store, &config)
        .await
        .wrap_err("registering schedules")?;
    schedules.start().await.wrap_err("starting scheduler")?;
    info!(target = "smartenrich.cron", registered = registered, "schedules_bootstrapped");

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("installing prometheus recorder")?;

    let state = AppState {
        store,
        queue,
        schedules,
        cache,
        connect,
        clock: clock.clone(),
        trigger_limiter: TriggerLimiter::new(config.trigger_limit_max, config.trigger_limit_window, clock.clone()),
        prometheus,
    };
    let app = router(state, AuthState::from_env(clock), config.request_max_bytes);

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    info!(target = "smartenrich.api", "listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

/// Lets a single-tenant deployment run without a separate install step.
async fn seed_default_credential(store: &Store, config: &AppConfig, clock: &SharedClock) {
    let (Some(shop), Ok(token)) = (&config.default_shop, std::env::var("SHOPIFY_ACCESS_TOKEN")) else {
        return;
    };
    if token.trim().is_empty() {
        return;
    }
    if let Err(err) = store.upsert_access_token(shop, token.trim(), clock.now()).await {
        warn!(target = "smartenrich.api", shop = %shop, error = %err, "default_credential_seed_failed");
    }
}

#[derive(Clone)]
struct AppState {
    store: Store,
    queue: JobQueue,
    schedules: ScheduleRegistry,
    cache: SharedCache,
    connect: CatalogConnector,
    clock: SharedClock,
    trigger_limiter: TriggerLimiter,
    prometheus: PrometheusHandle,
}

fn router(state: AppState, auth: AuthState, body_limit: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/api/enrich", post(enrich_batch).get(enrich_status))
        .route("/api/enrich/{product_id}", post(enrich_single))
        .route("/api/runs/{id}", get(get_run_status))
        .route("/api/jobs/{id}", get(get_job_status))
        .route("/api/approve", post(approve_log))
        .route("/api/schedule", put(update_schedule))
        .route("/api/credentials", put(update_credentials))
        .route("/api/webhooks/products", post(product_webhook))
        .route_layer(middleware::from_fn_with_state(auth, require_api_auth));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

/// Database and cache reachability.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
///
/// 200 when every check passes, 503 otherwise.
async fn health(State(state): State<AppState>) -> Response {
    let database = state.store.ping().await;
    let cache = state.cache.ping().await;
    let healthy = database && cache;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "service": "smartenrich-rs",
        "checks": { "database": database, "cache": cache },
    });
    (status, Json(body)).into_response()
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [("Content-Type", "text/plain; version=0.0.4")],
        state.prometheus.render(),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct BatchQuery {
    max: Option<u32>,
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
    status: &'static str,
}

fn accepted(job_id: String) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            job_id,
            status: "queued",
        }),
    )
        .into_response()
}

/// Queue a manual batch run for the caller's shop.
///
/// - Method: `POST`
/// - Path: `/api/enrich?max=N`
/// - Response: 202 `{job_id}`; 429 with `Retry-After` when the shop
///   triggered too often.
async fn enrich_batch(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Query(query): Query<BatchQuery>,
) -> Result<Response, AppError> {
    crate::metrics::inc_requests("/api/enrich");
    if let Some(max) = query.max
        && !(1..=TenantSettings::MAX_PRODUCTS_LIMIT).contains(&max)
    {
        return Err(PipelineError::invalid_input(
            "enrich",
            format!("max must be between 1 and {}", TenantSettings::MAX_PRODUCTS_LIMIT),
        )
        .into());
    }
    state
        .trigger_limiter
        .check_and_record(&context.shop)
        .await
        .map_err(AppError::RateLimited)?;

    let job_id = state
        .queue
        .enqueue(JobRequest::batch(&context.shop, TriggerKind::Manual, query.max))
        .await?;
    info!(target = "smartenrich.api", shop = %context.shop, job_id = %job_id, "batch_trigger_enqueued");
    Ok(accepted(job_id))
}

async fn enrich_single(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(product_id): Path<String>,
) -> Result<Response, AppError> {
    crate::metrics::inc_requests("/api/enrich/{product_id}");
    let Some(product_id) = catalog::normalize_product_id(&product_id) else {
        return Err(PipelineError::invalid_input("enrich", "invalid product id").into());
    };
    let job_id = state
        .queue
        .enqueue(JobRequest::single(&context.shop, TriggerKind::Manual, &product_id))
        .await?;
    info!(target = "smartenrich.api", shop = %context.shop, item_id = %product_id, job_id = %job_id, "single_trigger_enqueued");
    Ok(accepted(job_id))
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    run: Option<EnrichmentRun>,
    logs: Vec<EnrichmentLog>,
}

async fn enrich_status(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> Result<Json<StatusResponse>, AppError> {
    crate::metrics::inc_requests("/api/enrich");
    let run = state.store.latest_run(&context.shop).await?;
    let logs = match &run {
        Some(run) => state.store.logs_for_run(&run.id, RECENT_LOGS).await?,
        None => Vec::new(),
    };
    Ok(Json(StatusResponse { run, logs }))
}

async fn get_run_status(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, AppError> {
    let Some(run) = state.store.get_run(&id).await?.filter(|run| run.shop == context.shop) else {
        return Err(AppError::NotFound("run"));
    };
    let logs = state.store.logs_for_run(&run.id, RECENT_LOGS).await?;
    Ok(Json(StatusResponse { run: Some(run), logs }))
}

async fn get_job_status(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>, AppError> {
    match state.queue.get(&id).await? {
        Some(info) if info.shop == context.shop => Ok(Json(info)),
        _ => Err(AppError::NotFound("job")),
    }
}

#[derive(Debug, Deserialize)]
struct ApproveRequest {
    log_id: String,
    action: ApprovalAction,
}

/// Approve or reject a pending proposal.
///
/// - Method: `POST`
/// - Path: `/api/approve`
/// - Body: `{log_id, action: "approve" | "reject"}`
/// - Response: the settled log status; 404 for unknown logs, 409 when the
///   log is no longer pending.
async fn approve_log(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<ApproveRequest>,
) -> Result<Json<ApprovalOutcome>, AppError> {
    crate::metrics::inc_requests("/api/approve");
    let outcome = match payload.action {
        ApprovalAction::Reject => approval::reject(&state.store, &state.clock, &context.shop, &payload.log_id).await?,
        ApprovalAction::Approve => {
            let Some(token) = state.store.access_token(&context.shop).await? else {
                return Err(AppError::Conflict(format!(
                    "no access token stored for {}",
                    context.shop
                )));
            };
            let catalog = (state.connect)(&context.shop, &token);
            approval::approve(
                &state.store,
                catalog.as_ref(),
                &state.clock,
                &context.shop,
                &payload.log_id,
            )
            .await?
        }
    };
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
struct ScheduleRequest {
    #[serde(default)]
    cron_schedule: Option<String>,
    #[serde(default)]
    cron_enabled: Option<bool>,
    #[serde(default)]
    auto_apply: Option<bool>,
    #[serde(default)]
    max_products_per_run: Option<u32>,
    #[serde(default)]
    min_confidence: Option<f64>,
}

/// Persist tenant settings and replace the recurring registration.
async fn update_schedule(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<ScheduleRequest>,
) -> Result<Json<TenantSettings>, AppError> {
    crate::metrics::inc_requests("/api/schedule");
    let mut settings = state.store.tenant_settings(&context.shop).await?;
    if let Some(cron) = payload.cron_schedule {
        settings.cron_schedule = cron.trim().to_string();
    }
    if let Some(enabled) = payload.cron_enabled {
        settings.cron_enabled = enabled;
    }
    if let Some(auto) = payload.auto_apply {
        settings.auto_apply = auto;
    }
    if let Some(max) = payload.max_products_per_run {
        settings.max_products_per_run = max;
    }
    if let Some(min) = payload.min_confidence {
        settings.min_confidence = min;
    }
    scheduler::normalize_cron(&settings.cron_schedule)?;

    // Registration first: a rejected expression leaves both the old
    // registration and the stored settings untouched.
    state.schedules.apply_settings(&settings).await?;
    let saved = state
        .store
        .upsert_tenant_settings(&settings, state.clock.now())
        .await?;
    info!(
        target = "smartenrich.cron",
        shop = %saved.shop,
        cron = %saved.cron_schedule,
        enabled = saved.cron_enabled,
        "tenant_settings_updated"
    );
    Ok(Json(saved))
}

#[derive(Debug, Deserialize)]
struct CredentialRequest {
    access_token: String,
}

async fn update_credentials(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<CredentialRequest>,
) -> Result<StatusCode, AppError> {
    let token = payload.access_token.trim();
    if token.is_empty() {
        return Err(PipelineError::invalid_input("credentials", "access_token is required").into());
    }
    state
        .store
        .upsert_access_token(&context.shop, token, state.clock.now())
        .await?;
    info!(target = "smartenrich.api", shop = %context.shop, "access_token_updated");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct ProductWebhook {
    topic: String,
    #[serde(default)]
    admin_graphql_api_id: Option<String>,
}

/// Already-verified product webhooks. Only creations trigger enrichment;
/// updates are ignored so an applied proposal cannot re-trigger itself.
async fn product_webhook(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<ProductWebhook>,
) -> Result<Response, AppError> {
    crate::metrics::inc_requests("/api/webhooks/products");
    match payload.topic.as_str() {
        "products/create" => {
            let Some(product_id) = payload
                .admin_graphql_api_id
                .as_deref()
                .and_then(catalog::normalize_product_id)
            else {
                return Err(PipelineError::invalid_input("webhook", "admin_graphql_api_id is required").into());
            };
            let job_id = state
                .queue
                .enqueue(JobRequest::single(&context.shop, TriggerKind::Webhook, &product_id))
                .await?;
            info!(target = "smartenrich.api", shop = %context.shop, item_id = %product_id, job_id = %job_id, "webhook_enqueued");
            Ok(accepted(job_id))
        }
        topic => {
            info!(target = "smartenrich.api", shop = %context.shop, topic = topic, "webhook_ignored");
            Ok((StatusCode::OK, Json(json!({ "status": "ignored", "topic": topic }))).into_response())
        }
    }
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
    NotFound(&'static str),
    Conflict(String),
    RateLimited(RetryAfter),
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl From<QueueError> for AppError {
    fn from(value: QueueError) -> Self {
        Self::Pipeline(PipelineError::internal("queue", value.to_string()))
    }
}

impl From<StoreError> for AppError {
    fn from(value: StoreError) -> Self {
        Self::Pipeline(PipelineError::internal("store", value.to_string()))
    }
}

impl From<ScheduleError> for AppError {
    fn from(value: ScheduleError) -> Self {
        match value {
            ScheduleError::InvalidExpression(_) => {
                Self::Pipeline(PipelineError::invalid_input("schedule", value.to_string()))
            }
            other => Self::Pipeline(PipelineError::internal("schedule", other.to_string())),
        }
    }
}

impl From<ApprovalError> for AppError {
    fn from(value: ApprovalError) -> Self {
        match value {
            ApprovalError::NotFound(_) => Self::NotFound("log"),
            ApprovalError::NotPending { .. } => Self::Conflict(value.to_string()),
            other => Self::Pipeline(PipelineError::internal("approval", other.to_string())),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    PipelineErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status.is_server_error() {
                    error!(target = "smartenrich.api", stage = err.stage(), error = %err.detail(), "request_failed");
                }
                let payload = ApiError {
                    error: err.stage().to_string(),
                    detail: Some(err.detail().to_string()),
                };
                (status, Json(payload)).into_response()
            }
            AppError::NotFound(what) => security::error_response(StatusCode::NOT_FOUND, "not_found", what),
            AppError::Conflict(detail) => security::error_response(StatusCode::CONFLICT, "conflict", &detail),
            AppError::RateLimited(retry) => {
                let mut response = security::error_response(
                    StatusCode::TOO_MANY_REQUESTS,
                    "trigger_rate_limited",
                    "Too many enrichment triggers; try again later",
                );
                security::retry_after_header(response.headers_mut(), retry.secs);
                response
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::{SharedCatalog, fake::MemoryCatalog},
        config::QueueConfig,
        enrichment::cache::MemoryCache,
        jobs::JobState,
        pipeline::testing::SHOP,
        ratelimit::TokenBuckets,
        security::parse_api_keys,
    };
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn app() -> (Router, AppState) {
        let clock = clock::system();
        let store = Store::in_memory().await.expect("store");
        let queue = JobQueue::new(&store, clock.clone(), QueueConfig::default());
        let catalog = Arc::new(MemoryCatalog::default());
        let state = AppState {
            store,
            schedules: ScheduleRegistry::new(queue.clone()).await.expect("scheduler"),
            queue,
            cache: Arc::new(MemoryCache::new()),
            connect: Arc::new(move |_shop: &str, _token: &str| -> SharedCatalog { catalog.clone() }),
            clock: clock.clone(),
            trigger_limiter: TriggerLimiter::new(1, Duration::from_secs(300), clock.clone()),
            prometheus: PrometheusBuilder::new().build_recorder().handle(),
        };
        let auth = AuthState::new(
            parse_api_keys(&format!("{SHOP}:secret")),
            TokenBuckets::new(100.0, 100.0, clock),
        );
        (router(state.clone(), auth, 64 * 1024), state)
    }

    fn call(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("X-Api-Key", "secret")
            .header("Content-Type", "application/json");
        let body = body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty);
        builder.body(body).expect("request")
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), 1 << 20).await.expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    #[tokio::test]
    async fn second_manual_batch_is_rate_limited() {
        let (app, state) = app().await;
        let first = app.clone().oneshot(call("POST", "/api/enrich?max=5", None)).await.expect("first");
        assert_eq!(first.status(), StatusCode::ACCEPTED);
        let job_id = json_body(first).await["job_id"].as_str().expect("job id").to_string();
        let info = state.queue.get(&job_id).await.expect("get").expect("job");
        assert_eq!(info.state, JobState::Queued);

        let second = app.oneshot(call("POST", "/api/enrich", None)).await.expect("second");
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(second.headers().contains_key("retry-after"));
    }

    #[tokio::test]
    async fn out_of_range_max_is_rejected() {
        let (app, _state) = app().await;
        let response = app.oneshot(call("POST", "/api/enrich?max=500", None)).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn numeric_product_ids_are_normalized() {
        let (app, state) = app().await;
        let response = app.oneshot(call("POST", "/api/enrich/42", None)).await.expect("response");
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let job = state.queue.claim().await.expect("claim").expect("job");
        assert_eq!(job.request.product_id.as_deref(), Some("gid://shopify/Product/42"));
        assert_eq!(job.request.trigger, TriggerKind::Manual);
    }

    #[tokio::test]
    async fn product_updates_do_not_enqueue() {
        let (app, state) = app().await;
        let update = json!({"topic": "products/update", "admin_graphql_api_id": "gid://shopify/Product/7"});
        let response = app.clone().oneshot(call("POST", "/api/webhooks/products", Some(update))).await.expect("update");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.queue.claim().await.expect("claim").is_none());

        let create = json!({"topic": "products/create", "admin_graphql_api_id": "gid://shopify/Product/7"});
        let response = app.oneshot(call("POST", "/api/webhooks/products", Some(create))).await.expect("create");
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let job = state.queue.claim().await.expect("claim").expect("job");
        assert_eq!(job.request.trigger, TriggerKind::Webhook);
    }

    #[tokio::test]
    async fn invalid_schedule_keeps_stored_settings() {
        let (app, state) = app().await;
        let bad = json!({"cron_schedule": "every night"});
        let response = app.clone().oneshot(call("PUT", "/api/schedule", Some(bad))).await.expect("bad");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.store.tenant_settings(SHOP).await.expect("settings").cron_schedule, "0 2 * * *");

        let good = json!({"cron_schedule": "0 4 * * *", "auto_apply": true});
        let response = app.oneshot(call("PUT", "/api/schedule", Some(good))).await.expect("good");
        assert_eq!(response.status(), StatusCode::OK);
        let saved = state.store.tenant_settings(SHOP).await.expect("settings");
        assert_eq!(saved.cron_schedule, "0 4 * * *");
        assert!(saved.auto_apply);
        assert!(state.schedules.registration(SHOP).await.is_some());
    }

    #[tokio::test]
    async fn unknown_logs_return_not_found() {
        let (app, _state) = app().await;
        let body = json!({"log_id": "missing", "action": "reject"});
        let response = app.oneshot(call("POST", "/api/approve", Some(body))).await.expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn jobs_of_other_shops_are_hidden() {
        let (app, state) = app().await;
        let id = state
            .queue
            .enqueue(JobRequest::batch("other.myshopify.com", TriggerKind::Manual, None))
            .await
            .expect("enqueue");
        let response = app.oneshot(call("GET", &format!("/api/jobs/{id}"), None)).await.expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_reports_checks() {
        let (app, _state) = app().await;
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["checks"]["database"], true);
    }
}
