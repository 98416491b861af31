//! HTTP server for the ledger.
//!
//! Exposes the ledger operations as a JSON API for the serving, scraping,
//! processing and training layers, plus the auth-provider and billing
//! webhooks.
//!
//! # Callers
//!
//! Every route except `/health` and `/billing/webhook` requires a caller:
//!
//! - `Authorization: Bearer <service_token>`: the trusted service identity;
//! - `X-User-Id: <id>`: an end user, as verified by the fronting gateway.
//!
//! The billing webhook authenticates by its signature header instead.
//!
//! # Errors
//!
//! All errors use the same body:
//!
//! ```json
//! { "error": { "code": "conflict", "message": "..." } }
//! ```
//!
//! | Code | Status |
//! |------|--------|
//! | `not_found` | 404 |
//! | `conflict`, `invalid_transition` | 409 |
//! | `forbidden` | 403 |
//! | `unauthorized` | 401 |
//! | `bad_request` | 400 |
//! | `unavailable` | 503 |
//! | `internal` | 500 |

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, FromRequestParts, Path, Query, State},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::auth::Caller;
use crate::chat::NewMessage;
use crate::config::{Config, QuotaLimits};
use crate::content::IngestOutcome;
use crate::error::LedgerError;
use crate::events::{AccountEvent, HandlerReport};
use crate::ledger::{Ledger, RecordedDocument, WebhookOutcome};
use crate::models::{
    ChatMessage, ChatSession, JobStatus, ProcessingMetrics, TrainingJob, UsageRecord, UserProfile,
};
use crate::quota::{Quota, QuotaDecision};
use crate::retention::CleanupReport;
use crate::stats::{SourceStats, TrainingStats};
use crate::training::{AdvancePayload, AutoTrainOutcome, JobRequest};
use crate::usage::UsageTotals;

const USER_ID_HEADER: &str = "x-user-id";
const SIGNATURE_HEADER: &str = "stripe-signature";

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    ledger: Ledger,
    service_token: Arc<str>,
}

/// Starts the HTTP server.
///
/// Binds to `[server].bind`, schedules retention cleanup every
/// `[retention].interval_hours`, and serves until the process is
/// terminated. Refuses to start without `[server].service_token`.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let Some(token) = config.server.service_token.clone() else {
        anyhow::bail!("[server].service_token must be set to serve");
    };
    if token.trim().is_empty() {
        anyhow::bail!("[server].service_token must not be empty");
    }

    let ledger = Ledger::open(config).await?;
    let interval = std::time::Duration::from_secs(config.retention.interval_hours * 3600);
    let _cleanup = ledger.retention().clone().spawn_schedule(interval);

    let app = router(ledger, &token);

    let bind_addr = config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "ledger server listening");
    println!("Ledger server listening on http://{}", bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}

/// Build the router. Exposed so the API can be embedded in another server.
pub fn router(ledger: Ledger, service_token: &str) -> Router {
    let state = AppState {
        ledger,
        service_token: Arc::from(service_token),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/content/raw", post(handle_ingest))
        .route("/content/processed", post(handle_record_processed))
        .route("/content/processed/{id}/ready", post(handle_mark_ready))
        .route("/training/stats", get(handle_training_stats))
        .route("/training/jobs", post(handle_trigger_job).get(handle_list_jobs))
        .route("/training/jobs/{id}", get(handle_get_job))
        .route("/training/jobs/{id}/advance", post(handle_advance_job))
        .route("/usage", post(handle_record_usage))
        .route("/users/{id}/quota", get(handle_quota))
        .route(
            "/users/{id}/profile",
            get(handle_profile).patch(handle_update_profile),
        )
        .route("/users/{id}/billing-customer", post(handle_link_customer))
        .route("/accounts/events", post(handle_account_event))
        .route("/billing/webhook", post(handle_billing_webhook))
        .route("/retention/run", post(handle_retention))
        .route("/chat/sessions", post(handle_create_session))
        .route(
            "/chat/sessions/{id}/messages",
            post(handle_append_message).get(handle_list_messages),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"bad_request"`, `"not_found"`).
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        let status = match &err {
            LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::Conflict(_) | LedgerError::InvalidTransition(_) => StatusCode::CONFLICT,
            LedgerError::Forbidden(_) => StatusCode::FORBIDDEN,
            LedgerError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            LedgerError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            LedgerError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %err, "request failed");
        }
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        code: "unauthorized".to_string(),
        message: message.into(),
    }
}

/// Unwrap a JSON body, keeping rejections in the error contract.
fn json_body<T: DeserializeOwned>(body: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    body.map(|Json(v)| v)
        .map_err(|e| bad_request(format!("invalid request body: {}", e.body_text())))
}

// ============ Caller extraction ============

/// The verified caller of a request.
pub struct Authenticated(pub Caller);

impl FromRequestParts<AppState> for Authenticated {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, AppError> {
        caller_from_headers(&parts.headers, &state.service_token).map(Authenticated)
    }
}

fn caller_from_headers(headers: &HeaderMap, service_token: &str) -> Result<Caller, AppError> {
    if let Some(value) = headers.get(AUTHORIZATION) {
        let token = value
            .to_str()
            .ok()
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| unauthorized("malformed Authorization header"))?;
        if token != service_token {
            return Err(LedgerError::Forbidden("invalid service token".into()).into());
        }
        return Ok(Caller::Service);
    }

    match headers.get(USER_ID_HEADER).and_then(|v| v.to_str().ok()) {
        Some(id) if !id.trim().is_empty() => Ok(Caller::user(id.trim())),
        _ => Err(unauthorized(
            "missing credentials: send a service bearer token or X-User-Id",
        )),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Content ============

#[derive(Deserialize)]
struct IngestRequest {
    source: String,
    url: String,
    #[serde(default)]
    title: Option<String>,
    text: String,
}

async fn handle_ingest(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    body: Result<Json<IngestRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<IngestOutcome>), AppError> {
    let req = json_body(body)?;
    let outcome = state
        .ledger
        .ingest_raw_document(&caller, &req.source, &req.url, req.title.as_deref(), &req.text)
        .await?;
    let status = match outcome {
        IngestOutcome::Created { .. } => StatusCode::CREATED,
        _ => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}

#[derive(Deserialize)]
struct ProcessedRequest {
    raw_id: String,
    cleaned_text: String,
    #[serde(default)]
    metrics: ProcessingMetrics,
}

async fn handle_record_processed(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    body: Result<Json<ProcessedRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<RecordedDocument>), AppError> {
    let req = json_body(body)?;
    let recorded = state
        .ledger
        .record_processed_document(&caller, &req.raw_id, &req.cleaned_text, req.metrics)
        .await?;
    Ok((StatusCode::CREATED, Json(recorded)))
}

#[derive(Serialize)]
struct MarkReadyResponse {
    id: String,
    auto_train: Option<AutoTrainOutcome>,
}

async fn handle_mark_ready(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Path(id): Path<String>,
) -> Result<Json<MarkReadyResponse>, AppError> {
    let auto_train = state.ledger.mark_ready(&caller, &id).await?;
    Ok(Json(MarkReadyResponse { id, auto_train }))
}

// ============ Training ============

#[derive(Serialize)]
struct StatsResponse {
    #[serde(flatten)]
    stats: TrainingStats,
    sources: Vec<SourceStats>,
    usage: UsageTotals,
}

async fn handle_training_stats(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
) -> Result<Json<StatsResponse>, AppError> {
    let stats = state.ledger.get_training_stats(&caller).await?;
    let sources = state.ledger.stats().by_source(&caller).await?;
    let usage = state.ledger.usage().totals(&caller).await?;
    Ok(Json(StatsResponse {
        stats,
        sources,
        usage,
    }))
}

async fn handle_trigger_job(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    body: Result<Json<JobRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<TrainingJob>), AppError> {
    let req = json_body(body)?;
    let job = state.ledger.trigger_training_job(&caller, req).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

#[derive(Deserialize)]
struct ListJobsQuery {
    #[serde(default)]
    model: Option<String>,
    #[serde(default = "default_list_limit")]
    limit: i64,
}

fn default_list_limit() -> i64 {
    50
}

#[derive(Serialize)]
struct JobsResponse {
    jobs: Vec<TrainingJob>,
}

async fn handle_list_jobs(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<JobsResponse>, AppError> {
    let jobs = state
        .ledger
        .list_training_jobs(&caller, query.model.as_deref(), query.limit)
        .await?;
    Ok(Json(JobsResponse { jobs }))
}

async fn handle_get_job(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Path(id): Path<String>,
) -> Result<Json<TrainingJob>, AppError> {
    Ok(Json(state.ledger.get_training_job(&caller, &id).await?))
}

#[derive(Deserialize)]
struct AdvanceRequest {
    status: JobStatus,
    #[serde(flatten)]
    payload: AdvancePayload,
}

async fn handle_advance_job(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Path(id): Path<String>,
    body: Result<Json<AdvanceRequest>, JsonRejection>,
) -> Result<Json<TrainingJob>, AppError> {
    let req = json_body(body)?;
    let job = state
        .ledger
        .advance_training_job(&caller, &id, req.status, req.payload)
        .await?;
    Ok(Json(job))
}

// ============ Usage and quota ============

/// One record, or a buffered batch written atomically.
#[derive(Deserialize)]
#[serde(untagged)]
enum UsageBody {
    Batch { records: Vec<UsageRecord> },
    One(UsageRecord),
}

#[derive(Serialize)]
struct UsageResponse {
    recorded: u64,
}

async fn handle_record_usage(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    body: Result<Json<UsageBody>, JsonRejection>,
) -> Result<(StatusCode, Json<UsageResponse>), AppError> {
    let recorded = match json_body(body)? {
        UsageBody::One(record) => {
            state.ledger.record_api_usage(&caller, &record).await?;
            1
        }
        UsageBody::Batch { records } => {
            state.ledger.usage().record_batch(&caller, &records).await?
        }
    };
    Ok((StatusCode::ACCEPTED, Json(UsageResponse { recorded })))
}

#[derive(Serialize)]
struct QuotaResponse {
    #[serde(flatten)]
    quota: Quota,
    limits: LimitsBody,
    decision: QuotaDecision,
}

#[derive(Serialize)]
struct LimitsBody {
    requests_per_day: i64,
    tokens_per_day: i64,
}

impl From<QuotaLimits> for LimitsBody {
    fn from(l: QuotaLimits) -> Self {
        Self {
            requests_per_day: l.requests_per_day,
            tokens_per_day: l.tokens_per_day,
        }
    }
}

async fn handle_quota(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Path(user_id): Path<String>,
) -> Result<Json<QuotaResponse>, AppError> {
    let quota = state.ledger.get_user_quota(&caller, &user_id).await?;
    let limits = state.ledger.quota_limits().limits_for(quota.tier);
    let decision = quota.evaluate(&limits);
    Ok(Json(QuotaResponse {
        quota,
        limits: limits.into(),
        decision,
    }))
}

async fn handle_profile(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Path(user_id): Path<String>,
) -> Result<Json<UserProfile>, AppError> {
    Ok(Json(state.ledger.profiles().get(&caller, &user_id).await?))
}

#[derive(Deserialize)]
struct UpdateProfileRequest {
    email: String,
}

async fn handle_update_profile(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Path(user_id): Path<String>,
    body: Result<Json<UpdateProfileRequest>, JsonRejection>,
) -> Result<Json<UserProfile>, AppError> {
    let req = json_body(body)?;
    let profiles = state.ledger.profiles();
    profiles.update_email(&caller, &user_id, &req.email).await?;
    Ok(Json(profiles.get(&caller, &user_id).await?))
}

#[derive(Deserialize)]
struct LinkCustomerRequest {
    customer_id: String,
}

async fn handle_link_customer(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Path(user_id): Path<String>,
    body: Result<Json<LinkCustomerRequest>, JsonRejection>,
) -> Result<Json<UserProfile>, AppError> {
    let req = json_body(body)?;
    let profiles = state.ledger.profiles();
    profiles
        .link_billing_customer(&caller, &user_id, &req.customer_id)
        .await?;
    Ok(Json(profiles.get(&caller, &user_id).await?))
}

// ============ Accounts and billing ============

#[derive(Serialize)]
struct EventResponse {
    handlers: Vec<HandlerReport>,
}

async fn handle_account_event(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    body: Result<Json<AccountEvent>, JsonRejection>,
) -> Result<Json<EventResponse>, AppError> {
    let event = json_body(body)?;
    let handlers = state.ledger.handle_account_event(&caller, &event).await?;
    Ok(Json(EventResponse { handlers }))
}

async fn handle_billing_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookOutcome>, AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| bad_request("missing Stripe-Signature header"))?;
    let outcome = state.ledger.apply_billing_webhook(&body, signature).await?;
    Ok(Json(outcome))
}

// ============ Retention ============

async fn handle_retention(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
) -> Result<Json<CleanupReport>, AppError> {
    Ok(Json(state.ledger.run_retention_cleanup(&caller).await?))
}

// ============ Chat ============

#[derive(Deserialize)]
struct CreateSessionRequest {
    /// Defaults to the calling user.
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    model_version: Option<String>,
}

async fn handle_create_session(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    body: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ChatSession>), AppError> {
    let req = json_body(body)?;
    let user_id = match (req.user_id, &caller) {
        (Some(id), _) => id,
        (None, Caller::User(id)) => id.clone(),
        (None, Caller::Service) => return Err(bad_request("user_id is required")),
    };
    let session = state
        .ledger
        .chat()
        .create_session(&caller, &user_id, req.model_version.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn handle_append_message(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Path(session_id): Path<String>,
    body: Result<Json<NewMessage>, JsonRejection>,
) -> Result<(StatusCode, Json<ChatMessage>), AppError> {
    let message = json_body(body)?;
    let msg = state
        .ledger
        .chat()
        .append_message(&caller, &session_id, message)
        .await?;
    Ok((StatusCode::CREATED, Json(msg)))
}

#[derive(Deserialize)]
struct ListMessagesQuery {
    #[serde(default = "default_list_limit")]
    limit: i64,
}

#[derive(Serialize)]
struct MessagesResponse {
    messages: Vec<ChatMessage>,
}

async fn handle_list_messages(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Path(session_id): Path<String>,
    Query(query): Query<ListMessagesQuery>,
) -> Result<Json<MessagesResponse>, AppError> {
    let messages = state
        .ledger
        .chat()
        .list_messages(&caller, &session_id, query.limit)
        .await?;
    Ok(Json(MessagesResponse { messages }))
}
