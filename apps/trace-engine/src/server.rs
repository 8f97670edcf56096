use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{
    billing::{
        BillingError, BillingService,
        types::{CreditRequest, LedgerEntry, LedgerResponse, WalletAccount, WalletSettings},
    },
    bulk::{BulkService, BulkSubmitRequest, BulkSubmitResponse},
    config::Config,
    trace::{
        TraceError, TraceService,
        types::{BulkJob, TraceOutcome, TraceRecord, TraceRequest},
    },
};

mod helpers;

use helpers::caller_id;

const CALLER_HEADER: &str = "x-caller-id";
const DEFAULT_LEDGER_LIMIT: usize = 50;

#[derive(Clone)]
pub struct AppState {
    config: Config,
    pub traces: TraceService,
    pub bulk: BulkService,
    pub billing: BillingService,
    started_at: chrono::DateTime<Utc>,
}

impl AppState {
    #[must_use]
    pub fn new(
        config: Config,
        traces: TraceService,
        bulk: BulkService,
        billing: BillingService,
    ) -> Self {
        Self {
            config,
            traces,
            bulk,
            billing,
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: String,
    uptime_seconds: i64,
    persistence: &'static str,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    status: &'static str,
    provider_configured: bool,
    bulk_supervisor_enabled: bool,
}

#[derive(Debug, Default, Deserialize)]
struct SubmitTraceQuery {
    #[serde(default)]
    wait: bool,
}

#[derive(Debug, Default, Deserialize)]
struct LedgerQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct TraceRecordResponse {
    record: TraceRecord,
}

#[derive(Debug, Serialize)]
struct BulkJobResponse {
    job: BulkJob,
}

#[derive(Debug, Serialize)]
struct BulkRecordsResponse {
    bulk_job_id: String,
    records: Vec<TraceRecord>,
}

#[derive(Debug, Serialize)]
struct CreditResponse {
    entry: LedgerEntry,
    account: WalletAccount,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/readyz", get(readiness))
        .route("/v1/traces", post(submit_trace))
        .route("/v1/traces/:trace_id", get(get_trace).delete(clear_trace))
        .route("/v1/traces/:trace_id/record", get(get_trace_record))
        .route("/v1/bulk-jobs", post(submit_bulk_job))
        .route("/v1/bulk-jobs/:bulk_job_id", get(get_bulk_job))
        .route("/v1/bulk-jobs/:bulk_job_id/records", get(get_bulk_records))
        .route("/v1/wallet", get(get_wallet))
        .route("/v1/wallet/settings", axum::routing::put(put_wallet_settings))
        .route("/v1/wallet/ledger", get(get_wallet_ledger))
        .route("/v1/wallet/credits", post(post_wallet_credit))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime_seconds = (Utc::now() - state.started_at).num_seconds();
    Json(HealthResponse {
        status: "ok",
        service: state.config.service_name,
        uptime_seconds,
        persistence: if state.config.db_url.is_some() {
            "postgres"
        } else {
            "memory"
        },
    })
}

async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let provider_configured = state.config.provider_base_url.is_some();
    let status = if provider_configured {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            status: if provider_configured {
                "ready"
            } else {
                "not_ready"
            },
            provider_configured,
            bulk_supervisor_enabled: state.bulk.supervisor().is_some(),
        }),
    )
}

async fn submit_trace(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SubmitTraceQuery>,
    Json(body): Json<TraceRequest>,
) -> Result<Json<TraceOutcome>, ApiError> {
    let caller_id = caller_id(&headers)?;
    let outcome = if query.wait {
        state.traces.submit_and_wait(&caller_id, &body).await?
    } else {
        state.traces.submit(&caller_id, &body).await?
    };
    Ok(Json(outcome))
}

async fn get_trace(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(trace_id): Path<String>,
) -> Result<Json<TraceOutcome>, ApiError> {
    let caller_id = caller_id(&headers)?;
    Ok(Json(state.traces.status(&caller_id, &trace_id).await?))
}

async fn get_trace_record(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(trace_id): Path<String>,
) -> Result<Json<TraceRecordResponse>, ApiError> {
    let caller_id = caller_id(&headers)?;
    let record = state.traces.get_record(&caller_id, &trace_id).await?;
    Ok(Json(TraceRecordResponse { record }))
}

async fn clear_trace(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(trace_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let caller_id = caller_id(&headers)?;
    state.traces.clear(&caller_id, &trace_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn submit_bulk_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<BulkSubmitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let caller_id = caller_id(&headers)?;
    let response: BulkSubmitResponse = state.bulk.submit(&caller_id, body).await?;
    let status = if response.bulk_job_id.is_some() {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(response)))
}

async fn get_bulk_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(bulk_job_id): Path<String>,
) -> Result<Json<BulkJobResponse>, ApiError> {
    let caller_id = caller_id(&headers)?;
    let job = state.bulk.poll(&caller_id, &bulk_job_id).await?;
    Ok(Json(BulkJobResponse { job }))
}

async fn get_bulk_records(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(bulk_job_id): Path<String>,
) -> Result<Json<BulkRecordsResponse>, ApiError> {
    let caller_id = caller_id(&headers)?;
    let records = state.bulk.records(&caller_id, &bulk_job_id).await?;
    Ok(Json(BulkRecordsResponse {
        bulk_job_id,
        records,
    }))
}

async fn get_wallet(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<WalletAccount>, ApiError> {
    let caller_id = caller_id(&headers)?;
    Ok(Json(state.billing.account(&caller_id).await?))
}

async fn put_wallet_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<WalletSettings>,
) -> Result<Json<WalletAccount>, ApiError> {
    let caller_id = caller_id(&headers)?;
    Ok(Json(state.billing.configure_account(&caller_id, body).await?))
}

async fn get_wallet_ledger(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<LedgerQuery>,
) -> Result<Json<LedgerResponse>, ApiError> {
    let caller_id = caller_id(&headers)?;
    let entries = state
        .billing
        .ledger(&caller_id, query.limit.unwrap_or(DEFAULT_LEDGER_LIMIT))
        .await?;
    Ok(Json(LedgerResponse { caller_id, entries }))
}

async fn post_wallet_credit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreditRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let caller_id = caller_id(&headers)?;
    let entry = state
        .billing
        .credit(
            &caller_id,
            body.amount_cents,
            body.reason.as_deref().unwrap_or_default(),
        )
        .await?;
    let account = state.billing.account(&caller_id).await?;
    Ok((StatusCode::CREATED, Json(CreditResponse { entry, account })))
}

#[derive(Debug)]
enum ApiError {
    Unauthorized(String),
    Validation { field: String, message: String },
    InsufficientFunds {
        required_cents: i64,
        available_cents: i64,
    },
    RateLimited { retry_after_ms: u64 },
    BadGateway { code: &'static str, message: String },
    NotFound,
    Conflict(String),
    InvalidRequest(String),
    Internal(String),
}

impl From<TraceError> for ApiError {
    fn from(error: TraceError) -> Self {
        match error {
            TraceError::Validation(error) => Self::Validation {
                field: error.field.as_str().to_string(),
                message: error.message,
            },
            TraceError::InsufficientFunds {
                required_cents,
                available_cents,
            } => Self::InsufficientFunds {
                required_cents,
                available_cents,
            },
            TraceError::RateLimited { retry_after_ms } => Self::RateLimited { retry_after_ms },
            TraceError::Submission(_) | TraceError::ProviderUnavailable(_) => Self::BadGateway {
                code: error.code(),
                message: error.message(),
            },
            TraceError::NotFound => Self::NotFound,
            TraceError::Conflict(message) => Self::Conflict(message),
            TraceError::InvalidRequest(message) => Self::InvalidRequest(message),
            TraceError::Internal(message) => Self::Internal(message),
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(error: BillingError) -> Self {
        Self::from(TraceError::from(error))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        match self {
            Self::Unauthorized(message) => (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({
                    "error": "unauthorized",
                    "message": message,
                })),
            )
                .into_response(),
            Self::Validation { field, message } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(serde_json::json!({
                    "error": "validation_error",
                    "field": field,
                    "message": message,
                })),
            )
                .into_response(),
            Self::InsufficientFunds {
                required_cents,
                available_cents,
            } => (
                StatusCode::PAYMENT_REQUIRED,
                Json(serde_json::json!({
                    "error": "insufficient_funds",
                    "required_cents": required_cents,
                    "available_cents": available_cents,
                })),
            )
                .into_response(),
            Self::RateLimited { retry_after_ms } => (
                StatusCode::TOO_MANY_REQUESTS,
                Json(serde_json::json!({
                    "error": "rate_limited",
                    "message": "provider rate limited the request",
                    "retry_after_ms": retry_after_ms,
                })),
            )
                .into_response(),
            Self::BadGateway { code, message } => (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({
                    "error": code,
                    "message": message,
                })),
            )
                .into_response(),
            Self::NotFound => (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({
                    "error": "not_found",
                })),
            )
                .into_response(),
            Self::Conflict(message) => (
                StatusCode::CONFLICT,
                Json(serde_json::json!({
                    "error": "conflict",
                    "message": message,
                })),
            )
                .into_response(),
            Self::InvalidRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": "invalid_request",
                    "message": message,
                })),
            )
                .into_response(),
            Self::Internal(message) => {
                tracing::error!(reason = %message, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({
                        "error": "internal",
                        "message": message,
                    })),
                )
                    .into_response()
            }
        }
    }
}
