//! HTTP routes
//!
//! Tenant ids in paths are trusted; identity is established upstream.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use prometheus::{Encoder, Registry, TextEncoder};
use quotaguard_common::{Feature, PolicyError, QuotaError, TenantId, VERSION};
use quotaguard_meter::{AuditEntry, ConsumeResult, Decision, DenialReason, UsageMeter};
use serde::Deserialize;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::error;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub meter: Arc<UsageMeter>,
    pub registry: Arc<Registry>,
    pub backend: &'static str,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/tenants/:tenant/usage", get(all_usage))
        .route("/v1/tenants/:tenant/usage/:feature", get(can_use))
        .route("/v1/tenants/:tenant/usage/:feature/consume", post(consume))
        .route("/v1/tenants/:tenant/history", get(history))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Engine errors as HTTP responses
pub struct ApiError(QuotaError);

impl From<QuotaError> for ApiError {
    fn from(err: QuotaError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            QuotaError::InvalidAmount
            | QuotaError::InvalidTenant
            | QuotaError::UnknownFeature(_)
            | QuotaError::Policy(PolicyError::NotCumulative(_)) => StatusCode::BAD_REQUEST,
            err if err.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

fn tenant_id(raw: String) -> Result<TenantId, ApiError> {
    Ok(TenantId::new(raw)?)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": VERSION,
        "backend": state.backend,
    }))
}

async fn metrics(State(state): State<AppState>) -> Response {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&state.registry.gather(), &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
        buffer,
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct AmountQuery {
    amount: Option<u64>,
}

async fn can_use(
    State(state): State<AppState>,
    Path((tenant, feature)): Path<(String, String)>,
    Query(query): Query<AmountQuery>,
) -> Result<Json<Decision>, ApiError> {
    let tenant = tenant_id(tenant)?;
    let decision = state
        .meter
        .can_use_named(&tenant, &feature, query.amount.unwrap_or(1))
        .await?;
    Ok(Json(decision))
}

#[derive(Debug, Default, Deserialize)]
struct ConsumeBody {
    amount: Option<u64>,
}

async fn consume(
    State(state): State<AppState>,
    Path((tenant, feature)): Path<(String, String)>,
    body: Bytes,
) -> Result<(StatusCode, Json<ConsumeResult>), ApiError> {
    let tenant = tenant_id(tenant)?;
    let amount = consume_amount(&body)?;
    let result = state.meter.consume_named(&tenant, &feature, amount).await?;
    Ok((consume_status(&result), Json(result)))
}

/// Amount from a consume body; only an absent or blank body means one unit
fn consume_amount(body: &[u8]) -> Result<u64, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(1);
    }
    let body: ConsumeBody =
        serde_json::from_slice(body).map_err(|_| ApiError(QuotaError::InvalidAmount))?;
    Ok(body.amount.unwrap_or(1))
}

/// Status code for a consume outcome; the body always carries the full result
fn consume_status(result: &ConsumeResult) -> StatusCode {
    match result.denial {
        None => StatusCode::OK,
        Some(DenialReason::QuotaExceeded) => StatusCode::TOO_MANY_REQUESTS,
        Some(DenialReason::UnmappedFeature) => StatusCode::FORBIDDEN,
        Some(DenialReason::OutcomeUnknown) => StatusCode::GATEWAY_TIMEOUT,
        Some(
            DenialReason::StoreUnavailable
            | DenialReason::SubscriptionUnavailable
            | DenialReason::ConcurrencyConflict,
        ) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn all_usage(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> Result<Json<BTreeMap<Feature, Decision>>, ApiError> {
    let tenant = tenant_id(tenant)?;
    Ok(Json(state.meter.all_usage(&tenant).await?))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    feature: Option<String>,
    limit: Option<usize>,
}

async fn history(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<AuditEntry>>, ApiError> {
    let tenant = tenant_id(tenant)?;
    let feature = query
        .feature
        .as_deref()
        .map(str::parse::<Feature>)
        .transpose()?;
    Ok(Json(state.meter.history(&tenant, feature, query.limit).await?))
}
