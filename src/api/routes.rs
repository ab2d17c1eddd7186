use super::error::ApiError;
use super::payment_header::{extract_payment, settlement_header, X_PAYMENT_RESPONSE};
use super::AppState;
use crate::error::Error;
use crate::payment::{unix_now, Address, SettlementResult};
use crate::protocol::{Handled, Outcome};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

const INVALID_SIZE: &str = "missing or invalid sizeBytes";
const INVALID_USAGE: &str = "missing or invalid usedMB";

type ApiResult = std::result::Result<Response, ApiError>;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SizeBody {
    size_bytes: u64,
}

#[derive(Deserialize)]
struct UsageBody {
    #[serde(rename = "usedMB")]
    used_mb: f64,
}

fn parse_payer(raw: &str) -> Result<Address, ApiError> {
    raw.parse::<Address>().map_err(ApiError::from)
}

/// Parse a JSON body, answering `message` rather than the parser's text.
fn parse_body<T: DeserializeOwned>(body: &[u8], message: &str) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| {
        debug!("Rejected request body: {e}");
        ApiError(Error::Validation(message.to_string()))
    })
}

fn bearer(headers: &HeaderMap) -> &str {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default()
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    if state.admin_matches(bearer(headers)) {
        Ok(())
    } else {
        Err(ApiError(Error::Unauthorized))
    }
}

fn require_storage(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    if state.storage_matches(bearer(headers)) {
        Ok(())
    } else {
        Err(ApiError(Error::Unauthorized))
    }
}

/// Render a protocol outcome, placing a granted resource under `key`.
fn respond<T: Serialize>(handled: Handled<T>, key: &str) -> Response {
    match handled.outcome {
        Outcome::Challenged(challenge) => {
            (StatusCode::PAYMENT_REQUIRED, Json(*challenge)).into_response()
        }
        Outcome::Rejected(rejection) => {
            (StatusCode::PAYMENT_REQUIRED, Json(*rejection)).into_response()
        }
        Outcome::Granted {
            resource,
            settlement,
        } => granted(key, &resource, settlement.as_ref(), false),
        Outcome::GrantedWithSettlementFailure {
            resource,
            settlement,
        } => granted(key, &resource, Some(&settlement), true),
    }
}

fn granted<T: Serialize>(
    key: &str,
    resource: &T,
    settlement: Option<&SettlementResult>,
    settlement_failed: bool,
) -> Response {
    let mut body = serde_json::Map::new();
    body.insert("success".to_string(), Value::Bool(true));
    body.insert(
        key.to_string(),
        serde_json::to_value(resource).unwrap_or(Value::Null),
    );
    if let Some(settlement) = settlement {
        body.insert(
            "settlement".to_string(),
            serde_json::to_value(settlement).unwrap_or(Value::Null),
        );
    }
    if settlement_failed {
        body.insert("settlementFailed".to_string(), Value::Bool(true));
    }

    let mut response = Json(Value::Object(body)).into_response();
    if let Some(value) = settlement.and_then(settlement_header) {
        response.headers_mut().insert(X_PAYMENT_RESPONSE, value);
    }
    response
}

pub(super) async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

pub(super) async fn tiers(State(state): State<AppState>) -> Response {
    Json(state.handler.tier_catalog_at(unix_now())).into_response()
}

pub(super) async fn purchase_subscription(
    State(state): State<AppState>,
    Path(tier_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    let payment = extract_payment(&headers, &body)?;
    let handled = state
        .handler
        .handle_subscription(&tier_id, payment.as_ref())
        .await?;
    Ok(respond(handled, "subscription"))
}

pub(super) async fn subscription_status(
    State(state): State<AppState>,
    Path(payer): Path<String>,
) -> ApiResult {
    let payer = parse_payer(&payer)?;
    Ok(Json(state.handler.subscription_status(&payer)).into_response())
}

pub(super) async fn admit_upload(
    State(state): State<AppState>,
    Path(payer): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    require_storage(&state, &headers)?;
    let payer = parse_payer(&payer)?;
    let SizeBody { size_bytes } = parse_body(&body, INVALID_SIZE)?;
    let decision = state.handler.admit_upload(payer, size_bytes).await?;
    if decision.allowed {
        Ok(Json(json!({
            "success": true,
            "allowed": true,
            "remainingMB": decision.remaining_mb,
        }))
        .into_response())
    } else {
        Ok((
            StatusCode::FORBIDDEN,
            Json(json!({
                "success": false,
                "error": "Quota exceeded",
                "allowed": false,
                "remainingMB": decision.remaining_mb,
            })),
        )
            .into_response())
    }
}

pub(super) async fn release_upload(
    State(state): State<AppState>,
    Path(payer): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    require_storage(&state, &headers)?;
    let payer = parse_payer(&payer)?;
    let SizeBody { size_bytes } = parse_body(&body, INVALID_SIZE)?;
    let used_mb = state.handler.release_upload(payer, size_bytes).await?;
    Ok(Json(json!({ "success": true, "usedMB": used_mb })).into_response())
}

pub(super) async fn list_feeds(State(state): State<AppState>) -> Response {
    Json(json!({
        "feeds": state.handler.feeds().list(),
        "signerPublicKey": state.handler.signer().public_key_hex(),
    }))
    .into_response()
}

pub(super) async fn fetch_feed(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> ApiResult {
    let payment = extract_payment(&headers, &[])?;
    let handled = state.handler.handle_feed(&name, payment.as_ref()).await?;
    Ok(respond(handled, "packet"))
}

pub(super) async fn sync_all(State(state): State<AppState>, headers: HeaderMap) -> ApiResult {
    require_admin(&state, &headers)?;
    let summary = state.handler.meter().sync_all().await;
    Ok(Json(json!({
        "success": true,
        "checked": summary.reports.len(),
        "corrected": summary.corrected(),
        "failed": summary.failed,
        "reports": summary.reports,
    }))
    .into_response())
}

pub(super) async fn sync_payer(
    State(state): State<AppState>,
    Path(payer): Path<String>,
    headers: HeaderMap,
) -> ApiResult {
    require_admin(&state, &headers)?;
    let payer = parse_payer(&payer)?;
    let report = state.handler.meter().sync_payer(payer).await?;
    Ok(Json(json!({ "success": true, "report": report })).into_response())
}

pub(super) async fn override_usage(
    State(state): State<AppState>,
    Path(payer): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    require_admin(&state, &headers)?;
    let payer = parse_payer(&payer)?;
    let UsageBody { used_mb } = parse_body(&body, INVALID_USAGE)?;
    let report = state.handler.meter().override_usage(payer, used_mb).await?;
    Ok(Json(json!({ "success": true, "report": report })).into_response())
}
