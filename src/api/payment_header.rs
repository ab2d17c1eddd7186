//! x402 payment headers.
//!
//! `X-PAYMENT` carries the base64 JSON `PaymentPayload`; `X-PAYMENT-RESPONSE`
//! carries the base64 JSON `SettlementResult`.

use crate::error::{Error, Result};
use crate::payment::{PaymentPayload, SettlementResult};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::debug;

const INVALID_HEADER: &str = "X-PAYMENT is not valid base64 JSON";
const INVALID_BODY: &str = "request body is not valid JSON";
const INVALID_PAYMENT: &str = "payment is not a valid x402 payment payload";

fn invalid(message: &str, cause: impl std::fmt::Display) -> Error {
    debug!("{message}: {cause}");
    Error::Validation(message.to_string())
}

/// Request header with the payment.
pub const X_PAYMENT: HeaderName = HeaderName::from_static("x-payment");

/// Response header with the settlement outcome.
pub const X_PAYMENT_RESPONSE: HeaderName = HeaderName::from_static("x-payment-response");

/// Decode an `X-PAYMENT` header value.
///
/// # Errors
///
/// Returns `Error::Validation` if the value is not base64 JSON of a payment.
pub fn decode_payment_header(value: &str) -> Result<PaymentPayload> {
    let raw = STANDARD
        .decode(value.trim())
        .map_err(|e| invalid(INVALID_HEADER, e))?;
    serde_json::from_slice(&raw).map_err(|e| invalid(INVALID_HEADER, e))
}

/// Encode a payment for the `X-PAYMENT` header.
///
/// # Errors
///
/// Returns an error if the payload cannot be serialized.
pub fn encode_payment_header(payload: &PaymentPayload) -> Result<String> {
    Ok(STANDARD.encode(serde_json::to_vec(payload)?))
}

/// Header value for `X-PAYMENT-RESPONSE`.
#[must_use]
pub fn settlement_header(settlement: &SettlementResult) -> Option<HeaderValue> {
    let json = serde_json::to_vec(settlement).ok()?;
    HeaderValue::from_str(&STANDARD.encode(json)).ok()
}

/// The payment attached to a request, from the `X-PAYMENT` header or a
/// `payment` field in a JSON body.
///
/// # Errors
///
/// Returns `Error::Validation` for a malformed header, body or payment.
pub fn extract_payment(headers: &HeaderMap, body: &[u8]) -> Result<Option<PaymentPayload>> {
    if let Some(value) = headers.get(&X_PAYMENT) {
        let value = value
            .to_str()
            .map_err(|e| invalid(INVALID_HEADER, e))?;
        return decode_payment_header(value).map(Some);
    }
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let json: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| invalid(INVALID_BODY, e))?;
    match json.get("payment") {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(payment) => serde_json::from_value(payment.clone())
            .map(Some)
            .map_err(|e| invalid(INVALID_PAYMENT, e)),
    }
}
