//! Response envelope.
//!
//! Management endpoints answer `{code, message, data}`; the HTTP status
//! mirrors the code family (20000 → 200, 40402 → 404, ...). Service
//! invocation bodies pass through the provider payload instead and only
//! fall back to the envelope on failure.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::error::GatewayError;

/// Success code.
pub const CODE_OK: u32 = 20000;

/// The `{code, message, data}` envelope.
#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    /// Status code; leading digits mirror the HTTP status.
    pub code: u32,
    /// Human-readable status.
    pub message: String,
    /// Payload, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

/// A 200 envelope with data.
pub fn ok<T: Serialize>(data: T) -> Response {
    (
        StatusCode::OK,
        Json(Envelope {
            code: CODE_OK,
            message: "success".to_string(),
            data: Some(data),
        }),
    )
        .into_response()
}

/// A 200 envelope with no data.
pub fn ok_empty() -> Response {
    (
        StatusCode::OK,
        Json(Envelope::<()> {
            code: CODE_OK,
            message: "success".to_string(),
            data: None,
        }),
    )
        .into_response()
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (
            status,
            Json(Envelope::<()> {
                code: self.code(),
                message: self.to_string(),
                data: None,
            }),
        )
            .into_response()
    }
}
