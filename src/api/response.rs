//! JSON response envelope
//!
//! Every JSON endpoint answers `{"status": <code>, "data": <string or
//! json>}` with the HTTP status set to the same code.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct Envelope {
    pub status: u16,
    pub data: serde_json::Value,
}

impl Envelope {
    /// Envelope with a plain string message
    pub fn message(status: StatusCode, message: impl Into<String>) -> Response {
        let body = Self {
            status: status.as_u16(),
            data: serde_json::Value::String(message.into()),
        };
        (status, Json(body)).into_response()
    }

    /// Envelope with raw JSON in `data`
    pub fn raw(status: StatusCode, data: serde_json::Value) -> Response {
        let body = Self {
            status: status.as_u16(),
            data,
        };
        (status, Json(body)).into_response()
    }
}
