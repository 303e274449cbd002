pub mod metrics;
pub mod registrar;
pub mod stream;

use axum::http::StatusCode;
use axum::response::Response;

use super::response::Envelope;

/// GET /
pub async fn root() -> Response {
    Envelope::message(StatusCode::OK, "success")
}
