//! Stream subscriber registration endpoints

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Response;
use tracing::debug;

use crate::api::response::Envelope;
use crate::api::state::ApiState;

fn parse_port(raw: &str) -> Option<u16> {
    match raw.parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}

/// GET /metric/stream/add/{addr}/{port}
pub async fn add_destination(
    State(state): State<ApiState>,
    Path((addr, port)): Path<(String, String)>,
) -> Response {
    let Some(port) = parse_port(&port) else {
        return Envelope::message(StatusCode::BAD_REQUEST, format!("Invalid port given : {port}"));
    };

    debug!("queueing stream destination add {addr}:{port}");
    state.stream.add_destination(&addr, port);
    Envelope::message(StatusCode::OK, "success")
}

/// GET /metric/stream/delete/{addr}/{port}
pub async fn remove_destination(
    State(state): State<ApiState>,
    Path((addr, port)): Path<(String, String)>,
) -> Response {
    let Some(port) = parse_port(&port) else {
        return Envelope::message(StatusCode::BAD_REQUEST, format!("Invalid port given : {port}"));
    };

    debug!("queueing stream destination delete {addr}:{port}");
    state.stream.remove_destination(&addr, port);
    Envelope::message(StatusCode::OK, "success")
}
