//! Registration database endpoints
//!
//! Values stored through `add` must decode as a node or a controller;
//! arbitrary blobs are rejected before they can poison runtime lookups.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use crate::api::response::Envelope;
use crate::api::state::ApiState;
use crate::{Controller, Node};

/// GET /registrar/probe/{key}
pub async fn probe(State(state): State<ApiState>, Path(key): Path<String>) -> Response {
    debug!("probe for key: {key}");

    match state.registrar.exists(&key) {
        Ok(true) => Envelope::message(StatusCode::OK, "found"),
        Ok(false) => Envelope::message(StatusCode::OK, "not found"),
        Err(_) => Envelope::message(StatusCode::INTERNAL_SERVER_ERROR, "server error"),
    }
}

/// GET /registrar/add/{key}/{value}
pub async fn add(
    State(state): State<ApiState>,
    Path((key, value)): Path<(String, String)>,
) -> Response {
    debug!("add registration for key: {key}");

    let is_node = serde_json::from_str::<Node>(&value).is_ok();
    let is_controller = serde_json::from_str::<Controller>(&value).is_ok();
    if !is_node && !is_controller {
        return Envelope::message(
            StatusCode::BAD_REQUEST,
            "value is neither a node nor a controller",
        );
    }

    match state.registrar.store(&key, &value) {
        Ok(()) => Envelope::message(StatusCode::OK, "success"),
        Err(_) => Envelope::message(StatusCode::INTERNAL_SERVER_ERROR, "server error"),
    }
}

/// GET /registrar/fetch/{key}
///
/// Answers the raw stored blob as `text/plain`; an absent key is an
/// envelope, not an HTTP error.
pub async fn fetch(State(state): State<ApiState>, Path(key): Path<String>) -> Response {
    debug!("fetch registration for key: {key}");

    match state.registrar.load(&key) {
        Ok(Some(value)) => value.into_response(),
        Ok(None) => Envelope::message(StatusCode::OK, "not found"),
        Err(_) => Envelope::message(StatusCode::INTERNAL_SERVER_ERROR, "server error"),
    }
}

/// GET /registrar/delete/{key}
pub async fn remove(State(state): State<ApiState>, Path(key): Path<String>) -> Response {
    debug!("delete registration for key: {key}");

    match state.registrar.remove(&key) {
        Ok(()) => Envelope::message(StatusCode::OK, "success"),
        Err(_) => Envelope::message(StatusCode::INTERNAL_SERVER_ERROR, "server error"),
    }
}
