//! Metric submission, heartbeat, and fetch endpoints
//!
//! Fetch handlers enqueue a request against the metrics store and poll the
//! response handle with a deadline; an expired deadline marks the handle
//! timed out and answers 504 so the worker knows not to touch it.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Response;
use tracing::debug;

use crate::api::response::Envelope;
use crate::api::state::ApiState;
use crate::services::metrics::{FETCH_DEADLINE, FetchResponse, MetricsStore};
use crate::{Heartbeat, Reading};

/// GET /metric/submit/{reading}
pub async fn submit(State(state): State<ApiState>, Path(blob): Path<String>) -> Response {
    let reading: Reading = match serde_json::from_str(&blob) {
        Ok(reading) => reading,
        Err(e) => {
            debug!("rejecting malformed reading: {e}");
            return Envelope::message(StatusCode::BAD_REQUEST, "malformed reading");
        }
    };

    state.ingest.submit(reading);
    Envelope::message(StatusCode::OK, "success")
}

/// GET /metric/heartbeat/{hb}
pub async fn heartbeat(State(state): State<ApiState>, Path(blob): Path<String>) -> Response {
    let heartbeat: Heartbeat = match serde_json::from_str(&blob) {
        Ok(heartbeat) => heartbeat,
        Err(e) => {
            debug!("rejecting malformed heartbeat: {e}");
            return Envelope::message(StatusCode::BAD_REQUEST, "malformed heartbeat");
        }
    };

    state.heartbeats.submit(&heartbeat.node_id);
    Envelope::message(StatusCode::OK, "success")
}

/// Shared tail of every fetch endpoint: wait on the handle, answer raw
/// JSON on completion or 504 on deadline expiry
async fn finish_fetch(response: Arc<FetchResponse>) -> Response {
    match response.wait(FETCH_DEADLINE).await {
        Some(result) => {
            let data = serde_json::from_str(&result)
                .unwrap_or(serde_json::Value::String(result));
            Envelope::raw(StatusCode::OK, data)
        }
        None => Envelope::message(StatusCode::GATEWAY_TIMEOUT, "fetch timed out"),
    }
}

fn metrics_store(state: &ApiState) -> Result<&Arc<MetricsStore>, Response> {
    state.metrics.as_ref().ok_or_else(|| {
        Envelope::message(StatusCode::NOT_IMPLEMENTED, "metric database disabled")
    })
}

/// GET /metric/fetch/nodes
pub async fn fetch_nodes(State(state): State<ApiState>) -> Response {
    let store = match metrics_store(&state) {
        Ok(store) => store,
        Err(response) => return response,
    };

    let response = FetchResponse::new();
    if !store.fetch_nodes(response.clone()) {
        return Envelope::message(StatusCode::INTERNAL_SERVER_ERROR, "server error");
    }
    finish_fetch(response).await
}

/// GET /metric/fetch/{node}/sensors
pub async fn fetch_sensors(State(state): State<ApiState>, Path(node): Path<String>) -> Response {
    let store = match metrics_store(&state) {
        Ok(store) => store,
        Err(response) => return response,
    };

    let response = FetchResponse::new();
    if !store.fetch_sensors(response.clone(), &node) {
        return Envelope::message(StatusCode::INTERNAL_SERVER_ERROR, "server error");
    }
    finish_fetch(response).await
}

/// GET /metric/fetch/{node}/range/{start}/{end}
pub async fn fetch_range(
    State(state): State<ApiState>,
    Path((node, start, end)): Path<(String, String, String)>,
) -> Response {
    let (Ok(start), Ok(end)) = (start.parse::<i64>(), end.parse::<i64>()) else {
        return Envelope::message(StatusCode::BAD_REQUEST, "malformed time range");
    };
    if end <= start {
        return Envelope::message(StatusCode::BAD_REQUEST, "range end must be after start");
    }

    let store = match metrics_store(&state) {
        Ok(store) => store,
        Err(response) => return response,
    };

    let response = FetchResponse::new();
    if !store.fetch_range(response.clone(), &node, start, end) {
        return Envelope::message(StatusCode::INTERNAL_SERVER_ERROR, "server error");
    }
    finish_fetch(response).await
}

/// GET /metric/fetch/{node}/after/{ts}
pub async fn fetch_after(
    State(state): State<ApiState>,
    Path((node, ts)): Path<(String, String)>,
) -> Response {
    let Ok(ts) = ts.parse::<i64>() else {
        return Envelope::message(StatusCode::BAD_REQUEST, "malformed timestamp");
    };
    if ts > chrono::Utc::now().timestamp() {
        return Envelope::message(StatusCode::BAD_REQUEST, "timestamp is in the future");
    }

    let store = match metrics_store(&state) {
        Ok(store) => store,
        Err(response) => return response,
    };

    let response = FetchResponse::new();
    if !store.fetch_after(response.clone(), &node, ts) {
        return Envelope::message(StatusCode::INTERNAL_SERVER_ERROR, "server error");
    }
    finish_fetch(response).await
}

/// GET /metric/fetch/{node}/before/{ts}
pub async fn fetch_before(
    State(state): State<ApiState>,
    Path((node, ts)): Path<(String, String)>,
) -> Response {
    let Ok(ts) = ts.parse::<i64>() else {
        return Envelope::message(StatusCode::BAD_REQUEST, "malformed timestamp");
    };
    if ts > chrono::Utc::now().timestamp() {
        return Envelope::message(StatusCode::BAD_REQUEST, "timestamp is in the future");
    }

    let store = match metrics_store(&state) {
        Ok(store) => store,
        Err(response) => return response,
    };

    let response = FetchResponse::new();
    if !store.fetch_before(response.clone(), &node, ts) {
        return Envelope::message(StatusCode::INTERNAL_SERVER_ERROR, "server error");
    }
    finish_fetch(response).await
}
