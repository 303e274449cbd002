//! HTTP front-end
//!
//! Adapts the frozen external endpoint surface onto the core components.
//! Handlers decode and validate path parameters themselves so malformed
//! input always yields the JSON envelope rather than a framework
//! rejection.
//!
//! ## Endpoints
//!
//! - `GET /metric/stream/add/{addr}/{port}` - register a stream subscriber
//! - `GET /metric/stream/delete/{addr}/{port}` - remove a stream subscriber
//! - `GET /registrar/probe/{key}` - check for a registration
//! - `GET /registrar/add/{key}/{value}` - validate and store a node or controller
//! - `GET /registrar/fetch/{key}` - load a raw registration blob
//! - `GET /registrar/delete/{key}` - remove a registration
//! - `GET /metric/submit/{reading}` - submit a reading for ingestion
//! - `GET /metric/heartbeat/{hb}` - record a node heartbeat
//! - `GET /metric/fetch/nodes` - distinct nodes with stored metrics
//! - `GET /metric/fetch/{node}/sensors` - distinct sensors for a node
//! - `GET /metric/fetch/{node}/range/{start}/{end}` - readings in a time range
//! - `GET /metric/fetch/{node}/after/{ts}` - readings after a time
//! - `GET /metric/fetch/{node}/before/{ts}` - readings before a time

pub mod response;
pub mod routes;
pub mod state;

pub use response::Envelope;
pub use state::ApiState;

use std::net::SocketAddr;

use axum::{Router, routing::get};
use tracing::info;

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Bind address (e.g. "0.0.0.0:8080")
    pub bind_addr: SocketAddr,
}

/// Spawn the HTTP server in a background task, returning its local address
pub async fn spawn_api_server(config: ApiConfig, state: ApiState) -> anyhow::Result<SocketAddr> {
    use tower_http::trace::TraceLayer;

    info!("starting app web server on {}", config.bind_addr);

    let app = Router::new()
        .route("/", get(routes::root))
        .route(
            "/metric/stream/add/{addr}/{port}",
            get(routes::stream::add_destination),
        )
        .route(
            "/metric/stream/delete/{addr}/{port}",
            get(routes::stream::remove_destination),
        )
        .route("/registrar/probe/{key}", get(routes::registrar::probe))
        .route("/registrar/add/{key}/{value}", get(routes::registrar::add))
        .route("/registrar/fetch/{key}", get(routes::registrar::fetch))
        .route("/registrar/delete/{key}", get(routes::registrar::remove))
        .route("/metric/submit/{reading}", get(routes::metrics::submit))
        .route("/metric/heartbeat/{hb}", get(routes::metrics::heartbeat))
        .route("/metric/fetch/nodes", get(routes::metrics::fetch_nodes))
        .route(
            "/metric/fetch/{node}/sensors",
            get(routes::metrics::fetch_sensors),
        )
        .route(
            "/metric/fetch/{node}/range/{start}/{end}",
            get(routes::metrics::fetch_range),
        )
        .route(
            "/metric/fetch/{node}/after/{ts}",
            get(routes::metrics::fetch_after),
        )
        .route(
            "/metric/fetch/{node}/before/{ts}",
            get(routes::metrics::fetch_before),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    let addr = listener.local_addr()?;

    info!("app web server listening on {addr}");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("app web server error: {e}");
        }
    });

    Ok(addr)
}
