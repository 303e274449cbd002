//! Shared state handed to every handler

use std::sync::Arc;

use crate::heartbeat::HeartbeatLedger;
use crate::registrar::RegistrarDb;
use crate::services::ingest::IngestPipeline;
use crate::services::metrics::MetricsStore;
use crate::services::stream::StreamFanout;

/// Non-owning handles to the core components; the supervisor owns the
/// lifecycles
#[derive(Clone)]
pub struct ApiState {
    pub registrar: Arc<RegistrarDb>,
    pub stream: Arc<StreamFanout>,
    pub ingest: Arc<IngestPipeline>,
    pub heartbeats: Arc<HeartbeatLedger>,
    /// Absent when metric persistence is disabled by configuration
    pub metrics: Option<Arc<MetricsStore>>,
}
