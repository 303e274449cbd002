//! Reading ingestion pipeline
//!
//! The front door for telemetry. Candidate readings are queued as they
//! arrive; the worker validates each against the registrar (the node must
//! exist and declare the sensor) and forks validated readings to the
//! metrics store, the rule engine, the heartbeat ledger, and the stream
//! fan-out. A reading refused by the fan-out is re-queued at the tail and
//! retried on a later burst, up to a small attempt cap.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::heartbeat::HeartbeatLedger;
use crate::registrar::RegistrarDb;
use crate::services::metrics::MetricsStore;
use crate::services::rules::RuleEngine;
use crate::services::stream::StreamFanout;
use crate::{Node, Reading};

/// Worker cadence
const WORKER_INTERVAL: Duration = Duration::from_millis(500);

/// Maximum readings validated per worker iteration
const MAX_METRICS_PER_BURST: usize = 100;

/// Submission attempts before a fan-out-refused reading is dropped
const MAX_SUBMISSION_ATTEMPTS: u8 = 3;

#[derive(Debug, Clone)]
struct PendingReading {
    submission_attempts: u8,
    reading: Reading,
}

struct Inner {
    registrar: Arc<RegistrarDb>,
    stream: Option<Arc<StreamFanout>>,
    metrics: Option<Arc<MetricsStore>>,
    rules: Option<Arc<RuleEngine>>,
    heartbeats: Option<Arc<HeartbeatLedger>>,
    reading_queue: Mutex<VecDeque<PendingReading>>,
    running: AtomicBool,
}

/// Validate-and-fork pipeline between the ingress adapter and everything
/// downstream
pub struct IngestPipeline {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl IngestPipeline {
    pub fn new(
        registrar: Arc<RegistrarDb>,
        stream: Option<Arc<StreamFanout>>,
        metrics: Option<Arc<MetricsStore>>,
        rules: Option<Arc<RuleEngine>>,
        heartbeats: Option<Arc<HeartbeatLedger>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registrar,
                stream,
                metrics,
                rules,
                heartbeats,
                reading_queue: Mutex::new(VecDeque::new()),
                running: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Enqueue a candidate reading for validation and fan-out
    pub fn submit(&self, reading: Reading) {
        trace!("got metric data");
        let mut reading_queue = self.inner.reading_queue.lock().unwrap();
        reading_queue.push_back(PendingReading {
            submission_attempts: 0,
            reading,
        });
    }

    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("ingest pipeline already started");
            return;
        }

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            debug!("ingest pipeline worker started");
            while inner.running.load(Ordering::SeqCst) {
                tokio::time::sleep(WORKER_INTERVAL).await;
                inner.submit_burst();
            }
            debug!("ingest pipeline worker stopped");
        });
        *self.worker.lock().unwrap() = Some(handle);

        info!("ingest pipeline started");
    }

    /// Stop the worker, delivering any residual queued readings to the
    /// attached downstreams once more without revalidation
    pub async fn stop(&self) {
        if !self.inner.running.load(Ordering::SeqCst) {
            return;
        }

        // Swap the residual queue out under the lock, then submit outside
        // of it
        let residual: Vec<PendingReading> = {
            let mut reading_queue = self.inner.reading_queue.lock().unwrap();
            reading_queue.drain(..).collect()
        };

        if !residual.is_empty() {
            info!(
                "attempting to submit the last {} enqueued readings before stop",
                residual.len()
            );
            for entry in residual {
                if let Some(metrics) = &self.inner.metrics {
                    metrics.store(entry.reading.clone());
                }
                if let Some(stream) = &self.inner.stream {
                    stream.submit(entry.reading.clone());
                }
                if let Some(rules) = &self.inner.rules {
                    rules.submit(entry.reading);
                }
            }
        }

        self.inner.running.store(false, Ordering::SeqCst);

        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Inner {
    fn submit_burst(&self) {
        {
            let reading_queue = self.reading_queue.lock().unwrap();
            if reading_queue.is_empty() {
                return;
            }
        }

        // Take a bounded slice of the queue so registrar lookups happen
        // without the lock
        let mut selected: Vec<PendingReading> = {
            let mut reading_queue = self.reading_queue.lock().unwrap();
            let count = reading_queue.len().min(MAX_METRICS_PER_BURST);
            reading_queue.drain(..count).collect()
        };

        let mut re_enqueue: Vec<PendingReading> = Vec::new();

        for entry in selected.iter_mut() {
            entry.submission_attempts += 1;

            if !self.validate(&entry.reading) {
                continue;
            }

            if let Some(metrics) = &self.metrics {
                if !metrics.store(entry.reading.clone()) {
                    warn!("metrics store refused reading");
                }
            }

            if let Some(rules) = &self.rules {
                rules.submit(entry.reading.clone());
            }

            if let Some(heartbeats) = &self.heartbeats {
                heartbeats.submit(&entry.reading.node_id);
            }

            // The fan-out may be stopped or draining; re-enqueue refused
            // readings for a later burst
            if let Some(stream) = &self.stream {
                if !stream.submit(entry.reading.clone()) {
                    if entry.submission_attempts >= MAX_SUBMISSION_ATTEMPTS {
                        info!("dropping reading (too many submission attempts)");
                        continue;
                    }
                    re_enqueue.push(entry.clone());
                }
            }
        }

        if re_enqueue.is_empty() {
            return;
        }

        let mut reading_queue = self.reading_queue.lock().unwrap();
        for entry in re_enqueue {
            reading_queue.push_back(entry);
        }
    }

    /// Resolve the node in the registrar and confirm the sensor is declared
    fn validate(&self, reading: &Reading) -> bool {
        let node_info = match self.registrar.load(&reading.node_id) {
            Ok(Some(node_info)) => node_info,
            Ok(None) => {
                warn!("no node data found for id: {}", reading.node_id);
                return false;
            }
            Err(e) => {
                warn!("registrar lookup failed for {}: {e}", reading.node_id);
                return false;
            }
        };

        let node: Node = match serde_json::from_str(&node_info) {
            Ok(node) => node,
            Err(e) => {
                warn!("failed to decode node {}: {e}", reading.node_id);
                return false;
            }
        };

        if !node.has_sensor(&reading.sensor_id) {
            warn!(
                "unable to locate sensor {} for node {}",
                reading.sensor_id, reading.node_id
            );
            return false;
        }

        true
    }
}
