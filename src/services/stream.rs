//! Live metric streaming to remote subscribers
//!
//! Subscribers register an `(address, port)` endpoint; the worker
//! periodically drains queued readings into a sequence-numbered package,
//! encodes it once, and pushes it to every subscriber over TCP. Delivery
//! is best effort, at most once per subscriber per burst; a failed write
//! leaves the subscriber registered.
//!
//! Subscriber mutations are themselves queued and applied asynchronously
//! on a slower cadence, so registration never contends with in-flight
//! sends.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::{Reading, StreamPackage};

/// Cadence for applying queued subscriber mutations
const INTERVAL_DESTINATION_UPDATE: Duration = Duration::from_millis(2500);

/// Maximum subscriber mutations applied per update
const BURST_UPDATE_DESTINATION: usize = 10;

/// Cadence for streaming queued readings
const INTERVAL_STREAM_METRICS: Duration = Duration::from_millis(250);

/// Maximum readings per stream package
const BURST_STREAM_METRIC: usize = 100;

/// Queue length at which overflow protection kicks in
const MAX_QUEUED_READINGS: usize = 500_000;

/// Oldest readings dropped per overflow pass
const NUM_DROP_READINGS: usize = 1000;

/// Worker idle sleep between deadline checks
const WORKER_SLEEP: Duration = Duration::from_millis(10);

/// Bound on connecting to a subscriber so one dead endpoint cannot stall
/// the burst
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A remote stream receiver; identity is the `(address, port)` pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEndpoint {
    pub address: String,
    pub port: u16,
}

enum EndpointCommand {
    Add(StreamEndpoint),
    Delete(StreamEndpoint),
}

struct Inner {
    accepting: AtomicBool,
    running: AtomicBool,
    sequence: AtomicU64,
    reading_queue: Mutex<VecDeque<Reading>>,
    receivers: Mutex<Vec<StreamEndpoint>>,
    receiver_updates: Mutex<VecDeque<EndpointCommand>>,
}

/// Burst-encoding fan-out of readings to registered subscribers
pub struct StreamFanout {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Default for StreamFanout {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamFanout {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                accepting: AtomicBool::new(false),
                running: AtomicBool::new(false),
                sequence: AtomicU64::new(0),
                reading_queue: Mutex::new(VecDeque::new()),
                receivers: Mutex::new(Vec::new()),
                receiver_updates: Mutex::new(VecDeque::new()),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Queue a subscriber addition; duplicates are ignored when applied
    pub fn add_destination(&self, address: &str, port: u16) {
        let mut updates = self.inner.receiver_updates.lock().unwrap();
        updates.push_back(EndpointCommand::Add(StreamEndpoint {
            address: address.to_string(),
            port,
        }));
    }

    /// Queue a subscriber removal; absent endpoints are ignored when applied
    pub fn remove_destination(&self, address: &str, port: u16) {
        let mut updates = self.inner.receiver_updates.lock().unwrap();
        updates.push_back(EndpointCommand::Delete(StreamEndpoint {
            address: address.to_string(),
            port,
        }));
    }

    /// Enqueue a reading for broadcast. Returns `false` when the fan-out is
    /// not accepting (stopped or in its post-stop drain phase).
    pub fn submit(&self, reading: Reading) -> bool {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            info!("not accepting metrics at this time");
            return false;
        }

        let mut reading_queue = self.inner.reading_queue.lock().unwrap();
        reading_queue.push_back(reading);
        true
    }

    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.accepting.store(true, Ordering::SeqCst);

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            run_worker(inner).await;
        });
        *self.worker.lock().unwrap() = Some(handle);
    }

    pub async fn stop(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        self.inner.running.store(false, Ordering::SeqCst);

        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn run_worker(inner: Arc<Inner>) {
    debug!("stream fan-out worker started");

    let mut last_destination_update = Instant::now();
    let mut last_metric_burst = Instant::now();

    while inner.running.load(Ordering::SeqCst) {
        tokio::time::sleep(WORKER_SLEEP).await;

        if last_destination_update.elapsed() >= INTERVAL_DESTINATION_UPDATE {
            inner.perform_destination_updates();
            last_destination_update = Instant::now();
        }

        if last_metric_burst.elapsed() >= INTERVAL_STREAM_METRICS {
            inner.perform_metric_streaming().await;
            last_metric_burst = Instant::now();
        }

        inner.check_overflow();
    }

    debug!("stream fan-out worker stopped");
}

impl Inner {
    fn contains_endpoint(&self, endpoint: &StreamEndpoint) -> bool {
        let receivers = self.receivers.lock().unwrap();
        receivers.iter().any(|entry| entry == endpoint)
    }

    fn perform_destination_updates(&self) {
        {
            let updates = self.receiver_updates.lock().unwrap();
            if updates.is_empty() {
                return;
            }
        }

        info!("updating stream destinations");

        let selected: Vec<EndpointCommand> = {
            let mut updates = self.receiver_updates.lock().unwrap();
            let count = updates.len().min(BURST_UPDATE_DESTINATION);
            updates.drain(..count).collect()
        };

        for update in selected {
            match update {
                EndpointCommand::Add(endpoint) => {
                    if self.contains_endpoint(&endpoint) {
                        continue;
                    }
                    info!("added stream receiver {}:{}", endpoint.address, endpoint.port);
                    let mut receivers = self.receivers.lock().unwrap();
                    receivers.push(endpoint);
                }
                EndpointCommand::Delete(endpoint) => {
                    let mut receivers = self.receivers.lock().unwrap();
                    receivers.retain(|entry| entry != &endpoint);
                }
            }
        }
    }

    async fn perform_metric_streaming(&self) {
        // Nobody to send to, or nothing to send
        {
            let receivers = self.receivers.lock().unwrap();
            if receivers.is_empty() {
                return;
            }
        }
        {
            let reading_queue = self.reading_queue.lock().unwrap();
            if reading_queue.is_empty() {
                return;
            }
        }

        let mut package = StreamPackage::new(self.sequence.fetch_add(1, Ordering::SeqCst));

        {
            let mut reading_queue = self.reading_queue.lock().unwrap();
            let count = reading_queue.len().min(BURST_STREAM_METRIC);
            for reading in reading_queue.drain(..count) {
                package.add_reading(reading);
            }
        }

        package.stamp();

        let encoded = match serde_json::to_vec(&package) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!("failed to encode stream package (repercussion: data loss): {e}");
                return;
            }
        };

        // Snapshot the receivers so the lock is not held during network
        // writes
        let receivers: Vec<StreamEndpoint> = {
            let receivers = self.receivers.lock().unwrap();
            receivers.clone()
        };

        for destination in receivers {
            if let Err(e) = send_package(&destination, &encoded).await {
                warn!(
                    "failed to send stream data to {}:{}: {e}",
                    destination.address, destination.port
                );
            }
        }
    }

    fn check_overflow(&self) {
        let mut reading_queue = self.reading_queue.lock().unwrap();
        if reading_queue.len() < MAX_QUEUED_READINGS {
            return;
        }

        let count = reading_queue.len().min(NUM_DROP_READINGS);
        reading_queue.drain(..count);
        warn!("stream queue overflow, dropped {count} oldest readings");
    }
}

/// One connect + write per subscriber per burst; the writer is closed
/// unconditionally when it goes out of scope
async fn send_package(destination: &StreamEndpoint, payload: &[u8]) -> std::io::Result<()> {
    let connect = TcpStream::connect((destination.address.as_str(), destination.port));
    let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, connect)
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;
    stream.write_all(payload).await?;
    stream.flush().await?;
    stream.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(ts: i64) -> Reading {
        Reading {
            ts,
            node_id: "n1".to_string(),
            sensor_id: "n1:s".to_string(),
            value: 0.0,
        }
    }

    #[tokio::test]
    async fn test_submit_refused_before_start() {
        let fanout = StreamFanout::new();
        assert!(!fanout.submit(reading(1)));
    }

    #[tokio::test]
    async fn test_submit_refused_after_stop() {
        let fanout = StreamFanout::new();
        fanout.start();
        assert!(fanout.submit(reading(1)));

        fanout.stop().await;
        assert!(!fanout.submit(reading(2)));
    }

    #[tokio::test]
    async fn test_add_is_deduplicated_and_delete_removes() {
        let fanout = StreamFanout::new();

        fanout.add_destination("10.0.0.1", 5000);
        fanout.add_destination("10.0.0.1", 5000);
        fanout.add_destination("10.0.0.2", 5000);
        fanout.inner.perform_destination_updates();

        assert_eq!(fanout.inner.receivers.lock().unwrap().len(), 2);

        fanout.remove_destination("10.0.0.1", 5000);
        fanout.remove_destination("10.0.0.9", 5000);
        fanout.inner.perform_destination_updates();

        let receivers = fanout.inner.receivers.lock().unwrap();
        assert_eq!(receivers.len(), 1);
        assert_eq!(receivers[0].address, "10.0.0.2");
    }

    #[tokio::test]
    async fn test_update_burst_is_bounded() {
        let fanout = StreamFanout::new();

        for port in 1..=(BURST_UPDATE_DESTINATION as u16 + 5) {
            fanout.add_destination("10.0.0.1", port);
        }
        fanout.inner.perform_destination_updates();

        assert_eq!(
            fanout.inner.receivers.lock().unwrap().len(),
            BURST_UPDATE_DESTINATION
        );
        assert_eq!(fanout.inner.receiver_updates.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_overflow_drops_in_fixed_chunks() {
        let fanout = StreamFanout::new();

        {
            let mut queue = fanout.inner.reading_queue.lock().unwrap();
            for ts in 0..(MAX_QUEUED_READINGS as i64) {
                queue.push_back(reading(ts));
            }
        }

        fanout.inner.check_overflow();
        assert_eq!(
            fanout.inner.reading_queue.lock().unwrap().len(),
            MAX_QUEUED_READINGS - NUM_DROP_READINGS
        );

        // Below the limit again, nothing further is dropped
        fanout.inner.check_overflow();
        assert_eq!(
            fanout.inner.reading_queue.lock().unwrap().len(),
            MAX_QUEUED_READINGS - NUM_DROP_READINGS
        );

        // The oldest entries were the ones removed
        let queue = fanout.inner.reading_queue.lock().unwrap();
        assert_eq!(queue.front().unwrap().ts, NUM_DROP_READINGS as i64);
    }

    #[tokio::test]
    async fn test_no_streaming_without_receivers() {
        let fanout = StreamFanout::new();
        fanout.start();

        fanout.submit(reading(1));
        fanout.inner.perform_metric_streaming().await;

        // Reading stays queued and no sequence number was consumed
        assert_eq!(fanout.inner.reading_queue.lock().unwrap().len(), 1);
        assert_eq!(fanout.inner.sequence.load(Ordering::SeqCst), 0);

        fanout.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let fanout = StreamFanout::new();
        fanout.stop().await;

        fanout.start();
        fanout.stop().await;
        fanout.stop().await;
    }
}
