//! Action dispatch to controllers
//!
//! Rule scripts command controllers through here. `dispatch` validates the
//! target synchronously against the registrar and enqueues; the worker
//! drains the queue and delivers each encoded action over TCP with a
//! bounded number of attempts.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::registrar::RegistrarDb;
use crate::{Action, Controller};

/// Worker cadence
const WORKER_INTERVAL: Duration = Duration::from_millis(10);

/// Maximum actions delivered per worker iteration
const MAX_BURST: usize = 100;

/// Delivery attempts per action before it is dropped
const MAX_RETRIES: u8 = 5;

/// Bound on connecting to a controller so one dead endpoint cannot stall
/// the burst
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct QueuedAction {
    address: String,
    port: u16,
    action: Action,
}

struct Inner {
    registrar: Arc<RegistrarDb>,
    action_queue: Mutex<VecDeque<QueuedAction>>,
    running: AtomicBool,
}

/// Validating, retrying queue between the rule engine and controllers
pub struct ActionDispatcher {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ActionDispatcher {
    pub fn new(registrar: Arc<RegistrarDb>) -> Self {
        Self {
            inner: Arc::new(Inner {
                registrar,
                action_queue: Mutex::new(VecDeque::new()),
                running: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Validate a command against the registrar and enqueue it for delivery
    ///
    /// Returns `false` without enqueueing when the controller is unknown,
    /// its blob does not decode, or the action id is not declared on it.
    pub fn dispatch(&self, controller_id: &str, action_id: &str, value: f64) -> bool {
        trace!("dispatch request: {controller_id} | {action_id} | {value}");

        let data = match self.inner.registrar.load(controller_id) {
            Ok(Some(data)) => data,
            Ok(None) => {
                warn!("controller id is not registered: {controller_id}");
                return false;
            }
            Err(e) => {
                error!("registrar lookup failed for {controller_id}: {e}");
                return false;
            }
        };

        let controller: Controller = match serde_json::from_str(&data) {
            Ok(controller) => controller,
            Err(e) => {
                warn!("registered blob for {controller_id} is not a controller: {e}");
                return false;
            }
        };

        if !controller.has_action(action_id) {
            warn!("failed to locate action id [{action_id}] on controller [{controller_id}]");
            return false;
        }

        let mut action_queue = self.inner.action_queue.lock().unwrap();
        action_queue.push_back(QueuedAction {
            address: controller.address,
            port: controller.port,
            action: Action {
                ts_ms: chrono::Utc::now().timestamp_millis(),
                controller_id: controller.id,
                action_id: action_id.to_string(),
                value,
            },
        });
        true
    }

    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            debug!("action dispatcher started");
            while inner.running.load(Ordering::SeqCst) {
                tokio::time::sleep(WORKER_INTERVAL).await;
                inner.burst().await;
            }
            debug!("action dispatcher stopped");
        });

        *self.worker.lock().unwrap() = Some(handle);
    }

    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);

        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Inner {
    async fn burst(&self) {
        {
            let action_queue = self.action_queue.lock().unwrap();
            if action_queue.is_empty() {
                return;
            }
        }

        trace!("starting dispatch burst");

        // Copy a bounded slice of the queue so the lock is not held while
        // network sends are in flight
        let selected: Vec<QueuedAction> = {
            let mut action_queue = self.action_queue.lock().unwrap();
            let count = action_queue.len().min(MAX_BURST);
            action_queue.drain(..count).collect()
        };

        for entry in selected {
            let encoded = match serde_json::to_vec(&entry.action) {
                Ok(encoded) => encoded,
                Err(e) => {
                    error!("failed to encode queued action: {e}");
                    continue;
                }
            };

            if !send_with_retries(&entry.address, entry.port, &encoded).await {
                error!(
                    "failed to write action to {}:{}, dropping",
                    entry.address, entry.port
                );
            }
        }
    }
}

/// Deliver one payload, reconnecting for each attempt. The writer is scoped
/// to a single send and closed unconditionally.
async fn send_with_retries(address: &str, port: u16, payload: &[u8]) -> bool {
    for attempt in 1..=MAX_RETRIES {
        let connect = TcpStream::connect((address, port));
        match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
            Ok(Ok(mut stream)) => {
                match stream.write_all(payload).await {
                    Ok(()) => {
                        if stream.flush().await.is_ok() {
                            return true;
                        }
                    }
                    Err(e) => {
                        warn!("short write to {address}:{port} on attempt {attempt}: {e}");
                    }
                }
            }
            Ok(Err(e)) => {
                warn!("failed to connect to {address}:{port} on attempt {attempt}: {e}");
            }
            Err(_) => {
                warn!("connect to {address}:{port} timed out on attempt {attempt}");
            }
        }
    }
    false
}
