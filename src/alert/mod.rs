//! Rate-limited alert forwarding
//!
//! Rule scripts raise alerts by numeric id. Each id gets its own cooldown
//! so a flapping rule cannot flood the SMS gateway, and a lifetime cap
//! bounds the total number of sends for the process.
//!
//! ## Limiter behavior
//!
//! - An id inside its cooldown window is suppressed silently.
//! - The lifetime counter is consumed when a send is attempted, whether or
//!   not the gateway accepts it.
//! - The cooldown is armed only after a successful send, so a gateway
//!   outage lets the next trigger retry immediately.

pub mod sms;
pub mod twilio;

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::info;

use sms::SmsBackend;

/// Limiter configuration
#[derive(Clone)]
pub struct AlertConfig {
    /// Minimum monotonic seconds between two sends for the same id
    pub alert_cooldown_seconds: f64,

    /// Lifetime cap across all ids; 0 means unlimited
    pub max_alert_sends: u64,

    /// Where alerts go; `None` drops them after logging
    pub sms_backend: Option<Arc<dyn SmsBackend>>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            alert_cooldown_seconds: 30.0,
            max_alert_sends: 0,
            sms_backend: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SendRecord {
    last_send: Instant,
    num_sends: u64,
}

/// Per-id cooldown tracking in front of the SMS backend
pub struct AlertManager {
    config: AlertConfig,
    send_map: Mutex<HashMap<i64, SendRecord>>,
    total_alerts_sent: AtomicU64,
}

impl AlertManager {
    pub fn new(config: AlertConfig) -> Self {
        Self {
            config,
            send_map: Mutex::new(HashMap::new()),
            total_alerts_sent: AtomicU64::new(0),
        }
    }

    /// Attempt to send an alert, suppressing within the cooldown window
    /// and once the lifetime cap is reached. Never returns an error; all
    /// failure modes are logged and swallowed.
    pub async fn trigger(&self, id: i64, message: &str) {
        info!("alert id {id} => {message}");

        // Cooldown check and prospective send count, without holding the
        // map lock across the backend call
        let num_sends = {
            let send_map = self.send_map.lock().unwrap();
            match send_map.get(&id) {
                Some(record) => {
                    let elapsed = record.last_send.elapsed().as_secs_f64();
                    if elapsed <= self.config.alert_cooldown_seconds {
                        info!(
                            "limiting alert for id {id}, {:.1}s left on limiter",
                            self.config.alert_cooldown_seconds - elapsed
                        );
                        return;
                    }
                    record.num_sends + 1
                }
                None => 1,
            }
        };

        if self.config.max_alert_sends != 0
            && self.total_alerts_sent.fetch_add(1, Ordering::SeqCst)
                >= self.config.max_alert_sends
        {
            info!(
                "maximum number of alerts ({}) has been reached",
                self.config.max_alert_sends
            );
            return;
        }

        if let Some(backend) = &self.config.sms_backend {
            if let Err(e) = backend.send(message).await {
                // Leave the record untouched so the next trigger may retry
                info!("failed to send alert message: {e}");
                return;
            }
        }

        let mut send_map = self.send_map.lock().unwrap();
        send_map.insert(
            id,
            SendRecord {
                last_send: Instant::now(),
                num_sends,
            },
        );
    }
}
