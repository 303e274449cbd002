//! Last-contact bookkeeping for nodes
//!
//! Every validated reading stamps its node here, so "when did we last hear
//! from n1" can be answered without touching the metrics database.

use std::collections::HashMap;
use std::sync::Mutex;

fn stamp() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Thread-safe map of node id to last-seen wall-clock seconds
#[derive(Debug, Default)]
pub struct HeartbeatLedger {
    heartbeats: Mutex<HashMap<String, i64>>,
}

impl HeartbeatLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the current time as the last contact for the given id
    pub fn submit(&self, id: &str) {
        let mut heartbeats = self.heartbeats.lock().unwrap();
        heartbeats.insert(id.to_string(), stamp());
    }

    /// Seconds since the id was last seen
    ///
    /// Returns `None` for unknown ids and for stamps that are zero or in
    /// the future (a clock that moved backwards should not produce a
    /// bogus negative age).
    pub fn seconds_since_contact(&self, id: &str) -> Option<u64> {
        let now = stamp();

        let value = {
            let heartbeats = self.heartbeats.lock().unwrap();
            *heartbeats.get(id)?
        };

        if value > now || value == 0 {
            return None;
        }

        Some((now - value) as u64)
    }
}
