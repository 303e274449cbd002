use serde::{Deserialize, Serialize};

pub mod alert;
pub mod api;
pub mod config;
pub mod heartbeat;
pub mod registrar;
pub mod rules;
pub mod services;

/// One timestamped scalar sample from one sensor on one node.
///
/// Created by the ingress adapter, immutable afterwards. Everything
/// downstream (storage, streaming, rule evaluation) consumes it by value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Unix seconds at the moment the sample was taken
    pub ts: i64,
    pub node_id: String,
    pub sensor_id: String,
    pub value: f64,
}

/// A device publishing readings, registered under a stable string id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub sensors: Vec<Sensor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sensor {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default)]
    pub sensor_type: String,
}

impl Node {
    /// Check whether a sensor id is declared on this node
    pub fn has_sensor(&self, sensor_id: &str) -> bool {
        self.sensors.iter().any(|s| s.id == sensor_id)
    }
}

/// A device capable of executing named actions, registered under a stable
/// string id. Carries the network endpoint actions are delivered to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Controller {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub address: String,
    pub port: u16,
    pub actions: Vec<ControllerAction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerAction {
    pub id: String,
    #[serde(default)]
    pub description: String,
}

impl Controller {
    /// Check whether an action id is declared on this controller
    pub fn has_action(&self, action_id: &str) -> bool {
        self.actions.iter().any(|a| a.id == action_id)
    }
}

/// A timestamped command directed at a controller's action slot.
///
/// Sent once or dropped after the retry cap; never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    /// Unix milliseconds at enqueue time
    pub ts_ms: i64,
    pub controller_id: String,
    pub action_id: String,
    pub value: f64,
}

/// One burst of readings broadcast to stream subscribers.
///
/// Sequence numbers are strictly monotonic within a process lifetime;
/// `ts_ms` is stamped when the package is finalized for sending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamPackage {
    pub ts_ms: i64,
    pub sequence: u64,
    pub readings: Vec<Reading>,
}

impl StreamPackage {
    pub fn new(sequence: u64) -> Self {
        Self {
            ts_ms: 0,
            sequence,
            readings: Vec::new(),
        }
    }

    pub fn add_reading(&mut self, reading: Reading) {
        self.readings.push(reading);
    }

    /// Finalize the package for sending
    pub fn stamp(&mut self) {
        self.ts_ms = chrono::Utc::now().timestamp_millis();
    }
}

/// A node's liveness signal as it arrives over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_id: String,
}
