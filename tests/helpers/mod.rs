//! Helper functions for integration tests

#![allow(dead_code)]

use std::sync::Arc;

use monolith::config::{Config, read_config_file};
use monolith::registrar::RegistrarDb;
use monolith::{Controller, ControllerAction, Node, Reading, Sensor};

/// Write a config file plus a rule script into a temp dir and load it
pub fn write_test_config(dir: &tempfile::TempDir, script_body: &str) -> Config {
    let script = dir.path().join("rules.rhai");
    std::fs::write(&script, script_body).unwrap();

    let config_path = dir.path().join("config.toml");
    std::fs::write(
        &config_path,
        format!(
            r#"
[monolith]
instance_name = "test"
log_file_name = "{log}"
registration_db_path = "{reg}"
metric_db_path = "{db}"

[networking]
ipv4_address = "127.0.0.1"
http_port = 0

[rules]
rule_script = "{script}"

[alert]
max_alert_sends = 0
alert_cooldown_seconds = 30.0
"#,
            log = dir.path().join("test.log").display(),
            reg = dir.path().join("registrar.redb").display(),
            db = dir.path().join("metrics.db").display(),
            script = script.display(),
        ),
    )
    .unwrap();

    read_config_file(config_path.to_str().unwrap()).unwrap()
}

/// A rule script that accepts readings and does nothing
pub const PASSIVE_SCRIPT: &str = "fn accept_reading_v1(ts, node_id, sensor_id, value) { }";

pub fn test_node(id: &str, sensor: &str) -> Node {
    Node {
        id: id.to_string(),
        description: String::new(),
        sensors: vec![Sensor {
            id: sensor.to_string(),
            description: String::new(),
            sensor_type: String::new(),
        }],
    }
}

pub fn test_controller(id: &str, action: &str, address: &str, port: u16) -> Controller {
    Controller {
        id: id.to_string(),
        description: String::new(),
        address: address.to_string(),
        port,
        actions: vec![ControllerAction {
            id: action.to_string(),
            description: String::new(),
        }],
    }
}

pub fn register_node(db: &Arc<RegistrarDb>, id: &str, sensor: &str) {
    db.store(id, &serde_json::to_string(&test_node(id, sensor)).unwrap())
        .unwrap();
}

pub fn test_reading(ts: i64, node: &str, sensor: &str, value: f64) -> Reading {
    Reading {
        ts,
        node_id: node.to_string(),
        sensor_id: sensor.to_string(),
        value,
    }
}

/// Percent-encode a string for use as a single URL path segment
pub fn encode_segment(raw: &str) -> String {
    raw.bytes()
        .map(|b| match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                (b as char).to_string()
            }
            _ => format!("%{b:02X}"),
        })
        .collect()
}
