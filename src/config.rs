use std::path::Path;

use tracing::trace;

/// Top-level configuration loaded from a TOML file at startup
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    pub monolith: MonolithConfig,
    pub networking: NetworkingConfig,
    pub rules: RulesConfig,
    pub alert: AlertSettings,
    pub twilio: Option<TwilioConfig>,
    pub metric_database: Option<MetricDatabaseConfig>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct MonolithConfig {
    pub instance_name: String,
    pub log_file_name: String,
    pub registration_db_path: String,
    pub metric_db_path: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct NetworkingConfig {
    pub ipv4_address: String,
    pub http_port: u16,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct RulesConfig {
    pub rule_script: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct AlertSettings {
    /// Lifetime cap across all alert ids; 0 means unlimited
    pub max_alert_sends: u64,
    /// Minimum monotonic seconds between two sends for the same id
    pub alert_cooldown_seconds: f64,
}

/// Twilio credentials. The table is optional, but a partially filled table
/// fails deserialization, which is treated as a fatal config error.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct MetricDatabaseConfig {
    #[serde(default = "default_save_metrics")]
    pub save_metrics: bool,
    /// Records older than this many seconds are purged; absent disables purging
    pub metric_expiration_time_sec: Option<u64>,
    /// Overrides `monolith.metric_db_path` when set
    pub path: Option<String>,
}

fn default_save_metrics() -> bool {
    true
}

impl Config {
    /// Effective path of the metrics database file
    pub fn metric_db_path(&self) -> &str {
        self.metric_database
            .as_ref()
            .and_then(|m| m.path.as_deref())
            .unwrap_or(&self.monolith.metric_db_path)
    }
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&file_content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file: {e}"))?;

    if !Path::new(&config.rules.rule_script).is_file() {
        anyhow::bail!(
            "Configured rule script does not exist: {}",
            config.rules.rule_script
        );
    }

    trace!("loaded config: {config:?}");
    Ok(config)
}
