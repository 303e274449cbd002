//! Ordered component lifecycle
//!
//! Owns every component and brings them up leaves-first so nothing ever
//! submits into a service that is not running: stream fan-out, metrics
//! store, action dispatcher, rule engine, then the ingest pipeline.
//! Shutdown runs in exact reverse, with the ingest pipeline stopped first
//! so its drain still has somewhere to deliver.

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};

use crate::alert::sms::SmsBackend;
use crate::alert::twilio::TwilioBackend;
use crate::alert::{AlertConfig, AlertManager};
use crate::config::Config;
use crate::heartbeat::HeartbeatLedger;
use crate::registrar::RegistrarDb;
use crate::rules::{HostBindings, RhaiHost};
use crate::services::dispatch::ActionDispatcher;
use crate::services::ingest::IngestPipeline;
use crate::services::metrics::{MetricsStore, MetricsStoreConfig};
use crate::services::rules::RuleEngine;
use crate::services::stream::StreamFanout;

/// Owner of all components and their start/stop ordering
pub struct Supervisor {
    pub registrar: Arc<RegistrarDb>,
    pub heartbeats: Arc<HeartbeatLedger>,
    pub alerts: Arc<AlertManager>,
    pub stream: Arc<StreamFanout>,
    pub metrics: Option<Arc<MetricsStore>>,
    pub dispatcher: Arc<ActionDispatcher>,
    pub rules: Arc<RuleEngine>,
    pub ingest: Arc<IngestPipeline>,
    sms_backend: Option<Arc<dyn SmsBackend>>,
}

impl Supervisor {
    /// Wire all components from configuration. The registration database
    /// is opened here; workers are not yet running.
    pub fn build(config: &Config) -> anyhow::Result<Self> {
        let registrar = RegistrarDb::open(&config.monolith.registration_db_path)
            .context("failed to open registration database")?;

        let sms_backend: Option<Arc<dyn SmsBackend>> = match &config.twilio {
            Some(twilio_config) => {
                let backend = TwilioBackend::new(twilio_config.clone());
                backend
                    .setup()
                    .context("failed to set up twilio backend")?;
                Some(Arc::new(backend))
            }
            None => None,
        };

        let alerts = Arc::new(AlertManager::new(AlertConfig {
            alert_cooldown_seconds: config.alert.alert_cooldown_seconds,
            max_alert_sends: config.alert.max_alert_sends,
            sms_backend: sms_backend.clone(),
        }));

        let dispatcher = Arc::new(ActionDispatcher::new(registrar.clone()));

        let host = RhaiHost::new(
            &config.rules.rule_script,
            HostBindings {
                alerts: alerts.clone(),
                dispatcher: dispatcher.clone(),
            },
        );
        let rules = Arc::new(RuleEngine::new(Box::new(host)));

        let stream = Arc::new(StreamFanout::new());

        let save_metrics = config
            .metric_database
            .as_ref()
            .map(|m| m.save_metrics)
            .unwrap_or(true);
        let metrics = if save_metrics {
            Some(Arc::new(MetricsStore::new(MetricsStoreConfig {
                path: config.metric_db_path().to_string(),
                expiration_secs: config
                    .metric_database
                    .as_ref()
                    .and_then(|m| m.metric_expiration_time_sec),
            })))
        } else {
            None
        };

        let heartbeats = Arc::new(HeartbeatLedger::new());

        let ingest = Arc::new(IngestPipeline::new(
            registrar.clone(),
            Some(stream.clone()),
            metrics.clone(),
            Some(rules.clone()),
            Some(heartbeats.clone()),
        ));

        Ok(Self {
            registrar,
            heartbeats,
            alerts,
            stream,
            metrics,
            dispatcher,
            rules,
            ingest,
            sms_backend,
        })
    }

    /// Start every component in dependency order. A failure stops whatever
    /// was already started, in reverse, before the error is returned.
    pub async fn start(&self) -> anyhow::Result<()> {
        info!("starting services");

        self.stream.start();

        if let Some(metrics) = &self.metrics {
            if let Err(e) = metrics.start().await {
                error!("failed to start metrics store");
                self.stream.stop().await;
                return Err(e);
            }
        }

        self.dispatcher.start();

        if let Err(e) = self
            .rules
            .load()
            .and_then(|()| self.rules.start())
        {
            error!("failed to start rule engine");
            self.dispatcher.stop().await;
            if let Some(metrics) = &self.metrics {
                metrics.stop().await;
            }
            self.stream.stop().await;
            return Err(e);
        }

        self.ingest.start();

        info!("all services started");
        Ok(())
    }

    /// Stop everything in reverse start order. Safe to call repeatedly and
    /// on a supervisor that never started.
    pub async fn stop(&self) {
        info!("stopping services");

        self.ingest.stop().await;
        self.rules.stop().await;
        self.dispatcher.stop().await;
        if let Some(metrics) = &self.metrics {
            metrics.stop().await;
        }
        self.stream.stop().await;

        if let Some(backend) = &self.sms_backend {
            backend.teardown();
        }

        info!("all services stopped");
    }
}
