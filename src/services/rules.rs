//! Rule evaluation service
//!
//! Owns the script host and feeds it validated readings. The host is
//! single-threaded by contract, so every invocation and every reload goes
//! through the same mutex; the worker serializes evaluation, and a reload
//! swaps the script atomically with respect to in-flight bursts. Readings
//! queued across a reload are evaluated by whichever script is current at
//! the moment of invocation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::Reading;
use crate::rules::RuleHost;

/// Worker cadence
const WORKER_INTERVAL: Duration = Duration::from_millis(500);

/// Maximum readings evaluated per worker iteration
const MAX_BURST: usize = 100;

struct Inner {
    host: Mutex<Box<dyn RuleHost>>,
    reading_queue: Mutex<VecDeque<Reading>>,
    running: AtomicBool,
    loaded: AtomicBool,
}

/// Queued, serialized evaluation of readings against the rule script
pub struct RuleEngine {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RuleEngine {
    pub fn new(host: Box<dyn RuleHost>) -> Self {
        Self {
            inner: Arc::new(Inner {
                host: Mutex::new(host),
                reading_queue: Mutex::new(VecDeque::new()),
                running: AtomicBool::new(false),
                loaded: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Load the script; required before `start`
    pub fn load(&self) -> anyhow::Result<()> {
        let mut host = self.inner.host.lock().unwrap();
        host.load()?;
        self.inner.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Re-read and re-verify the script, swapping it in atomically.
    /// On failure the previously loaded script stays active.
    pub fn reload(&self) -> anyhow::Result<()> {
        if !self.inner.loaded.load(Ordering::SeqCst) {
            anyhow::bail!("cannot reload, no script has been loaded");
        }

        let mut host = self.inner.host.lock().unwrap();
        match host.reload() {
            Ok(()) => {
                info!("rule script reloaded");
                Ok(())
            }
            Err(e) => {
                warn!("rule script reload failed, previous script stays active: {e}");
                Err(e)
            }
        }
    }

    /// Enqueue a reading for evaluation
    pub fn submit(&self, reading: Reading) {
        trace!("got metric data");
        let mut reading_queue = self.inner.reading_queue.lock().unwrap();
        reading_queue.push_back(reading);
    }

    pub fn start(&self) -> anyhow::Result<()> {
        if self.inner.running.load(Ordering::SeqCst) {
            warn!("rule engine already started");
            return Ok(());
        }

        if !self.inner.loaded.load(Ordering::SeqCst) {
            anyhow::bail!("rule script has not been loaded");
        }

        self.inner.running.store(true, Ordering::SeqCst);

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            debug!("rule engine worker started");
            while inner.running.load(Ordering::SeqCst) {
                tokio::time::sleep(WORKER_INTERVAL).await;
                inner.burst();
            }
            debug!("rule engine worker stopped");
        });
        *self.worker.lock().unwrap() = Some(handle);

        info!("rule engine started");
        Ok(())
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
    fn burst(&self) {
        {
            let reading_queue = self.reading_queue.lock().unwrap();
            if reading_queue.is_empty() {
                return;
            }
        }

        let selected: Vec<Reading> = {
            let mut reading_queue = self.reading_queue.lock().unwrap();
            let count = reading_queue.len().min(MAX_BURST);
            reading_queue.drain(..count).collect()
        };

        let mut host = self.host.lock().unwrap();
        for reading in selected {
            if let Err(e) =
                host.invoke(reading.ts, &reading.node_id, &reading.sensor_id, reading.value)
            {
                error!("failed to evaluate reading: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Host that records every invocation
    struct SpyHost {
        invocations: Arc<Mutex<Vec<(i64, String, String, f64)>>>,
        fail_load: bool,
        fail_reload: bool,
    }

    impl SpyHost {
        fn new() -> (Box<Self>, Arc<Mutex<Vec<(i64, String, String, f64)>>>) {
            let invocations = Arc::new(Mutex::new(Vec::new()));
            (
                Box::new(Self {
                    invocations: invocations.clone(),
                    fail_load: false,
                    fail_reload: false,
                }),
                invocations,
            )
        }
    }

    impl RuleHost for SpyHost {
        fn load(&mut self) -> anyhow::Result<()> {
            if self.fail_load {
                anyhow::bail!("spy host load failure");
            }
            Ok(())
        }

        fn reload(&mut self) -> anyhow::Result<()> {
            if self.fail_reload {
                anyhow::bail!("spy host reload failure");
            }
            Ok(())
        }

        fn invoke(
            &mut self,
            ts: i64,
            node_id: &str,
            sensor_id: &str,
            value: f64,
        ) -> anyhow::Result<()> {
            self.invocations.lock().unwrap().push((
                ts,
                node_id.to_string(),
                sensor_id.to_string(),
                value,
            ));
            Ok(())
        }
    }

    fn reading(ts: i64, value: f64) -> Reading {
        Reading {
            ts,
            node_id: "n1".to_string(),
            sensor_id: "n1:s".to_string(),
            value,
        }
    }

    #[tokio::test]
    async fn test_start_requires_load() {
        let (host, _) = SpyHost::new();
        let engine = RuleEngine::new(host);
        assert!(engine.start().is_err());

        engine.load().unwrap();
        engine.start().unwrap();
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_load_failure_propagates() {
        let (mut host, _) = SpyHost::new();
        host.fail_load = true;
        let engine = RuleEngine::new(host);
        assert!(engine.load().is_err());
        assert!(engine.start().is_err());
    }

    #[tokio::test]
    async fn test_submitted_readings_reach_host_in_order() {
        let (host, invocations) = SpyHost::new();
        let engine = RuleEngine::new(host);
        engine.load().unwrap();
        engine.start().unwrap();

        engine.submit(reading(1, 10.0));
        engine.submit(reading(2, 20.0));
        engine.submit(reading(3, 30.0));

        tokio::time::sleep(Duration::from_millis(700)).await;

        let seen = invocations.lock().unwrap().clone();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].0, 1);
        assert_eq!(seen[1].0, 2);
        assert_eq!(seen[2].0, 3);

        engine.stop().await;
    }

    #[tokio::test]
    async fn test_reload_before_load_fails() {
        let (host, _) = SpyHost::new();
        let engine = RuleEngine::new(host);
        assert!(engine.reload().is_err());
    }

    #[tokio::test]
    async fn test_failed_reload_reports_error() {
        let (mut host, _) = SpyHost::new();
        host.fail_reload = true;
        let engine = RuleEngine::new(host);
        engine.load().unwrap();
        assert!(engine.reload().is_err());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (host, _) = SpyHost::new();
        let engine = RuleEngine::new(host);
        engine.stop().await;

        engine.load().unwrap();
        engine.start().unwrap();
        engine.stop().await;
        engine.stop().await;
    }
}
