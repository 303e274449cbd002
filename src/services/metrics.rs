//! Request-queued metrics database
//!
//! All SQLite access goes through one worker so callers never block on the
//! database. Submissions and fetches enqueue a request and return
//! immediately; fetch callers receive a [`FetchResponse`] handle they poll
//! for completion.
//!
//! ## Fetch handle protocol
//!
//! The worker writes `result`, then sets `complete`. A caller that gives
//! up sets `timeout` first; the worker re-checks `timeout` before touching
//! the handle, so an abandoned handle is never written.
//!
//! ## Result encoding
//!
//! Fetch results are a JSON array literal. Distinct-field fetches produce
//! `["v1","v2"]`; row fetches encode each row as a reading object. A row
//! that fails to encode is represented in-place as
//! `{"error":"Failed to encode reading"}`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use tracing::{debug, error, info, instrument};

use crate::Reading;

/// Worker cadence
const WORKER_INTERVAL: Duration = Duration::from_millis(100);

/// Maximum requests served per worker iteration
const MAX_BURST: usize = 100;

/// How long fetch callers wait on a handle before giving up
pub const FETCH_DEADLINE: Duration = Duration::from_secs(30);

fn now_seconds() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Handle a fetch caller polls for its result
///
/// Owned jointly by the caller and the request queue; no raw pointers
/// cross the thread boundary.
#[derive(Debug, Default)]
pub struct FetchResponse {
    result: Mutex<String>,
    complete: AtomicBool,
    timeout: AtomicBool,
}

impl FetchResponse {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }

    /// Caller-side abandonment; the worker will not touch the handle after
    /// this is observed
    pub fn mark_timed_out(&self) {
        self.timeout.store(true, Ordering::SeqCst);
    }

    pub fn result(&self) -> String {
        self.result.lock().unwrap().clone()
    }

    fn fulfill(&self, result: String) {
        if self.timeout.load(Ordering::SeqCst) {
            return;
        }
        *self.result.lock().unwrap() = result;
        self.complete.store(true, Ordering::SeqCst);
    }

    /// Poll until the worker completes the handle or the deadline expires.
    /// Returns the result string, or `None` after marking the handle
    /// timed out.
    pub async fn wait(&self, deadline: Duration) -> Option<String> {
        let started = tokio::time::Instant::now();
        loop {
            if self.is_complete() {
                return Some(self.result());
            }
            if started.elapsed() >= deadline {
                self.mark_timed_out();
                return None;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

enum DbRequest {
    Store(Reading),
    FetchNodes(Arc<FetchResponse>),
    FetchSensors(Arc<FetchResponse>, String),
    FetchRange(Arc<FetchResponse>, String, i64, i64),
    FetchAfter(Arc<FetchResponse>, String, i64),
    FetchBefore(Arc<FetchResponse>, String, i64),
}

#[derive(Debug, Clone)]
pub struct MetricsStoreConfig {
    /// SQLite database file
    pub path: String,

    /// Purge records older than this many seconds; `None` disables purging
    pub expiration_secs: Option<u64>,
}

impl MetricsStoreConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            expiration_secs: None,
        }
    }
}

struct Inner {
    config: MetricsStoreConfig,
    request_queue: Mutex<VecDeque<DbRequest>>,
    pool: Mutex<Option<Pool<Sqlite>>>,
    open: AtomicBool,
    running: AtomicBool,
}

/// Asynchronous request-queued access to the metrics table
pub struct MetricsStore {
    inner: Arc<Inner>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MetricsStore {
    pub fn new(config: MetricsStoreConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                request_queue: Mutex::new(VecDeque::new()),
                pool: Mutex::new(None),
                open: AtomicBool::new(false),
                running: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Open the database, create the schema, run the pre-flight purge, and
    /// spawn the worker
    #[instrument(skip(self), fields(path = %self.inner.config.path))]
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.inner.running.load(Ordering::SeqCst) {
            debug!("metrics store already started");
            return Ok(());
        }

        info!("opening metrics database");

        let options = SqliteConnectOptions::new()
            .filename(&self.inner.config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER,
                node TEXT,
                sensor TEXT,
                value REAL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        if let Some(expiration) = self.inner.config.expiration_secs {
            info!("pre-flight prune of records older than {expiration}s");
            purge_expired(&pool, expiration).await?;
        }

        *self.inner.pool.lock().unwrap() = Some(pool.clone());
        self.inner.open.store(true, Ordering::SeqCst);
        self.inner.running.store(true, Ordering::SeqCst);

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            run_worker(inner, pool).await;
        });
        *self.worker.lock().unwrap() = Some(handle);

        info!("metrics database service started");
        Ok(())
    }

    pub async fn stop(&self) {
        if !self.inner.running.load(Ordering::SeqCst) {
            return;
        }

        self.inner.open.store(false, Ordering::SeqCst);
        self.inner.running.store(false, Ordering::SeqCst);

        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let pool = self.inner.pool.lock().unwrap().take();
        if let Some(pool) = pool {
            pool.close().await;
        }
    }

    fn enqueue(&self, request: DbRequest) -> bool {
        if !self.inner.open.load(Ordering::SeqCst) {
            return false;
        }
        let mut request_queue = self.inner.request_queue.lock().unwrap();
        request_queue.push_back(request);
        true
    }

    /// Queue a reading for insertion. Returns `false` if the store is not
    /// open.
    pub fn store(&self, reading: Reading) -> bool {
        self.enqueue(DbRequest::Store(reading))
    }

    /// Queue a distinct-node fetch
    pub fn fetch_nodes(&self, response: Arc<FetchResponse>) -> bool {
        self.enqueue(DbRequest::FetchNodes(response))
    }

    /// Queue a distinct-sensor fetch for one node
    pub fn fetch_sensors(&self, response: Arc<FetchResponse>, node_id: &str) -> bool {
        self.enqueue(DbRequest::FetchSensors(response, node_id.to_string()))
    }

    /// Queue a fetch of readings with `start < ts < end`. The range must be
    /// non-inverted.
    pub fn fetch_range(
        &self,
        response: Arc<FetchResponse>,
        node_id: &str,
        start: i64,
        end: i64,
    ) -> bool {
        if end <= start {
            return false;
        }
        self.enqueue(DbRequest::FetchRange(
            response,
            node_id.to_string(),
            start,
            end,
        ))
    }

    /// Queue a fetch of readings with `ts > time`
    pub fn fetch_after(&self, response: Arc<FetchResponse>, node_id: &str, time: i64) -> bool {
        self.enqueue(DbRequest::FetchAfter(response, node_id.to_string(), time))
    }

    /// Queue a fetch of readings with `ts < time`
    pub fn fetch_before(&self, response: Arc<FetchResponse>, node_id: &str, time: i64) -> bool {
        self.enqueue(DbRequest::FetchBefore(response, node_id.to_string(), time))
    }
}

async fn run_worker(inner: Arc<Inner>, pool: Pool<Sqlite>) {
    debug!("metrics store worker started");

    let mut last_purge = now_seconds();

    while inner.running.load(Ordering::SeqCst) {
        tokio::time::sleep(WORKER_INTERVAL).await;

        if let Some(expiration) = inner.config.expiration_secs {
            if now_seconds() - last_purge > expiration as i64 {
                if let Err(e) = purge_expired(&pool, expiration).await {
                    error!("failed to purge expired metrics: {e}");
                }
                last_purge = now_seconds();
            }
        }

        burst(&inner, &pool).await;
    }

    debug!("metrics store worker stopped");
}

async fn purge_expired(pool: &Pool<Sqlite>, expiration: u64) -> anyhow::Result<()> {
    let cutoff = now_seconds() - expiration as i64;
    let result = sqlx::query("DELETE FROM metrics WHERE timestamp < ?")
        .bind(cutoff)
        .execute(pool)
        .await?;

    if result.rows_affected() > 0 {
        info!("purged {} expired metric rows", result.rows_affected());
    }
    Ok(())
}

async fn burst(inner: &Inner, pool: &Pool<Sqlite>) {
    {
        let request_queue = inner.request_queue.lock().unwrap();
        if request_queue.is_empty() {
            return;
        }
    }

    // Copy a bounded slice of the queue so the lock is released before any
    // database work happens
    let selected: Vec<DbRequest> = {
        let mut request_queue = inner.request_queue.lock().unwrap();
        let count = request_queue.len().min(MAX_BURST);
        request_queue.drain(..count).collect()
    };

    for request in selected {
        match request {
            DbRequest::Store(reading) => store_reading(pool, reading).await,
            DbRequest::FetchNodes(response) => {
                let result = fetch_distinct_nodes(pool).await;
                response.fulfill(result);
            }
            DbRequest::FetchSensors(response, node) => {
                let result = fetch_distinct_sensors(pool, &node).await;
                response.fulfill(result);
            }
            DbRequest::FetchRange(response, node, start, end) => {
                let result = fetch_rows(
                    pool,
                    "SELECT timestamp, node, sensor, value FROM metrics \
                     WHERE node = ? AND timestamp > ? AND timestamp < ?",
                    &node,
                    &[start, end],
                )
                .await;
                response.fulfill(result);
            }
            DbRequest::FetchAfter(response, node, time) => {
                let result = fetch_rows(
                    pool,
                    "SELECT timestamp, node, sensor, value FROM metrics \
                     WHERE node = ? AND timestamp > ?",
                    &node,
                    &[time],
                )
                .await;
                response.fulfill(result);
            }
            DbRequest::FetchBefore(response, node, time) => {
                let result = fetch_rows(
                    pool,
                    "SELECT timestamp, node, sensor, value FROM metrics \
                     WHERE node = ? AND timestamp < ?",
                    &node,
                    &[time],
                )
                .await;
                response.fulfill(result);
            }
        }
    }
}

async fn store_reading(pool: &Pool<Sqlite>, reading: Reading) {
    // The timestamp is bound as a full 64-bit integer; SQLite stores
    // whatever width the bound value needs
    let result = sqlx::query("INSERT INTO metrics (timestamp, node, sensor, value) VALUES (?, ?, ?, ?)")
        .bind(reading.ts)
        .bind(&reading.node_id)
        .bind(&reading.sensor_id)
        .bind(reading.value)
        .execute(pool)
        .await;

    if let Err(e) = result {
        error!("failed to store metric: {e}");
    }
}

async fn fetch_distinct_nodes(pool: &Pool<Sqlite>) -> String {
    let rows: Vec<(String,)> = match sqlx::query_as("SELECT DISTINCT node FROM metrics")
        .fetch_all(pool)
        .await
    {
        Ok(rows) => rows,
        Err(e) => {
            error!("node fetch failed: {e}");
            return "[]".to_string();
        }
    };

    let names: Vec<String> = rows.into_iter().map(|(name,)| name).collect();
    serde_json::to_string(&names).unwrap_or_else(|_| "[]".to_string())
}

async fn fetch_distinct_sensors(pool: &Pool<Sqlite>, node: &str) -> String {
    let rows: Vec<(String,)> =
        match sqlx::query_as("SELECT DISTINCT sensor FROM metrics WHERE node = ?")
            .bind(node)
            .fetch_all(pool)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                error!("sensor fetch failed: {e}");
                return "[]".to_string();
            }
        };

    let names: Vec<String> = rows.into_iter().map(|(name,)| name).collect();
    serde_json::to_string(&names).unwrap_or_else(|_| "[]".to_string())
}

async fn fetch_rows(pool: &Pool<Sqlite>, sql: &str, node: &str, times: &[i64]) -> String {
    let mut query = sqlx::query_as::<_, (i64, String, String, f64)>(sql).bind(node);
    for time in times {
        query = query.bind(*time);
    }

    let rows = match query.fetch_all(pool).await {
        Ok(rows) => rows,
        Err(e) => {
            error!("row fetch failed: {e}");
            return "[]".to_string();
        }
    };

    let values: Vec<serde_json::Value> = rows
        .into_iter()
        .map(|(ts, node_id, sensor_id, value)| {
            let reading = Reading {
                ts,
                node_id,
                sensor_id,
                value,
            };
            serde_json::to_value(&reading)
                .unwrap_or_else(|_| serde_json::json!({"error": "Failed to encode reading"}))
        })
        .collect();

    serde_json::to_string(&values).unwrap_or_else(|_| "[]".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(ts: i64, node: &str, sensor: &str, value: f64) -> Reading {
        Reading {
            ts,
            node_id: node.to_string(),
            sensor_id: sensor.to_string(),
            value,
        }
    }

    async fn started_store(dir: &tempfile::TempDir) -> MetricsStore {
        let path = dir.path().join("metrics.db");
        let store = MetricsStore::new(MetricsStoreConfig::new(path.to_string_lossy()));
        store.start().await.unwrap();
        store
    }

    async fn wait_result(response: &Arc<FetchResponse>) -> String {
        response
            .wait(Duration::from_secs(5))
            .await
            .expect("fetch did not complete")
    }

    #[tokio::test]
    async fn test_closed_store_refuses_requests() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.db");
        let store = MetricsStore::new(MetricsStoreConfig::new(path.to_string_lossy()));

        assert!(!store.store(reading(1, "n1", "s1", 0.0)));
        assert!(!store.fetch_nodes(FetchResponse::new()));
    }

    #[tokio::test]
    async fn test_store_then_fetch_nodes_and_sensors() {
        let dir = tempfile::tempdir().unwrap();
        let store = started_store(&dir).await;

        assert!(store.store(reading(100, "n1", "n1:s", 1.5)));
        assert!(store.store(reading(101, "n1", "n1:t", 2.5)));
        assert!(store.store(reading(102, "n2", "n2:s", 3.5)));

        tokio::time::sleep(Duration::from_millis(300)).await;

        let response = FetchResponse::new();
        assert!(store.fetch_nodes(response.clone()));
        let nodes: Vec<String> = serde_json::from_str(&wait_result(&response).await).unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(nodes.contains(&"n1".to_string()));
        assert!(nodes.contains(&"n2".to_string()));

        let response = FetchResponse::new();
        assert!(store.fetch_sensors(response.clone(), "n1"));
        let sensors: Vec<String> = serde_json::from_str(&wait_result(&response).await).unwrap();
        assert_eq!(sensors.len(), 2);
        assert!(sensors.contains(&"n1:s".to_string()));

        store.stop().await;
    }

    #[tokio::test]
    async fn test_fetch_range_uses_strict_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let store = started_store(&dir).await;

        for ts in [100, 150, 200] {
            store.store(reading(ts, "n1", "n1:s", ts as f64));
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        let response = FetchResponse::new();
        assert!(store.fetch_range(response.clone(), "n1", 100, 200));
        let rows: Vec<Reading> = serde_json::from_str(&wait_result(&response).await).unwrap();

        // Both boundary rows are excluded
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ts, 150);

        store.stop().await;
    }

    #[tokio::test]
    async fn test_fetch_range_rejects_inverted_range() {
        let dir = tempfile::tempdir().unwrap();
        let store = started_store(&dir).await;

        assert!(!store.fetch_range(FetchResponse::new(), "n1", 200, 100));
        assert!(!store.fetch_range(FetchResponse::new(), "n1", 100, 100));

        store.stop().await;
    }

    #[tokio::test]
    async fn test_fetch_after_and_before() {
        let dir = tempfile::tempdir().unwrap();
        let store = started_store(&dir).await;

        for ts in [100, 200, 300] {
            store.store(reading(ts, "n1", "n1:s", 0.0));
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        let response = FetchResponse::new();
        assert!(store.fetch_after(response.clone(), "n1", 150));
        let rows: Vec<Reading> = serde_json::from_str(&wait_result(&response).await).unwrap();
        assert_eq!(rows.len(), 2);

        let response = FetchResponse::new();
        assert!(store.fetch_before(response.clone(), "n1", 150));
        let rows: Vec<Reading> = serde_json::from_str(&wait_result(&response).await).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ts, 100);

        store.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_node_fetch_returns_empty_array() {
        let dir = tempfile::tempdir().unwrap();
        let store = started_store(&dir).await;

        let response = FetchResponse::new();
        assert!(store.fetch_after(response.clone(), "ghost", 0));
        assert_eq!(wait_result(&response).await, "[]");

        store.stop().await;
    }

    #[tokio::test]
    async fn test_timestamps_past_2038_survive() {
        let dir = tempfile::tempdir().unwrap();
        let store = started_store(&dir).await;

        // Seconds value above the 32-bit signed range
        let far_future = 4_000_000_000i64;
        store.store(reading(far_future, "n1", "n1:s", 1.0));
        tokio::time::sleep(Duration::from_millis(300)).await;

        let response = FetchResponse::new();
        assert!(store.fetch_after(response.clone(), "n1", far_future - 1));
        let rows: Vec<Reading> = serde_json::from_str(&wait_result(&response).await).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ts, far_future);

        store.stop().await;
    }

    #[tokio::test]
    async fn test_timed_out_handle_is_never_written() {
        let dir = tempfile::tempdir().unwrap();
        let store = started_store(&dir).await;

        let response = FetchResponse::new();
        response.mark_timed_out();
        assert!(store.fetch_nodes(response.clone()));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!response.is_complete());
        assert_eq!(response.result(), "");

        store.stop().await;
    }

    #[tokio::test]
    async fn test_preflight_purge_removes_expired_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.db");

        {
            let store = MetricsStore::new(MetricsStoreConfig::new(path.to_string_lossy()));
            store.start().await.unwrap();
            store.store(reading(now_seconds() - 100_000, "n1", "n1:s", 1.0));
            store.store(reading(now_seconds(), "n1", "n1:s", 2.0));
            tokio::time::sleep(Duration::from_millis(300)).await;
            store.stop().await;
        }

        let store = MetricsStore::new(MetricsStoreConfig {
            path: path.to_string_lossy().to_string(),
            expiration_secs: Some(3600),
        });
        store.start().await.unwrap();

        let response = FetchResponse::new();
        assert!(store.fetch_after(response.clone(), "n1", 0));
        let rows: Vec<Reading> = serde_json::from_str(&wait_result(&response).await).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, 2.0);

        store.stop().await;
    }

    #[tokio::test]
    async fn test_stop_then_submit_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = started_store(&dir).await;
        store.stop().await;

        assert!(!store.store(reading(1, "n1", "s1", 0.0)));
    }
}
