//! In-memory database doubles for exercising drivers and the orchestrator
//! without a live server.

use crate::db::{ConnectionConfig, Database, DbError, QueryOutcome};
use crate::flavor::DatabaseFlavor;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// One recorded call to [`Database::run_query`].
#[derive(Debug, Clone)]
pub struct RecordedQuery {
    pub query: String,
    pub args: Vec<String>,
    /// Monotonic issue time, usable under paused test clocks.
    pub issued_at: Instant,
}

/// Scriptable [`Database`] that records every call.
#[derive(Default)]
pub struct TestDatabase {
    latency: Duration,
    /// Extra latency for queries containing the marker.
    slow_on: Option<(String, Duration)>,
    /// Queries containing the marker fail with the message.
    fail_on: Option<(String, String)>,
    /// Script queries containing the marker fail with the message.
    fail_script_on: Option<(String, String)>,
    /// Rows returned from every successful query.
    rows: Vec<Vec<String>>,
    calls: Mutex<Vec<RecordedQuery>>,
    scripts: Mutex<Vec<Vec<String>>>,
}

impl TestDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulated per-query latency.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Add `extra` latency to queries containing `marker`.
    pub fn slow_on(mut self, marker: &str, extra: Duration) -> Self {
        self.slow_on = Some((marker.to_string(), extra));
        self
    }

    /// Fail queries containing `marker` with `message`.
    pub fn failing_on(mut self, marker: &str, message: &str) -> Self {
        self.fail_on = Some((marker.to_string(), message.to_string()));
        self
    }

    /// Fail script queries containing `marker` with `message`.
    pub fn failing_script_on(mut self, marker: &str, message: &str) -> Self {
        self.fail_script_on = Some((marker.to_string(), message.to_string()));
        self
    }

    /// Rows every successful query returns.
    pub fn with_rows(mut self, rows: Vec<Vec<String>>) -> Self {
        self.rows = rows;
        self
    }

    pub fn calls(&self) -> Vec<RecordedQuery> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Scripts executed via [`Database::run_script`], in order.
    pub fn scripts(&self) -> Vec<Vec<String>> {
        self.scripts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Database for TestDatabase {
    async fn run_query(
        &self,
        query: &str,
        args: &[String],
        capture: bool,
    ) -> Result<QueryOutcome, DbError> {
        self.calls.lock().unwrap().push(RecordedQuery {
            query: query.to_string(),
            args: args.to_vec(),
            issued_at: Instant::now(),
        });

        let mut latency = self.latency;
        if let Some((marker, extra)) = &self.slow_on {
            if query.contains(marker.as_str()) {
                latency += *extra;
            }
        }
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if let Some((marker, message)) = &self.fail_on {
            if query.contains(marker.as_str()) {
                return Err(DbError::new(message.clone()));
            }
        }

        Ok(QueryOutcome {
            rows_read: self.rows.len().max(1) as u64,
            rows: if capture { self.rows.clone() } else { Vec::new() },
        })
    }

    async fn run_script(&self, queries: &[String]) -> Result<(), DbError> {
        self.scripts.lock().unwrap().push(queries.to_vec());
        if let Some((marker, message)) = &self.fail_script_on {
            if queries.iter().any(|q| q.contains(marker.as_str())) {
                return Err(DbError::new(message.clone()));
            }
        }
        Ok(())
    }

    async fn close(&self) {}
}

/// Flavor whose [`DatabaseFlavor::connect`] hands out a pre-built
/// [`TestDatabase`], so orchestrator tests control the backend.
pub struct TestFlavor {
    database: Arc<TestDatabase>,
}

impl TestFlavor {
    pub fn new(database: Arc<TestDatabase>) -> Self {
        Self { database }
    }
}

#[async_trait]
impl DatabaseFlavor for TestFlavor {
    fn name(&self) -> &'static str {
        "test"
    }

    fn query_separator(&self) -> char {
        ';'
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn normalize_error(&self, message: &str) -> String {
        message.to_string()
    }

    async fn connect(
        &self,
        _config: &ConnectionConfig,
        _max_connections: usize,
    ) -> anyhow::Result<Arc<dyn Database>> {
        Ok(self.database.clone())
    }
}

/// A test flavor backed by a fresh default [`TestDatabase`].
pub fn test_flavor() -> Arc<dyn DatabaseFlavor> {
    Arc::new(TestFlavor::new(Arc::new(TestDatabase::new())))
}
