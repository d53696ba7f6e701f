//! Test orchestration: setup, driver scheduling, the global deadline, and
//! teardown.
//!
//! The orchestrator owns the root cancellation token. Expiry of the
//! configured duration and an operator interrupt both cancel it; a driver
//! internal error also cancels it so every other driver winds down. Setup
//! errors abort the test with no teardown; every other outcome runs
//! teardown best-effort.

use crate::config::Config;
use crate::db::ConnectionConfig;
use crate::driver::{DriverError, JobDriver};
use crate::stats::{JobStats, ResultPipeline};
use crate::summary;
use anyhow::Context;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the multiplexed results channel; deep enough that drivers
/// rarely block on the pipeline consumer.
const RESULTS_CHANNEL_CAPACITY: usize = 1024;

/// Everything one test run needs, passed explicitly; there is no ambient
/// process-wide state.
pub struct RunContext {
    pub config: Config,
    pub connection: ConnectionConfig,
    /// Write the JSON summary here when set.
    pub json_output: Option<PathBuf>,
    /// Wire SIGINT to the root cancellation token. Tests disable this.
    pub handle_interrupts: bool,
}

/// Outcome of a completed run.
#[derive(Debug)]
pub struct RunOutcome {
    pub stats: HashMap<String, JobStats>,
}

/// Run the configured workload to completion.
///
/// Returns `Err` for setup failures and driver internal errors; duration
/// expiry and operator interrupt are normal completions.
pub async fn run(ctx: RunContext) -> anyhow::Result<RunOutcome> {
    let config = ctx.config;
    let flavor = config.flavor.clone();

    let max_connections = config.max_connections();
    info!(
        flavor = flavor.name(),
        max_connections, "connecting to the database"
    );
    let db = flavor
        .connect(&ctx.connection, max_connections)
        .await
        .context("connecting to the database")?;

    let cancel = CancellationToken::new();
    let (results_tx, results_rx) = mpsc::channel(RESULTS_CHANNEL_CAPACITY);

    // Build every driver before setup runs: a missing args file or an
    // unwritable results file aborts the test before it touches the
    // database.
    let mut drivers = Vec::new();
    for job in config.jobs.values() {
        let driver = JobDriver::new(
            job.clone(),
            flavor.clone(),
            db.clone(),
            cancel.clone(),
            results_tx.clone(),
        )
        .with_context(|| format!("preparing job {:?}", job.name))?;
        drivers.push((job.name.clone(), driver));
    }
    drop(results_tx);

    if !config.setup.is_empty() {
        info!("performing setup ({} queries)", config.setup.len());
        if let Err(e) = db.run_script(&config.setup).await {
            // Setup failures skip teardown: the schema never materialized.
            db.close().await;
            return Err(anyhow::anyhow!(e).context("setup query failed"));
        }
    }

    // T0: gating for every job's start/stop offset begins now.
    let t0 = Instant::now();
    if !config.duration.is_zero() {
        let cancel = cancel.clone();
        let duration = config.duration;
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            info!("test duration elapsed");
            cancel.cancel();
        });
    }
    if ctx.handle_interrupts {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                signal = tokio::signal::ctrl_c() => {
                    if signal.is_ok() {
                        info!("received interrupt");
                    }
                    cancel.cancel();
                }
            }
        });
    }

    let pipeline = ResultPipeline::new(
        config.accepted_errors.clone(),
        config.jobs.keys().cloned(),
    );
    let stats_task = tokio::spawn(pipeline.run(results_rx));

    let mut running: JoinSet<(String, Result<(), DriverError>)> = JoinSet::new();
    for (name, driver) in drivers {
        running.spawn(async move { (name, driver.run(t0).await) });
    }

    let mut driver_error: Option<anyhow::Error> = None;
    while let Some(joined) = running.join_next().await {
        match joined {
            Ok((name, Ok(()))) => debug!(job = %name, "driver finished"),
            Ok((name, Err(e))) => {
                error!(job = %name, "driver failed: {e}");
                // One failing driver stops the whole test.
                cancel.cancel();
                driver_error
                    .get_or_insert_with(|| anyhow::anyhow!(e).context(format!("job {name:?}")));
            }
            Err(e) => {
                error!("driver task panicked: {e}");
                cancel.cancel();
                driver_error.get_or_insert_with(|| anyhow::anyhow!("driver task panicked: {e}"));
            }
        }
    }

    let stats = stats_task.await.context("result pipeline failed")?;

    if !config.teardown.is_empty() {
        // Teardown runs whether the test finished, was cancelled, or lost
        // a driver; its errors are reported, never fatal.
        info!("performing teardown ({} queries)", config.teardown.len());
        if let Err(e) = db.run_script(&config.teardown).await {
            warn!("teardown query failed: {e}");
        }
    }
    db.close().await;

    if let Some(path) = &ctx.json_output {
        summary::write_json_summary(path, &stats)
            .with_context(|| format!("writing summary to {}", path.display()))?;
        info!("wrote summary to {}", path.display());
    }

    match driver_error {
        Some(e) => Err(e),
        None => Ok(RunOutcome { stats }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RawConfig, RawJob};
    use crate::testing::{TestDatabase, TestFlavor};
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    fn context(config: Config) -> RunContext {
        RunContext {
            config,
            connection: ConnectionConfig::default(),
            json_output: None,
            handle_interrupts: false,
        }
    }

    fn config_with(db: Arc<TestDatabase>, raw: RawConfig) -> Config {
        raw.validate(Arc::new(TestFlavor::new(db)), Path::new("/tmp"))
            .unwrap()
    }

    fn smoke_raw() -> RawConfig {
        RawConfig {
            duration: Some("2s".to_string()),
            setup_queries: vec!["CREATE TABLE t (x INT)".to_string()],
            teardown_queries: vec!["DROP TABLE t".to_string()],
            jobs: vec![(
                "a".to_string(),
                RawJob {
                    queries: vec!["SELECT 1".to_string()],
                    ..Default::default()
                },
            )],
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_smoke_run() {
        let db = Arc::new(TestDatabase::new().with_latency(Duration::from_millis(10)));
        let outcome = run(context(config_with(Arc::clone(&db), smoke_raw())))
            .await
            .unwrap();

        let a = &outcome.stats["a"];
        assert!(a.count >= 1);
        assert_eq!(a.error_count, 0);
        // Setup then teardown, in order.
        let scripts = db.scripts();
        assert_eq!(scripts.len(), 2);
        assert_eq!(scripts[0], vec!["CREATE TABLE t (x INT)".to_string()]);
        assert_eq!(scripts[1], vec!["DROP TABLE t".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_failure_skips_teardown() {
        let db = Arc::new(TestDatabase::new().failing_script_on("CREATE", "permission denied"));
        let err = run(context(config_with(Arc::clone(&db), smoke_raw())))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("setup"), "{err:#}");
        assert_eq!(db.scripts().len(), 1);
        assert_eq!(db.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_failure_is_not_fatal() {
        let db = Arc::new(TestDatabase::new().failing_script_on("DROP", "already gone"));
        let outcome = run(context(config_with(Arc::clone(&db), smoke_raw()))).await;

        assert!(outcome.is_ok());
        assert_eq!(db.scripts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepted_errors_scenario() {
        let db = Arc::new(TestDatabase::new().failing_on("INSERT", "duplicate key"));
        let raw = RawConfig {
            errors: vec!["duplicate key".to_string()],
            jobs: vec![(
                "conflict".to_string(),
                RawJob {
                    queries: vec!["INSERT INTO t VALUES (1)".to_string()],
                    count: Some(50),
                    ..Default::default()
                },
            )],
            ..Default::default()
        };
        let outcome = run(context(config_with(Arc::clone(&db), raw)))
            .await
            .unwrap();

        let stats = &outcome.stats["conflict"];
        assert_eq!(stats.error_count, 0);
        assert_eq!(stats.ignored_error_count, 50);
        assert!(stats.first_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_error_cancels_run_but_runs_teardown() {
        let db = Arc::new(TestDatabase::new().with_latency(Duration::from_millis(1)));
        // A job that demands more queries than its args file can feed.
        let mut args_file = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        writeln!(args_file, "1\n2").unwrap();
        args_file.flush().unwrap();

        let raw = RawConfig {
            teardown_queries: vec!["DROP TABLE t".to_string()],
            jobs: vec![
                (
                    "starved".to_string(),
                    RawJob {
                        queries: vec!["SELECT ?".to_string()],
                        count: Some(10),
                        query_args_file: Some(args_file.path().display().to_string()),
                        ..Default::default()
                    },
                ),
                (
                    "steady".to_string(),
                    RawJob {
                        queries: vec!["SELECT 1".to_string()],
                        ..Default::default()
                    },
                ),
            ],
            ..Default::default()
        };
        let err = run(context(config_with(Arc::clone(&db), raw)))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("starved"), "{err:#}");
        // Teardown still ran after the driver failure.
        assert_eq!(db.scripts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_bounds_unbounded_jobs() {
        let db = Arc::new(TestDatabase::new().with_latency(Duration::from_millis(5)));
        let raw = RawConfig {
            duration: Some("1s".to_string()),
            jobs: vec![(
                "forever".to_string(),
                RawJob {
                    queries: vec!["SELECT 1".to_string()],
                    queue_depth: Some(4),
                    ..Default::default()
                },
            )],
            ..Default::default()
        };

        let begin = Instant::now();
        let outcome = run(context(config_with(Arc::clone(&db), raw)))
            .await
            .unwrap();
        assert!(begin.elapsed() < Duration::from_secs(3));
        assert!(outcome.stats["forever"].count > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_json_summary_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        let db = Arc::new(TestDatabase::new());

        let mut ctx = context(config_with(Arc::clone(&db), smoke_raw()));
        ctx.json_output = Some(path.clone());
        run(ctx).await.unwrap();

        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(parsed.get("a").is_some());
    }
}
