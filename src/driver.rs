//! Per-job execution drivers.
//!
//! A [`JobDriver`] runs one job in exactly one of three pacing modes:
//!
//! - **Rate**: batches of `batch_size` queries fired at `rate` batches per
//!   second on a monotonic tick aligned to the job's start offset. A late
//!   driver issues the accumulated batches immediately (bounded coalescing)
//!   and then resumes on schedule; batches may overlap in flight.
//! - **Queue-depth**: a closed loop keeping exactly `queue_depth` queries
//!   in flight; the next query starts only when a worker frees, and
//!   results are emitted in query-start order.
//! - **Replay**: a recorded query log replayed at its original inter-record
//!   spacing, one query outstanding at a time.
//!
//! All modes share one contract: every issued query produces exactly one
//! [`JobResult`], cancellation stops new issues and aborts in-flight
//! queries, and `start`/`stop` offsets gate issue times against T0.

use crate::args::{ArgSource, ArgSourceError};
use crate::config::{Job, JobMode};
use crate::db::Database;
use crate::flavor::DatabaseFlavor;
use crate::results::{ResultsWriteError, SafeCsvWriter};
use crate::stats::{JobResult, ResultError};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors that terminate a driver. Query failures are not among them; they
/// travel inside [`JobResult`]s.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("query args exhausted after {0} rows")]
    ArgsExhausted(u64),

    #[error(transparent)]
    Args(#[from] ArgSourceError),

    #[error(transparent)]
    Results(#[from] ResultsWriteError),

    #[error("reading query log: {0}")]
    QueryLog(#[source] std::io::Error),

    #[error("results channel closed")]
    ChannelClosed,

    #[error("driver task failed: {0}")]
    Task(String),
}

/// Shared state cloned into every execution task of a job.
#[derive(Clone)]
struct ExecContext {
    job_name: Arc<String>,
    flavor: Arc<dyn DatabaseFlavor>,
    db: Arc<dyn Database>,
    writer: Option<Arc<SafeCsvWriter>>,
    cancel: CancellationToken,
    results: mpsc::Sender<JobResult>,
}

impl ExecContext {
    async fn emit(&self, result: JobResult) -> Result<(), DriverError> {
        self.results
            .send(result)
            .await
            .map_err(|_| DriverError::ChannelClosed)
    }

    /// Emit a result for a query that was never executed (a rejected
    /// replay record).
    async fn emit_rejected(&self, message: String) -> Result<(), DriverError> {
        self.emit(JobResult {
            job_name: self.job_name.as_ref().clone(),
            started_at: Utc::now(),
            elapsed: Duration::ZERO,
            rows_read: 0,
            error: Some(ResultError::BadQuery(message)),
            args: None,
        })
        .await
    }

    /// Run one query and build its result. In-flight cancellation aborts
    /// the query at the database handle and yields a `Cancelled` result
    /// instead.
    async fn run_one(
        &self,
        query: &str,
        args: Option<Vec<String>>,
    ) -> Result<JobResult, DriverError> {
        let started_at = Utc::now();
        let begin = Instant::now();
        let capture = self.writer.is_some();

        // Dropping the query future on cancellation aborts the query at
        // the database handle.
        let attempt = {
            let arg_slice: &[String] = args.as_deref().unwrap_or(&[]);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                outcome = self.db.run_query(query, arg_slice, capture) => Some(outcome),
            }
        };
        let elapsed = begin.elapsed();

        let (rows_read, error) = match attempt {
            None => (0, Some(ResultError::Cancelled)),
            Some(Ok(outcome)) => {
                if let Some(writer) = &self.writer {
                    for row in &outcome.rows {
                        writer.write_row(row)?;
                    }
                }
                (outcome.rows_read, None)
            }
            Some(Err(e)) => (
                0,
                Some(ResultError::Db(self.flavor.normalize_error(&e.message))),
            ),
        };

        Ok(JobResult {
            job_name: self.job_name.as_ref().clone(),
            started_at,
            elapsed,
            rows_read,
            error,
            args,
        })
    }

    /// Run one query and emit exactly one result for it.
    async fn execute(&self, query: String, args: Option<Vec<String>>) -> Result<(), DriverError> {
        let result = self.run_one(&query, args).await?;
        self.emit(result).await
    }
}

/// One dispatched query for the worker pool, with the slot its result is
/// returned through.
type QueueItem = (String, Option<Vec<String>>, oneshot::Sender<JobResult>);

/// Round-robin over the job's query texts.
struct QueryCycle {
    queries: Vec<String>,
    next: usize,
}

impl QueryCycle {
    fn new(queries: Vec<String>) -> Self {
        Self { queries, next: 0 }
    }

    fn next(&mut self) -> String {
        let query = self.queries[self.next].clone();
        self.next = (self.next + 1) % self.queries.len();
        query
    }
}

enum ArgFetch {
    NoSource,
    Row(Vec<String>),
    Eof { rows_read: u64 },
}

fn next_args(args: &mut Option<ArgSource>) -> Result<ArgFetch, DriverError> {
    match args {
        None => Ok(ArgFetch::NoSource),
        Some(source) => match source.next_row()? {
            Some(row) => Ok(ArgFetch::Row(row)),
            None => Ok(ArgFetch::Eof {
                rows_read: source.rows_read(),
            }),
        },
    }
}

fn flatten_join(
    joined: Result<Result<(), DriverError>, tokio::task::JoinError>,
) -> Option<DriverError> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(e) => Some(DriverError::Task(e.to_string())),
    }
}

/// Drives one job from its start offset to whichever comes first of its
/// stop offset, its count bound, arg exhaustion, or cancellation.
pub struct JobDriver {
    job: Job,
    cancel: CancellationToken,
    args: Option<ArgSource>,
    writer: Option<Arc<SafeCsvWriter>>,
    ctx: ExecContext,
}

impl JobDriver {
    /// Create the driver, opening the job's input and output files. Fails
    /// before any query runs if a file cannot be opened; the results file
    /// is truncated here.
    pub fn new(
        job: Job,
        flavor: Arc<dyn DatabaseFlavor>,
        db: Arc<dyn Database>,
        cancel: CancellationToken,
        results: mpsc::Sender<JobResult>,
    ) -> Result<Self, DriverError> {
        let args = match &job.query_args {
            Some(spec) => Some(ArgSource::open(&spec.path, spec.delimiter)?),
            None => None,
        };
        let writer = match &job.query_results {
            Some(path) => Some(Arc::new(SafeCsvWriter::create(path)?)),
            None => None,
        };
        let ctx = ExecContext {
            job_name: Arc::new(job.name.clone()),
            flavor,
            db,
            writer: writer.clone(),
            cancel: cancel.clone(),
            results,
        };
        Ok(Self {
            job,
            cancel,
            args,
            writer,
            ctx,
        })
    }

    /// Run the job to completion. Returns `Ok` on every normal stop
    /// condition including cancellation; `Err` only for driver-internal
    /// failures (results-file I/O, args-file I/O, arg exhaustion under an
    /// explicit count).
    /// `t0` is the instant setup completed; `start`/`stop` offsets gate
    /// against it.
    pub async fn run(mut self, t0: Instant) -> Result<(), DriverError> {
        let start_at = t0 + self.job.start;
        tokio::select! {
            _ = self.cancel.cancelled() => return self.finish(Ok(())),
            _ = sleep_until(start_at) => {}
        }

        let stop_at = (!self.job.stop.is_zero()).then(|| t0 + self.job.stop);
        info!(job = %self.job.name, mode = ?self.job.mode(), "job starting");

        let result = match self.job.mode() {
            JobMode::Rate => self.run_rate(start_at, stop_at).await,
            JobMode::QueueDepth => self.run_queue(stop_at).await,
            JobMode::Replay => self.run_replay(start_at, stop_at).await,
        };

        debug!(job = %self.job.name, ok = result.is_ok(), "job finished");
        self.finish(result)
    }

    /// Close the results writer, surfacing its latched error unless an
    /// earlier driver error takes precedence.
    fn finish(&self, result: Result<(), DriverError>) -> Result<(), DriverError> {
        if let Some(writer) = &self.writer {
            let closed = writer.close();
            if result.is_ok() {
                closed?;
            }
        }
        result
    }

    /// Consume the next arg row for one query, or decide how to stop.
    /// Returns `Err` on I/O failure or on EOF while an explicit count still
    /// demands more queries; `Ok(None)` signals a clean end of the job.
    fn fetch_args(&mut self, issued: u64) -> Result<Option<Option<Vec<String>>>, DriverError> {
        match next_args(&mut self.args)? {
            ArgFetch::NoSource => Ok(Some(None)),
            ArgFetch::Row(row) => Ok(Some(Some(row))),
            ArgFetch::Eof { rows_read } => {
                if self.job.count > 0 && issued < self.job.count {
                    Err(DriverError::ArgsExhausted(rows_read))
                } else {
                    Ok(None)
                }
            }
        }
    }

    async fn run_rate(
        &mut self,
        start_at: Instant,
        stop_at: Option<Instant>,
    ) -> Result<(), DriverError> {
        let period = Duration::from_secs_f64(1.0 / self.job.rate);
        let mut ticker = interval_at(start_at, period);
        // A driver late by more than one interval catches up by firing the
        // missed ticks back to back, preserving the mean rate.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

        let mut cycle = QueryCycle::new(self.job.queries.clone());
        let mut issued = 0u64;
        let mut tasks: JoinSet<Result<(), DriverError>> = JoinSet::new();
        let mut first_error: Option<DriverError> = None;

        'issue: loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break 'issue,
                _ = async {
                    match stop_at {
                        Some(stop) => sleep_until(stop).await,
                        None => std::future::pending().await,
                    }
                } => break 'issue,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Some(e) = flatten_join(joined) {
                        first_error = Some(e);
                        break 'issue;
                    }
                }
                _ = ticker.tick() => {
                    for _ in 0..self.job.batch_size {
                        if self.job.count > 0 && issued >= self.job.count {
                            break 'issue;
                        }
                        let args = match self.fetch_args(issued) {
                            Ok(Some(args)) => args,
                            Ok(None) => break 'issue,
                            Err(e) => {
                                first_error = Some(e);
                                break 'issue;
                            }
                        };
                        let query = cycle.next();
                        issued += 1;
                        let ctx = self.ctx.clone();
                        tasks.spawn(async move { ctx.execute(query, args).await });
                    }
                }
            }
        }

        // Stop issuing but await everything in flight.
        while let Some(joined) = tasks.join_next().await {
            if let Some(e) = flatten_join(joined) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn run_queue(&mut self, stop_at: Option<Instant>) -> Result<(), DriverError> {
        let depth = self.job.queue_depth as usize;
        // Capacity 1 keeps the loop closed: at most one query is staged
        // ahead of the workers.
        let (work_tx, work_rx) = mpsc::channel::<QueueItem>(1);
        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));

        // Workers hand completed results back through per-query slots. The
        // emitter awaits the slots in dispatch order, so results leave in
        // query-start order even when a later query finishes first. The
        // queue of pending slots is bounded; a full queue backpressures the
        // dispatcher, never the workers.
        let (order_tx, mut order_rx) =
            mpsc::channel::<oneshot::Receiver<JobResult>>(depth * 2 + 4);
        let emitter = {
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                while let Some(pending) = order_rx.recv().await {
                    // A dropped slot means the query was never executed.
                    if let Ok(result) = pending.await {
                        ctx.emit(result).await?;
                    }
                }
                Ok::<(), DriverError>(())
            })
        };

        let mut workers: JoinSet<Result<(), DriverError>> = JoinSet::new();
        for _ in 0..depth {
            let ctx = self.ctx.clone();
            let work_rx = Arc::clone(&work_rx);
            workers.spawn(async move {
                loop {
                    let item = { work_rx.lock().await.recv().await };
                    let Some((query, args, slot)) = item else {
                        return Ok(());
                    };
                    if ctx.cancel.is_cancelled()
                        || stop_at.is_some_and(|stop| Instant::now() >= stop)
                    {
                        // A staged query past the stop gate is dropped
                        // without executing; it never ran, so it produces
                        // no result.
                        continue;
                    }
                    let result = ctx.run_one(&query, args).await?;
                    let _ = slot.send(result);
                }
            });
        }

        let mut cycle = QueryCycle::new(self.job.queries.clone());
        let mut issued = 0u64;
        let dispatch: Result<(), DriverError> = loop {
            if self.job.count > 0 && issued >= self.job.count {
                break Ok(());
            }
            let args = match self.fetch_args(issued) {
                Ok(Some(args)) => args,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };
            let query = cycle.next();
            let (slot_tx, slot_rx) = oneshot::channel();
            if order_tx.send(slot_rx).await.is_err() {
                break Ok(());
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                _ = async {
                    match stop_at {
                        Some(stop) => sleep_until(stop).await,
                        None => std::future::pending().await,
                    }
                } => break Ok(()),
                sent = work_tx.send((query, args, slot_tx)) => {
                    if sent.is_err() {
                        // Every worker exited; their errors surface below.
                        break Ok(());
                    }
                    issued += 1;
                }
            }
        };

        drop(work_tx);
        drop(order_tx);
        let mut first_error = dispatch.err();
        while let Some(joined) = workers.join_next().await {
            if let Some(e) = flatten_join(joined) {
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = flatten_join(emitter.await) {
            first_error.get_or_insert(e);
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn run_replay(
        &mut self,
        start_at: Instant,
        stop_at: Option<Instant>,
    ) -> Result<(), DriverError> {
        let Some(path) = self.job.query_log.clone() else {
            return Ok(());
        };
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(DriverError::QueryLog)?;
        let mut lines = tokio::io::BufReader::new(file).lines();

        let mut first_timestamp: Option<u64> = None;
        let mut issued = 0u64;

        while let Some(line) = lines.next_line().await.map_err(DriverError::QueryLog)? {
            if line.trim().is_empty() {
                continue;
            }
            if self.job.count > 0 && issued >= self.job.count {
                break;
            }

            let (timestamp, query) = match parse_log_record(&line) {
                Ok(record) => record,
                Err(message) => {
                    warn!(job = %self.job.name, "skipping log record: {message}");
                    issued += 1;
                    self.ctx.emit_rejected(message).await?;
                    continue;
                }
            };

            // Replay honors the spacing relative to the first record; the
            // first record fires at the job's start offset.
            let base = *first_timestamp.get_or_insert(timestamp);
            let target = start_at + Duration::from_micros(timestamp.saturating_sub(base));
            if let Some(stop) = stop_at {
                if target >= stop {
                    break;
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep_until(target) => {}
            }

            issued += 1;
            if let Err(e) = self.ctx.flavor.check_query(&query) {
                self.ctx.emit_rejected(e.to_string()).await?;
                continue;
            }
            // Closed-loop on read: one outstanding query per replay step.
            self.ctx.execute(query, None).await?;
        }

        Ok(())
    }
}

/// Parse a `<micros>,<query>` log record.
fn parse_log_record(line: &str) -> Result<(u64, String), String> {
    let (timestamp, query) = line
        .split_once(',')
        .ok_or_else(|| format!("malformed log record {line:?}"))?;
    let timestamp: u64 = timestamp
        .trim()
        .parse()
        .map_err(|_| format!("bad timestamp in log record {line:?}"))?;
    Ok((timestamp, query.to_string()))
}
