//! Result fan-in and per-job statistics.
//!
//! Every query a driver issues produces exactly one [`JobResult`], sent over
//! a shared channel. A single [`ResultPipeline`] task consumes the channel
//! and folds results into per-job [`JobStats`], so no locking is needed
//! around the statistics themselves.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Why a query execution did not succeed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResultError {
    /// Database error, already normalized by the flavor.
    #[error("{0}")]
    Db(String),

    /// A replayed log record failed query validation.
    #[error("bad query: {0}")]
    BadQuery(String),

    /// The run was cancelled while this query was in flight.
    #[error("cancelled")]
    Cancelled,
}

/// Outcome of one query execution.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub job_name: String,
    /// Wall clock just before the query was issued.
    pub started_at: DateTime<Utc>,
    /// Wall time from just before issue to observation of the outcome.
    pub elapsed: Duration,
    pub rows_read: u64,
    pub error: Option<ResultError>,
    /// Argument row bound to the query, for error context.
    pub args: Option<Vec<String>>,
}

/// Upper bound of the histogram range: the last full base-2 octave covering
/// one hour, in microseconds.
const MAX_MICROS: u64 = (1 << 32) - 1;

/// Linear sub-buckets per base-2 octave.
const SUB_BUCKETS: u64 = 4;

/// Bucket count: 4 unit buckets below the first full octave, then 4 per
/// octave for octaves 2..=31 (2^31 < 1h in µs <= 2^32).
const BUCKET_COUNT: usize = 4 + 30 * SUB_BUCKETS as usize;

/// Fixed log-linear latency histogram, 1µs to 1h.
///
/// Base-2 octaves with four linear sub-buckets each keep the layout small
/// and make merges and percentile scans O(buckets).
#[derive(Debug, Clone)]
pub struct Histogram {
    buckets: [u64; BUCKET_COUNT],
    total: u64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            buckets: [0; BUCKET_COUNT],
            total: 0,
        }
    }
}

impl Histogram {
    fn bucket_index(micros: u64) -> usize {
        let v = micros.clamp(1, MAX_MICROS);
        if v < SUB_BUCKETS {
            return v as usize;
        }
        let octave = 63 - v.leading_zeros() as u64;
        let sub = (v >> (octave - 2)) & (SUB_BUCKETS - 1);
        (4 + (octave - 2) * SUB_BUCKETS + sub) as usize
    }

    /// Smallest value (µs) that lands in bucket `index`.
    fn bucket_floor(index: usize) -> u64 {
        if index < 4 {
            return index as u64;
        }
        let octave = 2 + (index as u64 - 4) / SUB_BUCKETS;
        let sub = (index as u64 - 4) % SUB_BUCKETS;
        (1 << octave) + sub * (1 << (octave - 2))
    }

    pub fn record(&mut self, elapsed: Duration) {
        let index = Self::bucket_index(elapsed.as_micros() as u64);
        self.buckets[index] += 1;
        self.total += 1;
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Latency floor (µs) of the bucket containing the `p`-th percentile.
    pub fn percentile(&self, p: f64) -> u64 {
        if self.total == 0 {
            return 0;
        }
        let target = ((p / 100.0) * self.total as f64).ceil().max(1.0) as u64;
        let mut cumulative = 0;
        for (index, count) in self.buckets.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return Self::bucket_floor(index);
            }
        }
        Self::bucket_floor(BUCKET_COUNT - 1)
    }

    /// Non-empty buckets as `(floor_micros, count)` pairs.
    pub fn nonzero_buckets(&self) -> Vec<(u64, u64)> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, count)| **count > 0)
            .map(|(index, count)| (Self::bucket_floor(index), *count))
            .collect()
    }
}

/// Accumulated statistics for one job. All counters are monotone; min and
/// max only tighten; the first fatal error is latched.
#[derive(Debug, Clone, Default)]
pub struct JobStats {
    pub count: u64,
    pub error_count: u64,
    pub ignored_error_count: u64,
    pub rows_read: u64,
    pub elapsed_sum: Duration,
    elapsed_sum_sq_secs: f64,
    pub elapsed_min: Option<Duration>,
    pub elapsed_max: Option<Duration>,
    pub histogram: Histogram,
    pub first_error: Option<String>,
}

impl JobStats {
    fn record_success(&mut self, elapsed: Duration, rows_read: u64) {
        self.count += 1;
        self.rows_read += rows_read;
        self.elapsed_sum += elapsed;
        let secs = elapsed.as_secs_f64();
        self.elapsed_sum_sq_secs += secs * secs;
        self.elapsed_min = Some(match self.elapsed_min {
            Some(min) => min.min(elapsed),
            None => elapsed,
        });
        self.elapsed_max = Some(match self.elapsed_max {
            Some(max) => max.max(elapsed),
            None => elapsed,
        });
        self.histogram.record(elapsed);
    }

    fn record_error(&mut self, message: String) {
        self.error_count += 1;
        if self.first_error.is_none() {
            self.first_error = Some(message);
        }
    }

    fn record_ignored(&mut self) {
        self.ignored_error_count += 1;
    }

    /// Total executions observed, successful or not.
    pub fn executions(&self) -> u64 {
        self.count + self.error_count + self.ignored_error_count
    }

    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        self.elapsed_sum / self.count as u32
    }

    pub fn stddev(&self) -> Duration {
        if self.count < 2 {
            return Duration::ZERO;
        }
        let n = self.count as f64;
        let mean = self.elapsed_sum.as_secs_f64() / n;
        let variance = (self.elapsed_sum_sq_secs / n - mean * mean).max(0.0);
        Duration::from_secs_f64(variance.sqrt())
    }
}

/// Single consumer that folds [`JobResult`]s into per-job [`JobStats`].
pub struct ResultPipeline {
    accepted_errors: HashSet<String>,
    stats: HashMap<String, JobStats>,
}

impl ResultPipeline {
    /// `job_names` pre-seeds the stats map so jobs that never produce a
    /// result still appear in the summary.
    pub fn new<I: IntoIterator<Item = String>>(
        accepted_errors: HashSet<String>,
        job_names: I,
    ) -> Self {
        let stats = job_names
            .into_iter()
            .map(|name| (name, JobStats::default()))
            .collect();
        Self {
            accepted_errors,
            stats,
        }
    }

    /// Consume results until every sender is dropped, then return the
    /// accumulated stats.
    pub async fn run(mut self, mut results: mpsc::Receiver<JobResult>) -> HashMap<String, JobStats> {
        while let Some(result) = results.recv().await {
            self.record(result);
        }
        self.stats
    }

    pub(crate) fn record(&mut self, result: JobResult) {
        let stats = self.stats.entry(result.job_name.clone()).or_default();
        match result.error {
            None => stats.record_success(result.elapsed, result.rows_read),
            Some(ResultError::Cancelled) => stats.record_ignored(),
            Some(ResultError::Db(message)) => {
                if self.accepted_errors.contains(&message) {
                    debug!(job = %result.job_name, error = %message, "accepted error");
                    stats.record_ignored();
                } else {
                    stats.record_error(match &result.args {
                        Some(args) => format!("{message} (args: {args:?})"),
                        None => message,
                    });
                }
            }
            Some(ResultError::BadQuery(message)) => {
                // Bad-query results classify like any other error: an
                // operator may list their messages in the accepted set.
                if self.accepted_errors.contains(&message) {
                    debug!(job = %result.job_name, error = %message, "accepted error");
                    stats.record_ignored();
                } else {
                    stats.record_error(format!("bad query: {message}"));
                }
            }
        }
    }

    pub(crate) fn into_stats(self) -> HashMap<String, JobStats> {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(job: &str, elapsed_ms: u64, error: Option<ResultError>) -> JobResult {
        JobResult {
            job_name: job.to_string(),
            started_at: Utc::now(),
            elapsed: Duration::from_millis(elapsed_ms),
            rows_read: 1,
            error,
            args: None,
        }
    }

    #[test]
    fn test_bucket_index_monotone() {
        let mut last = 0;
        for micros in [1u64, 2, 3, 4, 5, 7, 8, 100, 1000, 65_536, 1_000_000, MAX_MICROS] {
            let index = Histogram::bucket_index(micros);
            assert!(index >= last, "index regressed at {micros}µs");
            last = index;
        }
        assert!(Histogram::bucket_index(MAX_MICROS) < BUCKET_COUNT);
        // Out-of-range values clamp instead of panicking.
        assert_eq!(
            Histogram::bucket_index(u64::MAX),
            Histogram::bucket_index(MAX_MICROS)
        );
    }

    #[test]
    fn test_bucket_floor_round_trips() {
        for index in 1..BUCKET_COUNT {
            let floor = Histogram::bucket_floor(index);
            assert_eq!(
                Histogram::bucket_index(floor),
                index,
                "floor {floor}µs not in its own bucket"
            );
        }
    }

    #[test]
    fn test_histogram_percentiles() {
        let mut histogram = Histogram::default();
        for ms in 1..=100u64 {
            histogram.record(Duration::from_millis(ms));
        }
        assert_eq!(histogram.total(), 100);

        let p50 = histogram.percentile(50.0);
        let p99 = histogram.percentile(99.0);
        assert!(p50 >= 40_000 && p50 <= 50_000, "p50 was {p50}µs");
        assert!(p99 >= 80_000 && p99 <= 99_000, "p99 was {p99}µs");
        assert!(p50 <= p99);
    }

    #[test]
    fn test_stats_accumulation() {
        let mut stats = JobStats::default();
        stats.record_success(Duration::from_millis(10), 2);
        stats.record_success(Duration::from_millis(30), 3);

        assert_eq!(stats.count, 2);
        assert_eq!(stats.rows_read, 5);
        assert_eq!(stats.elapsed_min, Some(Duration::from_millis(10)));
        assert_eq!(stats.elapsed_max, Some(Duration::from_millis(30)));
        assert_eq!(stats.mean(), Duration::from_millis(20));
        assert_eq!(stats.histogram.total(), 2);
    }

    #[test]
    fn test_pipeline_classification() {
        let accepted: HashSet<String> = ["duplicate key".to_string()].into();
        let mut pipeline = ResultPipeline::new(accepted, vec!["a".to_string()]);

        pipeline.record(result("a", 5, None));
        pipeline.record(result("a", 5, Some(ResultError::Db("duplicate key".into()))));
        pipeline.record(result("a", 5, Some(ResultError::Db("table missing".into()))));
        pipeline.record(result("a", 5, Some(ResultError::Db("table missing".into()))));
        pipeline.record(result("a", 5, Some(ResultError::Cancelled)));

        let stats = pipeline.into_stats();
        let a = &stats["a"];
        assert_eq!(a.count, 1);
        assert_eq!(a.ignored_error_count, 2);
        assert_eq!(a.error_count, 2);
        assert_eq!(a.executions(), 5);
        assert_eq!(a.first_error.as_deref(), Some("table missing"));
    }

    #[test]
    fn test_accepted_errors_do_not_taint() {
        let accepted: HashSet<String> = ["duplicate key".to_string()].into();
        let mut pipeline = ResultPipeline::new(accepted, vec!["a".to_string()]);
        for _ in 0..50 {
            pipeline.record(result("a", 1, Some(ResultError::Db("duplicate key".into()))));
        }

        let stats = pipeline.into_stats();
        let a = &stats["a"];
        assert_eq!(a.error_count, 0);
        assert_eq!(a.ignored_error_count, 50);
        assert!(a.first_error.is_none());
    }

    #[test]
    fn test_accepted_bad_query_is_ignored() {
        let accepted: HashSet<String> = ["empty query".to_string()].into();
        let mut pipeline = ResultPipeline::new(accepted, vec!["a".to_string()]);

        pipeline.record(result(
            "a",
            0,
            Some(ResultError::BadQuery("empty query".into())),
        ));
        pipeline.record(result(
            "a",
            0,
            Some(ResultError::BadQuery("invalid query: multiple statements".into())),
        ));

        let stats = pipeline.into_stats();
        let a = &stats["a"];
        assert_eq!(a.ignored_error_count, 1);
        assert_eq!(a.error_count, 1);
        assert_eq!(
            a.first_error.as_deref(),
            Some("bad query: invalid query: multiple statements")
        );
    }

    #[test]
    fn test_pipeline_preseeds_jobs() {
        let pipeline = ResultPipeline::new(HashSet::new(), vec!["quiet".to_string()]);
        let stats = pipeline.into_stats();
        assert!(stats.contains_key("quiet"));
        assert_eq!(stats["quiet"].executions(), 0);
    }

    #[tokio::test]
    async fn test_pipeline_drains_channel() {
        let (tx, rx) = mpsc::channel(16);
        let pipeline = ResultPipeline::new(HashSet::new(), vec!["a".to_string()]);
        let handle = tokio::spawn(pipeline.run(rx));

        for _ in 0..10 {
            tx.send(result("a", 1, None)).await.unwrap();
        }
        drop(tx);

        let stats = handle.await.unwrap();
        assert_eq!(stats["a"].count, 10);
    }
}
