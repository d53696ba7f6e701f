//! Human and machine summaries of accumulated job statistics.

use crate::stats::JobStats;
use anyhow::Context;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

fn format_duration(d: Duration) -> String {
    let micros = d.as_micros();
    if micros < 1_000 {
        format!("{micros}µs")
    } else if micros < 1_000_000 {
        format!("{:.2}ms", d.as_secs_f64() * 1e3)
    } else {
        format!("{:.2}s", d.as_secs_f64())
    }
}

fn micros(us: u64) -> Duration {
    Duration::from_micros(us)
}

/// One human-readable line for one job.
pub fn job_line(name: &str, stats: &JobStats) -> String {
    if stats.executions() == 0 {
        return format!("{name}: no queries executed");
    }
    let mut line = format!(
        "{name}: {} queries, mean {} p50 {} p95 {} p99 {} max {}",
        stats.count,
        format_duration(stats.mean()),
        format_duration(micros(stats.histogram.percentile(50.0))),
        format_duration(micros(stats.histogram.percentile(95.0))),
        format_duration(micros(stats.histogram.percentile(99.0))),
        format_duration(stats.elapsed_max.unwrap_or(Duration::ZERO)),
    );
    line.push_str(&format!(
        ", {} errors ({} ignored)",
        stats.error_count, stats.ignored_error_count
    ));
    if let Some(error) = &stats.first_error {
        line.push_str(&format!(", first error: {error}"));
    }
    line
}

/// Full human summary, one line per job, sorted by job name.
pub fn human_summary(stats: &HashMap<String, JobStats>) -> String {
    let mut names: Vec<&String> = stats.keys().collect();
    names.sort();
    names
        .iter()
        .map(|name| job_line(name, &stats[*name]))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobSummary {
    count: u64,
    error_count: u64,
    ignored_error_count: u64,
    rows_read: u64,
    mean_us: u64,
    stddev_us: u64,
    min_us: u64,
    max_us: u64,
    p50_us: u64,
    p95_us: u64,
    p99_us: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    first_error: Option<String>,
    /// Non-empty latency buckets as `[floor_us, count]` pairs.
    histogram: Vec<(u64, u64)>,
}

impl JobSummary {
    fn from_stats(stats: &JobStats) -> Self {
        Self {
            count: stats.count,
            error_count: stats.error_count,
            ignored_error_count: stats.ignored_error_count,
            rows_read: stats.rows_read,
            mean_us: stats.mean().as_micros() as u64,
            stddev_us: stats.stddev().as_micros() as u64,
            min_us: stats.elapsed_min.unwrap_or(Duration::ZERO).as_micros() as u64,
            max_us: stats.elapsed_max.unwrap_or(Duration::ZERO).as_micros() as u64,
            p50_us: stats.histogram.percentile(50.0),
            p95_us: stats.histogram.percentile(95.0),
            p99_us: stats.histogram.percentile(99.0),
            first_error: stats.first_error.clone(),
            histogram: stats.histogram.nonzero_buckets(),
        }
    }
}

/// Write the machine summary as pretty JSON keyed by job name.
///
/// The file is written to a sibling temporary path and renamed into place
/// so readers never observe a partial summary.
pub fn write_json_summary(path: &Path, stats: &HashMap<String, JobStats>) -> anyhow::Result<()> {
    let summary: HashMap<&String, JobSummary> = stats
        .iter()
        .map(|(name, stats)| (name, JobSummary::from_stats(stats)))
        .collect();
    let json = serde_json::to_string_pretty(&summary)?;

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, json.as_bytes())
        .with_context(|| format!("writing summary to {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("renaming summary into {}", path.display()))?;
    Ok(())
}
