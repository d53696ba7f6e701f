//! The JSON config surface.
//!
//! Mirrors the INI surface field for field; both produce the same
//! [`RawConfig`]. [`to_json_string`] serializes a validated [`Config`] back
//! into this surface, so a config can round-trip between syntaxes.

use crate::config::{format_duration_str, Config, Job, RawConfig, RawJob};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default, rename = "error", skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "SectionOptions::is_empty")]
    pub setup: SectionOptions,
    #[serde(default, skip_serializing_if = "SectionOptions::is_empty")]
    pub teardown: SectionOptions,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub jobs: BTreeMap<String, JobOptions>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionOptions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub queries: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub query_files: Vec<String>,
}

impl SectionOptions {
    fn is_empty(&self) -> bool {
        self.queries.is_empty() && self.query_files.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub queries: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub query_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_args_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_args_delim: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_results_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub multi_query_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_log_file: Option<String>,
}

impl From<JobOptions> for RawJob {
    fn from(options: JobOptions) -> Self {
        RawJob {
            start: options.start,
            stop: options.stop,
            queries: options.queries,
            query_files: options.query_files,
            query_args_file: options.query_args_file,
            query_args_delim: options.query_args_delim,
            query_results_file: options.query_results_file,
            rate: options.rate,
            batch_size: options.batch_size,
            queue_depth: options.queue_depth,
            concurrency: options.concurrency,
            count: options.count,
            multi_query: options.multi_query_mode,
            query_log_file: options.query_log_file,
        }
    }
}

/// Parse JSON text into the neutral pre-validation config.
pub fn parse(text: &str) -> Result<RawConfig, serde_json::Error> {
    let json: JsonConfig = serde_json::from_str(text)?;
    Ok(RawConfig {
        duration: json.duration,
        errors: json.errors,
        setup_queries: json.setup.queries,
        setup_query_files: json.setup.query_files,
        teardown_queries: json.teardown.queries,
        teardown_query_files: json.teardown.query_files,
        jobs: json
            .jobs
            .into_iter()
            .map(|(name, options)| (name, options.into()))
            .collect(),
    })
}

fn job_to_options(job: &Job) -> JobOptions {
    JobOptions {
        start: (!job.start.is_zero()).then(|| format_duration_str(job.start)),
        stop: (!job.stop.is_zero()).then(|| format_duration_str(job.stop)),
        queries: job.queries.clone(),
        query_files: Vec::new(),
        query_args_file: job
            .query_args
            .as_ref()
            .map(|args| args.path.display().to_string()),
        query_args_delim: job.query_args.as_ref().and_then(|args| {
            args.delimiter
                .map(|delimiter| (delimiter as char).to_string())
        }),
        query_results_file: job
            .query_results
            .as_ref()
            .map(|path| path.display().to_string()),
        rate: (job.rate > 0.0).then_some(job.rate),
        batch_size: (job.batch_size > 0).then_some(job.batch_size),
        queue_depth: (job.queue_depth > 0).then_some(job.queue_depth),
        concurrency: None,
        count: (job.count > 0).then_some(job.count),
        multi_query_mode: job.multi_query_allowed,
        query_log_file: job.query_log.as_ref().map(|path| path.display().to_string()),
    }
}

/// Serialize a validated config back to the JSON surface. Query files have
/// already been folded into inline queries, so the output is self-contained
/// apart from args, results, and log file paths (which are absolute after
/// validation).
pub fn to_json_string(config: &Config) -> Result<String, serde_json::Error> {
    let mut accepted: Vec<String> = config.accepted_errors.iter().cloned().collect();
    accepted.sort();

    let json = JsonConfig {
        duration: (!config.duration.is_zero()).then(|| format_duration_str(config.duration)),
        errors: accepted,
        setup: SectionOptions {
            queries: config.setup.clone(),
            query_files: Vec::new(),
        },
        teardown: SectionOptions {
            queries: config.teardown.clone(),
            query_files: Vec::new(),
        },
        jobs: config
            .jobs
            .iter()
            .map(|(name, job)| (name.clone(), job_to_options(job)))
            .collect(),
    };
    serde_json::to_string_pretty(&json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_surface() {
        let text = r#"{
            "duration": "10s",
            "error": ["duplicate key"],
            "setup": {"queries": ["CREATE TABLE t (x INT)"]},
            "teardown": {"queries": ["DROP TABLE t"]},
            "jobs": {
                "reads": {
                    "queries": ["SELECT x FROM t"],
                    "queueDepth": 4,
                    "count": 100
                },
                "writes": {
                    "queries": ["INSERT INTO t VALUES (1)"],
                    "rate": 50.0,
                    "batchSize": 2,
                    "start": "1s",
                    "stop": "9s"
                }
            }
        }"#;

        let raw = parse(text).unwrap();
        assert_eq!(raw.duration.as_deref(), Some("10s"));
        assert_eq!(raw.errors, vec!["duplicate key"]);
        assert_eq!(raw.setup_queries.len(), 1);
        assert_eq!(raw.jobs.len(), 2);

        let reads = &raw.jobs.iter().find(|(n, _)| n == "reads").unwrap().1;
        assert_eq!(reads.queue_depth, Some(4));
        let writes = &raw.jobs.iter().find(|(n, _)| n == "writes").unwrap().1;
        assert_eq!(writes.rate, Some(50.0));
        assert_eq!(writes.start.as_deref(), Some("1s"));
    }

    #[test]
    fn test_concurrency_alias_accepted() {
        let raw = parse(r#"{"jobs": {"a": {"queries": ["SELECT 1"], "concurrency": 3}}}"#).unwrap();
        assert_eq!(raw.jobs[0].1.concurrency, Some(3));
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let raw = parse(r#"{"jobs": {"a": {"queries": ["SELECT 1"], "futureKnob": 1}}}"#).unwrap();
        assert_eq!(raw.jobs.len(), 1);
    }
}
