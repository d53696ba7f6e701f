//! Run configuration: the neutral model both config syntaxes produce.
//!
//! The INI and JSON parsers each build a [`RawConfig`]; every invariant is
//! then enforced in one place, [`RawConfig::validate`], so the two surfaces
//! cannot drift apart. Relative file paths are resolved against the base
//! directory captured at parse time, never via the process working
//! directory.

pub mod ini;
pub mod json;

use crate::flavor::{CheckError, DatabaseFlavor};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing INI config: {0}")]
    Ini(#[from] ini::IniError),

    #[error("parsing JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("error parsing global section: {0}")]
    Global(String),

    #[error("error parsing {section} section: {message}")]
    Section {
        section: &'static str,
        message: String,
    },

    #[error("error parsing job {name:?}: {message}")]
    Job { name: String, message: String },

    #[error("job {name:?} starts after test finishes")]
    StartsAfterEnd { name: String },

    #[error("job {name:?} stops after test finishes")]
    StopsAfterEnd { name: String },
}

/// Section and job names that can never name a job.
pub const RESERVED_SECTIONS: &[&str] = &["setup", "teardown", "global"];

/// How a job paces its queries. Exactly one mode per validated job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobMode {
    /// Batches fired at a target rate.
    Rate,
    /// A fixed number of in-flight queries, closed-loop.
    QueueDepth,
    /// Replay of a recorded query log at its original spacing.
    Replay,
}

/// Query-args CSV input for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgSpec {
    pub path: PathBuf,
    pub delimiter: Option<u8>,
}

/// A validated workload unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub name: String,
    /// Offset from T0 before the first query may be issued.
    pub start: Duration,
    /// Offset from T0 after which no query is issued; zero means unbounded.
    pub stop: Duration,
    pub queries: Vec<String>,
    pub query_log: Option<PathBuf>,
    pub query_args: Option<ArgSpec>,
    pub query_results: Option<PathBuf>,
    /// Batches per second; zero unless the job is rate-paced.
    pub rate: f64,
    /// Queries per batch; zero unless the job is rate-paced.
    pub batch_size: u64,
    /// Simultaneous executions; zero unless the job is closed-loop.
    pub queue_depth: u64,
    /// Total executions before the job stops; zero means unbounded.
    pub count: u64,
    pub multi_query_allowed: bool,
}

impl Job {
    pub fn mode(&self) -> JobMode {
        if self.rate > 0.0 {
            JobMode::Rate
        } else if self.query_log.is_some() {
            JobMode::Replay
        } else {
            JobMode::QueueDepth
        }
    }
}

/// The validated run description.
pub struct Config {
    pub flavor: Arc<dyn DatabaseFlavor>,
    /// Test duration; zero means unbounded.
    pub duration: Duration,
    pub setup: Vec<String>,
    pub teardown: Vec<String>,
    pub jobs: BTreeMap<String, Job>,
    pub accepted_errors: HashSet<String>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("flavor", &self.flavor.name())
            .field("duration", &self.duration)
            .field("setup", &self.setup)
            .field("teardown", &self.teardown)
            .field("jobs", &self.jobs)
            .field("accepted_errors", &self.accepted_errors)
            .finish()
    }
}

impl Config {
    /// Upper bound on simultaneously outstanding queries, used to size the
    /// connection pool before drivers start. Queue-depth jobs hold exactly
    /// their depth; rate-paced jobs get headroom for one overlapping batch;
    /// replay jobs hold one.
    pub fn max_connections(&self) -> usize {
        let mut total = 1usize; // setup/teardown connection
        for job in self.jobs.values() {
            total += match job.mode() {
                JobMode::QueueDepth => job.queue_depth as usize,
                JobMode::Rate => (job.batch_size as usize).saturating_mul(2),
                JobMode::Replay => 1,
            };
        }
        total
    }
}

/// Pre-validation job fields, as either parser produced them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawJob {
    pub start: Option<String>,
    pub stop: Option<String>,
    pub queries: Vec<String>,
    pub query_files: Vec<String>,
    pub query_args_file: Option<String>,
    pub query_args_delim: Option<String>,
    pub query_results_file: Option<String>,
    pub rate: Option<f64>,
    pub batch_size: Option<u64>,
    pub queue_depth: Option<u64>,
    pub concurrency: Option<u64>,
    pub count: Option<u64>,
    pub multi_query: bool,
    pub query_log_file: Option<String>,
}

/// Pre-validation config, as either parser produced it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawConfig {
    pub duration: Option<String>,
    pub errors: Vec<String>,
    pub setup_queries: Vec<String>,
    pub setup_query_files: Vec<String>,
    pub teardown_queries: Vec<String>,
    pub teardown_query_files: Vec<String>,
    pub jobs: Vec<(String, RawJob)>,
}

impl RawConfig {
    /// Enforce every invariant and produce the immutable [`Config`].
    pub fn validate(
        self,
        flavor: Arc<dyn DatabaseFlavor>,
        base_dir: &Path,
    ) -> Result<Config, ConfigError> {
        let duration = match &self.duration {
            Some(text) => parse_duration_str(text).map_err(ConfigError::Global)?,
            None => Duration::ZERO,
        };

        let setup = collect_section_queries(
            flavor.as_ref(),
            base_dir,
            &self.setup_queries,
            &self.setup_query_files,
        )
        .map_err(|message| ConfigError::Section {
            section: "setup",
            message,
        })?;
        let teardown = collect_section_queries(
            flavor.as_ref(),
            base_dir,
            &self.teardown_queries,
            &self.teardown_query_files,
        )
        .map_err(|message| ConfigError::Section {
            section: "teardown",
            message,
        })?;

        let mut jobs = BTreeMap::new();
        for (name, raw) in self.jobs {
            if RESERVED_SECTIONS.contains(&name.as_str()) {
                continue;
            }
            let job = raw
                .into_job(&name, flavor.as_ref(), base_dir)
                .map_err(|message| ConfigError::Job {
                    name: name.clone(),
                    message,
                })?;
            jobs.insert(name, job);
        }

        for (name, job) in &jobs {
            if duration > Duration::ZERO && job.start > duration {
                return Err(ConfigError::StartsAfterEnd { name: name.clone() });
            }
            if job.stop > Duration::ZERO && duration > Duration::ZERO && job.stop > duration {
                return Err(ConfigError::StopsAfterEnd { name: name.clone() });
            }
        }

        Ok(Config {
            flavor,
            duration,
            setup,
            teardown,
            jobs,
            accepted_errors: self.errors.into_iter().collect(),
        })
    }
}

impl RawJob {
    fn into_job(
        self,
        name: &str,
        flavor: &dyn DatabaseFlavor,
        base_dir: &Path,
    ) -> Result<Job, String> {
        let start = match &self.start {
            Some(text) => parse_duration_str(text)?,
            None => Duration::ZERO,
        };
        let stop = match &self.stop {
            Some(text) => parse_duration_str(text)?,
            None => Duration::ZERO,
        };

        let mut queries = Vec::new();
        for query in &self.queries {
            flavor.check_query(query).map_err(|e| e.to_string())?;
            queries.push(query.clone());
        }
        for file in &self.query_files {
            let path = resolve_path(base_dir, file);
            queries.extend(read_queries_from_file(flavor, &path)?);
        }

        let rate = self.rate.unwrap_or(0.0);
        if rate < 0.0 {
            return Err("invalid negative value for rate".to_string());
        }
        let mut batch_size = self.batch_size.unwrap_or(0);
        // Both surfaces accept concurrency as an alias; the model keeps
        // only queue_depth.
        let mut queue_depth = self.concurrency.or(self.queue_depth).unwrap_or(0);

        let query_log = self
            .query_log_file
            .as_ref()
            .map(|file| resolve_path(base_dir, file));
        let query_args_path = self
            .query_args_file
            .as_ref()
            .map(|file| resolve_path(base_dir, file));
        let delimiter = match &self.query_args_delim {
            Some(text) => Some(parse_delimiter(text)?),
            None => None,
        };

        if queries.is_empty() && query_log.is_none() {
            return Err("no query provided".to_string());
        }
        if !queries.is_empty() && query_log.is_some() {
            return Err("cannot have both queries and a query log".to_string());
        }
        if queries.len() > 1 && !self.multi_query {
            return Err("must have only one query".to_string());
        }
        if rate == 0.0 && batch_size > 0 {
            return Err("can only specify batch-size with rate".to_string());
        }
        if delimiter.is_some() && query_args_path.is_none() {
            return Err("cannot set query-args-delim with no query-args-file".to_string());
        }
        if query_args_path.is_some() && query_log.is_some() {
            return Err("cannot use query-args-file with query-log-file".to_string());
        }

        let mut mode_count = 0;
        if queue_depth > 0 {
            mode_count += 1;
        }
        if query_log.is_some() {
            mode_count += 1;
        }
        if rate > 0.0 {
            mode_count += 1;
        }
        if mode_count == 0 {
            // The default job type is a single closed-loop worker.
            queue_depth = 1;
        } else if mode_count > 1 {
            return Err(
                "can only specify one of rate, queue-depth, or query-log-file".to_string(),
            );
        }
        if rate > 0.0 && batch_size == 0 {
            batch_size = 1;
        }

        if stop > Duration::ZERO && start > stop {
            return Err("job starts after it stops".to_string());
        }

        // Fail before the run starts if an input file is missing.
        for path in [&query_log, &query_args_path] {
            if let Some(path) = path {
                std::fs::metadata(path)
                    .map_err(|e| format!("cannot open {}: {e}", path.display()))?;
            }
        }

        Ok(Job {
            name: name.to_string(),
            start,
            stop,
            queries,
            query_log,
            query_args: query_args_path.map(|path| ArgSpec { path, delimiter }),
            query_results: self
                .query_results_file
                .as_ref()
                .map(|file| resolve_path(base_dir, file)),
            rate,
            batch_size,
            queue_depth,
            count: self.count.unwrap_or(0),
            multi_query_allowed: self.multi_query,
        })
    }
}

fn collect_section_queries(
    flavor: &dyn DatabaseFlavor,
    base_dir: &Path,
    queries: &[String],
    query_files: &[String],
) -> Result<Vec<String>, String> {
    let mut out = Vec::new();
    for query in queries {
        flavor.check_query(query).map_err(|e| e.to_string())?;
        out.push(query.clone());
    }
    for file in query_files {
        let path = resolve_path(base_dir, file);
        out.extend(read_queries_from_file(flavor, &path)?);
    }
    Ok(out)
}

/// Split a query file on the flavor separator, validating each statement.
/// Empty fragments (whitespace and comments) are filtered, not errors.
fn read_queries_from_file(
    flavor: &dyn DatabaseFlavor,
    path: &Path,
) -> Result<Vec<String>, String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    let mut queries = Vec::new();
    for fragment in contents.split(flavor.query_separator()) {
        match flavor.check_query(fragment) {
            Ok(()) => queries.push(fragment.trim().to_string()),
            Err(CheckError::EmptyQuery) => {}
            Err(e) => return Err(format!("invalid query in {}: {e}", path.display())),
        }
    }
    Ok(queries)
}

fn resolve_path(base_dir: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

/// Parse a Go-style duration literal: decimal numbers with `ns`, `us`/`µs`,
/// `ms`, `s`, `m`, or `h` units, optionally compound (`1m30s`). `0` is
/// accepted without a unit.
pub fn parse_duration_str(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("empty duration".to_string());
    }
    if text == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = 0.0f64;
    let mut rest = text;
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| format!("missing unit in duration {text:?}"))?;
        if digits_end == 0 {
            return Err(format!("invalid duration {text:?}"));
        }
        let value: f64 = rest[..digits_end]
            .parse()
            .map_err(|_| format!("invalid duration {text:?}"))?;
        rest = &rest[digits_end..];

        let (unit_secs, unit_len) = if rest.starts_with("ns") {
            (1e-9, 2)
        } else if rest.starts_with("us") {
            (1e-6, 2)
        } else if rest.starts_with("µs") {
            (1e-6, "µs".len())
        } else if rest.starts_with("ms") {
            (1e-3, 2)
        } else if rest.starts_with('s') {
            (1.0, 1)
        } else if rest.starts_with('m') {
            (60.0, 1)
        } else if rest.starts_with('h') {
            (3600.0, 1)
        } else {
            return Err(format!("unknown unit in duration {text:?}"));
        };
        total += value * unit_secs;
        rest = &rest[unit_len..];
    }

    Ok(Duration::from_secs_f64(total))
}

/// Format a duration so [`parse_duration_str`] reads it back exactly.
pub fn format_duration_str(duration: Duration) -> String {
    if duration.is_zero() {
        return "0s".to_string();
    }
    let mut out = String::new();
    let total_micros = duration.as_micros();
    let hours = total_micros / 3_600_000_000;
    let minutes = (total_micros / 60_000_000) % 60;
    let micros = total_micros % 60_000_000;
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if minutes > 0 {
        out.push_str(&format!("{minutes}m"));
    }
    if micros > 0 {
        let secs = micros as f64 / 1e6;
        if secs.fract() == 0.0 {
            out.push_str(&format!("{}s", secs as u64));
        } else {
            out.push_str(&format!("{secs}s"));
        }
    }
    out
}

/// Parse a query-args delimiter: a single character, optionally quoted with
/// backslash escapes (`"\t"`).
fn parse_delimiter(text: &str) -> Result<u8, String> {
    let unquoted = if (text.starts_with('"') && text.ends_with('"') && text.len() >= 2)
        || (text.starts_with('\'') && text.ends_with('\'') && text.len() >= 2)
    {
        unescape(&text[1..text.len() - 1])?
    } else {
        text.to_string()
    };
    let mut chars = unquoted.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii() => Ok(c as u8),
        _ => Err("must provide exactly one character for delimiter".to_string()),
    }
}

fn unescape(text: &str) -> Result<String, String> {
    let mut out = String::new();
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            other => return Err(format!("invalid escape sequence \\{other:?}")),
        }
    }
    Ok(out)
}

/// Parse the run file at `config_file`, selecting the syntax by extension:
/// `.json` is the JSON surface, everything else is INI.
pub fn parse_config(
    flavor: Arc<dyn DatabaseFlavor>,
    config_file: &Path,
    base_dir: &Path,
) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(config_file).map_err(|e| ConfigError::Io {
        path: config_file.display().to_string(),
        source: e,
    })?;

    let is_json = config_file
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let raw = if is_json {
        json::parse(&contents)?
    } else {
        ini::parse(&contents)?
    };
    raw.validate(flavor, base_dir)
}
