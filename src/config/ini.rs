//! The INI config surface.
//!
//! Sections `[global]`, `[setup]`, and `[teardown]` are reserved; every
//! other section describes one job. Keys before the first section header
//! belong to the global section. Repeatable keys (`query`, `query-file`,
//! `error`) accumulate; all other keys must be unique within their section.

use crate::config::{RawConfig, RawJob};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IniError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("unknown option {key:?} in section {section:?}")]
    UnknownKey { section: String, key: String },

    #[error("duplicate option {key:?} in section {section:?}")]
    DuplicateKey { section: String, key: String },

    #[error("invalid value for {key:?} in section {section:?}: {message}")]
    InvalidValue {
        section: String,
        key: String,
        message: String,
    },
}

struct RawSection {
    name: String,
    entries: Vec<(String, String)>,
}

fn split_sections(text: &str) -> Result<Vec<RawSection>, IniError> {
    let mut sections = vec![RawSection {
        name: "global".to_string(),
        entries: Vec::new(),
    }];

    for (index, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[') {
            let name = name.strip_suffix(']').ok_or_else(|| IniError::Syntax {
                line: index + 1,
                message: "unterminated section header".to_string(),
            })?;
            sections.push(RawSection {
                name: name.trim().to_string(),
                entries: Vec::new(),
            });
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| IniError::Syntax {
            line: index + 1,
            message: format!("expected key=value, got {line:?}"),
        })?;
        sections
            .last_mut()
            .expect("sections always starts with global")
            .entries
            .push((key.trim().to_string(), value.trim().to_string()));
    }

    Ok(sections)
}

/// Tracks unique-key assignment for one section.
struct UniqueSetter<'a> {
    section: &'a str,
}

impl UniqueSetter<'_> {
    fn set<T>(&self, slot: &mut Option<T>, key: &str, value: T) -> Result<(), IniError> {
        if slot.is_some() {
            return Err(IniError::DuplicateKey {
                section: self.section.to_string(),
                key: key.to_string(),
            });
        }
        *slot = Some(value);
        Ok(())
    }

    fn parsed<T: std::str::FromStr>(
        &self,
        slot: &mut Option<T>,
        key: &str,
        value: &str,
    ) -> Result<(), IniError>
    where
        T::Err: std::fmt::Display,
    {
        let parsed = value.parse().map_err(|e: T::Err| IniError::InvalidValue {
            section: self.section.to_string(),
            key: key.to_string(),
            message: e.to_string(),
        })?;
        self.set(slot, key, parsed)
    }
}

fn decode_job(section: &RawSection) -> Result<RawJob, IniError> {
    let mut job = RawJob::default();
    let setter = UniqueSetter {
        section: &section.name,
    };
    let mut multi_query_seen = false;

    for (key, value) in &section.entries {
        match key.as_str() {
            "start" => setter.set(&mut job.start, key, value.clone())?,
            "stop" => setter.set(&mut job.stop, key, value.clone())?,
            "query" => job.queries.push(value.clone()),
            "query-file" => job.query_files.push(value.clone()),
            "query-args-file" => setter.set(&mut job.query_args_file, key, value.clone())?,
            "query-args-delim" => setter.set(&mut job.query_args_delim, key, value.clone())?,
            "query-results-file" => {
                setter.set(&mut job.query_results_file, key, value.clone())?
            }
            "rate" => setter.parsed(&mut job.rate, key, value)?,
            "batch-size" => setter.parsed(&mut job.batch_size, key, value)?,
            "queue-depth" => setter.parsed(&mut job.queue_depth, key, value)?,
            // Alias kept for compatibility with existing runfiles; the
            // neutral model has only queue_depth.
            "concurrency" => setter.parsed(&mut job.concurrency, key, value)?,
            "count" => setter.parsed(&mut job.count, key, value)?,
            "query-log-file" => setter.set(&mut job.query_log_file, key, value.clone())?,
            "multi-query-mode" => {
                if multi_query_seen {
                    return Err(IniError::DuplicateKey {
                        section: section.name.clone(),
                        key: key.to_string(),
                    });
                }
                multi_query_seen = true;
                if value != "multi-connection" {
                    return Err(IniError::InvalidValue {
                        section: section.name.clone(),
                        key: key.to_string(),
                        message: format!("invalid value for multi-query-mode: {value:?}"),
                    });
                }
                job.multi_query = true;
            }
            _ => {
                return Err(IniError::UnknownKey {
                    section: section.name.clone(),
                    key: key.to_string(),
                })
            }
        }
    }

    Ok(job)
}

/// Parse INI text into the neutral pre-validation config.
pub fn parse(text: &str) -> Result<RawConfig, IniError> {
    let mut config = RawConfig::default();
    let mut duration_seen = false;

    for section in split_sections(text)? {
        match section.name.as_str() {
            "global" => {
                for (key, value) in &section.entries {
                    match key.as_str() {
                        "duration" => {
                            if duration_seen {
                                return Err(IniError::DuplicateKey {
                                    section: section.name.clone(),
                                    key: key.clone(),
                                });
                            }
                            duration_seen = true;
                            config.duration = Some(value.clone());
                        }
                        "error" => config.errors.push(value.clone()),
                        _ => {
                            return Err(IniError::UnknownKey {
                                section: section.name.clone(),
                                key: key.clone(),
                            })
                        }
                    }
                }
            }
            "setup" | "teardown" => {
                let (queries, query_files) = if section.name == "setup" {
                    (&mut config.setup_queries, &mut config.setup_query_files)
                } else {
                    (&mut config.teardown_queries, &mut config.teardown_query_files)
                };
                for (key, value) in &section.entries {
                    match key.as_str() {
                        "query" => queries.push(value.clone()),
                        "query-file" => query_files.push(value.clone()),
                        _ => {
                            return Err(IniError::UnknownKey {
                                section: section.name.clone(),
                                key: key.clone(),
                            })
                        }
                    }
                }
            }
            _ => {
                let job = decode_job(&section)?;
                config.jobs.push((section.name.clone(), job));
            }
        }
    }

    Ok(config)
}
