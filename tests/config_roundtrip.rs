//! Config surface tests: INI and JSON parse to the same model, and a
//! parsed config serializes back to JSON losslessly.

use sqlbench::config::{json, parse_config, ConfigError};
use sqlbench::testing::test_flavor;
use std::path::Path;

fn write(dir: &Path, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn test_ini_to_json_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "queries.sql",
        "SELECT 1;\n-- comment only fragment\n;\nSELECT 2;\n",
    );
    write(dir.path(), "args.csv", "1,alice\n2,bob\n");

    let ini_path = write(
        dir.path(),
        "run.ini",
        r#"
duration=30s
error=duplicate key
error=lock wait timeout

[setup]
query=CREATE TABLE t (x INT)

[teardown]
query=DROP TABLE t

[paced]
rate=50
batch-size=2
stop=20s
query=INSERT INTO t VALUES (1)

[bulk]
multi-query-mode=multi-connection
query-file=queries.sql
queue-depth=4

[bound]
query=SELECT x FROM t WHERE x = ?
query-args-file=args.csv
count=2
"#,
    );

    let config = parse_config(test_flavor(), &ini_path, dir.path()).unwrap();
    assert_eq!(config.duration, std::time::Duration::from_secs(30));
    assert_eq!(config.jobs.len(), 3);
    // The query file was folded into inline queries, empties filtered.
    assert_eq!(
        config.jobs["bulk"].queries,
        vec!["SELECT 1".to_string(), "SELECT 2".to_string()]
    );

    let json_text = json::to_json_string(&config).unwrap();
    let json_path = write(dir.path(), "run.json", &json_text);
    let reparsed = parse_config(test_flavor(), &json_path, dir.path()).unwrap();

    assert_eq!(config.duration, reparsed.duration);
    assert_eq!(config.setup, reparsed.setup);
    assert_eq!(config.teardown, reparsed.teardown);
    assert_eq!(config.accepted_errors, reparsed.accepted_errors);
    assert_eq!(config.jobs, reparsed.jobs);
}

#[test]
fn test_json_surface_parses_like_ini() {
    let dir = tempfile::tempdir().unwrap();
    let ini_path = write(
        dir.path(),
        "run.ini",
        "duration=5s\n\n[a]\nqueue-depth=2\nquery=SELECT 1\n",
    );
    let json_path = write(
        dir.path(),
        "run.json",
        r#"{"duration": "5s", "jobs": {"a": {"queueDepth": 2, "queries": ["SELECT 1"]}}}"#,
    );

    let from_ini = parse_config(test_flavor(), &ini_path, dir.path()).unwrap();
    let from_json = parse_config(test_flavor(), &json_path, dir.path()).unwrap();

    assert_eq!(from_ini.duration, from_json.duration);
    assert_eq!(from_ini.jobs, from_json.jobs);
}

#[test]
fn test_conflicting_modes_rejected_before_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(
        dir.path(),
        "run.ini",
        "[a]\nrate=10\nqueue-depth=2\nquery=SELECT 1\n",
    );

    let err = parse_config(test_flavor(), &path, dir.path()).unwrap_err();
    match err {
        ConfigError::Job { name, message } => {
            assert_eq!(name, "a");
            assert!(message.contains("only specify one of"), "{message}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_missing_args_file_rejected_before_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(
        dir.path(),
        "run.ini",
        "[a]\nquery=SELECT ?\nquery-args-file=missing.csv\n",
    );

    let err = parse_config(test_flavor(), &path, dir.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Job { .. }), "{err}");
}

#[test]
fn test_job_named_after_reserved_section_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    // A [setup] section is a script, never a job, even with job-like keys.
    let path = write(
        dir.path(),
        "run.ini",
        "[setup]\nquery=CREATE TABLE t (x INT)\n\n[work]\nquery=SELECT 1\n",
    );

    let config = parse_config(test_flavor(), &path, dir.path()).unwrap();
    assert_eq!(config.setup.len(), 1);
    assert_eq!(config.jobs.len(), 1);
    assert!(config.jobs.contains_key("work"));
}
