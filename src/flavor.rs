//! SQL dialect contracts and query validation.
//!
//! A [`DatabaseFlavor`] captures everything the rest of the system needs to
//! know about the target dialect: how statements are separated in query
//! files, how positional parameters are spelled, how driver error messages
//! are normalized for matching against the accepted-error set, and how to
//! open a connection pool.

use crate::db::{ConnectionConfig, Database};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Rejection reasons from [`check_query`].
///
/// `EmptyQuery` is not a failure for callers that split query files on the
/// separator; they filter empty fragments instead of erroring.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CheckError {
    #[error("empty query")]
    EmptyQuery,

    #[error("invalid query: {0}")]
    BadQuery(String),
}

/// Statement prefixes that mutate connection state.
///
/// Jobs share pooled connections, so a query that changed session state
/// would corrupt every peer running on the same connection.
const CONNECTION_ALTERING: &[&str] = &[
    "USE ",
    "BEGIN",
    "COMMIT",
    "ROLLBACK",
    "START TRANSACTION",
    "SET SESSION",
    "SET NAMES",
    "SET @",
];

/// Strip `--` and `#` line comments and `/* */` block comments, collapsing
/// the remainder into a single whitespace-normalized line.
fn normalize_query(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '-' if chars.peek() == Some(&'-') => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
                out.push(' ');
            }
            '#' => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
                out.push(' ');
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = ' ';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
                out.push(' ');
            }
            '\'' | '"' | '`' => {
                // Copy string literals verbatim so comment markers inside
                // them are not stripped.
                out.push(c);
                let quote = c;
                let mut escaped = false;
                for c in chars.by_ref() {
                    out.push(c);
                    if escaped {
                        escaped = false;
                    } else if c == '\\' {
                        escaped = true;
                    } else if c == quote {
                        break;
                    }
                }
            }
            c if c.is_whitespace() => out.push(' '),
            c => out.push(c),
        }
    }
    out.trim().to_string()
}

/// Blank out the contents of quoted literals so separator detection cannot
/// trip on a `;` inside a string.
fn blank_literals(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        out.push(c);
        if c == '\'' || c == '"' || c == '`' {
            let quote = c;
            let mut escaped = false;
            for c in chars.by_ref() {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == quote {
                    out.push(c);
                    break;
                }
            }
        }
    }
    out
}

/// Validate that `text` is a single statement with no effect on connection
/// state.
///
/// Returns [`CheckError::EmptyQuery`] when the text contains only whitespace
/// and comments, and [`CheckError::BadQuery`] when it contains more than one
/// statement or matches the connection-altering deny list.
pub fn check_query(separator: char, text: &str) -> Result<(), CheckError> {
    let normalized = normalize_query(text);
    if normalized.is_empty() {
        return Err(CheckError::EmptyQuery);
    }

    // A trailing separator is harmless; one in the middle means the text
    // holds more than one statement. Literal contents are blanked so a
    // separator inside a string does not count.
    let blanked = blank_literals(&normalized);
    let trimmed = blanked.trim_end_matches(separator).trim_end();
    if trimmed.contains(separator) {
        return Err(CheckError::BadQuery(
            "contains multiple statements".to_string(),
        ));
    }

    let upper = trimmed.to_uppercase();
    for prefix in CONNECTION_ALTERING {
        if upper.starts_with(prefix) || upper == prefix.trim_end() {
            return Err(CheckError::BadQuery(format!(
                "connection-altering statement ({})",
                prefix.trim_end()
            )));
        }
    }

    Ok(())
}

/// The SQL dialect contract.
///
/// Implementations are stateless and shared; [`DatabaseFlavor::connect`]
/// produces the pooled [`Database`] handle the drivers run against.
#[async_trait]
pub trait DatabaseFlavor: Send + Sync {
    /// Driver name as selected by `--driver`.
    fn name(&self) -> &'static str;

    /// Statement separator used when splitting query files.
    fn query_separator(&self) -> char;

    /// Validate a single query for this dialect.
    fn check_query(&self, text: &str) -> Result<(), CheckError> {
        check_query(self.query_separator(), text)
    }

    /// Spelling of the `index`-th positional parameter (1-based).
    fn placeholder(&self, index: usize) -> String;

    /// Reduce a driver error message to the stable server-message portion
    /// used for accepted-error matching.
    fn normalize_error(&self, message: &str) -> String;

    /// Open a connection pool sized for at most `max_connections`
    /// concurrent queries.
    async fn connect(
        &self,
        config: &ConnectionConfig,
        max_connections: usize,
    ) -> anyhow::Result<Arc<dyn Database>>;
}

struct MySqlFlavor;

#[async_trait]
impl DatabaseFlavor for MySqlFlavor {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn query_separator(&self) -> char {
        ';'
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn normalize_error(&self, message: &str) -> String {
        // mysql_async server errors render as
        // "Server error: `ERROR 1062 (23000): Duplicate entry ...`"; keep
        // the message after the code so configs match on server text.
        let msg = message
            .trim_start_matches("Server error: ")
            .trim_matches('`');
        match msg.split_once("): ") {
            Some((prefix, rest)) if prefix.starts_with("ERROR ") => rest.trim().to_string(),
            _ => msg.trim().to_string(),
        }
    }

    async fn connect(
        &self,
        config: &ConnectionConfig,
        max_connections: usize,
    ) -> anyhow::Result<Arc<dyn Database>> {
        let db = crate::db::mysql::MySqlDatabase::connect(config, max_connections).await?;
        Ok(Arc::new(db))
    }
}

struct PostgresFlavor;

#[async_trait]
impl DatabaseFlavor for PostgresFlavor {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn query_separator(&self) -> char {
        ';'
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${index}")
    }

    fn normalize_error(&self, message: &str) -> String {
        // tokio-postgres renders server errors as "db error: ERROR: ...";
        // keep the text after the severity tag.
        match message.rsplit_once("ERROR: ") {
            Some((_, rest)) => rest.trim().to_string(),
            None => message.trim().to_string(),
        }
    }

    async fn connect(
        &self,
        config: &ConnectionConfig,
        max_connections: usize,
    ) -> anyhow::Result<Arc<dyn Database>> {
        let db = crate::db::postgres::PostgresDatabase::connect(config, max_connections).await?;
        Ok(Arc::new(db))
    }
}

/// Look up a flavor by driver name.
pub fn flavor_for(name: &str) -> Option<Arc<dyn DatabaseFlavor>> {
    match name {
        "mysql" => Some(Arc::new(MySqlFlavor)),
        "postgres" | "postgresql" => Some(Arc::new(PostgresFlavor)),
        _ => None,
    }
}

/// Names accepted by [`flavor_for`], for error messages.
pub fn supported_flavors() -> &'static [&'static str] {
    &["mysql", "postgres"]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_query_ok() {
        assert!(check_query(';', "SELECT 1").is_ok());
        assert!(check_query(';', "SELECT 1;").is_ok());
        assert!(check_query(';', "  select *\n from t where x = 1  ").is_ok());
    }

    #[test]
    fn test_check_query_empty() {
        assert_eq!(check_query(';', ""), Err(CheckError::EmptyQuery));
        assert_eq!(check_query(';', "   \n\t "), Err(CheckError::EmptyQuery));
        assert_eq!(
            check_query(';', "-- just a comment\n"),
            Err(CheckError::EmptyQuery)
        );
        assert_eq!(
            check_query(';', "/* block */ -- and line"),
            Err(CheckError::EmptyQuery)
        );
    }

    #[test]
    fn test_check_query_multiple_statements() {
        let err = check_query(';', "SELECT 1; SELECT 2").unwrap_err();
        assert!(matches!(err, CheckError::BadQuery(_)));
        // Separator inside a string literal is fine.
        assert!(check_query(';', "SELECT 'a;b'").is_ok());
    }

    #[test]
    fn test_check_query_connection_altering() {
        for q in [
            "USE otherdb",
            "use otherdb",
            "BEGIN",
            "begin;",
            "START TRANSACTION",
            "SET SESSION sql_mode = ''",
            "commit",
        ] {
            let err = check_query(';', q).unwrap_err();
            assert!(matches!(err, CheckError::BadQuery(_)), "query {q:?}");
        }
        // Not everything starting with SET is session state.
        assert!(check_query(';', "SELECT 1 AS settings").is_ok());
    }

    #[test]
    fn test_placeholders() {
        let mysql = flavor_for("mysql").unwrap();
        let pg = flavor_for("postgres").unwrap();
        assert_eq!(mysql.placeholder(1), "?");
        assert_eq!(mysql.placeholder(3), "?");
        assert_eq!(pg.placeholder(1), "$1");
        assert_eq!(pg.placeholder(3), "$3");
    }

    #[test]
    fn test_normalize_error() {
        let mysql = flavor_for("mysql").unwrap();
        assert_eq!(
            mysql.normalize_error(
                "Server error: `ERROR 1062 (23000): Duplicate entry 'k' for key 'PRIMARY'`"
            ),
            "Duplicate entry 'k' for key 'PRIMARY'"
        );
        let pg = flavor_for("postgres").unwrap();
        assert_eq!(
            pg.normalize_error("db error: ERROR: duplicate key value violates unique constraint"),
            "duplicate key value violates unique constraint"
        );
    }

    #[test]
    fn test_unknown_flavor() {
        assert!(flavor_for("oracle").is_none());
    }
}
