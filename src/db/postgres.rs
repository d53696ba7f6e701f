//! PostgreSQL backend built on `tokio-postgres`.
//!
//! `tokio-postgres` has no built-in pool, so this module keeps a small lazy
//! pool of clients: a semaphore bounds the number checked out at once and
//! clients are created on demand up to that bound. Each client's connection
//! future runs on its own task.

use crate::db::{ConnectionConfig, Database, DbError, QueryOutcome};
use async_trait::async_trait;
use std::sync::Mutex;
use tokio::sync::Semaphore;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, NoTls, Row, SimpleQueryMessage};
use tracing::debug;

pub struct PostgresDatabase {
    conn_string: String,
    idle: Mutex<Vec<Client>>,
    slots: Semaphore,
}

impl PostgresDatabase {
    /// Connect and verify with a `SELECT 1` round trip.
    pub async fn connect(
        config: &ConnectionConfig,
        max_connections: usize,
    ) -> anyhow::Result<Self> {
        let conn_string = connection_string(config);
        debug!("connecting to postgres at {}:{}", config.host, config.port);

        let db = Self {
            conn_string,
            idle: Mutex::new(Vec::new()),
            slots: Semaphore::new(max_connections.max(1)),
        };

        let client = db.new_client().await?;
        client.simple_query("SELECT 1").await?;
        db.idle.lock().unwrap().push(client);

        Ok(db)
    }

    async fn new_client(&self) -> Result<Client, tokio_postgres::Error> {
        let (client, connection) = tokio_postgres::connect(&self.conn_string, NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("postgres connection error: {e}");
            }
        });
        Ok(client)
    }

    /// Check a client out of the pool, creating one if none are idle.
    async fn checkout(&self) -> Result<PooledClient<'_>, DbError> {
        let permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| DbError::new("connection pool closed"))?;
        permit.forget();

        let idle = self.idle.lock().unwrap().pop();
        let client = match idle {
            Some(client) if !client.is_closed() => client,
            _ => self
                .new_client()
                .await
                .map_err(|e| {
                    self.slots.add_permits(1);
                    DbError::new(e.to_string())
                })?,
        };
        Ok(PooledClient {
            pool: self,
            client: Some(client),
        })
    }
}

/// Checked-out client; returns to the pool on drop.
struct PooledClient<'a> {
    pool: &'a PostgresDatabase,
    client: Option<Client>,
}

impl PooledClient<'_> {
    fn client(&self) -> &Client {
        self.client.as_ref().expect("client present until drop")
    }
}

impl Drop for PooledClient<'_> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            if !client.is_closed() {
                self.pool.idle.lock().unwrap().push(client);
            }
        }
        self.pool.slots.add_permits(1);
    }
}

const DEFAULT_PORT: u16 = 5432;

fn connection_string(config: &ConnectionConfig) -> String {
    let mut parts = Vec::new();
    if !config.host.is_empty() {
        parts.push(format!("host={}", config.host));
    }
    parts.push(format!(
        "port={}",
        if config.port == 0 {
            DEFAULT_PORT
        } else {
            config.port
        }
    ));
    if !config.username.is_empty() {
        parts.push(format!("user={}", config.username));
    }
    if !config.password.is_empty() {
        parts.push(format!("password={}", config.password));
    }
    if !config.database.is_empty() {
        parts.push(format!("dbname={}", config.database));
    }
    for param in config.params.split('&') {
        if let Some((key, value)) = param.split_once('=') {
            parts.push(format!("{key}={value}"));
        }
    }
    parts.join(" ")
}

fn cell_to_string(row: &Row, index: usize) -> String {
    let column_type = row.columns()[index].type_();
    match *column_type {
        Type::INT2 => opt_to_string(row.try_get::<_, Option<i16>>(index)),
        Type::INT4 => opt_to_string(row.try_get::<_, Option<i32>>(index)),
        Type::INT8 => opt_to_string(row.try_get::<_, Option<i64>>(index)),
        Type::FLOAT4 => opt_to_string(row.try_get::<_, Option<f32>>(index)),
        Type::FLOAT8 => opt_to_string(row.try_get::<_, Option<f64>>(index)),
        Type::BOOL => opt_to_string(row.try_get::<_, Option<bool>>(index)),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
            opt_to_string(row.try_get::<_, Option<String>>(index))
        }
        Type::TIMESTAMP => opt_to_string(row.try_get::<_, Option<chrono::NaiveDateTime>>(index)),
        Type::TIMESTAMPTZ => {
            opt_to_string(row.try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(index))
        }
        Type::DATE => opt_to_string(row.try_get::<_, Option<chrono::NaiveDate>>(index)),
        _ => format!("<{}>", column_type.name()),
    }
}

fn opt_to_string<T: ToString>(value: Result<Option<T>, tokio_postgres::Error>) -> String {
    match value {
        Ok(Some(v)) => v.to_string(),
        Ok(None) => "NULL".to_string(),
        Err(_) => "<error>".to_string(),
    }
}

#[async_trait]
impl Database for PostgresDatabase {
    async fn run_query(
        &self,
        query: &str,
        args: &[String],
        capture: bool,
    ) -> Result<QueryOutcome, DbError> {
        let pooled = self.checkout().await?;

        if args.is_empty() {
            // simple_query avoids the prepare round trip and hands back
            // every column as text, which is exactly what capture needs.
            let messages = pooled
                .client()
                .simple_query(query)
                .await
                .map_err(|e| DbError::new(e.to_string()))?;

            let mut outcome = QueryOutcome::default();
            let mut saw_rows = false;
            for message in messages {
                match message {
                    SimpleQueryMessage::Row(row) => {
                        saw_rows = true;
                        outcome.rows_read += 1;
                        if capture {
                            let fields = (0..row.len())
                                .map(|i| row.get(i).unwrap_or("NULL").to_string())
                                .collect();
                            outcome.rows.push(fields);
                        }
                    }
                    SimpleQueryMessage::CommandComplete(affected) => {
                        if !saw_rows {
                            outcome.rows_read = affected;
                        }
                    }
                    _ => {}
                }
            }
            return Ok(outcome);
        }

        let params: Vec<&(dyn ToSql + Sync)> =
            args.iter().map(|a| a as &(dyn ToSql + Sync)).collect();
        let rows = pooled
            .client()
            .query(query, &params)
            .await
            .map_err(|e| DbError::new(e.to_string()))?;

        let mut outcome = QueryOutcome {
            rows_read: rows.len() as u64,
            rows: Vec::new(),
        };
        if capture {
            for row in &rows {
                let fields = (0..row.columns().len())
                    .map(|i| cell_to_string(row, i))
                    .collect();
                outcome.rows.push(fields);
            }
        }
        Ok(outcome)
    }

    async fn run_script(&self, queries: &[String]) -> Result<(), DbError> {
        let pooled = self.checkout().await?;
        for query in queries {
            pooled
                .client()
                .simple_query(query)
                .await
                .map_err(|e| DbError::new(e.to_string()))?;
        }
        Ok(())
    }

    async fn close(&self) {
        self.idle.lock().unwrap().clear();
        self.slots.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_string() {
        let config = ConnectionConfig {
            username: "postgres".to_string(),
            password: "secret".to_string(),
            host: "localhost".to_string(),
            port: 5432,
            database: "bench".to_string(),
            params: "sslmode=disable".to_string(),
        };
        assert_eq!(
            connection_string(&config),
            "host=localhost port=5432 user=postgres password=secret dbname=bench sslmode=disable"
        );
    }

    #[test]
    fn test_connection_string_sparse() {
        let config = ConnectionConfig {
            host: "db".to_string(),
            ..Default::default()
        };
        assert_eq!(connection_string(&config), "host=db port=5432");
    }
}
