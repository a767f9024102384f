//! SQLite query runner for `sql_database` challenges.
//!
//! Every job gets its own in-memory database: schema, then fixture, then the
//! candidate query inside a transaction that is always rolled back. The
//! async side holds an interrupt guard, so a timeout or a dropped future
//! stops the statement where it is.

use super::SandboxError;
use base64::{engine::general_purpose, Engine as _};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, InterruptHandle};
use serde::Serialize;
use serde_json::{Number, Value};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct SqlJob {
    pub schema_sql: Option<String>,
    pub setup_sql: Option<String>,
    pub query: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SqlFailure {
    /// Schema or fixture statements failed; a catalog problem.
    Setup(String),
    /// The candidate query failed to prepare or run.
    Query(String),
    Timeout,
    Infrastructure(SandboxError),
}

/// Interrupts the running statement when dropped, unless disarmed.
struct InterruptGuard {
    handle: Option<InterruptHandle>,
}

impl InterruptGuard {
    fn disarm(&mut self) {
        self.handle = None;
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.interrupt();
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SqlSandbox;

impl SqlSandbox {
    pub fn new() -> Self {
        Self
    }

    pub async fn execute(&self, job: SqlJob) -> Result<QueryResult, SqlFailure> {
        let timeout = job.timeout;
        let (handle_tx, handle_rx) = oneshot::channel();
        let worker = tokio::task::spawn_blocking(move || run_job(&job, handle_tx));

        let handle = handle_rx.await.map_err(|_| {
            SqlFailure::Infrastructure(SandboxError::Unavailable(
                "sqlite worker exited before opening a database".into(),
            ))
        })?;
        let mut guard = InterruptGuard { handle };

        let result = match tokio::time::timeout(timeout, worker).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(SqlFailure::Infrastructure(SandboxError::Unavailable(
                format!("sqlite worker failed: {join_err}"),
            ))),
            Err(_) => {
                debug!(timeout_ms = timeout.as_millis() as u64, "SQL evaluation timed out, interrupting");
                return Err(SqlFailure::Timeout);
            }
        };
        guard.disarm();
        result
    }
}

fn run_job(
    job: &SqlJob,
    handle_tx: oneshot::Sender<Option<InterruptHandle>>,
) -> Result<QueryResult, SqlFailure> {
    let mut conn = match Connection::open_in_memory() {
        Ok(conn) => conn,
        Err(e) => {
            let _ = handle_tx.send(None);
            return Err(SqlFailure::Infrastructure(SandboxError::Unavailable(format!(
                "failed to open sqlite database: {e}"
            ))));
        }
    };
    let _ = handle_tx.send(Some(conn.get_interrupt_handle()));

    for fixture in [&job.schema_sql, &job.setup_sql].into_iter().flatten() {
        conn.execute_batch(fixture)
            .map_err(|e| SqlFailure::Setup(e.to_string()))?;
    }

    let tx = conn
        .transaction()
        .map_err(|e| SqlFailure::Infrastructure(SandboxError::Unavailable(e.to_string())))?;
    let result = query_rows(&tx, &job.query);
    // Candidate statements never persist, even on success.
    let _ = tx.rollback();
    result
}

fn query_rows(conn: &Connection, query: &str) -> Result<QueryResult, SqlFailure> {
    let mut stmt = conn
        .prepare(query.trim())
        .map_err(|e| SqlFailure::Query(e.to_string()))?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();

    let mut rows = stmt.query([]).map_err(|e| SqlFailure::Query(e.to_string()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(|e| SqlFailure::Query(e.to_string()))? {
        let mut values = Vec::with_capacity(width);
        for idx in 0..width {
            let value = row
                .get_ref(idx)
                .map_err(|e| SqlFailure::Query(e.to_string()))?;
            values.push(to_json(value));
        }
        out.push(values);
    }

    Ok(QueryResult { columns, rows: out })
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(general_purpose::STANDARD.encode(bytes)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SCHEMA: &str = "CREATE TABLE orders (id INTEGER PRIMARY KEY, customer TEXT, total REAL);
        INSERT INTO orders VALUES (1, 'ada', 10.5), (2, 'bob', 3.0), (3, 'ada', 4.5);";

    fn job(query: &str) -> SqlJob {
        SqlJob {
            schema_sql: Some(SCHEMA.into()),
            setup_sql: None,
            query: query.into(),
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_select_returns_columns_and_rows() {
        let result = SqlSandbox::new()
            .execute(job("SELECT customer, SUM(total) AS spent FROM orders GROUP BY customer ORDER BY customer"))
            .await
            .unwrap();
        assert_eq!(result.columns, vec!["customer", "spent"]);
        assert_eq!(result.rows, vec![vec![json!("ada"), json!(15.0)], vec![json!("bob"), json!(3.0)]]);
    }

    #[tokio::test]
    async fn test_fixture_applies_before_query() {
        let mut j = job("SELECT COUNT(*) FROM orders");
        j.setup_sql = Some("INSERT INTO orders VALUES (4, 'cy', 1.0);".into());
        let result = SqlSandbox::new().execute(j).await.unwrap();
        assert_eq!(result.rows, vec![vec![json!(4)]]);
    }

    #[tokio::test]
    async fn test_query_error_reported() {
        let err = SqlSandbox::new()
            .execute(job("SELECT nope FROM orders"))
            .await
            .unwrap_err();
        assert!(matches!(err, SqlFailure::Query(msg) if msg.contains("nope")));
    }

    #[tokio::test]
    async fn test_bad_schema_is_setup_failure() {
        let mut j = job("SELECT 1");
        j.schema_sql = Some("CREATE TABLE (".into());
        let err = SqlSandbox::new().execute(j).await.unwrap_err();
        assert!(matches!(err, SqlFailure::Setup(_)));
    }

    #[tokio::test]
    async fn test_runaway_query_times_out() {
        let mut j = job(
            "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n) SELECT COUNT(*) FROM n",
        );
        j.timeout = Duration::from_millis(200);
        let err = SqlSandbox::new().execute(j).await.unwrap_err();
        assert_eq!(err, SqlFailure::Timeout);
    }

    #[tokio::test]
    async fn test_blob_and_null_values() {
        let result = SqlSandbox::new()
            .execute(job("SELECT NULL, X'0102'"))
            .await
            .unwrap();
        assert_eq!(result.rows[0][0], Value::Null);
        assert_eq!(result.rows[0][1], json!("AQI="));
    }
}
