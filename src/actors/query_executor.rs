//! Query Executor Actor - owns the operational database pool.
//!
//! This actor handles:
//! - Executing generated read-only SELECTs with the server-side row cap
//! - Setting per-session variables (encryption key, tenant scopes) on
//!   every acquired connection before first use
//! - Discovering `secure_*` views at startup
//! - Fetching sample rows for prompt enrichment
//!
//! Acquisition blocks up to a bounded deadline and then fails the
//! request; query errors are captured as strings so they can feed the
//! correction loop.

use std::time::Duration;

use mysql_async::prelude::Queryable;
use mysql_async::{OptsBuilder, Pool, PoolConstraints, PoolOpts, Row, Value as SqlValue};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use crate::protocol::TenantScopes;
use crate::settings::DatabaseSettings;
use crate::sql_text;

#[derive(Debug, Clone, Error)]
pub enum ExecError {
    #[error("database query timed out")]
    Timeout,
    #[error("database unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    Query(String),
}

impl From<ExecError> for crate::error::EngineError {
    fn from(err: ExecError) -> Self {
        use crate::error::EngineError;
        match err {
            ExecError::Timeout => EngineError::Timeout {
                component: "database",
            },
            ExecError::Unavailable(msg) => EngineError::Upstream(msg),
            ExecError::Query(msg) => EngineError::Execution(msg),
        }
    }
}

/// Result of executing a query.
#[derive(Debug, Clone, Default)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryOutput {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Rows as JSON objects keyed by column name.
    pub fn rows_as_objects(&self) -> Vec<serde_json::Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect()
            })
            .collect()
    }
}

/// Messages for the Query Executor Actor
pub enum ExecutorMsg {
    /// Execute a read-only SELECT (row cap enforced server-side)
    Execute {
        sql: String,
        scopes: TenantScopes,
        respond_to: oneshot::Sender<Result<QueryOutput, ExecError>>,
    },
    /// Enumerate view names starting with `secure_`
    DiscoverSecureViews {
        respond_to: oneshot::Sender<Result<Vec<String>, ExecError>>,
    },
    /// Fetch up to `limit` sample rows from one table
    SampleRows {
        table: String,
        limit: usize,
        respond_to: oneshot::Sender<Result<QueryOutput, ExecError>>,
    },
}

/// Cloneable handle used by the pipeline and by test doubles.
#[derive(Clone)]
pub struct ExecutorHandle {
    tx: mpsc::Sender<ExecutorMsg>,
}

impl ExecutorHandle {
    pub fn from_channel(tx: mpsc::Sender<ExecutorMsg>) -> Self {
        Self { tx }
    }

    pub fn spawn(settings: DatabaseSettings, max_query_rows: usize) -> Self {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(QueryExecutorActor::new(rx, settings, max_query_rows).run());
        Self { tx }
    }

    pub async fn execute(
        &self,
        sql: String,
        scopes: TenantScopes,
    ) -> Result<QueryOutput, ExecError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ExecutorMsg::Execute {
                sql,
                scopes,
                respond_to: tx,
            })
            .await
            .map_err(|_| ExecError::Unavailable("executor actor stopped".to_string()))?;
        rx.await
            .map_err(|_| ExecError::Unavailable("executor actor dropped the reply".to_string()))?
    }

    pub async fn discover_secure_views(&self) -> Result<Vec<String>, ExecError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ExecutorMsg::DiscoverSecureViews { respond_to: tx })
            .await
            .map_err(|_| ExecError::Unavailable("executor actor stopped".to_string()))?;
        rx.await
            .map_err(|_| ExecError::Unavailable("executor actor dropped the reply".to_string()))?
    }

    pub async fn sample_rows(&self, table: String, limit: usize) -> Result<QueryOutput, ExecError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ExecutorMsg::SampleRows {
                table,
                limit,
                respond_to: tx,
            })
            .await
            .map_err(|_| ExecError::Unavailable("executor actor stopped".to_string()))?;
        rx.await
            .map_err(|_| ExecError::Unavailable("executor actor dropped the reply".to_string()))?
    }
}

/// Query Executor Actor
pub struct QueryExecutorActor {
    rx: mpsc::Receiver<ExecutorMsg>,
    settings: DatabaseSettings,
    max_query_rows: usize,
    pool: Pool,
}

impl QueryExecutorActor {
    pub fn new(
        rx: mpsc::Receiver<ExecutorMsg>,
        settings: DatabaseSettings,
        max_query_rows: usize,
    ) -> Self {
        let constraints =
            PoolConstraints::new(0, settings.pool_max.max(1)).unwrap_or_default();
        let opts = OptsBuilder::default()
            .ip_or_hostname(settings.host.clone())
            .tcp_port(settings.port)
            .user(Some(settings.user.clone()))
            .pass(Some(settings.password.clone()))
            .db_name(Some(settings.database.clone()))
            .pool_opts(PoolOpts::default().with_constraints(constraints));
        let pool = Pool::new(opts);
        Self {
            rx,
            settings,
            max_query_rows,
            pool,
        }
    }

    pub async fn run(mut self) {
        tracing::info!(
            host = %self.settings.host,
            database = %self.settings.database,
            "query executor started"
        );

        while let Some(msg) = self.rx.recv().await {
            match msg {
                ExecutorMsg::Execute {
                    sql,
                    scopes,
                    respond_to,
                } => {
                    let result = self.execute(&sql, &scopes).await;
                    let _ = respond_to.send(result);
                }
                ExecutorMsg::DiscoverSecureViews { respond_to } => {
                    let result = self.discover_secure_views().await;
                    let _ = respond_to.send(result);
                }
                ExecutorMsg::SampleRows {
                    table,
                    limit,
                    respond_to,
                } => {
                    let sql = format!("SELECT * FROM `{}` LIMIT {}", table, limit);
                    let result = self.execute(&sql, &TenantScopes::default()).await;
                    let _ = respond_to.send(result);
                }
            }
        }

        self.pool.clone().disconnect().await.ok();
        tracing::info!("query executor stopped");
    }

    async fn acquire(&self) -> Result<mysql_async::Conn, ExecError> {
        let deadline = Duration::from_secs(self.settings.acquire_timeout_secs);
        let mut conn = timeout(deadline, self.pool.get_conn())
            .await
            .map_err(|_| {
                ExecError::Unavailable("connection pool exhausted (acquire deadline)".to_string())
            })?
            .map_err(|e| ExecError::Unavailable(e.to_string()))?;

        // Session variables must be in place before the first query.
        for (variable, value) in session_variables(&self.settings) {
            conn.exec_drop(format!("SET {} = ?", variable), (value,))
                .await
                .map_err(|e| ExecError::Unavailable(format!("session setup failed: {}", e)))?;
        }
        Ok(conn)
    }

    async fn execute(&self, sql: &str, scopes: &TenantScopes) -> Result<QueryOutput, ExecError> {
        let capped = sql_text::enforce_limit(sql, self.max_query_rows);
        let mut conn = self.acquire().await?;

        if !scopes.is_empty() {
            for (variable, value) in scope_variables(scopes) {
                conn.exec_drop(format!("SET {} = ?", variable), (value,))
                    .await
                    .map_err(|e| ExecError::Unavailable(format!("scope setup failed: {}", e)))?;
            }
        }

        let deadline = Duration::from_secs(self.settings.query_timeout_secs);
        let result = timeout(deadline, run_query(&mut conn, &capped))
            .await
            .map_err(|_| ExecError::Timeout)?;

        match &result {
            Ok(output) => {
                tracing::debug!(rows = output.row_count(), "query executed");
            }
            Err(e) => {
                tracing::debug!(error = %e, "query failed");
            }
        }
        result
    }

    async fn discover_secure_views(&self) -> Result<Vec<String>, ExecError> {
        let mut conn = self.acquire().await?;
        let sql = "SELECT TABLE_NAME FROM information_schema.VIEWS \
                   WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME LIKE 'secure\\_%'";
        let output = run_query(&mut conn, sql).await?;
        Ok(output
            .rows
            .iter()
            .filter_map(|row| row.first().and_then(|v| v.as_str()).map(String::from))
            .collect())
    }
}

async fn run_query(conn: &mut mysql_async::Conn, sql: &str) -> Result<QueryOutput, ExecError> {
    let mut result = conn
        .query_iter(sql)
        .await
        .map_err(|e| ExecError::Query(e.to_string()))?;

    let columns: Vec<String> = result
        .columns()
        .as_deref()
        .map(|cols| cols.iter().map(|c| c.name_str().into_owned()).collect())
        .unwrap_or_default();

    let rows: Vec<Row> = result
        .collect()
        .await
        .map_err(|e| ExecError::Query(e.to_string()))?;

    let rows = rows
        .into_iter()
        .map(|row| {
            (0..row.len())
                .map(|i| row.as_ref(i).map(sql_value_to_json).unwrap_or(Value::Null))
                .collect()
        })
        .collect();

    Ok(QueryOutput { columns, rows })
}

/// Session variables applied to every acquired connection.
fn session_variables(settings: &DatabaseSettings) -> Vec<(&'static str, String)> {
    let mut variables = Vec::new();
    if let Some(key) = &settings.encrypt_key {
        variables.push(("@aesKey", key.clone()));
    }
    variables
}

/// Tenant scope variables, only for scopes the request carries.
fn scope_variables(scopes: &TenantScopes) -> Vec<(&'static str, String)> {
    let mut variables = Vec::new();
    if !scopes.customer_ids.is_empty() {
        variables.push(("@customerIds", scopes.customer_ids.join(",")));
    }
    if !scopes.work_order_ids.is_empty() {
        variables.push(("@workOrderIds", scopes.work_order_ids.join(",")));
    }
    if !scopes.service_location_ids.is_empty() {
        variables.push(("@serviceLocationIds", scopes.service_location_ids.join(",")));
    }
    variables
}

/// Convert a MySQL value to JSON for the structured payload.
fn sql_value_to_json(value: &SqlValue) -> Value {
    match value {
        SqlValue::NULL => Value::Null,
        SqlValue::Bytes(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        SqlValue::Int(i) => Value::Number((*i).into()),
        SqlValue::UInt(u) => Value::Number((*u).into()),
        SqlValue::Float(f) => serde_json::Number::from_f64(*f as f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        SqlValue::Double(d) => serde_json::Number::from_f64(*d)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        SqlValue::Date(year, month, day, hour, minute, second, _micro) => Value::String(format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            year, month, day, hour, minute, second
        )),
        SqlValue::Time(negative, days, hours, minutes, seconds, _micro) => {
            let sign = if *negative { "-" } else { "" };
            Value::String(format!(
                "{}{:02}:{:02}:{:02}",
                sign,
                u32::from(*hours) + u32::from(*days) * 24,
                minutes,
                seconds
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_value_conversion() {
        assert_eq!(sql_value_to_json(&SqlValue::NULL), Value::Null);
        assert_eq!(
            sql_value_to_json(&SqlValue::Bytes(b"Dana".to_vec())),
            Value::String("Dana".to_string())
        );
        assert_eq!(sql_value_to_json(&SqlValue::Int(-3)), serde_json::json!(-3));
        assert_eq!(
            sql_value_to_json(&SqlValue::Date(2026, 10, 6, 8, 30, 0, 0)),
            Value::String("2026-10-06 08:30:00".to_string())
        );
    }

    #[test]
    fn test_scope_variables_only_when_present() {
        assert!(scope_variables(&TenantScopes::default()).is_empty());

        let scopes = TenantScopes {
            customer_ids: vec!["17".to_string(), "42".to_string()],
            ..Default::default()
        };
        let variables = scope_variables(&scopes);
        assert_eq!(variables, vec![("@customerIds", "17,42".to_string())]);
    }

    #[test]
    fn test_session_variables_include_encrypt_key() {
        let mut settings = crate::settings::test_settings().database;
        assert!(session_variables(&settings).is_empty());
        settings.encrypt_key = Some("k".to_string());
        let variables = session_variables(&settings);
        assert_eq!(variables, vec![("@aesKey", "k".to_string())]);
    }

    #[test]
    fn test_rows_as_objects() {
        let output = QueryOutput {
            columns: vec!["id".to_string(), "name".to_string()],
            rows: vec![vec![serde_json::json!(1), serde_json::json!("Crane A")]],
        };
        let objects = output.rows_as_objects();
        assert_eq!(objects[0]["name"], "Crane A");
    }
}
