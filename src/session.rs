// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Database session contract and the MySQL implementation.
//!
//! The engine consumes databases through two narrow traits:
//!
//! - [`SessionPool`] — bounded pooling: `connect`, `acquire`, `release`,
//!   pool-level `query`, `close`.
//! - [`Session`] — one unit of work: `begin`, `commit`, `rollback`,
//!   `execute`, `query_one`.
//!
//! The concrete implementation is selected from the node DSN's platform at
//! construction time ([`connect_node`]); there is no runtime driver
//! discovery. Traits allow testing the conflict-resolution logic against a
//! recording mock without a live database.
//!
//! # Session discipline
//!
//! Every unit of work is `begin → (SELECT ... FOR UPDATE) → at most one DML
//! → commit`, or an explicit `rollback`. The engine always rolls back and
//! releases in a guaranteed-cleanup path regardless of outcome, so an
//! uncommitted transaction never travels back to the pool.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::pool::PoolConnection;
use sqlx::{Column, MySql, Row as _};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::dsn::{Dsn, Platform};
use crate::error::{ApplyError, Result};
use crate::event::Row;
use crate::meta::DbNode;

/// Boxed async future for trait seams (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// One pooled database session.
pub trait Session: Send {
    /// Open a transaction.
    fn begin(&mut self) -> BoxFuture<'_, ()>;

    /// Commit the open transaction.
    fn commit(&mut self) -> BoxFuture<'_, ()>;

    /// Roll back the open transaction. A no-op when none is open.
    fn rollback(&mut self) -> BoxFuture<'_, ()>;

    /// Execute a statement, returning the affected row count.
    fn execute(&mut self, sql: &str) -> BoxFuture<'_, u64>;

    /// Fetch at most one row as a column-to-value map.
    fn query_one(&mut self, sql: &str) -> BoxFuture<'_, Option<Row>>;
}

impl std::fmt::Debug for dyn Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Session")
    }
}

/// A bounded pool of database sessions.
pub trait SessionPool: Send + Sync + 'static {
    /// Establish the pool. Must be called before `acquire`.
    fn connect(&self) -> BoxFuture<'_, ()>;

    /// Take a session from the pool.
    fn acquire(&self) -> BoxFuture<'_, Box<dyn Session>>;

    /// Return a session to the pool.
    ///
    /// Callers must roll back any open transaction first.
    fn release(&self, session: Box<dyn Session>);

    /// Run a query on a pool-managed session and collect all rows.
    fn query(&self, sql: &str) -> BoxFuture<'_, Vec<Row>>;

    /// Close the pool.
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Build the session pool matching a node's DSN platform.
pub fn connect_node(node: &DbNode) -> Result<Arc<dyn SessionPool>> {
    let dsn = Dsn::parse(&node.dsn)?;
    match dsn.platform {
        Platform::MySql | Platform::MariaDb => Ok(Arc::new(MySqlSessionPool::new(node, &dsn))),
        other => Err(ApplyError::Config(format!(
            "platform [{other}] has no session pool implementation"
        ))),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MySQL implementation
// ─────────────────────────────────────────────────────────────────────────────

/// sqlx-backed MySQL session pool.
pub struct MySqlSessionPool {
    node_name: String,
    options: MySqlConnectOptions,
    min_connections: u32,
    max_connections: u32,
    idle_timeout: Duration,
    acquire_timeout: Duration,
    pool: RwLock<Option<MySqlPool>>,
}

impl MySqlSessionPool {
    /// Configure a pool from node metadata. Connections are opened by
    /// [`SessionPool::connect`], not here.
    pub fn new(node: &DbNode, dsn: &Dsn) -> Self {
        let mut options = MySqlConnectOptions::new();
        if let Some(host) = &dsn.host {
            options = options.host(host);
        }
        if let Some(port) = dsn.port {
            options = options.port(port);
        }
        if let Some(username) = &dsn.username {
            options = options.username(username);
        }
        if let Some(password) = &dsn.password {
            options = options.password(password);
        }
        if let Some(database) = &dsn.database {
            options = options.database(database);
        }

        Self {
            node_name: node.name.clone(),
            options,
            min_connections: node.minimum_pool_size.max(1),
            max_connections: node.maximum_pool_size,
            idle_timeout: Duration::from_secs(node.wait_time),
            acquire_timeout: Duration::from_secs(node.acquire_timeout),
            pool: RwLock::new(None),
        }
    }

    async fn pool(&self) -> Result<MySqlPool> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or_else(|| ApplyError::db_msg("acquire", "pool is not connected"))
    }
}

impl SessionPool for MySqlSessionPool {
    fn connect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.pool.read().await.is_some() {
                return Ok(());
            }
            let pool = MySqlPoolOptions::new()
                .min_connections(self.min_connections)
                .max_connections(self.max_connections)
                .idle_timeout(self.idle_timeout)
                .acquire_timeout(self.acquire_timeout)
                .connect_with(self.options.clone())
                .await
                .map_err(|e| ApplyError::db("connect", e))?;
            info!(
                node = %self.node_name,
                min = self.min_connections,
                max = self.max_connections,
                "database pool connected"
            );
            *self.pool.write().await = Some(pool);
            Ok(())
        })
    }

    fn acquire(&self) -> BoxFuture<'_, Box<dyn Session>> {
        Box::pin(async move {
            let conn = self
                .pool()
                .await?
                .acquire()
                .await
                .map_err(|e| ApplyError::db("acquire", e))?;
            Ok(Box::new(MySqlSession { conn }) as Box<dyn Session>)
        })
    }

    fn release(&self, session: Box<dyn Session>) {
        // Dropping a pooled connection returns it to the pool.
        drop(session);
    }

    fn query(&self, sql: &str) -> BoxFuture<'_, Vec<Row>> {
        let sql = sql.to_string();
        Box::pin(async move {
            let rows = sqlx::query(&sql)
                .fetch_all(&self.pool().await?)
                .await
                .map_err(|e| ApplyError::db("query", e))?;
            Ok(rows.iter().map(row_to_values).collect())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Some(pool) = self.pool.write().await.take() {
                pool.close().await;
                debug!(node = %self.node_name, "database pool closed");
            }
            Ok(())
        })
    }
}

struct MySqlSession {
    conn: PoolConnection<MySql>,
}

impl MySqlSession {
    async fn run(&mut self, sql: &str, operation: &'static str) -> Result<u64> {
        let done = sqlx::query(sql)
            .execute(self.conn.as_mut())
            .await
            .map_err(|e| ApplyError::db(operation, e))?;
        Ok(done.rows_affected())
    }
}

impl Session for MySqlSession {
    fn begin(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.run("BEGIN", "begin").await?;
            Ok(())
        })
    }

    fn commit(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.run("COMMIT", "commit").await?;
            Ok(())
        })
    }

    fn rollback(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.run("ROLLBACK", "rollback").await?;
            Ok(())
        })
    }

    fn execute(&mut self, sql: &str) -> BoxFuture<'_, u64> {
        let sql = sql.to_string();
        Box::pin(async move { self.run(&sql, "execute").await })
    }

    fn query_one(&mut self, sql: &str) -> BoxFuture<'_, Option<Row>> {
        let sql = sql.to_string();
        Box::pin(async move {
            let row = sqlx::query(&sql)
                .fetch_optional(self.conn.as_mut())
                .await
                .map_err(|e| ApplyError::db("query_one", e))?;
            Ok(row.as_ref().map(row_to_values))
        })
    }
}

/// Convert a MySQL row into a column-to-value map.
///
/// Decoding is by attempt, widest numeric first, so `BIGINT UNSIGNED`
/// markers survive intact; `NULL` resolves on the first attempt.
pub fn row_to_values(row: &MySqlRow) -> Row {
    let mut values = Row::new();
    for (index, column) in row.columns().iter().enumerate() {
        values.insert(column.name().to_string(), column_value(row, index));
    }
    values
}

fn column_value(row: &MySqlRow, index: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<u64>, _>(index) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(index) {
        return v
            .map(|t| Value::from(t.format("%Y-%m-%d %H:%M:%S").to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(index) {
        return v
            .map(|d| Value::from(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return v
            .map(|bytes| Value::from(String::from_utf8_lossy(&bytes).into_owned()))
            .unwrap_or(Value::Null);
    }
    Value::Null
}
