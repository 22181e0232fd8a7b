//! Mock session pool for testing conflict resolution.
//!
//! Records every call (begin/commit/rollback/execute/query_one) in order
//! for assertions, and serves scripted responses: a FIFO of current-row
//! answers for `query_one` and a FIFO of row sets for pool-level `query`
//! (the lock-key discovery path).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use zone_apply::session::{BoxFuture, Session, SessionPool};
use zone_apply::Row;

/// One recorded database call.
#[derive(Debug, Clone, PartialEq)]
pub enum DbCall {
    Begin,
    Commit,
    Rollback,
    Execute(String),
    QueryOne(String),
}

/// Shared state behind the mock pool and its sessions.
#[derive(Default)]
pub struct MockDb {
    select_results: Mutex<VecDeque<Option<Row>>>,
    pool_query_results: Mutex<VecDeque<Vec<Row>>>,
    calls: Mutex<Vec<DbCall>>,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl MockDb {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue the next `query_one` answer (the locked current row).
    pub async fn push_current(&self, row: Option<Row>) {
        self.select_results.lock().await.push_back(row);
    }

    /// Queue the next pool-level `query` answer (e.g. SHOW KEYS rows).
    pub async fn push_pool_rows(&self, rows: Vec<Row>) {
        self.pool_query_results.lock().await.push_back(rows);
    }

    /// All calls, in order.
    pub async fn calls(&self) -> Vec<DbCall> {
        self.calls.lock().await.clone()
    }

    /// Only the executed DML statements, in order.
    pub async fn executed_sql(&self) -> Vec<String> {
        self.calls
            .lock()
            .await
            .iter()
            .filter_map(|c| match c {
                DbCall::Execute(sql) => Some(sql.clone()),
                _ => None,
            })
            .collect()
    }

    /// Count of calls matching `call`.
    pub async fn count(&self, call: &DbCall) -> usize {
        self.calls.lock().await.iter().filter(|c| *c == call).count()
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    async fn record(&self, call: DbCall) {
        self.calls.lock().await.push(call);
    }
}

/// Mock implementation of [`SessionPool`].
pub struct MockPool {
    db: Arc<MockDb>,
}

impl MockPool {
    pub fn new(db: Arc<MockDb>) -> Self {
        Self { db }
    }
}

impl SessionPool for MockPool {
    fn connect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn acquire(&self) -> BoxFuture<'_, Box<dyn Session>> {
        Box::pin(async move {
            self.db.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockSession {
                db: Arc::clone(&self.db),
            }) as Box<dyn Session>)
        })
    }

    fn release(&self, session: Box<dyn Session>) {
        self.db.released.fetch_add(1, Ordering::SeqCst);
        drop(session);
    }

    fn query(&self, _sql: &str) -> BoxFuture<'_, Vec<Row>> {
        Box::pin(async move {
            Ok(self
                .db
                .pool_query_results
                .lock()
                .await
                .pop_front()
                .unwrap_or_default())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

struct MockSession {
    db: Arc<MockDb>,
}

impl Session for MockSession {
    fn begin(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.db.record(DbCall::Begin).await;
            Ok(())
        })
    }

    fn commit(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.db.record(DbCall::Commit).await;
            Ok(())
        })
    }

    fn rollback(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.db.record(DbCall::Rollback).await;
            Ok(())
        })
    }

    fn execute(&mut self, sql: &str) -> BoxFuture<'_, u64> {
        let sql = sql.to_string();
        Box::pin(async move {
            self.db.record(DbCall::Execute(sql)).await;
            Ok(1)
        })
    }

    fn query_one(&mut self, sql: &str) -> BoxFuture<'_, Option<Row>> {
        let sql = sql.to_string();
        Box::pin(async move {
            self.db.record(DbCall::QueryOne(sql)).await;
            Ok(self
                .db
                .select_results
                .lock()
                .await
                .pop_front()
                .unwrap_or(None))
        })
    }
}
