//! In-memory test database.
//!
//! [`TestDatabase`] wraps a private in-memory [`SqliteBackend`] and implements
//! [`DbExecutor`] by delegation, counting every statement and keeping a log of
//! the SQL it ran. Transaction control statements (`BEGIN`, `SAVEPOINT`, ...)
//! count like any other statement.
//!
//! ## Example
//!
//! ```rust,no_run
//! use terrapin_test::{fixtures, TestDatabase};
//!
//! async fn example() {
//!     let registry = fixtures::registry().unwrap();
//!     let db = TestDatabase::with_registry(&registry).await.unwrap();
//!     let tournaments = registry.query("Tournament").unwrap().all(&db).await.unwrap();
//!     assert!(tournaments.is_empty());
//! }
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use terrapin_core::OrmResult;
use terrapin_db::executor::{Capabilities, DbExecutor, QueryResult, StatementCache};
use terrapin_db::registry::Registry;
use terrapin_db::schema::generate_schema;
use terrapin_db::value::Value;
use terrapin_db_backends::SqliteBackend;

/// An in-memory SQLite database for tests.
///
/// Clones share the connection, the counter and the statement log.
#[derive(Clone)]
pub struct TestDatabase {
    backend: Arc<SqliteBackend>,
    query_count: Arc<AtomicUsize>,
    statements: Arc<Mutex<Vec<String>>>,
}

impl std::fmt::Debug for TestDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestDatabase")
            .field("query_count", &self.query_count())
            .finish_non_exhaustive()
    }
}

impl TestDatabase {
    /// Creates a fresh in-memory database.
    ///
    /// # Panics
    ///
    /// Panics if SQLite cannot open an in-memory database.
    pub fn new() -> Self {
        let backend = SqliteBackend::memory().expect("Failed to create in-memory SQLite database");
        Self {
            backend: Arc::new(backend),
            query_count: Arc::new(AtomicUsize::new(0)),
            statements: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Creates a database with the schema of `registry` already applied.
    /// The counter and log start empty.
    pub async fn with_registry(registry: &Registry) -> OrmResult<Self> {
        let db = Self::new();
        generate_schema(&db, registry, false).await?;
        db.reset_query_count();
        Ok(db)
    }

    /// Runs a statement without parameters.
    pub async fn execute_raw(&self, sql: &str) -> OrmResult<u64> {
        Ok(self.execute_query(sql, &[]).await?.row_count)
    }

    pub fn query_count(&self) -> usize {
        self.query_count.load(Ordering::Relaxed)
    }

    /// Resets the counter and clears the statement log.
    pub fn reset_query_count(&self) {
        self.query_count.store(0, Ordering::Relaxed);
        self.statements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// The statements run since the last reset, oldest first.
    pub fn statements(&self) -> Vec<String> {
        self.statements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn backend(&self) -> &SqliteBackend {
        &self.backend
    }

    fn record(&self, sql: &str) {
        self.query_count.fetch_add(1, Ordering::Relaxed);
        self.statements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sql.to_string());
    }
}

impl Default for TestDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DbExecutor for TestDatabase {
    fn capabilities(&self) -> Capabilities {
        self.backend.capabilities()
    }

    async fn run_query(&self, sql: &str, params: &[Value]) -> OrmResult<QueryResult> {
        self.record(sql);
        self.backend.run_query(sql, params).await
    }

    async fn run_insert(&self, sql: &str, params: &[Value]) -> OrmResult<Value> {
        self.record(sql);
        self.backend.run_insert(sql, params).await
    }

    async fn run_many(&self, sql: &str, params: &[Vec<Value>]) -> OrmResult<u64> {
        self.record(sql);
        self.backend.run_many(sql, params).await
    }

    async fn run_script(&self, script: &str) -> OrmResult<()> {
        self.record(script);
        self.backend.run_script(script).await
    }

    fn statement_cache(&self) -> &StatementCache {
        self.backend.statement_cache()
    }

    fn transaction_lock(&self) -> Arc<tokio::sync::Mutex<()>> {
        self.backend.transaction_lock()
    }
}
