//! Transaction scopes with savepoint nesting.
//!
//! A [`TransactionManager`] wraps a [`DbExecutor`] and tracks how deep the
//! current scope is nested. The outermost scope issues `BEGIN` and holds the
//! executor's transaction lock until it commits or rolls back. Statements
//! run through the manager go straight to the connection; any other
//! statement on the same executor waits for the lock, so it never lands
//! inside the open transaction. Inner scopes issue `SAVEPOINT` and release
//! or roll back to it.
//!
//! [`atomic`] is the usual entry point. Calling it with a manager as the
//! executor opens a nested scope on that manager:
//!
//! ```ignore
//! atomic(db, |txn| async move {
//!     insert_record(&txn, &mut team).await?;
//!     atomic(&txn, |inner| async move {
//!         insert_record(&inner, &mut event).await
//!     })
//!     .await
//! })
//! .await?;
//! ```

use std::future::Future;
use std::sync::Arc;

use terrapin_core::logging::DB_TARGET;
use terrapin_core::{OrmError, OrmResult};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::executor::{Capabilities, DbExecutor, QueryResult, StatementCache};
use crate::value::Value;

#[derive(Debug, Default)]
struct TransactionState {
    /// 0 outside a transaction, 1 in the outermost scope, more in savepoints.
    depth: u32,
    savepoints: Vec<String>,
    lock: Option<OwnedMutexGuard<()>>,
}

/// Transaction state over one executor. Clones share the same state.
#[derive(Clone)]
pub struct TransactionManager<'a> {
    db: &'a dyn DbExecutor,
    state: Arc<Mutex<TransactionState>>,
}

impl std::fmt::Debug for TransactionManager<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("dialect", &self.db.dialect())
            .finish_non_exhaustive()
    }
}

impl<'a> TransactionManager<'a> {
    pub fn new(db: &'a dyn DbExecutor) -> Self {
        Self {
            db,
            state: Arc::new(Mutex::new(TransactionState::default())),
        }
    }

    /// Current nesting depth; 0 when no transaction is open.
    pub async fn depth(&self) -> u32 {
        self.state.lock().await.depth
    }

    pub fn executor(&self) -> &'a dyn DbExecutor {
        self.db
    }

    async fn run(&self, sql: &str) -> OrmResult<()> {
        tracing::debug!(target: DB_TARGET, sql, "transaction");
        self.db.run_query(sql, &[]).await.map(|_| ())
    }

    /// Whether this manager holds the executor's transaction lock.
    async fn holds_lock(&self) -> bool {
        self.state.lock().await.lock.is_some()
    }

    /// Opens the outermost transaction or a savepoint inside it.
    pub async fn begin(&self) -> OrmResult<()> {
        let mut state = self.state.lock().await;
        if state.depth == 0 {
            let guard = self.db.transaction_lock().lock_owned().await;
            self.run("BEGIN").await?;
            state.lock = Some(guard);
        } else {
            let name = format!("terrapin_sp_{}", state.depth);
            self.run(&format!("SAVEPOINT {name}")).await?;
            state.savepoints.push(name);
        }
        state.depth += 1;
        Ok(())
    }

    /// Commits the outermost transaction or releases the innermost savepoint.
    pub async fn commit(&self) -> OrmResult<()> {
        let mut state = self.state.lock().await;
        match state.depth {
            0 => Err(OrmError::TransactionManagementError(
                "Cannot commit outside of a transaction".to_string(),
            )),
            1 => {
                let result = self.run("COMMIT").await;
                if result.is_ok() {
                    state.depth = 0;
                    state.lock = None;
                }
                result
            }
            _ => {
                if let Some(name) = state.savepoints.pop() {
                    self.run(&format!("RELEASE SAVEPOINT {name}")).await?;
                }
                state.depth -= 1;
                Ok(())
            }
        }
    }

    /// Rolls back the outermost transaction or the innermost savepoint.
    pub async fn rollback(&self) -> OrmResult<()> {
        let mut state = self.state.lock().await;
        match state.depth {
            0 => Err(OrmError::TransactionManagementError(
                "Cannot roll back outside of a transaction".to_string(),
            )),
            1 => {
                // The lock is released even if ROLLBACK fails; the driver
                // has already abandoned the transaction in that case.
                let result = self.run("ROLLBACK").await;
                state.depth = 0;
                state.lock = None;
                result
            }
            _ => {
                if let Some(name) = state.savepoints.pop() {
                    self.run(&format!("ROLLBACK TO SAVEPOINT {name}")).await?;
                    self.run(&format!("RELEASE SAVEPOINT {name}")).await?;
                }
                state.depth -= 1;
                Ok(())
            }
        }
    }
}

#[async_trait::async_trait]
impl DbExecutor for TransactionManager<'_> {
    fn capabilities(&self) -> Capabilities {
        self.db.capabilities()
    }

    async fn run_query(&self, sql: &str, params: &[Value]) -> OrmResult<QueryResult> {
        self.db.run_query(sql, params).await
    }

    async fn run_insert(&self, sql: &str, params: &[Value]) -> OrmResult<Value> {
        self.db.run_insert(sql, params).await
    }

    async fn run_many(&self, sql: &str, params: &[Vec<Value>]) -> OrmResult<u64> {
        self.db.run_many(sql, params).await
    }

    async fn run_script(&self, script: &str) -> OrmResult<()> {
        self.db.run_script(script).await
    }

    async fn execute_query(&self, sql: &str, params: &[Value]) -> OrmResult<QueryResult> {
        if self.holds_lock().await {
            self.db.run_query(sql, params).await
        } else {
            self.db.execute_query(sql, params).await
        }
    }

    async fn execute_insert(&self, sql: &str, params: &[Value]) -> OrmResult<Value> {
        if self.holds_lock().await {
            self.db.run_insert(sql, params).await
        } else {
            self.db.execute_insert(sql, params).await
        }
    }

    async fn execute_many(&self, sql: &str, params: &[Vec<Value>]) -> OrmResult<u64> {
        if self.holds_lock().await {
            self.db.run_many(sql, params).await
        } else {
            self.db.execute_many(sql, params).await
        }
    }

    async fn execute_script(&self, script: &str) -> OrmResult<()> {
        if self.holds_lock().await {
            self.db.run_script(script).await
        } else {
            self.db.execute_script(script).await
        }
    }

    fn statement_cache(&self) -> &StatementCache {
        self.db.statement_cache()
    }

    fn transaction_lock(&self) -> Arc<Mutex<()>> {
        self.db.transaction_lock()
    }

    fn active_transaction(&self) -> Option<TransactionManager<'_>> {
        Some(self.clone())
    }
}

/// Runs `f` inside a transaction scope, committing when it returns `Ok` and
/// rolling back when it returns `Err`.
///
/// When `db` is itself a [`TransactionManager`] the scope is a savepoint of
/// that transaction.
pub async fn atomic<'a, F, Fut, T>(db: &'a dyn DbExecutor, f: F) -> OrmResult<T>
where
    F: FnOnce(TransactionManager<'a>) -> Fut,
    Fut: Future<Output = OrmResult<T>>,
{
    let txn = db
        .active_transaction()
        .unwrap_or_else(|| TransactionManager::new(db));
    txn.begin().await?;

    match f(txn.clone()).await {
        Ok(value) => {
            txn.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) = txn.rollback().await {
                tracing::warn!(target: DB_TARGET, error = %rollback, "rollback failed");
            }
            Err(err)
        }
    }
}
