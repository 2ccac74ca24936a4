//! SQLite backend using `rusqlite`.
//!
//! The connection lives behind a mutex and every statement runs on the
//! blocking thread pool via `tokio::task::spawn_blocking`. Statements are
//! prepared through rusqlite's per-connection statement cache. Driver errors
//! are translated into the ORM taxonomy: constraint violations become
//! `IntegrityError`, failures to open the file `ConnectionError`, everything
//! else `OperationalError`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::types::ValueRef;
use rusqlite::ErrorCode;
use terrapin_core::logging::DB_TARGET;
use terrapin_core::{OrmError, OrmResult};
use terrapin_db::executor::{Capabilities, DbExecutor, QueryResult, StatementCache};
use terrapin_db::query::Dialect;
use terrapin_db::row::Row;
use terrapin_db::value::Value;
use tokio::sync::Mutex;

/// Translates a driver error.
pub fn translate_error(err: rusqlite::Error) -> OrmError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, message) => {
            let message = message.clone().unwrap_or_else(|| err.to_string());
            match failure.code {
                ErrorCode::ConstraintViolation => OrmError::IntegrityError(message),
                ErrorCode::CannotOpen | ErrorCode::NotADatabase => {
                    OrmError::ConnectionError(message)
                }
                _ => OrmError::OperationalError(message),
            }
        }
        _ => OrmError::OperationalError(err.to_string()),
    }
}

fn bind_params(stmt: &mut rusqlite::Statement<'_>, params: &[Value]) -> OrmResult<()> {
    for (i, param) in params.iter().enumerate() {
        let idx = i + 1;
        match param {
            Value::Null => stmt.raw_bind_parameter(idx, rusqlite::types::Null),
            Value::Bool(b) => stmt.raw_bind_parameter(idx, b),
            Value::Int(v) => stmt.raw_bind_parameter(idx, v),
            Value::Float(v) => stmt.raw_bind_parameter(idx, v),
            Value::String(s) => stmt.raw_bind_parameter(idx, s.as_str()),
            Value::Bytes(b) => stmt.raw_bind_parameter(idx, b.as_slice()),
            Value::Date(d) => stmt.raw_bind_parameter(idx, d.to_string()),
            Value::DateTime(dt) => stmt.raw_bind_parameter(idx, dt.to_string()),
            Value::DateTimeTz(dt) => stmt.raw_bind_parameter(idx, dt.to_rfc3339()),
            Value::Time(t) => stmt.raw_bind_parameter(idx, t.to_string()),
            Value::Uuid(u) => stmt.raw_bind_parameter(idx, u.to_string()),
            Value::Json(j) => stmt.raw_bind_parameter(idx, j.to_string()),
            Value::List(_) => {
                return Err(OrmError::ParamsError(format!(
                    "Parameter {idx} is a list; lists must be expanded before binding"
                )));
            }
        }
        .map_err(translate_error)?;
    }
    Ok(())
}

fn convert_row(row: &rusqlite::Row<'_>, columns: &[String]) -> OrmResult<Row> {
    let values = (0..columns.len())
        .map(|i| {
            Ok(match row.get_ref(i).map_err(translate_error)? {
                ValueRef::Null => Value::Null,
                ValueRef::Integer(v) => Value::Int(v),
                ValueRef::Real(v) => Value::Float(v),
                ValueRef::Text(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
                ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
            })
        })
        .collect::<OrmResult<Vec<Value>>>()?;
    Ok(Row::new(columns.to_vec(), values))
}

fn run_statement(
    conn: &rusqlite::Connection,
    sql: &str,
    params: &[Value],
) -> OrmResult<QueryResult> {
    let mut stmt = conn.prepare_cached(sql).map_err(translate_error)?;
    bind_params(&mut stmt, params)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    if columns.is_empty() {
        let affected = stmt.raw_execute().map_err(translate_error)?;
        return Ok(QueryResult {
            row_count: u64::try_from(affected).unwrap_or(u64::MAX),
            columns,
            rows: Vec::new(),
        });
    }
    let mut rows = Vec::new();
    let mut raw = stmt.raw_query();
    while let Some(row) = raw.next().map_err(translate_error)? {
        rows.push(convert_row(row, &columns)?);
    }
    Ok(QueryResult {
        row_count: rows.len() as u64,
        columns,
        rows,
    })
}

/// A SQLite database.
pub struct SqliteBackend {
    path: PathBuf,
    conn: Arc<Mutex<rusqlite::Connection>>,
    cache: StatementCache,
    transaction_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteBackend {
    /// Opens the database at `path`; `:memory:` opens a private in-memory
    /// database. Foreign keys are enforced.
    pub fn open(path: impl AsRef<Path>) -> OrmResult<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = if path.as_os_str() == ":memory:" {
            rusqlite::Connection::open_in_memory()
        } else {
            rusqlite::Connection::open(&path)
        }
        .map_err(|e| OrmError::ConnectionError(format!("Cannot open {}: {e}", path.display())))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(translate_error)?;
        tracing::debug!(target: DB_TARGET, path = %path.display(), "opened sqlite database");

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
            cache: StatementCache::new(),
            transaction_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn memory() -> OrmResult<Self> {
        Self::open(":memory:")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `f` with the connection on the blocking pool.
    async fn with_connection<T, F>(&self, f: F) -> OrmResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> OrmResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            f(&conn)
        })
        .await
        .map_err(|e| OrmError::OperationalError(format!("SQLite task failed: {e}")))?
    }
}

#[async_trait::async_trait]
impl DbExecutor for SqliteBackend {
    fn capabilities(&self) -> Capabilities {
        Capabilities::for_dialect(Dialect::SQLite)
    }

    async fn run_query(&self, sql: &str, params: &[Value]) -> OrmResult<QueryResult> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_connection(move |conn| run_statement(conn, &sql, &params))
            .await
    }

    async fn run_insert(&self, sql: &str, params: &[Value]) -> OrmResult<Value> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_connection(move |conn| {
            run_statement(conn, &sql, &params)?;
            Ok(Value::Int(conn.last_insert_rowid()))
        })
        .await
    }

    async fn run_many(&self, sql: &str, params: &[Vec<Value>]) -> OrmResult<u64> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare_cached(&sql).map_err(translate_error)?;
            let mut affected = 0u64;
            for set in &params {
                bind_params(&mut stmt, set)?;
                let n = stmt.raw_execute().map_err(translate_error)?;
                affected += u64::try_from(n).unwrap_or(0);
            }
            Ok(affected)
        })
        .await
    }

    async fn run_script(&self, script: &str) -> OrmResult<()> {
        let script = script.to_string();
        self.with_connection(move |conn| conn.execute_batch(&script).map_err(translate_error))
            .await
    }

    fn statement_cache(&self) -> &StatementCache {
        &self.cache
    }

    fn transaction_lock(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.transaction_lock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use terrapin_db::transactions::atomic;

    async fn users() -> SqliteBackend {
        let backend = SqliteBackend::memory().unwrap();
        backend
            .execute_script(
                "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE, age INTEGER, bio TEXT);",
            )
            .await
            .unwrap();
        backend
    }

    #[tokio::test]
    async fn test_memory_open() {
        let backend = SqliteBackend::memory().unwrap();
        assert_eq!(backend.dialect(), Dialect::SQLite);
        assert!(backend.capabilities().requires_limit);
        assert_eq!(backend.path(), Path::new(":memory:"));
    }

    #[tokio::test]
    async fn test_insert_and_query() {
        let backend = users().await;
        let id = backend
            .execute_insert(
                "INSERT INTO users (name, age, bio) VALUES (?, ?, ?)",
                &[Value::from("Alice"), Value::from(30), Value::Null],
            )
            .await
            .unwrap();
        assert_eq!(id, Value::Int(1));

        let result = backend
            .execute_query("SELECT id, name, age, bio FROM users", &[])
            .await
            .unwrap();
        assert_eq!(result.columns, vec!["id", "name", "age", "bio"]);
        assert_eq!(result.row_count, 1);
        let row = &result.rows[0];
        assert_eq!(row.get::<String>("name").unwrap(), "Alice");
        assert_eq!(row.get::<i64>("age").unwrap(), 30);
        assert_eq!(row.get::<Option<String>>("bio").unwrap(), None);
    }

    #[tokio::test]
    async fn test_affected_rows() {
        let backend = users().await;
        let inserted = backend
            .execute_many(
                "INSERT INTO users (name, age) VALUES (?, ?)",
                &[
                    vec![Value::from("a"), Value::from(1)],
                    vec![Value::from("b"), Value::from(2)],
                    vec![Value::from("c"), Value::from(3)],
                ],
            )
            .await
            .unwrap();
        assert_eq!(inserted, 3);

        let updated = backend
            .execute_query("UPDATE users SET age = age + 1 WHERE age >= ?", &[Value::from(2)])
            .await
            .unwrap();
        assert_eq!(updated.row_count, 2);
        assert!(updated.rows.is_empty());
    }

    #[tokio::test]
    async fn test_unique_violation_is_integrity_error() {
        let backend = users().await;
        let sql = "INSERT INTO users (name) VALUES (?)";
        backend.execute_insert(sql, &[Value::from("dup")]).await.unwrap();
        let err = backend
            .execute_insert(sql, &[Value::from("dup")])
            .await
            .unwrap_err();
        assert!(matches!(err, OrmError::IntegrityError(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_syntax_error_is_operational() {
        let backend = users().await;
        let err = backend.execute_query("SELEC 1", &[]).await.unwrap_err();
        assert!(matches!(err, OrmError::OperationalError(_)));
    }

    #[test]
    fn test_unopenable_path_is_connection_error() {
        let err = SqliteBackend::open("/nonexistent-dir/terrapin/db.sqlite3").unwrap_err();
        assert!(matches!(err, OrmError::ConnectionError(_)));
    }

    #[tokio::test]
    async fn test_blob_and_float() {
        let backend = SqliteBackend::memory().unwrap();
        backend
            .execute_script("CREATE TABLE t (data BLOB, price REAL);")
            .await
            .unwrap();
        let blob = vec![0xDE_u8, 0xAD, 0xBE, 0xEF];
        backend
            .execute_query(
                "INSERT INTO t (data, price) VALUES (?, ?)",
                &[Value::Bytes(blob.clone()), Value::from(19.99)],
            )
            .await
            .unwrap();
        let rows = backend.query("SELECT data, price FROM t", &[]).await.unwrap();
        assert_eq!(rows[0].get_value("data"), Some(&Value::Bytes(blob)));
        let price: f64 = rows[0].get("price").unwrap();
        assert!((price - 19.99).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_atomic_rolls_back_on_sqlite() {
        let backend = users().await;
        let result: OrmResult<()> = atomic(&backend, |txn| async move {
            txn.execute_query("INSERT INTO users (name) VALUES (?)", &[Value::from("x")])
                .await?;
            Err(OrmError::OperationalError("abort".to_string()))
        })
        .await;
        assert!(result.is_err());
        let rows = backend.query("SELECT id FROM users", &[]).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_nested_savepoint_on_sqlite() {
        let backend = users().await;
        atomic(&backend, |txn| async move {
            txn.execute_query("INSERT INTO users (name) VALUES (?)", &[Value::from("outer")])
                .await?;
            let inner: OrmResult<()> = atomic(&txn, |inner| async move {
                inner
                    .execute_query("INSERT INTO users (name) VALUES (?)", &[Value::from("inner")])
                    .await?;
                Err(OrmError::OperationalError("abort inner".to_string()))
            })
            .await;
            assert!(inner.is_err());
            Ok(())
        })
        .await
        .unwrap();
        let rows = backend.query("SELECT name FROM users", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get::<String>("name").unwrap(), "outer");
    }
}
