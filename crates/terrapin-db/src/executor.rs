//! Database executor trait and record write operations.
//!
//! [`DbExecutor`] is the narrow driver contract the ORM consumes: run a
//! query, run an insert, run a statement many times, run a script. Backends
//! in `terrapin-db-backends` implement it. Query execution and the free
//! functions below accept `&dyn DbExecutor`.
//!
//! Each executor owns a [`StatementCache`] for SQL that only depends on the
//! model (single-row inserts), and a lock serializing transactions on its
//! connection.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use terrapin_core::logging::DB_TARGET;
use terrapin_core::{OrmError, OrmResult};

use crate::model::{FieldKind, FieldMeta, ModelMeta};
use crate::query::compiler::{
    CompareOp, Criterion, Delete, Dialect, Select, SqlCompiler, TableRef, Term, Update,
};
use crate::record::Record;
use crate::row::Row;
use crate::transactions::TransactionManager;
use crate::value::Value;

/// What a backend supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub dialect: Dialect,
    /// OFFSET is only accepted together with LIMIT.
    pub requires_limit: bool,
    /// Column and table comments go inside CREATE TABLE.
    pub inline_comment: bool,
    pub supports_transactions: bool,
}

impl Capabilities {
    /// Default capabilities of a dialect.
    pub const fn for_dialect(dialect: Dialect) -> Self {
        Self {
            dialect,
            requires_limit: dialect.requires_limit(),
            inline_comment: dialect.inline_comments(),
            supports_transactions: true,
        }
    }
}

/// Result of one statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Rows returned, or rows affected for statements without a result set.
    pub row_count: u64,
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

/// Per-executor cache of compiled SQL.
#[derive(Debug, Default)]
pub struct StatementCache {
    statements: RwLock<HashMap<String, Arc<str>>>,
}

impl StatementCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached SQL for `key`, compiling and storing it on a miss.
    pub fn get_or_compile(&self, key: &str, compile: impl FnOnce() -> String) -> Arc<str> {
        if let Some(sql) = self
            .statements
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return Arc::clone(sql);
        }
        let sql: Arc<str> = compile().into();
        self.statements
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_insert_with(|| Arc::clone(&sql));
        sql
    }

    pub fn len(&self) -> usize {
        self.statements
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.statements
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Minimal async database executor trait.
///
/// This is the bridge between the ORM layer and the concrete database
/// backends. It lives in the ORM crate so that execution can be defined
/// without circular dependencies.
///
/// Backends implement the `run_*` methods, which go straight to the
/// connection. Callers use the `execute_*` methods, which first wait for
/// [`transaction_lock`](Self::transaction_lock): a statement issued outside a
/// transaction never runs inside another task's open `BEGIN`. A
/// [`TransactionManager`] holding the lock runs its statements through
/// `run_*` directly.
#[async_trait::async_trait]
pub trait DbExecutor: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// Runs one statement on the connection and returns its rows (if any)
    /// and row count.
    async fn run_query(&self, sql: &str, params: &[Value]) -> OrmResult<QueryResult>;

    /// Runs an INSERT on the connection and returns the generated primary
    /// key.
    async fn run_insert(&self, sql: &str, params: &[Value]) -> OrmResult<Value>;

    /// Runs one statement once per parameter set; returns rows affected.
    async fn run_many(&self, sql: &str, params: &[Vec<Value>]) -> OrmResult<u64>;

    /// Runs several `;`-separated statements without parameters.
    async fn run_script(&self, script: &str) -> OrmResult<()>;

    /// [`run_query`](Self::run_query) once no transaction holds the
    /// connection.
    async fn execute_query(&self, sql: &str, params: &[Value]) -> OrmResult<QueryResult> {
        let _turn = self.transaction_lock().lock_owned().await;
        self.run_query(sql, params).await
    }

    async fn execute_insert(&self, sql: &str, params: &[Value]) -> OrmResult<Value> {
        let _turn = self.transaction_lock().lock_owned().await;
        self.run_insert(sql, params).await
    }

    async fn execute_many(&self, sql: &str, params: &[Vec<Value>]) -> OrmResult<u64> {
        let _turn = self.transaction_lock().lock_owned().await;
        self.run_many(sql, params).await
    }

    async fn execute_script(&self, script: &str) -> OrmResult<()> {
        let _turn = self.transaction_lock().lock_owned().await;
        self.run_script(script).await
    }

    fn statement_cache(&self) -> &StatementCache;

    /// Held for the duration of the outermost transaction on this
    /// connection, and for each statement run outside one.
    fn transaction_lock(&self) -> Arc<tokio::sync::Mutex<()>>;

    /// The transaction this executor runs inside, if any. Opening a
    /// transaction on such an executor nests a savepoint instead.
    fn active_transaction(&self) -> Option<TransactionManager<'_>> {
        None
    }

    fn dialect(&self) -> Dialect {
        self.capabilities().dialect
    }

    /// Runs a query and returns its rows.
    async fn query(&self, sql: &str, params: &[Value]) -> OrmResult<Vec<Row>> {
        Ok(self.execute_query(sql, params).await?.rows)
    }
}

// ── Record write operations ─────────────────────────────────────────────

/// Columns of an INSERT. A generated primary key is left to the database
/// unless the caller supplied one.
fn insert_fields(model: &ModelMeta, explicit_pk: bool) -> Vec<&FieldMeta> {
    model
        .data_fields()
        .filter(|f| explicit_pk || !(f.primary_key && f.generated))
        .collect()
}

fn insert_values(record: &Record, fields: &[&FieldMeta]) -> Vec<Value> {
    fields
        .iter()
        .map(|f| {
            record
                .get(&f.name)
                .cloned()
                .or_else(|| f.default.clone())
                .unwrap_or(Value::Null)
        })
        .collect()
}

fn insert_sql(db: &dyn DbExecutor, model: &ModelMeta, fields: &[&FieldMeta]) -> Arc<str> {
    let compiler = SqlCompiler::new(db.dialect());
    let key = format!("insert:{}:{}", model.name, fields.len());
    db.statement_cache().get_or_compile(&key, || {
        let columns: Vec<String> = fields
            .iter()
            .filter_map(|f| f.column.clone())
            .collect();
        let placeholders = vec![Value::Null; columns.len()];
        compiler
            .compile_insert(&model.table, &columns, &placeholders, Some(model.pk_column()))
            .0
    })
}

/// Inserts a record and stores its generated primary key and defaults.
pub async fn insert_record(db: &dyn DbExecutor, record: &mut Record) -> OrmResult<()> {
    let model = Arc::clone(record.model());
    let explicit_pk = record.pk().is_some();
    let fields = insert_fields(&model, explicit_pk);
    let values = insert_values(record, &fields);
    let sql = insert_sql(db, &model, &fields);
    tracing::debug!(target: DB_TARGET, model = %model.name, "insert");
    let pk = db.execute_insert(&sql, &values).await?;

    for (field, value) in fields.iter().zip(values) {
        record.set(field.name.clone(), value);
    }
    if !explicit_pk && model.pk_field().is_some_and(|f| f.generated) {
        record.set(model.pk_attr.clone(), pk);
    }
    Ok(())
}

/// Updates a stored record by primary key, inserting it when it has no
/// primary key yet or the update matched no row.
pub async fn save_record(db: &dyn DbExecutor, record: &mut Record) -> OrmResult<()> {
    let Some(pk) = record.pk().cloned() else {
        return insert_record(db, record).await;
    };
    let model = Arc::clone(record.model());
    let assignments: Vec<(String, Term)> = model
        .data_fields()
        .filter(|f| !f.primary_key)
        .filter_map(|f| {
            let column = f.column.clone()?;
            let value = record.get(&f.name).cloned().unwrap_or(Value::Null);
            Some((column, Term::Value(value)))
        })
        .collect();
    if assignments.is_empty() {
        return Ok(());
    }
    let update = Update {
        table: model.table.clone(),
        assignments,
        where_clause: pk_criterion(&model, pk),
    };
    let (sql, params) = SqlCompiler::new(db.dialect()).compile_update(&update);
    let result = db.execute_query(&sql, &params).await?;
    if result.row_count == 0 {
        return insert_record(db, record).await;
    }
    Ok(())
}

/// Deletes a stored record; returns rows affected.
pub async fn delete_record(db: &dyn DbExecutor, record: &Record) -> OrmResult<u64> {
    let pk = record.pk().cloned().ok_or_else(|| {
        OrmError::ParamsError(format!(
            "Cannot delete a \"{}\" record without a primary key",
            record.model_name()
        ))
    })?;
    let model = record.model();
    let delete = Delete {
        table: model.table.clone(),
        where_clause: pk_criterion(model, pk),
    };
    let (sql, params) = SqlCompiler::new(db.dialect()).compile_delete(&delete);
    Ok(db.execute_query(&sql, &params).await?.row_count)
}

/// Inserts many records of one model with a single prepared statement.
/// Generated primary keys are not read back.
pub async fn bulk_create(db: &dyn DbExecutor, records: &[Record]) -> OrmResult<u64> {
    let Some(first) = records.first() else {
        return Ok(0);
    };
    let model = Arc::clone(first.model());
    if let Some(other) = records.iter().find(|r| r.model_name() != model.name) {
        return Err(OrmError::ParamsError(format!(
            "bulk_create got records of \"{}\" and \"{}\"",
            model.name,
            other.model_name()
        )));
    }
    let fields = insert_fields(&model, false);
    let sql = insert_sql(db, &model, &fields);
    let params: Vec<Vec<Value>> = records.iter().map(|r| insert_values(r, &fields)).collect();
    tracing::debug!(target: DB_TARGET, model = %model.name, rows = params.len(), "bulk insert");
    db.execute_many(&sql, &params).await
}

fn pk_criterion(model: &ModelMeta, pk: Value) -> Criterion {
    Criterion::compare(
        Term::column("", model.pk_column()),
        CompareOp::Eq,
        Term::Value(pk),
    )
}

struct Junction<'a> {
    table: &'a str,
    owner_key: &'a str,
    target_key: &'a str,
    owner_pk: Value,
}

fn junction<'a>(record: &Record, meta: &'a FieldKind, relation: &str) -> OrmResult<Junction<'a>> {
    let FieldKind::ManyToMany(m2m) = meta else {
        return Err(OrmError::FieldError(format!(
            "\"{relation}\" of model \"{}\" is not a many-to-many relation",
            record.model_name()
        )));
    };
    let owner_pk = record.pk().cloned().ok_or_else(|| {
        OrmError::ParamsError(format!(
            "Record of model \"{}\" must be saved before linking \"{relation}\"",
            record.model_name()
        ))
    })?;
    Ok(Junction {
        table: &m2m.through,
        owner_key: &m2m.backward_key,
        target_key: &m2m.forward_key,
        owner_pk,
    })
}

fn relation_kind<'a>(record: &'a Record, relation: &str) -> OrmResult<&'a FieldKind> {
    record
        .model()
        .field(relation)
        .map(|f| &f.kind)
        .ok_or_else(|| OrmError::unknown_field(record.model_name(), relation))
}

/// Links `targets` (primary keys) to `record` through a many-to-many
/// relation. Links that already exist are skipped.
pub async fn add_m2m(
    db: &dyn DbExecutor,
    record: &Record,
    relation: &str,
    targets: &[Value],
) -> OrmResult<u64> {
    if targets.is_empty() {
        return Ok(0);
    }
    let kind = relation_kind(record, relation)?;
    let j = junction(record, kind, relation)?;
    let compiler = SqlCompiler::new(db.dialect());

    let mut existing = Select::new(TableRef::new(j.table));
    existing.column(Term::column("", j.target_key), None);
    existing.where_clause = Criterion::compare(
        Term::column("", j.owner_key),
        CompareOp::Eq,
        Term::Value(j.owner_pk.clone()),
    )
    .and(Criterion::In {
        term: Term::column("", j.target_key),
        values: targets.iter().cloned().map(Term::Value).collect(),
        negated: false,
    });
    let (sql, params) = compiler.compile_select(&existing);
    let linked: Vec<String> = db
        .query(&sql, &params)
        .await?
        .iter()
        .filter_map(|row| row.get_by_index::<Value>(0).ok())
        .map(|v| v.group_key())
        .collect();

    let mut seen = linked;
    let mut rows = Vec::new();
    for target in targets {
        let key = target.group_key();
        if !seen.contains(&key) {
            seen.push(key);
            rows.push(vec![j.owner_pk.clone(), target.clone()]);
        }
    }
    if rows.is_empty() {
        return Ok(0);
    }
    let columns = vec![j.owner_key.to_string(), j.target_key.to_string()];
    let (sql, _) = compiler.compile_insert(j.table, &columns, &[Value::Null, Value::Null], None);
    db.execute_many(&sql, &rows).await
}

/// Removes links between `record` and `targets`.
pub async fn remove_m2m(
    db: &dyn DbExecutor,
    record: &Record,
    relation: &str,
    targets: &[Value],
) -> OrmResult<u64> {
    if targets.is_empty() {
        return Ok(0);
    }
    let kind = relation_kind(record, relation)?;
    let j = junction(record, kind, relation)?;
    let delete = Delete {
        table: j.table.to_string(),
        where_clause: Criterion::compare(
            Term::column("", j.owner_key),
            CompareOp::Eq,
            Term::Value(j.owner_pk),
        )
        .and(Criterion::In {
            term: Term::column("", j.target_key),
            values: targets.iter().cloned().map(Term::Value).collect(),
            negated: false,
        }),
    };
    let (sql, params) = SqlCompiler::new(db.dialect()).compile_delete(&delete);
    Ok(db.execute_query(&sql, &params).await?.row_count)
}

/// Removes every link of `record` through `relation`.
pub async fn clear_m2m(db: &dyn DbExecutor, record: &Record, relation: &str) -> OrmResult<u64> {
    let kind = relation_kind(record, relation)?;
    let j = junction(record, kind, relation)?;
    let delete = Delete {
        table: j.table.to_string(),
        where_clause: Criterion::compare(
            Term::column("", j.owner_key),
            CompareOp::Eq,
            Term::Value(j.owner_pk),
        ),
    };
    let (sql, params) = SqlCompiler::new(db.dialect()).compile_delete(&delete);
    Ok(db.execute_query(&sql, &params).await?.row_count)
}
