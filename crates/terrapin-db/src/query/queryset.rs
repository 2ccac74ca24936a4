//! Lazy, composable queries over one model.
//!
//! A [`QuerySet`] accumulates filters, annotations, ordering, paging and
//! prefetch requests. Builder methods consume the queryset and return the
//! modified one, so a previously returned queryset never changes; clone it to
//! fork a chain. Nothing touches the database until a terminal method
//! (`all`, `get`, `count`, `values`, `update`, ...) is awaited with an
//! executor.
//!
//! Building the statement is one pass over the accumulated state: base
//! table, annotations, projection, filters, grouping, ordering, then
//! limit/offset/distinct. Every pass starts from a fresh
//! [`QueryContext`], so the same queryset can be compiled any number of times.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use terrapin_db::fields::{FieldDef, FieldType};
//! use terrapin_db::model::ModelDef;
//! use terrapin_db::query::compiler::Dialect;
//! use terrapin_db::query::expressions::count;
//! use terrapin_db::query::Q;
//! use terrapin_db::registry::Registry;
//!
//! let registry = Registry::builder()
//!     .register(
//!         ModelDef::new("Tournament")
//!             .field(FieldDef::new("id", FieldType::IntField).primary_key())
//!             .field(FieldDef::new("name", FieldType::TextField)),
//!     )
//!     .register(
//!         ModelDef::new("Event")
//!             .field(FieldDef::new("id", FieldType::IntField).primary_key())
//!             .field(FieldDef::foreign_key("tournament", "Tournament")),
//!     )
//!     .build()
//!     .unwrap();
//!
//! let qs = registry
//!     .query("Tournament")
//!     .unwrap()
//!     .annotate("events_count", count("events"))
//!     .filter(Q::new("events_count__gte", 1));
//! let (sql, _) = qs.sql(Dialect::SQLite).unwrap();
//! assert!(sql.contains("HAVING COUNT(\"tournament__events\".\"id\")>=?"));
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use terrapin_core::logging::{query_span, DB_TARGET};
use terrapin_core::{OrmError, OrmResult};
use tracing::Instrument;

use crate::executor::DbExecutor;
use crate::model::{FieldKind, ManyToManyMeta, Model, ModelMeta};
use crate::prefetch::{prefetch_records, Prefetch};
use crate::query::compiler::{
    CompareOp, Criterion, Delete, Dialect, Join, JoinKind, Select, SelectItem, SqlCompiler,
    TableRef, Term, Update,
};
use crate::query::context::{Frame, QueryContext};
use crate::query::expressions::subquery::subquery_frame;
use crate::query::expressions::Expression;
use crate::query::lookups::Q;
use crate::query::ordering::{resolve_ordering, OrderBy};
use crate::query::resolver::Resolver;
use crate::record::Record;
use crate::registry::Registry;
use crate::row::Row;
use crate::value::Value;

/// Column carrying the owner's key in many-to-many prefetch rows.
pub(crate) const BACKWARD_KEY_ALIAS: &str = "_backward_relation_key";

/// What a statement selects.
#[derive(Debug, Clone, Copy)]
enum Columns<'p> {
    /// Every data column, then every annotation.
    Records,
    /// The named fields or annotations, aliased by name.
    Fields(&'p [String]),
}

/// A lazy query over one registered model.
#[derive(Clone)]
pub struct QuerySet {
    registry: Arc<Registry>,
    model: Arc<ModelMeta>,
    filters: Vec<Q>,
    annotations: Vec<(String, Expression)>,
    ordering: Vec<OrderBy>,
    limit: Option<u64>,
    offset: Option<u64>,
    distinct: bool,
    group_by: Vec<String>,
    fields: Option<Vec<String>>,
    prefetch: Vec<Prefetch>,
    empty: bool,
}

impl fmt::Debug for QuerySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuerySet")
            .field("model", &self.model.name)
            .field("filters", &self.filters)
            .field("annotations", &self.annotations)
            .field("ordering", &self.ordering)
            .field("limit", &self.limit)
            .field("offset", &self.offset)
            .field("distinct", &self.distinct)
            .field("group_by", &self.group_by)
            .field("fields", &self.fields)
            .field("prefetch", &self.prefetch)
            .field("empty", &self.empty)
            .finish()
    }
}

impl QuerySet {
    pub fn new(registry: Arc<Registry>, model: Arc<ModelMeta>) -> Self {
        Self {
            registry,
            model,
            filters: Vec::new(),
            annotations: Vec::new(),
            ordering: Vec::new(),
            limit: None,
            offset: None,
            distinct: false,
            group_by: Vec::new(),
            fields: None,
            prefetch: Vec::new(),
            empty: false,
        }
    }

    pub fn model(&self) -> &Arc<ModelMeta> {
        &self.model
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    // ── Builders ────────────────────────────────────────────────────────

    /// Adds a filter; all filters are conjoined.
    #[must_use]
    pub fn filter(mut self, q: Q) -> Self {
        if !q.is_empty() {
            self.filters.push(q);
        }
        self
    }

    /// Adds a negated filter.
    #[must_use]
    pub fn exclude(self, q: Q) -> Self {
        if q.is_empty() {
            return self;
        }
        self.filter(!q)
    }

    /// Adds a computed column. Later annotations may refer to earlier ones.
    #[must_use]
    pub fn annotate(mut self, name: impl Into<String>, expr: impl Into<Expression>) -> Self {
        self.annotations.push((name.into(), expr.into()));
        self
    }

    /// Replaces the ordering.
    #[must_use]
    pub fn order_by<I, O>(mut self, orderings: I) -> Self
    where
        I: IntoIterator<Item = O>,
        O: Into<OrderBy>,
    {
        self.ordering = orderings.into_iter().map(Into::into).collect();
        self
    }

    /// Flips every ordering term. Without any ordering the result is sorted
    /// by primary key, descending.
    #[must_use]
    pub fn reverse(mut self) -> Self {
        let base = if !self.ordering.is_empty() {
            std::mem::take(&mut self.ordering)
        } else if !self.model.ordering.is_empty() {
            self.model.ordering.iter().map(|o| OrderBy::parse(o)).collect()
        } else {
            vec![OrderBy::parse("pk")]
        };
        self.ordering = base.into_iter().map(OrderBy::reversed).collect();
        self
    }

    #[must_use]
    pub const fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub const fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    #[must_use]
    pub const fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// Groups by the given fields instead of the primary key.
    #[must_use]
    pub fn group_by<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_by = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Restricts the columns selected when this queryset is nested as a
    /// subquery.
    #[must_use]
    pub fn only<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Queues relations to load after the main query.
    #[must_use]
    pub fn prefetch_related<I, P>(mut self, relations: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Prefetch>,
    {
        self.prefetch.extend(relations.into_iter().map(Into::into));
        self
    }

    /// A queryset matching nothing. Its terminals do not query the database.
    #[must_use]
    pub fn none(mut self) -> Self {
        self.empty = true;
        self
    }

    // ── Statement building ──────────────────────────────────────────────

    fn root_context(&self) -> QueryContext {
        QueryContext::new(Frame::root(Arc::clone(&self.model)))
    }

    /// Builds the statement on the context's top frame.
    fn compose(&self, ctx: &mut QueryContext, columns: Columns<'_>) -> OrmResult<Select> {
        let table = ctx.top().table.clone();
        let ident = table.ident().to_string();
        let mut select = Select::new(table);

        let mut annotations = BTreeMap::new();
        for (name, expr) in &self.annotations {
            if self.model.has_field(name) {
                return Err(OrmError::FieldError(format!(
                    "Annotation \"{name}\" conflicts with a field of model \"{}\"",
                    self.model.name
                )));
            }
            let resolved = Resolver::new(&self.registry, &annotations, ctx).expression(
                ctx,
                expr,
                &mut select.joins,
            )?;
            annotations.insert(name.clone(), resolved);
        }
        let resolver = Resolver::new(&self.registry, &annotations, ctx);

        let mut projected = Vec::new();
        match columns {
            Columns::Records => {
                for field in self.model.data_fields() {
                    if let Some(column) = &field.column {
                        select.column(Term::column(ident.as_str(), column.as_str()), None);
                    }
                }
                for (name, _) in &self.annotations {
                    if let Some(resolved) = annotations.get(name) {
                        select.column(resolved.term.clone(), Some(name.clone()));
                        projected.push(name.clone());
                    }
                }
            }
            Columns::Fields(fields) => {
                for name in fields {
                    let resolved = resolver.field(ctx, name, &mut select.joins, false)?;
                    if annotations.contains_key(name) {
                        projected.push(name.clone());
                    }
                    select.column(resolved.term, Some(name.clone()));
                }
            }
        }

        for q in &self.filters {
            resolver.filter(ctx, q)?.apply(&mut select);
        }
        if self.empty {
            select.where_clause = Criterion::Always(false);
        }

        if !self.group_by.is_empty() {
            for name in &self.group_by {
                let resolved = resolver.field(ctx, name, &mut select.joins, false)?;
                select.group_by.push(resolved.term);
            }
        } else if annotations.values().any(|r| r.aggregate) || !select.having.is_empty() {
            select
                .group_by
                .push(Term::column(ident.as_str(), self.model.pk_column()));
        }

        let explicit = if self.ordering.is_empty() {
            self.model.ordering.iter().map(|o| OrderBy::parse(o)).collect()
        } else {
            self.ordering.clone()
        };
        // Annotations that are not selected have no alias to order by.
        let ordering: Vec<OrderBy> = explicit
            .into_iter()
            .map(|o| match o {
                OrderBy::Field { path, descending }
                    if annotations.contains_key(&path) && !projected.contains(&path) =>
                {
                    OrderBy::Expr {
                        expr: Expression::F(path),
                        descending,
                    }
                }
                other => other,
            })
            .collect();
        select.order_by = resolve_ordering(&resolver, ctx, &ordering, &projected, &mut select.joins)?;

        select.limit = self.limit;
        select.offset = self.offset;
        select.distinct = self.distinct;
        Ok(select)
    }

    fn select_statement(&self, columns: Columns<'_>) -> OrmResult<Select> {
        let mut ctx = self.root_context();
        self.compose(&mut ctx, columns)
    }

    /// The statement this queryset runs for `all()`, compiled for `dialect`.
    pub fn sql(&self, dialect: Dialect) -> OrmResult<(String, Vec<Value>)> {
        let select = self.select_statement(Columns::Records)?;
        Ok(SqlCompiler::new(dialect).compile_select(&select))
    }

    /// Builds this queryset as a single-column subquery of the query whose
    /// context is `ctx`. Without [`only`](Self::only) it selects the primary
    /// key.
    pub(crate) fn nested_select(&self, ctx: &mut QueryContext) -> OrmResult<Select> {
        let pk = [self.model.pk_attr.clone()];
        let fields: &[String] = self.fields.as_deref().unwrap_or(&pk);
        if fields.len() != 1 {
            return Err(OrmError::ParamsError(format!(
                "A subquery over \"{}\" must select exactly one column, got {}",
                self.model.name,
                fields.len()
            )));
        }
        let frame = subquery_frame(ctx, Arc::clone(&self.model));
        ctx.scoped(frame, |ctx| self.compose(ctx, Columns::Fields(fields)))
    }

    /// Builds the many-to-many prefetch statement: rows of this model linked
    /// to any of `owner_pks` through `m2m`, each carrying its owner's key
    /// under [`BACKWARD_KEY_ALIAS`]. Filters resolve against a context that
    /// has the junction table joined, so a filter crossing back to the owner
    /// model goes through the same junction row.
    fn m2m_select(&self, m2m: &ManyToManyMeta, owner_pks: &[Value]) -> OrmResult<Select> {
        let through = TableRef::new(m2m.through.clone());
        let frame = Frame::root(Arc::clone(&self.model))
            .with_through(through.clone(), m2m.forward_key.as_str());
        let mut ctx = QueryContext::new(frame);
        let mut select = self.compose(&mut ctx, Columns::Records)?;

        let ident = select.from.ident().to_string();
        let owner_key = Term::column(m2m.through.as_str(), m2m.backward_key.as_str());
        select.joins.insert(
            0,
            Join {
                kind: JoinKind::Inner,
                table: through,
                on: Criterion::compare(
                    Term::column(m2m.through.as_str(), m2m.forward_key.as_str()),
                    CompareOp::Eq,
                    Term::column(ident, self.model.pk_column()),
                ),
            },
        );
        select.column(owner_key.clone(), Some(BACKWARD_KEY_ALIAS.to_string()));
        if !select.group_by.is_empty() {
            select.group_by.push(owner_key.clone());
        }
        let owners = Criterion::In {
            term: owner_key,
            values: owner_pks.iter().cloned().map(Term::Value).collect(),
            negated: false,
        };
        select.where_clause = owners.and(std::mem::take(&mut select.where_clause));
        Ok(select)
    }

    /// WHERE clause selecting the rows an UPDATE or DELETE touches. Joins,
    /// grouping and paging need a `pk IN (SELECT ...)` indirection.
    fn write_filter(&self, mut select: Select) -> Criterion {
        let simple = select.joins.is_empty()
            && select.group_by.is_empty()
            && select.having.is_empty()
            && select.limit.is_none()
            && select.offset.is_none()
            && !select.distinct;
        if simple {
            return select.where_clause;
        }
        let pk_column = self.model.pk_column();
        select.columns = vec![SelectItem {
            term: Term::column(select.from.ident(), pk_column),
            alias: None,
        }];
        if select.limit.is_none() && select.offset.is_none() {
            select.order_by.clear();
        }
        Criterion::InSelect {
            term: Term::column(self.model.table.as_str(), pk_column),
            select: Box::new(select),
            negated: false,
        }
    }

    // ── Execution ───────────────────────────────────────────────────────

    async fn run(&self, db: &dyn DbExecutor, sql: &str, params: &[Value]) -> OrmResult<Vec<Row>> {
        tracing::debug!(target: DB_TARGET, sql, params = params.len(), "query");
        db.query(sql, params)
            .instrument(query_span(&self.model.name))
            .await
    }

    async fn execute(&self, db: &dyn DbExecutor, sql: &str, params: &[Value]) -> OrmResult<u64> {
        tracing::debug!(target: DB_TARGET, sql, params = params.len(), "execute");
        let result = db
            .execute_query(sql, params)
            .instrument(query_span(&self.model.name))
            .await?;
        Ok(result.row_count)
    }

    async fn fetch_rows(&self, db: &dyn DbExecutor, select: &Select) -> OrmResult<Vec<Row>> {
        let (sql, params) = SqlCompiler::new(db.dialect()).compile_select(select);
        self.run(db, &sql, &params).await
    }

    async fn fetch_records(&self, db: &dyn DbExecutor, select: &Select) -> OrmResult<Vec<Record>> {
        let rows = self.fetch_rows(db, select).await?;
        Ok(rows
            .into_iter()
            .map(|row| Record::from_row(Arc::clone(&self.model), row))
            .collect())
    }

    async fn run_prefetch(&self, db: &dyn DbExecutor, records: &mut [Record]) -> OrmResult<()> {
        if self.prefetch.is_empty() || records.is_empty() {
            return Ok(());
        }
        prefetch_records(db, &self.registry, records, &self.prefetch).await
    }

    /// Fetches every matching record, then runs queued prefetches.
    pub async fn all(&self, db: &dyn DbExecutor) -> OrmResult<Vec<Record>> {
        if self.empty {
            return Ok(Vec::new());
        }
        let select = self.select_statement(Columns::Records)?;
        let mut records = self.fetch_records(db, &select).await?;
        self.run_prefetch(db, &mut records).await?;
        Ok(records)
    }

    /// Fetches every matching record mapped into `M`.
    pub async fn all_as<M: Model>(&self, db: &dyn DbExecutor) -> OrmResult<Vec<M>> {
        self.all(db).await?.iter().map(M::from_record).collect()
    }

    /// The first record; ordered by primary key when no ordering applies.
    pub async fn first(&self, db: &dyn DbExecutor) -> OrmResult<Option<Record>> {
        let mut qs = self.clone().limit(1);
        if qs.ordering.is_empty() && qs.model.ordering.is_empty() {
            qs.ordering.push(OrderBy::parse("pk"));
        }
        Ok(qs.all(db).await?.into_iter().next())
    }

    /// Exactly one matching record.
    pub async fn get(&self, db: &dyn DbExecutor) -> OrmResult<Record> {
        if self.empty {
            return Err(self.does_not_exist());
        }
        let limit = self.limit.map_or(2, |l| l.min(2));
        let select = self.clone().limit(limit).select_statement(Columns::Records)?;
        let mut records = self.fetch_records(db, &select).await?;
        match records.len() {
            0 => Err(self.does_not_exist()),
            1 => {
                self.run_prefetch(db, &mut records).await?;
                records.pop().ok_or_else(|| self.does_not_exist())
            }
            _ => Err(OrmError::MultipleObjectsReturned(format!(
                "Multiple objects returned for \"{}\", expected exactly one",
                self.model.name
            ))),
        }
    }

    /// Like [`get`](Self::get) but `None` when nothing matches.
    pub async fn get_or_none(&self, db: &dyn DbExecutor) -> OrmResult<Option<Record>> {
        match self.get(db).await {
            Ok(record) => Ok(Some(record)),
            Err(OrmError::DoesNotExist(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn does_not_exist(&self) -> OrmError {
        OrmError::DoesNotExist(format!(
            "Object \"{}\" does not exist",
            self.model.name
        ))
    }

    /// Number of matching rows.
    pub async fn count(&self, db: &dyn DbExecutor) -> OrmResult<u64> {
        if self.empty {
            return Ok(0);
        }
        let mut select = self.select_statement(Columns::Records)?;
        select.order_by.clear();
        let dialect = db.dialect();
        let compiler = SqlCompiler::new(dialect);
        let wrap = !select.group_by.is_empty()
            || !select.having.is_empty()
            || select.distinct
            || select.limit.is_some()
            || select.offset.is_some();
        let (sql, params) = if wrap {
            let (inner, params) = compiler.compile_select(&select);
            (
                format!("SELECT COUNT(*) FROM ({inner}) {}", dialect.quote("_count")),
                params,
            )
        } else {
            select.columns.clear();
            select.column(Term::func("COUNT", vec![Term::Star]), None);
            compiler.compile_select(&select)
        };
        let rows = self.run(db, &sql, &params).await?;
        let count = match rows.first() {
            Some(row) => row.get_by_index::<i64>(0)?,
            None => 0,
        };
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Whether any row matches.
    pub async fn exists(&self, db: &dyn DbExecutor) -> OrmResult<bool> {
        if self.empty {
            return Ok(false);
        }
        let mut select = self.select_statement(Columns::Records)?;
        select.columns = vec![SelectItem {
            term: Term::Raw("1".to_string()),
            alias: None,
        }];
        select.order_by.clear();
        select.limit = Some(1);
        Ok(!self.fetch_rows(db, &select).await?.is_empty())
    }

    /// Field names used by `values` when none are given: every data field,
    /// then every annotation.
    fn value_fields<I, S>(&self, fields: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        if !fields.is_empty() {
            return fields;
        }
        self.model
            .data_fields()
            .map(|f| f.name.clone())
            .chain(self.annotations.iter().map(|(name, _)| name.clone()))
            .collect()
    }

    async fn value_rows(&self, db: &dyn DbExecutor, fields: &[String]) -> OrmResult<Vec<Row>> {
        if self.empty {
            return Ok(Vec::new());
        }
        let select = self.select_statement(Columns::Fields(fields))?;
        self.fetch_rows(db, &select).await
    }

    /// Rows as maps from field path to value.
    pub async fn values<I, S>(
        &self,
        db: &dyn DbExecutor,
        fields: I,
    ) -> OrmResult<Vec<BTreeMap<String, Value>>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields = self.value_fields(fields);
        let rows = self.value_rows(db, &fields).await?;
        Ok(rows
            .into_iter()
            .map(|row| fields.iter().cloned().zip(row.values().iter().cloned()).collect())
            .collect())
    }

    /// Rows as value tuples in field order.
    pub async fn values_list<I, S>(&self, db: &dyn DbExecutor, fields: I) -> OrmResult<Vec<Vec<Value>>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields = self.value_fields(fields);
        let rows = self.value_rows(db, &fields).await?;
        Ok(rows.into_iter().map(|row| row.values().to_vec()).collect())
    }

    /// The values of one field; `fields` must name exactly one.
    pub async fn values_list_flat<I, S>(&self, db: &dyn DbExecutor, fields: I) -> OrmResult<Vec<Value>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        if fields.len() != 1 {
            return Err(OrmError::ParamsError(format!(
                "A flat values list needs exactly one field, got {}",
                fields.len()
            )));
        }
        let rows = self.value_rows(db, &fields).await?;
        Ok(rows
            .into_iter()
            .map(|row| row.values().first().cloned().unwrap_or(Value::Null))
            .collect())
    }

    /// Sets fields on every matching row; returns rows affected. Values may
    /// be expressions over the row's own columns (`F("rating") + 1`).
    pub async fn update<I, K, V>(&self, db: &dyn DbExecutor, values: I) -> OrmResult<u64>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Expression>,
    {
        if self.empty {
            return Ok(0);
        }
        let mut ctx = self.root_context();
        let select = self.compose(&mut ctx, Columns::Records)?;
        let no_annotations = BTreeMap::new();
        let resolver = Resolver::new(&self.registry, &no_annotations, &ctx);

        let mut assignments = Vec::new();
        for (key, value) in values {
            let key = key.into();
            let field = self
                .model
                .field(&key)
                .ok_or_else(|| OrmError::unknown_field(&self.model.name, &key))?;
            let column = match &field.kind {
                FieldKind::Data(_) => field.column.clone(),
                FieldKind::ForeignKey(rel) | FieldKind::OneToOne(rel) => {
                    self.model.column_of(&rel.source_field).map(str::to_string)
                }
                _ => None,
            }
            .ok_or_else(|| {
                OrmError::FieldError(format!(
                    "Cannot update relation \"{key}\" of model \"{}\"",
                    self.model.name
                ))
            })?;
            let mut joins = Vec::new();
            let resolved = resolver.expression(&mut ctx, &value.into(), &mut joins)?;
            if resolved.aggregate || !joins.is_empty() {
                return Err(OrmError::FieldError(format!(
                    "Update of \"{key}\" may only use columns of model \"{}\"",
                    self.model.name
                )));
            }
            assignments.push((column, resolved.term));
        }
        if assignments.is_empty() {
            return Ok(0);
        }

        let update = Update {
            table: self.model.table.clone(),
            assignments,
            where_clause: self.write_filter(select),
        };
        let (sql, params) = SqlCompiler::new(db.dialect()).compile_update(&update);
        self.execute(db, &sql, &params).await
    }

    /// Deletes every matching row; returns rows affected.
    pub async fn delete(&self, db: &dyn DbExecutor) -> OrmResult<u64> {
        if self.empty {
            return Ok(0);
        }
        let select = self.select_statement(Columns::Records)?;
        let delete = Delete {
            table: self.model.table.clone(),
            where_clause: self.write_filter(select),
        };
        let (sql, params) = SqlCompiler::new(db.dialect()).compile_delete(&delete);
        self.execute(db, &sql, &params).await
    }

    /// Fetches rows linked to `owner_pks` through `m2m`, paired with the key
    /// of the owner each row belongs to. Queued prefetches run on the rows.
    pub(crate) async fn fetch_m2m(
        &self,
        db: &dyn DbExecutor,
        m2m: &ManyToManyMeta,
        owner_pks: &[Value],
    ) -> OrmResult<Vec<(Value, Record)>> {
        if self.empty || owner_pks.is_empty() {
            return Ok(Vec::new());
        }
        let select = self.m2m_select(m2m, owner_pks)?;
        let mut records = self.fetch_records(db, &select).await?;
        self.run_prefetch(db, &mut records).await?;
        Ok(records
            .into_iter()
            .map(|mut record| {
                let owner = record.take(BACKWARD_KEY_ALIAS).unwrap_or(Value::Null);
                (owner, record)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{FieldDef, FieldType};
    use crate::model::ModelDef;
    use crate::query::expressions::functions::{count, length, random};
    use crate::query::expressions::subquery::{outer_ref, subquery};

    fn registry() -> Arc<Registry> {
        Registry::builder()
            .register(
                ModelDef::new("Tournament")
                    .field(FieldDef::new("id", FieldType::IntField).primary_key())
                    .field(FieldDef::new("name", FieldType::TextField)),
            )
            .register(
                ModelDef::new("Event")
                    .field(FieldDef::new("id", FieldType::IntField).primary_key())
                    .field(FieldDef::new("name", FieldType::TextField))
                    .field(FieldDef::new("rating", FieldType::IntField))
                    .field(FieldDef::foreign_key("tournament", "Tournament"))
                    .field(FieldDef::many_to_many("participants", "Team").related_name("events"))
                    .ordering(["name"]),
            )
            .register(
                ModelDef::new("Team")
                    .field(FieldDef::new("id", FieldType::IntField).primary_key())
                    .field(FieldDef::new("name", FieldType::TextField)),
            )
            .build()
            .unwrap()
    }

    fn sql(qs: &QuerySet) -> String {
        qs.sql(Dialect::SQLite).unwrap().0
    }

    #[test]
    fn test_plain_select_uses_model_ordering() {
        let reg = registry();
        assert_eq!(
            sql(&reg.query("Event").unwrap()),
            "SELECT \"event\".\"id\",\"event\".\"name\",\"event\".\"rating\",\"event\".\"tournament_id\" \
             FROM \"event\" ORDER BY \"event\".\"name\" ASC"
        );
    }

    #[test]
    fn test_explicit_ordering_replaces_default() {
        let reg = registry();
        let s = sql(&reg.query("Event").unwrap().order_by(["-rating"]));
        assert!(s.ends_with("ORDER BY \"event\".\"rating\" DESC"));
        assert!(!s.contains("\"event\".\"name\" ASC"));
    }

    #[test]
    fn test_builders_do_not_mutate_the_source() {
        let reg = registry();
        let base = reg.query("Tournament").unwrap();
        let filtered = base.clone().filter(Q::new("name", "x"));
        assert!(!sql(&base).contains("WHERE"));
        assert!(sql(&filtered).contains("WHERE \"tournament\".\"name\"=?"));
    }

    #[test]
    fn test_aggregate_annotation_groups_and_filters_in_having() {
        let reg = registry();
        let qs = reg
            .query("Tournament")
            .unwrap()
            .annotate("events_count", count("events"))
            .filter(Q::new("events_count__gte", 1));
        assert_eq!(
            sql(&qs),
            "SELECT \"tournament\".\"id\",\"tournament\".\"name\",COUNT(\"tournament__events\".\"id\") \"events_count\" \
             FROM \"tournament\" LEFT OUTER JOIN \"event\" \"tournament__events\" \
             ON \"tournament__events\".\"tournament_id\"=\"tournament\".\"id\" \
             GROUP BY \"tournament\".\"id\" HAVING COUNT(\"tournament__events\".\"id\")>=?"
        );
    }

    #[test]
    fn test_explicit_group_by_wins() {
        let reg = registry();
        let qs = reg
            .query("Event")
            .unwrap()
            .annotate("n", count("id"))
            .group_by(["tournament"]);
        assert!(sql(&qs).contains("GROUP BY \"event\".\"tournament_id\""));
    }

    #[test]
    fn test_annotation_name_clash() {
        let reg = registry();
        let err = reg
            .query("Event")
            .unwrap()
            .annotate("name", length(Expression::f("name")))
            .sql(Dialect::SQLite)
            .unwrap_err();
        assert!(matches!(err, OrmError::FieldError(_)));
    }

    #[test]
    fn test_order_by_annotation_and_random() {
        let reg = registry();
        let qs = reg
            .query("Tournament")
            .unwrap()
            .annotate("name_length", length(Expression::f("name")))
            .order_by(["-name_length"]);
        assert!(sql(&qs).ends_with("ORDER BY \"name_length\" DESC"));

        let random_order = reg.query("Tournament").unwrap().order_by([random()]);
        assert!(sql(&random_order).ends_with("ORDER BY RANDOM() ASC"));
    }

    #[test]
    fn test_reverse() {
        let reg = registry();
        let s = sql(&reg.query("Tournament").unwrap().reverse());
        assert!(s.ends_with("ORDER BY \"tournament\".\"id\" DESC"));
        let s = sql(&reg.query("Event").unwrap().reverse());
        assert!(s.ends_with("ORDER BY \"event\".\"name\" DESC"));
        let s = sql(&reg.query("Event").unwrap().order_by(["-rating"]).reverse());
        assert!(s.ends_with("ORDER BY \"event\".\"rating\" ASC"));
    }

    #[test]
    fn test_offset_without_limit_per_dialect() {
        let reg = registry();
        let qs = reg.query("Tournament").unwrap().offset(10);
        assert!(sql(&qs).ends_with("LIMIT 1000000 OFFSET 10"));
        let (pg, _) = qs.sql(Dialect::PostgreSQL).unwrap();
        assert!(pg.ends_with("OFFSET 10"));
        assert!(!pg.contains("LIMIT"));
    }

    #[test]
    fn test_exclude_and_none() {
        let reg = registry();
        let qs = reg.query("Tournament").unwrap().exclude(Q::new("name", "x"));
        assert!(sql(&qs).contains("WHERE NOT (\"tournament\".\"name\"=?)"));
        let none = reg.query("Tournament").unwrap().none();
        assert!(sql(&none).contains("WHERE 1=0"));
    }

    #[test]
    fn test_join_deduplication_across_filters() {
        let reg = registry();
        let qs = reg
            .query("Event")
            .unwrap()
            .filter(Q::new("tournament__name", "a"))
            .filter(Q::new("tournament__id__gt", 1))
            .order_by(["tournament__name"]);
        assert_eq!(sql(&qs).matches("LEFT OUTER JOIN").count(), 1);
    }

    #[test]
    fn test_correlated_subquery_annotation() {
        let reg = registry();
        let latest = reg
            .query("Event")
            .unwrap()
            .filter(Q::new("tournament", outer_ref("pk")))
            .order_by(["-id"])
            .limit(1)
            .only(["name"]);
        let qs = reg.query("Tournament").unwrap().annotate("latest", subquery(latest));
        assert_eq!(
            sql(&qs),
            "SELECT \"tournament\".\"id\",\"tournament\".\"name\",\
             (SELECT \"event\".\"name\" \"name\" FROM \"event\" \
             WHERE \"event\".\"tournament_id\"=\"tournament\".\"id\" \
             ORDER BY \"event\".\"id\" DESC LIMIT 1) \"latest\" FROM \"tournament\""
        );
    }

    #[test]
    fn test_subquery_on_same_table_is_aliased() {
        let reg = registry();
        let best = reg
            .query("Tournament")
            .unwrap()
            .filter(Q::new("name", "best"));
        let qs = reg.query("Tournament").unwrap().filter(Q::new("id__in", best));
        let s = sql(&qs);
        assert!(s.contains(
            "WHERE \"tournament\".\"id\" IN (SELECT \"U1\".\"id\" \"id\" FROM \"tournament\" \"U1\" WHERE \"U1\".\"name\"=?)"
        ));
    }

    #[test]
    fn test_subquery_must_select_one_column() {
        let reg = registry();
        let inner = reg.query("Event").unwrap().only(["id", "name"]);
        let qs = reg.query("Tournament").unwrap().filter(Q::new("id__in", inner));
        assert!(matches!(
            qs.sql(Dialect::SQLite),
            Err(OrmError::ParamsError(_))
        ));
    }

    #[test]
    fn test_m2m_prefetch_statement() {
        let reg = registry();
        let event = reg.get("Event").unwrap();
        let FieldKind::ManyToMany(m2m) = &event.field("participants").unwrap().kind else {
            panic!("participants is many-to-many");
        };
        let qs = reg.query("Team").unwrap().filter(Q::new("name__startswith", "A"));
        let select = qs.m2m_select(m2m, &[Value::Int(1), Value::Int(2)]).unwrap();
        let (s, params) = SqlCompiler::new(Dialect::SQLite).compile_select(&select);
        assert_eq!(
            s,
            "SELECT \"team\".\"id\",\"team\".\"name\",\"event_team\".\"event_id\" \"_backward_relation_key\" \
             FROM \"team\" INNER JOIN \"event_team\" ON \"event_team\".\"team_id\"=\"team\".\"id\" \
             WHERE (\"event_team\".\"event_id\" IN (?,?) AND \"team\".\"name\" LIKE ? ESCAPE '\\')"
        );
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_write_filter_indirection() {
        let reg = registry();
        let plain = reg.query("Event").unwrap().filter(Q::new("rating", 1));
        let select = plain.select_statement(Columns::Records).unwrap();
        assert!(matches!(plain.write_filter(select), Criterion::Compare { .. }));

        let joined = reg.query("Event").unwrap().filter(Q::new("tournament__name", "x"));
        let select = joined.select_statement(Columns::Records).unwrap();
        assert!(matches!(joined.write_filter(select), Criterion::InSelect { .. }));
    }
}
