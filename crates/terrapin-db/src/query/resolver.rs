//! Resolution of filter keys, field paths and expressions into SQL terms.
//!
//! A [`Resolver`] works against a [`QueryContext`]. Every relation hop in a
//! `__` path joins the related table (once per alias) and pushes a frame for
//! the rest of the path; the frame is popped again before the resolver
//! returns, whether resolution succeeded or not.
//!
//! Filters resolve into a [`QueryModifier`]: a WHERE criterion, a HAVING
//! criterion (for conditions on aggregates) and the joins both need.

use std::collections::BTreeMap;

use terrapin_core::{OrmError, OrmResult};

use crate::model::FieldKind;
use crate::query::compiler::{push_join, CompareOp, Criterion, Join, Select, TableRef, Term};
use crate::query::context::{Frame, QueryContext};
use crate::query::expressions::subquery::resolve_outer_ref;
use crate::query::expressions::Expression;
use crate::query::lookups::{split_key, Connector, Q, LOOKUP_SEP};
use crate::registry::Registry;

/// A resolved expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub term: Term,
    /// Whether the term contains an aggregate and so belongs in HAVING.
    pub aggregate: bool,
}

impl Resolved {
    const fn plain(term: Term) -> Self {
        Self {
            term,
            aggregate: false,
        }
    }
}

/// WHERE and HAVING criteria plus the joins they need.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryModifier {
    pub where_clause: Criterion,
    pub having: Criterion,
    pub joins: Vec<Join>,
}

impl QueryModifier {
    pub fn new(where_clause: Criterion, having: Criterion, joins: Vec<Join>) -> Self {
        Self {
            where_clause,
            having,
            joins,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.where_clause.is_empty() && self.having.is_empty()
    }

    fn merge_joins(mut self, joins: Vec<Join>) -> Self {
        for join in joins {
            push_join(&mut self.joins, join);
        }
        self
    }

    #[must_use]
    pub fn and(self, other: Self) -> Self {
        let Self {
            where_clause,
            having,
            joins,
        } = other;
        Self {
            where_clause: self.where_clause.and(where_clause),
            having: self.having.and(having),
            joins: self.joins,
        }
        .merge_joins(joins)
    }

    /// Disjunction. When either side has a HAVING part the whole
    /// `(where AND having) OR (where AND having)` moves into HAVING.
    #[must_use]
    pub fn or(self, other: Self) -> Self {
        if other.is_empty() {
            return self.merge_joins(other.joins);
        }
        if self.is_empty() {
            return other.merge_joins(self.joins);
        }
        let Self {
            where_clause,
            having,
            joins,
        } = other;
        if self.having.is_empty() && having.is_empty() {
            return Self::new(self.where_clause.or(where_clause), Criterion::Empty, self.joins)
                .merge_joins(joins);
        }
        let left = self.where_clause.and(self.having);
        let right = where_clause.and(having);
        Self::new(Criterion::Empty, left.or(right), self.joins).merge_joins(joins)
    }

    /// Negation. With a HAVING part the conjunction of both is negated as a
    /// whole inside HAVING.
    #[must_use]
    pub fn invert(self) -> Self {
        if self.having.is_empty() {
            Self::new(self.where_clause.negate(), Criterion::Empty, self.joins)
        } else {
            let both = self.where_clause.and(self.having);
            Self::new(Criterion::Empty, both.negate(), self.joins)
        }
    }

    /// Adds the criteria and joins to a statement.
    pub fn apply(self, select: &mut Select) {
        for join in self.joins {
            select.add_join(join);
        }
        let where_clause = std::mem::take(&mut select.where_clause);
        select.where_clause = where_clause.and(self.where_clause);
        let having = std::mem::take(&mut select.having);
        select.having = having.and(self.having);
    }
}

/// Resolves paths and expressions for one query level.
///
/// Annotation names are only visible at the depth the resolver was created
/// at, i.e. on the query's own base table.
#[derive(Debug, Clone, Copy)]
pub struct Resolver<'a> {
    registry: &'a Registry,
    annotations: &'a BTreeMap<String, Resolved>,
    base_depth: usize,
}

impl<'a> Resolver<'a> {
    pub fn new(
        registry: &'a Registry,
        annotations: &'a BTreeMap<String, Resolved>,
        ctx: &QueryContext,
    ) -> Self {
        Self {
            registry,
            annotations,
            base_depth: ctx.depth(),
        }
    }

    pub const fn registry(&self) -> &'a Registry {
        self.registry
    }

    fn annotation(&self, ctx: &QueryContext, segments: &[&str]) -> Option<&'a Resolved> {
        match segments {
            [name] if ctx.depth() == self.base_depth => self.annotations.get(*name),
            _ => None,
        }
    }

    /// Resolves a Q tree.
    pub fn filter(&self, ctx: &mut QueryContext, q: &Q) -> OrmResult<QueryModifier> {
        let modifier = match q.connector() {
            None => {
                let mut acc = QueryModifier::default();
                for (key, value) in q.filters() {
                    acc = acc.and(self.filter_key(ctx, key, value)?);
                }
                acc
            }
            Some(connector) => {
                let mut acc = QueryModifier::default();
                for child in q.children() {
                    let resolved = self.filter(ctx, child)?;
                    acc = match connector {
                        Connector::And => acc.and(resolved),
                        Connector::Or => acc.or(resolved),
                    };
                }
                acc
            }
        };
        Ok(if q.is_negated() {
            modifier.invert()
        } else {
            modifier
        })
    }

    fn filter_key(
        &self,
        ctx: &mut QueryContext,
        key: &str,
        value: &Expression,
    ) -> OrmResult<QueryModifier> {
        let (path, comparator) = split_key(key);
        let mut joins = Vec::new();
        let rhs = self.expression(ctx, value, &mut joins)?;

        if let Some(annotation) = self.annotation(ctx, &path) {
            let criterion = comparator.criterion(annotation.term.clone(), rhs.term, true)?;
            return Ok(if annotation.aggregate || rhs.aggregate {
                QueryModifier::new(Criterion::Empty, criterion, joins)
            } else {
                QueryModifier::new(criterion, Criterion::Empty, joins)
            });
        }

        let (term, text_column) = self.walk(ctx, &path, &mut joins, |ctx, name, _| {
            let frame = ctx.top();
            let model = &frame.model;
            let field = model
                .field(name)
                .ok_or_else(|| OrmError::unknown_field(&model.name, key))?;
            match &field.kind {
                FieldKind::Data(_) => {
                    let column = field.column.as_deref().unwrap_or(&field.name);
                    Ok((Term::column(frame.table.ident(), column), field.is_text()))
                }
                FieldKind::ForeignKey(rel) | FieldKind::OneToOne(rel) => {
                    let column = model.column_of(&rel.source_field).unwrap_or(&rel.source_field);
                    Ok((Term::column(frame.table.ident(), column), false))
                }
                _ => Err(OrmError::FieldError(format!(
                    "Filtering by relation \"{name}\" of model \"{}\" is not possible, \
                     use a nested field such as \"{name}__pk\" in \"{key}\"",
                    model.name
                ))),
            }
        })?;
        let criterion = comparator.criterion(term, rhs.term, text_column)?;
        Ok(if rhs.aggregate {
            QueryModifier::new(Criterion::Empty, criterion, joins)
        } else {
            QueryModifier::new(criterion, Criterion::Empty, joins)
        })
    }

    /// Resolves a field path to a column. Inside aggregates a to-many
    /// relation stands for the related table's primary key.
    pub fn field(
        &self,
        ctx: &mut QueryContext,
        path: &str,
        joins: &mut Vec<Join>,
        in_aggregate: bool,
    ) -> OrmResult<Resolved> {
        let segments: Vec<&str> = path.split(LOOKUP_SEP).collect();
        if let Some(annotation) = self.annotation(ctx, &segments) {
            return Ok(annotation.clone());
        }
        let term = self.walk(ctx, &segments, joins, |ctx, name, joins| {
            let frame = ctx.top();
            let model = &frame.model;
            let field = model
                .field(name)
                .ok_or_else(|| OrmError::unknown_field(&model.name, path))?;
            match &field.kind {
                FieldKind::Data(_) => {
                    let column = field.column.as_deref().unwrap_or(&field.name);
                    Ok(Term::column(frame.table.ident(), column))
                }
                FieldKind::ForeignKey(rel) | FieldKind::OneToOne(rel) => {
                    let column = model.column_of(&rel.source_field).unwrap_or(&rel.source_field);
                    Ok(Term::column(frame.table.ident(), column))
                }
                kind if in_aggregate => {
                    let joined = self.join_relation(ctx, name, kind, joins)?;
                    Ok(Term::column(joined.table.ident(), joined.model.pk_column()))
                }
                _ => Err(OrmError::FieldError(format!(
                    "\"{path}\" names relation \"{name}\" of model \"{}\", use a nested field",
                    model.name
                ))),
            }
        })?;
        Ok(Resolved::plain(term))
    }

    /// Resolves an expression against the current frame.
    pub fn expression(
        &self,
        ctx: &mut QueryContext,
        expr: &Expression,
        joins: &mut Vec<Join>,
    ) -> OrmResult<Resolved> {
        match expr {
            Expression::Value(v) => Ok(Resolved::plain(Term::Value(v.clone()))),
            Expression::F(path) => self.field(ctx, path, joins, false),
            Expression::OuterRef(path) => resolve_outer_ref(ctx, path).map(Resolved::plain),
            Expression::Raw(sql) => Ok(Resolved::plain(Term::Raw(sql.clone()))),
            Expression::Random => Ok(Resolved::plain(Term::Random)),
            Expression::Func { name, args } => {
                let mut terms = Vec::with_capacity(args.len());
                let mut aggregate = false;
                for arg in args {
                    let r = self.expression(ctx, arg, joins)?;
                    aggregate |= r.aggregate;
                    terms.push(r.term);
                }
                Ok(Resolved {
                    term: Term::func(name.clone(), terms),
                    aggregate,
                })
            }
            Expression::Aggregate {
                func,
                arg,
                distinct,
            } => {
                let inner = match arg.as_ref() {
                    Expression::F(path) => self.field(ctx, path, joins, true)?,
                    other => self.expression(ctx, other, joins)?,
                };
                if inner.aggregate {
                    return Err(OrmError::FieldError(format!(
                        "Cannot nest aggregates inside {}",
                        func.sql_name()
                    )));
                }
                Ok(Resolved {
                    term: Term::Func {
                        name: func.sql_name().to_string(),
                        args: vec![inner.term],
                        distinct: *distinct,
                    },
                    aggregate: true,
                })
            }
            Expression::Arith { op, left, right } => {
                let l = self.expression(ctx, left, joins)?;
                let r = self.expression(ctx, right, joins)?;
                Ok(Resolved {
                    term: Term::Arith {
                        op: *op,
                        left: Box::new(l.term),
                        right: Box::new(r.term),
                    },
                    aggregate: l.aggregate || r.aggregate,
                })
            }
            Expression::Case { whens, default } => {
                let mut aggregate = false;
                let mut branches = Vec::with_capacity(whens.len());
                for when in whens {
                    let modifier = self.filter(ctx, &when.condition)?;
                    aggregate |= !modifier.having.is_empty();
                    for join in modifier.joins {
                        push_join(joins, join);
                    }
                    let condition = modifier.where_clause.and(modifier.having);
                    let then = self.expression(ctx, &when.then, joins)?;
                    aggregate |= then.aggregate;
                    branches.push((condition, then.term));
                }
                let default = match default {
                    Some(d) => {
                        let r = self.expression(ctx, d, joins)?;
                        aggregate |= r.aggregate;
                        Some(Box::new(r.term))
                    }
                    None => None,
                };
                Ok(Resolved {
                    term: Term::Case {
                        whens: branches,
                        default,
                    },
                    aggregate,
                })
            }
            Expression::Subquery(qs) => {
                let select = qs.nested_select(ctx)?;
                Ok(Resolved::plain(Term::Subquery(Box::new(select))))
            }
        }
    }

    /// Walks the relation hops of `segments`, calling `terminal` positioned on
    /// the last hop's frame with the final segment.
    pub(crate) fn walk<R>(
        &self,
        ctx: &mut QueryContext,
        segments: &[&str],
        joins: &mut Vec<Join>,
        terminal: impl FnOnce(&mut QueryContext, &str, &mut Vec<Join>) -> OrmResult<R>,
    ) -> OrmResult<R> {
        match segments {
            [] => Err(OrmError::FieldError("Empty field path".to_string())),
            [name] => terminal(ctx, name, joins),
            [head, rest @ ..] => {
                let frame = self.enter(ctx, head, joins)?;
                ctx.scoped(frame, |ctx| self.walk(ctx, rest, joins, terminal))
            }
        }
    }

    fn enter(&self, ctx: &QueryContext, name: &str, joins: &mut Vec<Join>) -> OrmResult<Frame> {
        let model = &ctx.top().model;
        let field = model
            .field(name)
            .ok_or_else(|| OrmError::unknown_field(&model.name, name))?;
        self.join_relation(ctx, name, &field.kind, joins)
    }

    /// Joins relation `name` of the top frame and returns the frame for the
    /// related model. Joins are aliased `{parent}__{relation}` and added only
    /// once per alias.
    pub(crate) fn join_relation(
        &self,
        ctx: &QueryContext,
        name: &str,
        kind: &FieldKind,
        joins: &mut Vec<Join>,
    ) -> OrmResult<Frame> {
        let parent = ctx.top();
        let parent_ident = parent.table.ident();
        let alias = format!("{parent_ident}{LOOKUP_SEP}{name}");
        match kind {
            FieldKind::Data(_) => Err(OrmError::FieldError(format!(
                "\"{name}\" of model \"{}\" is not a relation",
                parent.model.name
            ))),
            FieldKind::ForeignKey(rel) | FieldKind::OneToOne(rel) => {
                let target = self.registry.get(&rel.target)?;
                let source = parent
                    .model
                    .column_of(&rel.source_field)
                    .unwrap_or(&rel.source_field);
                let table = TableRef::aliased(target.table.clone(), alias.as_str());
                push_join(
                    joins,
                    Join::left(
                        table.clone(),
                        Criterion::compare(
                            Term::column(alias.as_str(), target.pk_column()),
                            CompareOp::Eq,
                            Term::column(parent_ident, source),
                        ),
                    ),
                );
                Ok(Frame::new(target, table))
            }
            FieldKind::BackwardForeignKey(rel) | FieldKind::BackwardOneToOne(rel) => {
                let target = self.registry.get(&rel.target)?;
                let source = target
                    .column_of(&rel.source_field)
                    .unwrap_or(&rel.source_field)
                    .to_string();
                let table = TableRef::aliased(target.table.clone(), alias.as_str());
                push_join(
                    joins,
                    Join::left(
                        table.clone(),
                        Criterion::compare(
                            Term::column(alias.as_str(), source),
                            CompareOp::Eq,
                            Term::column(parent_ident, parent.model.pk_column()),
                        ),
                    ),
                );
                Ok(Frame::new(target, table))
            }
            FieldKind::ManyToMany(m2m) => {
                let target = self.registry.get(&m2m.target)?;
                let through_ident = match parent.joined_through(&m2m.through, &m2m.backward_key) {
                    Some(joined) => joined.ident().to_string(),
                    None => {
                        let through_alias = format!("{alias}_through");
                        push_join(
                            joins,
                            Join::left(
                                TableRef::aliased(m2m.through.clone(), through_alias.as_str()),
                                Criterion::compare(
                                    Term::column(through_alias.as_str(), m2m.backward_key.as_str()),
                                    CompareOp::Eq,
                                    Term::column(parent_ident, parent.model.pk_column()),
                                ),
                            ),
                        );
                        through_alias
                    }
                };
                let table = TableRef::aliased(target.table.clone(), alias.as_str());
                push_join(
                    joins,
                    Join::left(
                        table.clone(),
                        Criterion::compare(
                            Term::column(alias.as_str(), target.pk_column()),
                            CompareOp::Eq,
                            Term::column(through_ident, m2m.forward_key.as_str()),
                        ),
                    ),
                );
                Ok(Frame::new(target, table))
            }
        }
    }
}
