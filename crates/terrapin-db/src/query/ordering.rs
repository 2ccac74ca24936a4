//! ORDER BY terms.
//!
//! Keys follow the filter path syntax with an optional `-` prefix for
//! descending order (`-events__name`). Annotation names order by their select
//! alias. [`OrderBy::Raw`] and expression orderings such as
//! [`random`](crate::query::expressions::random) skip field resolution.

use terrapin_core::{OrmError, OrmResult};

use crate::model::FieldKind;
use crate::query::compiler::{Join, OrderTerm, Term};
use crate::query::context::QueryContext;
use crate::query::expressions::Expression;
use crate::query::lookups::LOOKUP_SEP;
use crate::query::resolver::Resolver;

/// One ordering entry of a query.
#[derive(Debug, Clone)]
pub enum OrderBy {
    /// A field path, possibly through relations.
    Field { path: String, descending: bool },
    /// An arbitrary expression.
    Expr {
        expr: Expression,
        descending: bool,
    },
    /// Verbatim SQL, emitted as is.
    Raw(String),
}

impl OrderBy {
    /// Parses `"name"` / `"-name"`.
    pub fn parse(key: &str) -> Self {
        match key.strip_prefix('-') {
            Some(path) => Self::Field {
                path: path.to_string(),
                descending: true,
            },
            None => Self::Field {
                path: key.to_string(),
                descending: false,
            },
        }
    }

    /// The same ordering in the opposite direction. Raw SQL is unchanged.
    #[must_use]
    pub fn reversed(self) -> Self {
        match self {
            Self::Field { path, descending } => Self::Field {
                path,
                descending: !descending,
            },
            Self::Expr { expr, descending } => Self::Expr {
                expr,
                descending: !descending,
            },
            raw @ Self::Raw(_) => raw,
        }
    }
}

impl From<&str> for OrderBy {
    fn from(key: &str) -> Self {
        Self::parse(key)
    }
}

impl From<String> for OrderBy {
    fn from(key: String) -> Self {
        Self::parse(&key)
    }
}

/// Ascending order by an expression.
impl From<Expression> for OrderBy {
    fn from(expr: Expression) -> Self {
        Self::Expr {
            expr,
            descending: false,
        }
    }
}

/// Resolves ordering entries into ORDER BY terms, adding any joins they need.
pub fn resolve_ordering(
    resolver: &Resolver<'_>,
    ctx: &mut QueryContext,
    orderings: &[OrderBy],
    annotations: &[String],
    joins: &mut Vec<Join>,
) -> OrmResult<Vec<OrderTerm>> {
    orderings
        .iter()
        .map(|ordering| match ordering {
            OrderBy::Raw(sql) => Ok(OrderTerm {
                term: Term::Raw(sql.clone()),
                descending: false,
            }),
            OrderBy::Expr { expr, descending } => {
                let resolved = resolver.expression(ctx, expr, joins)?;
                Ok(OrderTerm {
                    term: resolved.term,
                    descending: *descending,
                })
            }
            OrderBy::Field { path, descending } => {
                if annotations.iter().any(|a| a == path) {
                    return Ok(OrderTerm {
                        term: Term::Alias(path.clone()),
                        descending: *descending,
                    });
                }
                let term = order_field(resolver, ctx, path, joins)?;
                Ok(OrderTerm {
                    term,
                    descending: *descending,
                })
            }
        })
        .collect()
}

fn order_field(
    resolver: &Resolver<'_>,
    ctx: &mut QueryContext,
    path: &str,
    joins: &mut Vec<Join>,
) -> OrmResult<Term> {
    let segments: Vec<&str> = path.split(LOOKUP_SEP).collect();
    resolver.walk(ctx, &segments, joins, |ctx, name, _| {
        let frame = ctx.top();
        let model = &frame.model;
        let field = model
            .field(name)
            .ok_or_else(|| OrmError::unknown_field(&model.name, path))?;
        match (&field.kind, field.column.as_deref()) {
            (FieldKind::Data(_), Some(column)) => Ok(Term::column(frame.table.ident(), column)),
            _ => Err(OrmError::FieldError(format!(
                "Cannot order by relation \"{name}\" of model \"{}\", order by one of its fields instead",
                model.name
            ))),
        }
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use super::*;
    use crate::fields::{FieldDef, FieldType};
    use crate::model::ModelDef;
    use crate::query::compiler::{Dialect, Select, SqlCompiler, TableRef};
    use crate::query::context::Frame;
    use crate::query::expressions::functions::random;
    use crate::registry::Registry;

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
                    .field(FieldDef::foreign_key("tournament", "Tournament")),
            )
            .build()
            .unwrap()
    }

    fn resolve(orderings: &[OrderBy], annotations: &[String]) -> OrmResult<(String, usize)> {
        let reg = registry();
        let anns = BTreeMap::new();
        let mut ctx = QueryContext::new(Frame::root(reg.get("Event").unwrap()));
        let resolver = Resolver::new(&reg, &anns, &ctx);
        let mut joins = Vec::new();
        let terms = resolve_ordering(&resolver, &mut ctx, orderings, annotations, &mut joins)?;
        assert_eq!(ctx.depth(), 1);
        let compiler = SqlCompiler::new(Dialect::SQLite);
        let sql: Vec<String> = terms
            .iter()
            .map(|o| {
                let mut select = Select::new(TableRef::new("event"));
                select.order_by.push(o.clone());
                let (sql, _) = compiler.compile_select(&select);
                sql.trim_start_matches("SELECT * FROM \"event\" ORDER BY ").to_string()
            })
            .collect();
        Ok((sql.join(","), joins.len()))
    }

    #[test]
    fn test_parse_direction() {
        assert!(matches!(OrderBy::parse("-name"), OrderBy::Field { descending: true, ref path } if path == "name"));
        assert!(matches!(OrderBy::parse("name"), OrderBy::Field { descending: false, .. }));
        assert!(matches!(
            OrderBy::parse("name").reversed(),
            OrderBy::Field { descending: true, .. }
        ));
    }

    #[test]
    fn test_field_and_relation_ordering() {
        let (sql, joins) = resolve(&["-name".into(), "tournament__name".into()], &[]).unwrap();
        assert_eq!(
            sql,
            "\"event\".\"name\" DESC,\"event__tournament\".\"name\" ASC"
        );
        assert_eq!(joins, 1);
    }

    #[test]
    fn test_order_by_relation_is_error() {
        let err = resolve(&["tournament".into()], &[]).unwrap_err();
        assert!(matches!(err, OrmError::FieldError(_)));
        assert!(resolve(&["missing".into()], &[]).is_err());
    }

    #[test]
    fn test_annotation_alias_raw_and_random() {
        let orderings = vec![
            OrderBy::parse("-score"),
            OrderBy::Raw("LENGTH(\"name\") DESC".into()),
            OrderBy::Expr {
                expr: random(),
                descending: false,
            },
        ];
        let (sql, _) = resolve(&orderings, &["score".to_string()]).unwrap();
        assert_eq!(
            sql,
            "\"score\" DESC,LENGTH(\"name\") DESC,RANDOM() ASC"
        );
    }
}
