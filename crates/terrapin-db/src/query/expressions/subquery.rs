//! Correlated subqueries and outer references.
//!
//! A [`QuerySet`] used as an expression is compiled into a nested SELECT that
//! shares the enclosing query's context: its base table becomes a new frame on
//! top of the outer frames, and `outer_ref("field")` inside it resolves one
//! level down, against the query that embeds it.
//!
//! ```
//! use terrapin_db::query::expressions::subquery::{outer_ref, subquery};
//! # fn demo(events: terrapin_db::query::QuerySet) {
//! // latest event name per tournament
//! let latest = subquery(
//!     events
//!         .filter(terrapin_db::query::Q::new("tournament", outer_ref("pk")))
//!         .order_by(["-id"])
//!         .limit(1)
//!         .only(["name"]),
//! );
//! # let _ = latest;
//! # }
//! ```

use std::sync::Arc;

use terrapin_core::{OrmError, OrmResult};

use super::core::Expression;
use crate::model::{FieldKind, ModelMeta};
use crate::query::compiler::{TableRef, Term};
use crate::query::context::{Frame, QueryContext};
use crate::query::queryset::QuerySet;

/// Wraps a query producing a single column.
pub fn subquery(qs: QuerySet) -> Expression {
    Expression::Subquery(Box::new(qs))
}

/// A field of the query enclosing the current subquery.
pub fn outer_ref(path: impl Into<String>) -> Expression {
    Expression::OuterRef(path.into())
}

/// The frame a nested query runs on. Its table is aliased when an enclosing
/// frame already uses the same identifier.
pub(crate) fn subquery_frame(ctx: &QueryContext, model: Arc<ModelMeta>) -> Frame {
    if ctx.uses_ident(&model.table) {
        let table = TableRef::aliased(model.table.clone(), format!("U{}", ctx.depth()));
        Frame::new(model, table)
    } else {
        Frame::root(model)
    }
}

/// Resolves an outer reference against the parent frame. Only direct fields
/// of the enclosing model can be referenced.
pub(crate) fn resolve_outer_ref(ctx: &mut QueryContext, path: &str) -> OrmResult<Term> {
    ctx.with_parent(|outer| {
        let frame = outer.top();
        let model = &frame.model;
        let field = model
            .field(path)
            .ok_or_else(|| OrmError::unknown_field(&model.name, path))?;
        let column = match &field.kind {
            FieldKind::Data(_) => field.column.clone(),
            FieldKind::ForeignKey(rel) | FieldKind::OneToOne(rel) => {
                model.column_of(&rel.source_field).map(str::to_string)
            }
            _ => None,
        }
        .ok_or_else(|| {
            OrmError::FieldError(format!(
                "Outer reference \"{path}\" must name a column of model \"{}\"",
                model.name
            ))
        })?;
        Ok(Term::column(frame.table.ident(), column))
    })
    .unwrap_or_else(|| {
        Err(OrmError::FieldError(format!(
            "Outer reference \"{path}\" used outside of a subquery"
        )))
    })
}
