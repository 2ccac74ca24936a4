//! Aggregate and scalar function builders.
//!
//! Each builder returns an [`Expression`] usable in annotations, filter
//! values and orderings.
//!
//! ```
//! use terrapin_db::query::expressions::functions::*;
//! use terrapin_db::query::expressions::Expression;
//!
//! // COUNT("events")
//! let events = count("events");
//!
//! // COALESCE(nickname, name, 'anon')
//! let display = coalesce(vec![
//!     Expression::f("nickname"),
//!     Expression::f("name"),
//!     Expression::value("anon"),
//! ]);
//! # let _ = (events, display);
//! ```

use super::core::{AggregateFunc, Expression};

// ═══════════════════════════════════════════════════════════════════════════
// Aggregates
// ═══════════════════════════════════════════════════════════════════════════

/// COUNT over a field path. Counting a relation counts related rows.
pub fn count(path: impl Into<String>) -> Expression {
    Expression::aggregate(AggregateFunc::Count, Expression::f(path))
}

/// COUNT(DISTINCT ...) over a field path.
pub fn count_distinct(path: impl Into<String>) -> Expression {
    Expression::aggregate_distinct(AggregateFunc::Count, Expression::f(path))
}

pub fn sum(expr: impl Into<Expression>) -> Expression {
    Expression::aggregate(AggregateFunc::Sum, expr.into())
}

pub fn avg(expr: impl Into<Expression>) -> Expression {
    Expression::aggregate(AggregateFunc::Avg, expr.into())
}

pub fn min(expr: impl Into<Expression>) -> Expression {
    Expression::aggregate(AggregateFunc::Min, expr.into())
}

pub fn max(expr: impl Into<Expression>) -> Expression {
    Expression::aggregate(AggregateFunc::Max, expr.into())
}

// ═══════════════════════════════════════════════════════════════════════════
// Text
// ═══════════════════════════════════════════════════════════════════════════

pub fn upper(expr: impl Into<Expression>) -> Expression {
    Expression::func("UPPER", vec![expr.into()])
}

pub fn lower(expr: impl Into<Expression>) -> Expression {
    Expression::func("LOWER", vec![expr.into()])
}

/// Character length. Rendered as `LENGTH`, which all three dialects accept.
pub fn length(expr: impl Into<Expression>) -> Expression {
    Expression::func("LENGTH", vec![expr.into()])
}

pub fn trim(expr: impl Into<Expression>) -> Expression {
    Expression::func("TRIM", vec![expr.into()])
}

// ═══════════════════════════════════════════════════════════════════════════
// Comparison
// ═══════════════════════════════════════════════════════════════════════════

/// COALESCE(expr1, expr2, ...) - the first non-NULL argument.
pub fn coalesce(args: Vec<Expression>) -> Expression {
    Expression::func("COALESCE", args)
}

// ═══════════════════════════════════════════════════════════════════════════
// Ordering helpers
// ═══════════════════════════════════════════════════════════════════════════

/// A random value per row, for `order_by_expr(random(), false)`.
pub const fn random() -> Expression {
    Expression::Random
}
