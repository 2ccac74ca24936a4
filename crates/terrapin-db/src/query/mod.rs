//! Query building, resolution and compilation.
//!
//! - [`lookups`] - Q filter trees and lookup comparators
//! - [`expressions`] - F-references, functions, aggregates and subqueries
//! - [`context`] - the join-path stack used while resolving
//! - [`resolver`] - field paths, filters and expressions to SQL terms
//! - [`ordering`] - ORDER BY resolution
//! - [`compiler`] - SQL AST and per-dialect rendering
//! - [`queryset`] - the lazy [`QuerySet`] builder and its terminals

pub mod compiler;
pub mod context;
pub mod expressions;
pub mod lookups;
pub mod ordering;
pub mod queryset;
pub mod resolver;

pub use compiler::{Dialect, SqlCompiler};
pub use context::{Frame, QueryContext, Through};
pub use expressions::{AggregateFunc, Expression, When};
pub use lookups::{Comparator, Q};
pub use ordering::OrderBy;
pub use queryset::QuerySet;
