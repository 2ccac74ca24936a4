//! Query expressions: F-references, aggregates, functions and subqueries.
//!
//! # Submodules
//!
//! - [`core`] - The [`Expression`] tree, aggregates, Case/When, arithmetic
//! - [`functions`] - Builders for aggregates and scalar functions
//! - [`subquery`] - Correlated subqueries and outer references

pub mod core;
pub mod functions;
pub mod subquery;

pub use self::core::{AggregateFunc, Expression, When};
pub use self::functions::*;
pub use self::subquery::{outer_ref, subquery};
