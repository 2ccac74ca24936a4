//! # terrapin-db
//!
//! The ORM layer of terrapin: model metadata, the relation-aware query
//! builder, the prefetch engine and the schema generator. Database access goes
//! through the [`DbExecutor`] trait; drivers live in `terrapin-db-backends`.
//!
//! ## Architecture
//!
//! Models are declared with [`ModelDef`](model::ModelDef) and validated into a
//! [`Registry`](registry::Registry), which wires up reverse relations and
//! junction tables. A [`QuerySet`](query::QuerySet) accumulates filters and
//! annotations without touching the database. When a terminal method runs,
//! field paths are resolved against a [`QueryContext`](query::QueryContext)
//! stack into joins and criteria, the [`SqlCompiler`](query::SqlCompiler)
//! renders the statement for the executor's dialect, and rows come back as
//! [`Record`](record::Record)s whose relation slots the
//! [`prefetch`] engine fills.
//!
//! ## Module Overview
//!
//! - [`value`] / [`row`] - backend-agnostic values and result rows
//! - [`fields`] / [`model`] / [`registry`] - model declaration and metadata
//! - [`record`] - fetched instances and relation slots
//! - [`query`] - Q trees, expressions, resolution, compilation, QuerySet
//! - [`prefetch`] - batched, concurrent relation loading
//! - [`schema`] - dependency-ordered CREATE TABLE generation
//! - [`executor`] / [`transactions`] - the database seam and write helpers

#![allow(clippy::too_many_lines)]
#![allow(clippy::format_push_string)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::match_same_arms)]
// significant_drop_tightening: false positives with async Mutex guards
#![allow(clippy::significant_drop_tightening)]

pub mod executor;
pub mod fields;
pub mod model;
pub mod prefetch;
pub mod query;
pub mod record;
pub mod registry;
pub mod row;
pub mod schema;
pub mod transactions;
pub mod value;

// Re-export the most commonly used types at the crate root.
pub use executor::{
    add_m2m, bulk_create, clear_m2m, delete_record, insert_record, remove_m2m, save_record,
    Capabilities, DbExecutor, QueryResult, StatementCache,
};
pub use fields::{FieldDef, FieldType, OnDelete};
pub use model::{FieldKind, FieldMeta, Model, ModelDef, ModelMeta};
pub use prefetch::{fetch_related, Prefetch};
pub use query::expressions::{outer_ref, subquery};
pub use query::{AggregateFunc, Dialect, Expression, OrderBy, QuerySet, SqlCompiler, When, Q};
pub use record::{Record, Related, RelationState};
pub use registry::{Registry, RegistryBuilder};
pub use row::{FromValue, Row};
pub use schema::{generate_schema, generate_schema_sql, SchemaOptions};
pub use transactions::{atomic, TransactionManager};
pub use value::Value;
