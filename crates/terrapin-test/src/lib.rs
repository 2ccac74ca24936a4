//! # terrapin-test
//!
//! Testing utilities for terrapin. Provides [`TestDatabase`], an in-memory
//! SQLite executor that counts and records the statements it runs, query
//! count assertions for catching N+1 patterns, and the model fixtures shared
//! by the integration tests.

#![allow(clippy::doc_markdown)]

pub mod assert_queries;
pub mod fixtures;
pub mod test_database;

pub use assert_queries::{assert_max_queries, assert_num_queries};
pub use fixtures::{create, registry};
pub use test_database::TestDatabase;
