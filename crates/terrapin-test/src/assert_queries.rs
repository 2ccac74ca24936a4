//! Query counting assertions.
//!
//! [`assert_num_queries`] runs an async closure against a [`TestDatabase`] and
//! asserts how many statements it executed, which is how prefetch batching is
//! checked for N+1 regressions. On failure the message lists the statements.

use std::future::Future;

use crate::test_database::TestDatabase;

fn report(db: &TestDatabase) -> String {
    db.statements()
        .iter()
        .enumerate()
        .map(|(i, sql)| format!("\n  {}. {sql}", i + 1))
        .collect()
}

/// Asserts that exactly `expected_count` statements run during `f`.
///
/// # Panics
///
/// Panics if the count differs.
pub async fn assert_num_queries<F, Fut, T>(db: &TestDatabase, expected_count: usize, f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    db.reset_query_count();
    let out = f().await;
    let actual = db.query_count();
    assert!(
        actual == expected_count,
        "Expected {expected_count} SQL queries, but {actual} were executed:{}",
        report(db)
    );
    out
}

/// Asserts that at most `max_count` statements run during `f`.
///
/// # Panics
///
/// Panics if more statements run.
pub async fn assert_max_queries<F, Fut, T>(db: &TestDatabase, max_count: usize, f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    db.reset_query_count();
    let out = f().await;
    let actual = db.query_count();
    assert!(
        actual <= max_count,
        "Expected at most {max_count} SQL queries, but {actual} were executed:{}",
        report(db)
    );
    out
}
