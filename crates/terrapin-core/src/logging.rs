//! Logging integration.
//!
//! Provides a helper for configuring [`tracing`]-based logging from
//! [`OrmSettings`](crate::settings::OrmSettings) and for creating per-query
//! spans. Executed statements are logged under the [`DB_TARGET`] target.

use crate::settings::OrmSettings;

/// Tracing target used for every statement sent to a database.
pub const DB_TARGET: &str = "terrapin::db";

/// Sets up the global tracing subscriber based on the given settings.
///
/// The filter is read from `settings.log_level`. In debug mode a pretty,
/// human-readable format is used; otherwise structured JSON.
///
/// Installing a second subscriber is a no-op.
pub fn setup_logging(settings: &OrmSettings) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&settings.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if settings.debug {
        fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .pretty()
            .try_init()
            .ok();
    } else {
        fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .try_init()
            .ok();
    }
}

/// Creates a tracing span covering the execution of one query chain.
///
/// ```
/// use terrapin_core::logging::query_span;
///
/// let span = query_span("Tournament");
/// let _guard = span.enter();
/// tracing::debug!("resolving filters");
/// ```
pub fn query_span(model: &str) -> tracing::Span {
    tracing::debug_span!("query", model = model)
}
