//! # terrapin-db-backends
//!
//! Database drivers implementing [`DbExecutor`]. SQLite is built in behind
//! the `sqlite` feature (on by default).
//!
//! [`connect`] picks a driver from [`DatabaseSettings::engine`]:
//!
//! ```ignore
//! let settings = DatabaseSettings::default();
//! let db = terrapin_db_backends::connect(&settings)?;
//! ```

#![allow(clippy::doc_markdown)]
#![allow(clippy::significant_drop_tightening)]

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;

use std::sync::Arc;

use terrapin_core::{DatabaseSettings, OrmError, OrmResult};
use terrapin_db::executor::DbExecutor;

/// Opens a connection for `settings`.
///
/// Unknown engines, and engines whose feature is disabled, are a
/// `ConfigurationError`.
pub fn connect(settings: &DatabaseSettings) -> OrmResult<Arc<dyn DbExecutor>> {
    match settings.engine.as_str() {
        #[cfg(feature = "sqlite")]
        "sqlite" | "sqlite3" => Ok(Arc::new(SqliteBackend::open(&settings.name)?)),
        other => Err(OrmError::ConfigurationError(format!(
            "Unsupported database engine \"{other}\""
        ))),
    }
}
