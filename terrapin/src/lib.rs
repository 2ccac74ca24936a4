//! # terrapin
//!
//! An async ORM: declare models, build relation-aware queries, prefetch
//! related rows in batches and create the schema in dependency order.
//!
//! This is the meta-crate that re-exports the sub-crates. [`init`] wires
//! settings, logging and the default connection together:
//!
//! ```no_run
//! use terrapin::prelude::*;
//!
//! # async fn demo() -> OrmResult<()> {
//! let registry = Registry::builder()
//!     .register(
//!         ModelDef::new("Tournament")
//!             .field(FieldDef::new("id", FieldType::IntField).primary_key())
//!             .field(FieldDef::new("name", FieldType::TextField)),
//!     )
//!     .build()?;
//! let settings = OrmSettings {
//!     generate_schemas: true,
//!     ..OrmSettings::default()
//! };
//! let db = terrapin::init(&settings, &registry).await?;
//! let open = registry
//!     .query("Tournament")?
//!     .filter(Q::new("name__icontains", "open"))
//!     .all(db.as_ref())
//!     .await?;
//! # let _ = open;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

/// Errors, settings and logging.
pub use terrapin_core as core;

/// Models, queries, prefetching and schema generation.
pub use terrapin_db as db;

/// Database drivers.
pub use terrapin_db_backends as db_backends;

/// Test database and query-count assertions.
#[cfg(feature = "testing")]
pub use terrapin_test as test;

use terrapin_core::logging::{setup_logging, DB_TARGET};
use terrapin_core::{OrmError, OrmResult, OrmSettings};
use terrapin_db::executor::DbExecutor;
use terrapin_db::registry::Registry;
use terrapin_db::schema::generate_schema;

/// Commonly used items.
pub mod prelude {
    pub use terrapin_core::{OrmError, OrmResult, OrmSettings};
    pub use terrapin_db::query::expressions::{count, outer_ref, subquery};
    pub use terrapin_db::{
        atomic, DbExecutor, Expression, FieldDef, FieldType, Model, ModelDef, OnDelete, OrderBy,
        Prefetch, QuerySet, Record, Registry, Value, Q,
    };
}

/// Installs logging, opens the default connection and, when
/// `generate_schemas` is set, creates any missing tables.
pub async fn init(settings: &OrmSettings, registry: &Registry) -> OrmResult<Arc<dyn DbExecutor>> {
    setup_logging(settings);
    let database = settings.default_database().ok_or_else(|| {
        OrmError::ConfigurationError(format!(
            "Default connection \"{}\" is not configured",
            settings.default_connection
        ))
    })?;
    let db = terrapin_db_backends::connect(database)?;
    tracing::info!(
        target: DB_TARGET,
        engine = %database.engine,
        models = registry.len(),
        "connected"
    );
    if settings.generate_schemas {
        generate_schema(db.as_ref(), registry, true).await?;
    }
    Ok(db)
}
