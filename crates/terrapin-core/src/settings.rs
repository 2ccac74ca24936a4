//! Settings for the terrapin ORM.
//!
//! [`OrmSettings`] holds named database connections plus the logging knobs.
//! Values are normally loaded with [`settings_loader`](crate::settings_loader)
//! from a TOML file; every field has a sensible default.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The name of the connection used when none is specified.
pub const DEFAULT_CONNECTION: &str = "default";

/// Database connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// The database engine (`sqlite`, `postgres`, `mysql`).
    pub engine: String,
    /// The database name (or file path / `:memory:` for SQLite).
    pub name: String,
    /// The database user.
    pub user: String,
    /// The database password.
    pub password: String,
    /// The database host.
    pub host: String,
    /// The database port.
    pub port: u16,
    /// Additional engine-specific options.
    pub options: HashMap<String, String>,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            engine: "sqlite".to_string(),
            name: ":memory:".to_string(),
            user: String::new(),
            password: String::new(),
            host: String::new(),
            port: 0,
            options: HashMap::new(),
        }
    }
}

/// The complete set of ORM settings.
///
/// # Examples
///
/// ```
/// use terrapin_core::settings::OrmSettings;
///
/// let settings = OrmSettings::default();
/// assert_eq!(settings.default_connection, "default");
/// assert!(settings.connection("default").is_some());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrmSettings {
    /// Named database connections.
    pub connections: HashMap<String, DatabaseSettings>,
    /// Which entry of `connections` queries use by default.
    pub default_connection: String,
    /// Tracing filter directive (e.g. `info`, `terrapin=debug`).
    pub log_level: String,
    /// Pretty log output instead of JSON.
    pub debug: bool,
    /// Whether the application should create tables on startup.
    pub generate_schemas: bool,
}

impl Default for OrmSettings {
    fn default() -> Self {
        let mut connections = HashMap::new();
        connections.insert(DEFAULT_CONNECTION.to_string(), DatabaseSettings::default());
        Self {
            connections,
            default_connection: DEFAULT_CONNECTION.to_string(),
            log_level: "info".to_string(),
            debug: false,
            generate_schemas: false,
        }
    }
}

impl OrmSettings {
    /// Returns the connection settings registered under `name`.
    pub fn connection(&self, name: &str) -> Option<&DatabaseSettings> {
        self.connections.get(name)
    }

    /// Returns the settings of the default connection.
    pub fn default_database(&self) -> Option<&DatabaseSettings> {
        self.connection(&self.default_connection)
    }
}
