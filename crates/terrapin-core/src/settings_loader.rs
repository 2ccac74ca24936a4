//! Settings loading from configuration files.
//!
//! ## Loading Order
//!
//! 1. Start with default settings.
//! 2. Load from a TOML file (overriding defaults).
//! 3. Apply environment variable overrides (highest priority).
//!
//! | Env Var | Setting |
//! |---|---|
//! | `TERRAPIN_LOG_LEVEL` | `log_level` |
//! | `TERRAPIN_DEBUG` | `debug` |
//! | `TERRAPIN_DEFAULT_CONNECTION` | `default_connection` |
//!
//! ```rust,no_run
//! use terrapin_core::settings_loader;
//!
//! let settings = settings_loader::from_toml_file_with_env("config/orm.toml").unwrap();
//! ```

use std::path::Path;

use crate::error::OrmError;
use crate::settings::OrmSettings;

/// Loads settings from a TOML string.
///
/// Missing keys keep their default values.
///
/// # Errors
///
/// Returns a configuration error if the TOML is malformed.
pub fn from_toml_str(toml_str: &str) -> Result<OrmSettings, OrmError> {
    toml::from_str(toml_str)
        .map_err(|e| OrmError::ConfigurationError(format!("Failed to parse TOML: {e}")))
}

/// Loads settings from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the TOML is malformed.
pub fn from_toml_file(path: impl AsRef<Path>) -> Result<OrmSettings, OrmError> {
    let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
        OrmError::ConfigurationError(format!(
            "Failed to read TOML file '{}': {e}",
            path.as_ref().display()
        ))
    })?;
    from_toml_str(&content)
}

/// Loads settings from a TOML file and then applies environment overrides.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the TOML is malformed.
pub fn from_toml_file_with_env(path: impl AsRef<Path>) -> Result<OrmSettings, OrmError> {
    let mut settings = from_toml_file(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Applies `TERRAPIN_*` environment variable overrides.
pub fn apply_env_overrides(settings: &mut OrmSettings) {
    if let Ok(val) = std::env::var("TERRAPIN_LOG_LEVEL") {
        settings.log_level = val;
    }

    if let Ok(val) = std::env::var("TERRAPIN_DEBUG") {
        settings.debug = matches!(val.to_lowercase().as_str(), "true" | "1" | "yes");
    }

    if let Ok(val) = std::env::var("TERRAPIN_DEFAULT_CONNECTION") {
        settings.default_connection = val;
    }
}
