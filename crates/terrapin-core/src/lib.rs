//! # terrapin-core
//!
//! Core types shared by every terrapin crate: the error taxonomy, settings,
//! settings loading and logging setup. This crate has no ORM dependencies.
//!
//! ## Modules
//!
//! - [`error`] - Error types and result aliases
//! - [`settings`] - Connection and logging settings
//! - [`settings_loader`] - TOML loading and environment overrides
//! - [`logging`] - Tracing-based logging integration

pub mod error;
pub mod logging;
pub mod settings;
pub mod settings_loader;

// Re-export the most commonly used types at the crate root.
pub use error::{ErrorCategory, OrmError, OrmResult};
pub use settings::{DatabaseSettings, OrmSettings};
