//! Field declarations and types.
//!
//! [`FieldDef`] declares a field, [`FieldType`] its storage type or relation.

pub mod types;

pub use types::{FieldDef, FieldType, OnDelete};
