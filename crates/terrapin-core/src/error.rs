//! Core error types for the terrapin ORM.
//!
//! [`OrmError`] is the single error enum shared by every crate in the
//! workspace. Variants are grouped into four families, reported by
//! [`OrmError::category`]:
//!
//! - configuration errors, raised while the model registry or schema is built
//! - field errors, raised while a query is being resolved into SQL
//! - operational errors, translated from native driver errors
//! - lookup errors (`DoesNotExist`, `MultipleObjectsReturned`, ...)
//!
//! Drivers never leak their own error types: they translate into
//! `IntegrityError`, `OperationalError` or `ConnectionError`.

use thiserror::Error;

/// The broad family an [`OrmError`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid model or schema declarations. Fatal to startup.
    Configuration,
    /// A query references fields or relations incorrectly.
    Field,
    /// The database or driver reported a failure.
    Operational,
    /// A lookup did not produce the expected number of objects.
    Lookup,
}

/// The primary error type for the terrapin ORM.
#[derive(Error, Debug)]
pub enum OrmError {
    // ── Configuration ────────────────────────────────────────────────

    /// A model, relation or schema declaration is invalid.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    // ── Query building ───────────────────────────────────────────────

    /// A query referenced an unknown field or misused a relation.
    #[error("Field error: {0}")]
    FieldError(String),

    /// Invalid arguments were passed to a query method.
    #[error("Params error: {0}")]
    ParamsError(String),

    // ── Lookup ───────────────────────────────────────────────────────

    /// A query expected exactly one result but found none.
    #[error("Object does not exist: {0}")]
    DoesNotExist(String),

    /// A query expected exactly one result but found several.
    #[error("Multiple objects returned when one expected: {0}")]
    MultipleObjectsReturned(String),

    /// A relation was accessed before it was fetched.
    #[error("No values fetched: {0}")]
    NoValuesFetched(String),

    // ── Operational ──────────────────────────────────────────────────

    /// A database integrity constraint was violated.
    #[error("Integrity error: {0}")]
    IntegrityError(String),

    /// The database failed to run a statement.
    #[error("Operational error: {0}")]
    OperationalError(String),

    /// The database could not be reached or opened.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// A transaction was committed or rolled back out of order.
    #[error("Transaction management error: {0}")]
    TransactionManagementError(String),

    // ── Serialization / IO ───────────────────────────────────────────

    /// A value could not be converted between representations.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl OrmError {
    /// Returns the family this error belongs to.
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::ConfigurationError(_) => ErrorCategory::Configuration,
            Self::FieldError(_) | Self::ParamsError(_) => ErrorCategory::Field,
            Self::DoesNotExist(_)
            | Self::MultipleObjectsReturned(_)
            | Self::NoValuesFetched(_) => ErrorCategory::Lookup,
            Self::IntegrityError(_)
            | Self::OperationalError(_)
            | Self::ConnectionError(_)
            | Self::TransactionManagementError(_)
            | Self::SerializationError(_)
            | Self::IoError(_) => ErrorCategory::Operational,
        }
    }

    /// Shorthand for a field error naming the model and the offending key.
    pub fn unknown_field(model: &str, key: &str) -> Self {
        Self::FieldError(format!("Unknown field \"{key}\" for model \"{model}\""))
    }
}

/// A convenience type alias for `Result<T, OrmError>`.
pub type OrmResult<T> = Result<T, OrmError>;
