//! Error types for the aggregation engine

use thiserror::Error;

/// Main error type for the aggregation engine
#[derive(Error, Debug)]
pub enum Error {
    /// Two quantities (or a quantity and a target unit) live in different
    /// unit domains, or one side has a unit and the other does not
    #[error("Incompatible units: {from} cannot be combined with {to}")]
    IncompatibleUnit {
        /// Unit of the left-hand side ("none" when unit-less)
        from: String,
        /// Unit of the right-hand side ("none" when unit-less)
        to: String,
    },

    /// Statistic name is not registered under any alias
    #[error("Unknown statistic: {0}")]
    UnknownStatistic(String),

    /// Operation is not defined for this statistic
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Period could not be parsed or is zero-length
    #[error("Invalid period: {0}")]
    InvalidPeriod(String),

    /// Supporting data is malformed or cannot be merged
    #[error("Supporting data error: {0}")]
    SupportingData(String),

    /// A partial record was routed to a combined key it does not belong to
    #[error("Mismatched record: {0}")]
    MismatchedRecord(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build an `IncompatibleUnit` error from two optional unit labels
    pub(crate) fn incompatible(from: Option<impl ToString>, to: Option<impl ToString>) -> Self {
        Error::IncompatibleUnit {
            from: from.map_or_else(|| "none".to_string(), |u| u.to_string()),
            to: to.map_or_else(|| "none".to_string(), |u| u.to_string()),
        }
    }
}

/// Validation errors
///
/// Raised while checking configuration values before an aggregator is built.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Value is out of allowed range
    #[error("{field} value {value} is out of range [{min}, {max}]")]
    OutOfRange {
        /// Field name being validated
        field: String,
        /// The invalid value
        value: String,
        /// Minimum allowed value
        min: String,
        /// Maximum allowed value
        max: String,
    },

    /// Required field is missing
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Invalid format
    #[error("Invalid format for {field}: {message}")]
    InvalidFormat {
        /// Field name being validated
        field: String,
        /// Description of the format error
        message: String,
    },
}

impl From<ValidationError> for Error {
    fn from(e: ValidationError) -> Self {
        Error::Configuration(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
