//! Error types for pooled-db.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Statement-level errors (binding, cardinality, database) are returned to the
//! immediate caller; pool and migration errors abort the enclosing startup or
//! maintenance operation.

use std::time::Duration;
use thiserror::Error;

/// Distinguishes the two ways a sole-row fetch can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    NoRows,
    MultipleRows,
}

impl std::fmt::Display for Cardinality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoRows => write!(f, "query returned no rows"),
            Self::MultipleRows => write!(f, "query returned more than one row"),
        }
    }
}

/// Why a foreground migration unit was rolled back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationFailureReason {
    /// The apply function returned an error.
    Apply(String),
    /// The validation predicate returned false.
    Invalid,
    /// The background apply function returned an error.
    Background(String),
    /// The one-time data loader returned an error.
    DataLoad(String),
}

impl std::fmt::Display for MigrationFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Apply(msg) => write!(f, "apply failed: {msg}"),
            Self::Invalid => write!(f, "validation returned false"),
            Self::Background(msg) => write!(f, "background apply failed: {msg}"),
            Self::DataLoad(msg) => write!(f, "data load failed: {msg}"),
        }
    }
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Undefined parameter: '{name}' is referenced but no value was supplied")]
    UndefinedParameter { name: String },

    #[error("Binding error: {message}")]
    Binding { message: String },

    #[error("Cardinality error: {kind}")]
    Cardinality { kind: Cardinality },

    #[error("Pool exhausted: no connection became available within {waited_ms}ms")]
    PoolExhausted { waited_ms: u64 },

    #[error("Pool is closed")]
    PoolClosed,

    #[error("Migration {sequence} failed: {reason}")]
    MigrationFailed {
        sequence: i64,
        reason: MigrationFailureReason,
    },

    #[error("Foreground migrations exceeded the {timeout:?} timeout")]
    MigrationTimeout { timeout: Duration },

    #[error(
        "Database is ahead of local migrations: state records sequence {applied} but only {discovered} units were discovered"
    )]
    DatabaseAhead { applied: i64, discovered: usize },

    #[error("Converter error for type '{type_name}': {message}")]
    Converter { type_name: String, message: String },

    #[error("Transaction error: {message}")]
    Transaction { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
    },

    #[error("I/O error reading {path}: {message}")]
    Io { path: String, message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create an undefined named parameter error.
    pub fn undefined_parameter(name: impl Into<String>) -> Self {
        Self::UndefinedParameter { name: name.into() }
    }

    /// Create a binding syntax or shape error.
    pub fn binding(message: impl Into<String>) -> Self {
        Self::Binding {
            message: message.into(),
        }
    }

    /// Create a cardinality error for a sole-row fetch.
    pub fn cardinality(kind: Cardinality) -> Self {
        Self::Cardinality { kind }
    }

    /// Create a pool exhaustion error.
    pub fn pool_exhausted(waited: Duration) -> Self {
        Self::PoolExhausted {
            waited_ms: waited.as_millis() as u64,
        }
    }

    /// Create a migration failure error.
    pub fn migration_failed(sequence: i64, reason: MigrationFailureReason) -> Self {
        Self::MigrationFailed { sequence, reason }
    }

    /// Create a converter error.
    pub fn converter(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Converter {
            type_name: type_name.into(),
            message: message.into(),
        }
    }

    /// Create a transaction misuse error.
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
        }
    }

    /// Create an I/O error for a file path.
    pub fn io(path: impl AsRef<std::path::Path>, err: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            message: err.to_string(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// Check if this error leaves the underlying link unusable.
    ///
    /// Only consulted when the pool is configured with `close_on_fatal`.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::PoolExhausted { .. } | Self::MigrationTimeout { .. }
        )
    }

    /// Check if this error came from parameter binding.
    pub fn is_binding(&self) -> bool {
        matches!(self, Self::UndefinedParameter { .. } | Self::Binding { .. })
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::configuration(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(db_err.message(), code)
            }
            sqlx::Error::RowNotFound => DbError::cardinality(Cardinality::NoRows),
            sqlx::Error::PoolTimedOut => DbError::pool_exhausted(Duration::ZERO),
            sqlx::Error::PoolClosed => DbError::PoolClosed,
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::TypeNotFound { type_name } => DbError::converter(
                type_name.to_string(),
                "type not found in the database",
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::database(format!("Column not found: {}", col), None)
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::connection(
                "Database worker crashed",
                "Reconnect to the database",
            ),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
