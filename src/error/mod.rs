use std::fmt;

use pgrx::prelude::PgSqlErrorCode;

use crate::session::Stage;

pub mod testing;

/// Main error type for pg_mvdeps
#[derive(Debug, Clone, PartialEq)]
pub enum DepsError {
    // ============ Lookup Errors (42xxx) ============
    /// Root relation absent from the catalog
    RelationNotFound {
        relation: String,
    },

    /// Caller-supplied value rejected before touching the catalog
    InvalidInput {
        parameter: String,
        value: String,
        reason: String,
    },

    // ============ Dependency Errors (54xxx) ============
    /// Dependency expansion did not settle within the configured depth
    DependencyDepthExceeded {
        depth: usize,
        max_depth: usize,
    },

    // ============ Migration Errors (55xxx) ============
    /// A drop/create/refresh statement was rejected by the server
    DdlFailed {
        stage: Stage,
        step: &'static str,
        relation: String,
        statement: String,
        reason: String,
    },

    /// Torn-down state for this root is still waiting to be restored
    SessionAlreadyActive {
        root: String,
    },

    // ============ I/O and System Errors (XX000) ============
    /// PostgreSQL catalog operation failed
    CatalogError {
        operation: String,
        pg_error: String,
    },

    /// SPI operation failed
    SpiError {
        query: String,
        error: String,
    },

    /// Serialization/deserialization failed
    SerializationError {
        message: String,
    },

    /// Configuration error (invalid GUC values)
    ConfigError {
        setting: String,
        value: String,
        reason: String,
    },

    /// Internal error (bug in extension)
    InternalError {
        message: String,
        file: &'static str,
        line: u32,
    },
}

impl DepsError {
    /// Get PostgreSQL SQLSTATE code for this error
    pub fn sqlstate(&self) -> &'static str {
        use DepsError::*;
        match self {
            RelationNotFound { .. } => "42P01", // Undefined table
            InvalidInput { .. } => "22023", // Invalid parameter value

            DependencyDepthExceeded { .. } => "54001", // Statement too complex

            DdlFailed { .. } => "55000", // Object not in prerequisite state
            SessionAlreadyActive { .. } => "55006", // Object in use

            CatalogError { .. } => "XX000",
            SpiError { .. } => "XX000",
            SerializationError { .. } => "XX000",
            ConfigError { .. } => "F0000", // Config file error
            InternalError { .. } => "XX000",
        }
    }

    /// Error code used when raising this error to the client
    pub fn error_code(&self) -> PgSqlErrorCode {
        use DepsError::*;
        match self {
            RelationNotFound { .. } => PgSqlErrorCode::ERRCODE_UNDEFINED_TABLE,
            InvalidInput { .. } => PgSqlErrorCode::ERRCODE_INVALID_PARAMETER_VALUE,
            DependencyDepthExceeded { .. } => PgSqlErrorCode::ERRCODE_STATEMENT_TOO_COMPLEX,
            DdlFailed { .. } => PgSqlErrorCode::ERRCODE_OBJECT_NOT_IN_PREREQUISITE_STATE,
            SessionAlreadyActive { .. } => PgSqlErrorCode::ERRCODE_OBJECT_IN_USE,
            ConfigError { .. } => PgSqlErrorCode::ERRCODE_CONFIG_FILE_ERROR,
            CatalogError { .. }
            | SpiError { .. }
            | SerializationError { .. }
            | InternalError { .. } => PgSqlErrorCode::ERRCODE_INTERNAL_ERROR,
        }
    }

    /// Create internal error with file/line info
    pub fn internal(message: String, file: &'static str, line: u32) -> Self {
        DepsError::InternalError { message, file, line }
    }
}

impl fmt::Display for DepsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use DepsError::*;
        match self {
            RelationNotFound { relation } => {
                write!(f, "Relation '{}' does not exist", relation)
            }
            InvalidInput { parameter, value, reason } => {
                write!(f, "Invalid value for '{}': {} (value: {})", parameter, reason, value)
            }
            DependencyDepthExceeded { depth, max_depth } => {
                write!(f, "Dependency depth {} exceeds maximum {}", depth, max_depth)
            }
            DdlFailed { stage, step, relation, statement, reason } => {
                write!(f, "{} failed at {} for '{}': {}\nStatement: {}",
                       stage, step, relation, reason,
                       clip(statement, 200))
            }
            SessionAlreadyActive { root } => {
                write!(f, "Dependents of '{}' are already torn down; restore or discard that session first", root)
            }
            CatalogError { operation, pg_error } => {
                write!(f, "Catalog operation '{}' failed: {}", operation, pg_error)
            }
            SpiError { query, error } => {
                write!(f, "SPI query failed: {}\nQuery: {}", error,
                       clip(query, 100))
            }
            SerializationError { message } => {
                write!(f, "Serialization error: {}", message)
            }
            ConfigError { setting, value, reason } => {
                write!(f, "Configuration error for '{}': {} (value: {})", setting, reason, value)
            }
            InternalError { message, file, line } => {
                write!(f, "Internal error at {}:{}: {}\nPlease report this bug.",
                       file, line, message)
            }
        }
    }
}

impl std::error::Error for DepsError {}

/// Cut `text` to at most `max` bytes without splitting a character
fn clip(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Result type for pg_mvdeps operations
pub type DepsResult<T> = Result<T, DepsError>;

/// Convert SpiError to DepsError
impl From<pgrx::spi::Error> for DepsError {
    fn from(e: pgrx::spi::Error) -> Self {
        DepsError::SpiError {
            query: "Unknown".to_string(),
            error: e.to_string(),
        }
    }
}

/// Convert serde_json::Error to DepsError
impl From<serde_json::Error> for DepsError {
    fn from(e: serde_json::Error) -> Self {
        DepsError::SerializationError {
            message: format!("JSON serialization error: {}", e),
        }
    }
}

/// Convert bincode::Error to DepsError
impl From<bincode::Error> for DepsError {
    fn from(e: bincode::Error) -> Self {
        DepsError::SerializationError {
            message: format!("Binary serialization error: {}", e),
        }
    }
}

/// Convert std::io::Error to DepsError
impl From<std::io::Error> for DepsError {
    fn from(e: std::io::Error) -> Self {
        DepsError::SerializationError {
            message: format!("I/O error: {}", e),
        }
    }
}

/// Helper macro for creating internal errors with automatic file/line
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::DepsError::internal($msg.to_string(), file!(), line!())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::DepsError::internal(format!($fmt, $($arg)*), file!(), line!())
    };
}
