//! Error types for meshql operations.
//!
//! Every failure carries a structured [`ErrorCode`] so the owning service can
//! map it onto its own transport without string matching.

use thiserror::Error;

/// Result type alias for meshql operations.
pub type MeshqlResult<T> = Result<T, MeshqlError>;

/// Main error type for all meshql operations.
#[derive(Error, Debug)]
pub enum MeshqlError {
    /// A query template could not be compiled into a backend-native query.
    #[error("Template error: {message}")]
    Template {
        message: String,
        code: ErrorCode,
        template: Option<String>,
    },

    /// Backend storage operation failed.
    #[error("Storage error: {message}")]
    Storage {
        message: String,
        code: ErrorCode,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A remote subgraph call failed.
    #[error("Subgraph error: {message}")]
    Subgraph {
        message: String,
        code: ErrorCode,
        url: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Input validation failed.
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        code: ErrorCode,
        suggestion: Option<String>,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Backend not compiled in or unknown.
    #[error("Backend not supported: {backend}")]
    UnsupportedBackend { backend: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error codes for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Template (TPL_xxx)
    TplUnterminated,
    TplUnknownPlaceholder,
    TplInvalidQuery,

    // Storage (DB_xxx)
    DbConnectionFailed,
    DbOperationFailed,
    DbSchemaFailed,
    DbTransactionFailed,
    DbCorruptRow,

    // Subgraph (SUB_xxx)
    SubConnectionFailed,
    SubHttpStatus,
    SubGraphqlError,
    SubInvalidResponse,

    // Validation (VAL_xxx)
    ValInvalidInput,
    ValUnknownQuery,

    // Configuration
    CfgInvalid,

    // Internal
    Internal,
}

impl ErrorCode {
    /// Get the string representation of the error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::TplUnterminated => "TPL_001",
            ErrorCode::TplUnknownPlaceholder => "TPL_002",
            ErrorCode::TplInvalidQuery => "TPL_003",
            ErrorCode::DbConnectionFailed => "DB_001",
            ErrorCode::DbOperationFailed => "DB_002",
            ErrorCode::DbSchemaFailed => "DB_003",
            ErrorCode::DbTransactionFailed => "DB_004",
            ErrorCode::DbCorruptRow => "DB_005",
            ErrorCode::SubConnectionFailed => "SUB_001",
            ErrorCode::SubHttpStatus => "SUB_002",
            ErrorCode::SubGraphqlError => "SUB_003",
            ErrorCode::SubInvalidResponse => "SUB_004",
            ErrorCode::ValInvalidInput => "VAL_001",
            ErrorCode::ValUnknownQuery => "VAL_002",
            ErrorCode::CfgInvalid => "CFG_001",
            ErrorCode::Internal => "INT_001",
        }
    }
}

impl MeshqlError {
    /// Create a template compile error.
    pub fn template(code: ErrorCode, message: impl Into<String>, template: &str) -> Self {
        Self::Template {
            message: message.into(),
            code,
            template: Some(template.to_string()),
        }
    }

    /// Create a storage error with no underlying driver error.
    pub fn storage(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            code,
            source: None,
        }
    }

    /// Create a storage error with a specific code and the driver error as source.
    pub fn storage_from(
        code: ErrorCode,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            code,
            source: Some(Box::new(source)),
        }
    }

    /// Create a subgraph error.
    pub fn subgraph(code: ErrorCode, url: &str, message: impl Into<String>) -> Self {
        Self::Subgraph {
            message: message.into(),
            code,
            url: Some(url.to_string()),
            source: None,
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            code: ErrorCode::ValInvalidInput,
            suggestion: None,
        }
    }

    /// Create an error for a query name no singleton or vector is bound to.
    pub fn unknown_query(name: &str) -> Self {
        Self::Validation {
            message: format!("No query named '{}'", name),
            code: ErrorCode::ValUnknownQuery,
            suggestion: Some("Check the singletons and vectors configured for this service".to_string()),
        }
    }

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Template { code, .. } => *code,
            Self::Storage { code, .. } => *code,
            Self::Subgraph { code, .. } => *code,
            Self::Validation { code, .. } => *code,
            Self::Configuration(_) | Self::UnsupportedBackend { .. } => ErrorCode::CfgInvalid,
            _ => ErrorCode::Internal,
        }
    }

    /// Whether the error was caused by the caller's query template or parameters.
    pub fn is_template_error(&self) -> bool {
        matches!(self, Self::Template { .. })
    }

    /// Get a user-friendly suggestion for resolving this error.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Template { .. } => Some("Check the query template and the parameters supplied to it"),
            Self::Storage { code: ErrorCode::DbConnectionFailed, .. } => {
                Some("Please check the storage URI and that the backend is reachable")
            }
            Self::Subgraph { .. } => Some("Please check the resolver URL and that the subgraph is running"),
            Self::Validation { suggestion, .. } => suggestion.as_deref(),
            Self::UnsupportedBackend { .. } => Some("Enable the matching cargo feature on meshql-repos"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_error() {
        let err = MeshqlError::template(ErrorCode::TplUnterminated, "missing }}", "{\"id\": \"{{id\"}");
        assert_eq!(err.code(), ErrorCode::TplUnterminated);
        assert!(err.is_template_error());
        assert!(err.to_string().contains("missing }}"));
    }

    #[test]
    fn test_unknown_query_has_suggestion() {
        let err = MeshqlError::unknown_query("getByName");
        assert_eq!(err.code(), ErrorCode::ValUnknownQuery);
        assert!(err.suggestion().is_some());
    }

    #[test]
    fn test_storage_error_keeps_code() {
        let err = MeshqlError::storage(ErrorCode::DbCorruptRow, "row 'x' is not an object");
        assert_eq!(err.code(), ErrorCode::DbCorruptRow);
        assert!(!err.is_template_error());
        assert!(err.to_string().contains("row 'x'"));
    }

    #[test]
    fn test_error_code_as_str() {
        assert_eq!(ErrorCode::TplInvalidQuery.as_str(), "TPL_003");
        assert_eq!(ErrorCode::DbConnectionFailed.as_str(), "DB_001");
        assert_eq!(ErrorCode::SubGraphqlError.as_str(), "SUB_003");
    }
}
