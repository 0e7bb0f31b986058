use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Central error type for Lineage operations.
#[derive(Error, Debug)]
pub enum LineageError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LineageError {
    pub fn version_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "Version",
            id: id.into(),
        }
    }

    pub fn branch_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "Branch",
            id: id.into(),
        }
    }

    /// The stable code surfaced to collaborators in [`OperationResult`].
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::ValidationError,
            Self::NotFound { .. } => ErrorCode::NotFoundError,
            Self::Conflict(_) => ErrorCode::ConflictError,
            Self::UnsupportedOperation(_) => ErrorCode::UnsupportedOperationError,
            Self::Serialization(_)
            | Self::Encoding(_)
            | Self::Io(_)
            | Self::Config(_)
            | Self::Internal(_) => ErrorCode::InternalError,
        }
    }
}

/// Convenience type alias for Lineage results.
pub type LineageResult<T> = Result<T, LineageError>;

// ---------------------------------------------------------------------------
// OperationResult: the envelope returned across the engine boundary
// ---------------------------------------------------------------------------

/// Error taxonomy exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    ValidationError,
    NotFoundError,
    ConflictError,
    UnsupportedOperationError,
    InternalError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::ValidationError => "ValidationError",
            ErrorCode::NotFoundError => "NotFoundError",
            ErrorCode::ConflictError => "ConflictError",
            ErrorCode::UnsupportedOperationError => "UnsupportedOperationError",
            ErrorCode::InternalError => "InternalError",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationError {
    pub code: ErrorCode,
    pub details: String,
}

/// Outcome of a mutating engine operation. Expected failures are carried
/// as data; callers branch on `success`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
}

impl OperationResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            version_id: None,
            branch_id: None,
            error: None,
        }
    }

    pub fn failed(err: &LineageError) -> Self {
        Self {
            success: false,
            message: err.to_string(),
            version_id: None,
            branch_id: None,
            error: Some(OperationError {
                code: err.code(),
                details: err.to_string(),
            }),
        }
    }

    pub fn with_version(mut self, version_id: impl Into<String>) -> Self {
        self.version_id = Some(version_id.into());
        self
    }

    pub fn with_branch(mut self, branch_id: impl Into<String>) -> Self {
        self.branch_id = Some(branch_id.into());
        self
    }

    /// The error code, if the operation failed.
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }
}
