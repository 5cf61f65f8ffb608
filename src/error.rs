use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// The closed set of error codes the gateway ever hands back to a caller,
/// plus whatever code a tool handler raised through [`ToolError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorCode {
    Standard(StandardCode),
    Tool(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StandardCode {
    NotFound,
    ValidationError,
    PolicyViolation,
    Timeout,
    InternalError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::Standard(c) => write!(f, "{c:?}"),
            ErrorCode::Tool(code) => write!(f, "{code}"),
        }
    }
}

impl From<StandardCode> for ErrorCode {
    fn from(code: StandardCode) -> Self {
        ErrorCode::Standard(code)
    }
}

/// A typed error a tool handler raises to signal an expected failure.
///
/// Handlers are the only place application code can mint a fresh error code;
/// everything else in the gateway only ever reuses [`StandardCode`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolError {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl ToolError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ToolError {}

/// Gateway-wide error type. Every internal helper returns this; the
/// [`crate::gateway::Gateway`] is the only place it gets folded into a
/// terminal [`crate::gateway::ToolResult`] envelope instead of propagating.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    /// Like [`Error::Validation`] but carrying machine-readable
    /// `{schema_id, error, path}` details, per spec §4.3.1 step 4.
    #[error("validation failed: {0}")]
    ValidationWithDetails(String, serde_json::Value),

    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("timed out after {elapsed_ms}ms (budget {timeout_ms}ms)")]
    Timeout { elapsed_ms: u64, timeout_ms: u64 },

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("audit store error: {0}")]
    Store(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::NotFound(_) => StandardCode::NotFound.into(),
            Error::Validation(_) | Error::ValidationWithDetails(..) => StandardCode::ValidationError.into(),
            Error::PolicyViolation(_) => StandardCode::PolicyViolation.into(),
            Error::Timeout { .. } => StandardCode::Timeout.into(),
            Error::Tool(te) => ErrorCode::Tool(te.code.clone()),
            Error::Internal(_)
            | Error::Manifest(_)
            | Error::Config(_)
            | Error::Store(_)
            | Error::Serialization(_)
            | Error::Io(_) => StandardCode::InternalError.into(),
        }
    }

    /// Machine-readable `details` for the result envelope's `error.details`.
    pub fn details(&self) -> serde_json::Value {
        match self {
            Error::Tool(te) => te.details.clone(),
            Error::ValidationWithDetails(_, details) => details.clone(),
            Error::Timeout {
                elapsed_ms,
                timeout_ms,
            } => serde_json::json!({ "elapsed_ms": elapsed_ms, "timeout_ms": timeout_ms }),
            other => serde_json::json!({ "error": other.to_string() }),
        }
    }

    pub fn internal<T: std::fmt::Display>(msg: T) -> Self {
        Self::Internal(msg.to_string())
    }
}
