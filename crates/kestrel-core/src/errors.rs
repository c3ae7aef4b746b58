use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Classification carried by `error` events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    ProviderError,
    ToolTimeout,
    ToolDenied,
    PermissionPending,
    PolicyViolation,
    StoreError,
    #[serde(rename = "MCPError")]
    McpError,
}

/// Typed error hierarchy for model provider calls.
/// Classifies errors as fatal (don't retry), retryable, or operational.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ProviderError {
    // Fatal
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("context window exceeded: {actual} > {limit}")]
    ContextWindowExceeded { limit: usize, actual: usize },
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // Retryable
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("provider overloaded")]
    Overloaded,
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    // Operational
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::ServerError { .. }
                | Self::Overloaded
                | Self::NetworkError(_)
                | Self::StreamInterrupted(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed(_) | Self::ContextWindowExceeded { .. } | Self::InvalidRequest(_)
        )
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::ContextWindowExceeded { .. } => "context_window_exceeded",
            Self::InvalidRequest(_) => "invalid_request",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::Overloaded => "overloaded",
            Self::NetworkError(_) => "network_error",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("Path outside sandbox: {0}")]
    OutsideBoundary(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid pattern: {0}")]
    Pattern(String),
    #[error("process not found: {0}")]
    ProcessNotFound(String),
    #[error("watch failed: {0}")]
    Watch(String),
    #[error("{0} is not supported by this sandbox")]
    Unsupported(&'static str),
    #[error("Dangerous command blocked for security: {0}")]
    Blocked(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ProviderError::RateLimited { retry_after: None }.is_retryable());
        assert!(ProviderError::ServerError { status: 500, body: "err".into() }.is_retryable());
        assert!(ProviderError::Overloaded.is_retryable());
        assert!(ProviderError::NetworkError("tcp".into()).is_retryable());
        assert!(!ProviderError::Cancelled.is_retryable());
    }

    #[test]
    fn fatal_classification() {
        assert!(ProviderError::AuthenticationFailed("bad key".into()).is_fatal());
        assert!(ProviderError::InvalidRequest("bad".into()).is_fatal());
        assert!(!ProviderError::Timeout(Duration::from_secs(1)).is_fatal());
    }

    #[test]
    fn error_kind_serializes_with_wire_names() {
        assert_eq!(
            serde_json::to_string(&ErrorKind::ProviderError).unwrap(),
            r#""ProviderError""#
        );
        assert_eq!(serde_json::to_string(&ErrorKind::McpError).unwrap(), r#""MCPError""#);
    }

    #[test]
    fn sandbox_error_display() {
        let err = SandboxError::OutsideBoundary("/etc/passwd".into());
        assert_eq!(err.to_string(), "Path outside sandbox: /etc/passwd");
        let err: ToolError = err.into();
        assert!(err.to_string().contains("outside sandbox"));
    }
}
