use kestrel_core::errors::{ProviderError, SandboxError, ToolError};
use kestrel_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("session has no messages: {0}")]
    EmptySession(String),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("permission not found: {0}")]
    PermissionNotFound(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session already exists: {0}")]
    SessionExists(String),

    #[error("pool is full (max {0} sessions)")]
    PoolFull(usize),

    #[error("member already exists: {0}")]
    MemberExists(String),

    #[error("todo error: {0}")]
    Todo(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
