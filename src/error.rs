use thiserror::Error;

/// Convenience type alias for Results with AgentComError
pub type Result<T> = std::result::Result<T, AgentComError>;

/// Main error type for AgentCom
///
/// One variant per error kind the hub distinguishes for the purpose of
/// deciding retry/backoff/refusal behavior, not one variant per call site.
#[derive(Error, Debug)]
pub enum AgentComError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("authentication/authorization error: {0}")]
    Auth(String),

    #[error("rate limited: retry after {retry_after_secs}s ({message})")]
    RateLimited {
        message: String,
        retry_after_secs: u64,
    },

    #[error("budget exhausted: {0}")]
    BudgetExhausted(String),

    #[error("business rule refusal: {0}")]
    BusinessRuleRefusal(String),

    #[error("transient I/O error: {0}")]
    TransientIo(#[from] std::io::Error),

    #[error("store corruption detected: {0}")]
    Corruption(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("durable store error: {0}")]
    Store(String),

    #[error("fatal error: {0}")]
    Fatal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AgentComError {
    fn from(e: config::ConfigError) -> Self {
        AgentComError::Configuration(e.to_string())
    }
}

impl From<redb::DatabaseError> for AgentComError {
    fn from(e: redb::DatabaseError) -> Self {
        AgentComError::Corruption(e.to_string())
    }
}

impl From<redb::TransactionError> for AgentComError {
    fn from(e: redb::TransactionError) -> Self {
        AgentComError::Store(e.to_string())
    }
}

impl From<redb::TableError> for AgentComError {
    fn from(e: redb::TableError) -> Self {
        AgentComError::Store(e.to_string())
    }
}

impl From<redb::StorageError> for AgentComError {
    fn from(e: redb::StorageError) -> Self {
        AgentComError::Corruption(e.to_string())
    }
}

impl From<redb::CommitError> for AgentComError {
    fn from(e: redb::CommitError) -> Self {
        AgentComError::Corruption(e.to_string())
    }
}
