use thiserror::Error;

/// Main error type for the trading bot
#[derive(Error, Debug)]
pub enum GambitError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Protected-call errors
    #[error("Circuit breaker open for {service}")]
    BreakerOpen { service: String },

    #[error("Operation {operation} timed out after {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    // Order execution errors
    #[error("Order rejected: {0}")]
    OrderRejected(String),

    // Market data errors
    #[error("Market data unavailable: {0}")]
    MarketDataUnavailable(String),

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Unexpected state: {0}")]
    UnexpectedState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for GambitError
pub type Result<T> = std::result::Result<T, GambitError>;

impl GambitError {
    /// Whether this error comes from a flaky dependency rather than a
    /// business-rule rejection. Transient errors are eligible for retry
    /// and count against the circuit breaker in every profile; rejections
    /// like invalid order parameters must never be replayed.
    pub fn is_transient(&self) -> bool {
        match self {
            GambitError::Http(_)
            | GambitError::Transport(_)
            | GambitError::RateLimited(_)
            | GambitError::Timeout { .. }
            | GambitError::MarketDataUnavailable(_)
            | GambitError::Io(_) => true,
            GambitError::Database(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ),
            _ => false,
        }
    }

    /// Connection/timeout-shaped errors only. Used by the storage retry
    /// profile, which must not replay constraint violations.
    pub fn is_connection_error(&self) -> bool {
        match self {
            GambitError::Timeout { .. } | GambitError::Io(_) => true,
            GambitError::Database(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ),
            GambitError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Pure transport failures. The trade-execution retry profile replays
    /// these and nothing else.
    pub fn is_transport_error(&self) -> bool {
        match self {
            GambitError::Transport(_) | GambitError::Timeout { .. } => true,
            GambitError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}
