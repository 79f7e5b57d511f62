use thiserror::Error;

/// Main error type for the ladder bot
#[derive(Error, Debug)]
pub enum LadderError {
    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Exchange request timed out: {0}")]
    Timeout(String),

    #[error("Rate limited by exchange: {0}")]
    RateLimited(String),

    // Exchange-reported errors
    #[error("Exchange rejected request (retCode {code}): {message}")]
    Exchange { code: i64, message: String },

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Reconciliation errors
    #[error("Snapshot does not belong to this monitor: expected {expected}, got {got}")]
    SnapshotMismatch { expected: String, got: String },

    // Registry errors
    #[error("Monitor already exists for key {0}")]
    DuplicateMonitor(String),

    // Invariant violations (programming errors; the affected monitor is quarantined)
    #[error("Invariant violation on {key}: {reason}")]
    InvariantViolation { key: String, reason: String },
}

impl LadderError {
    /// Whether the error is expected to clear on its own by the next poll
    /// cycle. Transient errors are logged and retried; everything else
    /// propagates.
    pub fn is_transient(&self) -> bool {
        match self {
            LadderError::Http(_) | LadderError::Timeout(_) | LadderError::RateLimited(_) => true,
            // Cancelling an order that already executed is a success in
            // disguise; the next reconciliation pass will observe the fill.
            LadderError::OrderNotFound(_) => true,
            LadderError::Exchange { code, .. } => is_transient_ret_code(*code),
            _ => false,
        }
    }
}

/// Bybit v5 retCodes that indicate a retryable condition rather than a
/// permanently rejected request.
fn is_transient_ret_code(code: i64) -> bool {
    matches!(
        code,
        10002    // request not authorized yet / timestamp drift
        | 10006  // rate limit
        | 10016  // server error
        | 110001 // order does not exist (already filled or cancelled)
    )
}

pub type Result<T> = std::result::Result<T, LadderError>;
