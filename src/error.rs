use thiserror::Error;

#[derive(Error, Debug)]
pub enum TurnError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("user already exists: {0}")]
    DuplicateUser(String),

    #[error("user is disabled: {0}")]
    UserDisabled(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session quota exceeded for user: {0}")]
    QuotaExceeded(String),

    #[error("concurrent update conflict: {0}")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TurnError {
    /// Whether a database error is a transient lock/busy condition that a
    /// caller may retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            TurnError::Conflict(_) => true,
            TurnError::Database(sqlx::Error::Database(e)) => {
                e.code().as_deref().is_some_and(is_busy_code)
            }
            _ => false,
        }
    }
}

/// SQLITE_BUSY (5) / SQLITE_LOCKED (6), including their extended result
/// codes (261, 517, 262, ...) whose low byte is the primary code.
fn is_busy_code(code: &str) -> bool {
    matches!(code.parse::<u32>().map(|c| c & 0xFF), Ok(5) | Ok(6))
}

pub type Result<T> = std::result::Result<T, TurnError>;
