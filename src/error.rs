use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid timestamp {0:?}: expected YYYY-MM-DDTHH:MM:SS.ffffffZ")]
    InvalidTimestamp(String),

    #[error("Invalid value {value:?} for field {field}")]
    InvalidValue { field: &'static str, value: String },

    #[error("Failed to decode stored record {id}: {reason}")]
    Decode { id: i64, reason: String },
}

impl StoreError {
    /// Whether a single retry after a short pause may succeed.
    ///
    /// SQLite reports lock contention as `SQLITE_BUSY` (5) or `SQLITE_LOCKED` (6),
    /// possibly with an extended code in the upper bits.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(sqlx::Error::Io(_))
            | StoreError::Database(sqlx::Error::PoolTimedOut) => true,
            StoreError::Database(sqlx::Error::Database(db)) => db
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .map(|code| matches!(code & 0xff, 5 | 6))
                .unwrap_or(false),
            _ => false,
        }
    }
}
