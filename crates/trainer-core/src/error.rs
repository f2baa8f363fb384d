use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid time of day: {0}")]
    InvalidTime(String),

    #[error("Invalid weekday: {0} (expected 0 = Monday … 6 = Sunday)")]
    InvalidWeekday(u8),

    #[error("Unknown timezone: {0}")]
    UnknownTimezone(String),

    #[error("Malformed weekly entry: {0}")]
    MalformedEntry(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Short error code string used in operator-facing log lines.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "CONFIG_ERROR",
            CoreError::InvalidTime(_) => "INVALID_TIME",
            CoreError::InvalidWeekday(_) => "INVALID_WEEKDAY",
            CoreError::UnknownTimezone(_) => "UNKNOWN_TIMEZONE",
            CoreError::MalformedEntry(_) => "MALFORMED_ENTRY",
            CoreError::Serialization(_) => "SERIALIZATION_ERROR",
            CoreError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
