use thiserror::Error;

/// Errors a messaging channel reports for a single send.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The underlying transport could not be reached.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The platform refused or failed to deliver the message.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// The bot token was rejected.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// The recipient blocked the bot or the chat no longer exists.
    #[error("Recipient unreachable: {0}")]
    RecipientUnreachable(i64),

    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// The channel-specific configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Why a delivery job occurrence did not complete.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("delivery {kind}: {detail}")]
    Failed { kind: &'static str, detail: String },

    #[error("invalid job arguments: {0}")]
    BadArguments(#[from] serde_json::Error),

    #[error("broadcast failed for all {0} recipients")]
    BroadcastFailed(usize),

    #[error(transparent)]
    Scheduler(#[from] trainer_scheduler::SchedulerError),
}
