use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

/// Platform id of a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outbound side of a messaging platform (Telegram today).
///
/// `send` must be awaited on the event loop that owns the client; callers on
/// other threads go through [`crate::delivery::DeliveryAdapter`].
#[async_trait]
pub trait MessagingChannel: Send + Sync {
    /// Stable lowercase identifier for this channel (e.g. `"telegram"`).
    fn name(&self) -> &str;

    /// Deliver `text` to the chat `recipient`.
    async fn send(&self, recipient: i64, text: &str) -> Result<MessageId, ChannelError>;
}
