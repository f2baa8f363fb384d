//! [`MessagingChannel`] over the Telegram Bot API.

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use teloxide::{ApiError, RequestError};
use tracing::{debug, warn};

use trainer_channels::{ChannelError, MessageId, MessagingChannel};

use crate::send::{split_chunks, CHUNK_MAX};

/// Sends rendered payloads as HTML messages.
///
/// When Telegram refuses the markup, the chunk is resent as plain text.
#[derive(Clone)]
pub struct TelegramChannel {
    bot: Bot,
}

impl TelegramChannel {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    pub fn bot(&self) -> &Bot {
        &self.bot
    }

    async fn send_chunk(&self, chat: ChatId, chunk: &str) -> Result<Message, RequestError> {
        match self
            .bot
            .send_message(chat, chunk)
            .parse_mode(ParseMode::Html)
            .await
        {
            Err(RequestError::Api(ApiError::CantParseEntities(reason))) => {
                warn!(chat_id = chat.0, %reason, "telegram rejected HTML, resending as plain text");
                self.bot.send_message(chat, chunk).await
            }
            other => other,
        }
    }
}

#[async_trait]
impl MessagingChannel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, recipient: i64, text: &str) -> Result<MessageId, ChannelError> {
        let chat = ChatId(recipient);
        let mut first = None;
        for chunk in split_chunks(text, CHUNK_MAX) {
            let sent = self
                .send_chunk(chat, &chunk)
                .await
                .map_err(|e| classify(recipient, e))?;
            first.get_or_insert(MessageId(i64::from(sent.id.0)));
        }
        debug!(chat_id = recipient, "telegram message sent");
        first.ok_or_else(|| ChannelError::SendFailed("empty message".to_string()))
    }
}

/// Map a Bot API failure onto the channel-neutral error kinds.
pub fn classify(recipient: i64, err: RequestError) -> ChannelError {
    match err {
        RequestError::Api(api) => match api {
            ApiError::BotBlocked
            | ApiError::ChatNotFound
            | ApiError::UserDeactivated
            | ApiError::BotKicked
            | ApiError::BotKickedFromSupergroup => ChannelError::RecipientUnreachable(recipient),
            ApiError::InvalidToken => ChannelError::AuthFailed(api.to_string()),
            other => ChannelError::SendFailed(other.to_string()),
        },
        RequestError::RetryAfter(after) => ChannelError::RateLimited {
            retry_after_secs: u64::from(after.seconds()),
        },
        RequestError::Network(e) => ChannelError::ConnectionFailed(e.to_string()),
        RequestError::Io(e) => ChannelError::ConnectionFailed(e.to_string()),
        other => ChannelError::SendFailed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_and_missing_chats_are_unreachable() {
        for api in [ApiError::BotBlocked, ApiError::ChatNotFound, ApiError::UserDeactivated] {
            match classify(77, RequestError::Api(api)) {
                ChannelError::RecipientUnreachable(id) => assert_eq!(id, 77),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn bad_token_is_an_auth_failure() {
        assert!(matches!(
            classify(1, RequestError::Api(ApiError::InvalidToken)),
            ChannelError::AuthFailed(_)
        ));
    }

    #[test]
    fn other_api_errors_are_send_failures() {
        let err = RequestError::Api(ApiError::MessageTextIsEmpty);
        assert!(matches!(classify(1, err), ChannelError::SendFailed(_)));
    }

    #[test]
    fn channel_is_named_telegram() {
        let channel = TelegramChannel::new(Bot::new("123:abc"));
        assert_eq!(channel.name(), "telegram");
    }
}
