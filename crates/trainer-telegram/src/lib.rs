//! Telegram side of the trainer bot: the outbound [`TelegramChannel`] used by
//! the delivery adapter, and the command dispatcher the trainer talks to.

pub mod adapter;
pub mod allow;
pub mod channel;
pub mod conversation;
pub mod error;
pub mod send;

pub use adapter::{BotState, TelegramAdapter};
pub use allow::Allowlist;
pub use channel::TelegramChannel;
pub use error::{Result, TelegramError};
