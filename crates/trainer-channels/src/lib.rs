pub mod channel;
pub mod delivery;
pub mod error;
pub mod handler;

pub use channel::{MessageId, MessagingChannel};
pub use delivery::{DeliveryAdapter, DeliveryOutcome, LoopHandle};
pub use error::{ChannelError, DeliveryError};
pub use handler::{BroadcastHandler, BroadcastSummary, WeeklyEntryHandler};
