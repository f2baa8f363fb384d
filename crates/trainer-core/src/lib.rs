//! `trainer-core`: shared configuration, error, clock and domain types for
//! the training reminder bot.

pub mod clock;
pub mod config;
pub mod error;
pub mod flow;
pub mod render;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock, ZonedClock};
pub use config::TrainerConfig;
pub use error::{CoreError, Result};
pub use types::{PayloadKind, SubjectId, TimeOfDay, WeeklyConfigEntry};
