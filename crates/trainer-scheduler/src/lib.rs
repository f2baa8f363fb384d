//! `trainer-scheduler`: persistent weekly job scheduling.
//!
//! # Overview
//!
//! Weekly configuration entries are turned into triggers by [`compose`],
//! persisted in the `scheduled_jobs` SQLite table by [`store::JobStore`], and
//! fired by the [`engine::SchedulerEngine`] worker thread, which invokes the
//! [`engine::JobHandler`] registered under the job's target name.
//!
//! # Trigger variants
//!
//! | Variant  | Behaviour                                              |
//! |----------|--------------------------------------------------------|
//! | `Once`   | Single fire at an absolute UTC instant                 |
//! | `Weekly` | Weekday + civil time in an IANA timezone, minus a lead |
//! | `Any`    | Fires whenever a child fires, once per instant         |

pub mod compose;
pub mod db;
pub mod engine;
pub mod error;
pub mod reconfigure;
pub mod store;
pub mod trigger;
pub mod types;
pub mod weekly;

pub use compose::compose;
pub use engine::{EngineOptions, FireContext, HandlerError, JobHandler, RunOutcome, SchedulerEngine};
pub use error::{Result, SchedulerError};
pub use reconfigure::{ReconcileReport, Reconfigurator};
pub use store::{JobStore, Replaced};
pub use trigger::TriggerSpec;
pub use types::{JobKey, JobState, JobTarget, ScheduledJob};
pub use weekly::{SqliteWeeklyStore, WeeklyScheduleStore};
