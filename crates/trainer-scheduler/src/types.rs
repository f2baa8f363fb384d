use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use trainer_core::types::{weekday_from_index, PayloadKind, SubjectId};

use crate::error::SchedulerError;
use crate::trigger::TriggerSpec;

/// Lifecycle state of a job as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for its next fire time.
    Pending,
    /// Its target is currently being invoked.
    Firing,
    /// Cancelled, or a one-shot trigger that has been exhausted.
    Removed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Firing => "firing",
            JobState::Removed => "removed",
        };
        write!(f, "{s}")
    }
}

/// What to invoke when a job fires: a registered handler name plus the JSON
/// arguments bound at scheduling time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTarget {
    pub handler: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl JobTarget {
    pub fn new(handler: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            handler: handler.into(),
            args,
        }
    }
}

/// A persisted job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    /// Deterministic key, e.g. `reminder_42_0`. Primary key of the store.
    pub id: String,
    /// Human-readable label.
    pub name: String,
    pub trigger: TriggerSpec,
    pub target: JobTarget,
    /// `None` once the trigger is exhausted.
    pub next_fire_at: Option<DateTime<Utc>>,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub fire_count: u32,
    /// Bumped on every write; fire bookkeeping only applies to the revision it read.
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Structured form of a per-entry job id: `{kind}_{subject}_{weekday}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub kind: PayloadKind,
    pub subject: SubjectId,
    pub weekday: u8,
}

impl JobKey {
    pub fn new(kind: PayloadKind, subject: SubjectId, weekday: u8) -> Self {
        Self {
            kind,
            subject,
            weekday,
        }
    }

    /// Prefix shared by every job of one subject and kind, e.g. `reminder_42_`.
    pub fn sibling_prefix(kind: PayloadKind, subject: SubjectId) -> String {
        format!("{}_{}_", kind.as_str(), subject)
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.kind, self.subject, self.weekday)
    }
}

impl FromStr for JobKey {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || SchedulerError::Config(format!("not a weekly job id: {s}"));
        let mut parts = s.splitn(3, '_');
        let kind: PayloadKind = parts
            .next()
            .ok_or_else(bad)?
            .parse()
            .map_err(|_| bad())?;
        let subject: i64 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let weekday: u8 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        weekday_from_index(weekday)?;
        Ok(Self::new(kind, SubjectId(subject), weekday))
    }
}
