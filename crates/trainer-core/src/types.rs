use std::fmt;
use std::str::FromStr;

use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Short lowercase names, index 0 = Monday. Used in job labels and logs.
pub const WEEKDAY_NAMES: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];

/// Opaque reference to a recipient (a student, or the trainer for broadcasts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectId(pub i64);

impl SubjectId {
    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for SubjectId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// What a weekly entry delivers when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    /// Sent `lead_minutes` before the session starts.
    Reminder,
    /// Sent exactly at the configured time; no lead applied.
    Report,
}

impl PayloadKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PayloadKind::Reminder => "reminder",
            PayloadKind::Report => "report",
        }
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PayloadKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "reminder" => Ok(PayloadKind::Reminder),
            "report" => Ok(PayloadKind::Report),
            other => Err(CoreError::MalformedEntry(format!(
                "unknown payload kind: {other}"
            ))),
        }
    }
}

/// Civil wall-clock time without a date, minute precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    hour: u8,
    minute: u8,
}

impl TimeOfDay {
    pub const MIDNIGHT: TimeOfDay = TimeOfDay { hour: 0, minute: 0 };

    pub fn new(hour: u8, minute: u8) -> Result<Self> {
        if hour > 23 || minute > 59 {
            return Err(CoreError::InvalidTime(format!("{hour:02}:{minute:02}")));
        }
        Ok(Self { hour, minute })
    }

    pub fn hour(self) -> u8 {
        self.hour
    }

    pub fn minute(self) -> u8 {
        self.minute
    }

    pub fn to_naive(self) -> NaiveTime {
        // hour/minute are range-checked on construction
        NaiveTime::from_hms_opt(u32::from(self.hour), u32::from(self.minute), 0)
            .unwrap_or(NaiveTime::MIN)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl FromStr for TimeOfDay {
    type Err = CoreError;

    /// Parses `HH:MM` (24h). Single-digit hours such as `5:00` are accepted.
    fn from_str(s: &str) -> Result<Self> {
        let (h, m) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| CoreError::InvalidTime(s.to_string()))?;
        let hour: u8 = h.parse().map_err(|_| CoreError::InvalidTime(s.to_string()))?;
        let minute: u8 = m.parse().map_err(|_| CoreError::InvalidTime(s.to_string()))?;
        TimeOfDay::new(hour, minute)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(t: TimeOfDay) -> Self {
        t.to_string()
    }
}

/// Convert a 0-based weekday index (0 = Monday) into a chrono `Weekday`.
pub fn weekday_from_index(index: u8) -> Result<Weekday> {
    match index {
        0 => Ok(Weekday::Mon),
        1 => Ok(Weekday::Tue),
        2 => Ok(Weekday::Wed),
        3 => Ok(Weekday::Thu),
        4 => Ok(Weekday::Fri),
        5 => Ok(Weekday::Sat),
        6 => Ok(Weekday::Sun),
        other => Err(CoreError::InvalidWeekday(other)),
    }
}

/// One subject's recurring commitment on one weekday.
///
/// Written by the CRUD layer; the scheduling core only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyConfigEntry {
    pub subject_id: SubjectId,
    /// 0 = Monday … 6 = Sunday.
    pub weekday: u8,
    pub time_of_day: TimeOfDay,
    pub payload_kind: PayloadKind,
    /// `false` means the entry is inactive and must not have a live job.
    pub recurrence_enabled: bool,
    /// Telegram chat the payload is delivered to.
    pub chat_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl WeeklyConfigEntry {
    /// Reject entries the trigger composer cannot work with.
    pub fn validate(&self) -> Result<()> {
        weekday_from_index(self.weekday)?;
        if self.chat_id == 0 {
            return Err(CoreError::MalformedEntry(format!(
                "subject {} has no chat id",
                self.subject_id
            )));
        }
        Ok(())
    }

    pub fn weekday_name(&self) -> &'static str {
        WEEKDAY_NAMES
            .get(usize::from(self.weekday))
            .copied()
            .unwrap_or("?")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_formats_time() {
        let t: TimeOfDay = "05:00".parse().unwrap();
        assert_eq!(t.hour(), 5);
        assert_eq!(t.minute(), 0);
        assert_eq!(t.to_string(), "05:00");

        let t: TimeOfDay = "7:05".parse().unwrap();
        assert_eq!(t.to_string(), "07:05");
    }

    #[test]
    fn rejects_out_of_range_time() {
        assert!("24:00".parse::<TimeOfDay>().is_err());
        assert!("12:60".parse::<TimeOfDay>().is_err());
        assert!("noon".parse::<TimeOfDay>().is_err());
    }

    #[test]
    fn time_serializes_as_string() {
        let t = TimeOfDay::new(6, 30).unwrap();
        assert_eq!(serde_json::to_string(&t).unwrap(), r#""06:30""#);
        let back: TimeOfDay = serde_json::from_str(r#""06:30""#).unwrap();
        assert_eq!(back, t);
        assert!(serde_json::from_str::<TimeOfDay>(r#""99:00""#).is_err());
    }

    #[test]
    fn payload_kind_round_trips_through_str() {
        assert_eq!("report".parse::<PayloadKind>().unwrap(), PayloadKind::Report);
        assert_eq!(PayloadKind::Reminder.to_string(), "reminder");
        assert!("feedback".parse::<PayloadKind>().is_err());
    }

    #[test]
    fn entry_validation() {
        let mut entry = WeeklyConfigEntry {
            subject_id: SubjectId(1),
            weekday: 0,
            time_of_day: TimeOfDay::new(5, 0).unwrap(),
            payload_kind: PayloadKind::Reminder,
            recurrence_enabled: true,
            chat_id: 123,
            session_type: None,
            location: None,
        };
        assert!(entry.validate().is_ok());
        assert_eq!(entry.weekday_name(), "mon");

        entry.weekday = 7;
        assert!(matches!(entry.validate(), Err(CoreError::InvalidWeekday(7))));

        entry.weekday = 2;
        entry.chat_id = 0;
        assert!(entry.validate().is_err());
    }
}
