use std::fmt;

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use trainer_core::types::{weekday_from_index, TimeOfDay, WEEKDAY_NAMES};

/// Defines when a job fires.
///
/// Weekly times are civil times in `tz`, so a 05:00 session stays at 05:00
/// across DST changes. A weekly lead is elapsed time before that civil
/// instant, never a second civil time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerSpec {
    /// Fire exactly once at the given instant.
    Once { at: DateTime<Utc> },

    /// Fire every week `lead_minutes` before `time` in `tz` on `weekday`
    /// (0 = Monday … 6 = Sunday). The fire may fall on the previous day.
    Weekly {
        weekday: u8,
        time: TimeOfDay,
        tz: Tz,
        #[serde(default)]
        lead_minutes: u32,
    },

    /// Fire whenever any child fires. Coinciding instants fire once.
    Any { triggers: Vec<TriggerSpec> },
}

impl TriggerSpec {
    /// The first fire instant strictly after `after`, or `None` when exhausted.
    pub fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            TriggerSpec::Once { at } => (*at > after).then_some(*at),
            TriggerSpec::Weekly {
                weekday,
                time,
                tz,
                lead_minutes,
            } => next_weekly(*weekday, *time, *tz, *lead_minutes, after),
            TriggerSpec::Any { triggers } => triggers
                .iter()
                .filter_map(|t| t.next_fire_after(after))
                .min(),
        }
    }

    /// Drop one-shot children that can no longer fire after `now`.
    ///
    /// An `Any` left with a single child collapses into that child.
    pub fn compact(&self, now: DateTime<Utc>) -> TriggerSpec {
        match self {
            TriggerSpec::Any { triggers } => {
                let mut live: Vec<TriggerSpec> = triggers
                    .iter()
                    .filter(|t| t.next_fire_after(now).is_some())
                    .map(|t| t.compact(now))
                    .collect();
                match live.len() {
                    0 => self.clone(),
                    1 => live.remove(0),
                    _ => TriggerSpec::Any { triggers: live },
                }
            }
            other => other.clone(),
        }
    }

    pub fn has_one_shot(&self) -> bool {
        match self {
            TriggerSpec::Once { .. } => true,
            TriggerSpec::Weekly { .. } => false,
            TriggerSpec::Any { triggers } => triggers.iter().any(TriggerSpec::has_one_shot),
        }
    }

    pub fn is_recurring(&self) -> bool {
        match self {
            TriggerSpec::Once { .. } => false,
            TriggerSpec::Weekly { .. } => true,
            TriggerSpec::Any { triggers } => triggers.iter().any(TriggerSpec::is_recurring),
        }
    }

    /// Reject triggers that could never be evaluated.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            TriggerSpec::Once { .. } => Ok(()),
            TriggerSpec::Weekly { weekday, .. } => weekday_from_index(*weekday)
                .map(|_| ())
                .map_err(|e| e.to_string()),
            TriggerSpec::Any { triggers } if triggers.is_empty() => {
                Err("combined trigger has no children".to_string())
            }
            TriggerSpec::Any { triggers } => triggers.iter().try_for_each(TriggerSpec::validate),
        }
    }
}

impl fmt::Display for TriggerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerSpec::Once { at } => write!(f, "once@{}", at.to_rfc3339()),
            TriggerSpec::Weekly {
                weekday,
                time,
                tz,
                lead_minutes,
            } => {
                let day = WEEKDAY_NAMES
                    .get(usize::from(*weekday))
                    .copied()
                    .unwrap_or("?");
                write!(f, "weekly[{day} {time} {tz}")?;
                if *lead_minutes > 0 {
                    write!(f, " -{lead_minutes}m")?;
                }
                f.write_str("]")
            }
            TriggerSpec::Any { triggers } => {
                f.write_str("any(")?;
                for (i, t) in triggers.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" | ")?;
                    }
                    write!(f, "{t}")?;
                }
                f.write_str(")")
            }
        }
    }
}

fn next_weekly(
    weekday: u8,
    time: TimeOfDay,
    tz: Tz,
    lead_minutes: u32,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let target = weekday_from_index(weekday).ok()?;
    let lead = Duration::minutes(i64::from(lead_minutes));
    let local_today = after.with_timezone(&tz).date_naive();
    let days_ahead = (i64::from(target.num_days_from_monday())
        - i64::from(local_today.weekday().num_days_from_monday()))
    .rem_euclid(7);

    // Sessions before today cannot fire after `after`. This week's may
    // already be behind it; the next one never is.
    (0..3).find_map(|week| {
        let date = local_today + Duration::days(days_ahead + 7 * week);
        let session = resolve_local(tz, date.and_time(time.to_naive()))?;
        let candidate = session.with_timezone(&Utc) - lead;
        (candidate > after).then_some(candidate)
    })
}

/// Map a civil time in `tz` to an instant.
///
/// Ambiguous times (DST fall-back) take the earlier instant; times inside a
/// spring-forward gap move one hour later.
pub fn resolve_local(tz: Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt),
        LocalResult::Ambiguous(earliest, _) => Some(earliest),
        LocalResult::None => tz
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest(),
    }
}
