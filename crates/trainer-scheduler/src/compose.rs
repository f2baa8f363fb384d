//! Turns a weekly configuration entry into a concrete trigger.

use chrono::{DateTime, Datelike, Duration, Utc};
use chrono_tz::Tz;

use trainer_core::types::{PayloadKind, TimeOfDay, WeeklyConfigEntry};

use crate::error::{Result, SchedulerError};
use crate::trigger::{resolve_local, TriggerSpec};

/// Compose the trigger for `entry` as seen at `now`.
///
/// The weekly child is always present and anchored at the session itself.
/// A one-shot child is added when the entry's weekday is today and today's
/// fire instant (session time minus the reminder lead) is still strictly in
/// the future. Both children subtract the lead the same way, so on any day
/// they agree on the instant. Reports ignore the lead.
pub fn compose(entry: &WeeklyConfigEntry, now: DateTime<Tz>, lead_minutes: u32) -> Result<TriggerSpec> {
    entry.validate()?;
    let tz = now.timezone();
    let lead = effective_lead(entry.payload_kind, lead_minutes);

    let weekly = TriggerSpec::Weekly {
        weekday: entry.weekday,
        time: entry.time_of_day,
        tz,
        lead_minutes: lead,
    };

    match instant_today(entry, now, lead)? {
        Some(at) => Ok(TriggerSpec::Any {
            triggers: vec![TriggerSpec::Once { at }, weekly],
        }),
        None => Ok(weekly),
    }
}

/// Weekly trigger with no lead, used for jobs not backed by an entry.
pub fn weekly_at(weekday: u8, time: TimeOfDay, tz: Tz) -> Result<TriggerSpec> {
    let trigger = TriggerSpec::Weekly {
        weekday,
        time,
        tz,
        lead_minutes: 0,
    };
    trigger.validate().map_err(SchedulerError::InvalidSchedule)?;
    Ok(trigger)
}

pub fn effective_lead(kind: PayloadKind, lead_minutes: u32) -> u32 {
    match kind {
        PayloadKind::Reminder => lead_minutes,
        PayloadKind::Report => 0,
    }
}

/// Today's fire instant for `entry`, if today is its weekday and the instant
/// has not been reached yet. Equality counts as passed.
fn instant_today(entry: &WeeklyConfigEntry, now: DateTime<Tz>, lead: u32) -> Result<Option<DateTime<Utc>>> {
    if now.weekday().num_days_from_monday() != u32::from(entry.weekday) {
        return Ok(None);
    }
    let session = resolve_local(
        now.timezone(),
        now.date_naive().and_time(entry.time_of_day.to_naive()),
    )
    .ok_or_else(|| {
        SchedulerError::InvalidSchedule(format!(
            "{} has no local instant on {}",
            entry.time_of_day,
            now.date_naive()
        ))
    })?;
    let fire = session.with_timezone(&Utc) - Duration::minutes(i64::from(lead));
    Ok((fire > now.with_timezone(&Utc)).then_some(fire))
}
