//! Keeps the job store in step with the weekly configuration.
//!
//! The CRUD layer writes the weekly store first and then notifies through
//! [`Reconfigurator::on_weekly_entry_changed`] or
//! [`Reconfigurator::on_weekly_entry_deleted`]. At startup
//! [`Reconfigurator::reconcile_all`] rebuilds every entry's job once.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::json;
use tracing::{error, info, instrument, warn};

use trainer_core::config::ReportConfig;
use trainer_core::types::{PayloadKind, SubjectId, WeeklyConfigEntry};
use trainer_core::ZonedClock;

use crate::compose::{compose, weekly_at};
use crate::engine::SchedulerEngine;
use crate::error::Result;
use crate::store::Replaced;
use crate::trigger::TriggerSpec;
use crate::types::{JobKey, JobTarget, ScheduledJob};
use crate::weekly::WeeklyScheduleStore;

pub const REMINDER_HANDLER: &str = "weekly_reminder";
pub const REPORT_HANDLER: &str = "weekly_report";
pub const BROADCAST_HANDLER: &str = "trainer_broadcast";

/// Id of the trainer's weekly broadcast. Not a [`JobKey`], so reconciliation
/// never treats it as an orphaned entry job.
pub const BROADCAST_JOB_ID: &str = "report_trainer_weekly";

pub fn handler_for(kind: PayloadKind) -> &'static str {
    match kind {
        PayloadKind::Reminder => REMINDER_HANDLER,
        PayloadKind::Report => REPORT_HANDLER,
    }
}

/// Counts from one [`Reconfigurator::reconcile_all`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub scheduled: usize,
    pub cancelled: usize,
    pub failed: usize,
}

pub struct Reconfigurator {
    engine: Arc<SchedulerEngine>,
    weekly: Arc<dyn WeeklyScheduleStore>,
    clock: ZonedClock,
    lead_minutes: u32,
    /// Serialises notification handling for stores outside the job database.
    serial: Mutex<()>,
}

impl Reconfigurator {
    pub fn new(
        engine: Arc<SchedulerEngine>,
        weekly: Arc<dyn WeeklyScheduleStore>,
        clock: ZonedClock,
        lead_minutes: u32,
    ) -> Self {
        Self {
            engine,
            weekly,
            clock,
            lead_minutes,
            serial: Mutex::new(()),
        }
    }

    pub fn engine(&self) -> &Arc<SchedulerEngine> {
        &self.engine
    }

    /// Bring the job for `entry`'s key in line with the weekly store.
    ///
    /// `entry` only names the key. The committed row is read again while the
    /// job store holds its write lock, so notifications arriving out of order
    /// still leave the job matching the latest save. A missing or disabled
    /// row cancels the job. Jobs of the same subject and kind on weekdays
    /// that no longer have an active entry are cancelled too, so moving a
    /// session from Monday to Wednesday leaves only the Wednesday job.
    #[instrument(
        skip(self, entry),
        fields(subject_id = %entry.subject_id, weekday = entry.weekday, kind = %entry.payload_kind)
    )]
    pub fn on_weekly_entry_changed(&self, entry: &WeeklyConfigEntry) -> Result<Option<ScheduledJob>> {
        let key = JobKey::new(entry.payload_kind, entry.subject_id, entry.weekday);
        let job = match self.sync_key(key)? {
            Replaced::Upserted(job) => Some(job),
            Replaced::Removed { .. } => None,
        };
        self.prune_siblings(key)?;
        Ok(job)
    }

    /// Cancel the job for a deleted entry. Returns whether one existed.
    ///
    /// If the entry has been saved again since, its job is kept in line with
    /// that row instead.
    #[instrument(skip(self))]
    pub fn on_weekly_entry_deleted(
        &self,
        subject: SubjectId,
        weekday: u8,
        kind: PayloadKind,
    ) -> Result<bool> {
        match self.sync_key(JobKey::new(kind, subject, weekday))? {
            Replaced::Upserted(_) => Ok(false),
            Replaced::Removed { existed } => Ok(existed),
        }
    }

    /// Schedule every active entry and cancel entry jobs whose entry is gone.
    ///
    /// A malformed entry is logged and counted; it does not stop the pass.
    #[instrument(skip(self))]
    pub fn reconcile_all(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let active = self.weekly.get_all_active()?;
        let mut live: HashSet<JobKey> = HashSet::with_capacity(active.len());

        for entry in &active {
            match self.schedule_entry(entry) {
                Ok(_) => {
                    report.scheduled += 1;
                    live.insert(JobKey::new(entry.payload_kind, entry.subject_id, entry.weekday));
                }
                Err(e) => {
                    report.failed += 1;
                    error!(
                        subject_id = %entry.subject_id,
                        weekday = entry.weekday,
                        error = %e,
                        "could not schedule weekly entry"
                    );
                }
            }
        }

        for job in self.engine.list_jobs()? {
            let Ok(key) = job.id.parse::<JobKey>() else {
                continue;
            };
            if !live.contains(&key) && self.engine.cancel(&job.id)? {
                report.cancelled += 1;
            }
        }

        info!(
            scheduled = report.scheduled,
            cancelled = report.cancelled,
            failed = report.failed,
            "weekly schedule reconciled"
        );
        Ok(report)
    }

    /// Schedule or cancel the trainer's weekly broadcast per `cfg`.
    pub fn sync_broadcast(&self, cfg: &ReportConfig) -> Result<Option<ScheduledJob>> {
        if !cfg.enabled {
            self.engine.cancel(BROADCAST_JOB_ID)?;
            return Ok(None);
        }
        let trigger = weekly_at(cfg.weekday, cfg.time, self.clock.timezone())?;
        let job = self.engine.schedule(
            BROADCAST_JOB_ID,
            "weekly trainer broadcast",
            trigger,
            JobTarget::new(BROADCAST_HANDLER, json!({})),
        )?;
        Ok(Some(job))
    }

    fn schedule_entry(&self, entry: &WeeklyConfigEntry) -> Result<ScheduledJob> {
        let (name, trigger, target) = self.plan_entry(entry)?;
        let key = JobKey::new(entry.payload_kind, entry.subject_id, entry.weekday);
        self.engine.schedule(&key.to_string(), &name, trigger, target)
    }

    fn sync_key(&self, key: JobKey) -> Result<Replaced> {
        let _serial = self.serial.lock().unwrap_or_else(PoisonError::into_inner);
        let db = self.engine.store().path();
        self.engine.schedule_with(&key.to_string(), |conn| {
            match self.weekly.get_within(conn, db, key.subject, key.weekday, key.kind)? {
                Some(current) if current.recurrence_enabled => self.plan_entry(&current).map(Some),
                _ => Ok(None),
            }
        })
    }

    fn plan_entry(&self, entry: &WeeklyConfigEntry) -> Result<(String, TriggerSpec, JobTarget)> {
        let trigger = compose(entry, self.clock.now(), self.lead_minutes)?;
        let name = format!(
            "{} for subject {} on {} at {}",
            entry.payload_kind,
            entry.subject_id,
            entry.weekday_name(),
            entry.time_of_day
        );
        let target = JobTarget::new(handler_for(entry.payload_kind), serde_json::to_value(entry)?);
        Ok((name, trigger, target))
    }

    /// Cancel jobs sharing `keep`'s subject and kind whose weekday has no
    /// active entry any more.
    fn prune_siblings(&self, keep: JobKey) -> Result<()> {
        let prefix = JobKey::sibling_prefix(keep.kind, keep.subject);
        for id in self.engine.store().ids_with_prefix(&prefix)? {
            let Ok(key) = id.parse::<JobKey>() else {
                warn!(job_id = %id, "unexpected job id under entry prefix");
                continue;
            };
            if key == keep {
                continue;
            }
            let still_active = self
                .weekly
                .get(keep.subject, key.weekday, keep.kind)?
                .is_some_and(|e| e.recurrence_enabled);
            if !still_active {
                info!(job_id = %id, "entry moved away, cancelling old job");
                self.engine.cancel(&id)?;
            }
        }
        Ok(())
    }
}
