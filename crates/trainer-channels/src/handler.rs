//! Scheduler job targets that render a payload and deliver it.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{info, info_span, warn};

use trainer_core::render::{PayloadRenderer, ReminderContext};
use trainer_core::types::{PayloadKind, WeeklyConfigEntry};
use trainer_scheduler::engine::{FireContext, HandlerError, JobHandler};
use trainer_scheduler::WeeklyScheduleStore;

use crate::delivery::{DeliveryAdapter, DeliveryOutcome};
use crate::error::DeliveryError;

/// Target for per-entry jobs (reminders and per-subject reports).
///
/// The job's arguments are the [`WeeklyConfigEntry`] it was composed from.
pub struct WeeklyEntryHandler {
    delivery: Arc<DeliveryAdapter>,
    renderer: Arc<dyn PayloadRenderer>,
}

impl WeeklyEntryHandler {
    pub fn new(delivery: Arc<DeliveryAdapter>, renderer: Arc<dyn PayloadRenderer>) -> Self {
        Self { delivery, renderer }
    }

    fn render(&self, entry: &WeeklyConfigEntry) -> String {
        match entry.payload_kind {
            PayloadKind::Reminder => self.renderer.reminder(&ReminderContext::from_entry(entry)),
            PayloadKind::Report => self.renderer.weekly_report(),
        }
    }
}

impl JobHandler for WeeklyEntryHandler {
    fn run(&self, ctx: &FireContext<'_>) -> Result<(), HandlerError> {
        let entry: WeeklyConfigEntry =
            serde_json::from_value(ctx.job.target.args.clone()).map_err(DeliveryError::from)?;
        let span = info_span!(
            "deliver",
            job_id = %ctx.job.id,
            subject_id = %entry.subject_id,
            scheduled_for = %ctx.scheduled_for
        );
        let _enter = span.enter();

        let text = self.render(&entry);
        let outcome = self.delivery.deliver(entry.chat_id, &text);
        into_result(outcome)
    }
}

/// Target for the trainer's weekly broadcast: one message to every subject
/// with an active entry.
pub struct BroadcastHandler {
    delivery: Arc<DeliveryAdapter>,
    renderer: Arc<dyn PayloadRenderer>,
    weekly: Arc<dyn WeeklyScheduleStore>,
}

/// Per-recipient tally of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastSummary {
    pub sent: usize,
    pub failed: usize,
}

impl BroadcastHandler {
    pub fn new(
        delivery: Arc<DeliveryAdapter>,
        renderer: Arc<dyn PayloadRenderer>,
        weekly: Arc<dyn WeeklyScheduleStore>,
    ) -> Self {
        Self {
            delivery,
            renderer,
            weekly,
        }
    }

    /// Deliver the broadcast. A failed recipient never stops the rest.
    pub fn broadcast(&self) -> Result<BroadcastSummary, DeliveryError> {
        let recipients: BTreeSet<i64> = self
            .weekly
            .get_all_active()?
            .into_iter()
            .map(|e| e.chat_id)
            .collect();
        let text = self.renderer.weekly_report();

        let mut summary = BroadcastSummary::default();
        for chat_id in recipients {
            if self.delivery.deliver(chat_id, &text).is_success() {
                summary.sent += 1;
            } else {
                summary.failed += 1;
            }
        }
        Ok(summary)
    }
}

impl JobHandler for BroadcastHandler {
    fn run(&self, ctx: &FireContext<'_>) -> Result<(), HandlerError> {
        let span = info_span!("broadcast", job_id = %ctx.job.id);
        let _enter = span.enter();

        let summary = self.broadcast()?;
        if summary.sent == 0 && summary.failed > 0 {
            return Err(DeliveryError::BroadcastFailed(summary.failed).into());
        }
        if summary.failed > 0 {
            warn!(sent = summary.sent, failed = summary.failed, "broadcast partially delivered");
        } else {
            info!(sent = summary.sent, "broadcast delivered");
        }
        Ok(())
    }
}

fn into_result(outcome: DeliveryOutcome) -> Result<(), HandlerError> {
    if outcome.is_success() {
        return Ok(());
    }
    Err(DeliveryError::Failed {
        kind: outcome.kind(),
        detail: outcome.detail(),
    }
    .into())
}
