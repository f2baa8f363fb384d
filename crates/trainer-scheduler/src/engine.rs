use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{debug, error, info, warn};

use trainer_core::config::SchedulerConfig;
use trainer_core::Clock;

use crate::error::{Result, SchedulerError};
use crate::store::{JobStore, Replaced, Replacement};
use crate::trigger::TriggerSpec;
use crate::types::{JobState, JobTarget, ScheduledJob};

/// Floor on the worker's sleep so a job stuck in the past cannot spin it.
const MIN_WAIT: Duration = Duration::from_millis(25);

/// Error type handlers report back to the engine.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// What a handler sees when its job fires.
#[derive(Debug)]
pub struct FireContext<'a> {
    pub job: &'a ScheduledJob,
    /// The occurrence being served. Earlier than `fired_at` on catch-up runs.
    pub scheduled_for: DateTime<Utc>,
    pub fired_at: DateTime<Utc>,
}

/// A named target jobs can point at. Runs on the engine's worker thread.
pub trait JobHandler: Send + Sync {
    fn run(&self, ctx: &FireContext<'_>) -> std::result::Result<(), HandlerError>;
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Upper bound on how long the worker sleeps between store scans.
    pub poll_interval: Duration,
    /// Occurrences later than this are skipped instead of run. `None` runs
    /// one coalesced catch-up regardless of lateness.
    pub misfire_grace: Option<chrono::Duration>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            misfire_grace: None,
        }
    }
}

impl EngineOptions {
    pub fn from_config(cfg: &SchedulerConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(cfg.poll_interval_ms.max(10)),
            misfire_grace: cfg
                .misfire_grace_secs
                .and_then(|s| i64::try_from(s).ok())
                .map(chrono::Duration::seconds),
        }
    }
}

/// Result of a manual [`SchedulerEngine::run_now`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed(String),
    /// The job is already firing; nothing was invoked.
    AlreadyRunning,
}

#[derive(Default)]
struct WakeState {
    shutdown: bool,
    dirty: bool,
}

struct Shared {
    store: JobStore,
    clock: Arc<dyn Clock>,
    options: EngineOptions,
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
    in_flight: Mutex<HashSet<String>>,
    wake: Mutex<WakeState>,
    wake_cv: Condvar,
}

/// Persistent job scheduler driven by a dedicated worker thread.
///
/// The store is the only source of truth: nothing about a job lives in
/// memory except whether it is currently firing. Restarting the process and
/// creating a new engine on the same database resumes every job.
pub struct SchedulerEngine {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SchedulerEngine {
    pub fn new(store: JobStore, clock: Arc<dyn Clock>, options: EngineOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                clock,
                options,
                handlers: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(HashSet::new()),
                wake: Mutex::new(WakeState::default()),
                wake_cv: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn register_handler(&self, name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let name = name.into();
        debug!(handler = %name, "handler registered");
        self.shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, handler);
    }

    pub fn store(&self) -> &JobStore {
        &self.shared.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.shared.clock
    }

    /// Create or atomically replace job `id`.
    ///
    /// The job is durable when this returns. Fails with `TriggerExhausted`
    /// if the trigger has no occurrence after now, and with a database error
    /// if the write did not happen.
    pub fn schedule(
        &self,
        id: &str,
        name: &str,
        trigger: TriggerSpec,
        target: JobTarget,
    ) -> Result<ScheduledJob> {
        trigger.validate().map_err(SchedulerError::InvalidSchedule)?;
        let now = self.shared.clock.now_utc();
        let trigger = trigger.compact(now);
        let next = trigger
            .next_fire_after(now)
            .ok_or_else(|| SchedulerError::TriggerExhausted { id: id.to_string() })?;

        let job = self
            .shared
            .store
            .upsert(id, name, &trigger, &target, Some(next), now)?;
        info!(
            job_id = %id,
            trigger = %job.trigger,
            next_fire_at = %next,
            revision = job.revision,
            "job scheduled"
        );
        self.shared.notify();
        Ok(job)
    }

    /// Like [`SchedulerEngine::schedule`], but the job is decided by `plan`
    /// while the store holds its write lock.
    ///
    /// `plan` may read other tables of the job database through the
    /// connection it is given. `None` removes job `id`.
    pub fn schedule_with<F>(&self, id: &str, plan: F) -> Result<Replaced>
    where
        F: FnOnce(&Connection) -> Result<Option<(String, TriggerSpec, JobTarget)>>,
    {
        let now = self.shared.clock.now_utc();
        let replaced = self.shared.store.replace_with(id, now, |conn| {
            let Some((name, trigger, target)) = plan(conn)? else {
                return Ok(Replacement::Remove);
            };
            trigger.validate().map_err(SchedulerError::InvalidSchedule)?;
            let trigger = trigger.compact(now);
            let next_fire_at = trigger
                .next_fire_after(now)
                .ok_or_else(|| SchedulerError::TriggerExhausted { id: id.to_string() })?;
            Ok(Replacement::Job {
                name,
                trigger,
                target,
                next_fire_at,
            })
        })?;
        match &replaced {
            Replaced::Upserted(job) => info!(
                job_id = %id,
                trigger = %job.trigger,
                next_fire_at = ?job.next_fire_at,
                revision = job.revision,
                "job scheduled"
            ),
            Replaced::Removed { existed: true } => info!(job_id = %id, "job cancelled"),
            Replaced::Removed { existed: false } => debug!(job_id = %id, "no job to cancel"),
        }
        self.shared.notify();
        Ok(replaced)
    }

    /// Remove job `id`. Missing jobs are not an error.
    ///
    /// An invocation already firing runs to completion; nothing further is
    /// scheduled for it.
    pub fn cancel(&self, id: &str) -> Result<bool> {
        let existed = self.shared.store.delete(id)?;
        if existed {
            info!(job_id = %id, "job cancelled");
            self.shared.notify();
        } else {
            debug!(job_id = %id, "cancel: no such job");
        }
        Ok(existed)
    }

    pub fn list_jobs(&self) -> Result<Vec<ScheduledJob>> {
        self.shared.store.list()
    }

    pub fn get_job(&self, id: &str) -> Result<Option<ScheduledJob>> {
        self.shared.store.get(id)
    }

    pub fn job_state(&self, id: &str) -> Result<JobState> {
        if self.shared.is_in_flight(id) {
            return Ok(JobState::Firing);
        }
        Ok(match self.shared.store.get(id)? {
            Some(_) => JobState::Pending,
            None => JobState::Removed,
        })
    }

    /// Start the worker thread. Calling it again while running is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            debug!("scheduler already running");
            return Ok(());
        }
        self.shared.wake_state().shutdown = false;

        let jobs = self.shared.store.list()?;
        let now = self.shared.clock.now_utc();
        let overdue = jobs
            .iter()
            .filter(|j| j.next_fire_at.is_some_and(|t| t <= now))
            .count();
        info!(jobs = jobs.len(), overdue, "scheduler engine starting");

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("trainer-scheduler".into())
            .spawn(move || shared.run_loop())?;
        *worker = Some(handle);
        Ok(())
    }

    /// Stop the worker and wait for it. An invocation in progress finishes
    /// first (deliveries are themselves time-bounded).
    pub fn stop(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };
        self.shared.wake_state().shutdown = true;
        self.shared.wake_cv.notify_all();
        if handle.join().is_err() {
            error!("scheduler worker panicked");
        }
        info!("scheduler engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Fire every job that is due now. Returns how many were invoked.
    ///
    /// The worker calls this on its own; it is public so callers driving a
    /// manual clock can step the engine deterministically.
    pub fn tick(&self) -> Result<usize> {
        self.shared.tick()
    }

    /// Invoke job `id`'s target immediately on the calling thread.
    ///
    /// Does not move the job's schedule.
    pub fn run_now(&self, id: &str) -> Result<RunOutcome> {
        let job = self
            .shared
            .store
            .get(id)?
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })?;
        let Some(_guard) = InFlightGuard::claim(&self.shared.in_flight, id) else {
            info!(job_id = %id, "manual run skipped, job already firing");
            return Ok(RunOutcome::AlreadyRunning);
        };
        let now = self.shared.clock.now_utc();
        info!(job_id = %id, "manual run");
        Ok(match self.shared.invoke(&job, now, now) {
            Ok(()) => RunOutcome::Completed,
            Err(detail) => RunOutcome::Failed(detail),
        })
    }
}

impl Drop for SchedulerEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn wake_state(&self) -> std::sync::MutexGuard<'_, WakeState> {
        self.wake.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.wake_state().dirty = true;
        self.wake_cv.notify_all();
    }

    fn is_shutting_down(&self) -> bool {
        self.wake_state().shutdown
    }

    fn is_in_flight(&self, id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    fn run_loop(&self) {
        info!("scheduler worker started");
        loop {
            if self.is_shutting_down() {
                break;
            }
            if let Err(e) = self.tick() {
                error!(error = %e, "scheduler tick failed");
            }

            let wait = self.next_wait();
            let mut state = self.wake_state();
            if !state.shutdown && !state.dirty {
                state = self
                    .wake_cv
                    .wait_timeout(state, wait)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            state.dirty = false;
        }
        info!("scheduler worker exiting");
    }

    /// Sleep until the earliest due job, capped at the poll interval.
    fn next_wait(&self) -> Duration {
        let poll = self.options.poll_interval;
        match self.store.next_due_at() {
            Ok(Some(at)) => (at - self.clock.now_utc())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .clamp(MIN_WAIT, poll.max(MIN_WAIT)),
            Ok(None) => poll,
            Err(e) => {
                warn!(error = %e, "could not read next due time");
                poll
            }
        }
    }

    fn tick(&self) -> Result<usize> {
        let now = self.clock.now_utc();
        let due = self.store.due(now)?;
        let mut fired = 0;
        for job in due {
            if self.is_shutting_down() {
                debug!("shutdown requested, leaving remaining due jobs");
                break;
            }
            match self.fire(job, now) {
                Ok(true) => fired += 1,
                Ok(false) => {}
                Err(e) => error!(error = %e, "failed to advance job"),
            }
        }
        Ok(fired)
    }

    /// Serve the due occurrence of `job`. Returns whether the target ran.
    fn fire(&self, job: ScheduledJob, now: DateTime<Utc>) -> Result<bool> {
        let Some(_guard) = InFlightGuard::claim(&self.in_flight, &job.id) else {
            debug!(job_id = %job.id, "still firing, occurrence deferred");
            return Ok(false);
        };
        let Some(scheduled_for) = job.next_fire_at else {
            return Ok(false);
        };

        // Every missed occurrence up to now collapses into this one run.
        let trigger = job.trigger.compact(now);
        let next = trigger.next_fire_after(now);

        let late_by = now - scheduled_for;
        let missed = self
            .options
            .misfire_grace
            .is_some_and(|grace| late_by > grace);

        // The store moves first: once advanced, a crash cannot replay this
        // occurrence, and a concurrent replace or cancel makes this a no-op.
        let fired_at = (!missed).then_some(now);
        if !self.store.advance(&job, &trigger, next, fired_at, now)? {
            debug!(job_id = %job.id, "job changed since it was read, skipping");
            return Ok(false);
        }
        match next {
            Some(next) => debug!(job_id = %job.id, next_fire_at = %next, "job advanced"),
            None => info!(job_id = %job.id, "trigger exhausted, job removed"),
        }

        if missed {
            warn!(
                job_id = %job.id,
                scheduled_for = %scheduled_for,
                late_secs = late_by.num_seconds(),
                outcome = "missed",
                "occurrence outside misfire grace, skipped"
            );
            return Ok(false);
        }

        // Outcome is logged by `invoke`; the job stays scheduled either way.
        let _ = self.invoke(&job, scheduled_for, now);
        Ok(true)
    }

    /// Call the job's handler, containing errors and panics.
    fn invoke(
        &self,
        job: &ScheduledJob,
        scheduled_for: DateTime<Utc>,
        fired_at: DateTime<Utc>,
    ) -> std::result::Result<(), String> {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job.target.handler)
            .cloned();
        let Some(handler) = handler else {
            error!(
                job_id = %job.id,
                handler = %job.target.handler,
                scheduled_for = %scheduled_for,
                outcome = "config_error",
                "no handler registered for job target"
            );
            return Err(format!("no handler registered: {}", job.target.handler));
        };

        let ctx = FireContext {
            job,
            scheduled_for,
            fired_at,
        };
        match catch_unwind(AssertUnwindSafe(|| handler.run(&ctx))) {
            Ok(Ok(())) => {
                info!(job_id = %job.id, scheduled_for = %scheduled_for, outcome = "ok", "job fired");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(
                    job_id = %job.id,
                    scheduled_for = %scheduled_for,
                    outcome = "error",
                    error = %e,
                    "job target failed"
                );
                Err(e.to_string())
            }
            Err(panic) => {
                let detail = panic_message(panic.as_ref());
                error!(
                    job_id = %job.id,
                    scheduled_for = %scheduled_for,
                    outcome = "panic",
                    panic = %detail,
                    "job target panicked"
                );
                Err(format!("panicked: {detail}"))
            }
        }
    }
}

/// Marks a job id as firing for as long as it is held.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    id: String,
}

impl<'a> InFlightGuard<'a> {
    fn claim(set: &'a Mutex<HashSet<String>>, id: &str) -> Option<Self> {
        let inserted = set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string());
        inserted.then(|| Self {
            set,
            id: id.to_string(),
        })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
