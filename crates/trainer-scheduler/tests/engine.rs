mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::America::Bogota;
use rusqlite::Connection;
use serde_json::json;

use common::{bogota, db_path, entry, Gate, Harness};
use trainer_core::TimeOfDay;
use trainer_scheduler::engine::{FireContext, HandlerError, JobHandler};
use trainer_scheduler::{JobState, JobTarget, RunOutcome, SchedulerError, TriggerSpec};

fn monday_five_am() -> TriggerSpec {
    TriggerSpec::Weekly {
        weekday: 0,
        time: TimeOfDay::new(5, 0).unwrap(),
        tz: Bogota,
        lead_minutes: 0,
    }
}

fn wait_for(cond: impl Fn() -> bool) {
    for _ in 0..250 {
        if cond() {
            return;
        }
        std::thread::sleep(StdDuration::from_millis(20));
    }
    panic!("condition not met in time");
}

#[test]
fn jobs_survive_a_restart_and_coalesce_missed_runs() {
    let h = Harness::new(bogota(1, 4, 50));
    h.configure(&entry(42, 0, "05:00"));
    let before = h.engine.get_job("reminder_42_0").unwrap().unwrap();
    let dir = h.shutdown();

    // Process comes back three weeks later.
    let h = Harness::at_path(dir, bogota(22, 9, 0));
    let jobs = h.engine.list_jobs().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, "reminder_42_0");
    assert_eq!(jobs[0].next_fire_at, before.next_fire_at);
    assert_eq!(jobs[0].trigger, before.trigger);

    assert_eq!(h.engine.tick().unwrap(), 1);
    assert_eq!(h.engine.tick().unwrap(), 0);
    assert_eq!(h.recorder.count(), 1);
    {
        let seen = h.recorder.seen.lock().unwrap();
        assert_eq!(seen[0].1, bogota(1, 4, 55));
    }
    let job = h.engine.get_job("reminder_42_0").unwrap().unwrap();
    assert_eq!(job.next_fire_at, Some(bogota(29, 4, 55)));
}

#[test]
fn worker_fires_due_jobs_on_its_own() {
    let h = Harness::new(bogota(1, 4, 50));
    h.configure(&entry(42, 0, "05:00"));
    h.engine.start().unwrap();

    h.clock.set(bogota(1, 4, 55));
    wait_for(|| h.recorder.count() == 1);
    h.engine.stop();
    assert_eq!(h.recorder.count(), 1);
    assert_eq!(
        h.engine.job_state("reminder_42_0").unwrap(),
        JobState::Pending
    );
}

#[test]
fn at_most_one_invocation_in_flight_per_job() {
    let h = Harness::new(bogota(1, 4, 0));
    let (gate, control) = Gate::new();
    h.engine.register_handler("gate", gate.clone());
    h.engine
        .schedule(
            "gated",
            "gated",
            monday_five_am(),
            JobTarget::new("gate", json!({})),
        )
        .unwrap();

    h.clock.set(bogota(1, 5, 0));
    h.engine.start().unwrap();
    control
        .started
        .recv_timeout(StdDuration::from_secs(5))
        .unwrap();

    assert_eq!(h.engine.job_state("gated").unwrap(), JobState::Firing);
    assert_eq!(h.engine.run_now("gated").unwrap(), RunOutcome::AlreadyRunning);
    // Already advanced to next week, so a concurrent tick has nothing to do.
    assert_eq!(h.engine.tick().unwrap(), 0);

    control.release.send(()).unwrap();
    wait_for(|| h.engine.job_state("gated").unwrap() == JobState::Pending);
    h.engine.stop();
    assert_eq!(gate.runs.load(Ordering::SeqCst), 1);
}

#[test]
fn cancel_during_firing_lets_the_run_finish_and_schedules_nothing() {
    let h = Harness::new(bogota(1, 4, 0));
    let (gate, control) = Gate::new();
    h.engine.register_handler("gate", gate.clone());
    h.engine
        .schedule(
            "gated",
            "gated",
            monday_five_am(),
            JobTarget::new("gate", json!({})),
        )
        .unwrap();

    h.clock.set(bogota(1, 5, 0));
    h.engine.start().unwrap();
    control
        .started
        .recv_timeout(StdDuration::from_secs(5))
        .unwrap();

    assert!(h.engine.cancel("gated").unwrap());
    control.release.send(()).unwrap();
    wait_for(|| h.engine.job_state("gated").unwrap() == JobState::Removed);
    h.engine.stop();

    h.clock.set(bogota(8, 5, 0));
    assert_eq!(h.engine.tick().unwrap(), 0);
    assert!(h.engine.get_job("gated").unwrap().is_none());
    assert_eq!(gate.runs.load(Ordering::SeqCst), 1);
}

#[test]
fn cancel_is_idempotent() {
    let h = Harness::new(bogota(1, 4, 0));
    assert!(!h.engine.cancel("never-existed").unwrap());
    h.configure(&entry(42, 0, "05:00"));
    assert!(h.engine.cancel("reminder_42_0").unwrap());
    assert!(!h.engine.cancel("reminder_42_0").unwrap());
    assert_eq!(
        h.engine.job_state("reminder_42_0").unwrap(),
        JobState::Removed
    );
}

/// Fails, then panics, then succeeds.
#[derive(Default)]
struct Flaky {
    calls: AtomicUsize,
}

impl JobHandler for Flaky {
    fn run(&self, _ctx: &FireContext<'_>) -> Result<(), HandlerError> {
        match self.calls.fetch_add(1, Ordering::SeqCst) {
            0 => Err("channel rejected the message".into()),
            1 => panic!("renderer blew up"),
            _ => Ok(()),
        }
    }
}

#[test]
fn failing_targets_keep_their_job_scheduled() {
    let h = Harness::new(bogota(1, 4, 0));
    let flaky = Arc::new(Flaky::default());
    h.engine.register_handler("flaky", flaky.clone());
    h.engine
        .schedule(
            "flaky",
            "flaky",
            monday_five_am(),
            JobTarget::new("flaky", json!({})),
        )
        .unwrap();

    for (week, day) in [(0, 1), (1, 8), (2, 15)] {
        h.clock.set(bogota(day, 5, 0));
        assert_eq!(h.engine.tick().unwrap(), 1, "week {week}");
        let job = h.engine.get_job("flaky").unwrap().unwrap();
        assert_eq!(job.next_fire_at, Some(bogota(day + 7, 5, 0)));
    }
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);

    // A panic in one job does not stop the worker from serving others.
    h.configure(&entry(42, 1, "06:00"));
    h.clock.set(bogota(16, 5, 55));
    assert_eq!(h.engine.tick().unwrap(), 1);
    assert_eq!(h.recorder.count(), 1);
}

#[test]
fn persistence_failure_surfaces_from_schedule() {
    let h = Harness::new(bogota(1, 4, 0));
    let conn = Connection::open(db_path(&h.dir)).unwrap();
    conn.execute_batch("DROP TABLE scheduled_jobs;").unwrap();

    let err = h
        .engine
        .schedule(
            "j",
            "j",
            monday_five_am(),
            JobTarget::new("weekly_reminder", json!({})),
        )
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Database(_)), "{err}");
    assert!(h.engine.cancel("j").is_err());
}

#[test]
fn run_now_invokes_without_moving_the_schedule() {
    let h = Harness::new(bogota(1, 4, 0));
    h.configure(&entry(42, 3, "05:00"));
    let next: Option<DateTime<Utc>> = h
        .engine
        .get_job("reminder_42_3")
        .unwrap()
        .unwrap()
        .next_fire_at;

    assert_eq!(h.engine.run_now("reminder_42_3").unwrap(), RunOutcome::Completed);
    assert_eq!(h.recorder.count(), 1);
    assert_eq!(
        h.engine.get_job("reminder_42_3").unwrap().unwrap().next_fire_at,
        next
    );
}

#[test]
fn stop_returns_promptly_when_idle() {
    let h = Harness::new(bogota(1, 4, 0));
    h.configure(&entry(42, 3, "05:00"));
    h.engine.start().unwrap();
    h.clock.set(bogota(1, 4, 0) + Duration::minutes(1));
    let started = std::time::Instant::now();
    h.engine.stop();
    assert!(started.elapsed() < StdDuration::from_secs(2));
    assert!(!h.engine.is_running());
}

#[test]
fn stop_waits_for_the_invocation_in_flight() {
    let h = Harness::new(bogota(1, 4, 0));
    let (gate, control) = Gate::new();
    h.engine.register_handler("gate", gate.clone());
    h.engine
        .schedule(
            "gated",
            "gated",
            monday_five_am(),
            JobTarget::new("gate", json!({})),
        )
        .unwrap();

    h.clock.set(bogota(1, 5, 0));
    h.engine.start().unwrap();
    control
        .started
        .recv_timeout(StdDuration::from_secs(5))
        .unwrap();

    let (stopped_tx, stopped_rx) = std::sync::mpsc::channel();
    let engine = Arc::clone(&h.engine);
    let stopper = std::thread::spawn(move || {
        engine.stop();
        stopped_tx.send(()).unwrap();
    });

    assert!(stopped_rx
        .recv_timeout(StdDuration::from_millis(200))
        .is_err());
    assert_eq!(h.engine.job_state("gated").unwrap(), JobState::Firing);

    control.release.send(()).unwrap();
    stopped_rx.recv_timeout(StdDuration::from_secs(5)).unwrap();
    stopper.join().unwrap();
    assert!(!h.engine.is_running());
    assert_eq!(gate.runs.load(Ordering::SeqCst), 1);
    assert_eq!(h.engine.job_state("gated").unwrap(), JobState::Pending);
}
