// Shared fixtures for the scheduler integration tests.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::America::Bogota;

use trainer_core::types::{PayloadKind, SubjectId, TimeOfDay, WeeklyConfigEntry};
use trainer_core::{ManualClock, ZonedClock};
use trainer_scheduler::engine::{EngineOptions, FireContext, HandlerError, JobHandler};
use trainer_scheduler::reconfigure::{REMINDER_HANDLER, REPORT_HANDLER};
use trainer_scheduler::{JobStore, Reconfigurator, SchedulerEngine, SqliteWeeklyStore};

pub const LEAD_MINUTES: u32 = 5;

/// A civil instant in Bogota (UTC-5, no DST). 2024-01-01 is a Monday.
pub fn bogota(d: u32, h: u32, m: u32) -> DateTime<Utc> {
    Bogota
        .with_ymd_and_hms(2024, 1, d, h, m, 0)
        .unwrap()
        .with_timezone(&Utc)
}

pub fn entry(subject: i64, weekday: u8, time: &str) -> WeeklyConfigEntry {
    WeeklyConfigEntry {
        subject_id: SubjectId(subject),
        weekday,
        time_of_day: time.parse::<TimeOfDay>().unwrap(),
        payload_kind: PayloadKind::Reminder,
        recurrence_enabled: true,
        chat_id: subject * 100,
        session_type: Some("Funcional".into()),
        location: None,
    }
}

/// Counts invocations and records the jobs it was called for.
#[derive(Default)]
pub struct Recorder {
    pub runs: AtomicUsize,
    pub seen: Mutex<Vec<(String, DateTime<Utc>)>>,
}

impl Recorder {
    pub fn count(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl JobHandler for Recorder {
    fn run(&self, ctx: &FireContext<'_>) -> Result<(), HandlerError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .push((ctx.job.id.clone(), ctx.scheduled_for));
        Ok(())
    }
}

/// Blocks inside `run` until the test releases it.
pub struct Gate {
    pub runs: AtomicUsize,
    started: Mutex<Sender<()>>,
    release: Mutex<Receiver<()>>,
}

pub struct GateControl {
    pub started: Receiver<()>,
    pub release: Sender<()>,
}

impl Gate {
    pub fn new() -> (Arc<Gate>, GateControl) {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let gate = Arc::new(Gate {
            runs: AtomicUsize::new(0),
            started: Mutex::new(started_tx),
            release: Mutex::new(release_rx),
        });
        (
            gate,
            GateControl {
                started: started_rx,
                release: release_tx,
            },
        )
    }
}

impl JobHandler for Gate {
    fn run(&self, _ctx: &FireContext<'_>) -> Result<(), HandlerError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let _ = self.started.lock().unwrap().send(());
        let _ = self
            .release
            .lock()
            .unwrap()
            .recv_timeout(Duration::from_secs(5));
        Ok(())
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub clock: ManualClock,
    pub engine: Arc<SchedulerEngine>,
    pub weekly: Arc<SqliteWeeklyStore>,
    pub reconfig: Reconfigurator,
    pub recorder: Arc<Recorder>,
}

impl Harness {
    pub fn new(start: DateTime<Utc>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self::at_path(dir, start)
    }

    /// Build a harness over an existing directory, as a restarted process would.
    pub fn at_path(dir: tempfile::TempDir, start: DateTime<Utc>) -> Self {
        let db = db_path(&dir);
        let clock = ManualClock::new(start);
        let engine = Arc::new(SchedulerEngine::new(
            JobStore::open(&db).unwrap(),
            Arc::new(clock.clone()),
            EngineOptions {
                poll_interval: Duration::from_millis(20),
                misfire_grace: None,
            },
        ));
        let recorder = Arc::new(Recorder::default());
        engine.register_handler(REMINDER_HANDLER, recorder.clone());
        engine.register_handler(REPORT_HANDLER, recorder.clone());

        let weekly = Arc::new(SqliteWeeklyStore::open(&db).unwrap());
        let reconfig = Reconfigurator::new(
            engine.clone(),
            weekly.clone(),
            ZonedClock::new(Arc::new(clock.clone()), Bogota),
            LEAD_MINUTES,
        );
        Self {
            dir,
            clock,
            engine,
            weekly,
            reconfig,
            recorder,
        }
    }

    /// Write the entry the way the CRUD layer does, then notify.
    pub fn configure(&self, entry: &WeeklyConfigEntry) {
        self.weekly.save(entry).unwrap();
        self.reconfig.on_weekly_entry_changed(entry).unwrap();
    }

    pub fn job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .engine
            .list_jobs()
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        ids.sort();
        ids
    }

    /// Stop the worker and hand back the database directory.
    pub fn shutdown(self) -> tempfile::TempDir {
        self.engine.stop();
        self.dir
    }
}

pub fn db_path(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("entrena.db")
}
