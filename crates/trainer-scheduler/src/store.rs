use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, instrument, warn};

use crate::db::init_db;
use crate::error::{Result, SchedulerError};
use crate::trigger::TriggerSpec;
use crate::types::{JobTarget, ScheduledJob};

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const JOB_COLUMNS: &str = "id, name, trigger_spec, target, next_fire_at, last_fired_at,
                           fire_count, revision, created_at, updated_at";

/// Durable job table keyed by job id.
///
/// Holds only the database path. Every operation opens its own connection,
/// uses it and drops it, so no connection outlives the call that needed it.
#[derive(Debug, Clone)]
pub struct JobStore {
    path: PathBuf,
    busy_timeout: Duration,
}

impl JobStore {
    /// Point the store at `path` and make sure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        };
        let conn = store.connect()?;
        init_db(&conn)?;
        Ok(store)
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Ok(conn)
    }

    /// Insert or atomically replace the job `id`.
    ///
    /// Runs under SQLite's write lock (`BEGIN IMMEDIATE`), so concurrent
    /// writers of the same id serialise and exactly one row remains. The
    /// revision is bumped on every replace, which invalidates any fire
    /// bookkeeping the worker computed against the previous trigger.
    #[instrument(skip(self, trigger, target), fields(job_id = %id))]
    pub fn upsert(
        &self,
        id: &str,
        name: &str,
        trigger: &TriggerSpec,
        target: &JobTarget,
        next_fire_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<ScheduledJob> {
        let trigger_json = serde_json::to_string(trigger)?;
        let target_json = serde_json::to_string(target)?;
        let now_str = now.to_rfc3339();

        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let raw = write_job(&tx, id, name, &trigger_json, &target_json, next_fire_at, &now_str)?;
        tx.commit()?;

        let job = raw.into_job()?;
        debug!(revision = job.revision, "job upserted");
        Ok(job)
    }

    /// Decide and apply the row for `id` inside one `BEGIN IMMEDIATE`
    /// transaction.
    ///
    /// `plan` runs on the open transaction, so whatever it reads from this
    /// database cannot change before the job row is written. Returning
    /// `Replacement::Remove` deletes the row instead.
    #[instrument(skip(self, plan), fields(job_id = %id))]
    pub fn replace_with<F>(&self, id: &str, now: DateTime<Utc>, plan: F) -> Result<Replaced>
    where
        F: FnOnce(&Connection) -> Result<Replacement>,
    {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let raw = match plan(&tx)? {
            Replacement::Job {
                name,
                trigger,
                target,
                next_fire_at,
            } => write_job(
                &tx,
                id,
                &name,
                &serde_json::to_string(&trigger)?,
                &serde_json::to_string(&target)?,
                Some(next_fire_at),
                &now.to_rfc3339(),
            )?,
            Replacement::Remove => {
                let n = tx.execute("DELETE FROM scheduled_jobs WHERE id = ?1", params![id])?;
                tx.commit()?;
                return Ok(Replaced::Removed { existed: n > 0 });
            }
        };
        tx.commit()?;

        let job = raw.into_job()?;
        debug!(revision = job.revision, "job replaced");
        Ok(Replaced::Upserted(job))
    }

    /// Delete `id`. Returns whether a row existed.
    #[instrument(skip(self), fields(job_id = %id))]
    pub fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.connect()?;
        let n = conn.execute("DELETE FROM scheduled_jobs WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    pub fn get(&self, id: &str) -> Result<Option<ScheduledJob>> {
        let conn = self.connect()?;
        let raw = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM scheduled_jobs WHERE id = ?1"),
                params![id],
                RawJob::from_row,
            )
            .optional()?;
        raw.map(RawJob::into_job).transpose()
    }

    /// Every job, soonest first. Rows that no longer decode are skipped.
    pub fn list(&self) -> Result<Vec<ScheduledJob>> {
        self.query_jobs(
            &format!(
                "SELECT {JOB_COLUMNS} FROM scheduled_jobs
                 ORDER BY next_fire_at IS NULL, next_fire_at, id"
            ),
            params![],
        )
    }

    /// Ids that start with `prefix`, e.g. all reminder jobs of one subject.
    pub fn ids_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT id FROM scheduled_jobs WHERE substr(id, 1, length(?1)) = ?1")?;
        let ids = stmt
            .query_map(params![prefix], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    /// Jobs whose next fire time is at or before `now`.
    pub fn due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>> {
        self.query_jobs(
            &format!(
                "SELECT {JOB_COLUMNS} FROM scheduled_jobs
                 WHERE next_fire_at IS NOT NULL AND next_fire_at <= ?1
                 ORDER BY next_fire_at, id"
            ),
            params![now.timestamp_millis()],
        )
    }

    /// Earliest pending fire time across all jobs.
    pub fn next_due_at(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.connect()?;
        let ms: Option<i64> = conn.query_row(
            "SELECT MIN(next_fire_at) FROM scheduled_jobs",
            [],
            |row| row.get(0),
        )?;
        Ok(ms.and_then(DateTime::from_timestamp_millis))
    }

    /// Move `job` past an occurrence: to `next`, or delete it when `next` is
    /// `None`. `fired_at` is `Some` when the occurrence was actually run and
    /// `None` when it was skipped as missed.
    ///
    /// Only applies if the row still carries the revision `job` was read at.
    /// Returns `false` when the job was replaced or cancelled meanwhile; the
    /// newer write wins and nothing is touched.
    #[instrument(skip(self, job, trigger), fields(job_id = %job.id, revision = job.revision))]
    pub fn advance(
        &self,
        job: &ScheduledJob,
        trigger: &TriggerSpec,
        next: Option<DateTime<Utc>>,
        fired_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.connect()?;
        let n = match next {
            Some(next) => conn.execute(
                "UPDATE scheduled_jobs SET
                    trigger_spec  = ?1,
                    next_fire_at  = ?2,
                    last_fired_at = COALESCE(?3, last_fired_at),
                    fire_count    = fire_count + (?3 IS NOT NULL),
                    revision      = revision + 1,
                    updated_at    = ?4
                 WHERE id = ?5 AND revision = ?6",
                params![
                    serde_json::to_string(trigger)?,
                    next.timestamp_millis(),
                    fired_at.map(|t| t.timestamp_millis()),
                    now.to_rfc3339(),
                    job.id,
                    job.revision
                ],
            )?,
            None => conn.execute(
                "DELETE FROM scheduled_jobs WHERE id = ?1 AND revision = ?2",
                params![job.id, job.revision],
            )?,
        };
        Ok(n > 0)
    }

    fn query_jobs(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<ScheduledJob>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(sql)?;
        let raws = stmt
            .query_map(params, RawJob::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(raws
            .into_iter()
            .filter_map(|raw| {
                let id = raw.id.clone();
                match raw.into_job() {
                    Ok(job) => Some(job),
                    Err(e) => {
                        warn!(job_id = %id, error = %e, "skipping undecodable job row");
                        None
                    }
                }
            })
            .collect())
    }
}

/// Row a [`JobStore::replace_with`] plan asks for.
#[derive(Debug, Clone)]
pub enum Replacement {
    Job {
        name: String,
        trigger: TriggerSpec,
        target: JobTarget,
        next_fire_at: DateTime<Utc>,
    },
    Remove,
}

/// What [`JobStore::replace_with`] left behind.
#[derive(Debug, Clone)]
pub enum Replaced {
    Upserted(ScheduledJob),
    Removed { existed: bool },
}

fn write_job(
    conn: &Connection,
    id: &str,
    name: &str,
    trigger_json: &str,
    target_json: &str,
    next_fire_at: Option<DateTime<Utc>>,
    now: &str,
) -> Result<RawJob> {
    conn.execute(
        "INSERT INTO scheduled_jobs
         (id, name, trigger_spec, target, next_fire_at, last_fired_at,
          fire_count, revision, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, NULL, 0, 1, ?6, ?6)
         ON CONFLICT(id) DO UPDATE SET
            name         = excluded.name,
            trigger_spec = excluded.trigger_spec,
            target       = excluded.target,
            next_fire_at = excluded.next_fire_at,
            revision     = scheduled_jobs.revision + 1,
            updated_at   = excluded.updated_at",
        params![
            id,
            name,
            trigger_json,
            target_json,
            next_fire_at.map(|t| t.timestamp_millis()),
            now
        ],
    )?;
    let raw = conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM scheduled_jobs WHERE id = ?1"),
        params![id],
        RawJob::from_row,
    )?;
    Ok(raw)
}

/// Column values as stored, before JSON and timestamp decoding.
struct RawJob {
    id: String,
    name: String,
    trigger_json: String,
    target_json: String,
    next_fire_at: Option<i64>,
    last_fired_at: Option<i64>,
    fire_count: u32,
    revision: i64,
    created_at: String,
    updated_at: String,
}

impl RawJob {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            trigger_json: row.get(2)?,
            target_json: row.get(3)?,
            next_fire_at: row.get(4)?,
            last_fired_at: row.get(5)?,
            fire_count: row.get(6)?,
            revision: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_job(self) -> Result<ScheduledJob> {
        let trigger: TriggerSpec = serde_json::from_str(&self.trigger_json)?;
        let target: JobTarget = serde_json::from_str(&self.target_json)?;
        Ok(ScheduledJob {
            next_fire_at: self.next_fire_at.map(millis_to_utc).transpose()?,
            last_fired_at: self.last_fired_at.map(millis_to_utc).transpose()?,
            created_at: parse_rfc3339(&self.created_at)?,
            updated_at: parse_rfc3339(&self.updated_at)?,
            id: self.id,
            name: self.name,
            trigger,
            target,
            fire_count: self.fire_count,
            revision: self.revision,
        })
    }
}

fn millis_to_utc(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| SchedulerError::InvalidSchedule(format!("timestamp out of range: {ms}")))
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SchedulerError::InvalidSchedule(format!("bad timestamp {s:?}: {e}")))
}
