use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{instrument, warn};

use trainer_core::types::{PayloadKind, SubjectId, WeeklyConfigEntry};
use trainer_core::CoreError;

use crate::db::init_weekly_schema;
use crate::error::Result;

/// Read access to the weekly configuration owned by the CRUD layer.
pub trait WeeklyScheduleStore: Send + Sync {
    fn get(
        &self,
        subject: SubjectId,
        weekday: u8,
        kind: PayloadKind,
    ) -> Result<Option<WeeklyConfigEntry>>;

    /// Every entry with recurrence enabled.
    fn get_all_active(&self) -> Result<Vec<WeeklyConfigEntry>>;

    /// Read an entry on `conn`, an open write transaction on the job
    /// database at `db`. Stores kept outside that database read on their own.
    fn get_within(
        &self,
        conn: &Connection,
        db: &Path,
        subject: SubjectId,
        weekday: u8,
        kind: PayloadKind,
    ) -> Result<Option<WeeklyConfigEntry>> {
        let _ = (conn, db);
        self.get(subject, weekday, kind)
    }
}

/// `weekly_entries` table in the shared SQLite database.
///
/// Like [`crate::store::JobStore`], each call opens and drops its own
/// connection.
#[derive(Debug, Clone)]
pub struct SqliteWeeklyStore {
    path: PathBuf,
}

const ENTRY_COLUMNS: &str = "subject_id, weekday, time_of_day, payload_kind, recurrence_enabled,
                             chat_id, session_type, location";

impl SqliteWeeklyStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
        };
        init_weekly_schema(&store.connect()?)?;
        Ok(store)
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    /// Write path used by the bot's configuration flow. A second entry for
    /// the same (subject, weekday, kind) replaces the first.
    #[instrument(skip(self, entry), fields(subject_id = %entry.subject_id, weekday = entry.weekday))]
    pub fn save(&self, entry: &WeeklyConfigEntry) -> Result<()> {
        entry.validate()?;
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO weekly_entries
             (subject_id, weekday, time_of_day, payload_kind, recurrence_enabled,
              chat_id, session_type, location, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, CURRENT_TIMESTAMP)
             ON CONFLICT(subject_id, weekday, payload_kind) DO UPDATE SET
                time_of_day        = excluded.time_of_day,
                recurrence_enabled = excluded.recurrence_enabled,
                chat_id            = excluded.chat_id,
                session_type       = excluded.session_type,
                location           = excluded.location,
                updated_at         = excluded.updated_at",
            params![
                entry.subject_id.get(),
                entry.weekday,
                entry.time_of_day.to_string(),
                entry.payload_kind.as_str(),
                entry.recurrence_enabled,
                entry.chat_id,
                entry.session_type,
                entry.location,
            ],
        )?;
        Ok(())
    }

    /// Remove an entry. Returns whether it existed.
    pub fn remove(&self, subject: SubjectId, weekday: u8, kind: PayloadKind) -> Result<bool> {
        let conn = self.connect()?;
        let n = conn.execute(
            "DELETE FROM weekly_entries
             WHERE subject_id = ?1 AND weekday = ?2 AND payload_kind = ?3",
            params![subject.get(), weekday, kind.as_str()],
        )?;
        Ok(n > 0)
    }
}

impl WeeklyScheduleStore for SqliteWeeklyStore {
    fn get(
        &self,
        subject: SubjectId,
        weekday: u8,
        kind: PayloadKind,
    ) -> Result<Option<WeeklyConfigEntry>> {
        read_entry(&self.connect()?, subject, weekday, kind)
    }

    fn get_within(
        &self,
        conn: &Connection,
        db: &Path,
        subject: SubjectId,
        weekday: u8,
        kind: PayloadKind,
    ) -> Result<Option<WeeklyConfigEntry>> {
        if db == self.path.as_path() {
            read_entry(conn, subject, weekday, kind)
        } else {
            self.get(subject, weekday, kind)
        }
    }

    fn get_all_active(&self) -> Result<Vec<WeeklyConfigEntry>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM weekly_entries
             WHERE recurrence_enabled = 1
             ORDER BY subject_id, weekday, payload_kind"
        ))?;
        let raws = stmt
            .query_map([], RawEntry::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(raws
            .into_iter()
            .filter_map(|raw| {
                let (subject, weekday) = (raw.subject_id, raw.weekday);
                match raw.into_entry() {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        warn!(subject_id = subject, weekday, error = %e, "skipping malformed weekly entry");
                        None
                    }
                }
            })
            .collect())
    }
}

fn read_entry(
    conn: &Connection,
    subject: SubjectId,
    weekday: u8,
    kind: PayloadKind,
) -> Result<Option<WeeklyConfigEntry>> {
    let raw = conn
        .query_row(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM weekly_entries
                 WHERE subject_id = ?1 AND weekday = ?2 AND payload_kind = ?3"
            ),
            params![subject.get(), weekday, kind.as_str()],
            RawEntry::from_row,
        )
        .optional()?;
    Ok(raw.map(RawEntry::into_entry).transpose()?)
}

struct RawEntry {
    subject_id: i64,
    weekday: u8,
    time_of_day: String,
    payload_kind: String,
    recurrence_enabled: bool,
    chat_id: i64,
    session_type: Option<String>,
    location: Option<String>,
}

impl RawEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            subject_id: row.get(0)?,
            weekday: row.get(1)?,
            time_of_day: row.get(2)?,
            payload_kind: row.get(3)?,
            recurrence_enabled: row.get(4)?,
            chat_id: row.get(5)?,
            session_type: row.get(6)?,
            location: row.get(7)?,
        })
    }

    fn into_entry(self) -> std::result::Result<WeeklyConfigEntry, CoreError> {
        Ok(WeeklyConfigEntry {
            subject_id: SubjectId(self.subject_id),
            weekday: self.weekday,
            time_of_day: self.time_of_day.parse()?,
            payload_kind: self.payload_kind.parse()?,
            recurrence_enabled: self.recurrence_enabled,
            chat_id: self.chat_id,
            session_type: self.session_type,
            location: self.location,
        })
    }
}
