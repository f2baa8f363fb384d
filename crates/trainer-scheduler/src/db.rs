use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `scheduled_jobs` table (idempotent) and an index on
/// `next_fire_at` so the due-jobs scan stays cheap.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS scheduled_jobs (
            id            TEXT    NOT NULL PRIMARY KEY,
            name          TEXT    NOT NULL,
            trigger_spec  TEXT    NOT NULL,   -- JSON-encoded TriggerSpec
            target        TEXT    NOT NULL,   -- JSON-encoded JobTarget (handler + args)
            next_fire_at  INTEGER,            -- epoch millis UTC, NULL when exhausted
            last_fired_at INTEGER,
            fire_count    INTEGER NOT NULL DEFAULT 0,
            revision      INTEGER NOT NULL DEFAULT 1,
            created_at    TEXT    NOT NULL,
            updated_at    TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_scheduled_jobs_next_fire
            ON scheduled_jobs (next_fire_at);
        ",
    )?;
    Ok(())
}

/// Create the weekly schedule table the CRUD layer writes to.
///
/// The scheduling core only ever reads this table; the binary calls this so
/// a fresh database is usable before the CRUD layer has run its migrations.
pub fn init_weekly_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS weekly_entries (
            subject_id         INTEGER NOT NULL,
            weekday            INTEGER NOT NULL CHECK (weekday BETWEEN 0 AND 6),
            time_of_day        TEXT    NOT NULL,   -- HH:MM
            payload_kind       TEXT    NOT NULL,   -- 'reminder' | 'report'
            recurrence_enabled INTEGER NOT NULL DEFAULT 1,
            chat_id            INTEGER NOT NULL,
            session_type       TEXT,
            location           TEXT,
            updated_at         TEXT    NOT NULL DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (subject_id, weekday, payload_kind)
        );
        ",
    )?;
    Ok(())
}
