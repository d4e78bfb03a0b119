use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `webhooks`, `scheduled_messages` and `send_logs` tables
/// (idempotent) plus the index backing the ready-queue query.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS webhooks (
            id          TEXT    NOT NULL PRIMARY KEY,
            user_id     TEXT    NOT NULL,
            name        TEXT    NOT NULL,
            url         TEXT    NOT NULL,
            created_at  TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS scheduled_messages (
            id                  TEXT    NOT NULL PRIMARY KEY,
            user_id             TEXT    NOT NULL,
            webhook_id          TEXT    NOT NULL REFERENCES webhooks(id) ON DELETE CASCADE,
            template_id         TEXT,
            content             TEXT    NOT NULL,   -- opaque JSON payload
            schedule_type       TEXT    NOT NULL,   -- 'once' | 'recurring'
            scheduled_at        TEXT,
            recurrence_pattern  TEXT,               -- JSON-encoded RecurrencePattern
            timezone            TEXT    NOT NULL DEFAULT 'UTC',
            next_send_at        TEXT,               -- NULL: nothing left to send
            send_count          INTEGER NOT NULL DEFAULT 0,
            max_sends           INTEGER,            -- NULL means unlimited
            status              TEXT    NOT NULL DEFAULT 'pending',
            error_message       TEXT,
            last_sent_at        TEXT,
            locked_until        TEXT,               -- dispatch lease while processing
            version             INTEGER NOT NULL DEFAULT 0,
            created_at          TEXT    NOT NULL,
            updated_at          TEXT    NOT NULL
        ) STRICT;

        -- Ready queue: WHERE status = 'pending' AND next_send_at <= ? ORDER BY next_send_at
        CREATE INDEX IF NOT EXISTS idx_scheduled_messages_due
            ON scheduled_messages (status, next_send_at);

        CREATE TABLE IF NOT EXISTS send_logs (
            id           TEXT    NOT NULL PRIMARY KEY,
            message_id   TEXT    NOT NULL REFERENCES scheduled_messages(id) ON DELETE CASCADE,
            webhook_id   TEXT    NOT NULL,
            attempted_at TEXT    NOT NULL,
            success      INTEGER NOT NULL,
            attempts     INTEGER NOT NULL,
            error        TEXT
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_send_logs_message
            ON send_logs (message_id, attempted_at);
        ",
    )?;
    Ok(())
}

/// Fixed-width RFC 3339 so that string comparison in SQL matches time order.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
    }

    #[test]
    fn formatted_timestamps_sort_chronologically() {
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap();
        let later = base + Duration::milliseconds(1);
        assert!(fmt_ts(base) < fmt_ts(later));
        assert_eq!(fmt_ts(base), "2025-01-01T09:00:00.000000Z");
        assert_eq!(parse_ts(&fmt_ts(later)).unwrap(), later);
    }
}
