use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    db::{fmt_ts, init_db, parse_ts},
    error::{Result, SchedulerError},
    types::{NewScheduledMessage, RecurrencePattern, ScheduledMessage, SendLog, Webhook},
};

const MESSAGE_COLUMNS: &str = "id, user_id, webhook_id, template_id, content, schedule_type,
    scheduled_at, recurrence_pattern, timezone, next_send_at, send_count, max_sends,
    status, error_message, last_sent_at, locked_until, version, created_at, updated_at";

/// Column values of one `scheduled_messages` row before validation.
struct MessageRow {
    id: String,
    user_id: String,
    webhook_id: String,
    template_id: Option<String>,
    content: String,
    schedule_type: String,
    scheduled_at: Option<String>,
    recurrence_pattern: Option<String>,
    timezone: String,
    next_send_at: Option<String>,
    send_count: u32,
    max_sends: Option<u32>,
    status: String,
    error_message: Option<String>,
    last_sent_at: Option<String>,
    locked_until: Option<String>,
    version: i64,
    created_at: String,
    updated_at: String,
}

impl MessageRow {
    /// Column order from [`MESSAGE_COLUMNS`].
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            webhook_id: row.get(2)?,
            template_id: row.get(3)?,
            content: row.get(4)?,
            schedule_type: row.get(5)?,
            scheduled_at: row.get(6)?,
            recurrence_pattern: row.get(7)?,
            timezone: row.get(8)?,
            next_send_at: row.get(9)?,
            send_count: row.get(10)?,
            max_sends: row.get(11)?,
            status: row.get(12)?,
            error_message: row.get(13)?,
            last_sent_at: row.get(14)?,
            locked_until: row.get(15)?,
            version: row.get(16)?,
            created_at: row.get(17)?,
            updated_at: row.get(18)?,
        })
    }

    /// Parse and validate the raw columns into a typed message.
    fn into_message(self) -> Result<ScheduledMessage> {
        let id = self.id;
        let corrupt = |reason: String| SchedulerError::CorruptRow {
            id: id.clone(),
            reason,
        };
        let ts = |s: &str| parse_ts(s).map_err(|e| corrupt(format!("bad timestamp '{s}': {e}")));
        let opt_ts = |s: Option<String>| s.as_deref().map(ts).transpose();

        let content = serde_json::from_str(&self.content)
            .map_err(|e| corrupt(format!("content is not JSON: {e}")))?;
        let recurrence_pattern = self
            .recurrence_pattern
            .as_deref()
            .map(serde_json::from_str::<RecurrencePattern>)
            .transpose()
            .map_err(|e| corrupt(format!("bad recurrence pattern: {e}")))?;

        Ok(ScheduledMessage {
            user_id: self.user_id,
            webhook_id: self.webhook_id,
            template_id: self.template_id,
            content,
            schedule_type: self.schedule_type.parse().map_err(&corrupt)?,
            scheduled_at: opt_ts(self.scheduled_at)?,
            recurrence_pattern,
            timezone: self.timezone,
            next_send_at: opt_ts(self.next_send_at)?,
            send_count: self.send_count,
            max_sends: self.max_sends,
            status: self.status.parse().map_err(&corrupt)?,
            error_message: self.error_message,
            last_sent_at: opt_ts(self.last_sent_at)?,
            locked_until: opt_ts(self.locked_until)?,
            version: u64::try_from(self.version)
                .map_err(|_| corrupt(format!("negative version {}", self.version)))?,
            created_at: ts(&self.created_at)?,
            updated_at: ts(&self.updated_at)?,
            id: id.clone(),
        })
    }
}

/// Timestamp column as `DateTime<Utc>`, reported as a conversion failure
/// when the text is not RFC 3339.
fn ts_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_webhook(row: &rusqlite::Row<'_>) -> rusqlite::Result<Webhook> {
    Ok(Webhook {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        url: row.get(3)?,
        created_at: ts_column(row, 4)?,
    })
}

fn row_to_send_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<SendLog> {
    Ok(SendLog {
        id: row.get(0)?,
        message_id: row.get(1)?,
        webhook_id: row.get(2)?,
        attempted_at: ts_column(row, 3)?,
        success: row.get::<_, i64>(4)? != 0,
        attempts: row.get(5)?,
        error: row.get(6)?,
    })
}

/// Persistence and transition entry point for scheduled messages.
///
/// Every write that follows a read is conditional on the row's `version`, so
/// two dispatchers (or a dispatcher and a user action) can never both apply a
/// transition to the same row. Clones share one connection.
#[derive(Clone)]
pub struct MessageStore {
    conn: Arc<Mutex<Connection>>,
}

impl MessageStore {
    /// Wrap `conn`, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| SchedulerError::LockPoisoned)
    }

    // --- webhooks ------------------------------------------------------------

    pub fn create_webhook(
        &self,
        user_id: &str,
        name: &str,
        url: &str,
        now: DateTime<Utc>,
    ) -> Result<Webhook> {
        let webhook = Webhook {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            url: url.to_string(),
            created_at: now,
        };
        self.conn()?.execute(
            "INSERT INTO webhooks (id, user_id, name, url, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![webhook.id, user_id, name, url, fmt_ts(now)],
        )?;
        info!(webhook_id = %webhook.id, %name, "webhook registered");
        Ok(webhook)
    }

    pub fn get_webhook(&self, id: &str) -> Result<Option<Webhook>> {
        let webhook = self
            .conn()?
            .query_row(
                "SELECT id, user_id, name, url, created_at FROM webhooks WHERE id = ?1",
                [id],
                row_to_webhook,
            )
            .optional()?;
        Ok(webhook)
    }

    pub fn list_webhooks(&self, user_id: Option<&str>) -> Result<Vec<Webhook>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, name, url, created_at FROM webhooks
             WHERE ?1 IS NULL OR user_id = ?1
             ORDER BY created_at, id",
        )?;
        let webhooks = stmt
            .query_map([user_id], row_to_webhook)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(webhooks)
    }

    // --- messages ------------------------------------------------------------

    /// Validate `new` and persist it as a pending message.
    #[instrument(skip(self, new), fields(user_id = %new.user_id, webhook_id = %new.webhook_id))]
    pub fn create(&self, new: NewScheduledMessage, now: DateTime<Utc>) -> Result<ScheduledMessage> {
        if self.get_webhook(&new.webhook_id)?.is_none() {
            return Err(SchedulerError::WebhookNotFound {
                id: new.webhook_id.clone(),
            });
        }
        let msg = ScheduledMessage::create(new, now)?;
        let pattern_json = msg
            .recurrence_pattern
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn()?.execute(
            "INSERT INTO scheduled_messages
             (id, user_id, webhook_id, template_id, content, schedule_type, scheduled_at,
              recurrence_pattern, timezone, next_send_at, send_count, max_sends, status,
              error_message, last_sent_at, locked_until, version, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,NULL,NULL,NULL,0,?14,?14)",
            params![
                msg.id,
                msg.user_id,
                msg.webhook_id,
                msg.template_id,
                serde_json::to_string(&msg.content)?,
                msg.schedule_type.to_string(),
                msg.scheduled_at.map(fmt_ts),
                pattern_json,
                msg.timezone,
                msg.next_send_at.map(fmt_ts),
                msg.send_count,
                msg.max_sends,
                msg.status.to_string(),
                fmt_ts(now),
            ],
        )?;

        info!(
            message_id = %msg.id,
            schedule_type = %msg.schedule_type,
            next_send_at = ?msg.next_send_at,
            "scheduled message created"
        );
        Ok(msg)
    }

    pub fn get(&self, id: &str) -> Result<Option<ScheduledMessage>> {
        let raw = self
            .conn()?
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM scheduled_messages WHERE id = ?1"),
                [id],
                MessageRow::from_row,
            )
            .optional()?;
        raw.map(MessageRow::into_message).transpose()
    }

    /// All messages, optionally limited to one owner, oldest first.
    pub fn list(&self, user_id: Option<&str>) -> Result<Vec<ScheduledMessage>> {
        self.query_messages(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM scheduled_messages
                 WHERE ?1 IS NULL OR user_id = ?1
                 ORDER BY created_at, id"
            ),
            [user_id],
        )
    }

    /// Remove a message and its send history. Safe while a dispatch is in
    /// flight: the dispatcher's final write simply matches no row.
    pub fn delete(&self, id: &str) -> Result<()> {
        let n = self
            .conn()?
            .execute("DELETE FROM scheduled_messages WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::MessageNotFound { id: id.to_string() });
        }
        info!(message_id = %id, "scheduled message deleted");
        Ok(())
    }

    /// Ready queue: pending messages whose fire time is at or before `now`,
    /// oldest fire time first. Read-only.
    pub fn select_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledMessage>> {
        self.query_messages(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM scheduled_messages
                 WHERE status = 'pending' AND next_send_at IS NOT NULL AND next_send_at <= ?1
                 ORDER BY next_send_at, id"
            ),
            [fmt_ts(now)],
        )
    }

    /// Rows that fail to parse are logged and skipped.
    fn query_messages<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Vec<ScheduledMessage>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt
            .query_map(params, MessageRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|row| match row.into_message() {
                Ok(msg) => Some(msg),
                Err(e) => {
                    error!("skipping unreadable scheduled message: {e}");
                    None
                }
            })
            .collect())
    }

    // --- transitions ---------------------------------------------------------

    /// Take the per-row dispatch lock: `pending → processing` until
    /// `now + lease`.
    ///
    /// Returns `None` when the row is gone, no longer due, or was claimed by
    /// someone else first.
    #[instrument(skip(self))]
    pub fn claim(
        &self,
        id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<ScheduledMessage>> {
        let Some(mut msg) = self.get(id)? else {
            debug!("claim: message vanished");
            return Ok(None);
        };
        if !msg.is_due(now) {
            debug!(status = %msg.status, "claim: message not due");
            return Ok(None);
        }
        let expected = msg.version;
        msg.begin_processing(now, lease)?;
        if self.save(&mut msg, expected)? {
            Ok(Some(msg))
        } else {
            debug!("claim: lost race");
            Ok(None)
        }
    }

    /// Record a successful delivery of `msg`.
    ///
    /// `Ok(None)` means the row was deleted or rewritten since `msg` was read;
    /// nothing is changed in that case.
    #[instrument(skip(self, msg), fields(message_id = %msg.id))]
    pub fn mark_as_sent(
        &self,
        msg: &ScheduledMessage,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduledMessage>> {
        let mut next = msg.clone();
        next.mark_as_sent(now)?;
        self.commit(next, msg.version)
    }

    /// Record a failed delivery of `msg`. Same conflict semantics as
    /// [`Self::mark_as_sent`].
    #[instrument(skip(self, msg), fields(message_id = %msg.id))]
    pub fn mark_as_failed(
        &self,
        msg: &ScheduledMessage,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduledMessage>> {
        let mut next = msg.clone();
        next.mark_as_failed(error, now)?;
        self.commit(next, msg.version)
    }

    pub fn pause(&self, id: &str, now: DateTime<Utc>) -> Result<ScheduledMessage> {
        self.apply_user_action(id, |msg| msg.pause(now))
    }

    pub fn resume(&self, id: &str, now: DateTime<Utc>) -> Result<ScheduledMessage> {
        self.apply_user_action(id, |msg| msg.resume(now))
    }

    fn apply_user_action<F>(&self, id: &str, action: F) -> Result<ScheduledMessage>
    where
        F: FnOnce(&mut ScheduledMessage) -> std::result::Result<(), crate::state::TransitionError>,
    {
        let mut msg = self
            .get(id)?
            .ok_or_else(|| SchedulerError::MessageNotFound { id: id.to_string() })?;
        let expected = msg.version;
        action(&mut msg)?;
        if !self.save(&mut msg, expected)? {
            return Err(SchedulerError::Conflict { id: id.to_string() });
        }
        info!(message_id = %id, status = %msg.status, next_send_at = ?msg.next_send_at, "status changed");
        Ok(msg)
    }

    fn commit(
        &self,
        mut msg: ScheduledMessage,
        expected: u64,
    ) -> Result<Option<ScheduledMessage>> {
        if self.save(&mut msg, expected)? {
            info!(
                status = %msg.status,
                send_count = msg.send_count,
                next_send_at = ?msg.next_send_at,
                "transition applied"
            );
            Ok(Some(msg))
        } else {
            info!("row deleted or changed concurrently, transition dropped");
            Ok(None)
        }
    }

    /// Write the mutable columns of `msg` if the stored version still equals
    /// `expected`. On success `msg.version` is advanced.
    fn save(&self, msg: &mut ScheduledMessage, expected: u64) -> Result<bool> {
        let next_version = expected + 1;
        let n = self.conn()?.execute(
            "UPDATE scheduled_messages
             SET status = ?1, next_send_at = ?2, send_count = ?3, error_message = ?4,
                 last_sent_at = ?5, locked_until = ?6, updated_at = ?7, version = ?8
             WHERE id = ?9 AND version = ?10",
            params![
                msg.status.to_string(),
                msg.next_send_at.map(fmt_ts),
                msg.send_count,
                msg.error_message,
                msg.last_sent_at.map(fmt_ts),
                msg.locked_until.map(fmt_ts),
                fmt_ts(msg.updated_at),
                next_version as i64,
                msg.id,
                expected as i64,
            ],
        )?;
        if n == 1 {
            msg.version = next_version;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Return `processing` rows whose lease ran out to `pending`.
    ///
    /// Covers dispatchers that died mid-delivery. The message becomes due
    /// again, so delivery is at-least-once across crashes.
    pub fn release_expired_leases(&self, now: DateTime<Utc>) -> Result<usize> {
        let now_str = fmt_ts(now);
        let n = self.conn()?.execute(
            "UPDATE scheduled_messages
             SET status = 'pending', locked_until = NULL, updated_at = ?1, version = version + 1
             WHERE status = 'processing' AND (locked_until IS NULL OR locked_until < ?1)",
            [&now_str],
        )?;
        if n > 0 {
            warn!(count = n, "released expired dispatch leases");
        }
        Ok(n)
    }

    // --- history -------------------------------------------------------------

    /// Append a send-history entry. Returns `None` if the message no longer
    /// exists.
    pub fn record_send(
        &self,
        msg: &ScheduledMessage,
        attempted_at: DateTime<Utc>,
        attempts: u32,
        error: Option<&str>,
    ) -> Result<Option<SendLog>> {
        let log = SendLog {
            id: Uuid::new_v4().to_string(),
            message_id: msg.id.clone(),
            webhook_id: msg.webhook_id.clone(),
            attempted_at,
            success: error.is_none(),
            attempts,
            error: error.map(String::from),
        };
        let n = self.conn()?.execute(
            "INSERT INTO send_logs (id, message_id, webhook_id, attempted_at, success, attempts, error)
             SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7
             WHERE EXISTS (SELECT 1 FROM scheduled_messages WHERE id = ?2)",
            params![
                log.id,
                log.message_id,
                log.webhook_id,
                fmt_ts(attempted_at),
                log.success as i64,
                attempts,
                log.error,
            ],
        )?;
        Ok((n == 1).then_some(log))
    }

    /// Send history of one message, newest first.
    pub fn history(&self, message_id: &str) -> Result<Vec<SendLog>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, message_id, webhook_id, attempted_at, success, attempts, error
             FROM send_logs WHERE message_id = ?1
             ORDER BY attempted_at DESC, id",
        )?;
        let logs = stmt
            .query_map([message_id], row_to_send_log)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(logs)
    }
}
