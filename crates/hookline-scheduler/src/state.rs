//! Status transitions for a single scheduled message.
//!
//! ```text
//!            begin_processing            mark_as_sent (series continues)
//!   pending ─────────────────▶ processing ───────────────────────────▶ pending
//!     │  ▲                         │
//!     │  │ resume                  ├── mark_as_sent (once / cap / exhausted) ──▶ completed
//!     ▼  │                         │
//!   paused                         └── mark_as_failed ──▶ failed
//! ```
//!
//! `mark_as_sent` and `mark_as_failed` are also accepted straight from
//! `pending`. Every rejected transition leaves the message untouched.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::recurrence;
use crate::types::{
    MessageStatus, NewScheduledMessage, ScheduleType, ScheduledMessage, DEFAULT_TIMEZONE,
};

/// Why the state machine refused a transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("cannot {action} a message that is {status}")]
    InvalidState {
        action: &'static str,
        status: MessageStatus,
    },

    #[error("only recurring messages can be paused")]
    NotRecurring,

    #[error("send limit reached ({send_count}/{max_sends})")]
    LimitReached { send_count: u32, max_sends: u32 },
}

impl ScheduledMessage {
    /// Build a new pending message from user input.
    ///
    /// `once` messages fire at `scheduled_at`; recurring ones at the first
    /// slot of their pattern after `now`.
    pub fn create(new: NewScheduledMessage, now: DateTime<Utc>) -> Result<Self> {
        let timezone = new
            .timezone
            .unwrap_or_else(|| DEFAULT_TIMEZONE.to_string());

        let next_send_at = match new.schedule_type {
            ScheduleType::Once => Some(new.scheduled_at.ok_or_else(|| {
                SchedulerError::InvalidSchedule("once schedule needs scheduled_at".into())
            })?),
            ScheduleType::Recurring => {
                let pattern = new.recurrence_pattern.as_ref().ok_or_else(|| {
                    SchedulerError::InvalidSchedule(
                        "recurring schedule needs a recurrence pattern".into(),
                    )
                })?;
                recurrence::validate(pattern, &timezone).map_err(SchedulerError::InvalidSchedule)?;
                if new.max_sends == Some(0) {
                    return Err(SchedulerError::InvalidSchedule(
                        "max_sends must be at least 1".into(),
                    ));
                }
                Some(
                    recurrence::next_fire_time(pattern, &timezone, now).ok_or_else(|| {
                        SchedulerError::InvalidSchedule("pattern never fires".into())
                    })?,
                )
            }
        };

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            user_id: new.user_id,
            webhook_id: new.webhook_id,
            template_id: new.template_id,
            content: new.content,
            schedule_type: new.schedule_type,
            scheduled_at: new.scheduled_at,
            recurrence_pattern: new.recurrence_pattern,
            timezone,
            next_send_at,
            send_count: 0,
            max_sends: new.max_sends,
            status: MessageStatus::Pending,
            error_message: None,
            last_sent_at: None,
            locked_until: None,
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    /// Next fire time after `now` according to the schedule descriptor.
    /// Always `None` for one-time messages.
    pub fn next_fire_time(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.schedule_type {
            ScheduleType::Once => None,
            ScheduleType::Recurring => self
                .recurrence_pattern
                .as_ref()
                .and_then(|p| recurrence::next_fire_time(p, &self.timezone, now)),
        }
    }

    /// Pending and below the send cap.
    pub fn can_send(&self) -> bool {
        self.status == MessageStatus::Pending
            && (self.schedule_type == ScheduleType::Once || !self.cap_reached())
    }

    /// Sendable and its fire time has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.can_send() && self.next_send_at.is_some_and(|at| at <= now)
    }

    fn cap_reached(&self) -> bool {
        self.max_sends.is_some_and(|max| self.send_count >= max)
    }

    /// Claim the message for delivery until `now + lease`.
    pub fn begin_processing(
        &mut self,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> std::result::Result<(), TransitionError> {
        if !self.can_send() {
            return Err(self.refusal("dispatch"));
        }
        self.status = MessageStatus::Processing;
        self.locked_until = Some(now + lease);
        self.updated_at = now;
        Ok(())
    }

    /// Record a successful send and schedule the next one, if any.
    pub fn mark_as_sent(&mut self, now: DateTime<Utc>) -> std::result::Result<(), TransitionError> {
        if !matches!(
            self.status,
            MessageStatus::Pending | MessageStatus::Processing
        ) {
            return Err(TransitionError::InvalidState {
                action: "mark as sent",
                status: self.status,
            });
        }
        if self.schedule_type == ScheduleType::Recurring {
            if let Some(max_sends) = self.max_sends.filter(|_| self.cap_reached()) {
                return Err(TransitionError::LimitReached {
                    send_count: self.send_count,
                    max_sends,
                });
            }
        }

        self.send_count = self.send_count.saturating_add(1);
        self.last_sent_at = Some(now);
        self.locked_until = None;
        self.updated_at = now;

        if self.schedule_type == ScheduleType::Once || self.cap_reached() {
            self.complete();
            return Ok(());
        }

        match self.next_fire_time(now) {
            Some(next) => {
                self.status = MessageStatus::Pending;
                self.next_send_at = Some(next);
            }
            None => {
                warn!(message_id = %self.id, "recurrence yielded no next fire time, completing series");
                self.complete();
            }
        }
        Ok(())
    }

    /// Record a delivery failure. Terminal.
    pub fn mark_as_failed(
        &mut self,
        error: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<(), TransitionError> {
        if !matches!(
            self.status,
            MessageStatus::Pending | MessageStatus::Processing
        ) {
            return Err(TransitionError::InvalidState {
                action: "mark as failed",
                status: self.status,
            });
        }
        self.status = MessageStatus::Failed;
        self.error_message = Some(error.to_string());
        self.next_send_at = None;
        self.locked_until = None;
        self.updated_at = now;
        Ok(())
    }

    /// Suspend a pending recurring series. `next_send_at` is kept for display.
    pub fn pause(&mut self, now: DateTime<Utc>) -> std::result::Result<(), TransitionError> {
        if self.schedule_type != ScheduleType::Recurring {
            return Err(TransitionError::NotRecurring);
        }
        if self.status != MessageStatus::Pending {
            return Err(TransitionError::InvalidState {
                action: "pause",
                status: self.status,
            });
        }
        self.status = MessageStatus::Paused;
        self.updated_at = now;
        Ok(())
    }

    /// Reactivate a paused series from `now`.
    ///
    /// The stale `next_send_at` is never reused. A series that can no longer
    /// fire (cap reached or pattern exhausted) is completed instead.
    pub fn resume(&mut self, now: DateTime<Utc>) -> std::result::Result<(), TransitionError> {
        if self.status != MessageStatus::Paused {
            return Err(TransitionError::InvalidState {
                action: "resume",
                status: self.status,
            });
        }
        self.updated_at = now;

        let next = if self.cap_reached() {
            None
        } else {
            self.next_fire_time(now)
        };
        match next {
            Some(next) => {
                self.status = MessageStatus::Pending;
                self.next_send_at = Some(next);
            }
            None => self.complete(),
        }
        Ok(())
    }

    fn complete(&mut self) {
        self.status = MessageStatus::Completed;
        self.next_send_at = None;
        self.locked_until = None;
    }

    fn refusal(&self, action: &'static str) -> TransitionError {
        match self.max_sends {
            Some(max_sends) if self.status == MessageStatus::Pending => {
                TransitionError::LimitReached {
                    send_count: self.send_count,
                    max_sends,
                }
            }
            _ => TransitionError::InvalidState {
                action,
                status: self.status,
            },
        }
    }
}
