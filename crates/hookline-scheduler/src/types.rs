use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default IANA zone used when a message does not name one.
pub const DEFAULT_TIMEZONE: &str = "UTC";

/// Whether a message fires once or follows a recurrence pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Once,
    Recurring,
}

impl std::fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ScheduleType::Once => "once",
            ScheduleType::Recurring => "recurring",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ScheduleType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "once" => Ok(ScheduleType::Once),
            "recurring" => Ok(ScheduleType::Recurring),
            other => Err(format!("unknown schedule type: {other}")),
        }
    }
}

/// How often a recurring message repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    /// Any value this version does not understand. Rows carrying it still
    /// load, but never produce a fire time.
    #[serde(other)]
    Unknown,
}

/// Stored as JSON in the `recurrence_pattern` column.
///
/// `time` is `"HH:MM"` in the message's timezone (defaults to `"12:00"`).
/// `days` lists weekday numbers for weekly patterns, 0 = Sunday … 6 = Saturday.
/// `day` is the day of month for monthly patterns (defaults to 1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrencePattern {
    pub frequency: Frequency,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub days: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day: Option<u32>,
}

impl RecurrencePattern {
    pub fn daily(time: &str) -> Self {
        Self {
            frequency: Frequency::Daily,
            time: Some(time.to_string()),
            days: Vec::new(),
            day: None,
        }
    }

    pub fn weekly(days: impl Into<Vec<u8>>, time: &str) -> Self {
        Self {
            frequency: Frequency::Weekly,
            time: Some(time.to_string()),
            days: days.into(),
            day: None,
        }
    }

    pub fn monthly(day: u32, time: &str) -> Self {
        Self {
            frequency: Frequency::Monthly,
            time: Some(time.to_string()),
            days: Vec::new(),
            day: Some(day),
        }
    }
}

/// Lifecycle state of a scheduled message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Waiting for `next_send_at`.
    Pending,
    /// Claimed by a dispatcher; delivery in flight.
    Processing,
    /// No further sends will happen.
    Completed,
    /// The last delivery failed; see `error_message`.
    Failed,
    /// Recurring series suspended by its owner.
    Paused,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Completed | MessageStatus::Failed)
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Processing => "processing",
            MessageStatus::Completed => "completed",
            MessageStatus::Failed => "failed",
            MessageStatus::Paused => "paused",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "processing" => Ok(MessageStatus::Processing),
            "completed" => Ok(MessageStatus::Completed),
            "failed" => Ok(MessageStatus::Failed),
            "paused" => Ok(MessageStatus::Paused),
            other => Err(format!("unknown message status: {other}")),
        }
    }
}

/// A persisted scheduled message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledMessage {
    /// UUID v4 string, primary key.
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// Target webhook.
    pub webhook_id: String,
    /// Template the message was composed from, if any.
    pub template_id: Option<String>,
    /// Message payload (text + embeds), forwarded untouched to delivery.
    pub content: Value,
    pub schedule_type: ScheduleType,
    /// Fire instant of a `once` message.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub recurrence_pattern: Option<RecurrencePattern>,
    /// IANA zone name for all local-time arithmetic.
    pub timezone: String,
    /// `None` means no further sends are scheduled.
    pub next_send_at: Option<DateTime<Utc>>,
    pub send_count: u32,
    /// Cap on successful sends; only meaningful for recurring messages.
    pub max_sends: Option<u32>,
    pub status: MessageStatus,
    pub error_message: Option<String>,
    pub last_sent_at: Option<DateTime<Utc>>,
    /// Dispatch lease expiry while the row is `processing`.
    pub locked_until: Option<DateTime<Utc>>,
    /// Bumped on every write; guards concurrent transitions.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for [`crate::store::MessageStore::create`].
#[derive(Debug, Clone)]
pub struct NewScheduledMessage {
    pub user_id: String,
    pub webhook_id: String,
    pub template_id: Option<String>,
    pub content: Value,
    pub schedule_type: ScheduleType,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub recurrence_pattern: Option<RecurrencePattern>,
    pub timezone: Option<String>,
    pub max_sends: Option<u32>,
}

impl NewScheduledMessage {
    pub fn once(user_id: &str, webhook_id: &str, content: Value, at: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            webhook_id: webhook_id.to_string(),
            template_id: None,
            content,
            schedule_type: ScheduleType::Once,
            scheduled_at: Some(at),
            recurrence_pattern: None,
            timezone: None,
            max_sends: None,
        }
    }

    pub fn recurring(
        user_id: &str,
        webhook_id: &str,
        content: Value,
        pattern: RecurrencePattern,
        timezone: &str,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            webhook_id: webhook_id.to_string(),
            template_id: None,
            content,
            schedule_type: ScheduleType::Recurring,
            scheduled_at: None,
            recurrence_pattern: Some(pattern),
            timezone: Some(timezone.to_string()),
            max_sends: None,
        }
    }

    pub fn with_max_sends(mut self, max_sends: u32) -> Self {
        self.max_sends = Some(max_sends);
        self
    }

    pub fn with_template(mut self, template_id: &str) -> Self {
        self.template_id = Some(template_id.to_string());
        self
    }
}

/// A registered Discord webhook a message can be sent to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

/// One row of send history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendLog {
    pub id: String,
    pub message_id: String,
    pub webhook_id: String,
    pub attempted_at: DateTime<Utc>,
    pub success: bool,
    /// Delivery attempts made within this dispatch.
    pub attempts: u32,
    pub error: Option<String>,
}
