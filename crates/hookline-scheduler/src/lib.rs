//! `hookline-scheduler` — recurring message scheduler with SQLite persistence.
//!
//! # Overview
//!
//! Scheduled messages are persisted to a SQLite `scheduled_messages` table.
//! The [`engine::DispatchEngine`] polls the ready queue, claims each due row,
//! hands it to a [`delivery::Delivery`] collaborator and records the outcome
//! through the state machine in [`state`], which asks the evaluator in
//! [`recurrence`] for the next fire time.
//!
//! # Schedule kinds
//!
//! | Kind                | Behaviour                                            |
//! |---------------------|------------------------------------------------------|
//! | `once`              | Single fire at `scheduled_at`                        |
//! | `recurring/daily`   | Fire at HH:MM local time every day                   |
//! | `recurring/weekly`  | Fire at HH:MM local time on the listed weekdays      |
//! | `recurring/monthly` | Fire at HH:MM local time on a day of the month       |

pub mod clock;
pub mod db;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod recurrence;
pub mod state;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use delivery::{Delivery, DeliveryError};
pub use engine::{DispatchEngine, TickSummary};
pub use error::{Result, SchedulerError};
pub use state::TransitionError;
pub use store::MessageStore;
pub use types::{
    Frequency, MessageStatus, NewScheduledMessage, RecurrencePattern, ScheduleType,
    ScheduledMessage, SendLog, Webhook,
};
