//! Discord webhook delivery for hookline.
//!
//! [`WebhookDelivery`] is the production [`hookline_scheduler::Delivery`]:
//! it turns a scheduled message's stored body into a validated
//! [`WebhookPayload`] and executes the target webhook over HTTPS.

pub mod payload;
pub mod webhook;

pub use payload::{Embed, PayloadError, WebhookPayload};
pub use webhook::WebhookDelivery;
