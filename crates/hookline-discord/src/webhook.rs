use std::time::Duration;

use async_trait::async_trait;
use hookline_core::config::DeliveryConfig;
use hookline_scheduler::{Delivery, DeliveryError, MessageStore, ScheduledMessage};
use reqwest::{header::RETRY_AFTER, Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::payload::WebhookPayload;

/// Fallback wait when Discord returns 429 without saying how long.
const DEFAULT_RETRY_AFTER_MS: u64 = 1_000;

/// Upper bound on the wait reported for a 429.
const MAX_RETRY_AFTER_MS: u64 = 3_600_000;

/// Longest error body kept in a [`DeliveryError::Rejected`].
const MAX_ERROR_BODY: usize = 512;

/// Delivers scheduled messages by executing their Discord webhook.
pub struct WebhookDelivery {
    store: MessageStore,
    http: Client,
}

impl WebhookDelivery {
    pub fn new(store: MessageStore, config: &DeliveryConfig) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { store, http })
    }

    /// POST `payload` to `url` and classify the response.
    pub async fn execute(&self, url: &str, payload: &WebhookPayload) -> Result<(), DeliveryError> {
        let resp = self
            .http
            .post(url)
            .query(&[("wait", "true")])
            .json(payload)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }

        let header_retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = resp.text().await.unwrap_or_default();
        Err(classify_failure(status, header_retry_after.as_deref(), &body))
    }
}

#[async_trait]
impl Delivery for WebhookDelivery {
    #[instrument(skip(self, message), fields(message_id = %message.id, webhook_id = %message.webhook_id))]
    async fn deliver(&self, message: &ScheduledMessage) -> Result<(), DeliveryError> {
        let webhook = self
            .store
            .get_webhook(&message.webhook_id)
            .map_err(|e| DeliveryError::Transport(format!("webhook lookup failed: {e}")))?
            .ok_or_else(|| DeliveryError::WebhookNotFound(message.webhook_id.clone()))?;

        let payload = WebhookPayload::from_content(&message.content)
            .map_err(|e| DeliveryError::InvalidPayload(e.to_string()))?;

        debug!(webhook = %webhook.name, "executing webhook");
        self.execute(&webhook.url, &payload).await
    }
}

#[derive(Deserialize)]
struct RateLimitBody {
    /// Seconds, possibly fractional.
    retry_after: f64,
}

/// Map a non-success response to a [`DeliveryError`].
///
/// 429 prefers the JSON `retry_after` (seconds) Discord sends in the body and
/// falls back to the `Retry-After` header. The wait is capped at
/// [`MAX_RETRY_AFTER_MS`].
fn classify_failure(status: StatusCode, retry_after_header: Option<&str>, body: &str) -> DeliveryError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        let seconds = serde_json::from_str::<RateLimitBody>(body)
            .ok()
            .map(|b| b.retry_after)
            .or_else(|| retry_after_header.and_then(|h| h.trim().parse::<f64>().ok()));
        let retry_after_ms = seconds
            .filter(|s| s.is_finite() && *s >= 0.0)
            .map(|s| (s * 1000.0).ceil().min(MAX_RETRY_AFTER_MS as f64) as u64)
            .unwrap_or(DEFAULT_RETRY_AFTER_MS);
        warn!(retry_after_ms, "webhook rate limited");
        return DeliveryError::RateLimited { retry_after_ms };
    }
    if status.is_server_error() {
        return DeliveryError::Server {
            status: status.as_u16(),
        };
    }
    DeliveryError::Rejected {
        status: status.as_u16(),
        body: truncate(body, MAX_ERROR_BODY),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use hookline_scheduler::NewScheduledMessage;
    use rusqlite::Connection;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn setup(url: &str, content: serde_json::Value) -> (WebhookDelivery, ScheduledMessage) {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap();
        let store = MessageStore::new(Connection::open_in_memory().unwrap()).unwrap();
        let webhook = store.create_webhook("u-1", "alerts", url, now).unwrap();
        let msg = store
            .create(NewScheduledMessage::once("u-1", &webhook.id, content, now), now)
            .unwrap();
        let delivery = WebhookDelivery::new(store, &DeliveryConfig::default()).unwrap();
        (delivery, msg)
    }

    #[tokio::test]
    async fn posts_payload_with_wait() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/webhooks/1/abc"))
            .and(query_param("wait", "true"))
            .and(body_json(json!({"content": "standup in 5"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "1"})))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/api/webhooks/1/abc", server.uri());
        let (delivery, msg) = setup(&url, json!("standup in 5"));
        delivery.deliver(&msg).await.unwrap();
    }

    #[tokio::test]
    async fn rate_limit_reads_retry_after_from_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429)
                    .set_body_json(json!({"message": "You are being rate limited.", "retry_after": 1.25, "global": false})),
            )
            .mount(&server)
            .await;

        let (delivery, msg) = setup(&server.uri(), json!("x"));
        assert_eq!(
            delivery.deliver(&msg).await,
            Err(DeliveryError::RateLimited {
                retry_after_ms: 1250
            })
        );
    }

    #[tokio::test]
    async fn unknown_webhook_is_rejected_permanently() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(404)
                    .set_body_json(json!({"message": "Unknown Webhook", "code": 10015})),
            )
            .mount(&server)
            .await;

        let (delivery, msg) = setup(&server.uri(), json!("x"));
        let err = delivery.deliver(&msg).await.unwrap_err();
        assert!(!err.is_retryable());
        match err {
            DeliveryError::Rejected { status, body } => {
                assert_eq!(status, 404);
                assert!(body.contains("Unknown Webhook"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let (delivery, msg) = setup(&server.uri(), json!("x"));
        let err = delivery.deliver(&msg).await.unwrap_err();
        assert_eq!(err, DeliveryError::Server { status: 503 });
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn invalid_payload_never_hits_the_network() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let (delivery, msg) = setup(&server.uri(), json!({"content": ""}));
        assert!(matches!(
            delivery.deliver(&msg).await,
            Err(DeliveryError::InvalidPayload(_))
        ));
    }

    #[test]
    fn rate_limit_falls_back_to_header_then_default() {
        assert_eq!(
            classify_failure(StatusCode::TOO_MANY_REQUESTS, Some("2"), ""),
            DeliveryError::RateLimited {
                retry_after_ms: 2000
            }
        );
        assert_eq!(
            classify_failure(StatusCode::TOO_MANY_REQUESTS, None, "not json"),
            DeliveryError::RateLimited {
                retry_after_ms: DEFAULT_RETRY_AFTER_MS
            }
        );
    }

    #[test]
    fn rate_limit_wait_is_capped() {
        assert_eq!(
            classify_failure(StatusCode::TOO_MANY_REQUESTS, None, r#"{"retry_after": 1e12}"#),
            DeliveryError::RateLimited {
                retry_after_ms: MAX_RETRY_AFTER_MS
            }
        );
        assert_eq!(
            classify_failure(StatusCode::TOO_MANY_REQUESTS, Some("86400"), ""),
            DeliveryError::RateLimited {
                retry_after_ms: MAX_RETRY_AFTER_MS
            }
        );
    }

    #[test]
    fn long_error_bodies_are_truncated() {
        let body = "e".repeat(MAX_ERROR_BODY * 2);
        match classify_failure(StatusCode::BAD_REQUEST, None, &body) {
            DeliveryError::Rejected { body, .. } => {
                assert_eq!(body.chars().count(), MAX_ERROR_BODY + 1)
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
