//! Discord webhook execute payload.
//!
//! A scheduled message's `content` column holds either a bare string (sent as
//! plain text) or a JSON object in the shape of Discord's "Execute Webhook"
//! body:
//!
//! ```text
//! {
//!   "content": "Standup in 5",
//!   "username": "Reminder Bot",
//!   "embeds": [{ "title": "Agenda", "color": 3447003,
//!                "fields": [{ "name": "Owner", "value": "@ops", "inline": true }] }]
//! }
//! ```
//!
//! [`WebhookPayload::validate`] enforces Discord's documented limits before
//! anything goes on the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const MAX_CONTENT_CHARS: usize = 2000;
pub const MAX_EMBEDS: usize = 10;
pub const MAX_FIELDS: usize = 25;
pub const MAX_TITLE_CHARS: usize = 256;
pub const MAX_DESCRIPTION_CHARS: usize = 4096;
pub const MAX_FIELD_NAME_CHARS: usize = 256;
pub const MAX_FIELD_VALUE_CHARS: usize = 1024;
pub const MAX_FOOTER_CHARS: usize = 2048;
pub const MAX_AUTHOR_CHARS: usize = 256;
pub const MAX_USERNAME_CHARS: usize = 80;
/// Sum of all embed text across the whole message.
pub const MAX_TOTAL_EMBED_CHARS: usize = 6000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("content is not a valid webhook payload: {0}")]
    Malformed(String),

    #[error("message has neither content nor embeds")]
    Empty,

    #[error("{field} is {len} characters, limit is {max}")]
    TooLong {
        field: String,
        len: usize,
        max: usize,
    },

    #[error("{count} embeds, limit is {MAX_EMBEDS}")]
    TooManyEmbeds { count: usize },

    #[error("embed {index} has {count} fields, limit is {MAX_FIELDS}")]
    TooManyFields { index: usize, count: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Embed>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_mentions: Option<AllowedMentions>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Embed {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// RGB as a decimal integer, e.g. `0x3498db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    /// ISO 8601 timestamp shown in the footer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<EmbedMedia>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<EmbedMedia>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<EmbedAuthor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub inline: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedFooter {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedMedia {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedAuthor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
}

/// Which mentions in `content` are allowed to ping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllowedMentions {
    /// Any of `"roles"`, `"users"`, `"everyone"`.
    #[serde(default)]
    pub parse: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<String>,
}

impl WebhookPayload {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    /// Build a payload from a stored message body and validate it.
    pub fn from_content(content: &Value) -> Result<Self, PayloadError> {
        let payload = match content {
            Value::String(text) => Self::text(text.clone()),
            Value::Object(_) => serde_json::from_value(content.clone())
                .map_err(|e| PayloadError::Malformed(e.to_string()))?,
            other => {
                return Err(PayloadError::Malformed(format!(
                    "expected a string or an object, got {other}"
                )))
            }
        };
        payload.validate()?;
        Ok(payload)
    }

    pub fn validate(&self) -> Result<(), PayloadError> {
        let has_content = self
            .content
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty());
        if !has_content && self.embeds.is_empty() {
            return Err(PayloadError::Empty);
        }

        if let Some(content) = &self.content {
            check_len("content", content, MAX_CONTENT_CHARS)?;
        }
        if let Some(username) = &self.username {
            check_len("username", username, MAX_USERNAME_CHARS)?;
        }
        if self.embeds.len() > MAX_EMBEDS {
            return Err(PayloadError::TooManyEmbeds {
                count: self.embeds.len(),
            });
        }

        let mut total = 0;
        for (index, embed) in self.embeds.iter().enumerate() {
            total += embed.validate(index)?;
        }
        if total > MAX_TOTAL_EMBED_CHARS {
            return Err(PayloadError::TooLong {
                field: "embeds (combined)".into(),
                len: total,
                max: MAX_TOTAL_EMBED_CHARS,
            });
        }
        Ok(())
    }
}

impl Embed {
    /// Check per-embed limits. Returns the embed's text length toward the
    /// combined limit.
    fn validate(&self, index: usize) -> Result<usize, PayloadError> {
        if self.fields.len() > MAX_FIELDS {
            return Err(PayloadError::TooManyFields {
                index,
                count: self.fields.len(),
            });
        }

        let mut total = 0;
        let mut count = |name: &str, text: &str, max: usize| -> Result<(), PayloadError> {
            total += check_len(&format!("embeds[{index}].{name}"), text, max)?;
            Ok(())
        };

        if let Some(title) = &self.title {
            count("title", title, MAX_TITLE_CHARS)?;
        }
        if let Some(description) = &self.description {
            count("description", description, MAX_DESCRIPTION_CHARS)?;
        }
        if let Some(footer) = &self.footer {
            count("footer.text", &footer.text, MAX_FOOTER_CHARS)?;
        }
        if let Some(author) = &self.author {
            count("author.name", &author.name, MAX_AUTHOR_CHARS)?;
        }
        for field in &self.fields {
            count("field.name", &field.name, MAX_FIELD_NAME_CHARS)?;
            count("field.value", &field.value, MAX_FIELD_VALUE_CHARS)?;
        }
        Ok(total)
    }
}

/// Discord counts characters, not bytes.
fn check_len(field: &str, text: &str, max: usize) -> Result<usize, PayloadError> {
    let len = text.chars().count();
    if len > max {
        return Err(PayloadError::TooLong {
            field: field.to_string(),
            len,
            max,
        });
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bare_string_becomes_text_content() {
        let payload = WebhookPayload::from_content(&json!("hello")).unwrap();
        assert_eq!(payload, WebhookPayload::text("hello"));
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({"content": "hello"})
        );
    }

    #[test]
    fn object_with_embeds_parses() {
        let payload = WebhookPayload::from_content(&json!({
            "username": "Reminder Bot",
            "embeds": [{
                "title": "Agenda",
                "color": 0x3498db,
                "fields": [{"name": "Owner", "value": "@ops", "inline": true}],
                "footer": {"text": "weekly"}
            }]
        }))
        .unwrap();
        assert_eq!(payload.content, None);
        assert_eq!(payload.embeds.len(), 1);
        let embed = &payload.embeds[0];
        assert_eq!(embed.color, Some(0x3498db));
        assert!(embed.fields[0].inline);
        assert_eq!(embed.footer.as_ref().unwrap().text, "weekly");
    }

    #[test]
    fn empty_message_is_rejected() {
        assert_eq!(
            WebhookPayload::from_content(&json!({"content": "   "})),
            Err(PayloadError::Empty)
        );
        assert_eq!(
            WebhookPayload::from_content(&json!({})),
            Err(PayloadError::Empty)
        );
    }

    #[test]
    fn non_object_content_is_malformed() {
        assert!(matches!(
            WebhookPayload::from_content(&json!(42)),
            Err(PayloadError::Malformed(_))
        ));
        assert!(matches!(
            WebhookPayload::from_content(&json!({"embeds": "nope"})),
            Err(PayloadError::Malformed(_))
        ));
    }

    #[test]
    fn content_limit_counts_characters() {
        // 2000 multi-byte characters is still within the limit.
        let ok = "é".repeat(MAX_CONTENT_CHARS);
        assert!(WebhookPayload::text(ok).validate().is_ok());

        let too_long = "a".repeat(MAX_CONTENT_CHARS + 1);
        assert_eq!(
            WebhookPayload::text(too_long).validate(),
            Err(PayloadError::TooLong {
                field: "content".into(),
                len: 2001,
                max: 2000
            })
        );
    }

    #[test]
    fn embed_count_and_field_count_are_capped() {
        let payload = WebhookPayload {
            embeds: vec![Embed::default(); MAX_EMBEDS + 1],
            ..WebhookPayload::default()
        };
        assert_eq!(
            payload.validate(),
            Err(PayloadError::TooManyEmbeds { count: 11 })
        );

        let field = EmbedField {
            name: "n".into(),
            value: "v".into(),
            inline: false,
        };
        let payload = WebhookPayload {
            embeds: vec![Embed {
                fields: vec![field; MAX_FIELDS + 1],
                ..Embed::default()
            }],
            ..WebhookPayload::default()
        };
        assert_eq!(
            payload.validate(),
            Err(PayloadError::TooManyFields { index: 0, count: 26 })
        );
    }

    #[test]
    fn title_limit_names_the_embed() {
        let payload = WebhookPayload {
            embeds: vec![
                Embed {
                    title: Some("fine".into()),
                    ..Embed::default()
                },
                Embed {
                    title: Some("t".repeat(MAX_TITLE_CHARS + 1)),
                    ..Embed::default()
                },
            ],
            ..WebhookPayload::default()
        };
        match payload.validate() {
            Err(PayloadError::TooLong { field, .. }) => assert_eq!(field, "embeds[1].title"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn combined_embed_text_is_capped() {
        // Each embed is individually valid; together they exceed 6000.
        let embed = Embed {
            description: Some("d".repeat(MAX_DESCRIPTION_CHARS)),
            ..Embed::default()
        };
        let payload = WebhookPayload {
            embeds: vec![embed.clone(), embed],
            ..WebhookPayload::default()
        };
        assert_eq!(
            payload.validate(),
            Err(PayloadError::TooLong {
                field: "embeds (combined)".into(),
                len: 2 * MAX_DESCRIPTION_CHARS,
                max: MAX_TOTAL_EMBED_CHARS
            })
        );
    }
}
