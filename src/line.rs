use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use thiserror::Error;

const API_BASE: &str = "https://api.line.me/v2/bot";

#[derive(Debug, Error)]
pub enum LineError {
    #[error("line api request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("line api returned {status}: {body}")]
    Api { status: u16, body: String },
}

/// Thin client over the LINE Messaging API for one channel's credentials.
/// All three operations are remote calls that can fail or time out; callers
/// decide per call site whether a failure is fatal.
pub struct LineClient {
    http: reqwest::Client,
    access_token: String,
    api_base: String,
}

impl LineClient {
    pub fn new(http: reqwest::Client, access_token: impl Into<String>) -> Self {
        Self {
            http,
            access_token: access_token.into(),
            api_base: API_BASE.to_string(),
        }
    }

    #[allow(dead_code)]
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub async fn get_profile(&self, external_user_id: &str) -> Result<LineProfile, LineError> {
        let response = self
            .http
            .get(format!("{}/profile/{}", self.api_base, external_user_id))
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(LineError::Api {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json::<LineProfile>().await?)
    }

    pub async fn push_message(&self, to: &str, message: &Value) -> Result<(), LineError> {
        self.post_messages("push", json!({ "to": to, "messages": [message] }))
            .await
    }

    pub async fn reply_message(&self, reply_token: &str, message: &Value) -> Result<(), LineError> {
        self.post_messages(
            "reply",
            json!({ "replyToken": reply_token, "messages": [message] }),
        )
        .await
    }

    async fn post_messages(&self, endpoint: &str, payload: Value) -> Result<(), LineError> {
        let response = self
            .http
            .post(format!("{}/message/{}", self.api_base, endpoint))
            .bearer_auth(&self.access_token)
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(LineError::Api {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineProfile {
    pub display_name: String,
}

pub fn text_message(text: &str) -> Value {
    json!({ "type": "text", "text": text })
}

pub fn image_message(url: &str) -> Value {
    json!({
        "type": "image",
        "originalContentUrl": url,
        "previewImageUrl": url,
    })
}

pub fn sticker_message(package_id: &str, sticker_id: &str) -> Value {
    json!({
        "type": "sticker",
        "packageId": package_id,
        "stickerId": sticker_id,
    })
}

/// Verifies LINE's `x-line-signature` header: base64 of the HMAC-SHA256 of
/// the raw request body keyed with the channel secret. An empty secret skips
/// verification.
pub fn verify_line_signature(
    channel_secret: &str,
    signature_header: Option<&str>,
    body: &[u8],
) -> bool {
    if channel_secret.is_empty() {
        return true;
    }
    let signature = signature_header.unwrap_or("").trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(signature_bytes) = BASE64.decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(channel_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

// ----- provider-shaped webhook payload -----

#[derive(Debug, Default, Deserialize)]
pub struct WebhookBody {
    #[serde(default)]
    pub events: Vec<WebhookEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub reply_token: Option<String>,
    #[serde(default)]
    pub source: EventSource,
    #[serde(default)]
    pub message: Option<EventMessage>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSource {
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub package_id: Option<String>,
    #[serde(default)]
    pub sticker_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_payload_shape() {
        let payload = text_message("Hi there!");
        assert_eq!(payload, json!({ "type": "text", "text": "Hi there!" }));
    }

    #[test]
    fn image_payload_uses_same_url_for_preview() {
        let payload = image_message("https://cdn.example.com/a.jpg");
        assert_eq!(payload["type"], "image");
        assert_eq!(payload["originalContentUrl"], payload["previewImageUrl"]);
    }

    #[test]
    fn sticker_payload_carries_both_ids_verbatim() {
        let payload = sticker_message("446", "1988");
        assert_eq!(
            payload,
            json!({ "type": "sticker", "packageId": "446", "stickerId": "1988" })
        );
    }

    #[test]
    fn signature_verification_round_trip() {
        let secret = "channel-secret";
        let body = br#"{"events":[]}"#;
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let signature = BASE64.encode(mac.finalize().into_bytes());

        assert!(verify_line_signature(secret, Some(&signature), body));
        assert!(!verify_line_signature(secret, Some(&signature), b"tampered"));
        assert!(!verify_line_signature(secret, Some("not-base64!!"), body));
        assert!(!verify_line_signature(secret, None, body));
        // empty secret disables the check
        assert!(verify_line_signature("", None, body));
    }

    #[test]
    fn webhook_body_deserializes_provider_events() {
        let raw = r#"{
            "destination": "U0000",
            "events": [
                {
                    "type": "message",
                    "timestamp": 1700000000123,
                    "replyToken": "rtoken",
                    "source": { "type": "user", "userId": "U1234" },
                    "message": { "id": "m1", "type": "text", "text": "hello" }
                },
                {
                    "type": "message",
                    "timestamp": 1700000000456,
                    "replyToken": "rtoken2",
                    "source": { "type": "user", "userId": "U5678" },
                    "message": { "id": "m2", "type": "sticker", "packageId": "446", "stickerId": "1988" }
                },
                { "type": "follow", "timestamp": 1700000000789 }
            ]
        }"#;

        let body: WebhookBody = serde_json::from_str(raw).unwrap();
        assert_eq!(body.events.len(), 3);

        let first = &body.events[0];
        assert_eq!(first.event_type, "message");
        assert_eq!(first.timestamp, 1_700_000_000_123);
        assert_eq!(first.reply_token.as_deref(), Some("rtoken"));
        assert_eq!(first.source.user_id.as_deref(), Some("U1234"));
        assert_eq!(
            first.message.as_ref().unwrap().text.as_deref(),
            Some("hello")
        );

        let sticker = body.events[1].message.as_ref().unwrap();
        assert_eq!(sticker.package_id.as_deref(), Some("446"));
        assert_eq!(sticker.sticker_id.as_deref(), Some("1988"));

        let follow = &body.events[2];
        assert!(follow.message.is_none());
        assert!(follow.source.user_id.is_none());
    }

    #[test]
    fn webhook_body_tolerates_missing_events() {
        let body: WebhookBody = serde_json::from_str("{}").unwrap();
        assert!(body.events.is_empty());
    }
}
