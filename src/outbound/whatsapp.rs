//! WhatsApp Cloud API sender.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::debug;

use crate::common::types::{MediaKind, Payload};
use crate::config::types::WhatsAppConfig;
use crate::outbound::{OutboundSender, SendOutcome};

/// Wait used when a rate-limit response carries no `Retry-After`.
const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

/// Graph API error codes meaning "slow down" rather than "rejected".
const THROTTLING_CODES: &[i64] = &[4, 80007, 130429, 131048, 131056];

/// Longest response body quoted in a failure reason.
const MAX_DETAIL_LEN: usize = 200;

pub struct WhatsAppSender {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl WhatsAppSender {
    pub fn new(config: &WhatsAppConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: format!(
                "{}/{}/messages",
                config.api_base.trim_end_matches('/'),
                config.phone_number_id
            ),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl OutboundSender for WhatsAppSender {
    async fn send(&self, recipient: &str, payload: &Payload) -> SendOutcome {
        let body = message_body(recipient, payload);
        let response = match self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return classify_transport_error(&e),
        };

        let status = response.status();
        let headers = response.headers().clone();
        let text = response.text().await.unwrap_or_default();
        debug!("WhatsApp responded {} to {}", status, recipient);
        classify(status, &headers, &text)
    }
}

/// Request body for the `/messages` endpoint.
pub fn message_body(recipient: &str, payload: &Payload) -> Value {
    let mut body = json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": recipient,
    });

    match payload {
        Payload::Text(text) => {
            body["type"] = json!("text");
            body["text"] = json!({ "body": text });
        }
        Payload::Media {
            kind,
            reference,
            caption,
        } => {
            let field = media_field(*kind);
            let mut media = json!({ "link": reference });
            if let Some(caption) = caption.as_deref().filter(|_| kind.supports_caption()) {
                media["caption"] = json!(caption);
            }
            body["type"] = json!(field);
            body[field] = media;
        }
    }
    body
}

fn media_field(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Image => "image",
        MediaKind::Video => "video",
        MediaKind::Audio | MediaKind::Voice => "audio",
        MediaKind::Document => "document",
        MediaKind::Sticker => "sticker",
    }
}

/// Map an HTTP response onto a delivery outcome.
pub fn classify(status: StatusCode, headers: &HeaderMap, body: &str) -> SendOutcome {
    if status.is_success() {
        return SendOutcome::Delivered;
    }

    let error = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").cloned());
    let code = error
        .as_ref()
        .and_then(|e| e.get("code"))
        .and_then(Value::as_i64);
    let reason = match error
        .as_ref()
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
    {
        Some(message) => format!("HTTP {}: {}", status.as_u16(), message),
        None if body.trim().is_empty() => format!("HTTP {}", status.as_u16()),
        None => format!("HTTP {}: {}", status.as_u16(), truncate(body.trim())),
    };

    let throttled = code.map_or(false, |c| THROTTLING_CODES.contains(&c));
    if status == StatusCode::TOO_MANY_REQUESTS || throttled {
        let wait = retry_after(headers).unwrap_or(DEFAULT_RATE_LIMIT_WAIT);
        return SendOutcome::rate_limited(reason, wait);
    }
    if status == StatusCode::REQUEST_TIMEOUT || status.is_server_error() {
        return SendOutcome::transient(reason);
    }
    SendOutcome::permanent(reason)
}

fn classify_transport_error(error: &reqwest::Error) -> SendOutcome {
    if error.is_builder() {
        return SendOutcome::permanent(format!("invalid request: {}", error));
    }
    if error.is_timeout() {
        return SendOutcome::transient("request timed out");
    }
    SendOutcome::transient(format!("network error: {}", error))
}

/// `Retry-After` in delta-seconds form.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_DETAIL_LEN {
        text.to_string()
    } else {
        let cut: String = text.chars().take(MAX_DETAIL_LEN).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use mockito::Matcher;
    use reqwest::header::HeaderValue;

    use super::*;

    fn config(api_base: &str) -> WhatsAppConfig {
        WhatsAppConfig {
            api_key: "secret".to_string(),
            phone_number_id: "1055".to_string(),
            recipient: "34600000000".to_string(),
            api_base: api_base.to_string(),
            include_sender: false,
            request_timeout_secs: 5,
        }
    }

    #[test]
    fn test_text_body() {
        let body = message_body("34600000000", &Payload::Text("hola".to_string()));
        assert_eq!(
            body,
            json!({
                "messaging_product": "whatsapp",
                "recipient_type": "individual",
                "to": "34600000000",
                "type": "text",
                "text": { "body": "hola" }
            })
        );
    }

    #[test]
    fn test_media_body_caption_rules() {
        let image = Payload::Media {
            kind: MediaKind::Image,
            reference: "https://files/p.jpg".to_string(),
            caption: Some("look".to_string()),
        };
        let body = message_body("1", &image);
        assert_eq!(body["type"], "image");
        assert_eq!(body["image"]["link"], "https://files/p.jpg");
        assert_eq!(body["image"]["caption"], "look");

        let voice = Payload::Media {
            kind: MediaKind::Voice,
            reference: "https://files/v.ogg".to_string(),
            caption: Some("ignored".to_string()),
        };
        let body = message_body("1", &voice);
        assert_eq!(body["type"], "audio");
        assert!(body["audio"].get("caption").is_none());
    }

    #[test]
    fn test_classify_statuses() {
        let empty = HeaderMap::new();
        assert_eq!(classify(StatusCode::OK, &empty, "{}"), SendOutcome::Delivered);
        assert!(matches!(
            classify(StatusCode::BAD_GATEWAY, &empty, ""),
            SendOutcome::TransientFailure { retry_after: None, .. }
        ));
        assert!(matches!(
            classify(StatusCode::REQUEST_TIMEOUT, &empty, ""),
            SendOutcome::TransientFailure { retry_after: None, .. }
        ));
        assert!(matches!(
            classify(StatusCode::UNAUTHORIZED, &empty, ""),
            SendOutcome::PermanentFailure { .. }
        ));
    }

    #[test]
    fn test_classify_rate_limits() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("17"));
        assert_eq!(
            classify(StatusCode::TOO_MANY_REQUESTS, &headers, ""),
            SendOutcome::rate_limited("HTTP 429", Duration::from_secs(17))
        );

        // Meta reports throttling as 400 with a dedicated error code.
        let body = r#"{"error":{"message":"Spam rate limit hit","code":131048}}"#;
        assert_eq!(
            classify(StatusCode::BAD_REQUEST, &HeaderMap::new(), body),
            SendOutcome::rate_limited("HTTP 400: Spam rate limit hit", DEFAULT_RATE_LIMIT_WAIT)
        );
    }

    #[test]
    fn test_classify_invalid_recipient_is_permanent() {
        let body = r#"{"error":{"message":"Recipient phone number not in allowed list","code":131030}}"#;
        assert_eq!(
            classify(StatusCode::BAD_REQUEST, &HeaderMap::new(), body),
            SendOutcome::permanent("HTTP 400: Recipient phone number not in allowed list")
        );
    }

    #[tokio::test]
    async fn test_send_posts_to_messages_endpoint() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/1055/messages")
            .match_header("authorization", "Bearer secret")
            .match_body(Matcher::PartialJson(json!({
                "to": "34600000000",
                "type": "text",
                "text": { "body": "hello" }
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"messages":[{"id":"wamid.1"}]}"#)
            .create_async()
            .await;

        let sender = WhatsAppSender::new(&config(&server.url())).unwrap();
        let outcome = sender
            .send("34600000000", &Payload::Text("hello".to_string()))
            .await;

        assert_eq!(outcome, SendOutcome::Delivered);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_maps_server_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/1055/messages")
            .with_status(503)
            .with_body("upstream unavailable")
            .create_async()
            .await;

        let sender = WhatsAppSender::new(&config(&server.url())).unwrap();
        let outcome = sender.send("1", &Payload::Text("x".to_string())).await;

        assert_eq!(
            outcome,
            SendOutcome::transient("HTTP 503: upstream unavailable")
        );
    }

    #[tokio::test]
    async fn test_unreachable_api_is_transient() {
        let sender = WhatsAppSender::new(&config("http://127.0.0.1:1")).unwrap();
        let outcome = sender.send("1", &Payload::Text("x".to_string())).await;
        assert!(matches!(outcome, SendOutcome::TransientFailure { .. }));
    }
}
