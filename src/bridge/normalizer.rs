//! Mapping of inbound source messages onto forward tasks.

use crate::common::messages::InboundEvent;
use crate::common::types::{ContentType, ForwardTask, MediaKind, Payload, TaskId};

/// Converts [`InboundEvent`]s into [`ForwardTask`]s for one recipient.
///
/// Pure: the same event always yields the same task, so captured events can
/// be replayed in tests.
#[derive(Debug, Clone)]
pub struct Normalizer {
    recipient: String,
    include_sender: bool,
}

impl Normalizer {
    pub fn new(recipient: impl Into<String>, include_sender: bool) -> Self {
        Self {
            recipient: recipient.into(),
            include_sender,
        }
    }

    /// Map an event to a task.
    ///
    /// Content the bridge cannot forward produces a task that is already
    /// `Dropped`, with the reason in `last_error`.
    pub fn normalize(&self, event: &InboundEvent) -> ForwardTask {
        let id = TaskId::new(event.source_channel_id, event.source_message_id);
        let text = event
            .text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| self.with_sender(event, t));

        let payload = match media_kind(&event.content_type) {
            Ok(None) => text.map(Payload::Text),
            Ok(Some(kind)) => match &event.media_reference {
                Some(reference) => Some(Payload::Media {
                    kind,
                    reference: reference.clone(),
                    caption: text,
                }),
                // No fetchable media, but a caption is still worth forwarding.
                None => text.map(Payload::Text),
            },
            Err(unsupported) => {
                let mut task = self.placeholder(id, event);
                task.drop_with(format!("unsupported content type: {}", unsupported));
                return task;
            }
        };

        match payload {
            Some(payload) => ForwardTask::new(id, self.recipient.clone(), payload, event.received_at),
            None => {
                let mut task = self.placeholder(id, event);
                task.drop_with(format!("empty {} message", event.content_type.name()));
                task
            }
        }
    }

    fn with_sender(&self, event: &InboundEvent, text: &str) -> String {
        match (&event.author, self.include_sender) {
            (Some(author), true) => format!("*{}*: {}", author, text),
            _ => text.to_string(),
        }
    }

    fn placeholder(&self, id: TaskId, event: &InboundEvent) -> ForwardTask {
        ForwardTask::new(
            id,
            self.recipient.clone(),
            Payload::Text(String::new()),
            event.received_at,
        )
    }
}

/// Media kind for a content type; `Ok(None)` for plain text.
fn media_kind(content_type: &ContentType) -> Result<Option<MediaKind>, &str> {
    match content_type {
        ContentType::Text => Ok(None),
        ContentType::Photo => Ok(Some(MediaKind::Image)),
        ContentType::Video => Ok(Some(MediaKind::Video)),
        ContentType::Document => Ok(Some(MediaKind::Document)),
        ContentType::Audio => Ok(Some(MediaKind::Audio)),
        ContentType::Voice => Ok(Some(MediaKind::Voice)),
        ContentType::Sticker => Ok(Some(MediaKind::Sticker)),
        ContentType::Other(name) => Err(name),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::common::types::TaskStatus;

    fn event(content_type: ContentType, text: Option<&str>, media: Option<&str>) -> InboundEvent {
        InboundEvent {
            source_message_id: 7,
            source_channel_id: -100,
            content_type,
            text: text.map(String::from),
            media_reference: media.map(String::from),
            mime_type: None,
            author: Some("newsdesk".to_string()),
            author_id: None,
            received_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_text_message() {
        let normalizer = Normalizer::new("34600000000", false);
        let task = normalizer.normalize(&event(ContentType::Text, Some("hello"), None));

        assert_eq!(task.id, TaskId::new(-100, 7));
        assert_eq!(task.recipient, "34600000000");
        assert_eq!(task.payload, Payload::Text("hello".to_string()));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempt_count, 0);
    }

    #[test]
    fn test_photo_with_caption() {
        let normalizer = Normalizer::new("34600000000", false);
        let task = normalizer.normalize(&event(
            ContentType::Photo,
            Some("sunset"),
            Some("https://files/p.jpg"),
        ));

        assert_eq!(
            task.payload,
            Payload::Media {
                kind: MediaKind::Image,
                reference: "https://files/p.jpg".to_string(),
                caption: Some("sunset".to_string()),
            }
        );
    }

    #[test]
    fn test_media_without_reference_falls_back_to_caption() {
        let normalizer = Normalizer::new("r", false);
        let task = normalizer.normalize(&event(ContentType::Video, Some("clip"), None));
        assert_eq!(task.payload, Payload::Text("clip".to_string()));
    }

    #[test]
    fn test_unsupported_content_is_dropped() {
        let normalizer = Normalizer::new("r", false);
        let task = normalizer.normalize(&event(ContentType::Other("poll".to_string()), None, None));

        assert_eq!(task.status, TaskStatus::Dropped);
        assert!(task.last_error.unwrap().contains("unsupported content type: poll"));
    }

    #[test]
    fn test_empty_text_is_dropped() {
        let normalizer = Normalizer::new("r", false);
        let task = normalizer.normalize(&event(ContentType::Text, Some("   "), None));

        assert_eq!(task.status, TaskStatus::Dropped);
        assert_eq!(task.last_error.as_deref(), Some("empty text message"));
    }

    #[test]
    fn test_sender_prefix() {
        let normalizer = Normalizer::new("r", true);
        let task = normalizer.normalize(&event(ContentType::Text, Some("hi"), None));
        assert_eq!(task.payload, Payload::Text("*newsdesk*: hi".to_string()));
    }

    #[test]
    fn test_deterministic() {
        let normalizer = Normalizer::new("r", true);
        let e = event(ContentType::Document, Some("report"), Some("https://files/d.pdf"));
        assert_eq!(normalizer.normalize(&e), normalizer.normalize(&e));
    }
}
