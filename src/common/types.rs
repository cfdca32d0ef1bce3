//! Shared types used across the application.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a forwarded message, derived from its source location.
///
/// Stable across retries. Ordering is by channel, then message id, which
/// matches the order messages were posted within one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId {
    pub channel_id: i64,
    pub message_id: i64,
}

impl TaskId {
    pub fn new(channel_id: i64, message_id: i64) -> Self {
        Self {
            channel_id,
            message_id,
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel_id, self.message_id)
    }
}

/// Kind of media attached to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Voice,
    Document,
    Sticker,
}

impl MediaKind {
    /// Whether the destination accepts a caption alongside this media kind.
    pub fn supports_caption(&self) -> bool {
        matches!(self, Self::Image | Self::Video | Self::Document)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Voice => "voice",
            Self::Document => "document",
            Self::Sticker => "sticker",
        }
    }
}

/// Content of a forwarded message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Payload {
    Text(String),
    Media {
        kind: MediaKind,
        /// Where the destination can fetch the media from.
        reference: String,
        caption: Option<String>,
    },
}

impl Payload {
    /// Text the content filters run against: the body of a text message or
    /// the caption of a media message.
    pub fn filter_text(&self) -> &str {
        match self {
            Self::Text(text) => text,
            Self::Media { caption, .. } => caption.as_deref().unwrap_or(""),
        }
    }
}

/// Lifecycle status of a [`ForwardTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InFlight,
    Delivered,
    Failed,
    Dropped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Failed | Self::Dropped)
    }

    /// Whether moving from `self` to `next` is a legal forward transition.
    pub fn can_become(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, InFlight)
                | (Pending, Dropped)
                | (InFlight, Delivered)
                | (InFlight, Pending)
                | (InFlight, Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Dropped => "dropped",
        };
        f.write_str(name)
    }
}

/// Canonical unit of work: one message to relay to one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardTask {
    pub id: TaskId,
    pub recipient: String,
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub status: TaskStatus,
    pub last_error: Option<String>,
}

impl ForwardTask {
    pub fn new(id: TaskId, recipient: String, payload: Payload, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            recipient,
            payload,
            created_at,
            attempt_count: 0,
            status: TaskStatus::Pending,
            last_error: None,
        }
    }

    /// Move to `next` if that is a legal transition from the current status.
    ///
    /// Returns false and leaves the task untouched otherwise.
    pub fn advance(&mut self, next: TaskStatus) -> bool {
        if !self.status.can_become(next) {
            return false;
        }
        self.status = next;
        true
    }

    /// Mark the task as rejected before any delivery attempt.
    pub fn drop_with(&mut self, reason: impl Into<String>) {
        if self.advance(TaskStatus::Dropped) {
            self.last_error = Some(reason.into());
        }
    }
}

/// Content type of an inbound source message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentType {
    Text,
    Photo,
    Video,
    Document,
    Audio,
    Voice,
    Sticker,
    /// Anything the bridge cannot forward (polls, locations, ...).
    Other(String),
}

impl ContentType {
    pub fn name(&self) -> &str {
        match self {
            Self::Text => "text",
            Self::Photo => "photo",
            Self::Video => "video",
            Self::Document => "document",
            Self::Audio => "audio",
            Self::Voice => "voice",
            Self::Sticker => "sticker",
            Self::Other(name) => name,
        }
    }
}
