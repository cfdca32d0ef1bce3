//! Canonical message types for bridge communication.
//!
//! This module defines the single source of truth for the messages that
//! flow between the Telegram listener, the pipeline and the delivery engine.

use chrono::{DateTime, Utc};

use crate::common::types::ContentType;

/// A message observed on the source channel, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    /// Message id within the source channel.
    pub source_message_id: i64,
    /// Source channel (chat) id.
    pub source_channel_id: i64,
    /// What kind of content the message carries.
    pub content_type: ContentType,
    /// Text body for text messages, caption for media messages.
    pub text: Option<String>,
    /// Fetchable location of the attached media.
    pub media_reference: Option<String>,
    /// MIME type reported by the source, if any.
    pub mime_type: Option<String>,
    /// Display name of the author (username or channel signature).
    pub author: Option<String>,
    /// Numeric id of the author, when the source exposes one.
    pub author_id: Option<i64>,
    /// When the source received the message.
    pub received_at: DateTime<Utc>,
}

#[cfg(test)]
impl InboundEvent {
    /// Plain text event with no author or media.
    pub fn text(channel_id: i64, message_id: i64, text: &str, received_at: DateTime<Utc>) -> Self {
        Self {
            source_message_id: message_id,
            source_channel_id: channel_id,
            content_type: ContentType::Text,
            text: Some(text.to_string()),
            media_reference: None,
            mime_type: None,
            author: None,
            author_id: None,
            received_at,
        }
    }
}

/// Operator command issued through the bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    /// Resume dequeuing.
    Start,
    /// Pause dequeuing; pending tasks stay queued.
    Stop,
    /// Report the current bridge status.
    Status,
    /// List available commands.
    Help,
}

/// Operator command together with the chat to answer in.
#[derive(Debug, Clone)]
pub struct OperatorRequest {
    pub command: OperatorCommand,
    pub reply_chat_id: i64,
    pub issued_by: Option<String>,
}

/// Gating signals accepted by the delivery engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineCommand {
    Start,
    Stop,
}
