//! Telegram Bot API long-polling listener.
//!
//! Channel posts from the configured channel become [`InboundEvent`]s;
//! operator commands from any chat go to the command handler.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::BackoffBuilder;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::common::error::{TelegramError, TelegramResult};
use crate::common::messages::{InboundEvent, OperatorRequest};
use crate::common::types::ContentType;
use crate::config::types::TelegramConfig;
use crate::inbound::commands::{parse_command, ReplySink};

/// Slack added on top of the long-poll timeout for the HTTP request.
const REQUEST_SLACK: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    error_code: Option<i64>,
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
    pub channel_post: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileRef {
    pub file_id: String,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    pub date: i64,
    pub from: Option<User>,
    pub author_signature: Option<String>,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub photo: Option<Vec<FileRef>>,
    pub video: Option<FileRef>,
    pub document: Option<FileRef>,
    pub audio: Option<FileRef>,
    pub voice: Option<FileRef>,
    pub sticker: Option<FileRef>,
    pub animation: Option<Value>,
    pub video_note: Option<Value>,
    pub poll: Option<Value>,
    pub venue: Option<Value>,
    pub location: Option<Value>,
    pub contact: Option<Value>,
    pub dice: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct File {
    file_path: Option<String>,
}

impl Message {
    /// Content type plus the attached file, if any.
    pub fn content(&self) -> (ContentType, Option<&FileRef>) {
        if self.text.is_some() {
            return (ContentType::Text, None);
        }
        // Largest size comes last.
        if let Some(photo) = self.photo.as_ref().and_then(|sizes| sizes.last()) {
            return (ContentType::Photo, Some(photo));
        }
        if let Some(video) = &self.video {
            return (ContentType::Video, Some(video));
        }
        // Animations also carry a `document` field.
        if self.animation.is_some() {
            return (ContentType::Other("animation".to_string()), None);
        }
        if let Some(document) = &self.document {
            return (ContentType::Document, Some(document));
        }
        if let Some(audio) = &self.audio {
            return (ContentType::Audio, Some(audio));
        }
        if let Some(voice) = &self.voice {
            return (ContentType::Voice, Some(voice));
        }
        if let Some(sticker) = &self.sticker {
            return (ContentType::Sticker, Some(sticker));
        }

        let other = [
            ("video_note", self.video_note.is_some()),
            ("poll", self.poll.is_some()),
            ("venue", self.venue.is_some()),
            ("location", self.location.is_some()),
            ("contact", self.contact.is_some()),
            ("dice", self.dice.is_some()),
        ]
        .into_iter()
        .find(|(_, present)| *present)
        .map(|(name, _)| name)
        .unwrap_or("unknown");
        (ContentType::Other(other.to_string()), None)
    }

    pub fn author(&self) -> Option<String> {
        self.author_signature.clone().or_else(|| {
            self.from
                .as_ref()
                .and_then(|u| u.username.clone().or_else(|| u.first_name.clone()))
        })
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.date, 0).unwrap_or_else(Utc::now)
    }

    /// Build the inbound event, given the resolved media URL.
    pub fn to_inbound(&self, media_reference: Option<String>) -> InboundEvent {
        let (content_type, file) = self.content();
        InboundEvent {
            source_message_id: self.message_id,
            source_channel_id: self.chat.id,
            text: self.text.clone().or_else(|| self.caption.clone()),
            media_reference,
            mime_type: file.and_then(|f| f.mime_type.clone()),
            content_type,
            author: self.author(),
            author_id: self.from.as_ref().map(|u| u.id),
            received_at: self.received_at(),
        }
    }
}

/// Thin Bot API client.
pub struct TelegramClient {
    client: reqwest::Client,
    bot_base: String,
    file_base: String,
    poll_timeout: Duration,
}

impl TelegramClient {
    pub fn new(config: &TelegramConfig) -> TelegramResult<Self> {
        let poll_timeout = Duration::from_secs(config.poll_timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(poll_timeout + REQUEST_SLACK)
            .build()?;
        let base = config.api_base.trim_end_matches('/');

        Ok(Self {
            client,
            bot_base: format!("{}/bot{}", base, config.token),
            file_base: format!("{}/file/bot{}", base, config.token),
            poll_timeout,
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: &Value) -> TelegramResult<T> {
        let response = self
            .client
            .post(format!("{}/{}", self.bot_base, method))
            .json(body)
            .send()
            .await?;
        let reply: ApiResponse<T> = response.json().await?;

        if !reply.ok {
            return Err(TelegramError::Api {
                code: reply.error_code.unwrap_or_default(),
                description: reply.description.unwrap_or_default(),
            });
        }
        reply.result.ok_or_else(|| TelegramError::InvalidResponse {
            message: format!("{} returned no result", method),
        })
    }

    /// Long-poll for updates starting at `offset`.
    pub async fn get_updates(&self, offset: i64) -> TelegramResult<Vec<Update>> {
        self.call(
            "getUpdates",
            &json!({
                "offset": offset,
                "timeout": self.poll_timeout.as_secs(),
                "allowed_updates": ["message", "channel_post"],
            }),
        )
        .await
    }

    /// Download URL for a file id.
    pub async fn get_file_url(&self, file_id: &str) -> TelegramResult<String> {
        let file: File = self.call("getFile", &json!({ "file_id": file_id })).await?;
        let path = file.file_path.ok_or_else(|| TelegramError::InvalidResponse {
            message: format!("file {} has no download path", file_id),
        })?;
        Ok(format!("{}/{}", self.file_base, path))
    }

    pub async fn send_message(&self, chat_id: i64, text: &str) -> TelegramResult<()> {
        let _: Value = self
            .call("sendMessage", &json!({ "chat_id": chat_id, "text": text }))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ReplySink for TelegramClient {
    async fn reply(&self, chat_id: i64, text: &str) -> TelegramResult<()> {
        self.send_message(chat_id, text).await
    }
}

/// Exponential backoff between failed polls.
/// 5s initial, 5min max, factor 1.1, with jitter, unlimited retries.
fn poll_backoff() -> impl Iterator<Item = Duration> {
    backon::ExponentialBuilder::default()
        .with_min_delay(Duration::from_secs(5))
        .with_max_delay(Duration::from_secs(300))
        .with_factor(1.1)
        .with_jitter()
        .without_max_times()
        .build()
}

/// Polls Telegram and routes updates to the pipeline and command handler.
pub struct TelegramListener {
    client: Arc<TelegramClient>,
    channel_id: i64,
    operators: Vec<i64>,
    offset: i64,
    events_tx: mpsc::Sender<InboundEvent>,
    commands_tx: mpsc::UnboundedSender<OperatorRequest>,
}

impl TelegramListener {
    pub fn new(
        client: Arc<TelegramClient>,
        config: &TelegramConfig,
        events_tx: mpsc::Sender<InboundEvent>,
        commands_tx: mpsc::UnboundedSender<OperatorRequest>,
    ) -> Self {
        Self {
            client,
            channel_id: config.channel_id,
            operators: config.operators.clone(),
            offset: 0,
            events_tx,
            commands_tx,
        }
    }

    /// Poll until shutdown or until the pipeline goes away.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut backoff = poll_backoff();
        info!("Listening for posts in Telegram channel {}", self.channel_id);

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let result = tokio::select! {
                result = self.poll_once() => result,
                _ = shutdown_rx.changed() => break,
            };

            match result {
                Ok(true) => {
                    backoff = poll_backoff();
                    continue;
                }
                Ok(false) => {
                    info!("Pipeline closed, stopping Telegram listener");
                    break;
                }
                Err(e) => error!("Telegram polling failed: {}", e),
            }

            let delay = backoff.next().unwrap_or(Duration::from_secs(300));
            info!("Retrying Telegram in {:.1} seconds...", delay.as_secs_f64());

            tokio::select! {
                _ = tokio::time::sleep(delay) => {},
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received during backoff");
                        break;
                    }
                }
            }
        }

        info!("Telegram listener stopped");
    }

    /// One `getUpdates` round. Returns `Ok(false)` once the pipeline is gone.
    pub async fn poll_once(&mut self) -> TelegramResult<bool> {
        let updates = self.client.get_updates(self.offset).await?;
        if !updates.is_empty() {
            debug!("Received {} update(s)", updates.len());
        }

        for update in updates {
            self.offset = self.offset.max(update.update_id + 1);
            let Some(message) = update.channel_post.or(update.message) else {
                continue;
            };
            if !self.route(message).await {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Returns false when the receiving side has closed.
    ///
    /// Posts in the watched channel are always forwarded, even when they
    /// look like commands. Commands are only taken from other chats.
    async fn route(&self, message: Message) -> bool {
        if message.chat.id == self.channel_id {
            return self.forward(message).await;
        }

        if let Some(command) = message.text.as_deref().and_then(parse_command) {
            if !self.is_operator(message.chat.id) {
                warn!("Ignoring {:?} from unauthorized chat {}", command, message.chat.id);
                return true;
            }
            let request = OperatorRequest {
                command,
                reply_chat_id: message.chat.id,
                issued_by: message.author(),
            };
            return self.commands_tx.send(request).is_ok();
        }

        debug!("Ignoring message from chat {}", message.chat.id);
        true
    }

    async fn forward(&self, message: Message) -> bool {
        let media_reference = match message.content().1 {
            Some(file) => match self.client.get_file_url(&file.file_id).await {
                Ok(url) => Some(url),
                Err(e) => {
                    warn!("Could not resolve media of message {}: {}", message.message_id, e);
                    None
                }
            },
            None => None,
        };

        // Blocks while the pipeline is saturated.
        self.events_tx
            .send(message.to_inbound(media_reference))
            .await
            .is_ok()
    }

    fn is_operator(&self, chat_id: i64) -> bool {
        self.operators.is_empty() || self.operators.contains(&chat_id)
    }
}
