//! Configuration type definitions.

use std::time::Duration;

use serde::Deserialize;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub telegram: TelegramConfig,
    pub whatsapp: WhatsAppConfig,
    #[serde(default)]
    pub filters: FiltersConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Telegram bot and source channel settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    /// Bot token from BotFather.
    #[serde(default)]
    pub token: String,
    /// Channel whose posts are forwarded.
    #[serde(default)]
    pub channel_id: i64,
    #[serde(default = "default_telegram_api_base")]
    pub api_base: String,
    /// Long-poll timeout passed to getUpdates.
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    /// Chat ids allowed to issue operator commands (empty = anyone).
    #[serde(default)]
    pub operators: Vec<i64>,
}

/// WhatsApp Business Cloud API settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub phone_number_id: String,
    /// Destination phone number or WhatsApp id.
    #[serde(default)]
    pub recipient: String,
    #[serde(default = "default_whatsapp_api_base")]
    pub api_base: String,
    /// Prefix forwarded text with the author's name.
    #[serde(default)]
    pub include_sender: bool,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Content filters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FiltersConfig {
    /// Forward only messages containing one of these keywords.
    #[serde(default)]
    pub include: Vec<String>,
    /// Never forward messages containing one of these keywords.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Regex patterns; a match blocks the message.
    #[serde(default)]
    pub patterns: Vec<String>,
    /// Usernames or user ids whose messages are ignored.
    #[serde(default)]
    pub ignore_users: Vec<String>,
    /// Content types to forward: text, photo, video, document, audio, voice, sticker.
    #[serde(default)]
    pub media_types: Vec<String>,
}

/// Delivery queue and retry tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_true")]
    pub jitter: bool,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    /// Age after which a seen id leaves the dedup window (0 = capacity only).
    #[serde(default)]
    pub dedup_ttl_secs: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_inbound_buffer")]
    pub inbound_buffer: usize,
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
    /// JSON-lines file receiving terminal task outcomes.
    #[serde(default = "default_activity_log")]
    pub activity_log: String,
    /// File holding pending tasks across restarts.
    #[serde(default)]
    pub state_file: Option<String>,
    /// Hold deliveries until an operator sends /start.
    #[serde(default)]
    pub start_stopped: bool,
}

impl DeliveryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn dedup_ttl(&self) -> Option<Duration> {
        (self.dedup_ttl_secs > 0).then(|| Duration::from_secs(self.dedup_ttl_secs))
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: true,
            dedup_capacity: default_dedup_capacity(),
            dedup_ttl_secs: 0,
            queue_capacity: default_queue_capacity(),
            inbound_buffer: default_inbound_buffer(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            activity_log: default_activity_log(),
            state_file: None,
            start_stopped: false,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default level when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory for daily-rolling log files (none = stdout only).
    #[serde(default)]
    pub directory: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: None,
        }
    }
}

fn default_telegram_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_whatsapp_api_base() -> String {
    "https://graph.facebook.com/v17.0".to_string()
}

fn default_poll_timeout_secs() -> u64 {
    30
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    2_000
}

fn default_max_delay_ms() -> u64 {
    5 * 60 * 1_000
}

fn default_true() -> bool {
    true
}

fn default_dedup_capacity() -> usize {
    1_000
}

fn default_queue_capacity() -> usize {
    1_000
}

fn default_inbound_buffer() -> usize {
    100
}

fn default_attempt_timeout_secs() -> u64 {
    60
}

fn default_activity_log() -> String {
    "logs/activity.jsonl".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}
