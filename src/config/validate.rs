//! Configuration validation.
//!
//! Validates configuration values and provides helpful error messages.

use fancy_regex::Regex;

use crate::common::error::ConfigError;
use crate::config::types::Config;

/// Content types accepted by `filters.media_types`.
const KNOWN_CONTENT_TYPES: [&str; 7] = [
    "text", "photo", "video", "document", "audio", "voice", "sticker",
];

/// Validate a configuration and return detailed errors.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    // Telegram
    if config.telegram.token.is_empty() {
        errors.push("telegram.token is required".to_string());
    }
    if config.telegram.token == "YOUR_TELEGRAM_TOKEN_HERE" {
        errors.push("telegram.token has not been configured (still using placeholder)".to_string());
    }
    if config.telegram.channel_id == 0 {
        errors.push("telegram.channel_id must be non-zero".to_string());
    }

    // WhatsApp
    if config.whatsapp.api_key.is_empty() {
        errors.push("whatsapp.api_key is required".to_string());
    }
    if config.whatsapp.phone_number_id.is_empty() {
        errors.push("whatsapp.phone_number_id is required".to_string());
    }
    if config.whatsapp.recipient.is_empty() {
        errors.push("whatsapp.recipient is required".to_string());
    }

    // Delivery tunables
    let delivery = &config.delivery;
    if delivery.max_attempts == 0 {
        errors.push("delivery.max_attempts must be at least 1".to_string());
    }
    if delivery.base_delay_ms == 0 {
        errors.push("delivery.base_delay_ms must be non-zero".to_string());
    }
    if delivery.max_delay_ms < delivery.base_delay_ms {
        errors.push(format!(
            "delivery.max_delay_ms ({}) must not be below delivery.base_delay_ms ({})",
            delivery.max_delay_ms, delivery.base_delay_ms
        ));
    }
    if delivery.dedup_capacity == 0 {
        errors.push("delivery.dedup_capacity must be non-zero".to_string());
    }
    if delivery.queue_capacity == 0 {
        errors.push("delivery.queue_capacity must be non-zero".to_string());
    }
    if delivery.inbound_buffer == 0 {
        errors.push("delivery.inbound_buffer must be non-zero".to_string());
    }
    if delivery.attempt_timeout_secs == 0 {
        errors.push("delivery.attempt_timeout_secs must be non-zero".to_string());
    }

    // Filters
    for (i, pattern) in config.filters.patterns.iter().enumerate() {
        if Regex::new(pattern).is_err() {
            errors.push(format!(
                "filters.patterns[{}] is not a valid regex: '{}'",
                i, pattern
            ));
        }
    }
    for (i, media_type) in config.filters.media_types.iter().enumerate() {
        if !KNOWN_CONTENT_TYPES.contains(&media_type.to_lowercase().as_str()) {
            errors.push(format!(
                "filters.media_types[{}] '{}' is invalid (use: {})",
                i,
                media_type,
                KNOWN_CONTENT_TYPES.join(", ")
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError {
            message: errors.join("\n"),
        })
    }
}
