//! Environment variable overrides for configuration.
//!
//! Supports overriding config values with environment variables:
//! - `TG2WA_TELEGRAM_TOKEN` - Telegram bot token
//! - `TG2WA_TELEGRAM_CHANNEL_ID` - Source channel id
//! - `TG2WA_WHATSAPP_API_KEY` - WhatsApp Cloud API access token
//! - `TG2WA_WHATSAPP_PHONE_NUMBER_ID` - Sending phone number id
//! - `TG2WA_WHATSAPP_RECIPIENT` - Destination number

use std::env;

use tracing::warn;

use crate::config::types::Config;

/// Environment variable prefix for all config overrides.
const ENV_PREFIX: &str = "TG2WA";

/// Apply environment variable overrides to a config.
///
/// This allows tokens and keys to be provided via environment variables
/// instead of the config file.
pub fn apply_env_overrides(config: Config) -> Config {
    apply_overrides_from(config, |name| env::var(format!("{}_{}", ENV_PREFIX, name)).ok())
}

fn apply_overrides_from(mut config: Config, lookup: impl Fn(&str) -> Option<String>) -> Config {
    if let Some(token) = lookup("TELEGRAM_TOKEN") {
        config.telegram.token = token;
    }
    if let Some(channel_id) = lookup("TELEGRAM_CHANNEL_ID") {
        match channel_id.parse() {
            Ok(id) => config.telegram.channel_id = id,
            Err(_) => warn!("Ignoring {}_TELEGRAM_CHANNEL_ID: '{}' is not a number", ENV_PREFIX, channel_id),
        }
    }

    if let Some(api_key) = lookup("WHATSAPP_API_KEY") {
        config.whatsapp.api_key = api_key;
    }
    if let Some(phone_number_id) = lookup("WHATSAPP_PHONE_NUMBER_ID") {
        config.whatsapp.phone_number_id = phone_number_id;
    }
    if let Some(recipient) = lookup("WHATSAPP_RECIPIENT") {
        config.whatsapp.recipient = recipient;
    }

    config
}

/// Check if any credential environment variables are set but empty.
///
/// Returns a list of variable names that are set but empty.
pub fn check_empty_env_vars() -> Vec<String> {
    let vars = [
        format!("{}_TELEGRAM_TOKEN", ENV_PREFIX),
        format!("{}_WHATSAPP_API_KEY", ENV_PREFIX),
    ];

    vars.into_iter()
        .filter(|var| env::var(var).map(|v| v.is_empty()).unwrap_or(false))
        .collect()
}

/// Get the config file path from environment or use default.
///
/// Checks `TG2WA_CONFIG` environment variable, otherwise returns "tg2wa.conf".
pub fn get_config_path() -> String {
    env::var(format!("{}_CONFIG", ENV_PREFIX)).unwrap_or_else(|_| "tg2wa.conf".to_string())
}
