//! Error types for the application.

use thiserror::Error;

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {message}")]
    IoError { path: String, message: String },

    #[error("Failed to parse config: {message}")]
    ParseError { message: String },

    #[error("Config validation failed: {message}")]
    ValidationError { message: String },
}

/// Errors talking to the Telegram Bot API.
#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Telegram API error {code}: {description}")]
    Api { code: i64, description: String },

    #[error("Unexpected response: {message}")]
    InvalidResponse { message: String },
}

/// Errors writing the append-only activity log.
#[derive(Debug, Error)]
pub enum ActivityLogError {
    #[error("IO error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode entry: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors saving or restoring pending tasks.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("IO error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed journal: {0}")]
    Format(#[from] serde_json::Error),
}

/// Result type alias for Telegram operations.
pub type TelegramResult<T> = std::result::Result<T, TelegramError>;
