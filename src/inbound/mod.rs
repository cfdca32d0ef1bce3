//! Telegram side of the bridge: polling and operator commands.

pub mod commands;
pub mod telegram;

pub use commands::run_command_handler;
pub use telegram::{TelegramClient, TelegramListener};
