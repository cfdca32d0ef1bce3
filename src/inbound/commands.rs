//! Operator commands: `/start`, `/stop`, `/status`, `/help`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::common::error::TelegramResult;
use crate::common::messages::{OperatorCommand, OperatorRequest};
use crate::delivery::EngineHandle;

pub const HELP_TEXT: &str = "Available commands:\n\
/start - resume forwarding\n\
/stop - pause forwarding (queued messages are kept)\n\
/status - show bridge status\n\
/help - show this message";

/// Where command replies are sent.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn reply(&self, chat_id: i64, text: &str) -> TelegramResult<()>;
}

/// Parse a bot command, accepting the `/cmd@botname` form.
pub fn parse_command(text: &str) -> Option<OperatorCommand> {
    let word = text.split_whitespace().next()?;
    let name = word.strip_prefix('/')?;
    let name = name.split('@').next().unwrap_or(name);

    match name.to_ascii_lowercase().as_str() {
        "start" => Some(OperatorCommand::Start),
        "stop" => Some(OperatorCommand::Stop),
        "status" => Some(OperatorCommand::Status),
        "help" => Some(OperatorCommand::Help),
        _ => None,
    }
}

/// Apply a command to the engine and build the reply text.
pub fn execute(command: OperatorCommand, engine: &EngineHandle) -> String {
    match command {
        OperatorCommand::Start => {
            if engine.start() {
                "Forwarding started.".to_string()
            } else {
                "Delivery engine is not running.".to_string()
            }
        }
        OperatorCommand::Stop => {
            if engine.stop() {
                let pending = engine.status().pending;
                format!("Forwarding stopped. {} queued message(s) kept.", pending)
            } else {
                "Delivery engine is not running.".to_string()
            }
        }
        OperatorCommand::Status => engine.status().render(),
        OperatorCommand::Help => HELP_TEXT.to_string(),
    }
}

/// Serve operator requests until the listener goes away.
pub async fn run_command_handler(
    mut requests: mpsc::UnboundedReceiver<OperatorRequest>,
    engine: EngineHandle,
    replies: Arc<dyn ReplySink>,
) {
    while let Some(request) = requests.recv().await {
        info!(
            "Operator command {:?} from {}",
            request.command,
            request.issued_by.as_deref().unwrap_or("unknown")
        );
        let text = execute(request.command, &engine);
        if let Err(e) = replies.reply(request.reply_chat_id, &text).await {
            warn!("Failed to reply to chat {}: {}", request.reply_chat_id, e);
        }
    }
    info!("Command handler ended");
}
