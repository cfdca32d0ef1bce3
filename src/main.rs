//! tg2wa - Telegram channel to WhatsApp forwarding bridge
//!
//! Watches a Telegram channel and relays every new post to a WhatsApp
//! recipient, with content filters, ordered delivery and retries.

mod bridge;
mod common;
mod config;
mod delivery;
mod inbound;
mod outbound;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use bridge::{ChannelBundle, Pipeline};
use config::{env::get_config_path, load_and_validate, LoggingConfig};
use delivery::{DeliveryEngine, EngineSettings, FileActivityLog, Journal, TokioClock};
use inbound::{run_command_handler, TelegramClient, TelegramListener};
use outbound::WhatsAppSender;

#[tokio::main]
async fn main() -> Result<()> {
    // Config first, so the log level and directory are known.
    let config_path = get_config_path();
    let loaded = load_and_validate(&config_path);
    let logging = loaded
        .as_ref()
        .map(|c| c.logging.clone())
        .unwrap_or_default();
    let _log_guard = init_tracing(&logging);

    info!("tg2wa v{} starting...", env!("CARGO_PKG_VERSION"));
    info!("Loading configuration from {}...", config_path);

    let config = loaded.map_err(|e| {
        error!("Failed to load configuration: {}", e);
        error!("Please ensure {} exists and is properly formatted.", config_path);
        e
    })?;

    info!("Configuration loaded successfully");
    info!("  Telegram channel: {}", config.telegram.channel_id);
    info!("  WhatsApp recipient: {}", config.whatsapp.recipient);
    info!(
        "  Retries: {} attempts, {}ms base, {}ms max",
        config.delivery.max_attempts, config.delivery.base_delay_ms, config.delivery.max_delay_ms
    );

    // ============================================================
    // Delivery engine
    // ============================================================
    let sender = Arc::new(WhatsAppSender::new(&config.whatsapp)?);
    let activity = FileActivityLog::open(&config.delivery.activity_log)?;
    info!("Recording delivery outcomes to {}", config.delivery.activity_log);

    let (mut engine, intake_tx, engine_handle) = DeliveryEngine::new(
        EngineSettings::from_config(&config.delivery),
        sender,
        Box::new(activity),
        Arc::new(TokioClock),
    );

    if let Some(state_file) = &config.delivery.state_file {
        let journal = Journal::new(state_file);
        match journal.load() {
            Ok(state) => engine.restore(state),
            Err(e) => warn!("Could not restore delivery state from {}: {}", state_file, e),
        }
        info!("Delivery state kept in {}", journal.path().display());
        engine = engine.with_journal(journal);
    }

    if config.delivery.start_stopped {
        info!("Delivery stopped until an operator sends /start");
        engine = engine.paused();
    }

    // ============================================================
    // Spawn tasks
    // ============================================================
    let channels = ChannelBundle::new(config.delivery.inbound_buffer);
    let shutdown_tx = channels.control.shutdown_tx;
    let telegram = Arc::new(TelegramClient::new(&config.telegram)?);

    let mut engine_task = tokio::spawn(engine.run(channels.control.shutdown_rx));

    let pipeline_task = tokio::spawn(
        Pipeline::from_config(&config).run(channels.consumers.events_rx, intake_tx),
    );

    let command_task = tokio::spawn(run_command_handler(
        channels.consumers.commands_rx,
        engine_handle,
        telegram.clone(),
    ));

    let listener = TelegramListener::new(
        telegram,
        &config.telegram,
        channels.listener.events_tx,
        channels.listener.commands_tx,
    );
    let listener_task = tokio::spawn(listener.run(channels.listener.shutdown_rx));

    // ============================================================
    // Run until a signal or a task exits
    // ============================================================
    let engine_finished = tokio::select! {
        biased;
        _ = shutdown_signal() => {
            info!("Shutdown signal received - finishing in-flight deliveries...");
            false
        }
        _ = listener_task => {
            warn!("Telegram listener exited");
            false
        }
        _ = pipeline_task => false,
        _ = command_task => false,
        result = &mut engine_task => {
            if let Err(e) = result {
                error!("Delivery engine task panicked: {}", e);
            }
            true
        }
    };

    if let Err(e) = shutdown_tx.send(true) {
        debug!("Shutdown channel closed: {}", e);
    }

    if !engine_finished {
        let grace = config.delivery.attempt_timeout() + Duration::from_secs(5);
        match tokio::time::timeout(grace, engine_task).await {
            Ok(Ok(snapshot)) => info!(
                "Delivery engine stopped: {} delivered, {} failed, {} dropped, {} pending",
                snapshot.delivered, snapshot.failed, snapshot.dropped, snapshot.pending
            ),
            Ok(Err(e)) => warn!("Delivery engine task panicked: {}", e),
            Err(_) => warn!("Delivery engine shutdown timed out"),
        }
    }

    info!("Exiting...");
    Ok(())
}

/// Console logging, plus a daily rotated file when `logging.directory` is set.
///
/// `RUST_LOG` takes precedence over `logging.level`.
fn init_tracing(logging: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level))
    };
    let console = tracing_subscriber::fmt::layer().with_filter(filter());

    match &logging.directory {
        Some(directory) => {
            let file_appender = tracing_appender::rolling::daily(directory, "tg2wa.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let file = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(filter());
            tracing_subscriber::registry().with(console).with(file).init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(console).init();
            None
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
