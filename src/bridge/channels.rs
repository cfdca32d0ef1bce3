//! Bridge channel management.
//!
//! Groups the channels connecting the Telegram listener, the pipeline and
//! the command handler.

use tokio::sync::{mpsc, watch};

use crate::common::messages::{InboundEvent, OperatorRequest};

/// Channels for the Telegram listener.
pub struct ListenerChannels {
    /// Sender for channel posts (Telegram -> pipeline).
    pub events_tx: mpsc::Sender<InboundEvent>,
    /// Sender for operator commands (Telegram -> command handler).
    pub commands_tx: mpsc::UnboundedSender<OperatorRequest>,
    /// Receiver for shutdown signal.
    pub shutdown_rx: watch::Receiver<bool>,
}

/// Receivers consumed by the pipeline and the command handler.
pub struct ConsumerChannels {
    pub events_rx: mpsc::Receiver<InboundEvent>,
    pub commands_rx: mpsc::UnboundedReceiver<OperatorRequest>,
}

/// Control channels for shutdown coordination.
pub struct ControlChannels {
    /// Sender to trigger shutdown.
    pub shutdown_tx: watch::Sender<bool>,
    /// Extra receivers (for the delivery engine).
    pub shutdown_rx: watch::Receiver<bool>,
}

/// Bundle of all channels created by the bridge.
pub struct ChannelBundle {
    pub listener: ListenerChannels,
    pub consumers: ConsumerChannels,
    pub control: ControlChannels,
}

impl ChannelBundle {
    /// Create the bridge channels. Posts are buffered up to `inbound_buffer`;
    /// a full buffer blocks the listener.
    pub fn new(inbound_buffer: usize) -> Self {
        let (events_tx, events_rx) = mpsc::channel(inbound_buffer.max(1));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            listener: ListenerChannels {
                events_tx,
                commands_tx,
                shutdown_rx: shutdown_rx.clone(),
            },
            consumers: ConsumerChannels {
                events_rx,
                commands_rx,
            },
            control: ControlChannels {
                shutdown_tx,
                shutdown_rx,
            },
        }
    }
}
