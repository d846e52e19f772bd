use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use parlor_core::commands::CommandOutput;
use parlor_core::events::{Action, ChatMessage, Event};

use crate::hub::Hub;

/// Reads command outputs from the broker and rebroadcasts them to their rooms.
pub struct BrokerListener {
    hub: Arc<Hub>,
}

impl BrokerListener {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }

    /// Spawn the listener. It stops when the broker closes or `cancel` fires.
    pub fn start(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut deliveries = self.hub.broker().consume(cancel);
            while let Some(raw) = deliveries.next().await {
                self.relay(&raw);
            }
            tracing::info!("broker listener stopped");
        })
    }

    /// Deliver one command output. Returns how many sessions queued it.
    fn relay(&self, raw: &[u8]) -> usize {
        let metrics = self.hub.metrics();
        let output: CommandOutput = match serde_json::from_slice(raw) {
            Ok(output) => output,
            Err(e) => {
                metrics.counter_inc("broker.listener.skipped", &[("reason", "decode")], 1);
                tracing::warn!(error = %e, "skipping malformed command output");
                return 0;
            }
        };

        if !self.hub.is_valid_room(output.room_id) {
            metrics.counter_inc("broker.listener.skipped", &[("reason", "room")], 1);
            tracing::warn!(room_id = %output.room_id, "command output for unknown room");
            return 0;
        }

        let message = ChatMessage {
            message: output.message,
            from: output.from,
            sent: Utc::now(),
        };
        match Event::new(Action::MessageReceived, &message) {
            Ok(event) => self.hub.broadcast(output.room_id, Arc::new(event)),
            Err(e) => {
                tracing::warn!(room_id = %output.room_id, error = %e, "failed to encode command output");
                0
            }
        }
    }
}

/// Create a broker listener wired to `hub`.
pub fn create_listener(hub: Arc<Hub>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    BrokerListener::new(hub).start(cancel)
}
