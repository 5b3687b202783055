//! Observer events published by the client.

use bytes::Bytes;
use tokio::sync::broadcast;

/// Capacity of the event channel. Slow subscribers see `Lagged`.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Traffic notification, one per direction per operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A command frame was submitted.
    Command {
        /// Operation name.
        operation: &'static str,
        /// Encoded frame.
        bytes: Bytes,
        /// Output handles the response will carry.
        handles_out: usize,
    },
    /// A response frame arrived.
    Response {
        /// Operation name.
        operation: &'static str,
        /// Raw response frame.
        bytes: Bytes,
        /// Output handles the response carries.
        handles_out: usize,
        /// Latency cycles, if latency records are enabled.
        latency: Option<u64>,
    },
}

impl ClientEvent {
    /// Operation name.
    pub fn operation(&self) -> &'static str {
        match self {
            ClientEvent::Command { operation, .. } | ClientEvent::Response { operation, .. } => {
                operation
            }
        }
    }

    /// Frame bytes.
    pub fn bytes(&self) -> &Bytes {
        match self {
            ClientEvent::Command { bytes, .. } | ClientEvent::Response { bytes, .. } => bytes,
        }
    }
}

#[derive(Debug)]
pub(crate) struct EventBus {
    tx: broadcast::Sender<ClientEvent>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }

    /// Publish without caring whether anyone listens.
    pub(crate) fn emit(&self, event: ClientEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers() {
        let bus = EventBus::new();
        bus.emit(ClientEvent::Command {
            operation: "Startup",
            bytes: Bytes::from_static(&[0x80, 0x01]),
            handles_out: 0,
        });

        let mut rx = bus.subscribe();
        bus.emit(ClientEvent::Response {
            operation: "Startup",
            bytes: Bytes::from_static(&[0x80, 0x01]),
            handles_out: 0,
            latency: Some(42),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.operation(), "Startup");
        assert!(matches!(event, ClientEvent::Response { latency: Some(42), .. }));
    }
}
