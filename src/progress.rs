//! Progress fan-out for SSE subscribers.
//!
//! One pump task per API process subscribes to the broker's broadcast
//! channel and republishes every event on an in-process
//! `tokio::sync::broadcast` channel. Each SSE connection holds its own
//! receiver; a receiver that lags past the buffer is dropped rather than
//! replayed (the per-document snapshot covers late joiners).

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::llm::backoff_delay;
use crate::models::ProgressEvent;
use crate::queue::Broker;

/// Events buffered per subscriber before a slow client is disconnected.
const CHANNEL_CAPACITY: usize = 256;

pub struct ProgressBus {
    tx: broadcast::Sender<ProgressEvent>,
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        ProgressBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    /// Injects an event directly, bypassing the broker. Used by the pump
    /// and by tests.
    pub fn send(&self, event: ProgressEvent) {
        // Send only fails when there are no subscribers, which is fine.
        let _ = self.tx.send(event);
    }

    /// Runs forever: subscribe to the broker, forward events, resubscribe
    /// with backoff when the connection drops.
    pub async fn pump(self: Arc<Self>, broker: Arc<dyn Broker>) {
        use futures::StreamExt;

        let mut attempt: u32 = 0;
        loop {
            match broker.subscribe().await {
                Ok(mut stream) => {
                    attempt = 0;
                    tracing::info!("progress pump subscribed");
                    while let Some(event) = stream.next().await {
                        self.send(event);
                    }
                    tracing::warn!("progress subscription ended, resubscribing");
                }
                Err(e) => {
                    attempt = (attempt + 1).min(6);
                    tracing::warn!(error = %e, "progress subscribe failed, backing off");
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Document, Stage};
    use crate::scope::ScopeKey;
    use uuid::Uuid;

    fn event(stage: Stage) -> ProgressEvent {
        let doc = Document::queued(
            Uuid::new_v4(),
            ScopeKey::tenant("acme"),
            "a.md".into(),
            "text/markdown".into(),
            "/tmp/a.md".into(),
        );
        ProgressEvent::for_stage(&doc, stage, "msg")
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = ProgressBus::new();
        let mut rx = bus.subscribe();
        bus.send(event(Stage::Queued));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.stage, Stage::Queued);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_fine() {
        let bus = ProgressBus::new();
        bus.send(event(Stage::Indexed));
    }

    #[tokio::test]
    async fn lagged_subscriber_sees_error() {
        let bus = ProgressBus::new();
        let mut rx = bus.subscribe();
        for _ in 0..(CHANNEL_CAPACITY + 10) {
            bus.send(event(Stage::Processing));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }
}
