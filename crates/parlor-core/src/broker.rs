//! Broker port: the bidirectional queue between the hub and the worker pool.
//!
//! Each side reads from one queue and writes to the other. Delivery guarantees
//! are whatever the queue behind the port provides.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, Stream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::errors::BrokerError;

pub type MessageStream = Pin<Box<dyn Stream<Item = Bytes> + Send>>;

#[async_trait]
pub trait Broker: Send + Sync {
    /// Deliver raw messages from the read queue. The stream ends when the
    /// queue closes or `cancel` fires.
    fn consume(&self, cancel: CancellationToken) -> MessageStream;

    /// Publish one raw message to the write queue.
    async fn publish(&self, payload: Bytes) -> Result<(), BrokerError>;
}

/// One end of a pair of bounded in-process queues.
///
/// Consumers of the same end compete for messages, so every message reaches
/// exactly one of them.
#[derive(Clone)]
pub struct MemoryBroker {
    inbox: Arc<Mutex<mpsc::Receiver<Bytes>>>,
    outbox: mpsc::Sender<Bytes>,
}

impl MemoryBroker {
    /// Create two connected ends: whatever one publishes, the other consumes.
    pub fn pair(capacity: usize) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(capacity.max(1));
        let (b_tx, b_rx) = mpsc::channel(capacity.max(1));
        let a = Self {
            inbox: Arc::new(Mutex::new(b_rx)),
            outbox: a_tx,
        };
        let b = Self {
            inbox: Arc::new(Mutex::new(a_rx)),
            outbox: b_tx,
        };
        (a, b)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn consume(&self, cancel: CancellationToken) -> MessageStream {
        let inbox = Arc::clone(&self.inbox);
        Box::pin(stream::unfold((inbox, cancel), |(inbox, cancel)| async move {
            let next = tokio::select! {
                _ = cancel.cancelled() => None,
                msg = async {
                    let mut rx = inbox.lock().await;
                    rx.recv().await
                } => msg,
            };
            next.map(|msg| (msg, (inbox, cancel)))
        }))
    }

    async fn publish(&self, payload: Bytes) -> Result<(), BrokerError> {
        self.outbox
            .send(payload)
            .await
            .map_err(|_| BrokerError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn pair_is_crossed() {
        let (hub, workers) = MemoryBroker::pair(8);
        hub.publish(Bytes::from_static(b"to workers")).await.unwrap();
        workers.publish(Bytes::from_static(b"to hub")).await.unwrap();

        let cancel = CancellationToken::new();
        let mut at_workers = workers.consume(cancel.clone());
        let mut at_hub = hub.consume(cancel.clone());
        assert_eq!(at_workers.next().await.unwrap(), "to workers");
        assert_eq!(at_hub.next().await.unwrap(), "to hub");
    }

    #[tokio::test]
    async fn competing_consumers_each_message_once() {
        let (hub, workers) = MemoryBroker::pair(16);
        let cancel = CancellationToken::new();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let mut stream = workers.consume(cancel.clone());
            handles.push(tokio::spawn(async move {
                let mut got = Vec::new();
                while let Some(msg) = stream.next().await {
                    got.push(msg);
                }
                got
            }));
        }

        for i in 0..10 {
            hub.publish(Bytes::from(format!("m{i}"))).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let mut all = Vec::new();
        for h in handles {
            all.extend(h.await.unwrap());
        }
        all.sort();
        assert_eq!(all.len(), 10);
        all.dedup();
        assert_eq!(all.len(), 10);
    }

    #[tokio::test]
    async fn stream_ends_on_cancel() {
        let (_hub, workers) = MemoryBroker::pair(1);
        let cancel = CancellationToken::new();
        let mut stream = workers.consume(cancel.clone());
        cancel.cancel();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn stream_ends_when_peer_dropped() {
        let (hub, workers) = MemoryBroker::pair(1);
        drop(hub);
        let mut stream = workers.consume(CancellationToken::new());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn publish_to_dropped_peer_fails() {
        let (hub, workers) = MemoryBroker::pair(1);
        drop(workers);
        let err = hub.publish(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, BrokerError::Closed));
    }
}
