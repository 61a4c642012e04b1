//! Signaling channel abstraction
//!
//! The negotiator talks to the broker through [`SignalingChannel`] so the
//! transport can be swapped: WebSocket in production, an in-process broker
//! in tests and single-binary demos.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use scopelink_core::Result;

use super::messages::SignalingMessage;

/// Buffered messages per subscriber before the broker starts dropping.
/// Signaling traffic is a handful of messages per negotiation.
pub(crate) const SUBSCRIBER_BUFFER: usize = 64;

/// Bidirectional message channel to the signaling broker.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Attach to a session topic. Messages published by other endpoints
    /// on this topic arrive on the returned receiver.
    async fn subscribe(&self, session_id: &str) -> Result<mpsc::Receiver<SignalingMessage>>;

    /// Publish a message to the topic named by its `session_id`.
    async fn publish(&self, message: SignalingMessage) -> Result<()>;

    /// Detach from a session topic. Messages for it are then discarded
    /// at the routing boundary.
    async fn unsubscribe(&self, session_id: &str);

    /// Tear down the channel and all its subscriptions.
    async fn close(&self) -> Result<()>;
}

struct Subscriber {
    endpoint: u64,
    tx: mpsc::Sender<SignalingMessage>,
}

/// Message hub connecting [`InProcessChannel`] endpoints.
///
/// Mirrors the production broker's contract: routes on session id, never
/// echoes to the publishing endpoint, drops messages for unknown topics.
#[derive(Default)]
pub struct InProcessBroker {
    topics: DashMap<String, Vec<Subscriber>>,
    next_endpoint: AtomicU64,
}

impl InProcessBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a new endpoint attached to this broker.
    pub fn endpoint(self: &Arc<Self>) -> InProcessChannel {
        InProcessChannel {
            broker: Arc::clone(self),
            endpoint: self.next_endpoint.fetch_add(1, Ordering::Relaxed),
            closed: AtomicBool::new(false),
        }
    }

    fn deliver(&self, from: u64, message: SignalingMessage) {
        let Some(mut subscribers) = self.topics.get_mut(&message.session_id) else {
            debug!(
                session_id = %message.session_id,
                kind = %message.kind,
                "dropping message for unknown session topic"
            );
            return;
        };
        subscribers.retain(|sub| {
            if sub.endpoint == from {
                return true;
            }
            match sub.tx.try_send(message.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        session_id = %message.session_id,
                        "subscriber buffer full, dropping signaling message"
                    );
                    true
                }
                // Receiver gone: the endpoint went away without unsubscribing.
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    fn detach(&self, session_id: &str, endpoint: u64) {
        if let Some(mut subscribers) = self.topics.get_mut(session_id) {
            subscribers.retain(|sub| sub.endpoint != endpoint);
        }
        self.topics
            .remove_if(session_id, |_, subscribers| subscribers.is_empty());
    }

    fn detach_all(&self, endpoint: u64) {
        for mut entry in self.topics.iter_mut() {
            entry.value_mut().retain(|sub| sub.endpoint != endpoint);
        }
        self.topics.retain(|_, subscribers| !subscribers.is_empty());
    }
}

/// One endpoint of an [`InProcessBroker`].
pub struct InProcessChannel {
    broker: Arc<InProcessBroker>,
    endpoint: u64,
    closed: AtomicBool,
}

#[async_trait]
impl SignalingChannel for InProcessChannel {
    async fn subscribe(&self, session_id: &str) -> Result<mpsc::Receiver<SignalingMessage>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.broker
            .topics
            .entry(session_id.to_string())
            .or_default()
            .push(Subscriber {
                endpoint: self.endpoint,
                tx,
            });
        Ok(rx)
    }

    async fn publish(&self, message: SignalingMessage) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            debug!(
                session_id = %message.session_id,
                "publish on closed channel ignored"
            );
            return Ok(());
        }
        self.broker.deliver(self.endpoint, message);
        Ok(())
    }

    async fn unsubscribe(&self, session_id: &str) {
        self.broker.detach(session_id, self.endpoint);
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.broker.detach_all(self.endpoint);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip_between_endpoints() {
        let broker = InProcessBroker::new();
        let viewer = broker.endpoint();
        let analyzer = broker.endpoint();

        let mut inbox = viewer.subscribe("s1").await.unwrap();
        analyzer
            .publish(SignalingMessage::bye("s1", 1))
            .await
            .unwrap();

        let msg = inbox.recv().await.unwrap();
        assert_eq!(msg.session_id, "s1");
    }

    #[tokio::test]
    async fn test_no_echo_to_publisher() {
        let broker = InProcessBroker::new();
        let viewer = broker.endpoint();
        let analyzer = broker.endpoint();

        let mut viewer_inbox = viewer.subscribe("s1").await.unwrap();
        let mut analyzer_inbox = analyzer.subscribe("s1").await.unwrap();

        viewer
            .publish(SignalingMessage::bye("s1", 1))
            .await
            .unwrap();

        assert_eq!(analyzer_inbox.recv().await.unwrap().sequence, 1);
        assert!(viewer_inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_topic_dropped() {
        let broker = InProcessBroker::new();
        let endpoint = broker.endpoint();
        // No subscribers anywhere: must not error.
        endpoint
            .publish(SignalingMessage::bye("nobody-home", 1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let broker = InProcessBroker::new();
        let viewer = broker.endpoint();
        let analyzer = broker.endpoint();

        let mut inbox = viewer.subscribe("s1").await.unwrap();
        viewer.unsubscribe("s1").await;

        analyzer
            .publish(SignalingMessage::bye("s1", 1))
            .await
            .unwrap();
        assert!(inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_detaches_everything() {
        let broker = InProcessBroker::new();
        let viewer = broker.endpoint();
        let analyzer = broker.endpoint();

        let mut s1 = viewer.subscribe("s1").await.unwrap();
        let mut s2 = viewer.subscribe("s2").await.unwrap();
        viewer.close().await.unwrap();

        analyzer
            .publish(SignalingMessage::bye("s1", 1))
            .await
            .unwrap();
        analyzer
            .publish(SignalingMessage::bye("s2", 2))
            .await
            .unwrap();
        assert!(s1.try_recv().is_err());
        assert!(s2.try_recv().is_err());
    }
}
