//! WebSocket transport to the signaling broker
//!
//! One socket carries all sessions. Outbound messages are serialized by a
//! dedicated sender task; the receiver task parses envelopes and routes
//! them to per-session subscribers. Messages for sessions nobody
//! subscribes to are logged and discarded here, before any state machine
//! sees them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use scopelink_core::{Error, Result};

use super::channel::{SignalingChannel, SUBSCRIBER_BUFFER};
use super::messages::SignalingMessage;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type RouteTable = DashMap<String, mpsc::Sender<SignalingMessage>>;

/// Broker connection implementing [`SignalingChannel`] over WebSocket.
pub struct WebSocketSignaling {
    out_tx: mpsc::UnboundedSender<Message>,
    routes: Arc<RouteTable>,
    closed: AtomicBool,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl WebSocketSignaling {
    /// Connect to the broker and start the sender/receiver tasks.
    pub async fn connect(url: &str) -> Result<Self> {
        info!(url, "connecting to signaling broker");

        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::SignalingError(format!("broker connect: {e}")))?;

        info!("connected to signaling broker");

        let (write, read) = ws_stream.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let routes: Arc<RouteTable> = Arc::new(DashMap::new());

        let sender = tokio::spawn(sender_task(write, out_rx));
        let receiver = tokio::spawn(receiver_task(read, Arc::clone(&routes)));

        Ok(Self {
            out_tx,
            routes,
            closed: AtomicBool::new(false),
            tasks: parking_lot::Mutex::new(vec![sender, receiver]),
        })
    }
}

#[async_trait]
impl SignalingChannel for WebSocketSignaling {
    async fn subscribe(&self, session_id: &str) -> Result<mpsc::Receiver<SignalingMessage>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.routes.insert(session_id.to_string(), tx);
        Ok(rx)
    }

    async fn publish(&self, message: SignalingMessage) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::SignalingError(
                "publish on closed broker connection".to_string(),
            ));
        }
        let json = message.to_json()?;
        self.out_tx
            .send(Message::Text(json))
            .map_err(|_| Error::SignalingError("broker connection lost".to_string()))
    }

    async fn unsubscribe(&self, session_id: &str) {
        self.routes.remove(session_id);
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.routes.clear();
        // Polite close; the tasks end once the broker acknowledges or the
        // socket drops.
        let _ = self.out_tx.send(Message::Close(None));
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        Ok(())
    }
}

async fn sender_task(mut write: SplitSink<WsStream, Message>, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(msg) = rx.recv().await {
        let is_close = matches!(msg, Message::Close(_));
        if let Err(e) = write.send(msg).await {
            error!(error = %e, "failed to send signaling message");
            break;
        }
        if is_close {
            break;
        }
    }
    debug!("signaling sender task terminated");
}

async fn receiver_task(mut read: SplitStream<WsStream>, routes: Arc<RouteTable>) {
    while let Some(msg_result) = read.next().await {
        match msg_result {
            Ok(Message::Text(text)) => route_inbound(&text, &routes),
            Ok(Message::Close(_)) => {
                info!("signaling connection closed by broker");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "signaling connection error");
                break;
            }
        }
    }
    // Dropping the senders lets per-session receivers observe the loss.
    routes.clear();
    debug!("signaling receiver task terminated");
}

fn route_inbound(text: &str, routes: &RouteTable) {
    let message = match SignalingMessage::from_json(text) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "discarding malformed signaling message");
            return;
        }
    };

    let session_id = message.session_id.clone();
    let receiver_gone = match routes.get(&session_id) {
        Some(tx) => match tx.try_send(message) {
            Ok(()) => false,
            Err(mpsc::error::TrySendError::Full(m)) => {
                warn!(
                    session_id = %m.session_id,
                    kind = %m.kind,
                    "session inbox full, dropping signaling message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => true,
        },
        None => {
            debug!(
                session_id = %session_id,
                kind = %message.kind,
                "discarding message for unknown or closed session"
            );
            false
        }
    };
    if receiver_gone {
        routes.remove(&session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_inbound_delivers_to_subscriber() {
        let routes = RouteTable::new();
        let (tx, mut rx) = mpsc::channel(4);
        routes.insert("s1".to_string(), tx);

        let text = SignalingMessage::bye("s1", 1).to_json().unwrap();
        route_inbound(&text, &routes);

        assert_eq!(rx.try_recv().unwrap().session_id, "s1");
    }

    #[test]
    fn test_route_inbound_discards_unknown_session() {
        let routes = RouteTable::new();
        let text = SignalingMessage::bye("never-subscribed", 1).to_json().unwrap();
        // Must not panic or grow the table.
        route_inbound(&text, &routes);
        assert!(routes.is_empty());
    }

    #[test]
    fn test_route_inbound_discards_malformed() {
        let routes = RouteTable::new();
        let (tx, mut rx) = mpsc::channel(4);
        routes.insert("s1".to_string(), tx);

        route_inbound("{not json", &routes);
        route_inbound(r#"{"sessionId": "s1"}"#, &routes);

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_route_inbound_prunes_dead_subscriber() {
        let routes = RouteTable::new();
        let (tx, rx) = mpsc::channel(4);
        routes.insert("s1".to_string(), tx);
        drop(rx);

        let text = SignalingMessage::bye("s1", 1).to_json().unwrap();
        route_inbound(&text, &routes);
        assert!(routes.is_empty());
    }
}
