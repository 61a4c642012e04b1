//! Session lifecycle management
//!
//! One [`SessionManager`] owns every live session. Each open session runs
//! as its own task: fetch connectivity config, build a peer, run the
//! negotiator, and when the transport dies beyond restart repair, rebuild
//! the peer with a fresh exchange a bounded number of times. Terminal
//! events are emitted here exactly once per session.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use scopelink_core::config::ViewerConfig;
use scopelink_core::{BoundedQueue, DetectionResult, EncodedPacket, Error, Result};

use crate::ice::IceProvider;
use crate::negotiator::{NegotiationOutcome, Negotiator};
use crate::peer::{MediaSink, PeerFactory};
use crate::signaling::SignalingChannel;

/// Encoded packets buffered between the track reader and the decoder.
const PACKET_QUEUE_CAPACITY: usize = 32;

/// Capacity of the session event stream to the embedding application.
const EVENT_BUFFER: usize = 32;

/// Lifecycle notifications for the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected {
        session_id: String,
    },
    /// Recovery in progress. Attempt 0 is the self-recovery grace period;
    /// counts continue across peer rebuilds.
    Reconnecting {
        session_id: String,
        attempt: u32,
    },
    /// Session ended cleanly, by either side.
    Closed {
        session_id: String,
    },
    /// Session is gone and will not come back without a new `open`.
    Failed {
        session_id: String,
        reason: String,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::Connected { session_id }
            | SessionEvent::Reconnecting { session_id, .. }
            | SessionEvent::Closed { session_id }
            | SessionEvent::Failed { session_id, .. } => session_id,
        }
    }
}

/// The per-session queues handed to the rendering pipeline.
#[derive(Clone)]
pub struct SessionMedia {
    pub packets: Arc<BoundedQueue<EncodedPacket>>,
    pub results: Arc<BoundedQueue<DetectionResult>>,
}

struct SessionHandle {
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

/// Owner of all live sessions.
pub struct SessionManager {
    config: ViewerConfig,
    channel: Arc<dyn SignalingChannel>,
    factory: Arc<dyn PeerFactory>,
    ice: Arc<dyn IceProvider>,
    sessions: Arc<DashMap<String, SessionHandle>>,
    events_tx: mpsc::Sender<SessionEvent>,
}

impl SessionManager {
    /// Build a manager and the event stream it reports on.
    pub fn new(
        config: ViewerConfig,
        channel: Arc<dyn SignalingChannel>,
        factory: Arc<dyn PeerFactory>,
        ice: Arc<dyn IceProvider>,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        (
            Self {
                config,
                channel,
                factory,
                ice,
                sessions: Arc::new(DashMap::new()),
                events_tx,
            },
            events_rx,
        )
    }

    /// Open a session and start negotiating.
    ///
    /// At most one session per id may be active; a second `open` for a
    /// live id is refused.
    pub fn open(&self, session_id: &str) -> Result<SessionMedia> {
        let sink = MediaSink {
            packets: Arc::new(BoundedQueue::new(PACKET_QUEUE_CAPACITY)),
            results: Arc::new(BoundedQueue::new(
                self.config.sync.result_buffer_capacity,
            )),
        };
        let media = SessionMedia {
            packets: Arc::clone(&sink.packets),
            results: Arc::clone(&sink.results),
        };
        // The runner keeps this first receiver so a close that lands
        // before the task is scheduled is still observed.
        let (shutdown, shutdown_rx) = broadcast::channel(1);

        match self.sessions.entry(session_id.to_string()) {
            Entry::Occupied(_) => {
                return Err(Error::SessionError(format!(
                    "session {session_id} is already active"
                )))
            }
            Entry::Vacant(entry) => {
                let runner = SessionRunner {
                    session_id: session_id.to_string(),
                    config: self.config.clone(),
                    channel: Arc::clone(&self.channel),
                    factory: Arc::clone(&self.factory),
                    ice: Arc::clone(&self.ice),
                    sink,
                    events: self.events_tx.clone(),
                    shutdown: shutdown.clone(),
                    shutdown_rx,
                    sessions: Arc::clone(&self.sessions),
                };
                let task = tokio::spawn(runner.run());
                entry.insert(SessionHandle { shutdown, task });
            }
        }

        info!(session_id, "session opened");
        Ok(media)
    }

    /// Close a session, sending a bye and waiting for its task to finish.
    /// Closing an unknown or already-finished session is a no-op.
    pub async fn close(&self, session_id: &str) {
        if let Some((_, handle)) = self.sessions.remove(session_id) {
            let _ = handle.shutdown.send(());
            let _ = handle.task.await;
        }
    }

    /// Close every live session.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.close(&id).await;
        }
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }
}

/// State for one session task.
struct SessionRunner {
    session_id: String,
    config: ViewerConfig,
    channel: Arc<dyn SignalingChannel>,
    factory: Arc<dyn PeerFactory>,
    ice: Arc<dyn IceProvider>,
    sink: MediaSink,
    events: mpsc::Sender<SessionEvent>,
    shutdown: broadcast::Sender<()>,
    shutdown_rx: broadcast::Receiver<()>,
    sessions: Arc<DashMap<String, SessionHandle>>,
}

impl SessionRunner {
    async fn run(mut self) {
        let mut rebuilds = 0u32;

        let terminal = loop {
            // Shutdown can arrive before the negotiator exists; every
            // pre-negotiation phase races against it.
            let servers = tokio::select! {
                _ = self.shutdown_rx.recv() => break self.closed(),
                result = self.ice.servers() => match result {
                    Ok(servers) => servers,
                    Err(e) => break self.failed(e.to_string()),
                },
            };

            let inbox = tokio::select! {
                _ = self.shutdown_rx.recv() => break self.closed(),
                result = self.channel.subscribe(&self.session_id) => match result {
                    Ok(inbox) => inbox,
                    Err(e) => break self.failed(format!("subscribing: {e}")),
                },
            };

            let peer = tokio::select! {
                _ = self.shutdown_rx.recv() => break self.closed(),
                result = self.factory.build(servers, self.sink.clone()) => match result {
                    Ok(peer) => peer,
                    Err(e) => break self.failed(format!("building peer: {e}")),
                },
            };

            // Subscribe the negotiator first, then drain our own
            // receiver: a close sent before this line is buffered
            // there, one sent after is seen by the new subscription.
            let negotiator_shutdown = self.shutdown.subscribe();
            if self.shutdown_rx.try_recv().is_ok() {
                let _ = peer.close().await;
                break self.closed();
            }

            let negotiator = match Negotiator::new(
                self.session_id.clone(),
                self.config.session.clone(),
                peer,
                inbox,
                Arc::clone(&self.channel),
                self.events.clone(),
                negotiator_shutdown,
            ) {
                Ok(negotiator) => negotiator,
                Err(e) => break self.failed(e.to_string()),
            };

            match negotiator.run().await {
                NegotiationOutcome::Closed => break self.closed(),
                NegotiationOutcome::Rejected(reason) | NegotiationOutcome::Failed(reason) => {
                    break self.failed(reason)
                }
                NegotiationOutcome::NeedsRebuild(reason) => {
                    rebuilds += 1;
                    if rebuilds > self.config.session.rebuild_limit {
                        break self.failed(format!(
                            "transport unrecoverable after {} rebuilds: {reason}",
                            rebuilds - 1
                        ));
                    }
                    warn!(
                        session_id = %self.session_id,
                        attempt = rebuilds,
                        limit = self.config.session.rebuild_limit,
                        %reason,
                        "rebuilding peer with a fresh exchange"
                    );
                    let _ = self
                        .events
                        .send(SessionEvent::Reconnecting {
                            session_id: self.session_id.clone(),
                            attempt: self.config.session.ice_restart_limit + rebuilds,
                        })
                        .await;
                }
            }
        };

        let _ = self.events.send(terminal).await;
        self.channel.unsubscribe(&self.session_id).await;
        self.sink.packets.close();
        self.sink.results.close();
        self.sessions.remove(&self.session_id);
        info!(session_id = %self.session_id, "session task finished");
    }

    fn closed(&self) -> SessionEvent {
        SessionEvent::Closed {
            session_id: self.session_id.clone(),
        }
    }

    fn failed(&self, reason: String) -> SessionEvent {
        SessionEvent::Failed {
            session_id: self.session_id.clone(),
            reason,
        }
    }
}
