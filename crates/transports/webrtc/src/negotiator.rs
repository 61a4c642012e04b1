//! Session negotiation state machine
//!
//! Drives one peer connection from first offer to a terminal state,
//! handling the broker exchange, candidate relay in both directions, and
//! connectivity recovery. All waiting happens in one select loop so every
//! transition is driven by a message, a peer event, or a deadline.
//!
//! ```text
//! Idle -> OfferSent -> AnswerReceived -> CandidateExchange -> Connected
//!                \________ timeout ________/                     |
//!                            v                         disconnect v
//!                          Failed <- restarts exhausted <- Reconnecting
//! ```
//!
//! Recovery runs in two stages: a grace period for the transport to heal
//! itself, then a bounded number of connectivity-restart offers on the
//! live peer. When both are exhausted the machine hands control back with
//! [`NegotiationOutcome::NeedsRebuild`] and the session layer decides
//! whether to rebuild the peer from scratch.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use scopelink_core::config::SessionConfig;
use scopelink_core::{Error, Result};

use crate::peer::{PeerEvent, PeerState, PeerTransport};
use crate::session::SessionEvent;
use crate::signaling::{
    CandidatePayload, SdpPayload, SessionSignal, SignalingChannel, SignalingMessage,
};

/// Observable phase of one negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    OfferSent,
    AnswerReceived,
    CandidateExchange,
    Connected,
    Reconnecting,
    Closed,
    Failed,
}

impl std::fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::OfferSent => "offer-sent",
            NegotiationState::AnswerReceived => "answer-received",
            NegotiationState::CandidateExchange => "candidate-exchange",
            NegotiationState::Connected => "connected",
            NegotiationState::Reconnecting => "reconnecting",
            NegotiationState::Closed => "closed",
            NegotiationState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// How a negotiation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationOutcome {
    /// Clean end: remote bye after establishment, or local shutdown.
    Closed,
    /// Remote ended the exchange before the session was established.
    Rejected(String),
    /// Transport lost beyond what restarts can fix; a rebuilt peer with a
    /// fresh offer cycle may still succeed.
    NeedsRebuild(String),
    /// Terminal failure.
    Failed(String),
}

/// One negotiation attempt over one peer transport.
pub struct Negotiator {
    session_id: String,
    config: SessionConfig,
    peer: Box<dyn PeerTransport>,
    peer_events: mpsc::Receiver<PeerEvent>,
    channel: Arc<dyn SignalingChannel>,
    inbox: mpsc::Receiver<SignalingMessage>,
    events: mpsc::Sender<SessionEvent>,
    shutdown: broadcast::Receiver<()>,

    state: NegotiationState,
    created_at: Instant,
    local_description: Option<String>,
    remote_description: Option<String>,
    seq: u64,
    restart_attempt: u32,
    connected_once: bool,
    awaiting_answer: bool,
    answer_applied: bool,
    pending: Vec<CandidatePayload>,
    seen: HashSet<CandidatePayload>,
    answer_deadline: Option<Instant>,
    connect_deadline: Option<Instant>,
    recovery_deadline: Option<Instant>,
}

impl Negotiator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: String,
        config: SessionConfig,
        peer: Box<dyn PeerTransport>,
        inbox: mpsc::Receiver<SignalingMessage>,
        channel: Arc<dyn SignalingChannel>,
        events: mpsc::Sender<SessionEvent>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<Self> {
        let peer_events = peer
            .take_events()
            .ok_or_else(|| Error::SessionError("peer event stream already taken".to_string()))?;
        Ok(Self {
            session_id,
            config,
            peer,
            peer_events,
            channel,
            inbox,
            events,
            shutdown,
            state: NegotiationState::Idle,
            created_at: Instant::now(),
            local_description: None,
            remote_description: None,
            seq: 0,
            restart_attempt: 0,
            connected_once: false,
            awaiting_answer: false,
            answer_applied: false,
            pending: Vec::new(),
            seen: HashSet::new(),
            answer_deadline: None,
            connect_deadline: None,
            recovery_deadline: None,
        })
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Local description from the most recent offer, once one was sent.
    pub fn local_description(&self) -> Option<&str> {
        self.local_description.as_deref()
    }

    /// Remote description from the applied answer.
    pub fn remote_description(&self) -> Option<&str> {
        self.remote_description.as_deref()
    }

    /// Drive the machine to a terminal state.
    pub async fn run(mut self) -> NegotiationOutcome {
        let outcome = self.drive().await;
        info!(
            session_id = %self.session_id,
            state = %self.state,
            elapsed_ms = self.created_at.elapsed().as_millis() as u64,
            "negotiation finished"
        );
        outcome
    }

    async fn drive(&mut self) -> NegotiationOutcome {
        match self.peer.create_offer(false).await {
            Ok(sdp) => {
                self.local_description = Some(sdp.clone());
                let seq = self.next_seq();
                let offer = SignalingMessage::offer(&self.session_id, seq, sdp);
                if let Err(e) = self.channel.publish(offer).await {
                    return self.fail(format!("publishing offer: {e}")).await;
                }
                self.set_state(NegotiationState::OfferSent);
                self.awaiting_answer = true;
                self.answer_deadline = Some(self.deadline(self.config.answer_timeout_secs));
            }
            Err(e) => return self.fail(format!("creating offer: {e}")).await,
        }

        loop {
            if let Some(outcome) = self.step().await {
                return outcome;
            }
        }
    }

    async fn step(&mut self) -> Option<NegotiationOutcome> {
        let answer_deadline = self.answer_deadline;
        let connect_deadline = self.connect_deadline;
        let recovery_deadline = self.recovery_deadline;

        tokio::select! {
            message = self.inbox.recv() => match message {
                Some(m) => self.handle_signal(m).await,
                None => Some(self.signaling_lost("session inbox closed").await),
            },
            event = self.peer_events.recv() => match event {
                Some(e) => self.handle_peer_event(e).await,
                None => Some(self.fail("peer event stream ended".to_string()).await),
            },
            _ = sleep_until_opt(answer_deadline), if answer_deadline.is_some() => {
                self.on_answer_timeout().await
            }
            _ = sleep_until_opt(connect_deadline), if connect_deadline.is_some() => {
                self.on_connect_timeout().await
            }
            _ = sleep_until_opt(recovery_deadline), if recovery_deadline.is_some() => {
                self.begin_restart().await
            }
            _ = self.shutdown.recv() => Some(self.handle_shutdown().await),
        }
    }

    async fn handle_signal(&mut self, message: SignalingMessage) -> Option<NegotiationOutcome> {
        if message.session_id != self.session_id {
            warn!(
                session_id = %self.session_id,
                got = %message.session_id,
                "message for another session on this inbox, discarding"
            );
            return None;
        }
        let signal = match message.validate() {
            Ok(signal) => signal,
            Err(e) => {
                warn!(
                    session_id = %self.session_id,
                    error = %e,
                    "discarding invalid signaling payload"
                );
                return None;
            }
        };
        match signal {
            SessionSignal::Answer(sdp) => self.handle_answer(sdp).await,
            SessionSignal::Candidate(candidate) => {
                self.handle_candidate(candidate).await;
                None
            }
            SessionSignal::Bye => Some(self.handle_bye().await),
            SessionSignal::Offer(_) => {
                debug!(
                    session_id = %self.session_id,
                    "discarding unexpected offer, this end initiates"
                );
                None
            }
        }
    }

    async fn handle_answer(&mut self, sdp: SdpPayload) -> Option<NegotiationOutcome> {
        if !self.awaiting_answer {
            debug!(
                session_id = %self.session_id,
                state = %self.state,
                "discarding answer outside the offer window"
            );
            return None;
        }
        let sdp = sdp.sdp;
        match self.peer.set_remote_answer(sdp.clone()).await {
            Ok(()) => {
                self.remote_description = Some(sdp);
                self.awaiting_answer = false;
                self.answer_applied = true;
                self.answer_deadline = None;
                if self.restart_attempt == 0 {
                    self.set_state(NegotiationState::AnswerReceived);
                }
                self.flush_pending().await;
                if self.restart_attempt == 0 {
                    self.set_state(NegotiationState::CandidateExchange);
                }
                self.connect_deadline = Some(self.deadline(self.config.connect_timeout_secs));
                None
            }
            // A broken answer is discarded like any malformed message; the
            // deadline keeps running in case a valid one follows.
            Err(Error::MalformedMessage(e)) => {
                warn!(session_id = %self.session_id, error = %e, "discarding unusable answer");
                None
            }
            Err(e) => Some(self.fail(format!("applying answer: {e}")).await),
        }
    }

    async fn handle_candidate(&mut self, candidate: CandidatePayload) {
        if !self.seen.insert(candidate.clone()) {
            debug!(session_id = %self.session_id, "duplicate candidate discarded");
            return;
        }
        if self.answer_applied {
            if let Err(e) = self.peer.add_remote_candidate(candidate).await {
                warn!(session_id = %self.session_id, error = %e, "failed to apply remote candidate");
            }
        } else {
            // Candidates may legally arrive before the answer; hold them
            // until a remote description exists to attach them to.
            self.pending.push(candidate);
        }
    }

    async fn flush_pending(&mut self) {
        for candidate in std::mem::take(&mut self.pending) {
            if let Err(e) = self.peer.add_remote_candidate(candidate).await {
                warn!(session_id = %self.session_id, error = %e, "failed to apply buffered candidate");
            }
        }
    }

    async fn handle_bye(&mut self) -> NegotiationOutcome {
        let _ = self.peer.close().await;
        if self.connected_once {
            info!(session_id = %self.session_id, "remote peer ended the session");
            self.set_state(NegotiationState::Closed);
            NegotiationOutcome::Closed
        } else {
            self.set_state(NegotiationState::Failed);
            NegotiationOutcome::Rejected(
                "remote peer ended the exchange before the session was established".to_string(),
            )
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) -> Option<NegotiationOutcome> {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let seq = self.next_seq();
                let msg = SignalingMessage::candidate(&self.session_id, seq, &candidate);
                if let Err(e) = self.channel.publish(msg).await {
                    if self.connected_once {
                        warn!(session_id = %self.session_id, error = %e, "failed to relay local candidate");
                        None
                    } else {
                        Some(self.fail(format!("relaying candidate: {e}")).await)
                    }
                } else {
                    None
                }
            }
            PeerEvent::StateChanged(state) => self.handle_peer_state(state).await,
        }
    }

    async fn handle_peer_state(&mut self, state: PeerState) -> Option<NegotiationOutcome> {
        match state {
            PeerState::Connected => {
                let first = !self.connected_once;
                self.connected_once = true;
                self.restart_attempt = 0;
                self.awaiting_answer = false;
                self.answer_deadline = None;
                self.connect_deadline = None;
                self.recovery_deadline = None;
                self.set_state(NegotiationState::Connected);
                if first {
                    info!(session_id = %self.session_id, "session established");
                } else {
                    info!(session_id = %self.session_id, "session recovered");
                }
                self.emit(SessionEvent::Connected {
                    session_id: self.session_id.clone(),
                })
                .await;
                None
            }
            PeerState::Disconnected => {
                if self.state == NegotiationState::Connected {
                    info!(
                        session_id = %self.session_id,
                        grace_secs = self.config.ice_recovery_wait_secs,
                        "transport disconnected, waiting for self-recovery"
                    );
                    self.set_state(NegotiationState::Reconnecting);
                    // attempt 0 marks the self-recovery grace period.
                    self.emit(SessionEvent::Reconnecting {
                        session_id: self.session_id.clone(),
                        attempt: 0,
                    })
                    .await;
                    self.recovery_deadline =
                        Some(self.deadline(self.config.ice_recovery_wait_secs));
                }
                None
            }
            PeerState::Failed => {
                if self.connected_once {
                    // The engine gave up; skip the grace period.
                    self.begin_restart().await
                } else {
                    Some(
                        self.fail("transport failed during negotiation".to_string())
                            .await,
                    )
                }
            }
            // Close events follow our own teardown; outcomes are decided
            // before they arrive.
            PeerState::Closed | PeerState::New | PeerState::Connecting => None,
        }
    }

    async fn on_answer_timeout(&mut self) -> Option<NegotiationOutcome> {
        self.awaiting_answer = false;
        self.answer_deadline = None;
        if self.restart_attempt == 0 {
            Some(
                self.fail(format!(
                    "no answer within {}s",
                    self.config.answer_timeout_secs
                ))
                .await,
            )
        } else {
            warn!(
                session_id = %self.session_id,
                attempt = self.restart_attempt,
                "restart offer got no answer"
            );
            self.begin_restart().await
        }
    }

    async fn on_connect_timeout(&mut self) -> Option<NegotiationOutcome> {
        self.connect_deadline = None;
        if self.restart_attempt == 0 && !self.connected_once {
            Some(
                self.fail(format!(
                    "candidate exchange did not produce a connection within {}s",
                    self.config.connect_timeout_secs
                ))
                .await,
            )
        } else {
            self.begin_restart().await
        }
    }

    /// Issue the next connectivity-restart offer, or give up once the
    /// configured limit is reached.
    async fn begin_restart(&mut self) -> Option<NegotiationOutcome> {
        self.recovery_deadline = None;
        self.connect_deadline = None;
        if self.restart_attempt >= self.config.ice_restart_limit {
            return Some(
                self.give_up_rebuild("connectivity restarts exhausted".to_string())
                    .await,
            );
        }
        self.restart_attempt += 1;
        self.set_state(NegotiationState::Reconnecting);
        info!(
            session_id = %self.session_id,
            attempt = self.restart_attempt,
            limit = self.config.ice_restart_limit,
            "attempting connectivity restart"
        );
        self.emit(SessionEvent::Reconnecting {
            session_id: self.session_id.clone(),
            attempt: self.restart_attempt,
        })
        .await;

        match self.peer.create_offer(true).await {
            Ok(sdp) => {
                self.local_description = Some(sdp.clone());
                self.answer_applied = false;
                self.awaiting_answer = true;
                let seq = self.next_seq();
                let offer = SignalingMessage::offer(&self.session_id, seq, sdp);
                if let Err(e) = self.channel.publish(offer).await {
                    return Some(
                        self.give_up_rebuild(format!("signaling during restart: {e}"))
                            .await,
                    );
                }
                self.answer_deadline = Some(self.deadline(self.config.answer_timeout_secs));
                None
            }
            Err(e) => Some(self.give_up_rebuild(format!("restart offer: {e}")).await),
        }
    }

    async fn signaling_lost(&mut self, what: &str) -> NegotiationOutcome {
        if self.connected_once {
            self.give_up_rebuild(what.to_string()).await
        } else {
            self.fail(what.to_string()).await
        }
    }

    async fn give_up_rebuild(&mut self, reason: String) -> NegotiationOutcome {
        warn!(session_id = %self.session_id, %reason, "transport beyond local recovery");
        let _ = self.peer.close().await;
        NegotiationOutcome::NeedsRebuild(reason)
    }

    async fn fail(&mut self, reason: String) -> NegotiationOutcome {
        error!(session_id = %self.session_id, %reason, "negotiation failed");
        let seq = self.next_seq();
        let _ = self
            .channel
            .publish(SignalingMessage::bye(&self.session_id, seq))
            .await;
        let _ = self.peer.close().await;
        self.set_state(NegotiationState::Failed);
        NegotiationOutcome::Failed(reason)
    }

    async fn handle_shutdown(&mut self) -> NegotiationOutcome {
        info!(session_id = %self.session_id, "shutting down session");
        let seq = self.next_seq();
        let _ = self
            .channel
            .publish(SignalingMessage::bye(&self.session_id, seq))
            .await;
        let _ = self.peer.close().await;
        self.set_state(NegotiationState::Closed);
        NegotiationOutcome::Closed
    }

    async fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event).await;
    }

    fn set_state(&mut self, next: NegotiationState) {
        if self.state != next {
            debug!(
                session_id = %self.session_id,
                from = %self.state,
                to = %next,
                "negotiation state change"
            );
            self.state = next;
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn deadline(&self, secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::InProcessBroker;
    use async_trait::async_trait;

    /// Peer stub that accepts everything and records nothing.
    struct NullPeer {
        events: parking_lot::Mutex<Option<mpsc::Receiver<PeerEvent>>>,
        applied: std::sync::atomic::AtomicUsize,
    }

    impl NullPeer {
        fn new() -> Self {
            let (_tx, rx) = mpsc::channel(1);
            Self {
                events: parking_lot::Mutex::new(Some(rx)),
                applied: std::sync::atomic::AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PeerTransport for NullPeer {
        async fn create_offer(&self, _ice_restart: bool) -> Result<String> {
            Ok("v=0\r\nm=video".to_string())
        }
        async fn set_remote_answer(&self, _sdp: String) -> Result<()> {
            Ok(())
        }
        async fn add_remote_candidate(&self, _candidate: CandidatePayload) -> Result<()> {
            self.applied
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Ok(())
        }
        fn take_events(&self) -> Option<mpsc::Receiver<PeerEvent>> {
            self.events.lock().take()
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn make_negotiator() -> Negotiator {
        let broker = InProcessBroker::new();
        let channel: Arc<dyn SignalingChannel> = Arc::new(broker.endpoint());
        let (_inbox_tx, inbox) = mpsc::channel(8);
        let (events, _events_rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown) = {
            let (tx, rx) = broadcast::channel(1);
            (tx, rx)
        };
        Negotiator::new(
            "s1".to_string(),
            SessionConfig::default(),
            Box::new(NullPeer::new()),
            inbox,
            channel,
            events,
            shutdown,
        )
        .unwrap()
    }

    fn candidate(n: u32) -> CandidatePayload {
        CandidatePayload {
            candidate: format!("candidate:{n} 1 udp 1 192.0.2.1 5000 typ host"),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        }
    }

    #[tokio::test]
    async fn test_candidates_buffered_until_answer() {
        let mut negotiator = make_negotiator();
        negotiator.handle_candidate(candidate(1)).await;
        negotiator.handle_candidate(candidate(2)).await;
        assert_eq!(negotiator.pending.len(), 2);

        negotiator.awaiting_answer = true;
        let sdp = SdpPayload {
            sdp_type: "answer".to_string(),
            sdp: "v=0".to_string(),
        };
        assert!(negotiator.handle_answer(sdp).await.is_none());
        assert!(negotiator.pending.is_empty());
        assert_eq!(negotiator.state(), NegotiationState::CandidateExchange);
    }

    #[tokio::test]
    async fn test_duplicate_candidates_discarded() {
        let mut negotiator = make_negotiator();
        negotiator.handle_candidate(candidate(1)).await;
        negotiator.handle_candidate(candidate(1)).await;
        negotiator.handle_candidate(candidate(2)).await;
        assert_eq!(negotiator.pending.len(), 2);
    }

    #[tokio::test]
    async fn test_answer_outside_window_discarded() {
        let mut negotiator = make_negotiator();
        let sdp = SdpPayload {
            sdp_type: "answer".to_string(),
            sdp: "v=0".to_string(),
        };
        assert!(negotiator.handle_answer(sdp).await.is_none());
        assert!(!negotiator.answer_applied);
        assert_eq!(negotiator.state(), NegotiationState::Idle);
    }

    #[tokio::test]
    async fn test_bye_before_connect_rejects() {
        let mut negotiator = make_negotiator();
        let outcome = negotiator.handle_bye().await;
        assert!(matches!(outcome, NegotiationOutcome::Rejected(_)));
        assert_eq!(negotiator.state(), NegotiationState::Failed);
    }

    #[tokio::test]
    async fn test_bye_after_connect_closes() {
        let mut negotiator = make_negotiator();
        negotiator.connected_once = true;
        let outcome = negotiator.handle_bye().await;
        assert_eq!(outcome, NegotiationOutcome::Closed);
        assert_eq!(negotiator.state(), NegotiationState::Closed);
    }

    #[tokio::test]
    async fn test_descriptions_recorded_as_applied() {
        let mut negotiator = make_negotiator();
        assert!(negotiator.local_description().is_none());
        assert!(negotiator.remote_description().is_none());

        negotiator.awaiting_answer = true;
        let sdp = SdpPayload {
            sdp_type: "answer".to_string(),
            sdp: "v=0\r\na=recvonly".to_string(),
        };
        assert!(negotiator.handle_answer(sdp).await.is_none());
        assert_eq!(negotiator.remote_description(), Some("v=0\r\na=recvonly"));

        assert!(negotiator.begin_restart().await.is_none());
        assert_eq!(negotiator.local_description(), Some("v=0\r\nm=video"));
    }

    #[tokio::test]
    async fn test_restarts_give_up_at_limit() {
        let mut negotiator = make_negotiator();
        negotiator.connected_once = true;
        negotiator.restart_attempt = negotiator.config.ice_restart_limit;
        let outcome = negotiator.begin_restart().await;
        assert!(matches!(
            outcome,
            Some(NegotiationOutcome::NeedsRebuild(_))
        ));
    }
}
