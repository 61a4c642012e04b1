//! Peer transport seam over the WebRTC engine
//!
//! The negotiator drives a [`PeerTransport`] and never touches the engine
//! directly, so negotiation logic is testable against a mock. The real
//! implementation owns all engine wiring: one receive-only video
//! transceiver, one client-created data channel for detection results,
//! and the callback plumbing that turns engine activity into events and
//! queued media.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_remote::TrackRemote;

use scopelink_core::config::SessionConfig;
use scopelink_core::detection::parse_detection_payload;
use scopelink_core::{BoundedQueue, DetectionResult, EncodedPacket, Error, Result};

use crate::signaling::CandidatePayload;

const EVENT_BUFFER: usize = 64;

/// Transport connection state as surfaced to the negotiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PeerState::New => "new",
            PeerState::Connecting => "connecting",
            PeerState::Connected => "connected",
            PeerState::Disconnected => "disconnected",
            PeerState::Failed => "failed",
            PeerState::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// Events flowing from the peer engine to the negotiator.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local candidate to relay to the remote peer.
    LocalCandidate(CandidatePayload),
    StateChanged(PeerState),
}

/// Destination queues for media flowing out of a peer.
#[derive(Clone)]
pub struct MediaSink {
    pub packets: Arc<BoundedQueue<EncodedPacket>>,
    pub results: Arc<BoundedQueue<DetectionResult>>,
}

/// One peer connection, as the negotiator sees it.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create an offer and install it as the local description.
    async fn create_offer(&self, ice_restart: bool) -> Result<String>;

    /// Apply the remote answer.
    async fn set_remote_answer(&self, sdp: String) -> Result<()>;

    /// Apply a relayed remote candidate.
    async fn add_remote_candidate(&self, candidate: CandidatePayload) -> Result<()>;

    /// Take the event stream. Yields `None` on any call after the first.
    fn take_events(&self) -> Option<mpsc::Receiver<PeerEvent>>;

    async fn close(&self) -> Result<()>;
}

/// Builds peer transports. Swapped for a mock in negotiation tests.
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn build(
        &self,
        ice_servers: Vec<RTCIceServer>,
        sink: MediaSink,
    ) -> Result<Box<dyn PeerTransport>>;
}

/// Production transport over the webrtc engine.
pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    events: parking_lot::Mutex<Option<mpsc::Receiver<PeerEvent>>>,
}

#[async_trait]
impl PeerTransport for WebRtcPeer {
    async fn create_offer(&self, ice_restart: bool) -> Result<String> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self
            .pc
            .create_offer(options)
            .await
            .map_err(|e| Error::PeerConnectionError(format!("create offer: {e}")))?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| Error::PeerConnectionError(format!("set local description: {e}")))?;
        let local = self.pc.local_description().await.ok_or_else(|| {
            Error::PeerConnectionError("no local description after setting offer".to_string())
        })?;
        Ok(local.sdp)
    }

    async fn set_remote_answer(&self, sdp: String) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp)
            .map_err(|e| Error::MalformedMessage(format!("answer sdp: {e}")))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| Error::PeerConnectionError(format!("set remote answer: {e}")))
    }

    async fn add_remote_candidate(&self, candidate: CandidatePayload) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::PeerConnectionError(format!("add candidate: {e}")))
    }

    fn take_events(&self) -> Option<mpsc::Receiver<PeerEvent>> {
        self.events.lock().take()
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| Error::PeerConnectionError(format!("close: {e}")))
    }
}

/// Factory for [`WebRtcPeer`].
pub struct WebRtcPeerFactory {
    session: SessionConfig,
}

impl WebRtcPeerFactory {
    pub fn new(session: SessionConfig) -> Self {
        Self { session }
    }
}

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn build(
        &self,
        ice_servers: Vec<RTCIceServer>,
        sink: MediaSink,
    ) -> Result<Box<dyn PeerTransport>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(engine_err)?;
        let registry =
            register_default_interceptors(Registry::new(), &mut media_engine).map_err(engine_err)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(engine_err)?);

        // Video flows one way: camera peer to us.
        pc.add_transceiver_from_kind(
            RTPCodecType::Video,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await
        .map_err(engine_err)?;

        // We create the channel so it appears in our offer; the analysis
        // peer just attaches to it.
        let dc = pc
            .create_data_channel(
                &self.session.data_channel_label,
                Some(RTCDataChannelInit {
                    ordered: Some(self.session.data_channel_mode.ordered()),
                    max_retransmits: self.session.data_channel_mode.max_retransmits(),
                    ..Default::default()
                }),
            )
            .await
            .map_err(engine_err)?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);

        let candidate_tx = event_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let payload = CandidatePayload {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        };
                        if tx.send(PeerEvent::LocalCandidate(payload)).await.is_err() {
                            debug!("peer event receiver gone, dropping local candidate");
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to serialize local candidate"),
                }
            })
        }));

        let state_tx = event_tx;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = state_tx.clone();
            Box::pin(async move {
                let mapped = map_state(state);
                debug!(state = %mapped, "peer connection state changed");
                let _ = tx.send(PeerEvent::StateChanged(mapped)).await;
            })
        }));

        let packets = Arc::clone(&sink.packets);
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver, _transceiver| {
                let packets = Arc::clone(&packets);
                Box::pin(async move {
                    if track.kind() != RTPCodecType::Video {
                        debug!(kind = %track.kind(), "ignoring non-video track");
                        return;
                    }
                    info!(ssrc = track.ssrc(), "remote video track added");
                    tokio::spawn(read_track(track, packets));
                })
            },
        ));

        let results = Arc::clone(&sink.results);
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let results = Arc::clone(&results);
            Box::pin(async move {
                match parse_detection_payload(&msg.data) {
                    Ok(result) => results.push(result),
                    Err(e) => warn!(error = %e, "discarding malformed detection payload"),
                }
            })
        }));
        dc.on_open(Box::new(|| {
            info!("detection channel open");
            Box::pin(async {})
        }));
        dc.on_close(Box::new(|| {
            debug!("detection channel closed");
            Box::pin(async {})
        }));

        Ok(Box::new(WebRtcPeer {
            pc,
            events: parking_lot::Mutex::new(Some(event_rx)),
        }))
    }
}

async fn read_track(track: Arc<TrackRemote>, packets: Arc<BoundedQueue<EncodedPacket>>) {
    loop {
        let (rtp_packet, _) = match track.read_rtp().await {
            Ok(packet) => packet,
            Err(e) => {
                debug!(error = %e, "rtp read ended");
                break;
            }
        };
        packets.push(EncodedPacket {
            rtp_timestamp: rtp_packet.header.timestamp,
            rtp_sequence: rtp_packet.header.sequence_number,
            marker: rtp_packet.header.marker,
            payload: rtp_packet.payload,
            received_at: Instant::now(),
        });
    }
    info!("video reception task ended");
}

fn engine_err(e: webrtc::Error) -> Error {
    Error::PeerConnectionError(e.to_string())
}

fn map_state(state: RTCPeerConnectionState) -> PeerState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => PeerState::New,
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
    }
}
