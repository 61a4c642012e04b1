//! Broker wire protocol for session negotiation
//!
//! Every message crossing the broker is one JSON `SignalingMessage`. The
//! broker routes on `sessionId` and never inspects payloads, so payload
//! validation happens here at the receiving boundary: a message either
//! maps to a typed [`SessionSignal`] or is rejected as malformed.

use serde::{Deserialize, Serialize};

use scopelink_core::{Error, Result};

/// Discriminator for the four message kinds in the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    Bye,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Offer => write!(f, "offer"),
            SignalKind::Answer => write!(f, "answer"),
            SignalKind::Candidate => write!(f, "candidate"),
            SignalKind::Bye => write!(f, "bye"),
        }
    }
}

/// Envelope for every broker-routed message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    /// Correlates all messages of one negotiation attempt.
    pub session_id: String,
    pub kind: SignalKind,
    /// Kind-specific body, validated by [`validate`](Self::validate).
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Per-sender monotonic counter, for ordering diagnostics.
    pub sequence: u64,
}

/// Session description body for offers and answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdpPayload {
    /// "offer" or "answer".
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub sdp: String,
}

/// Transport candidate body, shaped like `RTCIceCandidateInit` so browser
/// peers can forward theirs unmodified.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// A validated inbound message, ready for the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionSignal {
    Offer(SdpPayload),
    Answer(SdpPayload),
    Candidate(CandidatePayload),
    Bye,
}

impl SessionSignal {
    pub fn kind(&self) -> SignalKind {
        match self {
            SessionSignal::Offer(_) => SignalKind::Offer,
            SessionSignal::Answer(_) => SignalKind::Answer,
            SessionSignal::Candidate(_) => SignalKind::Candidate,
            SessionSignal::Bye => SignalKind::Bye,
        }
    }
}

impl SignalingMessage {
    /// Build an offer message.
    pub fn offer(session_id: &str, sequence: u64, sdp: String) -> Self {
        Self::with_sdp(session_id, sequence, SignalKind::Offer, "offer", sdp)
    }

    /// Build an answer message.
    pub fn answer(session_id: &str, sequence: u64, sdp: String) -> Self {
        Self::with_sdp(session_id, sequence, SignalKind::Answer, "answer", sdp)
    }

    fn with_sdp(
        session_id: &str,
        sequence: u64,
        kind: SignalKind,
        sdp_type: &str,
        sdp: String,
    ) -> Self {
        let payload = serde_json::json!({ "type": sdp_type, "sdp": sdp });
        Self {
            session_id: session_id.to_string(),
            kind,
            payload,
            sequence,
        }
    }

    /// Build a candidate message.
    pub fn candidate(session_id: &str, sequence: u64, candidate: &CandidatePayload) -> Self {
        // CandidatePayload always serializes; fields are plain strings/ints.
        let payload =
            serde_json::to_value(candidate).unwrap_or(serde_json::Value::Null);
        Self {
            session_id: session_id.to_string(),
            kind: SignalKind::Candidate,
            payload,
            sequence,
        }
    }

    /// Build a bye message.
    pub fn bye(session_id: &str, sequence: u64) -> Self {
        Self {
            session_id: session_id.to_string(),
            kind: SignalKind::Bye,
            payload: serde_json::json!({}),
            sequence,
        }
    }

    /// Parse an envelope off the wire.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Error::MalformedMessage(format!("signaling envelope: {e}")))
    }

    /// Serialize for the wire.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::MalformedMessage(format!("signaling envelope encode: {e}")))
    }

    /// Validate the payload against the declared kind.
    ///
    /// This is the only place wire payloads are interpreted; past here the
    /// state machine works with typed signals only.
    pub fn validate(&self) -> Result<SessionSignal> {
        match self.kind {
            SignalKind::Offer | SignalKind::Answer => {
                let sdp: SdpPayload = serde_json::from_value(self.payload.clone())
                    .map_err(|e| {
                        Error::MalformedMessage(format!("{} payload: {e}", self.kind))
                    })?;
                let expected = self.kind.to_string();
                if sdp.sdp_type != expected {
                    return Err(Error::MalformedMessage(format!(
                        "{} payload declares type {:?}",
                        self.kind, sdp.sdp_type
                    )));
                }
                if sdp.sdp.trim().is_empty() {
                    return Err(Error::MalformedMessage(format!(
                        "{} payload has empty sdp",
                        self.kind
                    )));
                }
                Ok(match self.kind {
                    SignalKind::Offer => SessionSignal::Offer(sdp),
                    _ => SessionSignal::Answer(sdp),
                })
            }
            SignalKind::Candidate => {
                let candidate: CandidatePayload =
                    serde_json::from_value(self.payload.clone()).map_err(|e| {
                        Error::MalformedMessage(format!("candidate payload: {e}"))
                    })?;
                if candidate.candidate.trim().is_empty() {
                    return Err(Error::MalformedMessage(
                        "candidate payload has empty candidate".to_string(),
                    ));
                }
                Ok(SessionSignal::Candidate(candidate))
            }
            SignalKind::Bye => Ok(SessionSignal::Bye),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_names() {
        let msg = SignalingMessage::offer("session-1", 3, "v=0\r\n".to_string());
        let json = msg.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["sessionId"], "session-1");
        assert_eq!(value["kind"], "offer");
        assert_eq!(value["sequence"], 3);
        assert_eq!(value["payload"]["type"], "offer");
    }

    #[test]
    fn test_parse_and_validate_answer() {
        let json = r#"{
            "sessionId": "s",
            "kind": "answer",
            "payload": {"type": "answer", "sdp": "v=0\r\nm=video"},
            "sequence": 1
        }"#;
        let msg = SignalingMessage::from_json(json).unwrap();
        match msg.validate().unwrap() {
            SessionSignal::Answer(sdp) => assert_eq!(sdp.sdp, "v=0\r\nm=video"),
            other => panic!("expected answer, got {other:?}"),
        }
    }

    #[test]
    fn test_candidate_optional_fields_default() {
        let json = r#"{
            "sessionId": "s",
            "kind": "candidate",
            "payload": {"candidate": "candidate:1 1 udp 2130706431 192.0.2.1 54400 typ host"},
            "sequence": 4
        }"#;
        let msg = SignalingMessage::from_json(json).unwrap();
        match msg.validate().unwrap() {
            SessionSignal::Candidate(c) => {
                assert!(c.sdp_mid.is_none());
                assert!(c.sdp_m_line_index.is_none());
                assert!(c.username_fragment.is_none());
            }
            other => panic!("expected candidate, got {other:?}"),
        }
    }

    #[test]
    fn test_candidate_camel_case_fields() {
        let candidate = CandidatePayload {
            candidate: "candidate:1".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            username_fragment: Some("abcd".to_string()),
        };
        let msg = SignalingMessage::candidate("s", 1, &candidate);
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["payload"]["sdpMid"], "0");
        assert_eq!(value["payload"]["sdpMLineIndex"], 0);
        assert_eq!(value["payload"]["usernameFragment"], "abcd");
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let json = r#"{"sessionId": "s", "kind": "renegotiate", "payload": {}, "sequence": 1}"#;
        assert!(SignalingMessage::from_json(json).is_err());
    }

    #[test]
    fn test_mismatched_sdp_type_rejected() {
        let json = r#"{
            "sessionId": "s",
            "kind": "answer",
            "payload": {"type": "offer", "sdp": "v=0"},
            "sequence": 2
        }"#;
        let msg = SignalingMessage::from_json(json).unwrap();
        assert!(matches!(msg.validate(), Err(Error::MalformedMessage(_))));
    }

    #[test]
    fn test_empty_sdp_rejected() {
        let json = r#"{
            "sessionId": "s",
            "kind": "offer",
            "payload": {"type": "offer", "sdp": "  "},
            "sequence": 1
        }"#;
        let msg = SignalingMessage::from_json(json).unwrap();
        assert!(msg.validate().is_err());
    }

    #[test]
    fn test_bye_ignores_payload() {
        let json = r#"{"sessionId": "s", "kind": "bye", "payload": {"reason": "done"}, "sequence": 9}"#;
        let msg = SignalingMessage::from_json(json).unwrap();
        assert_eq!(msg.validate().unwrap(), SessionSignal::Bye);
    }

    #[test]
    fn test_missing_payload_defaults_to_null() {
        let json = r#"{"sessionId": "s", "kind": "bye", "sequence": 1}"#;
        let msg = SignalingMessage::from_json(json).unwrap();
        assert_eq!(msg.validate().unwrap(), SessionSignal::Bye);
    }

    #[test]
    fn test_candidates_dedupe_by_content() {
        let a = CandidatePayload {
            candidate: "candidate:1 1 udp 2130706431 192.0.2.1 54400 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        };
        let b = a.clone();
        let mut seen = std::collections::HashSet::new();
        assert!(seen.insert(a));
        assert!(!seen.insert(b));
    }
}
