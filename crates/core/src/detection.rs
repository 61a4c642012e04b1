//! Detection results and their wire format.
//!
//! The analysis peer sends one JSON envelope per processed frame over the
//! data channel. Envelopes reference frames by sequence number; coordinates
//! are normalized to the frame so the overlay scales with any resolution.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Normalized axis-aligned box, origin top-left, all fields in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BoundingBox {
    /// Pixel rectangle `(x, y, w, h)` for a frame of the given size.
    pub fn to_pixels(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let px = (self.x * width as f32).round() as u32;
        let py = (self.y * height as f32).round() as u32;
        let pw = (self.w * width as f32).round() as u32;
        let ph = (self.h * height as f32).round() as u32;
        (
            px.min(width.saturating_sub(1)),
            py.min(height.saturating_sub(1)),
            pw.min(width - px.min(width)),
            ph.min(height - py.min(height)),
        )
    }
}

/// A single detected region with its class label and confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub label: String,
    pub confidence: f32,
}

/// One processed-frame result, as consumed by the synchronizer.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
    /// Sequence number of the frame this result was computed from.
    pub sequence: u64,
    /// Capture timestamp echo from the analysis peer, when provided.
    pub timestamp_us: Option<i64>,
    /// May be empty: a frame with nothing detected still produces a
    /// result, which clears any held overlay.
    pub detections: Vec<Detection>,
}

impl DetectionResult {
    pub fn new(sequence: u64, detections: Vec<Detection>) -> Self {
        Self {
            sequence,
            timestamp_us: None,
            detections,
        }
    }
}

/// Wire shape of one detection inside the envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireDetection {
    x: f32,
    y: f32,
    w: f32,
    h: f32,
    label: String,
    confidence: f32,
}

/// Wire envelope carried in each data-channel message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DetectionEnvelope {
    for_sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    for_timestamp_us: Option<i64>,
    detections: Vec<WireDetection>,
}

/// Parse a data-channel payload into a [`DetectionResult`].
///
/// Structurally invalid payloads fail with [`Error::MalformedMessage`].
/// Out-of-range numeric fields are clamped into their valid range and
/// logged once per envelope rather than rejecting the whole result.
pub fn parse_detection_payload(payload: &[u8]) -> Result<DetectionResult> {
    let envelope: DetectionEnvelope = serde_json::from_slice(payload)
        .map_err(|e| Error::MalformedMessage(format!("detection envelope: {e}")))?;

    let mut clamped = 0usize;
    let detections = envelope
        .detections
        .into_iter()
        .map(|wire| sanitize(wire, &mut clamped))
        .collect();

    if clamped > 0 {
        warn!(
            sequence = envelope.for_sequence,
            fields = clamped,
            "clamped out-of-range detection fields"
        );
    }

    Ok(DetectionResult {
        sequence: envelope.for_sequence,
        timestamp_us: envelope.for_timestamp_us,
        detections,
    })
}

/// Serialize a result back into its wire envelope. Used by test harnesses
/// and the loopback tooling to emit what the analysis peer would send.
pub fn encode_detection_payload(result: &DetectionResult) -> Result<Vec<u8>> {
    let envelope = DetectionEnvelope {
        for_sequence: result.sequence,
        for_timestamp_us: result.timestamp_us,
        detections: result
            .detections
            .iter()
            .map(|d| WireDetection {
                x: d.bbox.x,
                y: d.bbox.y,
                w: d.bbox.w,
                h: d.bbox.h,
                label: d.label.clone(),
                confidence: d.confidence,
            })
            .collect(),
    };
    serde_json::to_vec(&envelope)
        .map_err(|e| Error::MalformedMessage(format!("detection envelope encode: {e}")))
}

fn clamp_unit(v: f32, clamped: &mut usize) -> f32 {
    if !v.is_finite() {
        *clamped += 1;
        return 0.0;
    }
    if (0.0..=1.0).contains(&v) {
        v
    } else {
        *clamped += 1;
        v.clamp(0.0, 1.0)
    }
}

fn sanitize(wire: WireDetection, clamped: &mut usize) -> Detection {
    let x = clamp_unit(wire.x, clamped);
    let y = clamp_unit(wire.y, clamped);
    let mut w = clamp_unit(wire.w, clamped);
    let mut h = clamp_unit(wire.h, clamped);
    // Keep the box inside the frame.
    if x + w > 1.0 {
        w = 1.0 - x;
        *clamped += 1;
    }
    if y + h > 1.0 {
        h = 1.0 - y;
        *clamped += 1;
    }
    let confidence = clamp_unit(wire.confidence, clamped);

    Detection {
        bbox: BoundingBox { x, y, w, h },
        label: wire.label,
        confidence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_envelope() {
        let payload = br#"{
            "forSequence": 42,
            "forTimestampUs": 1700000000000,
            "detections": [
                {"x": 0.1, "y": 0.2, "w": 0.3, "h": 0.4, "label": "cavity", "confidence": 0.93}
            ]
        }"#;
        let result = parse_detection_payload(payload).unwrap();
        assert_eq!(result.sequence, 42);
        assert_eq!(result.timestamp_us, Some(1_700_000_000_000));
        assert_eq!(result.detections.len(), 1);
        assert_eq!(result.detections[0].label, "cavity");
        assert!((result.detections[0].confidence - 0.93).abs() < f32::EPSILON);
    }

    #[test]
    fn test_parse_empty_detections() {
        let payload = br#"{"forSequence": 7, "detections": []}"#;
        let result = parse_detection_payload(payload).unwrap();
        assert_eq!(result.sequence, 7);
        assert!(result.detections.is_empty());
        assert_eq!(result.timestamp_us, None);
    }

    #[test]
    fn test_parse_rejects_missing_sequence() {
        let payload = br#"{"detections": []}"#;
        let err = parse_detection_payload(payload).unwrap_err();
        assert!(matches!(err, Error::MalformedMessage(_)));
    }

    #[test]
    fn test_parse_rejects_non_json() {
        let err = parse_detection_payload(b"not json").unwrap_err();
        assert!(err.is_discardable());
    }

    #[test]
    fn test_out_of_range_fields_clamped() {
        let payload = br#"{
            "forSequence": 3,
            "detections": [
                {"x": -0.5, "y": 0.9, "w": 0.4, "h": 0.4, "label": "cavity", "confidence": 1.7}
            ]
        }"#;
        let result = parse_detection_payload(payload).unwrap();
        let det = &result.detections[0];
        assert_eq!(det.bbox.x, 0.0);
        assert_eq!(det.bbox.y, 0.9);
        // Box pulled back inside the frame.
        assert!((det.bbox.h - 0.1).abs() < 1e-6);
        assert_eq!(det.confidence, 1.0);
    }

    #[test]
    fn test_encode_matches_wire_names() {
        let result = DetectionResult::new(
            9,
            vec![Detection {
                bbox: BoundingBox {
                    x: 0.25,
                    y: 0.25,
                    w: 0.5,
                    h: 0.5,
                },
                label: "plaque".to_string(),
                confidence: 0.6,
            }],
        );
        let bytes = encode_detection_payload(&result).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["forSequence"], 9);
        assert_eq!(value["detections"][0]["label"], "plaque");
        assert!(value.get("forTimestampUs").is_none());
    }

    #[test]
    fn test_bbox_to_pixels() {
        let bbox = BoundingBox {
            x: 0.5,
            y: 0.25,
            w: 0.25,
            h: 0.5,
        };
        let (px, py, pw, ph) = bbox.to_pixels(640, 480);
        assert_eq!((px, py, pw, ph), (320, 120, 160, 240));
    }
}
