//! Media ingest: packet reassembly and decode
//!
//! Sits between the track reader and the rendering pipeline. RTP packets
//! arrive one per queue entry; packets sharing a timestamp form one access
//! unit, closed by the marker bit. Assembled units go through the injected
//! [`VideoDecoder`], and decoded frames are stamped with a stream sequence
//! (from 1) and a capture timestamp before entering the frame queue.
//!
//! Capture timestamps anchor the sender's 90 kHz media clock to the local
//! clock at the first access unit. When a decoder releases several buffered
//! frames at once they share the completing unit's capture time.

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use tracing::{debug, info, warn};

use scopelink_core::{
    BoundedQueue, EncodedPacket, Error, PixelFormat, Result, VideoDecoder, VideoFrame,
};

/// RTP media clock rate for video.
const VIDEO_CLOCK_HZ: u32 = 90_000;

/// Reassembles and decodes the encoded packet stream of one session.
pub struct MediaIngest {
    packets: Arc<BoundedQueue<EncodedPacket>>,
    frames: Arc<BoundedQueue<VideoFrame>>,
    decoder: Box<dyn VideoDecoder>,
    assembler: AccessUnitAssembler,
    clock: CaptureClock,
    next_sequence: u64,
    decode_failures: u64,
}

impl MediaIngest {
    pub fn new(
        packets: Arc<BoundedQueue<EncodedPacket>>,
        frames: Arc<BoundedQueue<VideoFrame>>,
        decoder: Box<dyn VideoDecoder>,
    ) -> Self {
        Self {
            packets,
            frames,
            decoder,
            assembler: AccessUnitAssembler::new(),
            clock: CaptureClock::new(),
            next_sequence: 0,
            decode_failures: 0,
        }
    }

    /// Consume packets until the packet queue closes, then flush the
    /// decoder and close the frame queue.
    pub async fn run(mut self) {
        while let Some(packet) = self.packets.pop().await {
            for unit in self.assembler.push(packet) {
                self.decode_unit(unit);
            }
        }
        if let Some(unit) = self.assembler.take_pending() {
            self.decode_unit(unit);
        }
        match self.decoder.flush() {
            Ok(remaining) => {
                for frame in remaining {
                    self.emit(frame, self.clock.last_capture_us());
                }
            }
            Err(e) => warn!(error = %e, "decoder flush failed"),
        }
        self.frames.close();
        info!(
            frames = self.next_sequence,
            decode_failures = self.decode_failures,
            "media ingest finished"
        );
    }

    fn decode_unit(&mut self, unit: EncodedPacket) {
        let capture_us = self.clock.capture_ts_us(unit.rtp_timestamp, unix_micros_now());
        match self.decoder.decode(unit) {
            Ok(decoded) => {
                for frame in decoded {
                    self.emit(frame, capture_us);
                }
            }
            Err(e) => {
                self.decode_failures += 1;
                warn!(
                    error = %e,
                    failures = self.decode_failures,
                    "dropping undecodable access unit"
                );
            }
        }
    }

    fn emit(&mut self, mut frame: VideoFrame, capture_us: i64) {
        self.next_sequence += 1;
        frame.sequence = self.next_sequence;
        frame.capture_ts_us = capture_us;
        self.frames.push(frame);
    }
}

/// Groups RTP packets into access units by timestamp and marker bit.
struct AccessUnitAssembler {
    current: Option<PendingUnit>,
    last_rtp_sequence: Option<u16>,
    gaps: u64,
}

struct PendingUnit {
    rtp_timestamp: u32,
    rtp_sequence: u16,
    first_received_at: Instant,
    data: BytesMut,
}

impl AccessUnitAssembler {
    fn new() -> Self {
        Self {
            current: None,
            last_rtp_sequence: None,
            gaps: 0,
        }
    }

    /// Feed one packet; returns zero, one, or two completed units (a
    /// timestamp change can close a truncated unit and the marker can
    /// close the new one in the same call).
    fn push(&mut self, packet: EncodedPacket) -> Vec<EncodedPacket> {
        let mut completed = Vec::new();

        if let Some(last) = self.last_rtp_sequence {
            if packet.rtp_sequence != last.wrapping_add(1) {
                self.gaps += 1;
                debug!(
                    expected = last.wrapping_add(1),
                    got = packet.rtp_sequence,
                    gaps = self.gaps,
                    "packet sequence gap"
                );
            }
        }
        self.last_rtp_sequence = Some(packet.rtp_sequence);

        if let Some(pending) = &self.current {
            if pending.rtp_timestamp != packet.rtp_timestamp {
                // The marker of the previous unit was lost; close it
                // anyway and let the decoder decide what it can salvage.
                debug!(
                    rtp_timestamp = pending.rtp_timestamp,
                    "access unit closed without marker"
                );
                if let Some(unit) = self.take_pending() {
                    completed.push(unit);
                }
            }
        }

        let pending = self.current.get_or_insert_with(|| PendingUnit {
            rtp_timestamp: packet.rtp_timestamp,
            rtp_sequence: packet.rtp_sequence,
            first_received_at: packet.received_at,
            data: BytesMut::new(),
        });
        pending.data.extend_from_slice(&packet.payload);

        if packet.marker {
            if let Some(unit) = self.current.take() {
                completed.push(EncodedPacket {
                    rtp_timestamp: unit.rtp_timestamp,
                    rtp_sequence: unit.rtp_sequence,
                    marker: true,
                    payload: unit.data.freeze(),
                    received_at: packet.received_at,
                });
            }
        }

        completed
    }

    /// Close the unit under assembly, if any. Used at end of stream and
    /// when a timestamp change reveals a lost marker.
    fn take_pending(&mut self) -> Option<EncodedPacket> {
        self.current.take().map(|unit| EncodedPacket {
            rtp_timestamp: unit.rtp_timestamp,
            rtp_sequence: unit.rtp_sequence,
            marker: false,
            payload: unit.data.freeze(),
            received_at: unit.first_received_at,
        })
    }
}

/// Maps the sender's RTP clock onto the local clock, anchored at the
/// first access unit. Handles 32-bit timestamp wraparound.
struct CaptureClock {
    anchor: Option<(u32, i64)>,
    last_us: i64,
}

impl CaptureClock {
    fn new() -> Self {
        Self {
            anchor: None,
            last_us: 0,
        }
    }

    fn capture_ts_us(&mut self, rtp: u32, now_us: i64) -> i64 {
        let (anchor_rtp, anchor_us) = *self.anchor.get_or_insert((rtp, now_us));
        let diff = rtp.wrapping_sub(anchor_rtp) as i32 as i64;
        let us = anchor_us + diff * 1_000_000 / VIDEO_CLOCK_HZ as i64;
        self.last_us = us;
        us
    }

    fn last_capture_us(&self) -> i64 {
        self.last_us
    }
}

fn unix_micros_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Passthrough decoder
// ---------------------------------------------------------------------------

/// Decoder for streams that carry raw frames instead of compressed video.
///
/// Each access unit is one frame: a 9-byte header (format tag, width,
/// height, big-endian) followed by packed pixel data. Used by tests and
/// headless loopback runs; real deployments inject a codec-backed decoder.
#[derive(Debug, Default)]
pub struct PassthroughDecoder;

/// Header length of the raw-frame encoding.
const RAW_HEADER_LEN: usize = 9;

/// Encode a raw frame for transport to a [`PassthroughDecoder`].
pub fn encode_raw_frame(
    width: u32,
    height: u32,
    format: PixelFormat,
    data: &[u8],
) -> Result<Bytes> {
    let expected = format.frame_len(width, height);
    if data.len() != expected {
        return Err(Error::MediaError(format!(
            "raw {format} {width}x{height} wants {expected} bytes, got {}",
            data.len()
        )));
    }
    let mut out = BytesMut::with_capacity(RAW_HEADER_LEN + data.len());
    out.extend_from_slice(&[format_tag(format)]);
    out.extend_from_slice(&width.to_be_bytes());
    out.extend_from_slice(&height.to_be_bytes());
    out.extend_from_slice(data);
    Ok(out.freeze())
}

impl VideoDecoder for PassthroughDecoder {
    fn decode(&mut self, packet: EncodedPacket) -> Result<Vec<VideoFrame>> {
        let payload = &packet.payload;
        if payload.len() < RAW_HEADER_LEN {
            return Err(Error::MediaError(format!(
                "raw frame header truncated: {} bytes",
                payload.len()
            )));
        }
        let format = tag_format(payload[0]).ok_or_else(|| {
            Error::MediaError(format!("unknown raw format tag {}", payload[0]))
        })?;
        let width = u32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]);
        let height = u32::from_be_bytes([payload[5], payload[6], payload[7], payload[8]]);
        let frame = VideoFrame::new(
            0,
            0,
            width,
            height,
            format,
            payload[RAW_HEADER_LEN..].to_vec(),
        )?;
        Ok(vec![frame])
    }
}

fn format_tag(format: PixelFormat) -> u8 {
    match format {
        PixelFormat::Yuv420p => 0,
        PixelFormat::Rgb24 => 1,
        PixelFormat::Bgr24 => 2,
    }
}

fn tag_format(tag: u8) -> Option<PixelFormat> {
    match tag {
        0 => Some(PixelFormat::Yuv420p),
        1 => Some(PixelFormat::Rgb24),
        2 => Some(PixelFormat::Bgr24),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(rtp_timestamp: u32, rtp_sequence: u16, marker: bool, payload: &[u8]) -> EncodedPacket {
        EncodedPacket {
            rtp_timestamp,
            rtp_sequence,
            marker,
            payload: Bytes::copy_from_slice(payload),
            received_at: Instant::now(),
        }
    }

    fn raw_rgb_packet(rtp_timestamp: u32, rtp_sequence: u16, fill: u8) -> EncodedPacket {
        let payload = encode_raw_frame(2, 2, PixelFormat::Rgb24, &[fill; 12]).unwrap();
        packet(rtp_timestamp, rtp_sequence, true, &payload)
    }

    #[test]
    fn test_assembler_joins_packets_of_one_unit() {
        let mut assembler = AccessUnitAssembler::new();
        assert!(assembler.push(packet(1000, 1, false, b"ab")).is_empty());
        let units = assembler.push(packet(1000, 2, true, b"cd"));
        assert_eq!(units.len(), 1);
        assert_eq!(&units[0].payload[..], b"abcd");
        assert_eq!(units[0].rtp_sequence, 1);
        assert!(units[0].marker);
    }

    #[test]
    fn test_assembler_closes_truncated_unit_on_timestamp_change() {
        let mut assembler = AccessUnitAssembler::new();
        assert!(assembler.push(packet(1000, 1, false, b"ab")).is_empty());
        let units = assembler.push(packet(4000, 2, true, b"cd"));
        assert_eq!(units.len(), 2);
        assert_eq!(&units[0].payload[..], b"ab");
        assert!(!units[0].marker);
        assert_eq!(&units[1].payload[..], b"cd");
        assert!(units[1].marker);
    }

    #[test]
    fn test_assembler_counts_sequence_gaps() {
        let mut assembler = AccessUnitAssembler::new();
        assembler.push(packet(1000, 1, true, b"a"));
        assembler.push(packet(2000, 5, true, b"b"));
        assert_eq!(assembler.gaps, 1);
    }

    #[test]
    fn test_capture_clock_spacing_and_wraparound() {
        let mut clock = CaptureClock::new();
        let t0 = clock.capture_ts_us(u32::MAX - 1000, 1_000_000);
        assert_eq!(t0, 1_000_000);
        // 3000 ticks at 90 kHz is one 30 fps frame interval, across the
        // 32-bit boundary.
        let t1 = clock.capture_ts_us((u32::MAX - 1000).wrapping_add(3000), 9_999_999);
        assert_eq!(t1, 1_000_000 + 33_333);
    }

    #[test]
    fn test_passthrough_round_trip() {
        let data: Vec<u8> = (0..12).collect();
        let payload = encode_raw_frame(2, 2, PixelFormat::Bgr24, &data).unwrap();
        let mut decoder = PassthroughDecoder;
        let frames = decoder.decode(packet(0, 0, true, &payload)).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].width, 2);
        assert_eq!(frames[0].format, PixelFormat::Bgr24);
        assert_eq!(frames[0].data, data);
    }

    #[test]
    fn test_passthrough_rejects_garbage() {
        let mut decoder = PassthroughDecoder;
        assert!(decoder.decode(packet(0, 0, true, b"xx")).is_err());

        let mut bad_tag = encode_raw_frame(2, 2, PixelFormat::Rgb24, &[0; 12])
            .unwrap()
            .to_vec();
        bad_tag[0] = 9;
        assert!(decoder.decode(packet(0, 0, true, &bad_tag)).is_err());
    }

    #[tokio::test]
    async fn test_ingest_stamps_sequence_and_capture_time() {
        let packets = Arc::new(BoundedQueue::new(8));
        let frames = Arc::new(BoundedQueue::new(8));
        let ingest = MediaIngest::new(
            Arc::clone(&packets),
            Arc::clone(&frames),
            Box::new(PassthroughDecoder),
        );
        let task = tokio::spawn(ingest.run());

        packets.push(raw_rgb_packet(0, 1, 0x11));
        packets.push(raw_rgb_packet(3000, 2, 0x22));
        packets.close();
        task.await.unwrap();

        let first = frames.pop().await.unwrap();
        let second = frames.pop().await.unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(second.capture_ts_us - first.capture_ts_us, 33_333);
        assert!(frames.pop().await.is_none());
        assert!(frames.is_closed());
    }

    #[tokio::test]
    async fn test_ingest_drops_undecodable_unit_and_continues() {
        let packets = Arc::new(BoundedQueue::new(8));
        let frames = Arc::new(BoundedQueue::new(8));
        let ingest = MediaIngest::new(
            Arc::clone(&packets),
            Arc::clone(&frames),
            Box::new(PassthroughDecoder),
        );
        let task = tokio::spawn(ingest.run());

        packets.push(packet(0, 1, true, b"not a frame"));
        packets.push(raw_rgb_packet(3000, 2, 0x33));
        packets.close();
        task.await.unwrap();

        let survivor = frames.pop().await.unwrap();
        assert_eq!(survivor.sequence, 1);
        assert!(frames.pop().await.is_none());
    }
}
