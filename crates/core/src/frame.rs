//! Video frame and encoded-packet types shared between the transport
//! and rendering stages.

use std::time::Instant;

use crate::error::{Error, Result};

/// Pixel layout of a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Planar YUV 4:2:0, the usual decoder output.
    Yuv420p,
    /// Packed RGB, 3 bytes per pixel.
    Rgb24,
    /// Packed BGR, 3 bytes per pixel.
    Bgr24,
}

impl PixelFormat {
    /// Byte length of a frame of `width` x `height` in this format.
    pub fn frame_len(&self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Yuv420p => pixels + pixels / 2,
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => pixels * 3,
        }
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PixelFormat::Yuv420p => write!(f, "yuv420p"),
            PixelFormat::Rgb24 => write!(f, "rgb24"),
            PixelFormat::Bgr24 => write!(f, "bgr24"),
        }
    }
}

/// A decoded video frame with its stream position and capture time.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Monotonic position in the stream, starts at 1 for the first
    /// decoded frame of a session.
    pub sequence: u64,
    /// Capture timestamp in microseconds, derived from the sender's media
    /// clock anchored to the local clock at the first frame.
    pub capture_ts_us: i64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Raw pixel data, tightly packed planes with no row padding.
    pub data: Vec<u8>,
    /// Local arrival time, for pipeline latency measurements.
    pub received_at: Instant,
}

impl VideoFrame {
    /// Build a frame, checking the buffer length against the format.
    pub fn new(
        sequence: u64,
        capture_ts_us: i64,
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Vec<u8>,
    ) -> Result<Self> {
        let expected = format.frame_len(width, height);
        if data.len() != expected {
            return Err(Error::MediaError(format!(
                "frame {sequence}: {format} {width}x{height} wants {expected} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self {
            sequence,
            capture_ts_us,
            width,
            height,
            format,
            data,
            received_at: Instant::now(),
        })
    }
}

/// An encoded access unit reassembled from the media track, not yet decoded.
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    /// RTP timestamp in the sender's media clock (90 kHz for video).
    pub rtp_timestamp: u32,
    /// First RTP sequence number of the access unit.
    pub rtp_sequence: u16,
    /// Set when this packet completes a frame.
    pub marker: bool,
    pub payload: bytes::Bytes,
    pub received_at: Instant,
}

/// Decodes encoded packets into raw frames.
///
/// Implementations wrap an external codec. The pipeline only requires that
/// frames come out in presentation order; a packet may yield zero frames
/// (reference data) or several (reorder flush). Stream `sequence` and
/// `capture_ts_us` on returned frames are assigned by the ingest stage,
/// decoders may leave them zero.
pub trait VideoDecoder: Send {
    fn decode(&mut self, packet: EncodedPacket) -> Result<Vec<VideoFrame>>;

    /// Drain any internally buffered frames at end of stream.
    fn flush(&mut self) -> Result<Vec<VideoFrame>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_len_by_format() {
        assert_eq!(PixelFormat::Yuv420p.frame_len(640, 480), 460_800);
        assert_eq!(PixelFormat::Rgb24.frame_len(640, 480), 921_600);
        assert_eq!(PixelFormat::Bgr24.frame_len(2, 2), 12);
    }

    #[test]
    fn test_new_frame_validates_length() {
        let ok = VideoFrame::new(1, 0, 2, 2, PixelFormat::Rgb24, vec![0u8; 12]);
        assert!(ok.is_ok());

        let short = VideoFrame::new(2, 0, 2, 2, PixelFormat::Rgb24, vec![0u8; 11]);
        assert!(matches!(short, Err(Error::MediaError(_))));
    }

    #[test]
    fn test_format_display() {
        assert_eq!(PixelFormat::Yuv420p.to_string(), "yuv420p");
        assert_eq!(PixelFormat::Bgr24.to_string(), "bgr24");
    }
}
