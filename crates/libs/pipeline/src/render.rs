//! Overlay composition and the display-paced render loop
//!
//! [`compose`] is pure: one synced frame plus the overlay style in, one
//! RGB composite out. The [`RenderLoop`] owns the pacing: it ticks at the
//! display refresh rate, presents a new composite when one is ready and
//! re-presents the previous one otherwise, so the image never goes black
//! between frames. Presentation goes through the [`DisplaySurface`] trait
//! so the embedding GUI stays out of this crate.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use scopelink_core::config::RenderConfig;
use scopelink_core::{BoundedQueue, Detection, Error, PixelFormat, Result};

use crate::latency::LatencyMonitor;
use crate::sync::{SyncQuality, SyncedFrame};

/// Height of the filled anchor bar drawn above each box. The embedder
/// rasterizes label text onto it; this crate does no font rendering.
const LABEL_BAR_HEIGHT: u32 = 14;

/// A fully composed RGB image ready for presentation.
#[derive(Debug, Clone)]
pub struct Composite {
    pub sequence: u64,
    pub capture_ts_us: i64,
    pub width: u32,
    pub height: u32,
    /// Packed RGB, 3 bytes per pixel, no row padding.
    pub pixels: Vec<u8>,
    pub quality: SyncQuality,
    /// The detections drawn onto `pixels`, for embedders that add text.
    pub detections: Vec<Detection>,
}

/// Where composites go. Implemented by the embedding application.
pub trait DisplaySurface: Send {
    fn present(&mut self, composite: &Composite) -> Result<()>;
}

/// Convert a synced frame into an RGB composite with its overlay drawn.
pub fn compose(synced: &SyncedFrame, style: &RenderConfig) -> Result<Composite> {
    let frame = &synced.frame;
    let mut pixels = to_rgb(frame.width, frame.height, frame.format, &frame.data)?;

    let detections = match &synced.result {
        Some(result) => result.detections.clone(),
        None => Vec::new(),
    };
    for detection in &detections {
        let color = style
            .label_colors
            .get(&detection.label)
            .copied()
            .unwrap_or(style.default_color);
        let rect = detection.bbox.to_pixels(frame.width, frame.height);
        draw_outline(&mut pixels, frame.width, rect, style.box_thickness, color);
        draw_label_bar(&mut pixels, frame.width, rect, color);
    }

    Ok(Composite {
        sequence: frame.sequence,
        capture_ts_us: frame.capture_ts_us,
        width: frame.width,
        height: frame.height,
        pixels,
        quality: synced.quality,
        detections,
    })
}

fn to_rgb(width: u32, height: u32, format: PixelFormat, data: &[u8]) -> Result<Vec<u8>> {
    match format {
        PixelFormat::Rgb24 => Ok(data.to_vec()),
        PixelFormat::Bgr24 => {
            let mut out = data.to_vec();
            for px in out.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            Ok(out)
        }
        PixelFormat::Yuv420p => yuv420p_to_rgb(width, height, data),
    }
}

/// Limited-range BT.601 integer conversion.
fn yuv420p_to_rgb(width: u32, height: u32, data: &[u8]) -> Result<Vec<u8>> {
    if width % 2 != 0 || height % 2 != 0 {
        return Err(Error::MediaError(format!(
            "yuv420p needs even dimensions, got {width}x{height}"
        )));
    }
    let w = width as usize;
    let h = height as usize;
    let y_plane = &data[..w * h];
    let u_plane = &data[w * h..w * h + (w / 2) * (h / 2)];
    let v_plane = &data[w * h + (w / 2) * (h / 2)..];

    let mut out = vec![0u8; w * h * 3];
    for row in 0..h {
        for col in 0..w {
            let c = i32::from(y_plane[row * w + col]) - 16;
            let chroma = (row / 2) * (w / 2) + col / 2;
            let d = i32::from(u_plane[chroma]) - 128;
            let e = i32::from(v_plane[chroma]) - 128;

            let r = (298 * c + 409 * e + 128) >> 8;
            let g = (298 * c - 100 * d - 208 * e + 128) >> 8;
            let b = (298 * c + 516 * d + 128) >> 8;

            let idx = (row * w + col) * 3;
            out[idx] = r.clamp(0, 255) as u8;
            out[idx + 1] = g.clamp(0, 255) as u8;
            out[idx + 2] = b.clamp(0, 255) as u8;
        }
    }
    Ok(out)
}

fn put_pixel(pixels: &mut [u8], width: u32, x: u32, y: u32, color: [u8; 3]) {
    let idx = ((y * width + x) * 3) as usize;
    pixels[idx..idx + 3].copy_from_slice(&color);
}

/// Rectangle outline of the given thickness. `to_pixels` already keeps
/// the rectangle inside the frame.
fn draw_outline(
    pixels: &mut [u8],
    width: u32,
    rect: (u32, u32, u32, u32),
    thickness: u32,
    color: [u8; 3],
) {
    let (x, y, w, h) = rect;
    if w == 0 || h == 0 {
        return;
    }
    let t = thickness.min(w).min(h);
    for row in y..y + h {
        let edge_row = row < y + t || row >= (y + h).saturating_sub(t);
        for col in x..x + w {
            let edge_col = col < x + t || col >= (x + w).saturating_sub(t);
            if edge_row || edge_col {
                put_pixel(pixels, width, col, row, color);
            }
        }
    }
}

/// Filled bar directly above the box, clipped at the top of the frame.
fn draw_label_bar(pixels: &mut [u8], width: u32, rect: (u32, u32, u32, u32), color: [u8; 3]) {
    let (x, y, w, _) = rect;
    let top = y.saturating_sub(LABEL_BAR_HEIGHT);
    for row in top..y {
        for col in x..x + w {
            put_pixel(pixels, width, col, row, color);
        }
    }
}

/// Presents composites at the display refresh rate.
///
/// When no new synced frame is ready at a tick, the previous composite is
/// presented again. Latency is recorded only for fresh frames.
pub struct RenderLoop<S: DisplaySurface> {
    synced: Arc<BoundedQueue<SyncedFrame>>,
    surface: S,
    style: RenderConfig,
    monitor: Arc<LatencyMonitor>,
    shutdown: broadcast::Receiver<()>,
    last: Option<Composite>,
    presented: u64,
    represented: u64,
}

impl<S: DisplaySurface> RenderLoop<S> {
    pub fn new(
        synced: Arc<BoundedQueue<SyncedFrame>>,
        surface: S,
        style: RenderConfig,
        monitor: Arc<LatencyMonitor>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            synced,
            surface,
            style,
            monitor,
            shutdown,
            last: None,
            presented: 0,
            represented: 0,
        }
    }

    /// Run until the synced queue closes or shutdown is signalled.
    pub async fn run(mut self) {
        let period = Duration::from_secs_f64(1.0 / f64::from(self.style.refresh_hz.max(1)));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.render_tick() {
                        break;
                    }
                }
                _ = self.shutdown.recv() => {
                    // Present anything already synced, then stop.
                    self.render_tick();
                    break;
                }
            }
        }
        info!(
            presented = self.presented,
            represented = self.represented,
            "render loop finished"
        );
    }

    /// One display tick. Returns false when the pipeline has ended.
    fn render_tick(&mut self) -> bool {
        match self.synced.try_pop() {
            Some(synced) => match compose(&synced, &self.style) {
                Ok(composite) => {
                    if let Err(e) = self.surface.present(&composite) {
                        warn!(sequence = composite.sequence, error = %e, "present failed");
                    }
                    self.monitor.record_presented(composite.capture_ts_us);
                    self.presented += 1;
                    self.last = Some(composite);
                }
                Err(e) => warn!(error = %e, "dropping uncomposable frame"),
            },
            None => {
                if self.synced.is_closed() {
                    return false;
                }
                if let Some(last) = &self.last {
                    if let Err(e) = self.surface.present(last) {
                        warn!(sequence = last.sequence, error = %e, "re-present failed");
                    }
                    self.represented += 1;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use scopelink_core::config::{LatencyConfig, SyncConfig};
    use scopelink_core::{BoundingBox, DetectionResult, VideoFrame};

    fn style(thickness: u32) -> RenderConfig {
        RenderConfig {
            box_thickness: thickness,
            ..RenderConfig::default()
        }
    }

    fn synced_rgb(sequence: u64, width: u32, height: u32, label: Option<&str>) -> SyncedFrame {
        let frame = VideoFrame::new(
            sequence,
            0,
            width,
            height,
            PixelFormat::Rgb24,
            vec![0; (width * height * 3) as usize],
        )
        .unwrap();
        let result = label.map(|label| {
            DetectionResult::new(
                sequence,
                vec![Detection {
                    bbox: BoundingBox {
                        x: 0.25,
                        y: 0.25,
                        w: 0.5,
                        h: 0.5,
                    },
                    label: label.to_string(),
                    confidence: 0.9,
                }],
            )
        });
        let quality = if result.is_some() {
            SyncQuality::Exact
        } else {
            SyncQuality::None
        };
        SyncedFrame {
            frame,
            result,
            quality,
        }
    }

    fn pixel(composite: &Composite, x: u32, y: u32) -> [u8; 3] {
        let idx = ((y * composite.width + x) * 3) as usize;
        [
            composite.pixels[idx],
            composite.pixels[idx + 1],
            composite.pixels[idx + 2],
        ]
    }

    #[test]
    fn test_compose_draws_outline_and_label_bar() {
        let composite = compose(&synced_rgb(1, 8, 8, Some("cavity")), &style(1)).unwrap();
        // 0.25/0.5 of 8 gives the rectangle (2, 2) to (5, 5).
        let red = [220, 40, 40];
        assert_eq!(pixel(&composite, 2, 2), red);
        assert_eq!(pixel(&composite, 5, 5), red);
        assert_eq!(pixel(&composite, 4, 4), [0, 0, 0]);
        // Bar above the box, clipped to the frame top.
        assert_eq!(pixel(&composite, 3, 0), red);
        assert_eq!(pixel(&composite, 3, 1), red);
        assert_eq!(composite.detections.len(), 1);
        assert_eq!(composite.quality, SyncQuality::Exact);
    }

    #[test]
    fn test_unknown_label_uses_default_color() {
        let composite = compose(&synced_rgb(1, 8, 8, Some("polyp")), &style(1)).unwrap();
        assert_eq!(pixel(&composite, 2, 2), [40, 200, 120]);
    }

    #[test]
    fn test_frame_without_result_passes_through() {
        let composite = compose(&synced_rgb(3, 4, 4, None), &style(1)).unwrap();
        assert!(composite.pixels.iter().all(|&b| b == 0));
        assert!(composite.detections.is_empty());
        assert_eq!(composite.quality, SyncQuality::None);
    }

    #[test]
    fn test_yuv_gray_converts_to_neutral_rgb() {
        let data = vec![128u8; 4 * 4 + 2 * (2 * 2)];
        let frame = VideoFrame::new(1, 0, 4, 4, PixelFormat::Yuv420p, data).unwrap();
        let synced = SyncedFrame {
            frame,
            result: None,
            quality: SyncQuality::None,
        };
        let composite = compose(&synced, &style(1)).unwrap();
        // Limited-range 128 maps slightly above mid-gray.
        assert_eq!(pixel(&composite, 0, 0), [130, 130, 130]);
        assert_eq!(pixel(&composite, 3, 3), [130, 130, 130]);
    }

    #[test]
    fn test_yuv_rejects_odd_dimensions() {
        let frame = VideoFrame::new(1, 0, 3, 3, PixelFormat::Yuv420p, vec![0; 13]).unwrap();
        let synced = SyncedFrame {
            frame,
            result: None,
            quality: SyncQuality::None,
        };
        assert!(compose(&synced, &style(1)).is_err());
    }

    #[test]
    fn test_bgr_swaps_channels() {
        let frame = VideoFrame::new(1, 0, 1, 1, PixelFormat::Bgr24, vec![1, 2, 3]).unwrap();
        let synced = SyncedFrame {
            frame,
            result: None,
            quality: SyncQuality::None,
        };
        let composite = compose(&synced, &style(1)).unwrap();
        assert_eq!(composite.pixels, vec![3, 2, 1]);
    }

    #[test]
    fn test_full_frame_box_stays_in_bounds() {
        let frame = VideoFrame::new(1, 0, 4, 4, PixelFormat::Rgb24, vec![0; 48]).unwrap();
        let synced = SyncedFrame {
            frame,
            result: Some(DetectionResult::new(
                1,
                vec![Detection {
                    bbox: BoundingBox {
                        x: 0.0,
                        y: 0.0,
                        w: 1.0,
                        h: 1.0,
                    },
                    label: "cavity".to_string(),
                    confidence: 1.0,
                }],
            )),
            quality: SyncQuality::Exact,
        };
        let composite = compose(&synced, &style(3)).unwrap();
        assert_eq!(pixel(&composite, 0, 0), [220, 40, 40]);
        assert_eq!(pixel(&composite, 3, 3), [220, 40, 40]);
    }

    struct LogSurface {
        log: Arc<Mutex<Vec<(u64, SyncQuality)>>>,
    }

    impl DisplaySurface for LogSurface {
        fn present(&mut self, composite: &Composite) -> Result<()> {
            self.log.lock().push((composite.sequence, composite.quality));
            Ok(())
        }
    }

    fn monitor() -> Arc<LatencyMonitor> {
        Arc::new(LatencyMonitor::new(&LatencyConfig::default(), &SyncConfig::default()).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_represents_last_composite_between_frames() {
        let synced = Arc::new(BoundedQueue::new(4));
        let log = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let monitor = monitor();

        synced.push(synced_rgb(1, 4, 4, None));
        let render = RenderLoop::new(
            Arc::clone(&synced),
            LogSurface {
                log: Arc::clone(&log),
            },
            RenderConfig::default(),
            Arc::clone(&monitor),
            shutdown_rx,
        );
        let task = tokio::spawn(render.run());

        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(()).unwrap();
        task.await.unwrap();

        let log = log.lock();
        assert!(log.len() >= 3, "expected re-presents, got {}", log.len());
        assert!(log.iter().all(|&(seq, _)| seq == 1));
        assert_eq!(monitor.frames_presented(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_exits_when_queue_closes() {
        let synced = Arc::new(BoundedQueue::new(4));
        let log = Arc::new(Mutex::new(Vec::new()));
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        synced.push(synced_rgb(1, 4, 4, Some("cavity")));
        synced.push(synced_rgb(2, 4, 4, None));
        synced.close();

        let render = RenderLoop::new(
            Arc::clone(&synced),
            LogSurface {
                log: Arc::clone(&log),
            },
            RenderConfig::default(),
            monitor(),
            shutdown_rx,
        );
        render.run().await;

        let log = log.lock();
        assert_eq!(
            log.as_slice(),
            &[(1, SyncQuality::Exact), (2, SyncQuality::None)]
        );
    }
}
