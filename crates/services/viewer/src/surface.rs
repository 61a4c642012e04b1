//! Display surfaces for headless runs
//!
//! The real product embeds the pipeline behind a GUI surface. The binary
//! ships two headless ones: a stats logger for soak runs and a PNG dump
//! for visually checking overlay placement.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::info;

use scopelink_core::{Error, Result};
use scopelink_pipeline::{Composite, DisplaySurface, SyncQuality};

/// Logs a one-line presentation summary once per second.
pub struct StatsSurface {
    window_started: Instant,
    presents: u64,
    exact: u64,
    held: u64,
    none: u64,
}

impl Default for StatsSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsSurface {
    pub fn new() -> Self {
        Self {
            window_started: Instant::now(),
            presents: 0,
            exact: 0,
            held: 0,
            none: 0,
        }
    }

    fn tally(&mut self, quality: SyncQuality) {
        self.presents += 1;
        match quality {
            SyncQuality::Exact | SyncQuality::Interpolated => self.exact += 1,
            SyncQuality::Held => self.held += 1,
            SyncQuality::None => self.none += 1,
        }
    }
}

impl DisplaySurface for StatsSurface {
    fn present(&mut self, composite: &Composite) -> Result<()> {
        self.tally(composite.quality);
        if self.window_started.elapsed() >= Duration::from_secs(1) {
            info!(
                fps = self.presents,
                exact = self.exact,
                held = self.held,
                unmatched = self.none,
                sequence = composite.sequence,
                "presenting"
            );
            self.window_started = Instant::now();
            self.presents = 0;
            self.exact = 0;
            self.held = 0;
            self.none = 0;
        }
        Ok(())
    }
}

/// Writes every Nth composite to a directory as a PNG.
pub struct PngSurface {
    dir: PathBuf,
    every: u64,
    seen: u64,
    written: u64,
}

impl PngSurface {
    pub fn new(dir: PathBuf, every: u64) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            every: every.max(1),
            seen: 0,
            written: 0,
        })
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

impl DisplaySurface for PngSurface {
    fn present(&mut self, composite: &Composite) -> Result<()> {
        let due = self.seen % self.every == 0;
        self.seen += 1;
        if !due {
            return Ok(());
        }
        let img = image::RgbImage::from_raw(
            composite.width,
            composite.height,
            composite.pixels.clone(),
        )
        .ok_or_else(|| {
            Error::RenderError(format!(
                "composite {} buffer does not match {}x{}",
                composite.sequence, composite.width, composite.height
            ))
        })?;
        let path = self.dir.join(format!(
            "frame_{:06}_{}.png",
            composite.sequence, composite.quality
        ));
        img.save(&path)
            .map_err(|e| Error::RenderError(format!("write {}: {e}", path.display())))?;
        self.written += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn composite(sequence: u64, quality: SyncQuality) -> Composite {
        Composite {
            sequence,
            capture_ts_us: 0,
            width: 2,
            height: 2,
            pixels: vec![10; 12],
            quality,
            detections: Vec::new(),
        }
    }

    #[test]
    fn test_stats_surface_accepts_every_quality() {
        let mut surface = StatsSurface::new();
        for quality in [
            SyncQuality::Exact,
            SyncQuality::Held,
            SyncQuality::None,
            SyncQuality::Interpolated,
        ] {
            surface.present(&composite(1, quality)).unwrap();
        }
        assert_eq!(surface.presents, 4);
        assert_eq!(surface.exact, 2);
        assert_eq!(surface.held, 1);
        assert_eq!(surface.none, 1);
    }

    #[test]
    fn test_png_surface_writes_every_nth() {
        let dir = tempfile::tempdir().unwrap();
        let mut surface = PngSurface::new(dir.path().to_path_buf(), 2).unwrap();
        for seq in 1..=4 {
            surface.present(&composite(seq, SyncQuality::Exact)).unwrap();
        }
        assert_eq!(surface.written(), 2);
        assert!(dir.path().join("frame_000001_exact.png").exists());
        assert!(!dir.path().join("frame_000002_exact.png").exists());
        assert!(dir.path().join("frame_000003_exact.png").exists());

        let loaded = image::open(dir.path().join("frame_000001_exact.png"))
            .unwrap()
            .to_rgb8();
        assert_eq!(loaded.dimensions(), (2, 2));
        assert_eq!(loaded.get_pixel(0, 0).0, [10, 10, 10]);
    }

    #[test]
    fn test_png_surface_rejects_bad_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let mut surface = PngSurface::new(dir.path().to_path_buf(), 1).unwrap();
        let mut bad = composite(1, SyncQuality::None);
        bad.pixels.truncate(5);
        assert!(surface.present(&bad).is_err());
    }
}
