//! Synthetic frame source (`stub://`).
//!
//! Simulates a doorway: every 50 frames the scene changes and one of a few
//! synthetic subjects (or nobody) stands in the centre of the frame. Pixels
//! inside the face box depend only on the subject, so a deterministic
//! backend yields a stable embedding per subject. Quality signals are
//! degraded on a fixed cadence to exercise the gate.

use anyhow::Result;
use std::sync::Arc;

use crate::config::SourceSettings;
use crate::frame::{Frame, Image, QualitySignals, CHANNELS};
use crate::Clock;

use super::{FrameSource, SourceStats};

/// Number of distinct synthetic subjects (subject 0 means nobody).
pub const SYNTHETIC_SUBJECTS: u8 = 3;

/// Normalized face box painted by the synthetic source.
pub const FACE_BOX: (f32, f32, f32, f32) = (0.35, 0.3, 0.3, 0.4);

pub struct SyntheticSource {
    settings: SourceSettings,
    clock: Arc<dyn Clock>,
    frame_count: u64,
    scene_state: u8,
}

impl SyntheticSource {
    pub fn new(settings: SourceSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            clock,
            frame_count: 0,
            scene_state: 0,
        }
    }

    /// Subject currently in view; 0 when the doorway is empty.
    pub fn current_subject(&self) -> u8 {
        self.scene_state % (SYNTHETIC_SUBJECTS + 1)
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let subject = self.current_subject();
        let width = self.settings.width as usize;
        let height = self.settings.height as usize;
        let (bx, by, bw, bh) = FACE_BOX;
        let x0 = (bx * width as f32).round() as usize;
        let x1 = ((bx + bw) * width as f32).round() as usize;
        let y0 = (by * height as f32).round() as usize;
        let y1 = ((by + bh) * height as f32).round() as usize;

        let mut pixels = vec![0u8; width * height * CHANNELS];
        for y in 0..height {
            for x in 0..width {
                let idx = (y * width + x) * CHANNELS;
                let in_box = x >= x0 && x < x1 && y >= y0 && y < y1;
                let value = if !in_box {
                    // Background drifts with the frame counter.
                    ((idx as u64 + self.frame_count) % 256) as u8
                } else if subject == 0 {
                    0
                } else {
                    (((x - x0) * 31 + (y - y0) * 17 + subject as usize * 97) % 251 + 1) as u8
                };
                pixels[idx..idx + CHANNELS].fill(value);
            }
        }
        pixels
    }

    fn signals(&self) -> QualitySignals {
        let n = self.frame_count;
        if n % 29 == 0 {
            return QualitySignals {
                occlusion: None,
                ..QualitySignals::complete(0.5, 0.1, 0.0)
            };
        }
        let blur = if n % 17 == 0 { 0.9 } else { 0.1 };
        let exposure = 0.45 + (n % 10) as f32 * 0.01;
        QualitySignals::complete(exposure, blur, 0.05)
    }
}

impl FrameSource for SyntheticSource {
    fn connect(&mut self) -> Result<()> {
        log::info!("SyntheticSource: connected to {} (synthetic)", self.settings.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        self.frame_count += 1;
        let pixels = self.generate_pixels();
        let image = Image::new(pixels, self.settings.width, self.settings.height)?;
        let signals = self.signals();
        Ok(Frame::new(
            image,
            self.clock.now_ms(),
            self.frame_count,
            signals,
        ))
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            url: self.settings.url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManualClock;

    fn source() -> SyntheticSource {
        let settings = SourceSettings {
            url: "stub://door".to_string(),
            target_fps: 10,
            width: 40,
            height: 30,
        };
        SyntheticSource::new(settings, ManualClock::new(5_000))
    }

    #[test]
    fn frames_carry_clock_time_and_dimensions() {
        let mut src = source();
        let frame = src.next_frame().unwrap();
        assert_eq!(frame.captured_at, 5_000);
        assert_eq!((frame.width(), frame.height()), (40, 30));
        assert_eq!(frame.sequence, 1);
        assert_eq!(src.stats().frames_captured, 1);
    }

    #[test]
    fn face_box_is_stable_for_a_subject() {
        let mut src = source();
        // Move into scene 1 (subject 1).
        for _ in 0..50 {
            src.next_frame().unwrap();
        }
        assert_eq!(src.current_subject(), 1);
        let a = src.next_frame().unwrap();
        let b = src.next_frame().unwrap();
        let centre = (20, 15);
        assert_eq!(
            a.image().pixel(centre.0, centre.1),
            b.image().pixel(centre.0, centre.1)
        );
        assert_ne!(a.image().pixel(centre.0, centre.1), Some([0, 0, 0]));
        // Background moves between frames.
        assert_ne!(a.image().pixel(0, 0), b.image().pixel(0, 0));
    }

    #[test]
    fn some_frames_lack_occlusion_signal() {
        let mut src = source();
        let missing = (0..60)
            .map(|_| src.next_frame().unwrap())
            .filter(|f| f.signals.occlusion.is_none())
            .count();
        assert_eq!(missing, 2);
    }
}
