//! Frames and the image buffers handed to the inference interface.
//!
//! - `Frame`: one captured frame plus its per-frame quality signals.
//! - `Image`: a cheaply clonable RGB buffer. This is what crosses into the
//!   inference worker thread, so pixels are reference counted, not copied.
//!
//! Pixels never leave the process: there is no serialization for either type
//! and nothing in the pipeline writes them to disk.

use std::sync::Arc;

use crate::detect::FaceRegion;
use crate::error::{AgentError, AgentResult};

/// Bytes per pixel for all frames handled by the pipeline (packed RGB8).
pub const CHANNELS: usize = 3;

/// Per-frame quality estimates supplied by the capture device.
///
/// All values are normalized to [0, 1]. A missing value means the source
/// could not estimate it for this frame.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct QualitySignals {
    /// Mean luminance.
    pub exposure: Option<f32>,
    /// Blur estimate; 0 is sharp.
    pub blur: Option<f32>,
    /// Probability that the face area is occluded.
    pub occlusion: Option<f32>,
}

impl QualitySignals {
    pub fn complete(exposure: f32, blur: f32, occlusion: f32) -> Self {
        Self {
            exposure: Some(exposure),
            blur: Some(blur),
            occlusion: Some(occlusion),
        }
    }
}

/// RGB8 image buffer shared with the inference worker.
#[derive(Clone)]
pub struct Image {
    pixels: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
}

impl Image {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32) -> AgentResult<Self> {
        let expected = width as usize * height as usize * CHANNELS;
        if pixels.len() != expected {
            return Err(AgentError::Inference(format!(
                "image buffer is {} bytes, expected {} for {}x{} rgb",
                pixels.len(),
                expected,
                width,
                height
            )));
        }
        Ok(Self {
            pixels: pixels.into(),
            width,
            height,
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = (y as usize * self.width as usize + x as usize) * CHANNELS;
        Some([self.pixels[idx], self.pixels[idx + 1], self.pixels[idx + 2]])
    }

    /// Crop a normalized region into its own buffer for the embedder.
    pub fn crop(&self, region: &FaceRegion) -> AgentResult<Image> {
        let (x0, y0, x1, y1) = region.pixel_bounds(self.width, self.height);
        if x1 <= x0 || y1 <= y0 {
            return Err(AgentError::Inference(format!(
                "face region {:?} is empty at {}x{}",
                region, self.width, self.height
            )));
        }
        let w = (x1 - x0) as usize;
        let h = (y1 - y0) as usize;
        let stride = self.width as usize * CHANNELS;
        let mut out = Vec::with_capacity(w * h * CHANNELS);
        for row in y0 as usize..y1 as usize {
            let start = row * stride + x0 as usize * CHANNELS;
            out.extend_from_slice(&self.pixels[start..start + w * CHANNELS]);
        }
        Image::new(out, w as u32, h as u32)
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

/// A captured frame.
#[derive(Clone, Debug)]
pub struct Frame {
    image: Image,
    /// Capture time, ms since epoch.
    pub captured_at: u64,
    /// Source-local frame counter.
    pub sequence: u64,
    pub signals: QualitySignals,
}

impl Frame {
    pub fn new(image: Image, captured_at: u64, sequence: u64, signals: QualitySignals) -> Self {
        Self {
            image,
            captured_at,
            sequence,
            signals,
        }
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width
    }

    pub fn height(&self) -> u32 {
        self.image.height
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> Image {
        let mut pixels = Vec::new();
        for y in 0..height {
            for x in 0..width {
                pixels.extend_from_slice(&[x as u8, y as u8, 7]);
            }
        }
        Image::new(pixels, width, height).unwrap()
    }

    #[test]
    fn rejects_mismatched_buffer() {
        assert!(Image::new(vec![0; 10], 2, 2).is_err());
    }

    #[test]
    fn crop_extracts_region_rows() {
        let image = gradient(10, 10);
        let region = FaceRegion {
            x: 0.2,
            y: 0.3,
            w: 0.5,
            h: 0.2,
            confidence: 0.9,
        };
        let face = image.crop(&region).unwrap();
        assert_eq!((face.width, face.height), (5, 2));
        assert_eq!(face.pixel(0, 0), Some([2, 3, 7]));
        assert_eq!(face.pixel(4, 1), Some([6, 4, 7]));
        assert_eq!(face.pixel(5, 0), None);
    }

    #[test]
    fn crop_rejects_degenerate_region() {
        let image = gradient(4, 4);
        let region = FaceRegion {
            x: 0.5,
            y: 0.5,
            w: 0.0,
            h: 0.4,
            confidence: 0.9,
        };
        assert!(image.crop(&region).is_err());
    }
}
