use anyhow::{anyhow, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

use crate::detect::backend::InferenceBackend;
use crate::detect::result::FaceRegion;
use crate::frame::Image;
use crate::ingest::synthetic::FACE_BOX;

pub const STUB_MODEL_VERSION: &str = "stub-v1";
pub const STUB_EMBEDDING_DIM: usize = 128;

/// Stub backend for testing and bench runs against `stub://` sources.
///
/// Reports a face at the synthetic face box whenever the centre pixel is
/// lit, and derives the embedding deterministically from the crop hash so
/// the same subject always embeds to the same vector.
pub struct StubBackend {
    calls: u64,
}

impl StubBackend {
    pub fn new() -> Self {
        Self { calls: 0 }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn model_version(&self) -> &str {
        STUB_MODEL_VERSION
    }

    fn embedding_dim(&self) -> usize {
        STUB_EMBEDDING_DIM
    }

    fn detect(&mut self, image: &Image) -> Result<Vec<FaceRegion>> {
        self.calls += 1;
        let centre = image
            .pixel(image.width / 2, image.height / 2)
            .ok_or_else(|| anyhow!("empty image"))?;
        if centre == [0, 0, 0] {
            return Ok(vec![]);
        }
        let (x, y, w, h) = FACE_BOX;
        Ok(vec![FaceRegion {
            x,
            y,
            w,
            h,
            confidence: 0.93,
        }])
    }

    fn embed(&mut self, face: &Image) -> Result<Vec<f32>> {
        self.calls += 1;
        let digest: [u8; 32] = Sha256::digest(face.pixels()).into();
        let mut rng = StdRng::from_seed(digest);
        Ok((0..STUB_EMBEDDING_DIM)
            .map(|_| rng.gen_range(-1.0f32..1.0))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lit(value: u8) -> Image {
        Image::new(vec![value; 10 * 10 * 3], 10, 10).unwrap()
    }

    #[test]
    fn dark_centre_has_no_face() {
        let mut backend = StubBackend::new();
        assert!(backend.detect(&lit(0)).unwrap().is_empty());
        assert_eq!(backend.detect(&lit(9)).unwrap().len(), 1);
    }

    #[test]
    fn embedding_is_deterministic_per_crop() {
        let mut backend = StubBackend::new();
        let a = backend.embed(&lit(5)).unwrap();
        let b = backend.embed(&lit(5)).unwrap();
        let c = backend.embed(&lit(6)).unwrap();
        assert_eq!(a.len(), STUB_EMBEDDING_DIM);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
