use std::sync::Arc;

use crate::error::AgentResult;
use crate::frame::Image;

use super::result::FaceRegion;
use super::worker::InferenceWorker;

/// Face detector over the inference worker.
pub struct Detector {
    worker: Arc<InferenceWorker>,
    min_confidence: f32,
}

impl Detector {
    pub fn new(worker: Arc<InferenceWorker>, min_confidence: f32) -> Self {
        Self {
            worker,
            min_confidence,
        }
    }

    /// Regions with confidence >= the configured minimum, best first.
    ///
    /// No face is an empty vector, not an error. Non-finite boxes from the
    /// backend are dropped; boxes are clipped to the frame.
    pub fn detect(&self, image: &Image) -> AgentResult<Vec<FaceRegion>> {
        let raw = self.worker.detect(image)?;
        let total = raw.len();
        let mut regions: Vec<FaceRegion> = raw
            .into_iter()
            .filter(FaceRegion::is_finite)
            .filter(|r| r.confidence >= self.min_confidence)
            .map(|r| r.clamped())
            .filter(|r| r.area() > 0.0)
            .collect();
        regions.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        if regions.len() < total {
            log::debug!("detector: kept {} of {} regions", regions.len(), total);
        }
        Ok(regions)
    }
}
