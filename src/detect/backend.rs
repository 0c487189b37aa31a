use anyhow::Result;

use crate::frame::Image;

use super::result::FaceRegion;

/// Inference backend trait.
///
/// # Audit Boundary
///
/// Implementations receive raw pixels and MUST:
/// - Treat the image as read-only and ephemeral
/// - Not write pixels or crops to disk
/// - Not make network requests
///
/// Calls are synchronous; `InferenceWorker` bounds their duration.
pub trait InferenceBackend: Send {
    /// Backend identifier used by the registry.
    fn name(&self) -> &'static str;

    /// Opaque model tag carried into every decision record.
    fn model_version(&self) -> &str;

    /// Fixed embedding length for `model_version`.
    fn embedding_dim(&self) -> usize;

    /// Find faces in a full frame. Regions use normalized coordinates.
    fn detect(&mut self, image: &Image) -> Result<Vec<FaceRegion>>;

    /// Embed one cropped face.
    fn embed(&mut self, face: &Image) -> Result<Vec<f32>>;

    /// Optional warm-up hook, run once before the worker starts.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
