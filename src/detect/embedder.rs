use std::sync::Arc;

use crate::error::{AgentError, AgentResult};
use crate::frame::Image;

use super::result::FaceRegion;
use super::worker::InferenceWorker;

/// Unit-norm probe vector tagged with the model that produced it.
#[derive(Clone, Debug, PartialEq)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub model_version: String,
}

impl Embedding {
    pub fn dim(&self) -> usize {
        self.vector.len()
    }
}

pub struct Embedder {
    worker: Arc<InferenceWorker>,
}

impl Embedder {
    pub fn new(worker: Arc<InferenceWorker>) -> Self {
        Self { worker }
    }

    pub fn model_version(&self) -> &str {
        self.worker.model_version()
    }

    /// Crop `region` out of `image` and embed it.
    ///
    /// A wrong length, a non-finite component or a zero vector is a
    /// malformed result and fails with `Inference`.
    pub fn embed(&self, image: &Image, region: &FaceRegion) -> AgentResult<Embedding> {
        let face = image.crop(region)?;
        let mut vector = self.worker.embed(&face)?;
        let dim = self.worker.embedding_dim();
        if vector.len() != dim {
            return Err(AgentError::Inference(format!(
                "embedding has {} components, model {} expects {}",
                vector.len(),
                self.worker.model_version(),
                dim
            )));
        }
        if !normalize(&mut vector) {
            return Err(AgentError::Inference(
                "embedding is zero or non-finite".to_string(),
            ));
        }
        Ok(Embedding {
            vector,
            model_version: self.worker.model_version().to_string(),
        })
    }
}

/// Scale `v` to unit length in place. False when that is impossible.
pub(crate) fn normalize(v: &mut [f32]) -> bool {
    if v.iter().any(|x| !x.is_finite()) {
        return false;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if !(norm.is_finite() && norm > 0.0) {
        return false;
    }
    v.iter_mut().for_each(|x| *x /= norm);
    true
}
