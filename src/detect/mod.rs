//! Detection and embedding over the external inference interface.
//!
//! The model weights and kernels are not part of this crate. A backend
//! implements `InferenceBackend`; `InferenceWorker` runs it on its own
//! thread so every call carries a timeout; `Detector` and `Embedder` are the
//! thin adapters the capture loop uses.

mod backend;
mod backends;
mod detector;
mod embedder;
mod registry;
mod result;
mod worker;

pub use backend::InferenceBackend;
pub use backends::StubBackend;
pub use detector::Detector;
pub use embedder::{Embedder, Embedding};
pub use registry::BackendRegistry;
pub use result::FaceRegion;
pub use worker::InferenceWorker;

pub(crate) use embedder::normalize;
