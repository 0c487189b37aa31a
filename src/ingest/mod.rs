//! Frame sources.
//!
//! The capture device is an external collaborator: each deployment plugs in
//! a `FrameSource` that wraps its camera driver. This module provides the
//! trait plus a synthetic `stub://` source for tests and bench runs.
//!
//! Sources are responsible for:
//! - Stamping capture time from the agent clock
//! - Attaching per-frame quality signals (exposure, blur, occlusion)
//!
//! Sources MUST NOT:
//! - Store frames to disk
//! - Transmit frames over the network

pub mod synthetic;

use anyhow::{anyhow, Result};
use std::sync::Arc;

use crate::config::SourceSettings;
use crate::frame::Frame;
use crate::Clock;

pub use synthetic::SyntheticSource;

/// Statistics for a frame source.
#[derive(Clone, Debug)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub url: String,
}

pub trait FrameSource: Send {
    /// Connect to the underlying device.
    fn connect(&mut self) -> Result<()>;

    /// Capture the next frame. Blocks until one is available.
    fn next_frame(&mut self) -> Result<Frame>;

    /// Check if the source is healthy.
    fn is_healthy(&self) -> bool;

    /// Get frame statistics.
    fn stats(&self) -> SourceStats;
}

/// Open the source named by `settings.url`.
///
/// Only `stub://` is built in; camera drivers live in the platform
/// integration and implement `FrameSource` directly.
pub fn open_source(settings: &SourceSettings, clock: Arc<dyn Clock>) -> Result<Box<dyn FrameSource>> {
    if settings.url.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(settings.clone(), clock)));
    }
    Err(anyhow!(
        "no built-in frame source for {} (only stub:// is bundled)",
        settings.url
    ))
}
