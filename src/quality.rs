//! Quality gate.
//!
//! Rejects frames before inference when the capture signals say no
//! trustworthy embedding can come out of them. Pure function of the
//! thresholds and the per-frame signals.

use crate::error::{AgentError, AgentResult};
use crate::frame::QualitySignals;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QualityThresholds {
    /// Reject when blur exceeds this ceiling.
    pub max_blur: f32,
    /// Accepted exposure band, inclusive on both ends.
    pub min_exposure: f32,
    pub max_exposure: f32,
    /// Reject when occlusion probability exceeds this ceiling.
    pub max_occlusion: f32,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            max_blur: 0.6,
            min_exposure: 0.2,
            max_exposure: 0.85,
            max_occlusion: 0.4,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct QualityAssessment {
    pub accepted: bool,
    /// Normalized quality in [0, 1]; higher is better.
    pub score: f32,
    /// First failed check, when rejected.
    pub reason: Option<&'static str>,
}

#[derive(Clone, Debug, Default)]
pub struct QualityGate {
    thresholds: QualityThresholds,
}

impl QualityGate {
    pub fn new(thresholds: QualityThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &QualityThresholds {
        &self.thresholds
    }

    /// Evaluate one frame's signals.
    ///
    /// A missing or non-finite signal is `QualitySignalMissing`; the caller
    /// counts it and treats the frame as rejected.
    pub fn evaluate(&self, signals: &QualitySignals) -> AgentResult<QualityAssessment> {
        let exposure = require("exposure", signals.exposure)?;
        let blur = require("blur", signals.blur)?;
        let occlusion = require("occlusion", signals.occlusion)?;
        let t = &self.thresholds;

        let reason = if blur > t.max_blur {
            Some("blur")
        } else if exposure < t.min_exposure {
            Some("underexposed")
        } else if exposure > t.max_exposure {
            Some("overexposed")
        } else if occlusion > t.max_occlusion {
            Some("occluded")
        } else {
            None
        };

        Ok(QualityAssessment {
            accepted: reason.is_none(),
            score: score(exposure, blur, occlusion),
            reason,
        })
    }
}

fn require(name: &'static str, value: Option<f32>) -> AgentResult<f32> {
    match value {
        Some(v) if v.is_finite() => Ok(v),
        _ => Err(AgentError::QualitySignalMissing(name)),
    }
}

/// Mean of sharpness, visibility and closeness of exposure to mid-grey.
fn score(exposure: f32, blur: f32, occlusion: f32) -> f32 {
    let sharpness = 1.0 - blur.clamp(0.0, 1.0);
    let visibility = 1.0 - occlusion.clamp(0.0, 1.0);
    let exposure_fit = 1.0 - ((exposure.clamp(0.0, 1.0) - 0.5).abs() / 0.5);
    ((sharpness + visibility + exposure_fit) / 3.0).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> QualityGate {
        QualityGate::new(QualityThresholds::default())
    }

    #[test]
    fn accepts_good_frame() {
        let a = gate()
            .evaluate(&QualitySignals::complete(0.5, 0.1, 0.05))
            .unwrap();
        assert!(a.accepted);
        assert!(a.reason.is_none());
        assert!(a.score > 0.9 && a.score <= 1.0);
    }

    #[test]
    fn rejects_each_failed_check() {
        let g = gate();
        let cases = [
            (QualitySignals::complete(0.5, 0.7, 0.0), "blur"),
            (QualitySignals::complete(0.1, 0.1, 0.0), "underexposed"),
            (QualitySignals::complete(0.95, 0.1, 0.0), "overexposed"),
            (QualitySignals::complete(0.5, 0.1, 0.5), "occluded"),
        ];
        for (signals, reason) in cases {
            let a = g.evaluate(&signals).unwrap();
            assert!(!a.accepted);
            assert_eq!(a.reason, Some(reason));
        }
    }

    #[test]
    fn bounds_are_inclusive() {
        let t = QualityThresholds::default();
        let a = gate()
            .evaluate(&QualitySignals::complete(t.min_exposure, t.max_blur, t.max_occlusion))
            .unwrap();
        assert!(a.accepted);
    }

    #[test]
    fn missing_signal_is_reported() {
        let signals = QualitySignals {
            blur: None,
            ..QualitySignals::complete(0.5, 0.1, 0.0)
        };
        match gate().evaluate(&signals) {
            Err(AgentError::QualitySignalMissing(name)) => assert_eq!(name, "blur"),
            other => panic!("unexpected {:?}", other),
        }
        let nan = QualitySignals::complete(f32::NAN, 0.1, 0.0);
        assert!(gate().evaluate(&nan).is_err());
    }

    #[test]
    fn score_stays_in_unit_range() {
        for signals in [
            QualitySignals::complete(-3.0, 5.0, 2.0),
            QualitySignals::complete(0.0, 0.0, 0.0),
            QualitySignals::complete(1.0, 1.0, 1.0),
        ] {
            let a = gate().evaluate(&signals).unwrap();
            assert!((0.0..=1.0).contains(&a.score));
        }
    }
}
