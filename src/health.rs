//! Health and metrics surface.
//!
//! Every contained failure is counted here so that nothing is dropped
//! silently. Counters are lock-free and shared across all tasks.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::AgentError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Counter {
    FramesCaptured,
    FramesAccepted,
    QualityRejected,
    QualitySignalMissing,
    FacesDetected,
    InferenceErrors,
    DecisionsEmitted,
    EnqueueFailures,
    CacheSyncs,
    CacheSyncFailures,
    DeliveriesAcked,
    DeliveryFailures,
    DeliveryRejected,
    CredentialRefreshes,
    CredentialRefreshFailures,
    CredentialExpired,
    CredentialRevoked,
    StorageCorruption,
    StorageErrors,
    FallbackRecordsSent,
    FallbackErrors,
    RetentionExpired,
    ConfigErrors,
    SourceErrors,
}

const COUNTER_COUNT: usize = 24;

impl Counter {
    pub const ALL: [Counter; COUNTER_COUNT] = [
        Counter::FramesCaptured,
        Counter::FramesAccepted,
        Counter::QualityRejected,
        Counter::QualitySignalMissing,
        Counter::FacesDetected,
        Counter::InferenceErrors,
        Counter::DecisionsEmitted,
        Counter::EnqueueFailures,
        Counter::CacheSyncs,
        Counter::CacheSyncFailures,
        Counter::DeliveriesAcked,
        Counter::DeliveryFailures,
        Counter::DeliveryRejected,
        Counter::CredentialRefreshes,
        Counter::CredentialRefreshFailures,
        Counter::CredentialExpired,
        Counter::CredentialRevoked,
        Counter::StorageCorruption,
        Counter::StorageErrors,
        Counter::FallbackRecordsSent,
        Counter::FallbackErrors,
        Counter::RetentionExpired,
        Counter::ConfigErrors,
        Counter::SourceErrors,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Counter::FramesCaptured => "frames_captured",
            Counter::FramesAccepted => "frames_accepted",
            Counter::QualityRejected => "quality_rejected",
            Counter::QualitySignalMissing => "quality_signal_missing",
            Counter::FacesDetected => "faces_detected",
            Counter::InferenceErrors => "inference_errors",
            Counter::DecisionsEmitted => "decisions_emitted",
            Counter::EnqueueFailures => "enqueue_failures",
            Counter::CacheSyncs => "cache_syncs",
            Counter::CacheSyncFailures => "cache_sync_failures",
            Counter::DeliveriesAcked => "deliveries_acked",
            Counter::DeliveryFailures => "delivery_failures",
            Counter::DeliveryRejected => "delivery_rejected",
            Counter::CredentialRefreshes => "credential_refreshes",
            Counter::CredentialRefreshFailures => "credential_refresh_failures",
            Counter::CredentialExpired => "credential_expired",
            Counter::CredentialRevoked => "credential_revoked",
            Counter::StorageCorruption => "storage_corruption",
            Counter::StorageErrors => "storage_errors",
            Counter::FallbackRecordsSent => "fallback_records_sent",
            Counter::FallbackErrors => "fallback_errors",
            Counter::RetentionExpired => "retention_expired",
            Counter::ConfigErrors => "config_errors",
            Counter::SourceErrors => "source_errors",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug)]
pub struct Health {
    counts: [AtomicU64; COUNTER_COUNT],
}

impl Health {
    pub fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, n: u64) {
        self.counts[counter.index()].fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counts[counter.index()].load(Ordering::Relaxed)
    }

    /// Count a contained failure under its taxonomy counter.
    pub fn record(&self, err: &AgentError) {
        self.incr(err.health_counter());
    }

    pub fn report(&self) -> HealthReport {
        let counters = Counter::ALL
            .iter()
            .map(|c| (c.name(), self.get(*c)))
            .collect();
        HealthReport { counters }
    }
}

impl Default for Health {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct HealthReport {
    pub counters: BTreeMap<&'static str, u64>,
}

impl HealthReport {
    /// Compact `name=value` rendering of the non-zero counters, for log lines.
    pub fn summary(&self) -> String {
        let parts: Vec<String> = self
            .counters
            .iter()
            .filter(|(_, v)| **v > 0)
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        if parts.is_empty() {
            "idle".to_string()
        } else {
            parts.join(" ")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_indices_match_table() {
        for (i, counter) in Counter::ALL.iter().enumerate() {
            assert_eq!(counter.index(), i, "{:?} out of order", counter);
        }
    }

    #[test]
    fn record_counts_errors_by_kind() {
        let health = Health::new();
        health.record(&AgentError::Inference("timeout".into()));
        health.record(&AgentError::Inference("shape".into()));
        health.record(&AgentError::CredentialRevoked);
        assert_eq!(health.get(Counter::InferenceErrors), 2);
        assert_eq!(health.get(Counter::CredentialRevoked), 1);

        let report = health.report();
        assert_eq!(report.counters["inference_errors"], 2);
        assert_eq!(report.summary(), "credential_revoked=1 inference_errors=2");
    }

    #[test]
    fn empty_report_is_idle() {
        assert_eq!(Health::new().report().summary(), "idle");
    }
}
