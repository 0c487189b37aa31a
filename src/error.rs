//! Error taxonomy for the agent pipeline.
//!
//! Component-local failures are contained by the caller and counted through
//! `Health`; only storage initialization at startup is fatal to the process.

use thiserror::Error;

use crate::health::Counter;

#[derive(Debug, Error)]
pub enum AgentError {
    /// A required per-frame quality signal was absent. Treated as a reject.
    #[error("quality signal missing: {0}")]
    QualitySignalMissing(&'static str),

    /// The external inference interface failed, timed out, or returned a
    /// malformed result. The frame is dropped.
    #[error("inference error: {0}")]
    Inference(String),

    /// Cache refresh failed; the previous snapshot stays authoritative.
    #[error("cache sync failure: {0}")]
    CacheSyncFailure(String),

    /// Retryable delivery failure over the primary transport.
    #[error("delivery failure: {0}")]
    DeliveryFailure(String),

    /// The backend refused this record. Terminal for the record; archived.
    #[error("delivery rejected for {event_id}: {reason}")]
    DeliveryRejected { event_id: String, reason: String },

    /// The bearer token expired; re-authenticate before the next attempt.
    #[error("credential expired")]
    CredentialExpired,

    /// Token refresh failed for a retryable reason (network, timeout, 5xx).
    #[error("credential refresh failed: {0}")]
    CredentialRefresh(String),

    /// The device secret or token was revoked. Requires re-provisioning.
    #[error("credential revoked; device must be re-provisioned")]
    CredentialRevoked,

    /// A single stored entry could not be decoded. Quarantined; pipeline continues.
    #[error("storage corruption in {key}: {detail}")]
    StorageCorruption { key: String, detail: String },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type AgentResult<T> = std::result::Result<T, AgentError>;

impl AgentError {
    /// Health counter that records this failure.
    pub fn health_counter(&self) -> Counter {
        match self {
            AgentError::QualitySignalMissing(_) => Counter::QualitySignalMissing,
            AgentError::Inference(_) => Counter::InferenceErrors,
            AgentError::CacheSyncFailure(_) => Counter::CacheSyncFailures,
            AgentError::DeliveryFailure(_) => Counter::DeliveryFailures,
            AgentError::DeliveryRejected { .. } => Counter::DeliveryRejected,
            AgentError::CredentialExpired => Counter::CredentialExpired,
            AgentError::CredentialRefresh(_) => Counter::CredentialRefreshFailures,
            AgentError::CredentialRevoked => Counter::CredentialRevoked,
            AgentError::StorageCorruption { .. } => Counter::StorageCorruption,
            AgentError::Storage(_) => Counter::StorageErrors,
            AgentError::Config(_) => Counter::ConfigErrors,
        }
    }

    /// True when the same operation may succeed if attempted again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::Inference(_)
                | AgentError::CacheSyncFailure(_)
                | AgentError::DeliveryFailure(_)
                | AgentError::CredentialExpired
                | AgentError::CredentialRefresh(_)
                | AgentError::Storage(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_and_revocation_are_terminal() {
        let rejected = AgentError::DeliveryRejected {
            event_id: "01J0".to_string(),
            reason: "malformed".to_string(),
        };
        assert!(!rejected.is_retryable());
        assert!(!AgentError::CredentialRevoked.is_retryable());
        assert!(AgentError::CredentialExpired.is_retryable());
        assert!(AgentError::DeliveryFailure("timeout".into()).is_retryable());
    }

    #[test]
    fn every_variant_maps_to_a_counter() {
        let err = AgentError::StorageCorruption {
            key: "outbox:1".into(),
            detail: "bad json".into(),
        };
        assert_eq!(err.health_counter(), Counter::StorageCorruption);
        assert_eq!(
            AgentError::QualitySignalMissing("blur").health_counter(),
            Counter::QualitySignalMissing
        );
        assert!(format!("{}", err).contains("outbox:1"));
    }
}
