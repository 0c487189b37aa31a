use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::CacheDelta;
use crate::DecisionRecord;

/// Wire-level failure from the backend or the credential service.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("server error (status {status})")]
    Server { status: u16 },

    /// Bearer token refused; usually expired. Re-authenticate and retry.
    #[error("unauthorized")]
    Unauthorized,

    /// Device secret or token revoked. Requires re-provisioning.
    #[error("credential revoked")]
    Revoked,

    /// The backend refused this request on its merits.
    #[error("rejected ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout
                | TransportError::Network(_)
                | TransportError::Server { .. }
                | TransportError::Unauthorized
                | TransportError::Malformed(_)
        )
    }
}

/// Incremental cache query scoped to one location.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeltaQuery {
    pub location_id: String,
    pub updated_since: u64,
    pub cursor: Option<String>,
    pub limit: usize,
}

/// One page of a delta. `next_cursor` is set while more pages remain.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct DeltaPage {
    pub delta: CacheDelta,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Backend acknowledgment for a delivered decision.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Receipt {
    pub receipt_id: String,
}

/// Primary backend surface used by `SyncClient`.
pub trait BackendClient: Send + Sync {
    fn fetch_delta(&self, bearer: &str, query: &DeltaQuery) -> Result<DeltaPage, TransportError>;

    fn submit_decision(
        &self,
        bearer: &str,
        device_id: &str,
        record: &DecisionRecord,
    ) -> Result<Receipt, TransportError>;
}
