//! Primary transport: cache pull and decision push.
//!
//! `SyncClient` is driven by the orchestrator's sync and delivery tasks.
//! Only delivery outcomes feed the `OutageTracker` that gates the fallback
//! uplink.

mod backend;
mod http;
mod outage;

use std::sync::Arc;

use crate::cache::{CacheDelta, EmbeddingCache, MergeReport};
use crate::credential::CredentialManager;
use crate::error::{AgentError, AgentResult};
use crate::health::{Counter, Health};
use crate::queue::DecisionQueue;
use crate::Clock;

pub use backend::{BackendClient, DeltaPage, DeltaQuery, Receipt, TransportError};
pub use http::HttpBackend;
pub use outage::OutageTracker;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncSettings {
    /// Entries attempted per delivery pass.
    pub batch_size: usize,
    /// Page size requested per delta query.
    pub page_limit: usize,
    /// Pages collected before a pull gives up.
    pub max_pages: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: 16,
            page_limit: 256,
            max_pages: 20,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PushReport {
    pub attempted: usize,
    pub acked: usize,
    pub failed: usize,
    pub rejected: usize,
}

pub struct SyncClient {
    device_id: String,
    backend: Arc<dyn BackendClient>,
    credentials: Arc<CredentialManager>,
    cache: Arc<EmbeddingCache>,
    queue: Arc<DecisionQueue>,
    outage: Arc<OutageTracker>,
    health: Arc<Health>,
    clock: Arc<dyn Clock>,
    settings: SyncSettings,
}

impl SyncClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device_id: &str,
        backend: Arc<dyn BackendClient>,
        credentials: Arc<CredentialManager>,
        cache: Arc<EmbeddingCache>,
        queue: Arc<DecisionQueue>,
        outage: Arc<OutageTracker>,
        health: Arc<Health>,
        clock: Arc<dyn Clock>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            backend,
            credentials,
            cache,
            queue,
            outage,
            health,
            clock,
            settings,
        }
    }

    pub fn outage(&self) -> &Arc<OutageTracker> {
        &self.outage
    }

    /// Fetch everything newer than the cache watermark and merge it once.
    ///
    /// All pages are collected before the merge, so a failure part way
    /// leaves the previous snapshot untouched. Failures are counted here;
    /// credential failures are counted by the `CredentialManager`.
    pub fn pull(&self) -> AgentResult<MergeReport> {
        let bearer = self.credentials.bearer()?;
        self.pull_with(&bearer).map_err(|err| self.counted(err))
    }

    fn pull_with(&self, bearer: &str) -> AgentResult<MergeReport> {
        let location_id = self.cache.location_id().to_string();
        let mut query = DeltaQuery {
            location_id: location_id.clone(),
            updated_since: self.cache.as_of(),
            cursor: None,
            limit: self.settings.page_limit,
        };
        let mut merged = CacheDelta {
            location_id,
            as_of: 0,
            references: Vec::new(),
            revoked: Vec::new(),
        };

        let mut complete = false;
        for _ in 0..self.settings.max_pages.max(1) {
            let page = self
                .backend
                .fetch_delta(bearer, &query)
                .map_err(|e| self.pull_error(e))?;
            if page.delta.location_id != merged.location_id {
                return Err(AgentError::CacheSyncFailure(format!(
                    "backend returned location {} for {}",
                    page.delta.location_id, merged.location_id
                )));
            }
            fold_page(&mut merged, page.delta);
            match page.next_cursor {
                Some(cursor) => query.cursor = Some(cursor),
                None => {
                    complete = true;
                    break;
                }
            }
        }
        if !complete {
            return Err(AgentError::CacheSyncFailure(format!(
                "delta still incomplete after {} pages",
                self.settings.max_pages
            )));
        }

        let report = self.cache.apply_delta(&merged)?;
        self.health.incr(Counter::CacheSyncs);
        if report.changed() {
            log::info!(
                "sync: cache v{} as_of={} +{} -{} revoked={} skipped={}",
                report.version,
                self.cache.as_of(),
                report.inserted,
                report.evicted,
                report.revoked,
                report.skipped
            );
        }
        Ok(report)
    }

    /// Record a failure in the health surface. Revocation is counted once,
    /// when the `CredentialManager` enters its provisioning state.
    fn counted(&self, err: AgentError) -> AgentError {
        if !matches!(err, AgentError::CredentialRevoked) {
            self.health.record(&err);
        }
        err
    }

    fn pull_error(&self, err: TransportError) -> AgentError {
        match err {
            TransportError::Unauthorized => {
                self.credentials.invalidate();
                AgentError::CredentialExpired
            }
            TransportError::Revoked => {
                self.credentials.revoke();
                AgentError::CredentialRevoked
            }
            other => AgentError::CacheSyncFailure(other.to_string()),
        }
    }

    /// Deliver one batch of due entries over the primary transport.
    ///
    /// A retryable failure reschedules that entry and ends the batch; a
    /// rejection archives the entry and moves on.
    pub fn push(&self) -> AgentResult<PushReport> {
        let entries = self
            .queue
            .drain(self.settings.batch_size)
            .map_err(|err| self.counted(err))?;
        let mut report = PushReport::default();
        if entries.is_empty() {
            return Ok(report);
        }
        let bearer = match self.credentials.bearer() {
            Ok(bearer) => bearer,
            Err(err @ AgentError::CredentialRefresh(_)) => {
                self.outage.record_failure(self.clock.now_ms());
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        for entry in entries {
            let event_id = entry.event_id().to_string();
            report.attempted += 1;
            match self
                .backend
                .submit_decision(&bearer, &self.device_id, &entry.record)
            {
                Ok(receipt) => {
                    self.queue
                        .ack(&event_id, &receipt.receipt_id)
                        .map_err(|err| self.counted(err))?;
                    self.outage.record_success();
                    self.health.incr(Counter::DeliveriesAcked);
                    report.acked += 1;
                }
                Err(TransportError::Rejected { code, message }) => {
                    let reason = format!("{}: {}", code, message);
                    self.queue
                        .archive(&event_id, &reason)
                        .map_err(|err| self.counted(err))?;
                    self.outage.record_success();
                    let err = AgentError::DeliveryRejected {
                        event_id: event_id.clone(),
                        reason,
                    };
                    log::warn!("sync: {}", err);
                    self.health.record(&err);
                    report.rejected += 1;
                }
                Err(TransportError::Unauthorized) => {
                    self.credentials.invalidate();
                    self.queue
                        .fail(&event_id, "unauthorized")
                        .map_err(|err| self.counted(err))?;
                    self.health.record(&AgentError::CredentialExpired);
                    report.failed += 1;
                    break;
                }
                Err(TransportError::Revoked) => {
                    self.credentials.revoke();
                    return Err(AgentError::CredentialRevoked);
                }
                Err(err) => {
                    let detail = err.to_string();
                    let next = self
                        .queue
                        .fail(&event_id, &detail)
                        .map_err(|err| self.counted(err))?;
                    self.outage.record_failure(self.clock.now_ms());
                    let err = AgentError::DeliveryFailure(detail);
                    log::warn!("sync: {} (next attempt at {:?})", err, next);
                    self.health.record(&err);
                    report.failed += 1;
                    break;
                }
            }
        }
        Ok(report)
    }
}

/// Append one page to the merged delta, honouring page order for
/// revocations.
fn fold_page(merged: &mut CacheDelta, page: CacheDelta) {
    merged.as_of = merged.as_of.max(page.as_of);
    for revoked in page.revoked {
        merged.references.retain(|r| r.identity_id != revoked);
        if !merged.revoked.contains(&revoked) {
            merged.revoked.push(revoked);
        }
    }
    merged.references.extend(page.references);
}
