//! Fallback transport over the low-bandwidth uplink.
//!
//! While the primary transport has been failing for longer than the outage
//! threshold, every unacknowledged entry not yet sent via fallback goes out
//! as a compact record, oldest first. Outside an outage only entries that
//! exhausted their primary attempts are sent. Sent entries are tagged in the
//! queue; primary delivery continues for them at the reduced rate.

pub mod codec;
mod uplink;

use std::sync::Arc;

use crate::error::AgentResult;
use crate::health::{Counter, Health};
use crate::queue::{DecisionQueue, FallbackScope};
use crate::sync::OutageTracker;
use crate::Clock;

pub use codec::{decode_batch, encode_batch, CodecError, CompactRecord, RECORD_LEN};
pub use uplink::{MqttUplink, Uplink};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FallbackReport {
    pub scope: Option<FallbackScope>,
    pub records_sent: usize,
    pub payloads_sent: usize,
    pub errors: usize,
}

pub struct FallbackTransport {
    device_id: String,
    queue: Arc<DecisionQueue>,
    outage: Arc<OutageTracker>,
    uplink: Box<dyn Uplink>,
    health: Arc<Health>,
    clock: Arc<dyn Clock>,
    max_records_per_run: usize,
    was_active: bool,
}

impl FallbackTransport {
    pub fn new(
        device_id: &str,
        queue: Arc<DecisionQueue>,
        outage: Arc<OutageTracker>,
        uplink: Box<dyn Uplink>,
        health: Arc<Health>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        log::info!(
            "fallback: records for {} carry device hint {}",
            device_id,
            hex::encode(codec::device_hint(device_id))
        );
        Self {
            device_id: device_id.to_string(),
            queue,
            outage,
            uplink,
            health,
            clock,
            max_records_per_run: 64,
            was_active: false,
        }
    }

    pub fn with_max_records_per_run(mut self, n: usize) -> Self {
        self.max_records_per_run = n.max(1);
        self
    }

    /// One fallback pass. Uplink errors are counted and end the pass; a
    /// storage error is counted and returned.
    pub fn run_once(&mut self) -> AgentResult<FallbackReport> {
        let now = self.clock.now_ms();
        let active = self.outage.is_active(now);
        if active != self.was_active {
            if active {
                log::warn!(
                    "fallback: primary failing for {}ms; activating {} uplink",
                    self.outage.failing_for(now).unwrap_or(0),
                    self.uplink.name()
                );
            } else {
                log::info!("fallback: primary recovered; uplink limited to exhausted entries");
            }
            self.was_active = active;
        }
        let scope = if active {
            FallbackScope::AllUnsent
        } else {
            FallbackScope::Exhausted
        };

        let mut report = FallbackReport {
            scope: Some(scope),
            ..FallbackReport::default()
        };
        let outcome = self.send_pass(scope, &mut report);
        self.health
            .add(Counter::FallbackRecordsSent, report.records_sent as u64);
        if let Err(err) = outcome {
            self.health.record(&err);
            return Err(err);
        }
        if report.records_sent > 0 {
            log::info!(
                "fallback: sent {} records in {} payloads ({:?})",
                report.records_sent,
                report.payloads_sent,
                scope
            );
        }
        Ok(report)
    }

    fn send_pass(&mut self, scope: FallbackScope, report: &mut FallbackReport) -> AgentResult<()> {
        let entries = self
            .queue
            .drain_for_fallback(self.max_records_per_run, scope)?;
        if entries.is_empty() {
            return Ok(());
        }

        let mut event_ids = Vec::with_capacity(entries.len());
        let mut records = Vec::with_capacity(entries.len());
        for entry in &entries {
            match CompactRecord::from_decision(&entry.record, &self.device_id) {
                Ok(record) => {
                    event_ids.push(entry.event_id());
                    records.push(record);
                }
                Err(err) => {
                    // Skipped from now on so it cannot hold the head of the batch.
                    self.health.incr(Counter::FallbackErrors);
                    log::warn!("fallback: cannot encode {}: {}", entry.event_id(), err);
                    self.queue
                        .exclude_from_fallback(entry.event_id(), &format!("fallback: {}", err))?;
                    report.errors += 1;
                }
            }
        }

        let payloads = match codec::encode_batch(&records, self.uplink.payload_ceiling()) {
            Ok(payloads) => payloads,
            Err(err) => {
                self.health.incr(Counter::FallbackErrors);
                log::error!("fallback: {}", err);
                report.errors += 1;
                return Ok(());
            }
        };

        let mut pending_ids = event_ids.into_iter();
        for payload in payloads {
            if let Err(err) = self.uplink.send(&payload) {
                self.health.incr(Counter::FallbackErrors);
                log::warn!("fallback: {} uplink send failed: {:#}", self.uplink.name(), err);
                report.errors += 1;
                break;
            }
            report.payloads_sent += 1;
            for event_id in pending_ids.by_ref().take(payload.len() / RECORD_LEN) {
                if self.queue.mark_fallback_sent(event_id)? {
                    report.records_sent += 1;
                }
            }
        }
        Ok(())
    }
}
