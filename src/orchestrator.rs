//! Task scheduling.
//!
//! The capture path runs on its own thread and never waits on the network.
//! Cache sync, primary delivery and the fallback uplink each run on their
//! own thread and interval. All tasks share one shutdown flag; an in-flight
//! inference call gets a bounded grace period on stop.
//!
//! `SyncClient` and `FallbackTransport` count their own failures; the task
//! loops here only log what they return.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::cache::EmbeddingCache;
use crate::detect::{Detector, Embedder, InferenceWorker};
use crate::error::AgentError;
use crate::fallback::FallbackTransport;
use crate::frame::Frame;
use crate::health::{Counter, Health};
use crate::ingest::FrameSource;
use crate::matcher::Matcher;
use crate::quality::QualityGate;
use crate::queue::{BackoffPolicy, DecisionQueue};
use crate::sync::{OutageTracker, SyncClient};
use crate::{Clock, DecisionRecord};

const SLEEP_SLICE: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct Schedule {
    pub frame_interval: Duration,
    pub sync_interval: Duration,
    pub delivery_interval: Duration,
    pub fallback_interval: Duration,
    pub purge_interval: Duration,
    pub health_log_interval: Duration,
    pub shutdown_grace: Duration,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(100),
            sync_interval: Duration::from_secs(60),
            delivery_interval: Duration::from_secs(1),
            fallback_interval: Duration::from_secs(30),
            purge_interval: Duration::from_secs(600),
            health_log_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

/// The synchronous perception path: gate, detect, embed, match, enqueue.
pub struct CaptureLoop {
    gate: QualityGate,
    detector: Detector,
    embedder: Embedder,
    matcher: Matcher,
    cache: Arc<EmbeddingCache>,
    queue: Arc<DecisionQueue>,
    health: Arc<Health>,
    clock: Arc<dyn Clock>,
}

impl CaptureLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gate: QualityGate,
        detector: Detector,
        embedder: Embedder,
        matcher: Matcher,
        cache: Arc<EmbeddingCache>,
        queue: Arc<DecisionQueue>,
        health: Arc<Health>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            gate,
            detector,
            embedder,
            matcher,
            cache,
            queue,
            health,
            clock,
        }
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    /// Run one frame through the pipeline.
    ///
    /// Returns the decision this frame completed, after it has been handed
    /// to the queue. Every per-frame failure is counted and drops the frame.
    pub fn process_frame(&mut self, frame: &Frame) -> Option<DecisionRecord> {
        self.health.incr(Counter::FramesCaptured);
        let assessment = match self.gate.evaluate(&frame.signals) {
            Ok(a) => a,
            Err(err) => {
                self.health.record(&err);
                log::debug!("capture: frame {} dropped: {}", frame.sequence, err);
                return self.tick(frame.captured_at);
            }
        };
        if !assessment.accepted {
            self.health.incr(Counter::QualityRejected);
            log::debug!(
                "capture: frame {} rejected ({})",
                frame.sequence,
                assessment.reason.unwrap_or("quality")
            );
            return self.tick(frame.captured_at);
        }
        self.health.incr(Counter::FramesAccepted);

        let regions = match self.detector.detect(frame.image()) {
            Ok(regions) => regions,
            Err(err) => return self.contain(frame, err),
        };
        // Sorted by confidence; only the most confident face is matched.
        let Some(region) = regions.first() else {
            return self.tick(frame.captured_at);
        };
        self.health.incr(Counter::FacesDetected);

        let probe = match self.embedder.embed(frame.image(), region) {
            Ok(probe) => probe,
            Err(err) => return self.contain(frame, err),
        };
        let snapshot = self.cache.snapshot();
        let decision =
            self.matcher
                .observe(&snapshot, &probe, frame.captured_at, self.clock.now_ms())?;
        Some(self.emit(decision))
    }

    /// Close an attempt whose window has elapsed without a deciding frame.
    pub fn tick(&mut self, now: u64) -> Option<DecisionRecord> {
        let decision = self.matcher.poll(now)?;
        Some(self.emit(decision))
    }

    fn contain(&mut self, frame: &Frame, err: AgentError) -> Option<DecisionRecord> {
        self.health.record(&err);
        log::warn!("capture: frame {} dropped: {}", frame.sequence, err);
        self.tick(frame.captured_at)
    }

    fn emit(&self, decision: DecisionRecord) -> DecisionRecord {
        self.health.incr(Counter::DecisionsEmitted);
        match self.queue.enqueue(&decision) {
            Ok(_) => log::info!(
                "decision {} {} identity={} similarity={:?} reason={}",
                decision.event_id,
                decision.decision,
                decision.identity_id.as_deref().unwrap_or("-"),
                decision.similarity,
                decision.reason.as_deref().unwrap_or("-")
            ),
            Err(err) => {
                self.health.incr(Counter::EnqueueFailures);
                log::error!("decision {} not persisted: {}", decision.event_id, err);
            }
        }
        decision
    }
}

pub struct Orchestrator {
    source: Box<dyn FrameSource>,
    capture: CaptureLoop,
    sync: Arc<SyncClient>,
    queue: Arc<DecisionQueue>,
    fallback: Option<FallbackTransport>,
    worker: Arc<InferenceWorker>,
    health: Arc<Health>,
    clock: Arc<dyn Clock>,
    schedule: Schedule,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Box<dyn FrameSource>,
        capture: CaptureLoop,
        sync: Arc<SyncClient>,
        queue: Arc<DecisionQueue>,
        worker: Arc<InferenceWorker>,
        health: Arc<Health>,
        clock: Arc<dyn Clock>,
        schedule: Schedule,
    ) -> Self {
        Self {
            source,
            capture,
            sync,
            queue,
            fallback: None,
            worker,
            health,
            clock,
            schedule,
        }
    }

    pub fn with_fallback(mut self, fallback: FallbackTransport) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Start every task. The returned handle stops them.
    pub fn spawn(self) -> Result<AgentHandle> {
        let Orchestrator {
            mut source,
            capture,
            sync,
            queue,
            fallback,
            worker,
            health,
            clock,
            schedule,
        } = self;
        source.connect().context("connect frame source")?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::new();

        threads.push(spawn_task("capture", {
            let shutdown = shutdown.clone();
            let health = health.clone();
            let schedule = schedule.clone();
            let outage = sync.outage().clone();
            move || capture_task(source, capture, outage, health, clock, schedule, shutdown)
        })?);
        threads.push(spawn_task("cache-sync", {
            let shutdown = shutdown.clone();
            let sync = sync.clone();
            let schedule = schedule.clone();
            move || sync_task(sync, schedule, shutdown)
        })?);
        threads.push(spawn_task("delivery", {
            let shutdown = shutdown.clone();
            let schedule = schedule.clone();
            let health = health.clone();
            move || delivery_task(sync, queue, health, schedule, shutdown)
        })?);
        if let Some(fallback) = fallback {
            threads.push(spawn_task("fallback", {
                let shutdown = shutdown.clone();
                let interval = schedule.fallback_interval;
                move || fallback_task(fallback, interval, shutdown)
            })?);
        } else {
            log::info!("fallback uplink disabled");
        }

        Ok(AgentHandle {
            shutdown,
            threads,
            worker,
            health,
            grace: schedule.shutdown_grace,
        })
    }
}

pub struct AgentHandle {
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    worker: Arc<InferenceWorker>,
    health: Arc<Health>,
    grace: Duration,
}

impl AgentHandle {
    pub fn is_running(&self) -> bool {
        !self.shutdown.load(Ordering::SeqCst) && self.threads.iter().any(|t| !t.is_finished())
    }

    pub fn health(&self) -> &Arc<Health> {
        &self.health
    }

    /// Signal every task, let in-flight inference finish within the grace
    /// period, then join.
    pub fn stop(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if !self.worker.shutdown(self.grace) {
            log::warn!("shutdown: inference call abandoned after {:?}", self.grace);
        }
        for handle in self.threads {
            let name = handle.thread().name().unwrap_or("task").to_string();
            if handle.join().is_err() {
                log::error!("shutdown: {} task panicked", name);
            }
        }
        log::info!("agent stopped: {}", self.health.report().summary());
    }
}

fn spawn_task<F>(name: &str, f: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .with_context(|| format!("spawn {} task", name))
}

/// Sleep up to `total`, waking early on shutdown. Returns false on shutdown.
fn sleep_while_running(total: Duration, shutdown: &AtomicBool) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

fn log_health(
    source: &dyn FrameSource,
    capture: &CaptureLoop,
    outage: &OutageTracker,
    health: &Health,
    now: u64,
) {
    let stats = source.stats();
    let snapshot = capture.cache.snapshot();
    let pending = match capture.queue.stats() {
        Ok(q) => q.pending.to_string(),
        Err(err) => {
            log::error!("health: queue stats unavailable: {}", err);
            "?".to_string()
        }
    };
    log::info!(
        "health source={} frames={} cache=v{} as_of={} refs={} pending={} outage={} | {}",
        if source.is_healthy() { "ok" } else { "degraded" },
        stats.frames_captured,
        snapshot.version,
        snapshot.as_of,
        snapshot.reference_count(),
        pending,
        match outage.failing_for(now) {
            Some(ms) if outage.is_active(now) => format!("active({}s)", ms / 1_000),
            Some(ms) => format!("failing({}s)", ms / 1_000),
            None => "none".to_string(),
        },
        health.report().summary()
    );
}

fn capture_task(
    mut source: Box<dyn FrameSource>,
    mut capture: CaptureLoop,
    outage: Arc<OutageTracker>,
    health: Arc<Health>,
    clock: Arc<dyn Clock>,
    schedule: Schedule,
    shutdown: Arc<AtomicBool>,
) {
    let mut last_health_log = Instant::now();
    while !shutdown.load(Ordering::SeqCst) {
        let started = Instant::now();
        match source.next_frame() {
            Ok(frame) => {
                capture.process_frame(&frame);
            }
            Err(err) => {
                health.incr(Counter::SourceErrors);
                log::warn!("capture: source error: {:#}", err);
                capture.tick(clock.now_ms());
            }
        }

        if last_health_log.elapsed() >= schedule.health_log_interval {
            log_health(source.as_ref(), &capture, &outage, &health, clock.now_ms());
            last_health_log = Instant::now();
        }

        let remaining = schedule.frame_interval.saturating_sub(started.elapsed());
        if !sleep_while_running(remaining, &shutdown) {
            break;
        }
    }
}

fn sync_task(sync: Arc<SyncClient>, schedule: Schedule, shutdown: Arc<AtomicBool>) {
    let retry = BackoffPolicy::new(1_000, schedule.sync_interval.as_millis() as u64);
    let mut failures: u32 = 0;
    loop {
        let wait = match sync.pull() {
            Ok(_) => {
                failures = 0;
                schedule.sync_interval
            }
            Err(AgentError::CredentialRevoked) => {
                log::error!("cache-sync: paused until the device is re-provisioned");
                schedule.sync_interval
            }
            Err(err) => {
                failures = failures.saturating_add(1);
                log::warn!("cache-sync: {} (attempt {}); keeping current snapshot", err, failures);
                Duration::from_millis(retry.raw_delay_ms(failures))
            }
        };
        if !sleep_while_running(wait, &shutdown) {
            break;
        }
    }
}

fn delivery_task(
    sync: Arc<SyncClient>,
    queue: Arc<DecisionQueue>,
    health: Arc<Health>,
    schedule: Schedule,
    shutdown: Arc<AtomicBool>,
) {
    let mut last_purge: Option<Instant> = None;
    loop {
        match sync.push() {
            Ok(report) if report.attempted > 0 => log::debug!(
                "delivery: attempted={} acked={} failed={} rejected={}",
                report.attempted,
                report.acked,
                report.failed,
                report.rejected
            ),
            Ok(_) => {}
            Err(AgentError::CredentialRevoked) => {
                log::error!("delivery: credential revoked; primary transport paused");
            }
            Err(err) => log::warn!("delivery: {}", err),
        }

        if last_purge.map_or(true, |t| t.elapsed() >= schedule.purge_interval) {
            match queue.purge() {
                Ok(report) if report.delivered_removed > 0 => {
                    log::debug!("delivery: purged {} acknowledged entries", report.delivered_removed)
                }
                Ok(_) => {}
                Err(err) => {
                    health.record(&err);
                    log::warn!("delivery: purge failed: {}", err)
                }
            }
            last_purge = Some(Instant::now());
        }

        if !sleep_while_running(schedule.delivery_interval, &shutdown) {
            break;
        }
    }
}

fn fallback_task(mut fallback: FallbackTransport, interval: Duration, shutdown: Arc<AtomicBool>) {
    loop {
        match fallback.run_once() {
            Ok(report) if report.records_sent > 0 => log::info!(
                "fallback: sent {} records in {} payloads",
                report.records_sent,
                report.payloads_sent
            ),
            Ok(_) => {}
            Err(err) => log::warn!("fallback: {}", err),
        }
        if !sleep_while_running(interval, &shutdown) {
            break;
        }
    }
}
