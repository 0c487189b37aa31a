//! edge_agentd - biometric access-control edge agent
//!
//! This daemon:
//! 1. Opens the durable decision queue and the embedding cache
//! 2. Runs capture -> quality gate -> detect -> embed -> match -> enqueue
//! 3. Syncs the cache and delivers decisions over the primary transport
//! 4. Falls back to the compact uplink during a sustained outage

use anyhow::{anyhow, Context, Result};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use edge_agent::config::{self, AgentConfig};
use edge_agent::ingest::open_source;
use edge_agent::sync::SyncSettings;
use edge_agent::{
    BackendRegistry, CaptureLoop, Clock, CredentialManager, DecisionQueue, Detector, Embedder,
    EmbeddingCache, FallbackTransport, Health, HttpBackend, InferenceWorker, Matcher, MqttUplink,
    Orchestrator, OutageTracker, QualityGate, Schedule, SyncClient, SystemClock,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = AgentConfig::load().context("load agent configuration")?;
    let secret = config::device_secret_from_env()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let health = Arc::new(Health::new());

    // Without a durable queue no decision may be emitted.
    let queue = Arc::new(
        DecisionQueue::open(&cfg.db_path, cfg.queue.settings(), clock.clone(), health.clone())
            .with_context(|| format!("open decision queue at {}", cfg.db_path))?,
    );
    let cache = Arc::new(
        EmbeddingCache::open(
            &cfg.db_path,
            &cfg.location_id,
            cfg.cache.refs_per_identity,
            health.clone(),
        )
        .with_context(|| format!("open embedding cache at {}", cfg.db_path))?,
    );

    let http = Arc::new(HttpBackend::new(&cfg.backend.endpoint, cfg.backend.timeout));
    let credentials = Arc::new(
        CredentialManager::new(
            &cfg.device_id,
            secret,
            http.clone(),
            clock.clone(),
            health.clone(),
            cfg.backend.refresh_margin.as_millis() as u64,
        )
        .with_sealed_store(&cfg.backend.credential_path),
    );
    let outage = Arc::new(OutageTracker::new(
        cfg.fallback.outage_threshold.as_millis() as u64,
    ));
    let sync = Arc::new(SyncClient::new(
        &cfg.device_id,
        http,
        credentials,
        cache.clone(),
        queue.clone(),
        outage.clone(),
        health.clone(),
        clock.clone(),
        SyncSettings {
            batch_size: cfg.queue.batch_size,
            max_pages: cfg.cache.max_pages,
            ..SyncSettings::default()
        },
    ));

    let mut registry = BackendRegistry::with_builtin();
    let backend = registry.take(&cfg.inference.backend)?;
    let worker = Arc::new(InferenceWorker::spawn(backend, cfg.inference.timeout)?);
    log::info!(
        "inference backend={} model={} dim={}",
        worker.backend_name(),
        worker.model_version(),
        worker.embedding_dim()
    );

    let capture = CaptureLoop::new(
        QualityGate::new(cfg.quality),
        Detector::new(worker.clone(), cfg.inference.min_face_confidence),
        Embedder::new(worker.clone()),
        Matcher::new(cfg.matcher, cfg.mode),
        cache,
        queue.clone(),
        health.clone(),
        clock.clone(),
    );
    let source = open_source(&cfg.source, clock.clone())?;

    let schedule = Schedule {
        frame_interval: Duration::from_millis(1_000 / u64::from(cfg.source.target_fps.max(1))),
        sync_interval: cfg.cache.sync_interval,
        fallback_interval: cfg.fallback.interval,
        ..Schedule::default()
    };
    let mut orchestrator = Orchestrator::new(
        source,
        capture,
        sync,
        queue.clone(),
        worker,
        health.clone(),
        clock.clone(),
        schedule,
    );
    if cfg.fallback.enabled {
        let uplink = MqttUplink::connect(
            &cfg.fallback.broker_addr,
            &format!("edge-agent-{}", cfg.device_id),
            &cfg.fallback.topic,
            cfg.fallback.payload_ceiling,
        )?;
        orchestrator = orchestrator.with_fallback(FallbackTransport::new(
            &cfg.device_id,
            queue.clone(),
            outage,
            Box::new(uplink),
            health.clone(),
            clock,
        ));
    }

    let handle = orchestrator.spawn()?;
    let stats = queue.stats()?;
    log::info!(
        "edge_agentd running. device={} location={} mode={} db={} pending={}",
        cfg.device_id,
        cfg.location_id,
        cfg.mode,
        cfg.db_path,
        stats.pending
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("edge_agentd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping tasks...");
    handle.stop();
    Ok(())
}
