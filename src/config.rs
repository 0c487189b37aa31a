use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::credential::DeviceSecret;
use crate::fallback::RECORD_LEN;
use crate::matcher::MatcherSettings;
use crate::quality::QualityThresholds;
use crate::queue::{BackoffPolicy, QueueSettings};
use crate::AccessMode;

pub const DEVICE_SECRET_ENV: &str = "EDGE_AGENT_DEVICE_SECRET";

const DEFAULT_DB_PATH: &str = "edge_agent.db";
const DEFAULT_SOURCE_URL: &str = "stub://door_camera";
const DEFAULT_SOURCE_FPS: u32 = 10;
const DEFAULT_SOURCE_WIDTH: u32 = 640;
const DEFAULT_SOURCE_HEIGHT: u32 = 480;
const DEFAULT_INFERENCE_BACKEND: &str = "stub";
const DEFAULT_MIN_FACE_CONFIDENCE: f32 = 0.7;
const DEFAULT_INFERENCE_TIMEOUT_MS: u64 = 500;
const DEFAULT_REFS_PER_IDENTITY: usize = 5;
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 60;
const DEFAULT_MAX_PAGES: usize = 20;
const DEFAULT_BASE_BACKOFF_MS: u64 = 1_000;
const DEFAULT_MAX_BACKOFF_MS: u64 = 300_000;
const DEFAULT_MAX_ATTEMPTS: u32 = 12;
const DEFAULT_RETENTION_SECS: u64 = 60 * 60 * 24 * 7;
const DEFAULT_BATCH_SIZE: usize = 16;
const DEFAULT_FALLBACK_PRIMARY_RETRY_MS: u64 = 900_000;
const DEFAULT_BACKEND_ENDPOINT: &str = "http://127.0.0.1:8080";
const DEFAULT_BACKEND_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_REFRESH_MARGIN_SECS: u64 = 120;
const DEFAULT_CREDENTIAL_PATH: &str = "edge_agent.cred";
const DEFAULT_OUTAGE_THRESHOLD_SECS: u64 = 300;
const DEFAULT_PAYLOAD_CEILING: usize = 51;
const DEFAULT_BROKER_ADDR: &str = "127.0.0.1:1883";
const DEFAULT_UPLINK_TOPIC: &str = "edge/uplink";
const DEFAULT_FALLBACK_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Deserialize, Default)]
struct AgentConfigFile {
    device_id: Option<String>,
    location_id: Option<String>,
    db_path: Option<String>,
    mode: Option<AccessMode>,
    source: Option<SourceConfigFile>,
    quality: Option<QualityConfigFile>,
    inference: Option<InferenceConfigFile>,
    matcher: Option<MatcherConfigFile>,
    cache: Option<CacheConfigFile>,
    queue: Option<QueueConfigFile>,
    backend: Option<BackendConfigFile>,
    fallback: Option<FallbackConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    url: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct QualityConfigFile {
    max_blur: Option<f32>,
    min_exposure: Option<f32>,
    max_exposure: Option<f32>,
    max_occlusion: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct InferenceConfigFile {
    backend: Option<String>,
    min_face_confidence: Option<f32>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct MatcherConfigFile {
    accept_threshold: Option<f32>,
    review_floor: Option<f32>,
    consensus_k: Option<usize>,
    window_ms: Option<u64>,
    cooldown_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct CacheConfigFile {
    refs_per_identity: Option<usize>,
    sync_interval_secs: Option<u64>,
    max_pages: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct QueueConfigFile {
    base_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    max_attempts: Option<u32>,
    retention_secs: Option<u64>,
    batch_size: Option<usize>,
    fallback_primary_retry_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct BackendConfigFile {
    endpoint: Option<String>,
    timeout_ms: Option<u64>,
    refresh_margin_secs: Option<u64>,
    credential_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct FallbackConfigFile {
    enabled: Option<bool>,
    outage_threshold_secs: Option<u64>,
    payload_ceiling: Option<usize>,
    broker_addr: Option<String>,
    topic: Option<String>,
    interval_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub device_id: String,
    pub location_id: String,
    pub db_path: String,
    pub mode: AccessMode,
    pub source: SourceSettings,
    pub quality: QualityThresholds,
    pub inference: InferenceSettings,
    pub matcher: MatcherSettings,
    pub cache: CacheSettings,
    pub queue: QueueConfig,
    pub backend: BackendSettings,
    pub fallback: FallbackSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSettings {
    pub url: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct InferenceSettings {
    pub backend: String,
    pub min_face_confidence: f32,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub refs_per_identity: usize,
    pub sync_interval: Duration,
    pub max_pages: usize,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_attempts: u32,
    pub retention: Duration,
    pub batch_size: usize,
    pub fallback_primary_retry_ms: u64,
}

impl QueueConfig {
    pub fn settings(&self) -> QueueSettings {
        QueueSettings {
            backoff: BackoffPolicy::new(self.base_backoff_ms, self.max_backoff_ms),
            max_attempts: self.max_attempts,
            retention_ms: self.retention.as_millis() as u64,
            fallback_primary_retry_ms: self.fallback_primary_retry_ms,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub endpoint: String,
    pub timeout: Duration,
    pub refresh_margin: Duration,
    pub credential_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct FallbackSettings {
    pub enabled: bool,
    pub outage_threshold: Duration,
    pub payload_ceiling: usize,
    pub broker_addr: String,
    pub topic: String,
    pub interval: Duration,
}

impl AgentConfig {
    /// Defaults, then the JSON file named by `EDGE_AGENT_CONFIG`, then
    /// `EDGE_AGENT_*` overrides, then validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("EDGE_AGENT_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: AgentConfigFile) -> Self {
        let source = file.source.unwrap_or_default();
        let quality = file.quality.unwrap_or_default();
        let inference = file.inference.unwrap_or_default();
        let matcher = file.matcher.unwrap_or_default();
        let cache = file.cache.unwrap_or_default();
        let queue = file.queue.unwrap_or_default();
        let backend = file.backend.unwrap_or_default();
        let fallback = file.fallback.unwrap_or_default();
        let quality_defaults = QualityThresholds::default();
        let matcher_defaults = MatcherSettings::default();

        Self {
            device_id: file.device_id.unwrap_or_default(),
            location_id: file.location_id.unwrap_or_default(),
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            mode: file.mode.unwrap_or_default(),
            source: SourceSettings {
                url: source.url.unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string()),
                target_fps: source.target_fps.unwrap_or(DEFAULT_SOURCE_FPS),
                width: source.width.unwrap_or(DEFAULT_SOURCE_WIDTH),
                height: source.height.unwrap_or(DEFAULT_SOURCE_HEIGHT),
            },
            quality: QualityThresholds {
                max_blur: quality.max_blur.unwrap_or(quality_defaults.max_blur),
                min_exposure: quality.min_exposure.unwrap_or(quality_defaults.min_exposure),
                max_exposure: quality.max_exposure.unwrap_or(quality_defaults.max_exposure),
                max_occlusion: quality
                    .max_occlusion
                    .unwrap_or(quality_defaults.max_occlusion),
            },
            inference: InferenceSettings {
                backend: inference
                    .backend
                    .unwrap_or_else(|| DEFAULT_INFERENCE_BACKEND.to_string()),
                min_face_confidence: inference
                    .min_face_confidence
                    .unwrap_or(DEFAULT_MIN_FACE_CONFIDENCE),
                timeout: Duration::from_millis(
                    inference.timeout_ms.unwrap_or(DEFAULT_INFERENCE_TIMEOUT_MS),
                ),
            },
            matcher: MatcherSettings {
                accept_threshold: matcher
                    .accept_threshold
                    .unwrap_or(matcher_defaults.accept_threshold),
                review_floor: matcher.review_floor.unwrap_or(matcher_defaults.review_floor),
                consensus_k: matcher.consensus_k.unwrap_or(matcher_defaults.consensus_k),
                window_ms: matcher.window_ms.unwrap_or(matcher_defaults.window_ms),
                cooldown_ms: matcher.cooldown_ms.unwrap_or(matcher_defaults.cooldown_ms),
            },
            cache: CacheSettings {
                refs_per_identity: cache.refs_per_identity.unwrap_or(DEFAULT_REFS_PER_IDENTITY),
                sync_interval: Duration::from_secs(
                    cache.sync_interval_secs.unwrap_or(DEFAULT_SYNC_INTERVAL_SECS),
                ),
                max_pages: cache.max_pages.unwrap_or(DEFAULT_MAX_PAGES),
            },
            queue: QueueConfig {
                base_backoff_ms: queue.base_backoff_ms.unwrap_or(DEFAULT_BASE_BACKOFF_MS),
                max_backoff_ms: queue.max_backoff_ms.unwrap_or(DEFAULT_MAX_BACKOFF_MS),
                max_attempts: queue.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
                retention: Duration::from_secs(
                    queue.retention_secs.unwrap_or(DEFAULT_RETENTION_SECS),
                ),
                batch_size: queue.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
                fallback_primary_retry_ms: queue
                    .fallback_primary_retry_ms
                    .unwrap_or(DEFAULT_FALLBACK_PRIMARY_RETRY_MS),
            },
            backend: BackendSettings {
                endpoint: backend
                    .endpoint
                    .unwrap_or_else(|| DEFAULT_BACKEND_ENDPOINT.to_string()),
                timeout: Duration::from_millis(
                    backend.timeout_ms.unwrap_or(DEFAULT_BACKEND_TIMEOUT_MS),
                ),
                refresh_margin: Duration::from_secs(
                    backend
                        .refresh_margin_secs
                        .unwrap_or(DEFAULT_REFRESH_MARGIN_SECS),
                ),
                credential_path: backend
                    .credential_path
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_CREDENTIAL_PATH)),
            },
            fallback: FallbackSettings {
                enabled: fallback.enabled.unwrap_or(true),
                outage_threshold: Duration::from_secs(
                    fallback
                        .outage_threshold_secs
                        .unwrap_or(DEFAULT_OUTAGE_THRESHOLD_SECS),
                ),
                payload_ceiling: fallback.payload_ceiling.unwrap_or(DEFAULT_PAYLOAD_CEILING),
                broker_addr: fallback
                    .broker_addr
                    .unwrap_or_else(|| DEFAULT_BROKER_ADDR.to_string()),
                topic: fallback
                    .topic
                    .unwrap_or_else(|| DEFAULT_UPLINK_TOPIC.to_string()),
                interval: Duration::from_secs(
                    fallback.interval_secs.unwrap_or(DEFAULT_FALLBACK_INTERVAL_SECS),
                ),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_string("EDGE_AGENT_DEVICE_ID") {
            self.device_id = v;
        }
        if let Some(v) = env_string("EDGE_AGENT_LOCATION_ID") {
            self.location_id = v;
        }
        if let Some(v) = env_string("EDGE_AGENT_DB_PATH") {
            self.db_path = v;
        }
        if let Some(v) = env_string("EDGE_AGENT_MODE") {
            self.mode = v.parse()?;
        }
        if let Some(v) = env_string("EDGE_AGENT_SOURCE_URL") {
            self.source.url = v;
        }
        if let Some(v) = env_string("EDGE_AGENT_INFERENCE_BACKEND") {
            self.inference.backend = v;
        }
        if let Some(v) = env_string("EDGE_AGENT_BACKEND_ENDPOINT") {
            self.backend.endpoint = v;
        }
        if let Some(v) = env_string("EDGE_AGENT_CREDENTIAL_PATH") {
            self.backend.credential_path = PathBuf::from(v);
        }
        if let Some(v) = env_string("EDGE_AGENT_ACCEPT_THRESHOLD") {
            self.matcher.accept_threshold = v
                .parse()
                .map_err(|_| anyhow!("EDGE_AGENT_ACCEPT_THRESHOLD must be a number"))?;
        }
        if let Some(v) = env_string("EDGE_AGENT_FALLBACK_ENABLED") {
            self.fallback.enabled = parse_bool(&v)
                .ok_or_else(|| anyhow!("EDGE_AGENT_FALLBACK_ENABLED must be true or false"))?;
        }
        if let Some(v) = env_string("EDGE_AGENT_OUTAGE_THRESHOLD_SECS") {
            let seconds: u64 = v.parse().map_err(|_| {
                anyhow!("EDGE_AGENT_OUTAGE_THRESHOLD_SECS must be an integer number of seconds")
            })?;
            self.fallback.outage_threshold = Duration::from_secs(seconds);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        crate::validate_identifier("device_id", &self.device_id)?;
        crate::validate_identifier("location_id", &self.location_id)?;

        let m = &self.matcher;
        for (name, v) in [
            ("matcher.accept_threshold", m.accept_threshold),
            ("matcher.review_floor", m.review_floor),
        ] {
            if !(-1.0..=1.0).contains(&v) {
                return Err(anyhow!("{} must be within [-1, 1]", name));
            }
        }
        if m.review_floor > m.accept_threshold {
            return Err(anyhow!("matcher.review_floor must not exceed accept_threshold"));
        }
        if m.consensus_k == 0 {
            return Err(anyhow!("matcher.consensus_k must be at least 1"));
        }
        if m.window_ms == 0 {
            return Err(anyhow!("matcher.window_ms must be greater than zero"));
        }

        let q = &self.quality;
        for (name, v) in [
            ("quality.max_blur", q.max_blur),
            ("quality.min_exposure", q.min_exposure),
            ("quality.max_exposure", q.max_exposure),
            ("quality.max_occlusion", q.max_occlusion),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(anyhow!("{} must be within [0, 1]", name));
            }
        }
        if q.min_exposure > q.max_exposure {
            return Err(anyhow!("quality.min_exposure must not exceed max_exposure"));
        }

        if !(0.0..=1.0).contains(&self.inference.min_face_confidence) {
            return Err(anyhow!("inference.min_face_confidence must be within [0, 1]"));
        }
        if self.inference.timeout.is_zero() || self.backend.timeout.is_zero() {
            return Err(anyhow!("timeouts must be greater than zero"));
        }
        if self.source.width == 0 || self.source.height == 0 || self.source.target_fps == 0 {
            return Err(anyhow!("source width, height and target_fps must be non-zero"));
        }
        if self.cache.refs_per_identity == 0 || self.cache.max_pages == 0 {
            return Err(anyhow!("cache.refs_per_identity and cache.max_pages must be non-zero"));
        }
        if self.queue.base_backoff_ms == 0 || self.queue.max_backoff_ms < self.queue.base_backoff_ms {
            return Err(anyhow!(
                "queue.max_backoff_ms must be >= base_backoff_ms and base must be non-zero"
            ));
        }
        if self.queue.retention.as_secs() == 0 {
            return Err(anyhow!("queue.retention_secs must be greater than zero"));
        }
        if self.queue.batch_size == 0 || self.queue.max_attempts == 0 {
            return Err(anyhow!("queue.batch_size and queue.max_attempts must be non-zero"));
        }
        if self.fallback.payload_ceiling < RECORD_LEN {
            return Err(anyhow!(
                "fallback.payload_ceiling must hold one {}-byte record",
                RECORD_LEN
            ));
        }
        Ok(())
    }
}

/// The provisioned device secret. Only ever read from the environment.
pub fn device_secret_from_env() -> Result<DeviceSecret> {
    let secret = std::env::var(DEVICE_SECRET_ENV)
        .map_err(|_| anyhow!("{} is not set; device is not provisioned", DEVICE_SECRET_ENV))?;
    if secret.trim().is_empty() {
        return Err(anyhow!("{} is empty", DEVICE_SECRET_ENV));
    }
    Ok(DeviceSecret::new(secret))
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn read_config_file(path: &Path) -> Result<AgentConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
