//! Edge agent for biometric access control.
//!
//! This crate implements the on-device pipeline that turns camera frames into
//! authentication decisions and gets those decisions to the backend, even
//! through long connectivity loss.
//!
//! # Architecture
//!
//! The capture path is synchronous and never touches the network:
//!
//! 1. **FrameSource** supplies frames plus quality signals (`ingest`).
//! 2. **QualityGate** rejects frames that cannot yield a trustworthy embedding.
//! 3. **Detector** / **Embedder** call the external inference interface with a
//!    bounded call time (`detect`).
//! 4. **Matcher** runs the multi-sample consensus state machine against the
//!    current **EmbeddingCache** snapshot.
//! 5. **DecisionQueue** durably records each decision before returning.
//!
//! Three background tasks run on their own schedules (`orchestrator`):
//! cache sync, primary delivery (`sync`), and the compact fallback uplink
//! (`fallback`).
//!
//! # Module Structure
//!
//! - `frame`, `ingest`: frames, quality signals, frame sources
//! - `quality`, `detect`, `matcher`: the perception pipeline
//! - `cache`: versioned, atomically swapped embedding snapshots
//! - `queue`: SQLite-backed outbox with per-entry retry state
//! - `credential`, `sync`, `fallback`: network side
//! - `error`, `health`, `config`: ambient concerns
//! - Core types: DecisionRecord, IdentityReference, Clock

use rand::RngCore;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod cache;
pub mod config;
pub mod credential;
pub mod detect;
pub mod error;
pub mod fallback;
pub mod frame;
pub mod health;
pub mod ingest;
pub mod matcher;
pub mod orchestrator;
pub mod quality;
pub mod queue;
pub mod sync;

pub use cache::{CacheDelta, EmbeddingCache, MergeReport, ReferenceRecord, Snapshot};
pub use credential::{Credential, CredentialManager, CredentialProvider, DeviceSecret};
pub use detect::{BackendRegistry, Detector, Embedder, Embedding, FaceRegion, InferenceBackend};
pub use detect::{InferenceWorker, StubBackend};
pub use error::{AgentError, AgentResult};
pub use fallback::{CompactRecord, FallbackTransport, MqttUplink, Uplink};
pub use frame::{Frame, Image, QualitySignals};
pub use health::{Counter, Health, HealthReport};
pub use ingest::{FrameSource, SyntheticSource};
pub use matcher::{cosine_similarity, Matcher, MatcherSettings};
pub use orchestrator::{AgentHandle, CaptureLoop, Orchestrator, Schedule};
pub use quality::{QualityAssessment, QualityGate, QualityThresholds};
pub use queue::{BackoffPolicy, DecisionQueue, DeliveryRoute, QueueEntry, QueueSettings};
pub use sync::{BackendClient, HttpBackend, OutageTracker, SyncClient, TransportError};

pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:edge_agent_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> rusqlite::Result<Connection> {
    if db_path.starts_with("file:") {
        return Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        );
    }
    Connection::open(db_path)
}

/// Clamp a millisecond timestamp into SQLite's INTEGER range.
pub(crate) fn sql_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

/// Read back a stored timestamp; negative values are treated as 0.
pub(crate) fn sql_u64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

// -------------------- Time --------------------

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Time source for every time-dependent component.
///
/// Production code uses `SystemClock`; tests drive a `ManualClock` so that
/// backoff, consensus windows and outage thresholds replay deterministically.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        now_ms()
    }
}

#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicU64::new(start_ms),
        })
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

// -------------------- Decisions --------------------

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny,
    Review,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Deny => "deny",
            Decision::Review => "review",
        }
    }

    /// Two-bit wire code used by the compact fallback record.
    pub fn code(self) -> u8 {
        match self {
            Decision::Allow => 0,
            Decision::Deny => 1,
            Decision::Review => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Decision::Allow),
            1 => Some(Decision::Deny),
            2 => Some(Decision::Review),
            _ => None,
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the door this device guards.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    #[default]
    Entry,
    Exit,
    Presence,
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AccessMode::Entry => "entry",
            AccessMode::Exit => "exit",
            AccessMode::Presence => "presence",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for AccessMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "entry" => Ok(AccessMode::Entry),
            "exit" => Ok(AccessMode::Exit),
            "presence" => Ok(AccessMode::Presence),
            other => Err(anyhow::anyhow!("unknown access mode: {}", other)),
        }
    }
}

/// One authentication outcome. Created by the matcher, never mutated.
///
/// `event_id` is a ULID so redelivery (primary or fallback) is idempotent at
/// the consumer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DecisionRecord {
    pub event_id: String,
    /// Capture time of the first frame of the attempt (ms since epoch).
    pub captured_at: u64,
    pub identity_id: Option<String>,
    pub similarity: Option<f32>,
    pub decision: Decision,
    pub mode: AccessMode,
    pub model_version: String,
    pub latency_ms: u64,
    pub reason: Option<String>,
}

pub fn new_event_id() -> String {
    ulid::Ulid::new().to_string()
}

// -------------------- Identity References --------------------

/// A stored reference embedding for one authorized identity.
///
/// Immutable once stored; superseded references are evicted, never mutated.
/// The vector is shared so snapshot rebuilds do not copy embeddings.
#[derive(Clone, Debug, PartialEq)]
pub struct IdentityReference {
    pub identity_id: String,
    pub vector: Arc<[f32]>,
    pub model_version: String,
    pub quality_score: f32,
    pub created_at: u64,
}

impl IdentityReference {
    pub fn dim(&self) -> usize {
        self.vector.len()
    }
}

// -------------------- Identifier Discipline --------------------

/// Device and location identifiers are opaque tokens issued at provisioning.
/// We enforce a positive allowlist so they are safe in SQL, topics and logs.
pub fn validate_identifier(kind: &str, value: &str) -> anyhow::Result<()> {
    static ID_RE: OnceLock<Option<regex::Regex>> = OnceLock::new();
    let re = ID_RE
        .get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:-]{0,127}$").ok())
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("identifier pattern failed to compile"))?;
    if !re.is_match(value) {
        return Err(anyhow::anyhow!(
            "{} must match ^[A-Za-z0-9][A-Za-z0-9_.:-]{{0,127}}$ (got {:?})",
            kind,
            value
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_codes_cover_all_variants() {
        for decision in [Decision::Allow, Decision::Deny, Decision::Review] {
            assert_eq!(Decision::from_code(decision.code()), Some(decision));
        }
        assert_eq!(Decision::from_code(3), None);
    }

    #[test]
    fn event_ids_are_unique() {
        let ids: std::collections::HashSet<String> = (0..1000).map(|_| new_event_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn identifiers_follow_allowlist() {
        assert!(validate_identifier("device_id", "door-07").is_ok());
        assert!(validate_identifier("location_id", "site:hq.lobby").is_ok());
        assert!(validate_identifier("device_id", "").is_err());
        assert!(validate_identifier("device_id", "door 7").is_err());
        assert!(validate_identifier("device_id", "a/b").is_err());
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        clock.advance(500);
        assert_eq!(clock.now_ms(), 1_500);
        clock.set(10);
        assert_eq!(clock.now_ms(), 10);
    }

    #[test]
    fn access_mode_parses_case_insensitively() {
        assert_eq!("EXIT".parse::<AccessMode>().unwrap(), AccessMode::Exit);
        assert!("sideways".parse::<AccessMode>().is_err());
    }
}
