//! Scripted collaborators shared by the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use edge_agent::cache::{CacheDelta, ReferenceRecord};
use edge_agent::credential::{Credential, CredentialManager, CredentialProvider, DeviceSecret};
use edge_agent::frame::{Frame, Image, QualitySignals};
use edge_agent::sync::{BackendClient, DeltaPage, DeltaQuery, Receipt, TransportError};
use edge_agent::{DecisionRecord, FaceRegion, Health, InferenceBackend, ManualClock, Uplink};

pub const MODEL: &str = "scripted-v1";
pub const DIM: usize = 4;
pub const LOCATION: &str = "site-a";
pub const DEVICE: &str = "door-01";

/// Unit probe whose cosine similarity against `reference_vector()` is `s`.
pub fn probe(s: f32) -> Vec<f32> {
    vec![s, (1.0 - s * s).max(0.0).sqrt(), 0.0, 0.0]
}

pub fn reference_vector() -> Vec<f32> {
    vec![1.0, 0.0, 0.0, 0.0]
}

pub fn delta(identity_id: &str, as_of: u64) -> CacheDelta {
    CacheDelta {
        location_id: LOCATION.to_string(),
        as_of,
        references: vec![ReferenceRecord {
            identity_id: identity_id.to_string(),
            vector: reference_vector(),
            model_version: MODEL.to_string(),
            quality_score: 0.9,
            created_at: as_of,
        }],
        revoked: vec![],
    }
}

/// A well-exposed 8x8 frame.
pub fn frame(captured_at: u64, sequence: u64) -> Frame {
    let image = Image::new(vec![128; 8 * 8 * 3], 8, 8).unwrap();
    Frame::new(
        image,
        captured_at,
        sequence,
        QualitySignals::complete(0.5, 0.1, 0.05),
    )
}

/// Finds one face covering the frame and embeds from a script.
pub struct ScriptedInference {
    vectors: Arc<Mutex<VecDeque<Vec<f32>>>>,
}

impl ScriptedInference {
    pub fn new() -> (Self, Arc<Mutex<VecDeque<Vec<f32>>>>) {
        let vectors = Arc::new(Mutex::new(VecDeque::new()));
        (
            Self {
                vectors: vectors.clone(),
            },
            vectors,
        )
    }
}

impl InferenceBackend for ScriptedInference {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn model_version(&self) -> &str {
        MODEL
    }

    fn embedding_dim(&self) -> usize {
        DIM
    }

    fn detect(&mut self, _image: &Image) -> Result<Vec<FaceRegion>> {
        Ok(vec![FaceRegion {
            x: 0.0,
            y: 0.0,
            w: 1.0,
            h: 1.0,
            confidence: 0.99,
        }])
    }

    fn embed(&mut self, _face: &Image) -> Result<Vec<f32>> {
        self.vectors
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted embedding left"))
    }
}

/// Backend whose submit outcomes are scripted; unscripted calls succeed.
#[derive(Default)]
pub struct ScriptedServer {
    submit_results: Mutex<VecDeque<Result<Receipt, TransportError>>>,
    pages: Mutex<VecDeque<Result<DeltaPage, TransportError>>>,
    queries: Mutex<Vec<DeltaQuery>>,
    submitted: Mutex<Vec<String>>,
}

impl ScriptedServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_submit(&self, result: Result<Receipt, TransportError>) {
        self.submit_results.lock().unwrap().push_back(result);
    }

    pub fn fail_submits(&self, n: usize, err: TransportError) {
        for _ in 0..n {
            self.push_submit(Err(err.clone()));
        }
    }

    pub fn push_page(&self, page: Result<DeltaPage, TransportError>) {
        self.pages.lock().unwrap().push_back(page);
    }

    pub fn submitted(&self) -> Vec<String> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn queries(&self) -> Vec<DeltaQuery> {
        self.queries.lock().unwrap().clone()
    }
}

impl BackendClient for ScriptedServer {
    fn fetch_delta(&self, _bearer: &str, query: &DeltaQuery) -> Result<DeltaPage, TransportError> {
        self.queries.lock().unwrap().push(query.clone());
        self.pages.lock().unwrap().pop_front().unwrap_or_else(|| {
            Ok(DeltaPage {
                delta: CacheDelta {
                    location_id: query.location_id.clone(),
                    as_of: query.updated_since,
                    references: vec![],
                    revoked: vec![],
                },
                next_cursor: None,
            })
        })
    }

    fn submit_decision(
        &self,
        _bearer: &str,
        _device_id: &str,
        record: &DecisionRecord,
    ) -> Result<Receipt, TransportError> {
        self.submitted.lock().unwrap().push(record.event_id.clone());
        self.submit_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(Receipt {
                    receipt_id: format!("rcpt-{}", record.event_id),
                })
            })
    }
}

/// Issues tokens that never expire within a test and counts exchanges.
#[derive(Default)]
pub struct StaticProvider {
    exchanges: AtomicUsize,
}

impl StaticProvider {
    pub fn exchanges(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }
}

impl CredentialProvider for StaticProvider {
    fn exchange(&self, _device_id: &str, _secret: &DeviceSecret) -> Result<Credential, TransportError> {
        let n = self.exchanges.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Credential {
            token: format!("test-token-{}", n),
            issued_at: 0,
            expires_at: u64::MAX,
        })
    }
}

pub fn credentials(clock: Arc<ManualClock>, health: Arc<Health>) -> Arc<CredentialManager> {
    credentials_from(Arc::new(StaticProvider::default()), clock, health)
}

pub fn credentials_from(
    provider: Arc<StaticProvider>,
    clock: Arc<ManualClock>,
    health: Arc<Health>,
) -> Arc<CredentialManager> {
    Arc::new(CredentialManager::new(
        DEVICE,
        DeviceSecret::new("s3cret".to_string()),
        provider,
        clock,
        health,
        120_000,
    ))
}

/// Records every payload; optionally fails every send.
pub struct RecordingUplink {
    pub sent: Arc<Mutex<Vec<Vec<u8>>>>,
    pub ceiling: usize,
    pub fail: bool,
}

impl RecordingUplink {
    pub fn new(ceiling: usize) -> (Self, Arc<Mutex<Vec<Vec<u8>>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                sent: sent.clone(),
                ceiling,
                fail: false,
            },
            sent,
        )
    }
}

impl Uplink for RecordingUplink {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn payload_ceiling(&self) -> usize {
        self.ceiling
    }

    fn send(&mut self, payload: &[u8]) -> Result<()> {
        if self.fail {
            return Err(anyhow!("radio down"));
        }
        self.sent.lock().unwrap().push(payload.to_vec());
        Ok(())
    }
}

pub fn decision(decision: edge_agent::Decision, captured_at: u64) -> DecisionRecord {
    DecisionRecord {
        event_id: edge_agent::new_event_id(),
        captured_at,
        identity_id: (decision == edge_agent::Decision::Allow).then(|| "alice".to_string()),
        similarity: Some(0.93),
        decision,
        mode: edge_agent::AccessMode::Entry,
        model_version: MODEL.to_string(),
        latency_ms: 120,
        reason: Some("consensus".to_string()),
    }
}
