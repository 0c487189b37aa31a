//! Compact fallback record.
//!
//! Fixed 38-byte layout, big-endian:
//!
//! | offset | len | field |
//! |---|---|---|
//! | 0 | 1 | version (1) |
//! | 1 | 1 | flags: bits 0-1 decision, bit 2 similarity present, bit 3 identity hint present |
//! | 2 | 16 | event_id (ULID) |
//! | 18 | 8 | device hint: SHA-256(device_id)[..8] |
//! | 26 | 4 | captured_at, seconds since epoch |
//! | 30 | 2 | similarity x 10000, i16 |
//! | 32 | 4 | identity hint: SHA-256(identity_id)[..4] |
//! | 36 | 2 | checksum: SHA-256(bytes[0..36])[..2] |
//!
//! Hints let the backend reconcile a fallback record with the canonical one
//! without sending identifiers over the radio link.

use sha2::{Digest, Sha256};
use thiserror::Error;
use ulid::Ulid;

use crate::{Decision, DecisionRecord};

pub const RECORD_LEN: usize = 38;
pub const RECORD_VERSION: u8 = 1;

const FLAG_DECISION_MASK: u8 = 0b0000_0011;
const FLAG_SIMILARITY: u8 = 0b0000_0100;
const FLAG_IDENTITY: u8 = 0b0000_1000;
const SIMILARITY_SCALE: f32 = 10_000.0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("event_id {0:?} is not a ULID")]
    EventId(String),
    #[error("record is {0} bytes, expected 38")]
    Length(usize),
    #[error("unsupported record version {0}")]
    Version(u8),
    #[error("record checksum mismatch")]
    Checksum,
    #[error("invalid flags {0:#04x}")]
    Flags(u8),
    #[error("payload ceiling {0} cannot hold one 38-byte record")]
    CeilingTooSmall(usize),
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompactRecord {
    pub event_id: Ulid,
    pub device_hint: [u8; 8],
    pub timestamp_secs: u32,
    pub decision: Decision,
    pub similarity: Option<f32>,
    pub identity_hint: Option<[u8; 4]>,
}

pub fn device_hint(device_id: &str) -> [u8; 8] {
    let digest = Sha256::digest(device_id.as_bytes());
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    out
}

pub fn identity_hint(identity_id: &str) -> [u8; 4] {
    let digest = Sha256::digest(identity_id.as_bytes());
    let mut out = [0u8; 4];
    out.copy_from_slice(&digest[..4]);
    out
}

fn checksum(bytes: &[u8]) -> [u8; 2] {
    let digest = Sha256::digest(bytes);
    [digest[0], digest[1]]
}

impl CompactRecord {
    pub fn from_decision(record: &DecisionRecord, device_id: &str) -> Result<Self, CodecError> {
        let event_id = Ulid::from_string(&record.event_id)
            .map_err(|_| CodecError::EventId(record.event_id.clone()))?;
        Ok(Self {
            event_id,
            device_hint: device_hint(device_id),
            timestamp_secs: u32::try_from(record.captured_at / 1_000).unwrap_or(u32::MAX),
            decision: record.decision,
            similarity: record.similarity.filter(|s| s.is_finite()),
            identity_hint: record.identity_id.as_deref().map(identity_hint),
        })
    }

    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        let mut flags = self.decision.code() & FLAG_DECISION_MASK;
        out[0] = RECORD_VERSION;
        out[2..18].copy_from_slice(&self.event_id.to_bytes());
        out[18..26].copy_from_slice(&self.device_hint);
        out[26..30].copy_from_slice(&self.timestamp_secs.to_be_bytes());
        if let Some(s) = self.similarity {
            flags |= FLAG_SIMILARITY;
            let scaled = (s.clamp(-1.0, 1.0) * SIMILARITY_SCALE).round() as i16;
            out[30..32].copy_from_slice(&scaled.to_be_bytes());
        }
        if let Some(hint) = self.identity_hint {
            flags |= FLAG_IDENTITY;
            out[32..36].copy_from_slice(&hint);
        }
        out[1] = flags;
        let sum = checksum(&out[..36]);
        out[36..38].copy_from_slice(&sum);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() != RECORD_LEN {
            return Err(CodecError::Length(bytes.len()));
        }
        if bytes[0] != RECORD_VERSION {
            return Err(CodecError::Version(bytes[0]));
        }
        if checksum(&bytes[..36]) != [bytes[36], bytes[37]] {
            return Err(CodecError::Checksum);
        }
        let flags = bytes[1];
        if flags & !(FLAG_DECISION_MASK | FLAG_SIMILARITY | FLAG_IDENTITY) != 0 {
            return Err(CodecError::Flags(flags));
        }
        let decision =
            Decision::from_code(flags & FLAG_DECISION_MASK).ok_or(CodecError::Flags(flags))?;

        let mut ulid = [0u8; 16];
        ulid.copy_from_slice(&bytes[2..18]);
        let mut device = [0u8; 8];
        device.copy_from_slice(&bytes[18..26]);
        let timestamp_secs = u32::from_be_bytes([bytes[26], bytes[27], bytes[28], bytes[29]]);
        let similarity = (flags & FLAG_SIMILARITY != 0)
            .then(|| i16::from_be_bytes([bytes[30], bytes[31]]) as f32 / SIMILARITY_SCALE);
        let identity_hint = (flags & FLAG_IDENTITY != 0)
            .then(|| [bytes[32], bytes[33], bytes[34], bytes[35]]);

        Ok(Self {
            event_id: Ulid::from_bytes(ulid),
            device_hint: device,
            timestamp_secs,
            decision,
            similarity,
            identity_hint,
        })
    }
}

/// Records that fit in one payload of `ceiling` bytes.
pub fn records_per_payload(ceiling: usize) -> Result<usize, CodecError> {
    match ceiling / RECORD_LEN {
        0 => Err(CodecError::CeilingTooSmall(ceiling)),
        n => Ok(n),
    }
}

/// Pack records back to back, as many per payload as the ceiling allows.
pub fn encode_batch(records: &[CompactRecord], ceiling: usize) -> Result<Vec<Vec<u8>>, CodecError> {
    let per_payload = records_per_payload(ceiling)?;
    Ok(records
        .chunks(per_payload)
        .map(|chunk| chunk.iter().flat_map(|r| r.encode()).collect())
        .collect())
}

pub fn decode_batch(payload: &[u8]) -> Result<Vec<CompactRecord>, CodecError> {
    if payload.is_empty() || payload.len() % RECORD_LEN != 0 {
        return Err(CodecError::Length(payload.len()));
    }
    payload
        .chunks_exact(RECORD_LEN)
        .map(CompactRecord::decode)
        .collect()
}
