//! Embedding cache.
//!
//! The matcher reads an immutable `Snapshot` behind an `Arc`. A merge builds
//! the next snapshot completely, persists it, and only then swaps the single
//! shared reference, so a reader sees either the old or the new snapshot and
//! never a mix. Merges are serialised by the writer lock.
//!
//! Invariants:
//! - every snapshot belongs to this device's `location_id`
//! - `as_of` never decreases
//! - at most `refs_per_identity` references per identity per model_version

mod store;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, RwLock};

use crate::detect::normalize;
use crate::error::{AgentError, AgentResult};
use crate::health::{Counter, Health};
use crate::IdentityReference;

pub use store::CacheStore;

/// One reference embedding as delivered by the backend.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ReferenceRecord {
    pub identity_id: String,
    pub vector: Vec<f32>,
    pub model_version: String,
    pub quality_score: f32,
    pub created_at: u64,
}

/// Incremental update for one location.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct CacheDelta {
    pub location_id: String,
    /// Backend watermark for this fragment (ms since epoch).
    pub as_of: u64,
    #[serde(default)]
    pub references: Vec<ReferenceRecord>,
    /// Identities whose access was withdrawn.
    #[serde(default)]
    pub revoked: Vec<String>,
}

/// Immutable view of the cache at one point in time.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Snapshot {
    pub location_id: String,
    pub as_of: u64,
    /// Bumped on every published merge; 0 for an empty, never-synced cache.
    pub version: u64,
    /// Per identity, ordered by model_version then newest first.
    pub entries: BTreeMap<String, Vec<IdentityReference>>,
}

impl Snapshot {
    pub fn empty(location_id: &str) -> Self {
        Self {
            location_id: location_id.to_string(),
            ..Self::default()
        }
    }

    pub fn lookup(&self, identity_id: &str) -> &[IdentityReference] {
        self.entries
            .get(identity_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn identity_count(&self) -> usize {
        self.entries.len()
    }

    pub fn reference_count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Embedding dimension per model_version present in the snapshot.
    fn dims(&self) -> BTreeMap<String, usize> {
        let mut dims = BTreeMap::new();
        for r in self.entries.values().flatten() {
            dims.entry(r.model_version.clone()).or_insert(r.dim());
        }
        dims
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub inserted: usize,
    pub evicted: usize,
    pub revoked: usize,
    /// Malformed references that were dropped.
    pub skipped: usize,
    pub as_of_advanced: bool,
    /// Snapshot version visible after the merge.
    pub version: u64,
}

impl MergeReport {
    pub fn changed(&self) -> bool {
        self.inserted > 0 || self.evicted > 0 || self.revoked > 0 || self.as_of_advanced
    }
}

pub struct EmbeddingCache {
    location_id: String,
    refs_per_identity: usize,
    current: RwLock<Arc<Snapshot>>,
    writer: Mutex<Option<CacheStore>>,
    health: Arc<Health>,
}

impl EmbeddingCache {
    /// Memory-only cache, starting empty.
    pub fn in_memory(location_id: &str, refs_per_identity: usize, health: Arc<Health>) -> Self {
        Self::with_parts(
            Snapshot::empty(location_id),
            None,
            location_id,
            refs_per_identity,
            health,
        )
    }

    /// Cache backed by the agent database; loads the persisted snapshot.
    pub fn open(
        db_path: &str,
        location_id: &str,
        refs_per_identity: usize,
        health: Arc<Health>,
    ) -> AgentResult<Self> {
        let mut store = CacheStore::open(db_path)?;
        let snapshot = store.load(location_id, &health)?;
        log::info!(
            "cache: loaded snapshot location={} version={} as_of={} identities={} refs={}",
            snapshot.location_id,
            snapshot.version,
            snapshot.as_of,
            snapshot.identity_count(),
            snapshot.reference_count()
        );
        Ok(Self::with_parts(
            snapshot,
            Some(store),
            location_id,
            refs_per_identity,
            health,
        ))
    }

    fn with_parts(
        snapshot: Snapshot,
        store: Option<CacheStore>,
        location_id: &str,
        refs_per_identity: usize,
        health: Arc<Health>,
    ) -> Self {
        Self {
            location_id: location_id.to_string(),
            refs_per_identity: refs_per_identity.max(1),
            current: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(store),
            health,
        }
    }

    pub fn location_id(&self) -> &str {
        &self.location_id
    }

    /// The current complete snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            // The guarded value is a single Arc; a panicking writer cannot
            // leave it half-updated.
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn lookup(&self, identity_id: &str) -> Vec<IdentityReference> {
        self.snapshot().lookup(identity_id).to_vec()
    }

    pub fn as_of(&self) -> u64 {
        self.snapshot().as_of
    }

    /// Merge a delta all-or-nothing.
    ///
    /// Revocations apply first, then new references. Older references beyond
    /// the retention count are evicted. `as_of` advances only when the delta
    /// is newer. On any error the previous snapshot stays published.
    pub fn apply_delta(&self, delta: &CacheDelta) -> AgentResult<MergeReport> {
        if delta.location_id != self.location_id {
            return Err(AgentError::CacheSyncFailure(format!(
                "delta for location {} does not match assignment {}",
                delta.location_id, self.location_id
            )));
        }

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| AgentError::CacheSyncFailure("cache writer lock poisoned".to_string()))?;
        let base = self.snapshot();
        let mut entries = base.entries.clone();
        let mut dims = base.dims();
        let mut report = MergeReport::default();
        let mut touched = BTreeSet::new();

        for identity_id in &delta.revoked {
            if let Some(refs) = entries.remove(identity_id) {
                report.revoked += refs.len();
            }
            touched.insert(identity_id.clone());
        }

        for record in &delta.references {
            let Some(reference) = self.admit(record, &mut dims) else {
                report.skipped += 1;
                continue;
            };
            let refs = entries.entry(reference.identity_id.clone()).or_default();
            let duplicate = refs.iter().any(|r| {
                r.model_version == reference.model_version && r.created_at == reference.created_at
            });
            if duplicate {
                continue;
            }
            touched.insert(reference.identity_id.clone());
            refs.push(reference);
            report.inserted += 1;
        }

        for identity_id in &touched {
            if let Some(refs) = entries.get_mut(identity_id) {
                report.evicted += retain_newest(refs, self.refs_per_identity);
                if refs.is_empty() {
                    entries.remove(identity_id);
                }
            }
        }

        report.as_of_advanced = delta.as_of > base.as_of;
        if report.skipped > 0 {
            self.health.add(Counter::StorageCorruption, report.skipped as u64);
            log::warn!(
                "cache: skipped {} malformed references in delta as_of={}",
                report.skipped,
                delta.as_of
            );
        }
        if !report.changed() {
            report.version = base.version;
            return Ok(report);
        }

        let next = Snapshot {
            location_id: self.location_id.clone(),
            as_of: base.as_of.max(delta.as_of),
            version: base.version + 1,
            entries,
        };
        if let Some(store) = writer.as_mut() {
            store.persist(&next, &touched)?;
        }
        report.version = next.version;

        let next = Arc::new(next);
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        Ok(report)
    }

    /// Validate and normalise one incoming reference.
    fn admit(
        &self,
        record: &ReferenceRecord,
        dims: &mut BTreeMap<String, usize>,
    ) -> Option<IdentityReference> {
        if record.identity_id.is_empty() || record.model_version.is_empty() {
            return None;
        }
        let dim = record.vector.len();
        if dim == 0 {
            return None;
        }
        if let Some(expected) = dims.get(&record.model_version) {
            if *expected != dim {
                log::debug!(
                    "cache: {} has dim {} but {} uses {}",
                    record.identity_id,
                    dim,
                    record.model_version,
                    expected
                );
                return None;
            }
        }
        let mut vector = record.vector.clone();
        if !normalize(&mut vector) {
            return None;
        }
        dims.entry(record.model_version.clone()).or_insert(dim);
        Some(IdentityReference {
            identity_id: record.identity_id.clone(),
            vector: vector.into(),
            model_version: record.model_version.clone(),
            quality_score: if record.quality_score.is_finite() {
                record.quality_score.clamp(0.0, 1.0)
            } else {
                0.0
            },
            created_at: record.created_at,
        })
    }
}

/// Order by model_version then newest first and keep `n` per model_version.
/// Returns the number evicted.
fn retain_newest(refs: &mut Vec<IdentityReference>, n: usize) -> usize {
    refs.sort_by(|a, b| {
        a.model_version
            .cmp(&b.model_version)
            .then(b.created_at.cmp(&a.created_at))
    });
    let before = refs.len();
    let mut seen: BTreeMap<String, usize> = BTreeMap::new();
    refs.retain(|r| {
        let count = seen.entry(r.model_version.clone()).or_insert(0);
        *count += 1;
        *count <= n
    });
    before - refs.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(identity: &str, created_at: u64, v: &[f32]) -> ReferenceRecord {
        ReferenceRecord {
            identity_id: identity.to_string(),
            vector: v.to_vec(),
            model_version: "m1".to_string(),
            quality_score: 0.9,
            created_at,
        }
    }

    fn delta(as_of: u64, references: Vec<ReferenceRecord>) -> CacheDelta {
        CacheDelta {
            location_id: "lobby".to_string(),
            as_of,
            references,
            revoked: vec![],
        }
    }

    fn cache(n: usize) -> EmbeddingCache {
        EmbeddingCache::in_memory("lobby", n, Arc::new(Health::new()))
    }

    #[test]
    fn merge_keeps_newest_n_per_identity() {
        let c = cache(2);
        let report = c
            .apply_delta(&delta(
                30,
                vec![
                    record("alice", 10, &[1.0, 0.0]),
                    record("alice", 30, &[0.0, 1.0]),
                    record("alice", 20, &[1.0, 1.0]),
                ],
            ))
            .unwrap();
        assert_eq!(report.inserted, 3);
        assert_eq!(report.evicted, 1);
        let refs = c.lookup("alice");
        let times: Vec<u64> = refs.iter().map(|r| r.created_at).collect();
        assert_eq!(times, vec![30, 20]);
        let norm: f32 = refs[1].vector.iter().map(|x| x * x).sum();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn as_of_never_moves_backwards() {
        let c = cache(5);
        c.apply_delta(&delta(100, vec![record("a", 1, &[1.0])])).unwrap();
        let report = c.apply_delta(&delta(50, vec![record("b", 2, &[1.0])])).unwrap();
        assert!(!report.as_of_advanced);
        assert_eq!(c.as_of(), 100);
        assert_eq!(c.snapshot().identity_count(), 2);
    }

    #[test]
    fn wrong_location_is_rejected_untouched() {
        let c = cache(5);
        let mut d = delta(10, vec![record("a", 1, &[1.0])]);
        d.location_id = "garage".to_string();
        assert!(matches!(
            c.apply_delta(&d),
            Err(AgentError::CacheSyncFailure(_))
        ));
        assert_eq!(c.snapshot().version, 0);
    }

    #[test]
    fn revocation_removes_identity() {
        let c = cache(5);
        c.apply_delta(&delta(10, vec![record("a", 1, &[1.0]), record("a", 2, &[1.0])]))
            .unwrap();
        let mut d = delta(20, vec![]);
        d.revoked = vec!["a".to_string()];
        let report = c.apply_delta(&d).unwrap();
        assert_eq!(report.revoked, 2);
        assert!(c.lookup("a").is_empty());
    }

    #[test]
    fn malformed_references_are_skipped_and_counted() {
        let health = Arc::new(Health::new());
        let c = EmbeddingCache::in_memory("lobby", 5, health.clone());
        let report = c
            .apply_delta(&delta(
                10,
                vec![
                    record("a", 1, &[1.0, 0.0]),
                    record("b", 1, &[0.0, 0.0]),
                    record("c", 1, &[1.0, f32::NAN]),
                    record("d", 1, &[1.0, 0.0, 0.0]),
                ],
            ))
            .unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.skipped, 3);
        assert_eq!(health.get(Counter::StorageCorruption), 3);
    }

    #[test]
    fn replayed_delta_is_a_no_op() {
        let c = cache(5);
        let d = delta(10, vec![record("a", 1, &[1.0])]);
        c.apply_delta(&d).unwrap();
        let again = c.apply_delta(&d).unwrap();
        assert!(!again.changed());
        assert_eq!(again.version, 1);
        assert_eq!(c.lookup("a").len(), 1);
    }

    #[test]
    fn readers_keep_their_snapshot_across_merges() {
        let c = cache(5);
        c.apply_delta(&delta(10, vec![record("a", 1, &[1.0])])).unwrap();
        let held = c.snapshot();
        c.apply_delta(&delta(20, vec![record("b", 2, &[1.0])])).unwrap();
        assert_eq!(held.identity_count(), 1);
        assert_eq!(c.snapshot().identity_count(), 2);
    }
}
