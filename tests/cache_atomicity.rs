mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use proptest::prelude::*;

use edge_agent::cache::{CacheDelta, ReferenceRecord};
use edge_agent::{EmbeddingCache, Health, Snapshot};

use common::{LOCATION, MODEL};

const IDENTITIES: [&str; 4] = ["alice", "bob", "carol", "dave"];

/// Every identity gets one reference stamped with the delta watermark.
fn full_delta(as_of: u64) -> CacheDelta {
    CacheDelta {
        location_id: LOCATION.to_string(),
        as_of,
        references: IDENTITIES
            .iter()
            .enumerate()
            .map(|(i, id)| ReferenceRecord {
                identity_id: id.to_string(),
                vector: vec![1.0, i as f32, 0.5, (as_of % 7) as f32],
                model_version: MODEL.to_string(),
                quality_score: 0.8,
                created_at: as_of,
            })
            .collect(),
        revoked: vec![],
    }
}

/// A snapshot is whole when it holds exactly one reference per identity,
/// all from the same merge.
fn assert_whole(snapshot: &Snapshot) {
    if snapshot.version == 0 {
        assert!(snapshot.entries.is_empty());
        return;
    }
    assert_eq!(snapshot.identity_count(), IDENTITIES.len());
    for refs in snapshot.entries.values() {
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].created_at, snapshot.as_of, "mixed snapshot at v{}", snapshot.version);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn readers_never_observe_a_partial_merge(watermarks in prop::collection::vec(1u64..10_000, 1..40)) {
        let cache = Arc::new(EmbeddingCache::in_memory(LOCATION, 1, Arc::new(Health::new())));
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let cache = cache.clone();
                let done = done.clone();
                thread::spawn(move || {
                    let mut last_version = 0;
                    let mut last_as_of = 0;
                    while !done.load(Ordering::SeqCst) {
                        let snapshot = cache.snapshot();
                        assert_whole(&snapshot);
                        assert!(snapshot.version >= last_version);
                        assert!(snapshot.as_of >= last_as_of);
                        last_version = snapshot.version;
                        last_as_of = snapshot.as_of;
                    }
                })
            })
            .collect();

        let mut high_water = 0;
        for as_of in &watermarks {
            cache.apply_delta(&full_delta(*as_of)).unwrap();
            high_water = high_water.max(*as_of);
            prop_assert_eq!(cache.as_of(), high_water);
        }
        done.store(true, Ordering::SeqCst);
        for reader in readers {
            prop_assert!(reader.join().is_ok());
        }
        assert_whole(&cache.snapshot());
    }
}

#[test]
fn wrong_location_leaves_snapshot_untouched() {
    let cache = EmbeddingCache::in_memory(LOCATION, 3, Arc::new(Health::new()));
    cache.apply_delta(&full_delta(100)).unwrap();
    let before = cache.snapshot();

    let mut foreign = full_delta(200);
    foreign.location_id = "site-b".to_string();
    assert!(cache.apply_delta(&foreign).is_err());
    assert!(Arc::ptr_eq(&before, &cache.snapshot()));
}

#[test]
fn persisted_snapshot_reloads_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent.db");
    let path = path.to_str().unwrap();
    {
        let cache = EmbeddingCache::open(path, LOCATION, 2, Arc::new(Health::new())).unwrap();
        cache.apply_delta(&full_delta(100)).unwrap();
        cache.apply_delta(&full_delta(200)).unwrap();
    }
    let cache = EmbeddingCache::open(path, LOCATION, 2, Arc::new(Health::new())).unwrap();
    assert_eq!(cache.as_of(), 200);
    assert_eq!(cache.lookup("carol").len(), 2);
}
