use rusqlite::{params, Connection};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{AgentError, AgentResult};
use crate::health::{Counter, Health};
use crate::{open_db_connection, sql_i64, sql_u64, IdentityReference};

use super::Snapshot;

/// SQLite persistence for the cache snapshot.
///
/// One row per reference keyed by (identity_id, model_version, created_at)
/// plus a single meta row. Every merge is written in one transaction.
pub struct CacheStore {
    conn: Connection,
}

impl CacheStore {
    pub fn open(db_path: &str) -> AgentResult<Self> {
        let conn = open_db_connection(db_path)?;
        let store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> AgentResult<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=FULL;

            CREATE TABLE IF NOT EXISTS cache_meta (
              id INTEGER PRIMARY KEY CHECK (id = 1),
              location_id TEXT NOT NULL,
              as_of INTEGER NOT NULL,
              version INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS identity_refs (
              identity_id TEXT NOT NULL,
              model_version TEXT NOT NULL,
              created_at INTEGER NOT NULL,
              quality_score REAL NOT NULL,
              dim INTEGER NOT NULL,
              vector BLOB NOT NULL,
              PRIMARY KEY (identity_id, model_version, created_at)
            );
            "#,
        )?;
        Ok(())
    }

    /// Load the persisted snapshot for `location_id`.
    ///
    /// A snapshot for another location is discarded. Rows whose vector blob
    /// does not decode are skipped and counted; the watermark is then reset
    /// so the next sync refetches everything.
    pub fn load(&mut self, location_id: &str, health: &Health) -> AgentResult<Snapshot> {
        let meta: Option<(String, i64, i64)> = {
            let mut stmt = self
                .conn
                .prepare("SELECT location_id, as_of, version FROM cache_meta WHERE id = 1")?;
            let mut rows = stmt.query([])?;
            match rows.next()? {
                Some(row) => Some((row.get(0)?, row.get(1)?, row.get(2)?)),
                None => None,
            }
        };
        let Some((stored_location, as_of, version)) = meta else {
            return Ok(Snapshot::empty(location_id));
        };
        if stored_location != location_id {
            log::warn!(
                "cache: discarding persisted snapshot for location {} (assigned {})",
                stored_location,
                location_id
            );
            let tx = self.conn.transaction()?;
            tx.execute("DELETE FROM identity_refs", [])?;
            tx.execute("DELETE FROM cache_meta", [])?;
            tx.commit()?;
            return Ok(Snapshot::empty(location_id));
        }

        let mut entries: BTreeMap<String, Vec<IdentityReference>> = BTreeMap::new();
        let mut corrupt = 0u64;
        {
            let mut stmt = self.conn.prepare(
                r#"
                SELECT identity_id, model_version, created_at, quality_score, dim, vector
                FROM identity_refs
                ORDER BY identity_id ASC, model_version ASC, created_at DESC
                "#,
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let identity_id: String = row.get(0)?;
                let model_version: String = row.get(1)?;
                let created_at: i64 = row.get(2)?;
                let quality_score: f64 = row.get(3)?;
                let dim: i64 = row.get(4)?;
                let blob: Vec<u8> = row.get(5)?;
                match decode_vector(&blob, dim) {
                    Ok(vector) => entries
                        .entry(identity_id.clone())
                        .or_default()
                        .push(IdentityReference {
                            identity_id,
                            vector: vector.into(),
                            model_version,
                            quality_score: quality_score as f32,
                            created_at: sql_u64(created_at),
                        }),
                    Err(err) => {
                        corrupt += 1;
                        log::warn!("cache: quarantining {}: {}", identity_id, err);
                    }
                }
            }
        }

        let mut as_of = sql_u64(as_of);
        if corrupt > 0 {
            health.add(Counter::StorageCorruption, corrupt);
            log::warn!(
                "cache: {} corrupt references skipped; forcing full resync",
                corrupt
            );
            as_of = 0;
        }
        Ok(Snapshot {
            location_id: location_id.to_string(),
            as_of,
            version: sql_u64(version),
            entries,
        })
    }

    /// Rewrite the rows of every touched identity and the meta row.
    pub fn persist(&mut self, snapshot: &Snapshot, touched: &BTreeSet<String>) -> AgentResult<()> {
        let tx = self.conn.transaction()?;
        for identity_id in touched {
            tx.execute(
                "DELETE FROM identity_refs WHERE identity_id = ?1",
                params![identity_id],
            )?;
            for r in snapshot.lookup(identity_id) {
                tx.execute(
                    r#"
                    INSERT INTO identity_refs(identity_id, model_version, created_at, quality_score, dim, vector)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                    "#,
                    params![
                        r.identity_id,
                        r.model_version,
                        sql_i64(r.created_at),
                        r.quality_score as f64,
                        r.dim() as i64,
                        encode_vector(&r.vector),
                    ],
                )?;
            }
        }
        tx.execute(
            r#"
            INSERT INTO cache_meta(id, location_id, as_of, version) VALUES (1, ?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET
              location_id = excluded.location_id,
              as_of = excluded.as_of,
              version = excluded.version
            "#,
            params![
                snapshot.location_id,
                sql_i64(snapshot.as_of),
                sql_i64(snapshot.version)
            ],
        )?;
        tx.commit()?;
        Ok(())
    }
}

fn encode_vector(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn decode_vector(blob: &[u8], dim: i64) -> AgentResult<Vec<f32>> {
    let corrupt = |detail: String| AgentError::StorageCorruption {
        key: "identity_refs".to_string(),
        detail,
    };
    let dim = usize::try_from(dim).map_err(|_| corrupt(format!("negative dim {}", dim)))?;
    if dim == 0 || blob.len() != dim * 4 {
        return Err(corrupt(format!(
            "blob is {} bytes for dim {}",
            blob.len(),
            dim
        )));
    }
    let vector: Vec<f32> = blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    if vector.iter().any(|x| !x.is_finite()) {
        return Err(corrupt("non-finite component".to_string()));
    }
    Ok(vector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheDelta, EmbeddingCache, ReferenceRecord};
    use std::sync::Arc;

    fn delta(location: &str) -> CacheDelta {
        CacheDelta {
            location_id: location.to_string(),
            as_of: 500,
            references: vec![ReferenceRecord {
                identity_id: "alice".to_string(),
                vector: vec![0.0, 2.0],
                model_version: "m1".to_string(),
                quality_score: 0.8,
                created_at: 400,
            }],
            revoked: vec![],
        }
    }

    #[test]
    fn snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("agent.db");
        let db = db.to_str().unwrap();
        {
            let cache = EmbeddingCache::open(db, "lobby", 5, Arc::new(Health::new())).unwrap();
            cache.apply_delta(&delta("lobby")).unwrap();
        }
        let cache = EmbeddingCache::open(db, "lobby", 5, Arc::new(Health::new())).unwrap();
        let snap = cache.snapshot();
        assert_eq!(snap.as_of, 500);
        assert_eq!(snap.version, 1);
        let refs = snap.lookup("alice");
        assert_eq!(refs.len(), 1);
        assert_eq!(&*refs[0].vector, &[0.0, 1.0]);
    }

    #[test]
    fn other_location_snapshot_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("agent.db");
        let db = db.to_str().unwrap();
        {
            let cache = EmbeddingCache::open(db, "lobby", 5, Arc::new(Health::new())).unwrap();
            cache.apply_delta(&delta("lobby")).unwrap();
        }
        let cache = EmbeddingCache::open(db, "garage", 5, Arc::new(Health::new())).unwrap();
        assert_eq!(cache.snapshot().reference_count(), 0);
        assert_eq!(cache.as_of(), 0);
    }

    #[test]
    fn corrupt_blob_is_skipped_and_forces_resync() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("agent.db");
        let db = db.to_str().unwrap();
        {
            let cache = EmbeddingCache::open(db, "lobby", 5, Arc::new(Health::new())).unwrap();
            cache.apply_delta(&delta("lobby")).unwrap();
        }
        let conn = Connection::open(db).unwrap();
        conn.execute("UPDATE identity_refs SET vector = x'0102'", [])
            .unwrap();
        drop(conn);

        let health = Arc::new(Health::new());
        let cache = EmbeddingCache::open(db, "lobby", 5, health.clone()).unwrap();
        assert!(cache.lookup("alice").is_empty());
        assert_eq!(cache.as_of(), 0);
        assert_eq!(health.get(Counter::StorageCorruption), 1);
    }
}
