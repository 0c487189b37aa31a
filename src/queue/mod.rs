//! Durable decision outbox.
//!
//! SQLite in WAL mode with `synchronous=FULL`: `enqueue` returns only after
//! the row is committed, so a restart loses at most the write in flight.
//! Each row carries its own retry state (attempt_count, next_attempt_at,
//! fallback tag), which makes delivery replayable under a `ManualClock`.
//!
//! Rows leave the outbox in three ways:
//! - acknowledged by the backend, then purged
//! - archived (rejected by the backend, or past the retention window)
//! - quarantined (payload failed to decode or checksum)

mod backoff;

use rand::rngs::StdRng;
use rand::SeedableRng;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{AgentError, AgentResult};
use crate::health::{Counter, Health};
use crate::{open_db_connection, sql_i64, sql_u64, Clock, DecisionRecord};

pub use backoff::BackoffPolicy;

pub const RETENTION_EXPIRED: &str = "retention_expired";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueSettings {
    pub backoff: BackoffPolicy,
    /// Primary attempts after which an entry becomes eligible for fallback
    /// even without an outage.
    pub max_attempts: u32,
    /// Undelivered entries older than this are archived.
    pub retention_ms: u64,
    /// Minimum primary retry interval once an entry went out via fallback.
    pub fallback_primary_retry_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            max_attempts: 12,
            retention_ms: 7 * 24 * 3_600 * 1_000,
            fallback_primary_retry_ms: 900_000,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "route", rename_all = "snake_case")]
pub enum DeliveryRoute {
    Primary,
    FallbackSent { count: u32, at: u64 },
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueueEntry {
    pub seq: i64,
    pub record: DecisionRecord,
    pub enqueued_at: u64,
    pub attempt_count: u32,
    pub next_attempt_at: u64,
    pub delivered: bool,
    pub route: DeliveryRoute,
    pub last_error: Option<String>,
}

impl QueueEntry {
    pub fn event_id(&self) -> &str {
        &self.record.event_id
    }
}

/// Which unacknowledged entries the fallback task may take.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FallbackScope {
    /// Everything not yet sent via fallback (primary outage).
    AllUnsent,
    /// Only entries that exhausted their primary attempts.
    Exhausted,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub due: u64,
    pub delivered: u64,
    pub fallback_sent: u64,
    pub archived: u64,
    pub quarantined: u64,
    pub oldest_pending_age_ms: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub delivered_removed: usize,
    pub expired_archived: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ArchivedEntry {
    pub event_id: String,
    pub enqueued_at: u64,
    pub attempt_count: u32,
    pub archived_at: u64,
    pub reason: String,
}

pub struct DecisionQueue {
    conn: Mutex<Connection>,
    settings: QueueSettings,
    clock: Arc<dyn Clock>,
    health: Arc<Health>,
    rng: Mutex<StdRng>,
}

const ENTRY_COLUMNS: &str = "seq, event_id, payload_json, payload_hash, enqueued_at, attempt_count, \
     next_attempt_at, delivered, fallback_sent_count, fallback_sent_at, last_error";

impl DecisionQueue {
    /// Open (or create) the outbox. Failure here is fatal at startup.
    pub fn open(
        db_path: &str,
        settings: QueueSettings,
        clock: Arc<dyn Clock>,
        health: Arc<Health>,
    ) -> AgentResult<Self> {
        let conn = open_db_connection(db_path)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=FULL;

            CREATE TABLE IF NOT EXISTS outbox (
              seq INTEGER PRIMARY KEY AUTOINCREMENT,
              event_id TEXT NOT NULL UNIQUE,
              payload_json TEXT NOT NULL,
              payload_hash BLOB NOT NULL,
              enqueued_at INTEGER NOT NULL,
              attempt_count INTEGER NOT NULL DEFAULT 0,
              next_attempt_at INTEGER NOT NULL,
              delivered INTEGER NOT NULL DEFAULT 0,
              delivered_at INTEGER,
              receipt TEXT,
              fallback_sent_count INTEGER NOT NULL DEFAULT 0,
              fallback_sent_at INTEGER,
              fallback_excluded INTEGER NOT NULL DEFAULT 0,
              last_error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_outbox_due ON outbox(delivered, next_attempt_at);

            CREATE TABLE IF NOT EXISTS outbox_archive (
              event_id TEXT PRIMARY KEY,
              payload_json TEXT NOT NULL,
              enqueued_at INTEGER NOT NULL,
              attempt_count INTEGER NOT NULL,
              archived_at INTEGER NOT NULL,
              reason TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS outbox_quarantine (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              event_id TEXT,
              payload_json TEXT,
              quarantined_at INTEGER NOT NULL,
              detail TEXT NOT NULL
            );
            "#,
        )?;
        let seed = rand::random::<u64>();
        Ok(Self {
            conn: Mutex::new(conn),
            settings,
            clock,
            health,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        })
    }

    /// Use a fixed jitter seed, for deterministic replay.
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // Statements are atomic and transactions roll back on drop, so the
        // connection is usable after a panic elsewhere.
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Durably append a decision. Re-enqueueing the same event_id is a no-op.
    pub fn enqueue(&self, record: &DecisionRecord) -> AgentResult<String> {
        let payload = serde_json::to_string(record).map_err(|e| AgentError::StorageCorruption {
            key: format!("outbox:{}", record.event_id),
            detail: format!("encode: {}", e),
        })?;
        let hash = Sha256::digest(payload.as_bytes()).to_vec();
        let now = sql_i64(self.clock.now_ms());
        self.conn().execute(
            r#"
            INSERT OR IGNORE INTO outbox(event_id, payload_json, payload_hash, enqueued_at, next_attempt_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            "#,
            params![record.event_id, payload, hash, now],
        )?;
        Ok(record.event_id.clone())
    }

    /// Undelivered entries due for a primary attempt, oldest first.
    ///
    /// Rows that fail to decode are quarantined and counted, never returned.
    pub fn drain(&self, max_batch: usize) -> AgentResult<Vec<QueueEntry>> {
        let now = sql_i64(self.clock.now_ms());
        let sql = format!(
            "SELECT {} FROM outbox WHERE delivered = 0 AND next_attempt_at <= ?1 ORDER BY seq ASC LIMIT ?2",
            ENTRY_COLUMNS
        );
        self.select_entries(&sql, params![now, max_batch as i64])
    }

    /// Undelivered entries eligible for the fallback uplink, oldest first.
    pub fn drain_for_fallback(
        &self,
        max_batch: usize,
        scope: FallbackScope,
    ) -> AgentResult<Vec<QueueEntry>> {
        let min_attempts = match scope {
            FallbackScope::AllUnsent => 0,
            FallbackScope::Exhausted => self.settings.max_attempts,
        };
        let sql = format!(
            "SELECT {} FROM outbox WHERE delivered = 0 AND fallback_sent_count = 0 \
             AND fallback_excluded = 0 AND attempt_count >= ?1 ORDER BY seq ASC LIMIT ?2",
            ENTRY_COLUMNS
        );
        self.select_entries(&sql, params![min_attempts, max_batch as i64])
    }

    /// All undelivered entries regardless of schedule, oldest first.
    pub fn pending(&self, limit: usize) -> AgentResult<Vec<QueueEntry>> {
        let sql = format!(
            "SELECT {} FROM outbox WHERE delivered = 0 ORDER BY seq ASC LIMIT ?1",
            ENTRY_COLUMNS
        );
        self.select_entries(&sql, params![limit as i64])
    }

    fn select_entries(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> AgentResult<Vec<QueueEntry>> {
        let mut conn = self.conn();
        let mut entries = Vec::new();
        let mut corrupt = Vec::new();
        {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query(args)?;
            while let Some(row) = rows.next()? {
                let raw = RawRow::read(row)?;
                match raw.decode() {
                    Ok(entry) => entries.push(entry),
                    Err(detail) => corrupt.push((raw, detail)),
                }
            }
        }
        if !corrupt.is_empty() {
            let now = sql_i64(self.clock.now_ms());
            let tx = conn.transaction()?;
            for (raw, detail) in &corrupt {
                tx.execute(
                    "INSERT INTO outbox_quarantine(event_id, payload_json, quarantined_at, detail) VALUES (?1, ?2, ?3, ?4)",
                    params![raw.event_id, raw.payload_json, now, detail],
                )?;
                tx.execute("DELETE FROM outbox WHERE seq = ?1", params![raw.seq])?;
            }
            tx.commit()?;
            for (raw, detail) in &corrupt {
                let err = AgentError::StorageCorruption {
                    key: format!("outbox:{}", raw.event_id),
                    detail: detail.clone(),
                };
                log::warn!("queue: quarantined entry: {}", err);
                self.health.record(&err);
            }
        }
        Ok(entries)
    }

    /// Mark delivered. Returns false when already acknowledged or unknown.
    pub fn ack(&self, event_id: &str, receipt: &str) -> AgentResult<bool> {
        let now = sql_i64(self.clock.now_ms());
        let changed = self.conn().execute(
            "UPDATE outbox SET delivered = 1, delivered_at = ?1, receipt = ?2 WHERE event_id = ?3 AND delivered = 0",
            params![now, receipt, event_id],
        )?;
        Ok(changed > 0)
    }

    /// Record a failed primary attempt and schedule the next one.
    ///
    /// Returns the new `next_attempt_at`, or `None` when the entry is gone
    /// or already delivered. The schedule never moves earlier.
    pub fn fail(&self, event_id: &str, error: &str) -> AgentResult<Option<u64>> {
        let now = self.clock.now_ms();
        let conn = self.conn();
        let row: Option<(i64, i64, i64)> = conn
            .query_row(
                "SELECT attempt_count, next_attempt_at, fallback_sent_count FROM outbox WHERE event_id = ?1 AND delivered = 0",
                params![event_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?;
        let Some((attempts, prev_next, fallback_sent)) = row else {
            return Ok(None);
        };
        let attempts = u32::try_from(attempts).unwrap_or(0).saturating_add(1);
        let mut delay = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            self.settings.backoff.delay_ms(attempts, &mut *rng)
        };
        if fallback_sent > 0 {
            delay = delay.max(self.settings.fallback_primary_retry_ms);
        }
        let next = now.saturating_add(delay).max(sql_u64(prev_next));
        conn.execute(
            "UPDATE outbox SET attempt_count = ?1, next_attempt_at = ?2, last_error = ?3 WHERE event_id = ?4",
            params![attempts, sql_i64(next), error, event_id],
        )?;
        if attempts == self.settings.max_attempts {
            log::warn!(
                "queue: {} reached {} primary attempts; eligible for fallback",
                event_id,
                attempts
            );
        }
        Ok(Some(next))
    }

    /// Tag an entry as sent over the fallback uplink and slow its primary
    /// retries down to the reduced rate.
    pub fn mark_fallback_sent(&self, event_id: &str) -> AgentResult<bool> {
        let now = self.clock.now_ms();
        let retry_at = sql_i64(now.saturating_add(self.settings.fallback_primary_retry_ms));
        let changed = self.conn().execute(
            r#"
            UPDATE outbox SET
              fallback_sent_count = fallback_sent_count + 1,
              fallback_sent_at = ?1,
              next_attempt_at = MAX(next_attempt_at, ?2)
            WHERE event_id = ?3 AND delivered = 0
            "#,
            params![sql_i64(now), retry_at, event_id],
        )?;
        Ok(changed > 0)
    }

    /// Keep an entry off the fallback uplink. Primary delivery is unaffected.
    pub fn exclude_from_fallback(&self, event_id: &str, detail: &str) -> AgentResult<bool> {
        let changed = self.conn().execute(
            "UPDATE outbox SET fallback_excluded = 1, last_error = ?1 WHERE event_id = ?2 AND delivered = 0",
            params![detail, event_id],
        )?;
        Ok(changed > 0)
    }

    /// Move an undelivered entry to the archive with `reason`.
    pub fn archive(&self, event_id: &str, reason: &str) -> AgentResult<bool> {
        let now = sql_i64(self.clock.now_ms());
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let moved = tx.execute(
            r#"
            INSERT OR REPLACE INTO outbox_archive(event_id, payload_json, enqueued_at, attempt_count, archived_at, reason)
            SELECT event_id, payload_json, enqueued_at, attempt_count, ?1, ?2
            FROM outbox WHERE event_id = ?3 AND delivered = 0
            "#,
            params![now, reason, event_id],
        )?;
        tx.execute(
            "DELETE FROM outbox WHERE event_id = ?1 AND delivered = 0",
            params![event_id],
        )?;
        tx.commit()?;
        Ok(moved > 0)
    }

    /// Drop acknowledged rows and archive undelivered rows past retention.
    pub fn purge(&self) -> AgentResult<PurgeReport> {
        let now = self.clock.now_ms();
        let cutoff = sql_i64(now.saturating_sub(self.settings.retention_ms));
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let delivered_removed = tx.execute("DELETE FROM outbox WHERE delivered = 1", [])?;
        let expired_archived = tx.execute(
            r#"
            INSERT OR REPLACE INTO outbox_archive(event_id, payload_json, enqueued_at, attempt_count, archived_at, reason)
            SELECT event_id, payload_json, enqueued_at, attempt_count, ?1, ?2
            FROM outbox WHERE delivered = 0 AND enqueued_at < ?3
            "#,
            params![sql_i64(now), RETENTION_EXPIRED, cutoff],
        )?;
        tx.execute(
            "DELETE FROM outbox WHERE delivered = 0 AND enqueued_at < ?1",
            params![cutoff],
        )?;
        tx.commit()?;
        if expired_archived > 0 {
            self.health
                .add(Counter::RetentionExpired, expired_archived as u64);
            log::warn!(
                "queue: archived {} undelivered entries past retention",
                expired_archived
            );
        }
        Ok(PurgeReport {
            delivered_removed,
            expired_archived,
        })
    }

    pub fn stats(&self) -> AgentResult<QueueStats> {
        let now = self.clock.now_ms();
        let conn = self.conn();
        let count = |sql: &str| -> AgentResult<u64> {
            let n: i64 = conn.query_row(sql, [], |r| r.get(0))?;
            Ok(sql_u64(n))
        };
        let pending = count("SELECT COUNT(*) FROM outbox WHERE delivered = 0")?;
        let delivered = count("SELECT COUNT(*) FROM outbox WHERE delivered = 1")?;
        let fallback_sent =
            count("SELECT COUNT(*) FROM outbox WHERE delivered = 0 AND fallback_sent_count > 0")?;
        let archived = count("SELECT COUNT(*) FROM outbox_archive")?;
        let quarantined = count("SELECT COUNT(*) FROM outbox_quarantine")?;
        let due: i64 = conn.query_row(
            "SELECT COUNT(*) FROM outbox WHERE delivered = 0 AND next_attempt_at <= ?1",
            params![sql_i64(now)],
            |r| r.get(0),
        )?;
        let oldest: Option<i64> = conn.query_row(
            "SELECT MIN(enqueued_at) FROM outbox WHERE delivered = 0",
            [],
            |r| r.get(0),
        )?;
        Ok(QueueStats {
            pending,
            due: sql_u64(due),
            delivered,
            fallback_sent,
            archived,
            quarantined,
            oldest_pending_age_ms: oldest.map(|t| now.saturating_sub(sql_u64(t))),
        })
    }

    pub fn list_archived(&self, limit: usize) -> AgentResult<Vec<ArchivedEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT event_id, enqueued_at, attempt_count, archived_at, reason
            FROM outbox_archive ORDER BY archived_at DESC, event_id ASC LIMIT ?1
            "#,
        )?;
        let rows = stmt.query_map(params![limit as i64], |r| {
            Ok(ArchivedEntry {
                event_id: r.get(0)?,
                enqueued_at: sql_u64(r.get(1)?),
                attempt_count: u32::try_from(r.get::<_, i64>(2)?).unwrap_or(0),
                archived_at: sql_u64(r.get(3)?),
                reason: r.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

/// Undecoded outbox row.
struct RawRow {
    seq: i64,
    event_id: String,
    payload_json: String,
    payload_hash: Vec<u8>,
    enqueued_at: i64,
    attempt_count: i64,
    next_attempt_at: i64,
    delivered: bool,
    fallback_sent_count: i64,
    fallback_sent_at: Option<i64>,
    last_error: Option<String>,
}

impl RawRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            event_id: row.get(1)?,
            payload_json: row.get(2)?,
            payload_hash: row.get(3)?,
            enqueued_at: row.get(4)?,
            attempt_count: row.get(5)?,
            next_attempt_at: row.get(6)?,
            delivered: row.get::<_, i64>(7)? != 0,
            fallback_sent_count: row.get(8)?,
            fallback_sent_at: row.get(9)?,
            last_error: row.get(10)?,
        })
    }

    fn decode(&self) -> Result<QueueEntry, String> {
        let hash = Sha256::digest(self.payload_json.as_bytes());
        if hash.as_slice() != self.payload_hash.as_slice() {
            return Err("payload checksum mismatch".to_string());
        }
        let record: DecisionRecord = serde_json::from_str(&self.payload_json)
            .map_err(|e| format!("payload decode: {}", e))?;
        if record.event_id != self.event_id {
            return Err(format!(
                "payload event_id {} does not match row",
                record.event_id
            ));
        }
        let route = match (self.fallback_sent_count, self.fallback_sent_at) {
            (n, Some(at)) if n > 0 => DeliveryRoute::FallbackSent {
                count: u32::try_from(n).unwrap_or(u32::MAX),
                at: sql_u64(at),
            },
            _ => DeliveryRoute::Primary,
        };
        Ok(QueueEntry {
            seq: self.seq,
            record,
            enqueued_at: sql_u64(self.enqueued_at),
            attempt_count: u32::try_from(self.attempt_count).unwrap_or(0),
            next_attempt_at: sql_u64(self.next_attempt_at),
            delivered: self.delivered,
            route,
            last_error: self.last_error.clone(),
        })
    }
}
