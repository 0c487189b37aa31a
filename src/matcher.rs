//! Matcher: cosine similarity plus the multi-sample consensus state machine.
//!
//! ```text
//! Idle --probe--> Sampling --K votes | window expired--> Deciding --emit--> Done
//!   ^                                                                        |
//!   +----------------------------- cooldown elapsed ------------------------+
//! ```
//!
//! Each embedded frame casts at most one vote: the identity with the best
//! best-reference similarity when it clears the accept threshold, or
//! "unknown" when it lands in the review band. Exactly one record is emitted
//! per attempt.

use crate::cache::Snapshot;
use crate::detect::Embedding;
use crate::{new_event_id, AccessMode, Decision, DecisionRecord};

/// Cosine similarity in [-1, 1]. Zero when either vector has zero norm or
/// the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    let denom = na.sqrt() * nb.sqrt();
    if !(denom.is_finite() && denom > 0.0) {
        return 0.0;
    }
    (dot / denom).clamp(-1.0, 1.0)
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MatcherSettings {
    /// Inclusive similarity needed for an identity vote.
    pub accept_threshold: f32,
    /// Inclusive lower edge of the review band `[review_floor, accept_threshold)`.
    pub review_floor: f32,
    /// Votes needed to resolve an attempt.
    pub consensus_k: usize,
    /// Attempt window, measured from the first frame of the attempt.
    pub window_ms: u64,
    /// Quiet period after a decision before a new attempt may start.
    pub cooldown_ms: u64,
}

impl Default for MatcherSettings {
    fn default() -> Self {
        Self {
            accept_threshold: 0.90,
            review_floor: 0.80,
            consensus_k: 3,
            window_ms: 2_000,
            cooldown_ms: 3_000,
        }
    }
}

/// Best candidate for one probe.
#[derive(Clone, Debug, PartialEq)]
pub struct BestMatch {
    pub identity_id: String,
    pub similarity: f32,
}

/// Highest best-reference similarity across the snapshot.
///
/// Only references with the probe's model_version and dimension are
/// comparable. Ties keep the first identity in id order.
pub fn best_match(snapshot: &Snapshot, probe: &Embedding) -> Option<BestMatch> {
    let mut best: Option<BestMatch> = None;
    for (identity_id, refs) in &snapshot.entries {
        let identity_best = refs
            .iter()
            .filter(|r| r.model_version == probe.model_version && r.dim() == probe.dim())
            .map(|r| cosine_similarity(&probe.vector, &r.vector))
            .fold(None, |acc: Option<f32>, s| Some(acc.map_or(s, |a| a.max(s))));
        let Some(similarity) = identity_best else {
            continue;
        };
        if best.as_ref().map_or(true, |b| similarity > b.similarity) {
            best = Some(BestMatch {
                identity_id: identity_id.clone(),
                similarity,
            });
        }
    }
    best
}

#[derive(Clone, Debug, PartialEq)]
enum Vote {
    Identity { identity_id: String, similarity: f32 },
    Unknown { similarity: f32 },
}

impl Vote {
    fn similarity(&self) -> f32 {
        match self {
            Vote::Identity { similarity, .. } | Vote::Unknown { similarity } => *similarity,
        }
    }
}

#[derive(Clone, Debug)]
struct Attempt {
    started_at: u64,
    model_version: String,
    votes: Vec<Vote>,
    /// Highest similarity seen on any frame, voting or not.
    best_similarity: Option<f32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Trigger {
    Consensus,
    WindowExpired,
}

#[derive(Clone, Debug)]
enum State {
    Idle,
    Sampling(Attempt),
    Deciding(Attempt, Trigger),
    Done { completed_at: u64 },
}

/// Externally visible phase, for logging and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Sampling,
    Deciding,
    Done,
}

pub struct Matcher {
    settings: MatcherSettings,
    mode: AccessMode,
    state: State,
}

impl Matcher {
    pub fn new(settings: MatcherSettings, mode: AccessMode) -> Self {
        Self {
            settings: MatcherSettings {
                consensus_k: settings.consensus_k.max(1),
                ..settings
            },
            mode,
            state: State::Idle,
        }
    }

    pub fn settings(&self) -> &MatcherSettings {
        &self.settings
    }

    pub fn phase(&self) -> Phase {
        match self.state {
            State::Idle => Phase::Idle,
            State::Sampling(_) => Phase::Sampling,
            State::Deciding(..) => Phase::Deciding,
            State::Done { .. } => Phase::Done,
        }
    }

    /// Feed one embedded probe captured at `captured_at`.
    ///
    /// Returns the attempt's decision when this frame completes it (or when
    /// it was captured after the window expired). The window is judged by
    /// capture time, so slow inference does not cost a vote; `now` is used
    /// for latency only.
    pub fn observe(
        &mut self,
        snapshot: &Snapshot,
        probe: &Embedding,
        captured_at: u64,
        now: u64,
    ) -> Option<DecisionRecord> {
        if let Some(expired) = self.poll(captured_at) {
            return Some(expired);
        }
        if let State::Done { completed_at } = self.state {
            if captured_at < completed_at.saturating_add(self.settings.cooldown_ms) {
                log::debug!("matcher: frame at {} inside cooldown", captured_at);
                return None;
            }
            self.state = State::Idle;
        }
        if matches!(self.state, State::Idle) {
            self.state = State::Sampling(Attempt {
                started_at: captured_at,
                model_version: probe.model_version.clone(),
                votes: Vec::new(),
                best_similarity: None,
            });
        }

        let candidate = best_match(snapshot, probe);
        let State::Sampling(attempt) = &mut self.state else {
            return None;
        };
        if let Some(m) = candidate {
            attempt.best_similarity = Some(
                attempt
                    .best_similarity
                    .map_or(m.similarity, |b| b.max(m.similarity)),
            );
            let vote = if m.similarity >= self.settings.accept_threshold {
                Some(Vote::Identity {
                    identity_id: m.identity_id,
                    similarity: m.similarity,
                })
            } else if m.similarity >= self.settings.review_floor {
                Some(Vote::Unknown {
                    similarity: m.similarity,
                })
            } else {
                None
            };
            if let Some(vote) = vote {
                attempt.votes.push(vote);
            }
        }
        if attempt.votes.len() >= self.settings.consensus_k {
            let attempt = attempt.clone();
            self.state = State::Deciding(attempt, Trigger::Consensus);
            return self.decide(captured_at, now);
        }
        None
    }

    /// Resolve the open attempt if its window has elapsed by `now`.
    pub fn poll(&mut self, now: u64) -> Option<DecisionRecord> {
        let State::Sampling(attempt) = &self.state else {
            return None;
        };
        if now.saturating_sub(attempt.started_at) <= self.settings.window_ms {
            return None;
        }
        let attempt = attempt.clone();
        let deadline = attempt.started_at.saturating_add(self.settings.window_ms);
        self.state = State::Deciding(attempt, Trigger::WindowExpired);
        self.decide(deadline, now)
    }

    fn decide(&mut self, completed_at: u64, now: u64) -> Option<DecisionRecord> {
        let (attempt, trigger) =
            match std::mem::replace(&mut self.state, State::Done { completed_at }) {
                State::Deciding(attempt, trigger) => (attempt, trigger),
                other => {
                    self.state = other;
                    return None;
                }
            };

        let highest = attempt
            .votes
            .iter()
            .map(Vote::similarity)
            .fold(None, |acc: Option<f32>, s| Some(acc.map_or(s, |a| a.max(s))));
        let (decision, identity_id, similarity, reason) = match (trigger, highest) {
            (_, None) => (Decision::Deny, None, attempt.best_similarity, "no_votes"),
            (Trigger::WindowExpired, Some(s)) => (Decision::Review, None, Some(s), "window_expired"),
            (Trigger::Consensus, Some(s)) => match unanimous(&attempt.votes) {
                Some(identity_id) => (Decision::Allow, Some(identity_id), Some(s), "consensus"),
                None if has_conflict(&attempt.votes) => {
                    (Decision::Review, None, Some(s), "identity_disagreement")
                }
                None => (Decision::Review, None, Some(s), "review_band"),
            },
        };

        let record = DecisionRecord {
            event_id: new_event_id(),
            captured_at: attempt.started_at,
            identity_id,
            similarity,
            decision,
            mode: self.mode,
            model_version: attempt.model_version,
            latency_ms: now.saturating_sub(attempt.started_at),
            reason: Some(reason.to_string()),
        };
        log::debug!(
            "matcher: {} identity={:?} similarity={:?} reason={} votes={}",
            record.decision,
            record.identity_id,
            record.similarity,
            reason,
            attempt.votes.len()
        );
        Some(record)
    }
}

/// The shared identity when every vote names the same one.
fn unanimous(votes: &[Vote]) -> Option<String> {
    let mut identity: Option<&str> = None;
    for vote in votes {
        match vote {
            Vote::Identity { identity_id, .. } => match identity {
                None => identity = Some(identity_id.as_str()),
                Some(seen) if seen == identity_id.as_str() => {}
                Some(_) => return None,
            },
            Vote::Unknown { .. } => return None,
        }
    }
    identity.map(str::to_string)
}

fn has_conflict(votes: &[Vote]) -> bool {
    let mut ids = votes.iter().filter_map(|v| match v {
        Vote::Identity { identity_id, .. } => Some(identity_id.as_str()),
        Vote::Unknown { .. } => None,
    });
    match ids.next() {
        Some(first) => ids.any(|id| id != first),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdentityReference;
    use std::collections::{BTreeMap, HashSet};

    fn unit(i: usize, dim: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[i] = 1.0;
        v
    }

    fn snapshot(ids: &[&str]) -> Snapshot {
        let mut entries = BTreeMap::new();
        for (i, id) in ids.iter().enumerate() {
            entries.insert(
                id.to_string(),
                vec![IdentityReference {
                    identity_id: id.to_string(),
                    vector: unit(i, 4).into(),
                    model_version: "m1".to_string(),
                    quality_score: 1.0,
                    created_at: 1,
                }],
            );
        }
        Snapshot {
            location_id: "lobby".to_string(),
            as_of: 1,
            version: 1,
            entries,
        }
    }

    fn probe(v: Vec<f32>) -> Embedding {
        Embedding {
            vector: v,
            model_version: "m1".to_string(),
        }
    }

    fn matcher() -> Matcher {
        Matcher::new(MatcherSettings::default(), AccessMode::Entry)
    }

    #[test]
    fn cosine_of_identical_and_orthogonal() {
        let a = [0.6, 0.8, 0.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn best_reference_rule_takes_max_per_identity() {
        let mut snap = snapshot(&["alice"]);
        snap.entries.get_mut("alice").unwrap().push(IdentityReference {
            identity_id: "alice".to_string(),
            vector: unit(1, 4).into(),
            model_version: "m1".to_string(),
            quality_score: 1.0,
            created_at: 2,
        });
        let m = best_match(&snap, &probe(unit(1, 4))).unwrap();
        assert_eq!(m.identity_id, "alice");
        assert!((m.similarity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn other_model_versions_are_not_compared() {
        let snap = snapshot(&["alice"]);
        let mut p = probe(unit(0, 4));
        p.model_version = "m2".to_string();
        assert!(best_match(&snap, &p).is_none());
    }

    #[test]
    fn three_votes_for_same_identity_allow() {
        let snap = snapshot(&["alice", "bob", "carol"]);
        let mut m = matcher();
        assert!(m.observe(&snap, &probe(unit(0, 4)), 1_000, 1_000).is_none());
        assert_eq!(m.phase(), Phase::Sampling);
        assert!(m.observe(&snap, &probe(unit(0, 4)), 1_500, 1_500).is_none());
        let record = m.observe(&snap, &probe(unit(0, 4)), 2_000, 2_050).unwrap();
        assert_eq!(record.decision, Decision::Allow);
        assert_eq!(record.identity_id.as_deref(), Some("alice"));
        assert_eq!(record.captured_at, 1_000);
        assert_eq!(record.latency_ms, 1_050);
        assert_eq!(m.phase(), Phase::Done);
    }

    #[test]
    fn three_different_identities_review_without_identity() {
        let snap = snapshot(&["alice", "bob", "carol"]);
        let mut m = matcher();
        m.observe(&snap, &probe(unit(0, 4)), 1_000, 1_000);
        m.observe(&snap, &probe(unit(1, 4)), 1_400, 1_400);
        let record = m.observe(&snap, &probe(unit(2, 4)), 1_800, 1_800).unwrap();
        assert_eq!(record.decision, Decision::Review);
        assert_eq!(record.identity_id, None);
        assert_eq!(record.reason.as_deref(), Some("identity_disagreement"));
        assert!((record.similarity.unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn window_expiry_without_votes_denies() {
        let snap = snapshot(&["alice"]);
        let mut m = matcher();
        assert!(m.observe(&snap, &probe(unit(1, 4)), 1_000, 1_000).is_none());
        assert!(m.poll(3_000).is_none());
        let record = m.poll(3_001).unwrap();
        assert_eq!(record.decision, Decision::Deny);
        assert_eq!(record.similarity, Some(0.0));
        assert_eq!(record.reason.as_deref(), Some("no_votes"));
        assert!(m.poll(10_000).is_none());
    }

    #[test]
    fn window_expiry_with_partial_votes_reviews() {
        let snap = snapshot(&["alice"]);
        let mut m = matcher();
        m.observe(&snap, &probe(unit(0, 4)), 1_000, 1_000);
        let record = m.observe(&snap, &probe(unit(0, 4)), 3_500, 3_500).unwrap();
        assert_eq!(record.decision, Decision::Review);
        assert_eq!(record.reason.as_deref(), Some("window_expired"));
        assert_eq!(record.identity_id, None);
    }

    #[test]
    fn late_processed_frame_captured_inside_window_still_votes() {
        let snap = snapshot(&["alice"]);
        let mut m = matcher();
        m.observe(&snap, &probe(unit(0, 4)), 1_000, 1_000);
        m.observe(&snap, &probe(unit(0, 4)), 1_500, 1_500);
        let record = m.observe(&snap, &probe(unit(0, 4)), 2_900, 3_400).unwrap();
        assert_eq!(record.decision, Decision::Allow);
        assert_eq!(record.identity_id.as_deref(), Some("alice"));
        assert_eq!(record.latency_ms, 2_400);
    }

    #[test]
    fn cooldown_suppresses_duplicate_decisions() {
        let snap = snapshot(&["alice"]);
        let mut m = Matcher::new(
            MatcherSettings {
                consensus_k: 1,
                ..MatcherSettings::default()
            },
            AccessMode::Exit,
        );
        let first = m.observe(&snap, &probe(unit(0, 4)), 1_000, 1_000).unwrap();
        assert_eq!(first.mode, AccessMode::Exit);
        assert!(m.observe(&snap, &probe(unit(0, 4)), 2_000, 2_000).is_none());
        assert!(m.observe(&snap, &probe(unit(0, 4)), 3_999, 3_999).is_none());
        let second = m.observe(&snap, &probe(unit(0, 4)), 4_000, 4_000).unwrap();
        assert_ne!(first.event_id, second.event_id);
    }

    #[test]
    fn one_record_per_attempt_with_unique_ids() {
        let snap = snapshot(&["alice", "bob"]);
        let mut m = matcher();
        let mut ids = HashSet::new();
        let mut t = 0;
        for i in 0..200 {
            t += 250;
            let p = probe(unit(i % 3, 4));
            if let Some(r) = m.observe(&snap, &p, t, t) {
                assert!(ids.insert(r.event_id));
            }
        }
        // 50 seconds of frames with a 3 s cooldown bounds the attempt count.
        assert!(!ids.is_empty() && ids.len() <= 50_000 / 3_000 + 1);
    }
}
