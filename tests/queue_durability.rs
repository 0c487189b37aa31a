mod common;

use std::sync::Arc;

use edge_agent::queue::QueueSettings;
use edge_agent::{Decision, DecisionQueue, Health, ManualClock};

use common::decision;

fn open(path: &str, clock: Arc<ManualClock>) -> DecisionQueue {
    DecisionQueue::open(path, QueueSettings::default(), clock, Arc::new(Health::new()))
        .expect("open queue")
}

#[test]
fn entries_survive_reopen_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent.db");
    let path = path.to_str().unwrap();
    let clock = ManualClock::new(5_000);

    let mut ids = Vec::new();
    {
        let queue = open(path, clock.clone());
        for (i, d) in [Decision::Allow, Decision::Deny, Decision::Review, Decision::Allow]
            .into_iter()
            .enumerate()
        {
            clock.advance(10);
            ids.push(queue.enqueue(&decision(d, 4_000 + i as u64)).unwrap());
        }
        assert!(queue.ack(&ids[1], "rcpt-1").unwrap());
        queue.fail(&ids[2], "timeout").unwrap();
    }

    let queue = open(path, clock.clone());
    let pending = queue.pending(10).unwrap();
    let reopened: Vec<&str> = pending.iter().map(|e| e.event_id()).collect();
    assert_eq!(reopened, vec![ids[0].as_str(), ids[2].as_str(), ids[3].as_str()]);
    assert_eq!(pending[1].attempt_count, 1);
    assert_eq!(pending[1].last_error.as_deref(), Some("timeout"));
    assert_eq!(pending[0].record.decision, Decision::Allow);

    let stats = queue.stats().unwrap();
    assert_eq!(stats.pending, 3);
    assert_eq!(stats.delivered, 1);
}

#[test]
fn enqueue_is_idempotent_per_event() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent.db");
    let clock = ManualClock::new(1_000);
    let queue = open(path.to_str().unwrap(), clock);
    let record = decision(Decision::Deny, 900);
    queue.enqueue(&record).unwrap();
    queue.enqueue(&record).unwrap();
    assert_eq!(queue.pending(10).unwrap().len(), 1);
}

#[test]
fn unopenable_path_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing").join("agent.db");
    let result = DecisionQueue::open(
        path.to_str().unwrap(),
        QueueSettings::default(),
        ManualClock::new(0),
        Arc::new(Health::new()),
    );
    assert!(result.is_err());
}
