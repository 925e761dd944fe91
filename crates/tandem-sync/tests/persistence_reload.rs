//! Durable state: change log replay, snapshots, peer bookkeeping and
//! corruption handling across restarts.

use std::path::Path;
use std::sync::Arc;

use tandem_core::{ActorId, EntityId, TandemError};
use tandem_sync::store::JsonStore;
use tandem_sync::{ManualClock, Mutation, Replica, ReplicaIdentity, ReplicaOptions, VectorClock};

fn open(dir: &Path) -> Result<Replica, TandemError> {
    Replica::open_with_clock(
        ReplicaIdentity::with_actor("actor-a"),
        Box::new(JsonStore::open(dir)?),
        ReplicaOptions::default(),
        Arc::new(ManualClock::new(5_000)),
    )
}

fn session() -> EntityId {
    EntityId::new("session-s")
}

#[test]
fn log_replays_after_restart() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let r = open(tmp.path()).unwrap();
        r.emit_local_change(&session(), Mutation::set("title", "Trip")).unwrap();
        r.emit_local_change(&session(), Mutation::insert("messages", 0, "hello"))
            .unwrap();
    }

    let r = open(tmp.path()).unwrap();
    assert_eq!(r.change_count(), 2);
    let doc = r.document(&session()).unwrap();
    assert_eq!(doc["title"], "Trip");
    assert_eq!(doc["messages"], serde_json::json!(["hello"]));

    let next = r.emit_local_change(&session(), Mutation::add("tags", "x")).unwrap();
    assert_eq!(next.seq, 3);
}

#[test]
fn snapshot_plus_tail_matches_full_replay() {
    let tmp = tempfile::tempdir().unwrap();
    let expected = {
        let r = open(tmp.path()).unwrap();
        for i in 0..5 {
            r.emit_local_change(&session(), Mutation::insert("messages", i, format!("m{i}")))
                .unwrap();
        }
        r.checkpoint().unwrap();
        r.emit_local_change(&session(), Mutation::remove_at("messages", 2))
            .unwrap();
        r.emit_local_change(&EntityId::new("other"), Mutation::set("k", 1))
            .unwrap();
        (r.document(&session()), r.combined_root())
    };
    assert!(tmp.path().join("snapshot.json").exists());

    let r = open(tmp.path()).unwrap();
    assert_eq!((r.document(&session()), r.combined_root()), expected);
    assert_eq!(r.document(&EntityId::new("other")).unwrap()["k"], 1);
}

#[test]
fn unreadable_snapshot_falls_back_to_the_log() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let r = open(tmp.path()).unwrap();
        r.emit_local_change(&session(), Mutation::set("title", "kept")).unwrap();
        r.checkpoint().unwrap();
    }
    std::fs::write(tmp.path().join("snapshot.json"), b"{ not json").unwrap();

    let r = open(tmp.path()).unwrap();
    assert_eq!(r.document(&session()).unwrap()["title"], "kept");
}

#[test]
fn damaged_log_line_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let r = open(tmp.path()).unwrap();
        r.emit_local_change(&session(), Mutation::set("title", "x")).unwrap();
    }
    let log = tmp.path().join("changes.jsonl");
    let mut content = std::fs::read_to_string(&log).unwrap();
    content.push_str("{\"id\":\"actor-a:2\",\"trunc\n");
    std::fs::write(&log, content).unwrap();

    let err = open(tmp.path()).err().unwrap();
    assert!(matches!(err, TandemError::CorruptLog(ref msg) if msg.contains("line 2")));
    assert!(!err.is_recoverable());
}

#[test]
fn torn_final_record_does_not_block_reopen() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let r = open(tmp.path()).unwrap();
        r.emit_local_change(&session(), Mutation::set("title", "x")).unwrap();
    }
    let log = tmp.path().join("changes.jsonl");
    let mut content = std::fs::read_to_string(&log).unwrap();
    content.push_str("{\"id\":\"actor-a:2\",\"deps\":[");
    std::fs::write(&log, content).unwrap();

    {
        let r = open(tmp.path()).unwrap();
        assert_eq!(r.change_count(), 1);
        let next = r.emit_local_change(&session(), Mutation::set("title", "y")).unwrap();
        assert_eq!(next.seq, 2);
    }
    let r = open(tmp.path()).unwrap();
    assert_eq!(r.change_count(), 2);
    assert_eq!(r.document(&session()).unwrap()["title"], "y");
}

#[test]
fn log_with_a_hole_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let r = open(tmp.path()).unwrap();
        for i in 0..3 {
            r.emit_local_change(&session(), Mutation::set("n", i)).unwrap();
        }
    }
    let log = tmp.path().join("changes.jsonl");
    let lines: Vec<String> = std::fs::read_to_string(&log)
        .unwrap()
        .lines()
        .enumerate()
        .filter(|(i, _)| *i != 1)
        .map(|(_, l)| format!("{l}\n"))
        .collect();
    std::fs::write(&log, lines.concat()).unwrap();

    assert!(matches!(open(tmp.path()), Err(TandemError::CorruptLog(_))));
}

#[test]
fn peer_state_survives_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let peer = ActorId::new("actor-b");
    {
        let r = open(tmp.path()).unwrap();
        r.emit_local_change(&session(), Mutation::set("title", "x")).unwrap();
        r.record_peer_hello(&peer, &VectorClock::new()).unwrap();
        r.mark_synced(&peer, &r.clock()).unwrap();
    }

    let r = open(tmp.path()).unwrap();
    let status = r.get_sync_status(&peer).unwrap();
    assert_eq!(status.last_synced_at, Some(5_000));
    assert_eq!(status.pending_change_count, 0);

    r.emit_local_change(&session(), Mutation::set("title", "y")).unwrap();
    assert_eq!(r.get_sync_status(&peer).unwrap().pending_change_count, 1);

    assert!(r.forget_peer(&peer).unwrap());
    drop(r);
    let r = open(tmp.path()).unwrap();
    assert!(r.get_sync_status(&peer).is_err());
}

#[test]
fn collected_tombstones_stay_collected() {
    let tmp = tempfile::tempdir().unwrap();
    let peer = ActorId::new("actor-b");
    let before = {
        let r = open(tmp.path()).unwrap();
        r.emit_local_change(&session(), Mutation::insert("messages", 0, "a")).unwrap();
        r.emit_local_change(&session(), Mutation::insert("messages", 1, "b")).unwrap();
        r.emit_local_change(&session(), Mutation::remove_at("messages", 0)).unwrap();
        r.record_peer_hello(&peer, &r.clock()).unwrap();

        let report = r.collect_garbage(5_000).unwrap();
        assert!(report.purged > 0);
        r.checkpoint().unwrap();
        r.stats().tombstones
    };

    let r = open(tmp.path()).unwrap();
    assert_eq!(r.stats().tombstones, before);
    assert_eq!(r.document(&session()).unwrap()["messages"], serde_json::json!(["b"]));
}
