use std::fs;
use std::thread;
use std::time::Duration;

use swarm::config::{Consistency, MemoryConfig};
use swarm::{MemoryStore, SwarmError};

mod helpers;
use helpers::{unique_test_temp_dir, wait_until};

fn config(consistency: Consistency, replication_factor: usize) -> MemoryConfig {
    MemoryConfig {
        consistency,
        replication_factor,
        replication_retry_ms: 5,
        flush_timeout_ms: 500,
        ..MemoryConfig::default()
    }
}

#[test]
fn ttl_expiry_is_visible_without_a_sweep() {
    let store = MemoryStore::new(config(Consistency::Eventual, 1));
    store
        .put("session", "token", "abc", Some(Duration::from_millis(100)))
        .expect("put");
    assert_eq!(store.get("session", "token").expect("fresh"), b"abc");

    thread::sleep(Duration::from_millis(150));
    assert!(matches!(
        store.get("session", "token"),
        Err(SwarmError::NotFound(_))
    ));
    assert!(store.list_keys("session").is_empty());
    store.shutdown().expect("shutdown");
}

#[test]
fn eventual_writes_converge_on_every_replica() {
    let store = MemoryStore::new(MemoryConfig {
        replication_delay_ms: 40,
        ..config(Consistency::Eventual, 3)
    });
    store.put("ns", "k", "v1", None).expect("put");
    assert_eq!(store.replica_value(0, "ns", "k").as_deref(), Some(&b"v1"[..]));
    assert_eq!(store.replica_value(2, "ns", "k"), None);
    assert!(store.get_statistics().pending_replication > 0);

    assert!(store.flush_replication(Duration::from_secs(2)));
    for replica in 0..3 {
        assert_eq!(
            store.replica_value(replica, "ns", "k").as_deref(),
            Some(&b"v1"[..]),
            "replica {replica}"
        );
    }
    store.shutdown().expect("shutdown");
}

#[test]
fn rewrite_after_ttl_expiry_supersedes_lagging_replicas() {
    let store = MemoryStore::new(config(Consistency::Eventual, 3));
    let ttl = Some(Duration::from_millis(50));
    store.put("ns", "k", "a", ttl).expect("put a");
    assert_eq!(store.put("ns", "k", "b", ttl).expect("put b"), 2);
    assert!(store.flush_replication(Duration::from_secs(2)));

    thread::sleep(Duration::from_millis(80));
    assert!(matches!(store.get("ns", "k"), Err(SwarmError::NotFound(_))));

    let version = store.put("ns", "k", "fresh", None).expect("rewrite");
    assert!(version > 2, "version after rewrite = {version}");
    assert!(store.flush_replication(Duration::from_secs(2)));
    for replica in 0..3 {
        assert_eq!(
            store.replica_value(replica, "ns", "k").as_deref(),
            Some(&b"fresh"[..]),
            "replica {replica}"
        );
    }

    store.sync_replicas();
    assert_eq!(store.get("ns", "k").expect("after sync"), b"fresh");
    assert_eq!(store.get_entry("ns", "k").expect("entry").version, version);
    store.shutdown().expect("shutdown");
}

#[test]
fn delete_tombstone_reaches_every_replica() {
    let store = MemoryStore::new(MemoryConfig {
        replication_delay_ms: 20,
        ..config(Consistency::Eventual, 3)
    });
    store.put("ns", "k", "v", None).expect("put");
    assert!(store.flush_replication(Duration::from_secs(2)));
    assert_eq!(store.replica_value(2, "ns", "k").as_deref(), Some(&b"v"[..]));

    assert_eq!(store.delete("ns", "k").expect("delete"), 2);
    assert!(store.flush_replication(Duration::from_secs(2)));
    for replica in 0..3 {
        assert_eq!(store.replica_value(replica, "ns", "k"), None, "replica {replica}");
    }
    assert!(matches!(store.get("ns", "k"), Err(SwarmError::NotFound(_))));
    // Anti-entropy must not resurrect the deleted value.
    assert_eq!(store.sync_replicas(), 0);
    assert!(matches!(store.get("ns", "k"), Err(SwarmError::NotFound(_))));
    assert_eq!(store.put("ns", "k", "again", None).expect("put"), 3);
    store.shutdown().expect("shutdown");
}

#[test]
fn partitioned_replica_catches_up_after_it_returns() {
    let store = MemoryStore::new(config(Consistency::Eventual, 3));
    store.set_replica_available(2, false).expect("partition");
    store.put("ns", "k", "v1", None).expect("put");
    store.put("ns", "k", "v2", None).expect("put");

    assert!(wait_until(Duration::from_secs(2), || {
        store.replica_value(1, "ns", "k").as_deref() == Some(&b"v2"[..])
    }));
    assert!(!store.flush_replication(Duration::from_millis(50)));

    store.set_replica_available(2, true).expect("heal");
    assert!(store.flush_replication(Duration::from_secs(2)));
    assert_eq!(store.replica_value(2, "ns", "k").as_deref(), Some(&b"v2"[..]));
    assert_eq!(store.get_statistics().pending_replication, 0);
    store.shutdown().expect("shutdown");
}

#[test]
fn anti_entropy_repairs_lagging_replicas() {
    let store = MemoryStore::new(MemoryConfig {
        replication_delay_ms: 60_000,
        flush_timeout_ms: 10,
        ..config(Consistency::Eventual, 2)
    });
    store.put("ns", "a", "1", None).expect("put");
    store.put("ns", "b", "2", None).expect("put");
    assert_eq!(store.replica_value(1, "ns", "a"), None);

    assert_eq!(store.sync_replicas(), 2);
    assert_eq!(store.replica_value(1, "ns", "a").as_deref(), Some(&b"1"[..]));
    assert_eq!(store.replica_value(1, "ns", "b").as_deref(), Some(&b"2"[..]));
    assert_eq!(store.sync_replicas(), 0);
    store.shutdown().expect("shutdown");
}

#[test]
fn strong_write_without_quorum_leaves_nothing_behind() {
    let store = MemoryStore::new(config(Consistency::Strong, 3));
    assert_eq!(store.quorum(), 3);
    store.set_replica_available(1, false).expect("partition");

    let err = store.put("ns", "k", "v", None).unwrap_err();
    assert_eq!(
        err,
        SwarmError::QuorumUnavailable {
            acks: 2,
            required: 3
        }
    );
    for replica in 0..3 {
        assert_eq!(store.replica_value(replica, "ns", "k"), None);
    }
    assert!(matches!(
        store.get("ns", "k"),
        Err(SwarmError::QuorumUnavailable { .. })
    ));

    store.set_replica_available(1, true).expect("heal");
    assert_eq!(store.put("ns", "k", "v", None).expect("put"), 1);
    for replica in 0..3 {
        assert_eq!(store.replica_value(replica, "ns", "k").as_deref(), Some(&b"v"[..]));
    }
    assert_eq!(store.get("ns", "k").expect("get"), b"v");
    store.shutdown().expect("shutdown");
}

#[test]
fn clear_namespace_only_touches_that_namespace() {
    let store = MemoryStore::new(config(Consistency::Eventual, 1));
    store.put("objective/1", "task/a", "x", None).expect("put");
    store.put("objective/1", "task/b", "y", None).expect("put");
    store.put("objective/2", "task/a", "z", None).expect("put");

    assert_eq!(
        store.list_keys("objective/1"),
        vec!["task/a".to_string(), "task/b".to_string()]
    );
    assert_eq!(store.clear_namespace("objective/1").expect("clear"), 2);
    assert!(store.list_keys("objective/1").is_empty());
    assert_eq!(store.get("objective/2", "task/a").expect("kept"), b"z");
    store.shutdown().expect("shutdown");
}

#[test]
fn backups_rotate_and_restore() {
    let dir = unique_test_temp_dir("memory-backups");
    let store = MemoryStore::new(MemoryConfig {
        backup_dir: Some(dir.clone()),
        max_backups: 2,
        ..config(Consistency::Eventual, 2)
    });
    store.put("ns", "k", "original", None).expect("put");
    let first = store.backup_now().expect("backup 1");
    assert_eq!(first.entry_count, 1);
    store.backup_now().expect("backup 2");
    store.put("ns", "k", "changed", None).expect("put");
    store.put("ns", "extra", "e", None).expect("put");
    let third = store.backup_now().expect("backup 3");

    let kept: Vec<String> = store
        .list_backups()
        .expect("list")
        .into_iter()
        .map(|b| b.id)
        .collect();
    assert_eq!(kept.len(), 2);
    assert!(!kept.contains(&first.id));
    assert_eq!(kept.last(), Some(&third.id));

    assert!(store.flush_replication(Duration::from_secs(2)));
    let oldest = kept[0].clone();
    assert_eq!(store.restore_backup(&oldest).expect("restore"), 1);
    assert_eq!(store.get("ns", "k").expect("restored"), b"original");
    assert!(matches!(store.get("ns", "extra"), Err(SwarmError::NotFound(_))));
    assert_eq!(store.replica_value(1, "ns", "k").as_deref(), Some(&b"original"[..]));

    store.shutdown().expect("shutdown");
    // Shutdown writes one more backup and keeps the retention limit.
    let after = store.list_backups().expect("list");
    assert_eq!(after.len(), 2);
    assert!(after.iter().all(|b| b.id != oldest));
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn stray_file_in_backup_dir_does_not_stop_rotation() {
    let dir = unique_test_temp_dir("memory-backups-stray");
    fs::create_dir_all(&dir).expect("mkdir");
    fs::write(dir.join("backup-zzz.json"), "not json").expect("stray");
    let store = MemoryStore::new(MemoryConfig {
        backup_dir: Some(dir.clone()),
        max_backups: 2,
        ..config(Consistency::Eventual, 1)
    });
    store.put("ns", "k", "v", None).expect("put");
    for _ in 0..3 {
        store.backup_now().expect("backup");
    }
    let kept = store.list_backups().expect("list");
    assert_eq!(kept.len(), 2);
    assert!(kept.iter().all(|b| b.entry_count == 1));
    store.shutdown().expect("shutdown");
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn backups_disabled_without_directory() {
    let store = MemoryStore::new(config(Consistency::Eventual, 1));
    assert!(store.backup_now().is_err());
    assert!(store.list_backups().expect("list").is_empty());
    store.shutdown().expect("shutdown");
}
