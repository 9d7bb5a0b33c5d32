//! Lease lock behaviour across managers, threads and hostile filesystems.

use std::fs;
use std::sync::{Arc, Barrier};
use std::thread;

use kyrograph::lease::LeaseLock;
use kyrograph::storage::GraphPaths;
use tempfile::tempdir;

/// Concurrent acquisitions against one root never both succeed.
#[test]
fn test_concurrent_acquire_is_exclusive() {
    for _ in 0..20 {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let root = root.clone();
                thread::spawn(move || {
                    let lease = LeaseLock::new();
                    barrier.wait();
                    lease.acquire(&root)
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|acquired| *acquired)
            .count();
        assert_eq!(winners, 1);
    }
}

#[test]
fn test_release_lets_the_next_manager_in() {
    let dir = tempdir().unwrap();
    let first = LeaseLock::new();
    let second = LeaseLock::new();

    assert!(first.acquire(dir.path()));
    assert!(!second.acquire(dir.path()));

    // Releasing someone else's lease is a no-op.
    second.release(dir.path());
    assert!(GraphPaths::new(dir.path()).lock_file().exists());

    first.release(dir.path());
    assert!(second.acquire(dir.path()));
    assert!(second.holds(dir.path()));
}

/// A record rewritten by another holder is never refreshed or deleted.
#[test]
fn test_token_guard_protects_foreign_record() {
    let dir = tempdir().unwrap();
    let lock_file = GraphPaths::new(dir.path()).lock_file();
    let lease = LeaseLock::new();
    assert!(lease.acquire(dir.path()));

    let mut record = LeaseLock::read_record(dir.path()).unwrap();
    record.token = "stolen-by-someone-else".to_string();
    fs::write(&lock_file, serde_json::to_string(&record).unwrap()).unwrap();
    let before = fs::read(&lock_file).unwrap();

    lease.refresh(dir.path());
    assert_eq!(fs::read(&lock_file).unwrap(), before);
    assert!(!lease.holds(dir.path()));

    lease.release(dir.path());
    assert_eq!(fs::read(&lock_file).unwrap(), before);
}

#[test]
fn test_refresh_moves_heartbeat_forward() {
    let dir = tempdir().unwrap();
    let lease = LeaseLock::new();
    assert!(lease.acquire(dir.path()));
    let before = LeaseLock::read_record(dir.path()).unwrap();

    thread::sleep(std::time::Duration::from_millis(10));
    lease.refresh(dir.path());
    let after = LeaseLock::read_record(dir.path()).unwrap();

    assert_eq!(after.token, before.token);
    assert_eq!(after.started_at, before.started_at);
    assert!(after.updated_at > before.updated_at);
    assert!(after.updated_at >= after.started_at);
}

/// Persistent unexpected I/O errors fail open instead of blocking forever.
#[test]
fn test_unusable_root_fails_open() {
    let dir = tempdir().unwrap();
    let not_a_dir = dir.path().join("graph");
    fs::write(&not_a_dir, "plain file").unwrap();

    let lease = LeaseLock::new();
    assert!(lease.acquire(&not_a_dir));
    assert!(!lease.holds(&not_a_dir));

    // Nothing to release, and nothing breaks.
    lease.release(&not_a_dir);
    assert_eq!(fs::read_to_string(&not_a_dir).unwrap(), "plain file");
}

#[test]
fn test_lock_file_uses_wire_names() {
    let dir = tempdir().unwrap();
    let lease = LeaseLock::new();
    assert!(lease.acquire(dir.path()));

    let raw = fs::read_to_string(GraphPaths::new(dir.path()).lock_file()).unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    for field in ["pid", "token", "startedAt", "updatedAt"] {
        assert!(value.get(field).is_some(), "missing {field}");
    }
    assert_eq!(value["pid"], u64::from(std::process::id()));
}
