//! End-to-end buffer pool scenarios over the public API.

use std::thread;

use storage::{BufferPoolManager, INVALID_PAGE_ID, PageId};
use tempfile::TempDir;

fn new_pinned_page(pool: &BufferPoolManager, payload: &[u8]) -> PageId {
    let mut guard = pool.new_page().unwrap().expect("pool exhausted");
    assert!(guard.write_bytes(0, payload));
    guard.page_id()
}

#[test]
fn writes_survive_flush_and_reopen() {
    let dir = TempDir::new().expect("temp dir create failed");
    let path = dir.path().join("db");

    let (p0, p1) = {
        let pool = BufferPoolManager::open(&path, 2).unwrap();
        let p0 = new_pinned_page(&pool, b"A");
        assert!(pool.unpin_page(p0, true).unwrap());
        let p1 = new_pinned_page(&pool, b"B");
        assert!(pool.unpin_page(p1, true).unwrap());
        pool.flush_all_pages().unwrap();
        (p0, p1)
    };

    let pool = BufferPoolManager::open(&path, 2).unwrap();
    let guard = pool.fetch_page(p0).unwrap().expect("p0 missing after reopen");
    assert_eq!(guard.read_bytes(0, 1).unwrap(), b"A");
    drop(guard);
    assert!(pool.unpin_page(p0, false).unwrap());

    let guard = pool.fetch_page(p1).unwrap().unwrap();
    assert_eq!(guard.read_bytes(0, 1).unwrap(), b"B");
    drop(guard);
    assert!(pool.unpin_page(p1, false).unwrap());
}

#[test]
fn fully_pinned_pool_rejects_new_and_fetch() {
    let dir = TempDir::new().unwrap();
    let pool = BufferPoolManager::open(dir.path().join("db"), 2).unwrap();

    let _p0 = new_pinned_page(&pool, b"0");
    let p1 = new_pinned_page(&pool, b"1");

    assert!(pool.new_page().unwrap().is_none());
    assert!(pool.fetch_page(p1 + 1).unwrap().is_none());
    assert!(pool.fetch_page(INVALID_PAGE_ID).unwrap().is_none());
}

#[test]
fn victim_selection_prefers_free_frames_then_lru() {
    let dir = TempDir::new().unwrap();
    let pool = BufferPoolManager::open(dir.path().join("db"), 2).unwrap();

    let p0 = new_pinned_page(&pool, b"0");
    let p1 = new_pinned_page(&pool, b"1");
    assert!(pool.unpin_page(p1, false).unwrap());

    // p1's frame is the only eviction candidate; p0 stays pinned.
    let p2 = new_pinned_page(&pool, b"2");
    assert!(!pool.contains_page(p1).unwrap());
    assert!(pool.contains_page(p0).unwrap());
    assert_eq!(pool.pin_count(p0).unwrap(), Some(1));

    assert!(pool.unpin_page(p0, false).unwrap());
    assert!(pool.unpin_page(p2, false).unwrap());
}

#[test]
fn evicted_dirty_page_reads_back_from_disk() {
    let dir = TempDir::new().unwrap();
    let pool = BufferPoolManager::open(dir.path().join("db"), 2).unwrap();

    let p0 = new_pinned_page(&pool, b"X");
    assert!(pool.unpin_page(p0, true).unwrap());
    let p1 = new_pinned_page(&pool, b"1");

    // Both frames are now spoken for, so this allocation evicts p0.
    let p2 = new_pinned_page(&pool, b"2");
    assert!(pool.unpin_page(p2, false).unwrap());
    assert!(!pool.contains_page(p0).unwrap());

    // The write-back happened without an explicit flush.
    let guard = pool.fetch_page(p0).unwrap().unwrap();
    assert_eq!(guard.read_bytes(0, 1).unwrap(), b"X");
    drop(guard);
    assert!(pool.unpin_page(p0, false).unwrap());
    assert!(pool.unpin_page(p1, false).unwrap());
}

#[test]
fn delete_restores_the_free_list() {
    let dir = TempDir::new().unwrap();
    let pool = BufferPoolManager::open(dir.path().join("db"), 2).unwrap();
    assert_eq!(pool.free_frame_count().unwrap(), 2);

    let p0 = new_pinned_page(&pool, b"tmp");
    assert!(pool.unpin_page(p0, true).unwrap());
    assert_eq!(pool.free_frame_count().unwrap(), 1);

    assert!(pool.delete_page(p0).unwrap());
    assert_eq!(pool.free_frame_count().unwrap(), 2);
    assert!(!pool.contains_page(p0).unwrap());
    assert_eq!(pool.dirty_page_count().unwrap(), 0);
}

#[test]
fn concurrent_fetch_unpin_balances_pin_count() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 50;

    let dir = TempDir::new().unwrap();
    let pool = BufferPoolManager::open(dir.path().join("db"), 2).unwrap();
    let p0 = new_pinned_page(&pool, b"shared");
    assert!(pool.unpin_page(p0, false).unwrap());

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let pool = pool.clone();
            thread::spawn(move || {
                for _ in 0..ROUNDS {
                    let guard = pool.fetch_page(p0).unwrap().expect("page evicted while pinned");
                    assert_eq!(guard.read_bytes(0, 6).unwrap(), b"shared");
                    drop(guard);
                    assert!(pool.unpin_page(p0, false).unwrap());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // Fetches and unpins are balanced, so the page ends unpinned and
    // evictable; it was never dropped from the pool.
    assert_eq!(pool.pin_count(p0).unwrap(), Some(0));
    assert_eq!(pool.evictable_count(), 1);
    assert_eq!(pool.fetch_count(), THREADS * ROUNDS);
}
