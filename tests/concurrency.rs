//! Multi-process visibility (spec §5: "A successful store is observable to
//! any subsequent find from any process"). Two independent `Cache` handles,
//! one in a forked child and one in the parent, attach to the same named
//! region and exchange writes through it — nothing but the shared `mmap`
//! and `pthread_rwlock` carries the data across the fork, matching how two
//! unrelated processes would actually use this crate.
use std::sync::atomic::{AtomicU32, Ordering};

use userdata_cache::{Cache, CacheConfig, Value};

static COUNTER: AtomicU32 = AtomicU32::new(0);

fn unique_shm_name(tag: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("userdata_cache_test_{}_{}_{}", std::process::id(), tag, n)
}

fn config(name: &str) -> CacheConfig {
    CacheConfig::new(name).sma_size(1 << 20).size_hint(53)
}

/// # Safety
/// Only safe to call from a single-threaded test process immediately
/// before forking: `fork()` in a multi-threaded process is only safe if
/// the child calls nothing beyond async-signal-safe functions before
/// `_exit`, which every path below respects.
unsafe fn fork() -> i32 {
    libc::fork()
}

#[test]
fn child_store_is_visible_to_parent_find() {
    let name = unique_shm_name("store_visible");
    let parent_cache = Cache::create(config(&name), None).expect("parent create");

    let pid = unsafe { fork() };
    assert!(pid >= 0, "fork failed");

    if pid == 0 {
        // Child: open the same region independently and store a value.
        let child_cache = match Cache::create(config(&name), None) {
            Ok(c) => c,
            Err(_) => unsafe { libc::_exit(1) },
        };
        let ok = child_cache.store(b"greeting", &Value::Str(b"hello from child".to_vec()), 0, false);
        unsafe { libc::_exit(if ok { 0 } else { 2 }) };
    }

    let mut status: i32 = 0;
    let waited = unsafe { libc::waitpid(pid, &mut status, 0) };
    assert_eq!(waited, pid);
    assert!(libc::WIFEXITED(status), "child did not exit normally");
    assert_eq!(libc::WEXITSTATUS(status), 0, "child failed to store");

    let t = userdata_cache::clock::now_unix();
    let handle = parent_cache.find(b"greeting", t).expect("parent should see child's store");
    let (value, ok) = handle.value();
    assert!(ok);
    match value {
        Value::Str(s) => assert_eq!(s, b"hello from child"),
        other => panic!("unexpected value: {other:?}"),
    }
}

#[test]
fn parent_delete_is_visible_to_child_exists_check() {
    let name = unique_shm_name("delete_visible");
    let parent_cache = Cache::create(config(&name), None).expect("parent create");
    assert!(parent_cache.store(b"to-delete", &Value::Int(1), 0, false));
    assert!(parent_cache.delete(b"to-delete"));

    let pid = unsafe { fork() };
    assert!(pid >= 0, "fork failed");

    if pid == 0 {
        let child_cache = match Cache::create(config(&name), None) {
            Ok(c) => c,
            Err(_) => unsafe { libc::_exit(1) },
        };
        let t = userdata_cache::clock::now_unix();
        let still_there = child_cache.exists(b"to-delete", t);
        unsafe { libc::_exit(if still_there { 3 } else { 0 }) };
    }

    let mut status: i32 = 0;
    let waited = unsafe { libc::waitpid(pid, &mut status, 0) };
    assert_eq!(waited, pid);
    assert!(libc::WIFEXITED(status), "child did not exit normally");
    assert_eq!(libc::WEXITSTATUS(status), 0, "child still observed the deleted key");
}

#[test]
fn concurrent_stores_from_parent_and_child_both_land() {
    let name = unique_shm_name("concurrent_store");
    let parent_cache = Cache::create(config(&name), None).expect("parent create");

    let pid = unsafe { fork() };
    assert!(pid >= 0, "fork failed");

    if pid == 0 {
        let child_cache = match Cache::create(config(&name), None) {
            Ok(c) => c,
            Err(_) => unsafe { libc::_exit(1) },
        };
        let ok = child_cache.store(b"from-child", &Value::Int(2), 0, false);
        unsafe { libc::_exit(if ok { 0 } else { 2 }) };
    }

    let ok = parent_cache.store(b"from-parent", &Value::Int(1), 0, false);
    assert!(ok, "parent store failed");

    let mut status: i32 = 0;
    let waited = unsafe { libc::waitpid(pid, &mut status, 0) };
    assert_eq!(waited, pid);
    assert!(libc::WIFEXITED(status));
    assert_eq!(libc::WEXITSTATUS(status), 0, "child store failed");

    let t = userdata_cache::clock::now_unix();
    assert!(parent_cache.exists(b"from-parent", t));
    assert!(parent_cache.exists(b"from-child", t));

    let info = parent_cache.info(true);
    assert_eq!(info.nentries, 2);
}
