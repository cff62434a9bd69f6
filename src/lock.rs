//! Cross-process read-write lock — the `Lock` collaborator spec §1
//! specifies only by interface.
//!
//! [`RwLockPrimitive`] is that interface; [`ShmRwLock`] is the default
//! implementation, a direct port of the teacher crate's POSIX
//! `pthread_rwlock` wrapper (`PTHREAD_PROCESS_SHARED`) so the lock itself
//! lives in the mapped region and is usable from any process that maps it.
use std::io;

/// Size reserved for the lock in the mmap region. `pthread_rwlock_t` is 56
/// bytes on x86_64 Linux, larger on some other platforms; over-allocate.
pub const LOCK_SIZE: usize = 256;

/// A single-writer/multi-reader lock usable across process boundaries.
///
/// Per spec §5, plain counter bumps taken under a read lock (hit counts,
/// access times) are NOT assumed atomic-free by virtue of "the lock is
/// held" — a real `RwLockPrimitive` allows concurrent readers, so any
/// field mutated while only a read lock is held must be an atomic type.
pub trait RwLockPrimitive {
    /// Acquire a read lock. Blocks until available.
    fn read_lock(&self);
    /// Release a read lock.
    fn read_unlock(&self);
    /// Acquire a write lock. Blocks until available.
    fn write_lock(&self);
    /// Release a write lock.
    fn write_unlock(&self);
}

/// Cross-process rwlock backed by `libc::pthread_rwlock_t`, stored in
/// shared memory so every process attaching to the region shares one lock.
pub struct ShmRwLock {
    lock_ptr: *mut libc::pthread_rwlock_t,
}

unsafe impl Send for ShmRwLock {}
unsafe impl Sync for ShmRwLock {}

impl ShmRwLock {
    /// Initialize a new rwlock at the given memory location.
    ///
    /// # Safety
    /// `ptr` must point to at least `size_of::<pthread_rwlock_t>()` bytes
    /// of shared memory that are zeroed or uninitialized, and must remain
    /// valid and mapped for the lifetime of every `ShmRwLock` built from it.
    pub unsafe fn init(ptr: *mut u8) -> io::Result<Self> {
        let lock_ptr = ptr as *mut libc::pthread_rwlock_t;

        let mut attr: libc::pthread_rwlockattr_t = std::mem::zeroed();
        let ret = libc::pthread_rwlockattr_init(&mut attr);
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret));
        }

        let ret = libc::pthread_rwlockattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        if ret != 0 {
            libc::pthread_rwlockattr_destroy(&mut attr);
            return Err(io::Error::from_raw_os_error(ret));
        }

        let ret = libc::pthread_rwlock_init(lock_ptr, &attr);
        libc::pthread_rwlockattr_destroy(&mut attr);
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret));
        }

        Ok(ShmRwLock { lock_ptr })
    }

    /// Attach to an already-initialized rwlock at the given memory location.
    ///
    /// # Safety
    /// `ptr` must point to a previously `init`ialized `pthread_rwlock_t`
    /// in shared memory, still mapped.
    pub unsafe fn from_existing(ptr: *mut u8) -> Self {
        ShmRwLock {
            lock_ptr: ptr as *mut libc::pthread_rwlock_t,
        }
    }

    /// Destroy the rwlock. Only call when no other process holds it —
    /// the shared region itself is intentionally leaked on `Cache::destroy`
    /// (see `cache.rs`), matching the original's documented leak.
    ///
    /// # Safety
    /// No other thread or process may be blocked in or about to enter a
    /// lock/unlock call on this lock.
    pub unsafe fn destroy(&self) {
        libc::pthread_rwlock_destroy(self.lock_ptr);
    }
}

impl RwLockPrimitive for ShmRwLock {
    fn read_lock(&self) {
        unsafe {
            let ret = libc::pthread_rwlock_rdlock(self.lock_ptr);
            debug_assert_eq!(ret, 0, "pthread_rwlock_rdlock failed: {ret}");
        }
    }

    fn read_unlock(&self) {
        unsafe {
            let ret = libc::pthread_rwlock_unlock(self.lock_ptr);
            debug_assert_eq!(ret, 0, "pthread_rwlock_unlock failed: {ret}");
        }
    }

    fn write_lock(&self) {
        unsafe {
            let ret = libc::pthread_rwlock_wrlock(self.lock_ptr);
            debug_assert_eq!(ret, 0, "pthread_rwlock_wrlock failed: {ret}");
        }
    }

    fn write_unlock(&self) {
        unsafe {
            let ret = libc::pthread_rwlock_unlock(self.lock_ptr);
            debug_assert_eq!(ret, 0, "pthread_rwlock_unlock failed: {ret}");
        }
    }
}

/// Process-shared mutex, same `PTHREAD_PROCESS_SHARED` pattern as
/// [`ShmRwLock`] but a plain mutex rather than a rwlock. Used by
/// [`crate::sma::MmapSma`] to serialize its free-list: `Cache::store`
/// builds a pool (which allocates from the `Sma`) *before* taking the
/// header's `ShmRwLock` (spec §4.3 steps 2-3), so two different processes
/// can race inside `Sma::alloc`/`Sma::free` concurrently and a process-local
/// mutex would not serialize them — the lock itself must live in the
/// mapped region, the same reasoning that makes `ShmRwLock` process-shared.
pub struct ShmMutex {
    mutex_ptr: *mut libc::pthread_mutex_t,
}

unsafe impl Send for ShmMutex {}
unsafe impl Sync for ShmMutex {}

/// Bytes reserved for a `pthread_mutex_t` in the mapped region; `libc`
/// reports 40 bytes on x86_64 Linux, over-allocated the same way
/// `LOCK_SIZE` over-allocates for `pthread_rwlock_t`.
pub const MUTEX_SIZE: usize = 64;

impl ShmMutex {
    /// # Safety
    /// `ptr` must point to at least [`MUTEX_SIZE`] bytes of shared memory
    /// that are zeroed or uninitialized, and must remain valid and mapped
    /// for the lifetime of every `ShmMutex` built from it.
    pub unsafe fn init(ptr: *mut u8) -> io::Result<Self> {
        let mutex_ptr = ptr as *mut libc::pthread_mutex_t;

        let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
        let ret = libc::pthread_mutexattr_init(&mut attr);
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret));
        }

        let ret = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        if ret != 0 {
            libc::pthread_mutexattr_destroy(&mut attr);
            return Err(io::Error::from_raw_os_error(ret));
        }

        let ret = libc::pthread_mutex_init(mutex_ptr, &attr);
        libc::pthread_mutexattr_destroy(&mut attr);
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret));
        }

        Ok(ShmMutex { mutex_ptr })
    }

    /// # Safety
    /// `ptr` must point to a previously `init`ialized `pthread_mutex_t` in
    /// shared memory, still mapped.
    pub unsafe fn from_existing(ptr: *mut u8) -> Self {
        ShmMutex {
            mutex_ptr: ptr as *mut libc::pthread_mutex_t,
        }
    }

    pub fn lock(&self) {
        unsafe {
            let ret = libc::pthread_mutex_lock(self.mutex_ptr);
            debug_assert_eq!(ret, 0, "pthread_mutex_lock failed: {ret}");
        }
    }

    pub fn unlock(&self) {
        unsafe {
            let ret = libc::pthread_mutex_unlock(self.mutex_ptr);
            debug_assert_eq!(ret, 0, "pthread_mutex_unlock failed: {ret}");
        }
    }
}
