//! The shared-memory allocator (`SMA`) — the bulk allocator over a single
//! shared region that entry pools are carved from.
//!
//! Spec §1 treats the SMA as an external collaborator, "specified only by
//! the interface the core consumes": [`Sma`] is that interface. [`MmapSma`]
//! is the default implementation, grounded on `shm::region::ShmRegion` in
//! the teacher crate — a single `mmap`-backed file, sized once at creation
//! and never resized (spec §1 Non-goals: no graceful resize).
//!
//! The free list is serialized by a [`crate::lock::ShmMutex`] living in the
//! mapped region, not a process-local mutex: `Cache::store` allocates a
//! pool before ever taking the header's `ShmRwLock` (spec §4.3 steps 2-3),
//! so two different processes can call `alloc`/`free` concurrently and only
//! a lock that itself lives in shared memory can serialize them.
use crate::lock::ShmMutex;

/// Bulk allocator over one shared region.
///
/// `alloc`/`free` operate in absolute region-offset space so a caller can
/// store the returned offset in shared memory and recompute a pointer from
/// any process's own mapping of the same region (`base_ptr().add(offset)`).
pub trait Sma {
    /// Allocate `n` bytes, returning the region offset of the block, or
    /// `None` if the arena has no suitably sized free block.
    fn alloc(&self, n: usize) -> Option<i64>;

    /// Return a previously allocated block of `len` bytes at `offset` to
    /// the free list.
    ///
    /// # Safety
    /// `offset`/`len` must describe a block previously returned by `alloc`
    /// and not already freed.
    unsafe fn free(&self, offset: i64, len: usize);

    /// Bytes currently unallocated in the arena (sum of free-block sizes).
    fn avail_mem(&self) -> usize;

    /// Total arena size in bytes (fixed at construction).
    fn size(&self) -> usize;

    /// Absolute base pointer of the mapped region.
    fn base_ptr(&self) -> *mut u8;
}

/// Header of a free block, written in-place at the block's own offset.
/// `size` includes this header. Blocks are kept in a singly-linked list
/// rooted at `Header.sma_free_head`; first-fit, no coalescing — simpler
/// than APCu's segment allocator, traded off deliberately (see DESIGN.md).
#[repr(C)]
struct FreeBlock {
    size: u64,
    next: i64,
}

const FREE_BLOCK_HEADER: usize = std::mem::size_of::<FreeBlock>();

/// Arena-backed `Sma` carved out of an already-mapped region.
///
/// `MmapSma` does not own the mapping itself (that lives in
/// `region::ShmRegion`, alongside the header and slot table); it only knows
/// the byte range `[arena_base, arena_base + arena_len)` it is allowed to
/// hand out, and where to find `Header.sma_free_head` to persist its
/// free-list root across processes.
pub struct MmapSma {
    base: *mut u8,
    arena_base: usize,
    arena_len: usize,
    free_head: *mut i64,
    lock: ShmMutex,
}

unsafe impl Send for MmapSma {}
unsafe impl Sync for MmapSma {}

impl MmapSma {
    /// # Safety
    /// `base` must point to a region of at least `arena_base + arena_len`
    /// bytes; `free_head` must point at a valid, live `i64` (typically
    /// `Header.sma_free_head`) for the lifetime of this `MmapSma`;
    /// `lock_ptr` must point at a `pthread_mutex_t` (`Header.sma_lock`)
    /// already initialized by [`ShmMutex::init`] (see `region::ShmRegion::create`).
    pub unsafe fn new(base: *mut u8, arena_base: usize, arena_len: usize, free_head: *mut i64, lock_ptr: *mut u8) -> Self {
        MmapSma {
            base,
            arena_base,
            arena_len,
            free_head,
            lock: ShmMutex::from_existing(lock_ptr),
        }
    }

    /// Initialize the arena as one giant free block. Call exactly once,
    /// when the region is first created (not when reopened).
    ///
    /// # Safety
    /// Caller must hold exclusive access to the region (construction time).
    pub unsafe fn init(&self) {
        let block = &mut *(self.base.add(self.arena_base) as *mut FreeBlock);
        block.size = self.arena_len as u64;
        block.next = -1;
        *self.free_head = self.arena_base as i64;
    }

    unsafe fn block_at(&self, offset: i64) -> &mut FreeBlock {
        &mut *(self.base.add(offset as usize) as *mut FreeBlock)
    }

    /// Run `f` with the region's `ShmMutex` held, unlocking on every exit
    /// path. `ShmMutex` has no RAII guard of its own (a `pthread_mutex_t`
    /// handle is `Copy`-cheap and shared across processes, so there is no
    /// per-process drop to hook); this is the one call site that needs the
    /// lock/unlock bracketing, so it is centralized here rather than
    /// repeated at each `Sma` method.
    fn with_lock<T>(&self, f: impl FnOnce() -> T) -> T {
        self.lock.lock();
        let result = f();
        self.lock.unlock();
        result
    }
}

impl Sma for MmapSma {
    fn alloc(&self, n: usize) -> Option<i64> {
        let need = n + FREE_BLOCK_HEADER;
        self.with_lock(|| unsafe {
            let mut prev: Option<i64> = None;
            let mut cur = *self.free_head;
            while cur != -1 {
                let block = self.block_at(cur);
                let block_size = block.size as usize;
                if block_size >= need {
                    let next = block.next;
                    let remainder = block_size - need;
                    // Split only if the remainder can host another free block.
                    if remainder > FREE_BLOCK_HEADER {
                        let new_offset = cur + need as i64;
                        let new_block = self.block_at(new_offset);
                        new_block.size = remainder as u64;
                        new_block.next = next;
                        self.relink(prev, new_offset);
                    } else {
                        self.relink(prev, next);
                    }
                    // Data starts after the free-block header; callers get
                    // back an offset to the data, not the header.
                    return Some(cur + FREE_BLOCK_HEADER as i64);
                }
                prev = Some(cur);
                cur = block.next;
            }
            None
        })
    }

    unsafe fn free(&self, offset: i64, len: usize) {
        self.with_lock(|| unsafe {
            let block_offset = offset - FREE_BLOCK_HEADER as i64;
            let block = self.block_at(block_offset);
            block.size = (len + FREE_BLOCK_HEADER) as u64;
            block.next = *self.free_head;
            *self.free_head = block_offset;
        })
    }

    fn avail_mem(&self) -> usize {
        self.with_lock(|| unsafe {
            let mut total = 0usize;
            let mut cur = *self.free_head;
            while cur != -1 {
                let block = self.block_at(cur);
                total += block.size as usize - FREE_BLOCK_HEADER;
                cur = block.next;
            }
            total
        })
    }

    fn size(&self) -> usize {
        self.arena_len
    }

    fn base_ptr(&self) -> *mut u8 {
        self.base
    }
}

impl MmapSma {
    unsafe fn relink(&self, prev: Option<i64>, new_head_if_none: i64) {
        match prev {
            Some(p) => self.block_at(p).next = new_head_if_none,
            None => *self.free_head = new_head_if_none,
        }
    }
}
