//! The public `Cache` handle: the external interface atop `region`,
//! `entry`, `table` and `defense` (spec §6).
//!
//! Grounded on `apc_cache_store`/`apc_cache_find`/`apc_cache_fetch`/
//! `apc_cache_update`/`apc_cache_delete`/`apc_cache_default_expunge`/
//! `apc_cache_entry`/`apc_cache_preload`/`apc_cache_info`/`apc_cache_stat`
//! in `original_source/apc_cache.c`, wired the way the teacher's
//! `ShmCache` wires `region` + `lock` + `header` together (same
//! `&self`-with-interior-raw-pointers shape, same lock-scoped closures).
use std::cell::Cell;
#[cfg(feature = "single-process")]
use std::fs;
#[cfg(feature = "single-process")]
use std::path::Path;
use std::sync::atomic::Ordering;

use crate::clock::now_unix;
use crate::config::CacheConfig;
use crate::defense::{self, Verdict};
use crate::entry;
use crate::error::CacheError;
use crate::key;
use crate::layout::{Header, NONE, STATE_BUSY};
use crate::lock::{RwLockPrimitive, ShmRwLock};
use crate::pool::Pool;
use crate::region::{RegionParams, ShmRegion};
use crate::sma::{MmapSma, Sma};
use crate::table::ChainLink;
use crate::value::{self, Serializer, Value};

thread_local! {
    /// Reentrancy depth for `compute_if_absent` (spec §5/§4.9): the
    /// outermost call takes the write lock, a nested call (the upcall
    /// re-entering the same cache) finds the counter already raised and
    /// skips locking, mirroring the original's `#ifndef APC_LOCK_RECURSIVE`
    /// per-process counter.
    static COMPUTE_DEPTH: Cell<u32> = Cell::new(0);
}

/// Minimum arena big enough to host at least one small entry alongside the
/// header and a modest slot table; anything smaller is almost certainly a
/// misconfiguration rather than an intentionally tiny cache.
const MIN_SMA_SIZE: u32 = 4096;

/// The cache handle. One per process per shared region; any number of
/// processes may independently construct a `Cache` over the same
/// `shm_name` and observe each other's writes.
pub struct Cache {
    region: ShmRegion,
    serializer: Option<Box<dyn Serializer>>,
}

unsafe impl Send for Cache {}
unsafe impl Sync for Cache {}

/// An outstanding reference returned by [`Cache::find`]. Carries the `+1`
/// ref spec §6 documents; dropping it is the `release` call.
pub struct EntryHandle<'c> {
    cache: &'c Cache,
    offset: i64,
}

impl<'c> EntryHandle<'c> {
    /// Deep-copy the entry's value out of the pool (spec §4.2 `COPY_OUT`).
    /// `false` means a configured serializer failed to decode the stored
    /// bytes (spec §7 Codec error); the returned value is then `Value::Null`.
    pub fn value(&self) -> (Value, bool) {
        let region = self.cache.region_ptr();
        let h = unsafe { entry::header(region, self.offset) };
        let pool = unsafe { entry::pool(region, self.offset) };
        value::copy_out(h.val_offset as usize, &pool, self.cache.serializer_ref())
    }

    pub fn hits(&self) -> u64 {
        let region = self.cache.region_ptr();
        unsafe { entry::header(region, self.offset).nhits.load(Ordering::Relaxed) }
    }

    pub fn ctime(&self) -> i64 {
        let region = self.cache.region_ptr();
        unsafe { entry::header(region, self.offset).ctime }
    }
}

impl<'c> Drop for EntryHandle<'c> {
    fn drop(&mut self) {
        entry::release(self.cache.region_ptr(), self.offset);
    }
}

/// Outcome of [`Cache::fetch`] — a richer split than spec §6's bare bool,
/// since `value::copy_out` already distinguishes miss from codec failure.
pub enum FetchResult {
    Hit(Value),
    Miss,
    CodecError,
}

/// One key's snapshot, as returned by [`Cache::stat`].
#[derive(Debug, Clone)]
pub struct EntryStat {
    pub key_len: u32,
    pub mem_size: u32,
    pub ttl: u32,
    pub nhits: u64,
    pub ref_count: i32,
    pub ctime: i64,
    pub mtime: i64,
    pub atime: i64,
}

/// Cache-wide snapshot, as returned by [`Cache::info`].
#[derive(Debug, Clone)]
pub struct CacheInfo {
    pub nhits: u64,
    pub nmisses: u64,
    pub ninserts: u64,
    pub nentries: u64,
    pub nexpunges: u64,
    pub stime: i64,
    pub mem_size: u64,
    pub avail_mem: usize,
    pub sma_size: usize,
    /// Present only when `limited == false` (spec §6 `info(limited)`):
    /// one `(key_hash, key_len, mem_size, ttl)` tuple per live entry.
    /// The original's `cache_list`.
    pub entries: Option<Vec<(u64, u32, u32, u32)>>,
    /// Present only when `limited == false`: one `(key_hash, mem_size,
    /// ref_count)` tuple per entry still parked on the GC list awaiting
    /// reclamation. The original's `deleted_list`.
    pub deleted_entries: Option<Vec<(u64, u32, i32)>>,
    /// Present only when `limited == false`: chain length per slot, index
    /// matching the slot index. The original's `slot_distribution`.
    pub slot_distribution: Option<Vec<u32>>,
}

impl Cache {
    /// Create or open the named shared region (spec §6 `create`). Opening
    /// an existing region whose fixed parameters (slot count, key/value
    /// size caps) differ from `config` recreates it from scratch, per
    /// `ShmRegion::create_or_open`.
    pub fn create(config: CacheConfig, serializer: Option<Box<dyn Serializer>>) -> Result<Cache, CacheError> {
        if config.sma_size < MIN_SMA_SIZE {
            return Err(CacheError::SmaTooSmall {
                sma_size: config.sma_size,
                min: MIN_SMA_SIZE,
            });
        }

        let nslots = crate::table::nslots_for_hint(config.size_hint);
        let params = RegionParams {
            nslots,
            sma_size: config.sma_size,
            gc_ttl: config.gc_ttl,
            ttl: config.ttl,
            smart: config.smart,
            defend: config.defend,
            max_key_size: config.max_key_size,
            max_value_size: config.max_value_size,
        };
        let region = ShmRegion::create_or_open(&config.shm_name, params).map_err(CacheError::Region)?;
        Ok(Cache { region, serializer })
    }

    /// Spec §6 `destroy`: intentionally leaks the shared region rather than
    /// unlinking it, since another process may still have it mapped. Only
    /// this process's mapping and `pthread_rwlock` attachment go away.
    pub fn destroy(self) {}

    fn header(&self) -> &Header {
        self.region.header()
    }

    /// # Safety-by-convention
    /// Callers must hold at least the write lock before mutating any
    /// non-atomic field through the returned reference.
    fn header_mut(&self) -> &mut Header {
        unsafe { &mut *(self.region.base_ptr() as *mut u8 as *mut Header) }
    }

    fn region_ptr(&self) -> *mut u8 {
        self.region.base_ptr() as *mut u8
    }

    fn lock(&self) -> ShmRwLock {
        self.region.lock()
    }

    fn sma(&self) -> MmapSma {
        self.region.sma()
    }

    fn serializer_ref(&self) -> Option<&dyn Serializer> {
        self.serializer.as_deref()
    }

    /// `BUSY` bit of `Header.state` (spec §4.7): public operations other
    /// than `clear`/`expunge` may check this to fast-fail rather than
    /// block behind a long-running wipe, though the write lock alone
    /// already serializes them correctly.
    pub fn busy(&self) -> bool {
        self.header().state & STATE_BUSY != 0
    }

    fn slot_of(&self, key_hash: u64) -> u32 {
        (key_hash % self.header().nslots as u64) as u32
    }

    /// Spec §6 `store`. Slam defense (§4.8) and the pool build both run
    /// lock-free, matching `apc_cache_store_internal`'s actual order —
    /// `apc_cache_defense` itself never takes the header lock, so the
    /// fingerprint check really is the racy, approximate mechanism §4.8's
    /// prose describes. Only the chain splice is write-locked.
    pub fn store(&self, key: &[u8], val: &Value, ttl: u32, exclusive: bool) -> bool {
        // Read every field this function needs out of the header before
        // ever forming a `&mut Header` below — `header` and the `&mut`
        // `check_and_stamp` takes must never be alive at the same time.
        let (max_key_size, max_value_size, defend) = {
            let header = self.header();
            (header.max_key_size, header.max_value_size, header.defend != 0)
        };
        if max_key_size != 0 && key.len() > max_key_size as usize {
            return false;
        }

        let t = now_unix();
        let key_hash = key::hash_key(key);

        let verdict = defense::check_and_stamp(
            self.header_mut(),
            key_hash,
            key.len(),
            t,
            defend,
            defense::current_owner(),
        );
        if verdict == Verdict::Slammed {
            return false;
        }

        let value_size = match value::encoded_size(val, self.serializer_ref()) {
            Some(n) => n,
            None => return false,
        };
        if max_value_size != 0 && value_size > max_value_size as usize {
            return false;
        }

        let sma = self.sma();
        let new_offset = match unsafe {
            entry::make_entry(self.region_ptr(), &sma, key, key_hash, val, ttl, t, self.serializer_ref())
        } {
            Some(off) => off,
            None => return false,
        };

        let lock = self.lock();
        lock.write_lock();
        let inserted = unsafe { self.insert_locked(key, key_hash, t, exclusive, new_offset, &sma) };
        lock.write_unlock();

        if !inserted {
            let cap = unsafe { entry::header(self.region_ptr(), new_offset).pool_capacity };
            unsafe { entry::free_entry(&sma, new_offset, cap as usize) };
        }
        inserted
    }

    /// # Safety
    /// Caller must hold the write lock; `new_offset` must be a freshly
    /// built, not-yet-linked entry owned by `sma`.
    unsafe fn insert_locked(
        &self,
        key: &[u8],
        key_hash: u64,
        t: i64,
        exclusive: bool,
        new_offset: i64,
        sma: &MmapSma,
    ) -> bool {
        let region = self.region_ptr();
        let header_ptr = region as *mut Header;

        entry::gc_sweep(region, header_ptr, sma, (*header_ptr).gc_ttl);

        let slot = self.slot_of(key_hash);
        let cache_ttl = (*header_ptr).ttl;
        let (link, existing) =
            entry::find_chain_slot_for_insert(region, header_ptr, sma, slot, key_hash, key, cache_ttl, t);

        if let Some(old) = existing {
            let old_header = entry::header(region, old);
            if exclusive && !entry::hard_expired(old_header, t) {
                return false;
            }
            entry::remove_entry(region, header_ptr, sma, old, &link);
        }

        let next = link.get(region);
        entry::header_mut(region, new_offset).next = next;
        link.set(region, new_offset);

        let cap = entry::header(region, new_offset).pool_capacity as u64;
        let header = &mut *header_ptr;
        header.mem_size += cap;
        header.nentries += 1;
        header.ninserts += 1;
        true
    }

    /// Spec §4.4 `find(incref=true)`: bumps `header.nhits`/`entry.nhits`,
    /// sets `entry.atime`, bumps `entry.ref_count` — all under the read
    /// lock, all atomic per `layout`'s doc comment.
    pub fn find(&self, key: &[u8], t: i64) -> Option<EntryHandle<'_>> {
        let key_hash = key::hash_key(key);
        let slot = self.slot_of(key_hash);
        let region = self.region_ptr();

        let lock = self.lock();
        lock.read_lock();
        let found = unsafe { entry::find_nostat(region, slot, key_hash, key, t) };
        let handle = match found {
            Some(off) => {
                let h = unsafe { entry::header(region, off) };
                h.nhits.fetch_add(1, Ordering::Relaxed);
                h.atime.store(t, Ordering::Relaxed);
                unsafe { entry::incref(region, off) };
                self.header().nhits.fetch_add(1, Ordering::Relaxed);
                Some(EntryHandle { cache: self, offset: off })
            }
            None => {
                self.header().nmisses.fetch_add(1, Ordering::Relaxed);
                None
            }
        };
        lock.read_unlock();
        handle
    }

    /// Spec §6 `fetch`: `find(incref)`, deep-copy `COPY_OUT`, release.
    pub fn fetch(&self, key: &[u8], t: i64) -> FetchResult {
        match self.find(key, t) {
            Some(handle) => {
                let (value, ok) = handle.value();
                if ok {
                    FetchResult::Hit(value)
                } else {
                    FetchResult::CodecError
                }
            }
            None => FetchResult::Miss,
        }
    }

    /// Spec §6 `exists`: `find_nostat(key) != null`, no counters touched.
    pub fn exists(&self, key: &[u8], t: i64) -> bool {
        let key_hash = key::hash_key(key);
        let slot = self.slot_of(key_hash);
        let lock = self.lock();
        lock.read_lock();
        let found = unsafe { entry::find_nostat(self.region_ptr(), slot, key_hash, key, t) };
        lock.read_unlock();
        found.is_some()
    }

    /// Spec §6 `delete`.
    pub fn delete(&self, key: &[u8]) -> bool {
        let key_hash = key::hash_key(key);
        let slot = self.slot_of(key_hash);
        let region = self.region_ptr();
        let header_ptr = region as *mut Header;

        let lock = self.lock();
        lock.write_lock();
        let removed = unsafe {
            let mut link = ChainLink::Slot(slot);
            let mut found = None;
            loop {
                let cur = link.get(region);
                if cur == NONE {
                    break;
                }
                let h = entry::header(region, cur);
                if h.key_hash == key_hash && h.key_len as usize == key.len() && entry::key_bytes(region, cur) == key {
                    found = Some((cur, link));
                    break;
                }
                link = ChainLink::EntryNext(cur);
            }
            if let Some((dead, link)) = found {
                let sma = self.sma();
                entry::remove_entry(region, header_ptr, &sma, dead, &link);
                true
            } else {
                false
            }
        };
        lock.write_unlock();
        removed
    }

    /// Spec §4.5 `update`. Refuses in-place mutation of a serializer-backed
    /// composite payload (the stored bytes are opaque once encoded), and
    /// preserves the documented "surprising" behavior of stamping `mtime`
    /// even when the updater itself reports failure (spec §9 open
    /// question): this specification follows the original rather than
    /// "fixing" it.
    pub fn update<F>(&self, key: &[u8], mut updater: F, insert_if_not_found: bool, ttl: u32) -> bool
    where
        F: FnMut(&Pool, usize) -> bool,
    {
        match self.update_existing(key, &mut updater) {
            Some(ok) => ok,
            None if insert_if_not_found => {
                // `goto retry_update` (apc_cache_update): insert a
                // placeholder once, ignore a concurrent race loss, then
                // retry without re-entering this branch.
                self.store(key, &Value::Int(0), ttl, true);
                self.update_existing(key, &mut updater).unwrap_or(false)
            }
            None => false,
        }
    }

    /// Locates `key` under the write lock and, if found, runs `updater`
    /// against its live value in place. Returns `None` if no entry was
    /// found (distinguishing "absent" from "updater returned false" is
    /// what lets `update`'s retry-once logic work without a second chain
    /// walk's result leaking into the wrong branch).
    fn update_existing<F>(&self, key: &[u8], updater: &mut F) -> Option<bool>
    where
        F: FnMut(&Pool, usize) -> bool,
    {
        let t = now_unix();
        let key_hash = key::hash_key(key);
        let slot = self.slot_of(key_hash);
        let region = self.region_ptr();

        let lock = self.lock();
        lock.write_lock();
        let result = unsafe {
            entry::find_nostat(region, slot, key_hash, key, t).map(|off| {
                let pool = entry::pool(region, off);
                let h = entry::header_mut(region, off);
                let ok = if self.serializer.is_some() && value::is_opaque(&pool, h.val_offset as usize) {
                    false
                } else {
                    updater(&pool, h.val_offset as usize)
                };
                h.mtime = t;
                ok
            })
        };
        lock.write_unlock();
        result
    }

    /// Spec §4.9 `compute_if_absent`: return the existing value or
    /// compute-and-insert, atomically from the caller's point of view.
    /// `compute` may itself call back into this cache (an "upcall"); the
    /// thread-local depth counter means only the outermost call actually
    /// takes the write lock, matching the non-recursive-lock emulation
    /// spec §5 describes.
    pub fn compute_if_absent<F>(&self, key: &[u8], ttl: u32, t: i64, compute: F) -> Option<Value>
    where
        F: FnOnce() -> Option<Value>,
    {
        let key_hash = key::hash_key(key);
        let slot = self.slot_of(key_hash);
        let region = self.region_ptr();

        let depth = COMPUTE_DEPTH.with(|d| {
            let v = d.get();
            d.set(v + 1);
            v
        });
        let lock = self.lock();
        if depth == 0 {
            lock.write_lock();
        }

        let existing = unsafe { entry::find_nostat(region, slot, key_hash, key, t) };
        let result = if let Some(off) = existing {
            let (v, _ok) = unsafe {
                let pool = entry::pool(region, off);
                let h = entry::header(region, off);
                value::copy_out(h.val_offset as usize, &pool, self.serializer_ref())
            };
            Some(v)
        } else {
            match compute() {
                Some(v) => {
                    // Computation runs with the write lock still held
                    // (spec §4.9); `store` itself only re-acquires the
                    // read-free pool build, then the same recursive lock
                    // the platform's rwlock would need — since our default
                    // `ShmRwLock` is non-recursive, route the insert
                    // through the already-locked path directly instead of
                    // calling `store` (which would deadlock on relock).
                    let sma = self.sma();
                    let new_offset = unsafe {
                        entry::make_entry(region, &sma, key, key_hash, &v, ttl, t, self.serializer_ref())
                    };
                    if let Some(new_offset) = new_offset {
                        unsafe {
                            self.insert_locked(key, key_hash, t, true, new_offset, &sma);
                        }
                    }
                    Some(v)
                }
                None => None,
            }
        };

        if depth == 0 {
            lock.write_unlock();
        }
        COMPUTE_DEPTH.with(|d| d.set(depth));
        result
    }

    /// Spec §6 `stat`.
    pub fn stat(&self, key: &[u8]) -> Option<EntryStat> {
        let key_hash = key::hash_key(key);
        let slot = self.slot_of(key_hash);
        let region = self.region_ptr();
        let t = now_unix();

        let lock = self.lock();
        lock.read_lock();
        let found = unsafe { entry::find_nostat(region, slot, key_hash, key, t) };
        let stat = found.map(|off| {
            let h = unsafe { entry::header(region, off) };
            EntryStat {
                key_len: h.key_len,
                mem_size: h.mem_size,
                ttl: h.ttl,
                nhits: h.nhits.load(Ordering::Relaxed),
                ref_count: h.ref_count.load(Ordering::Relaxed),
                ctime: h.ctime,
                mtime: h.mtime,
                atime: h.atime.load(Ordering::Relaxed),
            }
        });
        lock.read_unlock();
        stat
    }

    /// Spec §6 `info(limited)`.
    pub fn info(&self, limited: bool) -> CacheInfo {
        let region = self.region_ptr();
        let lock = self.lock();
        lock.read_lock();

        let header = self.header();
        let sma = self.sma();
        let (entries, slot_distribution) = if limited {
            (None, None)
        } else {
            let nslots = header.nslots;
            let mut out = Vec::new();
            let mut distribution = Vec::with_capacity(nslots as usize);
            for slot in 0..nslots {
                let mut cur = unsafe { crate::table::read_slot(region, slot) };
                let mut chain_len = 0u32;
                while cur != NONE {
                    let h = unsafe { entry::header(region, cur) };
                    out.push((h.key_hash, h.key_len, h.mem_size, h.ttl));
                    chain_len += 1;
                    cur = h.next;
                }
                distribution.push(chain_len);
            }
            (Some(out), Some(distribution))
        };

        let deleted_entries = if limited {
            None
        } else {
            let mut out = Vec::new();
            let mut cur = header.gc;
            while cur != NONE {
                let h = unsafe { entry::header(region, cur) };
                out.push((h.key_hash, h.mem_size, h.ref_count.load(Ordering::Relaxed)));
                cur = h.next;
            }
            Some(out)
        };

        let info = CacheInfo {
            nhits: header.nhits.load(Ordering::Relaxed),
            nmisses: header.nmisses.load(Ordering::Relaxed),
            ninserts: header.ninserts,
            nentries: header.nentries,
            nexpunges: header.nexpunges,
            stime: header.stime,
            mem_size: header.mem_size,
            avail_mem: sma.avail_mem(),
            sma_size: sma.size(),
            entries,
            deleted_entries,
            slot_distribution,
        };
        lock.read_unlock();
        info
    }

    /// Spec §6 `clear`: a full wipe with counters reset. Equivalent to
    /// `expunge` with `cache.ttl` treated as `0` regardless of the
    /// configured soft TTL (spec §4.7).
    pub fn clear(&self) {
        let lock = self.lock();
        lock.write_lock();
        unsafe { self.wipe_locked() };
        let header = self.header_mut();
        header.nhits = std::sync::atomic::AtomicU64::new(0);
        header.nmisses = std::sync::atomic::AtomicU64::new(0);
        header.ninserts = 0;
        header.nexpunges += 1;
        lock.write_unlock();
    }

    /// Spec §4.7 `expunge(size)`.
    pub fn expunge(&self, size: usize) {
        let header_ptr = self.region_ptr() as *mut Header;
        let lock = self.lock();
        lock.write_lock();

        unsafe {
            (*header_ptr).state |= STATE_BUSY;
        }

        let suitable = {
            let smart = self.header().smart;
            if smart > 0 {
                smart as usize * size
            } else {
                self.sma().size() / 2
            }
        };

        let region = self.region_ptr();
        let sma = self.sma();
        unsafe {
            entry::gc_sweep(region, header_ptr, &sma, (*header_ptr).gc_ttl);
        }

        if sma.avail_mem() < suitable {
            let cache_ttl = self.header().ttl;
            if cache_ttl == 0 {
                unsafe { self.wipe_locked() };
            } else {
                let t = now_unix();
                unsafe { self.evict_expired_locked(t) };
                if sma.avail_mem() >= suitable {
                    defense::clear(self.header_mut());
                } else {
                    unsafe { self.wipe_locked() };
                }
            }
        }

        let header = self.header_mut();
        header.nexpunges += 1;
        header.state &= !STATE_BUSY;
        lock.write_unlock();
    }

    /// # Safety
    /// Caller must hold the write lock.
    unsafe fn wipe_locked(&self) {
        let region = self.region_ptr();
        let header_ptr = region as *mut Header;
        let sma = self.sma();
        let nslots = self.header().nslots;

        for slot in 0..nslots {
            let mut link = ChainLink::Slot(slot);
            loop {
                let cur = link.get(region);
                if cur == NONE {
                    break;
                }
                entry::remove_entry(region, header_ptr, &sma, cur, &link);
            }
        }
        entry::gc_sweep(region, header_ptr, &sma, (*header_ptr).gc_ttl);
        defense::clear(&mut *header_ptr);
    }

    /// Detach every hard- or soft-expired entry across all slots, without
    /// touching live ones. Used by `expunge`'s soft-TTL branch (spec
    /// §4.7 step 4).
    ///
    /// # Safety
    /// Caller must hold the write lock.
    unsafe fn evict_expired_locked(&self, t: i64) {
        let region = self.region_ptr();
        let header_ptr = region as *mut Header;
        let sma = self.sma();
        let nslots = self.header().nslots;
        let cache_ttl = self.header().ttl;

        for slot in 0..nslots {
            let mut link = ChainLink::Slot(slot);
            loop {
                let cur = link.get(region);
                if cur == NONE {
                    break;
                }
                let h = entry::header(region, cur);
                if entry::expired(h, cache_ttl, t) {
                    entry::remove_entry(region, header_ptr, &sma, cur, &link);
                } else {
                    link = ChainLink::EntryNext(cur);
                }
            }
        }
    }

    /// Spec §6 `preload`: load every `<key>.data` file under `path`,
    /// decode it with the configured serializer, and store it with
    /// `exclusive = true`, `ttl = 0`. Feature-gated: meaningful only in a
    /// single-process deployment, mirroring the original's `#ifndef ZTS`
    /// guard around `apc_cache_preload`.
    #[cfg(feature = "single-process")]
    pub fn preload(&self, path: &Path) -> bool {
        let serializer = match self.serializer_ref() {
            Some(s) => s,
            None => return false,
        };

        let dir = match fs::read_dir(path) {
            Ok(d) => d,
            Err(_) => return false,
        };

        let mut ok = true;
        for dir_entry in dir.flatten() {
            let p = dir_entry.path();
            let stem = match p.file_stem().and_then(|s| s.to_str()) {
                Some(s) if p.extension().and_then(|e| e.to_str()) == Some("data") => s.to_string(),
                _ => continue,
            };
            let bytes = match fs::read(&p) {
                Ok(b) => b,
                Err(_) => {
                    ok = false;
                    continue;
                }
            };
            match serializer.decode(&bytes) {
                Some(value) => {
                    if !self.store(stem.as_bytes(), &value, 0, true) {
                        ok = false;
                    }
                }
                None => ok = false,
            }
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn fresh_cache() -> Cache {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let name = format!("userdata_cache_unit_{}_{n}", std::process::id());
        let config = CacheConfig::new(name).sma_size(1 << 20).size_hint(53);
        Cache::create(config, None).expect("cache create")
    }

    #[test]
    fn store_then_find_round_trips() {
        let cache = fresh_cache();
        assert!(cache.store(b"k", &Value::Int(42), 0, false));
        let t = now_unix();
        let handle = cache.find(b"k", t).expect("hit");
        let (v, ok) = handle.value();
        assert!(ok);
        assert!(matches!(v, Value::Int(42)));
    }

    #[test]
    fn find_miss_bumps_nmisses() {
        let cache = fresh_cache();
        let t = now_unix();
        assert!(cache.find(b"absent", t).is_none());
        assert_eq!(cache.info(true).nmisses, 1);
    }

    #[test]
    fn exclusive_store_refuses_to_overwrite_a_live_entry() {
        let cache = fresh_cache();
        assert!(cache.store(b"k", &Value::Int(1), 0, false));
        assert!(!cache.store(b"k", &Value::Int(2), 0, true));
        let t = now_unix();
        let (v, _) = cache.find(b"k", t).unwrap().value();
        assert!(matches!(v, Value::Int(1)));
    }

    #[test]
    fn non_exclusive_store_overwrites() {
        let cache = fresh_cache();
        assert!(cache.store(b"k", &Value::Int(1), 0, false));
        assert!(cache.store(b"k", &Value::Int(2), 0, false));
        let t = now_unix();
        let (v, _) = cache.find(b"k", t).unwrap().value();
        assert!(matches!(v, Value::Int(2)));
    }

    #[test]
    fn hard_expired_entry_is_invisible_and_overwritable() {
        let cache = fresh_cache();
        assert!(cache.store(b"k", &Value::Int(1), 1, false));
        let future = now_unix() + 1000;
        assert!(!cache.exists(b"k", future));
        // An exclusive store should succeed once the old entry is hard-expired.
        assert!(cache.store(b"k", &Value::Int(2), 0, true));
    }

    #[test]
    fn delete_removes_and_is_idempotent() {
        let cache = fresh_cache();
        assert!(cache.store(b"k", &Value::Int(1), 0, false));
        assert!(cache.delete(b"k"));
        assert!(!cache.delete(b"k"));
        let t = now_unix();
        assert!(!cache.exists(b"k", t));
    }

    #[test]
    fn update_mutates_in_place_without_reallocating() {
        let cache = fresh_cache();
        assert!(cache.store(b"counter", &Value::Int(10), 0, false));
        let ok = cache.update(b"counter", |pool, off| unsafe { value::write_int(pool, off, 11) }, false, 0);
        assert!(ok);
        let t = now_unix();
        let (v, _) = cache.find(b"counter", t).unwrap().value();
        assert!(matches!(v, Value::Int(11)));
    }

    #[test]
    fn update_stamps_mtime_even_when_updater_fails() {
        let cache = fresh_cache();
        assert!(cache.store(b"counter", &Value::Str(b"not an int".to_vec()), 0, false));
        let before = cache.stat(b"counter").unwrap().mtime;
        std::thread::sleep(std::time::Duration::from_millis(1100));
        let ok = cache.update(b"counter", |pool, off| unsafe { value::write_int(pool, off, 1) }, false, 0);
        assert!(!ok, "write_int on a Str node must fail");
        let after = cache.stat(b"counter").unwrap().mtime;
        assert!(after > before, "mtime must be stamped even on updater failure");
    }

    #[test]
    fn update_with_insert_if_not_found_creates_then_updates() {
        let cache = fresh_cache();
        let ok = cache.update(b"new-counter", |pool, off| unsafe { value::write_int(pool, off, 5) }, true, 0);
        assert!(ok);
        let t = now_unix();
        let (v, _) = cache.find(b"new-counter", t).unwrap().value();
        assert!(matches!(v, Value::Int(5)));
    }

    #[test]
    fn compute_if_absent_only_computes_once() {
        let cache = fresh_cache();
        let calls = std::cell::Cell::new(0);
        let t = now_unix();
        let v1 = cache.compute_if_absent(b"k", 0, t, || {
            calls.set(calls.get() + 1);
            Some(Value::Int(7))
        });
        let v2 = cache.compute_if_absent(b"k", 0, t, || {
            calls.set(calls.get() + 1);
            Some(Value::Int(9))
        });
        assert!(matches!(v1, Some(Value::Int(7))));
        assert!(matches!(v2, Some(Value::Int(7))));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn compute_if_absent_returning_none_stores_nothing() {
        let cache = fresh_cache();
        let t = now_unix();
        let v = cache.compute_if_absent(b"k", 0, t, || None);
        assert!(v.is_none());
        assert!(!cache.exists(b"k", t));
    }

    #[test]
    fn clear_wipes_entries_and_resets_hit_counters() {
        let cache = fresh_cache();
        assert!(cache.store(b"k", &Value::Int(1), 0, false));
        let t = now_unix();
        let _ = cache.find(b"k", t);
        cache.clear();
        assert!(!cache.exists(b"k", t));
        let info = cache.info(true);
        assert_eq!(info.nhits, 0);
        assert_eq!(info.nmisses, 0);
        assert_eq!(info.nentries, 0);
        assert_eq!(info.nexpunges, 1);
    }

    #[test]
    fn slam_defense_collapses_duplicate_concurrent_insert() {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let name = format!("userdata_cache_unit_defend_{}_{n}", std::process::id());
        let config = CacheConfig::new(name).sma_size(1 << 20).size_hint(53).defend(true);
        let cache = Cache::create(config, None).expect("cache create");

        // First store from this owner stamps `lastkey` but the fingerprint
        // starts uninitialized (hash == 0 is a no-op per defense.rs), so it
        // takes a first store to arm it, then a second "different owner,
        // same second" store to actually observe a slam.
        assert!(cache.store(b"hot-key", &Value::Int(1), 0, false));

        // Simulate a different owner racing for the same key in the same
        // second by writing the fingerprint as if another pid had just
        // stamped it, then trying to store again ourselves.
        {
            let header = cache.header_mut();
            header.lastkey_owner = header.lastkey_owner.wrapping_add(1);
        }
        let slammed = !cache.store(b"hot-key", &Value::Int(2), 0, false);
        assert!(slammed, "second store from a distinct owner in the same second should be slammed");
    }

    #[test]
    fn info_limited_omits_entry_list() {
        let cache = fresh_cache();
        assert!(cache.store(b"k", &Value::Int(1), 0, false));
        let limited = cache.info(true);
        assert!(limited.entries.is_none());
        assert!(limited.deleted_entries.is_none());
        assert!(limited.slot_distribution.is_none());

        let full = cache.info(false);
        assert_eq!(full.entries.as_ref().unwrap().len(), 1);
        assert!(full.deleted_entries.unwrap().is_empty());
        assert_eq!(full.slot_distribution.unwrap().iter().sum::<u32>(), 1);
    }
}
