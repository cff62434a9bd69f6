//! Entry lifecycle (spec §3/§4.6): creation, hard/soft expiry, the deferred
//! GC list, and freeing. Entries are addressed the way the rest of this
//! crate addresses shared-memory structures — as a region base pointer
//! plus a region-relative `i64` offset — rather than as an owned Rust
//! value, mirroring `table::read_slot`/`write_slot`.
//!
//! Grounded on `apc_cache_entry_hard_expired`/`soft_expired`,
//! `apc_cache_wlocked_remove_entry` and `apc_cache_wlocked_gc` in
//! `original_source/apc_cache.c`.
use std::sync::atomic::Ordering;

use crate::layout::{EntryHeader, Header, ENTRY_HEADER_SIZE, NONE};
use crate::pool::Pool;
use crate::sma::Sma;
use crate::table::ChainLink;
use crate::value::{self, Serializer, Value};

/// Borrow the entry header at `offset`. Caller must hold at least the read
/// lock and `offset` must name a live entry.
///
/// # Safety
/// `region` must point to a mapped region containing a valid `EntryHeader`
/// at `offset`.
pub unsafe fn header<'a>(region: *const u8, offset: i64) -> &'a EntryHeader {
    &*(region.add(offset as usize) as *const EntryHeader)
}

/// # Safety
/// Same as [`header`], plus the caller must hold the write lock (or
/// otherwise have exclusive access) before mutating non-atomic fields.
pub unsafe fn header_mut<'a>(region: *mut u8, offset: i64) -> &'a mut EntryHeader {
    &mut *(region.add(offset as usize) as *mut EntryHeader)
}

/// The entry's key bytes, stored immediately after its header.
///
/// # Safety
/// Same as [`header`].
pub unsafe fn key_bytes<'a>(region: *const u8, offset: i64) -> &'a [u8] {
    let h = header(region, offset);
    std::slice::from_raw_parts(
        region.add(offset as usize + ENTRY_HEADER_SIZE),
        h.key_len as usize,
    )
}

/// Build a read/write view of the entry's own pool (key bytes + encoded
/// value live inside it, per `layout::ENTRY_HEADER_SIZE`'s doc comment).
///
/// # Safety
/// Same as [`header`].
pub unsafe fn pool(region: *mut u8, offset: i64) -> Pool {
    let h = header(region, offset);
    Pool::new(region, offset as usize, h.pool_capacity as usize)
}

fn key_matches(region: *const u8, offset: i64, hash: u64, key: &[u8]) -> bool {
    let h = unsafe { header(region, offset) };
    h.key_hash == hash
        && h.key_len as usize == key.len()
        && unsafe { key_bytes(region, offset) } == key
}

/// `entry->ttl && (entry->ctime + entry->ttl) < t` — invisible everywhere.
pub fn hard_expired(h: &EntryHeader, t: i64) -> bool {
    h.ttl != 0 && h.ctime + h.ttl as i64 < t
}

/// `!entry->ttl && cache->ttl && (entry->atime + cache->ttl) < t` — visible
/// to `find`/`exists`, eligible for eviction during expunge.
pub fn soft_expired(h: &EntryHeader, cache_ttl: u32, t: i64) -> bool {
    h.ttl == 0 && cache_ttl != 0 && h.atime.load(Ordering::Relaxed) + cache_ttl as i64 < t
}

pub fn expired(h: &EntryHeader, cache_ttl: u32, t: i64) -> bool {
    hard_expired(h, t) || soft_expired(h, cache_ttl, t)
}

/// Find the chain link (slot head or a predecessor's `next`) whose target
/// matches `key`, walking from `slot`'s head. Opportunistically unlinks
/// any hard- or soft-expired entry found along the way (spec §4.3 step 5's
/// "opportunistic inline cleanup"), except the entry described by
/// `protect`, which the caller is about to replace (and must detach itself
/// — this function skips over it, leaving removal to the caller) if its
/// `ttl` makes it a removal candidate too.
///
/// Returns `(link pointing at the matching entry's slot, matching offset)`
/// or `(link pointing at the tail, None)` if absent.
///
/// # Safety
/// Caller must hold the write lock.
pub unsafe fn find_chain_slot_for_insert(
    region: *mut u8,
    header_ptr: *mut Header,
    sma: &dyn Sma,
    slot: u32,
    key_hash: u64,
    key: &[u8],
    cache_ttl: u32,
    t: i64,
) -> (ChainLink, Option<i64>) {
    let mut link = ChainLink::Slot(slot);
    loop {
        let cur = link.get(region);
        if cur == NONE {
            return (link, None);
        }
        if key_matches(region, cur, key_hash, key) {
            return (link, Some(cur));
        }
        let h = header(region, cur);
        if expired(h, cache_ttl, t) {
            remove_entry(region, header_ptr, sma, cur, &link);
            // `link` now targets whatever replaced `cur` (its old `next`);
            // re-check the same position rather than advancing.
            continue;
        }
        link = ChainLink::EntryNext(cur);
    }
}

/// `find_nostat` (spec §4.4): walk the chain, stop at the first
/// hash+len+byte match that is not hard-expired. Soft-expired entries are
/// still returned — they remain visible until the next expunge.
///
/// # Safety
/// Caller must hold at least the read lock.
pub unsafe fn find_nostat(region: *const u8, slot: u32, key_hash: u64, key: &[u8], t: i64) -> Option<i64> {
    let mut cur = crate::table::read_slot(region, slot);
    while cur != NONE {
        let h = header(region, cur);
        if h.key_hash == key_hash && h.key_len as usize == key.len() && key_bytes(region, cur) == key {
            if hard_expired(h, t) {
                return None;
            }
            return Some(cur);
        }
        cur = h.next;
    }
    None
}

/// Unlink `dead` from wherever `link` currently points, then either free it
/// immediately (`ref_count <= 0`) or migrate it to the GC list (spec §4.6).
///
/// # Safety
/// Caller must hold the write lock; `link` must currently resolve to
/// `dead`.
pub unsafe fn remove_entry(
    region: *mut u8,
    header_ptr: *mut Header,
    sma: &dyn Sma,
    dead: i64,
    link: &ChainLink,
) {
    let dead_header = header_mut(region, dead);
    link.set(region, dead_header.next);

    let header = &mut *header_ptr;
    header.mem_size = header.mem_size.saturating_sub(dead_header.mem_size as u64);
    // nentries is decremented by the GC list path too; guard against
    // double-decrementing entries that were already off the slot chains.
    header.nentries = header.nentries.saturating_sub(1);

    if dead_header.ref_count.load(Ordering::Relaxed) <= 0 {
        free_entry(sma, dead, dead_header.pool_capacity as usize);
    } else {
        dead_header.dtime = crate::clock::now_unix();
        dead_header.next = header.gc;
        header.gc = dead;
    }
}

/// Sweep the GC list (spec §4.6), run at the top of every write-locked
/// store and at the top of expunge. Frees every entry with no outstanding
/// references, and also frees (with a leak diagnostic) any entry that has
/// sat on the list longer than `gc_ttl` seconds.
///
/// # Safety
/// Caller must hold the write lock.
pub unsafe fn gc_sweep(region: *mut u8, header_ptr: *mut Header, sma: &dyn Sma, gc_ttl: u32) {
    let header = &mut *header_ptr;
    if header.gc == NONE {
        return;
    }

    let now = crate::clock::now_unix();
    let mut prev: Option<i64> = None;
    let mut cur = header.gc;

    while cur != NONE {
        let h = header_mut(region, cur);
        let gc_sec = if gc_ttl > 0 { now - h.dtime } else { 0 };
        let refs = h.ref_count.load(Ordering::Relaxed);

        if refs <= 0 || (gc_ttl > 0 && gc_sec > gc_ttl as i64) {
            if refs > 0 {
                log::warn!(
                    "GC cache entry was on gc-list for {gc_sec} seconds with {refs} outstanding reference(s), freeing anyway"
                );
            }
            let next = h.next;
            match prev {
                Some(p) => header_mut(region, p).next = next,
                None => header.gc = next,
            }
            free_entry(sma, cur, h.pool_capacity as usize);
            cur = next;
        } else {
            prev = Some(cur);
            cur = h.next;
        }
    }
}

/// Destroy an entry's pool as a unit (spec I7: "freeing the pool frees the
/// entry entirely").
///
/// # Safety
/// `offset`/`len` must be exactly the block this entry's pool was
/// allocated with, and the entry must not be reachable from any slot chain
/// or the GC list anymore.
pub unsafe fn free_entry(sma: &dyn Sma, offset: i64, len: usize) {
    sma.free(offset, len);
}

/// Bump `ref_count` under the read lock (spec §4.4: `find(incref=true)`).
///
/// # Safety
/// Caller must hold at least the read lock.
pub unsafe fn incref(region: *mut u8, offset: i64) {
    header_mut(region, offset).ref_count.fetch_add(1, Ordering::Relaxed);
}

/// `apc_cache_entry_release`: drop one outstanding reference. May be called
/// without any lock held — the decrement itself is atomic, and the freed
/// entry (if this was the last reference) waits on the GC list until the
/// next write-locked sweep.
pub fn release(region: *mut u8, offset: i64) {
    unsafe { header_mut(region, offset).ref_count.fetch_sub(1, Ordering::Relaxed) };
}

/// Allocate a fresh pool and build a complete entry for `(key, val)`,
/// returning its region offset. Matches `apc_cache_make_entry`'s shape:
/// key then value live in one pool, sized exactly up front.
///
/// On any failure (codec error sizing the value, or `Sma` exhaustion) no
/// partial state survives: the allocation, if one was made, is freed
/// before returning `None`.
///
/// # Safety
/// Caller must hold no particular lock (pool construction does not touch
/// the slot table or header), but `region`/`sma` must describe the same
/// mapped region.
pub unsafe fn make_entry(
    region: *mut u8,
    sma: &dyn Sma,
    key: &[u8],
    key_hash: u64,
    val: &Value,
    ttl: u32,
    t: i64,
    serializer: Option<&dyn Serializer>,
) -> Option<i64> {
    let value_size = value::encoded_size(val, serializer)?;
    let capacity = ENTRY_HEADER_SIZE + key.len() + value_size;
    let offset = sma.alloc(capacity)?;

    let pool = Pool::new(region, offset as usize, capacity);
    pool.reserve(ENTRY_HEADER_SIZE); // header itself, written directly below
    let key_off = pool.reserve(key.len());
    match key_off {
        Some(off) => pool.write(off, key),
        None => {
            sma.free(offset, capacity);
            return None;
        }
    }

    let val_offset = match value::copy_in(val, &pool, serializer) {
        Some(off) => off,
        None => {
            sma.free(offset, capacity);
            return None;
        }
    };

    let h = header_mut(region, offset);
    h.key_hash = key_hash;
    h.ctime = t;
    h.mtime = t;
    h.atime = std::sync::atomic::AtomicI64::new(t);
    h.dtime = 0;
    h.nhits = std::sync::atomic::AtomicU64::new(0);
    h.next = NONE;
    h.ttl = ttl;
    h.ref_count = std::sync::atomic::AtomicI32::new(0);
    h.key_len = key.len() as u32;
    h.val_offset = val_offset as u32;
    h.mem_size = capacity as u32;
    h.pool_capacity = capacity as u32;

    Some(offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hard_expired_requires_nonzero_ttl() {
        let mut h: EntryHeader = unsafe { std::mem::zeroed() };
        h.ctime = 100;
        h.ttl = 0;
        assert!(!hard_expired(&h, 1_000_000));
        h.ttl = 10;
        assert!(hard_expired(&h, 111));
        assert!(!hard_expired(&h, 110));
    }

    #[test]
    fn soft_expired_only_applies_without_a_per_entry_ttl() {
        let mut h: EntryHeader = unsafe { std::mem::zeroed() };
        h.ttl = 0;
        h.atime = std::sync::atomic::AtomicI64::new(100);
        assert!(soft_expired(&h, 10, 111));
        assert!(!soft_expired(&h, 10, 109));
        h.ttl = 5;
        assert!(!soft_expired(&h, 10, 1000), "per-entry ttl disables soft expiry");
    }
}
