//! `#[repr(C)]` structures that live in the shared-memory region.
//!
//! All structs use fixed-size fields and explicit padding so the layout is
//! identical across compilations and processes. Nothing here holds a raw
//! pointer: cross-entry links are region-relative `i64` offsets, because two
//! processes map the same file at different base addresses.
//!
//! Fields touched while only a *read* lock is held (`Header::nhits`,
//! `Header::nmisses`, `EntryHeader::nhits`, `EntryHeader::atime`,
//! `EntryHeader::ref_count`) are atomics, per spec §5: the default lock is
//! a real `pthread_rwlock` that lets readers run concurrently, so the
//! "recursive single-writer, plain increments are fine" exemption does not
//! apply. Every other field is mutated only under the write lock and stays
//! a plain integer.
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU64};

use crate::lock::MUTEX_SIZE;

/// Magic bytes at the start of the header, validating the mapping.
pub const MAGIC: [u8; 8] = *b"UDCACH01";

/// Size of the fixed header at the start of the region.
pub const HEADER_SIZE: usize = 256;

/// Sentinel meaning "no slot" / "no entry" in chain and GC links.
pub const NONE: i64 = -1;

/// `BUSY` bit of `Header.state`: set while `clear`/`expunge` run.
pub const STATE_BUSY: u32 = 1 << 0;

/// Header lives at offset 0 of the region.
///
/// Fields are ordered widest-first so `#[repr(C)]` introduces no implicit
/// padding; the explicit `_pad` tail rounds the struct up to [`HEADER_SIZE`].
#[repr(C)]
#[derive(Debug)]
pub struct Header {
    // 8-byte aligned group
    pub magic: [u8; 8],  // 0..8
    pub stime: i64,      // 8..16   cache start time (unix seconds)
    pub nhits: AtomicU64,   // 16..24  bumped under the read lock by `find`
    pub nmisses: AtomicU64, // 24..32  bumped under the read lock by `find`
    pub ninserts: u64,  // 32..40
    pub nexpunges: u64, // 40..48
    pub mem_size: u64,  // 48..56  aggregate live entry bytes (I6)
    pub gc: i64,        // 56..64  head of GC list, region offset or NONE

    // slam defense fingerprint (§4.8)
    pub lastkey_hash: u64,  // 64..72
    pub lastkey_len: u64,   // 72..80
    pub lastkey_mtime: i64, // 80..88
    pub lastkey_owner: u64, // 88..96

    pub sma_free_head: i64, // 96..104 head of the Sma's free-block list, or NONE

    // 4-byte aligned group
    pub state: u32,          // 104..108
    pub nslots: u32,         // 108..112 fixed chain-head count N
    pub gc_ttl: u32,         // 112..116 seconds, 0 = never escape-hatch free
    pub ttl: u32,            // 116..120 global soft TTL, 0 = disabled
    pub smart: u32,          // 120..124 expunge "smart" multiplier (x1000 fixed point), 0 = disabled
    pub defend: u32,         // 124..128 slam defense on/off
    pub max_key_size: u32,   // 128..132
    pub max_value_size: u32, // 132..136

    pub nentries: u64, // 136..144 live entry count across all chains

    /// Raw storage for the `Sma`'s own process-shared `pthread_mutex_t`
    /// (`lock::ShmMutex`), separate from `Header.lock`/`ShmRwLock` above:
    /// `Cache::store` allocates a pool before taking the header rwlock
    /// (spec §4.3 steps 2-3), so the allocator needs its own cross-process
    /// lock to serialize concurrent `Sma::alloc`/`Sma::free` calls.
    pub sma_lock: [u8; MUTEX_SIZE], // 144..208

    pub _pad: [u8; 48],
}

const _: () = assert!(std::mem::size_of::<Header>() == HEADER_SIZE);
const _: () = assert!(std::mem::align_of::<Header>() == 8);

/// One chain-head word in the slot table: a region offset to the first
/// [`EntryHeader`] in the chain, or [`NONE`].
pub const SLOT_WORD_SIZE: usize = 8;

/// Fixed per-entry header, the first bytes of the entry's own pool.
/// Followed by `key_len` key bytes, then the encoded value-node bytes (see
/// `value::pool_codec`). The entry's own region offset (its chain/GC link
/// target) is also its pool's start offset — an entry owns exactly the
/// pool carved for it, so the two coincide.
pub const ENTRY_HEADER_SIZE: usize = 80;

#[repr(C)]
#[derive(Debug)]
pub struct EntryHeader {
    // 8-byte aligned group
    pub key_hash: u64,      // 0..8
    pub ctime: i64,         // 8..16  creation time
    pub mtime: i64,         // 16..24 last modification time
    pub atime: AtomicI64,   // 24..32 last access time, bumped under the read lock
    pub dtime: i64,         // 32..40 deletion time (GC entry only, else 0)
    pub nhits: AtomicU64,   // 40..48 per-entry hit count, bumped under the read lock
    pub next: i64,          // 48..56 chain OR gc-list successor, region offset or NONE

    // 4-byte aligned group
    pub ttl: u32,             // 56..60 per-entry TTL seconds, 0 = none
    pub ref_count: AtomicI32, // 60..64 outstanding handles (I3), bumped under the read lock
    pub key_len: u32,       // 64..68
    pub val_offset: u32,    // 68..72 offset of the value node, relative to this entry's pool start
    pub mem_size: u32,      // 72..76 bytes this entry occupies (pool-size snapshot, I6)
    pub pool_capacity: u32, // 76..80 bytes reserved from the Sma for this entry's pool
}

const _: () = assert!(std::mem::size_of::<EntryHeader>() == ENTRY_HEADER_SIZE);

/// Offset of the slot-head array from the start of the region.
pub fn slots_offset() -> usize {
    HEADER_SIZE
}

/// Offset of the entry pool arena from the start of the region.
pub fn arena_offset(nslots: u32) -> usize {
    HEADER_SIZE + nslots as usize * SLOT_WORD_SIZE
}
