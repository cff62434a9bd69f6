//! Shared-memory, multi-process-visible user data cache core.
//!
//! A hash-chained slot table lives in a single `mmap`-backed region that
//! any number of independent processes can attach to; a header-embedded
//! `pthread_rwlock` (see [`lock`]) protects it. Entries carry per-entry
//! TTLs plus an optional global soft TTL, are reclaimed through a
//! deferred GC list rather than freed the instant a reader might still
//! hold a reference (see [`entry`]), and a single-slot "slam defense"
//! fingerprint (see [`defense`]) collapses duplicate concurrent inserts
//! of the same key.
//!
//! [`Cache`] is the entry point: [`Cache::create`] maps or creates the
//! named region, then [`Cache::store`]/[`Cache::find`]/[`Cache::fetch`]/
//! [`Cache::update`]/[`Cache::delete`] form the operational surface.
pub mod cache;
pub mod clock;
pub mod config;
pub mod defense;
pub mod entry;
pub mod error;
pub mod key;
pub mod layout;
pub mod lock;
pub mod pool;
pub mod region;
pub mod sma;
pub mod table;
pub mod value;

pub use cache::{Cache, CacheInfo, EntryHandle, EntryStat, FetchResult};
pub use config::CacheConfig;
pub use error::CacheError;
pub use value::{OpaqueKind, Serializer, TextSerializer, Value};
