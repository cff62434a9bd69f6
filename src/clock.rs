//! Wall-clock seconds, the single time source every TTL/GC computation in
//! this crate compares against. A thin wrapper so every call site reads
//! `apc_time()`'s intent (`time(NULL)` in the original) rather than
//! re-deriving it from `SystemTime` locally.
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
