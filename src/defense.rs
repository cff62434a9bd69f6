//! Slam defense (spec §4.8): a single-slot fingerprint that collapses
//! duplicate concurrent inserts of the same key within the same
//! wall-clock second.
//!
//! Grounded on `apc_cache_defense` in `original_source/apc_cache.c`, with
//! one deliberate divergence recorded in DESIGN.md: the original only ever
//! restamps `lastkey` when the incoming key already matches it, which
//! (combined with the `hash == 0` bootstrap check) makes the fingerprint
//! permanently inert in practice. spec.md §4.8 states the four branches
//! below as a plain if/elif/else, where the final branch stamps on *any*
//! non-slammed store, not just same-key ones; that literal reading is what
//! this function implements.
use crate::layout::Header;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Slammed,
}

/// Evaluate and, unless suppressed, update the fingerprint. `header` must
/// be reached through the write lock: every field touched here is a plain
/// (non-atomic) integer.
pub fn check_and_stamp(
    header: &mut Header,
    key_hash: u64,
    key_len: usize,
    now: i64,
    defend: bool,
    owner: u64,
) -> Verdict {
    if !defend {
        return Verdict::Allow;
    }

    if header.lastkey_hash == 0 {
        // Uninitialized fingerprint: spec.md treats this as a pure no-op,
        // not a stamping opportunity.
        return Verdict::Allow;
    }

    if header.lastkey_hash == key_hash && header.lastkey_len == key_len as u64 {
        if header.lastkey_mtime == now && header.lastkey_owner != owner {
            log::debug!("slam defense averted a duplicate concurrent insert");
            return Verdict::Slammed;
        }
    }

    header.lastkey_hash = key_hash;
    header.lastkey_len = key_len as u64;
    header.lastkey_mtime = now;
    header.lastkey_owner = owner;
    Verdict::Allow
}

/// Reset the fingerprint, as `apc_cache_wlocked_real_expunge` does via
/// `memset(&cache->header->lastkey, 0, ...)`.
pub fn clear(header: &mut Header) {
    header.lastkey_hash = 0;
    header.lastkey_len = 0;
    header.lastkey_mtime = 0;
    header.lastkey_owner = 0;
}

/// A per-process-or-thread identity distinct across callers that could
/// race for the same key in the same second. The original uses `getpid()`
/// in the non-ZTS build; we do the same since `single-process` is this
/// crate's default (and only fully supported) configuration.
pub fn current_owner() -> u64 {
    std::process::id() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_header() -> Header {
        unsafe { std::mem::zeroed() }
    }

    #[test]
    fn defense_off_is_always_allow() {
        let mut h = blank_header();
        h.lastkey_hash = 7;
        assert_eq!(check_and_stamp(&mut h, 7, 1, 100, false, 1), Verdict::Allow);
    }

    #[test]
    fn uninitialized_fingerprint_is_a_noop() {
        let mut h = blank_header();
        assert_eq!(check_and_stamp(&mut h, 7, 1, 100, true, 1), Verdict::Allow);
        assert_eq!(h.lastkey_hash, 0, "hash==0 branch must not stamp");
    }

    #[test]
    fn same_key_same_second_different_owner_is_slammed() {
        let mut h = blank_header();
        h.lastkey_hash = 7;
        h.lastkey_len = 1;
        h.lastkey_mtime = 100;
        h.lastkey_owner = 1;
        assert_eq!(check_and_stamp(&mut h, 7, 1, 100, true, 2), Verdict::Slammed);
    }

    #[test]
    fn same_key_same_owner_is_allowed_and_restamped() {
        let mut h = blank_header();
        h.lastkey_hash = 7;
        h.lastkey_len = 1;
        h.lastkey_mtime = 100;
        h.lastkey_owner = 1;
        assert_eq!(check_and_stamp(&mut h, 7, 1, 100, true, 1), Verdict::Allow);
        assert_eq!(h.lastkey_mtime, 100);
    }

    #[test]
    fn different_key_stamps_over_the_old_fingerprint() {
        let mut h = blank_header();
        h.lastkey_hash = 7;
        h.lastkey_len = 1;
        h.lastkey_mtime = 50;
        h.lastkey_owner = 1;
        assert_eq!(check_and_stamp(&mut h, 99, 3, 100, true, 2), Verdict::Allow);
        assert_eq!(h.lastkey_hash, 99);
        assert_eq!(h.lastkey_len, 3);
        assert_eq!(h.lastkey_mtime, 100);
        assert_eq!(h.lastkey_owner, 2);
    }
}
