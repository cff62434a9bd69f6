//! Slot table: the fixed-size chain-head array and the prime-table sizing
//! rule from spec §3/§4.1.
use crate::layout::{self, NONE};

/// A mutable handle to "whatever currently points at this chain position"
/// — either a slot head word or a predecessor entry's `next` field. Mirrors
/// the `apc_cache_entry_t **entry` double-pointer walk in the original: the
/// chain-walking code can unlink the current entry by writing through
/// `link` without needing to special-case "am I the head".
#[derive(Debug, Clone, Copy)]
pub enum ChainLink {
    Slot(u32),
    EntryNext(i64),
}

impl ChainLink {
    /// # Safety
    /// `region` must be validly mapped for either a slot word or an
    /// `EntryHeader`, matching the variant.
    pub unsafe fn get(&self, region: *const u8) -> i64 {
        match *self {
            ChainLink::Slot(s) => read_slot(region, s),
            ChainLink::EntryNext(off) => crate::entry::header(region, off).next,
        }
    }

    /// # Safety
    /// Same as [`ChainLink::get`], plus the caller must hold the write lock.
    pub unsafe fn set(&self, region: *mut u8, value: i64) {
        match *self {
            ChainLink::Slot(s) => write_slot(region, s, value),
            ChainLink::EntryNext(off) => crate::entry::header_mut(region, off).next = value,
        }
    }
}

/// Primes used to size the slot table. "The smallest prime from a fixed
/// table ≥ the requested size hint (default 2000)" (spec §3); if the hint
/// exceeds every entry, the largest prime here is used instead (spec §4.1:
/// "or the maximum table entry if the hint exceeds it").
const PRIMES: &[u32] = &[
    53, 101, 199, 401, 809, 1_609, 3_203, 6_421, 12_853, 25_717, 51_437, 102_877, 205_759,
    411_527, 823_117, 1_646_237, 3_292_489, 6_584_983, 13_169_977, 26_339_969, 52_679_969,
    105_359_939,
];

/// Smallest prime in [`PRIMES`] strictly greater than the hint, clamped to
/// the largest table entry if the hint is bigger than all of them. Mirrors
/// `make_prime`'s `while(*k) { if((*k) > n) return *k; k++; }` in the
/// original — strictly greater, not `>=`, so a hint that exactly equals a
/// table entry still rounds up to the next prime.
pub fn nslots_for_hint(hint: u32) -> u32 {
    PRIMES.iter().copied().find(|&p| p > hint).unwrap_or(*PRIMES.last().unwrap())
}

/// Read the chain-head word for `slot` (region offset of the first entry,
/// or [`NONE`]). Pure pointer arithmetic; caller must hold at least the
/// read lock.
///
/// # Safety
/// `region_base` must point to a mapped region with `slot < nslots` slot
/// words laid out starting at `layout::slots_offset()`.
pub unsafe fn read_slot(region_base: *const u8, slot: u32) -> i64 {
    let off = layout::slots_offset() + slot as usize * layout::SLOT_WORD_SIZE;
    let ptr = region_base.add(off) as *const i64;
    *ptr
}

/// Write the chain-head word for `slot`. Caller must hold the write lock.
///
/// # Safety
/// Same requirements as [`read_slot`], plus exclusive write access.
pub unsafe fn write_slot(region_base: *mut u8, slot: u32, head: i64) {
    let off = layout::slots_offset() + slot as usize * layout::SLOT_WORD_SIZE;
    let ptr = region_base.add(off) as *mut i64;
    *ptr = head;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nslots_for_hint_picks_smallest_prime_strictly_above() {
        assert_eq!(nslots_for_hint(2000), 3203);
        assert_eq!(nslots_for_hint(200), 401);
        assert_eq!(nslots_for_hint(1), 53);
    }

    #[test]
    fn nslots_for_hint_rounds_past_an_exact_prime_match() {
        assert_eq!(nslots_for_hint(1_609), 3_203);
        assert_eq!(nslots_for_hint(53), 101);
    }

    #[test]
    fn nslots_for_hint_clamps_to_largest_entry() {
        assert_eq!(nslots_for_hint(u32::MAX), *PRIMES.last().unwrap());
    }

    #[test]
    fn slot_words_round_trip() {
        let nslots = 8u32;
        let mut buf = vec![0u8; layout::slots_offset() + nslots as usize * layout::SLOT_WORD_SIZE];
        for i in 0..nslots {
            unsafe { write_slot(buf.as_mut_ptr(), i, NONE) };
        }
        unsafe { write_slot(buf.as_mut_ptr(), 3, 128) };
        assert_eq!(unsafe { read_slot(buf.as_ptr(), 3) }, 128);
        assert_eq!(unsafe { read_slot(buf.as_ptr(), 0) }, NONE);
    }
}
