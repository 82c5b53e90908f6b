//! Reverse lookup from an arbitrary interior pointer to the sub-pool that
//! owns it.
//!
//! Activated sub-pools register their base pointers here, kept sorted by
//! address. Lookup rounds the entry count up to a power of two and walks a
//! branchless halving descent over the array; absent entries read as null and
//! compare as "after everything", so the descent needs no length checks.

use std::ptr;

use crate::bits::round_up_pow2;
use crate::coordinates::SUB_POOL_COUNT;

/// One activated sub-pool's base address.
#[derive(Clone, Copy, Debug)]
struct SortedBase {
    base: *mut u8,
    sub_pool: usize,
}

impl SortedBase {
    const EMPTY: Self = Self {
        base: ptr::null_mut(),
        sub_pool: SUB_POOL_COUNT,
    };
}

/// The sorted (base pointer, sub-pool) table. At most one entry per sub-pool,
/// so a fixed array of `SUB_POOL_COUNT` entries always suffices.
#[derive(Debug)]
pub(crate) struct SortedIndex {
    entries: [SortedBase; SUB_POOL_COUNT],
    len: usize,
}

impl SortedIndex {
    pub(crate) fn new() -> Self {
        Self {
            entries: [SortedBase::EMPTY; SUB_POOL_COUNT],
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn clear(&mut self) {
        self.entries = [SortedBase::EMPTY; SUB_POOL_COUNT];
        self.len = 0;
    }

    /// Registers an activated sub-pool's base pointer, keeping the table
    /// sorted by address. The new entry bubbles left from the end.
    pub(crate) fn insert(&mut self, base: *mut u8, sub_pool: usize) {
        debug_assert!(!base.is_null());
        debug_assert!(self.len < SUB_POOL_COUNT);

        self.entries[self.len] = SortedBase { base, sub_pool };

        let mut position = self.len;
        while position > 0 && self.entries[position - 1].base > self.entries[position].base {
            self.entries.swap(position - 1, position);
            position -= 1;
        }

        self.len += 1;
    }

    /// Removes the entry for the given base pointer, shifting later entries
    /// left over it.
    pub(crate) fn remove(&mut self, base: *mut u8) {
        let mut position = self.position_of(base);
        debug_assert!(ptr::eq(self.entries[position].base, base));

        while position + 1 < self.len {
            self.entries.swap(position, position + 1);
            position += 1;
        }

        self.entries[position] = SortedBase::EMPTY;
        self.len -= 1;
    }

    /// Returns the position of the last entry whose base pointer is at or
    /// below `ptr`.
    ///
    /// The caller is responsible for verifying that `ptr` actually falls
    /// within the returned sub-pool's buffer; a pointer below every base (or
    /// outside the pool entirely) still resolves to some position.
    pub(crate) fn position_of(&self, ptr: *const u8) -> usize {
        debug_assert!(self.len > 0);

        let mut span = round_up_pow2(self.len);
        let mut position = 0;

        while span > 1 {
            let half = span / 2;
            let probe = self.entries[position + half];

            // Null bases are vacant tail entries and sort after every real
            // address.
            if !probe.base.is_null() && probe.base.cast_const() <= ptr {
                position += half;
            }

            span = half;
        }

        position
    }

    /// Returns the sub-pool whose buffer most plausibly contains `ptr`; see
    /// [`position_of`](Self::position_of) for the verification obligation.
    pub(crate) fn sub_pool_of(&self, ptr: *const u8) -> usize {
        self.entries[self.position_of(ptr)].sub_pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake(address: usize) -> *mut u8 {
        address as *mut u8
    }

    #[test]
    fn insert_keeps_entries_sorted() {
        let mut index = SortedIndex::new();

        index.insert(fake(0x3000), 2);
        index.insert(fake(0x1000), 0);
        index.insert(fake(0x2000), 1);

        assert_eq!(index.len(), 3);
        assert_eq!(index.sub_pool_of(fake(0x1000)), 0);
        assert_eq!(index.sub_pool_of(fake(0x2000)), 1);
        assert_eq!(index.sub_pool_of(fake(0x3000)), 2);
    }

    #[test]
    fn lookup_resolves_interior_pointers() {
        let mut index = SortedIndex::new();

        index.insert(fake(0x1000), 5);
        index.insert(fake(0x8000), 7);

        // Anything between the two bases belongs to the lower one.
        assert_eq!(index.sub_pool_of(fake(0x1008)), 5);
        assert_eq!(index.sub_pool_of(fake(0x7fff)), 5);
        assert_eq!(index.sub_pool_of(fake(0x8010)), 7);
    }

    #[test]
    fn lookup_works_at_every_size() {
        // The descent rounds the length up to a power of two; exercise the
        // full range of table sizes.
        let mut index = SortedIndex::new();

        for sub_pool in 0..SUB_POOL_COUNT {
            index.insert(fake(0x1000 * (sub_pool + 1)), sub_pool);

            for probe in 0..=sub_pool {
                assert_eq!(index.sub_pool_of(fake(0x1000 * (probe + 1))), probe);
                assert_eq!(index.sub_pool_of(fake(0x1000 * (probe + 1) + 0xfff)), probe);
            }
        }
    }

    #[test]
    fn remove_shifts_later_entries() {
        let mut index = SortedIndex::new();

        index.insert(fake(0x1000), 0);
        index.insert(fake(0x2000), 1);
        index.insert(fake(0x3000), 2);

        index.remove(fake(0x2000));

        assert_eq!(index.len(), 2);
        assert_eq!(index.sub_pool_of(fake(0x1000)), 0);
        assert_eq!(index.sub_pool_of(fake(0x3000)), 2);
        // The gap left behind now resolves to the entry below it.
        assert_eq!(index.sub_pool_of(fake(0x2000)), 0);
    }

    #[test]
    fn clear_empties_the_table() {
        let mut index = SortedIndex::new();

        index.insert(fake(0x1000), 0);
        index.insert(fake(0x2000), 1);
        index.clear();

        assert_eq!(index.len(), 0);
    }
}
