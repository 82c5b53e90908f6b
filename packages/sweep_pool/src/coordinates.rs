//! The geometric sub-pool coordinate system.
//!
//! Sub-pool `i` holds `capacity(i)` slots, where sub-pools 0 and 1 both hold
//! two slots and every later sub-pool doubles the previous one. The k-th slot
//! of sub-pool `i` is identified globally by the dense id `base_id(i) + k`,
//! which makes ids contiguous across the whole pool and lets the owning
//! sub-pool be recovered from an id with a single `floor_log2`.

use std::num::NonZero;

use new_zealand::nz;

use crate::bits::floor_log2;

/// Number of sub-pools a pool can hold: one per bit of a machine word, so the
/// vacancy and occupancy bookkeeping each fit in a single word.
pub(crate) const SUB_POOL_COUNT: usize = usize::BITS as usize;

/// Sub-pool 0 holds two slots rather than `2^0`, so that the id ranges of all
/// sub-pools tile `0..usize::MAX` without a gap.
const BASE_SUB_POOL_CAPACITY: NonZero<usize> = nz!(2);

/// The number of slots in the given sub-pool.
#[inline]
#[must_use]
pub(crate) fn sub_pool_capacity(sub_pool: usize) -> NonZero<usize> {
    debug_assert!(sub_pool < SUB_POOL_COUNT);

    if sub_pool == 0 {
        BASE_SUB_POOL_CAPACITY
    } else {
        NonZero::new(1_usize << sub_pool).expect("a single shifted bit is never zero")
    }
}

/// The dense id of the first slot of the given sub-pool.
#[inline]
#[must_use]
pub(crate) fn base_id(sub_pool: usize) -> usize {
    debug_assert!(sub_pool < SUB_POOL_COUNT);

    if sub_pool == 0 { 0 } else { 1_usize << sub_pool }
}

/// The sub-pool whose id range contains the given dense id.
#[inline]
#[must_use]
pub(crate) fn sub_pool_of_id(id: usize) -> usize {
    floor_log2(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacities_double_from_sub_pool_one() {
        assert_eq!(sub_pool_capacity(0).get(), 2);
        assert_eq!(sub_pool_capacity(1).get(), 2);
        assert_eq!(sub_pool_capacity(2).get(), 4);
        assert_eq!(sub_pool_capacity(3).get(), 8);
        assert_eq!(sub_pool_capacity(10).get(), 1024);
    }

    #[test]
    fn id_ranges_tile_without_gaps() {
        assert_eq!(base_id(0), 0);
        assert_eq!(base_id(1), 2);
        assert_eq!(base_id(2), 4);
        assert_eq!(base_id(3), 8);

        // Every sub-pool's id range ends exactly where the next one begins.
        for sub_pool in 0..SUB_POOL_COUNT - 1 {
            assert_eq!(
                base_id(sub_pool) + sub_pool_capacity(sub_pool).get(),
                base_id(sub_pool + 1)
            );
        }
    }

    #[test]
    fn ids_map_back_to_their_sub_pool() {
        assert_eq!(sub_pool_of_id(0), 0);
        assert_eq!(sub_pool_of_id(1), 0);
        assert_eq!(sub_pool_of_id(2), 1);
        assert_eq!(sub_pool_of_id(3), 1);
        assert_eq!(sub_pool_of_id(4), 2);
        assert_eq!(sub_pool_of_id(7), 2);
        assert_eq!(sub_pool_of_id(8), 3);

        for sub_pool in 0..16 {
            let first = base_id(sub_pool);
            let last = first + sub_pool_capacity(sub_pool).get() - 1;
            assert_eq!(sub_pool_of_id(first), sub_pool);
            assert_eq!(sub_pool_of_id(last), sub_pool);
        }
    }
}
