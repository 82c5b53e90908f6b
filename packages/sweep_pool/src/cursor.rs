use std::ptr::NonNull;

use crate::SweepPool;
use crate::coordinates::{SUB_POOL_COUNT, sub_pool_capacity};
use crate::sub_pool::{HeadNode, SubPoolTable};

/// A detached traversal cursor over a pool's live slots.
///
/// The cursor yields every live slot exactly once, in ascending slot order
/// within each sub-pool and ascending sub-pool order overall, and crosses a
/// free run of any length in a single jump: the run's head node records the
/// distance to its tail.
///
/// Unlike [`iter()`](SweepPool::iter), a cursor does not borrow the pool.
/// That allows allocating and deallocating mid-traversal, under a strict
/// protocol: after **every** mutation, the matching repair
/// ([`fixed_after_allocate`](Self::fixed_after_allocate) or
/// [`fixed_after_deallocate`](Self::fixed_after_deallocate)) must be applied
/// before the cursor is advanced again. The repairs are constant-time; they
/// re-derive the set of sub-pools still to visit and step the cursor over a
/// free run that may have just swallowed the slot it was parked on.
///
/// # Examples
///
/// ```
/// use sweep_pool::SweepPool;
///
/// let mut pool = SweepPool::builder().layout_of::<[u64; 4]>().build();
/// for _ in 0..10 {
///     let _ = pool.allocate().expect("out of memory");
/// }
///
/// // Deallocate every slot while sweeping over it.
/// let mut cursor = pool.cursor();
/// // SAFETY: the cursor is repaired after every mutation below.
/// while let Some(slot) = unsafe { cursor.next(&pool) } {
///     // SAFETY: the slot was just yielded, so it is live.
///     unsafe { pool.deallocate(slot.as_ptr()) };
///     cursor = cursor.fixed_after_deallocate(&pool, slot.as_ptr());
/// }
///
/// assert!(pool.is_empty());
/// ```
#[derive(Clone, Copy, Debug)]
pub struct SweepCursor {
    /// Sub-pool currently under the cursor.
    sub_pool: usize,
    /// Next slot to examine within that sub-pool. Starts past every capacity
    /// so the first advance selects the first non-empty sub-pool.
    slot_in_sub_pool: usize,
    /// Non-empty sub-pools not yet entered.
    remaining_mask: usize,
}

impl SweepCursor {
    pub(crate) fn new(pool: &SweepPool) -> Self {
        Self {
            sub_pool: 0,
            slot_in_sub_pool: usize::MAX,
            remaining_mask: pool.nonempty_bits(),
        }
    }

    /// Yields the next live slot, or `None` when the traversal is complete.
    ///
    /// # Safety
    ///
    /// The pool must not have been mutated since this cursor was created or
    /// last repaired: every intervening [`allocate()`](SweepPool::allocate) /
    /// deallocation must have been answered by the matching `fixed_after_*`
    /// repair, and `deallocate_all()` invalidates cursors outright. A stale
    /// cursor may read released buffers.
    pub unsafe fn next(&mut self, pool: &SweepPool) -> Option<NonNull<u8>> {
        let slot_size = pool.slot_size();
        let Some(table) = pool.table_ptr() else {
            debug_assert_eq!(self.remaining_mask, 0);
            return None;
        };

        loop {
            if self.slot_in_sub_pool >= sub_pool_capacity(self.sub_pool).get() {
                if self.remaining_mask == 0 {
                    return None;
                }

                self.sub_pool = self.remaining_mask.trailing_zeros() as usize;
                self.remaining_mask &= !(1 << self.sub_pool);
                self.slot_in_sub_pool = 0;
            }

            // SAFETY: sub-pools selected from the mask are non-empty and
            // therefore activated; every slot index examined is bounded by
            // the capacity check above and the run-length invariant.
            unsafe {
                let data = (*table.as_ptr()).sub_pools[self.sub_pool].data;
                debug_assert!(!data.is_null());

                if SubPoolTable::is_slot_free(table, self.sub_pool, self.slot_in_sub_pool) {
                    let capacity = sub_pool_capacity(self.sub_pool).get();

                    if self.slot_in_sub_pool + 1 == capacity {
                        // A free run ending the buffer; nothing live follows.
                        self.slot_in_sub_pool += 1;
                        continue;
                    }

                    if SubPoolTable::is_slot_free(table, self.sub_pool, self.slot_in_sub_pool + 1) {
                        // A run of length >= 2 starts here; its head node
                        // records the distance to the tail. One jump crosses
                        // the whole run.
                        let head = data.add(self.slot_in_sub_pool * slot_size).cast::<HeadNode>();
                        let bytes_to_tail = (*head).bytes_to_tail;
                        debug_assert_eq!(bytes_to_tail % slot_size, 0);

                        self.slot_in_sub_pool += bytes_to_tail / slot_size + 1;

                        if self.slot_in_sub_pool == capacity {
                            continue;
                        }
                        debug_assert!(self.slot_in_sub_pool < capacity);
                    } else {
                        // A singleton free run.
                        self.slot_in_sub_pool += 1;
                    }
                }

                let result = data.add(self.slot_in_sub_pool * slot_size);
                self.slot_in_sub_pool += 1;
                return Some(NonNull::new_unchecked(result));
            }
        }
    }

    /// Returns this cursor repaired for one just-completed
    /// [`allocate()`](SweepPool::allocate).
    ///
    /// After the repair, the cursor will visit exactly the live slots at or
    /// after its current position: the rest of the sub-pool it is scanning,
    /// and every now-non-empty sub-pool above it. The new slot is therefore
    /// visited iff it lies in that range.
    ///
    /// Must be called exactly once, immediately after the allocation.
    #[must_use]
    pub fn fixed_after_allocate(&self, pool: &SweepPool) -> Self {
        Self {
            remaining_mask: self.repaired_remaining(pool),
            ..*self
        }
    }

    /// Returns this cursor repaired for one just-completed deallocation of
    /// `freed`.
    ///
    /// Beyond re-deriving the sub-pools still to visit, this steps the cursor
    /// over the freed slot when the cursor was parked on it (or when the slot
    /// under the cursor was free and just merged leftwards into `freed`),
    /// including the whole free run the slot merged into, read from the run
    /// metadata the merge left behind.
    ///
    /// Must be called exactly once, immediately after the deallocation, with
    /// the pointer that was deallocated.
    #[must_use]
    pub fn fixed_after_deallocate(&self, pool: &SweepPool, freed: *const u8) -> Self {
        let mut fixed = *self;
        fixed.remaining_mask = self.repaired_remaining(pool);

        let Some(table) = pool.table_ptr() else {
            return fixed;
        };
        let slot_size = pool.slot_size();

        // SAFETY: the cursor's sub-pool index is in bounds; node records are
        // read only from slots whose free bits are set, inside an activated
        // sub-pool's buffer.
        unsafe {
            if (*table.as_ptr()).sub_pools[self.sub_pool].data.is_null() {
                // The deallocation emptied the cursor's sub-pool and the
                // deferred-release policy dropped its buffers; skip what is
                // left of it.
                fixed.slot_in_sub_pool = sub_pool_capacity(self.sub_pool).get();
                return fixed;
            }

            if !SubPoolTable::contains(table, self.sub_pool, freed, slot_size) {
                return fixed;
            }

            let freed_slot = SubPoolTable::slot_index_of(table, self.sub_pool, freed, slot_size);
            debug_assert!(SubPoolTable::is_slot_free(table, self.sub_pool, freed_slot));

            if freed_slot == self.slot_in_sub_pool {
                let left_free = SubPoolTable::is_left_free(table, self.sub_pool, freed, slot_size);
                let right_free = SubPoolTable::is_right_free(table, self.sub_pool, freed, slot_size);

                if left_free && right_free {
                    // The freed slot bridged two runs. The right run's old
                    // head - one slot past the cursor - was not rewritten by
                    // the merge, so its bytes_to_tail still measures the
                    // remainder of the merged run.
                    let right = freed.cast_mut().add(slot_size);
                    if SubPoolTable::is_right_free(table, self.sub_pool, right, slot_size) {
                        let bytes_to_tail = (*right.cast::<HeadNode>()).bytes_to_tail;
                        debug_assert_eq!(bytes_to_tail % slot_size, 0);
                        fixed.slot_in_sub_pool += bytes_to_tail / slot_size + 2;
                    } else {
                        fixed.slot_in_sub_pool += 2;
                    }
                    return fixed;
                }

                if right_free {
                    // The freed slot is now the head of the run to its
                    // right; the ordinary traversal jumps it correctly.
                    return fixed;
                }

                // Left merge or isolated singleton: step over the freed slot.
                fixed.slot_in_sub_pool += 1;
                return fixed;
            }

            if freed_slot + 1 == self.slot_in_sub_pool
                && SubPoolTable::is_right_free(table, self.sub_pool, freed, slot_size)
            {
                // The slot under the cursor was free already and the freed
                // slot extended its run leftwards. The cursor slot's old
                // head record is still intact and measures the rest of the
                // run.
                let right = freed.cast_mut().add(slot_size);
                if SubPoolTable::is_right_free(table, self.sub_pool, right, slot_size) {
                    let bytes_to_tail = (*right.cast::<HeadNode>()).bytes_to_tail;
                    debug_assert_eq!(bytes_to_tail % slot_size, 0);
                    fixed.slot_in_sub_pool += bytes_to_tail / slot_size + 1;
                } else {
                    fixed.slot_in_sub_pool += 1;
                }
            }

            fixed
        }
    }

    /// Re-derives the set of sub-pools the cursor still has to enter, from
    /// the pool's current occupancy.
    fn repaired_remaining(&self, pool: &SweepPool) -> usize {
        // A cursor that has not entered any sub-pool yet restarts as a
        // freshly constructed one.
        if self.slot_in_sub_pool == usize::MAX {
            return pool.nonempty_bits();
        }

        debug_assert!(self.sub_pool < SUB_POOL_COUNT);

        // Sub-pools strictly above the one under the cursor become visible
        // iff they are non-empty now; pending ones that emptied drop out.
        // The scanned sub-pool itself must not be re-entered.
        let above = usize::MAX
            .checked_shl(self.sub_pool as u32 + 1)
            .unwrap_or(0);

        (pool.nonempty_bits() & above) | (self.remaining_mask & pool.nonempty_bits())
    }
}

/// Borrowing iterator over a pool's live slots; see
/// [`iter()`](SweepPool::iter).
///
/// The shared borrow freezes the pool for the iterator's lifetime, which is
/// what makes this a safe wrapper over [`SweepCursor`].
#[derive(Debug)]
pub struct Iter<'p> {
    pool: &'p SweepPool,
    cursor: SweepCursor,
}

impl<'p> Iter<'p> {
    pub(crate) fn new(pool: &'p SweepPool) -> Self {
        Self {
            pool,
            cursor: SweepCursor::new(pool),
        }
    }
}

impl Iterator for Iter<'_> {
    type Item = NonNull<u8>;

    fn next(&mut self) -> Option<NonNull<u8>> {
        // SAFETY: the shared borrow held by self prevents any mutation of
        // the pool, so the cursor can never observe unrepaired state.
        unsafe { self.cursor.next(self.pool) }
    }
}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    clippy::indexing_slicing,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use super::*;
    use crate::coordinates::base_id;

    type Payload = [u64; 4];

    fn new_pool() -> SweepPool {
        SweepPool::builder().layout_of::<Payload>().build()
    }

    fn fill(pool: &mut SweepPool, count: usize) -> Vec<crate::Allocation> {
        (0..count).map(|_| pool.allocate().unwrap()).collect()
    }

    #[test]
    fn empty_pool_sweeps_nothing() {
        let pool = new_pool();
        assert_eq!(pool.iter().count(), 0);

        let mut drained = new_pool();
        let allocation = drained.allocate().unwrap();
        unsafe { drained.deallocate(allocation.ptr().as_ptr()) };
        assert_eq!(drained.iter().count(), 0);
    }

    #[test]
    fn sweep_yields_every_live_slot_in_order() {
        let mut pool = new_pool();
        let allocations = fill(&mut pool, 16);

        let swept: Vec<_> = pool.iter().collect();
        assert_eq!(swept.len(), 16);

        // Exhaustive: the multiset of yielded pointers is the live set.
        for allocation in &allocations {
            assert_eq!(swept.iter().filter(|p| **p == allocation.ptr()).count(), 1);
        }

        // Ordered: ids are strictly increasing, which covers both the
        // within-sub-pool ordering and the sub-pool ordering.
        let ids: Vec<_> = swept
            .iter()
            .map(|p| pool.ptr_to_id(*p, pool.find_sub_pool_of(*p)))
            .collect();
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));

        pool.deallocate_all();
    }

    #[test]
    fn sweep_jumps_over_free_runs() {
        let mut pool = new_pool();
        let allocations = fill(&mut pool, 16);

        // Punch a four-slot hole into sub-pool 3 and free its last slot, so
        // the sweep exercises both the mid-buffer jump and the trailing-run
        // early exit.
        for index in [9, 10, 11, 12, 15] {
            unsafe { pool.deallocate(allocations[index].ptr().as_ptr()) };
        }
        pool.integrity_check();

        let swept: Vec<_> = pool.iter().collect();
        assert_eq!(swept.len(), 11);
        for (index, allocation) in allocations.iter().enumerate() {
            let expected_live = ![9, 10, 11, 12, 15].contains(&index);
            assert_eq!(swept.contains(&allocation.ptr()), expected_live);
        }

        pool.deallocate_all();
    }

    #[test]
    fn sweep_and_deallocate_each_visited_slot() {
        let mut pool = new_pool();
        fill(&mut pool, 50);

        let mut visits = 0;
        let mut cursor = pool.cursor();
        while let Some(slot) = unsafe { cursor.next(&pool) } {
            visits += 1;
            unsafe { pool.deallocate(slot.as_ptr()) };
            cursor = cursor.fixed_after_deallocate(&pool, slot.as_ptr());
        }

        assert_eq!(visits, 50);
        assert!(pool.is_empty());
        pool.integrity_check();
    }

    #[test]
    fn repair_does_not_revisit_the_scanned_sub_pool() {
        let mut pool = new_pool();
        let allocations = fill(&mut pool, 8);

        // Visit one slot, then deallocate a slot of a later sub-pool. The
        // repair must neither hide the later sub-pools nor re-enter the one
        // being scanned: exactly the 7 live slots get visited.
        let mut cursor = pool.cursor();
        let first = unsafe { cursor.next(&pool) }.unwrap();
        assert_eq!(first, allocations[0].ptr());

        unsafe { pool.deallocate(allocations[7].ptr().as_ptr()) };
        cursor = cursor.fixed_after_deallocate(&pool, allocations[7].ptr().as_ptr());

        let mut visits = 1;
        while unsafe { cursor.next(&pool) }.is_some() {
            visits += 1;
        }
        assert_eq!(visits, 7);

        pool.deallocate_all();
    }

    #[test]
    fn repair_after_allocate_reveals_new_sub_pools() {
        let mut pool = new_pool();
        let allocations = fill(&mut pool, 2);

        let mut cursor = pool.cursor();
        let first = unsafe { cursor.next(&pool) }.unwrap();
        assert_eq!(first, allocations[0].ptr());

        // Sub-pool 0 is full, so these activate sub-pool 1 - beyond the
        // cursor, hence both must be visited after the repairs.
        let third = pool.allocate().unwrap();
        cursor = cursor.fixed_after_allocate(&pool);
        let fourth = pool.allocate().unwrap();
        cursor = cursor.fixed_after_allocate(&pool);
        assert_eq!(third.sub_pool(), 1);
        assert_eq!(fourth.sub_pool(), 1);

        let rest: Vec<_> = std::iter::from_fn(|| unsafe { cursor.next(&pool) }).collect();
        assert_eq!(rest, vec![allocations[1].ptr(), third.ptr(), fourth.ptr()]);

        pool.deallocate_all();
    }

    #[test]
    fn repair_hides_sub_pools_that_emptied() {
        let mut pool = new_pool();
        let allocations = fill(&mut pool, 3);
        assert_eq!(allocations[2].sub_pool(), 1);

        let mut cursor = pool.cursor();
        let first = unsafe { cursor.next(&pool) }.unwrap();
        assert_eq!(first, allocations[0].ptr());

        // Sub-pool 1 empties while the cursor is still in sub-pool 0; the
        // repair must drop it from the pending set.
        unsafe { pool.deallocate(allocations[2].ptr().as_ptr()) };
        cursor = cursor.fixed_after_deallocate(&pool, allocations[2].ptr().as_ptr());

        let rest: Vec<_> = std::iter::from_fn(|| unsafe { cursor.next(&pool) }).collect();
        assert_eq!(rest, vec![allocations[1].ptr()]);

        pool.deallocate_all();
    }

    #[test]
    fn repair_skips_a_released_current_sub_pool() {
        let mut pool = new_pool();
        let allocations = fill(&mut pool, 4);

        // Empty sub-pool 0 first so it becomes the retained buffer.
        unsafe {
            pool.deallocate(allocations[0].ptr().as_ptr());
            pool.deallocate(allocations[1].ptr().as_ptr());
        }

        // The cursor enters sub-pool 1 and visits its first slot.
        let mut cursor = pool.cursor();
        let first = unsafe { cursor.next(&pool) }.unwrap();
        assert_eq!(first, allocations[2].ptr());

        // Emptying sub-pool 1 releases it outright (sub-pool 0 already holds
        // the retention). The repair parks the cursor past the vanished
        // buffer instead of letting it read freed memory.
        unsafe { pool.deallocate(allocations[3].ptr().as_ptr()) };
        cursor = cursor.fixed_after_deallocate(&pool, allocations[3].ptr().as_ptr());

        assert_eq!(unsafe { cursor.next(&pool) }, None);
        assert!(pool.is_empty());
        pool.integrity_check();
    }

    #[test]
    fn repair_steps_over_a_deallocation_at_the_cursor() {
        let mut pool = new_pool();
        let allocations = fill(&mut pool, 16);
        let sub_pool_3_first_id = base_id(3);

        // Advance the cursor to sub-pool 3, slot 1.
        let mut cursor = pool.cursor();
        for _ in 0..9 {
            let _ = unsafe { cursor.next(&pool) }.unwrap();
        }

        // Deallocate the slot the cursor is parked on (isolated: both
        // neighbours live).
        let parked = &allocations[sub_pool_3_first_id + 1];
        unsafe { pool.deallocate(parked.ptr().as_ptr()) };
        cursor = cursor.fixed_after_deallocate(&pool, parked.ptr().as_ptr());

        let rest = std::iter::from_fn(|| unsafe { cursor.next(&pool) }).count();
        assert_eq!(rest, 6);
        assert_eq!(pool.len(), 15);

        pool.deallocate_all();
    }

    #[test]
    fn repair_steps_over_a_growing_free_run_at_the_cursor() {
        let mut pool = new_pool();
        let allocations = fill(&mut pool, 16);
        let s3 = base_id(3);

        // Advance to sub-pool 3 and yield slots 0, 1 and 2; the cursor is
        // parked on slot 3.
        let mut cursor = pool.cursor();
        for _ in 0..11 {
            let _ = unsafe { cursor.next(&pool) }.unwrap();
        }

        // Free slot 2 (just visited, left of the cursor), then slots 4 and 5
        // (right of the cursor), then slot 3 itself: the last deallocation
        // bridges everything into one run [2..=5] around the cursor.
        for offset in [2, 4, 5, 3] {
            let victim = &allocations[s3 + offset];
            unsafe { pool.deallocate(victim.ptr().as_ptr()) };
            cursor = cursor.fixed_after_deallocate(&pool, victim.ptr().as_ptr());
        }
        pool.integrity_check();

        // The cursor must resume at slot 6.
        let rest: Vec<_> = std::iter::from_fn(|| unsafe { cursor.next(&pool) }).collect();
        assert_eq!(
            rest,
            vec![allocations[s3 + 6].ptr(), allocations[s3 + 7].ptr()]
        );

        pool.deallocate_all();
    }

    #[test]
    fn repair_steps_over_a_left_merge_behind_the_cursor() {
        let mut pool = new_pool();
        let allocations = fill(&mut pool, 16);
        let s3 = base_id(3);

        // Yield sub-pool 3 slots 0 and 1; the cursor is parked on slot 2.
        let mut cursor = pool.cursor();
        for _ in 0..10 {
            let _ = unsafe { cursor.next(&pool) }.unwrap();
        }

        // Free slot 3 (ahead of the cursor: no adjustment), then the cursor
        // slot 2 (it becomes the head of run [2..=3]: the cursor stays put,
        // the ordinary jump would cross it), then the just-visited slot 1:
        // the run grows leftwards to [1..=3] behind the cursor, and the
        // repair must carry the cursor over the remainder of the run.
        for offset in [3, 2, 1] {
            let victim = &allocations[s3 + offset];
            unsafe { pool.deallocate(victim.ptr().as_ptr()) };
            cursor = cursor.fixed_after_deallocate(&pool, victim.ptr().as_ptr());
        }
        pool.integrity_check();

        // The cursor must resume at slot 4.
        let rest: Vec<_> = std::iter::from_fn(|| unsafe { cursor.next(&pool) }).collect();
        let expected: Vec<_> = (4..8).map(|offset| allocations[s3 + offset].ptr()).collect();
        assert_eq!(rest, expected);

        pool.deallocate_all();
    }
}
