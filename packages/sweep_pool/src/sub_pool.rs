//! Per-sub-pool storage: the slot buffer, the free-bit bitmap, and the
//! skip-list of free runs embedded in the free slots themselves.
//!
//! A *free run* is a maximal range of contiguous free slots. While a slot is
//! free its payload bytes are repurposed for bookkeeping: the first slot of a
//! run carries a [`HeadNode`], the last slot carries a [`TailNode`], and a
//! singleton run carries just a tail. Which layout a free slot holds is never
//! stored anywhere - it is implied by its right neighbour's free bit, which is
//! why the bitmap and the node records must always move together.
//!
//! The runs of one sub-pool form a doubly linked list in most-recently-created
//! order. The list is threaded through `tail.next_head` pointers in one
//! direction and `prev_tail` pointers in the other; a sentinel [`TailNode`]
//! embedded in the [`SubPool`] record terminates the list on the "previous"
//! side, so popping and splicing never branch on "am I the first run".
//!
//! # Why raw pointers instead of references
//!
//! Head nodes store the address of the owning sub-pool's sentinel. Creating a
//! `&mut SubPool` would therefore assert exclusive access to memory that the
//! slot buffers alias, so everything here works through raw place projections
//! from the table pointer and never materializes a reference to a sub-pool
//! record.

use std::alloc::{Layout, alloc, dealloc};
use std::ptr::{self, NonNull};

use crate::coordinates::{SUB_POOL_COUNT, sub_pool_capacity};
use crate::sorted_index::SortedIndex;

/// Bits per free-bitmap word.
const WORD_BITS: usize = usize::BITS as usize;

/// Boundary record written into the last slot of a free run (and into the
/// only slot of a singleton run).
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub(crate) struct TailNode {
    /// Tail of the previous run in the owning sub-pool's list, or the
    /// sub-pool's sentinel when this run is first.
    pub(crate) prev_tail: *mut TailNode,
    /// First slot of the next run in the list, or null at the end.
    pub(crate) next_head: *mut u8,
}

/// Boundary record written into the first slot of a free run of length >= 2.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub(crate) struct HeadNode {
    /// Tail of the previous run in the owning sub-pool's list, or the
    /// sub-pool's sentinel when this run is first.
    pub(crate) prev_tail: *mut TailNode,
    /// Byte distance from this slot to the run's tail slot: exactly
    /// `(run_length - 1) * slot_size`.
    pub(crate) bytes_to_tail: usize,
}

// Both layouts must fit any slot interchangeably, and `prev_tail` must sit at
// a common offset so a run's first slot can be re-linked without knowing
// which layout it holds.
const _: () = assert!(size_of::<HeadNode>() == size_of::<TailNode>());
const _: () = assert!(align_of::<HeadNode>() == align_of::<TailNode>());

/// One geometrically sized sub-pool. `data` is null until the sub-pool is
/// activated by its first allocation.
#[derive(Debug)]
pub(crate) struct SubPool {
    /// Virtual tail of the free-run list; `sentinel.next_head` is the first
    /// free run. Head nodes point back at this field, which is why the table
    /// holding it must never move.
    pub(crate) sentinel: TailNode,
    pub(crate) data: *mut u8,
    pub(crate) free_bits: *mut usize,
    /// Live (allocated) slots in this sub-pool.
    pub(crate) live: usize,
}

impl SubPool {
    const EMPTY: Self = Self {
        sentinel: TailNode {
            prev_tail: ptr::null_mut(),
            next_head: ptr::null_mut(),
        },
        data: ptr::null_mut(),
        free_bits: ptr::null_mut(),
        live: 0,
    };
}

/// The lazily allocated block holding every sub-pool record and the sorted
/// base-pointer index. Allocated once, at a stable address, on the first
/// allocation from the pool.
#[derive(Debug)]
pub(crate) struct SubPoolTable {
    pub(crate) sub_pools: [SubPool; SUB_POOL_COUNT],
    pub(crate) sorted: SortedIndex,
}

/// Result of [`SubPoolTable::pop_first_free`].
#[derive(Debug)]
pub(crate) struct PoppedSlot {
    pub(crate) ptr: NonNull<u8>,
    /// The pop consumed the last free slot; the sub-pool is now full.
    pub(crate) free_list_emptied: bool,
}

/// Layout of a sub-pool's slot buffer, or `None` when the buffer would not
/// fit the address space (the largest sub-pools are nominal only).
pub(crate) fn data_buffer_layout(sub_pool: usize, slot_layout: Layout) -> Option<Layout> {
    let size = sub_pool_capacity(sub_pool)
        .get()
        .checked_mul(slot_layout.size())?;
    Layout::from_size_align(size, slot_layout.align()).ok()
}

/// Layout of a sub-pool's free-bit bitmap: one bit per slot, whole words.
pub(crate) fn free_bits_layout(sub_pool: usize) -> Layout {
    let words = sub_pool_capacity(sub_pool).get().div_ceil(WORD_BITS);
    Layout::array::<usize>(words).expect("bitmap is always far smaller than the slot buffer")
}

impl SubPoolTable {
    pub(crate) fn new() -> Self {
        Self {
            sub_pools: [SubPool::EMPTY; SUB_POOL_COUNT],
            sorted: SortedIndex::new(),
        }
    }

    /// Raw place projection to one sub-pool record.
    ///
    /// # Safety
    ///
    /// `table` must point to a live table and `sub_pool` must be in bounds.
    unsafe fn sub_pool_ptr(table: NonNull<Self>, sub_pool: usize) -> *mut SubPool {
        debug_assert!(sub_pool < SUB_POOL_COUNT);

        // SAFETY: projection through a raw place expression; no reference to
        // the (aliased) record is created.
        unsafe { &raw mut (*table.as_ptr()).sub_pools[sub_pool] }
    }

    /// Acquires the slot buffer and bitmap for a sub-pool, marks every slot
    /// free, installs the single all-covering free run, and registers the
    /// base pointer in the sorted index. Returns false (with nothing
    /// retained) if either buffer cannot be acquired.
    ///
    /// # Safety
    ///
    /// `table` must point to a live table; the sub-pool must not already be
    /// activated.
    pub(crate) unsafe fn activate(table: NonNull<Self>, sub_pool: usize, slot_layout: Layout) -> bool {
        // SAFETY: table is live per caller contract.
        let sp = unsafe { Self::sub_pool_ptr(table, sub_pool) };

        // SAFETY: sp is a valid projection.
        unsafe {
            debug_assert!((*sp).data.is_null());
        }

        let Some(data_layout) = data_buffer_layout(sub_pool, slot_layout) else {
            return false;
        };
        let bits_layout = free_bits_layout(sub_pool);

        // SAFETY: both layouts have non-zero size.
        let data = unsafe { alloc(data_layout) };
        if data.is_null() {
            return false;
        }

        // SAFETY: non-zero-sized layout.
        let bits = unsafe { alloc(bits_layout) }.cast::<usize>();
        if bits.is_null() {
            // Activation is atomic: never retain half of a sub-pool.
            // SAFETY: data was just allocated with data_layout.
            unsafe { dealloc(data, data_layout) };
            return false;
        }

        // SAFETY: bits spans exactly this many words; every slot starts free.
        unsafe {
            ptr::write_bytes(bits, 0xff, bits_layout.size() / size_of::<usize>());
        }

        // SAFETY: sp is a valid projection; plain field writes.
        unsafe {
            (*sp).data = data;
            (*sp).free_bits = bits;
            (*sp).live = 0;
        }

        // SAFETY: buffers are installed, per this function's own work above.
        unsafe {
            Self::reset_free_list(table, sub_pool, slot_layout.size());
        }

        // SAFETY: creating a reference to the sorted index is fine; nothing
        // in the slot buffers aliases it.
        unsafe {
            (*table.as_ptr()).sorted.insert(data, sub_pool);
        }

        true
    }

    /// Releases a sub-pool's buffers and resets its record. Does not touch
    /// the sorted index; callers decide whether to remove one entry or clear
    /// the whole table.
    ///
    /// # Safety
    ///
    /// `table` must point to a live table; the sub-pool must be activated.
    pub(crate) unsafe fn release(table: NonNull<Self>, sub_pool: usize, slot_layout: Layout) {
        // SAFETY: table is live per caller contract.
        let sp = unsafe { Self::sub_pool_ptr(table, sub_pool) };

        let data_layout = data_buffer_layout(sub_pool, slot_layout)
            .expect("an activated sub-pool's layout was already computed once");

        // SAFETY: the buffers were allocated with exactly these layouts in
        // activate() and are released exactly once.
        unsafe {
            debug_assert!(!(*sp).data.is_null());
            dealloc((*sp).data, data_layout);
            dealloc((*sp).free_bits.cast::<u8>(), free_bits_layout(sub_pool));

            (*sp).data = ptr::null_mut();
            (*sp).free_bits = ptr::null_mut();
            (*sp).sentinel.next_head = ptr::null_mut();
            (*sp).live = 0;
        }
    }

    /// Installs the single free run covering the whole (all-free) buffer.
    ///
    /// # Safety
    ///
    /// The sub-pool must be activated and every slot must be marked free.
    pub(crate) unsafe fn reset_free_list(table: NonNull<Self>, sub_pool: usize, slot_size: usize) {
        let capacity = sub_pool_capacity(sub_pool).get();

        // SAFETY: table is live per caller contract.
        let sp = unsafe { Self::sub_pool_ptr(table, sub_pool) };

        // SAFETY: the buffer spans capacity slots; head and tail land on the
        // first and last of them. Slot alignment satisfies the node types.
        unsafe {
            let data = (*sp).data;
            let sentinel = &raw mut (*sp).sentinel;

            let head = data.cast::<HeadNode>();
            (*head).prev_tail = sentinel;
            (*head).bytes_to_tail = (capacity - 1) * slot_size;

            let tail = data.add((capacity - 1) * slot_size).cast::<TailNode>();
            (*tail).prev_tail = sentinel;
            (*tail).next_head = ptr::null_mut();

            (*sp).sentinel.next_head = data;
        }
    }

    /// Reads slot `slot`'s free bit.
    ///
    /// # Safety
    ///
    /// The sub-pool must be activated and `slot` must be within its capacity.
    pub(crate) unsafe fn is_slot_free(table: NonNull<Self>, sub_pool: usize, slot: usize) -> bool {
        debug_assert!(slot < sub_pool_capacity(sub_pool).get());

        // SAFETY: the bitmap holds capacity bits; slot is in bounds.
        unsafe {
            let sp = Self::sub_pool_ptr(table, sub_pool);
            let word = *(*sp).free_bits.add(slot / WORD_BITS);
            (word >> (slot % WORD_BITS)) & 1 == 1
        }
    }

    /// Writes slot `slot`'s free bit.
    ///
    /// # Safety
    ///
    /// Same as [`is_slot_free`](Self::is_slot_free). The caller must keep the
    /// bitmap consistent with the skip-list; the two are redundant views of
    /// the same free set.
    pub(crate) unsafe fn set_slot_free(table: NonNull<Self>, sub_pool: usize, slot: usize, free: bool) {
        debug_assert!(slot < sub_pool_capacity(sub_pool).get());

        // SAFETY: the bitmap holds capacity bits; slot is in bounds.
        unsafe {
            let sp = Self::sub_pool_ptr(table, sub_pool);
            let word = (*sp).free_bits.add(slot / WORD_BITS);
            let bit = 1_usize << (slot % WORD_BITS);
            if free {
                *word |= bit;
            } else {
                *word &= !bit;
            }
        }
    }

    /// Whether `ptr` points into the sub-pool's slot buffer. False when the
    /// sub-pool is not activated.
    ///
    /// # Safety
    ///
    /// `table` must point to a live table.
    pub(crate) unsafe fn contains(
        table: NonNull<Self>,
        sub_pool: usize,
        ptr: *const u8,
        slot_size: usize,
    ) -> bool {
        let capacity = sub_pool_capacity(sub_pool).get();

        // SAFETY: table is live; data/end bound a single allocation.
        unsafe {
            let sp = Self::sub_pool_ptr(table, sub_pool);
            let data = (*sp).data;
            if data.is_null() {
                return false;
            }
            let end = data.add(capacity * slot_size);
            ptr >= data.cast_const() && ptr < end.cast_const()
        }
    }

    /// Slot index of an in-buffer pointer.
    ///
    /// # Safety
    ///
    /// The sub-pool must be activated and `ptr` must point at one of its
    /// slots.
    pub(crate) unsafe fn slot_index_of(
        table: NonNull<Self>,
        sub_pool: usize,
        ptr: *const u8,
        slot_size: usize,
    ) -> usize {
        // SAFETY: table is live and ptr is in the buffer per caller contract.
        let offset = unsafe {
            let sp = Self::sub_pool_ptr(table, sub_pool);
            (ptr as usize) - ((*sp).data as usize)
        };

        debug_assert!(offset % slot_size == 0);
        offset / slot_size
    }

    /// Whether the slot to the right of `ptr` exists and is free. The last
    /// slot of the buffer has no right neighbour.
    ///
    /// # Safety
    ///
    /// The sub-pool must be activated and `ptr` must point at one of its
    /// slots.
    pub(crate) unsafe fn is_right_free(
        table: NonNull<Self>,
        sub_pool: usize,
        ptr: *const u8,
        slot_size: usize,
    ) -> bool {
        // SAFETY: forwarding the caller's contract.
        let slot = unsafe { Self::slot_index_of(table, sub_pool, ptr, slot_size) };

        if slot + 1 == sub_pool_capacity(sub_pool).get() {
            return false;
        }

        // SAFETY: slot + 1 is in bounds per the check above.
        unsafe { Self::is_slot_free(table, sub_pool, slot + 1) }
    }

    /// Whether the slot to the left of `ptr` exists and is free. The first
    /// slot of the buffer has no left neighbour.
    ///
    /// # Safety
    ///
    /// Same as [`is_right_free`](Self::is_right_free).
    pub(crate) unsafe fn is_left_free(
        table: NonNull<Self>,
        sub_pool: usize,
        ptr: *const u8,
        slot_size: usize,
    ) -> bool {
        // SAFETY: forwarding the caller's contract.
        let slot = unsafe { Self::slot_index_of(table, sub_pool, ptr, slot_size) };

        if slot == 0 {
            return false;
        }

        // SAFETY: slot - 1 is in bounds per the check above.
        unsafe { Self::is_slot_free(table, sub_pool, slot - 1) }
    }

    /// Re-points a run's `prev_tail` links (in both of its boundary slots) at
    /// a new predecessor tail. No-op when `run_first` is null.
    ///
    /// # Safety
    ///
    /// `run_first`, when non-null, must be the first slot of a free run in
    /// this sub-pool; `new_prev` must be a valid tail (or the sentinel).
    unsafe fn set_run_prev(
        table: NonNull<Self>,
        sub_pool: usize,
        run_first: *mut u8,
        new_prev: *mut TailNode,
        slot_size: usize,
    ) {
        if run_first.is_null() {
            return;
        }

        // SAFETY: prev_tail sits at offset 0 of both node layouts, so the
        // first slot can be re-linked without knowing which one it holds.
        unsafe {
            (*run_first.cast::<TailNode>()).prev_tail = new_prev;

            if Self::is_right_free(table, sub_pool, run_first, slot_size) {
                // Length >= 2: the head's bytes_to_tail locates the tail,
                // which carries its own prev link.
                let tail = run_first.add((*run_first.cast::<HeadNode>()).bytes_to_tail);
                (*tail.cast::<TailNode>()).prev_tail = new_prev;
            }
        }
    }

    /// First slot of the run whose tail is `tail`, recovered through the
    /// list: the predecessor's `next_head` is exactly this run's first slot.
    ///
    /// # Safety
    ///
    /// `tail` must be the tail node of a linked free run of length >= 2.
    unsafe fn run_head_from_tail(tail: *mut TailNode) -> *mut HeadNode {
        // SAFETY: a linked run's prev_tail is always valid (possibly the
        // sentinel) and its next_head points at this run's first slot.
        unsafe { (*(*tail).prev_tail).next_head.cast::<HeadNode>() }
    }

    /// Detaches the first slot of the first free run and clears its free bit.
    ///
    /// # Safety
    ///
    /// The sub-pool must be activated and must have at least one free slot.
    pub(crate) unsafe fn pop_first_free(
        table: NonNull<Self>,
        sub_pool: usize,
        slot_size: usize,
    ) -> PoppedSlot {
        // SAFETY: table is live per caller contract.
        let sp = unsafe { Self::sub_pool_ptr(table, sub_pool) };

        // SAFETY: a vacant sub-pool always has a first free run.
        let first = unsafe { (*sp).sentinel.next_head };
        debug_assert!(!first.is_null());

        let mut free_list_emptied = false;

        // SAFETY: first is a free slot of this sub-pool; all node reads and
        // writes stay inside the slot buffer or the sentinel.
        unsafe {
            let slot = Self::slot_index_of(table, sub_pool, first, slot_size);
            debug_assert!(Self::is_slot_free(table, sub_pool, slot));

            let sentinel = &raw mut (*sp).sentinel;

            if !Self::is_right_free(table, sub_pool, first, slot_size) {
                // Singleton run: the slot holds a tail node. Unlink the run.
                let tail = first.cast::<TailNode>();
                debug_assert!(ptr::eq((*tail).prev_tail, sentinel));

                let next = (*tail).next_head;
                (*sp).sentinel.next_head = next;
                Self::set_run_prev(table, sub_pool, next, sentinel, slot_size);

                if next.is_null() {
                    free_list_emptied = true;
                }
            } else {
                // Run of length >= 2: the slot holds a head node. Shrink the
                // run from the left.
                let head = first.cast::<HeadNode>();
                debug_assert!(ptr::eq((*head).prev_tail, sentinel));

                let new_first = first.add(slot_size);

                if (*head).bytes_to_tail != slot_size {
                    let new_head = new_first.cast::<HeadNode>();
                    (*new_head).prev_tail = (*head).prev_tail;
                    (*new_head).bytes_to_tail = (*head).bytes_to_tail - slot_size;
                }
                // A length-2 run shrinks to its tail slot, which already
                // carries correct tail metadata; writing a head over it
                // would corrupt the run.

                (*sp).sentinel.next_head = new_first;
            }

            Self::set_slot_free(table, sub_pool, slot, false);

            PoppedSlot {
                ptr: NonNull::new_unchecked(first),
                free_list_emptied,
            }
        }
    }

    /// Returns a slot to the free set, merging it with free neighbours, and
    /// sets its free bit.
    ///
    /// # Safety
    ///
    /// The sub-pool must be activated; `ptr` must point at one of its slots
    /// and that slot must currently be live.
    pub(crate) unsafe fn push_free(
        table: NonNull<Self>,
        sub_pool: usize,
        ptr: *mut u8,
        slot_size: usize,
    ) {
        // SAFETY: table is live per caller contract.
        let sp = unsafe { Self::sub_pool_ptr(table, sub_pool) };

        // SAFETY: ptr is a live slot per caller contract; every branch below
        // touches only this sub-pool's buffer, bitmap, and sentinel.
        unsafe {
            let slot = Self::slot_index_of(table, sub_pool, ptr, slot_size);
            debug_assert!(
                !Self::is_slot_free(table, sub_pool, slot),
                "double free of slot {slot} in sub-pool {sub_pool}"
            );

            let left_free = Self::is_left_free(table, sub_pool, ptr, slot_size);
            let right_free = Self::is_right_free(table, sub_pool, ptr, slot_size);

            if left_free && right_free {
                // Bridge two runs. The left neighbour is the left run's tail
                // and the right neighbour is the right run's first slot.
                let tail_left = ptr.sub(slot_size).cast::<TailNode>();
                let left_is_long = Self::is_left_free(table, sub_pool, ptr.sub(slot_size), slot_size);
                let head_left: *mut HeadNode = if left_is_long {
                    Self::run_head_from_tail(tail_left)
                } else {
                    tail_left.cast::<HeadNode>()
                };

                let right = ptr.add(slot_size);
                let right_base = right.cast::<TailNode>();
                let right_is_long = Self::is_right_free(table, sub_pool, right, slot_size);
                let bytes_right = if right_is_long {
                    (*right.cast::<HeadNode>()).bytes_to_tail
                } else {
                    0
                };

                // Splice the left run out of the list. This may rewrite the
                // right run's prev link when the right run happens to be the
                // left run's list successor, so the right run's prev is read
                // only after this point.
                Self::set_run_prev(
                    table,
                    sub_pool,
                    (*tail_left).next_head,
                    (*tail_left).prev_tail,
                    slot_size,
                );
                (*(*tail_left).prev_tail).next_head = (*tail_left).next_head;

                // The merged run takes over the right run's list position;
                // the right run's tail already points at that predecessor.
                (*tail_left).prev_tail = (*right_base).prev_tail;
                (*(*right_base).prev_tail).next_head = head_left.cast::<u8>();

                if left_is_long {
                    (*head_left).prev_tail = (*right_base).prev_tail;
                    (*head_left).bytes_to_tail += slot_size * 2 + bytes_right;
                } else {
                    // The left singleton's tail node becomes the merged head.
                    (*head_left).bytes_to_tail = slot_size * 2 + bytes_right;
                }
            } else if left_free {
                // Extend the left run rightwards: its tail metadata moves
                // from the old last slot into the freed slot.
                let tail_old = ptr.sub(slot_size).cast::<TailNode>();
                let tail_new = ptr.cast::<TailNode>();
                (*tail_new).prev_tail = (*tail_old).prev_tail;
                (*tail_new).next_head = (*tail_old).next_head;

                if Self::is_left_free(table, sub_pool, ptr.sub(slot_size), slot_size) {
                    let head = Self::run_head_from_tail(tail_old);
                    (*head).bytes_to_tail += slot_size;
                } else {
                    // The old singleton's slot becomes the run's head.
                    let head = tail_old.cast::<HeadNode>();
                    (*head).bytes_to_tail = slot_size;
                }

                Self::set_run_prev(table, sub_pool, (*tail_new).next_head, tail_new, slot_size);
            } else if right_free {
                // The freed slot becomes the new first slot of the right run,
                // which keeps its position in the list.
                let right = ptr.add(slot_size);
                let old_first = right.cast::<TailNode>();

                let head_new = ptr.cast::<HeadNode>();
                (*head_new).prev_tail = (*old_first).prev_tail;
                (*head_new).bytes_to_tail = slot_size;

                if Self::is_right_free(table, sub_pool, right, slot_size) {
                    (*head_new).bytes_to_tail += (*right.cast::<HeadNode>()).bytes_to_tail;
                }

                (*(*head_new).prev_tail).next_head = ptr;
            } else {
                // No free neighbour: a fresh singleton run, linked at the
                // front of the list.
                let tail = ptr.cast::<TailNode>();
                let sentinel = &raw mut (*sp).sentinel;
                (*tail).prev_tail = sentinel;
                (*tail).next_head = (*sp).sentinel.next_head;
                (*sp).sentinel.next_head = ptr;
                Self::set_run_prev(table, sub_pool, (*tail).next_head, tail, slot_size);
            }

            Self::set_slot_free(table, sub_pool, slot, true);
        }
    }

    /// Whether the sub-pool's free set is a single run spanning the whole
    /// buffer - the structural form of "no live slots".
    ///
    /// # Safety
    ///
    /// The sub-pool must be activated.
    pub(crate) unsafe fn is_fully_free(table: NonNull<Self>, sub_pool: usize, slot_size: usize) -> bool {
        let capacity = sub_pool_capacity(sub_pool).get();

        // SAFETY: table is live per caller contract.
        unsafe {
            let sp = Self::sub_pool_ptr(table, sub_pool);
            let first = (*sp).sentinel.next_head;

            if first.is_null() {
                return false;
            }

            Self::is_right_free(table, sub_pool, first, slot_size)
                && (*first.cast::<HeadNode>()).bytes_to_tail == (capacity - 1) * slot_size
        }
    }

    /// Validates every structural invariant of one sub-pool: the bitmap and
    /// the skip-list must describe the same free set, every run's boundary
    /// metadata must be consistent, and the list must be properly doubly
    /// linked through the sentinel.
    ///
    /// # Safety
    ///
    /// `table` must point to a live table.
    #[cfg(any(debug_assertions, test))]
    pub(crate) unsafe fn integrity_check(table: NonNull<Self>, sub_pool: usize, slot_size: usize) {
        let capacity = sub_pool_capacity(sub_pool).get();

        // SAFETY: table is live; all traversal stays within the linked runs
        // of this sub-pool.
        unsafe {
            let sp = Self::sub_pool_ptr(table, sub_pool);

            if (*sp).data.is_null() {
                assert!((*sp).sentinel.next_head.is_null());
                assert_eq!((*sp).live, 0);
                return;
            }

            let mut covered = vec![false; capacity];
            let mut run_first = (*sp).sentinel.next_head;
            let mut expected_prev: *mut TailNode = &raw mut (*sp).sentinel;

            while !run_first.is_null() {
                let first_slot = Self::slot_index_of(table, sub_pool, run_first, slot_size);

                assert!(
                    ptr::eq((*run_first.cast::<TailNode>()).prev_tail, expected_prev),
                    "run at slot {first_slot} of sub-pool {sub_pool} has a broken prev link"
                );

                let (last_slot, run_tail, next) =
                    if Self::is_right_free(table, sub_pool, run_first, slot_size) {
                        let head = run_first.cast::<HeadNode>();
                        let bytes = (*head).bytes_to_tail;
                        assert_eq!(bytes % slot_size, 0);

                        let tail = run_first.add(bytes).cast::<TailNode>();
                        assert!(
                            ptr::eq((*tail).prev_tail, expected_prev),
                            "tail of run at slot {first_slot} disagrees with its head's prev link"
                        );

                        (first_slot + bytes / slot_size, tail, (*tail).next_head)
                    } else {
                        let tail = run_first.cast::<TailNode>();
                        (first_slot, tail, (*tail).next_head)
                    };

                assert!(last_slot < capacity);
                for slot in first_slot..=last_slot {
                    assert!(!covered[slot], "free runs overlap at slot {slot}");
                    covered[slot] = true;
                }

                expected_prev = run_tail;
                run_first = next;
            }

            let mut free_count = 0;
            for (slot, expected) in covered.iter().enumerate() {
                assert_eq!(
                    Self::is_slot_free(table, sub_pool, slot),
                    *expected,
                    "free bit of slot {slot} disagrees with the skip-list"
                );
                if *expected {
                    free_count += 1;
                }
            }

            assert_eq!(
                free_count,
                capacity - (*sp).live,
                "live count of sub-pool {sub_pool} disagrees with its free set"
            );
        }
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

    const SLOT_SIZE: usize = 32;

    fn slot_layout() -> Layout {
        Layout::from_size_align(SLOT_SIZE, 8).unwrap()
    }

    fn new_table() -> NonNull<SubPoolTable> {
        NonNull::new(Box::into_raw(Box::new(SubPoolTable::new()))).unwrap()
    }

    fn free_table(table: NonNull<SubPoolTable>) {
        drop(unsafe { Box::from_raw(table.as_ptr()) });
    }

    /// Pops every slot of the given activated sub-pool, returning the slot
    /// pointers in pop order.
    unsafe fn drain(table: NonNull<SubPoolTable>, sub_pool: usize) -> Vec<*mut u8> {
        let capacity = sub_pool_capacity(sub_pool).get();
        let mut slots = Vec::with_capacity(capacity);

        for expected_remaining in (0..capacity).rev() {
            let popped = unsafe { SubPoolTable::pop_first_free(table, sub_pool, SLOT_SIZE) };
            unsafe {
                (*SubPoolTable::sub_pool_ptr(table, sub_pool)).live += 1;
            }
            assert_eq!(popped.free_list_emptied, expected_remaining == 0);
            slots.push(popped.ptr.as_ptr());
        }

        slots
    }

    unsafe fn push(table: NonNull<SubPoolTable>, sub_pool: usize, ptr: *mut u8) {
        unsafe {
            (*SubPoolTable::sub_pool_ptr(table, sub_pool)).live -= 1;
            SubPoolTable::push_free(table, sub_pool, ptr, SLOT_SIZE);
            SubPoolTable::integrity_check(table, sub_pool, SLOT_SIZE);
        }
    }

    #[test]
    fn activation_installs_one_all_covering_run() {
        let table = new_table();

        unsafe {
            assert!(SubPoolTable::activate(table, 2, slot_layout()));
            SubPoolTable::integrity_check(table, 2, SLOT_SIZE);

            assert!(SubPoolTable::is_fully_free(table, 2, SLOT_SIZE));
            for slot in 0..4 {
                assert!(SubPoolTable::is_slot_free(table, 2, slot));
            }

            SubPoolTable::release(table, 2, slot_layout());
        }

        free_table(table);
    }

    #[test]
    fn pop_returns_slots_in_ascending_address_order() {
        let table = new_table();

        unsafe {
            assert!(SubPoolTable::activate(table, 2, slot_layout()));
            let slots = drain(table, 2);

            let base = (*SubPoolTable::sub_pool_ptr(table, 2)).data;
            for (index, slot) in slots.iter().enumerate() {
                assert_eq!(*slot, base.add(index * SLOT_SIZE));
                assert!(!SubPoolTable::is_slot_free(table, 2, index));
            }

            SubPoolTable::integrity_check(table, 2, SLOT_SIZE);

            // Not fully free any more; not even partially.
            assert!(!SubPoolTable::is_fully_free(table, 2, SLOT_SIZE));

            for slot in slots {
                push(table, 2, slot);
            }
            SubPoolTable::release(table, 2, slot_layout());
        }

        free_table(table);
    }

    #[test]
    fn merge_towards_single_run() {
        // Free in the order middle, middle+1, first, last: exercises the
        // fresh-singleton, extend-left and new-head-of-right cases, ending
        // in one run covering the whole buffer.
        let table = new_table();

        unsafe {
            assert!(SubPoolTable::activate(table, 2, slot_layout()));
            let slots = drain(table, 2);

            push(table, 2, slots[1]);
            push(table, 2, slots[2]);
            push(table, 2, slots[0]);
            assert!(!SubPoolTable::is_fully_free(table, 2, SLOT_SIZE));

            push(table, 2, slots[3]);
            assert!(SubPoolTable::is_fully_free(table, 2, SLOT_SIZE));

            SubPoolTable::release(table, 2, slot_layout());
        }

        free_table(table);
    }

    #[test]
    fn bridge_merges_two_singletons() {
        let table = new_table();

        unsafe {
            assert!(SubPoolTable::activate(table, 2, slot_layout()));
            let slots = drain(table, 2);

            push(table, 2, slots[0]);
            push(table, 2, slots[2]);
            // Freeing slot 1 bridges the two singleton runs into [0..=2].
            push(table, 2, slots[1]);
            push(table, 2, slots[3]);

            assert!(SubPoolTable::is_fully_free(table, 2, SLOT_SIZE));
            SubPoolTable::release(table, 2, slot_layout());
        }

        free_table(table);
    }

    #[test]
    fn bridge_merges_two_long_runs() {
        let table = new_table();

        unsafe {
            assert!(SubPoolTable::activate(table, 3, slot_layout()));
            let slots = drain(table, 3);

            // Two length-2 runs with a live slot between them.
            push(table, 3, slots[0]);
            push(table, 3, slots[1]);
            push(table, 3, slots[3]);
            push(table, 3, slots[4]);

            // The bridge merges them into [0..=4].
            push(table, 3, slots[2]);

            // Pop must hand back slot 0 first: the merged run kept its head.
            let popped = SubPoolTable::pop_first_free(table, 3, SLOT_SIZE);
            (*SubPoolTable::sub_pool_ptr(table, 3)).live += 1;
            assert_eq!(popped.ptr.as_ptr(), slots[0]);
            SubPoolTable::integrity_check(table, 3, SLOT_SIZE);

            for slot in [slots[0], slots[5], slots[6], slots[7]] {
                push(table, 3, slot);
            }
            assert!(SubPoolTable::is_fully_free(table, 3, SLOT_SIZE));

            SubPoolTable::release(table, 3, slot_layout());
        }

        free_table(table);
    }

    #[test]
    fn pop_from_length_two_run_leaves_a_valid_tail() {
        let table = new_table();

        unsafe {
            assert!(SubPoolTable::activate(table, 2, slot_layout()));
            let slots = drain(table, 2);

            // Build a length-2 run [1..=2], then pop it down slot by slot.
            push(table, 2, slots[1]);
            push(table, 2, slots[2]);

            let first = SubPoolTable::pop_first_free(table, 2, SLOT_SIZE);
            (*SubPoolTable::sub_pool_ptr(table, 2)).live += 1;
            assert_eq!(first.ptr.as_ptr(), slots[1]);
            assert!(!first.free_list_emptied);
            SubPoolTable::integrity_check(table, 2, SLOT_SIZE);

            let second = SubPoolTable::pop_first_free(table, 2, SLOT_SIZE);
            (*SubPoolTable::sub_pool_ptr(table, 2)).live += 1;
            assert_eq!(second.ptr.as_ptr(), slots[2]);
            assert!(second.free_list_emptied);
            SubPoolTable::integrity_check(table, 2, SLOT_SIZE);

            for slot in slots {
                push(table, 2, slot);
            }
            SubPoolTable::release(table, 2, slot_layout());
        }

        free_table(table);
    }

    #[test]
    fn churn_against_reference_bitmap() {
        // Random pops and pushes, cross-checked against a plain boolean
        // free-set after every operation via the integrity check.
        let table = new_table();

        unsafe {
            assert!(SubPoolTable::activate(table, 4, slot_layout()));
            let capacity = sub_pool_capacity(4).get();
            let base = (*SubPoolTable::sub_pool_ptr(table, 4)).data;

            let mut live: Vec<usize> = Vec::new();
            // Deterministic pseudo-random walk; a full PRNG adds nothing here.
            let mut state = 0x9e37_79b9_u64;

            for _ in 0..2_000 {
                state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);

                let pop = live.is_empty() || ((state >> 33) % 3 != 0 && live.len() < capacity);
                if pop {
                    let popped = SubPoolTable::pop_first_free(table, 4, SLOT_SIZE);
                    (*SubPoolTable::sub_pool_ptr(table, 4)).live += 1;
                    live.push(SubPoolTable::slot_index_of(
                        table,
                        4,
                        popped.ptr.as_ptr(),
                        SLOT_SIZE,
                    ));
                } else {
                    let victim = live.swap_remove(((state >> 17) as usize) % live.len());
                    push(table, 4, base.add(victim * SLOT_SIZE));
                }

                SubPoolTable::integrity_check(table, 4, SLOT_SIZE);
            }

            for slot in live {
                push(table, 4, base.add(slot * SLOT_SIZE));
            }
            assert!(SubPoolTable::is_fully_free(table, 4, SLOT_SIZE));

            SubPoolTable::release(table, 4, slot_layout());
        }

        free_table(table);
    }
}
