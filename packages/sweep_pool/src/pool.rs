use std::alloc::{Layout, alloc, dealloc};
use std::mem;
use std::ptr::{self, NonNull};
use std::thread;

use crate::coordinates::{SUB_POOL_COUNT, base_id, sub_pool_capacity, sub_pool_of_id};
use crate::cursor::{Iter, SweepCursor};
use crate::sub_pool::{SubPoolTable, TailNode};
use crate::{DropPolicy, SweepPoolBuilder};

/// An object pool of fixed-layout slots whose live slots can be enumerated by
/// a linear sweep of its backing buffers.
///
/// `SweepPool` hands out stable, aligned slots of one [`std::alloc::Layout`]
/// chosen at construction time, and answers "give me every live slot" without
/// any auxiliary container: the free-space bookkeeping is embedded in the
/// free slots themselves and doubles as a skip structure, so iteration jumps
/// over a whole range of free slots in constant time.
///
/// # Key Features
///
/// - **O(1) allocate and deallocate**: free slots are threaded into per-buffer
///   free lists with constant-time merge on deallocation
/// - **Iteration without a container**: [`iter()`](Self::iter) yields every
///   live slot in address order, skipping free ranges in one jump
/// - **Stable addresses**: slots never move between allocation and the
///   matching deallocation
/// - **Dense ids**: every slot has a contiguous integer id, cheap to store
///   and convertible to and from its pointer
/// - **Geometric growth**: backing buffers double in size, so a pool of `n`
///   slots has touched only `O(log n)` buffers
/// - **Damped shrinking**: at most one empty buffer is retained to absorb
///   churn around a buffer boundary; the rest are released eagerly
///
/// # Storage model
///
/// The pool is byte-level: it allocates and frees raw slots and runs no
/// destructors. The typed [`insert()`](Self::insert) / [`remove()`](Self::remove)
/// layer constructs and drops values in place, but the pool does not remember
/// them - values still live when the pool is dropped are discarded, not
/// dropped (see [`DropPolicy`]).
///
/// # Examples
///
/// ```
/// use sweep_pool::SweepPool;
///
/// let mut pool = SweepPool::builder().layout_of::<[u64; 4]>().build();
///
/// let first = pool.allocate().expect("out of memory");
/// let second = pool.allocate().expect("out of memory");
/// assert_eq!(pool.len(), 2);
///
/// // Every live slot is enumerated, in address order, with no side table.
/// let visited: Vec<_> = pool.iter().collect();
/// assert_eq!(visited, vec![first.ptr(), second.ptr()]);
///
/// // SAFETY: the pointer came from this pool and has not been freed yet.
/// unsafe { pool.deallocate(first.ptr().as_ptr()) };
/// assert_eq!(pool.len(), 1);
/// ```
///
/// # Thread Safety
///
/// The pool is thread-mobile ([`Send`]) and can be moved between threads, but
/// it is not thread-safe ([`Sync`]) and cannot be shared between threads
/// without external synchronization.
#[derive(Debug)]
pub struct SweepPool {
    /// The layout the caller asked for; typed accessors verify against this.
    item_layout: Layout,

    /// The effective per-slot layout: alignment raised to fit the embedded
    /// free-run nodes, size padded to the alignment so slots tile the buffer.
    slot_layout: Layout,

    /// Bit `i` is set while sub-pool `i` has at least one free slot or is not
    /// yet activated. Allocation takes the lowest set bit, which keeps the
    /// densely packed storage at the low sub-pools.
    vacant_mask: usize,

    /// Bit `i` is set while sub-pool `i` holds at least one live slot.
    nonempty_mask: usize,

    /// A sub-pool that became empty but whose buffers are retained
    /// speculatively. When a second sub-pool empties, the higher-indexed of
    /// the two is released; the lower-indexed one is the more likely to be
    /// reused under lowest-first allocation.
    deferred_release: Option<usize>,

    /// All per-sub-pool records and the sorted base-pointer index, allocated
    /// lazily at a stable address. Embedded free-run nodes point back into
    /// this block, which is why it lives behind a pointer rather than inline:
    /// moving the pool value must not move the records.
    table: Option<NonNull<SubPoolTable>>,

    /// Number of live slots in the pool. We track this explicitly rather
    /// than summing per-sub-pool counts on demand.
    length: usize,

    /// Determines how drop treats still-live allocations.
    drop_policy: DropPolicy,
}

/// One slot handed out by [`SweepPool::allocate`]: the slot pointer together
/// with the sub-pool that owns it.
///
/// Keeping the sub-pool index around lets the slot be returned through
/// [`SweepPool::deallocate_in`], which skips the reverse address lookup.
#[derive(Clone, Copy, Debug)]
pub struct Allocation {
    sub_pool: usize,
    ptr: NonNull<u8>,
}

impl Allocation {
    /// Pointer to the slot's first byte.
    #[must_use]
    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Index of the sub-pool the slot belongs to.
    #[must_use]
    pub fn sub_pool(&self) -> usize {
        self.sub_pool
    }
}

impl SweepPool {
    /// Creates a builder for configuring and constructing a [`SweepPool`].
    ///
    /// You must specify a slot memory layout using either `.layout()` or
    /// `.layout_of::<T>()` before calling `.build()`.
    ///
    /// # Examples
    ///
    /// ```
    /// use sweep_pool::SweepPool;
    ///
    /// let pool = SweepPool::builder().layout_of::<[usize; 4]>().build();
    /// assert!(pool.is_empty());
    /// ```
    #[inline]
    pub fn builder() -> SweepPoolBuilder {
        SweepPoolBuilder::new()
    }

    /// Creates a new [`SweepPool`] with the specified configuration.
    ///
    /// # Panics
    ///
    /// Panics if the layout is smaller than two machine words.
    #[must_use]
    pub(crate) fn new_inner(item_layout: Layout, drop_policy: DropPolicy) -> Self {
        assert!(
            item_layout.size() >= mem::size_of::<TailNode>(),
            "SweepPool slots must be at least two machine words ({} bytes); free slots hold their own bookkeeping",
            mem::size_of::<TailNode>()
        );

        let raised_align = item_layout.align().max(mem::align_of::<TailNode>());
        let slot_layout = Layout::from_size_align(item_layout.size(), raised_align)
            .expect("raising the alignment of a valid layout cannot overflow")
            .pad_to_align();

        Self {
            item_layout,
            slot_layout,
            vacant_mask: usize::MAX,
            nonempty_mask: 0,
            deferred_release: None,
            table: None,
            length: 0,
            drop_policy,
        }
    }

    /// The memory layout the pool was configured with.
    #[must_use]
    #[inline]
    pub fn item_layout(&self) -> Layout {
        self.item_layout
    }

    /// The effective per-slot layout: the configured layout with its
    /// alignment raised to a machine word and its size padded to a multiple
    /// of that alignment. Pointer arithmetic and dense ids use this stride.
    #[must_use]
    #[inline]
    pub fn slot_layout(&self) -> Layout {
        self.slot_layout
    }

    /// The number of live slots in the pool.
    ///
    /// # Examples
    ///
    /// ```
    /// use sweep_pool::SweepPool;
    ///
    /// let mut pool = SweepPool::builder().layout_of::<[u64; 4]>().build();
    /// assert_eq!(pool.len(), 0);
    ///
    /// let allocation = pool.allocate().expect("out of memory");
    /// assert_eq!(pool.len(), 1);
    ///
    /// // SAFETY: the pointer came from this pool and has not been freed yet.
    /// unsafe { pool.deallocate(allocation.ptr().as_ptr()) };
    /// assert_eq!(pool.len(), 0);
    /// ```
    #[must_use]
    #[cfg_attr(test, mutants::skip)] // Breaking this breaks only bookkeeping the tests read back.
    #[inline]
    pub fn len(&self) -> usize {
        self.length
    }

    /// Whether the pool has no live slots.
    ///
    /// An empty pool may still be holding memory: the lazily allocated
    /// bookkeeping block and at most one speculatively retained buffer.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        debug_assert_eq!(self.nonempty_mask == 0, self.length == 0);
        self.nonempty_mask == 0
    }

    /// Allocates one slot and returns its pointer and owning sub-pool.
    ///
    /// The slot's bytes are uninitialized. Allocation always picks the
    /// lowest-indexed sub-pool with a free slot, activating a new sub-pool
    /// (twice the size of the previous one) only when every activated
    /// sub-pool is full.
    ///
    /// Returns `None` when a backing buffer cannot be acquired from the host
    /// allocator; the pool is left exactly as it was.
    ///
    /// # Examples
    ///
    /// ```
    /// use sweep_pool::SweepPool;
    ///
    /// let mut pool = SweepPool::builder().layout_of::<[u64; 4]>().build();
    ///
    /// let allocation = pool.allocate().expect("out of memory");
    /// assert_eq!(allocation.sub_pool(), 0);
    ///
    /// // SAFETY: a freshly allocated slot may be written through its pointer.
    /// unsafe { allocation.ptr().cast::<[u64; 4]>().write([1, 2, 3, 4]) };
    /// # unsafe { pool.deallocate(allocation.ptr().as_ptr()) };
    /// ```
    #[must_use]
    pub fn allocate(&mut self) -> Option<Allocation> {
        let table = self.ensure_table()?;

        let sub_pool = self.vacant_mask.trailing_zeros() as usize;
        if sub_pool >= SUB_POOL_COUNT {
            debug_assert!(false, "the pool's id space of {SUB_POOL_COUNT} sub-pools is exhausted");
            return None;
        }

        // SAFETY: the table is live and sub_pool is in bounds; activation and
        // pop keep the sub-pool's two free-set views consistent.
        unsafe {
            let t = table.as_ptr();

            if (*t).sub_pools[sub_pool].data.is_null()
                && !SubPoolTable::activate(table, sub_pool, self.slot_layout)
            {
                return None;
            }

            if self.deferred_release == Some(sub_pool) {
                // The retained buffer is being reused, not released.
                self.deferred_release = None;
            }

            self.nonempty_mask |= 1 << sub_pool;

            let popped = SubPoolTable::pop_first_free(table, sub_pool, self.slot_layout.size());

            (*t).sub_pools[sub_pool].live += 1;
            // Cannot overflow: that would mean more live slots than address space.
            self.length = self.length.wrapping_add(1);

            if popped.free_list_emptied {
                self.vacant_mask &= !(1 << sub_pool);
                debug_assert_eq!((*t).sub_pools[sub_pool].live, sub_pool_capacity(sub_pool).get());
            }

            Some(Allocation {
                sub_pool,
                ptr: popped.ptr,
            })
        }
    }

    /// Deallocates a slot by pointer, locating its sub-pool through the
    /// sorted base-pointer index.
    ///
    /// Passing a null pointer is a defined no-op.
    ///
    /// # Safety
    ///
    /// A non-null `ptr` must have been returned by an allocation from this
    /// pool and must not have been deallocated since. In particular, pointers
    /// into a sub-pool that was released (by the deferred-release policy or
    /// [`deallocate_all()`](Self::deallocate_all)) must not be passed here.
    pub unsafe fn deallocate(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        // SAFETY: a live allocation's pointer resolves through the index.
        let sub_pool = self.find_sub_pool_of(unsafe { NonNull::new_unchecked(ptr) });

        // SAFETY: forwarding the caller's contract.
        unsafe { self.deallocate_impl(ptr, sub_pool) };
    }

    /// Deallocates a slot by pointer and owning sub-pool, skipping the
    /// reverse address lookup.
    ///
    /// Passing a null pointer is a defined no-op.
    ///
    /// # Safety
    ///
    /// Same as [`deallocate()`](Self::deallocate); additionally `sub_pool`
    /// must be the slot's owning sub-pool, as returned by the allocation.
    pub unsafe fn deallocate_in(&mut self, ptr: *mut u8, sub_pool: usize) {
        // SAFETY: forwarding the caller's contract.
        unsafe { self.deallocate_impl(ptr, sub_pool) };
    }

    /// Deallocates a slot by dense id.
    ///
    /// # Safety
    ///
    /// `id` must identify a currently-live slot of this pool.
    pub unsafe fn deallocate_id(&mut self, id: usize) {
        let ptr = self.id_to_ptr(id);

        // SAFETY: a live slot's id resolves to its live pointer.
        unsafe { self.deallocate_impl(ptr.as_ptr(), sub_pool_of_id(id)) };
    }

    /// Releases every sub-pool's buffers at once, regardless of how many
    /// slots are live.
    ///
    /// All outstanding pointers and ids become invalid. No destructors run;
    /// values stored through the typed layer are discarded. The bookkeeping
    /// block is kept, so the pool is immediately ready for reuse.
    ///
    /// # Examples
    ///
    /// ```
    /// use sweep_pool::SweepPool;
    ///
    /// let mut pool = SweepPool::builder().layout_of::<[u64; 4]>().build();
    /// for _ in 0..100 {
    ///     let _ = pool.allocate().expect("out of memory");
    /// }
    ///
    /// pool.deallocate_all();
    /// assert!(pool.is_empty());
    /// ```
    pub fn deallocate_all(&mut self) {
        let Some(table) = self.table else {
            return;
        };

        // SAFETY: the table is live; each activated sub-pool is released
        // exactly once and the index entries pointing at them are cleared.
        unsafe {
            let t = table.as_ptr();
            for sub_pool in 0..SUB_POOL_COUNT {
                if !(*t).sub_pools[sub_pool].data.is_null() {
                    SubPoolTable::release(table, sub_pool, self.slot_layout);
                }
            }
            (*t).sorted.clear();
        }

        self.vacant_mask = usize::MAX;
        self.nonempty_mask = 0;
        self.deferred_release = None;
        self.length = 0;
    }

    /// Resolves a dense id to its slot pointer.
    ///
    /// # Panics
    ///
    /// Panics if the id's sub-pool is not activated. Ids of released
    /// sub-pools are invalid until the sub-pool is activated again.
    #[must_use]
    pub fn id_to_ptr(&self, id: usize) -> NonNull<u8> {
        let sub_pool = sub_pool_of_id(id);
        let table = self
            .table
            .expect("the id does not identify a slot in this pool (the pool has no storage)");

        // SAFETY: the table is live; the offset stays inside the sub-pool
        // buffer because the id range of a sub-pool equals its capacity.
        unsafe {
            let data = (*table.as_ptr()).sub_pools[sub_pool].data;
            assert!(
                !data.is_null(),
                "id {id} does not belong to an activated sub-pool"
            );

            let slot = id - base_id(sub_pool);
            debug_assert!(slot < sub_pool_capacity(sub_pool).get());

            NonNull::new_unchecked(data.add(slot * self.slot_layout.size()))
        }
    }

    /// Computes the dense id of a slot pointer within its owning sub-pool.
    ///
    /// # Panics
    ///
    /// Panics if the pool has no storage. In debug builds, panics if the
    /// pointer does not lie within the given sub-pool.
    #[must_use]
    pub fn ptr_to_id(&self, ptr: NonNull<u8>, sub_pool: usize) -> usize {
        let table = self
            .table
            .expect("the pointer does not belong to this pool (the pool has no storage)");

        // SAFETY: the table is live; containment is the caller's contract,
        // checked in debug builds.
        unsafe {
            debug_assert!(
                SubPoolTable::contains(table, sub_pool, ptr.as_ptr(), self.slot_layout.size()),
                "the pointer does not lie within sub-pool {sub_pool}"
            );

            base_id(sub_pool)
                + SubPoolTable::slot_index_of(table, sub_pool, ptr.as_ptr(), self.slot_layout.size())
        }
    }

    /// The sub-pool whose id range contains the given dense id. A pure
    /// function of the id; the sub-pool need not be activated.
    #[must_use]
    pub fn id_to_sub_pool(id: usize) -> usize {
        sub_pool_of_id(id)
    }

    /// Finds the sub-pool whose buffer contains the given pointer, in
    /// O(log W) through the sorted base-pointer index.
    ///
    /// # Panics
    ///
    /// Panics if the pool has no activated sub-pool. In debug builds, panics
    /// if the pointer does not lie within any activated sub-pool.
    #[must_use]
    pub fn find_sub_pool_of(&self, ptr: NonNull<u8>) -> usize {
        let table = self
            .table
            .expect("the pointer does not belong to this pool (the pool has no storage)");

        // SAFETY: the table is live; the index only ever holds activated
        // sub-pools.
        unsafe {
            let t = table.as_ptr();
            assert!(
                (*t).sorted.len() > 0,
                "the pointer does not belong to this pool (no sub-pool is activated)"
            );

            let sub_pool = (*t).sorted.sub_pool_of(ptr.as_ptr());
            debug_assert!(
                SubPoolTable::contains(table, sub_pool, ptr.as_ptr(), self.slot_layout.size()),
                "the pointer does not lie within any activated sub-pool"
            );

            sub_pool
        }
    }

    /// Allocates a slot and moves `value` into it, returning a typed pointer.
    ///
    /// Returns `None` (dropping `value` normally) when a backing buffer
    /// cannot be acquired.
    ///
    /// # Examples
    ///
    /// ```
    /// use sweep_pool::SweepPool;
    ///
    /// let mut pool = SweepPool::builder().layout_of::<String>().build();
    ///
    /// // SAFETY: String is the layout the pool was built with.
    /// let greeting = unsafe { pool.insert("Hello, World!".to_string()) }.expect("out of memory");
    ///
    /// // SAFETY: the value is live and we have exclusive access to the pool.
    /// assert_eq!(unsafe { greeting.as_ref() }, "Hello, World!");
    ///
    /// // SAFETY: the value was inserted as a String and is still live.
    /// unsafe { pool.remove(greeting) };
    /// ```
    ///
    /// # Safety
    ///
    /// The layout of `T` must equal the pool's configured layout. In debug
    /// builds this is checked with an assertion. The pool does not remember
    /// the value: it must be returned through [`remove()`](Self::remove) (or
    /// forgotten deliberately) - dropping the pool will not drop it.
    #[must_use]
    pub unsafe fn insert<T>(&mut self, value: T) -> Option<NonNull<T>> {
        debug_assert_eq!(
            Layout::new::<T>(),
            self.item_layout,
            "T's layout does not match the pool's slot layout"
        );

        let allocation = self.allocate()?;
        let ptr = allocation.ptr().cast::<T>();

        // SAFETY: a freshly allocated slot is unaliased, properly aligned
        // for T (the effective alignment only ever exceeds the requested
        // one), and large enough for it.
        unsafe { ptr.as_ptr().write(value) };

        Some(ptr)
    }

    /// Drops the value at `ptr` in place and deallocates its slot.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`insert::<T>()`](Self::insert) on
    /// this pool with the same `T`, and must not have been removed since.
    pub unsafe fn remove<T>(&mut self, ptr: NonNull<T>) {
        debug_assert_eq!(
            Layout::new::<T>(),
            self.item_layout,
            "T's layout does not match the pool's slot layout"
        );

        // SAFETY: the caller guarantees a live, correctly typed value; the
        // slot is released only after the value is gone.
        unsafe {
            ptr::drop_in_place(ptr.as_ptr());
            self.deallocate(ptr.as_ptr().cast::<u8>());
        }
    }

    /// Iterates over every live slot, in ascending address order within each
    /// sub-pool and ascending sub-pool order overall.
    ///
    /// The borrow taken here freezes the pool, so the iterator needs no
    /// repair operations. To mutate the pool mid-traversal, use
    /// [`cursor()`](Self::cursor) instead.
    ///
    /// # Examples
    ///
    /// ```
    /// use sweep_pool::SweepPool;
    ///
    /// let mut pool = SweepPool::builder().layout_of::<[u64; 4]>().build();
    /// let allocations: Vec<_> = (0..5).map(|_| pool.allocate().expect("out of memory")).collect();
    ///
    /// let swept: Vec<_> = pool.iter().collect();
    /// assert_eq!(swept.len(), 5);
    /// assert!(allocations.iter().all(|a| swept.contains(&a.ptr())));
    /// ```
    #[must_use]
    pub fn iter(&self) -> Iter<'_> {
        Iter::new(self)
    }

    /// Creates a detached traversal cursor over the pool's live slots.
    ///
    /// Unlike [`iter()`](Self::iter), the cursor does not borrow the pool, so
    /// the pool may be mutated between steps - provided the matching
    /// [`SweepCursor::fixed_after_allocate`] /
    /// [`SweepCursor::fixed_after_deallocate`] repair is applied after every
    /// mutation.
    #[must_use]
    pub fn cursor(&self) -> SweepCursor {
        SweepCursor::new(self)
    }

    pub(crate) fn table_ptr(&self) -> Option<NonNull<SubPoolTable>> {
        self.table
    }

    pub(crate) fn slot_size(&self) -> usize {
        self.slot_layout.size()
    }

    pub(crate) fn nonempty_bits(&self) -> usize {
        self.nonempty_mask
    }

    fn ensure_table(&mut self) -> Option<NonNull<SubPoolTable>> {
        if let Some(table) = self.table {
            return Some(table);
        }

        // SAFETY: SubPoolTable is not zero-sized.
        let raw = unsafe { alloc(Layout::new::<SubPoolTable>()) };
        let table = NonNull::new(raw)?.cast::<SubPoolTable>();

        // SAFETY: freshly allocated for this layout, fully overwritten here.
        unsafe { table.as_ptr().write(SubPoolTable::new()) };

        self.table = Some(table);
        Some(table)
    }

    /// # Safety
    ///
    /// A non-null `ptr` must be a live slot of sub-pool `sub_pool`.
    unsafe fn deallocate_impl(&mut self, ptr: *mut u8, sub_pool: usize) {
        if ptr.is_null() {
            return;
        }

        debug_assert!(!self.is_empty());
        let table = self
            .table
            .expect("deallocating from a pool that never allocated");

        // SAFETY: the caller guarantees a live slot; push keeps the two
        // free-set views consistent.
        unsafe {
            debug_assert!(
                SubPoolTable::contains(table, sub_pool, ptr, self.slot_layout.size()),
                "the pointer does not lie within sub-pool {sub_pool}"
            );

            let t = table.as_ptr();

            (*t).sub_pools[sub_pool].live -= 1;
            // Cannot underflow: the pool was non-empty above.
            self.length = self.length.wrapping_sub(1);
            self.vacant_mask |= 1 << sub_pool;

            SubPoolTable::push_free(table, sub_pool, ptr, self.slot_layout.size());

            if (*t).sub_pools[sub_pool].live == 0 {
                debug_assert!(SubPoolTable::is_fully_free(table, sub_pool, self.slot_layout.size()));
                self.nonempty_mask &= !(1 << sub_pool);

                match self.deferred_release {
                    None => self.deferred_release = Some(sub_pool),
                    Some(retained) => {
                        // Two empty sub-pools; keep only the lower-indexed one.
                        debug_assert_ne!(retained, sub_pool);
                        let released = if sub_pool < retained { retained } else { sub_pool };
                        self.deferred_release = Some(sub_pool.min(retained));

                        let base = (*t).sub_pools[released].data;
                        (*t).sorted.remove(base);
                        SubPoolTable::release(table, released, self.slot_layout);
                    }
                }
            }
        }
    }

    /// Validates every pool-level and per-sub-pool invariant. Test support.
    #[cfg(any(debug_assertions, test))]
    #[allow(dead_code, reason = "exercised by the test suite")]
    pub(crate) fn integrity_check(&self) {
        let Some(table) = self.table else {
            assert_eq!(self.length, 0);
            assert_eq!(self.nonempty_mask, 0);
            return;
        };

        let mut activated = 0;
        let mut total_live = 0;

        for sub_pool in 0..SUB_POOL_COUNT {
            // SAFETY: the table is live for the pool's lifetime.
            unsafe {
                SubPoolTable::integrity_check(table, sub_pool, self.slot_layout.size());

                let t = table.as_ptr();
                let live = (*t).sub_pools[sub_pool].live;
                let bit = 1_usize << sub_pool;

                if (*t).sub_pools[sub_pool].data.is_null() {
                    assert_eq!(self.vacant_mask & bit, bit, "a released sub-pool counts as vacant");
                    assert_eq!(self.nonempty_mask & bit, 0);
                } else {
                    activated += 1;
                    total_live += live;
                    assert_eq!(
                        self.nonempty_mask & bit != 0,
                        live > 0,
                        "nonempty bit of sub-pool {sub_pool} disagrees with its live count"
                    );
                    assert_eq!(
                        self.vacant_mask & bit != 0,
                        live < sub_pool_capacity(sub_pool).get(),
                        "vacant bit of sub-pool {sub_pool} disagrees with its live count"
                    );
                    if live == 0 {
                        // The release policy retains at most one empty
                        // sub-pool, and this must be it.
                        assert_eq!(self.deferred_release, Some(sub_pool));
                    }
                }
            }
        }

        // SAFETY: reading the sorted index; nothing aliases it.
        unsafe {
            assert_eq!((*table.as_ptr()).sorted.len(), activated);
        }
        assert_eq!(self.length, total_live);

        if let Some(retained) = self.deferred_release {
            // SAFETY: as above.
            unsafe {
                let t = table.as_ptr();
                assert!(!(*t).sub_pools[retained].data.is_null());
                assert_eq!((*t).sub_pools[retained].live, 0);
            }
        }
    }
}

impl Drop for SweepPool {
    fn drop(&mut self) {
        let live = self.length;

        if let Some(table) = self.table {
            // SAFETY: every buffer is released exactly once, then the table
            // block itself, with the same layouts they were allocated with.
            unsafe {
                let t = table.as_ptr();
                for sub_pool in 0..SUB_POOL_COUNT {
                    if !(*t).sub_pools[sub_pool].data.is_null() {
                        SubPoolTable::release(table, sub_pool, self.slot_layout);
                    }
                }
                ptr::drop_in_place(t);
                dealloc(t.cast::<u8>(), Layout::new::<SubPoolTable>());
            }
        }

        // We do the check after the memory is already cleaned up: we are
        // going to panic anyway, so the app gains nothing from the buffers.
        //
        // If we are already panicking, panicking again would only obscure
        // the original panic.
        if !thread::panicking() && matches!(self.drop_policy, DropPolicy::MustNotDropAllocations) {
            assert!(
                live == 0,
                "dropped a SweepPool with {live} live allocations - this is forbidden by DropPolicy::MustNotDropAllocations"
            );
        }
    }
}

// SAFETY: SweepPool exclusively owns every buffer its interior pointers lead
// to, and nothing in it is tied to the creating thread. It may move between
// threads; it must not be shared (no internal synchronization), so it is
// deliberately not Sync.
unsafe impl Send for SweepPool {}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    clippy::indexing_slicing,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(SweepPool: Send);
    assert_not_impl_any!(SweepPool: Sync);

    type Payload = [u64; 4];

    fn new_pool() -> SweepPool {
        SweepPool::builder().layout_of::<Payload>().build()
    }

    fn sub_pool_is_activated(pool: &SweepPool, sub_pool: usize) -> bool {
        pool.table
            .is_some_and(|table| unsafe { !(*table.as_ptr()).sub_pools[sub_pool].data.is_null() })
    }

    #[test]
    fn smoke_test() {
        let mut pool = new_pool();

        assert_eq!(pool.len(), 0);
        assert!(pool.is_empty());

        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        let c = pool.allocate().unwrap();

        assert_eq!(pool.len(), 3);
        assert!(!pool.is_empty());
        pool.integrity_check();

        unsafe {
            a.ptr().cast::<Payload>().write([1, 1, 1, 1]);
            b.ptr().cast::<Payload>().write([2, 2, 2, 2]);
            c.ptr().cast::<Payload>().write([3, 3, 3, 3]);

            assert_eq!(a.ptr().cast::<Payload>().read(), [1, 1, 1, 1]);
            assert_eq!(b.ptr().cast::<Payload>().read(), [2, 2, 2, 2]);
            assert_eq!(c.ptr().cast::<Payload>().read(), [3, 3, 3, 3]);
        }

        unsafe { pool.deallocate(b.ptr().as_ptr()) };
        assert_eq!(pool.len(), 2);
        pool.integrity_check();

        let d = pool.allocate().unwrap();

        unsafe {
            assert_eq!(a.ptr().cast::<Payload>().read(), [1, 1, 1, 1]);
            assert_eq!(c.ptr().cast::<Payload>().read(), [3, 3, 3, 3]);
        }

        unsafe {
            pool.deallocate(a.ptr().as_ptr());
            pool.deallocate(c.ptr().as_ptr());
            pool.deallocate_in(d.ptr().as_ptr(), d.sub_pool());
        }

        assert!(pool.is_empty());
        pool.integrity_check();
    }

    #[test]
    fn sub_pools_progress_geometrically() {
        let mut pool = new_pool();

        // Two slots in sub-pool 0, two in sub-pool 1, four in sub-pool 2.
        let expected_sub_pools = [0, 0, 1, 1, 2, 2, 2, 2];

        for (index, expected) in expected_sub_pools.into_iter().enumerate() {
            let allocation = pool.allocate().unwrap();
            assert_eq!(allocation.sub_pool(), expected);
            assert_eq!(pool.ptr_to_id(allocation.ptr(), allocation.sub_pool()), index);
        }

        pool.integrity_check();
        pool.deallocate_all();
    }

    #[test]
    fn allocation_prefers_the_lowest_vacant_sub_pool() {
        let mut pool = new_pool();

        let allocations: Vec<_> = (0..8).map(|_| pool.allocate().unwrap()).collect();

        // Opening a hole in sub-pool 0 redirects the next allocation there,
        // even though sub-pool 2 also has room.
        unsafe { pool.deallocate(allocations[0].ptr().as_ptr()) };
        let refill = pool.allocate().unwrap();
        assert_eq!(refill.sub_pool(), 0);
        assert_eq!(refill.ptr(), allocations[0].ptr());

        pool.deallocate_all();
    }

    #[test]
    fn id_and_pointer_round_trip() {
        let mut pool = new_pool();

        let allocations: Vec<_> = (0..16).map(|_| pool.allocate().unwrap()).collect();

        for allocation in &allocations {
            let id = pool.ptr_to_id(allocation.ptr(), allocation.sub_pool());
            assert_eq!(pool.id_to_ptr(id), allocation.ptr());
            assert_eq!(SweepPool::id_to_sub_pool(id), allocation.sub_pool());
            assert_eq!(pool.find_sub_pool_of(allocation.ptr()), allocation.sub_pool());
        }

        // Ids are dense: n allocations into an empty pool use ids 0..n.
        let mut ids: Vec<_> = allocations
            .iter()
            .map(|a| pool.ptr_to_id(a.ptr(), a.sub_pool()))
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..16).collect::<Vec<_>>());

        pool.deallocate_all();
    }

    #[test]
    fn deallocate_by_id() {
        let mut pool = new_pool();

        let allocation = pool.allocate().unwrap();
        let id = pool.ptr_to_id(allocation.ptr(), allocation.sub_pool());

        unsafe { pool.deallocate_id(id) };
        assert!(pool.is_empty());
        pool.integrity_check();
    }

    #[test]
    fn deallocating_null_is_a_no_op() {
        let mut pool = new_pool();
        let _allocation = pool.allocate().unwrap();

        unsafe {
            pool.deallocate(ptr::null_mut());
            pool.deallocate_in(ptr::null_mut(), 0);
        }

        assert_eq!(pool.len(), 1);
        pool.deallocate_all();
    }

    #[test]
    fn empty_sub_pool_is_retained_then_handed_over() {
        let mut pool = new_pool();

        // Fill sub-pool 0 and spill one allocation into sub-pool 1.
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        let c = pool.allocate().unwrap();
        assert_eq!(c.sub_pool(), 1);

        // Emptying sub-pool 1 defers its release: the buffer stays.
        unsafe { pool.deallocate(c.ptr().as_ptr()) };
        assert!(sub_pool_is_activated(&pool, 1));
        assert_eq!(pool.deferred_release, Some(1));
        pool.integrity_check();

        // Emptying sub-pool 0 hands the retention over: the lower index
        // wins, sub-pool 1 is released.
        unsafe {
            pool.deallocate(a.ptr().as_ptr());
            pool.deallocate(b.ptr().as_ptr());
        }
        assert!(pool.is_empty());
        assert!(sub_pool_is_activated(&pool, 0));
        assert!(!sub_pool_is_activated(&pool, 1));
        assert_eq!(pool.deferred_release, Some(0));
        pool.integrity_check();

        // The retained buffer is reused by the next allocation.
        let again = pool.allocate().unwrap();
        assert_eq!(again.sub_pool(), 0);
        assert_eq!(pool.deferred_release, None);

        pool.deallocate_all();
    }

    #[test]
    fn reused_deferred_sub_pool_is_not_released() {
        let mut pool = new_pool();

        // Make sub-pool 1 the deferred one.
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        let c = pool.allocate().unwrap();
        unsafe { pool.deallocate(c.ptr().as_ptr()) };
        assert_eq!(pool.deferred_release, Some(1));

        // Free one slot of sub-pool 0, then fill it again; sub-pool 1 must
        // survive all of it.
        unsafe { pool.deallocate(a.ptr().as_ptr()) };
        let _refill = pool.allocate().unwrap();
        assert!(sub_pool_is_activated(&pool, 1));
        assert_eq!(pool.deferred_release, Some(1));

        // The next allocation beyond sub-pool 0 reuses the retained buffer.
        let d = pool.allocate().unwrap();
        assert_eq!(d.sub_pool(), 1);
        assert_eq!(pool.deferred_release, None);

        unsafe { pool.deallocate(b.ptr().as_ptr()) };
        pool.integrity_check();
        pool.deallocate_all();
    }

    #[test]
    fn deallocate_all_releases_every_buffer() {
        let mut pool = new_pool();

        let _allocations: Vec<_> = (0..20).map(|_| pool.allocate().unwrap()).collect();
        assert!(sub_pool_is_activated(&pool, 3));

        pool.deallocate_all();

        assert!(pool.is_empty());
        assert_eq!(pool.len(), 0);
        for sub_pool in 0..SUB_POOL_COUNT {
            assert!(!sub_pool_is_activated(&pool, sub_pool));
        }
        pool.integrity_check();

        // The pool restarts from sub-pool 0.
        let fresh = pool.allocate().unwrap();
        assert_eq!(fresh.sub_pool(), 0);
        assert_eq!(pool.ptr_to_id(fresh.ptr(), fresh.sub_pool()), 0);
        pool.deallocate_all();
    }

    #[test]
    fn typed_layer_constructs_and_drops_in_place() {
        use std::cell::Cell;
        use std::rc::Rc;

        struct Tracked {
            dropped: Rc<Cell<bool>>,
            payload: [usize; 2],
        }

        impl Drop for Tracked {
            fn drop(&mut self) {
                self.dropped.set(true);
            }
        }

        let mut pool = SweepPool::builder().layout_of::<Tracked>().build();
        let dropped = Rc::new(Cell::new(false));

        let value = unsafe {
            pool.insert(Tracked {
                dropped: Rc::clone(&dropped),
                payload: [7, 9],
            })
        }
        .unwrap();

        unsafe {
            assert_eq!(value.as_ref().payload, [7, 9]);
        }
        assert!(!dropped.get());

        unsafe { pool.remove(value) };
        assert!(dropped.get());
        assert!(pool.is_empty());
    }

    #[test]
    fn moving_the_pool_keeps_slots_valid() {
        let mut pool = new_pool();

        let allocation = pool.allocate().unwrap();
        unsafe { allocation.ptr().cast::<Payload>().write([9, 8, 7, 6]) };

        // Interior pointers survive the move because the bookkeeping block
        // is a stable heap allocation.
        let mut moved = pool;
        assert_eq!(moved.len(), 1);
        unsafe {
            assert_eq!(allocation.ptr().cast::<Payload>().read(), [9, 8, 7, 6]);
            moved.deallocate(allocation.ptr().as_ptr());
        }
        assert!(moved.is_empty());
        moved.integrity_check();
    }

    #[test]
    fn drop_with_live_allocations_is_fine_by_default() {
        let mut pool = new_pool();
        let _allocation = pool.allocate().unwrap();
        drop(pool);
    }

    #[test]
    #[should_panic]
    fn drop_with_live_allocations_panics_if_policy_forbids() {
        let mut pool = SweepPool::builder()
            .layout_of::<Payload>()
            .drop_policy(DropPolicy::MustNotDropAllocations)
            .build();

        let _allocation = pool.allocate().unwrap();
        drop(pool);
    }

    #[test]
    fn drop_after_draining_is_fine_under_strict_policy() {
        let mut pool = SweepPool::builder()
            .layout_of::<Payload>()
            .drop_policy(DropPolicy::MustNotDropAllocations)
            .build();

        let allocation = pool.allocate().unwrap();
        unsafe { pool.deallocate(allocation.ptr().as_ptr()) };
        drop(pool);
    }

    #[test]
    #[should_panic]
    fn id_of_unactivated_sub_pool_panics() {
        let mut pool = new_pool();
        let _allocation = pool.allocate().unwrap();

        // Sub-pool 5's id range starts at 32; it was never activated.
        let _ptr = pool.id_to_ptr(32);
    }

    #[test]
    fn reverse_lookup_stays_fresh_under_churn() {
        let mut pool = new_pool();

        // Grow through several sub-pools.
        let mut allocations: Vec<_> = (0..40).map(|_| pool.allocate().unwrap()).collect();

        // Shrink back: release the upper sub-pools through emptiness.
        for allocation in allocations.split_off(4) {
            unsafe { pool.deallocate_in(allocation.ptr().as_ptr(), allocation.sub_pool()) };
        }
        pool.integrity_check();

        // Grow again; lookups must resolve to current owners, never to a
        // released sub-pool.
        allocations.extend((0..12).map(|_| pool.allocate().unwrap()));
        for allocation in &allocations {
            assert_eq!(pool.find_sub_pool_of(allocation.ptr()), allocation.sub_pool());
        }

        pool.deallocate_all();
    }
}
