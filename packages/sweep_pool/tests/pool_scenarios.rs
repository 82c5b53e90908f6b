//! End-to-end scenarios for `sweep_pool`, exercised through the public API
//! only: pool growth, free-run merging as observed by the sweep, deferred
//! buffer retention, reverse lookup under churn, and the
//! mutate-while-sweeping protocol at scale.

use std::collections::HashSet;
use std::ptr::NonNull;

use rand::seq::SliceRandom;
use sweep_pool::{Allocation, SweepPool};

type Payload = [u64; 4];

fn new_pool() -> SweepPool {
    SweepPool::builder().layout_of::<Payload>().build()
}

fn live_set(pool: &SweepPool) -> Vec<NonNull<u8>> {
    pool.iter().collect()
}

#[test]
fn fresh_pool_lifecycle() {
    let mut pool = new_pool();

    assert!(pool.is_empty());
    assert_eq!(pool.iter().count(), 0);

    let allocation = pool.allocate().expect("out of memory");
    assert_eq!(allocation.sub_pool(), 0);
    assert_eq!(pool.ptr_to_id(allocation.ptr(), allocation.sub_pool()), 0);
    assert!(!pool.is_empty());
    assert_eq!(live_set(&pool), vec![allocation.ptr()]);

    // SAFETY: the pointer came from this pool and has not been freed yet.
    unsafe { pool.deallocate(allocation.ptr().as_ptr()) };
    assert!(pool.is_empty());
    assert_eq!(pool.iter().count(), 0);
}

#[test]
fn sub_pool_progression_and_dense_ids() {
    let mut pool = new_pool();

    let expected_sub_pools = [0, 0, 1, 1, 2, 2, 2, 2];
    for (expected_id, expected_sub_pool) in expected_sub_pools.into_iter().enumerate() {
        let allocation = pool.allocate().expect("out of memory");
        assert_eq!(allocation.sub_pool(), expected_sub_pool);

        let id = pool.ptr_to_id(allocation.ptr(), allocation.sub_pool());
        assert_eq!(id, expected_id);
        assert_eq!(pool.id_to_ptr(id), allocation.ptr());
        assert_eq!(SweepPool::id_to_sub_pool(id), expected_sub_pool);
    }

    pool.deallocate_all();
}

#[test]
fn merge_orders_keep_the_sweep_exact() {
    // Free four contiguous slots in the order middle, middle+1, first, last,
    // verifying after every step that the sweep yields exactly the live set.
    // This drives all four merge shapes: fresh singleton, extend left, new
    // head of right run, and the two-sided bridge.
    let mut pool = new_pool();
    let allocations: Vec<Allocation> = (0..8).map(|_| pool.allocate().expect("out of memory")).collect();

    // allocations[4..8] fill sub-pool 2's four slots.
    let mut live: HashSet<NonNull<u8>> = allocations.iter().map(Allocation::ptr).collect();

    for index in [5, 6, 4, 7] {
        // SAFETY: each slot is deallocated exactly once.
        unsafe { pool.deallocate(allocations[index].ptr().as_ptr()) };
        live.remove(&allocations[index].ptr());

        let swept = live_set(&pool);
        assert_eq!(swept.len(), live.len());
        assert!(swept.iter().all(|slot| live.contains(slot)));
    }

    // The sub-pool drained back into one run: refilling starts at its first
    // slot again.
    let refill = pool.allocate().expect("out of memory");
    assert_eq!(refill.ptr(), allocations[4].ptr());

    pool.deallocate_all();
}

#[test]
fn emptied_sub_pool_buffer_is_retained_for_reuse() {
    let mut pool = new_pool();

    let a = pool.allocate().expect("out of memory");
    let b = pool.allocate().expect("out of memory");
    let c = pool.allocate().expect("out of memory");
    assert_eq!(c.sub_pool(), 1);

    // Empty sub-pool 1, then sub-pool 0. The deferred-release policy keeps
    // the lower-indexed buffer, so the next allocation must land on one of
    // sub-pool 0's old addresses without touching the host allocator.
    // SAFETY: each slot is deallocated exactly once.
    unsafe {
        pool.deallocate(c.ptr().as_ptr());
        pool.deallocate(a.ptr().as_ptr());
        pool.deallocate(b.ptr().as_ptr());
    }
    assert!(pool.is_empty());

    let reused = pool.allocate().expect("out of memory");
    assert_eq!(reused.sub_pool(), 0);
    assert!(reused.ptr() == a.ptr() || reused.ptr() == b.ptr());

    pool.deallocate_all();
}

#[test]
fn reverse_lookup_survives_growth_and_shrink() {
    let mut pool = new_pool();
    let mut rng = rand::rng();

    // Grow into sub-pool 5, then free a random half, then grow again:
    // lookups must always name the current owner.
    let mut allocations: Vec<Allocation> =
        (0..60).map(|_| pool.allocate().expect("out of memory")).collect();

    allocations.shuffle(&mut rng);
    for allocation in allocations.split_off(30) {
        // SAFETY: each slot is deallocated exactly once.
        unsafe { pool.deallocate_in(allocation.ptr().as_ptr(), allocation.sub_pool()) };
    }

    allocations.extend((0..40).map(|_| pool.allocate().expect("out of memory")));

    for allocation in &allocations {
        assert_eq!(pool.find_sub_pool_of(allocation.ptr()), allocation.sub_pool());

        let id = pool.ptr_to_id(allocation.ptr(), allocation.sub_pool());
        assert_eq!(pool.id_to_ptr(id), allocation.ptr());
    }

    pool.deallocate_all();
}

#[test]
fn random_churn_against_reference_set() {
    use rand::Rng;

    let mut pool = new_pool();
    let mut rng = rand::rng();

    let mut live: Vec<Allocation> = Vec::new();

    for round in 0..20_000_u32 {
        let grow = live.is_empty() || rng.random_ratio(3, 5);

        if grow {
            live.push(pool.allocate().expect("out of memory"));
        } else {
            let index = rng.random_range(0..live.len());
            let victim = live.swap_remove(index);
            // SAFETY: each slot is deallocated exactly once.
            unsafe { pool.deallocate(victim.ptr().as_ptr()) };
        }

        assert_eq!(pool.len(), live.len());

        if round % 2_000 == 0 {
            let swept: HashSet<NonNull<u8>> = pool.iter().collect();
            assert_eq!(swept.len(), live.len());
            assert!(live.iter().all(|allocation| swept.contains(&allocation.ptr())));
        }
    }

    pool.deallocate_all();
    assert!(pool.is_empty());
}

#[test]
fn million_element_sweep_and_delete() {
    const SIZE: usize = 1_000_000;

    let mut pool = new_pool();
    let mut rng = rand::rng();

    let mut victims: Vec<Allocation> =
        (0..SIZE).map(|_| pool.allocate().expect("out of memory")).collect();
    victims.shuffle(&mut rng);

    // Sweep the pool; at every visited slot, deallocate an unrelated slot
    // from the shuffled list and repair the cursor. Every slot that is still
    // live when the cursor would reach it must be visited exactly once.
    let mut visited: HashSet<NonNull<u8>> = HashSet::with_capacity(SIZE);
    let mut expected_visits = SIZE;
    let mut visits = 0_usize;

    let mut cursor = pool.cursor();
    // SAFETY: the cursor is repaired after every deallocation below.
    while let Some(slot) = unsafe { cursor.next(&pool) } {
        visits += 1;
        visited.insert(slot);

        let victim = victims.pop().expect("one victim per visit, so the list outlasts the sweep");
        if !visited.contains(&victim.ptr()) {
            // Deallocated before the cursor could reach it.
            expected_visits -= 1;
        }

        // SAFETY: each slot is deallocated exactly once, right here.
        unsafe { pool.deallocate_in(victim.ptr().as_ptr(), victim.sub_pool()) };
        cursor = cursor.fixed_after_deallocate(&pool, victim.ptr().as_ptr());
    }

    assert_eq!(visits, expected_visits);
    assert_eq!(visited.len(), visits, "no slot may be visited twice");

    // A second sweep drains whatever the shuffled deallocations left live.
    let mut dangling = 0_usize;
    let mut cursor = pool.cursor();
    // SAFETY: the cursor is repaired after every deallocation below.
    while let Some(slot) = unsafe { cursor.next(&pool) } {
        dangling += 1;
        // SAFETY: yielded slots are live.
        unsafe { pool.deallocate(slot.as_ptr()) };
        cursor = cursor.fixed_after_deallocate(&pool, slot.as_ptr());
    }

    assert_eq!(visits + dangling, SIZE);
    assert!(pool.is_empty());
}
