//! An iteratable object pool: fixed-layout slot storage whose live slots can
//! be enumerated by a linear sweep of its backing buffers.
//!
//! This crate provides [`SweepPool`], an allocator for slots of one
//! [`std::alloc::Layout`] chosen at construction. General-purpose heaps
//! cannot efficiently answer "give me every object I allocated" without a
//! container maintained on the side - a vector or hash set that costs extra
//! memory, hashing on every allocate/deallocate, and a second dereference per
//! element when iterating. `SweepPool` collapses that container into the
//! allocator: its free-space bookkeeping lives *inside* the free slots and
//! doubles as a skip structure, so a plain forward scan of the buffers visits
//! exactly the live slots, crossing any range of free ones in a single jump.
//!
//! # Key Features
//!
//! - **O(1) amortized allocate, deallocate, and iteration step**
//! - **Iteration without a side container**: [`SweepPool::iter`] yields every
//!   live slot in address order
//! - **Stable addresses**: slots never move while they are live, so pointers
//!   into the pool stay valid until the matching deallocation
//! - **Dense ids**: each slot has a contiguous integer id ([`SweepPool::ptr_to_id`],
//!   [`SweepPool::id_to_ptr`]) - one word to store, and it survives
//!   serialization where a pointer would not
//! - **Geometric buffers**: capacity grows by doubling sub-pools, at most one
//!   of which is speculatively retained when it empties
//! - **Mutate while sweeping**: a detached [`SweepCursor`] supports
//!   allocation and deallocation mid-traversal through constant-time repair
//!   operations
//!
//! # Examples
//!
//! Allocate, sweep, deallocate:
//!
//! ```
//! use sweep_pool::SweepPool;
//!
//! let mut pool = SweepPool::builder().layout_of::<[u64; 4]>().build();
//!
//! let a = pool.allocate().expect("out of memory");
//! let b = pool.allocate().expect("out of memory");
//!
//! // SAFETY: freshly allocated slots may be written through their pointers.
//! unsafe {
//!     a.ptr().cast::<[u64; 4]>().write([1, 2, 3, 4]);
//!     b.ptr().cast::<[u64; 4]>().write([5, 6, 7, 8]);
//! }
//!
//! // The sweep finds both values without any container tracking them.
//! let sum: u64 = pool
//!     .iter()
//!     // SAFETY: yielded slots are live and were initialized above.
//!     .map(|slot| unsafe { slot.cast::<[u64; 4]>().as_ref()[0] })
//!     .sum();
//! assert_eq!(sum, 6);
//!
//! pool.deallocate_all();
//! ```
//!
//! Typed storage through the thin construct/drop layer:
//!
//! ```
//! use sweep_pool::SweepPool;
//!
//! let mut pool = SweepPool::builder().layout_of::<String>().build();
//!
//! // SAFETY: String is the layout the pool was built with.
//! let name = unsafe { pool.insert("sweep".to_string()) }.expect("out of memory");
//!
//! // SAFETY: the value is live; the pool hands out no references itself.
//! assert_eq!(unsafe { name.as_ref() }.len(), 5);
//!
//! // SAFETY: inserted as a String and not removed before.
//! unsafe { pool.remove(name) };
//! assert!(pool.is_empty());
//! ```

mod bits;
mod builder;
mod coordinates;
mod cursor;
mod drop_policy;
mod pool;
mod sorted_index;
mod sub_pool;

pub use builder::SweepPoolBuilder;
pub use cursor::{Iter, SweepCursor};
pub use drop_policy::DropPolicy;
pub use pool::{Allocation, SweepPool};
