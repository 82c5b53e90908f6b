/// Determines how the pool reacts to live allocations when it is dropped.
///
/// By default the pool silently releases its backing buffers. The pool is
/// byte-level storage and runs no destructors, so any values the caller placed
/// in still-live slots (for example via [`insert()`][crate::SweepPool::insert])
/// are discarded without being dropped.
///
/// # Examples
///
/// ```
/// use sweep_pool::{DropPolicy, SweepPool};
///
/// // The drop policy is set at pool creation time.
/// let pool = SweepPool::builder()
///     .layout_of::<[u64; 4]>()
///     .drop_policy(DropPolicy::MustNotDropAllocations)
///     .build();
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum DropPolicy {
    /// The pool releases its buffers on drop even if allocations are still
    /// live. This is the default.
    #[default]
    MayDropAllocations,

    /// The pool panics if any allocation is still live when it is dropped.
    ///
    /// This may be valuable when values with destructors are stored through
    /// the typed layer, or when unsafe code holds out-of-band pointers into
    /// the pool: it turns a forgotten deallocation into a loud failure
    /// instead of a silent leak.
    MustNotDropAllocations,
}
