use std::alloc::Layout;
use std::mem;

use crate::sub_pool::TailNode;
use crate::{DropPolicy, SweepPool};

/// Builder for creating an instance of [`SweepPool`].
///
/// [`SweepPool`] requires the slot memory layout to be specified at
/// construction time. Use either `.layout()` to provide a specific layout or
/// `.layout_of::<T>()` to generate a layout based on the provided type.
///
/// The layout is mandatory, whereas other settings are optional.
///
/// # Examples
///
/// ```
/// use std::alloc::Layout;
///
/// use sweep_pool::SweepPool;
///
/// // Using a specific layout.
/// let layout = Layout::from_size_align(32, 8).unwrap();
/// let pool = SweepPool::builder().layout(layout).build();
///
/// // Using type-based layout.
/// let pool = SweepPool::builder().layout_of::<[u64; 4]>().build();
/// ```
#[derive(Debug)]
#[must_use]
pub struct SweepPoolBuilder {
    slot_layout: Option<Layout>,
    drop_policy: DropPolicy,
}

impl SweepPoolBuilder {
    pub(crate) fn new() -> Self {
        Self {
            slot_layout: None,
            drop_policy: DropPolicy::default(),
        }
    }

    /// Sets the memory layout of the slots handed out by the pool.
    ///
    /// The free-space bookkeeping is embedded in the slots themselves while
    /// they are free, so the layout must be at least two machine words in
    /// size. The effective slot alignment is raised to a machine word if a
    /// smaller alignment is requested.
    ///
    /// # Panics
    ///
    /// Panics if the layout is smaller than two machine words.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::alloc::Layout;
    ///
    /// use sweep_pool::SweepPool;
    ///
    /// let layout = Layout::from_size_align(48, 16).unwrap();
    /// let pool = SweepPool::builder().layout(layout).build();
    /// ```
    pub fn layout(mut self, layout: Layout) -> Self {
        assert!(
            layout.size() >= mem::size_of::<TailNode>(),
            "SweepPool slots must be at least two machine words ({} bytes); free slots hold their own bookkeeping",
            mem::size_of::<TailNode>()
        );
        self.slot_layout = Some(layout);
        self
    }

    /// Sets the slot memory layout based on a type.
    ///
    /// This is a convenience method that automatically creates the layout for
    /// the given type.
    ///
    /// # Panics
    ///
    /// Panics if the type is smaller than two machine words.
    ///
    /// # Examples
    ///
    /// ```
    /// use sweep_pool::SweepPool;
    ///
    /// let pool = SweepPool::builder().layout_of::<String>().build();
    /// ```
    pub fn layout_of<T>(self) -> Self {
        self.layout(Layout::new::<T>())
    }

    /// Sets the [drop policy][DropPolicy] for the pool. This governs how
    /// to treat allocations that are still live when the pool is dropped.
    ///
    /// # Examples
    ///
    /// ```
    /// use sweep_pool::{DropPolicy, SweepPool};
    ///
    /// let pool = SweepPool::builder()
    ///     .layout_of::<[u64; 4]>()
    ///     .drop_policy(DropPolicy::MustNotDropAllocations)
    ///     .build();
    /// ```
    pub fn drop_policy(mut self, policy: DropPolicy) -> Self {
        self.drop_policy = policy;
        self
    }

    /// Builds the pool with the specified configuration.
    ///
    /// # Panics
    ///
    /// Panics if no layout has been set using either [`layout`](Self::layout)
    /// or [`layout_of`](Self::layout_of).
    ///
    /// # Examples
    ///
    /// ```
    /// use sweep_pool::SweepPool;
    ///
    /// let pool = SweepPool::builder().layout_of::<[usize; 2]>().build();
    /// ```
    #[must_use]
    pub fn build(self) -> SweepPool {
        let layout = self.slot_layout.expect(
            "a slot layout must be set using .layout() or .layout_of::<T>() before calling .build()",
        );
        SweepPool::new_inner(layout, self.drop_policy)
    }
}

#[cfg(test)]
mod tests {
    use std::alloc::Layout;

    use super::*;

    #[test]
    fn builds_with_type_layout() {
        let pool = SweepPool::builder().layout_of::<[u64; 4]>().build();
        assert_eq!(pool.item_layout(), Layout::new::<[u64; 4]>());
    }

    #[test]
    fn raises_alignment_to_word() {
        // Requested alignment of 1 must be raised so the embedded free-run
        // nodes stay aligned.
        let layout = Layout::from_size_align(32, 1).unwrap();
        let pool = SweepPool::builder().layout(layout).build();
        assert!(pool.slot_layout().align() >= align_of::<usize>());
    }

    #[test]
    #[should_panic]
    fn undersized_layout_is_panic() {
        let layout = Layout::from_size_align(8, 8).unwrap();
        drop(SweepPool::builder().layout(layout));
    }

    #[test]
    #[should_panic]
    fn missing_layout_is_panic() {
        drop(SweepPoolBuilder::new().build());
    }
}
