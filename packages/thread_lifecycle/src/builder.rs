use std::marker::PhantomData;

use crate::PoolAllocator;

/// Builder for creating an instance of [`PoolAllocator`].
///
/// You only need to use this builder if you want to customize the allocator configuration.
/// The default configuration used by [`PoolAllocator::new()`][1] is sufficient for most use
/// cases.
///
/// # Examples
///
/// ```
/// use thread_lifecycle::PoolAllocator;
///
/// let allocator = PoolAllocator::<[u8; 600]>::builder().page_scale(2).build();
/// assert_eq!(allocator.page_size(), 12_000);
/// ```
///
/// [1]: PoolAllocator::new
#[must_use]
pub struct PoolAllocatorBuilder<T> {
    page_scale: usize,

    _item: PhantomData<T>,
}

impl<T> std::fmt::Debug for PoolAllocatorBuilder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolAllocatorBuilder")
            .field(
                "item_type",
                &std::format_args!("{}", std::any::type_name::<T>()),
            )
            .field("page_scale", &self.page_scale)
            .finish()
    }
}

impl<T> PoolAllocatorBuilder<T> {
    pub(crate) fn new() -> Self {
        Self {
            page_scale: 1,
            _item: PhantomData,
        }
    }

    /// Multiplies the default page size for `T` by `factor`.
    ///
    /// Larger pages mean fewer, bigger trips to the host allocator. The default is 1.
    pub fn page_scale(mut self, factor: usize) -> Self {
        self.page_scale = factor;
        self
    }

    /// Builds the allocator with the specified configuration.
    ///
    /// # Panics
    ///
    /// Reports [`FatalCode::InvalidPageScale`][crate::FatalCode::InvalidPageScale] and panics
    /// if the page scale is zero or overflows the page size.
    #[must_use]
    pub fn build(self) -> PoolAllocator<T> {
        PoolAllocator::new_inner(self.page_scale)
    }
}
