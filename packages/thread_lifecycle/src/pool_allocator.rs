use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::thread;

use crate::PoolAllocatorBuilder;
use crate::fatal::{FatalCode, fatal};
use crate::page::{FreeList, PageChain, SlotLayout, default_page_size};

const COMPONENT: &str = "PoolAllocator";

/// A paged free-list allocator for objects of type `T`.
///
/// Storage comes from a growable chain of fixed-size pages, sliced into one slot per object.
/// Freed slots go onto an intrusive free list and are handed out again before any new page is
/// allocated, so both [`allocate()`][Self::allocate] and [`deallocate()`][Self::deallocate]
/// are O(1) once the allocator has warmed up.
///
/// The allocator keeps no bookkeeping beyond the free list and a few counters. Pages are only
/// released all at once, on [`reset()`][Self::reset] or when the allocator is dropped.
///
/// # Page size
///
/// Items smaller than 512 bytes get 1024-byte pages; larger items get pages holding ten of
/// them. [`set_page_scale()`][Self::set_page_scale] or the [builder][Self::builder] multiply
/// this.
///
/// # Thread safety
///
/// The allocator is single-threaded: it is neither `Send` nor `Sync`. The usual way to get
/// one is [`with_thread_allocator()`][crate::with_thread_allocator], which maintains one
/// instance per thread per item type.
///
/// # Example
///
/// ```
/// use thread_lifecycle::PoolAllocator;
///
/// let mut allocator = PoolAllocator::<[f64; 3]>::new();
///
/// let position = allocator.emplace([1.0, 2.0, 3.0]);
/// assert_eq!(allocator.page_count(), 1);
///
/// // SAFETY: `position` was allocated above and is released exactly once.
/// let value = unsafe { allocator.take(position) };
/// assert_eq!(value, [1.0, 2.0, 3.0]);
///
/// allocator.reset();
/// assert_eq!(allocator.page_count(), 0);
/// ```
pub struct PoolAllocator<T> {
    pages: PageChain,
    free: FreeList,

    /// Slots currently handed out to callers.
    live: usize,

    /// Highest value `live` reached since construction or the last reset.
    high_water: usize,

    _item: PhantomData<T>,
}

impl<T> PoolAllocator<T> {
    /// Creates an allocator with the default page size for `T`.
    ///
    /// No memory is allocated until the first [`allocate()`][Self::allocate].
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts building an allocator with custom configuration.
    ///
    /// # Example
    ///
    /// ```
    /// use thread_lifecycle::PoolAllocator;
    ///
    /// let allocator = PoolAllocator::<u64>::builder().page_scale(4).build();
    /// assert_eq!(allocator.page_size(), 4096);
    /// ```
    pub fn builder() -> PoolAllocatorBuilder<T> {
        PoolAllocatorBuilder::new()
    }

    #[must_use]
    pub(crate) fn new_inner(page_scale: usize) -> Self {
        let page_size = scaled_page_size(default_page_size::<T>(), page_scale);

        Self {
            pages: PageChain::new(SlotLayout::of::<T>(), page_size),
            free: FreeList::default(),
            live: 0,
            high_water: 0,
            _item: PhantomData,
        }
    }

    /// Returns uninitialized storage for one `T`.
    ///
    /// Reuses the most recently freed slot if there is one, otherwise grows by one page.
    /// The returned pointer is properly aligned, distinct from every other live pointer of this
    /// allocator and valid until deallocated or until the allocator is reset or dropped.
    ///
    /// If the host allocator is exhausted, this reports [`FatalCode::AllocationFailed`] and
    /// terminates the process.
    #[inline]
    #[must_use]
    pub fn allocate(&mut self) -> NonNull<T> {
        // SAFETY: The free list only ever holds vacant slots of pages in `self.pages`, which
        // are not released while they are on the list (reset clears the list with the pages).
        let slot = match unsafe { self.free.pop() } {
            Some(slot) => slot,
            None => self.grow_and_pop(),
        };

        self.live = self
            .live
            .checked_add(1)
            .expect("live count is bounded by memory size");
        self.high_water = self.high_water.max(self.live);

        slot.cast()
    }

    #[cold]
    fn grow_and_pop(&mut self) -> NonNull<u8> {
        self.pages.grow(&mut self.free);

        // SAFETY: See `allocate()`.
        unsafe { self.free.pop() }.expect("a freshly added page always has vacant slots")
    }

    /// Returns a slot to the free list. No destructor runs.
    ///
    /// # Safety
    ///
    /// * `ptr` must have been returned by [`allocate()`][Self::allocate] of this same allocator
    ///   and not deallocated since.
    /// * The allocator must not have been reset since `ptr` was allocated.
    /// * Whatever object lived in the slot must already be finalized (dropped or moved out)
    ///   and no references to it may remain.
    ///
    /// # Panics
    ///
    /// Reports [`FatalCode::DoubleFree`] and panics if no slot is live. This catches a double
    /// free only when it is not masked by other live slots.
    #[inline]
    pub unsafe fn deallocate(&mut self, ptr: NonNull<T>) {
        let Some(live) = self.live.checked_sub(1) else {
            fatal(
                COMPONENT,
                FatalCode::DoubleFree,
                format!(
                    "deallocation from PoolAllocator<{}> with no live objects",
                    type_name::<T>()
                ),
            );
        };

        // SAFETY: Forwarding the caller's guarantee that this is a live slot of one of our
        // pages. Live slots are never on the free list.
        unsafe {
            self.free.push(ptr.cast());
        }

        self.live = live;
    }

    /// Allocates a slot and moves `value` into it.
    #[must_use]
    pub fn emplace(&mut self, value: T) -> NonNull<T> {
        let ptr = self.allocate();

        // SAFETY: The slot is freshly allocated, aligned and sized for `T`.
        unsafe {
            ptr.write(value);
        }

        ptr
    }

    /// Moves the object out of its slot and deallocates the slot.
    ///
    /// # Safety
    ///
    /// Same as [`deallocate()`][Self::deallocate], except that the slot must contain an
    /// initialized `T`, which this takes ownership of.
    #[must_use]
    pub unsafe fn take(&mut self, ptr: NonNull<T>) -> T {
        // SAFETY: The caller guarantees the slot holds an initialized `T` that nobody else
        // references. We move it out, leaving the slot logically uninitialized.
        let value = unsafe { ptr.read() };

        // SAFETY: Forwarding the caller's guarantee; the object was just moved out.
        unsafe {
            self.deallocate(ptr);
        }

        value
    }

    /// Releases every page, returning the allocator to its just-constructed state.
    ///
    /// # Panics
    ///
    /// Reports [`FatalCode::AllocatorResetWhileInUse`] and panics if any slot is still live.
    pub fn reset(&mut self) {
        if self.live != 0 {
            fatal(
                COMPONENT,
                FatalCode::AllocatorResetWhileInUse,
                format!(
                    "reset of PoolAllocator<{}> with {} live objects",
                    type_name::<T>(),
                    self.live
                ),
            );
        }

        self.free.clear();
        self.pages.release_all();
        self.high_water = 0;
    }

    /// Multiplies the page size used for future growth by `factor`, after an implied
    /// [`reset()`][Self::reset].
    ///
    /// # Panics
    ///
    /// Reports [`FatalCode::AllocatorReconfiguredInUse`] and panics if any slot is still live.
    /// Reports [`FatalCode::InvalidPageScale`] and panics if `factor` is zero or the scaled page
    /// size overflows.
    pub fn set_page_scale(&mut self, factor: usize) {
        if self.live != 0 {
            fatal(
                COMPONENT,
                FatalCode::AllocatorReconfiguredInUse,
                format!(
                    "page scale change of PoolAllocator<{}> with {} live objects",
                    type_name::<T>(),
                    self.live
                ),
            );
        }

        self.reset();

        let page_size = scaled_page_size(self.pages.page_size(), factor);
        self.pages.set_page_size(page_size);
    }

    /// Total bytes of slot storage across all pages.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.pages
            .count()
            .checked_mul(self.pages.page_size())
            .expect("bytes actually allocated cannot overflow usize")
    }

    /// Number of pages currently held.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.count()
    }

    /// Bytes of slot storage per page.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.pages.page_size()
    }

    /// Bytes occupied by one slot: the size of `T`, raised to fit a free-list link and rounded
    /// to alignment.
    #[must_use]
    pub fn slot_size(&self) -> usize {
        SlotLayout::of::<T>().size()
    }

    /// Number of slots each page is sliced into.
    #[must_use]
    pub fn slots_per_page(&self) -> usize {
        self.pages.slots_per_page()
    }

    /// Number of slots currently handed out.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// The highest [`live_count()`][Self::live_count] since construction or the last reset.
    #[must_use]
    pub fn high_water_count(&self) -> usize {
        self.high_water
    }
}

fn scaled_page_size(page_size: usize, factor: usize) -> usize {
    match page_size.checked_mul(factor) {
        Some(scaled) if scaled != 0 => scaled,
        _ => fatal(
            COMPONENT,
            FatalCode::InvalidPageScale,
            format!("cannot scale page size {page_size} by {factor}"),
        ),
    }
}

impl<T> Default for PoolAllocator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for PoolAllocator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolAllocator")
            .field("item_type", &format_args!("{}", type_name::<T>()))
            .field("page_size", &self.pages.page_size())
            .field("page_count", &self.pages.count())
            .field("live", &self.live)
            .field("high_water", &self.high_water)
            .finish_non_exhaustive()
    }
}

impl<T> Drop for PoolAllocator<T> {
    #[cfg_attr(test, mutants::skip)] // Only logs, there is nothing to observe.
    fn drop(&mut self) {
        // The pages are released by the chain itself. We only complain about it.
        if self.live != 0 && !thread::panicking() {
            tracing::warn!(
                item_type = type_name::<T>(),
                live = self.live,
                "pool allocator dropped with live objects, their storage is released"
            );
        }
    }
}
