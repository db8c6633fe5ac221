use std::alloc::{Layout, alloc, dealloc, handle_alloc_error};
use std::ptr::NonNull;

use crate::fatal::{FatalCode, report};

const COMPONENT: &str = "PoolAllocator";

/// Items smaller than this share fixed-size pages.
const SMALL_ITEM_LIMIT: usize = 512;

/// Page size used for items below [`SMALL_ITEM_LIMIT`].
const SMALL_ITEM_PAGE_SIZE: usize = 1024;

/// Large items get a page sized for this many of them.
const LARGE_ITEMS_PER_PAGE: usize = 10;

/// The page size a fresh allocator uses for items of type `T`, before any scaling.
#[must_use]
pub(crate) fn default_page_size<T>() -> usize {
    if size_of::<T>() < SMALL_ITEM_LIMIT {
        SMALL_ITEM_PAGE_SIZE
    } else {
        size_of::<T>()
            .checked_mul(LARGE_ITEMS_PER_PAGE)
            .expect("an item that large could never be allocated in the first place")
    }
}

/// Link stored in the first bytes of a vacant slot. While a slot is vacant, this is the only
/// thing it contains.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
struct FreeSlot {
    next: Option<NonNull<FreeSlot>>,
}

/// Link stored at the start of every page.
#[derive(Debug)]
#[repr(C)]
struct PageHeader {
    next: Option<NonNull<PageHeader>>,
}

/// Size and alignment of one slot. Every slot can hold either an item or a [`FreeSlot`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct SlotLayout {
    size: usize,
    align: usize,
}

impl SlotLayout {
    #[must_use]
    pub(crate) fn of<T>() -> Self {
        let align = align_of::<T>().max(align_of::<FreeSlot>());
        let size = size_of::<T>()
            .max(size_of::<FreeSlot>())
            .next_multiple_of(align);

        Self { size, align }
    }

    #[must_use]
    pub(crate) fn size(self) -> usize {
        self.size
    }
}

/// The intrusive list of vacant slots. Think of it as a stack of the most recently freed slots,
/// with the stack links stored in the slots themselves.
#[derive(Debug, Default)]
pub(crate) struct FreeList {
    head: Option<NonNull<FreeSlot>>,
}

impl FreeList {
    /// # Safety
    ///
    /// Every slot reachable from the head must be a vacant slot inside a page that has
    /// not been released.
    #[inline]
    pub(crate) unsafe fn pop(&mut self) -> Option<NonNull<u8>> {
        let slot = self.head?;

        // SAFETY: Forwarding the caller's guarantee that the slot is vacant and therefore
        // contains a valid `FreeSlot`.
        self.head = unsafe { slot.read() }.next;

        Some(slot.cast())
    }

    /// # Safety
    ///
    /// `slot` must be the start of a slot inside a page that has not been released, and must not
    /// already be on the list. The slot must be suitably sized and aligned for a [`FreeSlot`],
    /// which every slot laid out with [`SlotLayout`] is.
    #[inline]
    pub(crate) unsafe fn push(&mut self, slot: NonNull<u8>) {
        let slot = slot.cast::<FreeSlot>();

        // SAFETY: Forwarding the caller's guarantee that the slot is valid for writes of a
        // `FreeSlot` and not reachable from the list, so we are not corrupting any link.
        unsafe {
            slot.write(FreeSlot { next: self.head });
        }

        self.head = Some(slot);
    }

    pub(crate) fn clear(&mut self) {
        self.head = None;
    }

    /// Counts the vacant slots by walking the list.
    ///
    /// # Safety
    ///
    /// Same as [`pop()`][Self::pop].
    #[cfg(test)]
    pub(crate) unsafe fn len(&self) -> usize {
        let mut count: usize = 0;
        let mut current = self.head;

        while let Some(slot) = current {
            count = count.checked_add(1).expect("guarded by memory size");

            // SAFETY: Forwarding the caller's guarantee.
            current = unsafe { slot.read() }.next;
        }

        count
    }
}

/// The chain of pages backing one allocator instance.
///
/// Pages are only ever released all at once, by [`release_all()`][Self::release_all] or by
/// dropping the chain.
#[derive(Debug)]
pub(crate) struct PageChain {
    head: Option<NonNull<PageHeader>>,
    count: usize,
    slot: SlotLayout,

    /// Bytes of slot storage per page, excluding the page header.
    page_size: usize,
}

impl PageChain {
    /// # Panics
    ///
    /// Panics if a page could not hold even one slot.
    #[must_use]
    pub(crate) fn new(slot: SlotLayout, page_size: usize) -> Self {
        assert!(
            page_size >= slot.size,
            "page size {page_size} cannot hold a slot of {} bytes",
            slot.size
        );

        Self {
            head: None,
            count: 0,
            slot,
            page_size,
        }
    }

    #[must_use]
    pub(crate) fn count(&self) -> usize {
        self.count
    }

    #[must_use]
    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub(crate) fn slots_per_page(&self) -> usize {
        self.page_size
            .checked_div(self.slot.size)
            .expect("slot size is never zero because a slot always fits a FreeSlot")
    }

    /// Changes the page size for future pages. Only valid while the chain holds no pages.
    pub(crate) fn set_page_size(&mut self, page_size: usize) {
        assert!(
            self.head.is_none(),
            "page size can only be changed while no pages are allocated"
        );

        *self = Self::new(self.slot, page_size);
    }

    /// Offset of the first slot from the start of the page.
    fn slots_offset(&self) -> usize {
        size_of::<PageHeader>().next_multiple_of(self.slot.align)
    }

    fn page_layout(&self) -> Layout {
        let size = self
            .slots_offset()
            .checked_add(self.page_size)
            .expect("page size is bounded by the configured scale and item size");
        let align = self.slot.align.max(align_of::<PageHeader>());

        Layout::from_size_align(size, align).expect("page layout must be calculable")
    }

    /// Allocates one more page, links it onto the chain and pushes all of its slots onto
    /// `free`, in address order.
    ///
    /// Memory exhaustion is reported as fatal and then terminates the process.
    pub(crate) fn grow(&mut self, free: &mut FreeList) {
        let layout = self.page_layout();

        // SAFETY: The layout is not zero-sized because a page holds at least one slot.
        let Some(page) = NonNull::new(unsafe { alloc(layout) }) else {
            report(
                COMPONENT,
                FatalCode::AllocationFailed,
                format!(
                    "could not allocate page {} of {} bytes",
                    self.count,
                    layout.size()
                ),
            );
            handle_alloc_error(layout);
        };

        let header = page.cast::<PageHeader>();

        // SAFETY: The page is freshly allocated, valid for writes and aligned for the header
        // because the layout alignment is at least the header alignment.
        unsafe {
            header.write(PageHeader { next: self.head });
        }

        self.head = Some(header);
        self.count = self
            .count
            .checked_add(1)
            .expect("page count is bounded by memory size");

        // SAFETY: The offset lies within the allocation because the layout size is the offset
        // plus a non-zero page size.
        let first_slot = unsafe { page.add(self.slots_offset()) };

        // Push in reverse so the first slot ends up at the head of the list.
        for index in (0..self.slots_per_page()).rev() {
            let offset = index
                .checked_mul(self.slot.size)
                .expect("offset is within the page size, which did not overflow");

            // SAFETY: `offset + slot size <= page_size`, so the slot lies within the page.
            let slot = unsafe { first_slot.add(offset) };

            // SAFETY: The slot is within a live page of this chain, is aligned because both the
            // slots offset and the slot size are multiples of the slot alignment, and is not on
            // the list because the page is brand new.
            unsafe {
                free.push(slot);
            }
        }

        tracing::trace!(
            page_count = self.count,
            page_size = self.page_size,
            slots = self.slots_per_page(),
            "allocator page added"
        );
    }

    /// Releases every page. Any slot pointers into the pages become dangling.
    pub(crate) fn release_all(&mut self) {
        let layout = self.page_layout();
        let mut current = self.head.take();

        while let Some(header) = current {
            // SAFETY: Every page on the chain starts with an initialized header.
            current = unsafe { header.as_ref() }.next;

            // SAFETY: The page was allocated in `grow()` with this same layout because the
            // layout only depends on fields that cannot change while pages exist.
            unsafe {
                dealloc(header.as_ptr().cast(), layout);
            }
        }

        self.count = 0;
    }
}

impl Drop for PageChain {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn page_size_policy() {
        assert_eq!(default_page_size::<u64>(), 1024);
        assert_eq!(default_page_size::<[u8; 511]>(), 1024);
        assert_eq!(default_page_size::<[u8; 512]>(), 5120);
        assert_eq!(default_page_size::<[u8; 1000]>(), 10_000);
    }

    #[test]
    fn slot_fits_link() {
        let link = size_of::<Option<NonNull<u8>>>();

        assert_eq!(SlotLayout::of::<u8>().size(), link);
        assert_eq!(SlotLayout::of::<()>().size(), link);
        assert_eq!(SlotLayout::of::<[u64; 3]>().size(), 24);
    }

    #[test]
    fn slot_respects_alignment() {
        #[repr(align(64))]
        #[allow(dead_code, reason = "only the layout matters, never constructed")]
        struct Aligned(u8);

        let layout = SlotLayout::of::<Aligned>();
        assert_eq!(layout.size(), 64);
        assert_eq!(layout.align, 64);
    }

    #[test]
    fn grow_fills_free_list() {
        let slot = SlotLayout::of::<u64>();
        let mut chain = PageChain::new(slot, 1024);
        let mut free = FreeList::default();

        chain.grow(&mut free);

        assert_eq!(chain.count(), 1);
        assert_eq!(chain.slots_per_page(), 128);

        // SAFETY: The list only holds slots of the live page.
        assert_eq!(unsafe { free.len() }, 128);

        let mut seen = HashSet::new();

        // SAFETY: The list only holds slots of the live page.
        while let Some(slot) = unsafe { free.pop() } {
            assert_eq!(slot.as_ptr() as usize % slot_align(), 0);
            assert!(seen.insert(slot));
        }

        assert_eq!(seen.len(), 128);

        chain.release_all();
        assert_eq!(chain.count(), 0);
    }

    #[test]
    fn slots_handed_out_in_address_order() {
        let mut chain = PageChain::new(SlotLayout::of::<u32>(), 64);
        let mut free = FreeList::default();
        chain.grow(&mut free);

        // SAFETY: The list only holds slots of the live page.
        let first = unsafe { free.pop() }.unwrap();
        // SAFETY: As above.
        let second = unsafe { free.pop() }.unwrap();

        assert_eq!(second.as_ptr() as usize - first.as_ptr() as usize, 8);
    }

    #[test]
    fn push_then_pop_is_lifo() {
        let mut chain = PageChain::new(SlotLayout::of::<u64>(), 1024);
        let mut free = FreeList::default();
        chain.grow(&mut free);

        // SAFETY: The list only holds slots of the live page.
        let a = unsafe { free.pop() }.unwrap();
        // SAFETY: As above.
        let b = unsafe { free.pop() }.unwrap();

        // SAFETY: Both slots belong to the live page and were popped, so are not on the list.
        unsafe {
            free.push(a);
        }
        // SAFETY: As above.
        unsafe {
            free.push(b);
        }

        // SAFETY: The list only holds slots of the live page.
        assert_eq!(unsafe { free.pop() }, Some(b));
        // SAFETY: As above.
        assert_eq!(unsafe { free.pop() }, Some(a));
    }

    #[test]
    #[should_panic]
    fn page_smaller_than_slot_panics() {
        drop(PageChain::new(SlotLayout::of::<[u64; 8]>(), 32));
    }

    fn slot_align() -> usize {
        align_of::<FreeSlot>()
    }
}
