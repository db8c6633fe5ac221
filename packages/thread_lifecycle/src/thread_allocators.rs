use std::any::type_name;
use std::cell::RefCell;
use std::rc::Rc;

use crate::PoolAllocator;
use crate::fatal::{FatalCode, fatal};
use crate::slots::TypeSlots;

const COMPONENT: &str = "PoolAllocator";

/// The per-thread list of allocators, one per item type, in creation order.
struct ThreadAllocators {
    by_type: TypeSlots,
    in_creation_order: RefCell<Vec<Rc<dyn ErasedAllocator>>>,
}

/// What the list needs to know about an allocator without knowing its item type.
trait ErasedAllocator {
    fn reset(&self);
}

impl<T> ErasedAllocator for RefCell<PoolAllocator<T>> {
    fn reset(&self) {
        self.borrow_mut().reset();
    }
}

impl ThreadAllocators {
    fn new() -> Self {
        Self {
            by_type: TypeSlots::new(),
            in_creation_order: RefCell::new(Vec::new()),
        }
    }

    fn get_or_create<T>(&self) -> Rc<RefCell<PoolAllocator<T>>>
    where
        T: 'static,
    {
        let mut created = false;

        let allocator = self.by_type.get_or_insert_with(|| {
            created = true;
            RefCell::new(PoolAllocator::<T>::new())
        });

        if created {
            tracing::debug!(
                item_type = type_name::<T>(),
                "thread allocator created"
            );

            self.in_creation_order
                .borrow_mut()
                .push(Rc::clone(&allocator) as Rc<dyn ErasedAllocator>);
        }

        allocator
    }
}

thread_local! {
    static ALLOCATORS: ThreadAllocators = ThreadAllocators::new();
}

/// Executes `f` with the current thread's [`PoolAllocator`] for `T`, creating the allocator on
/// first use.
///
/// Each thread has its own allocator per item type, so this never blocks on other threads.
/// The allocator lives until the thread exits, at which point all of its pages are released.
/// Pointers from a thread's allocator must therefore not outlive the thread.
///
/// # Panics
///
/// Reports [`FatalCode::AllocatorReentered`] and panics if called from within `f` for the same
/// `T`, because the allocator is already in use. Also panics if called while the thread's
/// storage is being torn down.
///
/// # Example
///
/// ```
/// use thread_lifecycle::with_thread_allocator;
///
/// struct Hit {
///     energy: f64,
///     cell: u32,
/// }
///
/// let hit = with_thread_allocator::<Hit, _>(|allocator| {
///     allocator.emplace(Hit {
///         energy: 1.5,
///         cell: 7,
///     })
/// });
///
/// // ... later, on the same thread ...
///
/// let hit = with_thread_allocator::<Hit, _>(|allocator| {
///     // SAFETY: `hit` came from this thread's allocator for `Hit` and is released once.
///     unsafe { allocator.take(hit) }
/// });
/// assert_eq!(hit.cell, 7);
/// ```
pub fn with_thread_allocator<T, R>(f: impl FnOnce(&mut PoolAllocator<T>) -> R) -> R
where
    T: 'static,
{
    let allocator = ALLOCATORS.with(ThreadAllocators::get_or_create::<T>);

    let Ok(mut allocator) = allocator.try_borrow_mut() else {
        fatal(
            COMPONENT,
            FatalCode::AllocatorReentered,
            format!(
                "the thread allocator for {} is already in use further up the call stack",
                type_name::<T>()
            ),
        );
    };

    f(&mut allocator)
}

/// Resets every allocator the current thread has created, releasing all their pages.
///
/// This is how a worker gives memory back between runs without exiting.
///
/// # Panics
///
/// Reports [`FatalCode::AllocatorResetWhileInUse`][crate::FatalCode::AllocatorResetWhileInUse]
/// and panics if any of the allocators still has live objects.
pub fn reset_thread_allocators() {
    // Snapshot so that the list is not borrowed while allocators reset.
    let allocators = ALLOCATORS.with(|list| list.in_creation_order.borrow().clone());

    for allocator in allocators {
        allocator.reset();
    }
}

/// Number of allocators (item types) the current thread has created.
#[must_use]
pub fn thread_allocator_count() -> usize {
    ALLOCATORS.with(|list| list.in_creation_order.borrow().len())
}
