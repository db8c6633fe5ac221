use std::any::type_name;
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use crate::fatal::{FatalCode, fatal};
use crate::slots::TypeSlots;
use crate::with_type_lock;

const COMPONENT: &str = "WorkspacePool";

/// Per-thread working state with an explicit lifecycle, managed by a [`WorkspacePool`].
///
/// A workspace is "current" between [`activate()`][Self::activate] and
/// [`deactivate()`][Self::deactivate]. Any ambient state a workspace installs (registering
/// itself with thread-local services, swapping in per-thread tables, ...) belongs in these two
/// methods and nowhere else.
///
/// The pool hands out shared `Rc<T>` handles, so the methods take `&self`. Use interior
/// mutability for any state they change.
pub trait Workspace {
    /// Makes this workspace current on the calling thread.
    fn activate(&self);

    /// Undoes [`activate()`][Self::activate].
    fn deactivate(&self);

    /// Final cleanup before the workspace is dropped by
    /// [`WorkspacePool::destroy_all()`]. Not called when the workspace is recycled.
    fn teardown(&self);
}

/// The calling thread's workspace of one type plus whether it is current.
struct WorkspaceSlot<T> {
    workspace: Rc<T>,
    active: Cell<bool>,
}

thread_local! {
    static WORKSPACES: TypeSlots = TypeSlots::new();
}

/// Maintains at most one workspace of type `T` per thread.
///
/// The pool itself only holds the factory used to create workspaces. The workspaces live in
/// thread-local storage keyed by `T`, so all pools for the same `T` share the same per-thread
/// instance. The typical pool is a `static`.
///
/// A thread that exits without calling [`destroy_all()`][Self::destroy_all] drops its
/// workspace without calling [`Workspace::teardown()`].
///
/// # Example
///
/// ```
/// use std::cell::Cell;
///
/// use thread_lifecycle::{Workspace, WorkspacePool};
///
/// #[derive(Default)]
/// struct TrackingScratch {
///     current: Cell<bool>,
///     steps: Cell<u64>,
/// }
///
/// impl Workspace for TrackingScratch {
///     fn activate(&self) {
///         self.current.set(true);
///     }
///
///     fn deactivate(&self) {
///         self.current.set(false);
///     }
///
///     fn teardown(&self) {
///         self.steps.set(0);
///     }
/// }
///
/// static TRACKING: WorkspacePool<TrackingScratch> = WorkspacePool::new(TrackingScratch::default);
///
/// let scratch = TRACKING.find_or_create();
/// assert!(scratch.current.get());
/// scratch.steps.set(scratch.steps.get() + 1);
///
/// // Later calls on the same thread see the same instance.
/// assert_eq!(TRACKING.find_or_create().steps.get(), 1);
///
/// TRACKING.destroy_all();
/// assert!(TRACKING.get().is_none());
/// ```
pub struct WorkspacePool<T> {
    factory: fn() -> T,
}

impl<T> WorkspacePool<T>
where
    T: Workspace + 'static,
{
    /// Creates a pool that builds workspaces with `factory`.
    ///
    /// The factory runs on the thread that will own the workspace, while holding the
    /// [type-keyed lock][crate::lock_for] for `T`. Factories that copy from state shared with
    /// other threads (typically data prepared by the master) are therefore serialized.
    #[must_use]
    pub const fn new(factory: fn() -> T) -> Self {
        Self { factory }
    }

    /// Creates the calling thread's workspace, without activating it.
    ///
    /// # Panics
    ///
    /// Reports [`FatalCode::WorkspaceAlreadyExists`] and panics if the calling thread already
    /// has a workspace of type `T`.
    pub fn create(&self) -> Rc<T> {
        if WORKSPACES.with(TypeSlots::contains::<WorkspaceSlot<T>>) {
            fatal(
                COMPONENT,
                FatalCode::WorkspaceAlreadyExists,
                format!(
                    "the current thread already has a workspace of type {}",
                    type_name::<T>()
                ),
            );
        }

        let workspace = Rc::new(with_type_lock::<T, _>(self.factory));

        let slot = WORKSPACES.with(|slots| {
            slots.get_or_insert_with(|| WorkspaceSlot {
                workspace,
                active: Cell::new(false),
            })
        });

        tracing::debug!(workspace_type = type_name::<T>(), "workspace created");

        Rc::clone(&slot.workspace)
    }

    /// Creates the calling thread's workspace and activates it.
    ///
    /// # Panics
    ///
    /// Reports [`FatalCode::WorkspaceAlreadyExists`] and panics if the calling thread already
    /// has a workspace of type `T`.
    pub fn create_and_activate(&self) -> Rc<T> {
        let workspace = self.create();

        let slot = Self::current_slot().expect("we just created the workspace");
        Self::ensure_active(&slot);

        workspace
    }

    /// Returns the calling thread's workspace, activating it if it is not current. Creates and
    /// activates a new one if the thread has none.
    pub fn find_or_create(&self) -> Rc<T> {
        match Self::current_slot() {
            Some(slot) => {
                Self::ensure_active(&slot);
                Rc::clone(&slot.workspace)
            }
            None => self.create_and_activate(),
        }
    }

    /// The calling thread's workspace, if it has one.
    #[must_use]
    pub fn get(&self) -> Option<Rc<T>> {
        Self::current_slot().map(|slot| Rc::clone(&slot.workspace))
    }

    /// Whether the calling thread has a workspace and it is current.
    #[must_use]
    pub fn is_active(&self) -> bool {
        Self::current_slot().is_some_and(|slot| slot.active.get())
    }

    /// Deactivates and drops the calling thread's workspace, given a handle to it.
    ///
    /// Teardown is not called. The next [`find_or_create()`][Self::find_or_create] on this
    /// thread builds a fresh workspace.
    ///
    /// # Panics
    ///
    /// Reports [`FatalCode::WorkspaceNotOwned`] and panics if `workspace` is not the calling
    /// thread's workspace of type `T`.
    pub fn recycle(&self, workspace: Rc<T>) {
        let owned =
            Self::current_slot().is_some_and(|slot| Rc::ptr_eq(&slot.workspace, &workspace));

        if !owned {
            fatal(
                COMPONENT,
                FatalCode::WorkspaceNotOwned,
                format!(
                    "recycled a workspace of type {} that the current thread does not own",
                    type_name::<T>()
                ),
            );
        }

        workspace.deactivate();

        let slot = WORKSPACES.with(TypeSlots::remove::<WorkspaceSlot<T>>);

        tracing::debug!(workspace_type = type_name::<T>(), "workspace recycled");

        drop(slot);
        drop(workspace);
    }

    /// Tears down and drops the calling thread's workspace. Does nothing if there is none.
    pub fn destroy_all(&self) {
        let Some(slot) = WORKSPACES.with(TypeSlots::remove::<WorkspaceSlot<T>>) else {
            return;
        };

        slot.workspace.teardown();

        tracing::debug!(workspace_type = type_name::<T>(), "workspace destroyed");
    }

    fn current_slot() -> Option<Rc<WorkspaceSlot<T>>> {
        WORKSPACES.with(TypeSlots::get::<WorkspaceSlot<T>>)
    }

    fn ensure_active(slot: &WorkspaceSlot<T>) {
        if !slot.active.replace(true) {
            slot.workspace.activate();
        }
    }
}

impl<T> fmt::Debug for WorkspacePool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkspacePool")
            .field("workspace_type", &format_args!("{}", type_name::<T>()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::cell::RefCell;
    use std::thread;

    use static_assertions::assert_impl_all;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: RefCell<Vec<&'static str>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<&'static str> {
            self.events.borrow().clone()
        }
    }

    impl Workspace for Recorder {
        fn activate(&self) {
            self.events.borrow_mut().push("activate");
        }

        fn deactivate(&self) {
            self.events.borrow_mut().push("deactivate");
        }

        fn teardown(&self) {
            self.events.borrow_mut().push("teardown");
        }
    }

    static RECORDERS: WorkspacePool<Recorder> = WorkspacePool::new(Recorder::default);

    assert_impl_all!(WorkspacePool<Recorder>: Send, Sync);

    fn on_new_thread(f: impl FnOnce() + Send + 'static) {
        thread::spawn(f).join().unwrap();
    }

    #[test]
    fn create_does_not_activate() {
        on_new_thread(|| {
            let workspace = RECORDERS.create();

            assert!(workspace.events().is_empty());
            assert!(!RECORDERS.is_active());
            assert!(Rc::ptr_eq(&workspace, &RECORDERS.get().unwrap()));
        });
    }

    #[test]
    fn find_or_create_returns_same_instance() {
        on_new_thread(|| {
            let first = RECORDERS.find_or_create();
            let second = RECORDERS.find_or_create();

            assert!(Rc::ptr_eq(&first, &second));
            assert_eq!(first.events(), ["activate"]);
            assert!(RECORDERS.is_active());
        });
    }

    #[test]
    fn find_or_create_activates_existing() {
        on_new_thread(|| {
            let created = RECORDERS.create();
            let found = RECORDERS.find_or_create();

            assert!(Rc::ptr_eq(&created, &found));
            assert_eq!(found.events(), ["activate"]);
        });
    }

    #[test]
    fn each_thread_has_own_workspace() {
        on_new_thread(|| {
            let mine = RECORDERS.find_or_create();

            thread::spawn(|| {
                assert!(RECORDERS.get().is_none());
                RECORDERS.find_or_create();
            })
            .join()
            .unwrap();

            assert!(Rc::ptr_eq(&mine, &RECORDERS.get().unwrap()));
        });
    }

    #[test]
    fn destroy_all_tears_down_and_is_idempotent() {
        on_new_thread(|| {
            let workspace = RECORDERS.create_and_activate();

            RECORDERS.destroy_all();
            RECORDERS.destroy_all();

            assert_eq!(workspace.events(), ["activate", "teardown"]);
            assert!(RECORDERS.get().is_none());
            assert!(!RECORDERS.is_active());

            // The thread may create a new one afterwards.
            let replacement = RECORDERS.create();
            assert!(!Rc::ptr_eq(&workspace, &replacement));
        });
    }

    #[test]
    fn recycle_deactivates_without_teardown() {
        on_new_thread(|| {
            let workspace = RECORDERS.find_or_create();
            let observer = Rc::clone(&workspace);

            RECORDERS.recycle(workspace);

            assert_eq!(observer.events(), ["activate", "deactivate"]);
            assert!(RECORDERS.get().is_none());

            let fresh = RECORDERS.find_or_create();
            assert!(!Rc::ptr_eq(&observer, &fresh));
        });
    }

    #[test]
    fn recycle_deactivates_even_if_never_activated() {
        on_new_thread(|| {
            let workspace = RECORDERS.create();
            let observer = Rc::clone(&workspace);

            RECORDERS.recycle(workspace);

            assert_eq!(observer.events(), ["deactivate"]);
        });
    }

    #[test]
    #[should_panic(expected = "workspace-already-exists")]
    fn double_create_is_fatal() {
        let _first = RECORDERS.create();
        let _second = RECORDERS.create();
    }

    #[test]
    #[should_panic(expected = "workspace-not-owned")]
    fn recycle_foreign_workspace_is_fatal() {
        let _mine = RECORDERS.create();
        RECORDERS.recycle(Rc::new(Recorder::default()));
    }

    #[cfg(not(feature = "sequential"))]
    #[test]
    fn factory_runs_under_type_lock() {
        struct Locked;

        impl Workspace for Locked {
            fn activate(&self) {}
            fn deactivate(&self) {}
            fn teardown(&self) {}
        }

        fn build() -> Locked {
            assert!(crate::lock_for::<Locked>().is_held());
            Locked
        }

        static LOCKED: WorkspacePool<Locked> = WorkspacePool::new(build);

        on_new_thread(|| {
            assert!(!crate::lock_for::<Locked>().is_held());
            LOCKED.create();
        });
    }

    #[test]
    fn debug_names_workspace_type() {
        let debug = format!("{RECORDERS:?}");
        assert!(debug.contains("Recorder"));
    }
}
