use std::any::type_name;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::fatal::{FatalCode, fatal};
use crate::slots::TypeSlots;

const COMPONENT: &str = "ExitRegistry";

/// The objects of one type registered on one thread, in registration order.
struct ExitList<T> {
    // Pointers from `Box::into_raw`, each owned by this list.
    owned: RefCell<Vec<NonNull<T>>>,
}

impl<T> ExitList<T> {
    fn new() -> Self {
        Self {
            owned: RefCell::new(Vec::new()),
        }
    }
}

impl<T> Drop for ExitList<T> {
    fn drop(&mut self) {
        let owned = self.owned.get_mut();

        if owned.is_empty() {
            return;
        }

        tracing::debug!(
            item_type = type_name::<T>(),
            count = owned.len(),
            "destroying thread-exit objects"
        );

        while let Some(ptr) = owned.pop() {
            // SAFETY: Every pointer on the list came from `Box::into_raw` in `register()` and
            // is removed from the list before being reboxed, so each is reboxed exactly once.
            drop(unsafe { Box::from_raw(ptr.as_ptr()) });
        }
    }
}

thread_local! {
    static EXIT_LISTS: TypeSlots = TypeSlots::new();
}

/// Hands heap objects over to the current thread, which destroys them when it exits.
///
/// Each thread has one list per type `T`. When the thread exits, every list is drained in
/// reverse registration order: the object registered last is dropped first. The order in which
/// the lists of different types are drained is unspecified.
///
/// This is for per-thread singletons and similar state that must live exactly as long as the
/// thread that uses it, without anyone keeping track of it.
///
/// Objects registered on the main thread are only destroyed if the platform runs thread-local
/// destructors for the main thread, which is not guaranteed when the process exits.
///
/// # Example
///
/// ```
/// use std::thread;
///
/// use thread_lifecycle::ExitRegistry;
///
/// struct Histogram {
///     bins: Vec<u64>,
/// }
///
/// thread::spawn(|| {
///     let histogram = ExitRegistry::register(Box::new(Histogram { bins: vec![0; 100] }));
///
///     // SAFETY: The histogram lives until this thread exits and nothing else accesses it.
///     let histogram = unsafe { &mut *histogram.as_ptr() };
///     histogram.bins[42] += 1;
///
///     assert_eq!(ExitRegistry::<Histogram>::registered_count(), 1);
/// })
/// .join()
/// .unwrap();
/// ```
#[derive(Debug)]
pub struct ExitRegistry<T> {
    _item: PhantomData<T>,
}

impl<T> ExitRegistry<T>
where
    T: 'static,
{
    /// Transfers ownership of `owned` to the current thread.
    ///
    /// Returns a pointer to the object, valid until the current thread exits. The thread only
    /// ever drops the object, so the caller decides how it is shared.
    ///
    /// # Panics
    ///
    /// Reports [`FatalCode::RegistryTornDown`] and panics if the current thread's thread-local
    /// storage is already being destroyed, e.g. when called from the destructor of another
    /// registered object. The object is dropped first.
    pub fn register(owned: Box<T>) -> NonNull<T> {
        let ptr = NonNull::from(Box::leak(owned));

        let registered = EXIT_LISTS.try_with(|lists| {
            lists
                .get_or_insert_with(ExitList::<T>::new)
                .owned
                .borrow_mut()
                .push(ptr);
        });

        if registered.is_err() {
            // SAFETY: The pointer came from `Box::leak` above and was never stored anywhere.
            drop(unsafe { Box::from_raw(ptr.as_ptr()) });

            fatal(
                COMPONENT,
                FatalCode::RegistryTornDown,
                format!(
                    "cannot register {} while the thread is being torn down",
                    type_name::<T>()
                ),
            );
        }

        ptr
    }

    /// Moves `value` to the heap and [registers][Self::register] it.
    ///
    /// # Panics
    ///
    /// Same as [`register()`][Self::register].
    pub fn register_value(value: T) -> NonNull<T> {
        Self::register(Box::new(value))
    }

    /// Number of `T` objects registered on the current thread.
    #[must_use]
    pub fn registered_count() -> usize {
        EXIT_LISTS
            .try_with(|lists| {
                lists
                    .get::<ExitList<T>>()
                    .map_or(0, |list| list.owned.borrow().len())
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::thread;

    use super::*;

    type DropLog = Arc<Mutex<Vec<String>>>;

    struct Probe {
        name: String,
        log: DropLog,
    }

    impl Probe {
        fn new(name: &str, log: &DropLog) -> Self {
            Self {
                name: name.to_owned(),
                log: Arc::clone(log),
            }
        }
    }

    impl Drop for Probe {
        fn drop(&mut self) {
            self.log.lock().unwrap().push(self.name.clone());
        }
    }

    #[test]
    fn drains_in_reverse_order_at_thread_exit() {
        let log = DropLog::default();

        thread::spawn({
            let log = Arc::clone(&log);
            move || {
                ExitRegistry::register_value(Probe::new("A", &log));
                ExitRegistry::register_value(Probe::new("B", &log));
                ExitRegistry::register_value(Probe::new("C", &log));

                assert_eq!(ExitRegistry::<Probe>::registered_count(), 3);
                assert!(log.lock().unwrap().is_empty());
            }
        })
        .join()
        .unwrap();

        assert_eq!(*log.lock().unwrap(), ["C", "B", "A"]);
    }

    #[test]
    fn pointer_stays_valid_until_exit() {
        thread::spawn(|| {
            let counter = ExitRegistry::register(Box::new(0_u64));

            for _ in 0..10 {
                // SAFETY: The object lives until this thread exits and only we access it.
                unsafe { *counter.as_ptr() += 1 };
            }

            // SAFETY: As above.
            assert_eq!(unsafe { *counter.as_ptr() }, 10);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn types_and_threads_are_independent() {
        struct Other(#[allow(dead_code, reason = "only the drop matters")] Probe);

        let log = DropLog::default();

        thread::spawn({
            let log = Arc::clone(&log);
            move || {
                ExitRegistry::register_value(Probe::new("probe", &log));
                ExitRegistry::register_value(Other(Probe::new("other", &log)));

                thread::spawn(|| {
                    assert_eq!(ExitRegistry::<Probe>::registered_count(), 0);
                })
                .join()
                .unwrap();

                assert_eq!(ExitRegistry::<Probe>::registered_count(), 1);
                assert_eq!(ExitRegistry::<Other>::registered_count(), 1);
            }
        })
        .join()
        .unwrap();

        let mut dropped = log.lock().unwrap().clone();
        dropped.sort();
        assert_eq!(dropped, ["other", "probe"]);
    }

    #[test]
    fn registering_during_teardown_is_fatal() {
        struct Reregisters;

        impl Drop for Reregisters {
            fn drop(&mut self) {
                let result = std::panic::catch_unwind(|| ExitRegistry::register_value(0_u8));

                let payload = result.unwrap_err();
                let message = payload.downcast_ref::<String>().unwrap();
                assert!(message.contains("registry-torn-down"));
            }
        }

        thread::spawn(|| {
            ExitRegistry::register_value(Reregisters);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn nothing_registered_means_zero() {
        assert_eq!(ExitRegistry::<String>::registered_count(), 0);
    }
}
