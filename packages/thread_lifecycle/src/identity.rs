use std::cell::Cell;
use std::num::NonZero;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use derive_more::Display;

use crate::fatal::{FatalCode, fatal};

const COMPONENT: &str = "ThreadIdentity";

/// The identity of a thread within the runtime.
///
/// Assigned once per thread by whatever launches the threads, via [`assign_role()`], and
/// read with [`role()`].
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[expect(
    clippy::exhaustive_enums,
    reason = "a runtime has a master, workers and nothing else - callers may match exhaustively"
)]
pub enum Role {
    /// The thread that owns shared data and drives the workers through barriers.
    #[display("master")]
    Master,

    /// A pool worker, identified by its zero-based index in the pool.
    #[display("worker-{_0}")]
    Worker(usize),

    /// A thread outside the multithreaded runtime. Also reported by every thread in a
    /// `sequential` build and by threads that were never assigned a role.
    #[display("sequential")]
    Sequential,
}

static RUNNING_WORKERS: AtomicUsize = AtomicUsize::new(0);

struct RoleSlot {
    role: Cell<Option<Role>>,
}

impl Drop for RoleSlot {
    fn drop(&mut self) {
        if matches!(self.role.get(), Some(Role::Worker(_))) {
            // The worker joined the count in `assign_role()`, so this cannot underflow.
            RUNNING_WORKERS.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

thread_local! {
    static ROLE: RoleSlot = const {
        RoleSlot {
            role: Cell::new(None),
        }
    };
}

/// Returns the role of the current thread.
///
/// Threads that were never assigned a role report [`Role::Sequential`], as does every thread
/// in a `sequential` build.
#[must_use]
pub fn role() -> Role {
    if !is_multithreaded() {
        return Role::Sequential;
    }

    ROLE.try_with(|slot| slot.role.get())
        .ok()
        .flatten()
        .unwrap_or(Role::Sequential)
}

/// Assigns the role of the current thread.
///
/// This is the launcher's responsibility and happens once, before the thread touches any other
/// part of the runtime. Assigning [`Role::Worker`] adds the thread to
/// [`running_worker_count()`] until the thread exits.
///
/// In a `sequential` build this does nothing.
///
/// # Panics
///
/// Reports [`FatalCode::RoleAlreadyAssigned`] and panics if the thread already has a role.
///
/// # Example
///
/// ```
/// use std::thread;
///
/// use thread_lifecycle::{Role, assign_role, role};
///
/// thread::spawn(|| {
///     assign_role(Role::Worker(3));
///
///     # #[cfg(not(feature = "sequential"))]
///     assert_eq!(role(), Role::Worker(3));
/// })
/// .join()
/// .unwrap();
/// ```
pub fn assign_role(role: Role) {
    if !is_multithreaded() {
        tracing::debug!(requested = %role, "sequential build, ignoring role assignment");
        return;
    }

    ROLE.with(|slot| {
        if let Some(existing) = slot.role.get() {
            fatal(
                COMPONENT,
                FatalCode::RoleAlreadyAssigned,
                format!(
                    "thread {:?} already has role {existing}, cannot assign {role}",
                    thread::current().id()
                ),
            );
        }

        slot.role.set(Some(role));
    });

    if matches!(role, Role::Worker(_)) {
        RUNNING_WORKERS.fetch_add(1, Ordering::Relaxed);
    }

    tracing::debug!(%role, "thread role assigned");
}

/// Whether the current thread is the master.
#[must_use]
pub fn is_master() -> bool {
    role() == Role::Master
}

/// Whether the current thread is a pool worker.
#[must_use]
pub fn is_worker() -> bool {
    matches!(role(), Role::Worker(_))
}

/// The pool index of the current thread, if it is a worker.
#[must_use]
pub fn worker_index() -> Option<usize> {
    match role() {
        Role::Worker(index) => Some(index),
        Role::Master | Role::Sequential => None,
    }
}

/// Number of threads with a worker role that have not yet exited.
#[must_use]
pub fn running_worker_count() -> usize {
    RUNNING_WORKERS.load(Ordering::Relaxed)
}

/// Whether synchronization primitives actually block in this build.
///
/// This is `false` when the `sequential` feature is enabled.
#[must_use]
pub const fn is_multithreaded() -> bool {
    !cfg!(feature = "sequential")
}

/// The number of processors available to this process, for sizing a worker pool.
///
/// Falls back to 1 if the platform cannot tell.
#[must_use]
pub fn available_cores() -> NonZero<usize> {
    thread::available_parallelism().unwrap_or(NonZero::<usize>::MIN)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn unassigned_thread_is_sequential() {
        thread::spawn(|| {
            assert_eq!(role(), Role::Sequential);
            assert!(!is_master());
            assert!(!is_worker());
            assert_eq!(worker_index(), None);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn display_names() {
        assert_eq!(Role::Master.to_string(), "master");
        assert_eq!(Role::Worker(7).to_string(), "worker-7");
        assert_eq!(Role::Sequential.to_string(), "sequential");
    }

    #[test]
    fn available_cores_is_at_least_one() {
        assert!(available_cores().get() >= 1);
    }

    #[cfg(not(feature = "sequential"))]
    #[test]
    fn assigned_role_is_reported() {
        thread::spawn(|| {
            assign_role(Role::Master);

            assert_eq!(role(), Role::Master);
            assert!(is_master());
            assert!(!is_worker());
        })
        .join()
        .unwrap();
    }

    #[cfg(not(feature = "sequential"))]
    #[test]
    fn worker_joins_running_count_until_exit() {
        thread::spawn(|| {
            assign_role(Role::Worker(2));

            assert_eq!(worker_index(), Some(2));
            assert!(is_worker());

            // Other tests may run workers concurrently, so we can only assert a lower bound.
            assert!(running_worker_count() >= 1);
        })
        .join()
        .unwrap();
    }

    #[cfg(not(feature = "sequential"))]
    #[test]
    #[should_panic(expected = "role-already-assigned")]
    fn second_assignment_is_fatal() {
        assign_role(Role::Worker(0));
        assign_role(Role::Worker(1));
    }

    #[cfg(feature = "sequential")]
    #[test]
    fn sequential_build_ignores_assignment() {
        assign_role(Role::Master);
        assign_role(Role::Master);

        assert_eq!(role(), Role::Sequential);
        assert_eq!(running_worker_count(), 0);
        assert!(!is_multithreaded());
    }
}
