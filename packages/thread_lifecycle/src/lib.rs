#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Per-thread resource lifecycle and master/worker synchronization for worker-pool runtimes.
//!
//! A runtime built on this package has one master thread and a fixed pool of worker threads
//! that repeatedly pass through synchronized phases: initialization, per-item processing and
//! termination. The package provides the pieces such a runtime needs to keep per-thread state
//! fast and well-ordered without locking on the hot path:
//!
//! * [`PoolAllocator<T>`] - a paged free-list allocator for fixed-size objects, with one
//!   instance per thread per type available via [`with_thread_allocator()`].
//! * [`Barrier`] - a two-phase rendezvous between one master and N workers.
//! * [`WorkspacePool<T>`] - at most one [`Workspace`] per thread, with explicit
//!   activate/deactivate/teardown lifecycle.
//! * [`ExitRegistry<T>`] - heap objects handed over to the current thread, destroyed in reverse
//!   registration order when the thread exits.
//! * [`role()`] and [`lock_for()`] - thread identity within the runtime and process-wide locks
//!   keyed by a type.
//!
//! # Example
//!
//! ```
//! use std::thread;
//!
//! use thread_lifecycle::{Barrier, ExitRegistry, Role, assign_role, with_thread_allocator};
//!
//! const WORKER_COUNT: usize = 2;
//!
//! let barrier = Barrier::new(WORKER_COUNT);
//!
//! thread::scope(|s| {
//!     for index in 0..WORKER_COUNT {
//!         let barrier = &barrier;
//!
//!         s.spawn(move || {
//!             assign_role(Role::Worker(index));
//!
//!             // Per-thread data that lives until this worker thread exits.
//!             ExitRegistry::register_value(format!("scratch for worker {index}"));
//!
//!             barrier.arrive();
//!
//!             with_thread_allocator::<[u64; 4], _>(|allocator| {
//!                 let item = allocator.emplace([1, 2, 3, 4]);
//!
//!                 // SAFETY: `item` came from this allocator and is dropped exactly once.
//!                 let value = unsafe { allocator.take(item) };
//!                 assert_eq!(value.iter().sum::<u64>(), 10);
//!             });
//!         });
//!     }
//!
//!     barrier.await_workers();
//! });
//! ```
//!
//! # Sequential builds
//!
//! With the `sequential` cargo feature enabled, every lock and barrier operation is a no-op and
//! [`role()`] always reports [`Role::Sequential`]. Call sites stay the same in both builds.
//!
//! # Fatal errors
//!
//! Contract violations that are cheap to detect (creating a second workspace on a thread,
//! reconfiguring a barrier mid-cycle, resetting an allocator with live objects, ...) are reported
//! through the reporter installed with [`set_fatal_reporter()`] and then abort the current
//! operation by panicking. Nothing in this package returns a recoverable error.

mod barrier;
mod builder;
mod exit_registry;
mod fatal;
mod identity;
mod page;
mod pool_allocator;
mod slots;
mod thread_allocators;
mod type_lock;
mod workspace;

pub use barrier::*;
pub use builder::*;
pub use exit_registry::*;
pub use fatal::*;
pub use identity::*;
pub use pool_allocator::*;
pub use thread_allocators::*;
pub use type_lock::*;
pub use workspace::*;

// A poisoned lock means the process is in an unrecoverable/unsafe state and must exit (we panic).
pub(crate) const ERR_POISONED_LOCK: &str = "encountered poisoned lock - continued execution \
    is not safe because we can no longer ensure that shared runtime state is consistent";
