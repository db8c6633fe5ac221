use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
#[cfg(not(feature = "sequential"))]
use std::sync::Condvar;

use simple_mermaid::mermaid;

use crate::fatal::{FatalCode, fatal};
use crate::{TypeLock, lock_for};

const COMPONENT: &str = "Barrier";

/// A rendezvous point where one master waits for N workers before releasing all of them.
///
/// Each cycle goes through the following states, where `c` is the number of workers that have
/// arrived and `N` is the number expected:
#[ doc=mermaid!( "../doc/barrier.mermaid") ]
///
/// Workers call [`arrive()`][Self::arrive] exactly once per cycle and block until released.
/// The master calls [`await_workers()`][Self::await_workers], or its two halves
/// [`wait_full()`][Self::wait_full] and [`release()`][Self::release] if it needs to do
/// something strictly between "everyone has arrived" and "everyone may proceed".
///
/// # Ordering
///
/// Everything a worker does before `arrive()` happens-before everything the master does after
/// `wait_full()` returns. Everything the master does between `wait_full()` and `release()`
/// happens-before everything any worker does after its `arrive()` returns.
///
/// # No timeout
///
/// There is no timeout. A worker that never arrives stalls the master forever and a master that
/// never releases stalls every arrived worker forever.
///
/// # Sequential builds
///
/// With the `sequential` feature, every operation returns immediately.
///
/// # Example
///
/// ```
/// use std::sync::atomic::{AtomicU32, Ordering};
/// use std::thread;
///
/// use thread_lifecycle::Barrier;
///
/// let barrier = Barrier::new(3);
/// let run_number = AtomicU32::new(0);
///
/// thread::scope(|s| {
///     for _ in 0..3 {
///         s.spawn(|| {
///             barrier.arrive();
///
///             # #[cfg(not(feature = "sequential"))]
///             // The master set this before releasing us.
///             assert_eq!(run_number.load(Ordering::Relaxed), 1);
///         });
///     }
///
///     barrier.wait_full();
///     run_number.store(1, Ordering::Relaxed);
///     barrier.release();
/// });
/// ```
#[derive(Debug)]
pub struct Barrier {
    lock: &'static TypeLock,

    // The counters are only modified while holding `lock`, which orders all access to them.
    // They are atomics so they can also be sampled without the lock for diagnostics.
    active: AtomicUsize,
    arrived: AtomicUsize,

    /// Incremented by every release. Waiting workers watch this to tell a release apart from a
    /// spurious wake-up.
    completed_cycles: AtomicU64,

    /// Signaled whenever a worker arrives.
    #[cfg(not(feature = "sequential"))]
    workers_changed: Condvar,

    /// Signaled when the master releases the workers.
    #[cfg(not(feature = "sequential"))]
    release: Condvar,
}

impl Barrier {
    /// Creates a barrier expecting `active` workers per cycle.
    ///
    /// The barrier is guarded by the [type-keyed lock][lock_for] for `Barrier`, shared by all
    /// barriers created this way.
    #[must_use]
    pub fn new(active: usize) -> Self {
        Self::with_lock(lock_for::<Self>(), active)
    }

    /// Creates a barrier expecting `active` workers per cycle, guarded by the
    /// [type-keyed lock][lock_for] for `K`.
    ///
    /// The lock is only held briefly around counter updates, never while anyone waits, so
    /// sharing it between barriers only costs contention, not correctness.
    #[must_use]
    pub fn with_lock_kind<K>(active: usize) -> Self
    where
        K: ?Sized + 'static,
    {
        Self::with_lock(lock_for::<K>(), active)
    }

    fn with_lock(lock: &'static TypeLock, active: usize) -> Self {
        Self {
            lock,
            active: AtomicUsize::new(active),
            arrived: AtomicUsize::new(0),
            completed_cycles: AtomicU64::new(0),
            #[cfg(not(feature = "sequential"))]
            workers_changed: Condvar::new(),
            #[cfg(not(feature = "sequential"))]
            release: Condvar::new(),
        }
    }

    /// Sets the number of workers expected per cycle.
    ///
    /// A master already blocked in [`wait_full()`][Self::wait_full] re-checks against the new
    /// count, so lowering it to the number already arrived (zero) lets the master proceed.
    ///
    /// # Panics
    ///
    /// Reports [`FatalCode::BarrierReconfiguredMidCycle`] and panics if any worker has arrived
    /// in the current cycle.
    pub fn set_active(&self, active: usize) {
        let guard = self.lock.lock();

        let arrived = self.arrived.load(Ordering::Relaxed);
        if arrived != 0 {
            drop(guard);
            fatal(
                COMPONENT,
                FatalCode::BarrierReconfiguredMidCycle,
                format!("cannot expect {active} workers while {arrived} have already arrived"),
            );
        }

        self.active.store(active, Ordering::Relaxed);

        #[cfg(not(feature = "sequential"))]
        self.workers_changed.notify_all();

        drop(guard);
    }

    /// Worker side: records this worker's arrival, then blocks until the master releases the
    /// current cycle.
    ///
    /// Must be called exactly once per worker per cycle.
    ///
    /// # Panics
    ///
    /// Reports [`FatalCode::BarrierOverfilled`] and panics if all expected workers have already
    /// arrived in this cycle.
    pub fn arrive(&self) {
        #[cfg(not(feature = "sequential"))]
        self.arrive_and_wait();
    }

    #[cfg(not(feature = "sequential"))]
    fn arrive_and_wait(&self) {
        let mut guard = self.lock.lock();

        let active = self.active.load(Ordering::Relaxed);
        let arrived = self.arrived.load(Ordering::Relaxed);

        if arrived >= active {
            drop(guard);
            fatal(
                COMPONENT,
                FatalCode::BarrierOverfilled,
                format!("a worker arrived after all {active} expected workers"),
            );
        }

        let arrived = arrived
            .checked_add(1)
            .expect("guarded by the comparison with the active count above");
        self.arrived.store(arrived, Ordering::Relaxed);

        let cycle = self.completed_cycles.load(Ordering::Relaxed);

        tracing::trace!(arrived, active, cycle, "worker arrived at barrier");

        self.workers_changed.notify_all();

        while self.completed_cycles.load(Ordering::Relaxed) == cycle {
            guard = guard.wait(&self.release);
        }
    }

    /// Master side: blocks until all expected workers have arrived, then releases them.
    ///
    /// Equivalent to [`wait_full()`][Self::wait_full] followed by [`release()`][Self::release].
    pub fn await_workers(&self) {
        self.wait_full();
        self.release();
    }

    /// Master side: blocks until all expected workers have arrived in the current cycle.
    ///
    /// The workers stay blocked until [`release()`][Self::release].
    pub fn wait_full(&self) {
        #[cfg(not(feature = "sequential"))]
        {
            let mut guard = self.lock.lock();

            while self.arrived.load(Ordering::Relaxed) < self.active.load(Ordering::Relaxed) {
                guard = guard.wait(&self.workers_changed);
            }
        }
    }

    /// Master side: lets every arrived worker proceed and starts a new cycle.
    ///
    /// # Panics
    ///
    /// Reports [`FatalCode::BarrierReleasedEarly`] and panics if not all expected workers have
    /// arrived.
    pub fn release(&self) {
        let guard = self.lock.lock();

        let active = self.active.load(Ordering::Relaxed);
        let arrived = self.arrived.load(Ordering::Relaxed);

        if crate::is_multithreaded() && arrived < active {
            drop(guard);
            fatal(
                COMPONENT,
                FatalCode::BarrierReleasedEarly,
                format!("release with only {arrived} of {active} workers arrived"),
            );
        }

        self.arrived.store(0, Ordering::Relaxed);
        let cycle = self.completed_cycles.load(Ordering::Relaxed).wrapping_add(1);
        self.completed_cycles.store(cycle, Ordering::Relaxed);

        tracing::trace!(released = arrived, cycle, "barrier released");

        #[cfg(not(feature = "sequential"))]
        self.release.notify_all();

        drop(guard);
    }

    /// Number of workers expected per cycle.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Number of workers that have arrived in the current cycle.
    ///
    /// Without the master's cooperation this is only a snapshot. Between
    /// [`wait_full()`][Self::wait_full] and [`release()`][Self::release] it is exact.
    #[must_use]
    pub fn arrived_count(&self) -> usize {
        self.arrived.load(Ordering::Relaxed)
    }

    /// Number of cycles released so far.
    #[must_use]
    pub fn completed_cycles(&self) -> u64 {
        self.completed_cycles.load(Ordering::Relaxed)
    }
}
