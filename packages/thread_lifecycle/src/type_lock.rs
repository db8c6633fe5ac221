use std::any::{TypeId, type_name};
#[cfg(feature = "sequential")]
use std::marker::PhantomData;
#[cfg(not(feature = "sequential"))]
use std::sync::{Condvar, Mutex, MutexGuard};
use std::sync::{LazyLock, RwLock};

use foldhash::{HashMap, HashMapExt};

use crate::ERR_POISONED_LOCK;

/// A process-wide lock shared by everyone who asks for the same kind.
///
/// Obtained from [`lock_for()`]. Unrelated concerns use unrelated kinds, so they never contend
/// on one global lock. The lock guards no data of its own; it serializes whatever the holders
/// of the kind agree it serializes.
///
/// In a `sequential` build locking is a no-op.
#[derive(Debug)]
pub struct TypeLock {
    kind: &'static str,

    #[cfg(not(feature = "sequential"))]
    mutex: Mutex<()>,
}

impl TypeLock {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            #[cfg(not(feature = "sequential"))]
            mutex: Mutex::new(()),
        }
    }

    /// The name of the type this lock is keyed by.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Whether some thread currently holds the lock.
    #[cfg(all(test, not(feature = "sequential")))]
    pub(crate) fn is_held(&self) -> bool {
        matches!(self.mutex.try_lock(), Err(std::sync::TryLockError::WouldBlock))
    }

    /// Acquires the lock, blocking until it is available.
    ///
    /// The lock is not reentrant: acquiring it again on a thread that already holds it
    /// deadlocks.
    pub fn lock(&self) -> TypeLockGuard<'_> {
        TypeLockGuard {
            #[cfg(not(feature = "sequential"))]
            inner: self.mutex.lock().expect(ERR_POISONED_LOCK),
            #[cfg(feature = "sequential")]
            _lock: PhantomData,
        }
    }
}

/// Holds a [`TypeLock`] until dropped.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct TypeLockGuard<'a> {
    #[cfg(not(feature = "sequential"))]
    inner: MutexGuard<'a, ()>,

    #[cfg(feature = "sequential")]
    _lock: PhantomData<&'a TypeLock>,
}

impl TypeLockGuard<'_> {
    /// Releases the lock while waiting on `condvar`, reacquiring it before returning.
    ///
    /// The condition variable must only ever be used with this one lock.
    #[cfg(not(feature = "sequential"))]
    pub(crate) fn wait(self, condvar: &Condvar) -> Self {
        Self {
            inner: condvar.wait(self.inner).expect(ERR_POISONED_LOCK),
        }
    }
}

static LOCKS: LazyLock<RwLock<HashMap<TypeId, &'static TypeLock>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Returns the process-wide lock for `K`, creating it on first request.
///
/// Every call with the same `K` returns the same lock, from any thread. Locks live until the
/// process exits.
///
/// # Example
///
/// ```
/// use thread_lifecycle::lock_for;
///
/// struct PhysicsTables;
///
/// let lock = lock_for::<PhysicsTables>();
/// assert!(std::ptr::eq(lock, lock_for::<PhysicsTables>()));
///
/// let _guard = lock.lock();
/// // ... read or build the shared tables ...
/// ```
#[must_use]
pub fn lock_for<K>() -> &'static TypeLock
where
    K: ?Sized + 'static,
{
    let key = TypeId::of::<K>();

    let existing = LOCKS.read().expect(ERR_POISONED_LOCK).get(&key).copied();

    if let Some(lock) = existing {
        return lock;
    }

    let mut locks = LOCKS.write().expect(ERR_POISONED_LOCK);

    // Another thread may have created the lock between our read and write locks.
    *locks.entry(key).or_insert_with(|| {
        tracing::trace!(kind = type_name::<K>(), "creating type-keyed lock");
        Box::leak(Box::new(TypeLock::new(type_name::<K>())))
    })
}

/// Executes `f` while holding the lock for `K`.
///
/// # Example
///
/// ```
/// use thread_lifecycle::with_type_lock;
///
/// struct OutputFile;
///
/// let written = with_type_lock::<OutputFile, _>(|| "one line at a time");
/// assert_eq!(written, "one line at a time");
/// ```
pub fn with_type_lock<K, R>(f: impl FnOnce() -> R) -> R
where
    K: ?Sized + 'static,
{
    let _guard = lock_for::<K>().lock();
    f()
}
