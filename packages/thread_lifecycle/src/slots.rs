use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::rc::Rc;

use foldhash::{HashMap, HashMapExt};

use crate::lock_for;

/// A set of values keyed by their type, at most one value per type.
///
/// This is the storage behind the "one instance per thread per type" components: each of them
/// keeps a `TypeSlots` in a `thread_local!` static. Values are reference counted so that a
/// lookup does not keep the map borrowed while the caller works with the value, which lets
/// values look up other slots of the same map.
///
/// Values are dropped when the map is dropped, in unspecified order across types.
#[derive(Debug)]
pub(crate) struct TypeSlots {
    by_type: RefCell<HashMap<TypeId, Rc<dyn Any>>>,
}

impl TypeSlots {
    pub(crate) fn new() -> Self {
        Self {
            by_type: RefCell::new(HashMap::new()),
        }
    }

    pub(crate) fn get<V>(&self) -> Option<Rc<V>>
    where
        V: 'static,
    {
        let value = self
            .by_type
            .borrow()
            .get(&TypeId::of::<V>())
            .map(Rc::clone)?;

        // The key is the type ID of the value, so the downcast cannot fail.
        Rc::downcast::<V>(value).ok()
    }

    /// Returns the value of type `V`, creating it with `init` if the slot is empty.
    ///
    /// `init` runs while holding the type-keyed lock for `V`, which serializes first use of
    /// `V` across all threads. Initializers that copy from shared state rely on this. An `init`
    /// that asks for the same `V` again deadlocks.
    pub(crate) fn get_or_insert_with<V>(&self, init: impl FnOnce() -> V) -> Rc<V>
    where
        V: 'static,
    {
        if let Some(existing) = self.get::<V>() {
            return existing;
        }

        let created: Rc<V> = {
            let _guard = lock_for::<V>().lock();
            Rc::new(init())
        };

        match self.by_type.borrow_mut().entry(TypeId::of::<V>()) {
            // Only reachable in sequential builds, where the lock does not block and a
            // re-entrant `init` for the same `V` can fill the slot first. The first value wins.
            // Multithreaded builds deadlock on the lock instead.
            Entry::Occupied(entry) => Rc::downcast::<V>(Rc::clone(entry.get())).ok(),
            Entry::Vacant(entry) => {
                entry.insert(Rc::clone(&created) as Rc<dyn Any>);
                None
            }
        }
        .unwrap_or(created)
    }

    pub(crate) fn remove<V>(&self) -> Option<Rc<V>>
    where
        V: 'static,
    {
        let value = self.by_type.borrow_mut().remove(&TypeId::of::<V>())?;

        Rc::downcast::<V>(value).ok()
    }

    pub(crate) fn contains<V>(&self) -> bool
    where
        V: 'static,
    {
        self.by_type.borrow().contains_key(&TypeId::of::<V>())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.by_type.borrow().len()
    }
}
