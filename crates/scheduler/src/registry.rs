//! Authoritative id → routine map plus the per-id stripe locks.
//!
//! Every registry mutation for an id happens while the caller holds that
//! id's stripe lock ([`Registry::lock_id`]), which makes submit/remove on the
//! same id atomic with respect to each other. The stripe table is a fixed
//! array sized at construction, so there is no lazy creation to race on and
//! no growth with the number of ids ever seen.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::routine::Routine;

/// Default number of stripes.
pub const DEFAULT_STRIPES: usize = 256;

/// Fixed-size table of mutexes indexed by id.
pub struct StripedLocks {
    stripes: Box<[Mutex<()>]>,
    mask: usize,
}

impl StripedLocks {
    /// `count` is rounded up to a power of two.
    pub fn new(count: usize) -> Self {
        let count = count.max(1).next_power_of_two();
        Self {
            stripes: (0..count).map(|_| Mutex::new(())).collect(),
            mask: count - 1,
        }
    }

    pub fn len(&self) -> usize {
        self.stripes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stripes.is_empty()
    }

    pub fn index_of(&self, id: u64) -> usize {
        // Fold the high half in so sequential test ids still spread out.
        ((id ^ (id >> 32)) as usize) & self.mask
    }

    pub fn lock(&self, id: u64) -> MutexGuard<'_, ()> {
        self.stripes[self.index_of(id)].lock()
    }
}

/// The routine registry.
pub struct Registry {
    routines: RwLock<HashMap<u64, Arc<Routine>>>,
    stripes: StripedLocks,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(DEFAULT_STRIPES)
    }
}

impl Registry {
    pub fn new(stripes: usize) -> Self {
        Self {
            routines: RwLock::new(HashMap::new()),
            stripes: StripedLocks::new(stripes),
        }
    }

    /// Serialize submit/remove for `id`. Hold the guard across the whole operation.
    pub fn lock_id(&self, id: u64) -> MutexGuard<'_, ()> {
        self.stripes.lock(id)
    }

    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    /// Insert unless the id is taken. Returns false on duplicates, leaving the
    /// existing entry untouched.
    pub fn insert(&self, routine: Arc<Routine>) -> bool {
        let mut routines = self.routines.write();
        if routines.contains_key(&routine.id()) {
            return false;
        }
        routines.insert(routine.id(), routine);
        true
    }

    pub fn get(&self, id: u64) -> Option<Arc<Routine>> {
        self.routines.read().get(&id).cloned()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.routines.read().contains_key(&id)
    }

    pub fn remove(&self, id: u64) -> Option<Arc<Routine>> {
        self.routines.write().remove(&id)
    }

    /// Remove `id` only if it still maps to this exact routine.
    ///
    /// Used by processors retiring a finished routine, which must not evict a
    /// fresh registration that reused the id.
    /// True if `routine` itself, not a later registration of its id, is registered.
    pub fn holds(&self, routine: &Arc<Routine>) -> bool {
        self.routines
            .read()
            .get(&routine.id())
            .is_some_and(|current| Arc::ptr_eq(current, routine))
    }

    pub fn remove_if_same(&self, routine: &Arc<Routine>) -> bool {
        let mut routines = self.routines.write();
        match routines.get(&routine.id()) {
            Some(current) if Arc::ptr_eq(current, routine) => {
                routines.remove(&routine.id());
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.routines.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routines.read().is_empty()
    }

    pub fn ids(&self) -> Vec<u64> {
        self.routines.read().keys().copied().collect()
    }

    /// Snapshot of every registered routine.
    pub fn routines(&self) -> Vec<Arc<Routine>> {
        self.routines.read().values().cloned().collect()
    }

    pub fn drain(&self) -> Vec<Arc<Routine>> {
        self.routines.write().drain().map(|(_, r)| r).collect()
    }
}
