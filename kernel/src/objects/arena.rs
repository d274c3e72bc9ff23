//! Generation-checked object arena
//!
//! Mailboxes and connections refer to each other weakly: either side may be
//! destroyed first. Objects are therefore kept in an arena and referenced by
//! `(index, generation)` pairs. Removing an object bumps its slot's
//! generation, so any reference still held elsewhere resolves to `None`
//! instead of to freed memory or to an unrelated object reusing the slot.

use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;
use std::sync::Arc;

use spin::RwLock;

/// Weak, generation-tagged reference into an [`Arena`]
pub struct ObjRef<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ObjRef<T> {
    fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// Slot index
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Slot generation at the time the reference was taken
    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl<T> Clone for ObjRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ObjRef<T> {}

impl<T> PartialEq for ObjRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for ObjRef<T> {}

impl<T> Hash for ObjRef<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for ObjRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjRef({}@{})", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<Arc<T>>,
}

struct ArenaInner<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

/// Slot arena with stable indices and generation checks
pub struct Arena<T> {
    inner: RwLock<ArenaInner<T>>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(ArenaInner {
                slots: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
        }
    }

    /// Insert an object that needs to know its own reference
    ///
    /// `build` runs with the arena write-locked and must not touch the arena.
    pub fn insert_with(&self, build: impl FnOnce(ObjRef<T>) -> T) -> (ObjRef<T>, Arc<T>) {
        let mut inner = self.inner.write();
        let index = match inner.free.pop() {
            Some(index) => index,
            None => {
                inner.slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                (inner.slots.len() - 1) as u32
            }
        };
        let slot = &mut inner.slots[index as usize];
        let objref = ObjRef::new(index, slot.generation);
        let value = Arc::new(build(objref));
        slot.value = Some(Arc::clone(&value));
        inner.live += 1;
        (objref, value)
    }

    /// Insert an object
    pub fn insert(&self, value: T) -> (ObjRef<T>, Arc<T>) {
        self.insert_with(|_| value)
    }

    /// Resolve a reference, `None` if the object was removed
    pub fn get(&self, objref: ObjRef<T>) -> Option<Arc<T>> {
        let inner = self.inner.read();
        let slot = inner.slots.get(objref.index as usize)?;
        if slot.generation != objref.generation {
            return None;
        }
        slot.value.clone()
    }

    /// Remove an object and invalidate every outstanding reference to it
    pub fn remove(&self, objref: ObjRef<T>) -> Option<Arc<T>> {
        let mut inner = self.inner.write();
        let slot = inner.slots.get_mut(objref.index as usize)?;
        if slot.generation != objref.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        inner.free.push(objref.index);
        inner.live -= 1;
        Some(value)
    }

    /// Number of live objects
    pub fn len(&self) -> usize {
        self.inner.read().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
