// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A free-list pool for parameter sets, SEI payloads and RBSP scratch
//! buffers.
//!
//! Slots are keyed by `(size, type)`. Releasing a [`Pooled`] handle does not
//! return its memory to the system allocator; the slot goes back on the free
//! list of its pool and the next allocation with the same key reuses it. Typed
//! slots are reset to their default value before being recycled, raw slots are
//! handed back as they were left.

use std::any::Any;
use std::any::TypeId;
use std::fmt;
use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use crate::codec::h265::error::ParseError;
use crate::codec::h265::error::Result;

/// Values that can live in a typed pool slot.
pub trait Reusable: Send + 'static {
    /// Brings the value back to its pristine state before the slot is
    /// recycled.
    fn reset(&mut self);
}

impl<T: Default + Send + 'static> Reusable for T {
    fn reset(&mut self) {
        *self = T::default();
    }
}

/// Untyped scratch memory handed out by [`ObjectPool::allocate_raw`].
#[derive(Debug, Default)]
pub struct RawBuffer(Vec<u8>);

impl Deref for RawBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for RawBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct SlotKey {
    size: usize,
    /// `None` for raw slots.
    type_tag: Option<TypeId>,
}

struct FreeSlot {
    id: u64,
    key: SlotKey,
    storage: Box<dyn Any + Send>,
}

#[derive(Default)]
struct PoolInner {
    free: Vec<FreeSlot>,
    next_id: u64,
    /// Slots created so far and not released with `release_all`.
    allocated: usize,
}

struct PoolShared {
    inner: Mutex<PoolInner>,
    capacity: Option<usize>,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn recycle(&self, id: u64, key: SlotKey, storage: Box<dyn Any + Send>) {
        let mut inner = self.lock();

        if inner.free.iter().any(|slot| slot.id == id) {
            log::warn!("Pool slot {} released twice, ignoring", id);
            return;
        }

        inner.free.push(FreeSlot { id, key, storage });
    }
}

/// A pool of reusable slots. Cloning the pool yields another handle on the
/// same free list.
#[derive(Clone)]
pub struct ObjectPool {
    shared: Arc<PoolShared>,
}

impl fmt::Debug for ObjectPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("ObjectPool")
            .field("free", &inner.free.len())
            .field("allocated", &inner.allocated)
            .field("capacity", &self.shared.capacity)
            .finish()
    }
}

impl Default for ObjectPool {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ObjectPool {
    /// Creates a pool. `capacity` bounds the number of slots the pool will
    /// ever create, idle ones included.
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                inner: Mutex::new(Default::default()),
                capacity,
            }),
        }
    }

    /// Takes the first free slot matching `key`, or reserves the id of a new
    /// one.
    fn take_or_reserve(&self, key: SlotKey) -> Result<(u64, Option<Box<dyn Any + Send>>)> {
        let mut inner = self.shared.lock();

        if let Some(pos) = inner.free.iter().position(|slot| slot.key == key) {
            let slot = inner.free.swap_remove(pos);
            return Ok((slot.id, Some(slot.storage)));
        }

        if let Some(capacity) = self.shared.capacity {
            if inner.allocated >= capacity {
                return Err(ParseError::Alloc(format!(
                    "pool exhausted ({} slots in use)",
                    capacity
                )));
            }
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.allocated += 1;
        Ok((id, None))
    }

    /// Moves `value` into a typed slot.
    pub fn allocate<T: Reusable>(&self, value: T) -> Result<Pooled<T>> {
        let key = SlotKey {
            size: std::mem::size_of::<T>(),
            type_tag: Some(TypeId::of::<T>()),
        };

        let (id, storage) = self.take_or_reserve(key)?;
        let boxed = match storage.map(|s| s.downcast::<T>()) {
            Some(Ok(mut slot)) => {
                *slot = value;
                slot
            }
            // The key carries the TypeId so this only happens on a broken
            // free list. Drop the stale storage and start afresh.
            Some(Err(_)) => {
                log::warn!("Pool slot {} has an unexpected type, replacing it", id);
                Box::new(value)
            }
            None => Box::new(value),
        };

        Ok(Pooled {
            id,
            key,
            value: Some(boxed),
            pool: Arc::clone(&self.shared),
        })
    }

    /// Hands out an untyped buffer of at least `size` bytes. Its contents are
    /// whatever the previous user left in it.
    pub fn allocate_raw(&self, size: usize) -> Result<Pooled<RawBuffer>> {
        if size == 0 {
            return Err(ParseError::NullPointer("zero-sized pool slot"));
        }

        let key = SlotKey {
            size,
            type_tag: None,
        };

        let (id, storage) = self.take_or_reserve(key)?;
        let boxed = match storage.map(|s| s.downcast::<RawBuffer>()) {
            Some(Ok(slot)) => slot,
            _ => Box::new(RawBuffer(vec![0; size])),
        };

        Ok(Pooled {
            id,
            key,
            value: Some(boxed),
            pool: Arc::clone(&self.shared),
        })
    }

    /// Returns `slot` to the pool. Equivalent to dropping it.
    pub fn free<T: Reusable>(&self, slot: Pooled<T>) {
        drop(slot)
    }

    /// Drops every idle slot. Slots still in use are not affected and go back
    /// to the (now empty) free list when released.
    pub fn release_all(&self) {
        let mut inner = self.shared.lock();
        let released = inner.free.len();
        inner.free.clear();
        inner.allocated = inner.allocated.saturating_sub(released);
        log::debug!("Released {} pool slots", released);
    }

    /// Number of idle slots ready for reuse.
    pub fn free_len(&self) -> usize {
        self.shared.lock().free.len()
    }

    /// Number of slots currently owned by the pool, idle or not.
    pub fn allocated(&self) -> usize {
        self.shared.lock().allocated
    }
}

/// A value living in a pool slot. Dropping it puts the slot back on the free
/// list.
pub struct Pooled<T: Reusable> {
    id: u64,
    key: SlotKey,
    /// `Some` until the slot is recycled.
    value: Option<Box<T>>,
    pool: Arc<PoolShared>,
}

impl<T: Reusable> Pooled<T> {
    /// Identifier of the underlying slot, stable across reuses.
    pub fn slot_id(&self) -> u64 {
        self.id
    }
}

impl<T: Reusable> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // `unwrap` will never fail as `value` is `Some` until the object is dropped.
        self.value.as_deref().unwrap()
    }
}

impl<T: Reusable> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_deref_mut().unwrap()
    }
}

impl<T: Reusable + fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: Reusable> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(mut value) = self.value.take() {
            if self.key.type_tag.is_some() {
                value.reset();
            }

            self.pool.recycle(self.id, self.key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct FakeSet {
        id: u8,
        payload: Vec<u32>,
    }

    #[test]
    fn reuse_released_slots() {
        const N: usize = 8;
        let pool = ObjectPool::default();

        let slots: Vec<_> = (0..N)
            .map(|i| {
                pool.allocate(FakeSet {
                    id: i as u8,
                    payload: vec![i as u32; 4],
                })
                .unwrap()
            })
            .collect();
        assert_eq!(pool.free_len(), 0);
        assert_eq!(pool.allocated(), N);

        drop(slots);
        assert_eq!(pool.free_len(), N);

        // Same shape, so no new slot is created.
        let again: Vec<_> = (0..N)
            .map(|_| pool.allocate(FakeSet::default()).unwrap())
            .collect();
        assert_eq!(pool.free_len(), 0);
        assert_eq!(pool.allocated(), N);

        drop(again);
        assert_eq!(pool.free_len(), N);
    }

    #[test]
    fn typed_slots_are_reset() {
        let pool = ObjectPool::default();
        let slot = pool
            .allocate(FakeSet {
                id: 3,
                payload: vec![1, 2, 3],
            })
            .unwrap();
        let id = slot.slot_id();
        pool.free(slot);

        let slot = pool.allocate(FakeSet::default()).unwrap();
        assert_eq!(slot.slot_id(), id);
        assert_eq!(*slot, FakeSet::default());
    }

    #[test]
    fn slots_are_keyed_by_type() {
        let pool = ObjectPool::default();
        drop(pool.allocate(0u64).unwrap());
        assert_eq!(pool.free_len(), 1);

        // Same size, different type.
        let other = pool.allocate(0i64).unwrap();
        assert_eq!(pool.free_len(), 1);
        assert_eq!(pool.allocated(), 2);
        drop(other);

        let raw = pool.allocate_raw(8).unwrap();
        assert_eq!(raw.len(), 8);
        assert_eq!(pool.allocated(), 3);
    }

    #[test]
    fn raw_slots_keep_their_contents() {
        let pool = ObjectPool::default();
        let mut raw = pool.allocate_raw(4).unwrap();
        raw.copy_from_slice(&[1, 2, 3, 4]);
        drop(raw);

        let raw = pool.allocate_raw(4).unwrap();
        assert_eq!(raw.as_slice(), &[1, 2, 3, 4]);

        assert_eq!(
            pool.allocate_raw(0).unwrap_err(),
            ParseError::NullPointer("zero-sized pool slot")
        );
    }

    #[test]
    fn double_release_is_ignored() {
        let pool = ObjectPool::default();
        let slot = pool.allocate(FakeSet::default()).unwrap();
        let id = slot.slot_id();
        drop(slot);

        pool.shared.recycle(
            id,
            SlotKey {
                size: std::mem::size_of::<FakeSet>(),
                type_tag: Some(TypeId::of::<FakeSet>()),
            },
            Box::new(FakeSet::default()),
        );
        assert_eq!(pool.free_len(), 1);
    }

    #[test]
    fn capacity_is_enforced() {
        let pool = ObjectPool::new(Some(2));
        let a = pool.allocate(1u32).unwrap();
        let _b = pool.allocate(2u32).unwrap();
        assert!(matches!(pool.allocate(3u32), Err(ParseError::Alloc(_))));

        drop(a);
        assert!(pool.allocate(3u32).is_ok());
    }

    #[test]
    fn release_all_empties_the_free_list() {
        let pool = ObjectPool::default();
        let live = pool.allocate(1u8).unwrap();
        drop(pool.allocate(2u16).unwrap());
        drop(pool.allocate(3u32).unwrap());
        assert_eq!(pool.free_len(), 2);

        pool.release_all();
        assert_eq!(pool.free_len(), 0);
        assert_eq!(pool.allocated(), 1);

        drop(live);
        assert_eq!(pool.free_len(), 1);
    }

    #[test]
    fn shared_between_threads() {
        let pool = ObjectPool::default();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..16 {
                        drop(pool.allocate(vec![i as u8; 16]).unwrap());
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(pool.free_len() <= 4);
        assert_eq!(pool.free_len(), pool.allocated());
    }
}
