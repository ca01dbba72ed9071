// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::codec::h265::error::invalid_stream;
use crate::codec::h265::error::Result;
use crate::codec::h265::parser::Pps;
use crate::codec::h265::parser::Sps;
use crate::codec::h265::parser::Vps;
use crate::codec::h265::parser::MAX_PPS_ID;
use crate::codec::h265::parser::MAX_SPS_ID;
use crate::codec::h265::parser::MAX_VPS_ID;
use crate::codec::h265::pool::ObjectPool;
use crate::codec::h265::pool::Pooled;
use crate::codec::h265::pool::Reusable;
use crate::codec::h265::sei::SeiPayload;
use crate::codec::h265::sei::MAX_SEI_PAYLOAD_TYPE;

/// A shared handle on a stored header. The pool slot is recycled once the
/// store and every slice holding a clone have let go of it.
pub type SharedHeader<T> = Arc<Pooled<T>>;

/// Parameter sets of one kind, keyed by the id they carry in the bitstream.
#[derive(Debug)]
pub struct HeaderSet<T: Reusable> {
    entries: BTreeMap<u32, SharedHeader<T>>,
    current: Option<u32>,
    max_id: u32,
    pool: ObjectPool,
}

impl<T: Reusable> HeaderSet<T> {
    pub fn new(max_id: u32, pool: ObjectPool) -> Self {
        Self {
            entries: Default::default(),
            current: None,
            max_id,
            pool,
        }
    }

    /// Stores `value` at `id`, replacing whatever was there, and makes it the
    /// current entry.
    pub fn add(&mut self, id: u32, value: T) -> Result<SharedHeader<T>> {
        if id > self.max_id {
            return Err(invalid_stream!(
                "header id {} out of range (max {})",
                id,
                self.max_id
            ));
        }

        let slot = Arc::new(self.pool.allocate(value)?);
        if self.entries.insert(id, Arc::clone(&slot)).is_some() {
            log::debug!("Replaced header with id {}", id);
        }

        self.current = Some(id);
        Ok(slot)
    }

    pub fn get(&self, id: u32) -> Option<&T> {
        self.entries.get(&id).map(|slot| &***slot)
    }

    /// Like [`HeaderSet::get`], but returns a handle that keeps the entry
    /// alive even if it gets replaced.
    pub fn get_shared(&self, id: u32) -> Option<SharedHeader<T>> {
        self.entries.get(&id).cloned()
    }

    pub fn get_current(&self) -> Option<&T> {
        self.current.and_then(|id| self.get(id))
    }

    pub fn current_id(&self) -> Option<u32> {
        self.current
    }

    /// Makes `id` the current entry. Fails if nothing is stored there.
    pub fn set_current(&mut self, id: u32) -> Result<()> {
        if !self.entries.contains_key(&id) {
            return Err(invalid_stream!("no header with id {}", id));
        }

        self.current = Some(id);
        Ok(())
    }

    /// Drops the store's reference on `id`.
    pub fn remove(&mut self, id: u32) -> Option<SharedHeader<T>> {
        if self.current == Some(id) {
            self.current = None;
        }

        self.entries.remove(&id)
    }

    /// Clears the current entry. A full reset also drops every entry.
    pub fn reset(&mut self, partial: bool) {
        self.current = None;
        if !partial {
            self.entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.keys().copied()
    }
}

/// All the header stores a parsing session needs.
#[derive(Debug)]
pub struct Headers {
    pub vps: HeaderSet<Vps>,
    pub sps: HeaderSet<Sps>,
    pub pps: HeaderSet<Pps>,
    /// SEI payloads, keyed by payload type.
    pub sei: HeaderSet<SeiPayload>,
}

impl Headers {
    pub fn new(pool: ObjectPool) -> Self {
        Self {
            vps: HeaderSet::new(MAX_VPS_ID, pool.clone()),
            sps: HeaderSet::new(MAX_SPS_ID, pool.clone()),
            pps: HeaderSet::new(MAX_PPS_ID, pool.clone()),
            sei: HeaderSet::new(MAX_SEI_PAYLOAD_TYPE, pool),
        }
    }

    pub fn reset(&mut self, partial: bool) {
        self.vps.reset(partial);
        self.sps.reset(partial);
        self.pps.reset(partial);
        self.sei.reset(partial);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct FakeSet(u32);

    #[test]
    fn add_and_get() {
        let mut set = HeaderSet::new(15, ObjectPool::default());
        assert!(set.get_current().is_none());

        set.add(3, FakeSet(30)).unwrap();
        set.add(7, FakeSet(70)).unwrap();

        assert_eq!(set.get(3), Some(&FakeSet(30)));
        assert_eq!(set.get(4), None);
        assert_eq!(set.current_id(), Some(7));
        assert_eq!(set.get_current(), Some(&FakeSet(70)));

        set.set_current(3).unwrap();
        assert_eq!(set.get_current(), Some(&FakeSet(30)));
        assert!(set.set_current(4).is_err());

        assert!(set.add(16, FakeSet(0)).is_err());
    }

    #[test]
    fn replace_same_id() {
        let pool = ObjectPool::default();
        let mut set = HeaderSet::new(15, pool.clone());

        let first = set.add(5, FakeSet(1)).unwrap();
        set.add(5, FakeSet(2)).unwrap();

        assert_eq!(set.len(), 1);
        assert_eq!(set.get(5), Some(&FakeSet(2)));

        // A slice still holds the old one.
        assert_eq!(pool.free_len(), 0);
        assert_eq!(**first, FakeSet(1));
        drop(first);
        assert_eq!(pool.free_len(), 1);
    }

    #[test]
    fn shared_entries_outlive_removal() {
        let pool = ObjectPool::default();
        let mut set = HeaderSet::new(15, pool.clone());

        set.add(1, FakeSet(10)).unwrap();
        let held = set.get_shared(1).unwrap();

        set.remove(1);
        assert!(set.get(1).is_none());
        assert!(set.get_current().is_none());
        assert_eq!(held.0, 10);
        assert_eq!(pool.free_len(), 0);

        drop(held);
        assert_eq!(pool.free_len(), 1);
    }

    #[test]
    fn partial_and_full_reset() {
        let pool = ObjectPool::default();
        let mut set = HeaderSet::new(15, pool.clone());
        set.add(0, FakeSet(0)).unwrap();
        set.add(1, FakeSet(1)).unwrap();

        set.reset(true);
        assert!(set.get_current().is_none());
        assert_eq!(set.len(), 2);

        set.reset(false);
        assert!(set.is_empty());
        assert_eq!(pool.free_len(), 2);
    }
}
