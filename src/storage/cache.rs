//! # LRU Page Pools
//!
//! The page cache is split into two pools with independent capacities: one
//! for data and large-object pages, one for system pages (catalog,
//! allocation maps, index pages). A pool is a plain LRU: a hit promotes the
//! page to most-recently-used, an insert into a full pool evicts the
//! least-recently-used slot first.
//!
//! Pools are not synchronized here; [`super::engine::StorageEngine`] wraps
//! each pool in a `parking_lot::RwLock` and takes the write lock for every
//! access, including logical reads, because LRU promotion mutates the
//! recency list. Eviction write-back is the engine's job too; a pool only
//! hands the victim slot back, it never touches the file.
//!
//! A slot's dirty flag is the sole write-back signal: pages reached through
//! `page_mut` are marked dirty, and a clean victim is dropped without I/O.

use std::collections::VecDeque;

use hashbrown::HashMap;

use crate::storage::page::Page;

/// One cached page plus its dirty flag.
#[derive(Debug)]
pub struct CacheSlot {
    page: Page,
    dirty: bool,
}

impl CacheSlot {
    pub fn clean(page: Page) -> Self {
        Self { page, dirty: false }
    }

    pub fn dirty(page: Page) -> Self {
        Self { page, dirty: true }
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    /// Mutable access marks the slot dirty; eviction will write it back.
    pub fn page_mut(&mut self) -> &mut Page {
        self.dirty = true;
        &mut self.page
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }
}

/// Fixed-capacity LRU pool keyed by page id.
#[derive(Debug)]
pub(crate) struct PagePool {
    label: &'static str,
    capacity: usize,
    slots: HashMap<u32, CacheSlot>,
    recency: VecDeque<u32>,
}

impl PagePool {
    pub(crate) fn new(label: &'static str, capacity: usize) -> Self {
        Self {
            label,
            capacity,
            slots: HashMap::with_capacity(capacity),
            recency: VecDeque::with_capacity(capacity),
        }
    }

    pub(crate) fn label(&self) -> &'static str {
        self.label
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn contains(&self, page_id: u32) -> bool {
        self.slots.contains_key(&page_id)
    }

    pub(crate) fn slot_mut(&mut self, page_id: u32) -> Option<&mut CacheSlot> {
        self.slots.get_mut(&page_id)
    }

    /// Promotes a page to most-recently-used.
    pub(crate) fn touch(&mut self, page_id: u32) {
        if let Some(pos) = self.recency.iter().position(|&id| id == page_id) {
            self.recency.remove(pos);
            self.recency.push_back(page_id);
        }
    }

    /// Removes and returns the least-recently-used slot. The caller decides
    /// whether the victim needs write-back.
    pub(crate) fn evict_lru(&mut self) -> Option<(u32, CacheSlot)> {
        let victim = self.recency.pop_front()?;
        let slot = self
            .slots
            .remove(&victim)
            .expect("recency list entry without a slot"); // INVARIANT: recency and slots move together
        Some((victim, slot))
    }

    pub(crate) fn needs_eviction(&self) -> bool {
        self.slots.len() >= self.capacity
    }

    /// Inserts a slot at most-recently-used. The pool must have room; the
    /// engine evicts (and writes back) before calling this.
    pub(crate) fn insert(&mut self, page_id: u32, slot: CacheSlot) {
        debug_assert!(
            self.slots.len() < self.capacity,
            "insert into full pool {}",
            self.label
        );
        let replaced = self.slots.insert(page_id, slot);
        if replaced.is_none() {
            self.recency.push_back(page_id);
        } else {
            self.touch(page_id);
        }
    }

    /// Page ids from least- to most-recently-used.
    pub(crate) fn lru_order(&self) -> Vec<u32> {
        self.recency.iter().copied().collect()
    }

    /// Dirty page ids in no particular order.
    pub(crate) fn dirty_pages(&self) -> Vec<u32> {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.is_dirty())
            .map(|(&id, _)| id)
            .collect()
    }
}
