//! # Descriptor Heaps
//!
//! Screen-wide texture and sampler descriptor tables. Entries are handed out
//! per view or sampler id and replaced round-robin. An entry is never
//! overwritten while a context slot points at it or while its last user has
//! not finished on the GPU.

use alloc::vec::Vec;
use core::hash::Hash;

use hashbrown::HashMap;

use basalt_core::{Error, Fence, Result, ShaderStage};
use basalt_cmd::DescriptorTable;

#[derive(Debug, Clone)]
struct Entry<K> {
    key: Option<K>,
    /// Fence of the last batch that referenced the entry
    fence: Option<Fence>,
    /// Context slots currently pointing here
    bound: u32,
}

impl<K> Entry<K> {
    fn is_free(&self) -> bool {
        self.bound == 0 && self.fence.as_ref().is_none_or(Fence::is_signalled)
    }
}

/// Heap entries the slots of one context point at
#[derive(Debug, Default)]
pub(crate) struct SlotLocks {
    slots: HashMap<(ShaderStage, u8), u32>,
}

impl SlotLocks {
    /// Entry `slot` of `stage` points at
    #[cfg(test)]
    pub(crate) fn get(&self, stage: ShaderStage, slot: u8) -> Option<u32> {
        self.slots.get(&(stage, slot)).copied()
    }
}

/// Descriptor heap statistics
#[derive(Debug, Clone, Default)]
pub struct HeapStats {
    /// Lookups that found the key resident
    pub hits: u64,
    /// Entries written
    pub writes: u64,
    /// Resident keys displaced
    pub evictions: u64,
    /// Entries skipped because a slot was bound to them or the GPU still
    /// used them
    pub busy_skips: u64,
}

/// Fence-gated descriptor table allocator
#[derive(Debug)]
pub struct DescriptorHeap<K> {
    table: DescriptorTable,
    entries: Vec<Entry<K>>,
    index: HashMap<K, u32>,
    next: u32,
    stats: HeapStats,
}

impl<K: Copy + Eq + Hash> DescriptorHeap<K> {
    /// Create a heap of `size` entries
    pub fn new(table: DescriptorTable, size: u32) -> Self {
        Self {
            table,
            entries: (0..size.max(1))
                .map(|_| Entry {
                    key: None,
                    fence: None,
                    bound: 0,
                })
                .collect(),
            index: HashMap::new(),
            next: 0,
            stats: HeapStats::default(),
        }
    }

    /// Table this heap fills
    pub fn table(&self) -> DescriptorTable {
        self.table
    }

    /// Entry holding `key`, allocating one if needed
    ///
    /// Returns the index and whether the descriptor must be written.
    pub fn lookup(&mut self, key: K) -> Result<(u32, bool)> {
        if let Some(&index) = self.index.get(&key) {
            self.stats.hits += 1;
            return Ok((index, false));
        }
        let size = self.entries.len() as u32;
        for step in 0..size {
            let index = (self.next + step) % size;
            let entry = &mut self.entries[index as usize];
            if !entry.is_free() {
                self.stats.busy_skips += 1;
                continue;
            }
            if let Some(old) = entry.key.replace(key) {
                self.index.remove(&old);
                self.stats.evictions += 1;
            }
            entry.fence = None;
            self.index.insert(key, index);
            self.next = (index + 1) % size;
            self.stats.writes += 1;
            return Ok((index, true));
        }
        log::warn!("{:?} descriptor heap: all {} entries bound or in flight", self.table, size);
        Err(Error::Busy)
    }

    /// Point `slot` of `stage` at `index`, releasing the entry it held
    ///
    /// `fence` belongs to the batch holding the bind record. Both entries
    /// stay reserved until it signals.
    pub(crate) fn rebind(
        &mut self,
        locks: &mut SlotLocks,
        stage: ShaderStage,
        slot: u8,
        index: Option<u32>,
        fence: &Fence,
    ) {
        let old = match index {
            Some(index) => {
                if let Some(entry) = self.entries.get_mut(index as usize) {
                    entry.bound += 1;
                    entry.fence = Some(fence.clone());
                }
                locks.slots.insert((stage, slot), index)
            }
            None => locks.slots.remove(&(stage, slot)),
        };
        if let Some(entry) = old.and_then(|old| self.entries.get_mut(old as usize)) {
            entry.bound = entry.bound.saturating_sub(1);
            entry.fence = Some(fence.clone());
        }
    }

    /// Release every entry a context's slots hold
    pub(crate) fn release(&mut self, locks: &mut SlotLocks, fence: Option<&Fence>) {
        for (_, index) in locks.slots.drain() {
            if let Some(entry) = self.entries.get_mut(index as usize) {
                entry.bound = entry.bound.saturating_sub(1);
                if let Some(fence) = fence {
                    entry.fence = Some(fence.clone());
                }
            }
        }
    }

    /// Number of entries some slot points at
    pub fn bound_entries(&self) -> usize {
        self.entries.iter().filter(|e| e.bound > 0).count()
    }

    /// Forget `key`, forcing its descriptor to be rewritten on next use
    pub fn remove(&mut self, key: K) -> bool {
        match self.index.remove(&key) {
            Some(index) => {
                self.entries[index as usize].key = None;
                true
            }
            None => false,
        }
    }

    /// Number of resident keys
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Check if no key is resident
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Get statistics
    pub fn stats(&self) -> &HeapStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use basalt_core::FenceTimeline;

    #[test]
    fn test_hit_after_insert() {
        let mut heap = DescriptorHeap::<u32>::new(DescriptorTable::Texture, 4);
        assert_eq!(heap.lookup(10), Ok((0, true)));
        assert_eq!(heap.lookup(10), Ok((0, false)));
        assert_eq!(heap.lookup(11), Ok((1, true)));
        assert_eq!(heap.stats().hits, 1);
    }

    #[test]
    fn test_round_robin_skips_busy() {
        let timeline = Arc::new(FenceTimeline::new());
        let fence = Fence::new(&timeline);
        let mut heap = DescriptorHeap::<u32>::new(DescriptorTable::Sampler, 2);
        let (a, _) = heap.lookup(1).unwrap();
        let (b, _) = heap.lookup(2).unwrap();
        let mut locks = SlotLocks::default();
        heap.rebind(&mut locks, ShaderStage::Fragment, 0, Some(a), &fence);
        heap.rebind(&mut locks, ShaderStage::Fragment, 0, None, &fence);

        // Entry `a` is next in line but in flight, so `b` is displaced.
        assert_eq!(heap.lookup(3), Ok((b, true)));
        assert_eq!(heap.lookup(2), Ok((b, true)));
        assert_eq!(heap.lookup(1), Ok((a, false)));
        assert_eq!(heap.stats().busy_skips, 2);
    }

    #[test]
    fn test_all_busy() {
        let timeline = Arc::new(FenceTimeline::new());
        let fence = Fence::new(&timeline);
        let mut heap = DescriptorHeap::<u32>::new(DescriptorTable::Texture, 1);
        let (a, _) = heap.lookup(1).unwrap();
        let mut locks = SlotLocks::default();
        heap.rebind(&mut locks, ShaderStage::Fragment, 0, Some(a), &fence);
        heap.rebind(&mut locks, ShaderStage::Fragment, 0, None, &fence);
        assert_eq!(heap.lookup(2), Err(Error::Busy));

        fence.emit().unwrap();
        timeline.signal(1);
        assert_eq!(heap.lookup(2), Ok((0, true)));
        assert_eq!(heap.stats().evictions, 1);
    }

    fn signalled() -> Fence {
        let timeline = Arc::new(FenceTimeline::new());
        let fence = Fence::new(&timeline);
        let seq = fence.emit().unwrap();
        timeline.signal(seq);
        fence
    }

    #[test]
    fn test_bound_entry_never_displaced() {
        let done = signalled();
        let mut heap = DescriptorHeap::<u32>::new(DescriptorTable::Texture, 2);
        let mut locks = SlotLocks::default();
        let (a, _) = heap.lookup(1).unwrap();
        heap.rebind(&mut locks, ShaderStage::Fragment, 0, Some(a), &done);
        let (b, _) = heap.lookup(2).unwrap();
        heap.rebind(&mut locks, ShaderStage::Fragment, 1, Some(b), &done);
        assert_eq!(heap.bound_entries(), 2);
        assert_eq!(heap.lookup(3), Err(Error::Busy));

        // Moving slot 1 to another entry frees `b` only.
        heap.rebind(&mut locks, ShaderStage::Fragment, 1, None, &done);
        assert_eq!(heap.lookup(3), Ok((b, true)));
        heap.rebind(&mut locks, ShaderStage::Fragment, 1, Some(b), &done);
        assert_eq!(locks.get(ShaderStage::Fragment, 0), Some(a));
        assert_eq!(heap.lookup(1), Ok((a, false)));

        heap.release(&mut locks, None);
        assert_eq!(heap.bound_entries(), 0);
        assert_eq!(locks.get(ShaderStage::Fragment, 1), None);
    }

    #[test]
    fn test_rebind_same_entry_keeps_one_lock() {
        let done = signalled();
        let mut heap = DescriptorHeap::<u32>::new(DescriptorTable::Sampler, 1);
        let mut locks = SlotLocks::default();
        let (a, _) = heap.lookup(7).unwrap();
        heap.rebind(&mut locks, ShaderStage::Compute, 3, Some(a), &done);
        heap.rebind(&mut locks, ShaderStage::Compute, 3, Some(a), &done);
        heap.rebind(&mut locks, ShaderStage::Compute, 3, None, &done);
        assert_eq!(heap.bound_entries(), 0);
        assert_eq!(heap.lookup(8), Ok((a, true)));
    }

    #[test]
    fn test_released_entry_waits_for_unbind_batch() {
        let timeline = Arc::new(FenceTimeline::new());
        let unbind = Fence::new(&timeline);
        let mut heap = DescriptorHeap::<u32>::new(DescriptorTable::Texture, 1);
        let mut locks = SlotLocks::default();
        let (a, _) = heap.lookup(1).unwrap();
        heap.rebind(&mut locks, ShaderStage::Vertex, 0, Some(a), &signalled());
        heap.rebind(&mut locks, ShaderStage::Vertex, 0, None, &unbind);
        assert_eq!(heap.lookup(2), Err(Error::Busy));

        let seq = unbind.emit().unwrap();
        timeline.signal(seq);
        assert_eq!(heap.lookup(2), Ok((a, true)));
    }

    #[test]
    fn test_remove_forces_rewrite() {
        let mut heap = DescriptorHeap::<u32>::new(DescriptorTable::Texture, 4);
        heap.lookup(5).unwrap();
        assert!(heap.remove(5));
        assert!(!heap.remove(5));
        assert_eq!(heap.lookup(5).map(|(_, fresh)| fresh), Ok(true));
    }
}
