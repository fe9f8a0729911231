//! # Deferred Free Tracking
//!
//! Hold freed memory until the GPU timeline has passed every fence that
//! guards it.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use basalt_core::Fence;

use crate::bo::Allocation;

// =============================================================================
// DEFERRED FREES
// =============================================================================

/// An item waiting for the GPU
#[derive(Debug)]
struct PendingFree<T> {
    item: T,
    fences: Vec<Fence>,
}

/// Tracker statistics
#[derive(Debug, Clone, Default)]
pub struct TrackerStats {
    /// Items queued behind a fence
    pub deferred: u64,
    /// Items released without waiting
    pub immediate: u64,
    /// Items released after their fences signalled
    pub collected: u64,
}

/// Queue of items released once all their fences signal
#[derive(Debug)]
pub struct DeferredFrees<T> {
    pending: Vec<PendingFree<T>>,
    stats: TrackerStats,
}

impl<T> DeferredFrees<T> {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            stats: TrackerStats::default(),
        }
    }

    /// Queue `item` behind `fences`
    ///
    /// Returns the item back when no fence is outstanding.
    pub fn push(&mut self, item: T, fences: impl IntoIterator<Item = Fence>) -> Option<T> {
        let fences: Vec<Fence> = fences.into_iter().filter(|f| !f.is_signalled()).collect();
        if fences.is_empty() {
            self.stats.immediate += 1;
            return Some(item);
        }
        self.stats.deferred += 1;
        self.pending.push(PendingFree { item, fences });
        None
    }

    /// Remove every item whose fences have all signalled
    pub fn collect(&mut self) -> Vec<T> {
        let mut freed = Vec::new();
        let mut i = 0;

        while i < self.pending.len() {
            self.pending[i].fences.retain(|f| !f.is_signalled());
            if self.pending[i].fences.is_empty() {
                let pending = self.pending.swap_remove(i);
                freed.push(pending.item);
            } else {
                i += 1;
            }
        }

        self.stats.collected += freed.len() as u64;
        freed
    }

    /// Number of items still waiting
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Check if nothing is waiting
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Get statistics
    pub fn stats(&self) -> &TrackerStats {
        &self.stats
    }
}

impl<T> Default for DeferredFrees<T> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// RETIRE QUEUE
// =============================================================================

/// Storage dropped by its last owner, with the fences that still guard it
#[derive(Debug)]
pub struct Retired {
    /// Backing memory
    pub allocation: Allocation,
    /// Outstanding fences at drop time
    pub fences: Vec<Fence>,
}

/// Hand-off from resource destructors to the memory manager
///
/// Destructors only push; the manager drains the queue on its next
/// `reclaim`.
#[derive(Debug, Clone, Default)]
pub struct RetireQueue {
    inner: Arc<Mutex<Vec<Retired>>>,
}

impl RetireQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue storage for fence-gated release
    pub fn retire(&self, allocation: Allocation, fences: Vec<Fence>) {
        self.inner.lock().push(Retired { allocation, fences });
    }

    /// Take everything queued so far
    pub fn take(&self) -> Vec<Retired> {
        core::mem::take(&mut *self.inner.lock())
    }

    /// Number of queued entries
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_core::FenceTimeline;

    #[test]
    fn test_immediate_when_idle() {
        let mut frees = DeferredFrees::new();
        assert_eq!(frees.push(7u32, Vec::new()), Some(7));
        assert!(frees.is_empty());
    }

    #[test]
    fn test_deferred_until_all_fences() {
        let timeline = Arc::new(FenceTimeline::new());
        let read = Fence::new(&timeline);
        let write = Fence::new(&timeline);
        read.emit().unwrap();
        write.emit().unwrap();

        let mut frees = DeferredFrees::new();
        assert_eq!(frees.push(1u32, [read, write]), None);
        assert!(frees.collect().is_empty());

        timeline.signal(1);
        assert!(frees.collect().is_empty());
        assert_eq!(frees.len(), 1);

        timeline.signal(2);
        assert_eq!(frees.collect(), [1]);
        assert_eq!(frees.stats().collected, 1);
    }

    #[test]
    fn test_unemitted_fence_holds() {
        let timeline = Arc::new(FenceTimeline::new());
        let pending = Fence::new(&timeline);
        let mut frees = DeferredFrees::new();
        assert_eq!(frees.push(3u32, [pending.clone()]), None);
        timeline.signal(100);
        assert!(frees.collect().is_empty());
        pending.emit().unwrap();
        assert_eq!(frees.collect(), [3]);
    }
}
