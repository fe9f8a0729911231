//! # Synchronization Primitives
//!
//! Fence timeline and fences for CPU-GPU synchronization.
//!
//! The timeline is a pair of monotonically increasing counters: the last
//! sequence number handed to the kernel and the last sequence number the GPU
//! reported complete. A [`Fence`] is created for a command stream before that
//! stream is submitted; it receives its sequence number at emission, so a
//! fence can be attached to resources while the commands that use them are
//! still being recorded.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};

// =============================================================================
// TIMEOUT
// =============================================================================

/// Bounded wait duration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timeout {
    nanos: u64,
}

impl Timeout {
    /// Do not wait at all
    pub const ZERO: Self = Self { nanos: 0 };

    /// Create from nanoseconds
    pub const fn from_nanos(nanos: u64) -> Self {
        Self { nanos }
    }

    /// Create from milliseconds
    pub const fn from_millis(ms: u64) -> Self {
        Self {
            nanos: ms * 1_000_000,
        }
    }

    /// Get as nanoseconds
    pub const fn as_nanos(self) -> u64 {
        self.nanos
    }
}

// =============================================================================
// FENCE TIMELINE
// =============================================================================

/// Monotonic sequence shared by every fence of one submission queue
#[derive(Debug, Default)]
pub struct FenceTimeline {
    /// Last sequence number handed out at emission
    emitted: AtomicU64,
    /// Last sequence number reported complete
    completed: AtomicU64,
}

impl FenceTimeline {
    /// Create an idle timeline
    pub const fn new() -> Self {
        Self {
            emitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    /// Reserve the next sequence number
    fn advance(&self) -> u64 {
        self.emitted.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Last emitted sequence number
    pub fn last_emitted(&self) -> u64 {
        self.emitted.load(Ordering::Acquire)
    }

    /// Last completed sequence number
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Report completion up to `seq`; never moves backwards
    pub fn signal(&self, seq: u64) {
        self.completed.fetch_max(seq, Ordering::AcqRel);
    }

    /// Check if `seq` has completed
    #[inline]
    pub fn is_reached(&self, seq: u64) -> bool {
        seq != 0 && self.completed() >= seq
    }

    /// Check if every emitted sequence has completed
    pub fn is_idle(&self) -> bool {
        self.completed() >= self.last_emitted()
    }
}

// =============================================================================
// FENCE
// =============================================================================

struct FenceState {
    /// Zero until emitted
    sequence: AtomicU64,
    timeline: Arc<FenceTimeline>,
}

/// Completion marker for one submission
///
/// Cloning is cheap; all clones observe the same emission.
#[derive(Clone)]
pub struct Fence {
    state: Arc<FenceState>,
}

impl Fence {
    /// Create an unemitted fence on `timeline`
    pub fn new(timeline: &Arc<FenceTimeline>) -> Self {
        Self {
            state: Arc::new(FenceState {
                sequence: AtomicU64::new(0),
                timeline: Arc::clone(timeline),
            }),
        }
    }

    /// Assign the next sequence number of the timeline
    ///
    /// Callers serialize emission with submission so sequence order equals
    /// queue order.
    pub fn emit(&self) -> Result<u64> {
        if self.is_emitted() {
            return Err(Error::InvalidState);
        }
        let seq = self.state.timeline.advance();
        self.state.sequence.store(seq, Ordering::Release);
        Ok(seq)
    }

    /// Sequence number, if emitted
    pub fn sequence(&self) -> Option<u64> {
        match self.state.sequence.load(Ordering::Acquire) {
            0 => None,
            seq => Some(seq),
        }
    }

    /// Check if the fence has been emitted
    pub fn is_emitted(&self) -> bool {
        self.sequence().is_some()
    }

    /// Check if the GPU has passed this fence
    pub fn is_signalled(&self) -> bool {
        self.sequence()
            .is_some_and(|seq| self.state.timeline.is_reached(seq))
    }

    /// Timeline this fence belongs to
    pub fn timeline(&self) -> &Arc<FenceTimeline> {
        &self.state.timeline
    }

    /// Check if both handles refer to the same fence
    pub fn ptr_eq(&self, other: &Fence) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Block until signalled
    ///
    /// A wait that expires means the GPU stopped making progress and is
    /// reported as [`Error::DeviceLost`].
    pub fn wait(&self, waiter: &mut dyn FenceWaiter, timeout: Timeout) -> Result<()> {
        if self.is_signalled() {
            return Ok(());
        }
        if waiter.wait_fence(self, timeout)? && self.is_signalled() {
            return Ok(());
        }
        log::error!(
            "fence {:?} did not signal within {} ns (completed {})",
            self.sequence(),
            timeout.as_nanos(),
            self.state.timeline.completed()
        );
        Err(Error::DeviceLost)
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sequence() {
            Some(seq) => write!(f, "Fence({}, signalled: {})", seq, self.is_signalled()),
            None => write!(f, "Fence(pending)"),
        }
    }
}

// =============================================================================
// FENCE WAITER
// =============================================================================

/// Something that can block on a fence
///
/// Implementors emit the fence first when they own its unsubmitted stream.
pub trait FenceWaiter {
    /// Wait for `fence`; returns whether it signalled before `timeout`
    fn wait_fence(&mut self, fence: &Fence, timeout: Timeout) -> Result<bool>;
}

static_assertions::assert_impl_all!(Fence: Send, Sync, Clone);
static_assertions::assert_impl_all!(FenceTimeline: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    struct Retire;

    impl FenceWaiter for Retire {
        fn wait_fence(&mut self, fence: &Fence, _timeout: Timeout) -> Result<bool> {
            if let Some(seq) = fence.sequence() {
                fence.timeline().signal(seq);
            }
            Ok(fence.is_signalled())
        }
    }

    struct Hung;

    impl FenceWaiter for Hung {
        fn wait_fence(&mut self, _fence: &Fence, _timeout: Timeout) -> Result<bool> {
            Ok(false)
        }
    }

    #[test]
    fn test_fence_emission_order() {
        let timeline = Arc::new(FenceTimeline::new());
        let a = Fence::new(&timeline);
        let b = Fence::new(&timeline);
        assert!(!a.is_emitted());
        assert_eq!(b.emit(), Ok(1));
        assert_eq!(a.emit(), Ok(2));
        assert_eq!(a.emit(), Err(Error::InvalidState));
        assert_eq!(timeline.last_emitted(), 2);
    }

    #[test]
    fn test_fence_signalled() {
        let timeline = Arc::new(FenceTimeline::new());
        let fence = Fence::new(&timeline);
        assert!(!fence.is_signalled());
        fence.emit().unwrap();
        assert!(!fence.is_signalled());
        timeline.signal(1);
        assert!(fence.is_signalled());
        timeline.signal(0);
        assert!(fence.is_signalled());
        assert!(timeline.is_idle());
    }

    #[test]
    fn test_fence_wait() {
        let timeline = Arc::new(FenceTimeline::new());
        let fence = Fence::new(&timeline);
        fence.emit().unwrap();
        assert_eq!(fence.wait(&mut Hung, Timeout::from_millis(1)), Err(Error::DeviceLost));
        assert_eq!(fence.wait(&mut Retire, Timeout::from_millis(1)), Ok(()));
    }

    #[test]
    fn test_clones_share_emission() {
        let timeline = Arc::new(FenceTimeline::new());
        let fence = Fence::new(&timeline);
        let copy = fence.clone();
        fence.emit().unwrap();
        assert_eq!(copy.sequence(), Some(1));
        assert!(copy.ptr_eq(&fence));
    }
}
