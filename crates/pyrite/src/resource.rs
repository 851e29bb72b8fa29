//! Resource limits, cancellation, and deadlines.
//!
//! The dispatch loop polls its tracker every N instructions (N is the
//! configurable check interval, default 1000). A cancelled handle or an
//! expired deadline surfaces as an execution-control signal that bypasses
//! user `except` handlers; memory and recursion ceilings behave the same
//! way. The `NoLimitTracker` variants compile to no-ops so unlimited
//! execution pays nothing for the hooks.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

/// Default interval (in executed instructions) between cancellation polls.
pub const DEFAULT_CHECK_INTERVAL: u32 = 1000;

/// Default cap on interpreter frame depth.
pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 1000;

/// Depth cap for data-structure recursion (repr, equality, hashing).
pub const MAX_DATA_RECURSION_DEPTH: u16 = 100;

/// Cap on MRO length, guarding against degenerate hierarchies.
pub const MAX_MRO_LENGTH: usize = 2600;

/// Hard cap on `str * n` results, in bytes.
pub const MAX_STR_REPEAT_BYTES: usize = 100 * 1024 * 1024;

/// Hard cap on `list * n` / `tuple * n` results, in items.
pub const MAX_SEQ_REPEAT_ITEMS: usize = 10_000_000;

/// A violated limit or an external stop request.
///
/// These are *execution-control signals*, not user exceptions: the VM
/// converts them into uncatchable errors so untrusted code cannot swallow
/// them with a bare `except`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// Memory ceiling exceeded (or an engine-internal size cap was hit).
    Memory {
        /// Bytes the tracker had accounted for when the ceiling was hit.
        allocated: usize,
        /// The configured ceiling.
        limit: usize,
    },
    /// Frame depth exceeded the recursion cap.
    Recursion {
        /// The configured cap.
        limit: usize,
    },
    /// The deadline passed; carries how far past it the poll observed.
    Timeout {
        /// Overshoot beyond the deadline at poll time.
        overshoot: Duration,
    },
    /// The cancel handle was triggered by the embedder.
    Cancelled,
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory { allocated, limit } => {
                write!(f, "memory limit exceeded: {allocated} bytes allocated, limit {limit}")
            }
            Self::Recursion { limit } => write!(f, "maximum recursion depth exceeded ({limit} frames)"),
            Self::Timeout { overshoot } => write!(f, "execution deadline exceeded by {overshoot:?}"),
            Self::Cancelled => write!(f, "execution cancelled"),
        }
    }
}

/// Shared cancellation handle with an optional deadline.
///
/// Cloning shares the underlying flag; the embedder keeps one clone and
/// hands the other to `execute_with_cancel`. `cancel()` is safe to call
/// from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
}

impl CancelHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a handle that also expires `timeout` from now.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                deadline: Some(Instant::now() + timeout),
            }),
        }
    }

    /// Requests cancellation; the interpreter observes it at its next poll.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Relaxed)
    }

    /// Polls the handle, reporting cancellation or deadline expiry.
    pub(crate) fn check(&self) -> Result<(), ResourceError> {
        if self.is_cancelled() {
            return Err(ResourceError::Cancelled);
        }
        if let Some(deadline) = self.inner.deadline {
            let now = Instant::now();
            if now > deadline {
                return Err(ResourceError::Timeout {
                    overshoot: now - deadline,
                });
            }
        }
        Ok(())
    }
}

/// Hooks the engine calls to account for resources.
///
/// Monomorphized into the heap and VM so that the no-op implementation
/// vanishes at compile time.
pub trait ResourceTracker: fmt::Debug {
    /// Called before each heap allocation with a lazily-computed size.
    fn on_allocate(&mut self, get_size: impl FnOnce() -> usize) -> Result<(), ResourceError>;

    /// Called when heap memory is released.
    fn on_free(&mut self, get_size: impl FnOnce() -> usize);

    /// Polled by the dispatch loop every check interval.
    fn check_time(&mut self) -> Result<(), ResourceError>;

    /// Checked before pushing a frame.
    fn check_recursion_depth(&self, current_depth: usize) -> Result<(), ResourceError>;
}

/// Tracker that enforces nothing; every hook is an inlined no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLimitTracker;

impl NoLimitTracker {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl ResourceTracker for NoLimitTracker {
    #[inline]
    fn on_allocate(&mut self, _get_size: impl FnOnce() -> usize) -> Result<(), ResourceError> {
        Ok(())
    }

    #[inline]
    fn on_free(&mut self, _get_size: impl FnOnce() -> usize) {}

    #[inline]
    fn check_time(&mut self) -> Result<(), ResourceError> {
        Ok(())
    }

    #[inline]
    fn check_recursion_depth(&self, _current_depth: usize) -> Result<(), ResourceError> {
        Ok(())
    }
}

/// Configuration for [`LimitedTracker`].
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    /// Heap memory ceiling in bytes; `None` means unlimited.
    pub max_memory: Option<usize>,
    /// Maximum interpreter frame depth.
    pub max_recursion_depth: usize,
    /// Wall-clock budget measured from tracker construction.
    pub timeout: Option<Duration>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory: None,
            max_recursion_depth: DEFAULT_MAX_RECURSION_DEPTH,
            timeout: None,
        }
    }
}

/// Tracker enforcing memory, recursion, deadline, and cancellation.
#[derive(Debug)]
pub struct LimitedTracker {
    limits: ResourceLimits,
    allocated: usize,
    deadline: Option<Instant>,
    cancel: Option<CancelHandle>,
}

impl LimitedTracker {
    #[must_use]
    pub fn new(limits: ResourceLimits) -> Self {
        let deadline = limits.timeout.map(|t| Instant::now() + t);
        Self {
            limits,
            allocated: 0,
            deadline,
            cancel: None,
        }
    }

    /// Attaches a cancellation handle, polled alongside the deadline.
    #[must_use]
    pub fn with_cancel(mut self, handle: CancelHandle) -> Self {
        self.cancel = Some(handle);
        self
    }

    /// Bytes currently accounted for.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.allocated
    }
}

impl ResourceTracker for LimitedTracker {
    fn on_allocate(&mut self, get_size: impl FnOnce() -> usize) -> Result<(), ResourceError> {
        let size = get_size();
        self.allocated = self.allocated.saturating_add(size);
        if let Some(limit) = self.limits.max_memory
            && self.allocated > limit
        {
            return Err(ResourceError::Memory {
                allocated: self.allocated,
                limit,
            });
        }
        Ok(())
    }

    fn on_free(&mut self, get_size: impl FnOnce() -> usize) {
        self.allocated = self.allocated.saturating_sub(get_size());
    }

    fn check_time(&mut self) -> Result<(), ResourceError> {
        if let Some(handle) = &self.cancel {
            handle.check()?;
        }
        if let Some(deadline) = self.deadline {
            let now = Instant::now();
            if now > deadline {
                return Err(ResourceError::Timeout {
                    overshoot: now - deadline,
                });
            }
        }
        Ok(())
    }

    fn check_recursion_depth(&self, current_depth: usize) -> Result<(), ResourceError> {
        if current_depth >= self.limits.max_recursion_depth {
            return Err(ResourceError::Recursion {
                limit: self.limits.max_recursion_depth,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_handle_observes_cancellation() {
        let handle = CancelHandle::new();
        assert!(handle.check().is_ok());
        handle.cancel();
        assert_eq!(handle.check(), Err(ResourceError::Cancelled));
    }

    #[test]
    fn memory_ceiling_trips() {
        let mut tracker = LimitedTracker::new(ResourceLimits {
            max_memory: Some(100),
            ..ResourceLimits::default()
        });
        assert!(tracker.on_allocate(|| 60).is_ok());
        assert!(matches!(tracker.on_allocate(|| 60), Err(ResourceError::Memory { .. })));
        tracker.on_free(|| 60);
        assert_eq!(tracker.allocated(), 60);
    }

    #[test]
    fn recursion_ceiling_trips() {
        let tracker = LimitedTracker::new(ResourceLimits {
            max_recursion_depth: 10,
            ..ResourceLimits::default()
        });
        assert!(tracker.check_recursion_depth(9).is_ok());
        assert!(tracker.check_recursion_depth(10).is_err());
    }
}
