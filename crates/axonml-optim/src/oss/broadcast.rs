//! Broadcast Coordinator - Publishing Updated Shards
//!
//! After a local update each rank is the only holder of fresh values for the
//! parameters it owns, so it acts as the broadcast source for them. Every rank
//! walks devices and source ranks in the same order and issues the same
//! sequence of broadcasts: first the parameters that bypass the arenas, then
//! the source rank's arena.
//!
//! @version 0.2.6
//! @author `AutomataNexus` Development Team

use std::collections::VecDeque;
use std::fmt;

use axonml_distributed::{ProcessGroup, Work};
use tracing::debug;

use super::bucket::BucketSet;
use super::index::ParamIndex;
use crate::error::Result;

// =============================================================================
// WorkHandle
// =============================================================================

/// Runs once the operation it is attached to has completed.
pub type Callback = Box<dyn FnOnce() + Send>;

/// An in-flight collective plus an optional completion callback.
pub struct WorkHandle {
    work: Box<dyn Work>,
    callback: Option<Callback>,
}

impl WorkHandle {
    /// Wraps an in-flight operation.
    #[must_use]
    pub fn new(work: Box<dyn Work>) -> Self {
        Self {
            work,
            callback: None,
        }
    }

    /// Attaches a callback run after completion.
    #[must_use]
    pub fn with_callback(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    fn finish(mut self) -> Result<()> {
        self.work.wait()?;
        if let Some(callback) = self.callback.take() {
            callback();
        }
        Ok(())
    }
}

impl fmt::Debug for WorkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkHandle")
            .field("completed", &self.work.is_completed())
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

// =============================================================================
// WorkQueue
// =============================================================================

/// FIFO of in-flight operations.
#[derive(Debug, Default)]
pub struct WorkQueue {
    pending: VecDeque<WorkHandle>,
}

impl WorkQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an operation.
    pub fn push(&mut self, handle: WorkHandle) {
        self.pending.push_back(handle);
    }

    /// Returns the number of pending operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns true if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Waits for every pending operation in order, running callbacks.
    pub fn drain(&mut self) -> Result<()> {
        while let Some(handle) = self.pending.pop_front() {
            handle.finish()?;
        }
        Ok(())
    }

    /// Retires completed operations from the head without blocking.
    ///
    /// Stops at the first operation still in flight. Returns how many were
    /// retired.
    pub fn try_drain(&mut self) -> Result<usize> {
        let mut retired = 0;
        while self
            .pending
            .front()
            .map_or(false, |handle| handle.work.is_completed())
        {
            if let Some(handle) = self.pending.pop_front() {
                handle.finish()?;
                retired += 1;
            }
        }
        Ok(retired)
    }
}

// =============================================================================
// Publishing
// =============================================================================

/// Queues the broadcasts that bring every rank up to date with every owner.
///
/// For each device and each source rank: one broadcast per parameter that
/// bypasses the arenas (in size order), then the arena itself, which is sent
/// even when empty so all ranks issue identical sequences.
pub fn publish(
    group: &ProcessGroup,
    index: &ParamIndex,
    buckets: &BucketSet,
    queue: &mut WorkQueue,
) -> Result<()> {
    for shard in index.shards() {
        for (src, params) in shard.per_rank.iter().enumerate() {
            for param in params.iter().filter(|p| buckets.is_direct(p.id())) {
                let work = group.broadcast(&param.storage(), src)?;
                queue.push(WorkHandle::new(work));
            }

            if let Some(bucket) = buckets.bucket(shard.device, src) {
                let work = group.broadcast(bucket.buffer(), src)?;
                queue.push(WorkHandle::new(work));
                queue.try_drain()?;
            }
        }
    }
    debug!(pending = queue.len(), "shard broadcasts issued");
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Completes once its shared flag is raised.
    struct Gated {
        ready: Arc<AtomicBool>,
        waited: Arc<AtomicUsize>,
    }

    impl Work for Gated {
        fn wait(&mut self) -> axonml_distributed::Result<()> {
            self.ready.store(true, Ordering::SeqCst);
            self.waited.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn is_completed(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }
    }

    fn gated(waited: &Arc<AtomicUsize>) -> (Arc<AtomicBool>, WorkHandle) {
        let ready = Arc::new(AtomicBool::new(false));
        let work = Gated {
            ready: Arc::clone(&ready),
            waited: Arc::clone(waited),
        };
        (ready, WorkHandle::new(Box::new(work)))
    }

    #[test]
    fn test_try_drain_stops_at_first_incomplete() {
        let waited = Arc::new(AtomicUsize::new(0));
        let mut queue = WorkQueue::new();

        let (first, a) = gated(&waited);
        let (_second, b) = gated(&waited);
        let (third, c) = gated(&waited);
        queue.push(a);
        queue.push(b);
        queue.push(c);

        first.store(true, Ordering::SeqCst);
        third.store(true, Ordering::SeqCst);

        assert_eq!(queue.try_drain().unwrap(), 1);
        assert_eq!(queue.len(), 2);
        assert_eq!(waited.load(Ordering::SeqCst), 1);

        queue.drain().unwrap();
        assert!(queue.is_empty());
        assert_eq!(waited.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_callbacks_run_in_order() {
        let waited = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut queue = WorkQueue::new();

        for i in 0..3 {
            let (_, handle) = gated(&waited);
            let order = Arc::clone(&order);
            queue.push(handle.with_callback(move || order.lock().unwrap().push(i)));
        }

        assert_eq!(queue.try_drain().unwrap(), 0);
        assert!(order.lock().unwrap().is_empty());

        queue.drain().unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }
}
