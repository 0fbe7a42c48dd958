//! Backend - Communication Backend Abstractions
//!
//! Provides the collective-communication contract consumed by sharded
//! optimizers, and an in-process implementation where every rank is a thread.
//!
//! Broadcasts are asynchronous: they return a [`Work`] handle immediately and
//! the received data lands in the destination buffer when the handle is waited
//! on. All-reduce and byte broadcasts block until every participant arrived.
//!
//! @version 0.2.6
//! @author `AutomataNexus` Development Team

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axonml_core::Storage;
use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

// =============================================================================
// Reduce Operations
// =============================================================================

/// Reduction operation for collective communication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    /// Sum all values.
    Sum,
    /// Compute product of all values.
    Product,
    /// Find minimum value.
    Min,
    /// Find maximum value.
    Max,
    /// Compute average of all values.
    Average,
}

impl ReduceOp {
    /// Applies the reduction operation to two f32 values.
    ///
    /// `Average` combines like `Sum`; the division happens in [`reduce_slices`].
    ///
    /// [`reduce_slices`]: ReduceOp::reduce_slices
    #[must_use]
    pub fn apply_f32(&self, a: f32, b: f32) -> f32 {
        match self {
            ReduceOp::Sum | ReduceOp::Average => a + b,
            ReduceOp::Product => a * b,
            ReduceOp::Min => a.min(b),
            ReduceOp::Max => a.max(b),
        }
    }

    /// Reduces equally sized slices element-wise.
    #[must_use]
    pub fn reduce_slices(&self, slices: &[Vec<f32>]) -> Vec<f32> {
        let Some((first, rest)) = slices.split_first() else {
            return Vec::new();
        };

        let mut result = first.clone();
        for slice in rest {
            for (acc, &val) in result.iter_mut().zip(slice) {
                *acc = self.apply_f32(*acc, val);
            }
        }

        if *self == ReduceOp::Average {
            let count = slices.len() as f32;
            for val in &mut result {
                *val /= count;
            }
        }

        result
    }
}

// =============================================================================
// Work Handles
// =============================================================================

/// An in-flight collective operation.
pub trait Work: Send {
    /// Blocks until the operation finished and its result is in place.
    fn wait(&mut self) -> Result<()>;

    /// Returns true if [`Work::wait`] would not block.
    fn is_completed(&self) -> bool;
}

/// A handle for an operation that finished when it was issued.
#[derive(Debug, Default, Clone, Copy)]
pub struct CompletedWork;

impl Work for CompletedWork {
    fn wait(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_completed(&self) -> bool {
        true
    }
}

// =============================================================================
// Backend Trait
// =============================================================================

/// Trait for distributed communication backends.
///
/// `group` is the ordered list of participating global ranks; `src` is always
/// a global rank. Every participant must issue the same sequence of
/// collectives on a group with matching arguments.
pub trait Backend: Send + Sync {
    /// Returns the name of the backend.
    fn name(&self) -> &str;

    /// Returns the global rank of this process.
    fn rank(&self) -> usize;

    /// Returns the total world size.
    fn world_size(&self) -> usize;

    /// Sends `buffer` from `src` to every other member of `group`.
    ///
    /// On `src` the buffer is read; everywhere else it is overwritten once the
    /// returned handle completes.
    fn broadcast(&self, buffer: &Storage, src: usize, group: &[usize]) -> Result<Box<dyn Work>>;

    /// Reduces `data` element-wise across `group`, leaving the result everywhere.
    fn all_reduce(&self, data: &mut [f32], op: ReduceOp, group: &[usize]) -> Result<()>;

    /// Sends an opaque payload from `src` to every member of `group`.
    ///
    /// Only `src` supplies a payload. Every caller gets the payload back.
    fn broadcast_bytes(&self, payload: Option<&[u8]>, src: usize, group: &[usize])
        -> Result<Vec<u8>>;
}

// =============================================================================
// Rendezvous State for Mock Backend
// =============================================================================

/// Identifies one collective: participant list plus per-group sequence number.
type SlotKey = (Vec<usize>, u64);

/// Arguments every participant of a collective has to agree on.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Signature {
    Broadcast { src: usize, len: usize },
    Bytes { src: usize },
    AllReduce { op: ReduceOp, len: usize },
}

#[derive(Debug)]
enum Posted {
    Floats(Vec<f32>),
    Bytes(Vec<u8>),
}

#[derive(Debug)]
struct Slot {
    signature: Signature,
    posted: Option<Posted>,
    parts: BTreeMap<usize, Vec<f32>>,
    /// Participants that still have to read `posted`.
    pending: usize,
    poisoned: Option<String>,
}

#[derive(Debug, Default)]
struct Rendezvous {
    slots: HashMap<SlotKey, Slot>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<Rendezvous>,
    ready: Condvar,
}

impl Shared {
    /// Waits until the slot has a posted result, reads it and releases the slot
    /// once the last reader is done.
    fn await_posted<T>(
        &self,
        key: &SlotKey,
        rank: usize,
        mut read: impl FnMut(&Posted) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.state.lock();
        loop {
            let slot = state.slots.get_mut(key).ok_or_else(|| {
                Error::InvalidGroup("collective released before every participant read it".into())
            })?;
            if let Some(reason) = &slot.poisoned {
                return Err(Error::CollectiveMismatch {
                    rank,
                    message: reason.clone(),
                });
            }
            if let Some(posted) = slot.posted.as_ref() {
                let value = read(posted)?;
                slot.pending -= 1;
                if slot.pending == 0 {
                    state.slots.remove(key);
                }
                return Ok(value);
            }
            self.ready.wait(&mut state);
        }
    }
}

// =============================================================================
// Mock Backend
// =============================================================================

/// An in-process backend for running every rank as a thread.
///
/// Ranks created by the same [`MockBackend::create_world`] call rendezvous
/// through shared memory. Collectives are matched by issue order per group, so
/// ranks that issue collectives in different orders block or fail exactly as
/// they would on a real transport.
pub struct MockBackend {
    rank: usize,
    world_size: usize,
    shared: Arc<Shared>,
    sequences: Mutex<HashMap<Vec<usize>, u64>>,
}

impl MockBackend {
    /// Creates one connected backend per rank.
    #[must_use]
    pub fn create_world(world_size: usize) -> Vec<Self> {
        let shared = Arc::new(Shared::default());

        (0..world_size)
            .map(|rank| MockBackend {
                rank,
                world_size,
                shared: Arc::clone(&shared),
                sequences: Mutex::new(HashMap::new()),
            })
            .collect()
    }

    /// Creates a single mock backend (rank 0, world size 1).
    #[must_use]
    pub fn single() -> Self {
        MockBackend {
            rank: 0,
            world_size: 1,
            shared: Arc::new(Shared::default()),
            sequences: Mutex::new(HashMap::new()),
        }
    }

    fn next_key(&self, group: &[usize]) -> Result<SlotKey> {
        if !group.contains(&self.rank) {
            return Err(Error::InvalidGroup(format!(
                "rank {} is not a member of {:?}",
                self.rank, group
            )));
        }
        if let Some(&rank) = group.iter().find(|&&r| r >= self.world_size) {
            return Err(Error::RankOutOfBounds {
                rank,
                size: self.world_size,
            });
        }

        let mut sequences = self.sequences.lock();
        let seq = sequences.entry(group.to_vec()).or_insert(0);
        let key = (group.to_vec(), *seq);
        *seq += 1;
        Ok(key)
    }

    fn check_source(src: usize, group: &[usize]) -> Result<()> {
        if group.contains(&src) {
            Ok(())
        } else {
            Err(Error::RankOutOfBounds {
                rank: src,
                size: group.len(),
            })
        }
    }

    fn poison(&self, state: &mut Rendezvous, key: &SlotKey, reason: String) -> Error {
        if let Some(slot) = state.slots.get_mut(key) {
            slot.poisoned = Some(reason.clone());
        }
        self.shared.ready.notify_all();
        Error::CollectiveMismatch {
            rank: self.rank,
            message: reason,
        }
    }

    /// Registers this rank with the collective at `key`, creating it if first.
    fn join(
        &self,
        state: &mut Rendezvous,
        key: &SlotKey,
        signature: Signature,
        readers: usize,
    ) -> Result<()> {
        let slot = state.slots.entry(key.clone()).or_insert_with(|| Slot {
            signature: signature.clone(),
            posted: None,
            parts: BTreeMap::new(),
            pending: readers,
            poisoned: None,
        });

        if let Some(reason) = &slot.poisoned {
            return Err(Error::CollectiveMismatch {
                rank: self.rank,
                message: reason.clone(),
            });
        }
        if slot.signature != signature {
            let reason = format!("expected {:?}, got {:?}", slot.signature, signature);
            return Err(self.poison(state, key, reason));
        }
        Ok(())
    }

    /// Publishes the result of the collective at `key`.
    fn post(&self, state: &mut Rendezvous, key: &SlotKey, posted: Posted) {
        let no_readers = state.slots.get(key).map_or(false, |slot| slot.pending == 0);
        if no_readers {
            state.slots.remove(key);
        } else if let Some(slot) = state.slots.get_mut(key) {
            slot.posted = Some(posted);
        }
        self.shared.ready.notify_all();
    }
}

impl Backend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn broadcast(&self, buffer: &Storage, src: usize, group: &[usize]) -> Result<Box<dyn Work>> {
        Self::check_source(src, group)?;
        let key = self.next_key(group)?;
        let signature = Signature::Broadcast {
            src,
            len: buffer.len(),
        };

        let mut state = self.shared.state.lock();
        self.join(&mut state, &key, signature, group.len() - 1)?;

        if self.rank == src {
            self.post(&mut state, &key, Posted::Floats(buffer.to_vec()));
            return Ok(Box::new(CompletedWork));
        }

        Ok(Box::new(MockWork {
            shared: Arc::clone(&self.shared),
            key,
            rank: self.rank,
            target: buffer.clone(),
            done: false,
        }))
    }

    fn all_reduce(&self, data: &mut [f32], op: ReduceOp, group: &[usize]) -> Result<()> {
        let key = self.next_key(group)?;
        let signature = Signature::AllReduce {
            op,
            len: data.len(),
        };

        {
            let mut state = self.shared.state.lock();
            self.join(&mut state, &key, signature, group.len())?;

            let complete = match state.slots.get_mut(&key) {
                Some(slot) => {
                    slot.parts.insert(self.rank, data.to_vec());
                    (slot.parts.len() == group.len()).then(|| {
                        let parts: Vec<Vec<f32>> =
                            std::mem::take(&mut slot.parts).into_values().collect();
                        op.reduce_slices(&parts)
                    })
                }
                None => None,
            };
            if let Some(reduced) = complete {
                self.post(&mut state, &key, Posted::Floats(reduced));
            }
        }

        self.shared.await_posted(&key, self.rank, |posted| match posted {
            Posted::Floats(reduced) => {
                data.copy_from_slice(reduced);
                Ok(())
            }
            Posted::Bytes(_) => Err(Error::InvalidGroup("all-reduce slot holds bytes".into())),
        })
    }

    fn broadcast_bytes(
        &self,
        payload: Option<&[u8]>,
        src: usize,
        group: &[usize],
    ) -> Result<Vec<u8>> {
        Self::check_source(src, group)?;
        let key = self.next_key(group)?;

        let mut state = self.shared.state.lock();
        self.join(&mut state, &key, Signature::Bytes { src }, group.len() - 1)?;

        if self.rank == src {
            let Some(bytes) = payload else {
                return Err(self.poison(&mut state, &key, format!("source rank {src} sent no payload")));
            };
            self.post(&mut state, &key, Posted::Bytes(bytes.to_vec()));
            return Ok(bytes.to_vec());
        }
        drop(state);

        self.shared.await_posted(&key, self.rank, |posted| match posted {
            Posted::Bytes(bytes) => Ok(bytes.clone()),
            Posted::Floats(_) => Err(Error::InvalidGroup("byte broadcast slot holds floats".into())),
        })
    }
}

/// Pending receive side of a mock broadcast.
struct MockWork {
    shared: Arc<Shared>,
    key: SlotKey,
    rank: usize,
    target: Storage,
    done: bool,
}

impl Work for MockWork {
    fn wait(&mut self) -> Result<()> {
        if self.done {
            return Ok(());
        }
        let target = &self.target;
        self.shared
            .await_posted(&self.key, self.rank, |posted| match posted {
                Posted::Floats(data) => Ok(target.copy_from_slice(data)?),
                Posted::Bytes(_) => Err(Error::InvalidGroup("broadcast slot holds bytes".into())),
            })?;
        self.done = true;
        Ok(())
    }

    fn is_completed(&self) -> bool {
        self.done
            || self
                .shared
                .state
                .lock()
                .slots
                .get(&self.key)
                .map_or(false, |slot| slot.posted.is_some() || slot.poisoned.is_some())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axonml_core::Device;
    use std::thread;

    fn run_world<T, F>(world_size: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(MockBackend) -> T + Sync,
    {
        let f = &f;
        thread::scope(|s| {
            let handles: Vec<_> = MockBackend::create_world(world_size)
                .into_iter()
                .map(|backend| s.spawn(move || f(backend)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn test_reduce_op_apply() {
        assert_eq!(ReduceOp::Sum.apply_f32(1.0, 2.0), 3.0);
        assert_eq!(ReduceOp::Product.apply_f32(2.0, 3.0), 6.0);
        assert_eq!(ReduceOp::Min.apply_f32(2.0, 3.0), 2.0);
        assert_eq!(ReduceOp::Max.apply_f32(2.0, 3.0), 3.0);
    }

    #[test]
    fn test_reduce_slices() {
        let slices = vec![vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]];
        assert_eq!(ReduceOp::Sum.reduce_slices(&slices), vec![9.0, 12.0]);
        assert_eq!(ReduceOp::Average.reduce_slices(&slices), vec![3.0, 4.0]);
        assert!(ReduceOp::Max.reduce_slices(&[]).is_empty());
    }

    #[test]
    fn test_mock_backend_world() {
        let backends = MockBackend::create_world(4);
        assert_eq!(backends.len(), 4);
        for (i, b) in backends.iter().enumerate() {
            assert_eq!(b.rank(), i);
            assert_eq!(b.world_size(), 4);
            assert_eq!(b.name(), "mock");
        }
    }

    #[test]
    fn test_mock_single_rank_collectives() {
        let backend = MockBackend::single();
        let mut data = vec![1.0, 2.0];
        backend.all_reduce(&mut data, ReduceOp::Sum, &[0]).unwrap();
        assert_eq!(data, vec![1.0, 2.0]);

        let buffer = Storage::from_vec(vec![4.0], Device::Cpu);
        let mut work = backend.broadcast(&buffer, 0, &[0]).unwrap();
        assert!(work.is_completed());
        work.wait().unwrap();
    }

    #[test]
    fn test_mock_broadcast_async() {
        let results = run_world(3, |backend| {
            let rank = backend.rank();
            let buffer = Storage::from_vec(vec![rank as f32; 3], Device::Cpu);
            let mut first = backend.broadcast(&buffer, 1, &[0, 1, 2]).unwrap();
            first.wait().unwrap();

            let second_buf = Storage::from_vec(vec![10.0 * rank as f32], Device::Cpu);
            let mut second = backend.broadcast(&second_buf, 2, &[0, 1, 2]).unwrap();
            second.wait().unwrap();
            assert!(second.is_completed());
            (buffer.to_vec(), second_buf.to_vec())
        });

        for (first, second) in results {
            assert_eq!(first, vec![1.0, 1.0, 1.0]);
            assert_eq!(second, vec![20.0]);
        }
    }

    #[test]
    fn test_mock_all_reduce() {
        let results = run_world(4, |backend| {
            let mut data = vec![backend.rank() as f32, 1.0];
            backend.all_reduce(&mut data, ReduceOp::Sum, &[0, 1, 2, 3]).unwrap();
            let mut peak = vec![backend.rank() as f32];
            backend.all_reduce(&mut peak, ReduceOp::Max, &[0, 1, 2, 3]).unwrap();
            (data, peak)
        });

        for (data, peak) in results {
            assert_eq!(data, vec![6.0, 4.0]);
            assert_eq!(peak, vec![3.0]);
        }
    }

    #[test]
    fn test_mock_all_reduce_subgroup() {
        let results = run_world(3, |backend| {
            if backend.rank() == 1 {
                return None;
            }
            let mut data = vec![backend.rank() as f32 + 1.0];
            backend.all_reduce(&mut data, ReduceOp::Product, &[0, 2]).unwrap();
            Some(data[0])
        });
        assert_eq!(results, vec![Some(3.0), None, Some(3.0)]);
    }

    #[test]
    fn test_mock_broadcast_bytes() {
        let results = run_world(3, |backend| {
            let payload = b"shard".to_vec();
            let mine = (backend.rank() == 2).then_some(payload.as_slice());
            backend.broadcast_bytes(mine, 2, &[0, 1, 2]).unwrap()
        });
        for bytes in results {
            assert_eq!(bytes, b"shard".to_vec());
        }
    }

    #[test]
    fn test_mock_all_reduce_length_mismatch() {
        let results = run_world(2, |backend| {
            let mut data = vec![0.0; 2 + backend.rank()];
            backend.all_reduce(&mut data, ReduceOp::Sum, &[0, 1])
        });
        for result in results {
            assert!(matches!(result, Err(Error::CollectiveMismatch { .. })));
        }
    }

    #[test]
    fn test_mock_broadcast_source_mismatch() {
        let results = run_world(2, |backend| {
            let buffer = Storage::zeros(2, Device::Cpu);
            let src = backend.rank();
            backend
                .broadcast(&buffer, src, &[0, 1])
                .and_then(|mut work| work.wait())
        });
        assert!(results.iter().any(Result::is_err));
    }

    #[test]
    fn test_mock_rejects_foreign_group() {
        let backends = MockBackend::create_world(2);
        let mut data = vec![1.0];
        let err = backends[0].all_reduce(&mut data, ReduceOp::Sum, &[1]).unwrap_err();
        assert!(matches!(err, Error::InvalidGroup(_)));

        let buffer = Storage::zeros(1, Device::Cpu);
        assert!(backends[0].broadcast(&buffer, 5, &[0, 1]).is_err());
    }
}
