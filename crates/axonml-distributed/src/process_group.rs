//! `ProcessGroup` - Process Group Abstraction
//!
//! A process group is an ordered subset of the world's ranks that issue
//! collectives together. Ranks passed to and returned from a group are local
//! (positions inside the group); translation to global ranks happens here
//! before anything reaches the backend.
//!
//! @version 0.2.6
//! @author `AutomataNexus` Development Team

use std::sync::Arc;

use axonml_core::Storage;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::backend::{Backend, MockBackend, ReduceOp, Work};
use crate::error::{Error, Result};

// =============================================================================
// ProcessGroup
// =============================================================================

/// A group of processes that can communicate with each other.
#[derive(Clone)]
pub struct ProcessGroup {
    backend: Arc<dyn Backend>,
    ranks: Vec<usize>,
    local_rank: usize,
}

impl ProcessGroup {
    /// Creates a process group spanning every rank of the backend.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        let world_size = backend.world_size();
        let local_rank = backend.rank();
        Self {
            backend,
            ranks: (0..world_size).collect(),
            local_rank,
        }
    }

    /// Creates a process group over specific global ranks.
    ///
    /// The calling process must be one of `ranks`.
    pub fn with_ranks(backend: Arc<dyn Backend>, ranks: Vec<usize>) -> Result<Self> {
        if let Some(&rank) = ranks.iter().find(|&&r| r >= backend.world_size()) {
            return Err(Error::RankOutOfBounds {
                rank,
                size: backend.world_size(),
            });
        }
        let local_rank = ranks
            .iter()
            .position(|&r| r == backend.rank())
            .ok_or_else(|| {
                Error::InvalidGroup(format!(
                    "rank {} is not a member of {:?}",
                    backend.rank(),
                    ranks
                ))
            })?;
        Ok(Self {
            backend,
            ranks,
            local_rank,
        })
    }

    /// Creates a single-rank group for testing.
    #[must_use]
    pub fn mock() -> Self {
        Self::new(Arc::new(MockBackend::single()))
    }

    /// Returns the backend.
    #[must_use]
    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// Returns this process's rank within the group.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.local_rank
    }

    /// Returns the number of processes in this group.
    #[must_use]
    pub fn world_size(&self) -> usize {
        self.ranks.len()
    }

    /// Translates a group-local rank to its global rank.
    pub fn global_rank(&self, local: usize) -> Result<usize> {
        self.ranks
            .get(local)
            .copied()
            .ok_or(Error::RankOutOfBounds {
                rank: local,
                size: self.ranks.len(),
            })
    }

    /// Returns the global ranks in this group.
    #[must_use]
    pub fn ranks(&self) -> &[usize] {
        &self.ranks
    }

    /// Checks if a global rank is part of the group.
    #[must_use]
    pub fn contains(&self, rank: usize) -> bool {
        self.ranks.contains(&rank)
    }

    /// Starts broadcasting `buffer` from local rank `src`.
    pub fn broadcast(&self, buffer: &Storage, src: usize) -> Result<Box<dyn Work>> {
        let src = self.global_rank(src)?;
        self.backend.broadcast(buffer, src, &self.ranks)
    }

    /// All-reduces `data` in place across the group.
    pub fn all_reduce(&self, data: &mut [f32], op: ReduceOp) -> Result<()> {
        self.backend.all_reduce(data, op, &self.ranks)
    }

    /// All-reduces a single value.
    pub fn all_reduce_scalar(&self, value: f32, op: ReduceOp) -> Result<f32> {
        let mut data = [value];
        self.all_reduce(&mut data, op)?;
        Ok(data[0])
    }

    /// Broadcasts a serializable object from local rank `src`.
    ///
    /// The source passes `Some(obj)`; every other rank passes `None` and
    /// receives the decoded copy.
    pub fn broadcast_object<T>(&self, obj: Option<&T>, src: usize) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let global_src = self.global_rank(src)?;
        let payload = if self.local_rank == src {
            obj.map(bincode::serialize).transpose()?
        } else {
            None
        };
        if let Some(bytes) = &payload {
            debug!(src, bytes = bytes.len(), "broadcasting object");
        }

        let bytes = self
            .backend
            .broadcast_bytes(payload.as_deref(), global_src, &self.ranks)?;
        Ok(bincode::deserialize(&bytes)?)
    }
}

impl std::fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("backend", &self.backend.name())
            .field("ranks", &self.ranks)
            .field("rank", &self.local_rank)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
