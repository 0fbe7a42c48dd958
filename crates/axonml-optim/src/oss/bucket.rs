//! Bucket Allocator - Flat Broadcast Buffers
//!
//! Small trainable parameters owned by the same rank on the same device are
//! packed into one contiguous arena so that they travel in a single broadcast.
//! Packing walks each rank's parameters smallest first and re-points every
//! packed parameter at its window of the arena. Whatever does not fit, and
//! every frozen parameter, is broadcast on its own.
//!
//! A build always starts from fresh arenas; it never patches a previous one.
//!
//! @version 0.2.6
//! @author `AutomataNexus` Development Team

use std::collections::{HashMap, HashSet};

use axonml_core::{Device, ParamId, Storage};
use tracing::{debug, info};

use super::index::ParamIndex;
use crate::error::Result;

// =============================================================================
// Bucket
// =============================================================================

/// Position of a packed parameter inside its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketSlot {
    /// The packed parameter.
    pub param: ParamId,
    /// First element of the parameter's window.
    pub offset: usize,
    /// Number of elements.
    pub len: usize,
}

/// Arena for one (device, rank) pair.
#[derive(Debug)]
pub struct Bucket {
    buffer: Storage,
    slots: Vec<BucketSlot>,
}

impl Bucket {
    /// Returns the arena, truncated to the packed length.
    #[must_use]
    pub fn buffer(&self) -> &Storage {
        &self.buffer
    }

    /// Returns the packed parameters in packing order.
    #[must_use]
    pub fn slots(&self) -> &[BucketSlot] {
        &self.slots
    }

    /// Returns the number of packed elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns true if nothing was packed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

// =============================================================================
// BucketSet
// =============================================================================

/// All arenas of a partition plus the parameters that bypass them.
#[derive(Debug)]
pub struct BucketSet {
    capacity: usize,
    buckets: HashMap<(Device, usize), Bucket>,
    direct: HashSet<ParamId>,
    expected_work: usize,
}

impl BucketSet {
    /// Packs the parameters of `index` into arenas of at most `max_size` elements.
    ///
    /// The effective capacity is `max_size` clamped to the total trainable
    /// element count. A parameter is packed when it is trainable and ends
    /// strictly before the capacity.
    pub fn build(index: &ParamIndex, max_size: usize) -> Result<Self> {
        let model_size: usize = index
            .params()
            .filter(|p| p.requires_grad())
            .map(|p| p.numel())
            .sum();
        let capacity = max_size.min(model_size);
        info!(
            "Bucket size: {:.2}M parameters, model size {:.2}M parameters",
            capacity as f64 / 1e6,
            model_size as f64 / 1e6
        );

        let mut buckets = HashMap::new();
        let mut direct = HashSet::new();
        let mut expected_work = 0;

        for shard in index.shards() {
            for (rank, params) in shard.per_rank.iter().enumerate() {
                let mut arena = Storage::zeros(capacity, shard.device);
                let mut slots = Vec::new();
                let mut offset = 0;

                for param in params {
                    let numel = param.numel();
                    if param.requires_grad() && offset + numel < capacity {
                        let view = arena.slice(offset, numel)?;
                        view.copy_from(&param.storage())?;
                        param.set_storage(view)?;

                        if slots.is_empty() {
                            expected_work += 1;
                        }
                        slots.push(BucketSlot {
                            param: param.id(),
                            offset,
                            len: numel,
                        });
                        offset += numel;
                    } else {
                        direct.insert(param.id());
                        expected_work += 1;
                    }
                }

                arena.truncate(offset)?;
                debug!(device = %shard.device, rank, packed = slots.len(), len = offset, "bucket built");
                buckets.insert((shard.device, rank), Bucket { buffer: arena, slots });
            }
        }

        Ok(Self {
            capacity,
            buckets,
            direct,
            expected_work,
        })
    }

    /// Returns the arena capacity used for this build.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the arena for `rank` on `device`.
    #[must_use]
    pub fn bucket(&self, device: Device, rank: usize) -> Option<&Bucket> {
        self.buckets.get(&(device, rank))
    }

    /// Returns true if `id` is broadcast on its own.
    #[must_use]
    pub fn is_direct(&self, id: ParamId) -> bool {
        self.direct.contains(&id)
    }

    /// Returns true if `id` lives in an arena.
    #[must_use]
    pub fn is_bucketed(&self, id: ParamId) -> bool {
        self.buckets
            .values()
            .any(|b| b.slots.iter().any(|s| s.param == id))
    }

    /// Returns the number of operations one publish keeps in flight:
    /// non-empty arenas plus direct broadcasts.
    #[must_use]
    pub fn expected_work(&self) -> usize {
        self.expected_work
    }
}

// =============================================================================
// Tests
// =============================================================================
