//! Parameter Index - Device and Rank Lookup
//!
//! @version 0.2.6
//! @author `AutomataNexus` Development Team

use std::collections::HashMap;

use axonml_core::{Device, ParamId, Parameter};

use super::partition::Partition;

// =============================================================================
// DeviceShards
// =============================================================================

/// Parameters living on one device, split by owning rank.
#[derive(Debug, Clone)]
pub struct DeviceShards {
    /// The device.
    pub device: Device,
    /// Per rank, owned parameters sorted by ascending element count.
    pub per_rank: Vec<Vec<Parameter>>,
}

// =============================================================================
// ParamIndex
// =============================================================================

/// Derived view of a [`Partition`]: device to rank to size-sorted parameters,
/// plus the owner of every parameter.
#[derive(Debug, Clone)]
pub struct ParamIndex {
    shards: Vec<DeviceShards>,
    owners: HashMap<ParamId, usize>,
}

impl ParamIndex {
    /// Builds the index. Devices are listed in order of first appearance.
    #[must_use]
    pub fn build(partition: &Partition) -> Self {
        let world_size = partition.world_size();
        let mut shards: Vec<DeviceShards> = Vec::new();
        let mut owners = HashMap::new();

        for rank in 0..world_size {
            for param in partition.rank_params(rank) {
                owners.insert(param.id(), rank);

                let device = param.device();
                let pos = match shards.iter().position(|s| s.device == device) {
                    Some(pos) => pos,
                    None => {
                        shards.push(DeviceShards {
                            device,
                            per_rank: vec![Vec::new(); world_size],
                        });
                        shards.len() - 1
                    }
                };
                shards[pos].per_rank[rank].push(param.clone());
            }
        }

        // Stable, so equal sizes keep registration order.
        for shard in &mut shards {
            for params in &mut shard.per_rank {
                params.sort_by_key(Parameter::numel);
            }
        }

        Self { shards, owners }
    }

    /// Returns the per-device shards in device order.
    #[must_use]
    pub fn shards(&self) -> &[DeviceShards] {
        &self.shards
    }

    /// Returns the devices in order of first appearance.
    pub fn devices(&self) -> impl Iterator<Item = Device> + '_ {
        self.shards.iter().map(|s| s.device)
    }

    /// Returns the first device seen, or the CPU if there are no parameters.
    #[must_use]
    pub fn default_device(&self) -> Device {
        self.shards.first().map_or(Device::Cpu, |s| s.device)
    }

    /// Returns the rank owning `id`.
    #[must_use]
    pub fn owner(&self, id: ParamId) -> Option<usize> {
        self.owners.get(&id).copied()
    }

    /// Iterates over every indexed parameter.
    pub fn params(&self) -> impl Iterator<Item = &Parameter> {
        self.shards
            .iter()
            .flat_map(|s| s.per_rank.iter().flat_map(|params| params.iter()))
    }

    /// Returns the number of indexed parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    /// Returns true if no parameter is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
