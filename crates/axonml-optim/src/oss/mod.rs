//! OSS - Optimizer State Sharding
//!
//! Wraps any [`Optimizer`] so that each rank of a process group only keeps
//! optimizer state for the parameters it owns (`ZeRO` stage 1). After the
//! local update, owners broadcast their fresh parameters so every rank ends
//! the step with identical weights.
//!
//! The wrapper exposes the full (public) parameter groups, so schedulers and
//! checkpointing code treat it like an unsharded optimizer:
//!
//! ```ignore
//! let group = ProcessGroup::new(backend);
//! let mut optimizer = OSS::new(
//!     vec![ParamGroup::new(model.parameters())],
//!     group,
//!     OssConfig::default(),
//!     |shard| SGD::from_groups(shard, SgdConfig::new(0.1).momentum(0.9)),
//! )?;
//! optimizer.step(None)?;
//! ```
//!
//! @version 0.2.6
//! @author `AutomataNexus` Development Team

pub mod broadcast;
pub mod bucket;
pub mod consolidate;
pub mod grad_norm;
pub mod index;
pub mod partition;

pub use broadcast::{WorkHandle, WorkQueue};
pub use bucket::{Bucket, BucketSet, BucketSlot};
pub use index::{DeviceShards, ParamIndex};
pub use partition::Partition;

use std::collections::HashMap;

use axonml_core::{Device, ParamId, Parameter};
use axonml_distributed::ProcessGroup;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::optimizer::{check_disjoint, Closure, Optimizer, Options, ParamGroup, ParamState};
use crate::state_dict::StateDict;

// =============================================================================
// OssConfig
// =============================================================================

/// Configuration for [`OSS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OssConfig {
    /// Maximum elements packed into one broadcast arena per device and rank.
    pub broadcast_buffer_size: usize,
}

impl Default for OssConfig {
    fn default() -> Self {
        Self {
            broadcast_buffer_size: 1 << 24,
        }
    }
}

impl OssConfig {
    /// Builder method to set the arena size.
    #[must_use]
    pub fn broadcast_buffer_size(mut self, elements: usize) -> Self {
        self.broadcast_buffer_size = elements;
        self
    }
}

// =============================================================================
// Shards
// =============================================================================

/// Everything derived from the public groups. Dropped whenever they change.
#[derive(Debug)]
struct Shards {
    partition: Partition,
    index: ParamIndex,
    buckets: BucketSet,
}

impl Shards {
    fn build(groups: &[ParamGroup], world_size: usize, config: &OssConfig) -> Result<Self> {
        let partition = Partition::greedy(groups, world_size);
        let index = ParamIndex::build(&partition);
        let buckets = BucketSet::build(&index, config.broadcast_buffer_size)?;
        Ok(Self {
            partition,
            index,
            buckets,
        })
    }
}

/// Returns the cached shards, rebuilding them first if they were invalidated.
fn cached<'a>(
    slot: &'a mut Option<Shards>,
    groups: &[ParamGroup],
    world_size: usize,
    config: &OssConfig,
) -> Result<&'a Shards> {
    let shards = match slot.take() {
        Some(shards) => shards,
        None => Shards::build(groups, world_size, config)?,
    };
    Ok(slot.insert(shards))
}

/// Copies every hyperparameter of `source` groups into `dest` groups.
fn sync_options(source: &[ParamGroup], dest: &mut [ParamGroup]) {
    for (src, dst) in source.iter().zip(dest.iter_mut()) {
        for (key, value) in &src.options {
            dst.options.insert(key.clone(), *value);
        }
    }
}

// =============================================================================
// OSS
// =============================================================================

/// Sharded optimizer wrapper.
///
/// Every method that communicates is collective: all ranks of the process
/// group must call it, in the same order, with matching arguments.
pub struct OSS<O: Optimizer> {
    optim: O,
    param_groups: Vec<ParamGroup>,
    group: ProcessGroup,
    rank: usize,
    world_size: usize,
    config: OssConfig,
    shards: Option<Shards>,
    queue: WorkQueue,
    consolidated: Vec<StateDict>,
    global: Option<StateDict>,
}

impl<O: Optimizer> OSS<O> {
    /// Partitions `groups` over `group` and builds the local optimizer for this
    /// rank's shard with `build`.
    ///
    /// `build` receives one group per public group (possibly empty), carrying
    /// the public group's hyperparameters.
    pub fn new<F>(groups: Vec<ParamGroup>, group: ProcessGroup, config: OssConfig, build: F) -> Result<Self>
    where
        F: FnOnce(Vec<ParamGroup>) -> Result<O>,
    {
        if groups.is_empty() {
            return Err(Error::EmptyParameters);
        }
        check_disjoint(&groups)?;

        let rank = group.rank();
        let world_size = group.world_size();
        let mut shards = None;
        let local_groups = cached(&mut shards, &groups, world_size, &config)?
            .partition
            .rank_groups(rank)
            .to_vec();
        let optim = build(local_groups)?;

        let mut oss = Self {
            optim,
            param_groups: groups,
            group,
            rank,
            world_size,
            config,
            shards,
            queue: WorkQueue::new(),
            consolidated: Vec::new(),
            global: None,
        };
        oss.sync_to_global();
        debug!(rank, world_size, groups = oss.param_groups.len(), "sharded optimizer ready");
        Ok(oss)
    }

    /// Returns the wrapped local optimizer.
    pub fn optim(&self) -> &O {
        &self.optim
    }

    /// Returns the process group.
    pub fn process_group(&self) -> &ProcessGroup {
        &self.group
    }

    /// Returns this rank within the process group.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Returns the number of ranks sharing the optimizer state.
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Returns the configuration.
    pub fn config(&self) -> &OssConfig {
        &self.config
    }

    /// Returns the current partition, rebuilding it if needed.
    pub fn partition(&mut self) -> Result<&Partition> {
        Ok(&self.shards()?.partition)
    }

    /// Returns the device/rank index, rebuilding it if needed.
    pub fn param_index(&mut self) -> Result<&ParamIndex> {
        Ok(&self.shards()?.index)
    }

    /// Returns the broadcast arenas, rebuilding them if needed.
    pub fn buckets(&mut self) -> Result<&BucketSet> {
        Ok(&self.shards()?.buckets)
    }

    /// Returns the first device holding parameters.
    pub fn default_device(&mut self) -> Result<Device> {
        Ok(self.shards()?.index.default_device())
    }

    /// Returns the rank owning `param`.
    pub fn owner(&mut self, param: &Parameter) -> Result<Option<usize>> {
        Ok(self.shards()?.index.owner(param.id()))
    }

    /// Returns the shards gathered by the last [`OSS::consolidate`] on this rank.
    pub fn consolidated_states(&self) -> &[StateDict] {
        &self.consolidated
    }

    fn shards(&mut self) -> Result<&Shards> {
        cached(&mut self.shards, &self.param_groups, self.world_size, &self.config)
    }

    /// Drops partition, index and arenas; the next access rebuilds them.
    fn invalidate(&mut self) {
        self.shards = None;
    }

    fn sync_to_local(&mut self) {
        sync_options(&self.param_groups, self.optim.param_groups_mut());
    }

    fn sync_to_global(&mut self) {
        sync_options(self.optim.param_groups(), &mut self.param_groups);
    }

    /// Broadcasts every owner's parameters and waits for completion.
    fn broadcast_params(&mut self) -> Result<()> {
        let shards = cached(&mut self.shards, &self.param_groups, self.world_size, &self.config)?;
        broadcast::publish(&self.group, &shards.index, &shards.buckets, &mut self.queue)?;
        self.queue.drain()
    }

    /// Clips the gradients of all parameters by their global norm.
    ///
    /// `norm_type` must be positive; `f32::INFINITY` selects the max-norm.
    /// `filter` restricts which owned parameters count toward the norm; the
    /// clipping coefficient still applies to every owned gradient. Collective.
    /// Returns the total norm before clipping.
    pub fn clip_grad_norm(
        &mut self,
        max_norm: f32,
        norm_type: f32,
        filter: Option<&dyn Fn(&Parameter) -> bool>,
    ) -> Result<f32> {
        let rank = self.rank;
        let shards = cached(&mut self.shards, &self.param_groups, self.world_size, &self.config)?;
        let owned: Vec<Parameter> = shards
            .partition
            .rank_params(rank)
            .filter(|p| p.has_grad())
            .cloned()
            .collect();
        let measured: Vec<Parameter> = match filter {
            Some(f) => owned.iter().filter(|&p| f(p)).cloned().collect(),
            None => owned.clone(),
        };
        debug!(
            rank,
            owned = owned.len(),
            measured = measured.len(),
            device = %shards.index.default_device(),
            "clipping gradient norm"
        );
        grad_norm::clip_grad_norm(&self.group, &measured, &owned, max_norm, norm_type)
    }

    /// Returns this rank's local optimizer state, positional ids local.
    pub fn local_shard(&self) -> StateDict {
        self.optim.state_dict()
    }

    /// Gathers every rank's shard on `recipient`. Collective.
    ///
    /// Hyperparameters changed on the public groups since the last step are
    /// pushed into the local optimizer first. On the recipient the shards are
    /// merged into one state dict keyed by public parameter position. Ranks
    /// other than the recipient forget any previously consolidated state.
    pub fn consolidate(&mut self, recipient: usize) -> Result<()> {
        if recipient >= self.world_size {
            return Err(Error::InvalidArgument(format!(
                "recipient rank {recipient} is outside a group of {}",
                self.world_size
            )));
        }
        self.sync_to_local();
        let shard = self.local_shard();
        let gathered = consolidate::gather_shards(&self.group, &shard, recipient)?;

        self.global = None;
        self.consolidated = gathered.unwrap_or_default();
        if !self.consolidated.is_empty() {
            let shards = cached(&mut self.shards, &self.param_groups, self.world_size, &self.config)?;
            let positions = shards.partition.public_positions(&self.param_groups);
            self.global = Some(consolidate::flatten(&self.consolidated, &positions)?);
        }
        Ok(())
    }

    /// Returns the consolidated state of every rank as one state dict.
    ///
    /// Without a prior [`OSS::consolidate`] on this rank only the local shard
    /// is returned.
    pub fn global_state(&self) -> StateDict {
        match &self.global {
            Some(dict) => dict.clone(),
            None => {
                warn!("Optimizer state has not been consolidated. Returning the local state");
                warn!("Please call `consolidate()` beforehand if you meant to save the global state");
                self.local_shard()
            }
        }
    }

    /// Loads a state dict produced by [`OSS::global_state`], possibly with a
    /// different world size.
    ///
    /// Saved group `g` is matched by position against public group `g`, so
    /// every parameter gets back its own state however the ranks are now
    /// split. Entries for parameters this rank owns become its local state.
    /// Saved hyperparameters overwrite the public groups by group index.
    pub fn restore(&mut self, saved: &StateDict) -> Result<()> {
        let rank = self.rank;
        if saved.param_groups.len() != self.param_groups.len() {
            debug!(
                saved = saved.param_groups.len(),
                current = self.param_groups.len(),
                "restoring into a different group count"
            );
        }

        let shards = cached(&mut self.shards, &self.param_groups, self.world_size, &self.config)?;
        let mut state = HashMap::new();
        for (saved_group, group) in saved.param_groups.iter().zip(&self.param_groups) {
            for (id, param) in saved_group.params.iter().zip(&group.params) {
                let Some(entry) = saved.state.get(id) else {
                    continue;
                };
                entry.check_numel(param.numel())?;
                if shards.index.owner(param.id()) == Some(rank) {
                    state.insert(param.id(), entry.to_device(param.device()));
                }
            }
        }
        debug!(rank, installed = state.len(), "optimizer shard restored");
        *self.optim.state_mut() = state;

        for (group, saved_group) in self.param_groups.iter_mut().zip(&saved.param_groups) {
            for (key, value) in &saved_group.options {
                group.options.insert(key.clone(), *value);
            }
        }
        self.sync_to_local();

        self.invalidate();
        self.shards()?;
        Ok(())
    }
}

impl<O: Optimizer> Optimizer for OSS<O> {
    /// Updates this rank's shard, then broadcasts so every rank holds the
    /// updated parameters. Collective.
    fn step(&mut self, closure: Option<Closure<'_>>) -> Result<Option<f32>> {
        self.sync_to_local();
        let loss = self.optim.step(closure)?;
        self.broadcast_params()?;
        self.sync_to_global();
        Ok(loss)
    }

    fn param_groups(&self) -> &[ParamGroup] {
        &self.param_groups
    }

    fn param_groups_mut(&mut self) -> &mut Vec<ParamGroup> {
        &mut self.param_groups
    }

    fn state(&self) -> &HashMap<ParamId, ParamState> {
        self.optim.state()
    }

    fn state_mut(&mut self) -> &mut HashMap<ParamId, ParamState> {
        self.optim.state_mut()
    }

    fn defaults(&self) -> &Options {
        self.optim.defaults()
    }

    /// Adds a public group, re-partitions, and hands this rank's part of the
    /// new group to the local optimizer.
    fn add_param_group(&mut self, mut group: ParamGroup) -> Result<()> {
        check_disjoint(self.param_groups.iter().chain(std::iter::once(&group)))?;
        group.apply_defaults(self.optim.defaults());
        self.param_groups.push(group);

        self.invalidate();
        let shards = cached(&mut self.shards, &self.param_groups, self.world_size, &self.config)?;
        let local = shards.partition.rank_groups(self.rank);
        if local.len() == self.optim.param_groups().len() + 1 {
            if let Some(last) = local.last() {
                self.optim.add_param_group(last.clone())?;
            }
        }
        Ok(())
    }

    fn state_dict(&self) -> StateDict {
        self.global_state()
    }

    fn load_state_dict(&mut self, dict: &StateDict) -> Result<()> {
        self.restore(dict)
    }
}

impl<O: Optimizer> std::fmt::Debug for OSS<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OSS")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("param_groups", &self.param_groups.len())
            .field("config", &self.config)
            .field("consolidated", &self.consolidated.len())
            .field("global", &self.global.is_some())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sgd::{SgdConfig, SGD};
    use std::collections::HashSet;

    fn sgd(shard: Vec<ParamGroup>) -> Result<SGD> {
        SGD::from_groups(shard, SgdConfig::new(0.1).momentum(0.9))
    }

    #[test]
    fn test_config_default_and_builder() {
        assert_eq!(OssConfig::default().broadcast_buffer_size, 1 << 24);
        assert_eq!(OssConfig::default().broadcast_buffer_size(8).broadcast_buffer_size, 8);
        let json = serde_json::to_string(&OssConfig::default()).unwrap();
        assert_eq!(serde_json::from_str::<OssConfig>(&json).unwrap(), OssConfig::default());
    }

    #[test]
    fn test_public_groups_show_optimizer_defaults() {
        let param = Parameter::from_vec(vec![1.0]);
        let oss = OSS::new(
            vec![ParamGroup::new(vec![param])],
            ProcessGroup::mock(),
            OssConfig::default(),
            sgd,
        )
        .unwrap();

        let keys: HashSet<&str> = oss.param_groups()[0].options.keys().map(String::as_str).collect();
        for key in ["lr", "momentum", "nesterov", "weight_decay", "dampening"] {
            assert!(keys.contains(key), "missing {key}");
        }
    }

    #[test]
    fn test_invalidation_rebuilds_arenas() {
        let a = Parameter::from_vec(vec![1.0, 2.0]);
        let b = Parameter::from_vec(vec![3.0]);
        let mut oss = OSS::new(
            vec![ParamGroup::new(vec![a.clone(), b.clone()])],
            ProcessGroup::mock(),
            OssConfig::default(),
            sgd,
        )
        .unwrap();
        let before = oss.buckets().unwrap().bucket(Device::Cpu, 0).unwrap().buffer().clone();

        let c = Parameter::from_vec(vec![4.0; 5]);
        oss.add_param_group(ParamGroup::new(vec![c.clone()])).unwrap();

        let after = oss.buckets().unwrap().bucket(Device::Cpu, 0).unwrap().buffer().clone();
        assert!(!after.shares_buffer(&before));
        assert!(a.storage().shares_buffer(&after));
        assert_eq!(a.data(), vec![1.0, 2.0]);
        assert_eq!(oss.owner(&c).unwrap(), Some(0));
        assert_eq!(oss.optim().param_groups().len(), 2);
    }

    #[test]
    fn test_rejects_empty_and_overlapping_groups() {
        let p = Parameter::from_vec(vec![1.0]);
        assert!(matches!(
            OSS::new(Vec::new(), ProcessGroup::mock(), OssConfig::default(), sgd),
            Err(Error::EmptyParameters)
        ));

        let mut oss = OSS::new(
            vec![ParamGroup::new(vec![p.clone()])],
            ProcessGroup::mock(),
            OssConfig::default(),
            sgd,
        )
        .unwrap();
        assert!(oss.add_param_group(ParamGroup::new(vec![p])).is_err());
        assert_eq!(oss.param_groups().len(), 1);
    }

    #[test]
    fn test_consolidate_rejects_bad_recipient() {
        let p = Parameter::from_vec(vec![1.0]);
        let mut oss = OSS::new(
            vec![ParamGroup::new(vec![p])],
            ProcessGroup::mock(),
            OssConfig::default(),
            sgd,
        )
        .unwrap();
        assert!(matches!(oss.consolidate(1), Err(Error::InvalidArgument(_))));
        assert!(oss.consolidated_states().is_empty());
    }
}
