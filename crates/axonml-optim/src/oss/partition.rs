//! Partition - Greedy Parameter-to-Rank Assignment
//!
//! Every parameter is owned by exactly one rank. Parameters are walked in
//! registration order (group by group) and handed to the rank with the lowest
//! running weight; ties go to the lowest rank. A trainable parameter weighs its
//! element count, a frozen one weighs 1 so frozen layers still spread out.
//!
//! The result depends only on the parameter order, so every rank computes the
//! same partition without communicating.
//!
//! @version 0.2.6
//! @author `AutomataNexus` Development Team

use std::collections::HashMap;

use axonml_core::{ParamId, Parameter};

use crate::optimizer::ParamGroup;

// =============================================================================
// Partition
// =============================================================================

/// Per-rank parameter groups.
///
/// Each rank holds one group per global group, in the same order, carrying the
/// global group's hyperparameters and only the parameters that rank owns. A
/// rank that owns nothing from a group still gets the (empty) group.
#[derive(Debug, Clone)]
pub struct Partition {
    ranks: Vec<Vec<ParamGroup>>,
}

impl Partition {
    /// Greedily partitions `groups` over `world_size` ranks.
    #[must_use]
    pub fn greedy(groups: &[ParamGroup], world_size: usize) -> Self {
        let world_size = world_size.max(1);
        let mut ranks: Vec<Vec<ParamGroup>> = vec![Vec::with_capacity(groups.len()); world_size];
        let mut weights = vec![0usize; world_size];

        for group in groups {
            for shard in &mut ranks {
                shard.push(ParamGroup {
                    params: Vec::new(),
                    options: group.options.clone(),
                });
            }

            for param in &group.params {
                let rank = weights
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, weight)| **weight)
                    .map_or(0, |(rank, _)| rank);
                weights[rank] += if param.requires_grad() { param.numel() } else { 1 };
                if let Some(shard_group) = ranks[rank].last_mut() {
                    shard_group.params.push(param.clone());
                }
            }
        }

        Self { ranks }
    }

    /// Returns the number of ranks.
    #[must_use]
    pub fn world_size(&self) -> usize {
        self.ranks.len()
    }

    /// Returns the groups owned by `rank`, empty if the rank is out of range.
    #[must_use]
    pub fn rank_groups(&self, rank: usize) -> &[ParamGroup] {
        self.ranks.get(rank).map_or(&[], Vec::as_slice)
    }

    /// Returns every rank's groups.
    #[must_use]
    pub fn ranks(&self) -> &[Vec<ParamGroup>] {
        &self.ranks
    }

    /// Iterates over the parameters owned by `rank`, group by group.
    pub fn rank_params(&self, rank: usize) -> impl Iterator<Item = &Parameter> {
        self.rank_groups(rank).iter().flat_map(|g| g.params.iter())
    }

    /// Maps each rank's parameters to their positions in `public`.
    ///
    /// `public` must be the groups this partition was built from. Entry
    /// `[r][l]` is the position, counted over `public` group by group, of the
    /// `l`-th parameter `rank_params(r)` yields. The mapping depends on the
    /// partition, the positions do not.
    #[must_use]
    pub fn public_positions(&self, public: &[ParamGroup]) -> Vec<Vec<usize>> {
        let positions: HashMap<ParamId, usize> = public
            .iter()
            .flat_map(|g| g.params.iter())
            .enumerate()
            .map(|(pos, p)| (p.id(), pos))
            .collect();
        (0..self.world_size())
            .map(|rank| {
                self.rank_params(rank)
                    .filter_map(|p| positions.get(&p.id()).copied())
                    .collect()
            })
            .collect()
    }

    /// Returns the total trainable element count owned by each rank.
    #[must_use]
    pub fn trainable_numel(&self) -> Vec<usize> {
        self.ranks
            .iter()
            .map(|groups| {
                groups
                    .iter()
                    .flat_map(|g| g.params.iter())
                    .filter(|p| p.requires_grad())
                    .map(Parameter::numel)
                    .sum()
            })
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
