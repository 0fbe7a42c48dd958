//! State Consolidator - Gathering Shards Into One State Dict
//!
//! The transport only offers one-to-all broadcasts, so gathering is done with
//! one object broadcast per rank, in rank order, issued by every rank. Rank
//! `r`'s broadcast carries its shard; the recipient's own slot carries an
//! acknowledgement. Ranks other than the recipient drop what they receive.
//!
//! @version 0.2.6
//! @author `AutomataNexus` Development Team

use std::collections::BTreeMap;

use axonml_core::Device;
use axonml_distributed::ProcessGroup;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::state_dict::{GroupState, StateDict};

/// Payload of one consolidation broadcast.
#[derive(Debug, Serialize, Deserialize)]
enum Message {
    /// Sent by the recipient in its own slot.
    Ack,
    /// A rank's local state dict.
    Shard(StateDict),
}

/// Moves every state entry of `dict` to host memory.
#[must_use]
pub fn to_host(dict: &StateDict) -> StateDict {
    StateDict {
        state: dict
            .state
            .iter()
            .map(|(id, s)| (*id, s.to_device(Device::Cpu)))
            .collect(),
        param_groups: dict.param_groups.clone(),
    }
}

/// Gathers every rank's `shard` on `recipient`.
///
/// Collective: every rank of `group` must call it with the same recipient.
/// Returns the shards in rank order on the recipient, `None` elsewhere.
pub fn gather_shards(
    group: &ProcessGroup,
    shard: &StateDict,
    recipient: usize,
) -> Result<Option<Vec<StateDict>>> {
    let rank = group.rank();
    let world_size = group.world_size();
    if recipient >= world_size {
        return Err(Error::InvalidArgument(format!(
            "recipient rank {recipient} is outside a group of {world_size}"
        )));
    }

    let local = to_host(shard);
    let mut shards = Vec::with_capacity(if rank == recipient { world_size } else { 0 });

    for src in 0..world_size {
        if src == rank {
            let message = if rank == recipient {
                debug!(rank, "saving own optimizer shard");
                shards.push(local.clone());
                Message::Ack
            } else {
                debug!(rank, recipient, "sending optimizer shard");
                Message::Shard(local.clone())
            };
            group.broadcast_object(Some(&message), src)?;
            continue;
        }

        let message: Message = group.broadcast_object(None, src)?;
        if rank != recipient {
            continue;
        }
        match message {
            Message::Shard(state) => {
                debug!(src, "optimizer shard received");
                shards.push(to_host(&state));
            }
            Message::Ack => {
                return Err(Error::Distributed(axonml_distributed::Error::CollectiveMismatch {
                    rank: src,
                    message: format!("rank {src} sent no shard to recipient {recipient}"),
                }));
            }
        }
    }

    Ok((rank == recipient).then_some(shards))
}

/// Merges per-rank shards into one state dict keyed by public position.
///
/// `positions[r][l]` is the public position of shard `r`'s local id `l` (see
/// [`Partition::public_positions`](super::Partition::public_positions)).
/// Group `g` of the result lists the positions of group `g` across every
/// shard in ascending order and takes its hyperparameters from the first
/// shard. The output therefore does not depend on how parameters were split.
pub fn flatten(shards: &[StateDict], positions: &[Vec<usize>]) -> Result<StateDict> {
    if shards.len() != positions.len() {
        return Err(Error::StateDictMismatch(format!(
            "{} shards for a group of {} ranks",
            shards.len(),
            positions.len()
        )));
    }

    let mut param_groups: Vec<GroupState> = Vec::new();
    let mut state = BTreeMap::new();

    for (rank, (shard, local)) in shards.iter().zip(positions).enumerate() {
        let public = |id: usize| {
            local.get(id).copied().ok_or_else(|| {
                Error::StateDictMismatch(format!(
                    "rank {rank} reports local id {id}, it holds {} parameters",
                    local.len()
                ))
            })
        };

        for (g, group) in shard.param_groups.iter().enumerate() {
            let ids = group
                .params
                .iter()
                .map(|&id| public(id))
                .collect::<Result<Vec<_>>>()?;
            match param_groups.get_mut(g) {
                Some(merged) => merged.params.extend(ids),
                None => param_groups.push(GroupState {
                    options: group.options.clone(),
                    params: ids,
                }),
            }
        }
        for (&id, entry) in &shard.state {
            state.insert(public(id)?, entry.clone());
        }
    }

    for group in &mut param_groups {
        group.params.sort_unstable();
    }
    Ok(StateDict {
        state,
        param_groups,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::{Hyper, Options, ParamState};
    use axonml_distributed::MockBackend;
    use std::sync::Arc;
    use std::thread;

    fn shard(tag: f32, groups: &[usize]) -> StateDict {
        let mut dict = StateDict::default();
        let mut next = 0;
        for &count in groups {
            let mut options = Options::new();
            options.insert("lr".into(), Hyper::Float(0.1));
            dict.param_groups.push(GroupState {
                options,
                params: (next..next + count).collect(),
            });
            for id in next..next + count {
                let mut s = ParamState::new(Device::Cuda(0));
                s.step = 1;
                s.buffers.insert("momentum_buffer".into(), vec![tag + id as f32]);
                dict.state.insert(id, s);
            }
            next += count;
        }
        dict
    }

    #[test]
    fn test_flatten_maps_to_public_positions() {
        // Public groups of three parameters each: positions 0..3 and 3..6.
        let a = shard(0.0, &[2, 1]);
        let b = shard(10.0, &[1, 2]);
        let flat = flatten(&[a, b], &[vec![0, 2, 4], vec![1, 3, 5]]).unwrap();

        assert_eq!(flat.param_groups.len(), 2);
        assert_eq!(flat.param_groups[0].params, vec![0, 1, 2]);
        assert_eq!(flat.param_groups[1].params, vec![3, 4, 5]);
        assert_eq!(flat.state.len(), 6);
        assert_eq!(flat.state[&2].buffer("momentum_buffer"), Some(&[1.0][..]));
        assert_eq!(flat.state[&1].buffer("momentum_buffer"), Some(&[10.0][..]));
        assert_eq!(flat.state[&4].buffer("momentum_buffer"), Some(&[2.0][..]));
        assert_eq!(flat.state[&5].buffer("momentum_buffer"), Some(&[12.0][..]));

        // Every state key names a listed parameter.
        let listed = flat.flat_ids();
        assert!(flat.state.keys().all(|id| listed.contains(id)));
    }

    #[test]
    fn test_flatten_skips_missing_state() {
        let mut a = shard(0.0, &[2]);
        a.state.remove(&0);
        let flat = flatten(&[a, shard(5.0, &[1])], &[vec![0, 1], vec![2]]).unwrap();
        assert_eq!(flat.flat_ids(), vec![0, 1, 2]);
        assert_eq!(flat.state.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_flatten_rejects_foreign_layout() {
        let shards = [shard(0.0, &[2]), shard(5.0, &[1])];
        assert!(matches!(
            flatten(&shards, &[vec![0], vec![1]]),
            Err(Error::StateDictMismatch(_))
        ));
        assert!(matches!(
            flatten(&shards, &[vec![0, 1]]),
            Err(Error::StateDictMismatch(_))
        ));
    }

    #[test]
    fn test_gather_shards_on_recipient() {
        let results: Vec<Option<Vec<StateDict>>> = thread::scope(|s| {
            let handles: Vec<_> = MockBackend::create_world(3)
                .into_iter()
                .map(|backend| {
                    s.spawn(move || {
                        let group = ProcessGroup::new(Arc::new(backend));
                        let local = shard(group.rank() as f32 * 100.0, &[1]);
                        gather_shards(&group, &local, 1).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(results[0].is_none());
        assert!(results[2].is_none());
        let shards = results[1].as_ref().unwrap();
        assert_eq!(shards.len(), 3);
        for (rank, dict) in shards.iter().enumerate() {
            let state = &dict.state[&0];
            assert_eq!(state.device, Device::Cpu);
            assert_eq!(state.buffer("momentum_buffer"), Some(&[rank as f32 * 100.0][..]));
        }
    }

    #[test]
    fn test_gather_rejects_bad_recipient() {
        let group = ProcessGroup::mock();
        assert!(matches!(
            gather_shards(&group, &StateDict::default(), 1),
            Err(Error::InvalidArgument(_))
        ));
    }
}
