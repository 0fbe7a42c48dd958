//! State Dict - Serializable Optimizer State
//!
//! A state dict refers to parameters by integer position, never by in-process
//! identity, so it can be loaded into a freshly constructed optimizer over the
//! same parameters. In text formats a group serializes as its hyperparameters
//! plus a `params` list:
//!
//! ```json
//! {
//!   "state": { "0": { "device": "Cpu", "step": 1, "buffers": { "momentum_buffer": [1.0] } } },
//!   "param_groups": [ { "lr": 0.1, "momentum": 0.9, "params": [0] } ]
//! }
//! ```
//!
//! @version 0.2.6
//! @author `AutomataNexus` Development Team

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::optimizer::{Options, ParamState};

// =============================================================================
// GroupState
// =============================================================================

/// Serialized form of a parameter group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupState {
    /// Hyperparameters of the group.
    pub options: Options,
    /// Positional ids of the group's parameters.
    pub params: Vec<usize>,
}

#[derive(Serialize)]
struct GroupTextRef<'a> {
    #[serde(flatten)]
    options: &'a Options,
    params: &'a [usize],
}

#[derive(Deserialize)]
struct GroupText {
    params: Vec<usize>,
    #[serde(flatten)]
    options: Options,
}

impl Serialize for GroupState {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            GroupTextRef {
                options: &self.options,
                params: &self.params,
            }
            .serialize(serializer)
        } else {
            (&self.options, &self.params).serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for GroupState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> core::result::Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let GroupText { params, options } = GroupText::deserialize(deserializer)?;
            Ok(Self { options, params })
        } else {
            let (options, params) = <(Options, Vec<usize>)>::deserialize(deserializer)?;
            Ok(Self { options, params })
        }
    }
}

// =============================================================================
// StateDict
// =============================================================================

/// Complete optimizer state: per-parameter state plus parameter groups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDict {
    /// Per-parameter state keyed by positional id.
    pub state: BTreeMap<usize, ParamState>,
    /// Parameter groups in order.
    pub param_groups: Vec<GroupState>,
}

impl StateDict {
    /// Returns the number of parameters referenced by the groups.
    #[must_use]
    pub fn num_params(&self) -> usize {
        self.param_groups.iter().map(|g| g.params.len()).sum()
    }

    /// Returns every positional id in group order.
    #[must_use]
    pub fn flat_ids(&self) -> Vec<usize> {
        self.param_groups
            .iter()
            .flat_map(|g| g.params.iter().copied())
            .collect()
    }

    /// Writes the state dict as JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    /// Reads a state dict written by [`StateDict::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::Hyper;
    use axonml_core::Device;

    fn sample() -> StateDict {
        let mut state = ParamState::new(Device::Cpu);
        state.step = 2;
        state.buffers.insert("momentum_buffer".into(), vec![1.5, -0.25]);

        let mut options = Options::new();
        options.insert("lr".into(), Hyper::Float(0.1));
        options.insert("nesterov".into(), Hyper::Bool(false));
        options.insert("betas".into(), Hyper::Pair(0.9, 0.999));

        StateDict {
            state: BTreeMap::from([(1, state)]),
            param_groups: vec![GroupState {
                options,
                params: vec![0, 1],
            }],
        }
    }

    #[test]
    fn test_group_json_layout() {
        let json = serde_json::to_value(sample()).unwrap();
        let group = &json["param_groups"][0];
        assert_eq!(group["params"], serde_json::json!([0, 1]));
        assert_eq!(group["nesterov"], serde_json::json!(false));
        assert!(group["lr"].is_number());
        assert!(json["state"]["1"]["buffers"]["momentum_buffer"].is_array());
    }

    #[test]
    fn test_state_dict_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("optim.json");

        let dict = sample();
        dict.save(&path).unwrap();
        let loaded = StateDict::load(&path).unwrap();

        assert_eq!(loaded, dict);
        assert_eq!(loaded.num_params(), 2);
        assert_eq!(loaded.flat_ids(), vec![0, 1]);
    }

    #[test]
    fn test_state_dict_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(StateDict::load(dir.path().join("absent.json")).is_err());
    }
}
