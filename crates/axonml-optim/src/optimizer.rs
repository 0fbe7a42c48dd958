//! Optimizer Trait - Core Optimizer Interface
//!
//! Defines the trait that all optimizers implement, together with parameter
//! groups (parameters sharing a set of hyperparameters) and per-parameter
//! state.
//!
//! Hyperparameters are stored as an ordered string-keyed map so that
//! schedulers and wrappers can read and rewrite keys they do not know about,
//! and so that groups serialize in the conventional state dict layout.
//!
//! @version 0.2.6
//! @author `AutomataNexus` Development Team

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use axonml_core::{Device, ParamId, Parameter};
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::state_dict::{GroupState, StateDict};

// =============================================================================
// Hyperparameters
// =============================================================================

/// A single hyperparameter value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Hyper {
    /// Real-valued setting such as a learning rate.
    Float(f32),
    /// Switch such as `nesterov`.
    Bool(bool),
    /// Integer setting.
    Int(i64),
    /// Pair such as Adam's `betas`.
    Pair(f32, f32),
}

impl Hyper {
    /// Returns the value as a float, converting integers.
    #[must_use]
    pub fn as_f32(&self) -> Option<f32> {
        match *self {
            Hyper::Float(v) => Some(v),
            Hyper::Int(v) => Some(v as f32),
            _ => None,
        }
    }

    /// Returns the value as a bool.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Hyper::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the value as a pair.
    #[must_use]
    pub fn as_pair(&self) -> Option<(f32, f32)> {
        match *self {
            Hyper::Pair(a, b) => Some((a, b)),
            _ => None,
        }
    }
}

impl From<f32> for Hyper {
    fn from(v: f32) -> Self {
        Hyper::Float(v)
    }
}

impl From<bool> for Hyper {
    fn from(v: bool) -> Self {
        Hyper::Bool(v)
    }
}

impl From<i64> for Hyper {
    fn from(v: i64) -> Self {
        Hyper::Int(v)
    }
}

impl From<(f32, f32)> for Hyper {
    fn from(v: (f32, f32)) -> Self {
        Hyper::Pair(v.0, v.1)
    }
}

impl fmt::Display for Hyper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hyper::Float(v) => write!(f, "{v}"),
            Hyper::Bool(v) => write!(f, "{v}"),
            Hyper::Int(v) => write!(f, "{v}"),
            Hyper::Pair(a, b) => write!(f, "({a}, {b})"),
        }
    }
}

/// Tagged form used by binary formats, which cannot guess the variant.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum TaggedHyper {
    Float(f32),
    Bool(bool),
    Int(i64),
    Pair(f32, f32),
}

/// Plain form used by text formats: `0.1`, `true`, `3`, `[0.9, 0.999]`.
#[derive(Deserialize)]
#[serde(untagged)]
enum PlainHyper {
    Bool(bool),
    Int(i64),
    Float(f32),
    Pair(f32, f32),
}

impl Serialize for Hyper {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            match *self {
                Hyper::Float(v) => serializer.serialize_f32(v),
                Hyper::Bool(v) => serializer.serialize_bool(v),
                Hyper::Int(v) => serializer.serialize_i64(v),
                Hyper::Pair(a, b) => (a, b).serialize(serializer),
            }
        } else {
            let tagged = match *self {
                Hyper::Float(v) => TaggedHyper::Float(v),
                Hyper::Bool(v) => TaggedHyper::Bool(v),
                Hyper::Int(v) => TaggedHyper::Int(v),
                Hyper::Pair(a, b) => TaggedHyper::Pair(a, b),
            };
            tagged.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for Hyper {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> core::result::Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            Ok(match PlainHyper::deserialize(deserializer)? {
                PlainHyper::Bool(v) => Hyper::Bool(v),
                PlainHyper::Int(v) => Hyper::Int(v),
                PlainHyper::Float(v) => Hyper::Float(v),
                PlainHyper::Pair(a, b) => Hyper::Pair(a, b),
            })
        } else {
            Ok(match TaggedHyper::deserialize(deserializer)? {
                TaggedHyper::Float(v) => Hyper::Float(v),
                TaggedHyper::Bool(v) => Hyper::Bool(v),
                TaggedHyper::Int(v) => Hyper::Int(v),
                TaggedHyper::Pair(a, b) => Hyper::Pair(a, b),
            })
        }
    }
}

/// Ordered hyperparameter map of a parameter group.
pub type Options = BTreeMap<String, Hyper>;

// =============================================================================
// Parameter Groups
// =============================================================================

/// Parameters sharing one set of hyperparameters.
#[derive(Debug, Clone, Default)]
pub struct ParamGroup {
    /// Parameters in this group, in registration order.
    pub params: Vec<Parameter>,
    /// Hyperparameters of this group.
    pub options: Options,
}

impl ParamGroup {
    /// Creates a group with no hyperparameters set.
    #[must_use]
    pub fn new(params: Vec<Parameter>) -> Self {
        Self {
            params,
            options: Options::new(),
        }
    }

    /// Builder method to set a hyperparameter.
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Hyper>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Returns a hyperparameter.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Hyper> {
        self.options.get(key).copied()
    }

    /// Returns a hyperparameter as a float, or `default` if unset.
    #[must_use]
    pub fn get_f32(&self, key: &str, default: f32) -> f32 {
        self.get(key).and_then(|h| h.as_f32()).unwrap_or(default)
    }

    /// Returns a hyperparameter as a bool, or `default` if unset.
    #[must_use]
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(|h| h.as_bool()).unwrap_or(default)
    }

    /// Sets a hyperparameter.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Hyper>) {
        self.options.insert(key.into(), value.into());
    }

    /// Returns the learning rate of this group.
    #[must_use]
    pub fn lr(&self) -> f32 {
        self.get_f32("lr", 0.0)
    }

    /// Sets the learning rate of this group.
    pub fn set_lr(&mut self, lr: f32) {
        self.set("lr", lr);
    }

    /// Fills in every default the group does not set itself.
    pub fn apply_defaults(&mut self, defaults: &Options) {
        for (key, value) in defaults {
            self.options.entry(key.clone()).or_insert(*value);
        }
    }

    /// Returns the total number of elements over the group's parameters.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.params.iter().map(Parameter::numel).sum()
    }

    /// Returns the parameters.
    #[must_use]
    pub fn params(&self) -> &[Parameter] {
        &self.params
    }

    /// Returns the hyperparameters.
    #[must_use]
    pub fn options(&self) -> &Options {
        &self.options
    }
}

/// Checks that no parameter appears twice across `groups`.
pub(crate) fn check_disjoint<'a>(groups: impl IntoIterator<Item = &'a ParamGroup>) -> Result<()> {
    let mut seen = HashSet::new();
    for group in groups {
        for param in &group.params {
            if !seen.insert(param.id()) {
                return Err(Error::InvalidArgument(format!(
                    "{} appears in more than one parameter group",
                    param.id()
                )));
            }
        }
    }
    Ok(())
}

// =============================================================================
// Parameter State
// =============================================================================

/// State associated with a parameter during optimization.
///
/// Different optimizers store different named buffers (momentum, moments).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamState {
    /// Device the buffers live on.
    pub device: Device,
    /// Number of updates applied.
    pub step: u64,
    /// Named per-element buffers.
    pub buffers: BTreeMap<String, Vec<f32>>,
}

impl ParamState {
    /// Creates an empty state on `device`.
    #[must_use]
    pub fn new(device: Device) -> Self {
        Self {
            device,
            step: 0,
            buffers: BTreeMap::new(),
        }
    }

    /// Returns a named buffer.
    #[must_use]
    pub fn buffer(&self, name: &str) -> Option<&[f32]> {
        self.buffers.get(name).map(Vec::as_slice)
    }

    /// Returns a named buffer, creating it with `len` zeros if absent.
    pub fn buffer_or_zeros(&mut self, name: &str, len: usize) -> &mut Vec<f32> {
        self.buffers
            .entry(name.to_string())
            .or_insert_with(|| vec![0.0; len])
    }

    /// Checks that every buffer holds one value per element of a parameter of
    /// `numel` elements.
    pub fn check_numel(&self, numel: usize) -> Result<()> {
        match self.buffers.iter().find(|(_, buf)| buf.len() != numel) {
            Some((name, buf)) => Err(Error::StateDictMismatch(format!(
                "buffer `{name}` has {} elements, parameter has {numel}",
                buf.len()
            ))),
            None => Ok(()),
        }
    }

    /// Copies the state onto another device.
    #[must_use]
    pub fn to_device(&self, device: Device) -> Self {
        Self {
            device,
            ..self.clone()
        }
    }
}

// =============================================================================
// Optimizer Trait
// =============================================================================

/// Closure re-evaluating the model and returning the loss.
pub type Closure<'a> = &'a mut dyn FnMut() -> f32;

/// Trait for all optimizers.
///
/// Optimizers update parameters based on gradients. State is keyed by
/// [`ParamId`]; state dicts refer to parameters by position instead.
pub trait Optimizer {
    /// Performs a single optimization step.
    ///
    /// If a closure is given it is evaluated first and its loss returned.
    fn step(&mut self, closure: Option<Closure<'_>>) -> Result<Option<f32>>;

    /// Returns the parameter groups.
    fn param_groups(&self) -> &[ParamGroup];

    /// Returns the parameter groups for in-place edits of hyperparameters.
    fn param_groups_mut(&mut self) -> &mut Vec<ParamGroup>;

    /// Returns the per-parameter state.
    fn state(&self) -> &HashMap<ParamId, ParamState>;

    /// Returns the per-parameter state mutably.
    fn state_mut(&mut self) -> &mut HashMap<ParamId, ParamState>;

    /// Returns the hyperparameters applied to groups that do not set them.
    fn defaults(&self) -> &Options;

    /// Adds a parameter group, filling in defaults.
    fn add_param_group(&mut self, mut group: ParamGroup) -> Result<()> {
        check_disjoint(self.param_groups().iter().chain(std::iter::once(&group)))?;
        group.apply_defaults(self.defaults());
        self.param_groups_mut().push(group);
        Ok(())
    }

    /// Drops the gradients of every parameter.
    fn zero_grad(&mut self) {
        for group in self.param_groups() {
            for param in &group.params {
                param.zero_grad();
            }
        }
    }

    /// Returns the learning rate of the first group.
    fn get_lr(&self) -> f32 {
        self.param_groups().first().map_or(0.0, ParamGroup::lr)
    }

    /// Sets the learning rate of every group.
    fn set_lr(&mut self, lr: f32) {
        for group in self.param_groups_mut().iter_mut() {
            group.set_lr(lr);
        }
    }

    /// Returns the number of parameters over all groups.
    fn num_parameters(&self) -> usize {
        self.param_groups().iter().map(|g| g.params.len()).sum()
    }

    /// Exports state with parameters numbered by position across groups.
    fn state_dict(&self) -> StateDict {
        let mut dict = StateDict::default();
        let mut next = 0;
        for group in self.param_groups() {
            let mut ids = Vec::with_capacity(group.params.len());
            for param in &group.params {
                if let Some(state) = self.state().get(&param.id()) {
                    dict.state.insert(next, state.clone());
                }
                ids.push(next);
                next += 1;
            }
            dict.param_groups.push(GroupState {
                options: group.options.clone(),
                params: ids,
            });
        }
        dict
    }

    /// Loads state exported by [`Optimizer::state_dict`].
    ///
    /// Group count and group sizes must match; parameters correspond by
    /// position. Saved hyperparameters replace the current ones.
    fn load_state_dict(&mut self, dict: &StateDict) -> Result<()> {
        let groups = self.param_groups();
        if groups.len() != dict.param_groups.len() {
            return Err(Error::StateDictMismatch(format!(
                "state dict has {} parameter groups, optimizer has {}",
                dict.param_groups.len(),
                groups.len()
            )));
        }
        for (i, (group, saved)) in groups.iter().zip(&dict.param_groups).enumerate() {
            if group.params.len() != saved.params.len() {
                return Err(Error::StateDictMismatch(format!(
                    "group {i} has {} parameters in the state dict, {} in the optimizer",
                    saved.params.len(),
                    group.params.len()
                )));
            }
        }

        let by_position: HashMap<usize, &Parameter> = dict
            .param_groups
            .iter()
            .flat_map(|g| g.params.iter().copied())
            .zip(groups.iter().flat_map(|g| g.params.iter()))
            .collect();
        let mut state = HashMap::new();
        for (id, saved) in &dict.state {
            if let Some(param) = by_position.get(id) {
                saved.check_numel(param.numel())?;
                state.insert(param.id(), saved.to_device(param.device()));
            }
        }

        *self.state_mut() = state;
        for (group, saved) in self.param_groups_mut().iter_mut().zip(&dict.param_groups) {
            group.options = saved.options.clone();
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
