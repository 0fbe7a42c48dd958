//! SGD Optimizer - Stochastic Gradient Descent
//!
//! Implements SGD with optional momentum, dampening, Nesterov acceleration and
//! weight decay. Hyperparameters are read from each parameter group on every
//! step, so schedulers and wrappers can change them between steps.
//!
//! @version 0.2.6
//! @author `AutomataNexus` Development Team

use std::collections::HashMap;

use axonml_core::{ParamId, Parameter};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::optimizer::{check_disjoint, Closure, Hyper, Optimizer, Options, ParamGroup, ParamState};

// =============================================================================
// SgdConfig
// =============================================================================

/// Default hyperparameters for [`SGD`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SgdConfig {
    /// Learning rate.
    pub lr: f32,
    /// Momentum factor.
    pub momentum: f32,
    /// Dampening factor for momentum.
    pub dampening: f32,
    /// Weight decay (L2 regularization).
    pub weight_decay: f32,
    /// Whether to use Nesterov momentum.
    pub nesterov: bool,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            lr: 0.01,
            momentum: 0.0,
            dampening: 0.0,
            weight_decay: 0.0,
            nesterov: false,
        }
    }
}

impl SgdConfig {
    /// Creates a config with the given learning rate.
    #[must_use]
    pub fn new(lr: f32) -> Self {
        Self {
            lr,
            ..Self::default()
        }
    }

    /// Builder method to set momentum.
    #[must_use]
    pub fn momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    /// Builder method to set dampening.
    #[must_use]
    pub fn dampening(mut self, dampening: f32) -> Self {
        self.dampening = dampening;
        self
    }

    /// Builder method to set weight decay.
    #[must_use]
    pub fn weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    /// Builder method to enable Nesterov momentum.
    #[must_use]
    pub fn nesterov(mut self, nesterov: bool) -> Self {
        self.nesterov = nesterov;
        self
    }

    /// Converts the config into group defaults.
    #[must_use]
    pub fn to_options(&self) -> Options {
        Options::from([
            ("lr".to_string(), Hyper::Float(self.lr)),
            ("momentum".to_string(), Hyper::Float(self.momentum)),
            ("dampening".to_string(), Hyper::Float(self.dampening)),
            ("weight_decay".to_string(), Hyper::Float(self.weight_decay)),
            ("nesterov".to_string(), Hyper::Bool(self.nesterov)),
        ])
    }
}

// =============================================================================
// SGD
// =============================================================================

/// Stochastic Gradient Descent optimizer.
///
/// Update rule (with momentum):
/// ```text
/// v_t = momentum * v_{t-1} + (1 - dampening) * grad
/// param = param - lr * v_t
/// ```
///
/// Update rule (with Nesterov):
/// ```text
/// v_t = momentum * v_{t-1} + grad
/// param = param - lr * (grad + momentum * v_t)
/// ```
///
/// The momentum buffer is stored in the parameter state as `momentum_buffer`.
pub struct SGD {
    param_groups: Vec<ParamGroup>,
    state: HashMap<ParamId, ParamState>,
    defaults: Options,
}

impl SGD {
    /// Creates a new SGD optimizer over one group with default settings.
    #[must_use]
    pub fn new(params: Vec<Parameter>, lr: f32) -> Self {
        let defaults = SgdConfig::new(lr).to_options();
        let mut group = ParamGroup::new(params);
        group.apply_defaults(&defaults);
        Self {
            param_groups: vec![group],
            state: HashMap::new(),
            defaults,
        }
    }

    /// Creates SGD over several groups; `config` fills keys a group leaves unset.
    pub fn from_groups(groups: Vec<ParamGroup>, config: SgdConfig) -> Result<Self> {
        if groups.is_empty() {
            return Err(Error::EmptyParameters);
        }
        if config.lr < 0.0 {
            return Err(Error::InvalidArgument(format!("invalid learning rate: {}", config.lr)));
        }
        check_disjoint(&groups)?;

        let defaults = config.to_options();
        let param_groups = groups
            .into_iter()
            .map(|mut group| {
                group.apply_defaults(&defaults);
                group
            })
            .collect::<Vec<_>>();
        for group in &param_groups {
            let nesterov = group.get_bool("nesterov", false);
            if nesterov
                && (group.get_f32("momentum", 0.0) <= 0.0 || group.get_f32("dampening", 0.0) != 0.0)
            {
                return Err(Error::InvalidArgument(
                    "Nesterov momentum requires a momentum and zero dampening".into(),
                ));
            }
        }

        Ok(Self {
            param_groups,
            state: HashMap::new(),
            defaults,
        })
    }

    /// Builder method to set momentum on the defaults and every group.
    #[must_use]
    pub fn momentum(self, momentum: f32) -> Self {
        self.with_default("momentum", Hyper::Float(momentum))
    }

    /// Builder method to set weight decay on the defaults and every group.
    #[must_use]
    pub fn weight_decay(self, weight_decay: f32) -> Self {
        self.with_default("weight_decay", Hyper::Float(weight_decay))
    }

    /// Builder method to enable Nesterov momentum on the defaults and every group.
    #[must_use]
    pub fn nesterov(self, nesterov: bool) -> Self {
        self.with_default("nesterov", Hyper::Bool(nesterov))
    }

    /// Builder method to set dampening on the defaults and every group.
    #[must_use]
    pub fn dampening(self, dampening: f32) -> Self {
        self.with_default("dampening", Hyper::Float(dampening))
    }

    fn with_default(mut self, key: &str, value: Hyper) -> Self {
        self.defaults.insert(key.to_string(), value);
        for group in &mut self.param_groups {
            group.set(key, value);
        }
        self
    }

    fn update_group(group: &ParamGroup, state: &mut HashMap<ParamId, ParamState>) -> Result<()> {
        let lr = group.get_f32("lr", 0.0);
        let momentum = group.get_f32("momentum", 0.0);
        let dampening = group.get_f32("dampening", 0.0);
        let weight_decay = group.get_f32("weight_decay", 0.0);
        let nesterov = group.get_bool("nesterov", false);

        for param in &group.params {
            if !param.requires_grad() {
                continue;
            }
            if let Some(entry) = state.get(&param.id()) {
                entry.check_numel(param.numel())?;
            }
            let device = param.device();
            param.apply_update(|data, grad| {
                let mut d_p = grad.to_vec();

                // Apply weight decay
                if weight_decay != 0.0 {
                    for (g, p) in d_p.iter_mut().zip(data.iter()) {
                        *g += weight_decay * p;
                    }
                }

                let entry = state
                    .entry(param.id())
                    .or_insert_with(|| ParamState::new(device));
                entry.step += 1;

                if momentum != 0.0 {
                    match entry.buffers.get_mut("momentum_buffer") {
                        Some(buf) => {
                            for (b, g) in buf.iter_mut().zip(&d_p) {
                                *b = momentum * *b + (1.0 - dampening) * g;
                            }
                        }
                        None => {
                            entry
                                .buffers
                                .insert("momentum_buffer".to_string(), d_p.clone());
                        }
                    }
                    let buf = &entry.buffers["momentum_buffer"];

                    if nesterov {
                        for (g, b) in d_p.iter_mut().zip(buf) {
                            *g += momentum * b;
                        }
                    } else {
                        d_p.copy_from_slice(buf);
                    }
                }

                for (p, g) in data.iter_mut().zip(&d_p) {
                    *p -= lr * g;
                }
            });
        }
        Ok(())
    }
}

impl Optimizer for SGD {
    fn step(&mut self, closure: Option<Closure<'_>>) -> Result<Option<f32>> {
        let loss = closure.map(|f| f());
        for group in &self.param_groups {
            Self::update_group(group, &mut self.state)?;
        }
        Ok(loss)
    }

    fn param_groups(&self) -> &[ParamGroup] {
        &self.param_groups
    }

    fn param_groups_mut(&mut self) -> &mut Vec<ParamGroup> {
        &mut self.param_groups
    }

    fn state(&self) -> &HashMap<ParamId, ParamState> {
        &self.state
    }

    fn state_mut(&mut self) -> &mut HashMap<ParamId, ParamState> {
        &mut self.state
    }

    fn defaults(&self) -> &Options {
        &self.defaults
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sgd_creation() {
        let param = Parameter::from_vec(vec![1.0, 2.0, 3.0]);
        let optimizer = SGD::new(vec![param], 0.01);

        assert!((optimizer.get_lr() - 0.01).abs() < 1e-6);
        assert_eq!(optimizer.num_parameters(), 1);
        assert_eq!(optimizer.param_groups()[0].get_f32("momentum", 1.0), 0.0);
    }

    #[test]
    fn test_sgd_step() {
        let param = Parameter::from_vec(vec![1.0, 2.0, 3.0]);
        param.set_grad(vec![0.1, 0.2, 0.3]).unwrap();

        let mut optimizer = SGD::new(vec![param.clone()], 0.1);
        optimizer.step(None).unwrap();

        let new_data = param.data();
        // param = param - lr * grad = [1, 2, 3] - 0.1 * [0.1, 0.2, 0.3]
        assert!((new_data[0] - 0.99).abs() < 1e-5);
        assert!((new_data[1] - 1.98).abs() < 1e-5);
        assert!((new_data[2] - 2.97).abs() < 1e-5);
    }

    #[test]
    fn test_sgd_momentum_buffer() {
        let param = Parameter::from_vec(vec![1.0]);
        let mut optimizer = SGD::new(vec![param.clone()], 0.1).momentum(0.9);

        param.set_grad(vec![1.0]).unwrap();
        optimizer.step(None).unwrap();
        assert!((param.data()[0] - 0.9).abs() < 1e-6);

        optimizer.step(None).unwrap();
        let buf = optimizer.state()[&param.id()].buffer("momentum_buffer").unwrap();
        assert!((buf[0] - 1.9).abs() < 1e-6);
        assert!((param.data()[0] - 0.71).abs() < 1e-6);
    }

    #[test]
    fn test_sgd_closure_and_skips() {
        let trained = Parameter::from_vec(vec![1.0]);
        let frozen = Parameter::new(vec![1.0], &[1], false).unwrap();
        let no_grad = Parameter::from_vec(vec![1.0]);
        trained.set_grad(vec![1.0]).unwrap();
        frozen.set_grad(vec![1.0]).unwrap();

        let mut optimizer =
            SGD::new(vec![trained.clone(), frozen.clone(), no_grad.clone()], 0.5);
        let mut closure = || 3.5_f32;
        let loss = optimizer.step(Some(&mut closure)).unwrap();

        assert_eq!(loss, Some(3.5));
        assert_eq!(trained.data(), vec![0.5]);
        assert_eq!(frozen.data(), vec![1.0]);
        assert_eq!(no_grad.data(), vec![1.0]);
        assert_eq!(optimizer.state().len(), 1);
    }

    #[test]
    fn test_sgd_zero_grad() {
        let param = Parameter::from_vec(vec![1.0, 2.0, 3.0]);
        param.set_grad(vec![0.1, 0.2, 0.3]).unwrap();

        let mut optimizer = SGD::new(vec![param.clone()], 0.1);
        assert!(param.has_grad());

        optimizer.zero_grad();
        assert!(!param.has_grad());
    }

    #[test]
    fn test_sgd_builder_pattern() {
        let param = Parameter::from_vec(vec![1.0, 2.0, 3.0]);

        let optimizer = SGD::new(vec![param], 0.01)
            .momentum(0.9)
            .weight_decay(0.0001)
            .nesterov(true);

        let group = &optimizer.param_groups()[0];
        assert!((group.get_f32("momentum", 0.0) - 0.9).abs() < 1e-6);
        assert!((group.get_f32("weight_decay", 0.0) - 0.0001).abs() < 1e-6);
        assert!(group.get_bool("nesterov", false));
        assert_eq!(optimizer.defaults()["momentum"], Hyper::Float(0.9));
    }

    #[test]
    fn test_sgd_from_groups_validation() {
        assert!(matches!(
            SGD::from_groups(Vec::new(), SgdConfig::default()),
            Err(Error::EmptyParameters)
        ));

        let p = Parameter::from_vec(vec![1.0]);
        let groups = vec![ParamGroup::new(vec![p.clone()]).with_option("lr", 0.2_f32)];
        let optimizer = SGD::from_groups(groups, SgdConfig::new(0.1).momentum(0.5)).unwrap();
        assert_eq!(optimizer.param_groups()[0].lr(), 0.2);
        assert_eq!(optimizer.param_groups()[0].get_f32("momentum", 0.0), 0.5);

        let nesterov = SgdConfig::new(0.1).nesterov(true);
        assert!(SGD::from_groups(vec![ParamGroup::new(vec![p])], nesterov).is_err());
    }

    #[test]
    fn test_sgd_state_dict_roundtrip() {
        let param = Parameter::from_vec(vec![1.0]);
        let mut optimizer = SGD::new(vec![param.clone()], 0.1).momentum(0.9);
        param.set_grad(vec![1.0]).unwrap();
        optimizer.step(None).unwrap();

        let dict = optimizer.state_dict();
        assert_eq!(dict.param_groups[0].params, vec![0]);
        assert_eq!(dict.state[&0].buffer("momentum_buffer"), Some(&[1.0][..]));

        let mut fresh = SGD::new(vec![param.clone()], 0.01);
        fresh.load_state_dict(&dict).unwrap();
        assert_eq!(fresh.get_lr(), 0.1);
        assert_eq!(fresh.state()[&param.id()].buffer("momentum_buffer"), Some(&[1.0][..]));
    }

    #[test]
    fn test_sgd_rejects_mismatched_buffer() {
        let param = Parameter::from_vec(vec![1.0, 2.0, 3.0]);
        let mut optimizer = SGD::new(vec![param.clone()], 0.1).momentum(0.9);

        let mut state = ParamState::new(param.device());
        state.buffers.insert("momentum_buffer".into(), vec![1.0; 5]);
        optimizer.state_mut().insert(param.id(), state);

        param.set_grad(vec![1.0; 3]).unwrap();
        assert!(matches!(optimizer.step(None), Err(Error::StateDictMismatch(_))));
        assert_eq!(param.data(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_sgd_load_rejects_mismatched_buffer() {
        let small = Parameter::from_vec(vec![1.0]);
        let mut optimizer = SGD::new(vec![small.clone()], 0.1).momentum(0.9);
        small.set_grad(vec![1.0]).unwrap();
        optimizer.step(None).unwrap();
        let dict = optimizer.state_dict();

        let large = Parameter::from_vec(vec![1.0, 2.0]);
        let mut fresh = SGD::new(vec![large], 0.1).momentum(0.9);
        assert!(matches!(fresh.load_state_dict(&dict), Err(Error::StateDictMismatch(_))));
    }
}
