//! Adam Optimizer - Adaptive Moment Estimation
//!
//! Implements Adam with L2 weight decay and the optional `AMSGrad` variant.
//! Moments live in the parameter state as `exp_avg`, `exp_avg_sq` and, with
//! `AMSGrad`, `max_exp_avg_sq`.
//!
//! @version 0.2.6
//! @author `AutomataNexus` Development Team

use std::collections::HashMap;

use axonml_core::{ParamId, Parameter};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::optimizer::{check_disjoint, Closure, Hyper, Optimizer, Options, ParamGroup, ParamState};

// =============================================================================
// AdamConfig
// =============================================================================

/// Default hyperparameters for [`Adam`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamConfig {
    /// Learning rate.
    pub lr: f32,
    /// First and second moment decay rates.
    pub betas: (f32, f32),
    /// Small constant for numerical stability.
    pub eps: f32,
    /// Weight decay (L2 regularization).
    pub weight_decay: f32,
    /// Whether to use the `AMSGrad` variant.
    pub amsgrad: bool,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            betas: (0.9, 0.999),
            eps: 1e-8,
            weight_decay: 0.0,
            amsgrad: false,
        }
    }
}

impl AdamConfig {
    /// Creates a config with the given learning rate.
    #[must_use]
    pub fn new(lr: f32) -> Self {
        Self {
            lr,
            ..Self::default()
        }
    }

    /// Builder method to set betas.
    #[must_use]
    pub fn betas(mut self, betas: (f32, f32)) -> Self {
        self.betas = betas;
        self
    }

    /// Builder method to set epsilon.
    #[must_use]
    pub fn eps(mut self, eps: f32) -> Self {
        self.eps = eps;
        self
    }

    /// Builder method to set weight decay.
    #[must_use]
    pub fn weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    /// Builder method to enable `AMSGrad`.
    #[must_use]
    pub fn amsgrad(mut self, amsgrad: bool) -> Self {
        self.amsgrad = amsgrad;
        self
    }

    /// Converts the config into group defaults.
    #[must_use]
    pub fn to_options(&self) -> Options {
        Options::from([
            ("lr".to_string(), Hyper::Float(self.lr)),
            ("betas".to_string(), Hyper::from(self.betas)),
            ("eps".to_string(), Hyper::Float(self.eps)),
            ("weight_decay".to_string(), Hyper::Float(self.weight_decay)),
            ("amsgrad".to_string(), Hyper::Bool(self.amsgrad)),
        ])
    }
}

// =============================================================================
// Adam
// =============================================================================

/// Adam optimizer.
///
/// Maintains per-parameter adaptive learning rates using first and
/// second moment estimates of gradients.
///
/// Update rule:
/// ```text
/// m_t = beta1 * m_{t-1} + (1 - beta1) * grad
/// v_t = beta2 * v_{t-1} + (1 - beta2) * grad^2
/// m_hat = m_t / (1 - beta1^t)
/// v_hat = v_t / (1 - beta2^t)
/// param = param - lr * m_hat / (sqrt(v_hat) + eps)
/// ```
pub struct Adam {
    param_groups: Vec<ParamGroup>,
    state: HashMap<ParamId, ParamState>,
    defaults: Options,
}

impl Adam {
    /// Creates a new Adam optimizer over one group with default hyperparameters.
    #[must_use]
    pub fn new(params: Vec<Parameter>, lr: f32) -> Self {
        let defaults = AdamConfig::new(lr).to_options();
        let mut group = ParamGroup::new(params);
        group.apply_defaults(&defaults);
        Self {
            param_groups: vec![group],
            state: HashMap::new(),
            defaults,
        }
    }

    /// Creates Adam over several groups; `config` fills keys a group leaves unset.
    pub fn from_groups(groups: Vec<ParamGroup>, config: AdamConfig) -> Result<Self> {
        if groups.is_empty() {
            return Err(Error::EmptyParameters);
        }
        let (beta1, beta2) = config.betas;
        if !(0.0..1.0).contains(&beta1) || !(0.0..1.0).contains(&beta2) {
            return Err(Error::InvalidArgument(format!(
                "invalid beta parameters: ({beta1}, {beta2})"
            )));
        }
        check_disjoint(&groups)?;

        let defaults = config.to_options();
        let param_groups = groups
            .into_iter()
            .map(|mut group| {
                group.apply_defaults(&defaults);
                group
            })
            .collect();

        Ok(Self {
            param_groups,
            state: HashMap::new(),
            defaults,
        })
    }

    fn update_group(group: &ParamGroup, state: &mut HashMap<ParamId, ParamState>) -> Result<()> {
        let lr = group.get_f32("lr", 1e-3);
        let (beta1, beta2) = group
            .get("betas")
            .and_then(|h| h.as_pair())
            .unwrap_or((0.9, 0.999));
        let eps = group.get_f32("eps", 1e-8);
        let weight_decay = group.get_f32("weight_decay", 0.0);
        let amsgrad = group.get_bool("amsgrad", false);

        for param in &group.params {
            if !param.requires_grad() {
                continue;
            }
            if let Some(entry) = state.get(&param.id()) {
                entry.check_numel(param.numel())?;
            }
            let device = param.device();
            let numel = param.numel();
            param.apply_update(|data, grad| {
                let entry = state
                    .entry(param.id())
                    .or_insert_with(|| ParamState::new(device));
                entry.step += 1;
                let step = entry.step as i32;

                // Apply L2 regularization to gradient (standard Adam weight decay)
                let grad: Vec<f32> = if weight_decay == 0.0 {
                    grad.to_vec()
                } else {
                    grad.iter()
                        .zip(data.iter())
                        .map(|(g, p)| g + weight_decay * p)
                        .collect()
                };

                for (m, g) in entry.buffer_or_zeros("exp_avg", numel).iter_mut().zip(&grad) {
                    *m = beta1 * *m + (1.0 - beta1) * g;
                }
                for (v, g) in entry
                    .buffer_or_zeros("exp_avg_sq", numel)
                    .iter_mut()
                    .zip(&grad)
                {
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                }

                // Bias correction
                let bias_correction1 = 1.0 - beta1.powi(step);
                let bias_correction2 = 1.0 - beta2.powi(step);
                let step_size = lr / bias_correction1;

                let second = if amsgrad {
                    let current = entry.buffers["exp_avg_sq"].clone();
                    let max_sq = entry.buffer_or_zeros("max_exp_avg_sq", numel);
                    for (max_v, v) in max_sq.iter_mut().zip(&current) {
                        *max_v = max_v.max(*v);
                    }
                    max_sq.clone()
                } else {
                    entry.buffers["exp_avg_sq"].clone()
                };

                let exp_avg = &entry.buffers["exp_avg"];
                for (p, (m, v)) in data.iter_mut().zip(exp_avg.iter().zip(&second)) {
                    let denom = (v / bias_correction2).sqrt() + eps;
                    *p -= step_size * m / denom;
                }
            });
        }
        Ok(())
    }
}

impl Optimizer for Adam {
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
    fn test_adam_creation() {
        let param = Parameter::from_vec(vec![1.0, 2.0, 3.0]);
        let optimizer = Adam::new(vec![param], 0.001);

        assert!((optimizer.get_lr() - 0.001).abs() < 1e-6);
        let group = &optimizer.param_groups()[0];
        assert_eq!(group.get("betas"), Some(Hyper::Pair(0.9, 0.999)));
    }

    #[test]
    fn test_adam_first_step_moves_by_lr() {
        let param = Parameter::from_vec(vec![1.0, 2.0, 3.0]);
        param.set_grad(vec![0.1, -0.2, 0.3]).unwrap();

        let mut optimizer = Adam::new(vec![param.clone()], 0.1);
        optimizer.step(None).unwrap();

        // With bias correction the first step is lr * sign(grad).
        let data = param.data();
        assert!((data[0] - 0.9).abs() < 1e-4);
        assert!((data[1] - 2.1).abs() < 1e-4);
        assert!((data[2] - 2.9).abs() < 1e-4);

        let state = &optimizer.state()[&param.id()];
        assert_eq!(state.step, 1);
        assert!(state.buffer("exp_avg").is_some());
        assert!(state.buffer("exp_avg_sq").is_some());
        assert!(state.buffer("max_exp_avg_sq").is_none());
    }

    #[test]
    fn test_adam_amsgrad_tracks_max() {
        let param = Parameter::from_vec(vec![0.0]);
        let groups = vec![ParamGroup::new(vec![param.clone()])];
        let mut optimizer = Adam::from_groups(groups, AdamConfig::new(0.01).amsgrad(true)).unwrap();

        param.set_grad(vec![1.0]).unwrap();
        optimizer.step(None).unwrap();
        param.set_grad(vec![0.0]).unwrap();
        optimizer.step(None).unwrap();

        let state = &optimizer.state()[&param.id()];
        let max_sq = state.buffer("max_exp_avg_sq").unwrap()[0];
        let sq = state.buffer("exp_avg_sq").unwrap()[0];
        assert!(max_sq >= sq);
        assert_eq!(state.step, 2);
    }

    #[test]
    fn test_adam_rejects_bad_betas() {
        let param = Parameter::from_vec(vec![0.0]);
        let groups = vec![ParamGroup::new(vec![param])];
        assert!(Adam::from_groups(groups, AdamConfig::new(0.01).betas((1.5, 0.9))).is_err());
    }

    #[test]
    fn test_adam_rejects_mismatched_buffer() {
        let param = Parameter::from_vec(vec![1.0, 2.0]);
        let mut optimizer = Adam::new(vec![param.clone()], 0.1);

        let mut state = ParamState::new(param.device());
        state.step = 3;
        state.buffers.insert("exp_avg".into(), vec![0.5]);
        optimizer.state_mut().insert(param.id(), state);

        param.set_grad(vec![1.0, 1.0]).unwrap();
        assert!(matches!(optimizer.step(None), Err(Error::StateDictMismatch(_))));
        assert_eq!(param.data(), vec![1.0, 2.0]);
    }
}
