//! Learning Rate Schedulers
//!
//! Schedulers rewrite the `lr` key of every parameter group of an optimizer.
//! A sharded optimizer exposes its public groups, so the same scheduler drives
//! it unchanged.
//!
//! @version 0.2.6
//! @author `AutomataNexus` Development Team

use crate::optimizer::Optimizer;

// =============================================================================
// LRScheduler Trait
// =============================================================================

/// Trait for learning rate schedulers.
pub trait LRScheduler {
    /// Updates the learning rate.
    fn step<O: Optimizer + ?Sized>(&mut self, optimizer: &mut O);

    /// Returns the current learning rate.
    fn get_last_lr(&self) -> f32;

    /// Returns the current epoch/step count.
    fn get_step(&self) -> usize;
}

// =============================================================================
// StepLR
// =============================================================================

/// Decays learning rate by gamma every `step_size` epochs.
///
/// lr = `initial_lr` * gamma^(epoch // `step_size`)
pub struct StepLR {
    initial_lr: f32,
    step_size: usize,
    gamma: f32,
    current_step: usize,
    last_lr: f32,
}

impl StepLR {
    /// Creates a new `StepLR` scheduler starting from the optimizer's current rate.
    pub fn new<O: Optimizer + ?Sized>(optimizer: &O, step_size: usize, gamma: f32) -> Self {
        let initial_lr = optimizer.get_lr();
        Self {
            initial_lr,
            step_size: step_size.max(1),
            gamma,
            current_step: 0,
            last_lr: initial_lr,
        }
    }
}

impl LRScheduler for StepLR {
    fn step<O: Optimizer + ?Sized>(&mut self, optimizer: &mut O) {
        self.current_step += 1;
        let num_decays = self.current_step / self.step_size;
        let new_lr = self.initial_lr * self.gamma.powi(num_decays as i32);
        optimizer.set_lr(new_lr);
        self.last_lr = new_lr;
    }

    fn get_last_lr(&self) -> f32 {
        self.last_lr
    }

    fn get_step(&self) -> usize {
        self.current_step
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SGD;
    use axonml_core::Parameter;

    fn create_test_optimizer() -> SGD {
        let param = Parameter::from_vec(vec![1.0, 2.0, 3.0]);
        SGD::new(vec![param], 0.1)
    }

    #[test]
    fn test_step_lr() {
        let mut optimizer = create_test_optimizer();
        let mut scheduler = StepLR::new(&optimizer, 10, 0.1);

        assert!((optimizer.get_lr() - 0.1).abs() < 1e-6);

        for _ in 0..10 {
            scheduler.step(&mut optimizer);
        }

        assert!((optimizer.get_lr() - 0.01).abs() < 1e-6);

        for _ in 0..10 {
            scheduler.step(&mut optimizer);
        }

        assert!((optimizer.get_lr() - 0.001).abs() < 1e-6);
        assert_eq!(scheduler.get_step(), 20);
        assert!((scheduler.get_last_lr() - 0.001).abs() < 1e-6);
    }

    #[test]
    fn test_step_lr_every_group() {
        let a = Parameter::from_vec(vec![1.0]);
        let b = Parameter::from_vec(vec![2.0]);
        let mut optimizer = create_test_optimizer();
        optimizer
            .add_param_group(crate::ParamGroup::new(vec![a, b]).with_option("lr", 0.5_f32))
            .unwrap();

        let mut scheduler = StepLR::new(&optimizer, 1, 0.5);
        scheduler.step(&mut optimizer);

        for group in optimizer.param_groups() {
            assert!((group.lr() - 0.05).abs() < 1e-6);
        }
    }
}
