//! axonml-optim - Optimization Algorithms and Sharded Optimizer State
//!
//! Provides optimizers over parameter groups, learning rate scheduling and
//! [`OSS`], which shards optimizer state across the ranks of a process group.
//!
//! # Optimizers
//!
//! - **SGD** - Stochastic Gradient Descent with momentum and Nesterov acceleration
//! - **Adam** - Adaptive Moment Estimation (optionally `AMSGrad`)
//! - **OSS** - Wraps any optimizer so each rank keeps state only for its shard
//!
//! # Learning Rate Schedulers
//!
//! - **StepLR** - Step decay at fixed intervals
//!
//! # Basic Example
//!
//! ```ignore
//! use axonml_optim::prelude::*;
//!
//! let mut optimizer = Adam::new(model.parameters(), 0.001);
//!
//! for batch in loader {
//!     optimizer.zero_grad();
//!     let loss = train_step(&model, &batch);
//!     optimizer.step(None)?;
//! }
//! ```
//!
//! # Sharded Training
//!
//! ```ignore
//! use axonml_optim::prelude::*;
//!
//! let mut optimizer = OSS::new(
//!     vec![ParamGroup::new(model.parameters())],
//!     ProcessGroup::new(backend),
//!     OssConfig::default(),
//!     |shard| SGD::from_groups(shard, SgdConfig::new(0.1).momentum(0.9)),
//! )?;
//! let mut scheduler = StepLR::new(&optimizer, 30, 0.1);
//!
//! optimizer.step(None)?;
//! scheduler.step(&mut optimizer);
//!
//! // Checkpointing: gather on rank 0, save there.
//! optimizer.consolidate(0)?;
//! if optimizer.rank() == 0 {
//!     optimizer.global_state().save("optim.json")?;
//! }
//! ```
//!
//! @version 0.2.6
//! @author `AutomataNexus` Development Team

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// ML/tensor-specific allowances
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::similar_names)]
#![allow(clippy::many_single_char_names)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::redundant_closure_for_method_calls)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::ptr_arg)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::not_unsafe_ptr_arg_deref)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::unreadable_literal)]
#![allow(clippy::if_same_then_else)]
#![allow(clippy::needless_range_loop)]
#![allow(clippy::trivially_copy_pass_by_ref)]
#![allow(clippy::unnecessary_wraps)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::unused_self)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::single_match_else)]
#![allow(clippy::fn_params_excessive_bools)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::format_push_string)]
#![allow(clippy::erasing_op)]
#![allow(clippy::type_repetition_in_bounds)]
#![allow(clippy::iter_without_into_iter)]
#![allow(clippy::should_implement_trait)]
#![allow(clippy::use_debug)]
#![allow(clippy::case_sensitive_file_extension_comparisons)]
#![allow(clippy::large_enum_variant)]
#![allow(clippy::panic)]
#![allow(clippy::struct_field_names)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::upper_case_acronyms)]
#![allow(clippy::assigning_clones)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::explicit_iter_loop)]
#![allow(clippy::default_trait_access)]
#![allow(clippy::only_used_in_recursion)]
#![allow(clippy::manual_clamp)]
#![allow(clippy::ref_option)]
#![allow(clippy::multiple_bound_locations)]
#![allow(clippy::comparison_chain)]
#![allow(clippy::manual_assert)]
#![allow(clippy::unnecessary_debug_formatting)]

// =============================================================================
// Module Declarations
// =============================================================================

pub mod adam;
pub mod error;
pub mod lr_scheduler;
pub mod optimizer;
pub mod oss;
pub mod sgd;
pub mod state_dict;

// =============================================================================
// Re-exports
// =============================================================================

pub use adam::{Adam, AdamConfig};
pub use error::{Error, Result};
pub use lr_scheduler::{LRScheduler, StepLR};
pub use optimizer::{Closure, Hyper, Optimizer, Options, ParamGroup, ParamState};
pub use oss::{OssConfig, OSS};
pub use sgd::{SgdConfig, SGD};
pub use state_dict::{GroupState, StateDict};

// =============================================================================
// Prelude
// =============================================================================

/// Common imports for optimization.
pub mod prelude {
    pub use crate::{
        Adam, AdamConfig, LRScheduler, Optimizer, OssConfig, ParamGroup, SgdConfig, StateDict,
        StepLR, OSS, SGD,
    };
    pub use axonml_distributed::ProcessGroup;
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axonml_core::Parameter;

    /// Sets the gradient of `sum((x - target)^2)` and returns the loss.
    fn quadratic(param: &Parameter, target: &[f32]) -> f32 {
        let data = param.data();
        let grad: Vec<f32> = data.iter().zip(target).map(|(x, t)| 2.0 * (x - t)).collect();
        param.set_grad(grad).unwrap();
        data.iter().zip(target).map(|(x, t)| (x - t) * (x - t)).sum()
    }

    #[test]
    fn test_sgd_optimization() {
        let param = Parameter::from_vec(vec![1.0, -2.0, 3.0]);
        let target = [0.5, 0.5, 0.5];
        let mut optimizer = SGD::new(vec![param.clone()], 0.05).momentum(0.5);

        let initial_loss = quadratic(&param, &target);
        for _ in 0..20 {
            optimizer.zero_grad();
            quadratic(&param, &target);
            optimizer.step(None).unwrap();
        }
        let final_loss = quadratic(&param, &target);

        assert!(final_loss < initial_loss);
    }

    #[test]
    fn test_adam_optimization() {
        let param = Parameter::from_vec(vec![1.0, -2.0, 3.0]);
        let target = [0.5, 0.5, 0.5];
        let mut optimizer = Adam::new(vec![param.clone()], 0.1);

        let initial_loss = quadratic(&param, &target);
        for _ in 0..50 {
            optimizer.zero_grad();
            quadratic(&param, &target);
            optimizer.step(None).unwrap();
        }
        let final_loss = quadratic(&param, &target);

        assert!(final_loss < initial_loss);
    }

    #[test]
    fn test_lr_scheduler() {
        let param = Parameter::from_vec(vec![0.0; 10]);
        let mut optimizer = SGD::new(vec![param], 0.1);
        let mut scheduler = StepLR::new(&optimizer, 10, 0.1);

        assert!((optimizer.get_lr() - 0.1).abs() < 1e-6);

        for _ in 0..10 {
            scheduler.step(&mut optimizer);
        }

        assert!((optimizer.get_lr() - 0.01).abs() < 1e-6);
    }
}
