//! Gradient Norm Clipping Across Shards
//!
//! Each rank measures the gradients it owns; since the shards partition the
//! parameters, the p-th powers of the shard norms add up to the p-th power of
//! the global norm, and the infinity norm is the max over shards.
//!
//! @version 0.2.6
//! @author `AutomataNexus` Development Team

use axonml_core::Parameter;
use axonml_distributed::{ProcessGroup, ReduceOp};
use tracing::debug;

use crate::error::{Error, Result};

const EPS: f32 = 1e-6;

/// This rank's share of the global norm: the largest magnitude for the
/// max-norm, the sum of `|g|^p` otherwise.
fn local_contribution(params: &[Parameter], norm_type: f32) -> f32 {
    let grads = params.iter().filter_map(Parameter::grad);
    if norm_type.is_infinite() {
        grads.fold(0.0_f32, |acc, g| g.iter().fold(acc, |m, v| m.max(v.abs())))
    } else {
        grads
            .map(|g| g.iter().map(|v| v.abs().powf(norm_type)).sum::<f32>())
            .sum()
    }
}

/// Clips gradients by the norm over every rank's shard.
///
/// The norm is measured over `measured`; the resulting coefficient is applied
/// to every parameter in `clipped`, which should hold all of this rank's
/// owned, gradient-bearing parameters. Every rank of `group` must call this.
/// A rank with nothing to measure contributes `0.0`. Returns the total norm
/// measured before clipping.
pub fn clip_grad_norm(
    group: &ProcessGroup,
    measured: &[Parameter],
    clipped: &[Parameter],
    max_norm: f32,
    norm_type: f32,
) -> Result<f32> {
    if !(norm_type > 0.0) {
        return Err(Error::InvalidArgument(format!(
            "norm type must be positive, got {norm_type}"
        )));
    }

    let local = local_contribution(measured, norm_type);
    let total_norm = if norm_type.is_infinite() {
        group.all_reduce_scalar(local, ReduceOp::Max)?
    } else {
        group
            .all_reduce_scalar(local, ReduceOp::Sum)?
            .powf(1.0 / norm_type)
    };

    let clip_coef = max_norm / (total_norm + EPS);
    if clip_coef < 1.0 {
        for param in clipped {
            param.scale_grad(clip_coef);
        }
    }
    debug!(local, total_norm, clip_coef, "gradient norm clipped");

    Ok(total_norm)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn with_grad(grad: Vec<f32>) -> Parameter {
        let p = Parameter::from_vec(vec![0.0; grad.len()]);
        p.set_grad(grad).unwrap();
        p
    }

    #[test]
    fn test_local_contribution() {
        let params = [with_grad(vec![3.0, -4.0]), with_grad(vec![-2.0])];
        assert!((local_contribution(&params, 2.0) - 29.0).abs() < 1e-5);
        assert!((local_contribution(&params, 1.0) - 9.0).abs() < 1e-5);
        assert_eq!(local_contribution(&params, f32::INFINITY), 4.0);
        assert_eq!(local_contribution(&[], 2.0), 0.0);
        assert_eq!(local_contribution(&[], f32::INFINITY), 0.0);
        assert_eq!(local_contribution(&[Parameter::from_vec(vec![1.0])], 2.0), 0.0);
    }

    #[test]
    fn test_clip_single_rank() {
        let group = ProcessGroup::mock();
        let params = [with_grad(vec![3.0, 0.0]), with_grad(vec![4.0])];

        let total = clip_grad_norm(&group, &params, &params, 1.0, 2.0).unwrap();
        assert!((total - 5.0).abs() < 1e-5);

        let ga = params[0].grad().unwrap();
        let gb = params[1].grad().unwrap();
        assert!((ga[0] - 0.6).abs() < 1e-5);
        assert!((gb[0] - 0.8).abs() < 1e-5);
    }

    #[test]
    fn test_clip_scales_unmeasured_gradients() {
        let group = ProcessGroup::mock();
        let weight = with_grad(vec![10.0; 4]);
        let bias = with_grad(vec![10.0; 2]);

        let total = clip_grad_norm(
            &group,
            &[weight.clone()],
            &[weight.clone(), bias.clone()],
            1.0,
            2.0,
        )
        .unwrap();
        assert!((total - 20.0).abs() < 1e-4);
        for g in weight.grad().unwrap().into_iter().chain(bias.grad().unwrap()) {
            assert!((g - 0.5).abs() < 1e-4);
        }
    }

    #[test]
    fn test_no_clip_below_max() {
        let group = ProcessGroup::mock();
        let a = with_grad(vec![0.5]);

        let total = clip_grad_norm(&group, &[a.clone()], &[a.clone()], 1.0, f32::INFINITY).unwrap();
        assert_eq!(total, 0.5);
        assert_eq!(a.grad().unwrap(), vec![0.5]);
    }

    #[test]
    fn test_rejects_non_positive_norm_type() {
        let group = ProcessGroup::mock();
        assert!(clip_grad_norm(&group, &[], &[], 1.0, 0.0).is_err());
        assert!(clip_grad_norm(&group, &[], &[], 1.0, -2.0).is_err());
        assert!(clip_grad_norm(&group, &[], &[], 1.0, f32::NAN).is_err());
    }
}
