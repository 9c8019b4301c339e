//! HEGN network
//!
//! Four hierarchy blocks refine paired X/Y features; each block runs
//! - local context (VN-DGCNN, shared between X and Y)
//! - cross context (Y's neighbor graph attends to X and vice versa)
//! - global context (mean feature fused back into every point)
//! - invariant mapping (shared top-scoring subset for the next block)
//!
//! The pooled block outputs are fused and aligned in closed form.

pub mod alignment;
pub mod context;
pub mod hierarchy;
pub mod invariant;
pub mod loss;
pub mod model;


use crate::config::HegnConfig;
use hegn_dnn::VnLinearLeakyRelu;
use rand::Rng;

/// Vector linear + leaky ReLU with the model-wide mode and slope.
pub(crate) fn vn_layer<R: Rng + ?Sized>(
    in_channels: usize,
    out_channels: usize,
    config: &HegnConfig,
    rng: &mut R,
) -> VnLinearLeakyRelu {
    VnLinearLeakyRelu::new(in_channels, out_channels, rng)
        .with_mode(config.mode)
        .with_negative_slope(config.negative_slope)
}
