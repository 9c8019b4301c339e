//! Vector-neuron network layers
//!
//! Layers whose units are 3-vectors rather than scalars. Every layer maps
//! `[B, C_in, 3, ...]` to `[B, C_out, 3, ...]` and commutes with a global
//! rotation applied to all input vectors:
//! - `VnLinear`: channel mixing that never touches the vector axis
//! - `VnBatchNorm`: batch normalization of vector norms
//! - `VnLinearLeakyRelu`: linear map + batch norm + direction-aware leaky ReLU
//! - `VnMaxPool` / `MeanPool`: pooling over the last sample axis
//! - `ChannelEquiNorm`: direction/magnitude-profile normalization
//! - `LocalContext`: VN-DGCNN edge convolution over dynamic kNN graphs

pub mod batchnorm;
pub mod dgcnn;
pub mod graph;
pub mod linear;
pub mod norm;
pub mod pool;

pub use batchnorm::VnBatchNorm;
pub use dgcnn::{LocalContext, LocalContextConfig, Pooling};
pub use graph::{effective_k, graph_feature, knn};
pub use linear::{VnLinear, VnLinearLeakyRelu};
pub use norm::{channel_equi_normalize, ChannelEquiNorm};
pub use pool::{mean_pool, MeanPool, VnMaxPool};

pub use hegn_core::{Error, Result};

use ndarray::{Array2, ArrayD};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Slope of the negative half of the vector leaky ReLU.
pub const DEFAULT_NEGATIVE_SLOPE: f32 = 0.2;

/// A rotation-equivariant tensor map.
///
/// For any rotation `R`, `forward(x · R) == forward(x) · R` where `· R` acts on
/// every vector along axis 2.
pub trait EquivariantLayer: Send + Sync {
    fn forward(&self, x: &ArrayD<f32>) -> Result<ArrayD<f32>>;

    fn name(&self) -> &'static str;

    fn num_parameters(&self) -> usize {
        0
    }
}

/// Batch-norm statistics source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Normalize with statistics of the current batch.
    Train,
    /// Normalize with stored running statistics.
    #[default]
    Eval,
}

/// `[rows, cols]` weights drawn from `U(-1/sqrt(cols), 1/sqrt(cols))`.
pub(crate) fn uniform_weight<R: Rng + ?Sized>(
    rows: usize,
    cols: usize,
    rng: &mut R,
) -> Array2<f32> {
    let bound = 1.0 / (cols.max(1) as f32).sqrt();
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-bound..bound))
}
