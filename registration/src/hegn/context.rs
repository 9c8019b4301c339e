//! Cross-set attention and global context.

use super::vn_layer;
use crate::config::HegnConfig;
use hegn_core::tensor::{concat_channels, FeatureShape};
use hegn_core::trace::{self, ShapeTracer};
use hegn_core::{Error, PairedFeatures, Result};
use hegn_dnn::{
    channel_equi_normalize, graph_feature, mean_pool, EquivariantLayer, VnLinearLeakyRelu,
};
use ndarray::{Array4, ArrayD, Axis, Ix4, Ix5};
use rand::Rng;
use std::sync::Arc;

/// Multi-head vector attention from one set onto the neighbor graph of the other.
///
/// Queries come from `x`, keys and values from `graph_feature(y, k)`. One
/// score per head, neighbor and point is computed from the head's channels
/// and shared by all of them.
pub struct CrossContext {
    channels: usize,
    head_channels: usize,
    k: usize,
    mlp_q: VnLinearLeakyRelu,
    mlp_k: VnLinearLeakyRelu,
    mlp_v: VnLinearLeakyRelu,
    tracer: Arc<dyn ShapeTracer>,
}

impl CrossContext {
    pub fn new<R: Rng + ?Sized>(
        channels: usize,
        head_channels: usize,
        k: usize,
        config: &HegnConfig,
        rng: &mut R,
    ) -> Result<Self> {
        if head_channels == 0 || channels % head_channels != 0 {
            return Err(Error::ConfigError(format!(
                "cross context: {} channels do not split into heads of {}",
                channels, head_channels
            )));
        }
        if k == 0 {
            return Err(Error::ConfigError("cross context k must be >= 1".into()));
        }
        Ok(Self {
            channels,
            head_channels,
            k,
            mlp_q: vn_layer(channels, channels, config, rng),
            mlp_k: vn_layer(2 * channels, channels, config, rng),
            mlp_v: vn_layer(2 * channels, channels, config, rng),
            tracer: trace::noop(),
        })
    }

    pub fn set_tracer(&mut self, tracer: Arc<dyn ShapeTracer>) {
        self.tracer = tracer;
    }

    pub fn num_heads(&self) -> usize {
        self.channels / self.head_channels
    }

    /// `x + Σ_j softmax_j(<Q, K_j> / sqrt(3C)) V_j`.
    pub fn forward(&self, x: &ArrayD<f32>, y: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let shape = FeatureShape::of(x.shape())?;
        shape.expect_channels(self.channels, "CrossContext")?;
        if x.shape() != y.shape() {
            return Err(Error::DimensionMismatch(format!(
                "cross context: x is {:?} but y is {:?}",
                x.shape(),
                y.shape()
            )));
        }

        let q = channel_equi_normalize(&self.mlp_q.forward(x)?)?;
        let graph = graph_feature(y, self.k)?;
        let key = channel_equi_normalize(&self.mlp_k.forward(&graph)?)?;
        let value = self.mlp_v.forward(&graph)?;
        self.tracer.record("cross_context.keys", key.shape());

        let q = q.into_dimensionality::<Ix4>()?;
        let key = key.into_dimensionality::<Ix5>()?;
        let value = value.into_dimensionality::<Ix5>()?;
        let (b, c, _, n, k) = key.dim();
        let heads = self.num_heads();
        let hc = self.head_channels;
        let scale = 1.0 / ((3 * c) as f32).sqrt();

        // [B, H, N, K] attention weights
        let mut attention = Array4::<f32>::zeros((b, heads, n, k));
        for ((bi, h, ni, j), a) in attention.indexed_iter_mut() {
            let mut score = 0.0;
            for ci in h * hc..(h + 1) * hc {
                for d in 0..3 {
                    score += q[[bi, ci, d, ni]] * key[[bi, ci, d, ni, j]];
                }
            }
            *a = score * scale;
        }
        for mut row in attention.lanes_mut(Axis(3)) {
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            row.mapv_inplace(|s| (s - max).exp());
            let sum = row.sum();
            row.mapv_inplace(|s| s / sum);
        }

        let x4 = x.view().into_dimensionality::<Ix4>()?;
        let out = Array4::from_shape_fn((b, c, 3, n), |(bi, ci, d, ni)| {
            let h = ci / hc;
            let attended: f32 = (0..k)
                .map(|j| attention[[bi, h, ni, j]] * value[[bi, ci, d, ni, j]])
                .sum();
            x4[[bi, ci, d, ni]] + attended
        });
        Ok(out.into_dyn())
    }

    /// X attends to Y, then Y attends to the updated X.
    pub fn forward_pair(&self, features: PairedFeatures) -> Result<PairedFeatures> {
        let fx = self.forward(features.x(), features.y())?;
        let fy = self.forward(features.y(), &fx)?;
        features.update(fx, fy)
    }

    pub fn num_parameters(&self) -> usize {
        self.mlp_q.num_parameters() + self.mlp_k.num_parameters() + self.mlp_v.num_parameters()
    }
}

/// Concatenates every point feature with the set mean and maps `2C -> C`.
pub struct GlobalContext {
    channels: usize,
    mlp: VnLinearLeakyRelu,
}

impl GlobalContext {
    pub fn new<R: Rng + ?Sized>(channels: usize, config: &HegnConfig, rng: &mut R) -> Self {
        Self {
            channels,
            mlp: vn_layer(2 * channels, channels, config, rng),
        }
    }

    pub fn forward_pair(&self, features: PairedFeatures) -> Result<PairedFeatures> {
        let fx = self.forward(features.x())?;
        let fy = self.forward(features.y())?;
        features.update(fx, fy)
    }
}

impl EquivariantLayer for GlobalContext {
    fn forward(&self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let shape = FeatureShape::of(x.shape())?;
        shape.expect_channels(self.channels, "GlobalContext")?;
        let mean = mean_pool(x)?.insert_axis(Axis(x.ndim() - 1));
        let mean = mean
            .broadcast(x.raw_dim())
            .ok_or_else(|| Error::DimensionMismatch("global mean does not broadcast".into()))?;
        self.mlp.forward(&concat_channels(&[x.view(), mean])?)
    }

    fn name(&self) -> &'static str {
        "global_context"
    }

    fn num_parameters(&self) -> usize {
        self.mlp.num_parameters()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hegn_core::geometry::random_rotation;
    use hegn_core::tensor::{max_abs_diff, rotate_vectors};
    use ndarray::IxDyn;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn features(rng: &mut StdRng, dims: &[usize]) -> ArrayD<f32> {
        ArrayD::from_shape_fn(IxDyn(dims), |_| rng.gen_range(-1.0f32..1.0))
    }

    #[test]
    fn test_cross_context_rejects_bad_heads() {
        let mut rng = StdRng::seed_from_u64(0);
        let config = HegnConfig::default();
        assert!(CrossContext::new(24, 16, 4, &config, &mut rng).is_err());
        let cc = CrossContext::new(32, 16, 4, &config, &mut rng).unwrap();
        assert_eq!(cc.num_heads(), 2);
    }

    #[test]
    fn test_cross_context_shape_and_equivariance() {
        let mut rng = StdRng::seed_from_u64(1);
        let config = HegnConfig::default();
        let cc = CrossContext::new(8, 4, 5, &config, &mut rng).unwrap();
        let x = features(&mut rng, &[2, 8, 3, 12]);
        let y = features(&mut rng, &[2, 8, 3, 12]);
        let out = cc.forward(&x, &y).unwrap();
        assert_eq!(out.shape(), &[2, 8, 3, 12]);

        let r = random_rotation(&mut rng, std::f32::consts::PI);
        let rotated = cc.forward(&rotate_vectors(&x, &r), &rotate_vectors(&y, &r)).unwrap();
        let err = max_abs_diff(&rotated, &rotate_vectors(&out, &r));
        assert!(err < 1e-3, "equivariance error {}", err);
    }

    #[test]
    fn test_cross_context_pair_updates_x_first() {
        let mut rng = StdRng::seed_from_u64(2);
        let config = HegnConfig::default();
        let cc = CrossContext::new(4, 4, 3, &config, &mut rng).unwrap();
        let x = features(&mut rng, &[1, 4, 3, 6]);
        let y = features(&mut rng, &[1, 4, 3, 6]);
        let pair = cc
            .forward_pair(PairedFeatures::new(x.clone(), y.clone()).unwrap())
            .unwrap();
        let fx = cc.forward(&x, &y).unwrap();
        let fy = cc.forward(&y, &fx).unwrap();
        assert!(max_abs_diff(pair.x(), &fx) < 1e-6);
        assert!(max_abs_diff(pair.y(), &fy) < 1e-6);
    }

    #[test]
    fn test_global_context_is_equivariant() {
        let mut rng = StdRng::seed_from_u64(3);
        let gc = GlobalContext::new(6, &HegnConfig::default(), &mut rng);
        let x = features(&mut rng, &[2, 6, 3, 10]);
        let out = gc.forward(&x).unwrap();
        assert_eq!(out.shape(), &[2, 6, 3, 10]);
        let r = random_rotation(&mut rng, std::f32::consts::PI);
        let rotated = gc.forward(&rotate_vectors(&x, &r)).unwrap();
        let err = max_abs_diff(&rotated, &rotate_vectors(&out, &r));
        assert!(err < 1e-4, "equivariance error {}", err);
    }
}
