use crate::linear::VnLinear;
use crate::{EquivariantLayer, Result};
use hegn_core::tensor::{flatten_samples, mean_samples, restore_samples, FeatureShape};
use hegn_core::Error;
use ndarray::{Array4, ArrayD};
use rand::Rng;

/// Mean over the last sample axis: `[B, C, 3, ..., K] -> [B, C, 3, ...]`.
pub fn mean_pool(x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    mean_samples(x)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MeanPool;

impl EquivariantLayer for MeanPool {
    fn forward(&self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        mean_pool(x)
    }

    fn name(&self) -> &'static str {
        "mean_pool"
    }
}

/// Picks, per channel, the sample whose vector best aligns with a learned
/// direction `d = W x` over the last sample axis.
#[derive(Debug, Clone)]
pub struct VnMaxPool {
    map_to_dir: VnLinear,
}

impl VnMaxPool {
    pub fn new<R: Rng + ?Sized>(channels: usize, rng: &mut R) -> Self {
        Self {
            map_to_dir: VnLinear::new(channels, channels, rng),
        }
    }

    pub fn from_direction(map_to_dir: VnLinear) -> Result<Self> {
        if map_to_dir.in_channels() != map_to_dir.out_channels() {
            return Err(Error::DimensionMismatch(format!(
                "VnMaxPool direction map must be square, got {}x{}",
                map_to_dir.out_channels(),
                map_to_dir.in_channels()
            )));
        }
        Ok(Self { map_to_dir })
    }
}

impl EquivariantLayer for VnMaxPool {
    fn forward(&self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let d = self.map_to_dir.forward(x)?;
        let (shape, flat) = flatten_samples(x)?;
        let (_, d) = flatten_samples(&d)?;

        let (&k, rest) = shape.samples.split_last().ok_or_else(|| {
            Error::DimensionMismatch(format!(
                "max pooling needs a sample axis, got shape {:?}",
                x.shape()
            ))
        })?;
        if k == 0 {
            return Err(Error::InvalidInput("max pooling over an empty axis".into()));
        }
        let r: usize = rest.iter().product();
        let (b, c, _, _) = flat.dim();
        let flat = flat.into_shape((b, c, 3, r, k))?;
        let d = d.into_shape((b, c, 3, r, k))?;

        let out = Array4::from_shape_fn((b, c, 3, r), |(bi, ci, axis, ri)| {
            let mut best = 0;
            let mut best_dot = f32::NEG_INFINITY;
            for ki in 0..k {
                let dot: f32 = (0..3)
                    .map(|v| flat[[bi, ci, v, ri, ki]] * d[[bi, ci, v, ri, ki]])
                    .sum();
                if dot > best_dot {
                    best_dot = dot;
                    best = ki;
                }
            }
            flat[[bi, ci, axis, ri, best]]
        });

        let pooled = FeatureShape::new(shape.batch, shape.channels, rest);
        restore_samples(out, &pooled)
    }

    fn name(&self) -> &'static str {
        "vn_max_pool"
    }

    fn num_parameters(&self) -> usize {
        self.map_to_dir.num_parameters()
    }
}
