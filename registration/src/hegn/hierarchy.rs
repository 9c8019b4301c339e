use super::context::{CrossContext, GlobalContext};
use super::vn_layer;
use crate::config::HegnConfig;
use hegn_core::tensor::concat_channels;
use hegn_core::trace::ShapeTracer;
use hegn_core::{Error, PairedFeatures, Result};
use hegn_dnn::{mean_pool, EquivariantLayer, LocalContext, VnLinearLeakyRelu};
use ndarray::ArrayD;
use rand::Rng;
use std::sync::Arc;

/// Local, cross and global context for one hierarchy level.
pub struct FeatureExtraction {
    local: LocalContext,
    cross: CrossContext,
    global: GlobalContext,
}

impl FeatureExtraction {
    pub fn new<R: Rng + ?Sized>(config: &HegnConfig, level: usize, rng: &mut R) -> Result<Self> {
        let c_out = config.out_channels[level];
        Ok(Self {
            local: LocalContext::new(config.local_context(level), rng)?,
            cross: CrossContext::new(
                c_out,
                config.head_channels,
                config.n_knn[level],
                config,
                rng,
            )?,
            global: GlobalContext::new(c_out, config, rng),
        })
    }

    pub fn set_tracer(&mut self, tracer: Arc<dyn ShapeTracer>) {
        self.local.set_tracer(tracer.clone());
        self.cross.set_tracer(tracer);
    }

    pub fn forward(&self, features: PairedFeatures) -> Result<PairedFeatures> {
        let (fx, fy) = rayon::join(
            || self.local.forward(features.x()),
            || self.local.forward(features.y()),
        );
        let features = features.update(fx?, fy?)?;
        let features = self.cross.forward_pair(features)?;
        self.global.forward_pair(features)
    }

    pub fn num_parameters(&self) -> usize {
        self.local.num_parameters() + self.cross.num_parameters() + self.global.num_parameters()
    }
}

/// Fuses the mean-pooled outputs of all blocks into one `[B, C, 3]` descriptor.
pub struct HierarchicalAggregation {
    in_channels: usize,
    mlp: VnLinearLeakyRelu,
}

impl HierarchicalAggregation {
    pub fn new<R: Rng + ?Sized>(config: &HegnConfig, rng: &mut R) -> Self {
        let in_channels = config.out_channels.iter().sum();
        let out_channels = config.out_channels[config.out_channels.len() - 1];
        Self {
            in_channels,
            mlp: vn_layer(in_channels, out_channels, config, rng),
        }
    }

    pub fn forward(&self, blocks: &[ArrayD<f32>]) -> Result<ArrayD<f32>> {
        if blocks.is_empty() {
            return Err(Error::InvalidInput("no block features to aggregate".into()));
        }
        let pooled = blocks.iter().map(mean_pool).collect::<Result<Vec<_>>>()?;
        let views: Vec<_> = pooled.iter().map(|p| p.view()).collect();
        let fused = concat_channels(&views)?;
        if fused.shape()[1] != self.in_channels {
            return Err(Error::DimensionMismatch(format!(
                "hierarchical aggregation expects {} channels in total, got {}",
                self.in_channels,
                fused.shape()[1]
            )));
        }
        self.mlp.forward(&fused)
    }

    pub fn forward_pair(&self, blocks: &[PairedFeatures]) -> Result<(ArrayD<f32>, ArrayD<f32>)> {
        let xs: Vec<ArrayD<f32>> = blocks.iter().map(|b| b.x().clone()).collect();
        let ys: Vec<ArrayD<f32>> = blocks.iter().map(|b| b.y().clone()).collect();
        Ok((self.forward(&xs)?, self.forward(&ys)?))
    }

    pub fn num_parameters(&self) -> usize {
        self.mlp.num_parameters()
    }
}
