//! VN-DGCNN local context extractor.
//!
//! Three edge-convolution stages, each rebuilding the kNN graph from the
//! previous stage's features, followed by a fusion layer over the
//! concatenated stage outputs.

use crate::graph::{effective_k, graph_feature};
use crate::linear::VnLinearLeakyRelu;
use crate::pool::{mean_pool, VnMaxPool};
use crate::{EquivariantLayer, Mode, Result, DEFAULT_NEGATIVE_SLOPE};
use hegn_core::tensor::{concat_channels, FeatureShape};
use hegn_core::trace::{self, ShapeTracer};
use hegn_core::Error;
use ndarray::ArrayD;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const EDGE_STAGES: usize = 3;

/// Reduction over the neighbor axis of an edge convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pooling {
    #[default]
    Mean,
    Max,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalContextConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub k: usize,
    #[serde(default)]
    pub pooling: Pooling,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default = "default_negative_slope")]
    pub negative_slope: f32,
}

fn default_negative_slope() -> f32 {
    DEFAULT_NEGATIVE_SLOPE
}

impl LocalContextConfig {
    pub fn new(in_channels: usize, out_channels: usize, k: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            k,
            pooling: Pooling::default(),
            mode: Mode::default(),
            negative_slope: DEFAULT_NEGATIVE_SLOPE,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.in_channels == 0 || self.out_channels == 0 {
            return Err(Error::ConfigError(format!(
                "local context channels must be non-zero, got {} -> {}",
                self.in_channels, self.out_channels
            )));
        }
        if self.k == 0 {
            return Err(Error::ConfigError("local context k must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&self.negative_slope) {
            return Err(Error::ConfigError(format!(
                "negative slope {} outside [0, 1]",
                self.negative_slope
            )));
        }
        Ok(())
    }
}

enum NeighborPool {
    Mean,
    Max(VnMaxPool),
}

impl NeighborPool {
    fn forward(&self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        match self {
            NeighborPool::Mean => mean_pool(x),
            NeighborPool::Max(pool) => pool.forward(x),
        }
    }

    fn num_parameters(&self) -> usize {
        match self {
            NeighborPool::Mean => 0,
            NeighborPool::Max(pool) => pool.num_parameters(),
        }
    }
}

struct EdgeConv {
    conv: VnLinearLeakyRelu,
    pool: NeighborPool,
}

pub struct LocalContext {
    config: LocalContextConfig,
    stages: Vec<EdgeConv>,
    fuse: VnLinearLeakyRelu,
    tracer: Arc<dyn ShapeTracer>,
}

impl LocalContext {
    pub fn new<R: Rng + ?Sized>(config: LocalContextConfig, rng: &mut R) -> Result<Self> {
        config.validate()?;
        let c_out = config.out_channels;
        let layer = |c_in: usize, rng: &mut R| {
            VnLinearLeakyRelu::new(c_in, c_out, rng)
                .with_mode(config.mode)
                .with_negative_slope(config.negative_slope)
        };

        let mut stages = Vec::with_capacity(EDGE_STAGES);
        for stage in 0..EDGE_STAGES {
            let c_in = if stage == 0 { config.in_channels } else { c_out };
            let conv = layer(2 * c_in, rng);
            let pool = match config.pooling {
                Pooling::Mean => NeighborPool::Mean,
                Pooling::Max => NeighborPool::Max(VnMaxPool::new(c_out, rng)),
            };
            stages.push(EdgeConv { conv, pool });
        }
        let fuse = layer(EDGE_STAGES * c_out, rng);

        Ok(Self {
            config,
            stages,
            fuse,
            tracer: trace::noop(),
        })
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn ShapeTracer>) -> Self {
        self.set_tracer(tracer);
        self
    }

    pub fn set_tracer(&mut self, tracer: Arc<dyn ShapeTracer>) {
        self.tracer = tracer;
    }

    pub fn config(&self) -> &LocalContextConfig {
        &self.config
    }
}

impl EquivariantLayer for LocalContext {
    fn forward(&self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let shape = FeatureShape::of(x.shape())?;
        shape.expect_channels(self.config.in_channels, "LocalContext")?;
        let n = shape.samples.first().copied().unwrap_or(0);
        let k = effective_k(n, self.config.k);
        if k < self.config.k {
            self.tracer.note(
                "local_context",
                &format!("k = {} clamped to {} points", self.config.k, k),
            );
        }

        let mut current = x.clone();
        let mut outputs = Vec::with_capacity(EDGE_STAGES);
        for stage in &self.stages {
            let edges = graph_feature(&current, k)?;
            self.tracer.record("local_context.edges", edges.shape());
            current = stage.pool.forward(&stage.conv.forward(&edges)?)?;
            outputs.push(current.clone());
        }

        let views: Vec<_> = outputs.iter().map(|o| o.view()).collect();
        let fused = self.fuse.forward(&concat_channels(&views)?)?;
        self.tracer.record("local_context", fused.shape());
        Ok(fused)
    }

    fn name(&self) -> &'static str {
        "local_context"
    }

    fn num_parameters(&self) -> usize {
        self.stages
            .iter()
            .map(|s| s.conv.num_parameters() + s.pool.num_parameters())
            .sum::<usize>()
            + self.fuse.num_parameters()
    }
}
