use super::alignment::{Alignment, AlignmentSolver};
use super::hierarchy::{FeatureExtraction, HierarchicalAggregation};
use super::invariant::InvariantMapping;
use crate::config::{HegnConfig, NUM_BLOCKS};
use hegn_core::trace::{self, ShapeTracer};
use hegn_core::{Error, PairedBatch, PairedFeatures, Result};
use ndarray::Array3;
use rand::Rng;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

struct HierarchyBlock {
    extraction: FeatureExtraction,
    mapping: InvariantMapping,
}

/// Channel width and surviving sample count of one block's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSummary {
    pub channels: usize,
    pub num_samples: usize,
}

#[derive(Debug, Clone)]
pub struct HegnOutput {
    /// `[B, 3, 3]`
    pub rotation: Array3<f32>,
    /// `[B, 3, 3]`, diagonal.
    pub scale: Array3<f32>,
    pub alignments: Vec<Alignment>,
    pub blocks: Vec<BlockSummary>,
}

/// Hierarchical equivariant graph network.
///
/// Maps a source/target point batch to a rotation and per-axis scale per
/// batch element. Parameters are plain data owned by the layers; the forward
/// pass never mutates them.
pub struct Hegn {
    config: HegnConfig,
    blocks: Vec<HierarchyBlock>,
    aggregation: HierarchicalAggregation,
    solver: AlignmentSolver,
    pool: Option<ThreadPool>,
    tracer: Arc<dyn ShapeTracer>,
}

impl Hegn {
    pub fn new<R: Rng + ?Sized>(config: HegnConfig, rng: &mut R) -> Result<Self> {
        config.validate()?;
        let blocks = (0..NUM_BLOCKS)
            .map(|level| {
                Ok(HierarchyBlock {
                    extraction: FeatureExtraction::new(&config, level, rng)?,
                    mapping: InvariantMapping::new(config.topk[level])?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let aggregation = HierarchicalAggregation::new(&config, rng);
        let pool = config.device.thread_pool()?;

        Ok(Self {
            config,
            blocks,
            aggregation,
            solver: AlignmentSolver::new(),
            pool,
            tracer: trace::noop(),
        })
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn ShapeTracer>) -> Self {
        for block in &mut self.blocks {
            block.extraction.set_tracer(tracer.clone());
            block.mapping.set_tracer(tracer.clone());
        }
        self.tracer = tracer;
        self
    }

    pub fn config(&self) -> &HegnConfig {
        &self.config
    }

    pub fn num_parameters(&self) -> usize {
        self.blocks
            .iter()
            .map(|b| b.extraction.num_parameters())
            .sum::<usize>()
            + self.aggregation.num_parameters()
    }

    pub fn forward(&self, batch: &PairedBatch) -> Result<HegnOutput> {
        match &self.pool {
            Some(pool) => pool.install(|| self.run(batch)),
            None => self.run(batch),
        }
    }

    fn run(&self, batch: &PairedBatch) -> Result<HegnOutput> {
        let mut features = batch.to_features()?;
        self.tracer.record("input", features.x().shape());

        let mut outputs: Vec<PairedFeatures> = Vec::with_capacity(self.blocks.len());
        let mut summaries = Vec::with_capacity(self.blocks.len());
        for (level, block) in self.blocks.iter().enumerate() {
            features = block.extraction.forward(features)?;
            features = block.mapping.select(features)?;
            let shape = features.shape();
            self.tracer.note(
                "block",
                &format!(
                    "block {} -> {} channels x {} points",
                    level, shape.channels, shape.samples[0]
                ),
            );
            summaries.push(BlockSummary {
                channels: shape.channels,
                num_samples: shape.samples[0],
            });
            outputs.push(features.clone());
        }

        let (fx, fy) = self.aggregation.forward_pair(&outputs)?;
        self.tracer.record("hierarchical_aggregation", fx.shape());
        let alignments = self.solver.solve(&fx, &fy)?;

        let b = alignments.len();
        let rotation = Array3::from_shape_fn((b, 3, 3), |(i, r, c)| alignments[i].rotation[(r, c)]);
        let scale = Array3::from_shape_fn((b, 3, 3), |(i, r, c)| {
            if r == c {
                alignments[i].scale[r]
            } else {
                0.0
            }
        });
        if rotation.iter().chain(scale.iter()).any(|v| !v.is_finite()) {
            return Err(Error::NumericalError("non-finite model output".into()));
        }
        self.tracer.record("rotation", rotation.shape());

        Ok(HegnOutput {
            rotation,
            scale,
            alignments,
            blocks: summaries,
        })
    }
}
