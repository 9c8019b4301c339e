//! Index-aligned X/Y pairs.
//!
//! The two point sets flow through structurally identical pipelines and must
//! keep a common correspondence ordering. These types make that contract
//! explicit: both sides always share batch size and sample count, and sample
//! selection is applied to both with one set of indices.

use crate::point_cloud::PointBatch;
use crate::tensor::{gather_samples, FeatureShape};
use crate::{Error, Result};
use ndarray::ArrayD;

#[derive(Debug, Clone, PartialEq)]
pub struct PairedBatch {
    x: PointBatch,
    y: PointBatch,
}

impl PairedBatch {
    pub fn new(x: PointBatch, y: PointBatch) -> Result<Self> {
        if x.batch_size() != y.batch_size() || x.num_points() != y.num_points() {
            return Err(Error::DimensionMismatch(format!(
                "paired batch: x is {:?} but y is {:?}",
                x.view().shape(),
                y.view().shape()
            )));
        }
        Ok(Self { x, y })
    }

    pub fn x(&self) -> &PointBatch {
        &self.x
    }

    pub fn y(&self) -> &PointBatch {
        &self.y
    }

    pub fn batch_size(&self) -> usize {
        self.x.batch_size()
    }

    pub fn num_points(&self) -> usize {
        self.x.num_points()
    }

    pub fn to_features(&self) -> Result<PairedFeatures> {
        PairedFeatures::new(self.x.to_features(), self.y.to_features())
    }
}

/// Per-point features `[B, C, 3, N]` for both sets.
#[derive(Debug, Clone, PartialEq)]
pub struct PairedFeatures {
    x: ArrayD<f32>,
    y: ArrayD<f32>,
    selection: Option<Vec<Vec<usize>>>,
}

impl PairedFeatures {
    pub fn new(x: ArrayD<f32>, y: ArrayD<f32>) -> Result<Self> {
        Self::check(&x, &y)?;
        Ok(Self {
            x,
            y,
            selection: None,
        })
    }

    fn check(x: &ArrayD<f32>, y: &ArrayD<f32>) -> Result<FeatureShape> {
        let shape = FeatureShape::of(x.shape())?;
        if shape.samples.len() != 1 {
            return Err(Error::DimensionMismatch(format!(
                "paired features must be [B, C, 3, N], got {:?}",
                x.shape()
            )));
        }
        if x.shape() != y.shape() {
            return Err(Error::DimensionMismatch(format!(
                "paired features: x is {:?} but y is {:?}",
                x.shape(),
                y.shape()
            )));
        }
        Ok(shape)
    }

    pub fn x(&self) -> &ArrayD<f32> {
        &self.x
    }

    pub fn y(&self) -> &ArrayD<f32> {
        &self.y
    }

    pub fn shape(&self) -> FeatureShape {
        // validated at construction
        FeatureShape::new(
            self.x.shape()[0],
            self.x.shape()[1],
            &self.x.shape()[3..],
        )
    }

    pub fn num_samples(&self) -> usize {
        self.x.shape()[3]
    }

    /// Indices (into the previous level) chosen by the last selection step.
    pub fn selection(&self) -> Option<&[Vec<usize>]> {
        self.selection.as_deref()
    }

    /// Replace both feature tensors, keeping the selection record.
    ///
    /// The sample count must not change; only selection may subsample.
    pub fn update(self, x: ArrayD<f32>, y: ArrayD<f32>) -> Result<Self> {
        let shape = Self::check(&x, &y)?;
        if shape.samples[0] != self.num_samples() || shape.batch != self.shape().batch {
            return Err(Error::DimensionMismatch(format!(
                "paired update changed samples: {:?} -> {:?}",
                self.x.shape(),
                x.shape()
            )));
        }
        Ok(Self {
            x,
            y,
            selection: self.selection,
        })
    }

    /// Gather both sides at the same per-batch sample indices.
    pub fn select(self, indices: Vec<Vec<usize>>) -> Result<Self> {
        let x = gather_samples(&self.x, &indices)?;
        let y = gather_samples(&self.y, &indices)?;
        Ok(Self {
            x,
            y,
            selection: Some(indices),
        })
    }
}
