//! Equivariant feature tensors.
//!
//! **Layout Convention:**
//! Every feature tensor is an `ndarray::ArrayD<f32>` laid out as `[B, C, 3, ...]`:
//! batch, channels, the 3-vector axis, then one or more sample axes
//! (points, and neighbors for graph features). Each channel holds a 3-vector,
//! never a scalar. Rotating the input point set by `R` maps every vector
//! `v` (a row) to `v · R`.

use crate::{Error, Result};
use nalgebra::Matrix3;
use ndarray::{concatenate, stack, Array4, ArrayD, ArrayViewD, Axis, IxDyn};

/// Index of the 3-vector axis.
pub const VECTOR_AXIS: usize = 2;

/// Additive guard used by every normalization.
pub const EPS: f32 = 1e-6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureShape {
    pub batch: usize,
    pub channels: usize,
    pub samples: Vec<usize>,
}

impl FeatureShape {
    pub fn new(batch: usize, channels: usize, samples: &[usize]) -> Self {
        Self {
            batch,
            channels,
            samples: samples.to_vec(),
        }
    }

    /// Validate a raw shape as `[B, C, 3, ...]`.
    pub fn of(dims: &[usize]) -> Result<Self> {
        if dims.len() < 3 {
            return Err(Error::DimensionMismatch(format!(
                "expected a [B, C, 3, ...] tensor, got shape {:?}",
                dims
            )));
        }
        if dims[VECTOR_AXIS] != 3 {
            return Err(Error::DimensionMismatch(format!(
                "vector axis must have length 3, got shape {:?}",
                dims
            )));
        }
        Ok(Self::new(dims[0], dims[1], &dims[3..]))
    }

    /// Number of vectors per channel (product of the sample axes).
    pub fn sample_len(&self) -> usize {
        self.samples.iter().product()
    }

    pub fn dims(&self) -> Vec<usize> {
        let mut dims = vec![self.batch, self.channels, 3];
        dims.extend_from_slice(&self.samples);
        dims
    }

    pub fn with_channels(&self, channels: usize) -> Self {
        Self {
            channels,
            ..self.clone()
        }
    }

    pub fn expect_channels(&self, channels: usize, stage: &str) -> Result<()> {
        if self.channels != channels {
            return Err(Error::DimensionMismatch(format!(
                "{}: expected {} channels, got {} (shape {:?})",
                stage,
                channels,
                self.channels,
                self.dims()
            )));
        }
        Ok(())
    }
}

/// Copy `[B, C, 3, ...]` into a standard-layout `[B, C, 3, M]` array.
pub fn flatten_samples(x: &ArrayD<f32>) -> Result<(FeatureShape, Array4<f32>)> {
    let shape = FeatureShape::of(x.shape())?;
    let flat = x.as_standard_layout().into_owned().into_shape((
        shape.batch,
        shape.channels,
        3,
        shape.sample_len(),
    ))?;
    Ok((shape, flat))
}

/// Inverse of [`flatten_samples`]; the channel count is taken from `x`.
pub fn restore_samples(x: Array4<f32>, shape: &FeatureShape) -> Result<ArrayD<f32>> {
    let dims = shape.with_channels(x.dim().1).dims();
    let x = if x.is_standard_layout() {
        x
    } else {
        x.as_standard_layout().into_owned()
    };
    Ok(x.into_shape(IxDyn(&dims))?)
}

/// Euclidean norm of every vector; drops the vector axis.
pub fn vector_norms(x: &ArrayD<f32>) -> ArrayD<f32> {
    x.map_axis(Axis(VECTOR_AXIS), |v| v.dot(&v).sqrt())
}

/// Concatenate feature tensors along the channel axis.
pub fn concat_channels(parts: &[ArrayViewD<'_, f32>]) -> Result<ArrayD<f32>> {
    let first = parts
        .first()
        .ok_or_else(|| Error::InvalidInput("cannot concatenate an empty tensor list".into()))?;
    let reference = FeatureShape::of(first.shape())?;
    for (i, part) in parts.iter().enumerate().skip(1) {
        let shape = FeatureShape::of(part.shape())?;
        if shape.batch != reference.batch || shape.samples != reference.samples {
            return Err(Error::DimensionMismatch(format!(
                "channel concat: part {} has shape {:?}, expected {:?} apart from channels",
                i,
                part.shape(),
                reference.dims()
            )));
        }
    }
    Ok(concatenate(Axis(1), parts)?)
}

/// Arithmetic mean over the last sample axis.
pub fn mean_samples(x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    let shape = FeatureShape::of(x.shape())?;
    if shape.samples.is_empty() {
        return Err(Error::DimensionMismatch(format!(
            "mean pooling needs a sample axis, got shape {:?}",
            x.shape()
        )));
    }
    let last = Axis(x.ndim() - 1);
    x.mean_axis(last)
        .ok_or_else(|| Error::InvalidInput("mean pooling over an empty axis".into()))
}

/// Gather `[B, C, 3, N]` at per-batch sample indices, giving `[B, C, 3, M]`.
pub fn gather_samples(x: &ArrayD<f32>, indices: &[Vec<usize>]) -> Result<ArrayD<f32>> {
    let shape = FeatureShape::of(x.shape())?;
    if shape.samples.len() != 1 {
        return Err(Error::DimensionMismatch(format!(
            "gather expects [B, C, 3, N], got {:?}",
            x.shape()
        )));
    }
    if indices.len() != shape.batch {
        return Err(Error::DimensionMismatch(format!(
            "gather: {} index lists for batch of {}",
            indices.len(),
            shape.batch
        )));
    }
    let n = shape.samples[0];
    let m = indices.first().map_or(0, Vec::len);
    for idx in indices {
        if idx.len() != m {
            return Err(Error::DimensionMismatch(
                "gather: index lists differ in length across the batch".into(),
            ));
        }
        if let Some(&bad) = idx.iter().find(|&&i| i >= n) {
            return Err(Error::InvalidInput(format!(
                "gather: index {} out of range for {} samples",
                bad, n
            )));
        }
    }

    let gathered: Vec<ArrayD<f32>> = indices
        .iter()
        .enumerate()
        .map(|(b, idx)| x.index_axis(Axis(0), b).select(Axis(2), idx))
        .collect();
    let views: Vec<ArrayViewD<'_, f32>> = gathered.iter().map(|g| g.view()).collect();
    Ok(stack(Axis(0), &views)?)
}

/// Apply `v -> v · R` to every vector of a feature tensor.
pub fn rotate_vectors(x: &ArrayD<f32>, rotation: &Matrix3<f32>) -> ArrayD<f32> {
    let mut out = x.to_owned();
    for mut lane in out.lanes_mut(Axis(VECTOR_AXIS)) {
        let v = [lane[0], lane[1], lane[2]];
        for j in 0..3 {
            lane[j] = v[0] * rotation[(0, j)] + v[1] * rotation[(1, j)] + v[2] * rotation[(2, j)];
        }
    }
    out
}

pub fn all_finite(x: &ArrayD<f32>) -> bool {
    x.iter().all(|v| v.is_finite())
}

/// Largest elementwise absolute difference; `f32::INFINITY` on shape mismatch.
pub fn max_abs_diff(a: &ArrayD<f32>, b: &ArrayD<f32>) -> f32 {
    if a.shape() != b.shape() {
        return f32::INFINITY;
    }
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}
