//! Rotation-invariant point scores and shared subset selection.

use hegn_core::tensor::{FeatureShape, EPS};
use hegn_core::trace::{self, ShapeTracer};
use hegn_core::{Error, PairedFeatures, Result};
use ndarray::{Array2, Array3, ArrayD, Axis, Ix4};
use std::cmp::Ordering;
use std::sync::Arc;

/// Projection of every channel onto the unit mean direction of its point.
///
/// `[B, C, 3, N] -> [B, N, C]`; unchanged when the input is rotated.
pub fn invariant_descriptor(f: &ArrayD<f32>) -> Result<Array3<f32>> {
    let shape = FeatureShape::of(f.shape())?;
    if shape.samples.len() != 1 {
        return Err(Error::DimensionMismatch(format!(
            "invariant mapping expects [B, C, 3, N], got {:?}",
            f.shape()
        )));
    }
    let f = f.view().into_dimensionality::<Ix4>()?;
    let (b, c, _, n) = f.dim();

    // [B, 3, N]
    let mut direction = f
        .mean_axis(Axis(1))
        .ok_or_else(|| Error::InvalidInput("invariant mapping over zero channels".into()))?;
    for mut v in direction.lanes_mut(Axis(1)) {
        let norm = v.dot(&v).sqrt();
        v.mapv_inplace(|x| x / (norm + EPS));
    }

    Ok(Array3::from_shape_fn((b, n, c), |(bi, ni, ci)| {
        (0..3).map(|d| f[[bi, ci, d, ni]] * direction[[bi, d, ni]]).sum()
    }))
}

/// Per-point agreement of the X and Y descriptors, softmaxed over points: `[B, N]`.
pub fn invariant_scores(fx: &ArrayD<f32>, fy: &ArrayD<f32>) -> Result<Array2<f32>> {
    if fx.shape() != fy.shape() {
        return Err(Error::DimensionMismatch(format!(
            "invariant scores: x is {:?} but y is {:?}",
            fx.shape(),
            fy.shape()
        )));
    }
    let phi_x = invariant_descriptor(fx)?;
    let phi_y = invariant_descriptor(fy)?;

    let mut scores = (&phi_x * &phi_y).sum_axis(Axis(2));
    for mut row in scores.outer_iter_mut() {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|s| (s - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|s| s / sum);
    }
    Ok(scores)
}

/// Points kept out of `num_points` for divisor `topk`; never zero.
pub fn selection_count(num_points: usize, topk: usize) -> Result<usize> {
    if topk == 0 {
        return Err(Error::InvalidInput("selection divisor topk must be >= 1".into()));
    }
    Ok((num_points / topk).max(1))
}

/// Keeps the `N / topk` best-scoring points of both sets with shared indices.
#[derive(Debug, Clone)]
pub struct InvariantMapping {
    topk: usize,
    tracer: Arc<dyn ShapeTracer>,
}

impl InvariantMapping {
    pub fn new(topk: usize) -> Result<Self> {
        selection_count(1, topk)?;
        Ok(Self {
            topk,
            tracer: trace::noop(),
        })
    }

    pub fn set_tracer(&mut self, tracer: Arc<dyn ShapeTracer>) {
        self.tracer = tracer;
    }

    pub fn topk(&self) -> usize {
        self.topk
    }

    /// Indices sorted by descending score; ties keep the lower index first.
    pub fn top_indices(&self, scores: &Array2<f32>) -> Result<Vec<Vec<usize>>> {
        let count = selection_count(scores.ncols(), self.topk)?;
        Ok(scores
            .outer_iter()
            .map(|row| {
                let mut order: Vec<usize> = (0..row.len()).collect();
                order.sort_by(|&a, &b| match row[b].total_cmp(&row[a]) {
                    Ordering::Equal => a.cmp(&b),
                    other => other,
                });
                order.truncate(count);
                order
            })
            .collect())
    }

    pub fn select(&self, features: PairedFeatures) -> Result<PairedFeatures> {
        let scores = invariant_scores(features.x(), features.y())?;
        self.tracer.record("invariant_mapping.scores", scores.shape());
        let indices = self.top_indices(&scores)?;
        let selected = features.select(indices)?;
        self.tracer.record("invariant_mapping", selected.x().shape());
        Ok(selected)
    }
}
