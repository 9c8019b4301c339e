//! Registration + chamfer training objective.

use hegn_core::geometry::chamfer_distance;
use hegn_core::{Error, Result};
use ndarray::{ArrayView2, ArrayView3};
use serde::{Deserialize, Serialize};

/// Everything the loss consumes; all arrays share the batch size `B`.
#[derive(Debug, Clone, Copy)]
pub struct LossInputs<'a> {
    /// Source cloud after the predicted transform, `[B, N, 3]`.
    pub x_aligned: ArrayView3<'a, f32>,
    /// Target cloud, `[B, M, 3]`.
    pub y: ArrayView3<'a, f32>,
    pub rotation: ArrayView3<'a, f32>,
    /// Diagonal `[B, 3, 3]`.
    pub scale: ArrayView3<'a, f32>,
    pub translation: ArrayView2<'a, f32>,
    pub rotation_gt: ArrayView3<'a, f32>,
    pub scale_gt: ArrayView3<'a, f32>,
    pub translation_gt: ArrayView2<'a, f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossTerms {
    pub total: f32,
    pub registration: f32,
    pub chamfer: f32,
}

/// `mean_b(|R_gtᵀ R - I|²_F + |diag S - diag S_gt|² + |t - t_gt|²) + chamfer`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HegnLoss;

impl HegnLoss {
    pub fn new() -> Self {
        Self
    }

    pub fn registration(&self, inputs: &LossInputs<'_>) -> Result<f32> {
        let b = inputs.rotation.dim().0;
        let square = [
            ("rotation", inputs.rotation),
            ("scale", inputs.scale),
            ("rotation_gt", inputs.rotation_gt),
            ("scale_gt", inputs.scale_gt),
        ];
        for (name, m) in square {
            if m.dim() != (b, 3, 3) {
                return Err(Error::DimensionMismatch(format!(
                    "loss: {} must be [{}, 3, 3], got {:?}",
                    name,
                    b,
                    m.shape()
                )));
            }
        }
        let translations = [
            ("translation", inputs.translation),
            ("translation_gt", inputs.translation_gt),
        ];
        for (name, t) in translations {
            if t.dim() != (b, 3) {
                return Err(Error::DimensionMismatch(format!(
                    "loss: {} must be [{}, 3], got {:?}",
                    name,
                    b,
                    t.shape()
                )));
            }
        }
        if b == 0 {
            return Err(Error::InvalidInput("loss over an empty batch".into()));
        }

        let total: f32 = (0..b)
            .map(|bi| {
                let r = inputs.rotation.index_axis(ndarray::Axis(0), bi);
                let r_gt = inputs.rotation_gt.index_axis(ndarray::Axis(0), bi);
                let mut rotation_term = 0.0;
                for i in 0..3 {
                    for j in 0..3 {
                        // (R_gtᵀ R)[i, j] - I[i, j]
                        let v: f32 = (0..3).map(|k| r_gt[[k, i]] * r[[k, j]]).sum::<f32>()
                            - if i == j { 1.0 } else { 0.0 };
                        rotation_term += v * v;
                    }
                }
                let scale_term: f32 = (0..3)
                    .map(|d| (inputs.scale[[bi, d, d]] - inputs.scale_gt[[bi, d, d]]).powi(2))
                    .sum();
                let translation_term: f32 = (0..3)
                    .map(|d| (inputs.translation[[bi, d]] - inputs.translation_gt[[bi, d]]).powi(2))
                    .sum();
                rotation_term + scale_term + translation_term
            })
            .sum();
        Ok(total / b as f32)
    }

    pub fn compute(&self, inputs: &LossInputs<'_>) -> Result<LossTerms> {
        if inputs.x_aligned.dim().0 != inputs.rotation.dim().0 {
            return Err(Error::DimensionMismatch(format!(
                "loss: {} aligned clouds for {} predictions",
                inputs.x_aligned.dim().0,
                inputs.rotation.dim().0
            )));
        }
        let registration = self.registration(inputs)?;
        let chamfer = chamfer_distance(inputs.x_aligned, inputs.y)?;
        let terms = LossTerms {
            total: registration + chamfer,
            registration,
            chamfer,
        };
        if !terms.total.is_finite() {
            return Err(Error::NumericalError(format!("non-finite loss {:?}", terms)));
        }
        Ok(terms)
    }
}
