//! Closed-form rotation and scale from paired equivariant descriptors.

use hegn_core::tensor::{all_finite, EPS};
use hegn_core::{Error, PointCloud, Result, Similarity};
use nalgebra::{Matrix3, Vector3};
use ndarray::{ArrayD, Ix3};
use serde::{Deserialize, Serialize};

const SVD_MAX_ITERATIONS: usize = 200;

/// Predicted rotation and per-axis scale for one batch element.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Alignment {
    pub rotation: Matrix3<f32>,
    pub scale: Vector3<f32>,
}

impl Alignment {
    pub fn scale_matrix(&self) -> Matrix3<f32> {
        Matrix3::from_diagonal(&self.scale)
    }

    pub fn determinant(&self) -> f32 {
        self.rotation.determinant()
    }

    pub fn with_translation(&self, translation: Vector3<f32>) -> Similarity {
        Similarity::new(self.rotation, self.scale, translation)
    }
}

/// Procrustes alignment of `[B, C, 3]` descriptors.
///
/// `H = fxᵀ fy = U Σ Vᵀ` gives `R = U Vᵀ`. No determinant correction is
/// applied, so a reflection is returned as-is. Scale per axis is the ratio
/// of channel-wise norms `|fy[:, d]| / |fx[:, d]|`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlignmentSolver;

impl AlignmentSolver {
    pub fn new() -> Self {
        Self
    }

    pub fn solve(&self, fx: &ArrayD<f32>, fy: &ArrayD<f32>) -> Result<Vec<Alignment>> {
        if fx.shape() != fy.shape() || fx.ndim() != 3 || fx.shape()[2] != 3 {
            return Err(Error::DimensionMismatch(format!(
                "alignment expects two [B, C, 3] descriptors, got {:?} and {:?}",
                fx.shape(),
                fy.shape()
            )));
        }
        if !all_finite(fx) || !all_finite(fy) {
            return Err(Error::NumericalError("non-finite descriptor before alignment".into()));
        }
        let fx = fx.view().into_dimensionality::<Ix3>()?;
        let fy = fy.view().into_dimensionality::<Ix3>()?;
        let (b, c, _) = fx.dim();

        (0..b)
            .map(|bi| {
                let mut h = Matrix3::<f32>::zeros();
                let mut norm_x = Vector3::<f32>::zeros();
                let mut norm_y = Vector3::<f32>::zeros();
                for ci in 0..c {
                    for d in 0..3 {
                        let a = fx[[bi, ci, d]];
                        norm_x[d] += a * a;
                        norm_y[d] += fy[[bi, ci, d]] * fy[[bi, ci, d]];
                        for e in 0..3 {
                            h[(d, e)] += a * fy[[bi, ci, e]];
                        }
                    }
                }

                let svd = h
                    .try_svd(true, true, f32::EPSILON, SVD_MAX_ITERATIONS)
                    .ok_or_else(|| {
                        Error::NumericalError(format!("SVD did not converge for element {}", bi))
                    })?;
                let u = svd
                    .u
                    .ok_or_else(|| Error::NumericalError("SVD returned no U".into()))?;
                let v_t = svd
                    .v_t
                    .ok_or_else(|| Error::NumericalError("SVD returned no Vᵀ".into()))?;

                let rotation = u * v_t;
                let scale = Vector3::from_fn(|d, _| norm_y[d].sqrt() / (norm_x[d].sqrt() + EPS));
                if rotation.iter().chain(scale.iter()).any(|v| !v.is_finite()) {
                    return Err(Error::NumericalError(format!(
                        "non-finite alignment for element {}",
                        bi
                    )));
                }
                Ok(Alignment { rotation, scale })
            })
            .collect()
    }
}

/// Source of the translation paired with a predicted rotation and scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranslationPolicy {
    /// No translation; inputs are assumed centered.
    #[default]
    Zero,
    /// Map the source centroid onto the target centroid.
    Centroid,
}

pub fn estimate_translation(
    policy: TranslationPolicy,
    alignment: &Alignment,
    source: &PointCloud,
    target: &PointCloud,
) -> Result<Vector3<f32>> {
    match policy {
        TranslationPolicy::Zero => Ok(Vector3::zeros()),
        TranslationPolicy::Centroid => {
            let (cs, ct) = source
                .centroid()
                .zip(target.centroid())
                .ok_or_else(|| Error::InvalidInput("translation from an empty cloud".into()))?;
            let mapped = alignment.with_translation(Vector3::zeros()).transform_point(&cs);
            Ok(ct.coords - mapped.coords)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hegn_core::geometry::{random_rotation, rotation_about_axis};
    use nalgebra::Point3;
    use ndarray::{Array3, IxDyn};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// `[1, C, 3]` from rows, and the same rows mapped by `s · v · R`.
    fn descriptor_pair(rows: &[[f32; 3]], r: &Matrix3<f32>, s: f32) -> (ArrayD<f32>, ArrayD<f32>) {
        let c = rows.len();
        let fx = Array3::from_shape_fn((1, c, 3), |(_, i, d)| rows[i][d]);
        let fy = Array3::from_shape_fn((1, c, 3), |(_, i, e)| {
            s * (0..3).map(|d| rows[i][d] * r[(d, e)]).sum::<f32>()
        });
        (fx.into_dyn(), fy.into_dyn())
    }

    #[test]
    fn test_recovers_rotation_and_scale_from_axis_frame() {
        let r0 = rotation_about_axis(&Vector3::new(0.3, -1.0, 0.5), 1.1);
        let rows = [
            [1.0, 0.0, 0.0],
            [-1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, -1.0, 0.0],
            [0.0, 0.0, 1.0],
            [0.0, 0.0, -1.0],
        ];
        let (fx, fy) = descriptor_pair(&rows, &r0, 1.5);
        let a = AlignmentSolver::new().solve(&fx, &fy).unwrap();
        assert_eq!(a.len(), 1);
        assert!((a[0].rotation - r0).abs().max() < 1e-4);
        assert!((a[0].scale - Vector3::repeat(1.5)).abs().max() < 1e-4);
        assert!((a[0].determinant() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_recovers_rotation_from_random_descriptors() {
        let mut rng = StdRng::seed_from_u64(8);
        let r0 = random_rotation(&mut rng, std::f32::consts::PI);
        let rows: Vec<[f32; 3]> = (0..16)
            .map(|_| [rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)])
            .collect();
        let (fx, fy) = descriptor_pair(&rows, &r0, 1.0);
        let a = AlignmentSolver::new().solve(&fx, &fy).unwrap();
        assert!((a[0].rotation - r0).abs().max() < 1e-3);
    }

    #[test]
    fn test_rotation_is_orthogonal_for_unrelated_inputs() {
        let mut rng = StdRng::seed_from_u64(9);
        let fx = ArrayD::from_shape_fn(IxDyn(&[4, 8, 3]), |_| rng.gen_range(-1.0f32..1.0));
        let fy = ArrayD::from_shape_fn(IxDyn(&[4, 8, 3]), |_| rng.gen_range(-1.0f32..1.0));
        for a in AlignmentSolver::new().solve(&fx, &fy).unwrap() {
            let gram = a.rotation.transpose() * a.rotation;
            assert!((gram - Matrix3::identity()).abs().max() < 1e-4);
            // reflections are not corrected; only the magnitude is fixed
            assert!((a.determinant().abs() - 1.0).abs() < 1e-4);
            assert!(a.scale.iter().all(|s| *s > 0.0));
        }
    }

    #[test]
    fn test_rejects_bad_input() {
        let solver = AlignmentSolver::new();
        let a = ArrayD::<f32>::zeros(IxDyn(&[1, 4, 3]));
        let b = ArrayD::<f32>::zeros(IxDyn(&[1, 5, 3]));
        assert!(matches!(solver.solve(&a, &b), Err(Error::DimensionMismatch(_))));
        let mut nan = a.clone();
        nan[[0, 0, 0]] = f32::NAN;
        assert!(matches!(solver.solve(&nan, &a), Err(Error::NumericalError(_))));
    }

    #[test]
    fn test_centroid_translation() {
        let source = PointCloud::new(vec![Point3::new(1.0, 0.0, 0.0), Point3::new(-1.0, 2.0, 0.0)]);
        let truth = Similarity::new(
            rotation_about_axis(&Vector3::z(), 0.4),
            Vector3::repeat(2.0),
            Vector3::new(0.5, -1.0, 3.0),
        );
        let target = source.transformed(&truth);
        let alignment = Alignment {
            rotation: truth.rotation,
            scale: truth.scale,
        };
        let t = estimate_translation(TranslationPolicy::Centroid, &alignment, &source, &target)
            .unwrap();
        assert!((t - truth.translation).norm() < 1e-5);
        let zero =
            estimate_translation(TranslationPolicy::Zero, &alignment, &source, &target).unwrap();
        assert_eq!(zero, Vector3::zeros());
    }
}
