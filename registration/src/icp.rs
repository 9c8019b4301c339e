//! Point-to-point ICP baseline
//!
//! Classical Iterative Closest Point between two clouds, estimating a rigid
//! (optionally uniformly scaled) transform in closed form at every iteration.

use hegn_core::geometry::{PointIndex, Similarity};
use hegn_core::{Error, PointCloud, Result};
use nalgebra::{Matrix3, Point3, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

const SVD_MAX_ITERATIONS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IcpOptions {
    /// Correspondences farther apart than this are ignored.
    pub max_correspondence_distance: f32,
    pub max_iterations: usize,
    /// Stop once the inlier RMSE changes by less than this.
    pub relative_rmse: f32,
    /// Estimate a uniform scale in addition to the rigid motion.
    pub with_scaling: bool,
}

impl Default for IcpOptions {
    fn default() -> Self {
        Self {
            max_correspondence_distance: 0.02,
            max_iterations: 30,
            relative_rmse: 1e-6,
            with_scaling: false,
        }
    }
}

/// ICP registration result
///
/// * `similarity` - transform mapping the source onto the target (row convention)
/// * `fitness` - fraction of source points with a correspondence
/// * `inlier_rmse` - RMSE of the correspondence distances
/// * `num_iterations` - iterations performed
#[derive(Debug, Clone)]
pub struct IcpResult {
    pub similarity: Similarity,
    pub fitness: f32,
    pub inlier_rmse: f32,
    pub num_iterations: usize,
}

/// Column-convention `(s, R, t)` with `target ≈ s R p + t`.
struct ColumnTransform {
    scale: f32,
    rotation: Matrix3<f32>,
    translation: Vector3<f32>,
}

impl ColumnTransform {
    fn into_similarity(self) -> Similarity {
        // p · Rᵀ · sI + t == (s R p)ᵀ + t
        Similarity::new(
            self.rotation.transpose(),
            Vector3::repeat(self.scale),
            self.translation,
        )
    }
}

/// Least-squares similarity between matched point sets (Umeyama), with the
/// reflection case corrected so `R` is a proper rotation.
fn estimate_transform(
    source: &[Point3<f32>],
    target: &[Point3<f32>],
    with_scaling: bool,
) -> Option<ColumnTransform> {
    let n = source.len();
    if n < 3 || n != target.len() {
        return None;
    }
    let inv_n = 1.0 / n as f32;
    let source_centroid = source.iter().map(|p| p.coords).sum::<Vector3<f32>>() * inv_n;
    let target_centroid = target.iter().map(|p| p.coords).sum::<Vector3<f32>>() * inv_n;

    let mut covariance = Matrix3::<f32>::zeros();
    let mut source_var = 0.0;
    for (s, t) in source.iter().zip(target) {
        let src = s.coords - source_centroid;
        let tgt = t.coords - target_centroid;
        covariance += tgt * src.transpose();
        source_var += src.norm_squared();
    }
    covariance *= inv_n;
    source_var *= inv_n;

    let svd = covariance.try_svd(true, true, f32::EPSILON, SVD_MAX_ITERATIONS)?;
    let u = svd.u?;
    let vt = svd.v_t?;

    let mut sign = Matrix3::identity();
    if (u * vt).determinant() < 0.0 {
        sign[(2, 2)] = -1.0;
    }
    let rotation = u * sign * vt;

    let scale = if with_scaling && source_var > 1e-12 {
        (Matrix3::from_diagonal(&svd.singular_values) * sign).trace() / source_var
    } else {
        1.0
    };
    let translation = target_centroid - rotation * source_centroid * scale;

    Some(ColumnTransform {
        scale,
        rotation,
        translation,
    })
}

/// Point-to-point ICP registration
///
/// Iteratively:
/// 1. Find nearest neighbors between transformed source and target
/// 2. Keep pairs closer than `max_correspondence_distance`
/// 3. Re-estimate the full transform from the original source points
/// 4. Repeat until the RMSE settles or `max_iterations` is reached
///
/// Stops early (keeping the current estimate) when fewer than 3
/// correspondences remain.
pub fn registration_icp_point_to_point(
    source: &PointCloud,
    target: &PointCloud,
    init: &Similarity,
    options: &IcpOptions,
) -> Result<IcpResult> {
    if source.is_empty() || target.is_empty() {
        return Err(Error::InvalidInput("ICP needs non-empty clouds".into()));
    }
    if options.max_correspondence_distance <= 0.0 {
        return Err(Error::InvalidInput(format!(
            "max correspondence distance must be positive, got {}",
            options.max_correspondence_distance
        )));
    }

    let target_nn = PointIndex::new(&target.points);
    let max_dist_sq = options.max_correspondence_distance * options.max_correspondence_distance;

    let mut similarity = *init;
    let mut fitness = 0.0;
    let mut inlier_rmse = f32::MAX;
    let mut num_iterations = 0;

    for iter in 0..options.max_iterations {
        let correspondences: Vec<(usize, usize, f32)> = source
            .points
            .par_iter()
            .enumerate()
            .filter_map(|(i, p)| {
                let moved = similarity.transform_point(p);
                target_nn
                    .nearest(&moved)
                    .filter(|&(_, d)| d <= max_dist_sq)
                    .map(|(j, d)| (i, j, d))
            })
            .collect();

        fitness = correspondences.len() as f32 / source.len() as f32;
        if correspondences.len() < 3 {
            break;
        }
        let count = correspondences.len() as f32;
        let rmse = (correspondences.iter().map(|c| c.2).sum::<f32>() / count).sqrt();

        let matched_source: Vec<Point3<f32>> =
            correspondences.iter().map(|c| source.points[c.0]).collect();
        let matched_target: Vec<Point3<f32>> =
            correspondences.iter().map(|c| target.points[c.1]).collect();
        let Some(update) =
            estimate_transform(&matched_source, &matched_target, options.with_scaling)
        else {
            break;
        };
        similarity = update.into_similarity();
        num_iterations = iter + 1;

        let settled = (inlier_rmse - rmse).abs() < options.relative_rmse;
        inlier_rmse = rmse;
        if settled {
            break;
        }
    }

    Ok(IcpResult {
        similarity,
        fitness,
        inlier_rmse,
        num_iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hegn_core::geometry::rotation_about_axis;

    fn grid() -> PointCloud {
        let mut points = Vec::new();
        for x in 0..6 {
            for y in 0..5 {
                for z in 0..4 {
                    points.push(Point3::new(
                        x as f32 * 0.2,
                        y as f32 * 0.25 + 0.1 * x as f32,
                        z as f32 * 0.3,
                    ));
                }
            }
        }
        PointCloud::new(points)
    }

    #[test]
    fn test_umeyama_recovers_similarity() {
        let source = grid();
        let truth = Similarity::new(
            rotation_about_axis(&Vector3::new(0.2, 1.0, -0.4), 0.9),
            Vector3::repeat(1.7),
            Vector3::new(0.3, -0.2, 1.0),
        );
        let target = source.transformed(&truth);
        let estimate = estimate_transform(&source.points, &target.points, true)
            .unwrap()
            .into_similarity();
        assert!((estimate.rotation - truth.rotation).abs().max() < 1e-4);
        assert!((estimate.scale - truth.scale).abs().max() < 1e-4);
        assert!((estimate.translation - truth.translation).norm() < 1e-4);
    }

    #[test]
    fn test_icp_recovers_small_rigid_motion() {
        let source = grid();
        let truth = Similarity::rigid(
            rotation_about_axis(&Vector3::z(), 0.05),
            Vector3::new(0.02, -0.01, 0.015),
        );
        let target = source.transformed(&truth);
        let options = IcpOptions {
            max_correspondence_distance: 0.1,
            max_iterations: 50,
            ..IcpOptions::default()
        };
        let init = Similarity::identity();
        let result = registration_icp_point_to_point(&source, &target, &init, &options).unwrap();
        assert!(result.fitness > 0.99, "fitness {}", result.fitness);
        assert!(result.inlier_rmse < 1e-3, "rmse {}", result.inlier_rmse);
        assert!((result.similarity.rotation - truth.rotation).abs().max() < 1e-3);
    }

    #[test]
    fn test_icp_identical_clouds() {
        let cloud = grid();
        let (init, options) = (Similarity::identity(), IcpOptions::default());
        let result = registration_icp_point_to_point(&cloud, &cloud, &init, &options).unwrap();
        assert_eq!(result.fitness, 1.0);
        assert!(result.inlier_rmse < 1e-6);
        assert!((result.similarity.rotation - Matrix3::identity()).abs().max() < 1e-5);
    }

    #[test]
    fn test_icp_without_correspondences_keeps_init() {
        let source = grid();
        let shift = Similarity::rigid(Matrix3::identity(), Vector3::repeat(50.0));
        let far = source.transformed(&shift);
        let (init, options) = (Similarity::identity(), IcpOptions::default());
        let result = registration_icp_point_to_point(&source, &far, &init, &options).unwrap();
        assert_eq!(result.fitness, 0.0);
        assert_eq!(result.num_iterations, 0);
        assert_eq!(result.similarity, Similarity::identity());
        assert!(registration_icp_point_to_point(
            &PointCloud::new(vec![]),
            &far,
            &Similarity::identity(),
            &IcpOptions::default()
        )
        .is_err());
    }
}
