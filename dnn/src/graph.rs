//! Dynamic k-nearest-neighbor graphs in feature space.

use crate::Result;
use hegn_core::tensor::FeatureShape;
use hegn_core::Error;
use ndarray::{stack, Array, Array2, ArrayD, ArrayView4, Axis, Ix4};
use rayon::prelude::*;
use std::cmp::Ordering;

/// Neighborhood size actually used for `n` samples.
pub fn effective_k(n: usize, k: usize) -> usize {
    k.min(n)
}

fn check_points(x: &ArrayD<f32>, k: usize) -> Result<FeatureShape> {
    let shape = FeatureShape::of(x.shape())?;
    if shape.samples.len() != 1 {
        return Err(Error::DimensionMismatch(format!(
            "graph features expect [B, C, 3, N], got {:?}",
            x.shape()
        )));
    }
    if k == 0 {
        return Err(Error::InvalidInput("neighbor count k must be >= 1".into()));
    }
    if shape.samples[0] == 0 {
        return Err(Error::InvalidInput("cannot build a graph over zero points".into()));
    }
    Ok(shape)
}

/// `[N, C * 3]` rows of one batch element.
fn point_rows(x: &ArrayView4<'_, f32>, b: usize) -> Array2<f32> {
    let (_, c, _, n) = x.dim();
    Array2::from_shape_fn((n, c * 3), |(i, f)| x[[b, f / 3, f % 3, i]])
}

fn nearest(rows: &Array2<f32>, i: usize, k: usize) -> Vec<usize> {
    let center = rows.row(i);
    let mut dist: Vec<(f32, usize)> = rows
        .outer_iter()
        .enumerate()
        .map(|(j, row)| {
            let d: f32 = row
                .iter()
                .zip(center.iter())
                .map(|(a, b)| (a - b) * (a - b))
                .sum();
            (d, j)
        })
        .collect();

    let by_distance = |a: &(f32, usize), b: &(f32, usize)| -> Ordering {
        a.0.total_cmp(&b.0).then(a.1.cmp(&b.1))
    };
    if k < dist.len() {
        dist.select_nth_unstable_by(k - 1, by_distance);
        dist.truncate(k);
    }
    dist.sort_unstable_by(by_distance);
    dist.into_iter().map(|(_, j)| j).collect()
}

/// Indices of the `min(k, N)` nearest samples of every sample, itself
/// included, ordered by distance (ties by index). Output is `[B][N][k]`.
pub fn knn(x: &ArrayD<f32>, k: usize) -> Result<Vec<Vec<Vec<usize>>>> {
    let shape = check_points(x, k)?;
    let n = shape.samples[0];
    let k = effective_k(n, k);
    let x4 = x.view().into_dimensionality::<Ix4>()?;

    Ok((0..shape.batch)
        .into_par_iter()
        .map(|b| {
            let rows = point_rows(&x4, b);
            (0..n)
                .into_par_iter()
                .map(|i| nearest(&rows, i, k))
                .collect::<Vec<_>>()
        })
        .collect())
}

/// Edge features `[B, 2C, 3, N, k]`: `neighbor - center` then `center`.
pub fn graph_feature(x: &ArrayD<f32>, k: usize) -> Result<ArrayD<f32>> {
    let neighbors = knn(x, k)?;
    let x4 = x.view().into_dimensionality::<Ix4>()?;
    let (_, c, _, n) = x4.dim();
    let k = effective_k(n, k);

    let per_batch: Vec<ArrayD<f32>> = neighbors
        .par_iter()
        .enumerate()
        .map(|(b, idx)| {
            let xb = x4.index_axis(Axis(0), b);
            Array::from_shape_fn((2 * c, 3, n, k), |(ch, d, i, j)| {
                if ch < c {
                    xb[[ch, d, idx[i][j]]] - xb[[ch, d, i]]
                } else {
                    xb[[ch - c, d, i]]
                }
            })
            .into_dyn()
        })
        .collect();

    let views: Vec<_> = per_batch.iter().map(|a| a.view()).collect();
    Ok(stack(Axis(0), &views)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{any_rotation, equivariance_error, random_features};
    use ndarray::IxDyn;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn line(n: usize) -> ArrayD<f32> {
        // one channel, samples on the x axis at 0, 1, 2, ...
        ArrayD::from_shape_fn(IxDyn(&[1, 1, 3, n]), |d| if d[2] == 0 { d[3] as f32 } else { 0.0 })
    }

    #[test]
    fn test_knn_includes_self_first() {
        let idx = knn(&line(6), 3).unwrap();
        assert_eq!(idx[0][0], vec![0, 1, 2]);
        // equidistant neighbors 1 and 3 of point 2: lower index first
        assert_eq!(idx[0][2], vec![2, 1, 3]);
        assert_eq!(idx[0][5], vec![5, 4, 3]);
    }

    #[test]
    fn test_graph_feature_shape() {
        let mut rng = StdRng::seed_from_u64(0);
        let x = random_features(&mut rng, &[2, 4, 3, 40]);
        let g = graph_feature(&x, 16).unwrap();
        assert_eq!(g.shape(), &[2, 8, 3, 40, 16]);
    }

    #[test]
    fn test_graph_feature_layout() {
        let g = graph_feature(&line(4), 2).unwrap();
        // point 1: neighbors [1, 0]
        assert_eq!(g[[0, 0, 0, 1, 0]], 0.0);
        assert_eq!(g[[0, 0, 0, 1, 1]], -1.0);
        assert_eq!(g[[0, 1, 0, 1, 1]], 1.0);
    }

    #[test]
    fn test_k_is_clamped_to_points() {
        let g = graph_feature(&line(3), 16).unwrap();
        assert_eq!(g.shape(), &[1, 2, 3, 3, 3]);
        assert_eq!(effective_k(3, 16), 3);
        assert!(knn(&line(3), 0).is_err());
        assert!(knn(&ArrayD::zeros(IxDyn(&[1, 1, 3, 0])), 4).is_err());
    }

    #[test]
    fn test_graph_feature_is_equivariant() {
        let mut rng = StdRng::seed_from_u64(12);
        let x = random_features(&mut rng, &[2, 3, 3, 20]);
        let r = any_rotation(&mut rng);
        let err = equivariance_error(&x, &r, |t| graph_feature(t, 5).unwrap());
        assert!(err < 1e-4, "equivariance error {}", err);
    }
}
