//! Similarity transforms, rotations and nearest-neighbor distances.
//!
//! Points are row vectors: a similarity `(R, S, t)` maps `p` to `p · R · S + t`
//! with `S` diagonal.

use crate::{Error, Result};
use nalgebra::{Matrix3, Point3, Rotation3, Unit, Vector3};
use ndarray::{ArrayView2, ArrayView3, Axis};
use rand::Rng;
use rayon::prelude::*;
use rstar::{PointDistance, RTree, RTreeObject, AABB};

/// Rotation, per-axis scale and translation (9 degrees of freedom).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub rotation: Matrix3<f32>,
    pub scale: Vector3<f32>,
    pub translation: Vector3<f32>,
}

impl Default for Similarity {
    fn default() -> Self {
        Self::identity()
    }
}

impl Similarity {
    pub fn identity() -> Self {
        Self {
            rotation: Matrix3::identity(),
            scale: Vector3::repeat(1.0),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: Matrix3<f32>, scale: Vector3<f32>, translation: Vector3<f32>) -> Self {
        Self {
            rotation,
            scale,
            translation,
        }
    }

    pub fn rigid(rotation: Matrix3<f32>, translation: Vector3<f32>) -> Self {
        Self::new(rotation, Vector3::repeat(1.0), translation)
    }

    pub fn scale_matrix(&self) -> Matrix3<f32> {
        Matrix3::from_diagonal(&self.scale)
    }

    /// The linear part `R · S` acting on row vectors.
    pub fn linear(&self) -> Matrix3<f32> {
        self.rotation * self.scale_matrix()
    }

    pub fn transform_point(&self, point: &Point3<f32>) -> Point3<f32> {
        let row = point.coords.transpose() * self.linear();
        Point3::from(row.transpose() + self.translation)
    }

    pub fn transform_points(&self, points: &[Point3<f32>]) -> Vec<Point3<f32>> {
        points.iter().map(|p| self.transform_point(p)).collect()
    }
}

/// Rotation by `angle` radians about `axis`.
///
/// Returned as the usual column-vector matrix; applied to row vectors as
/// `p · R` it turns points by `-angle`.
pub fn rotation_about_axis(axis: &Vector3<f32>, angle: f32) -> Matrix3<f32> {
    Rotation3::from_axis_angle(&Unit::new_normalize(*axis), angle).into_inner()
}

/// Random rotation with a uniformly drawn axis and an angle in `[0, max_angle]`.
pub fn random_rotation<R: Rng + ?Sized>(rng: &mut R, max_angle: f32) -> Matrix3<f32> {
    let axis = loop {
        let v = Vector3::new(
            rng.gen_range(-1.0f32..1.0),
            rng.gen_range(-1.0f32..1.0),
            rng.gen_range(-1.0f32..1.0),
        );
        let n = v.norm();
        if n > 1e-3 && n <= 1.0 {
            break v;
        }
    };
    let angle = if max_angle > 0.0 {
        rng.gen_range(0.0..=max_angle)
    } else {
        0.0
    };
    rotation_about_axis(&axis, angle)
}

// Indexed point for the R-tree.
struct IndexedPoint(usize, Point3<f32>);

impl RTreeObject for IndexedPoint {
    type Envelope = AABB<[f32; 3]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.1.x, self.1.y, self.1.z])
    }
}

impl PointDistance for IndexedPoint {
    fn distance_2(&self, point: &[f32; 3]) -> f32 {
        let dx = self.1.x - point[0];
        let dy = self.1.y - point[1];
        let dz = self.1.z - point[2];
        dx * dx + dy * dy + dz * dz
    }
}

/// Nearest neighbor index over a fixed point set, backed by an R-tree.
pub struct PointIndex {
    tree: RTree<IndexedPoint>,
    len: usize,
}

impl PointIndex {
    pub fn new(points: &[Point3<f32>]) -> Self {
        let wrappers: Vec<IndexedPoint> = points
            .iter()
            .enumerate()
            .map(|(i, p)| IndexedPoint(i, *p))
            .collect();
        Self {
            tree: RTree::bulk_load(wrappers),
            len: points.len(),
        }
    }

    /// Index the rows of an `[N, 3]` array.
    pub fn from_rows(points: ArrayView2<'_, f32>) -> Self {
        let points: Vec<Point3<f32>> = points
            .rows()
            .into_iter()
            .map(|r| Point3::new(r[0], r[1], r[2]))
            .collect();
        Self::new(&points)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Nearest point to `query` as `(index, squared distance)`.
    pub fn nearest(&self, query: &Point3<f32>) -> Option<(usize, f32)> {
        let q = [query.x, query.y, query.z];
        self.tree
            .nearest_neighbor(&q)
            .map(|p| (p.0, p.distance_2(&q)))
    }
}

/// Mean squared distance from each point of `a` to its nearest neighbor in `b`.
fn directed_chamfer(a: ArrayView2<'_, f32>, b: &PointIndex) -> f32 {
    let n = a.nrows();
    let total: f32 = (0..n)
        .into_par_iter()
        .map(|i| {
            let r = a.row(i);
            b.nearest(&Point3::new(r[0], r[1], r[2]))
                .map_or(0.0, |(_, d)| d)
        })
        .sum();
    total / n as f32
}

/// Symmetric chamfer distance between two `[B, N, 3]` batches.
///
/// Per element: mean nearest-neighbor squared distance `x -> y` plus the mean
/// `y -> x`; the result is averaged over the batch.
pub fn chamfer_distance(x: ArrayView3<'_, f32>, y: ArrayView3<'_, f32>) -> Result<f32> {
    let (bx, nx, dx) = x.dim();
    let (by, ny, dy) = y.dim();
    if bx != by || dx != 3 || dy != 3 {
        return Err(Error::DimensionMismatch(format!(
            "chamfer distance expects two [B, N, 3] batches, got {:?} and {:?}",
            x.shape(),
            y.shape()
        )));
    }
    if bx == 0 || nx == 0 || ny == 0 {
        return Err(Error::InvalidInput("chamfer distance of an empty batch".into()));
    }

    let total: f32 = (0..bx)
        .map(|b| {
            let xb = x.index_axis(Axis(0), b);
            let yb = y.index_axis(Axis(0), b);
            let x_nn = PointIndex::from_rows(xb);
            let y_nn = PointIndex::from_rows(yb);
            directed_chamfer(xb, &y_nn) + directed_chamfer(yb, &x_nn)
        })
        .sum();
    Ok(total / bx as f32)
}
