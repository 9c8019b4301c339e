use crate::geometry::Similarity;
use crate::{Error, Result};
use nalgebra::Point3;
use ndarray::{Array2, Array3, ArrayD, ArrayView2, ArrayView3, Axis};

/// A single unordered point set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointCloud {
    pub points: Vec<Point3<f32>>,
}

impl PointCloud {
    pub fn new(points: Vec<Point3<f32>>) -> Self {
        Self { points }
    }

    /// Build from an `[N, 3]` array.
    pub fn from_array(points: ArrayView2<'_, f32>) -> Result<Self> {
        if points.ncols() != 3 {
            return Err(Error::DimensionMismatch(format!(
                "point array must be [N, 3], got {:?}",
                points.shape()
            )));
        }
        Ok(Self::new(
            points
                .rows()
                .into_iter()
                .map(|r| Point3::new(r[0], r[1], r[2]))
                .collect(),
        ))
    }

    pub fn to_array(&self) -> Array2<f32> {
        Array2::from_shape_fn((self.points.len(), 3), |(i, d)| self.points[i][d])
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn centroid(&self) -> Option<Point3<f32>> {
        if self.points.is_empty() {
            return None;
        }
        let sum = self
            .points
            .iter()
            .fold(nalgebra::Vector3::zeros(), |acc, p| acc + p.coords);
        Some(Point3::from(sum / self.points.len() as f32))
    }

    pub fn transformed(&self, similarity: &Similarity) -> Self {
        Self::new(similarity.transform_points(&self.points))
    }
}

/// A batch of equally sized point sets, `[B, N, 3]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PointBatch {
    points: Array3<f32>,
}

impl PointBatch {
    pub fn new(points: Array3<f32>) -> Result<Self> {
        let (b, n, d) = points.dim();
        if d != 3 {
            return Err(Error::DimensionMismatch(format!(
                "point batch must be [B, N, 3], got {:?}",
                points.shape()
            )));
        }
        if b == 0 || n == 0 {
            return Err(Error::InvalidInput(format!(
                "point batch must be non-empty, got {:?}",
                points.shape()
            )));
        }
        Ok(Self { points })
    }

    pub fn from_clouds(clouds: &[PointCloud]) -> Result<Self> {
        let n = clouds
            .first()
            .map(PointCloud::len)
            .ok_or_else(|| Error::InvalidInput("cannot batch zero point clouds".into()))?;
        if let Some((i, c)) = clouds.iter().enumerate().find(|(_, c)| c.len() != n) {
            return Err(Error::DimensionMismatch(format!(
                "point cloud {} has {} points, expected {}",
                i,
                c.len(),
                n
            )));
        }
        let points =
            Array3::from_shape_fn((clouds.len(), n, 3), |(b, i, d)| clouds[b].points[i][d]);
        Self::new(points)
    }

    pub fn batch_size(&self) -> usize {
        self.points.dim().0
    }

    pub fn num_points(&self) -> usize {
        self.points.dim().1
    }

    pub fn view(&self) -> ArrayView3<'_, f32> {
        self.points.view()
    }

    pub fn into_inner(self) -> Array3<f32> {
        self.points
    }

    pub fn cloud(&self, index: usize) -> Result<PointCloud> {
        if index >= self.batch_size() {
            return Err(Error::InvalidInput(format!(
                "batch index {} out of range for batch of {}",
                index,
                self.batch_size()
            )));
        }
        PointCloud::from_array(self.points.index_axis(Axis(0), index))
    }

    pub fn clouds(&self) -> Result<Vec<PointCloud>> {
        (0..self.batch_size()).map(|b| self.cloud(b)).collect()
    }

    /// Lift to a single-channel feature tensor `[B, 1, 3, N]`.
    pub fn to_features(&self) -> ArrayD<f32> {
        self.points
            .view()
            .permuted_axes([0, 2, 1])
            .insert_axis(Axis(1))
            .as_standard_layout()
            .into_owned()
            .into_dyn()
    }

    /// Apply one similarity per batch element.
    pub fn transformed(&self, similarities: &[Similarity]) -> Result<Self> {
        if similarities.len() != self.batch_size() {
            return Err(Error::DimensionMismatch(format!(
                "{} transforms for batch of {}",
                similarities.len(),
                self.batch_size()
            )));
        }
        let clouds = self
            .clouds()?
            .iter()
            .zip(similarities)
            .map(|(c, s)| c.transformed(s))
            .collect::<Vec<_>>();
        Self::from_clouds(&clouds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_rejects_ragged_clouds() {
        let a = PointCloud::new(vec![Point3::origin(); 4]);
        let b = PointCloud::new(vec![Point3::origin(); 3]);
        let err = PointBatch::from_clouds(&[a, b]).unwrap_err();
        assert!(err.to_string().contains("has 3 points"));
    }

    #[test]
    fn test_to_features_layout() {
        let cloud = PointCloud::new(vec![Point3::new(1.0, 2.0, 3.0), Point3::new(4.0, 5.0, 6.0)]);
        let batch = PointBatch::from_clouds(&[cloud]).unwrap();
        let f = batch.to_features();
        assert_eq!(f.shape(), &[1, 1, 3, 2]);
        assert_eq!(f[[0, 0, 0, 1]], 4.0);
        assert_eq!(f[[0, 0, 2, 0]], 3.0);
    }

    #[test]
    fn test_centroid() {
        let cloud = PointCloud::new(vec![Point3::new(0.0, 0.0, 0.0), Point3::new(2.0, 4.0, -2.0)]);
        let c = cloud.centroid().unwrap();
        assert!((c - Point3::new(1.0, 2.0, -1.0)).norm() < 1e-6);
        assert!(PointCloud::default().centroid().is_none());
    }
}
