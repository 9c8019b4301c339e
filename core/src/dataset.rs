//! Dataset contract consumed by training and evaluation.
//!
//! A sample is a source cloud, its transformed copy and the ground-truth
//! similarity linking them. Loading from disk is left to implementors of
//! [`RegistrationDataset`]; [`InMemoryDataset`] serves pre-loaded clouds.

use crate::geometry::Similarity;
use crate::paired::PairedBatch;
use crate::point_cloud::{PointBatch, PointCloud};
use crate::transforms::PointCloudTransform;
use crate::{Error, Result};
use ndarray::{Array2, Array3};
use rand::RngCore;

#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationSample {
    /// Source points.
    pub points: PointCloud,
    /// Source points after `similarity` (and any noise).
    pub points_ts: PointCloud,
    /// Ground truth mapping `points` onto `points_ts`.
    pub similarity: Similarity,
}

impl RegistrationSample {
    /// Untransformed sample: target equals source.
    pub fn identity(points: PointCloud) -> Self {
        Self {
            points_ts: points.clone(),
            points,
            similarity: Similarity::identity(),
        }
    }
}

pub trait RegistrationDataset {
    fn len(&self) -> usize;

    fn get(&self, index: usize, rng: &mut dyn RngCore) -> Result<RegistrationSample>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct InMemoryDataset {
    clouds: Vec<PointCloud>,
    transform: Option<Box<dyn PointCloudTransform + Send + Sync>>,
}

impl InMemoryDataset {
    pub fn new(clouds: Vec<PointCloud>) -> Self {
        Self {
            clouds,
            transform: None,
        }
    }

    pub fn with_transform<T>(mut self, transform: T) -> Self
    where
        T: PointCloudTransform + Send + Sync + 'static,
    {
        self.transform = Some(Box::new(transform));
        self
    }
}

impl RegistrationDataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.clouds.len()
    }

    fn get(&self, index: usize, rng: &mut dyn RngCore) -> Result<RegistrationSample> {
        let cloud = self.clouds.get(index).ok_or_else(|| {
            Error::InvalidInput(format!(
                "sample {} out of range for dataset of {}",
                index,
                self.clouds.len()
            ))
        })?;
        let sample = RegistrationSample::identity(cloud.clone());
        match &self.transform {
            Some(t) => t.apply(sample, rng),
            None => Ok(sample),
        }
    }
}

/// Collated samples with ground truth as `[B, 3, 3]` / `[B, 3]` arrays.
#[derive(Debug, Clone)]
pub struct RegistrationBatch {
    pub pair: PairedBatch,
    pub rotation: Array3<f32>,
    pub scale: Array3<f32>,
    pub translation: Array2<f32>,
    pub similarities: Vec<Similarity>,
}

impl RegistrationBatch {
    pub fn collate(samples: &[RegistrationSample]) -> Result<Self> {
        let sources: Vec<PointCloud> = samples.iter().map(|s| s.points.clone()).collect();
        let targets: Vec<PointCloud> = samples.iter().map(|s| s.points_ts.clone()).collect();
        let pair = PairedBatch::new(
            PointBatch::from_clouds(&sources)?,
            PointBatch::from_clouds(&targets)?,
        )?;
        let similarities: Vec<Similarity> = samples.iter().map(|s| s.similarity).collect();
        let b = similarities.len();
        let rotation =
            Array3::from_shape_fn((b, 3, 3), |(i, r, c)| similarities[i].rotation[(r, c)]);
        let scale = Array3::from_shape_fn((b, 3, 3), |(i, r, c)| {
            if r == c {
                similarities[i].scale[r]
            } else {
                0.0
            }
        });
        let translation = Array2::from_shape_fn((b, 3), |(i, d)| similarities[i].translation[d]);
        Ok(Self {
            pair,
            rotation,
            scale,
            translation,
            similarities,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.similarities.len()
    }
}

/// Draw consecutive batches of `batch_size` samples; the last batch may be short.
pub fn load_batches<D>(
    dataset: &D,
    batch_size: usize,
    rng: &mut dyn RngCore,
) -> Result<Vec<RegistrationBatch>>
where
    D: RegistrationDataset + ?Sized,
{
    if batch_size == 0 {
        return Err(Error::InvalidInput("batch size must be >= 1".into()));
    }
    let mut batches = Vec::with_capacity(dataset.len().div_ceil(batch_size));
    let mut start = 0;
    while start < dataset.len() {
        let end = (start + batch_size).min(dataset.len());
        let samples = (start..end)
            .map(|i| dataset.get(i, rng))
            .collect::<Result<Vec<_>>>()?;
        batches.push(RegistrationBatch::collate(&samples)?);
        start = end;
    }
    Ok(batches)
}
