//! Sample augmentation: resampling, random similarity transforms, jitter.
//!
//! Every transform consumes a [`RegistrationSample`] and returns a new one,
//! keeping `points`, `points_ts` and the ground-truth similarity consistent.

use crate::dataset::RegistrationSample;
use crate::geometry::{random_rotation, Similarity};
use crate::point_cloud::PointCloud;
use crate::{Error, Result};
use nalgebra::Vector3;
use rand::seq::index;
use rand::{Rng, RngCore};
use rand_distr::{Distribution, Normal};

pub trait PointCloudTransform {
    fn apply(
        &self,
        sample: RegistrationSample,
        rng: &mut dyn RngCore,
    ) -> Result<RegistrationSample>;
}

/// Runs transforms in insertion order.
#[derive(Default)]
pub struct Compose {
    transforms: Vec<Box<dyn PointCloudTransform + Send + Sync>>,
}

impl Compose {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then<T>(mut self, transform: T) -> Self
    where
        T: PointCloudTransform + Send + Sync + 'static,
    {
        self.transforms.push(Box::new(transform));
        self
    }
}

impl PointCloudTransform for Compose {
    fn apply(
        &self,
        sample: RegistrationSample,
        rng: &mut dyn RngCore,
    ) -> Result<RegistrationSample> {
        self.transforms
            .iter()
            .try_fold(sample, |s, t| t.apply(s, rng))
    }
}

/// Resample both clouds to a fixed size with shared indices.
///
/// Draws without replacement when the cloud is large enough, otherwise keeps
/// every point and pads with random repeats.
#[derive(Debug, Clone, Copy)]
pub struct Resampler {
    pub num_points: usize,
}

impl Resampler {
    pub fn new(num_points: usize) -> Self {
        Self { num_points }
    }
}

impl PointCloudTransform for Resampler {
    fn apply(
        &self,
        sample: RegistrationSample,
        rng: &mut dyn RngCore,
    ) -> Result<RegistrationSample> {
        let n = sample.points.len();
        if n == 0 || self.num_points == 0 {
            return Err(Error::InvalidInput(format!(
                "cannot resample {} points to {}",
                n, self.num_points
            )));
        }
        if sample.points_ts.len() != n {
            return Err(Error::DimensionMismatch(format!(
                "source has {} points but target has {}",
                n,
                sample.points_ts.len()
            )));
        }

        let indices: Vec<usize> = if self.num_points <= n {
            index::sample(rng, n, self.num_points).into_vec()
        } else {
            let mut all: Vec<usize> = (0..n).collect();
            all.extend((n..self.num_points).map(|_| rng.gen_range(0..n)));
            all
        };

        let pick = |c: &PointCloud| PointCloud::new(indices.iter().map(|&i| c.points[i]).collect());
        Ok(RegistrationSample {
            points: pick(&sample.points),
            points_ts: pick(&sample.points_ts),
            similarity: sample.similarity,
        })
    }
}

/// Random rotation, per-axis scale and translation applied to the source.
///
/// `rot_mag` is the maximum rotation angle in degrees, `trans_mag` bounds each
/// translation component, `scale_range` (when set) bounds each scale factor.
/// Any transform already recorded on the sample is replaced.
#[derive(Debug, Clone, Copy)]
pub struct RandomSimilarity {
    pub rot_mag: f32,
    pub trans_mag: f32,
    pub scale_range: Option<(f32, f32)>,
}

impl RandomSimilarity {
    pub fn new(rot_mag: f32, trans_mag: f32, scale_range: Option<(f32, f32)>) -> Self {
        Self {
            rot_mag,
            trans_mag,
            scale_range,
        }
    }

    pub fn sample_similarity(&self, rng: &mut dyn RngCore) -> Result<Similarity> {
        let rotation = random_rotation(rng, self.rot_mag.to_radians());
        let scale = match self.scale_range {
            Some((lo, hi)) if lo > 0.0 && lo <= hi => {
                Vector3::from_fn(|_, _| rng.gen_range(lo..=hi))
            }
            Some((lo, hi)) => {
                return Err(Error::InvalidInput(format!(
                    "invalid scale range ({}, {})",
                    lo, hi
                )))
            }
            None => Vector3::repeat(1.0),
        };
        let translation = if self.trans_mag > 0.0 {
            Vector3::from_fn(|_, _| rng.gen_range(-self.trans_mag..=self.trans_mag))
        } else {
            Vector3::zeros()
        };
        Ok(Similarity::new(rotation, scale, translation))
    }
}

impl PointCloudTransform for RandomSimilarity {
    fn apply(
        &self,
        sample: RegistrationSample,
        rng: &mut dyn RngCore,
    ) -> Result<RegistrationSample> {
        let similarity = self.sample_similarity(rng)?;
        Ok(RegistrationSample {
            points_ts: sample.points.transformed(&similarity),
            points: sample.points,
            similarity,
        })
    }
}

/// Clipped Gaussian noise on the target cloud.
#[derive(Debug, Clone, Copy)]
pub struct RandomJitter {
    pub scale: f32,
    pub clip: f32,
}

impl RandomJitter {
    pub fn new(scale: f32, clip: f32) -> Self {
        Self { scale, clip }
    }
}

impl PointCloudTransform for RandomJitter {
    fn apply(
        &self,
        sample: RegistrationSample,
        rng: &mut dyn RngCore,
    ) -> Result<RegistrationSample> {
        let normal = Normal::new(0.0f32, self.scale)
            .map_err(|e| Error::InvalidInput(format!("jitter scale {}: {}", self.scale, e)))?;
        let points = sample
            .points_ts
            .points
            .iter()
            .map(|p| {
                let noise =
                    Vector3::from_fn(|_, _| normal.sample(rng).clamp(-self.clip, self.clip));
                *p + noise
            })
            .collect();
        Ok(RegistrationSample {
            points_ts: PointCloud::new(points),
            ..sample
        })
    }
}
