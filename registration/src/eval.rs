//! Benchmark loop shared by the learned model and the ICP baseline.

use crate::hegn::alignment::{estimate_translation, TranslationPolicy};
use crate::hegn::model::Hegn;
use crate::icp::{registration_icp_point_to_point, IcpOptions};
use hegn_core::dataset::{load_batches, RegistrationBatch, RegistrationDataset};
use hegn_core::geometry::chamfer_distance;
use hegn_core::runtime::current_cpu_threads;
use hegn_core::{Error, PointCloud, Result, Similarity};
use rand::RngCore;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Anything that predicts one similarity per batch element.
pub trait Registrar: Send + Sync {
    fn name(&self) -> &str;

    fn register(&self, batch: &RegistrationBatch) -> Result<Vec<Similarity>>;
}

pub struct HegnRegistrar {
    model: Hegn,
    translation: TranslationPolicy,
}

impl HegnRegistrar {
    pub fn new(model: Hegn, translation: TranslationPolicy) -> Self {
        Self { model, translation }
    }

    pub fn model(&self) -> &Hegn {
        &self.model
    }
}

impl Registrar for HegnRegistrar {
    fn name(&self) -> &str {
        "hegn"
    }

    fn register(&self, batch: &RegistrationBatch) -> Result<Vec<Similarity>> {
        let output = self.model.forward(&batch.pair)?;
        let sources = batch.pair.x().clouds()?;
        let targets = batch.pair.y().clouds()?;
        output
            .alignments
            .iter()
            .zip(sources.iter().zip(&targets))
            .map(|(alignment, (source, target))| {
                let t = estimate_translation(self.translation, alignment, source, target)?;
                Ok(alignment.with_translation(t))
            })
            .collect()
    }
}

/// Rigid point-to-point ICP per sample; scale is fixed to one.
#[derive(Debug, Clone, Default)]
pub struct IcpRegistrar {
    pub options: IcpOptions,
}

impl IcpRegistrar {
    pub fn new(options: IcpOptions) -> Self {
        Self { options }
    }
}

impl Registrar for IcpRegistrar {
    fn name(&self) -> &str {
        "icp"
    }

    fn register(&self, batch: &RegistrationBatch) -> Result<Vec<Similarity>> {
        let sources = batch.pair.x().clouds()?;
        let targets = batch.pair.y().clouds()?;
        sources
            .par_iter()
            .zip(targets.par_iter())
            .map(|(source, target)| {
                let init = Similarity::identity();
                registration_icp_point_to_point(source, target, &init, &self.options)
                    .map(|r| r.similarity)
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalConfig {
    pub batch_size: usize,
    #[serde(default = "default_true")]
    pub compute_chamfer: bool,
}

fn default_true() -> bool {
    true
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            compute_chamfer: true,
        }
    }
}

/// Averages over batches; times are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    pub registrar: String,
    pub num_batches: usize,
    pub num_samples: usize,
    pub rmse: f32,
    pub chamfer: Option<f32>,
    pub mean_batch_time: f64,
    pub mean_sample_time: f64,
    pub max_batch_time: f64,
    pub min_batch_time: f64,
}

/// RMSE between the source mapped by the prediction and by the ground truth.
pub fn rmse(points: &PointCloud, predicted: &Similarity, truth: &Similarity) -> Result<f32> {
    if points.is_empty() {
        return Err(Error::InvalidInput("RMSE of an empty cloud".into()));
    }
    let sum: f32 = points
        .points
        .iter()
        .map(|p| (predicted.transform_point(p) - truth.transform_point(p)).norm_squared())
        .sum();
    Ok((sum / points.len() as f32).sqrt())
}

pub fn evaluate<R, D>(
    registrar: &R,
    dataset: &D,
    config: &EvalConfig,
    rng: &mut dyn RngCore,
) -> Result<EvalReport>
where
    R: Registrar + ?Sized,
    D: RegistrationDataset + ?Sized,
{
    let batches = load_batches(dataset, config.batch_size, rng)?;
    if batches.is_empty() {
        return Err(Error::InvalidInput("cannot evaluate an empty dataset".into()));
    }

    let mut rmse_sum = 0.0;
    let mut chamfer_sum = 0.0;
    let mut batch_times = Vec::with_capacity(batches.len());
    let mut num_samples = 0;

    for (i, batch) in batches.iter().enumerate() {
        let start = Instant::now();
        let predicted = registrar.register(batch)?;
        let elapsed = start.elapsed().as_secs_f64();
        if predicted.len() != batch.batch_size() {
            return Err(Error::RuntimeError(format!(
                "{} returned {} transforms for a batch of {}",
                registrar.name(),
                predicted.len(),
                batch.batch_size()
            )));
        }

        let sources = batch.pair.x().clouds()?;
        let batch_rmse = sources
            .iter()
            .zip(predicted.iter().zip(&batch.similarities))
            .map(|(cloud, (p, t))| rmse(cloud, p, t))
            .collect::<Result<Vec<_>>>()?;
        let batch_rmse = batch_rmse.iter().sum::<f32>() / batch_rmse.len() as f32;
        rmse_sum += batch_rmse;

        if config.compute_chamfer {
            let aligned = batch.pair.x().transformed(&predicted)?;
            chamfer_sum += chamfer_distance(aligned.view(), batch.pair.y().view())?;
        }

        tracing::debug!(
            registrar = registrar.name(),
            batch = i,
            rmse = batch_rmse,
            seconds = elapsed,
            "evaluated batch"
        );
        batch_times.push(elapsed);
        num_samples += batch.batch_size();
    }

    let num_batches = batches.len();
    let total_time: f64 = batch_times.iter().sum();
    let report = EvalReport {
        registrar: registrar.name().to_string(),
        num_batches,
        num_samples,
        rmse: rmse_sum / num_batches as f32,
        chamfer: config
            .compute_chamfer
            .then(|| chamfer_sum / num_batches as f32),
        mean_batch_time: total_time / num_batches as f64,
        mean_sample_time: total_time / num_samples as f64,
        max_batch_time: batch_times.iter().copied().fold(f64::MIN, f64::max),
        min_batch_time: batch_times.iter().copied().fold(f64::MAX, f64::min),
    };

    tracing::info!(
        registrar = %report.registrar,
        rmse = report.rmse,
        chamfer = ?report.chamfer,
        mean_batch_time = report.mean_batch_time,
        mean_sample_time = report.mean_sample_time,
        threads = current_cpu_threads(),
        "evaluation finished"
    );
    Ok(report)
}
