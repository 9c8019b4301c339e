use crate::{EquivariantLayer, Mode, Result};
use hegn_core::tensor::{flatten_samples, restore_samples, EPS};
use hegn_core::Error;
use ndarray::{Array1, Array3, Array4, ArrayD, Axis, Zip};

const BN_EPS: f32 = 1e-5;
const DEFAULT_MOMENTUM: f32 = 0.1;

/// Batch normalization of vector norms.
///
/// Each vector is rescaled so that its norm becomes the batch-normalized
/// norm; directions are untouched, so the layer is rotation equivariant.
#[derive(Debug, Clone)]
pub struct VnBatchNorm {
    gamma: Array1<f32>,
    beta: Array1<f32>,
    running_mean: Array1<f32>,
    running_var: Array1<f32>,
    momentum: f32,
    mode: Mode,
}

impl VnBatchNorm {
    pub fn new(channels: usize) -> Self {
        Self {
            gamma: Array1::ones(channels),
            beta: Array1::zeros(channels),
            running_mean: Array1::zeros(channels),
            running_var: Array1::ones(channels),
            momentum: DEFAULT_MOMENTUM,
            mode: Mode::default(),
        }
    }

    pub fn channels(&self) -> usize {
        self.gamma.len()
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    pub fn set_affine(&mut self, gamma: Array1<f32>, beta: Array1<f32>) -> Result<()> {
        self.check_len(gamma.len(), "gamma")?;
        self.check_len(beta.len(), "beta")?;
        self.gamma = gamma;
        self.beta = beta;
        Ok(())
    }

    pub fn set_running_stats(&mut self, mean: Array1<f32>, var: Array1<f32>) -> Result<()> {
        self.check_len(mean.len(), "running mean")?;
        self.check_len(var.len(), "running variance")?;
        if var.iter().any(|&v| v < 0.0) {
            return Err(Error::InvalidInput("running variance must be non-negative".into()));
        }
        self.running_mean = mean;
        self.running_var = var;
        Ok(())
    }

    pub fn running_stats(&self) -> (&Array1<f32>, &Array1<f32>) {
        (&self.running_mean, &self.running_var)
    }

    /// Fold the norm statistics of `x` into the running estimates.
    pub fn track(&mut self, x: &ArrayD<f32>) -> Result<()> {
        let norms = self.norms(x)?;
        let (mean, var) = batch_stats(&norms)?;
        let m = self.momentum;
        Zip::from(&mut self.running_mean)
            .and(&mean)
            .for_each(|r, &v| *r = (1.0 - m) * *r + m * v);
        Zip::from(&mut self.running_var)
            .and(&var)
            .for_each(|r, &v| *r = (1.0 - m) * *r + m * v);
        Ok(())
    }

    fn check_len(&self, len: usize, what: &str) -> Result<()> {
        if len != self.channels() {
            return Err(Error::DimensionMismatch(format!(
                "VnBatchNorm {} has {} entries for {} channels",
                what,
                len,
                self.channels()
            )));
        }
        Ok(())
    }

    /// `|x| + EPS` as `[B, C, M]`.
    fn norms(&self, x: &ArrayD<f32>) -> Result<Array3<f32>> {
        let (shape, flat) = flatten_samples(x)?;
        shape.expect_channels(self.channels(), "VnBatchNorm")?;
        Ok(flat.map_axis(Axis(2), |v| v.dot(&v).sqrt() + EPS))
    }
}

/// Per-channel mean and biased variance over batch and samples.
///
/// A single value per channel has no spread to normalize; that is rejected
/// rather than collapsing every norm onto `beta`.
fn batch_stats(norms: &Array3<f32>) -> Result<(Array1<f32>, Array1<f32>)> {
    let (b, c, m) = norms.dim();
    if b * m < 2 {
        return Err(Error::InvalidInput(format!(
            "VnBatchNorm batch statistics need more than 1 value per channel \
             (batch {}, {} samples)",
            b, m
        )));
    }
    let mut mean = Array1::zeros(c);
    let mut var = Array1::zeros(c);
    for (ch, lane) in norms.axis_iter(Axis(1)).enumerate() {
        let n = lane.len().max(1) as f32;
        let mu = lane.sum() / n;
        mean[ch] = mu;
        var[ch] = lane.iter().map(|v| (v - mu) * (v - mu)).sum::<f32>() / n;
    }
    Ok((mean, var))
}

impl EquivariantLayer for VnBatchNorm {
    fn forward(&self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let norms = self.norms(x)?;
        let (shape, flat) = flatten_samples(x)?;

        let (mean, var) = match self.mode {
            Mode::Train => batch_stats(&norms)?,
            Mode::Eval => (self.running_mean.clone(), self.running_var.clone()),
        };

        let (b, c, _, m) = flat.dim();
        let mut out = Array4::<f32>::zeros((b, c, 3, m));
        for ((bi, ch, mi), &norm) in norms.indexed_iter() {
            let normalized = (norm - mean[ch]) / (var[ch] + BN_EPS).sqrt();
            let target = self.gamma[ch] * normalized + self.beta[ch];
            let ratio = target / norm;
            for k in 0..3 {
                out[[bi, ch, k, mi]] = flat[[bi, ch, k, mi]] * ratio;
            }
        }

        restore_samples(out, &shape)
    }

    fn name(&self) -> &'static str {
        "vn_batchnorm"
    }

    fn num_parameters(&self) -> usize {
        self.gamma.len() + self.beta.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{any_rotation, equivariance_error, random_features};
    use hegn_core::tensor::vector_norms;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_train_mode_standardizes_norms() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut bn = VnBatchNorm::new(4);
        bn.set_mode(Mode::Train);
        let x = random_features(&mut rng, &[2, 4, 3, 50]).mapv(|v| 3.0 * v + 0.5);
        let y = bn.forward(&x).unwrap();
        let norms = vector_norms(&y);
        // gamma = 1, beta = 0: signed target norms average to zero, so the
        // resulting magnitudes average to the mean absolute z-score (< 1)
        let mean = norms.mean().unwrap();
        assert!(mean > 0.3 && mean < 1.0, "mean {}", mean);
    }

    #[test]
    fn test_eval_mode_uses_running_stats() {
        let mut bn = VnBatchNorm::new(1);
        bn.set_running_stats(Array1::from_elem(1, 1.0), Array1::from_elem(1, 4.0))
            .unwrap();
        let mut x = ArrayD::<f32>::zeros(ndarray::IxDyn(&[1, 1, 3, 1]));
        x[[0, 0, 0, 0]] = 3.0;
        let y = bn.forward(&x).unwrap();
        // (3 - 1) / 2 = 1
        assert!((y[[0, 0, 0, 0]] - 1.0).abs() < 1e-4);
        assert_eq!(y[[0, 0, 1, 0]], 0.0);
    }

    #[test]
    fn test_is_equivariant_in_both_modes() {
        let mut rng = StdRng::seed_from_u64(7);
        let x = random_features(&mut rng, &[3, 6, 3, 10, 4]);
        let r = any_rotation(&mut rng);
        let mut bn = VnBatchNorm::new(6);
        for mode in [Mode::Eval, Mode::Train] {
            bn.set_mode(mode);
            let err = equivariance_error(&x, &r, |t| bn.forward(t).unwrap());
            assert!(err < 1e-4, "{:?}: equivariance error {}", mode, err);
        }
    }

    #[test]
    fn test_train_mode_rejects_single_value_per_channel() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut bn = VnBatchNorm::new(4);
        bn.set_mode(Mode::Train);
        let pooled = random_features(&mut rng, &[1, 4, 3]);
        assert!(matches!(bn.forward(&pooled), Err(Error::InvalidInput(_))));
        assert!(bn.track(&pooled).is_err());

        // two batch elements, or running statistics, are fine
        assert!(bn.forward(&random_features(&mut rng, &[2, 4, 3])).is_ok());
        bn.set_mode(Mode::Eval);
        assert!(bn.forward(&pooled).is_ok());
    }

    #[test]
    fn test_track_moves_running_mean() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut bn = VnBatchNorm::new(2);
        let x = random_features(&mut rng, &[4, 2, 3, 8]).mapv(|v| v * 10.0);
        bn.track(&x).unwrap();
        let (mean, _) = bn.running_stats();
        assert!(mean.iter().all(|&m| m > 0.0));
        assert!(bn.set_affine(Array1::ones(3), Array1::zeros(2)).is_err());
    }
}
