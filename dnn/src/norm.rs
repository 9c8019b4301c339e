use crate::{EquivariantLayer, Result};
use hegn_core::tensor::{flatten_samples, restore_samples, EPS};
use ndarray::{Array4, ArrayD, Axis};

/// Channel-wise equivariant normalization.
///
/// Every vector becomes its unit direction scaled by its norm relative to
/// the norm profile of its sample across channels:
/// `x / (|x| + EPS) * |x| / (|(|x_1|, ..., |x_C|)| + EPS)`.
pub fn channel_equi_normalize(x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    let (shape, flat) = flatten_samples(x)?;
    let norms = flat.map_axis(Axis(2), |v| v.dot(&v).sqrt());
    let profile = norms.map_axis(Axis(1), |c| c.dot(&c).sqrt());

    let (b, c, _, m) = flat.dim();
    let out = Array4::from_shape_fn((b, c, 3, m), |(bi, ci, k, mi)| {
        let n = norms[[bi, ci, mi]];
        flat[[bi, ci, k, mi]] / (n + EPS) * n / (profile[[bi, mi]] + EPS)
    });
    restore_samples(out, &shape)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelEquiNorm;

impl EquivariantLayer for ChannelEquiNorm {
    fn forward(&self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        channel_equi_normalize(x)
    }

    fn name(&self) -> &'static str {
        "channel_equi_norm"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{any_rotation, equivariance_error, random_features};
    use hegn_core::tensor::vector_norms;
    use ndarray::IxDyn;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_norm_profile_is_unit() {
        let mut rng = StdRng::seed_from_u64(0);
        let x = random_features(&mut rng, &[2, 8, 3, 5]);
        let y = channel_equi_normalize(&x).unwrap();
        let norms = vector_norms(&y);
        for b in 0..2 {
            for m in 0..5 {
                let profile: f32 = (0..8).map(|c| norms[[b, c, m]].powi(2)).sum::<f32>().sqrt();
                assert!((profile - 1.0).abs() < 1e-3, "profile {}", profile);
            }
        }
    }

    #[test]
    fn test_zero_features_stay_finite() {
        let x = ArrayD::<f32>::zeros(IxDyn(&[1, 4, 3, 2]));
        let y = ChannelEquiNorm.forward(&x).unwrap();
        assert!(y.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_is_equivariant() {
        let mut rng = StdRng::seed_from_u64(3);
        let x = random_features(&mut rng, &[2, 6, 3, 9, 3]);
        let r = any_rotation(&mut rng);
        let err = equivariance_error(&x, &r, |t| channel_equi_normalize(t).unwrap());
        assert!(err < 1e-4, "equivariance error {}", err);
    }
}
