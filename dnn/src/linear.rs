use crate::batchnorm::VnBatchNorm;
use crate::{uniform_weight, EquivariantLayer, Mode, Result, DEFAULT_NEGATIVE_SLOPE};
use hegn_core::tensor::{flatten_samples, restore_samples, EPS};
use hegn_core::Error;
use ndarray::linalg::general_mat_mul;
use ndarray::{Array2, Array3, Array4, ArrayD, Axis, Zip};
use rand::Rng;

/// Bias-free channel mixing: `y[c_out] = Σ W[c_out, c_in] x[c_in]` per vector.
#[derive(Debug, Clone)]
pub struct VnLinear {
    weight: Array2<f32>,
}

impl VnLinear {
    pub fn new<R: Rng + ?Sized>(in_channels: usize, out_channels: usize, rng: &mut R) -> Self {
        Self {
            weight: uniform_weight(out_channels, in_channels, rng),
        }
    }

    /// Wrap an explicit `[C_out, C_in]` weight matrix.
    pub fn from_weight(weight: Array2<f32>) -> Result<Self> {
        if weight.is_empty() {
            return Err(Error::InvalidInput("VnLinear weight must be non-empty".into()));
        }
        Ok(Self { weight })
    }

    pub fn in_channels(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_channels(&self) -> usize {
        self.weight.nrows()
    }

    pub fn weight(&self) -> &Array2<f32> {
        &self.weight
    }

    pub fn set_weight(&mut self, weight: Array2<f32>) -> Result<()> {
        if weight.dim() != self.weight.dim() {
            return Err(Error::DimensionMismatch(format!(
                "VnLinear weight must be {:?}, got {:?}",
                self.weight.dim(),
                weight.dim()
            )));
        }
        self.weight = weight;
        Ok(())
    }
}

impl EquivariantLayer for VnLinear {
    fn forward(&self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let (shape, flat) = flatten_samples(x)?;
        shape.expect_channels(self.in_channels(), "VnLinear")?;

        let (b, c, _, m) = flat.dim();
        let flat = flat.into_shape((b, c, 3 * m))?;
        let mut out = Array3::<f32>::zeros((b, self.out_channels(), 3 * m));
        for (mut o, xb) in out.outer_iter_mut().zip(flat.outer_iter()) {
            general_mat_mul(1.0, &self.weight, &xb, 0.0, &mut o);
        }

        let out = out.into_shape((b, self.out_channels(), 3, m))?;
        restore_samples(out, &shape)
    }

    fn name(&self) -> &'static str {
        "vn_linear"
    }

    fn num_parameters(&self) -> usize {
        self.weight.len()
    }
}

/// Vector linear layer followed by batch norm and the vector leaky ReLU.
///
/// With `p = bn(W_feat x)` and a learned direction `d = W_dir x`, the
/// component of `p` pointing against `d` is removed where `<p, d> < 0`;
/// the result is blended with `p` by the negative slope.
#[derive(Debug, Clone)]
pub struct VnLinearLeakyRelu {
    map_to_feat: VnLinear,
    map_to_dir: VnLinear,
    batchnorm: Option<VnBatchNorm>,
    negative_slope: f32,
}

impl VnLinearLeakyRelu {
    pub fn new<R: Rng + ?Sized>(in_channels: usize, out_channels: usize, rng: &mut R) -> Self {
        Self::build(in_channels, out_channels, out_channels, rng)
    }

    /// One learned direction shared by every output channel.
    pub fn shared<R: Rng + ?Sized>(in_channels: usize, out_channels: usize, rng: &mut R) -> Self {
        Self::build(in_channels, out_channels, 1, rng)
    }

    fn build<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        dir_channels: usize,
        rng: &mut R,
    ) -> Self {
        Self {
            map_to_feat: VnLinear::new(in_channels, out_channels, rng),
            map_to_dir: VnLinear::new(in_channels, dir_channels, rng),
            batchnorm: Some(VnBatchNorm::new(out_channels)),
            negative_slope: DEFAULT_NEGATIVE_SLOPE,
        }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        if let Some(bn) = self.batchnorm.as_mut() {
            bn.set_mode(mode);
        }
        self
    }

    pub fn with_negative_slope(mut self, negative_slope: f32) -> Self {
        self.negative_slope = negative_slope;
        self
    }

    pub fn without_batchnorm(mut self) -> Self {
        self.batchnorm = None;
        self
    }

    pub fn in_channels(&self) -> usize {
        self.map_to_feat.in_channels()
    }

    pub fn out_channels(&self) -> usize {
        self.map_to_feat.out_channels()
    }

    pub fn map_to_feat_mut(&mut self) -> &mut VnLinear {
        &mut self.map_to_feat
    }

    pub fn map_to_dir_mut(&mut self) -> &mut VnLinear {
        &mut self.map_to_dir
    }

    pub fn batchnorm_mut(&mut self) -> Option<&mut VnBatchNorm> {
        self.batchnorm.as_mut()
    }
}

impl EquivariantLayer for VnLinearLeakyRelu {
    fn forward(&self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let p = self.map_to_feat.forward(x)?;
        let p = match &self.batchnorm {
            Some(bn) => bn.forward(&p)?,
            None => p,
        };
        let d = self.map_to_dir.forward(x)?;

        let (shape, p) = flatten_samples(&p)?;
        let (_, d) = flatten_samples(&d)?;
        let d = d.broadcast(p.dim()).ok_or_else(|| {
            Error::DimensionMismatch(format!(
                "direction {:?} does not broadcast to features {:?}",
                d.shape(),
                p.shape()
            ))
        })?;

        let slope = self.negative_slope;
        let mut out = Array4::<f32>::zeros(p.dim());
        Zip::from(out.lanes_mut(Axis(2)))
            .and(p.lanes(Axis(2)))
            .and(d.lanes(Axis(2)))
            .for_each(|mut o, p, d| {
                let dot = p.dot(&d);
                let coef = if dot >= 0.0 { 0.0 } else { dot / (d.dot(&d) + EPS) };
                for i in 0..3 {
                    let rectified = p[i] - coef * d[i];
                    o[i] = slope * p[i] + (1.0 - slope) * rectified;
                }
            });

        restore_samples(out, &shape)
    }

    fn name(&self) -> &'static str {
        "vn_linear_leaky_relu"
    }

    fn num_parameters(&self) -> usize {
        self.map_to_feat.num_parameters()
            + self.map_to_dir.num_parameters()
            + self.batchnorm.as_ref().map_or(0, |bn| bn.num_parameters())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{any_rotation, equivariance_error, random_features};
    use ndarray::{arr2, IxDyn};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_linear_mixes_channels_only() {
        let layer = VnLinear::from_weight(arr2(&[[1.0, 2.0], [0.0, -1.0], [0.5, 0.5]])).unwrap();
        let mut x = ArrayD::<f32>::zeros(IxDyn(&[1, 2, 3, 1]));
        x[[0, 0, 0, 0]] = 1.0; // channel 0 = e_x
        x[[0, 1, 2, 0]] = 1.0; // channel 1 = e_z
        let y = layer.forward(&x).unwrap();
        assert_eq!(y.shape(), &[1, 3, 3, 1]);
        assert_eq!(y[[0, 0, 0, 0]], 1.0);
        assert_eq!(y[[0, 0, 2, 0]], 2.0);
        assert_eq!(y[[0, 1, 2, 0]], -1.0);
        assert_eq!(y[[0, 2, 1, 0]], 0.0);
    }

    #[test]
    fn test_linear_rejects_wrong_channels() {
        let mut rng = StdRng::seed_from_u64(0);
        let layer = VnLinear::new(4, 8, &mut rng);
        let x = random_features(&mut rng, &[2, 3, 3, 5]);
        let err = layer.forward(&x).unwrap_err();
        assert!(err.to_string().contains("expected 4 channels"));
    }

    #[test]
    fn test_linear_is_equivariant_with_neighbor_axis() {
        let mut rng = StdRng::seed_from_u64(1);
        let layer = VnLinear::new(6, 4, &mut rng);
        let x = random_features(&mut rng, &[2, 6, 3, 7, 5]);
        let r = any_rotation(&mut rng);
        let err = equivariance_error(&x, &r, |t| layer.forward(t).unwrap());
        assert!(err < 1e-4, "equivariance error {}", err);
        assert_eq!(layer.forward(&x).unwrap().shape(), &[2, 4, 3, 7, 5]);
    }

    #[test]
    fn test_leaky_relu_is_equivariant() {
        let mut rng = StdRng::seed_from_u64(2);
        let r = any_rotation(&mut rng);
        let x = random_features(&mut rng, &[3, 5, 3, 16]);
        for layer in [
            VnLinearLeakyRelu::new(5, 8, &mut rng),
            VnLinearLeakyRelu::shared(5, 8, &mut rng),
            VnLinearLeakyRelu::new(5, 8, &mut rng).with_mode(Mode::Train),
        ] {
            let err = equivariance_error(&x, &r, |t| layer.forward(t).unwrap());
            assert!(err < 1e-3, "equivariance error {}", err);
        }
    }

    #[test]
    fn test_leaky_relu_keeps_aligned_features() {
        // identity maps, no batch norm: p == d so <p, d> >= 0 and the output is p
        let eye = arr2(&[[1.0, 0.0], [0.0, 1.0]]);
        let mut layer =
            VnLinearLeakyRelu::new(2, 2, &mut StdRng::seed_from_u64(3)).without_batchnorm();
        layer.map_to_feat_mut().set_weight(eye.clone()).unwrap();
        layer.map_to_dir_mut().set_weight(eye).unwrap();
        let x = random_features(&mut StdRng::seed_from_u64(4), &[1, 2, 3, 4]);
        let y = layer.forward(&x).unwrap();
        assert!(hegn_core::tensor::max_abs_diff(&x, &y) < 1e-6);
    }

    #[test]
    fn test_leaky_relu_dampens_opposed_features() {
        // d = -p: output is slope * p
        let mut layer =
            VnLinearLeakyRelu::new(1, 1, &mut StdRng::seed_from_u64(5)).without_batchnorm();
        layer.map_to_feat_mut().set_weight(arr2(&[[1.0]])).unwrap();
        layer.map_to_dir_mut().set_weight(arr2(&[[-1.0]])).unwrap();
        let mut x = ArrayD::<f32>::zeros(IxDyn(&[1, 1, 3, 1]));
        x[[0, 0, 1, 0]] = 2.0;
        let y = layer.forward(&x).unwrap();
        assert!((y[[0, 0, 1, 0]] - 0.4).abs() < 1e-5);
    }
}
