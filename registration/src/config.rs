use hegn_core::runtime::Device;
use hegn_core::{Error, Result};
use hegn_dnn::{LocalContextConfig, Mode, Pooling, DEFAULT_NEGATIVE_SLOPE};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Number of hierarchy blocks.
pub const NUM_BLOCKS: usize = 4;

fn default_head_channels() -> usize {
    16
}

fn default_negative_slope() -> f32 {
    DEFAULT_NEGATIVE_SLOPE
}

/// HEGN model configuration.
///
/// Every per-level array has one entry per hierarchy block. Level `i` maps
/// `in_channels[i]` to `out_channels[i]`, builds kNN graphs with `n_knn[i]`
/// neighbors and keeps `N / topk[i]` points for the next level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HegnConfig {
    pub in_channels: [usize; NUM_BLOCKS],
    pub out_channels: [usize; NUM_BLOCKS],
    pub n_knn: [usize; NUM_BLOCKS],
    pub topk: [usize; NUM_BLOCKS],
    /// Channels per attention head in the cross context.
    #[serde(default = "default_head_channels")]
    pub head_channels: usize,
    #[serde(default)]
    pub pooling: Pooling,
    #[serde(default = "default_negative_slope")]
    pub negative_slope: f32,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub device: Device,
}

impl Default for HegnConfig {
    fn default() -> Self {
        Self {
            in_channels: [1, 32, 32, 64],
            out_channels: [32, 32, 64, 64],
            n_knn: [16; NUM_BLOCKS],
            topk: [4, 4, 2, 2],
            head_channels: default_head_channels(),
            pooling: Pooling::default(),
            negative_slope: DEFAULT_NEGATIVE_SLOPE,
            mode: Mode::default(),
            device: Device::default(),
        }
    }
}

impl HegnConfig {
    pub fn validate(&self) -> Result<()> {
        if self.in_channels[0] != 1 {
            return Err(Error::ConfigError(format!(
                "first block takes raw points (1 channel), got in_channels[0] = {}",
                self.in_channels[0]
            )));
        }
        if self.head_channels == 0 {
            return Err(Error::ConfigError("head_channels must be >= 1".into()));
        }
        for level in 0..NUM_BLOCKS {
            let (c_in, c_out) = (self.in_channels[level], self.out_channels[level]);
            if c_in == 0 || c_out == 0 {
                return Err(Error::ConfigError(format!(
                    "block {}: channel counts must be non-zero ({} -> {})",
                    level, c_in, c_out
                )));
            }
            if level > 0 && c_in != self.out_channels[level - 1] {
                return Err(Error::ConfigError(format!(
                    "block {} takes {} channels but block {} produces {}",
                    level,
                    c_in,
                    level - 1,
                    self.out_channels[level - 1]
                )));
            }
            if c_out % self.head_channels != 0 {
                return Err(Error::ConfigError(format!(
                    "block {}: {} channels do not split into heads of {}",
                    level, c_out, self.head_channels
                )));
            }
            if self.n_knn[level] == 0 {
                return Err(Error::ConfigError(format!("block {}: n_knn must be >= 1", level)));
            }
            if self.topk[level] == 0 {
                return Err(Error::ConfigError(format!("block {}: topk must be >= 1", level)));
            }
        }
        if !(0.0..=1.0).contains(&self.negative_slope) {
            return Err(Error::ConfigError(format!(
                "negative slope {} outside [0, 1]",
                self.negative_slope
            )));
        }
        if self.device == Device::CpuThreads(0) {
            return Err(Error::ConfigError("device thread count must be >= 1".into()));
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Points left after every block for an input of `num_points`.
    pub fn samples_per_block(&self, num_points: usize) -> [usize; NUM_BLOCKS] {
        let mut n = num_points;
        let mut out = [0; NUM_BLOCKS];
        for (level, slot) in out.iter_mut().enumerate() {
            n = (n / self.topk[level].max(1)).max(1);
            *slot = n;
        }
        out
    }

    pub fn local_context(&self, level: usize) -> LocalContextConfig {
        LocalContextConfig {
            in_channels: self.in_channels[level],
            out_channels: self.out_channels[level],
            k: self.n_knn[level],
            pooling: self.pooling,
            mode: self.mode,
            negative_slope: self.negative_slope,
        }
    }
}
