use crate::error::{NerfError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Shape of the trained MLP and its input encoders.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub num_layers: usize,
    pub hidden_size: usize,
    pub skip_connect_every: usize,
    pub num_encoding_fn_xyz: usize,
    pub num_encoding_fn_dir: usize,
    pub log_sampling_xyz: bool,
    pub log_sampling_dir: bool,
    pub include_input_xyz: bool,
    pub include_input_dir: bool,
    pub use_viewdirs: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            num_layers: 8,
            hidden_size: 256,
            skip_connect_every: 4,
            num_encoding_fn_xyz: 10,
            num_encoding_fn_dir: 4,
            log_sampling_xyz: true,
            log_sampling_dir: true,
            include_input_xyz: true,
            include_input_dir: true,
            use_viewdirs: true,
        }
    }
}

/// Ray sampling and compositing parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub near: f32,
    pub far: f32,
    pub num_coarse: usize,
    pub num_fine: usize,
    pub chunksize: usize,
    pub lindisp: bool,
    pub perturb: bool,
    pub radiance_field_noise_std: f32,
    pub white_background: bool,
    /// Base seed for per-ray random sources (perturbation, density noise).
    pub seed: u64,
    /// Bytes one evaluation chunk may use; larger chunks fail as resource errors.
    pub memory_budget: Option<usize>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            near: 2.0,
            far: 6.0,
            num_coarse: 64,
            num_fine: 128,
            chunksize: 16384,
            lindisp: false,
            perturb: false,
            radiance_field_noise_std: 0.0,
            white_background: true,
            seed: 0,
            memory_budget: None,
        }
    }
}

/// Axis-aligned cube sampled by the per-voxel sweep.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub min: f32,
    pub max: f32,
    pub resolution: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            min: -1.3,
            max: 1.3,
            resolution: 100,
        }
    }
}

/// Second axis of the 2D transfer-function heatmap. The first is always density.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueAxis {
    Uncertainty,
    Red,
    Green,
    Blue,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeatmapConfig {
    pub density_bins: usize,
    pub value_bins: usize,
    pub value_axis: ValueAxis,
    pub density_range: (f32, f32),
    pub value_range: (f32, f32),
}

impl Default for HeatmapConfig {
    fn default() -> Self {
        Self {
            density_bins: 20,
            value_bins: 20,
            value_axis: ValueAxis::Uncertainty,
            density_range: (0.0, 1.0),
            value_range: (0.0, 1.0),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NerfConfig {
    pub model: ModelConfig,
    pub sampling: SamplingConfig,
    pub grid: GridConfig,
    pub heatmap: HeatmapConfig,
}

impl NerfConfig {
    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: NerfConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        let m = &self.model;
        if m.num_layers == 0 || m.hidden_size == 0 {
            return Err(NerfError::config("num_layers and hidden_size must be positive"));
        }
        if m.use_viewdirs && m.hidden_size < 2 {
            return Err(NerfError::config(
                "hidden_size must be at least 2 when view directions are used",
            ));
        }
        if !m.include_input_xyz && m.num_encoding_fn_xyz == 0 {
            return Err(NerfError::config("position encoding would be empty"));
        }

        let s = &self.sampling;
        validate_bounds(s.near, s.far)?;
        if s.num_coarse == 0 {
            return Err(NerfError::config("num_coarse must be positive"));
        }
        if s.chunksize == 0 {
            return Err(NerfError::config("chunksize must be positive"));
        }
        if !(s.radiance_field_noise_std >= 0.0) {
            return Err(NerfError::config(
                "radiance_field_noise_std must be non-negative",
            ));
        }

        let g = &self.grid;
        if g.resolution == 0 {
            return Err(NerfError::geometry("grid resolution must be positive"));
        }
        if !(g.min.is_finite() && g.max.is_finite()) || g.min >= g.max {
            return Err(NerfError::geometry(format!(
                "grid bounds [{}, {}] are empty",
                g.min, g.max
            )));
        }

        self.heatmap.validate()
    }
}

impl HeatmapConfig {
    pub fn validate(&self) -> Result<()> {
        if self.density_bins == 0 || self.value_bins == 0 {
            return Err(NerfError::config("heatmap bin counts must be positive"));
        }
        for (name, (lo, hi)) in [("density", self.density_range), ("value", self.value_range)] {
            if !(lo.is_finite() && hi.is_finite()) || lo >= hi {
                return Err(NerfError::config(format!(
                    "heatmap {name} range [{lo}, {hi}] must be finite and increasing"
                )));
            }
        }
        Ok(())
    }
}

pub(crate) fn validate_bounds(near: f32, far: f32) -> Result<()> {
    if !(near.is_finite() && far.is_finite()) || near >= far {
        return Err(NerfError::geometry(format!(
            "ray bounds require near < far, got near={near} far={far}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config = NerfConfig::from_json_str(
            r#"{ "sampling": { "near": 0.5, "far": 3.0, "lindisp": true },
                 "heatmap": { "value_axis": "red" } }"#,
        )
        .unwrap();
        assert_eq!(config.sampling.near, 0.5);
        assert!(config.sampling.lindisp);
        assert_eq!(config.sampling.num_coarse, 64);
        assert_eq!(config.model, ModelConfig::default());
        assert_eq!(config.heatmap.value_axis, ValueAxis::Red);
    }

    #[test]
    fn rejects_inverted_bounds() {
        let err = NerfConfig::from_json_str(r#"{ "sampling": { "near": 4.0, "far": 4.0 } }"#)
            .unwrap_err();
        assert!(matches!(err, NerfError::InvalidGeometry(_)));
    }

    #[test]
    fn rejects_zero_chunksize_and_resolution() {
        let mut config = NerfConfig::default();
        config.sampling.chunksize = 0;
        assert!(matches!(
            config.validate(),
            Err(NerfError::Configuration(_))
        ));

        let mut config = NerfConfig::default();
        config.heatmap.value_range = (0.5, f32::NAN);
        assert!(matches!(
            config.validate(),
            Err(NerfError::Configuration(_))
        ));

        let mut config = NerfConfig::default();
        config.grid.resolution = 0;
        assert!(matches!(
            config.validate(),
            Err(NerfError::InvalidGeometry(_))
        ));
    }
}
