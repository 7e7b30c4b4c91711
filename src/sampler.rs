use crate::camera::Ray;
use crate::config::SamplingConfig;
use crate::error::{NerfError, Result};
use log::debug;
use rand::Rng;

/// Floor added to every importance weight so no bin has zero probability.
const WEIGHT_FLOOR: f32 = 1e-5;

/// Coarse stratified and fine importance sampling of ray depths.
#[derive(Clone, Debug)]
pub struct Sampler {
    pub num_coarse: usize,
    pub num_fine: usize,
    pub lindisp: bool,
    pub perturb: bool,
}

impl Sampler {
    pub fn from_config(config: &SamplingConfig) -> Self {
        Self {
            num_coarse: config.num_coarse,
            num_fine: config.num_fine,
            lindisp: config.lindisp,
            perturb: config.perturb,
        }
    }

    /// One depth per bin of `[near, far]`; bin midpoints unless perturbed.
    pub fn coarse<R: Rng + ?Sized>(&self, ray: &Ray, rng: &mut R) -> Result<Vec<f32>> {
        stratified_depths(
            ray.near(),
            ray.far(),
            self.num_coarse,
            self.lindisp,
            self.perturb,
            rng,
        )
    }

    /// Coarse depths merged with `num_fine` depths drawn from the coarse weights.
    pub fn fine<R: Rng + ?Sized>(
        &self,
        ray: &Ray,
        coarse: &[f32],
        weights: &[f32],
        rng: &mut R,
    ) -> Result<Vec<f32>> {
        let extra = importance_depths(
            coarse,
            weights,
            self.num_fine,
            ray.near(),
            ray.far(),
            self.perturb,
            rng,
        )?;
        Ok(merge_depths(coarse, &extra))
    }
}

fn lerp_depth(near: f32, far: f32, s: f32, lindisp: bool) -> f32 {
    if lindisp {
        1.0 / ((1.0 / near) * (1.0 - s) + (1.0 / far) * s)
    } else {
        near * (1.0 - s) + far * s
    }
}

/// Splits `[near, far]` into `count` bins, equal in depth or in inverse
/// depth with `lindisp`, and draws one depth per bin.
pub fn stratified_depths<R: Rng + ?Sized>(
    near: f32,
    far: f32,
    count: usize,
    lindisp: bool,
    perturb: bool,
    rng: &mut R,
) -> Result<Vec<f32>> {
    crate::config::validate_bounds(near, far)?;
    if lindisp && near <= 0.0 {
        return Err(NerfError::geometry(format!(
            "inverse-depth sampling needs near > 0, got {near}"
        )));
    }

    let interval = 1.0 / count as f32;
    let t = (0..count)
        .map(|i| {
            let jitter = if perturb { rng.gen_range(0.0..1.0) } else { 0.5 };
            let s = (i as f32 + jitter) * interval;
            lerp_depth(near, far, s, lindisp)
        })
        .collect();
    Ok(t)
}

fn midpoints(values: &[f32]) -> Vec<f32> {
    values.windows(2).map(|w| 0.5 * (w[0] + w[1])).collect()
}

/// Inverse-CDF sampling of `count` depths from the piecewise-constant
/// density given by `weights` over the midpoints of `depths`.
///
/// The end weights are dropped since their bins are half-open. Without any
/// weight mass the density falls back to uniform over `[near, far]`.
/// With `perturb == false` the CDF is read at evenly spaced positions, so
/// identical inputs always give identical depths.
pub fn importance_depths<R: Rng + ?Sized>(
    depths: &[f32],
    weights: &[f32],
    count: usize,
    near: f32,
    far: f32,
    perturb: bool,
    rng: &mut R,
) -> Result<Vec<f32>> {
    crate::config::validate_bounds(near, far)?;
    if depths.len() != weights.len() {
        return Err(NerfError::geometry(format!(
            "{} depths but {} weights",
            depths.len(),
            weights.len()
        )));
    }
    if let Some(w) = weights.iter().find(|w| !(**w >= 0.0)) {
        return Err(NerfError::geometry(format!(
            "importance weights must be non-negative, found {w}"
        )));
    }
    if count == 0 {
        return Ok(Vec::new());
    }

    let inner = if weights.len() >= 3 {
        &weights[1..weights.len() - 1]
    } else {
        &[][..]
    };
    let (bins, pdf): (Vec<f32>, Vec<f32>) = if inner.iter().sum::<f32>() > 0.0 {
        let adjusted: Vec<f32> = inner.iter().map(|&w| w + WEIGHT_FLOOR).collect();
        let sum: f32 = adjusted.iter().sum();
        (midpoints(depths), adjusted.iter().map(|w| w / sum).collect())
    } else {
        debug!("no importance weight mass, fine samples fall back to uniform");
        (vec![near, far], vec![1.0])
    };

    let mut cdf = Vec::with_capacity(pdf.len() + 1);
    cdf.push(0.0f32);
    let mut cumulative = 0.0;
    for &p in &pdf {
        cumulative += p;
        cdf.push(cumulative);
    }
    if let Some(last) = cdf.last_mut() {
        *last = 1.0;
    }

    let last_bin = pdf.len() - 1;
    let samples = (0..count)
        .map(|k| {
            let u = if perturb {
                rng.gen_range(0.0..1.0)
            } else if count > 1 {
                k as f32 / (count - 1) as f32
            } else {
                0.5
            };
            // first edge strictly above u, shifted back to the bin holding u
            let idx = cdf.partition_point(|&c| c <= u).saturating_sub(1).min(last_bin);
            let cdf_lower = cdf[idx];
            let mut denom = cdf[idx + 1] - cdf_lower;
            if denom < WEIGHT_FLOOR {
                denom = 1.0;
            }
            let t = ((u - cdf_lower) / denom).clamp(0.0, 1.0);
            bins[idx] + (bins[idx + 1] - bins[idx]) * t
        })
        .collect();
    Ok(samples)
}

/// Union of both depth sets, sorted ascending. Duplicates are kept.
pub fn merge_depths(coarse: &[f32], fine: &[f32]) -> Vec<f32> {
    let mut merged = Vec::with_capacity(coarse.len() + fine.len());
    merged.extend_from_slice(coarse);
    merged.extend_from_slice(fine);
    merged.sort_by(f32::total_cmp);
    merged
}
