use crate::config::{HeatmapConfig, ValueAxis};
use crate::error::{NerfError, Result};
use crate::grid::{Voxel, VoxelVolume};
use log::warn;
use rayon::prelude::*;
use serde::Serialize;

/// Welford running mean/variance. Mergeable, so partial aggregates built
/// on separate threads combine into the same result as one sequential pass.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RunningStat {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStat {
    pub fn push(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    /// Chan et al. pairwise combination.
    pub fn merge(&mut self, other: &RunningStat) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        let n = self.count + other.count;
        let delta = other.mean - self.mean;
        let other_share = other.count as f64 / n as f64;
        self.mean += delta * other_share;
        self.m2 += other.m2 + delta * delta * self.count as f64 * other_share;
        self.count = n;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// NaN when empty.
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            f64::NAN
        } else {
            self.mean
        }
    }

    /// Population variance; NaN when empty.
    pub fn variance(&self) -> f64 {
        if self.count == 0 {
            f64::NAN
        } else {
            (self.m2 / self.count as f64).max(0.0)
        }
    }

    pub fn std(&self) -> f64 {
        self.variance().sqrt()
    }
}

impl FromIterator<f64> for RunningStat {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        let mut stat = RunningStat::default();
        for x in iter {
            stat.push(x);
        }
        stat
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BinStats {
    pub density: RunningStat,
    pub color: [RunningStat; 3],
    pub uncertainty: RunningStat,
}

impl BinStats {
    fn push(&mut self, voxel: &Voxel) {
        self.density.push(voxel.density as f64);
        for (stat, c) in self.color.iter_mut().zip(voxel.color.to_array()) {
            stat.push(c as f64);
        }
        self.uncertainty.push(voxel.uncertainty as f64);
    }

    fn merge(&mut self, other: &BinStats) {
        self.density.merge(&other.density);
        for (a, b) in self.color.iter_mut().zip(&other.color) {
            a.merge(b);
        }
        self.uncertainty.merge(&other.uncertainty);
    }
}

/// Finalized statistics of one transfer-function bin. Empty bins carry NaN.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BinRow {
    pub density_bin: usize,
    pub value_bin: usize,
    pub count: u64,
    pub density_mean: f64,
    pub density_std: f64,
    pub color_mean: [f64; 3],
    pub color_std: [f64; 3],
    pub uncertainty_mean: f64,
    pub uncertainty_std: f64,
}

/// 2D table over (opacity, value axis) holding running statistics per bin.
///
/// The density axis is keyed by opacity `1 - exp(-density)`, which maps
/// density monotonically onto `[0, 1]`. Keys outside the configured range
/// land in the edge bins; voxels with non-finite keys are skipped.
#[derive(Clone, Debug, PartialEq)]
pub struct TransferFunctionTable {
    density_bins: usize,
    value_bins: usize,
    density_range: (f32, f32),
    value_range: (f32, f32),
    axis: ValueAxis,
    bins: Vec<BinStats>,
    skipped: u64,
}

impl TransferFunctionTable {
    pub fn new(config: &HeatmapConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            density_bins: config.density_bins,
            value_bins: config.value_bins,
            density_range: config.density_range,
            value_range: config.value_range,
            axis: config.value_axis,
            bins: vec![BinStats::default(); config.density_bins * config.value_bins],
            skipped: 0,
        })
    }

    /// Aggregates every filled voxel of `volume`, in parallel.
    pub fn from_volume(volume: &VoxelVolume, config: &HeatmapConfig) -> Result<Self> {
        let empty = Self::new(config)?;
        let voxels: Vec<Voxel> = volume.voxels().collect();
        let table = voxels
            .par_chunks(4096)
            .map(|chunk| {
                let mut table = empty.clone();
                for v in chunk {
                    table.push(v);
                }
                Ok::<_, NerfError>(table)
            })
            .try_reduce(|| empty.clone(), |mut a, b| {
                a.merge(&b)?;
                Ok(a)
            })?;
        if table.skipped > 0 {
            warn!(
                "{} of {} voxels had non-finite keys and were left out of the table",
                table.skipped,
                voxels.len()
            );
        }
        Ok(table)
    }

    fn quantize(x: f32, (lo, hi): (f32, f32), bins: usize) -> Option<usize> {
        if !x.is_finite() {
            return None;
        }
        let scaled = ((x - lo) / (hi - lo) * bins as f32).floor();
        Some((scaled.max(0.0) as usize).min(bins - 1))
    }

    fn value_key(&self, voxel: &Voxel) -> f32 {
        match self.axis {
            ValueAxis::Uncertainty => voxel.uncertainty,
            ValueAxis::Red => voxel.color.x,
            ValueAxis::Green => voxel.color.y,
            ValueAxis::Blue => voxel.color.z,
        }
    }

    /// (density bin, value bin) for a voxel, if its keys are finite.
    pub fn bin_of(&self, voxel: &Voxel) -> Option<(usize, usize)> {
        let d = Self::quantize(voxel.opacity, self.density_range, self.density_bins)?;
        let v = Self::quantize(self.value_key(voxel), self.value_range, self.value_bins)?;
        Some((d, v))
    }

    pub fn push(&mut self, voxel: &Voxel) {
        match self.bin_of(voxel) {
            Some((d, v)) => self.bins[d * self.value_bins + v].push(voxel),
            None => self.skipped += 1,
        }
    }

    pub fn merge(&mut self, other: &TransferFunctionTable) -> Result<()> {
        if self.density_bins != other.density_bins
            || self.value_bins != other.value_bins
            || self.density_range != other.density_range
            || self.value_range != other.value_range
            || self.axis != other.axis
        {
            return Err(NerfError::config("cannot merge tables with different binning"));
        }
        for (a, b) in self.bins.iter_mut().zip(&other.bins) {
            a.merge(b);
        }
        self.skipped += other.skipped;
        Ok(())
    }

    pub fn bin(&self, density_bin: usize, value_bin: usize) -> Option<&BinStats> {
        if density_bin >= self.density_bins || value_bin >= self.value_bins {
            return None;
        }
        self.bins.get(density_bin * self.value_bins + value_bin)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn total(&self) -> u64 {
        self.bins.iter().map(|b| b.density.count()).sum()
    }

    /// One row per bin, density-major.
    pub fn rows(&self) -> Vec<BinRow> {
        self.bins
            .iter()
            .enumerate()
            .map(|(i, b)| BinRow {
                density_bin: i / self.value_bins,
                value_bin: i % self.value_bins,
                count: b.density.count(),
                density_mean: b.density.mean(),
                density_std: b.density.std(),
                color_mean: [b.color[0].mean(), b.color[1].mean(), b.color[2].mean()],
                color_std: [b.color[0].std(), b.color[1].std(), b.color[2].std()],
                uncertainty_mean: b.uncertainty.mean(),
                uncertainty_std: b.uncertainty.std(),
            })
            .collect()
    }
}

/// Histogram over `[0, 1]` normalised by its largest bin.
///
/// Values outside the range are ignored; with `filter_threshold` values at
/// or below the threshold are dropped first. An empty histogram is all zeros.
pub fn normalized_histogram(data: &[f32], bins: usize, filter_threshold: Option<f32>) -> Vec<f32> {
    let mut counts = vec![0u64; bins];
    if bins == 0 {
        return Vec::new();
    }
    for &x in data {
        if filter_threshold.is_some_and(|t| x <= t) {
            continue;
        }
        if !(0.0..=1.0).contains(&x) {
            continue;
        }
        let idx = ((x * bins as f32) as usize).min(bins - 1);
        counts[idx] += 1;
    }
    let max = counts.iter().copied().max().unwrap_or(0);
    if max == 0 {
        return vec![0.0; bins];
    }
    counts.iter().map(|&c| c as f32 / max as f32).collect()
}

/// Mean and population standard deviation of a buffer, NaN when empty.
pub fn buffer_mean_std(values: &[f32]) -> (f64, f64) {
    let stat: RunningStat = values.iter().map(|&v| v as f64).collect();
    (stat.mean(), stat.std())
}
