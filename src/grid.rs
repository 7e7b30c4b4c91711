use crate::config::GridConfig;
use crate::error::{NerfError, Result};
use crate::vec3::Vec3;
use serde::Serialize;

/// Regular lattice of sample points spanning `[min, max]` inclusive on each axis.
///
/// Points are enumerated with x varying fastest, then y, then z, which is
/// the layout of a VTK structured-points dataset.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GridSpec {
    pub min: Vec3,
    pub max: Vec3,
    pub resolution: [usize; 3],
}

impl GridSpec {
    pub fn new(min: Vec3, max: Vec3, resolution: [usize; 3]) -> Result<Self> {
        if resolution.contains(&0) {
            return Err(NerfError::geometry(format!(
                "grid resolution {resolution:?} has an empty axis"
            )));
        }
        let (lo, hi) = (min.to_array(), max.to_array());
        for axis in 0..3 {
            if !(lo[axis].is_finite() && hi[axis].is_finite()) || lo[axis] > hi[axis] {
                return Err(NerfError::geometry(format!(
                    "grid axis {axis} spans [{}, {}]",
                    lo[axis], hi[axis]
                )));
            }
        }
        Ok(Self {
            min,
            max,
            resolution,
        })
    }

    pub fn from_config(config: &GridConfig) -> Result<Self> {
        Self::new(
            Vec3::splat(config.min),
            Vec3::splat(config.max),
            [config.resolution; 3],
        )
    }

    pub fn len(&self) -> usize {
        self.resolution.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Distance between neighbouring points; zero on single-point axes.
    pub fn spacing(&self) -> Vec3 {
        let (lo, hi) = (self.min.to_array(), self.max.to_array());
        let s: [f32; 3] = std::array::from_fn(|axis| {
            let n = self.resolution[axis];
            if n > 1 {
                (hi[axis] - lo[axis]) / (n - 1) as f32
            } else {
                0.0
            }
        });
        s.into()
    }

    /// Position of the first point. Single-point axes sit at the box center.
    pub fn origin(&self) -> Vec3 {
        let (lo, hi) = (self.min.to_array(), self.max.to_array());
        let o: [f32; 3] = std::array::from_fn(|axis| {
            if self.resolution[axis] > 1 {
                lo[axis]
            } else {
                0.5 * (lo[axis] + hi[axis])
            }
        });
        o.into()
    }

    pub fn index(&self, ix: usize, iy: usize, iz: usize) -> usize {
        let [nx, ny, _] = self.resolution;
        ix + nx * (iy + ny * iz)
    }

    pub fn coords(&self, index: usize) -> Result<[usize; 3]> {
        if index >= self.len() {
            return Err(NerfError::geometry(format!(
                "voxel index {index} outside a grid of {} points",
                self.len()
            )));
        }
        let [nx, ny, _] = self.resolution;
        Ok([index % nx, (index / nx) % ny, index / (nx * ny)])
    }

    pub fn point(&self, index: usize) -> Result<Vec3> {
        let [ix, iy, iz] = self.coords(index)?;
        let o = self.origin();
        let s = self.spacing();
        Ok(Vec3::new(
            o.x + s.x * ix as f32,
            o.y + s.y * iy as f32,
            o.z + s.z * iz as f32,
        ))
    }

    /// Points with indices in `start..end`, in index order.
    pub fn points(&self, start: usize, end: usize) -> Result<Vec<Vec3>> {
        if start > end || end > self.len() {
            return Err(NerfError::geometry(format!(
                "point range {start}..{end} outside a grid of {} points",
                self.len()
            )));
        }
        (start..end).map(|i| self.point(i)).collect()
    }
}

/// One grid cell after a direct field query.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Voxel {
    pub density: f32,
    pub opacity: f32,
    pub color: Vec3,
    pub uncertainty: f32,
}

/// Dense per-point buffers for a grid, filled batch by batch.
#[derive(Clone, Debug)]
pub struct VoxelVolume {
    grid: GridSpec,
    pub density: Vec<f32>,
    pub opacity: Vec<f32>,
    pub uncertainty: Vec<f32>,
    pub color: Vec<Vec3>,
    /// Number of leading points already written.
    pub filled: usize,
}

impl VoxelVolume {
    pub fn new(grid: GridSpec) -> Self {
        let n = grid.len();
        Self {
            grid,
            density: vec![0.0; n],
            opacity: vec![0.0; n],
            uncertainty: vec![0.0; n],
            color: vec![Vec3::ZERO; n],
            filled: 0,
        }
    }

    pub fn grid(&self) -> &GridSpec {
        &self.grid
    }

    pub fn is_complete(&self) -> bool {
        self.filled == self.grid.len()
    }

    pub fn voxel(&self, index: usize) -> Voxel {
        Voxel {
            density: self.density[index],
            opacity: self.opacity[index],
            color: self.color[index],
            uncertainty: self.uncertainty[index],
        }
    }

    pub fn voxels(&self) -> impl Iterator<Item = Voxel> + '_ {
        (0..self.filled).map(|i| self.voxel(i))
    }

    /// Writes `voxels` at `start..` and extends the filled prefix.
    pub(crate) fn write(&mut self, start: usize, voxels: &[Voxel]) -> Result<()> {
        if start != self.filled || start + voxels.len() > self.grid.len() {
            return Err(NerfError::geometry(format!(
                "cannot write {} voxels at {start}, volume is filled to {} of {}",
                voxels.len(),
                self.filled,
                self.grid.len()
            )));
        }
        for (offset, v) in voxels.iter().enumerate() {
            let i = start + offset;
            self.density[i] = v.density;
            self.opacity[i] = v.opacity;
            self.uncertainty[i] = v.uncertainty;
            self.color[i] = v.color;
        }
        self.filled += voxels.len();
        Ok(())
    }
}
