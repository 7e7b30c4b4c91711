use crate::camera::{Camera, Ray};
use crate::config::SamplingConfig;
use crate::error::{NerfError, Result};
use crate::field::{FieldEvaluator, FieldOutput, RadianceField};
use crate::grid::{GridSpec, Voxel, VoxelVolume};
use crate::integrator::{alpha_from_density, Compositor, RayAccumulation};
use crate::sampler::Sampler;
use crate::stats::buffer_mean_std;
use crate::vec3::Vec3;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use std::time::Instant;

const BLOCK_SIZE: usize = 8;

/// Independent random stream for item `index` under `seed`.
pub(crate) fn stream_rng(seed: u64, index: usize) -> StdRng {
    StdRng::seed_from_u64(seed ^ (index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

/// Coarse pass, plus the fine pass when fine samples are configured.
#[derive(Clone, Debug)]
pub struct RayRender {
    pub coarse: RayAccumulation,
    pub fine: Option<RayAccumulation>,
}

impl RayRender {
    /// Best available estimate: fine if present, else coarse.
    pub fn output(&self) -> &RayAccumulation {
        self.fine.as_ref().unwrap_or(&self.coarse)
    }
}

/// Hierarchical coarse-to-fine ray renderer.
pub struct Renderer<'a> {
    coarse: FieldEvaluator<'a, dyn RadianceField + 'a>,
    fine: FieldEvaluator<'a, dyn RadianceField + 'a>,
    sampler: Sampler,
    compositor: Compositor,
    seed: u64,
}

impl<'a> Renderer<'a> {
    /// Without a separate fine field the coarse field serves both passes.
    pub fn new(
        coarse: &'a (dyn RadianceField + 'a),
        fine: Option<&'a (dyn RadianceField + 'a)>,
        config: &SamplingConfig,
    ) -> Result<Self> {
        if config.num_coarse == 0 {
            return Err(NerfError::config("num_coarse must be positive"));
        }
        Ok(Self {
            coarse: FieldEvaluator::from_config(coarse, config)?,
            fine: FieldEvaluator::from_config(fine.unwrap_or(coarse), config)?,
            sampler: Sampler::from_config(config),
            compositor: Compositor::from_config(config),
            seed: config.seed,
        })
    }

    /// Disables density noise, as for validation renders.
    pub fn without_noise(mut self) -> Self {
        self.compositor = self.compositor.without_noise();
        self
    }

    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    /// Renders `rays`; ray `k` draws from the random stream `first_index + k`.
    pub fn render_rays(&self, rays: &[Ray], first_index: usize) -> Result<Vec<RayRender>> {
        let mut rngs: Vec<StdRng> = (0..rays.len())
            .map(|k| stream_rng(self.seed, first_index + k))
            .collect();

        let coarse_depths = rays
            .iter()
            .zip(rngs.iter_mut())
            .map(|(ray, rng)| self.sampler.coarse(ray, rng))
            .collect::<Result<Vec<_>>>()?;
        let coarse_outputs = query_along(&self.coarse, rays, &coarse_depths)?;
        let coarse = rays
            .iter()
            .zip(&coarse_depths)
            .zip(coarse_outputs)
            .zip(rngs.iter_mut())
            .map(|(((ray, depths), samples), rng)| {
                self.compositor.composite(ray, depths, &samples, rng)
            })
            .collect::<Result<Vec<_>>>()?;

        if self.sampler.num_fine == 0 {
            return Ok(coarse
                .into_iter()
                .map(|coarse| RayRender { coarse, fine: None })
                .collect());
        }

        let fine_depths = rays
            .iter()
            .zip(&coarse_depths)
            .zip(&coarse)
            .zip(rngs.iter_mut())
            .map(|(((ray, depths), acc), rng)| self.sampler.fine(ray, depths, &acc.weights, rng))
            .collect::<Result<Vec<_>>>()?;
        let fine_outputs = query_along(&self.fine, rays, &fine_depths)?;

        rays.iter()
            .zip(&fine_depths)
            .zip(fine_outputs)
            .zip(rngs.iter_mut())
            .zip(coarse)
            .map(|((((ray, depths), samples), rng), coarse)| {
                let fine = self.compositor.composite(ray, depths, &samples, rng)?;
                Ok(RayRender {
                    coarse,
                    fine: Some(fine),
                })
            })
            .collect()
    }

    fn render_block(
        &self,
        camera: &Camera,
        block_y: usize,
        block_x: usize,
    ) -> Result<Vec<(usize, RayAccumulation)>> {
        let mut pixels = Vec::with_capacity(BLOCK_SIZE * BLOCK_SIZE);
        for i in block_y..(block_y + BLOCK_SIZE).min(camera.height) {
            for j in block_x..(block_x + BLOCK_SIZE).min(camera.width) {
                pixels.push(i * camera.width + j);
            }
        }
        let rays = pixels
            .iter()
            .map(|&p| camera.ray(p))
            .collect::<Result<Vec<_>>>()?;

        // Contiguous pixel runs per block row keep ray streams tied to the pixel index.
        let mut results = Vec::with_capacity(pixels.len());
        let mut start = 0;
        while start < pixels.len() {
            let mut end = start + 1;
            while end < pixels.len() && pixels[end] == pixels[end - 1] + 1 {
                end += 1;
            }
            let rendered = self.render_rays(&rays[start..end], pixels[start])?;
            results.extend(
                pixels[start..end]
                    .iter()
                    .zip(rendered)
                    .map(|(&p, r)| (p, r.fine.unwrap_or(r.coarse))),
            );
            start = end;
        }
        Ok(results)
    }

    /// Renders every pixel of `camera` in parallel 8x8 blocks.
    ///
    /// `progress` is called with (pixels done, pixels total) after each row of blocks.
    pub fn render_image(
        &self,
        camera: &Camera,
        mut progress: impl FnMut(usize, usize),
    ) -> Result<ValidationImage> {
        let total = camera.pixel_count();
        let start_time = Instant::now();
        info!(
            "rendering {}x{} view, {} coarse + {} fine samples per ray",
            camera.width, camera.height, self.sampler.num_coarse, self.sampler.num_fine
        );

        let mut image = ValidationImage::new(camera.width, camera.height);
        let mut done = 0;
        for block_y in (0..camera.height).step_by(BLOCK_SIZE) {
            let blocks: Vec<Vec<(usize, RayAccumulation)>> = (0..camera.width)
                .step_by(BLOCK_SIZE)
                .collect::<Vec<_>>()
                .par_iter()
                .map(|&block_x| self.render_block(camera, block_y, block_x))
                .collect::<Result<_>>()?;
            for (pixel, acc) in blocks.into_iter().flatten() {
                image.set(pixel, &acc);
                done += 1;
            }
            progress(done, total);
        }

        info!(
            "rendered {total} pixels in {:.2?}",
            start_time.elapsed()
        );
        Ok(image)
    }
}

/// Queries `evaluator` at every depth of every ray, returning one output run per ray.
fn query_along<F: RadianceField + ?Sized>(
    evaluator: &FieldEvaluator<'_, F>,
    rays: &[Ray],
    depths: &[Vec<f32>],
) -> Result<Vec<Vec<FieldOutput>>> {
    let total: usize = depths.iter().map(Vec::len).sum();
    let mut positions = Vec::with_capacity(total);
    let mut directions = Vec::with_capacity(total);
    for (ray, ts) in rays.iter().zip(depths) {
        let view_dir = ray.direction().normalize();
        for &t in ts {
            positions.push(ray.at(t));
            directions.push(view_dir);
        }
    }

    let mut outputs = evaluator.evaluate(&positions, Some(&directions))?.into_iter();
    Ok(depths
        .iter()
        .map(|ts| outputs.by_ref().take(ts.len()).collect())
        .collect())
}

/// Per-pixel buffers of one validation render, row-major.
#[derive(Clone, Debug)]
pub struct ValidationImage {
    pub width: usize,
    pub height: usize,
    pub rgb: Vec<Vec3>,
    pub uncertainty: Vec<f32>,
    pub opacity: Vec<f32>,
    pub depth: Vec<f32>,
    pub disparity: Vec<f32>,
}

impl ValidationImage {
    fn new(width: usize, height: usize) -> Self {
        let n = width * height;
        Self {
            width,
            height,
            rgb: vec![Vec3::ZERO; n],
            uncertainty: vec![0.0; n],
            opacity: vec![0.0; n],
            depth: vec![0.0; n],
            disparity: vec![0.0; n],
        }
    }

    fn set(&mut self, pixel: usize, acc: &RayAccumulation) {
        self.rgb[pixel] = acc.color;
        self.uncertainty[pixel] = acc.uncertainty;
        self.opacity[pixel] = acc.opacity;
        self.depth[pixel] = acc.depth;
        self.disparity[pixel] = acc.disparity;
    }

    /// Mean and population standard deviation of the uncertainty map.
    pub fn uncertainty_stats(&self) -> (f64, f64) {
        buffer_mean_std(&self.uncertainty)
    }
}

/// Direct per-point field queries over a grid, in batches of `chunksize` points.
pub struct VoxelSweep<'a> {
    grid: GridSpec,
    evaluator: FieldEvaluator<'a, dyn RadianceField + 'a>,
    noise_std: f32,
    seed: u64,
}

impl<'a> VoxelSweep<'a> {
    pub fn new(
        field: &'a (dyn RadianceField + 'a),
        grid: GridSpec,
        config: &SamplingConfig,
    ) -> Result<Self> {
        Ok(Self {
            grid,
            evaluator: FieldEvaluator::from_config(field, config)?,
            noise_std: config.radiance_field_noise_std,
            seed: config.seed,
        })
    }

    pub fn grid(&self) -> &GridSpec {
        &self.grid
    }

    pub fn batch_size(&self) -> usize {
        self.evaluator.chunksize()
    }

    pub fn batch_count(&self) -> usize {
        self.grid.len().div_ceil(self.batch_size())
    }

    /// Sweeps the whole grid. `progress` receives (points done, points total).
    pub fn run(&self, progress: impl FnMut(usize, usize)) -> Result<VoxelVolume> {
        self.resume_from(VoxelVolume::new(self.grid.clone()), progress)
    }

    /// Continues a sweep from the first unfilled batch of `volume`.
    pub fn resume_from(
        &self,
        mut volume: VoxelVolume,
        progress: impl FnMut(usize, usize),
    ) -> Result<VoxelVolume> {
        if volume.filled > 0 {
            info!(
                "resuming sweep at point {} of {}",
                volume.filled,
                self.grid.len()
            );
        }
        self.advance(&mut volume, usize::MAX, progress)?;
        Ok(volume)
    }

    /// Fills at most `max_batches` further batches of `volume`.
    pub fn advance(
        &self,
        volume: &mut VoxelVolume,
        max_batches: usize,
        mut progress: impl FnMut(usize, usize),
    ) -> Result<()> {
        if volume.grid() != &self.grid {
            return Err(NerfError::config("volume was allocated for a different grid"));
        }
        let batch_size = self.batch_size();
        if volume.filled % batch_size != 0 && !volume.is_complete() {
            return Err(NerfError::geometry(format!(
                "volume filled to {}, not a multiple of the batch size {batch_size}",
                volume.filled
            )));
        }

        let first = volume.filled / batch_size;
        let last = self.batch_count().min(first.saturating_add(max_batches));
        for batch in first..last {
            let voxels = self.sweep_batch(batch)?;
            volume.write(batch * batch_size, &voxels)?;
            progress(volume.filled, self.grid.len());
        }
        Ok(())
    }

    fn sweep_batch(&self, batch: usize) -> Result<Vec<Voxel>> {
        let start = batch * self.batch_size();
        let end = (start + self.batch_size()).min(self.grid.len());
        let points = self.grid.points(start, end)?;
        let outputs = self.evaluator.evaluate(&points, None)?;
        debug!("swept batch {batch} (points {start}..{end})");

        let compositor = Compositor {
            white_background: false,
            noise_std: self.noise_std,
        };
        Ok(outputs
            .into_iter()
            .enumerate()
            .map(|(offset, out)| {
                // One stream per grid point, so the batch size never changes the noise.
                let density = if self.noise_std > 0.0 {
                    let mut rng = stream_rng(self.seed, start + offset);
                    compositor.perturb_density(out.raw_density, &mut rng)
                } else {
                    out.raw_density
                };
                Voxel {
                    density: out.density,
                    opacity: alpha_from_density(density, 1.0),
                    color: out.color,
                    uncertainty: out.uncertainty,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::ConstantField;

    fn assert_close(label: &str, expected: f32, actual: f32) {
        let diff = (expected - actual).abs();
        assert!(
            diff <= 1e-4,
            "{label} mismatch: expected {expected} got {actual} (diff {diff})"
        );
    }

    /// Opaque slab between z = 3 and z = 4, tinted by height.
    struct Slab;

    impl RadianceField for Slab {
        fn query(
            &self,
            positions: &[Vec3],
            _directions: Option<&[Vec3]>,
        ) -> Result<Vec<FieldOutput>> {
            Ok(positions
                .iter()
                .map(|p| {
                    let inside = (3.0..4.0).contains(&p.z);
                    FieldOutput::new(
                        Vec3::new(0.2, 0.4, (p.y + 1.0) * 0.5),
                        if inside { 20.0 } else { 0.0 },
                        if inside { 0.3 } else { 5.0 },
                    )
                })
                .collect())
        }
    }

    fn config() -> SamplingConfig {
        SamplingConfig {
            num_coarse: 32,
            num_fine: 32,
            chunksize: 100,
            ..SamplingConfig::default()
        }
    }

    fn forward_ray() -> Ray {
        Ray::new(Vec3::ZERO, Vec3::new(0.0, 0.0, 1.0), 2.0, 6.0).unwrap()
    }

    #[test]
    fn fine_pass_lands_on_the_slab() {
        let renderer = Renderer::new(&Slab, None, &config()).unwrap();
        let rendered = renderer.render_rays(&[forward_ray()], 0).unwrap();
        let fine = rendered[0].fine.as_ref().unwrap();
        assert_eq!(fine.weights.len(), 64);
        assert_close("opacity", 1.0, fine.opacity);
        assert_close("uncertainty", 0.3, fine.uncertainty);
        assert!((3.0..3.2).contains(&fine.depth), "depth {}", fine.depth);
    }

    #[test]
    fn coarse_only_without_fine_samples() {
        let config = SamplingConfig {
            num_fine: 0,
            ..config()
        };
        let renderer = Renderer::new(&Slab, None, &config).unwrap();
        let rendered = renderer.render_rays(&[forward_ray()], 0).unwrap();
        assert!(rendered[0].fine.is_none());
        assert_eq!(rendered[0].output().weights.len(), 32);
    }

    #[test]
    fn perturbed_renders_are_reproducible_per_ray_index() {
        let config = SamplingConfig {
            perturb: true,
            radiance_field_noise_std: 1.0,
            ..config()
        };
        let renderer = Renderer::new(&Slab, None, &config).unwrap();
        let rays = vec![forward_ray(); 3];
        let all = renderer.render_rays(&rays, 10).unwrap();
        let single = renderer.render_rays(&rays[2..], 12).unwrap();
        assert_eq!(all[2].output(), single[0].output());
        assert_ne!(all[0].output().weights, all[1].output().weights);
    }

    #[test]
    fn image_buffers_match_camera_size() {
        let camera = Camera::new(
            Vec3::ZERO,
            Vec3::new(0.0, 0.0, 1.0),
            Vec3::new(0.0, 1.0, 0.0),
            10,
            9,
            20.0,
            2.0,
            6.0,
        )
        .unwrap();
        let renderer = Renderer::new(&Slab, None, &config()).unwrap().without_noise();
        let mut calls = Vec::new();
        let image = renderer
            .render_image(&camera, |done, total| calls.push((done, total)))
            .unwrap();
        assert_eq!(image.rgb.len(), 90);
        assert_eq!(image.uncertainty.len(), 90);
        assert_eq!(calls.last(), Some(&(90, 90)));
        assert_eq!(calls.len(), 2);

        // Rows further up see a larger y and so a bluer slab.
        assert!(image.rgb[0].z > image.rgb[80].z);
        let (mean, std) = image.uncertainty_stats();
        assert!((mean - 0.3).abs() < 1e-3 && std < 1e-3);
    }

    fn small_grid() -> GridSpec {
        GridSpec::new(Vec3::splat(-1.0), Vec3::splat(1.0), [4, 3, 5]).unwrap()
    }

    #[test]
    fn sweep_is_deterministic_and_complete() {
        let field = ConstantField(FieldOutput::new(Vec3::new(0.1, 0.2, 0.3), 2.0, 0.4));
        let config = SamplingConfig {
            chunksize: 7,
            radiance_field_noise_std: 0.5,
            seed: 9,
            ..SamplingConfig::default()
        };
        let sweep = VoxelSweep::new(&field, small_grid(), &config).unwrap();
        assert_eq!(sweep.batch_count(), 9);
        let a = sweep.run(|_, _| {}).unwrap();
        let b = sweep.run(|_, _| {}).unwrap();
        assert!(a.is_complete());
        assert_eq!(a.opacity, b.opacity);
        assert!(a.uncertainty.iter().all(|&u| u == 0.4));
        assert!(a.opacity.iter().any(|&o| o != a.opacity[0]));
    }

    #[test]
    fn noiseless_opacity_uses_unit_step() {
        let field = ConstantField(FieldOutput::new(Vec3::ONE, 1.0, 0.0));
        let sweep = VoxelSweep::new(&field, small_grid(), &config()).unwrap();
        let volume = sweep.run(|_, _| {}).unwrap();
        assert!(volume
            .opacity
            .iter()
            .all(|&o| (o - (1.0 - (-1.0f32).exp())).abs() < 1e-6));
    }

    #[test]
    fn resumed_sweep_matches_full_sweep() {
        let config = SamplingConfig {
            chunksize: 8,
            radiance_field_noise_std: 0.3,
            seed: 4,
            ..SamplingConfig::default()
        };
        let sweep = VoxelSweep::new(&Slab, small_grid(), &config).unwrap();
        let full = sweep.run(|_, _| {}).unwrap();

        let mut partial = VoxelVolume::new(small_grid());
        sweep.advance(&mut partial, 3, |_, _| {}).unwrap();
        assert_eq!(partial.filled, 24);
        assert!(!partial.is_complete());
        let resumed = sweep.resume_from(partial, |_, _| {}).unwrap();
        assert_eq!(resumed.opacity, full.opacity);
        assert_eq!(resumed.color, full.color);
    }

    #[test]
    fn sweep_noise_does_not_depend_on_batch_size() {
        let run = |chunksize| {
            let config = SamplingConfig {
                chunksize,
                radiance_field_noise_std: 0.5,
                seed: 13,
                ..SamplingConfig::default()
            };
            VoxelSweep::new(&Slab, small_grid(), &config)
                .unwrap()
                .run(|_, _| {})
                .unwrap()
        };
        let small = run(7);
        let large = run(16);
        assert_eq!(small.opacity, large.opacity);
        assert!(small.opacity.iter().any(|&o| o > 0.0));
    }

    #[test]
    fn negative_density_stays_transparent_under_noise() {
        let field = ConstantField(FieldOutput::new(Vec3::ONE, -20.0, 0.1));
        let config = SamplingConfig {
            chunksize: 7,
            radiance_field_noise_std: 1.0,
            seed: 2,
            ..SamplingConfig::default()
        };
        let volume = VoxelSweep::new(&field, small_grid(), &config)
            .unwrap()
            .run(|_, _| {})
            .unwrap();
        assert!(volume.density.iter().all(|&d| d == 0.0));
        assert!(volume.opacity.iter().all(|&o| o == 0.0));
    }

    #[test]
    fn sweep_honours_memory_budget() {
        let model = crate::config::ModelConfig {
            num_layers: 2,
            hidden_size: 8,
            num_encoding_fn_xyz: 2,
            num_encoding_fn_dir: 1,
            ..Default::default()
        };
        let network = crate::network::Network::random(&model, &mut StdRng::seed_from_u64(3)).unwrap();
        let field = crate::field::NeuralField::new(network, &model).unwrap();
        assert!(field.bytes_per_row() > 0);
        let config = SamplingConfig {
            chunksize: 16,
            memory_budget: Some(field.bytes_per_row() * 8),
            ..SamplingConfig::default()
        };
        let sweep = VoxelSweep::new(&field, small_grid(), &config).unwrap();
        assert!(matches!(
            sweep.run(|_, _| {}),
            Err(NerfError::ResourceExhausted(_))
        ));
        let config = SamplingConfig {
            chunksize: 8,
            ..config
        };
        let sweep = VoxelSweep::new(&field, small_grid(), &config).unwrap();
        assert!(sweep.run(|_, _| {}).unwrap().is_complete());
    }

    #[test]
    fn sweep_rejects_foreign_volume() {
        let sweep = VoxelSweep::new(&Slab, small_grid(), &config()).unwrap();
        let other = GridSpec::new(Vec3::ZERO, Vec3::ONE, [2, 2, 2]).unwrap();
        assert!(matches!(
            sweep.resume_from(VoxelVolume::new(other), |_, _| {}),
            Err(NerfError::Configuration(_))
        ));
    }
}
