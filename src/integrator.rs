use crate::camera::Ray;
use crate::config::SamplingConfig;
use crate::error::{NerfError, Result};
use crate::field::FieldOutput;
use crate::vec3::Vec3;
use rand::Rng;
use rand_distr::StandardNormal;

/// Step length used after the last sample, so the final sample absorbs
/// whatever transmittance is left.
pub const LAST_INTERVAL: f32 = 1e10;

/// Emission-absorption compositing parameters.
#[derive(Clone, Debug)]
pub struct Compositor {
    pub white_background: bool,
    pub noise_std: f32,
}

/// Result of compositing one ray.
#[derive(Clone, Debug, PartialEq)]
pub struct RayAccumulation {
    pub color: Vec3,
    /// Sum of the sample weights, in [0, 1].
    pub opacity: f32,
    pub uncertainty: f32,
    /// Expected termination depth, `sum(w_i * t_i)`.
    pub depth: f32,
    pub disparity: f32,
    /// Per-sample weights `T_i * alpha_i`.
    pub weights: Vec<f32>,
}

impl Compositor {
    pub fn from_config(config: &SamplingConfig) -> Self {
        Self {
            white_background: config.white_background,
            noise_std: config.radiance_field_noise_std,
        }
    }

    /// Same settings without density noise, for validation renders.
    pub fn without_noise(&self) -> Self {
        Self {
            noise_std: 0.0,
            ..self.clone()
        }
    }

    pub fn background(&self) -> Vec3 {
        if self.white_background {
            Vec3::ONE
        } else {
            Vec3::ZERO
        }
    }

    /// Composites samples taken at ascending `depths` along `ray`.
    pub fn composite<R: Rng + ?Sized>(
        &self,
        ray: &Ray,
        depths: &[f32],
        samples: &[FieldOutput],
        rng: &mut R,
    ) -> Result<RayAccumulation> {
        if depths.len() != samples.len() {
            return Err(NerfError::geometry(format!(
                "{} depths but {} field samples",
                depths.len(),
                samples.len()
            )));
        }
        let scale = ray.direction().length();
        let n = depths.len();

        let mut weights = Vec::with_capacity(n);
        let mut transmittance = 1.0f32;
        let mut color = Vec3::ZERO;
        let mut opacity = 0.0f32;
        let mut uncertainty = 0.0f32;
        let mut depth = 0.0f32;

        for i in 0..n {
            let delta = if i + 1 < n {
                (depths[i + 1] - depths[i]).max(0.0)
            } else {
                LAST_INTERVAL
            };
            let density = self.perturb_density(samples[i].raw_density, rng);
            let alpha = alpha_from_density(density, delta * scale);
            let w = transmittance * alpha;
            transmittance *= 1.0 - alpha;

            color += samples[i].color * w;
            uncertainty += samples[i].uncertainty * w;
            depth += depths[i] * w;
            opacity += w;
            weights.push(w);
        }

        // Guard against rounding pushing the sum of weights past one.
        let opacity = opacity.min(1.0);
        let color = color + self.background() * (1.0 - opacity);
        let disparity = if opacity > 0.0 {
            1.0 / (depth / opacity).max(1e-10)
        } else {
            0.0
        };

        Ok(RayAccumulation {
            color,
            opacity,
            uncertainty,
            depth,
            disparity,
            weights,
        })
    }

    /// Density with zero-mean Gaussian noise added when `noise_std > 0`.
    pub fn perturb_density<R: Rng + ?Sized>(&self, density: f32, rng: &mut R) -> f32 {
        if self.noise_std > 0.0 {
            let noise: f32 = rng.sample(StandardNormal);
            density + noise * self.noise_std
        } else {
            density
        }
    }
}

/// `1 - exp(-max(density, 0) * step)`.
pub fn alpha_from_density(density: f32, step: f32) -> f32 {
    1.0 - (-density.max(0.0) * step).exp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ray() -> Ray {
        Ray::new(Vec3::ZERO, Vec3::new(0.0, 0.0, 1.0), 2.0, 6.0).unwrap()
    }

    fn sample(density: f32, color: Vec3, uncertainty: f32) -> FieldOutput {
        FieldOutput::new(color, density, uncertainty)
    }

    fn compositor(white: bool, noise_std: f32) -> Compositor {
        Compositor {
            white_background: white,
            noise_std,
        }
    }

    #[test]
    fn empty_space_shows_background() {
        let depths: Vec<f32> = (0..8).map(|i| 2.0 + 0.5 * i as f32).collect();
        let samples = vec![sample(0.0, Vec3::new(0.3, 0.6, 0.9), 0.7); 8];
        let mut rng = StdRng::seed_from_u64(0);

        let acc = compositor(true, 0.0)
            .composite(&ray(), &depths, &samples, &mut rng)
            .unwrap();
        assert_eq!(acc.opacity, 0.0);
        assert!(acc.weights.iter().all(|&w| w == 0.0));
        assert_eq!(acc.color, Vec3::ONE);
        assert_eq!(acc.uncertainty, 0.0);
        assert_eq!(acc.disparity, 0.0);

        let acc = compositor(false, 0.0)
            .composite(&ray(), &depths, &samples, &mut rng)
            .unwrap();
        assert_eq!(acc.color, Vec3::ZERO);
    }

    #[test]
    fn weights_are_bounded_for_random_inputs() {
        let mut rng = StdRng::seed_from_u64(17);
        for _ in 0..50 {
            let mut depths: Vec<f32> = (0..24).map(|_| rng.gen_range(2.0..6.0)).collect();
            depths.sort_by(f32::total_cmp);
            let samples: Vec<FieldOutput> = (0..24)
                .map(|_| sample(rng.gen_range(0.0..50.0), Vec3::splat(0.5), 1.0))
                .collect();
            let acc = compositor(true, 1.0)
                .composite(&ray(), &depths, &samples, &mut rng)
                .unwrap();
            assert!(acc.weights.iter().all(|&w| w >= 0.0));
            assert!(acc.weights.iter().sum::<f32>() <= 1.0 + 1e-6);
            assert!((0.0..=1.0).contains(&acc.opacity));
        }
    }

    #[test]
    fn opaque_first_sample_takes_all_weight() {
        let depths = [2.0, 3.0, 4.0];
        let samples = [
            sample(1e6, Vec3::new(1.0, 0.0, 0.0), 0.25),
            sample(5.0, Vec3::new(0.0, 1.0, 0.0), 0.9),
            sample(5.0, Vec3::new(0.0, 0.0, 1.0), 0.9),
        ];
        let mut rng = StdRng::seed_from_u64(0);
        let acc = compositor(true, 0.0)
            .composite(&ray(), &depths, &samples, &mut rng)
            .unwrap();
        assert_eq!(acc.weights, vec![1.0, 0.0, 0.0]);
        assert_eq!(acc.color, Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(acc.uncertainty, 0.25);
        assert_eq!(acc.depth, 2.0);
        assert_eq!(acc.disparity, 0.5);
    }

    #[test]
    fn step_scales_with_direction_norm() {
        let long = Ray::new(Vec3::ZERO, Vec3::new(0.0, 0.0, 2.0), 2.0, 6.0).unwrap();
        let depths = [2.0, 2.5];
        let samples = [sample(1.0, Vec3::ONE, 0.0); 2];
        let mut rng = StdRng::seed_from_u64(0);
        let acc = compositor(false, 0.0)
            .composite(&long, &depths, &samples, &mut rng)
            .unwrap();
        assert!((acc.weights[0] - (1.0 - (-1.0f32).exp())).abs() < 1e-6);
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let mut rng = StdRng::seed_from_u64(0);
        let err = compositor(true, 0.0)
            .composite(&ray(), &[2.0, 3.0], &[sample(1.0, Vec3::ONE, 0.0)], &mut rng)
            .unwrap_err();
        assert!(matches!(err, NerfError::InvalidGeometry(_)));
    }

    #[test]
    fn noise_is_disabled_at_zero_std() {
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(compositor(true, 0.0).perturb_density(0.3, &mut rng), 0.3);
        let noisy = compositor(true, 0.5).without_noise();
        assert_eq!(noisy.perturb_density(0.3, &mut rng), 0.3);
        assert_eq!(alpha_from_density(-1.0, 1.0), 0.0);
    }

    #[test]
    fn noise_is_added_before_the_density_clamp() {
        let depths: Vec<f32> = (0..16).map(|i| 2.0 + 0.25 * i as f32).collect();
        let samples = vec![sample(-20.0, Vec3::ONE, 0.5); 16];
        assert!(samples.iter().all(|s| s.density == 0.0));
        let mut rng = StdRng::seed_from_u64(6);
        for _ in 0..20 {
            let acc = compositor(false, 1.0)
                .composite(&ray(), &depths, &samples, &mut rng)
                .unwrap();
            assert_eq!(acc.opacity, 0.0);
            assert!(acc.weights.iter().all(|&w| w == 0.0));
        }
    }
}
