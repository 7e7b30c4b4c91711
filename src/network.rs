use crate::config::ModelConfig;
use crate::error::{NerfError, Result};
use crate::field::FieldOutput;
use crate::vec3::Vec3;
use rand::Rng;

/// Dense kernel stored input-major: `elements[in_idx * cols + out_idx]`.
#[derive(Clone, Debug)]
pub struct Matrix {
    elements: Vec<f32>,
    rows: usize,
    cols: usize,
}

impl Matrix {
    pub fn new(elements: Vec<f32>, rows: usize, cols: usize) -> Result<Self> {
        if elements.len() != rows * cols {
            return Err(NerfError::config(format!(
                "matrix {rows}x{cols} needs {} elements, got {}",
                rows * cols,
                elements.len()
            )));
        }
        Ok(Self {
            elements,
            rows,
            cols,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activation {
    ReLU,
    Sigmoid,
    Softplus,
    None,
}

impl Activation {
    fn apply(self, x: f32) -> f32 {
        match self {
            Activation::ReLU => x.max(0.0),
            Activation::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            // log(1 + e^x) without overflow for large x
            Activation::Softplus => x.max(0.0) + (-x.abs()).exp().ln_1p(),
            Activation::None => x,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Layer {
    weight: Matrix,
    bias: Vec<f32>,
}

impl Layer {
    pub fn new(weight: Matrix, bias: Vec<f32>) -> Result<Self> {
        if bias.len() != weight.cols {
            return Err(NerfError::config(format!(
                "bias of length {} does not match {} output features",
                bias.len(),
                weight.cols
            )));
        }
        Ok(Self { weight, bias })
    }

    /// Uniform Glorot initialisation, for synthetic fields in tests and tooling.
    pub fn random(rng: &mut impl Rng, in_features: usize, out_features: usize) -> Self {
        let limit = (6.0 / (in_features + out_features) as f32).sqrt();
        let elements = (0..in_features * out_features)
            .map(|_| rng.gen_range(-limit..limit))
            .collect();
        let bias = (0..out_features).map(|_| rng.gen_range(-0.1..0.1)).collect();
        Self {
            weight: Matrix {
                elements,
                rows: in_features,
                cols: out_features,
            },
            bias,
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.rows
    }

    pub fn out_features(&self) -> usize {
        self.weight.cols
    }

    pub fn kernel(&self) -> &[f32] {
        &self.weight.elements
    }

    pub fn bias(&self) -> &[f32] {
        &self.bias
    }

    fn forward(&self, h: &[f32], act: Activation) -> Vec<f32> {
        let rows = self.weight.rows;
        let cols = self.weight.cols;
        debug_assert_eq!(h.len(), rows, "layer input width mismatch");
        let mut result = self.bias.clone();

        for (in_idx, &h_val) in h.iter().enumerate().take(rows) {
            if h_val == 0.0 {
                continue;
            }
            let row = &self.weight.elements[in_idx * cols..(in_idx + 1) * cols];
            for (acc, w) in result.iter_mut().zip(row) {
                *acc += w * h_val;
            }
        }

        for x in result.iter_mut() {
            *x = act.apply(*x);
        }
        result
    }
}

/// Trunk layer `i` (0-based, after the input layer) takes the original
/// position encoding concatenated to its input when this returns true.
pub fn is_skip_layer(i: usize, skip_connect_every: usize, trunk_len: usize) -> bool {
    skip_connect_every > 0 && i > 0 && i % skip_connect_every == 0 && i + 1 != trunk_len
}

/// Heads fed by the trunk. With view directions the color branch sees a
/// feature projection of the trunk plus the encoded direction.
#[derive(Clone, Debug)]
pub enum ColorHead {
    ViewDependent {
        feature: Layer,
        hidden: Layer,
        rgb: Layer,
    },
    Direct {
        rgb: Layer,
    },
}

/// Single-pass MLP predicting color, density and uncertainty.
#[derive(Clone, Debug)]
pub struct Network {
    input: Layer,
    trunk: Vec<Layer>,
    skip_connect_every: usize,
    alpha: Layer,
    uncertainty: Layer,
    color: ColorHead,
    dim_xyz: usize,
    dim_dir: usize,
}

impl Network {
    pub fn new(
        input: Layer,
        trunk: Vec<Layer>,
        skip_connect_every: usize,
        alpha: Layer,
        uncertainty: Layer,
        color: ColorHead,
    ) -> Result<Self> {
        let dim_xyz = input.in_features();
        let hidden = input.out_features();
        let trunk_len = trunk.len();

        for (i, layer) in trunk.iter().enumerate() {
            let expected = if is_skip_layer(i, skip_connect_every, trunk_len) {
                hidden + dim_xyz
            } else {
                hidden
            };
            check_shape(&format!("trunk layer {i}"), layer, expected, hidden)?;
        }
        check_shape("alpha head", &alpha, hidden, 1)?;
        check_shape("uncertainty head", &uncertainty, hidden, 1)?;

        let dim_dir = match &color {
            ColorHead::ViewDependent {
                feature,
                hidden: dir_layer,
                rgb,
            } => {
                check_shape("feature layer", feature, hidden, hidden)?;
                if dir_layer.in_features() < hidden {
                    return Err(NerfError::config(format!(
                        "direction layer takes {} inputs, fewer than the {hidden} trunk features",
                        dir_layer.in_features()
                    )));
                }
                check_shape("rgb head", rgb, dir_layer.out_features(), 3)?;
                dir_layer.in_features() - hidden
            }
            ColorHead::Direct { rgb } => {
                check_shape("rgb head", rgb, hidden, 3)?;
                0
            }
        };

        Ok(Self {
            input,
            trunk,
            skip_connect_every,
            alpha,
            uncertainty,
            color,
            dim_xyz,
            dim_dir,
        })
    }

    /// Randomly initialised network with the layout `config` describes.
    pub fn random(config: &ModelConfig, rng: &mut impl Rng) -> Result<Self> {
        let (dim_xyz, dim_dir) = encoded_dims(config);
        let hidden = config.hidden_size;
        let trunk_len = config.num_layers.saturating_sub(1);
        let trunk = (0..trunk_len)
            .map(|i| {
                let width = if is_skip_layer(i, config.skip_connect_every, trunk_len) {
                    hidden + dim_xyz
                } else {
                    hidden
                };
                Layer::random(&mut *rng, width, hidden)
            })
            .collect();
        let input = Layer::random(rng, dim_xyz, hidden);
        let alpha = Layer::random(rng, hidden, 1);
        let uncertainty = Layer::random(rng, hidden, 1);
        let color = if config.use_viewdirs {
            ColorHead::ViewDependent {
                feature: Layer::random(rng, hidden, hidden),
                hidden: Layer::random(rng, hidden + dim_dir, hidden / 2),
                rgb: Layer::random(rng, hidden / 2, 3),
            }
        } else {
            ColorHead::Direct {
                rgb: Layer::random(rng, hidden, 3),
            }
        };
        Self::new(
            input,
            trunk,
            config.skip_connect_every,
            alpha,
            uncertainty,
            color,
        )
    }

    pub fn dim_xyz(&self) -> usize {
        self.dim_xyz
    }

    pub fn dim_dir(&self) -> usize {
        self.dim_dir
    }

    pub fn hidden_size(&self) -> usize {
        self.input.out_features()
    }

    /// Every layer under its checkpoint tensor prefix.
    pub fn named_layers(&self) -> Vec<(String, &Layer)> {
        let mut layers = vec![("layer1".to_string(), &self.input)];
        for (i, layer) in self.trunk.iter().enumerate() {
            layers.push((format!("layers_xyz.{i}"), layer));
        }
        layers.push(("fc_alpha".to_string(), &self.alpha));
        layers.push(("fc_uncertainty".to_string(), &self.uncertainty));
        match &self.color {
            ColorHead::ViewDependent {
                feature,
                hidden,
                rgb,
            } => {
                layers.push(("fc_feat".to_string(), feature));
                layers.push(("layers_dir.0".to_string(), hidden));
                layers.push(("fc_rgb".to_string(), rgb));
            }
            ColorHead::Direct { rgb } => layers.push(("fc_rgb".to_string(), rgb)),
        }
        layers
    }

    /// Evaluates one encoded sample. Without view dependence `dir_enc` must be empty.
    pub fn forward(&self, xyz_enc: &[f32], dir_enc: &[f32]) -> Result<FieldOutput> {
        if xyz_enc.len() != self.dim_xyz || dir_enc.len() != self.dim_dir {
            return Err(NerfError::config(format!(
                "sample has {} position and {} direction features, network expects {} and {}",
                xyz_enc.len(),
                dir_enc.len(),
                self.dim_xyz,
                self.dim_dir
            )));
        }
        Ok(self.forward_unchecked(xyz_enc, dir_enc))
    }

    fn forward_unchecked(&self, xyz_enc: &[f32], dir_enc: &[f32]) -> FieldOutput {
        let mut h = self.input.forward(xyz_enc, Activation::ReLU);
        let trunk_len = self.trunk.len();
        for (i, layer) in self.trunk.iter().enumerate() {
            if is_skip_layer(i, self.skip_connect_every, trunk_len) {
                h = concat(&h, xyz_enc);
            }
            h = layer.forward(&h, Activation::ReLU);
        }

        // Density noise is added before the clamp, so the raw value is kept.
        let raw_density = self.alpha.forward(&h, Activation::None)[0];
        let uncertainty = self.uncertainty.forward(&h, Activation::Softplus)[0];
        let c = match &self.color {
            ColorHead::ViewDependent {
                feature,
                hidden,
                rgb,
            } => {
                let feat = feature.forward(&h, Activation::ReLU);
                let q = concat(&feat, dir_enc);
                let c_hidden = hidden.forward(&q, Activation::ReLU);
                rgb.forward(&c_hidden, Activation::Sigmoid)
            }
            ColorHead::Direct { rgb } => rgb.forward(&h, Activation::Sigmoid),
        };

        FieldOutput {
            color: Vec3::new(c[0], c[1], c[2]),
            density: Activation::ReLU.apply(raw_density),
            raw_density,
            uncertainty,
        }
    }

    /// Row-major batch of encoded inputs; one output per row, in order.
    pub fn forward_batch(&self, xyz_enc: &[f32], dir_enc: &[f32]) -> Result<Vec<FieldOutput>> {
        if self.dim_xyz == 0 || xyz_enc.len() % self.dim_xyz != 0 {
            return Err(NerfError::config(format!(
                "{} position features is not a whole number of rows of {}",
                xyz_enc.len(),
                self.dim_xyz
            )));
        }
        let rows = xyz_enc.len() / self.dim_xyz;
        if dir_enc.len() != rows * self.dim_dir {
            return Err(NerfError::config(format!(
                "{} direction features for {rows} rows of {}",
                dir_enc.len(),
                self.dim_dir
            )));
        }
        Ok((0..rows)
            .map(|r| {
                let xyz = &xyz_enc[r * self.dim_xyz..(r + 1) * self.dim_xyz];
                let dir = &dir_enc[r * self.dim_dir..(r + 1) * self.dim_dir];
                self.forward_unchecked(xyz, dir)
            })
            .collect())
    }
}

/// Encoded (position, direction) widths implied by a model configuration.
pub fn encoded_dims(config: &ModelConfig) -> (usize, usize) {
    let raw_xyz = if config.include_input_xyz { 3 } else { 0 };
    let raw_dir = if config.include_input_dir { 3 } else { 0 };
    let dim_xyz = raw_xyz + 2 * 3 * config.num_encoding_fn_xyz;
    let dim_dir = if config.use_viewdirs {
        raw_dir + 2 * 3 * config.num_encoding_fn_dir
    } else {
        0
    };
    (dim_xyz, dim_dir)
}

fn check_shape(label: &str, layer: &Layer, inputs: usize, outputs: usize) -> Result<()> {
    if layer.in_features() != inputs || layer.out_features() != outputs {
        return Err(NerfError::config(format!(
            "{label} is {}x{}, expected {inputs}x{outputs}",
            layer.in_features(),
            layer.out_features()
        )));
    }
    Ok(())
}

fn concat(a: &[f32], b: &[f32]) -> Vec<f32> {
    let mut result = Vec::with_capacity(a.len() + b.len());
    result.extend_from_slice(a);
    result.extend_from_slice(b);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn small_config() -> ModelConfig {
        ModelConfig {
            num_layers: 6,
            hidden_size: 8,
            skip_connect_every: 2,
            num_encoding_fn_xyz: 2,
            num_encoding_fn_dir: 1,
            ..ModelConfig::default()
        }
    }

    #[test]
    fn skip_rule_matches_stride() {
        // trunk of 5 layers with stride 2: layers 2 and 4, but 4 is last
        let skips: Vec<usize> = (0..5).filter(|&i| is_skip_layer(i, 2, 5)).collect();
        assert_eq!(skips, vec![2]);
        let skips: Vec<usize> = (0..7).filter(|&i| is_skip_layer(i, 4, 7)).collect();
        assert_eq!(skips, vec![4]);
        assert!(!(0..7).any(|i| is_skip_layer(i, 0, 7)));
    }

    #[test]
    fn skip_layer_width_includes_encoding() {
        let config = small_config();
        let mut rng = StdRng::seed_from_u64(3);
        let net = Network::random(&config, &mut rng).unwrap();
        let (dim_xyz, _) = encoded_dims(&config);
        assert_eq!(net.trunk[2].in_features(), 8 + dim_xyz);
        assert_eq!(net.trunk[1].in_features(), 8);
    }

    #[test]
    fn rejects_mismatched_trunk() {
        let mut rng = StdRng::seed_from_u64(5);
        let input = Layer::random(&mut rng, 15, 8);
        // layer 2 should be a skip layer of width 8 + 15
        let trunk = vec![
            Layer::random(&mut rng, 8, 8),
            Layer::random(&mut rng, 8, 8),
            Layer::random(&mut rng, 8, 8),
            Layer::random(&mut rng, 8, 8),
        ];
        let err = Network::new(
            input,
            trunk,
            2,
            Layer::random(&mut rng, 8, 1),
            Layer::random(&mut rng, 8, 1),
            ColorHead::Direct {
                rgb: Layer::random(&mut rng, 8, 3),
            },
        )
        .unwrap_err();
        assert!(matches!(err, NerfError::Configuration(_)));
    }

    #[test]
    fn outputs_respect_activation_ranges() {
        let config = small_config();
        let mut rng = StdRng::seed_from_u64(11);
        let net = Network::random(&config, &mut rng).unwrap();
        let (dim_xyz, dim_dir) = encoded_dims(&config);
        for _ in 0..32 {
            let xyz: Vec<f32> = (0..dim_xyz).map(|_| rng.gen_range(-2.0..2.0)).collect();
            let dir: Vec<f32> = (0..dim_dir).map(|_| rng.gen_range(-1.0..1.0)).collect();
            let out = net.forward(&xyz, &dir).unwrap();
            assert!(out.density >= 0.0);
            assert_eq!(out.density, out.raw_density.max(0.0));
            assert!(out.uncertainty >= 0.0);
            for c in out.color.to_array() {
                assert!((0.0..=1.0).contains(&c));
            }
        }
    }

    #[test]
    fn mismatched_inputs_are_configuration_errors() {
        let config = small_config();
        let mut rng = StdRng::seed_from_u64(13);
        let net = Network::random(&config, &mut rng).unwrap();
        let (dim_xyz, dim_dir) = encoded_dims(&config);
        let xyz = vec![0.1; 2 * dim_xyz + 1];
        let dir = vec![0.2; 2 * dim_dir];

        // trailing partial position row
        assert!(matches!(
            net.forward_batch(&xyz, &dir),
            Err(NerfError::Configuration(_))
        ));
        // direction rows missing for the second sample
        assert!(matches!(
            net.forward_batch(&xyz[..2 * dim_xyz], &dir[..dim_dir]),
            Err(NerfError::Configuration(_))
        ));
        assert!(matches!(
            net.forward(&xyz[..dim_xyz], &dir[..dim_dir - 1]),
            Err(NerfError::Configuration(_))
        ));
        assert_eq!(net.forward_batch(&xyz[..2 * dim_xyz], &dir).unwrap().len(), 2);
    }

    #[test]
    fn negative_alpha_bias_keeps_raw_density() {
        let mut rng = StdRng::seed_from_u64(2);
        let zeros = |rows: usize, cols: usize| Matrix::new(vec![0.0; rows * cols], rows, cols).unwrap();
        let net = Network::new(
            Layer::random(&mut rng, 3, 4),
            Vec::new(),
            0,
            Layer::new(zeros(4, 1), vec![-10.0]).unwrap(),
            Layer::random(&mut rng, 4, 1),
            ColorHead::Direct {
                rgb: Layer::random(&mut rng, 4, 3),
            },
        )
        .unwrap();
        let out = net.forward(&[0.3, -0.2, 0.5], &[]).unwrap();
        assert_eq!(out.raw_density, -10.0);
        assert_eq!(out.density, 0.0);
    }

    #[test]
    fn softplus_is_stable() {
        assert!((Activation::Softplus.apply(0.0) - 2f32.ln()).abs() < 1e-6);
        assert_eq!(Activation::Softplus.apply(100.0), 100.0);
        assert!(Activation::Softplus.apply(-100.0) >= 0.0);
    }
}
