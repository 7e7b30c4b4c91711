use crate::config::{ModelConfig, SamplingConfig};
use crate::encoding::PositionalEncoder;
use crate::error::{NerfError, Result};
use crate::network::Network;
use crate::vec3::Vec3;
use log::debug;
use rayon::prelude::*;

/// Activated field prediction for one sample.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FieldOutput {
    pub color: Vec3,
    /// `max(raw_density, 0)`.
    pub density: f32,
    /// Density head output before the non-negative clamp. Noise is added here.
    pub raw_density: f32,
    pub uncertainty: f32,
}

impl FieldOutput {
    /// Output whose raw density is already non-negative.
    pub fn new(color: Vec3, density: f32, uncertainty: f32) -> Self {
        Self {
            color,
            density: density.max(0.0),
            raw_density: density,
            uncertainty,
        }
    }
}

/// Anything that maps points (and optionally view directions) to
/// color, density and uncertainty in a single deterministic pass.
pub trait RadianceField: Sync {
    /// `directions` is `None` for direction-free queries, otherwise it has one
    /// entry per position.
    fn query(&self, positions: &[Vec3], directions: Option<&[Vec3]>) -> Result<Vec<FieldOutput>>;

    /// Approximate working memory needed per query row.
    fn bytes_per_row(&self) -> usize {
        0
    }
}

/// Trained MLP together with the encoders its input layer expects.
pub struct NeuralField {
    network: Network,
    xyz_encoder: PositionalEncoder,
    dir_encoder: Option<PositionalEncoder>,
}

impl NeuralField {
    pub fn new(network: Network, config: &ModelConfig) -> Result<Self> {
        let xyz_encoder = PositionalEncoder::new(
            3,
            config.num_encoding_fn_xyz,
            config.include_input_xyz,
            config.log_sampling_xyz,
        );
        let dir_encoder = config.use_viewdirs.then(|| {
            PositionalEncoder::new(
                3,
                config.num_encoding_fn_dir,
                config.include_input_dir,
                config.log_sampling_dir,
            )
        });

        if xyz_encoder.output_dim() != network.dim_xyz() {
            return Err(NerfError::config(format!(
                "position encoding has {} features but the network expects {}",
                xyz_encoder.output_dim(),
                network.dim_xyz()
            )));
        }
        let dim_dir = dir_encoder.as_ref().map_or(0, |e| e.output_dim());
        if dim_dir != network.dim_dir() {
            return Err(NerfError::config(format!(
                "direction encoding has {dim_dir} features but the network expects {}",
                network.dim_dir()
            )));
        }

        Ok(Self {
            network,
            xyz_encoder,
            dir_encoder,
        })
    }

    pub fn network(&self) -> &Network {
        &self.network
    }
}

impl RadianceField for NeuralField {
    fn query(&self, positions: &[Vec3], directions: Option<&[Vec3]>) -> Result<Vec<FieldOutput>> {
        if let Some(dirs) = directions {
            if dirs.len() != positions.len() {
                return Err(NerfError::config(format!(
                    "{} positions but {} directions",
                    positions.len(),
                    dirs.len()
                )));
            }
        }

        let mut xyz_enc = Vec::with_capacity(positions.len() * self.network.dim_xyz());
        for p in positions {
            self.xyz_encoder.encode_into(&p.to_array(), &mut xyz_enc)?;
        }

        let dim_dir = self.network.dim_dir();
        let dir_enc = match (&self.dir_encoder, directions) {
            (Some(encoder), Some(dirs)) => {
                let mut out = Vec::with_capacity(dirs.len() * dim_dir);
                for d in dirs {
                    encoder.encode_into(&d.to_array(), &mut out)?;
                }
                out
            }
            // Direction-free queries feed an all-zero direction embedding.
            (Some(_), None) => vec![0.0; positions.len() * dim_dir],
            (None, _) => Vec::new(),
        };

        self.network.forward_batch(&xyz_enc, &dir_enc)
    }

    fn bytes_per_row(&self) -> usize {
        let n = &self.network;
        (n.dim_xyz() + n.dim_dir() + 2 * n.hidden_size()) * std::mem::size_of::<f32>()
    }
}

/// Same output everywhere. Handy as an analytic reference field.
#[derive(Clone, Copy, Debug)]
pub struct ConstantField(pub FieldOutput);

impl RadianceField for ConstantField {
    fn query(&self, positions: &[Vec3], _directions: Option<&[Vec3]>) -> Result<Vec<FieldOutput>> {
        Ok(vec![self.0; positions.len()])
    }
}

/// Splits large queries into `chunksize` rows, evaluates the chunks in
/// parallel and concatenates them in the original order.
pub struct FieldEvaluator<'a, F: RadianceField + ?Sized> {
    field: &'a F,
    chunksize: usize,
    memory_budget: Option<usize>,
}

impl<'a, F: RadianceField + ?Sized> FieldEvaluator<'a, F> {
    pub fn new(field: &'a F, chunksize: usize) -> Result<Self> {
        if chunksize == 0 {
            return Err(NerfError::config("chunksize must be positive"));
        }
        Ok(Self {
            field,
            chunksize,
            memory_budget: None,
        })
    }

    /// Evaluator with the configured chunk size and optional memory budget.
    pub fn from_config(field: &'a F, config: &SamplingConfig) -> Result<Self> {
        let evaluator = Self::new(field, config.chunksize)?;
        Ok(match config.memory_budget {
            Some(bytes) => evaluator.with_memory_budget(bytes),
            None => evaluator,
        })
    }

    /// Upper bound in bytes for a single chunk's working set.
    pub fn with_memory_budget(mut self, bytes: usize) -> Self {
        self.memory_budget = Some(bytes);
        self
    }

    pub fn chunksize(&self) -> usize {
        self.chunksize
    }

    pub fn field(&self) -> &'a F {
        self.field
    }

    pub fn evaluate(
        &self,
        positions: &[Vec3],
        directions: Option<&[Vec3]>,
    ) -> Result<Vec<FieldOutput>> {
        if let Some(dirs) = directions {
            if dirs.len() != positions.len() {
                return Err(NerfError::config(format!(
                    "{} positions but {} directions",
                    positions.len(),
                    dirs.len()
                )));
            }
        }
        if let Some(budget) = self.memory_budget {
            let needed = self.chunksize.min(positions.len()) * self.field.bytes_per_row();
            if needed > budget {
                return Err(NerfError::ResourceExhausted(format!(
                    "chunk of {} rows needs {needed} bytes, budget is {budget}",
                    self.chunksize
                )));
            }
        }

        let chunk_count = positions.len().div_ceil(self.chunksize);
        debug!(
            "evaluating {} samples in {chunk_count} chunks of {}",
            positions.len(),
            self.chunksize
        );

        let chunks: Vec<Vec<FieldOutput>> = (0..chunk_count)
            .into_par_iter()
            .map(|c| {
                let start = c * self.chunksize;
                let end = (start + self.chunksize).min(positions.len());
                let dirs = directions.map(|d| &d[start..end]);
                let out = self.field.query(&positions[start..end], dirs)?;
                if out.len() != end - start {
                    return Err(NerfError::config(format!(
                        "field returned {} rows for a chunk of {}",
                        out.len(),
                        end - start
                    )));
                }
                Ok(out)
            })
            .collect::<Result<_>>()?;

        Ok(chunks.into_iter().flatten().collect())
    }
}
