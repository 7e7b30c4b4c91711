use crate::error::{NerfError, Result};
use std::f32::consts::PI;

/// Fourier-feature embedding of a fixed-size coordinate vector.
///
/// Layout per input: the raw components (when `include_input`), then for
/// each frequency `f_i` the block `sin(f_i * pi * x)` followed by the block
/// `cos(f_i * pi * x)`.
#[derive(Clone, Debug, PartialEq)]
pub struct PositionalEncoder {
    input_dim: usize,
    include_input: bool,
    frequencies: Vec<f32>,
}

impl PositionalEncoder {
    pub fn new(
        input_dim: usize,
        num_encoding_fns: usize,
        include_input: bool,
        log_sampling: bool,
    ) -> Self {
        let frequencies = if num_encoding_fns == 0 {
            Vec::new()
        } else if log_sampling {
            (0..num_encoding_fns).map(|i| 2f32.powi(i as i32)).collect()
        } else {
            // linspace(2^0, 2^(L-1), L)
            let hi = 2f32.powi(num_encoding_fns as i32 - 1);
            let step = if num_encoding_fns > 1 {
                (hi - 1.0) / (num_encoding_fns - 1) as f32
            } else {
                0.0
            };
            (0..num_encoding_fns).map(|i| 1.0 + step * i as f32).collect()
        };
        Self {
            input_dim,
            include_input,
            frequencies,
        }
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn output_dim(&self) -> usize {
        let raw = if self.include_input { self.input_dim } else { 0 };
        raw + 2 * self.input_dim * self.frequencies.len()
    }

    /// Appends the embedding of `x` to `out`.
    pub fn encode_into(&self, x: &[f32], out: &mut Vec<f32>) -> Result<()> {
        if x.len() != self.input_dim {
            return Err(NerfError::config(format!(
                "encoder expects {} components, got {}",
                self.input_dim,
                x.len()
            )));
        }
        out.reserve(self.output_dim());
        if self.include_input {
            out.extend_from_slice(x);
        }
        for &f in &self.frequencies {
            let scale = f * PI;
            out.extend(x.iter().map(|c| (scale * c).sin()));
            out.extend(x.iter().map(|c| (scale * c).cos()));
        }
        Ok(())
    }

    pub fn encode(&self, x: &[f32]) -> Result<Vec<f32>> {
        let mut out = Vec::with_capacity(self.output_dim());
        self.encode_into(x, &mut out)?;
        Ok(out)
    }

    /// Encodes a row-major batch of `input_dim`-sized rows.
    pub fn encode_batch(&self, rows: &[f32]) -> Result<Vec<f32>> {
        if self.input_dim == 0 || rows.len() % self.input_dim != 0 {
            return Err(NerfError::config(format!(
                "batch of {} values is not a multiple of {}",
                rows.len(),
                self.input_dim
            )));
        }
        let n = rows.len() / self.input_dim;
        let mut out = Vec::with_capacity(n * self.output_dim());
        for row in rows.chunks_exact(self.input_dim) {
            self.encode_into(row, &mut out)?;
        }
        Ok(out)
    }
}
