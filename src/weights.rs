//! Trained weights as a directory of raw tensors.
//!
//! `shapes.txt` lists one tensor per line as `name dim0 [dim1 ...]`; each
//! tensor is stored next to it as `name.bin`, little-endian f32. Dense
//! layers are split into `<prefix>_kernel` (inputs x outputs) and
//! `<prefix>_bias`.

use crate::config::ModelConfig;
use crate::error::{NerfError, Result};
use crate::network::{ColorHead, Layer, Matrix, Network};
use log::{debug, info};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

type Params = HashMap<String, (Vec<usize>, Vec<f32>)>;

fn weights_error(name: &str, reason: impl Into<String>) -> NerfError {
    NerfError::Weights {
        name: name.to_string(),
        reason: reason.into(),
    }
}

fn load_tensor(path: &Path, name: &str, dims: &[usize]) -> Result<Vec<f32>> {
    let bytes = fs::read(path)?;
    if bytes.len() % 4 != 0 {
        return Err(weights_error(name, format!("{} bytes is not a whole number of f32", bytes.len())));
    }
    let scalars: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    let expected: usize = dims.iter().product();
    if scalars.len() != expected {
        return Err(weights_error(
            name,
            format!("shape {dims:?} needs {expected} values, file has {}", scalars.len()),
        ));
    }
    Ok(scalars)
}

pub fn parse_shapes(content: &str) -> Result<Vec<(String, Vec<usize>)>> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let mut parts = line.split_whitespace();
            let name = parts
                .next()
                .ok_or_else(|| weights_error("shapes.txt", "empty line"))?
                .to_string();
            let dims = parts
                .map(|p| {
                    p.parse()
                        .map_err(|_| weights_error(&name, format!("bad dimension `{p}`")))
                })
                .collect::<Result<Vec<usize>>>()?;
            Ok((name, dims))
        })
        .collect()
}

fn load_params(dir: &Path) -> Result<Params> {
    let shapes = parse_shapes(&fs::read_to_string(dir.join("shapes.txt"))?)?;
    let mut params = Params::new();
    for (name, dims) in shapes {
        let data = load_tensor(&dir.join(format!("{name}.bin")), &name, &dims)?;
        debug!("loaded {name} {dims:?}");
        params.insert(name, (dims, data));
    }
    Ok(params)
}

fn take_layer(params: &mut Params, prefix: &str) -> Result<Layer> {
    let kernel_name = format!("{prefix}_kernel");
    let (dims, data) = params
        .remove(&kernel_name)
        .ok_or_else(|| weights_error(&kernel_name, "missing"))?;
    if dims.len() != 2 {
        return Err(weights_error(&kernel_name, format!("expected 2 dims, got {dims:?}")));
    }
    let weight = Matrix::new(data, dims[0], dims[1])?;

    let bias_name = format!("{prefix}_bias");
    let (dims, bias) = params
        .remove(&bias_name)
        .ok_or_else(|| weights_error(&bias_name, "missing"))?;
    if dims.len() != 1 {
        return Err(weights_error(&bias_name, format!("expected 1 dim, got {dims:?}")));
    }
    Layer::new(weight, bias)
}

/// Builds the network from named layers, checking every shape against `config`.
fn network_from_params(mut params: Params, config: &ModelConfig) -> Result<Network> {
    let input = take_layer(&mut params, "layer1")?;
    let trunk = (0..config.num_layers.saturating_sub(1))
        .map(|i| take_layer(&mut params, &format!("layers_xyz.{i}")))
        .collect::<Result<Vec<_>>>()?;
    let alpha = take_layer(&mut params, "fc_alpha")?;
    let uncertainty = take_layer(&mut params, "fc_uncertainty")?;
    let color = if config.use_viewdirs {
        ColorHead::ViewDependent {
            feature: take_layer(&mut params, "fc_feat")?,
            hidden: take_layer(&mut params, "layers_dir.0")?,
            rgb: take_layer(&mut params, "fc_rgb")?,
        }
    } else {
        ColorHead::Direct {
            rgb: take_layer(&mut params, "fc_rgb")?,
        }
    };

    if !params.is_empty() {
        let mut left: Vec<_> = params.into_keys().collect();
        left.sort();
        return Err(NerfError::config(format!(
            "unused tensors after load: {}",
            left.join(", ")
        )));
    }

    let network = Network::new(
        input,
        trunk,
        config.skip_connect_every,
        alpha,
        uncertainty,
        color,
    )?;
    if network.hidden_size() != config.hidden_size {
        return Err(NerfError::config(format!(
            "weights have hidden size {}, config says {}",
            network.hidden_size(),
            config.hidden_size
        )));
    }
    Ok(network)
}

pub fn load_network(dir: &Path, config: &ModelConfig) -> Result<Network> {
    let network = network_from_params(load_params(dir)?, config)?;
    info!(
        "loaded network from {} ({} xyz / {} dir input features)",
        dir.display(),
        network.dim_xyz(),
        network.dim_dir()
    );
    Ok(network)
}

/// Writes `network` in the layout `load_network` reads.
pub fn save_network(network: &Network, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    let mut shapes = BufWriter::new(File::create(dir.join("shapes.txt"))?);
    for (prefix, layer) in network.named_layers() {
        let tensors = [
            (
                format!("{prefix}_kernel"),
                vec![layer.in_features(), layer.out_features()],
                layer.kernel(),
            ),
            (format!("{prefix}_bias"), vec![layer.out_features()], layer.bias()),
        ];
        for (name, dims, data) in tensors {
            let dims_text: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
            writeln!(shapes, "{name} {}", dims_text.join(" "))?;
            let mut f = BufWriter::new(File::create(dir.join(format!("{name}.bin")))?);
            for v in data {
                f.write_all(&v.to_le_bytes())?;
            }
            f.flush()?;
        }
    }
    shapes.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::encoded_dims;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::path::PathBuf;

    fn scratch_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "nerf-uncertainty-{label}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn config() -> ModelConfig {
        ModelConfig {
            num_layers: 5,
            hidden_size: 8,
            skip_connect_every: 2,
            num_encoding_fn_xyz: 3,
            num_encoding_fn_dir: 2,
            ..ModelConfig::default()
        }
    }

    #[test]
    fn saved_network_loads_back() {
        let config = config();
        let mut rng = StdRng::seed_from_u64(12);
        let network = Network::random(&config, &mut rng).unwrap();
        let dir = scratch_dir("roundtrip");
        save_network(&network, &dir).unwrap();
        let loaded = load_network(&dir, &config).unwrap();

        let (dim_xyz, dim_dir) = encoded_dims(&config);
        let xyz: Vec<f32> = (0..dim_xyz).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let dir_enc: Vec<f32> = (0..dim_dir).map(|_| rng.gen_range(-1.0..1.0)).collect();
        assert_eq!(
            network.forward(&xyz, &dir_enc).unwrap(),
            loaded.forward(&xyz, &dir_enc).unwrap()
        );
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn config_mismatch_is_reported() {
        let config = config();
        let mut rng = StdRng::seed_from_u64(1);
        let network = Network::random(&config, &mut rng).unwrap();
        let dir = scratch_dir("mismatch");
        save_network(&network, &dir).unwrap();

        let fewer_layers = ModelConfig {
            num_layers: 4,
            ..config.clone()
        };
        assert!(matches!(
            load_network(&dir, &fewer_layers),
            Err(NerfError::Configuration(_))
        ));
        let no_viewdirs = ModelConfig {
            use_viewdirs: false,
            ..config
        };
        assert!(load_network(&dir, &no_viewdirs).is_err());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn truncated_tensor_is_rejected() {
        let dir = scratch_dir("truncated");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("shapes.txt"), "layer1_kernel 2 2\n").unwrap();
        fs::write(dir.join("layer1_kernel.bin"), [0u8; 12]).unwrap();
        assert!(matches!(load_params(&dir), Err(NerfError::Weights { .. })));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn shapes_parse_errors_name_the_tensor() {
        assert!(parse_shapes("fc_rgb_bias 3\n\nfc_rgb_kernel 4 3").unwrap().len() == 2);
        let err = parse_shapes("fc_rgb_bias three").unwrap_err();
        assert!(err.to_string().contains("fc_rgb_bias"));
    }
}
