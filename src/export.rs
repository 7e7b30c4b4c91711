use crate::error::{NerfError, Result};
use crate::grid::{GridSpec, VoxelVolume};
use crate::render::ValidationImage;
use crate::stats::BinRow;
use crate::vec3::Vec3;
use log::info;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

const TABLE_HEADER: &str = "density_bin,value_bin,count,density_mean,density_std,\
red_mean,green_mean,blue_mean,red_std,green_std,blue_std,uncertainty_mean,uncertainty_std";

/// Writes transfer-function rows as CSV; empty bins keep their NaN statistics.
pub fn write_table_csv(rows: &[BinRow], path: &Path) -> Result<()> {
    let mut f = BufWriter::new(File::create(path)?);
    write_table(rows, &mut f)?;
    f.flush()?;
    info!("wrote {} table rows to {}", rows.len(), path.display());
    Ok(())
}

fn write_table<W: Write>(rows: &[BinRow], out: &mut W) -> Result<()> {
    writeln!(out, "{TABLE_HEADER}")?;
    for r in rows {
        writeln!(
            out,
            "{},{},{},{},{},{},{},{},{},{},{},{},{}",
            r.density_bin,
            r.value_bin,
            r.count,
            r.density_mean,
            r.density_std,
            r.color_mean[0],
            r.color_mean[1],
            r.color_mean[2],
            r.color_std[0],
            r.color_std[1],
            r.color_std[2],
            r.uncertainty_mean,
            r.uncertainty_std
        )?;
    }
    Ok(())
}

fn to_byte(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0 + 0.5) as u8
}

fn check_size(width: usize, height: usize, len: usize) -> Result<()> {
    if len != width * height {
        return Err(NerfError::geometry(format!(
            "{len} pixels for a {width}x{height} image"
        )));
    }
    Ok(())
}

/// Binary RGB PPM, colors clamped to [0, 1].
pub fn save_ppm(path: &Path, width: usize, height: usize, pixels: &[Vec3]) -> Result<()> {
    check_size(width, height, pixels.len())?;
    let mut f = BufWriter::new(File::create(path)?);
    write!(f, "P6\n{width} {height}\n255\n")?;
    let buf: Vec<u8> = pixels
        .iter()
        .flat_map(|p| [to_byte(p.x), to_byte(p.y), to_byte(p.z)])
        .collect();
    f.write_all(&buf)?;
    f.flush()?;
    Ok(())
}

/// Binary grayscale PGM of `values / max`, where `max` is the largest finite value.
pub fn save_pgm(path: &Path, width: usize, height: usize, values: &[f32]) -> Result<()> {
    check_size(width, height, values.len())?;
    let max = values
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(0.0f32, f32::max);
    let scale = if max > 0.0 { 1.0 / max } else { 0.0 };
    let mut f = BufWriter::new(File::create(path)?);
    write!(f, "P5\n{width} {height}\n255\n")?;
    let buf: Vec<u8> = values.iter().map(|&v| to_byte(v * scale)).collect();
    f.write_all(&buf)?;
    f.flush()?;
    Ok(())
}

/// Writes `<stem>.ppm` and `<stem>_{uncertainty,depth,disparity}.pgm` into `dir`.
pub fn write_validation_image(image: &ValidationImage, dir: &Path, stem: &str) -> Result<()> {
    let (w, h) = (image.width, image.height);
    save_ppm(&dir.join(format!("{stem}.ppm")), w, h, &image.rgb)?;
    for (suffix, values) in [
        ("uncertainty", &image.uncertainty),
        ("depth", &image.depth),
        ("disparity", &image.disparity),
    ] {
        save_pgm(&dir.join(format!("{stem}_{suffix}.pgm")), w, h, values)?;
    }
    info!("wrote {w}x{h} view to {}", dir.join(stem).display());
    Ok(())
}

#[derive(Serialize)]
struct VolumeHeader<'a> {
    dimensions: [usize; 3],
    origin: Vec3,
    spacing: Vec3,
    bounds: &'a GridSpec,
    order: &'static str,
    dtype: &'static str,
    arrays: [&'static str; 2],
}

fn write_f32s(path: &Path, values: &[f32]) -> Result<()> {
    let mut f = BufWriter::new(File::create(path)?);
    for v in values {
        f.write_all(&v.to_le_bytes())?;
    }
    f.flush()?;
    Ok(())
}

/// Writes `<stem>.json` plus `<stem>_opacity.raw` and `<stem>_uncertainty.raw`
/// into `dir`, for a structured-points volume writer to pick up.
pub fn write_volume(volume: &VoxelVolume, dir: &Path, stem: &str) -> Result<()> {
    if !volume.is_complete() {
        return Err(NerfError::geometry(format!(
            "volume is filled to {} of {} points",
            volume.filled,
            volume.grid().len()
        )));
    }
    let grid = volume.grid();
    let opacity_file = format!("{stem}_opacity.raw");
    let uncertainty_file = format!("{stem}_uncertainty.raw");
    write_f32s(&dir.join(&opacity_file), &volume.opacity)?;
    write_f32s(&dir.join(&uncertainty_file), &volume.uncertainty)?;

    let header = VolumeHeader {
        dimensions: grid.resolution,
        origin: grid.origin(),
        spacing: grid.spacing(),
        bounds: grid,
        order: "x-fastest",
        dtype: "f32le",
        arrays: ["opacity", "uncertainty"],
    };
    let f = BufWriter::new(File::create(dir.join(format!("{stem}.json")))?);
    serde_json::to_writer_pretty(f, &header)?;
    info!(
        "wrote {:?} volume to {}",
        grid.resolution,
        dir.join(stem).display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Voxel;
    use std::fs;
    use std::path::PathBuf;

    fn scratch_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "nerf-uncertainty-export-{label}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn empty_bins_are_written_as_nan() {
        let row = BinRow {
            density_bin: 1,
            value_bin: 2,
            count: 0,
            density_mean: f64::NAN,
            density_std: f64::NAN,
            color_mean: [f64::NAN; 3],
            color_std: [f64::NAN; 3],
            uncertainty_mean: f64::NAN,
            uncertainty_std: f64::NAN,
        };
        let mut out = Vec::new();
        write_table(&[row], &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].split(',').count(), 13);
        assert!(lines[1].starts_with("1,2,0,NaN,NaN"));
    }

    #[test]
    fn ppm_has_header_and_clamped_pixels() {
        let dir = scratch_dir("ppm");
        let path = dir.join("out.ppm");
        save_ppm(&path, 2, 1, &[Vec3::new(2.0, -1.0, 0.5), Vec3::ONE]).unwrap();
        let bytes = fs::read(&path).unwrap();
        let header = b"P6\n2 1\n255\n";
        assert_eq!(&bytes[..header.len()], header);
        assert_eq!(&bytes[header.len()..], &[255, 0, 128, 255, 255, 255]);
        assert!(save_ppm(&path, 3, 1, &[Vec3::ONE]).is_err());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn validation_image_writes_every_buffer() {
        let dir = scratch_dir("view");
        let image = ValidationImage {
            width: 2,
            height: 1,
            rgb: vec![Vec3::ONE, Vec3::ZERO],
            uncertainty: vec![0.1, 0.2],
            opacity: vec![1.0, 0.0],
            depth: vec![4.0, 0.0],
            disparity: vec![0.25, 0.0],
        };
        write_validation_image(&image, &dir, "view_000").unwrap();
        let depth = fs::read(dir.join("view_000_depth.pgm")).unwrap();
        let header = b"P5\n2 1\n255\n";
        assert_eq!(&depth[..header.len()], header);
        assert_eq!(&depth[header.len()..], &[255, 0]);
        for name in ["view_000.ppm", "view_000_uncertainty.pgm", "view_000_disparity.pgm"] {
            assert!(dir.join(name).is_file(), "{name} missing");
        }
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn volume_arrays_and_header() {
        let dir = scratch_dir("volume");
        let grid = GridSpec::new(Vec3::ZERO, Vec3::ONE, [2, 1, 1]).unwrap();
        let mut volume = VoxelVolume::new(grid);
        let voxel = |opacity| Voxel {
            density: 1.0,
            opacity,
            color: Vec3::ZERO,
            uncertainty: 0.5,
        };
        assert!(write_volume(&volume, &dir, "v").is_err());
        volume.write(0, &[voxel(0.25), voxel(0.75)]).unwrap();
        write_volume(&volume, &dir, "v").unwrap();

        let raw = fs::read(dir.join("v_opacity.raw")).unwrap();
        assert_eq!(raw.len(), 8);
        assert_eq!(f32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]), 0.75);
        let header: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.join("v.json")).unwrap()).unwrap();
        assert_eq!(header["dimensions"], serde_json::json!([2, 1, 1]));
        assert_eq!(header["spacing"], serde_json::json!([1.0, 0.0, 0.0]));
        let _ = fs::remove_dir_all(&dir);
    }
}
