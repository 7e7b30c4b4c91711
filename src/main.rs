use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info};
use nerf_uncertainty::camera::load_views;
use nerf_uncertainty::export::{write_table_csv, write_validation_image, write_volume};
use nerf_uncertainty::stats::normalized_histogram;
use nerf_uncertainty::weights::load_network;
use nerf_uncertainty::{
    GridSpec, NerfConfig, NerfError, NeuralField, RadianceField, Renderer, TransferFunctionTable,
    VoxelSweep,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Uncertainty volumes and validation renders from a trained radiance field"
)]
struct Cli {
    /// JSON configuration; missing sections fall back to defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Overrides the sampling seed
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Bytes a single evaluation chunk may use before the run is aborted
    #[arg(long, global = true)]
    memory_budget: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Query the field on a regular grid and export opacity, uncertainty and bin statistics
    Volume(VolumeArgs),
    /// Render one validation view to RGB, uncertainty, depth and disparity images
    Render(RenderArgs),
}

#[derive(Args)]
struct VolumeArgs {
    /// Directory with shapes.txt and tensor files
    #[arg(long)]
    weights: PathBuf,

    #[arg(long, default_value = "out")]
    out: PathBuf,

    /// Points per grid axis, overriding the configuration
    #[arg(long)]
    resolution: Option<usize>,

    #[arg(long, default_value = "volume")]
    stem: String,

    /// Histogram values at or below this are left out
    #[arg(long, default_value_t = 0.0)]
    histogram_threshold: f32,
}

#[derive(Args)]
struct RenderArgs {
    /// Coarse network weights
    #[arg(long)]
    coarse: PathBuf,

    /// Fine network weights; the coarse network is reused when absent
    #[arg(long)]
    fine: Option<PathBuf>,

    /// Camera JSON holding one view or a list of views
    #[arg(long)]
    views: PathBuf,

    #[arg(long, default_value_t = 0)]
    view: usize,

    /// Output size as WIDTHxHEIGHT, keeping the view's field of view
    #[arg(long, value_parser = parse_size)]
    size: Option<(usize, usize)>,

    #[arg(long, default_value = "out")]
    out: PathBuf,
}

fn parse_size(s: &str) -> Result<(usize, usize), String> {
    let (w, h) = s
        .split_once('x')
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got `{s}`"))?;
    let parse = |v: &str| v.parse::<usize>().map_err(|e| format!("`{v}`: {e}"));
    Ok((parse(w)?, parse(h)?))
}

fn progress_bar(len: usize, unit: &str) -> Result<ProgressBar, Box<dyn std::error::Error>> {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "{{spinner:.green}} [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{pos}}/{{len}} {unit}"
            ))?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

fn load_field(dir: &Path, config: &NerfConfig) -> Result<NeuralField, NerfError> {
    NeuralField::new(load_network(dir, &config.model)?, &config.model)
}

fn run_volume(config: &mut NerfConfig, args: VolumeArgs) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(resolution) = args.resolution {
        config.grid.resolution = resolution;
    }
    config.validate()?;
    fs::create_dir_all(&args.out)?;

    let field = load_field(&args.weights, config)?;
    let grid = GridSpec::from_config(&config.grid)?;
    info!(
        "sweeping {} points over [{}, {}]^3",
        grid.len(),
        config.grid.min,
        config.grid.max
    );

    let sweep = VoxelSweep::new(&field, grid, &config.sampling)?;
    let pb = progress_bar(sweep.grid().len(), "points")?;
    let start = Instant::now();
    let volume = sweep.run(|done, _| pb.set_position(done as u64))?;
    pb.finish_and_clear();
    info!("sweep finished in {:.2?}", start.elapsed());

    write_volume(&volume, &args.out, &args.stem)?;

    let table = TransferFunctionTable::from_volume(&volume, &config.heatmap)?;
    write_table_csv(&table.rows(), &args.out.join(format!("{}_bins.csv", args.stem)))?;

    let bins = config.heatmap.density_bins;
    let threshold = Some(args.histogram_threshold);
    info!(
        "opacity histogram: {:.3?}",
        normalized_histogram(&volume.opacity, bins, threshold)
    );
    info!(
        "uncertainty histogram: {:.3?}",
        normalized_histogram(&volume.uncertainty, bins, threshold)
    );
    Ok(())
}

fn run_render(config: &NerfConfig, args: RenderArgs) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    fs::create_dir_all(&args.out)?;

    let views = load_views(&args.views)?;
    let view = views.get(args.view).ok_or_else(|| {
        NerfError::config(format!(
            "view {} requested, {} has {}",
            args.view,
            args.views.display(),
            views.len()
        ))
    })?;
    let camera = view.camera(args.size, config.sampling.near, config.sampling.far)?;

    let coarse = load_field(&args.coarse, config)?;
    let fine = args
        .fine
        .as_deref()
        .map(|dir| load_field(dir, config))
        .transpose()?;
    let renderer = Renderer::new(
        &coarse,
        fine.as_ref().map(|f| f as &dyn RadianceField),
        &config.sampling,
    )?
    .without_noise();

    let pb = progress_bar(camera.pixel_count(), "pixels")?;
    let image = renderer.render_image(&camera, |done, _| pb.set_position(done as u64))?;
    pb.finish_and_clear();

    write_validation_image(&image, &args.out, &format!("view_{:03}", args.view))?;

    let (mean, std) = image.uncertainty_stats();
    info!("view {}: uncertainty mean {mean:.5}, std {std:.5}", args.view);
    Ok(())
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => NerfConfig::load(path)?,
        None => NerfConfig::default(),
    };
    if let Some(seed) = cli.seed {
        config.sampling.seed = seed;
    }
    if let Some(bytes) = cli.memory_budget {
        config.sampling.memory_budget = Some(bytes);
    }
    match cli.command {
        Command::Volume(args) => run_volume(&mut config, args),
        Command::Render(args) => run_render(&config, args),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        error!("{e}");
        return Err(e);
    }
    Ok(())
}
