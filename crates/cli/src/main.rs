//! CLI for neo-tiles - tile coverage, tiling and label rasterization
//!
//! This is a thin wrapper around the neo-tiles-core library.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use neo_tiles_core::cover::{coverage_to_geojson, read_cover, write_cover, CoverInputs};
use neo_tiles_core::rasterize::{rasterize_cover, RasterizeConfig};
use neo_tiles_core::raster::open_geotiff;
use neo_tiles_core::spatial_index::index_geojson_files;
use neo_tiles_core::split::{parse_splits, split_coverage};
use neo_tiles_core::store::{subset_directory, SubsetMode};
use neo_tiles_core::tile::MAX_ZOOM;
use neo_tiles_core::{
    build_coverage, tile_rasters, ClassesConfig, Coverage, ImageFormat, IndexConfig, TilerConfig,
};
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "neo-tiles",
    about = "Slippy-map tile coverage, tiling and label rasterization",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a tiles cover, from one input kind
    Cover(CoverArgs),
    /// Cut rasters into a z/x/y tile tree
    Tile(TileArgs),
    /// Burn GeoJSON features into label tiles
    Rasterize(RasterizeArgs),
    /// Link, copy or delete the tiles of a cover
    Subset(SubsetArgs),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum CoverType {
    Cover,
    Extent,
    Geojson,
}

#[derive(Args, Debug)]
struct CoverArgs {
    /// Plain tiles dir path
    #[arg(long)]
    dir: Option<PathBuf>,

    /// A lat/lon bbox xmin,ymin,xmax,ymax, or xmin,ymin,xmax,ymax,EPSG:xxxx
    #[arg(long, allow_hyphen_values = true)]
    bbox: Option<String>,

    /// GeoJSON features files
    #[arg(long, num_args = 1..)]
    geojson: Vec<PathBuf>,

    /// A cover file path
    #[arg(long)]
    cover: Option<PathBuf>,

    /// GeoTIFF raster files
    #[arg(long, num_args = 1..)]
    raster: Vec<PathBuf>,

    /// Zoom level of tiles [required, except with --dir or --cover inputs]
    #[arg(long, value_parser = clap::value_parser!(u8).range(..=MAX_ZOOM as i64))]
    zoom: Option<u8>,

    /// Output type
    #[arg(long = "type", value_enum, default_value = "cover")]
    kind: CoverType,

    /// Union adjacent tiles, implies --type geojson
    #[arg(long)]
    union: bool,

    /// Shuffle and split in several covers (e.g 50/15/35)
    #[arg(long)]
    splits: Option<String>,

    /// Seed for a reproducible --splits shuffle
    #[arg(long)]
    seed: Option<u64>,

    /// Output paths [required except with --type extent]
    #[arg(long, num_args = 0..)]
    out: Vec<PathBuf>,
}

#[derive(Args, Debug)]
struct TileArgs {
    /// Rasters to tile
    #[arg(long, num_args = 1.., required = true)]
    rasters: Vec<PathBuf>,

    /// Zoom level of tiles
    #[arg(long, value_parser = clap::value_parser!(u8).range(..=MAX_ZOOM as i64))]
    zoom: u8,

    /// Output tile size as width,height
    #[arg(long, default_value = "512,512")]
    ts: String,

    /// Bands to keep (e.g 1,2,3) [default: all]
    #[arg(long)]
    bands: Option<String>,

    /// Only tile the tiles of this cover
    #[arg(long)]
    cover: Option<PathBuf>,

    /// Nodata pixel value
    #[arg(long, default_value = "0")]
    nodata: u8,

    /// Skip tile if nodata pixel ratio >= threshold, in percent
    #[arg(long, default_value = "100", value_parser = clap::value_parser!(u8).range(0..=100))]
    nodata_threshold: u8,

    /// Keep tiles even if borders are empty (nodata)
    #[arg(long)]
    keep_borders: bool,

    /// Format for 3 bands tiles (webp, jpeg, png)
    #[arg(long)]
    format: Option<String>,

    /// Generate label tiles
    #[arg(long, requires = "config")]
    label: bool,

    /// Classes TOML config [required with --label]
    #[arg(long)]
    config: Option<PathBuf>,

    /// Worker threads [default: one per core]
    #[arg(long, default_value = "0")]
    workers: usize,

    /// Hide the progress bar
    #[arg(long)]
    no_progress: bool,

    /// Output tiles directory
    #[arg(long)]
    out: PathBuf,
}

#[derive(Args, Debug)]
struct RasterizeArgs {
    /// Cover of the tiles to rasterize
    #[arg(long)]
    cover: PathBuf,

    /// Classes TOML config
    #[arg(long)]
    config: PathBuf,

    /// Class title to burn
    #[arg(long = "type")]
    class: String,

    /// GeoJSON features files
    #[arg(long, num_args = 1.., required = true)]
    geojson: Vec<PathBuf>,

    /// Buffer around features, in meters
    #[arg(long, allow_hyphen_values = true)]
    buffer: Option<f64>,

    /// Append to existing tiles, for multi-class labels
    #[arg(long)]
    append: bool,

    /// Output tile size as width,height
    #[arg(long, default_value = "512,512")]
    ts: String,

    /// Worker threads for feature indexing [default: one per core]
    #[arg(long, default_value = "0")]
    workers: usize,

    /// Output tiles directory
    #[arg(long)]
    out: PathBuf,
}

#[derive(Args, Debug)]
struct SubsetArgs {
    /// Source tiles directory
    #[arg(long)]
    dir: PathBuf,

    /// Cover of the tiles to keep
    #[arg(long)]
    cover: PathBuf,

    /// Copy tiles instead of linking them
    #[arg(long, conflicts_with = "delete")]
    copy: bool,

    /// Delete the cover's tiles from --dir
    #[arg(long)]
    delete: bool,

    /// Output directory [required except with --delete]
    #[arg(long, required_unless_present = "delete")]
    out: Option<PathBuf>,
}

fn parse_tile_size(ts: &str) -> Result<(u32, u32)> {
    let parts: Vec<&str> = ts.split(',').map(str::trim).collect();
    match parts.as_slice() {
        [w, h] => Ok((
            w.parse().with_context(|| format!("Invalid tile width in {}", ts))?,
            h.parse().with_context(|| format!("Invalid tile height in {}", ts))?,
        )),
        _ => bail!("--ts expects width,height (e.g 512,512), got {}", ts),
    }
}

fn parse_bands(bands: &str) -> Result<Vec<usize>> {
    bands
        .split(',')
        .map(|b| {
            b.trim()
                .parse::<usize>()
                .with_context(|| format!("Invalid band list: {}", bands))
        })
        .collect()
}

fn cover(args: CoverArgs) -> Result<()> {
    if args.kind == CoverType::Extent && args.splits.is_some() {
        bail!("--splits and --type extent are mutually exclusive options");
    }
    if args.kind == CoverType::Extent && args.out.len() > 1 {
        bail!("--type extent implies a single --out path");
    }
    if args.kind != CoverType::Extent && args.out.is_empty() {
        bail!("--out is mandatory, except with --type extent");
    }
    if args.union && args.kind != CoverType::Geojson {
        bail!("--union implies --type geojson");
    }

    let splits = args
        .splits
        .as_deref()
        .map(parse_splits)
        .transpose()
        .context("Invalid --splits")?;
    if let Some(splits) = &splits {
        if splits.len() != args.out.len() {
            bail!("--splits values are incoherent with --out paths");
        }
    }

    let source = CoverInputs {
        rasters: args.raster,
        bbox: args.bbox,
        dir: args.dir,
        cover: args.cover,
        geojson: args.geojson,
    }
    .resolve()
    .context("Invalid cover input")?;

    let build = build_coverage(&source, args.zoom).context("Failed to build cover")?;

    if args.kind == CoverType::Extent {
        let extent = build.extent_string();
        match args.out.first() {
            Some(path) => fs::write(path, format!("{}\n", extent))
                .with_context(|| format!("Failed to write {}", path.display()))?,
            None => println!("{}", extent),
        }
        return Ok(());
    }

    let covers: Vec<Coverage> = match &splits {
        Some(splits) => split_coverage(&build.coverage, splits, args.seed).context("Failed to split cover")?,
        None => vec![build.coverage],
    };

    for (cover, path) in covers.iter().zip(&args.out) {
        match args.kind {
            CoverType::Geojson => fs::write(path, coverage_to_geojson(cover, args.union))
                .with_context(|| format!("Failed to write {}", path.display()))?,
            _ => write_cover(path, cover).with_context(|| format!("Failed to write {}", path.display()))?,
        }
        log::info!("{} tiles written to {}", cover.len(), path.display());
    }

    Ok(())
}

fn tile(args: TileArgs) -> Result<()> {
    let (width, height) = parse_tile_size(&args.ts)?;

    let mut config = TilerConfig::new(args.zoom)
        .with_tile_size(width, height)
        .with_nodata(args.nodata, args.nodata_threshold)
        .with_keep_borders(args.keep_borders)
        .with_workers(args.workers)
        .with_progress(!args.no_progress);

    if let Some(bands) = &args.bands {
        config = config.with_bands(parse_bands(bands)?);
    }
    if let Some(format) = &args.format {
        if args.label {
            bail!("--format is not supported for labels, output is always png");
        }
        config = config.with_format(format.parse::<ImageFormat>().context("Invalid --format")?);
    }
    if let Some(path) = &args.cover {
        config = config.with_cover(read_cover(path).with_context(|| format!("Failed to read cover {}", path.display()))?);
    }
    if args.label {
        let path = args.config.as_ref().context("--label requires --config")?;
        let classes = ClassesConfig::from_file(path)
            .with_context(|| format!("Failed to load classes config {}", path.display()))?;
        config = config.with_label(classes.palette(false)?);
    }

    let rasters = args
        .rasters
        .iter()
        .map(|path| open_geotiff(path).with_context(|| format!("Failed to open raster {}", path.display())))
        .collect::<Result<Vec<_>>>()?;

    let report = tile_rasters(&rasters, &args.out, &config).context("Failed to tile rasters")?;

    for name in &report.skipped {
        log::warn!("skipped {}", name);
    }
    println!(
        "✓ Tiled {} tiles into {} ({} aggregated, {} dropped as nodata)",
        report.tiled.len(),
        args.out.display(),
        report.aggregated,
        report.dropped
    );

    Ok(())
}

fn rasterize(args: RasterizeArgs) -> Result<()> {
    let (width, height) = parse_tile_size(&args.ts)?;

    let classes = ClassesConfig::from_file(&args.config)
        .with_context(|| format!("Failed to load classes config {}", args.config.display()))?;
    let palette = classes.palette(true)?;
    let burn_value = classes.burn_value(&args.class)?;

    let cover = read_cover(&args.cover).with_context(|| format!("Failed to read cover {}", args.cover.display()))?;
    let zoom = cover
        .zoom()
        .context("Unsupported zoom mixed cover")?
        .with_context(|| format!("Empty cover: {}", args.cover.display()))?;

    let mut index_config = IndexConfig::new(zoom);
    if let Some(buffer) = args.buffer {
        index_config = index_config.with_buffer(buffer);
    }
    let index = index_geojson_files(&args.geojson, &index_config, args.workers)
        .context("Failed to index GeoJSON features")?;

    let config = RasterizeConfig::new(&args.class, burn_value)
        .with_tile_size(width, height)
        .with_append(args.append);
    let report = rasterize_cover(&index, &cover, &args.out, &palette, &config).context("Failed to rasterize")?;

    println!(
        "✓ Rasterized {} on {} tiles ({} with features), cover in {}",
        args.class,
        report.tiles,
        report.burned,
        report.cover_path.display()
    );

    Ok(())
}

fn subset(args: SubsetArgs) -> Result<()> {
    let cover = read_cover(&args.cover).with_context(|| format!("Failed to read cover {}", args.cover.display()))?;

    let mode = if args.delete {
        SubsetMode::Delete
    } else if args.copy {
        SubsetMode::Copy
    } else {
        SubsetMode::Link
    };
    let out = args.out.unwrap_or_else(|| args.dir.clone());

    let report = subset_directory(&args.dir, &cover, &out, mode).context("Failed to subset tiles")?;

    println!(
        "✓ {} tiles processed, {} missing",
        report.processed, report.missing
    );

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    match cli.command {
        Command::Cover(args) => cover(args),
        Command::Tile(args) => tile(args),
        Command::Rasterize(args) => rasterize(args),
        Command::Subset(args) => subset(args),
    }
}
