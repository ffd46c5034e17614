//! Raster tiler pipeline - cuts source rasters into a z/x/y tile tree.
//!
//! This module provides the tiling pipeline that:
//! 1. Reprojects each raster footprint and lists the tiles it touches
//! 2. Resamples every (raster, tile) pair onto the tile's pixel grid
//! 3. Drops nodata dominated tiles and writes the rest through the tile store
//! 4. Composites tiles covered by several rasters
//!
//! # Overlapping rasters
//!
//! A tile touched by more than one raster is first written per raster under
//! `<out>/.splits/<n>/`, `n` being the raster's rank among the tile's
//! contributors. Once every raster is done, the partial tiles are merged by
//! filling the accumulator's zero samples from each partial in raster order,
//! so the first listed raster wins where several have data. `.splits` is
//! removed afterwards.
//!
//! Labels are never nodata filtered.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;

use crate::cover::Coverage;
use crate::palette::Palette;
use crate::raster::{geographic_bounds, warp_tile, RasterSource, Resampling};
use crate::store::{
    read_image, read_label, tile_from_directory, write_image, write_label, ImageFormat, LabelTile,
    TileImage,
};
use crate::tile::{check_zoom, tiles_for_bbox, TileCoord};
use crate::{Error, Result};

/// Default tile size in pixels
pub const DEFAULT_TILE_SIZE: (u32, u32) = (512, 512);

/// Default nodata ratio threshold, in percent
pub const DEFAULT_NODATA_THRESHOLD: u8 = 100;

/// Staging directory for tiles with several contributing rasters
pub const SPLITS_DIR: &str = ".splits";

/// Configuration for the tiling pipeline.
#[derive(Debug, Clone)]
pub struct TilerConfig {
    /// Zoom level to tile at
    pub zoom: u8,
    /// Tile `(width, height)` in pixels (default: 512x512)
    pub tile_size: (u32, u32),
    /// 1-based bands to keep, all bands of the first raster when `None`
    pub bands: Option<Vec<usize>>,
    /// Nodata sample value (default: 0)
    pub nodata: u8,
    /// Drop a tile once this percentage of its samples is nodata (default: 100)
    pub nodata_threshold: u8,
    /// Keep tiles whose border rows or columns are nodata
    pub keep_borders: bool,
    /// Format for 3 band tiles (default: WebP)
    pub format: Option<ImageFormat>,
    /// Write palette-indexed labels instead of images
    pub label: Option<Palette>,
    /// Worker threads, 0 for one per core
    pub workers: usize,
    /// Only tile these tiles
    pub cover: Option<Coverage>,
    /// Draw a progress bar on stderr
    pub progress: bool,
}

impl Default for TilerConfig {
    fn default() -> Self {
        Self {
            zoom: 0,
            tile_size: DEFAULT_TILE_SIZE,
            bands: None,
            nodata: 0,
            nodata_threshold: DEFAULT_NODATA_THRESHOLD,
            keep_borders: false,
            format: None,
            label: None,
            workers: 0,
            cover: None,
            progress: false,
        }
    }
}

impl TilerConfig {
    /// Create a new config for `zoom`.
    pub fn new(zoom: u8) -> Self {
        Self {
            zoom,
            ..Default::default()
        }
    }

    pub fn with_tile_size(mut self, width: u32, height: u32) -> Self {
        self.tile_size = (width, height);
        self
    }

    pub fn with_bands(mut self, bands: Vec<usize>) -> Self {
        self.bands = Some(bands);
        self
    }

    pub fn with_nodata(mut self, nodata: u8, threshold: u8) -> Self {
        self.nodata = nodata;
        self.nodata_threshold = threshold;
        self
    }

    pub fn with_keep_borders(mut self, keep: bool) -> Self {
        self.keep_borders = keep;
        self
    }

    pub fn with_format(mut self, format: ImageFormat) -> Self {
        self.format = Some(format);
        self
    }

    /// Tile labels with this palette.
    pub fn with_label(mut self, palette: Palette) -> Self {
        self.label = Some(palette);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_cover(mut self, cover: Coverage) -> Self {
        self.cover = Some(cover);
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    fn resampling(&self) -> Resampling {
        if self.label.is_some() {
            Resampling::Nearest
        } else {
            Resampling::Bilinear
        }
    }

    fn validate(&self, bands: &[usize]) -> Result<()> {
        check_zoom(self.zoom)?;
        if self.nodata_threshold > 100 {
            return Err(Error::Config(format!(
                "nodata threshold must be in 0..=100, got {}",
                self.nodata_threshold
            )));
        }
        if self.tile_size.0 == 0 || self.tile_size.1 == 0 {
            return Err(Error::Config("Tile size must not be zero".to_string()));
        }
        if bands.is_empty() {
            return Err(Error::Config("No band to tile".to_string()));
        }
        if self.label.is_some() && bands.len() != 1 {
            return Err(Error::Config(format!(
                "Labels are single band, got bands {:?}",
                bands
            )));
        }
        Ok(())
    }
}

/// Outcome of a tiling run
#[derive(Debug, Clone, Default)]
pub struct TilingReport {
    /// Tiles written to the output tree
    pub tiled: Coverage,
    /// Rasters skipped for lack of a usable projection
    pub skipped: Vec<String>,
    /// Tiles composited from several rasters
    pub aggregated: usize,
    /// Tiles dropped by the nodata filter
    pub dropped: usize,
}

/// Check whether a tile image is mostly nodata.
///
/// Unless `keep_borders`, a tile with a full first/last row or column of
/// nodata on every band is nodata. Otherwise it is when the nodata samples
/// reach `threshold` percent of all samples.
pub fn is_nodata(image: &TileImage, nodata: u8, threshold: u8, keep_borders: bool) -> bool {
    let (w, h) = (image.width(), image.height());
    if w == 0 || h == 0 {
        return true;
    }

    let is_empty = |x: u32, y: u32| image.pixel(x, y).iter().all(|&v| v == nodata);

    if !keep_borders {
        let row_empty = |y: u32| (0..w).all(|x| is_empty(x, y));
        let col_empty = |x: u32| (0..h).all(|y| is_empty(x, y));
        if row_empty(0) || row_empty(h - 1) || col_empty(0) || col_empty(w - 1) {
            return true;
        }
    }

    let count = image.data().iter().filter(|&&v| v == nodata).count();
    count as f64 >= image.data().len() as f64 * f64::from(threshold) / 100.0
}

fn progress_bar(total: u64, visible: bool, message: &'static str) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }

    let bar = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}") {
        bar.set_style(style.progress_chars("=>-"));
    }
    bar.set_message(message);
    bar
}

/// Write a tile image, as a label when a palette is configured.
fn write_tile(root: &Path, tile: &TileCoord, image: TileImage, config: &TilerConfig) -> Result<PathBuf> {
    match &config.label {
        Some(palette) => {
            let label = LabelTile::from_raw(image.width(), image.height(), image.into_raw())?;
            write_label(root, tile, palette, &label, false)
        }
        None => write_image(root, tile, &image, config.format),
    }
}

/// Read back a staged partial tile.
fn read_tile(path: &Path, config: &TilerConfig) -> Option<TileImage> {
    match config.label {
        Some(_) => {
            let label = read_label(path)?;
            TileImage::from_raw(label.width(), label.height(), 1, label.data().to_vec()).ok()
        }
        None => read_image(path, None),
    }
}

/// Staging directory, removed on drop whether tiling succeeded or not
struct Staging(PathBuf);

impl Drop for Staging {
    fn drop(&mut self) {
        if self.0.is_dir() {
            if let Err(e) = fs::remove_dir_all(&self.0) {
                log::warn!("failed to remove {}: {}", self.0.display(), e);
            }
        }
    }
}

/// What happened to one (raster, tile) pair
enum Tiled {
    Written(TileCoord),
    Staged,
    Dropped,
}

/// Cut `sources` into tiles at `config.zoom` under `out`.
///
/// Rasters without a usable projection are skipped with a warning. Returns
/// the coverage of the tiles actually written.
///
/// # Errors
/// - `Error::Config` for invalid settings (zoom past `MAX_ZOOM` included),
///   or bands missing from a raster
/// - `Error::EmptyResult` when no tile is left to produce
/// - `Error::ImageWrite` when a tile can't be written
pub fn tile_rasters<S: RasterSource>(
    sources: &[S],
    out: &Path,
    config: &TilerConfig,
) -> Result<TilingReport> {
    let first = sources
        .first()
        .ok_or_else(|| Error::EmptyResult("No raster to tile".to_string()))?;
    let bands: Vec<usize> = match &config.bands {
        Some(bands) => bands.clone(),
        None => (1..=first.band_count()).collect(),
    };
    config.validate(&bands)?;

    for source in sources {
        if let Some(&band) = bands.iter().find(|&&b| b == 0 || b > source.band_count()) {
            return Err(Error::Config(format!(
                "Missing band {} in raster {}",
                band,
                source.name()
            )));
        }
    }

    let mut report = TilingReport::default();

    // Tiles of each raster, and the rasters of each tile
    let mut per_source: Vec<Vec<TileCoord>> = Vec::with_capacity(sources.len());
    let mut contributors: BTreeMap<TileCoord, Vec<usize>> = BTreeMap::new();
    for (i, source) in sources.iter().enumerate() {
        let bounds = match geographic_bounds(source) {
            Ok(bounds) => bounds,
            Err(e) => {
                log::warn!("missing or invalid raster projection, skipping {}: {}", source.name(), e);
                report.skipped.push(source.name().to_string());
                per_source.push(Vec::new());
                continue;
            }
        };

        let tiles: Vec<TileCoord> = tiles_for_bbox(&bounds, config.zoom)
            .filter(|tile| config.cover.as_ref().map_or(true, |c| c.contains(tile)))
            .collect();
        for tile in &tiles {
            contributors.entry(*tile).or_default().push(i);
        }
        per_source.push(tiles);
    }

    let total: usize = per_source.iter().map(Vec::len).sum();
    if total == 0 {
        return Err(Error::EmptyResult("Nothing left to tile".to_string()));
    }

    log::info!(
        "tiling {} rasters on bands {:?} at zoom {}, {} tiles",
        sources.len(),
        bands,
        config.zoom,
        contributors.len()
    );

    fs::create_dir_all(out)?;
    let staging = Staging(out.join(SPLITS_DIR));
    let splits = staging.0.as_path();
    let resampling = config.resampling();
    let label_mode = config.label.is_some();

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.workers)
        .build()
        .map_err(|e| Error::Config(format!("Failed to build thread pool: {}", e)))?;

    let bar = progress_bar(total as u64, config.progress, "tiling");
    let outcomes: Vec<Tiled> = pool.install(|| {
        per_source
            .par_iter()
            .enumerate()
            .flat_map_iter(|(i, tiles)| tiles.iter().map(move |tile| (i, tile)))
            .map(|(i, tile)| {
                let image = warp_tile(&sources[i], tile, config.tile_size, &bands, resampling)?;
                let owners = contributors.get(tile).map_or(&[][..], Vec::as_slice);
                bar.inc(1);

                if owners.len() > 1 {
                    let rank = owners.iter().position(|&o| o == i).unwrap_or(0);
                    write_tile(&splits.join(rank.to_string()), tile, image, config)?;
                    return Ok(Tiled::Staged);
                }

                if !label_mode
                    && is_nodata(&image, config.nodata, config.nodata_threshold, config.keep_borders)
                {
                    log::debug!("dropping nodata tile {}", tile);
                    return Ok(Tiled::Dropped);
                }

                write_tile(out, tile, image, config)?;
                Ok(Tiled::Written(*tile))
            })
            .collect::<Result<Vec<_>>>()
    })?;
    bar.finish_and_clear();

    let mut tiled: Vec<TileCoord> = Vec::new();
    for outcome in outcomes {
        match outcome {
            Tiled::Written(tile) => tiled.push(tile),
            Tiled::Dropped => report.dropped += 1,
            Tiled::Staged => {}
        }
    }

    let shared: Vec<(&TileCoord, &Vec<usize>)> =
        contributors.iter().filter(|(_, owners)| owners.len() > 1).collect();

    if !shared.is_empty() {
        log::info!("aggregating {} tiles split across rasters", shared.len());

        let bar = progress_bar(shared.len() as u64, config.progress, "aggregating");
        let merged: Vec<Option<TileCoord>> = pool.install(|| {
            shared
                .par_iter()
                .map(|(tile, owners)| {
                    let result = aggregate_tile(tile, owners.len(), splits, &bands, out, config);
                    bar.inc(1);
                    result
                })
                .collect::<Result<Vec<_>>>()
        })?;
        bar.finish_and_clear();

        for tile in merged {
            match tile {
                Some(tile) => {
                    tiled.push(tile);
                    report.aggregated += 1;
                }
                None => report.dropped += 1,
            }
        }
    }

    drop(staging);

    tiled.sort();
    report.tiled = tiled.into_iter().collect();
    Ok(report)
}

/// Composite the staged partials of one tile and write the result.
///
/// Returns `None` when the composite is dropped as nodata.
fn aggregate_tile(
    tile: &TileCoord,
    parts: usize,
    splits: &Path,
    bands: &[usize],
    out: &Path,
    config: &TilerConfig,
) -> Result<Option<TileCoord>> {
    let (width, height) = config.tile_size;
    let mut image = TileImage::new(width, height, bands.len());

    for rank in 0..parts {
        let Some(path) = tile_from_directory(&splits.join(rank.to_string()), tile)? else {
            continue;
        };
        let Some(part) = read_tile(&path, config) else {
            log::warn!("unreadable partial tile {}", path.display());
            continue;
        };
        if (part.width(), part.height(), part.bands()) != (width, height, bands.len()) {
            log::warn!("partial tile {} has an unexpected shape, skipping", path.display());
            continue;
        }

        for (value, new) in image.data_mut().iter_mut().zip(part.data()) {
            if *value == 0 {
                *value = *new;
            }
        }
    }

    if config.label.is_none()
        && is_nodata(&image, config.nodata, config.nodata_threshold, config.keep_borders)
    {
        log::debug!("dropping nodata tile {}", tile);
        return Ok(None);
    }

    write_tile(out, tile, image, config)?;
    Ok(Some(*tile))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crs::EPSG_WEB_MERCATOR;
    use crate::raster::InMemoryRaster;
    use crate::store::{read_label, tile_path};
    use tempfile::TempDir;

    fn filled(width: u32, height: u32, bands: usize, value: u8) -> TileImage {
        TileImage::from_raw(width, height, bands, vec![value; (width * height) as usize * bands]).unwrap()
    }

    /// Raster exactly covering `tile`, inset by a fraction of a pixel
    fn raster_on(tile: &TileCoord, size: u32, planes: Vec<Vec<u8>>) -> InMemoryRaster {
        let m = tile.mercator_bounds();
        let inset = m.width() / size as f64 * 0.01;
        InMemoryRaster::from_u8(
            format!("raster-{}", tile),
            Some(EPSG_WEB_MERCATOR),
            [m.x_min + inset, m.y_min + inset, m.x_max - inset, m.y_max - inset],
            (size, size),
            planes,
        )
        .unwrap()
    }

    // ========================================================================
    // Nodata filter
    // ========================================================================

    #[test]
    fn test_is_nodata_full_and_clean() {
        assert!(is_nodata(&filled(4, 4, 3, 0), 0, 100, false));
        assert!(!is_nodata(&filled(4, 4, 3, 9), 0, 100, false));
    }

    #[test]
    fn test_is_nodata_border() {
        let mut image = filled(4, 4, 2, 9);
        for y in 0..4 {
            image.set(3, y, 0, 0);
            image.set(3, y, 1, 0);
        }
        assert!(is_nodata(&image, 0, 100, false));
        assert!(!is_nodata(&image, 0, 100, true));

        // One band of the border is not enough
        image.set(3, 2, 1, 5);
        assert!(!is_nodata(&image, 0, 100, false));
    }

    #[test]
    fn test_is_nodata_threshold() {
        let mut image = filled(4, 4, 1, 9);
        for x in 1..3 {
            for y in 1..3 {
                image.set(x, y, 0, 0);
            }
        }
        // 4 of 16 samples
        assert!(is_nodata(&image, 0, 25, true));
        assert!(!is_nodata(&image, 0, 26, true));
        assert!(is_nodata(&image, 0, 0, true));
    }

    // ========================================================================
    // Config
    // ========================================================================

    #[test]
    fn test_config_builders() {
        let config = TilerConfig::new(12)
            .with_tile_size(256, 128)
            .with_bands(vec![3, 2, 1])
            .with_nodata(5, 50)
            .with_keep_borders(true)
            .with_format(ImageFormat::Jpeg)
            .with_workers(2);

        assert_eq!(config.zoom, 12);
        assert_eq!(config.tile_size, (256, 128));
        assert_eq!(config.bands, Some(vec![3, 2, 1]));
        assert_eq!((config.nodata, config.nodata_threshold), (5, 50));
        assert!(config.keep_borders);
        assert_eq!(config.resampling(), Resampling::Bilinear);

        assert_eq!(TilerConfig::default().tile_size, DEFAULT_TILE_SIZE);
        assert!(TilerConfig::new(1).with_nodata(0, 101).validate(&[1]).is_err());
        assert!(matches!(TilerConfig::new(31).validate(&[1]), Err(Error::Config(_))));
    }

    #[test]
    fn test_label_config_is_single_band_nearest() {
        let palette = Palette::from_colors(&["white", "red"]).unwrap();
        let config = TilerConfig::new(3).with_label(palette);
        assert_eq!(config.resampling(), Resampling::Nearest);
        assert!(config.validate(&[1, 2]).is_err());
        assert!(config.validate(&[1]).is_ok());
    }

    // ========================================================================
    // Tiling
    // ========================================================================

    #[test]
    fn test_tile_single_raster() {
        let dir = TempDir::new().unwrap();
        let tile = TileCoord::new(300, 200, 9);
        let raster = raster_on(&tile, 8, vec![vec![40; 64], vec![80; 64], vec![120; 64]]);

        let config = TilerConfig::new(9).with_tile_size(8, 8).with_bands(vec![1]);
        let report = tile_rasters(&[raster], dir.path(), &config).unwrap();

        assert_eq!(report.tiled.as_slice(), &[tile]);
        let image = read_image(&tile_path(dir.path(), &tile, "png"), None).unwrap();
        assert!(image.data().iter().all(|&v| v == 40));
    }

    #[test]
    fn test_tile_respects_cover() {
        let dir = TempDir::new().unwrap();
        let tile = TileCoord::new(300, 200, 9);
        let raster = raster_on(&tile, 8, vec![vec![40; 64]]);

        let other: Coverage = vec![TileCoord::new(0, 0, 9)].into_iter().collect();
        let config = TilerConfig::new(9).with_tile_size(8, 8).with_cover(other);
        assert!(matches!(
            tile_rasters(&[raster], dir.path(), &config),
            Err(Error::EmptyResult(_))
        ));
    }

    #[test]
    fn test_tile_missing_band() {
        let dir = TempDir::new().unwrap();
        let tile = TileCoord::new(300, 200, 9);
        let raster = raster_on(&tile, 8, vec![vec![40; 64]]);

        let config = TilerConfig::new(9).with_tile_size(8, 8).with_bands(vec![2]);
        assert!(matches!(
            tile_rasters(&[raster], dir.path(), &config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_staging_removed_when_aggregation_fails() {
        let dir = TempDir::new().unwrap();
        let tile = TileCoord::new(300, 200, 9);
        let a = raster_on(&tile, 8, vec![vec![40; 64]]);
        let b = raster_on(&tile, 8, vec![vec![80; 64]]);

        // A file where the zoom directory should go makes the final write fail
        fs::write(dir.path().join("9"), b"").unwrap();

        let config = TilerConfig::new(9).with_tile_size(8, 8);
        assert!(tile_rasters(&[a, b], dir.path(), &config).is_err());
        assert!(!dir.path().join(SPLITS_DIR).exists());
    }

    #[test]
    fn test_tile_label_source() {
        let dir = TempDir::new().unwrap();
        let tile = TileCoord::new(300, 200, 9);
        let mut plane = vec![0u8; 64];
        plane[..8].fill(1);
        let raster = raster_on(&tile, 8, vec![plane.clone()]);

        let palette = Palette::from_colors(&["transparent", "red"]).unwrap();
        let config = TilerConfig::new(9).with_tile_size(8, 8).with_label(palette);
        let report = tile_rasters(&[raster], dir.path(), &config).unwrap();

        // Mostly background, yet kept
        assert_eq!(report.tiled.len(), 1);
        let label = read_label(&tile_path(dir.path(), &tile, "png")).unwrap();
        assert_eq!(label.data(), plane.as_slice());
    }
}
