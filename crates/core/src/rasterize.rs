//! Label rasterization: burn indexed features into palette-indexed tiles.
//!
//! Polygons are projected to Web Mercator and filled in pixel space. A pixel
//! takes the burn value when its center lies inside a polygon (even-odd
//! rule, so holes stay empty).

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use geo::{LineString, Polygon};
use rayon::prelude::*;

use crate::cover::Coverage;
use crate::palette::Palette;
use crate::spatial_index::FeatureIndex;
use crate::store::{write_label, LabelTile};
use crate::tile::{lng_lat_to_mercator, TileCoord};
use crate::{Error, Result};

/// Default label tile size
pub const DEFAULT_TILE_SIZE: (u32, u32) = (512, 512);

/// Parameters of a rasterization run
#[derive(Debug, Clone)]
pub struct RasterizeConfig {
    /// Class title, also names the `<type>_cover.csv` output
    pub class_title: String,
    /// Value burned for the class, 1..=255
    pub burn_value: u8,
    /// `(width, height)` in pixels
    pub tile_size: (u32, u32),
    /// Merge into existing labels instead of replacing them
    pub append: bool,
}

impl RasterizeConfig {
    pub fn new(class_title: impl Into<String>, burn_value: u8) -> Self {
        Self {
            class_title: class_title.into(),
            burn_value,
            tile_size: DEFAULT_TILE_SIZE,
            append: false,
        }
    }

    pub fn with_tile_size(mut self, width: u32, height: u32) -> Self {
        self.tile_size = (width, height);
        self
    }

    pub fn with_append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }
}

/// Outcome of [`rasterize_cover`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterizeReport {
    /// Label tiles written
    pub tiles: usize,
    /// Tiles with at least one feature
    pub burned: usize,
    /// The per-class cover file
    pub cover_path: PathBuf,
}

/// Ring in tile pixel coordinates
fn ring_to_pixels(ring: &LineString<f64>, origin: (f64, f64), res: (f64, f64)) -> Vec<(f64, f64)> {
    ring.coords()
        .map(|c| {
            let (mx, my) = lng_lat_to_mercator(c.x, c.y);
            ((mx - origin.0) / res.0, (origin.1 - my) / res.1)
        })
        .collect()
}

/// Burn `polygons` (lng/lat) into a `width x height` label of `tile`.
pub fn burn_tile(
    tile: &TileCoord,
    polygons: &[Polygon<f64>],
    (width, height): (u32, u32),
    burn_value: u8,
) -> LabelTile {
    let mut label = LabelTile::new(width, height);
    let bounds = tile.mercator_bounds();
    let origin = (bounds.x_min, bounds.y_max);
    let res = (bounds.width() / width as f64, bounds.height() / height as f64);

    let mut crossings = Vec::new();
    for polygon in polygons {
        let rings: Vec<Vec<(f64, f64)>> = std::iter::once(polygon.exterior())
            .chain(polygon.interiors())
            .map(|ring| ring_to_pixels(ring, origin, res))
            .collect();

        for row in 0..height {
            let yc = row as f64 + 0.5;

            crossings.clear();
            for ring in &rings {
                for edge in ring.windows(2) {
                    let ((x0, y0), (x1, y1)) = (edge[0], edge[1]);
                    if (y0 > yc) != (y1 > yc) {
                        crossings.push(x0 + (yc - y0) * (x1 - x0) / (y1 - y0));
                    }
                }
            }
            crossings.sort_by(|a, b| a.total_cmp(b));

            for span in crossings.chunks_exact(2) {
                // Columns whose center c + 0.5 lies in [start, end)
                let first = (span[0] - 0.5).ceil().max(0.0);
                let last = (span[1] - 0.5).ceil().min(width as f64);
                let mut col = first;
                while col < last {
                    label.set(col as u32, row, burn_value);
                    col += 1.0;
                }
            }
        }
    }

    label
}

/// Burn every tile of `cover` and write it as a label under `out`.
///
/// Tiles without features get an all background label. Alongside the
/// labels, `<out>/<class>_cover.csv` lists each tile with its feature count
/// as `x,y,z  count`.
///
/// # Errors
/// - `Error::EmptyResult` for an empty cover
/// - `Error::MixedZoom` if the cover zoom differs from the index zoom
/// - `Error::ImageWrite` when a label can't be written
pub fn rasterize_cover(
    index: &FeatureIndex,
    cover: &Coverage,
    out: &Path,
    palette: &Palette,
    config: &RasterizeConfig,
) -> Result<RasterizeReport> {
    let zoom = cover
        .zoom()?
        .ok_or_else(|| Error::EmptyResult("Empty cover".to_string()))?;
    if zoom != index.zoom() {
        return Err(Error::MixedZoom {
            expected: index.zoom(),
            found: zoom,
        });
    }
    if !(1..=255).contains(&config.burn_value) {
        return Err(Error::Config(format!("Invalid burn value {}", config.burn_value)));
    }

    if index.is_empty() {
        log::warn!("no feature to rasterize for {}", config.class_title);
    }
    log::info!(
        "rasterizing {} on {} tiles at zoom {}",
        config.class_title,
        cover.len(),
        zoom
    );

    fs::create_dir_all(out)?;

    let counts = cover
        .as_slice()
        .par_iter()
        .map(|tile| {
            let features = index.get(tile);
            let label = burn_tile(tile, features, config.tile_size, config.burn_value);
            write_label(out, tile, palette, &label, config.append)?;
            Ok((*tile, features.len()))
        })
        .collect::<Result<Vec<_>>>()?;

    let cover_path = out.join(format!("{}_cover.csv", config.class_title.to_lowercase()));
    let mut file = std::io::BufWriter::new(fs::File::create(&cover_path)?);
    for (tile, count) in &counts {
        writeln!(file, "{},{},{}  {}", tile.x, tile.y, tile.z, count)?;
    }
    file.flush()?;

    Ok(RasterizeReport {
        tiles: counts.len(),
        burned: counts.iter().filter(|(_, count)| *count > 0).count(),
        cover_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cover::read_weighted_cover;
    use crate::spatial_index::{index_geometries, IndexConfig};
    use crate::store::{read_label, tile_path};
    use crate::tile::mercator_to_lng_lat;
    use geo::{Coord, Geometry};
    use tempfile::TempDir;

    /// Polygon covering tile pixel rectangle [x0, x1) x [y0, y1)
    fn pixel_rect(tile: &TileCoord, size: u32, (x0, y0): (f64, f64), (x1, y1): (f64, f64)) -> Polygon<f64> {
        let b = tile.mercator_bounds();
        let res = b.width() / size as f64;
        let at = |px: f64, py: f64| {
            let (lng, lat) = mercator_to_lng_lat(b.x_min + px * res, b.y_max - py * res);
            Coord { x: lng, y: lat }
        };
        Polygon::new(
            LineString::new(vec![at(x0, y0), at(x1, y0), at(x1, y1), at(x0, y1), at(x0, y0)]),
            vec![],
        )
    }

    fn palette() -> Palette {
        Palette::from_colors(&["transparent", "#ff0000"]).unwrap()
    }

    // ========================================================================
    // Burning
    // ========================================================================

    #[test]
    fn test_burn_rectangle() {
        let tile = TileCoord::new(530, 360, 10);
        let poly = pixel_rect(&tile, 8, (2.0, 1.0), (5.0, 3.0));

        let label = burn_tile(&tile, &[poly], (8, 8), 3);
        assert_eq!(label.count_nonzero(), 6);
        for y in 1..3 {
            for x in 2..5 {
                assert_eq!(label.get(x, y), 3);
            }
        }
        assert_eq!(label.get(1, 1), 0);
        assert_eq!(label.get(5, 1), 0);
    }

    #[test]
    fn test_burn_hole_stays_empty() {
        let tile = TileCoord::new(530, 360, 10);
        let outer = pixel_rect(&tile, 8, (0.0, 0.0), (8.0, 8.0));
        let hole = pixel_rect(&tile, 8, (2.0, 2.0), (6.0, 6.0));
        let poly = Polygon::new(outer.exterior().clone(), vec![hole.exterior().clone()]);

        let label = burn_tile(&tile, &[poly], (8, 8), 1);
        assert_eq!(label.count_nonzero(), 64 - 16);
        assert_eq!(label.get(3, 3), 0);
        assert_eq!(label.get(0, 0), 1);
    }

    #[test]
    fn test_burn_overlapping_polygons_union() {
        let tile = TileCoord::new(530, 360, 10);
        let a = pixel_rect(&tile, 8, (0.0, 0.0), (4.0, 4.0));
        let b = pixel_rect(&tile, 8, (2.0, 2.0), (6.0, 6.0));

        let label = burn_tile(&tile, &[a, b], (8, 8), 1);
        assert_eq!(label.count_nonzero(), 16 + 16 - 4);
    }

    #[test]
    fn test_burn_clips_to_tile() {
        let tile = TileCoord::new(530, 360, 10);
        let poly = pixel_rect(&tile, 8, (-4.0, -4.0), (12.0, 2.0));

        let label = burn_tile(&tile, &[poly], (8, 8), 2);
        assert_eq!(label.count_nonzero(), 16);
    }

    // ========================================================================
    // Cover rasterization
    // ========================================================================

    #[test]
    fn test_rasterize_cover_writes_labels_and_counts() {
        let dir = TempDir::new().unwrap();
        let tile = TileCoord::new(530, 360, 10);
        let empty = TileCoord::new(531, 360, 10);

        let poly = pixel_rect(&tile, 16, (4.0, 4.0), (12.0, 12.0));
        let index = index_geometries(
            vec![Geometry::Polygon(poly)],
            crate::crs::EPSG_WGS84,
            &IndexConfig::new(10),
        )
        .unwrap();
        assert_eq!(index.tiles(), vec![tile]);

        let cover: Coverage = vec![tile, empty].into_iter().collect();
        let config = RasterizeConfig::new("Building", 1).with_tile_size(16, 16);
        let report = rasterize_cover(&index, &cover, dir.path(), &palette(), &config).unwrap();

        assert_eq!(report.tiles, 2);
        assert_eq!(report.burned, 1);
        assert!(report.cover_path.ends_with("building_cover.csv"));

        let label = read_label(&tile_path(dir.path(), &tile, "png")).unwrap();
        assert_eq!(label.count_nonzero(), 64);
        let blank = read_label(&tile_path(dir.path(), &empty, "png")).unwrap();
        assert_eq!(blank.count_nonzero(), 0);

        let rows = read_weighted_cover(&report.cover_path).unwrap();
        assert_eq!(rows, vec![(tile, vec![1.0]), (empty, vec![0.0])]);
    }

    #[test]
    fn test_rasterize_append_accumulates_classes() {
        let dir = TempDir::new().unwrap();
        let tile = TileCoord::new(530, 360, 10);
        let cover: Coverage = vec![tile].into_iter().collect();
        let palette = Palette::from_colors(&["transparent", "red", "blue"]).unwrap();

        let left = pixel_rect(&tile, 8, (0.0, 0.0), (4.0, 8.0));
        let right = pixel_rect(&tile, 8, (2.0, 0.0), (8.0, 8.0));
        let index_of = |p: Polygon<f64>| {
            index_geometries(vec![Geometry::Polygon(p)], 4326, &IndexConfig::new(10)).unwrap()
        };

        let first = RasterizeConfig::new("a", 1).with_tile_size(8, 8).with_append(true);
        let second = RasterizeConfig::new("b", 2).with_tile_size(8, 8).with_append(true);
        rasterize_cover(&index_of(left), &cover, dir.path(), &palette, &first).unwrap();
        rasterize_cover(&index_of(right), &cover, dir.path(), &palette, &second).unwrap();

        let label = read_label(&tile_path(dir.path(), &tile, "png")).unwrap();
        assert_eq!(label.get(0, 0), 1);
        assert_eq!(label.get(3, 0), 2);
        assert_eq!(label.get(7, 7), 2);
    }

    #[test]
    fn test_rasterize_rejects_zoom_mismatch() {
        let dir = TempDir::new().unwrap();
        let cover: Coverage = vec![TileCoord::new(1, 1, 3)].into_iter().collect();
        let config = RasterizeConfig::new("x", 1);

        let result = rasterize_cover(&FeatureIndex::new(4), &cover, dir.path(), &palette(), &config);
        assert!(matches!(result, Err(Error::MixedZoom { expected: 4, found: 3 })));

        let empty = Coverage::new();
        assert!(matches!(
            rasterize_cover(&FeatureIndex::new(4), &empty, dir.path(), &palette(), &config),
            Err(Error::EmptyResult(_))
        ));
    }
}
