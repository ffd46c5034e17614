//! Tile coverages and the builder turning geographic inputs into them.
//!
//! A [`Coverage`] is a deduplicated, insertion-ordered set of tiles. It is
//! built from exactly one [`CoverSource`]:
//!
//! - raster footprints (bounds + CRS of each raster)
//! - a bounding box, optionally in a projected CRS
//! - an on-disk `z/x/y` tile directory
//! - an existing cover file
//! - GeoJSON feature collections, or an already built [`FeatureIndex`]
//!
//! Input tiles whose zoom differs from the requested one are re-expanded
//! onto the requested zoom.
//!
//! # Cover files
//!
//! One tile per line, `x,y,z`, comma or tab separated. Trailing numeric
//! columns are per-tile weights, ignored unless read with
//! [`read_weighted_cover`].

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use geo::{BooleanOps, MultiPolygon, Polygon, Rect};
use geojson::{Feature, FeatureCollection, JsonObject, Value};

use crate::crs::{srid_from_name, CoordTransformer, EPSG_WGS84};
use crate::raster::{footprint, open_geotiff};
use crate::spatial_index::{index_geojson_files, FeatureIndex, IndexConfig};
use crate::store::list_tiles;
use crate::tile::{check_zoom, tiles_for_bbox, TileBounds, TileCoord, MAX_ZOOM};
use crate::{Error, Result};

/// Decimal places kept on footprint coordinates written as GeoJSON
const GEOJSON_PRECISION: i32 = 6;

/// Insertion-ordered set of tiles
#[derive(Debug, Clone, Default)]
pub struct Coverage {
    tiles: Vec<TileCoord>,
    seen: HashSet<TileCoord>,
}

impl Coverage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tile, returning `false` if it was already present
    pub fn insert(&mut self, tile: TileCoord) -> bool {
        if self.seen.insert(tile) {
            self.tiles.push(tile);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, tile: &TileCoord) -> bool {
        self.seen.contains(tile)
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TileCoord> {
        self.tiles.iter()
    }

    pub fn as_slice(&self) -> &[TileCoord] {
        &self.tiles
    }

    /// The single zoom level shared by all tiles.
    ///
    /// Returns `Ok(None)` for an empty coverage.
    ///
    /// # Errors
    /// `Error::MixedZoom` if two tiles disagree.
    pub fn zoom(&self) -> Result<Option<u8>> {
        let Some(first) = self.tiles.first() else {
            return Ok(None);
        };

        match self.tiles.iter().find(|tile| tile.z != first.z) {
            Some(other) => Err(Error::MixedZoom {
                expected: first.z,
                found: other.z,
            }),
            None => Ok(Some(first.z)),
        }
    }

    /// Geographic envelope of every tile footprint
    pub fn extent(&self) -> TileBounds {
        let mut extent = TileBounds::empty();
        for tile in &self.tiles {
            extent.expand(&tile.bounds());
        }
        extent
    }
}

impl FromIterator<TileCoord> for Coverage {
    fn from_iter<I: IntoIterator<Item = TileCoord>>(iter: I) -> Self {
        let mut coverage = Coverage::new();
        coverage.extend(iter);
        coverage
    }
}

impl Extend<TileCoord> for Coverage {
    fn extend<I: IntoIterator<Item = TileCoord>>(&mut self, iter: I) {
        for tile in iter {
            self.insert(tile);
        }
    }
}

impl IntoIterator for Coverage {
    type Item = TileCoord;
    type IntoIter = std::vec::IntoIter<TileCoord>;

    fn into_iter(self) -> Self::IntoIter {
        self.tiles.into_iter()
    }
}

impl<'a> IntoIterator for &'a Coverage {
    type Item = &'a TileCoord;
    type IntoIter = std::slice::Iter<'a, TileCoord>;

    fn into_iter(self) -> Self::IntoIter {
        self.tiles.iter()
    }
}

/// Bounds and CRS of one raster, as needed to cover it
#[derive(Debug, Clone, PartialEq)]
pub struct RasterFootprint {
    /// Name used in warnings, usually the raster path
    pub name: String,
    /// EPSG code, `None` when the raster carries no usable georeferencing
    pub srid: Option<u32>,
    /// `[min_x, min_y, max_x, max_y]` in the raster CRS
    pub bounds: [f64; 4],
}

impl RasterFootprint {
    pub fn new(name: impl Into<String>, srid: Option<u32>, bounds: [f64; 4]) -> Self {
        Self {
            name: name.into(),
            srid,
            bounds,
        }
    }

    /// Footprint bounds reprojected to lng/lat degrees
    pub fn geographic_bounds(&self) -> Result<TileBounds> {
        let srid = self.srid.ok_or_else(|| {
            Error::Projection(format!("{} has no coordinate reference system", self.name))
        })?;
        let transformer = CoordTransformer::to_lng_lat(srid)?;
        Ok(TileBounds::from_array(transformer.transform_bounds(self.bounds)?))
    }
}

/// A `west,south,east,north[,EPSG:xxxx]` bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub bounds: [f64; 4],
    pub srid: u32,
}

impl BoundingBox {
    /// Bounding box reprojected to lng/lat degrees
    pub fn to_geographic(&self) -> Result<TileBounds> {
        let transformer = CoordTransformer::to_lng_lat(self.srid)?;
        Ok(TileBounds::from_array(transformer.transform_bounds(self.bounds)?))
    }
}

impl FromStr for BoundingBox {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::Config(format!("Invalid bbox parameter: {}", s));

        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        if parts.len() != 4 && parts.len() != 5 {
            return Err(invalid());
        }

        let mut bounds = [0.0; 4];
        for (value, part) in bounds.iter_mut().zip(&parts) {
            *value = part.parse().map_err(|_| invalid())?;
        }

        let srid = match parts.get(4) {
            Some(crs) => srid_from_name(crs).ok_or_else(invalid)?,
            None => EPSG_WGS84,
        };

        let [w, s, e, n] = bounds;
        if !(w < e && s < n) {
            return Err(invalid());
        }

        Ok(Self { bounds, srid })
    }
}

/// The one input a coverage is built from
#[derive(Debug)]
pub enum CoverSource {
    Rasters(Vec<RasterFootprint>),
    BBox(BoundingBox),
    Dir(PathBuf),
    Cover(PathBuf),
    GeoJson(Vec<PathBuf>),
    Features(FeatureIndex),
}

impl CoverSource {
    /// Sources whose tiles carry no zoom of their own
    fn requires_zoom(&self) -> bool {
        matches!(
            self,
            CoverSource::Rasters(_) | CoverSource::BBox(_) | CoverSource::GeoJson(_)
        )
    }
}

/// Raw, possibly conflicting, cover inputs as collected from a command line
#[derive(Debug, Clone, Default)]
pub struct CoverInputs {
    pub rasters: Vec<PathBuf>,
    pub bbox: Option<String>,
    pub dir: Option<PathBuf>,
    pub cover: Option<PathBuf>,
    pub geojson: Vec<PathBuf>,
}

impl CoverInputs {
    /// Check that exactly one input kind is set and turn it into a [`CoverSource`].
    ///
    /// Rasters are opened here to read their footprints.
    pub fn resolve(self) -> Result<CoverSource> {
        let given = usize::from(!self.rasters.is_empty())
            + usize::from(self.bbox.is_some())
            + usize::from(self.dir.is_some())
            + usize::from(self.cover.is_some())
            + usize::from(!self.geojson.is_empty());

        if given != 1 {
            return Err(Error::Config(
                "One, and only one, input type must be provided, among: dir, bbox, cover, raster or geojson"
                    .to_string(),
            ));
        }

        if let Some(bbox) = self.bbox {
            return Ok(CoverSource::BBox(bbox.parse()?));
        }
        if let Some(dir) = self.dir {
            return Ok(CoverSource::Dir(dir));
        }
        if let Some(cover) = self.cover {
            return Ok(CoverSource::Cover(cover));
        }
        if !self.geojson.is_empty() {
            return Ok(CoverSource::GeoJson(self.geojson));
        }

        let footprints = self
            .rasters
            .iter()
            .map(|path| open_geotiff(path).map(|raster| footprint(&raster)))
            .collect::<Result<Vec<_>>>()?;

        Ok(CoverSource::Rasters(footprints))
    }
}

/// A built coverage and the geographic envelope of its inputs
#[derive(Debug, Clone)]
pub struct CoverBuild {
    pub coverage: Coverage,
    pub extent: TileBounds,
}

impl CoverBuild {
    /// The extent as `west,south,east,north`, 8 decimals
    pub fn extent_string(&self) -> String {
        extent_string(&self.extent)
    }
}

/// Build the coverage of `source` at `zoom`.
///
/// `zoom` may only be omitted for directory and cover file sources, whose
/// tiles already carry one. Rasters whose footprint can't be reprojected
/// are skipped with a warning.
///
/// # Errors
/// - `Error::Config` when `zoom` is missing but required, or past `MAX_ZOOM`
/// - `Error::EmptyResult` when nothing is left to cover
pub fn build_coverage(source: &CoverSource, zoom: Option<u8>) -> Result<CoverBuild> {
    let input_zoom = match (zoom, source.requires_zoom()) {
        (Some(z), _) => check_zoom(z)?,
        (None, true) => return Err(Error::Config("Zoom parameter is required".to_string())),
        (None, false) => 0,
    };

    let tiles: Vec<TileCoord> = match source {
        CoverSource::Rasters(footprints) => {
            log::info!("cover from {} rasters at zoom {}", footprints.len(), input_zoom);

            let mut tiles = Coverage::new();
            for raster in footprints {
                match raster.geographic_bounds() {
                    Ok(bounds) => tiles.extend(tiles_for_bbox(&bounds, input_zoom)),
                    Err(e) => log::warn!("projection error, skipping {}: {}", raster.name, e),
                }
            }
            tiles.into_iter().collect()
        }
        CoverSource::BBox(bbox) => {
            log::info!("cover from bbox {:?} at zoom {}", bbox.bounds, input_zoom);
            tiles_for_bbox(&bbox.to_geographic()?, input_zoom).collect()
        }
        CoverSource::Dir(root) => {
            log::info!("cover from {}", root.display());
            list_tiles(root, None)
                .map(|entry| entry.map(|(tile, _)| tile))
                .collect::<Result<_>>()?
        }
        CoverSource::Cover(path) => {
            log::info!("cover from {}", path.display());
            read_cover(path)?.into_iter().collect()
        }
        CoverSource::GeoJson(paths) => {
            log::info!("cover from {} GeoJSON files at zoom {}", paths.len(), input_zoom);
            index_geojson_files(paths, &IndexConfig::new(input_zoom), 0)?.tiles()
        }
        CoverSource::Features(index) => index.tiles(),
    };

    if tiles.is_empty() {
        return Err(Error::EmptyResult("Empty tiles inputs".to_string()));
    }

    let mut coverage = Coverage::new();
    let mut extent = TileBounds::empty();

    for tile in tiles {
        let bounds = tile.bounds();
        extent.expand(&bounds);

        match zoom {
            Some(z) if tile.z != z => coverage.extend(tiles_for_bbox(&bounds, z)),
            _ => {
                coverage.insert(tile);
            }
        }
    }

    if coverage.is_empty() {
        return Err(Error::EmptyResult("nothing to cover".to_string()));
    }

    Ok(CoverBuild { coverage, extent })
}

/// Format an extent as `west,south,east,north` with 8 decimals
pub fn extent_string(extent: &TileBounds) -> String {
    format!(
        "{:.8},{:.8},{:.8},{:.8}",
        extent.lng_min, extent.lat_min, extent.lng_max, extent.lat_max
    )
}

fn parse_cover_line(path: &Path, line_number: usize, line: &str) -> Result<(TileCoord, Vec<f64>)> {
    let invalid = |reason: String| Error::InvalidCover {
        path: path.to_path_buf(),
        line: line_number,
        reason,
    };

    let fields: Vec<&str> = line
        .split([',', '\t', ' '])
        .filter(|field| !field.is_empty())
        .collect();

    if fields.len() < 3 {
        return Err(invalid(format!("expected x,y,z, got '{}'", line)));
    }

    let x = fields[0]
        .parse()
        .map_err(|_| invalid(format!("invalid x '{}'", fields[0])))?;
    let y = fields[1]
        .parse()
        .map_err(|_| invalid(format!("invalid y '{}'", fields[1])))?;
    let z = fields[2]
        .parse::<u8>()
        .ok()
        .filter(|&z| z <= MAX_ZOOM)
        .ok_or_else(|| invalid(format!("invalid z '{}'", fields[2])))?;

    let weights = fields[3..]
        .iter()
        .map(|field| {
            field
                .parse::<f64>()
                .map_err(|_| invalid(format!("invalid weight '{}'", field)))
        })
        .collect::<Result<Vec<_>>>()?;

    let tile = TileCoord::new(x, y, z);
    if u64::from(tile.x) >= tile.grid_size() || u64::from(tile.y) >= tile.grid_size() {
        return Err(invalid(format!("{} is off the tile grid", tile)));
    }

    Ok((tile, weights))
}

/// Read every row of a cover file, weights included
pub fn read_weighted_cover(path: &Path) -> Result<Vec<(TileCoord, Vec<f64>)>> {
    let file = fs::File::open(path).map_err(|e| Error::InvalidCover {
        path: path.to_path_buf(),
        line: 0,
        reason: format!("'{}' seems not a valid cover file: {}", path.display(), e),
    })?;

    let mut rows = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        rows.push(parse_cover_line(path, index + 1, line)?);
    }

    Ok(rows)
}

/// Read a cover file into a coverage, dropping duplicates and weights
pub fn read_cover(path: &Path) -> Result<Coverage> {
    Ok(read_weighted_cover(path)?
        .into_iter()
        .map(|(tile, _)| tile)
        .collect())
}

fn create_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => Ok(fs::create_dir_all(parent)?),
        _ => Ok(()),
    }
}

/// Write a coverage as `x,y,z` rows, creating parent directories
pub fn write_cover<'a>(path: &Path, tiles: impl IntoIterator<Item = &'a TileCoord>) -> Result<()> {
    create_parent(path)?;

    let mut writer = BufWriter::new(fs::File::create(path)?);
    for tile in tiles {
        writeln!(writer, "{},{},{}", tile.x, tile.y, tile.z)?;
    }
    writer.flush()?;

    Ok(())
}

fn round(value: f64) -> f64 {
    let factor = 10f64.powi(GEOJSON_PRECISION);
    (value * factor).round() / factor
}

fn polygon_value(polygon: &Polygon<f64>) -> Value {
    let ring = |line: &geo::LineString<f64>| {
        line.coords()
            .map(|c| vec![round(c.x), round(c.y)])
            .collect::<Vec<_>>()
    };

    let mut rings = vec![ring(polygon.exterior())];
    rings.extend(polygon.interiors().iter().map(ring));
    Value::Polygon(rings)
}

fn feature(value: Value, properties: Option<JsonObject>) -> Feature {
    Feature {
        bbox: None,
        geometry: Some(geojson::Geometry::new(value)),
        id: None,
        properties,
        foreign_members: None,
    }
}

/// Merge each row's contiguous tiles into rectangles, then union them all.
fn union_footprints<'a>(tiles: impl IntoIterator<Item = &'a TileCoord>) -> MultiPolygon<f64> {
    let mut rows: BTreeMap<(u8, u32), Vec<u32>> = BTreeMap::new();
    for tile in tiles {
        rows.entry((tile.z, tile.y)).or_default().push(tile.x);
    }

    let mut parts: Vec<MultiPolygon<f64>> = Vec::new();
    for ((z, y), mut xs) in rows {
        xs.sort_unstable();
        xs.dedup();

        let mut start = 0;
        for i in 1..=xs.len() {
            if i == xs.len() || xs[i] != xs[i - 1] + 1 {
                let first = TileCoord::new(xs[start], y, z).bounds();
                let last = TileCoord::new(xs[i - 1], y, z).bounds();
                let rect = Rect::new(
                    (first.lng_min, first.lat_min),
                    (last.lng_max, last.lat_max),
                );
                parts.push(MultiPolygon::new(vec![rect.to_polygon()]));
                start = i;
            }
        }
    }

    // Pairwise reduction keeps each union call small
    while parts.len() > 1 {
        parts = parts
            .chunks(2)
            .map(|pair| match pair {
                [a, b] => a.union(b),
                [a] => a.clone(),
                _ => MultiPolygon::new(vec![]),
            })
            .collect();
    }

    parts.pop().unwrap_or_else(|| MultiPolygon::new(vec![]))
}

/// Tile footprints as a GeoJSON FeatureCollection.
///
/// Without `union`, one feature per tile with `x`, `y`, `z` properties.
/// With `union`, one property-less feature per polygon of the merged area.
pub fn coverage_to_geojson<'a>(tiles: impl IntoIterator<Item = &'a TileCoord>, union: bool) -> String {
    let features = if union {
        union_footprints(tiles)
            .iter()
            .map(|polygon| feature(polygon_value(polygon), None))
            .collect()
    } else {
        tiles
            .into_iter()
            .map(|tile| {
                let b = tile.bounds();
                let footprint = Rect::new((b.lng_min, b.lat_min), (b.lng_max, b.lat_max)).to_polygon();

                let mut properties = JsonObject::new();
                properties.insert("x".to_string(), tile.x.into());
                properties.insert("y".to_string(), tile.y.into());
                properties.insert("z".to_string(), tile.z.into());

                feature(polygon_value(&footprint), Some(properties))
            })
            .collect()
    };

    FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crs::EPSG_WEB_MERCATOR;
    use crate::spatial_index::index_geometries;
    use geo::{polygon, Geometry};
    use tempfile::TempDir;

    // ========================================================================
    // Coverage set
    // ========================================================================

    #[test]
    fn test_coverage_dedup_keeps_first_order() {
        let mut coverage = Coverage::new();
        assert!(coverage.insert(TileCoord::new(1, 2, 3)));
        assert!(coverage.insert(TileCoord::new(0, 0, 3)));
        assert!(!coverage.insert(TileCoord::new(1, 2, 3)));

        assert_eq!(coverage.len(), 2);
        assert_eq!(
            coverage.as_slice(),
            &[TileCoord::new(1, 2, 3), TileCoord::new(0, 0, 3)]
        );
    }

    #[test]
    fn test_coverage_zoom() {
        let empty = Coverage::new();
        assert_eq!(empty.zoom().unwrap(), None);

        let same: Coverage = vec![TileCoord::new(0, 0, 4), TileCoord::new(1, 0, 4)]
            .into_iter()
            .collect();
        assert_eq!(same.zoom().unwrap(), Some(4));

        let mixed: Coverage = vec![TileCoord::new(0, 0, 4), TileCoord::new(1, 0, 5)]
            .into_iter()
            .collect();
        match mixed.zoom() {
            Err(Error::MixedZoom { expected: 4, found: 5 }) => {}
            other => panic!("Expected MixedZoom, got {:?}", other),
        }
    }

    // ========================================================================
    // Bounding box parsing
    // ========================================================================

    #[test]
    fn test_bbox_parse() {
        let bbox: BoundingBox = "2.2,48.8,2.4,48.9".parse().unwrap();
        assert_eq!(bbox.bounds, [2.2, 48.8, 2.4, 48.9]);
        assert_eq!(bbox.srid, EPSG_WGS84);

        let bbox: BoundingBox = "640000,6860000,660000,6870000,EPSG:2154".parse().unwrap();
        assert_eq!(bbox.srid, 2154);
    }

    #[test]
    fn test_bbox_parse_rejects_invalid() {
        for bad in ["1,2,3", "2.4,48.8,2.2,48.9", "2.2,48.9,2.4,48.8", "a,b,c,d", "0,0,1,1,EPSG:x"] {
            assert!(
                matches!(bad.parse::<BoundingBox>(), Err(Error::Config(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    // ========================================================================
    // Coverage builder
    // ========================================================================

    #[test]
    fn test_build_from_bbox() {
        let bbox: BoundingBox = "-180,-85,180,85".parse().unwrap();
        let build = build_coverage(&CoverSource::BBox(bbox), Some(1)).unwrap();
        assert_eq!(build.coverage.len(), 4);
    }

    #[test]
    fn test_build_requires_zoom() {
        let bbox: BoundingBox = "0,0,1,1".parse().unwrap();
        assert!(matches!(
            build_coverage(&CoverSource::BBox(bbox), None),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_build_rejects_zoom_past_max() {
        let bbox: BoundingBox = "2.35,48.85,2.3501,48.8501".parse().unwrap();
        assert!(matches!(
            build_coverage(&CoverSource::BBox(bbox), Some(40)),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_build_from_raster_matching_one_tile() {
        let tile = TileCoord::new(8300, 5633, 14);
        let m = tile.mercator_bounds();
        let raster = RasterFootprint::new(
            "exact.tif",
            Some(EPSG_WEB_MERCATOR),
            [m.x_min, m.y_min, m.x_max, m.y_max],
        );

        let build = build_coverage(&CoverSource::Rasters(vec![raster]), Some(14)).unwrap();
        assert_eq!(build.coverage.as_slice(), &[tile]);
    }

    #[test]
    fn test_build_skips_unprojectable_rasters() {
        let good = RasterFootprint::new("good.tif", Some(EPSG_WGS84), [2.30, 48.85, 2.31, 48.86]);
        let unknown = RasterFootprint::new("unknown.tif", Some(9999), [0.0, 0.0, 1.0, 1.0]);
        let bare = RasterFootprint::new("bare.tif", None, [0.0, 0.0, 1.0, 1.0]);

        let build =
            build_coverage(&CoverSource::Rasters(vec![unknown.clone(), good, bare.clone()]), Some(12))
                .unwrap();
        assert_eq!(build.coverage.len(), 1);

        match build_coverage(&CoverSource::Rasters(vec![unknown, bare]), Some(12)) {
            Err(Error::EmptyResult(_)) => {}
            other => panic!("Expected EmptyResult, got {:?}", other),
        }
    }

    #[test]
    fn test_build_reexpands_other_zooms() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cover.csv");
        fs::write(&path, "0,0,1\n0,0,1\n1,1,2\n").unwrap();

        let build = build_coverage(&CoverSource::Cover(path.clone()), Some(2)).unwrap();
        let mut tiles: Vec<_> = build.coverage.iter().copied().collect();
        tiles.sort();
        assert_eq!(
            tiles,
            vec![
                TileCoord::new(0, 0, 2),
                TileCoord::new(0, 1, 2),
                TileCoord::new(1, 0, 2),
                TileCoord::new(1, 1, 2),
            ]
        );

        // Without zoom the cover is taken as is
        let build = build_coverage(&CoverSource::Cover(path), None).unwrap();
        assert_eq!(build.coverage.len(), 2);
    }

    #[test]
    fn test_build_from_feature_index() {
        let square: Polygon<f64> = polygon![
            (x: 2.3500, y: 48.8500),
            (x: 2.3501, y: 48.8500),
            (x: 2.3501, y: 48.8501),
            (x: 2.3500, y: 48.8501),
            (x: 2.3500, y: 48.8500),
        ];
        let index = index_geometries(
            vec![Geometry::Polygon(square)],
            EPSG_WGS84,
            &IndexConfig::new(14),
        )
        .unwrap();

        let build = build_coverage(&CoverSource::Features(index), Some(14)).unwrap();
        assert_eq!(build.coverage.len(), 1);
    }

    #[test]
    fn test_build_extent() {
        let tile = TileCoord::new(0, 0, 1);
        let coverage: Coverage = vec![tile].into_iter().collect();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cover.csv");
        write_cover(&path, &coverage).unwrap();

        let build = build_coverage(&CoverSource::Cover(path), None).unwrap();
        assert_eq!(
            build.extent_string(),
            "-180.00000000,0.00000000,0.00000000,85.05112878"
        );
    }

    #[test]
    fn test_cover_inputs_exactly_one() {
        assert!(matches!(CoverInputs::default().resolve(), Err(Error::Config(_))));

        let both = CoverInputs {
            bbox: Some("0,0,1,1".to_string()),
            dir: Some(PathBuf::from("tiles")),
            ..Default::default()
        };
        assert!(matches!(both.resolve(), Err(Error::Config(_))));

        let one = CoverInputs {
            bbox: Some("0,0,1,1".to_string()),
            ..Default::default()
        };
        assert!(matches!(one.resolve(), Ok(CoverSource::BBox(_))));
    }

    // ========================================================================
    // Cover files
    // ========================================================================

    #[test]
    fn test_cover_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("cover.csv");

        let coverage: Coverage = vec![TileCoord::new(3, 4, 5), TileCoord::new(6, 7, 5)]
            .into_iter()
            .collect();
        write_cover(&path, &coverage).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "3,4,5\n6,7,5\n");
        assert_eq!(read_cover(&path).unwrap().as_slice(), coverage.as_slice());
    }

    #[test]
    fn test_read_weighted_cover() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cover.csv");
        fs::write(&path, "1\t2\t3\n\n4,5,6,0.5,2\n7,8,9  12\n").unwrap();

        let rows = read_weighted_cover(&path).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], (TileCoord::new(1, 2, 3), vec![]));
        assert_eq!(rows[1], (TileCoord::new(4, 5, 6), vec![0.5, 2.0]));
        assert_eq!(rows[2], (TileCoord::new(7, 8, 9), vec![12.0]));
    }

    #[test]
    fn test_read_cover_invalid_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cover.csv");
        fs::write(&path, "1,2,3\n1,2\n").unwrap();

        match read_cover(&path) {
            Err(Error::InvalidCover { line: 2, .. }) => {}
            other => panic!("Expected InvalidCover on line 2, got {:?}", other),
        }

        fs::write(&path, "4,0,1\n").unwrap();
        assert!(matches!(read_cover(&path), Err(Error::InvalidCover { .. })));
    }

    #[test]
    fn test_read_cover_zoom_past_max() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cover.csv");
        fs::write(&path, "0,0,1\n0,0,70\n").unwrap();

        match read_cover(&path) {
            Err(Error::InvalidCover { line: 2, .. }) => {}
            other => panic!("Expected InvalidCover on line 2, got {:?}", other),
        }
    }

    // ========================================================================
    // GeoJSON footprints
    // ========================================================================

    #[test]
    fn test_geojson_per_tile() {
        let coverage: Coverage = vec![TileCoord::new(0, 0, 1), TileCoord::new(1, 0, 1)]
            .into_iter()
            .collect();

        let fc: FeatureCollection = coverage_to_geojson(&coverage, false).parse::<geojson::GeoJson>()
            .unwrap()
            .try_into()
            .unwrap();

        assert_eq!(fc.features.len(), 2);
        let props = fc.features[1].properties.as_ref().unwrap();
        assert_eq!(props["x"], 1);
        assert_eq!(props["z"], 1);
    }

    #[test]
    fn test_geojson_union_merges_block() {
        let coverage: Coverage = (0..2)
            .flat_map(|x| (0..2).map(move |y| TileCoord::new(10 + x, 20 + y, 6)))
            .collect();

        let fc: FeatureCollection = coverage_to_geojson(&coverage, true).parse::<geojson::GeoJson>()
            .unwrap()
            .try_into()
            .unwrap();

        assert_eq!(fc.features.len(), 1);
        assert!(fc.features[0].properties.is_none());

        // Two disjoint tiles stay apart
        let apart: Coverage = vec![TileCoord::new(0, 0, 6), TileCoord::new(5, 5, 6)]
            .into_iter()
            .collect();
        let fc: FeatureCollection = coverage_to_geojson(&apart, true).parse::<geojson::GeoJson>()
            .unwrap()
            .try_into()
            .unwrap();
        assert_eq!(fc.features.len(), 2);
    }
}
