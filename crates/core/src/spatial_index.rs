//! Tile to feature index.
//!
//! Maps vector features onto the tiles they intersect at one zoom level.
//! Each feature is decomposed into polygons, every polygon is reprojected to
//! WGS84 and "burned" into the grid: it is appended to the list of every tile
//! whose footprint shares interior area with it.
//!
//! # Burning
//!
//! Candidate tiles come from the polygon's bounding box, then each candidate
//! is kept only if the polygon truly intersects the tile footprint. A polygon
//! merely touching a tile edge does not belong to that tile.
//!
//! # Failures
//!
//! A polygon that can't be reprojected or ends up degenerate (a negative
//! buffer can swallow it whole) is skipped with a warning. Only unexpected
//! errors abort indexing. See [`GeometryFailure`].
//!
//! # Example
//!
//! ```
//! use geo::{polygon, Geometry};
//! use neo_tiles_core::spatial_index::{index_geometries, IndexConfig};
//!
//! let square = polygon![
//!     (x: 2.3500, y: 48.8500), (x: 2.3501, y: 48.8500),
//!     (x: 2.3501, y: 48.8501), (x: 2.3500, y: 48.8501)
//! ];
//! let index = index_geometries(vec![Geometry::Polygon(square)], 4326, &IndexConfig::new(14)).unwrap();
//! assert_eq!(index.len(), 1);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use geo::{BoundingRect, Buffer, Geometry, Polygon, Rect, Relate};
use geojson::{FeatureCollection, GeoJson};
use rayon::prelude::*;

use crate::crs::{srid_from_name, CoordTransformer, EPSG_WEB_MERCATOR, EPSG_WGS84};
use crate::tile::{check_zoom, tiles_for_bbox, TileBounds, TileCoord};
use crate::validate::{polygon_parts, validate_polygon, ValidationResult};
use crate::{Error, Result};

/// Configuration for feature indexing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexConfig {
    /// Zoom level of the tile grid
    pub zoom: u8,
    /// Optional buffer distance in meters, applied in Web Mercator
    pub buffer: Option<f64>,
}

impl IndexConfig {
    pub fn new(zoom: u8) -> Self {
        Self { zoom, buffer: None }
    }

    /// Buffer every feature by `meters` before burning it.
    pub fn with_buffer(mut self, meters: f64) -> Self {
        self.buffer = Some(meters);
        self
    }

    /// Check the zoom is on the grid and the buffer is a finite distance.
    pub fn validate(&self) -> Result<()> {
        check_zoom(self.zoom)?;
        if let Some(buffer) = self.buffer {
            if !buffer.is_finite() {
                return Err(Error::Config(format!("Invalid buffer distance {}", buffer)));
            }
        }
        Ok(())
    }
}

/// Why a single geometry contributed nothing to the index
#[derive(Debug, Clone, PartialEq)]
pub enum GeometryFailure {
    /// Empty, degenerate, or without a finite image in WGS84
    Empty(String),
    /// The feature CRS can't be projected
    UnsupportedCrs(u32),
    /// Coordinates outside the domain of the projection
    Reprojection(String),
    /// Anything else
    Unexpected(String),
}

impl GeometryFailure {
    /// Whether indexing may skip the geometry and carry on
    pub fn is_skippable(&self) -> bool {
        !matches!(self, GeometryFailure::Unexpected(_))
    }
}

impl fmt::Display for GeometryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeometryFailure::Empty(reason) => write!(f, "empty geometry: {}", reason),
            GeometryFailure::UnsupportedCrs(srid) => write!(f, "unsupported CRS EPSG:{}", srid),
            GeometryFailure::Reprojection(reason) => write!(f, "reprojection failed: {}", reason),
            GeometryFailure::Unexpected(reason) => write!(f, "unexpected failure: {}", reason),
        }
    }
}

impl From<Error> for GeometryFailure {
    fn from(err: Error) -> Self {
        match err {
            Error::UnsupportedCrs(srid) => GeometryFailure::UnsupportedCrs(srid),
            Error::Projection(reason) => GeometryFailure::Reprojection(reason),
            other => GeometryFailure::Unexpected(other.to_string()),
        }
    }
}

/// Tiles of one zoom level mapped to the WGS84 polygons intersecting them
#[derive(Debug, Clone, Default)]
pub struct FeatureIndex {
    zoom: u8,
    map: HashMap<TileCoord, Vec<Polygon<f64>>>,
}

impl FeatureIndex {
    pub fn new(zoom: u8) -> Self {
        Self {
            zoom,
            map: HashMap::new(),
        }
    }

    pub fn zoom(&self) -> u8 {
        self.zoom
    }

    /// Number of indexed tiles
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Polygons burned into `tile`, in insertion order
    pub fn get(&self, tile: &TileCoord) -> &[Polygon<f64>] {
        self.map.get(tile).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Indexed tiles, sorted
    pub fn tiles(&self) -> Vec<TileCoord> {
        let mut tiles: Vec<TileCoord> = self.map.keys().copied().collect();
        tiles.sort_unstable();
        tiles
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TileCoord, &Vec<Polygon<f64>>)> {
        self.map.iter()
    }

    fn push(&mut self, tile: TileCoord, polygon: Polygon<f64>) {
        self.map.entry(tile).or_default().push(polygon);
    }

    /// Append every list of `other` to this index.
    ///
    /// # Errors
    /// `Error::MixedZoom` if the two indexes were built at different zooms.
    pub fn merge(&mut self, other: FeatureIndex) -> Result<()> {
        if other.zoom != self.zoom && !other.is_empty() {
            return Err(Error::MixedZoom {
                expected: self.zoom,
                found: other.zoom,
            });
        }

        for (tile, polygons) in other.map {
            self.map.entry(tile).or_default().extend(polygons);
        }
        Ok(())
    }
}

/// Resolve the EPSG code declared by a collection's `crs` member.
///
/// Defaults to 4326 when absent or unreadable.
pub fn geojson_srid(collection: &FeatureCollection) -> u32 {
    collection
        .foreign_members
        .as_ref()
        .and_then(|members| members.get("crs"))
        .and_then(|crs| crs.get("properties"))
        .and_then(|properties| properties.get("name"))
        .and_then(|name| name.as_str())
        .and_then(srid_from_name)
        .unwrap_or(EPSG_WGS84)
}

fn tile_polygon(bounds: &TileBounds) -> Polygon<f64> {
    Rect::new(
        (bounds.lng_min, bounds.lat_min),
        (bounds.lng_max, bounds.lat_max),
    )
    .to_polygon()
}

/// Tiles at `zoom` sharing interior area with a WGS84 polygon.
pub fn burn_polygon(polygon: &Polygon<f64>, zoom: u8) -> Vec<TileCoord> {
    let Some(rect) = polygon.bounding_rect() else {
        return Vec::new();
    };

    let bbox = TileBounds::new(rect.min().x, rect.min().y, rect.max().x, rect.max().y);
    let candidates: Vec<TileCoord> = tiles_for_bbox(&bbox, zoom).collect();

    if candidates.len() == 1 {
        return candidates;
    }

    candidates
        .into_iter()
        .filter(|tile| {
            let matrix = polygon.relate(&tile_polygon(&tile.bounds()));
            matrix.is_intersects() && !matrix.is_touches()
        })
        .collect()
}

/// Per-collection burning state
struct Burner<'a> {
    config: &'a IndexConfig,
    srid: u32,
    to_mercator: Option<CoordTransformer>,
    to_lng_lat: CoordTransformer,
    from_mercator: CoordTransformer,
    index: FeatureIndex,
    burned: usize,
    skipped: usize,
}

impl<'a> Burner<'a> {
    fn new(srid: u32, config: &'a IndexConfig) -> Result<Self> {
        let to_mercator = match config.buffer {
            Some(_) => Some(CoordTransformer::new(srid, EPSG_WEB_MERCATOR)?),
            None => None,
        };

        Ok(Self {
            config,
            srid,
            to_mercator,
            to_lng_lat: CoordTransformer::to_lng_lat(srid)?,
            from_mercator: CoordTransformer::to_lng_lat(EPSG_WEB_MERCATOR)?,
            index: FeatureIndex::new(config.zoom),
            burned: 0,
            skipped: 0,
        })
    }

    /// Buffer in Web Mercator if requested, returning the working geometry
    /// and whether it is now in Web Mercator.
    fn buffered(&self, geometry: &Geometry<f64>) -> std::result::Result<(Geometry<f64>, bool), GeometryFailure> {
        match (self.config.buffer, &self.to_mercator) {
            (Some(distance), Some(to_mercator)) => {
                let planar = to_mercator.transform_geometry(geometry)?;
                let buffered = planar.buffer(distance);
                if buffered.0.is_empty() {
                    return Err(GeometryFailure::Empty(format!(
                        "nothing left after a {} m buffer",
                        distance
                    )));
                }
                Ok((Geometry::MultiPolygon(buffered), true))
            }
            _ => Ok((geometry.clone(), false)),
        }
    }

    fn burn(&mut self, polygon: &Polygon<f64>, mercator: bool) -> std::result::Result<(), GeometryFailure> {
        let transformer = if mercator {
            &self.from_mercator
        } else {
            &self.to_lng_lat
        };

        let projected = match transformer.transform_geometry(&Geometry::Polygon(polygon.clone()))? {
            Geometry::Polygon(projected) => projected,
            other => {
                return Err(GeometryFailure::Unexpected(format!(
                    "polygon projected into {:?}",
                    other
                )))
            }
        };

        if let ValidationResult::Invalid(reason) = validate_polygon(&projected) {
            return Err(GeometryFailure::Empty(reason.to_string()));
        }

        for tile in burn_polygon(&projected, self.config.zoom) {
            self.index.push(tile, projected.clone());
        }
        self.burned += 1;

        Ok(())
    }

    fn skip_or_fail(&mut self, failure: GeometryFailure) -> Result<()> {
        if failure.is_skippable() {
            log::warn!("skipping polygon in EPSG:{}: {}", self.srid, failure);
            self.skipped += 1;
            Ok(())
        } else {
            Err(Error::Projection(failure.to_string()))
        }
    }

    fn add(&mut self, geometry: &Geometry<f64>) -> Result<()> {
        let (working, mercator) = match self.buffered(geometry) {
            Ok(result) => result,
            Err(failure) => return self.skip_or_fail(failure),
        };

        for polygon in polygon_parts(&working) {
            if let Err(failure) = self.burn(&polygon, mercator) {
                self.skip_or_fail(failure)?;
            }
        }

        Ok(())
    }
}

/// Index geometries sharing one CRS.
///
/// A CRS that can't be projected skips every geometry with one warning.
///
/// # Errors
/// `Error::Projection` on an unexpected (non skippable) geometry failure.
pub fn index_geometries(
    geometries: impl IntoIterator<Item = Geometry<f64>>,
    srid: u32,
    config: &IndexConfig,
) -> Result<FeatureIndex> {
    config.validate()?;
    let mut burner = match Burner::new(srid, config) {
        Ok(burner) => burner,
        Err(Error::UnsupportedCrs(code)) => {
            log::warn!("unsupported CRS EPSG:{}, skipping its features", code);
            return Ok(FeatureIndex::new(config.zoom));
        }
        Err(e) => return Err(e),
    };

    for geometry in geometries {
        burner.add(&geometry)?;
    }

    log::debug!(
        "burned {} polygons into {} tiles at zoom {} ({} skipped)",
        burner.burned,
        burner.index.len(),
        config.zoom,
        burner.skipped
    );

    Ok(burner.index)
}

/// Index every feature of a collection, in the collection's declared CRS.
pub fn index_features(collection: &FeatureCollection, config: &IndexConfig) -> Result<FeatureIndex> {
    let srid = geojson_srid(collection);

    let mut geometries = Vec::with_capacity(collection.features.len());
    for (i, feature) in collection.features.iter().enumerate() {
        let Some(geometry) = &feature.geometry else {
            continue;
        };
        match Geometry::<f64>::try_from(geometry.value.clone()) {
            Ok(geometry) => geometries.push(geometry),
            Err(e) => log::warn!("skipping feature {}: {}", i, e),
        }
    }

    index_geometries(geometries, srid, config)
}

/// Parse a GeoJSON FeatureCollection file.
pub fn read_feature_collection(path: &Path) -> Result<FeatureCollection> {
    let text = fs::read_to_string(path)?;
    let geojson: GeoJson = text
        .parse()
        .map_err(|e| Error::GeoJson(format!("{}: {}", path.display(), e)))?;

    FeatureCollection::try_from(geojson)
        .map_err(|e| Error::GeoJson(format!("{}: {}", path.display(), e)))
}

/// Index one GeoJSON file.
pub fn index_geojson_file(path: &Path, config: &IndexConfig) -> Result<FeatureIndex> {
    let collection = read_feature_collection(path)?;
    log::info!(
        "indexing {} features from {}",
        collection.features.len(),
        path.display()
    );
    index_features(&collection, config)
}

/// Index several GeoJSON files in parallel, one local index per file,
/// merged in file order.
///
/// # Arguments
///
/// * `paths` - GeoJSON FeatureCollection files
/// * `config` - Zoom and buffer
/// * `workers` - Thread count, 0 for one per core
pub fn index_geojson_files(
    paths: &[PathBuf],
    config: &IndexConfig,
    workers: usize,
) -> Result<FeatureIndex> {
    config.validate()?;
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|e| Error::Config(format!("Failed to build thread pool: {}", e)))?;

    let partials: Vec<Result<FeatureIndex>> = pool.install(|| {
        paths
            .par_iter()
            .map(|path| index_geojson_file(path, config))
            .collect()
    });

    let mut index = FeatureIndex::new(config.zoom);
    for partial in partials {
        index.merge(partial?)?;
    }

    Ok(index)
}
